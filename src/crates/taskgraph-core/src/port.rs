//! Typed input/output ports, schema compatibility, and stream accumulators.
//!
//! A [`DataPort`] is a named slot on a task. Non-streaming ports carry one
//! value; streaming ports carry an ordered sequence of chunks plus a
//! terminal close, folded by an [`Accumulator`] into the value non-streaming
//! consumers (and the task's own final output) observe.

use std::sync::Arc;

use serde_json::Value;

/// Condition under which a downstream task becomes ready over a given edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessMode {
    /// Downstream may start as soon as the first chunk is published.
    FirstChunk,
    /// Downstream waits for the stream to close.
    Final,
}

/// Declared shape of a port's value. `Any` is the unconstrained case
/// (`static`-compatible with everything); `Typed` names a schema identifier
/// the caller is responsible for giving consistent meaning to (this crate
/// does not ship a schema language, only the three-way compatibility
/// outcome described in the design this implements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSchema {
    Any,
    Typed(String),
    /// A typed schema that also declares itself array-valued — the
    /// cardinality signal the compiler uses to mark fan-out (§4.1).
    TypedArray(String),
}

/// Outcome of comparing an output schema `S` to an input schema `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCompat {
    /// Identical or unconstrained.
    Static,
    /// `T` is a refinement of `S`; validated at data-transfer time.
    Runtime,
    Incompatible,
}

/// Compare an output schema to an input schema. Array-vs-scalar mismatches
/// are reported as `Static`/`Runtime` compatible here — cardinality is a
/// separate, orthogonal concern the compiler checks with
/// [`is_fan_out_mismatch`], not a type error.
pub fn compat(output: &PortSchema, input: &PortSchema) -> SchemaCompat {
    match (output, input) {
        (PortSchema::Any, _) | (_, PortSchema::Any) => SchemaCompat::Static,
        (PortSchema::Typed(a), PortSchema::Typed(b))
        | (PortSchema::TypedArray(a), PortSchema::TypedArray(b)) if a == b => SchemaCompat::Static,
        (PortSchema::TypedArray(a), PortSchema::Typed(b)) if a == b => SchemaCompat::Runtime,
        (PortSchema::Typed(a), PortSchema::TypedArray(b)) if a == b => SchemaCompat::Runtime,
        _ => SchemaCompat::Incompatible,
    }
}

/// Does this edge pair an array-producing output with a scalar-expecting
/// input? If so the compiler marks the successor as a fan-out node (§4.1).
pub fn is_fan_out_mismatch(output: &PortSchema, input: &PortSchema) -> bool {
    matches!(
        (output, input),
        (PortSchema::TypedArray(_), PortSchema::Typed(_))
    )
}

/// Named input or output slot on a task.
#[derive(Clone)]
pub struct DataPort {
    pub name: String,
    pub schema: PortSchema,
    pub streaming: bool,
    /// Only meaningful for streaming *output* ports.
    pub readiness: Option<ReadinessMode>,
}

impl DataPort {
    pub fn scalar(name: impl Into<String>, schema: PortSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            streaming: false,
            readiness: None,
        }
    }

    pub fn streaming_output(
        name: impl Into<String>,
        schema: PortSchema,
        readiness: ReadinessMode,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            streaming: true,
            readiness: Some(readiness),
        }
    }
}

/// A monoid folding streamed chunks into the final value seen by
/// non-streaming consumers: `identity()` is the empty accumulation,
/// `merge(acc, chunk)` folds one more chunk in. Explicit rather than an
/// implicit string-concatenation default, so non-string streams (arrays,
/// numeric sums) work the same way.
#[derive(Clone)]
pub struct Accumulator {
    identity: Value,
    merge: Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>,
}

impl Accumulator {
    pub fn new(
        identity: Value,
        merge: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity,
            merge: Arc::new(merge),
        }
    }

    pub fn identity(&self) -> Value {
        self.identity.clone()
    }

    pub fn fold(&self, acc: &Value, chunk: &Value) -> Value {
        (self.merge)(acc, chunk)
    }

    /// Folds a chunk sequence from scratch; used when replaying an
    /// already-closed stream's chunks to compute the final accumulated value.
    pub fn fold_all<'a>(&self, chunks: impl IntoIterator<Item = &'a Value>) -> Value {
        let mut acc = self.identity();
        for chunk in chunks {
            acc = self.fold(&acc, chunk);
        }
        acc
    }

    /// Concatenates string chunks: `"" + "A" + "B" + "C" = "ABC"`.
    pub fn string_concat() -> Self {
        Self::new(Value::String(String::new()), |acc, chunk| {
            let mut s = acc.as_str().unwrap_or_default().to_string();
            if let Some(piece) = chunk.as_str() {
                s.push_str(piece);
            }
            Value::String(s)
        })
    }

    /// Appends each chunk to a growing JSON array.
    pub fn array_append() -> Self {
        Self::new(Value::Array(Vec::new()), |acc, chunk| {
            let mut arr = acc.as_array().cloned().unwrap_or_default();
            arr.push(chunk.clone());
            Value::Array(arr)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_compat_for_identical_types() {
        let s = PortSchema::Typed("number".into());
        assert_eq!(compat(&s, &s), SchemaCompat::Static);
    }

    #[test]
    fn any_is_always_static_compatible() {
        assert_eq!(
            compat(&PortSchema::Any, &PortSchema::Typed("x".into())),
            SchemaCompat::Static
        );
    }

    #[test]
    fn mismatched_types_are_incompatible() {
        assert_eq!(
            compat(&PortSchema::Typed("number".into()), &PortSchema::Typed("string".into())),
            SchemaCompat::Incompatible
        );
    }

    #[test]
    fn array_to_scalar_is_fan_out() {
        let out = PortSchema::TypedArray("number".into());
        let inp = PortSchema::Typed("number".into());
        assert!(is_fan_out_mismatch(&out, &inp));
        assert_eq!(compat(&out, &inp), SchemaCompat::Runtime);
    }

    #[test]
    fn string_concat_accumulator_matches_streaming_scenario() {
        let acc = Accumulator::string_concat();
        let chunks = vec![json!("A"), json!("B"), json!("C")];
        assert_eq!(acc.fold_all(chunks.iter()), json!("ABC"));
    }

    #[test]
    fn array_append_accumulator() {
        let acc = Accumulator::array_append();
        let chunks = vec![json!(1), json!(2), json!(3)];
        assert_eq!(acc.fold_all(chunks.iter()), json!([1, 2, 3]));
    }
}
