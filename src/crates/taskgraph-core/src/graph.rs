//! Nodes, typed edges, cycle detection, topological layering and
//! subgraph extraction — the graph model and compiler (§4.1).

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::port::{compat, is_fan_out_mismatch, DataPort, SchemaCompat};

/// A node's static declaration: its task type, the provider it runs under,
/// its declared ports, and any literal configuration carried with it.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub task_type: String,
    pub provider: String,
    pub input_ports: Vec<DataPort>,
    pub output_ports: Vec<DataPort>,
    pub config: Value,
}

impl NodeSpec {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            provider: provider.into(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn with_input(mut self, port: DataPort) -> Self {
        self.input_ports.push(port);
        self
    }

    pub fn with_output(mut self, port: DataPort) -> Self {
        self.output_ports.push(port);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&DataPort> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&DataPort> {
        self.output_ports.iter().find(|p| p.name == name)
    }
}

/// A dataflow: `(sourceTaskId, sourcePort, targetTaskId, targetPort)`.
#[derive(Clone)]
pub struct Edge {
    pub src: String,
    pub src_port: String,
    pub dst: String,
    pub dst_port: String,
    pub meta: Option<Value>,
}

/// The result of [`Graph::compile`]: a topological node order, dependency
/// layers for scheduling, and the set of nodes the compiler marked
/// fan-out because an inbound edge paired an array output with a scalar
/// input.
pub struct ExecutionPlan {
    pub order: Vec<String>,
    pub layers: Vec<Vec<String>>,
    pub fan_out_nodes: HashSet<String>,
    /// For each fan-out node, the input port name fed by the mismatched
    /// array-producing edge — the port whose value is split one element
    /// per clone.
    pub fan_out_ports: HashMap<String, String>,
}

/// A set of tasks connected by dataflows. `insert`/`upsert`/`remove` are
/// the only mutators of the node set; `add_edge`/`remove_edge` mutate
/// edges. Node insertion order is preserved for Kahn's-algorithm
/// tie-breaking.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<String, NodeSpec>,
    order: Vec<String>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: NodeSpec) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn upsert(&mut self, node: NodeSpec) {
        if !self.nodes.contains_key(&node.id) {
            self.order.push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeSpec> {
        let removed = self.nodes.remove(id);
        if removed.is_some() {
            self.order.retain(|n| n != id);
            self.edges.retain(|e| e.src != id && e.dst != id);
        }
        removed
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    pub fn add_edge(
        &mut self,
        src: impl Into<String>,
        src_port: impl Into<String>,
        dst: impl Into<String>,
        dst_port: impl Into<String>,
        meta: Option<Value>,
    ) -> Result<()> {
        let src = src.into();
        let src_port = src_port.into();
        let dst = dst.into();
        let dst_port = dst_port.into();

        let src_node = self
            .nodes
            .get(&src)
            .ok_or_else(|| GraphError::MissingNode(src.clone()))?;
        let dst_node = self
            .nodes
            .get(&dst)
            .ok_or_else(|| GraphError::MissingNode(dst.clone()))?;

        let src_schema = &src_node
            .output_port(&src_port)
            .ok_or_else(|| GraphError::UnknownPort {
                node: src.clone(),
                port: src_port.clone(),
            })?
            .schema;
        let dst_schema = &dst_node
            .input_port(&dst_port)
            .ok_or_else(|| GraphError::UnknownPort {
                node: dst.clone(),
                port: dst_port.clone(),
            })?
            .schema;

        if compat(src_schema, dst_schema) == SchemaCompat::Incompatible {
            return Err(GraphError::IncompatibleTypes {
                src,
                src_port,
                dst,
                dst_port,
            });
        }

        if self.would_close_cycle(&src, &dst) {
            return Err(GraphError::CycleError { src, dst });
        }

        self.edges.push(Edge {
            src,
            src_port,
            dst,
            dst_port,
            meta,
        });
        Ok(())
    }

    pub fn remove_edge(&mut self, src: &str, src_port: &str, dst: &str, dst_port: &str) -> bool {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(e.src == src && e.src_port == src_port && e.dst == dst && e.dst_port == dst_port));
        self.edges.len() != before
    }

    pub fn out_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.src == id).collect()
    }

    pub fn in_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.dst == id).collect()
    }

    /// Would adding an edge `src -> dst` close a cycle, i.e. can `dst`
    /// already reach `src` via outgoing edges?
    fn would_close_cycle(&self, src: &str, dst: &str) -> bool {
        if src == dst {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([dst.to_string()]);
        while let Some(node) = queue.pop_front() {
            if node == src {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            for edge in self.out_edges(&node) {
                queue.push_back(edge.dst.clone());
            }
        }
        false
    }

    /// Kahn's algorithm, tie-breaking by insertion order. Returns
    /// `CycleError` naming one offending edge if the graph isn't a DAG
    /// (this shouldn't happen given `add_edge`'s own cycle check, but a
    /// caller may have built edges some other way).
    pub fn topologically_sorted_nodes(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.order.iter().map(|id| (id.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(deg) = in_degree.get_mut(edge.dst.as_str()) {
                *deg += 1;
            }
        }

        let mut ready: VecDeque<String> = self
            .order
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .cloned()
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = ready.pop_front() {
            sorted.push(id.clone());
            let mut newly_ready = Vec::new();
            for edge in self.out_edges(&id) {
                let deg = in_degree.get_mut(edge.dst.as_str()).expect("edge target tracked");
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(edge.dst.clone());
                }
            }
            // Preserve insertion order among nodes that become ready together.
            newly_ready.sort_by_key(|id| self.order.iter().position(|o| o == id).unwrap_or(usize::MAX));
            for id in newly_ready {
                ready.push_back(id);
            }
        }

        if sorted.len() != self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| !sorted.contains(id))
                .cloned()
                .unwrap_or_default();
            let edge = self
                .edges
                .iter()
                .find(|e| e.dst == stuck)
                .map(|e| (e.src.clone(), e.dst.clone()))
                .unwrap_or((stuck.clone(), stuck.clone()));
            return Err(GraphError::CycleError {
                src: edge.0,
                dst: edge.1,
            });
        }

        Ok(sorted)
    }

    /// BFS from `id` over outgoing edges only; returns a new graph
    /// containing the reachable nodes and the edges between them.
    pub fn get_subgraph_starting_from(&self, id: &str) -> Result<Graph> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::MissingNode(id.to_string()));
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for edge in self.out_edges(&node) {
                queue.push_back(edge.dst.clone());
            }
        }

        let mut sub = Graph::new();
        for node_id in &self.order {
            if seen.contains(node_id) {
                sub.upsert(self.nodes[node_id].clone());
            }
        }
        for edge in &self.edges {
            if seen.contains(&edge.src) && seen.contains(&edge.dst) {
                sub.edges.push(edge.clone());
            }
        }
        Ok(sub)
    }

    /// Topologically sorts, marks fan-out nodes (an inbound edge whose
    /// source is array-typed and whose destination port is scalar), and
    /// groups nodes into dependency layers for the runner.
    pub fn compile(&self) -> Result<ExecutionPlan> {
        let order = self.topologically_sorted_nodes()?;

        let mut fan_out_nodes = HashSet::new();
        let mut fan_out_ports = HashMap::new();
        for edge in &self.edges {
            let src_schema = &self.nodes[&edge.src]
                .output_port(&edge.src_port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: edge.src.clone(),
                    port: edge.src_port.clone(),
                })?
                .schema;
            let dst_schema = &self.nodes[&edge.dst]
                .input_port(&edge.dst_port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: edge.dst.clone(),
                    port: edge.dst_port.clone(),
                })?
                .schema;
            if is_fan_out_mismatch(src_schema, dst_schema) {
                fan_out_nodes.insert(edge.dst.clone());
                fan_out_ports.insert(edge.dst.clone(), edge.dst_port.clone());
            }
        }

        let mut depth: HashMap<String, usize> = HashMap::new();
        for id in &order {
            let d = self
                .in_edges(id)
                .iter()
                .map(|e| depth.get(&e.src).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.clone(), d);
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); max_depth + 1];
        for id in &order {
            layers[depth[id]].push(id.clone());
        }

        Ok(ExecutionPlan {
            order,
            layers,
            fan_out_nodes,
            fan_out_ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortSchema;

    fn numeric_node(id: &str) -> NodeSpec {
        NodeSpec::new(id, "Passthrough", "local")
            .with_input(DataPort::scalar("in", PortSchema::Typed("number".into())))
            .with_output(DataPort::scalar("out", PortSchema::Typed("number".into())))
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        let err = g.insert(numeric_node("A")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(id) if id == "A"));
    }

    #[test]
    fn add_edge_rejects_missing_node() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        let err = g.add_edge("A", "out", "B", "in", None).unwrap_err();
        assert!(matches!(err, GraphError::MissingNode(id) if id == "B"));
    }

    #[test]
    fn add_edge_rejects_incompatible_types() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        g.insert(
            NodeSpec::new("B", "Passthrough", "local")
                .with_input(DataPort::scalar("in", PortSchema::Typed("string".into()))),
        )
        .unwrap();
        let err = g.add_edge("A", "out", "B", "in", None).unwrap_err();
        assert!(matches!(err, GraphError::IncompatibleTypes { .. }));
    }

    #[test]
    fn add_edge_rejects_cycle() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        g.insert(numeric_node("B")).unwrap();
        g.insert(numeric_node("C")).unwrap();
        g.add_edge("A", "out", "B", "in", None).unwrap();
        g.add_edge("B", "out", "C", "in", None).unwrap();
        let err = g.add_edge("C", "out", "A", "in", None).unwrap_err();
        assert!(matches!(err, GraphError::CycleError { .. }));
        // Graph unchanged: still exactly two edges.
        assert_eq!(g.edges.len(), 2);
    }

    #[test]
    fn topological_sort_orders_linear_pipeline() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        g.insert(numeric_node("B")).unwrap();
        g.insert(numeric_node("C")).unwrap();
        g.add_edge("A", "out", "B", "in", None).unwrap();
        g.add_edge("B", "out", "C", "in", None).unwrap();
        assert_eq!(g.topologically_sorted_nodes().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn compile_marks_fan_out_on_array_to_scalar_edge() {
        let mut g = Graph::new();
        g.insert(
            NodeSpec::new("A", "Emit", "local")
                .with_output(DataPort::scalar("items", PortSchema::TypedArray("number".into()))),
        )
        .unwrap();
        g.insert(
            NodeSpec::new("B", "Consume", "local")
                .with_input(DataPort::scalar("item", PortSchema::Typed("number".into()))),
        )
        .unwrap();
        g.add_edge("A", "items", "B", "item", None).unwrap();

        let plan = g.compile().unwrap();
        assert!(plan.fan_out_nodes.contains("B"));
        assert_eq!(plan.layers.len(), 2);
        assert_eq!(plan.layers[0], vec!["A"]);
        assert_eq!(plan.layers[1], vec!["B"]);
    }

    #[test]
    fn subgraph_from_root_follows_outgoing_edges_only() {
        let mut g = Graph::new();
        g.insert(numeric_node("A")).unwrap();
        g.insert(numeric_node("B")).unwrap();
        g.insert(numeric_node("C")).unwrap();
        g.add_edge("A", "out", "B", "in", None).unwrap();
        g.add_edge("B", "out", "C", "in", None).unwrap();

        let sub = g.get_subgraph_starting_from("B").unwrap();
        let ids: Vec<_> = sub.nodes().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["B", "C"]);
    }
}
