use serde_json::Value;

use flowbot_core::types::{Edge, FlowDefinition, FlowNode, NodeKind};

/// Fluent construction of flow definitions for tests.
///
/// ```ignore
/// let flow = FlowBuilder::new("greet")
///     .start("s")
///     .message("hi", "Hi")
///     .node("r", NodeKind::UserReply)
///     .end("e")
///     .chain(&["s", "hi", "r", "e"])
///     .build();
/// ```
pub struct FlowBuilder {
    definition: FlowDefinition,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            definition: FlowDefinition {
                id: id.to_string(),
                name: id.to_string(),
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    pub fn node(mut self, id: &str, kind: NodeKind) -> Self {
        self.definition.nodes.push(FlowNode::new(id, kind));
        self
    }

    /// Add a node carrying one data field.
    pub fn node_with(mut self, id: &str, kind: NodeKind, key: &str, value: Value) -> Self {
        self.definition
            .nodes
            .push(FlowNode::new(id, kind).with(key, value));
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeKind::Start)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeKind::End)
    }

    pub fn message(self, id: &str, text: &str) -> Self {
        self.node_with(id, NodeKind::Message, "text", Value::String(text.to_string()))
    }

    pub fn delay(self, id: &str, seconds: u64) -> Self {
        self.node_with(id, NodeKind::Delay, "delay", Value::from(seconds))
    }

    pub fn condition(self, id: &str, conditions: Value) -> Self {
        self.node_with(id, NodeKind::Condition, "conditions", conditions)
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.definition.edges.push(Edge::new(from, to));
        self
    }

    pub fn handle_edge(mut self, from: &str, to: &str, handle: &str) -> Self {
        self.definition.edges.push(Edge::with_handle(from, to, handle));
        self
    }

    /// Connect consecutive ids with plain edges.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.definition.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn build(self) -> FlowDefinition {
        self.definition
    }
}
