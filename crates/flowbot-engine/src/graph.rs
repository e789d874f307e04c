use std::collections::{HashMap, HashSet};

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::types::{Edge, FlowDefinition, FlowNode, NodeKind};

/// A validated, indexed flow definition.
///
/// Outgoing edges keep authoring order; condition resolution depends on it.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    id: String,
    name: String,
    nodes: HashMap<String, FlowNode>,
    outgoing: HashMap<String, Vec<Edge>>,
    start_id: String,
}

impl FlowGraph {
    /// Validate and index a definition.
    ///
    /// Rejects flows without exactly one `start` node, with duplicate node
    /// ids, or with edges pointing at nodes that do not exist.
    pub fn new(definition: FlowDefinition) -> Result<Self> {
        let FlowDefinition {
            id,
            name,
            nodes: node_list,
            edges,
        } = definition;

        let mut nodes = HashMap::with_capacity(node_list.len());
        let mut starts = Vec::new();
        for node in node_list {
            if node.kind == NodeKind::Start {
                starts.push(node.id.clone());
            }
            if nodes.contains_key(&node.id) {
                return Err(FlowbotError::invalid_flow(
                    &id,
                    format!("duplicate node id '{}'", node.id),
                ));
            }
            nodes.insert(node.id.clone(), node);
        }

        let start_id = match starts.as_slice() {
            [only] => only.clone(),
            [] => return Err(FlowbotError::invalid_flow(&id, "no start node")),
            many => {
                return Err(FlowbotError::invalid_flow(
                    &id,
                    format!("{} start nodes: {}", many.len(), many.join(", ")),
                ))
            }
        };

        let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in edges {
            for end in [&edge.source, &edge.target] {
                if !nodes.contains_key(end) {
                    return Err(FlowbotError::invalid_flow(
                        &id,
                        format!(
                            "edge {} -> {} references unknown node '{}'",
                            edge.source, edge.target, end
                        ),
                    ));
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(edge);
        }

        Ok(Self {
            id,
            name,
            nodes,
            outgoing,
            start_id,
        })
    }

    /// Parse and validate a flow from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &FlowNode {
        // Presence is checked in `new`.
        &self.nodes[&self.start_id]
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.get(node_id)
    }

    /// Like [`node`](Self::node), but a missing node is an error.
    pub fn require(&self, node_id: &str) -> Result<&FlowNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| FlowbotError::NodeNotFound {
                flow_id: self.id.clone(),
                node_id: node_id.to_string(),
            })
    }

    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.outgoing
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Target of the first outgoing edge.
    pub fn next_target(&self, node_id: &str) -> Option<&str> {
        self.outgoing(node_id).first().map(|e| e.target.as_str())
    }

    pub fn next_node(&self, node_id: &str) -> Option<&FlowNode> {
        self.next_target(node_id).and_then(|id| self.nodes.get(id))
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.outgoing(from).iter().any(|e| e.target == to)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node kinds present in the flow that the interpreter treats as passthrough.
    pub fn unknown_kinds(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut kinds: Vec<String> = self
            .nodes
            .values()
            .filter_map(|n| match &n.kind {
                NodeKind::Unknown(raw) if seen.insert(raw.clone()) => Some(raw.clone()),
                _ => None,
            })
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(nodes: Vec<FlowNode>, edges: Vec<Edge>) -> FlowDefinition {
        FlowDefinition {
            id: "f1".into(),
            name: "test".into(),
            nodes,
            edges,
        }
    }

    #[test]
    fn test_indexes_edges_in_authoring_order() {
        let graph = FlowGraph::new(def(
            vec![
                FlowNode::new("s", NodeKind::Start),
                FlowNode::new("c", NodeKind::Condition),
                FlowNode::new("a", NodeKind::End),
                FlowNode::new("b", NodeKind::End),
            ],
            vec![
                Edge::new("s", "c"),
                Edge::with_handle("c", "b", "condition-1"),
                Edge::with_handle("c", "a", "condition-0"),
            ],
        ))
        .unwrap();

        assert_eq!(graph.start().id, "s");
        assert_eq!(graph.next_target("s"), Some("c"));
        let targets: Vec<_> = graph.outgoing("c").iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec!["b", "a"]);
        assert!(graph.outgoing("a").is_empty());
        assert!(graph.has_edge("c", "a"));
        assert!(!graph.has_edge("a", "c"));
    }

    #[test]
    fn test_rejects_missing_or_duplicate_start() {
        let err = FlowGraph::new(def(vec![FlowNode::new("m", NodeKind::Message)], vec![]))
            .unwrap_err();
        assert!(err.to_string().contains("no start node"));

        let err = FlowGraph::new(def(
            vec![
                FlowNode::new("s1", NodeKind::Start),
                FlowNode::new("s2", NodeKind::Start),
            ],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("2 start nodes"));
    }

    #[test]
    fn test_rejects_dangling_edge_and_duplicate_ids() {
        let err = FlowGraph::new(def(
            vec![FlowNode::new("s", NodeKind::Start)],
            vec![Edge::new("s", "ghost")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = FlowGraph::new(def(
            vec![
                FlowNode::new("s", NodeKind::Start),
                FlowNode::new("s", NodeKind::End),
            ],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_require_reports_node_not_found() {
        let graph = FlowGraph::new(def(vec![FlowNode::new("s", NodeKind::Start)], vec![])).unwrap();
        assert!(matches!(
            graph.require("gone"),
            Err(FlowbotError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn test_unknown_kinds_are_reported() {
        let graph = FlowGraph::from_json(
            r#"{"id":"f","nodes":[{"id":"s","type":"start"},{"id":"x","type":"carousel"}],"edges":[]}"#,
        )
        .unwrap();
        assert_eq!(graph.unknown_kinds(), vec!["carousel"]);
        assert_eq!(graph.len(), 2);
    }
}
