//! Picks the outgoing edge a `condition` node takes for a given user input.
//!
//! Matching runs in priority tiers (label, contains, equals, not-equals,
//! prefix/suffix); the first condition that hits in the highest tier wins.
//! Flows from the builder do not label edges consistently, so the matched
//! condition's edge is then located by trying a list of small resolvers in
//! order.

use tracing::{debug, warn};

use flowbot_core::types::{ConditionKind, ConditionSpec, Edge, FlowNode};

type Matcher = fn(&ConditionSpec, &str) -> bool;

type EdgeResolver = for<'a> fn(&'a [Edge], usize, &ConditionSpec) -> Option<&'a Edge>;

const MATCHERS: &[(&str, Matcher)] = &[
    ("label", matches_label),
    ("contains", matches_contains),
    ("equals", matches_equals),
    ("not_equals", matches_not_equals),
    ("affix", matches_affix),
];

const EDGE_RESOLVERS: &[(&str, EdgeResolver)] = &[
    ("handle_index", edge_by_handle_index),
    ("position", edge_by_position),
    ("handle_alias", edge_by_handle_alias),
];

/// Read the node's `conditions` array.
///
/// Entries that do not parse become `Unsupported` placeholders so the
/// remaining conditions keep their ordinal index.
pub fn parse_conditions(node: &FlowNode) -> Vec<ConditionSpec> {
    let Some(raw) = node.data.get("conditions").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    raw.iter()
        .enumerate()
        .map(|(i, value)| match serde_json::from_value(value.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(node_id = %node.id, index = i, error = %e, "Ignoring malformed condition");
                ConditionSpec::new(ConditionKind::Unsupported, "", "")
            }
        })
        .collect()
}

/// Index of the condition `input` selects, if any.
///
/// `default` conditions never match here; they are the fallback.
pub fn match_condition(conditions: &[ConditionSpec], input: &str) -> Option<usize> {
    let input = input.trim().to_uppercase();
    for (tier, matcher) in MATCHERS {
        let hit = conditions.iter().position(|c| {
            !matches!(c.kind, ConditionKind::Default | ConditionKind::Unsupported)
                && matcher(c, &input)
        });
        if let Some(index) = hit {
            debug!(tier = *tier, index, "Condition matched");
            return Some(index);
        }
    }
    None
}

/// The edge a condition at `index` leads to, trying each resolver in turn.
pub fn resolve_edge<'a>(edges: &'a [Edge], index: usize, spec: &ConditionSpec) -> Option<&'a Edge> {
    EDGE_RESOLVERS.iter().find_map(|(name, resolver)| {
        let edge = resolver(edges, index, spec)?;
        debug!(strategy = *name, index, target = %edge.target, "Condition edge resolved");
        Some(edge)
    })
}

/// Resolve the target node for `input` at a condition node.
///
/// Returns `None` only when the node has no outgoing edges.
pub fn resolve_target<'a>(node: &FlowNode, edges: &'a [Edge], input: &str) -> Option<&'a str> {
    if edges.is_empty() {
        return None;
    }
    let conditions = parse_conditions(node);

    if let Some(index) = match_condition(&conditions, input) {
        match resolve_edge(edges, index, &conditions[index]) {
            Some(edge) => return Some(&edge.target),
            None => warn!(
                node_id = %node.id,
                index,
                "Matched condition has no resolvable edge, using fallback"
            ),
        }
    }

    let fallback = conditions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind == ConditionKind::Default)
        .find_map(|(i, c)| resolve_edge(edges, i, c));
    if let Some(edge) = fallback {
        return Some(&edge.target);
    }

    edges
        .last()
        .or_else(|| edges.first())
        .map(|e| e.target.as_str())
}

// ── Matchers (input is trimmed and uppercased) ──────────────────

fn matches_label(spec: &ConditionSpec, input: &str) -> bool {
    let label = spec.label.trim();
    !label.is_empty() && label.to_uppercase() == input
}

fn matches_contains(spec: &ConditionSpec, input: &str) -> bool {
    spec.kind == ConditionKind::Contains && spec.tokens().iter().any(|t| input.contains(t.as_str()))
}

fn matches_equals(spec: &ConditionSpec, input: &str) -> bool {
    spec.kind == ConditionKind::Equals && spec.tokens().iter().any(|t| t == input)
}

fn matches_not_equals(spec: &ConditionSpec, input: &str) -> bool {
    spec.kind == ConditionKind::NotEquals && spec.tokens().iter().all(|t| t != input)
}

fn matches_affix(spec: &ConditionSpec, input: &str) -> bool {
    match spec.kind {
        ConditionKind::StartsWith => spec.tokens().iter().any(|t| input.starts_with(t.as_str())),
        ConditionKind::EndsWith => spec.tokens().iter().any(|t| input.ends_with(t.as_str())),
        _ => false,
    }
}

// ── Edge resolvers ──────────────────────────────────────────────

fn edge_by_handle_index<'a>(edges: &'a [Edge], index: usize, _: &ConditionSpec) -> Option<&'a Edge> {
    let handle = format!("condition-{index}");
    edges
        .iter()
        .find(|e| e.source_handle.as_deref() == Some(handle.as_str()))
}

fn edge_by_position<'a>(edges: &'a [Edge], index: usize, _: &ConditionSpec) -> Option<&'a Edge> {
    edges.get(index)
}

fn edge_by_handle_alias<'a>(edges: &'a [Edge], _: usize, spec: &ConditionSpec) -> Option<&'a Edge> {
    let mut aliases: Vec<&str> = vec![spec.label.trim(), spec.value.trim()];
    if let Some(id) = &spec.id {
        aliases.push(id.trim());
    }
    if spec.kind == ConditionKind::Default {
        aliases.extend(["default", "else"]);
    }
    edges.iter().find(|e| {
        e.source_handle.as_deref().is_some_and(|handle| {
            let handle = handle.trim();
            aliases
                .iter()
                .any(|a| !a.is_empty() && a.eq_ignore_ascii_case(handle))
        })
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use flowbot_core::types::NodeKind;

    fn condition_node(conditions: serde_json::Value) -> FlowNode {
        FlowNode::new("c", NodeKind::Condition).with("conditions", conditions)
    }

    fn numbered_node() -> (FlowNode, Vec<Edge>) {
        let node = condition_node(json!([
            {"type": "equals", "value": "1", "label": "1"},
            {"type": "equals", "value": "2", "label": "2"},
            {"type": "default"}
        ]));
        let edges = vec![
            Edge::with_handle("c", "A", "condition-0"),
            Edge::with_handle("c", "B", "condition-1"),
            Edge::with_handle("c", "C", "default"),
        ];
        (node, edges)
    }

    #[test]
    fn test_numbered_menu_with_default() {
        let (node, edges) = numbered_node();
        assert_eq!(resolve_target(&node, &edges, "1"), Some("A"));
        assert_eq!(resolve_target(&node, &edges, " 2 "), Some("B"));
        assert_eq!(resolve_target(&node, &edges, "xyz"), Some("C"));
    }

    #[test]
    fn test_label_beats_later_tiers() {
        let conditions = vec![
            ConditionSpec::new(ConditionKind::Contains, "YES", "maybe"),
            ConditionSpec::new(ConditionKind::Equals, "no", "Yes please"),
        ];
        // Label match on the second condition wins over contains on the first.
        assert_eq!(match_condition(&conditions, "yes please"), Some(1));
        assert_eq!(match_condition(&conditions, "oh yes"), Some(0));
    }

    #[test]
    fn test_each_matcher_kind() {
        let contains = vec![ConditionSpec::new(ConditionKind::Contains, "price, cost", "")];
        assert_eq!(match_condition(&contains, "what is the Price?"), Some(0));
        assert_eq!(match_condition(&contains, "hello"), None);

        let not_equals = vec![ConditionSpec::new(ConditionKind::NotEquals, "stop,quit", "")];
        assert_eq!(match_condition(&not_equals, "continue"), Some(0));
        assert_eq!(match_condition(&not_equals, "STOP"), None);

        let affix = vec![
            ConditionSpec::new(ConditionKind::StartsWith, "order", ""),
            ConditionSpec::new(ConditionKind::EndsWith, "?", ""),
        ];
        assert_eq!(match_condition(&affix, "order #12"), Some(0));
        assert_eq!(match_condition(&affix, "really?"), Some(1));

        let unsupported = vec![ConditionSpec::new(ConditionKind::Unsupported, "x", "")];
        assert_eq!(match_condition(&unsupported, "x"), None);
    }

    #[test]
    fn test_positional_edge_when_handles_missing() {
        let node = condition_node(json!([
            {"type": "equals", "value": "a"},
            {"type": "equals", "value": "b"}
        ]));
        let edges = vec![Edge::new("c", "first"), Edge::new("c", "second")];
        assert_eq!(resolve_target(&node, &edges, "b"), Some("second"));
    }

    #[test]
    fn test_handle_alias_by_label_value_or_id() {
        let node = condition_node(json!([
            {"type": "equals", "value": "x"},
            {"type": "equals", "value": "y"},
            {"type": "equals", "value": "z", "label": "Zed", "id": "cond-z"}
        ]));
        let by_label = vec![Edge::with_handle("c", "target", "zed")];
        assert_eq!(resolve_target(&node, &by_label, "z"), Some("target"));

        let by_id = vec![
            Edge::with_handle("c", "other", "q"),
            Edge::with_handle("c", "target", "COND-Z"),
        ];
        assert_eq!(resolve_target(&node, &by_id, "z"), Some("target"));
    }

    #[test]
    fn test_fallback_to_last_edge_without_default() {
        let node = condition_node(json!([{"type": "equals", "value": "a"}]));
        let edges = vec![
            Edge::with_handle("c", "A", "condition-0"),
            Edge::with_handle("c", "Z", "whatever"),
        ];
        assert_eq!(resolve_target(&node, &edges, "nope"), Some("Z"));
    }

    #[test]
    fn test_default_only_node_takes_its_edge() {
        let node = condition_node(json!([{"type": "default"}]));
        let edges = vec![Edge::new("c", "end")];
        assert_eq!(resolve_target(&node, &edges, "anything"), Some("end"));
    }

    #[test]
    fn test_no_edges_resolves_to_none() {
        let (node, _) = numbered_node();
        assert_eq!(resolve_target(&node, &[], "1"), None);
    }

    #[test]
    fn test_malformed_conditions_keep_indices() {
        let node = condition_node(json!(["oops", {"type": "equals", "value": "ok"}]));
        let conditions = parse_conditions(&node);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].kind, ConditionKind::Unsupported);
        assert_eq!(match_condition(&conditions, "ok"), Some(1));

        let edges = vec![
            Edge::with_handle("c", "bad", "condition-0"),
            Edge::with_handle("c", "good", "condition-1"),
        ];
        assert_eq!(resolve_target(&node, &edges, "OK"), Some("good"));
    }
}
