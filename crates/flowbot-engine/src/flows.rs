use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use flowbot_core::config::FlowBinding;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::types::FlowDefinition;

use crate::graph::FlowGraph;

/// Where flow graphs come from.
pub trait FlowSource: Send + Sync + 'static {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<FlowGraph>>>;

    /// Pick the flow for a conversation that has no active execution.
    ///
    /// A binding whose trigger equals the input wins over a catch-all binding.
    fn resolve(&self, device: &str, input: &str) -> BoxFuture<'_, Result<Option<Arc<FlowGraph>>>>;
}

/// Flows held in memory, bound to devices.
#[derive(Default)]
pub struct StaticFlowSource {
    flows: HashMap<String, Arc<FlowGraph>>,
    bindings: Vec<FlowBinding>,
}

impl StaticFlowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, definition: FlowDefinition) -> Result<Arc<FlowGraph>> {
        let graph = Arc::new(FlowGraph::new(definition)?);
        self.flows.insert(graph.id().to_string(), graph.clone());
        Ok(graph)
    }

    pub fn with_flow(mut self, definition: FlowDefinition) -> Result<Self> {
        self.insert(definition)?;
        Ok(self)
    }

    pub fn bind(&mut self, binding: FlowBinding) {
        self.bindings.push(binding);
    }

    /// Bind `flow_id` as the catch-all flow for `device`.
    pub fn with_binding(mut self, device: &str, flow_id: &str, trigger: Option<&str>) -> Self {
        self.bind(FlowBinding {
            device: device.to_string(),
            flow_id: flow_id.to_string(),
            trigger: trigger.map(String::from),
        });
        self
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lookup(&self, flow_id: &str) -> Result<Arc<FlowGraph>> {
        self.flows
            .get(flow_id)
            .cloned()
            .ok_or_else(|| FlowbotError::FlowNotFound(flow_id.to_string()))
    }

    fn binding_for(&self, device: &str, input: &str) -> Option<&FlowBinding> {
        let input = input.trim();
        let for_device = || self.bindings.iter().filter(move |b| b.device == device);
        for_device()
            .find(|b| {
                b.trigger
                    .as_deref()
                    .is_some_and(|t| t.trim().eq_ignore_ascii_case(input))
            })
            .or_else(|| for_device().find(|b| b.trigger.is_none()))
    }
}

impl FlowSource for StaticFlowSource {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<FlowGraph>>> {
        let result = self.lookup(flow_id);
        Box::pin(async move { result })
    }

    fn resolve(&self, device: &str, input: &str) -> BoxFuture<'_, Result<Option<Arc<FlowGraph>>>> {
        let result = match self.binding_for(device, input) {
            Some(binding) => self.lookup(&binding.flow_id).map(Some),
            None => Ok(None),
        };
        Box::pin(async move { result })
    }
}

/// Flows loaded once from a directory of `*.json` files.
pub struct FileFlowSource {
    dir: PathBuf,
    inner: StaticFlowSource,
}

impl FileFlowSource {
    /// Load and validate every flow in `dir`. Any invalid file fails the load.
    pub fn load(dir: &Path, bindings: &[FlowBinding]) -> Result<Self> {
        let mut inner = StaticFlowSource::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                FlowbotError::Config(format!("cannot read flows dir {}: {}", dir.display(), e))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in &paths {
            let content = std::fs::read_to_string(path)?;
            let definition: FlowDefinition = serde_json::from_str(&content).map_err(|e| {
                FlowbotError::Config(format!("{}: {}", path.display(), e))
            })?;
            let graph = inner.insert(definition)?;
            let unknown = graph.unknown_kinds();
            if !unknown.is_empty() {
                warn!(flow_id = %graph.id(), kinds = ?unknown, "Flow has unknown node kinds (treated as passthrough)");
            }
            info!(flow_id = %graph.id(), nodes = graph.len(), path = %path.display(), "Flow loaded");
        }

        for binding in bindings {
            if inner.lookup(&binding.flow_id).is_err() {
                return Err(FlowbotError::Config(format!(
                    "binding for device {} references unknown flow {}",
                    binding.device, binding.flow_id
                )));
            }
            inner.bind(binding.clone());
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            inner,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.inner.flow_ids()
    }
}

impl FlowSource for FileFlowSource {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<FlowGraph>>> {
        self.inner.get(flow_id)
    }

    fn resolve(&self, device: &str, input: &str) -> BoxFuture<'_, Result<Option<Arc<FlowGraph>>>> {
        self.inner.resolve(device, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbot_core::types::{Edge, FlowNode, NodeKind};

    fn tiny(id: &str) -> FlowDefinition {
        FlowDefinition {
            id: id.into(),
            name: id.into(),
            nodes: vec![
                FlowNode::new("s", NodeKind::Start),
                FlowNode::new("e", NodeKind::End),
            ],
            edges: vec![Edge::new("s", "e")],
        }
    }

    #[tokio::test]
    async fn test_trigger_binding_wins_over_catch_all() {
        let source = StaticFlowSource::new()
            .with_flow(tiny("welcome"))
            .unwrap()
            .with_flow(tiny("promo"))
            .unwrap()
            .with_binding("dev-1", "welcome", None)
            .with_binding("dev-1", "promo", Some("PROMO"));

        let flow = source.resolve("dev-1", " promo ").await.unwrap().unwrap();
        assert_eq!(flow.id(), "promo");
        let flow = source.resolve("dev-1", "hello").await.unwrap().unwrap();
        assert_eq!(flow.id(), "welcome");
        assert!(source.resolve("dev-2", "hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_flow_errors() {
        let source = StaticFlowSource::new();
        assert!(matches!(
            source.get("nope").await,
            Err(FlowbotError::FlowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_source_loads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("welcome.json"),
            serde_json::to_string(&tiny("welcome")).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let bindings = vec![FlowBinding {
            device: "dev-1".into(),
            flow_id: "welcome".into(),
            trigger: None,
        }];
        let source = FileFlowSource::load(dir.path(), &bindings).unwrap();
        assert_eq!(source.flow_ids(), vec!["welcome"]);
        assert!(source.resolve("dev-1", "hi").await.unwrap().is_some());
    }

    #[test]
    fn test_file_source_rejects_bad_binding_and_invalid_flow() {
        let dir = tempfile::tempdir().unwrap();
        let bindings = vec![FlowBinding {
            device: "dev-1".into(),
            flow_id: "missing".into(),
            trigger: None,
        }];
        assert!(FileFlowSource::load(dir.path(), &bindings).is_err());

        std::fs::write(
            dir.path().join("broken.json"),
            r#"{"id": "b", "nodes": [{"id": "m", "type": "message"}]}"#,
        )
        .unwrap();
        let err = FileFlowSource::load(dir.path(), &[]).err().unwrap();
        assert!(err.to_string().contains("no start node"));
    }
}
