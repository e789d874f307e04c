//! One handler per node kind. Each returns the [`Transition`] the
//! interpreter loop should persist next.

use serde_json::Value;
use tracing::{debug, error, warn};

use flowbot_core::error::Result;
use flowbot_core::types::{
    AiRequest, CaptureInput, DelayedContinuation, FlowEvent, FlowNode, MediaKind, NodeKind,
};

use crate::ai::{compose_system_prompt, node_api_key, parse_ai_reply, AiItemKind};
use crate::condition::resolve_target;
use crate::graph::FlowGraph;
use crate::interpreter::{FlowInterpreter, Turn};
use crate::template::TemplateContext;

pub(crate) enum Transition {
    /// Move to the node and keep going.
    Advance(String),
    /// Move to the node and park until the user replies.
    AdvanceAndWait(String),
    /// Park at the current node until the user replies.
    Wait,
    /// A continuation was queued; stay on the delay node.
    Scheduled(DelayedContinuation),
    Complete,
}

const TEXT_KEYS: &[&str] = &["text", "message", "content"];
const URL_KEYS: &[&str] = &["url", "mediaUrl", "media_url", "fileUrl", "src", "link"];
const CAPTION_KEYS: &[&str] = &["caption", "text"];
const STAGE_KEYS: &[&str] = &["stage", "stageName", "stage_name"];

/// Advance along the first edge, or complete when there is none.
fn advance_or_complete(graph: &FlowGraph, node_id: &str) -> Transition {
    match graph.next_target(node_id) {
        Some(next) => Transition::Advance(next.to_string()),
        None => Transition::Complete,
    }
}

/// After a node that sent something: park on a reply node, otherwise advance.
fn after_output(graph: &FlowGraph, node_id: &str) -> Transition {
    match graph.next_node(node_id) {
        None => Transition::Complete,
        Some(next) if next.kind.awaits_reply() => Transition::AdvanceAndWait(next.id.clone()),
        Some(next) => Transition::Advance(next.id.clone()),
    }
}

/// After an AI node: a following reply or AI node also waits for the user.
fn after_ai(graph: &FlowGraph, node_id: &str) -> Transition {
    match graph.next_node(node_id) {
        None => Transition::Complete,
        Some(next) if next.kind.awaits_reply() || next.kind.is_ai() => {
            Transition::AdvanceAndWait(next.id.clone())
        }
        Some(next) => Transition::Advance(next.id.clone()),
    }
}

/// Best guess at a media kind from a URL's file extension.
fn guess_media_kind(url: &str) -> MediaKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "mov" | "webm" | "mkv" | "3gp" => MediaKind::Video,
        "mp3" | "ogg" | "oga" | "opus" | "wav" | "m4a" | "aac" => MediaKind::Audio,
        _ => MediaKind::Image,
    }
}

impl FlowInterpreter {
    pub(crate) async fn step(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
        reply: Option<&str>,
    ) -> Result<Transition> {
        match &node.kind {
            NodeKind::Start => Ok(advance_or_complete(graph, &node.id)),
            NodeKind::Message => self.send_message(graph, turn, node).await,
            NodeKind::Image | NodeKind::Audio | NodeKind::Video => {
                self.send_media_node(graph, turn, node).await
            }
            NodeKind::Stage => self.enter_stage(graph, turn, node).await,
            NodeKind::Delay => self.schedule_delay(graph, turn, node).await,
            NodeKind::Condition => Ok(self.branch(graph, turn, node)),
            NodeKind::UserReply | NodeKind::WaitingReplyTimes => Ok(match reply {
                Some(_) => advance_or_complete(graph, &node.id),
                None => Transition::Wait,
            }),
            NodeKind::AiPrompt | NodeKind::AdvancedAiPrompt | NodeKind::Prompt => {
                self.run_ai(graph, turn, node).await
            }
            NodeKind::Manual => Ok(advance_or_complete(graph, &node.id)),
            NodeKind::Unknown(raw) => {
                debug!(node_id = %node.id, kind = %raw, "Unknown node kind, passing through");
                Ok(advance_or_complete(graph, &node.id))
            }
            NodeKind::End => Ok(Transition::Complete),
        }
    }

    fn render(&self, turn: &Turn, template: &str) -> String {
        TemplateContext::for_execution(
            &turn.execution,
            turn.input.display_name.as_deref(),
            &turn.input.text,
        )
        .render(template)
    }

    // ── Outbound ────────────────────────────────────────────────

    /// Send text; failures are logged and reported, never retried.
    async fn dispatch_text(&self, turn: &mut Turn, node: &FlowNode, text: &str) -> bool {
        let key = turn.execution.key.clone();
        match self
            .dispatcher
            .send_text(&key.device, &key.phone, text)
            .await
        {
            Ok(()) => {
                self.delivered(turn, node, "text");
                self.record_history(turn, text).await;
                true
            }
            Err(e) => {
                self.delivery_failed(turn, node, &e.to_string());
                false
            }
        }
    }

    /// Validate and send media. A URL that fails validation is replaced by
    /// the configured fallback text.
    async fn dispatch_media(
        &self,
        turn: &mut Turn,
        node: &FlowNode,
        url: &str,
        hint: Option<MediaKind>,
    ) -> bool {
        let kind = match &self.media {
            Some(validator) => match validator.classify(url).await {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(node_id = %node.id, url, error = %e, "Media failed validation, sending fallback");
                    let fallback = self.config.media_fallback_text.clone();
                    return self.dispatch_text(turn, node, &fallback).await;
                }
            },
            None => hint.unwrap_or_else(|| guess_media_kind(url)),
        };

        let key = turn.execution.key.clone();
        match self
            .dispatcher
            .send_media(&key.device, &key.phone, url, kind)
            .await
        {
            Ok(()) => {
                self.delivered(turn, node, kind.as_str());
                self.record_history(turn, url).await;
                true
            }
            Err(e) => {
                self.delivery_failed(turn, node, &e.to_string());
                false
            }
        }
    }

    fn delivered(&self, turn: &mut Turn, node: &FlowNode, kind: &str) {
        turn.report.dispatched += 1;
        self.events.publish(FlowEvent::MessageDispatched {
            key: turn.execution.key.clone(),
            node_id: node.id.clone(),
            kind: kind.to_string(),
        });
    }

    fn delivery_failed(&self, turn: &Turn, node: &FlowNode, error: &str) {
        error!(
            phone = %turn.execution.key.phone,
            device = %turn.execution.key.device,
            node_id = %node.id,
            error,
            "Dispatch failed, continuing"
        );
        self.events.publish(FlowEvent::DispatchFailed {
            key: turn.execution.key.clone(),
            node_id: node.id.clone(),
            error: error.to_string(),
        });
    }

    // ── Node handlers ───────────────────────────────────────────

    async fn send_message(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
    ) -> Result<Transition> {
        match node.data_str(TEXT_KEYS) {
            Some(template) => {
                let text = self.render(turn, template);
                self.dispatch_text(turn, node, &text).await;
            }
            None => warn!(node_id = %node.id, "Message node has no text"),
        }
        Ok(after_output(graph, &node.id))
    }

    async fn send_media_node(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
    ) -> Result<Transition> {
        match node.data_str(URL_KEYS) {
            Some(template) => {
                let url = self.render(turn, template.trim());
                self.dispatch_media(turn, node, &url, node.kind.media_kind())
                    .await;
                if let Some(caption) = node.data_str(CAPTION_KEYS) {
                    let caption = self.render(turn, caption);
                    self.dispatch_text(turn, node, &caption).await;
                }
            }
            None => warn!(node_id = %node.id, kind = %node.kind, "Media node has no URL"),
        }
        Ok(after_output(graph, &node.id))
    }

    async fn enter_stage(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
    ) -> Result<Transition> {
        // An explicitly empty stage is still recorded, unlike `data_str`.
        let stage = STAGE_KEYS
            .iter()
            .find_map(|k| node.data.get(*k).and_then(Value::as_str))
            .map(|s| self.render(turn, s.trim()));

        match stage {
            Some(stage) => {
                self.executions
                    .set_stage(&turn.execution.execution_id, Some(stage.clone()))
                    .await?;
                debug!(node_id = %node.id, stage = %stage, "Stage recorded");
                turn.execution.stage = Some(stage.clone());
                if !stage.is_empty() {
                    self.apply_captures(turn, &stage).await?;
                }
            }
            None => warn!(node_id = %node.id, "Stage node has no stage value"),
        }
        Ok(advance_or_complete(graph, &node.id))
    }

    async fn apply_captures(&self, turn: &mut Turn, stage: &str) -> Result<()> {
        let Some(source) = &self.captures else {
            return Ok(());
        };
        let rules = match source.lookup(&turn.execution.key.device, stage).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(stage, error = %e, "Field capture lookup failed");
                return Ok(());
            }
        };

        let mut changed = false;
        for rule in rules {
            let value = match rule.input_kind {
                CaptureInput::UserInput => {
                    let input = turn.input.text.trim();
                    if input.is_empty() {
                        continue;
                    }
                    input.to_string()
                }
                CaptureInput::Fixed => rule.fixed_value.clone().unwrap_or_default(),
            };
            debug!(field = %rule.target_field, stage, "Field captured");
            turn.execution.variables.insert(rule.target_field, value);
            changed = true;
        }

        if changed {
            self.executions
                .save_variables(&turn.execution.execution_id, &turn.execution.variables)
                .await?;
        }
        Ok(())
    }

    async fn schedule_delay(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
    ) -> Result<Transition> {
        let Some(target) = graph.next_target(&node.id) else {
            return Ok(Transition::Complete);
        };
        let after = self.scheduler.duration_for(node);
        let item = self
            .scheduler
            .schedule(&turn.execution, target, &turn.input.text, after)
            .await?;
        Ok(Transition::Scheduled(item))
    }

    fn branch(&self, graph: &FlowGraph, turn: &Turn, node: &FlowNode) -> Transition {
        match resolve_target(node, graph.outgoing(&node.id), &turn.input.text) {
            Some(target) => Transition::Advance(target.to_string()),
            None => {
                warn!(node_id = %node.id, "Condition node has no outgoing edges, waiting");
                Transition::Wait
            }
        }
    }

    async fn run_ai(
        &self,
        graph: &FlowGraph,
        turn: &mut Turn,
        node: &FlowNode,
    ) -> Result<Transition> {
        let Some(ai) = &self.ai else {
            warn!(node_id = %node.id, "AI node reached but no AI generator is configured");
            return Ok(after_ai(graph, &node.id));
        };

        let history = match self
            .history
            .read(&turn.execution.key, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Failed to read conversation history");
                Vec::new()
            }
        };

        let system_prompt = compose_system_prompt(
            node,
            &TemplateContext::for_execution(
                &turn.execution,
                turn.input.display_name.as_deref(),
                &turn.input.text,
            ),
        );
        let request = AiRequest {
            system_prompt,
            user_input: turn.input.text.clone(),
            api_key: node_api_key(node),
            device_id: turn.execution.key.device.clone(),
            history,
        };

        let raw = match ai.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(node_id = %node.id, error = %e, "AI generation failed");
                return Ok(after_ai(graph, &node.id));
            }
        };

        match parse_ai_reply(&raw) {
            Ok(reply) => {
                if let Some(stage) = reply.stage {
                    self.executions
                        .set_stage(&turn.execution.execution_id, Some(stage.clone()))
                        .await?;
                    turn.execution.stage = Some(stage);
                }
                for (i, item) in reply.items.iter().enumerate() {
                    if i > 0 && !self.config.ai_item_delay().is_zero() {
                        tokio::time::sleep(self.config.ai_item_delay()).await;
                    }
                    match item.kind {
                        AiItemKind::Text => {
                            self.dispatch_text(turn, node, &item.content).await;
                        }
                        AiItemKind::Media(hint) => {
                            self.dispatch_media(turn, node, item.content.trim(), hint)
                                .await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "AI reply was not valid JSON, sending raw text");
                let text = raw.trim();
                if !text.is_empty() {
                    self.dispatch_text(turn, node, text).await;
                }
            }
        }

        Ok(after_ai(graph, &node.id))
    }
}
