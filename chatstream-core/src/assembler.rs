//! Applies classified frames to the single in-flight assistant message.
//!
//! The live message never leaves this module by reference; callers get
//! clones. After a terminal frame the assembler is sealed until the next
//! turn begins, so late frames cannot touch a finished message.

use serde_json::{Map, Value};

use crate::model::{ChatMessage, MessageStatus, ReasoningTrace, Role, ToolCall, now_ms};
use crate::scheduler::UpdateKind;
use crate::stream::Frame;

const REASONING_KEY: &str = "reasoning";
const TOOL_ID_FIELDS: [&str; 3] = ["id", "toolCallId", "tool_call_id"];

/// What a single `apply`/`finalize` did to the message.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// No visible change (sealed, or a frame with nothing usable in it).
    Unchanged,
    /// First content delta: content was set and the message became active.
    ContentStarted,
    ContentAppended,
    ReasoningStarted,
    ReasoningAppended,
    MetadataMerged { key: String },
    ToolCallUpserted { id: String },
    /// Tool failure to surface; the message itself is untouched.
    ToolCallFailed { message: String },
    /// The message reached a terminal status and was released.
    Finalized(ChatMessage),
}

impl Applied {
    /// How the change should be announced, if at all.
    pub fn update_kind(&self) -> Option<UpdateKind> {
        match self {
            Self::ContentStarted | Self::ReasoningStarted => Some(UpdateKind::Immediate),
            Self::ContentAppended | Self::ReasoningAppended => Some(UpdateKind::Debounced),
            Self::MetadataMerged { .. } | Self::ToolCallUpserted { .. } => {
                Some(UpdateKind::Immediate)
            }
            Self::Finalized(_) => Some(UpdateKind::Terminal),
            Self::Unchanged | Self::ToolCallFailed { .. } => None,
        }
    }
}

/// How a turn ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// `replace_content` is set for backend error frames; otherwise partial
    /// content is kept and the error goes to `metadata.error`.
    Failed {
        message: String,
        replace_content: bool,
    },
}

#[derive(Debug, Default)]
pub struct MessageAssembler {
    current: Option<ChatMessage>,
    sealed: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm after a finished turn.
    pub fn begin_turn(&mut self) {
        self.sealed = false;
    }

    pub fn current(&self) -> Option<&ChatMessage> {
        self.current.as_ref()
    }

    /// Clone of the in-flight message for notification consumers.
    pub fn snapshot(&self) -> Option<ChatMessage> {
        self.current.clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Refuse further frames until the next turn without producing a message.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Apply one frame. `history` is consulted only to adopt a `loading`
    /// assistant message instead of creating a duplicate.
    pub fn apply(&mut self, frame: Frame, history: &[ChatMessage]) -> Applied {
        if self.sealed {
            tracing::debug!(frame = frame.kind(), "turn already finalized, dropping frame");
            return Applied::Unchanged;
        }
        match frame {
            Frame::ContentDelta(text) => {
                let msg = self.ensure_current(history);
                if msg.status == MessageStatus::Loading {
                    msg.content = text;
                    msg.status = MessageStatus::Active;
                    Applied::ContentStarted
                } else {
                    msg.content.push_str(&text);
                    Applied::ContentAppended
                }
            }
            Frame::ReasoningDelta(text) => {
                let msg = self.ensure_current(history);
                if push_reasoning(msg, &text) {
                    Applied::ReasoningStarted
                } else {
                    Applied::ReasoningAppended
                }
            }
            Frame::Metadata { key, value } => {
                let msg = self.ensure_current(history);
                match value {
                    Value::String(text) if key == REASONING_KEY => {
                        push_reasoning(msg, &text);
                    }
                    value => {
                        msg.metadata.insert(key.clone(), value);
                    }
                }
                Applied::MetadataMerged { key }
            }
            Frame::ToolCallUpdate { subtype, payload } => {
                let Value::Object(mut fields) = payload else {
                    tracing::debug!(subtype = %subtype, "tool call payload is not an object");
                    return Applied::Unchanged;
                };
                let Some(id) = tool_call_id(&fields) else {
                    tracing::debug!(subtype = %subtype, "tool call payload has no id");
                    return Applied::Unchanged;
                };
                // both are owned by the ToolCall itself
                fields.remove("id");
                fields.remove("phase");
                let msg = self.ensure_current(history);
                upsert_tool_call(msg, &id, subtype, fields);
                Applied::ToolCallUpserted { id }
            }
            Frame::ToolCallError { message, .. } => Applied::ToolCallFailed { message },
            Frame::Error { message } => self
                .finalize(
                    Outcome::Failed {
                        message,
                        replace_content: true,
                    },
                    history,
                )
                .map(Applied::Finalized)
                .unwrap_or(Applied::Unchanged),
            Frame::Done => self
                .finalize(Outcome::Completed, history)
                .map(Applied::Finalized)
                .unwrap_or(Applied::Unchanged),
        }
    }

    /// Move the in-flight message to a terminal status, close any open
    /// reasoning trace, release it and seal the assembler.
    ///
    /// Returns the final message, or `None` when there was nothing to
    /// finalize (a clean finish with no message, or already sealed).
    pub fn finalize(&mut self, outcome: Outcome, history: &[ChatMessage]) -> Option<ChatMessage> {
        if self.sealed {
            return None;
        }
        self.sealed = true;

        let mut msg = match self.current.take().or_else(|| adopt_loading(history)) {
            Some(m) => m,
            None => match outcome {
                Outcome::Failed { .. } => ChatMessage::assistant_placeholder(),
                Outcome::Completed => return None,
            },
        };

        match outcome {
            Outcome::Completed => msg.status = MessageStatus::Completed,
            Outcome::Failed {
                message,
                replace_content,
            } => {
                msg.status = MessageStatus::Failed;
                if replace_content || msg.content.is_empty() {
                    msg.content = message;
                } else {
                    msg.metadata.insert("error".into(), Value::String(message));
                }
            }
        }
        if let Some(trace) = msg.reasoning_trace.as_mut() {
            trace.close(now_ms());
        }
        Some(msg)
    }

    fn ensure_current(&mut self, history: &[ChatMessage]) -> &mut ChatMessage {
        self.current.get_or_insert_with(|| {
            adopt_loading(history).unwrap_or_else(ChatMessage::assistant_placeholder)
        })
    }
}

fn adopt_loading(history: &[ChatMessage]) -> Option<ChatMessage> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.status == MessageStatus::Loading)
        .cloned()
}

/// Returns true when this call opened the trace.
fn push_reasoning(msg: &mut ChatMessage, text: &str) -> bool {
    match msg.reasoning_trace.as_mut() {
        Some(trace) => {
            trace.content.push_str(text);
            false
        }
        None => {
            let mut trace = ReasoningTrace::started_at(now_ms());
            trace.content.push_str(text);
            msg.reasoning_trace = Some(trace);
            true
        }
    }
}

fn tool_call_id(fields: &Map<String, Value>) -> Option<String> {
    TOOL_ID_FIELDS.iter().find_map(|k| match fields.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn upsert_tool_call(msg: &mut ChatMessage, id: &str, phase: String, fields: Map<String, Value>) {
    match msg.tool_calls.iter_mut().find(|t| t.id == id) {
        Some(existing) => {
            existing.phase = phase;
            existing.fields.extend(fields);
        }
        None => msg.tool_calls.push(ToolCall {
            id: id.to_string(),
            phase,
            fields,
        }),
    }
}
