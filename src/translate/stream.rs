use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::protocol::anthropic::{
    BlockDelta, DeltaUsage, MessageDeltaBody, ResponseBlock, StreamEvent, StreamMessageStart,
};
use crate::protocol::finish_reason_to_stop_reason;
use crate::protocol::openai::{ChatUsage, StreamChunk, StreamDelta, StreamToolCall};

/// Per-session state for one streamed exchange.
///
/// Invariants:
/// - at most one of text/thinking is open at any moment;
/// - tool blocks (keyed by upstream index) may overlap each other but never
///   an open text or thinking block;
/// - every opened block is closed exactly once before the terminal
///   `message_delta`.
#[derive(Debug, Default)]
struct StreamState {
    message_started: bool,
    message_stop_sent: bool,
    text_block_started: bool,
    thinking_block_started: bool,
    tool_blocks: FxHashMap<u32, ToolBlock>,
    content_block_index: usize,
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug)]
struct ToolBlock {
    id: String,
    name: String,
}

/// Incremental OpenAI SSE chunk → Anthropic SSE event translator.
///
/// Owned by exactly one request task; `session_id` doubles as the downstream
/// message id.
#[derive(Debug)]
pub struct StreamTranslator {
    session_id: String,
    model: String,
    state: StreamState,
}

impl StreamTranslator {
    #[must_use]
    pub fn new(session_id: String, model: String) -> Self {
        Self {
            session_id,
            model,
            state: StreamState::default(),
        }
    }

    #[must_use]
    pub fn message_started(&self) -> bool {
        self.state.message_started
    }

    /// Accumulated `(input_tokens, output_tokens)` for usage recording.
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        (self.state.input_tokens, self.state.output_tokens)
    }

    /// Fold an upstream usage block into the session totals.
    ///
    /// Zero values are ignored so a terminal usage-only chunk cannot wipe
    /// totals sniffed earlier.
    pub fn observe_usage(&mut self, usage: &ChatUsage) {
        if usage.prompt_tokens != 0 {
            self.state.input_tokens = usage.prompt_tokens;
        }
        if usage.completion_tokens != 0 {
            self.state.output_tokens = usage.completion_tokens;
        }
    }

    /// Translate one upstream chunk into zero or more downstream events.
    pub fn translate_chunk(&mut self, chunk: &StreamChunk, out: &mut Vec<StreamEvent>) {
        if let Some(usage) = chunk.usage.as_ref() {
            self.observe_usage(usage);
        }
        let Some(choice) = chunk.choices.first() else {
            return;
        };
        self.apply_delta(&choice.delta, out);
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_message(reason, out);
        }
    }

    /// Emit the terminal `message_stop`, idempotently.
    ///
    /// Called on the upstream `[DONE]` sentinel and again as a synthetic
    /// close when the upstream ends without one. A session that never saw a
    /// role emits nothing.
    pub fn finish_stream(&mut self, out: &mut Vec<StreamEvent>) {
        if self.state.message_started && !self.state.message_stop_sent {
            self.state.message_stop_sent = true;
            out.push(StreamEvent::MessageStop);
        }
    }

    fn apply_delta(&mut self, delta: &StreamDelta, out: &mut Vec<StreamEvent>) {
        if delta.role.is_some() && !self.state.message_started {
            self.state.message_started = true;
            out.push(StreamEvent::MessageStart {
                message: StreamMessageStart {
                    id: self.session_id.clone(),
                    message_type: "message".to_string(),
                    role: "assistant".to_string(),
                    model: self.model.clone(),
                    content: Vec::new(),
                    usage: DeltaUsage::default(),
                },
            });
        }
        if !self.state.message_started {
            return;
        }

        let text = delta.content.as_deref().filter(|t| !t.is_empty());
        let thinking = delta.reasoning_content.as_deref().filter(|t| !t.is_empty());
        let tool_calls = delta.tool_calls.as_deref().filter(|calls| !calls.is_empty());

        // The protocol is not expected to mix kinds in one delta; when it
        // does, apply exactly one in precedence order to keep the
        // mutual-exclusion invariant.
        if let Some(text) = text {
            if thinking.is_some() || tool_calls.is_some() {
                tracing::warn!("upstream delta mixes content kinds; applying text only");
            }
            self.emit_text_delta(text, out);
        } else if let Some(thinking) = thinking {
            if tool_calls.is_some() {
                tracing::warn!("upstream delta mixes content kinds; applying thinking only");
            }
            self.emit_thinking_delta(thinking, out);
        } else if let Some(calls) = tool_calls {
            self.emit_tool_calls(calls, out);
        }
    }

    fn emit_text_delta(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        self.close_thinking_block(out);
        self.close_tool_blocks(out);
        if !self.state.text_block_started {
            out.push(StreamEvent::ContentBlockStart {
                index: self.state.content_block_index,
                content_block: ResponseBlock::Text {
                    text: String::new(),
                    citations: None,
                },
            });
            self.state.text_block_started = true;
        }
        out.push(StreamEvent::ContentBlockDelta {
            index: self.state.content_block_index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_thinking_delta(&mut self, thinking: &str, out: &mut Vec<StreamEvent>) {
        self.close_text_block(out);
        self.close_tool_blocks(out);
        if !self.state.thinking_block_started {
            out.push(StreamEvent::ContentBlockStart {
                index: self.state.content_block_index,
                content_block: ResponseBlock::Thinking {
                    thinking: String::new(),
                    signature: String::new(),
                },
            });
            self.state.thinking_block_started = true;
        }
        out.push(StreamEvent::ContentBlockDelta {
            index: self.state.content_block_index,
            delta: BlockDelta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    fn emit_tool_calls(&mut self, calls: &[StreamToolCall], out: &mut Vec<StreamEvent>) {
        self.close_text_block(out);
        self.close_thinking_block(out);
        for call in calls {
            let index = call.index.unwrap_or(0);
            if let Some(id) = call.id.as_deref() {
                if let Some(previous) = self.state.tool_blocks.remove(&index) {
                    tracing::debug!(
                        index,
                        previous_id = %previous.id,
                        previous_name = %previous.name,
                        "upstream reused a tool index; closing the previous block"
                    );
                    out.push(StreamEvent::ContentBlockStop {
                        index: index as usize,
                    });
                }
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_default();
                out.push(StreamEvent::ContentBlockStart {
                    index: index as usize,
                    content_block: ResponseBlock::ToolUse {
                        id: id.to_string(),
                        name: name.clone(),
                        input: Value::Object(Map::new()),
                    },
                });
                self.state.tool_blocks.insert(
                    index,
                    ToolBlock {
                        id: id.to_string(),
                        name,
                    },
                );
            }
            if let Some(arguments) = call
                .function
                .as_ref()
                .and_then(|function| function.arguments.as_deref())
            {
                if !arguments.is_empty() {
                    out.push(StreamEvent::ContentBlockDelta {
                        index: index as usize,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: arguments.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Terminal chunk: close everything open, then emit `message_delta`.
    /// `message_stop` is deferred to the `[DONE]` sentinel.
    fn finish_message(&mut self, finish_reason: &str, out: &mut Vec<StreamEvent>) {
        if !self.state.message_started {
            return;
        }
        self.close_thinking_block(out);
        self.close_text_block(out);
        self.close_tool_blocks(out);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(finish_reason_to_stop_reason(finish_reason).to_string()),
                stop_sequence: None,
            },
            // output_tokens deliberately carries the combined total;
            // input_tokens stays 0 on this event.
            usage: DeltaUsage {
                input_tokens: 0,
                output_tokens: self.state.input_tokens + self.state.output_tokens,
            },
        });
    }

    fn close_text_block(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.state.text_block_started {
            return;
        }
        out.push(StreamEvent::ContentBlockStop {
            index: self.state.content_block_index,
        });
        self.state.text_block_started = false;
        self.state.content_block_index += 1;
    }

    /// Thinking blocks flush an empty `signature_delta` before closing.
    fn close_thinking_block(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.state.thinking_block_started {
            return;
        }
        out.push(StreamEvent::ContentBlockDelta {
            index: self.state.content_block_index,
            delta: BlockDelta::SignatureDelta {
                signature: String::new(),
            },
        });
        out.push(StreamEvent::ContentBlockStop {
            index: self.state.content_block_index,
        });
        self.state.thinking_block_started = false;
        self.state.content_block_index += 1;
    }

    fn close_tool_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        if self.state.tool_blocks.is_empty() {
            return;
        }
        let mut indices: Vec<u32> = self.state.tool_blocks.keys().copied().collect();
        indices.sort_unstable();
        for index in &indices {
            out.push(StreamEvent::ContentBlockStop {
                index: *index as usize,
            });
        }
        if let Some(max) = indices.last() {
            // Index stays monotonically non-decreasing even when upstream
            // tool indices sit below the current block index.
            self.state.content_block_index =
                self.state.content_block_index.max(*max as usize + 1);
        }
        self.state.tool_blocks.clear();
    }
}
