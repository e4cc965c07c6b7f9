use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::protocol::anthropic::{
    ContentBlock, DocumentSource, ImageSource, Message, MessageContent, MessagesRequest, Role,
    SystemPrompt, ToolChoice, ToolDef,
};
use crate::protocol::openai::{
    ChatMessage, ChatRequest, Tool, ToolCall, ToolCallFunction, ToolChoiceFunction,
    ToolChoiceFunctionName, ToolChoiceValue, ToolFunction,
};

/// Convert an Anthropic Messages request into an OpenAI chat completions
/// request.
///
/// Absent optionals stay absent so upstream defaults survive; only `stream`
/// is always materialized.
#[must_use]
pub fn convert_request(request: &MessagesRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = system_message(request.system.as_ref()) {
        messages.push(system);
    }
    for message in &request.messages {
        convert_message(message, &mut messages);
    }

    let tools = request
        .tools
        .as_ref()
        .map(|tools| tools.iter().map(convert_tool).collect());

    let tool_choice = request.tool_choice.as_ref().map(convert_tool_choice);
    let parallel_tool_calls = match request
        .tool_choice
        .as_ref()
        .and_then(ToolChoice::disable_parallel_tool_use)
    {
        Some(true) => Some(false),
        _ => None,
    };

    let metadata = request
        .metadata
        .as_ref()
        .map(convert_metadata)
        .filter(|metadata| !metadata.is_empty());

    ChatRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream.unwrap_or(false),
        stream_options: None,
        max_completion_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        tools,
        tool_choice,
        parallel_tool_calls,
        metadata,
    }
}

fn system_message(system: Option<&SystemPrompt>) -> Option<ChatMessage> {
    match system? {
        SystemPrompt::Text(text) => Some(text_message("system", text.clone())),
        SystemPrompt::Blocks(blocks) => {
            let mut combined = String::new();
            for block in blocks {
                if block.block_type == "text" {
                    combined.push_str(&block.text);
                }
            }
            if combined.is_empty() {
                None
            } else {
                Some(text_message("system", combined))
            }
        }
    }
}

fn text_message(role: &str, text: String) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content: Some(Value::String(text)),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// One Anthropic message yields zero or more OpenAI messages.
///
/// A single pass over the blocks fills the accumulators; tool results win
/// over everything else in the same message.
fn convert_message(message: &Message, out: &mut Vec<ChatMessage>) {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(text_message(role_name(message.role), text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut text_parts: Vec<&str> = Vec::new();
    let mut content_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut tool_results: Vec<ChatMessage> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                text_parts.push(text);
                content_parts.push(json!({"type": "text", "text": text}));
            }
            ContentBlock::Image { source } => content_parts.push(image_part(source)),
            ContentBlock::Document { source, title } => {
                content_parts.push(document_part(source, title.as_deref()));
            }
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name: name.clone(),
                    arguments: serde_json::to_string(input)
                        .unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => tool_results.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(content.to_openai_value()),
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
            ContentBlock::Thinking { .. } => {
                tracing::debug!("skipping inbound thinking block; no upstream encoding");
            }
            ContentBlock::Unknown => {
                tracing::debug!("skipping unrecognized content block");
            }
        }
    }

    if !tool_results.is_empty() {
        out.extend(tool_results);
        return;
    }

    match message.role {
        Role::Assistant => {
            let content = if text_parts.is_empty() {
                Value::Null
            } else {
                Value::String(text_parts.concat())
            };
            out.push(ChatMessage {
                role: "assistant".to_string(),
                content: Some(content),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            });
        }
        Role::User => {
            if !content_parts.is_empty() {
                out.push(ChatMessage {
                    role: "user".to_string(),
                    content: Some(Value::Array(content_parts)),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn image_part(source: &ImageSource) -> Value {
    match source {
        ImageSource::Base64 { media_type, data } => json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{media_type};base64,{data}")},
        }),
        ImageSource::Url { url } => json!({
            "type": "image_url",
            "image_url": {"url": url},
        }),
    }
}

fn document_part(source: &DocumentSource, title: Option<&str>) -> Value {
    let file_data = match source {
        DocumentSource::Base64 { data, .. } => data.clone(),
        DocumentSource::Text { data } => BASE64.encode(data.as_bytes()),
        DocumentSource::Content { content } => BASE64.encode(document_text(content).as_bytes()),
    };
    let mut file = Map::new();
    file.insert("file_data".to_string(), Value::String(file_data));
    if let Some(title) = title {
        file.insert("filename".to_string(), Value::String(title.to_string()));
    }
    json!({"type": "file", "file": file})
}

/// Flatten a `content`-sourced document into plain text.
fn document_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect(),
        other => other.to_string(),
    }
}

fn convert_tool(tool: &ToolDef) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: ToolFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> ToolChoiceValue {
    match choice {
        ToolChoice::Auto { .. } => ToolChoiceValue::Mode("auto".to_string()),
        ToolChoice::Any { .. } => ToolChoiceValue::Mode("required".to_string()),
        ToolChoice::None { .. } => ToolChoiceValue::Mode("none".to_string()),
        ToolChoice::Tool { name, .. } => ToolChoiceValue::Function(ToolChoiceFunction {
            choice_type: "function".to_string(),
            function: ToolChoiceFunctionName { name: name.clone() },
        }),
    }
}

/// Copy metadata, coercing non-string values through canonical JSON and
/// dropping nulls.
fn convert_metadata(source: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(source.len());
    for (key, value) in source {
        match value {
            Value::Null => {}
            Value::String(_) => {
                out.insert(key.clone(), value.clone());
            }
            other => {
                if let Ok(encoded) = serde_json::to_string(other) {
                    out.insert(key.clone(), Value::String(encoded));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_from_json(value: Value) -> MessagesRequest {
        serde_json::from_value(value).expect("request fixture")
    }

    #[test]
    fn test_system_blocks_concatenate_without_separator() {
        let request = request_from_json(json!({
            "model": "m",
            "system": [{"type": "text", "text": "A"}, {"type": "text", "text": "B"}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.messages[0].role, "system");
        assert_eq!(converted.messages[0].content, Some(json!("AB")));
    }

    #[test]
    fn test_empty_system_blocks_emit_nothing() {
        let request = request_from_json(json!({
            "model": "m",
            "system": [{"type": "text", "text": ""}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.messages[0].role, "user");
    }

    #[test]
    fn test_tool_result_discards_sibling_blocks() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
                    {"type": "text", "text": "ignored"}
                ]
            }]
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.messages.len(), 1);
        assert_eq!(converted.messages[0].role, "tool");
        assert_eq!(converted.messages[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(converted.messages[0].content, Some(json!("ok")));
    }

    #[test]
    fn test_assistant_tool_use_becomes_tool_calls() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "tool_use", "id": "call_1", "name": "lookup", "input": {"q": 1}}
                ]
            }]
        }));
        let converted = convert_request(&request);
        let message = &converted.messages[0];
        assert_eq!(message.role, "assistant");
        assert_eq!(message.content, Some(Value::Null));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(calls[0].function.arguments, "{\"q\":1}");
    }

    #[test]
    fn test_image_sources() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}},
                    {"type": "image", "source": {"type": "url", "url": "https://img.example/cat.png"}}
                ]
            }]
        }));
        let converted = convert_request(&request);
        let parts = converted.messages[0].content.as_ref().unwrap();
        assert_eq!(
            parts[0]["image_url"]["url"],
            "data:image/png;base64,aGk="
        );
        assert_eq!(parts[1]["image_url"]["url"], "https://img.example/cat.png");
    }

    #[test]
    fn test_document_text_source_is_base64_encoded() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "document",
                    "source": {"type": "text", "data": "hello"},
                    "title": "greeting.txt"
                }]
            }]
        }));
        let converted = convert_request(&request);
        let parts = converted.messages[0].content.as_ref().unwrap();
        assert_eq!(parts[0]["type"], "file");
        assert_eq!(parts[0]["file"]["file_data"], "aGVsbG8=");
        assert_eq!(parts[0]["file"]["filename"], "greeting.txt");
    }

    #[test]
    fn test_thinking_blocks_are_dropped() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "mulling", "signature": "sig"},
                    {"type": "text", "text": "answer"}
                ]
            }]
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.messages[0].content, Some(json!("answer")));
        assert!(converted.messages[0].tool_calls.is_none());
    }

    #[test]
    fn test_parallel_tool_use_flag() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": {"type": "any", "disable_parallel_tool_use": true}
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.parallel_tool_calls, Some(false));
        assert!(matches!(
            converted.tool_choice,
            Some(ToolChoiceValue::Mode(ref mode)) if mode == "required"
        ));

        let request = request_from_json(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": {"type": "tool", "name": "lookup"}
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.parallel_tool_calls, None);
        assert!(matches!(
            converted.tool_choice,
            Some(ToolChoiceValue::Function(ref f)) if f.function.name == "lookup"
        ));
    }

    #[test]
    fn test_metadata_coercion() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "metadata": {"user_id": "u-1", "attempt": 3, "ignored": null}
        }));
        let converted = convert_request(&request);
        let metadata = converted.metadata.unwrap();
        assert_eq!(metadata["user_id"], "u-1");
        assert_eq!(metadata["attempt"], "3");
        assert!(!metadata.contains_key("ignored"));
    }

    #[test]
    fn test_absent_optionals_stay_absent() {
        let request = request_from_json(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let converted = convert_request(&request);
        assert_eq!(converted.model, "m");
        assert!(!converted.stream);
        assert!(converted.temperature.is_none());
        assert!(converted.top_p.is_none());
        assert!(converted.max_completion_tokens.is_none());
        assert!(converted.stop.is_none());
        assert!(converted.tools.is_none());
        assert!(converted.parallel_tool_calls.is_none());
    }
}
