use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::anthropic::{MessagesResponse, ResponseBlock, Usage};
use crate::protocol::finish_reason_to_stop_reason;
use crate::protocol::openai::ChatResponse;

/// Convert a non-streamed OpenAI chat response into an Anthropic message.
///
/// Content blocks are emitted in deterministic order: text, then thinking,
/// then one `tool_use` per function call.
///
/// # Errors
///
/// Returns [`GatewayError::Parse`] when the upstream reply carries no
/// choices.
pub fn convert_response(
    response: ChatResponse,
    request_model: &str,
    fallback_id: String,
) -> Result<MessagesResponse, GatewayError> {
    let ChatResponse {
        id,
        model,
        choices,
        usage,
    } = response;

    let choice = choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Parse("upstream response has no choices".to_string()))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        content.push(ResponseBlock::Text {
            text,
            citations: None,
        });
    }
    if let Some(thinking) = choice.message.reasoning_content {
        content.push(ResponseBlock::Thinking {
            thinking,
            signature: String::new(),
        });
    }
    if let Some(tool_calls) = choice.message.tool_calls {
        for call in tool_calls {
            if call.call_type != "function" {
                continue;
            }
            let input = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(value) => value,
                Err(_) => Value::String(call.function.arguments),
            };
            content.push(ResponseBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
    }

    let stop_reason = choice
        .finish_reason
        .as_deref()
        .map_or("end_turn", finish_reason_to_stop_reason);

    let usage = usage.map_or_else(
        || Usage::standard(0, 0),
        |usage| Usage::standard(usage.prompt_tokens, usage.completion_tokens),
    );

    Ok(MessagesResponse {
        id: id.unwrap_or(fallback_id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.unwrap_or_else(|| request_model.to_string()),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_from_json(value: serde_json::Value) -> ChatResponse {
        serde_json::from_value(value).expect("response fixture")
    }

    #[test]
    fn test_text_response() {
        let response = response_from_json(json!({
            "id": "r1",
            "model": "m",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2}
        }));
        let converted = convert_response(response, "m", "msg_fallback".into()).unwrap();
        assert_eq!(converted.id, "r1");
        assert_eq!(converted.stop_reason.as_deref(), Some("end_turn"));
        assert!(matches!(
            &converted.content[0],
            ResponseBlock::Text { text, citations } if text == "hello" && citations.is_none()
        ));
        assert_eq!(converted.usage.input_tokens, 1);
        assert_eq!(converted.usage.output_tokens, 2);
        assert_eq!(converted.usage.service_tier.as_deref(), Some("standard"));
    }

    #[test]
    fn test_content_order_text_thinking_tools() {
        let response = response_from_json(json!({
            "id": "r2",
            "model": "m",
            "choices": [{
                "message": {
                    "content": "answer",
                    "reasoning_content": "pondering",
                    "tool_calls": [
                        {"id": "a", "type": "function", "function": {"name": "f", "arguments": "{\"x\":1}"}},
                        {"id": "b", "type": "function", "function": {"name": "g", "arguments": "not json"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }));
        let converted = convert_response(response, "m", "msg_fallback".into()).unwrap();
        assert_eq!(converted.content.len(), 4);
        assert!(matches!(&converted.content[0], ResponseBlock::Text { .. }));
        assert!(matches!(
            &converted.content[1],
            ResponseBlock::Thinking { thinking, .. } if thinking == "pondering"
        ));
        assert!(matches!(
            &converted.content[2],
            ResponseBlock::ToolUse { input, .. } if input == &json!({"x": 1})
        ));
        // Unparseable arguments fall back to the raw string.
        assert!(matches!(
            &converted.content[3],
            ResponseBlock::ToolUse { input, .. } if input == &json!("not json")
        ));
        assert_eq!(converted.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_missing_choices_is_an_error() {
        let response = response_from_json(json!({"id": "r3", "model": "m", "choices": []}));
        let err = convert_response(response, "m", "msg_fallback".into()).unwrap_err();
        assert!(matches!(err, GatewayError::Parse(_)));
    }

    #[test]
    fn test_missing_id_uses_fallback() {
        let response = response_from_json(json!({
            "model": "m",
            "choices": [{"message": {"content": "x"}, "finish_reason": "stop"}]
        }));
        let converted = convert_response(response, "m", "msg_generated".into()).unwrap();
        assert_eq!(converted.id, "msg_generated");
    }

    #[test]
    fn test_non_function_tool_calls_are_skipped() {
        let response = response_from_json(json!({
            "id": "r4",
            "model": "m",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "type": "custom", "function": {"name": "f", "arguments": "{}"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }));
        let converted = convert_response(response, "m", "msg_fallback".into()).unwrap();
        assert!(converted.content.is_empty());
    }

    #[test]
    fn test_content_filter_maps_to_refusal() {
        let response = response_from_json(json!({
            "id": "r5",
            "model": "m",
            "choices": [{"message": {"content": "partial"}, "finish_reason": "content_filter"}]
        }));
        let converted = convert_response(response, "m", "msg_fallback".into()).unwrap();
        assert_eq!(converted.stop_reason.as_deref(), Some("refusal"));
    }
}
