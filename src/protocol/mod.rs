pub mod anthropic;
pub mod openai;

/// Map an OpenAI `finish_reason` onto an Anthropic `stop_reason`.
#[must_use]
pub fn finish_reason_to_stop_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "refusal",
        _ => "end_turn", // "stop" and anything unrecognized
    }
}
