pub mod sse;

pub use sse::{encode_event_frame, encode_stream_event, sniff_usage, FramePayload, SseReframer};
