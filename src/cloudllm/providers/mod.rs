//! The three wire dialects a [`ChatProvider`](crate::cloudllm::provider::ChatProvider)
//! can speak (§4.1): chat-completions, responses, and messages.

pub mod chat_completions;
pub mod messages;
pub mod responses;
