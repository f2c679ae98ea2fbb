use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use lg_domain::chat::{ChatMessage, FunctionCallRef};
use lg_domain::function::FunctionMap;
use lg_domain::sampling::SamplingParams;
use lg_domain::stream::{FinishReason, Usage};
use lg_runtime::ChunkSender;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One pool request: a target model, a typed payload, optional streaming,
/// and an abort signal that is honored at every stage (queue wait, spawn,
/// generation).
pub struct Request {
    pub model: String,
    pub payload: Payload,
    pub on_chunk: Option<ChunkSender>,
    pub signal: CancellationToken,
}

pub enum Payload {
    Chat(ChatRequest),
    Completion(CompletionRequest),
    Embedding(EmbeddingRequest),
}

#[derive(Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    /// Name of a grammar configured on the model. When set, any function
    /// definitions are ignored for this request (grammar wins).
    pub grammar: Option<String>,
    /// Request-level function definitions; override model-level ones by
    /// name. Definitions arriving over the wire carry no handlers.
    pub functions: FunctionMap,
    pub stop_triggers: Vec<String>,
    pub token_bias: HashMap<String, f32>,
    /// Force a fresh context sequence even when the message prefix matches
    /// the instance's warm history.
    pub reset_context: bool,
}

#[derive(Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub sampling: SamplingParams,
    pub stop_triggers: Vec<String>,
    /// Context overrides. Any of these forces a fresh completion context.
    pub cpu_threads: Option<u32>,
    pub batch_size: Option<u32>,
}

#[derive(Default)]
pub struct EmbeddingRequest {
    /// Heterogeneous inputs; non-strings are dropped silently.
    pub inputs: Vec<serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum Response {
    Chat(ChatResult),
    Completion(CompletionResult),
    Embedding(EmbeddingResult),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatResult {
    /// Concatenated text of the final model response. Empty when calls
    /// were surfaced.
    pub content: String,
    /// Calls awaiting caller-side resolution, in emission order.
    pub function_calls: Vec<FunctionCallRef>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CompletionResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Usage,
}
