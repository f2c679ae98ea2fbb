//! Inference runtime adapter — the opaque facade over the LLM engine.
//!
//! The pool treats everything behind these traits as a capability: load a
//! model, create contexts, generate, embed, tokenize, dispose. Tensor math,
//! tokenizers, and GPU scheduling live entirely on the adapter side.
//!
//! The trait chain mirrors resource ownership: an [`InferenceRuntime`]
//! loads [`Model`]s, a model creates [`ModelContext`]s (one decoding
//! sequence each) and [`EmbeddingContext`]s. Dropping a handle disposes
//! the underlying resource.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lg_domain::Result;

pub mod mock;
mod types;

pub use types::*;

#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Load model weights from disk. Honors `signal` for cancellation
    /// while the load is in flight.
    async fn load_model(
        &self,
        params: ModelParams<'_>,
        signal: &CancellationToken,
    ) -> Result<Arc<dyn Model>>;
}

#[async_trait]
pub trait Model: Send + Sync {
    /// Create a generation context with a single decoding sequence.
    async fn create_context(
        &self,
        params: &ContextParams,
        signal: &CancellationToken,
    ) -> Result<Box<dyn ModelContext>>;

    async fn create_embedding_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn EmbeddingContext>>;

    /// Compile a grammar for use as a generation constraint. The result is
    /// immutable and reusable for the lifetime of the model.
    fn compile_grammar(&self, source: &str) -> Result<CompiledGrammar>;

    fn tokenize(&self, text: &str) -> Vec<Token>;

    fn detokenize(&self, tokens: &[Token]) -> String;
}

/// One loaded context bound to one sequence. Callers must serialize
/// generations per context; `&mut self` enforces it statically.
#[async_trait]
pub trait ModelContext: Send {
    /// Run one chat generation round. When `last_context_window` and the
    /// context-shift handle come from this context's previous output, the
    /// adapter must resume the prefix KV cache rather than re-ingesting
    /// shared history.
    async fn generate_chat(&mut self, req: ChatGeneration<'_>) -> Result<ChatOutput>;

    async fn generate_completion(&mut self, req: CompletionGeneration<'_>)
        -> Result<CompletionOutput>;

    /// Render a function result in the model's native function-call
    /// syntax, as it would appear inside the model's own output.
    fn render_function_result(
        &self,
        name: &str,
        params: &serde_json::Value,
        result: &serde_json::Value,
    ) -> String;

    /// Discard the chat state and start a fresh sequence. Cumulative token
    /// counters are preserved.
    async fn reset(&mut self) -> Result<()>;

    /// Cumulative input/output token counters for this context's sequence.
    fn token_meter(&self) -> TokenMeter;
}

#[async_trait]
pub trait EmbeddingContext: Send {
    async fn embed(&mut self, text: &str) -> Result<Embedding>;
}
