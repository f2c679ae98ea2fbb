use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lg_domain::chat::ChatHistoryItem;
use lg_domain::config::GpuMode;
use lg_domain::function::FunctionMap;
use lg_domain::sampling::SamplingParams;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokens and streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single token id in the model's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u32);

/// One streamed generation chunk: the emitted tokens and their detokenized
/// text. Delivered in model emission order.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub tokens: Vec<Token>,
    pub text: String,
}

pub type ChunkSender = tokio::sync::mpsc::Sender<StreamChunk>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Opaque adapter handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapter-defined context-shift metadata. The core threads it back into
/// the next generation call and never inspects it.
#[derive(Clone, Default)]
pub struct ContextShift(Option<Arc<dyn Any + Send + Sync>>);

impl ContextShift {
    pub fn new(handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(handle))
    }

    pub fn handle(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.0.as_ref()
    }
}

impl fmt::Debug for ContextShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "ContextShift(opaque)"
        } else {
            "ContextShift(none)"
        })
    }
}

/// A grammar compiled by the adapter, reusable across generations on the
/// model that compiled it. Immutable once created.
#[derive(Clone)]
pub struct CompiledGrammar(Arc<dyn Any + Send + Sync>);

impl CompiledGrammar {
    pub fn new(handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self(handle)
    }

    pub fn handle(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.0
    }
}

impl fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledGrammar(opaque)")
    }
}

/// Everything the adapter needs to resume the prefix KV cache on the next
/// generation without re-ingesting shared history.
#[derive(Debug, Clone)]
pub struct LastEvaluation {
    /// The canonical history after the generation, with any aborted or
    /// superseded suffix removed.
    pub clean_history: Vec<ChatHistoryItem>,
    /// The history slice currently materialized in the context window.
    pub context_window: Vec<ChatHistoryItem>,
    /// Opaque context-shift metadata owned by the adapter.
    pub context_shift: ContextShift,
}

/// Cumulative token counters for one context sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenMeter {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generation requests and outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the runtime stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EogToken,
    MaxTokens,
    FunctionCalls,
    StopGenerationTrigger,
    CustomStopTrigger,
    Abort,
}

/// A function call emitted by the model during generation, in emission
/// order.
#[derive(Debug, Clone)]
pub struct EmittedFunctionCall {
    pub name: String,
    pub description: Option<String>,
    pub params: serde_json::Value,
    /// The call in the model's native function-call syntax.
    pub raw: String,
}

/// Output constraint for one chat generation. Grammar and functions are
/// mutually exclusive by construction.
pub enum Constraint<'a> {
    None,
    Grammar(&'a CompiledGrammar),
    Functions {
        defs: &'a FunctionMap,
        document_params: bool,
        max_parallel: usize,
    },
}

pub struct ChatGeneration<'a> {
    pub history: &'a [ChatHistoryItem],
    pub sampling: &'a SamplingParams,
    pub token_bias: &'a HashMap<String, f32>,
    pub stop_triggers: &'a [String],
    pub constraint: Constraint<'a>,
    /// Context window of the previous evaluation, as an overlap hint.
    pub last_context_window: Option<&'a [ChatHistoryItem]>,
    pub context_shift: &'a ContextShift,
    /// Minimum prefix overlap (0..1) required to resume the cache instead
    /// of shifting the context.
    pub minimum_overlap_ratio: f32,
    pub trim_whitespace_suffix: bool,
    pub stop_on_abort: bool,
    pub on_chunk: Option<&'a ChunkSender>,
    pub signal: &'a CancellationToken,
}

pub struct ChatOutput {
    /// Calls the model emitted this round; empty when the response is final.
    pub function_calls: Vec<EmittedFunctionCall>,
    pub last_evaluation: LastEvaluation,
    pub stop_reason: StopReason,
}

pub struct CompletionGeneration<'a> {
    pub prompt: &'a [Token],
    pub sampling: &'a SamplingParams,
    pub stop_triggers: &'a [String],
    pub on_chunk: Option<&'a ChunkSender>,
    pub signal: &'a CancellationToken,
}

pub struct CompletionOutput {
    pub text: String,
    pub stop_reason: StopReason,
}

/// One embedding vector plus the tokens consumed producing it.
pub struct Embedding {
    pub vector: Vec<f32>,
    pub input_tokens: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Creation parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ModelParams<'a> {
    pub file: &'a Path,
    pub gpu: GpuMode,
    pub gpu_layers: Option<u32>,
    pub mem_lock: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContextParams {
    pub context_size: u32,
    pub seed: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub batch_size: Option<u32>,
}
