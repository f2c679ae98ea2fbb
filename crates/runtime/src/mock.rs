//! Deterministic mock backend for tests and smoke deployments.
//!
//! [`MockRuntime`] serves two roles: with no scripts queued it echoes the
//! last user message (enough to boot the gateway without real weights);
//! with scripts queued, each `generate_chat` call pops the next
//! [`ScriptedGeneration`] from the front of the queue, so tests can specify
//! exact rounds — including function calls — without network access or
//! tensor math. Every generation is recorded for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use lg_domain::chat::{ChatHistoryItem, ModelSegment};
use lg_domain::{Error, Result};

use crate::{
    ChatGeneration, ChatOutput, CompiledGrammar, CompletionGeneration, CompletionOutput,
    Constraint, ContextParams, ContextShift, Embedding, EmbeddingContext, EmittedFunctionCall,
    InferenceRuntime, LastEvaluation, Model, ModelContext, ModelParams, StopReason, StreamChunk,
    Token, TokenMeter,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One pre-scripted generation round.
pub struct ScriptedGeneration {
    /// Text chunks streamed in order.
    pub text: Vec<String>,
    /// Function calls emitted after the text, in emission order.
    pub function_calls: Vec<(String, serde_json::Value)>,
    pub stop_reason: StopReason,
    /// When set, the generation consumes one permit from this gate before
    /// producing anything, so tests can hold an instance busy
    /// deterministically and release it with `add_permits`.
    pub gate: Option<Arc<tokio::sync::Semaphore>>,
    /// When set, the generation fails mid-stream with this message after
    /// its text chunks have been streamed.
    pub fail: Option<String>,
}

impl ScriptedGeneration {
    /// A plain final text reply.
    pub fn reply(text: &str) -> Self {
        Self {
            text: vec![text.to_string()],
            function_calls: Vec::new(),
            stop_reason: StopReason::EogToken,
            gate: None,
            fail: None,
        }
    }

    /// A round that emits function calls (after optional text).
    pub fn calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        Self {
            text: Vec::new(),
            function_calls: calls
                .into_iter()
                .map(|(n, p)| (n.to_string(), p))
                .collect(),
            stop_reason: StopReason::FunctionCalls,
            gate: None,
            fail: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_stop(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = stop_reason;
        self
    }

    pub fn with_failure(mut self, message: &str) -> Self {
        self.fail = Some(message.to_string());
        self
    }
}

/// What one `generate_chat` call looked like, for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedGeneration {
    /// Id of the context that ran the generation (assigned at creation).
    pub context_id: u64,
    pub history: Vec<ChatHistoryItem>,
    /// Whether a previous context window was supplied (prefix-cache reuse).
    pub had_cache_hint: bool,
    pub constraint: RecordedConstraint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedConstraint {
    None,
    Grammar,
    Functions(Vec<String>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<ScriptedGeneration>>,
    completion_scripts: Mutex<VecDeque<String>>,
    generations: Mutex<Vec<RecordedGeneration>>,
    /// Weight files loaded, in load order.
    loads: Mutex<Vec<String>>,
    fail_next_load: Mutex<Option<String>>,
    fail_next_completion: Mutex<Option<String>>,
    next_context_id: AtomicU64,
    active_generations: AtomicUsize,
    max_active_generations: AtomicUsize,
}

/// The scripted mock inference runtime.
#[derive(Clone, Default)]
pub struct MockRuntime {
    shared: Arc<Shared>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next chat generation.
    pub fn push(&self, generation: ScriptedGeneration) {
        self.shared.scripts.lock().push_back(generation);
    }

    /// Queue the next completion text.
    pub fn push_completion(&self, text: &str) {
        self.shared
            .completion_scripts
            .lock()
            .push_back(text.to_string());
    }

    /// Make the next `load_model` call fail with the given message.
    pub fn fail_next_load(&self, message: &str) {
        *self.shared.fail_next_load.lock() = Some(message.to_string());
    }

    /// Make the next `generate_completion` call fail mid-stream.
    pub fn fail_next_completion(&self, message: &str) {
        *self.shared.fail_next_completion.lock() = Some(message.to_string());
    }

    pub fn generations(&self) -> Vec<RecordedGeneration> {
        self.shared.generations.lock().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.shared.loads.lock().clone()
    }

    /// High-water mark of chat generations running at the same time.
    pub fn max_concurrent_generations(&self) -> usize {
        self.shared.max_active_generations.load(Ordering::Acquire)
    }
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    async fn load_model(
        &self,
        params: ModelParams<'_>,
        signal: &CancellationToken,
    ) -> Result<Arc<dyn Model>> {
        if signal.is_cancelled() {
            return Err(Error::Aborted);
        }
        if let Some(message) = self.shared.fail_next_load.lock().take() {
            return Err(Error::Runtime(message));
        }
        self.shared
            .loads
            .lock()
            .push(params.file.to_string_lossy().into_owned());
        Ok(Arc::new(MockModel {
            shared: self.shared.clone(),
        }))
    }
}

struct MockModel {
    shared: Arc<Shared>,
}

#[async_trait]
impl Model for MockModel {
    async fn create_context(
        &self,
        _params: &ContextParams,
        signal: &CancellationToken,
    ) -> Result<Box<dyn ModelContext>> {
        if signal.is_cancelled() {
            return Err(Error::Aborted);
        }
        Ok(Box::new(MockContext {
            shared: self.shared.clone(),
            id: self.shared.next_context_id.fetch_add(1, Ordering::Relaxed),
            meter: TokenMeter::default(),
        }))
    }

    async fn create_embedding_context(
        &self,
        _params: &ContextParams,
    ) -> Result<Box<dyn EmbeddingContext>> {
        Ok(Box::new(MockEmbeddingContext))
    }

    fn compile_grammar(&self, source: &str) -> Result<CompiledGrammar> {
        Ok(CompiledGrammar::new(Arc::new(source.to_string())))
    }

    fn tokenize(&self, text: &str) -> Vec<Token> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, _)| Token(i as u32))
            .collect()
    }

    fn detokenize(&self, tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|t| format!("<{}>", t.0))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct MockContext {
    shared: Arc<Shared>,
    id: u64,
    meter: TokenMeter,
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn history_words(history: &[ChatHistoryItem]) -> u64 {
    history
        .iter()
        .map(|item| match item {
            ChatHistoryItem::System { text } | ChatHistoryItem::User { text } => word_count(text),
            ChatHistoryItem::Model { response } => response
                .iter()
                .map(|s| match s {
                    ModelSegment::Text(t) => word_count(t),
                    ModelSegment::FunctionCall(_) => 1,
                })
                .sum(),
        })
        .sum()
}

/// Append generated text into the trailing model item, creating one if the
/// history does not end with a model item.
fn append_to_trailing_model(history: &mut Vec<ChatHistoryItem>, text: String) {
    if !matches!(history.last(), Some(ChatHistoryItem::Model { .. })) {
        history.push(ChatHistoryItem::model_placeholder());
    }
    if text.is_empty() {
        return;
    }
    if let Some(ChatHistoryItem::Model { response }) = history.last_mut() {
        response.push(ModelSegment::Text(text));
    }
}

#[async_trait]
impl ModelContext for MockContext {
    async fn generate_chat(&mut self, req: ChatGeneration<'_>) -> Result<ChatOutput> {
        let active = self.shared.active_generations.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared
            .max_active_generations
            .fetch_max(active, Ordering::AcqRel);

        let result = self.generate_chat_inner(req).await;
        self.shared.active_generations.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn generate_completion(
        &mut self,
        req: CompletionGeneration<'_>,
    ) -> Result<CompletionOutput> {
        if req.signal.is_cancelled() {
            return Ok(CompletionOutput {
                text: String::new(),
                stop_reason: StopReason::Abort,
            });
        }
        if let Some(message) = self.shared.fail_next_completion.lock().take() {
            return Err(Error::Runtime(message));
        }
        let text = self
            .shared
            .completion_scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| "mock completion".to_string());
        if let Some(tx) = req.on_chunk {
            let _ = tx
                .send(StreamChunk {
                    tokens: (0..word_count(&text)).map(|i| Token(i as u32)).collect(),
                    text: text.clone(),
                })
                .await;
        }
        self.meter.input_tokens += req.prompt.len() as u64;
        self.meter.output_tokens += word_count(&text);
        Ok(CompletionOutput {
            text,
            stop_reason: StopReason::EogToken,
        })
    }

    fn render_function_result(
        &self,
        name: &str,
        params: &serde_json::Value,
        result: &serde_json::Value,
    ) -> String {
        format!("[{name}({params}) => {result}]")
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn token_meter(&self) -> TokenMeter {
        self.meter
    }
}

impl MockContext {
    async fn generate_chat_inner(&mut self, req: ChatGeneration<'_>) -> Result<ChatOutput> {
        let constraint = match &req.constraint {
            Constraint::None => RecordedConstraint::None,
            Constraint::Grammar(_) => RecordedConstraint::Grammar,
            Constraint::Functions { defs, .. } => {
                let mut names: Vec<String> = defs.keys().cloned().collect();
                names.sort();
                RecordedConstraint::Functions(names)
            }
        };
        self.shared.generations.lock().push(RecordedGeneration {
            context_id: self.id,
            history: req.history.to_vec(),
            had_cache_hint: req.last_context_window.is_some(),
            constraint,
        });

        let script = self
            .shared
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| default_echo(req.history));

        let mut aborted = false;
        if let Some(gate) = &script.gate {
            tokio::select! {
                permit = gate.clone().acquire_owned() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = req.signal.cancelled() => aborted = true,
            }
        }

        let mut emitted = String::new();
        if !aborted {
            for chunk in &script.text {
                if req.signal.is_cancelled() {
                    aborted = true;
                    break;
                }
                if let Some(tx) = req.on_chunk {
                    let _ = tx
                        .send(StreamChunk {
                            tokens: (0..word_count(chunk)).map(|i| Token(i as u32)).collect(),
                            text: chunk.clone(),
                        })
                        .await;
                }
                emitted.push_str(chunk);
            }
        }

        self.meter.input_tokens += history_words(req.history);
        self.meter.output_tokens += word_count(&emitted);

        if !aborted {
            if let Some(message) = &script.fail {
                return Err(Error::Runtime(message.clone()));
            }
        }

        let mut clean_history = req.history.to_vec();
        append_to_trailing_model(&mut clean_history, emitted);

        let (function_calls, stop_reason) = if aborted {
            (Vec::new(), StopReason::Abort)
        } else if script.function_calls.is_empty() {
            (Vec::new(), script.stop_reason)
        } else {
            let calls = script
                .function_calls
                .iter()
                .map(|(name, params)| EmittedFunctionCall {
                    name: name.clone(),
                    description: None,
                    params: params.clone(),
                    raw: format!("{name}({params})"),
                })
                .collect();
            (calls, StopReason::FunctionCalls)
        };

        Ok(ChatOutput {
            function_calls,
            last_evaluation: LastEvaluation {
                clean_history: clean_history.clone(),
                context_window: clean_history,
                context_shift: ContextShift::new(Arc::new(())),
            },
            stop_reason,
        })
    }
}

/// Fallback behavior with no script queued: echo the last user message.
fn default_echo(history: &[ChatHistoryItem]) -> ScriptedGeneration {
    let last_user = history
        .iter()
        .rev()
        .find_map(|item| match item {
            ChatHistoryItem::User { text } => Some(text.as_str()),
            _ => None,
        })
        .unwrap_or("[no input]");
    ScriptedGeneration::reply(&format!("echo: {last_user}"))
}

struct MockEmbeddingContext;

#[async_trait]
impl EmbeddingContext for MockEmbeddingContext {
    async fn embed(&mut self, text: &str) -> Result<Embedding> {
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 8] += byte as f32 / 255.0;
        }
        Ok(Embedding {
            vector,
            input_tokens: word_count(text) as u32,
        })
    }
}
