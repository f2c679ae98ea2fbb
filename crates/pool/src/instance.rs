//! A pool instance: one loaded model, one generation context, and the warm
//! per-conversation state that makes prefix-cache reuse possible.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lg_domain::chat::{assemble_history, ChatHistoryItem};
use lg_domain::config::{ModelConfig, Preload};
use lg_domain::sampling::SamplingParams;
use lg_domain::{Error, Result};
use lg_runtime::{
    ChatGeneration, CompiledGrammar, Constraint, ContextParams, ContextShift, EmbeddingContext,
    InferenceRuntime, LastEvaluation, Model, ModelContext, ModelParams,
};

use crate::downloader::Downloader;

/// Number of leading history items hashed into the affinity fingerprint.
const FINGERPRINT_ITEMS: usize = 8;

/// A call surfaced to the caller, awaiting its function-result message.
/// Entries are bound to this instance and are lost if it is evicted.
#[derive(Debug, Clone)]
pub(crate) struct PendingCall {
    pub name: String,
    pub description: Option<String>,
    pub params: serde_json::Value,
}

pub(crate) struct Instance {
    pub(crate) id: Uuid,
    model_name: String,
    pub(crate) config: Arc<ModelConfig>,
    pub(crate) model: Arc<dyn Model>,
    pub(crate) context: Box<dyn ModelContext>,
    /// Dedicated context for text completions; never shares chat state.
    pub(crate) completion_context: Option<Box<dyn ModelContext>>,
    pub(crate) embedding_context: Option<Box<dyn EmbeddingContext>>,
    grammars: HashMap<String, CompiledGrammar>,
    pub(crate) chat_history: Vec<ChatHistoryItem>,
    pub(crate) last_evaluation: Option<LastEvaluation>,
    pub(crate) pending_calls: HashMap<String, PendingCall>,
}

impl Instance {
    /// Build a fresh instance: fetch the weight file if needed, load the
    /// model, create the generation context, compile configured grammars,
    /// and run the optional preload.
    pub(crate) async fn spawn(
        runtime: &Arc<dyn InferenceRuntime>,
        downloader: &Downloader,
        model_name: &str,
        config: &Arc<ModelConfig>,
        file: &Path,
        signal: &CancellationToken,
    ) -> Result<Instance> {
        downloader
            .ensure_file(file, config.url.as_deref(), signal)
            .await?;

        let model = runtime
            .load_model(
                ModelParams {
                    file,
                    gpu: config.engine.gpu,
                    gpu_layers: config.engine.gpu_layers,
                    mem_lock: config.engine.mem_lock,
                },
                signal,
            )
            .await?;

        let context = model
            .create_context(
                &ContextParams {
                    context_size: config.context_size,
                    seed: None,
                    cpu_threads: config.engine.cpu_threads,
                    batch_size: config.engine.batch_size,
                },
                signal,
            )
            .await?;

        let mut grammars = HashMap::new();
        for (name, source) in &config.grammars {
            grammars.insert(name.clone(), model.compile_grammar(source)?);
        }

        let mut instance = Instance {
            id: Uuid::new_v4(),
            model_name: model_name.to_string(),
            config: config.clone(),
            model,
            context,
            completion_context: None,
            embedding_context: None,
            grammars,
            chat_history: Vec::new(),
            last_evaluation: None,
            pending_calls: HashMap::new(),
        };

        let preload = instance.config.preload.clone();
        if let Some(preload) = preload {
            instance.preload(&preload, signal).await?;
        }

        tracing::info!(
            model = model_name,
            instance = %instance.id,
            grammars = instance.grammars.len(),
            "instance ready"
        );
        Ok(instance)
    }

    /// Evaluate the configured seed messages so matching request prefixes
    /// hit a warm cache from the first real turn.
    async fn preload(&mut self, preload: &Preload, signal: &CancellationToken) -> Result<()> {
        match preload {
            Preload::Messages { messages } => {
                let mut history = assemble_history(messages);
                if !matches!(history.last(), Some(ChatHistoryItem::Model { .. })) {
                    history.push(ChatHistoryItem::model_placeholder());
                }
                let sampling = SamplingParams::default();
                let token_bias = HashMap::new();
                let context_shift = ContextShift::default();
                let out = self
                    .context
                    .generate_chat(ChatGeneration {
                        history: &history,
                        sampling: &sampling,
                        token_bias: &token_bias,
                        stop_triggers: &[],
                        constraint: Constraint::None,
                        last_context_window: None,
                        context_shift: &context_shift,
                        minimum_overlap_ratio: 0.5,
                        trim_whitespace_suffix: false,
                        stop_on_abort: true,
                        on_chunk: None,
                        signal,
                    })
                    .await?;
                self.chat_history = out.last_evaluation.clean_history.clone();
                self.last_evaluation = Some(out.last_evaluation);
                tracing::debug!(
                    model = %self.model_name,
                    items = self.chat_history.len(),
                    "preload evaluated"
                );
            }
            Preload::Prefix { .. } => {
                tracing::debug!(model = %self.model_name, "prefix preload not supported; skipping");
            }
        }
        Ok(())
    }

    pub(crate) fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Discard all warm chat state and start a fresh context sequence.
    pub(crate) async fn reset_chat(&mut self) -> Result<()> {
        self.context.reset().await?;
        self.chat_history.clear();
        self.last_evaluation = None;
        self.pending_calls.clear();
        Ok(())
    }

    pub(crate) fn grammar(&self, name: &str) -> Result<&CompiledGrammar> {
        self.grammars
            .get(name)
            .ok_or_else(|| Error::UnknownGrammar(name.to_string()))
    }

    /// Affinity score: length of the common prefix between this instance's
    /// history and an assembled request history.
    pub(crate) fn affinity_score(&self, incoming: &[ChatHistoryItem]) -> usize {
        lg_domain::chat::common_prefix_len(&self.chat_history, incoming)
    }

    /// Warm-reuse check: everything before this instance's trailing model
    /// item must be a prefix of the incoming history. A weaker overlap
    /// means the conversations diverged and the chat must be reset.
    pub(crate) fn warm_extends(&self, incoming: &[ChatHistoryItem]) -> bool {
        if self.chat_history.is_empty() {
            return false;
        }
        let core = if self
            .chat_history
            .last()
            .map(ChatHistoryItem::is_model)
            .unwrap_or(false)
        {
            self.chat_history.len() - 1
        } else {
            self.chat_history.len()
        };
        lg_domain::chat::common_prefix_len(&self.chat_history[..core], incoming) == core
    }

    /// Hash of the leading history items, shown in status output so
    /// operators can see which conversations are warm where.
    pub(crate) fn fingerprint(&self) -> Option<String> {
        if self.chat_history.is_empty() {
            return None;
        }
        let head = &self.chat_history[..self.chat_history.len().min(FINGERPRINT_ITEMS)];
        let serialized = serde_json::to_vec(head).ok()?;
        let digest = Sha256::digest(&serialized);
        Some(hex::encode(&digest[..6]))
    }

    pub(crate) fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }
}
