//! Text completion — no chat state, no function machinery.
//!
//! Completions run on a dedicated context owned by the instance. A request
//! carrying `seed`, `cpu_threads`, or `batch_size` overrides gets a freshly
//! created context; otherwise the existing one is cleared and reused. The
//! instance's chat history and `last_evaluation` are never touched.

use tokio_util::sync::CancellationToken;

use lg_domain::stream::{FinishReason, Usage};
use lg_domain::{Error, Result};
use lg_runtime::{ChunkSender, CompletionGeneration, ContextParams};

use crate::instance::Instance;
use crate::requests::{CompletionRequest, CompletionResult};

pub(crate) async fn run_completion(
    instance: &mut Instance,
    req: &CompletionRequest,
    on_chunk: Option<&ChunkSender>,
    signal: &CancellationToken,
) -> Result<CompletionResult> {
    let sampling = req
        .sampling
        .merged_with(&instance.config.completion_defaults);

    let needs_fresh =
        sampling.seed.is_some() || req.cpu_threads.is_some() || req.batch_size.is_some();

    if needs_fresh || instance.completion_context.is_none() {
        let params = ContextParams {
            context_size: instance.config.context_size,
            seed: sampling.seed,
            cpu_threads: req.cpu_threads.or(instance.config.engine.cpu_threads),
            batch_size: req.batch_size.or(instance.config.engine.batch_size),
        };
        let context = instance.model.create_context(&params, signal).await?;
        instance.completion_context = Some(context);
    } else if let Some(context) = instance.completion_context.as_mut() {
        context.reset().await?;
    }

    let Some(context) = instance.completion_context.as_mut() else {
        return Err(Error::ContextCreation(
            "completion context unavailable".into(),
        ));
    };

    let prompt = instance.model.tokenize(&req.prompt);
    let meter_before = context.token_meter();
    let out = match context
        .generate_completion(CompletionGeneration {
            prompt: &prompt,
            sampling: &sampling,
            stop_triggers: &req.stop_triggers,
            on_chunk,
            signal,
        })
        .await
    {
        Ok(out) => Some(out),
        // Mid-stream failures resolve the request with finish reason
        // `error`; streamed tokens have already reached the caller.
        Err(Error::Runtime(message)) => {
            tracing::warn!(
                error = %message,
                "completion failed mid-stream; returning partial result"
            );
            None
        }
        Err(other) => return Err(other),
    };
    let meter_after = context.token_meter();

    let (text, finish_reason) = match out {
        Some(out) => {
            let finish_reason = match out.stop_reason {
                lg_runtime::StopReason::Abort => FinishReason::Abort,
                lg_runtime::StopReason::MaxTokens => FinishReason::MaxTokens,
                lg_runtime::StopReason::StopGenerationTrigger
                | lg_runtime::StopReason::CustomStopTrigger => FinishReason::StopTrigger,
                _ => FinishReason::EogToken,
            };
            (out.text, finish_reason)
        }
        None => (String::new(), FinishReason::Error),
    };

    Ok(CompletionResult {
        text,
        finish_reason,
        usage: Usage::new(
            meter_after.input_tokens.saturating_sub(meter_before.input_tokens) as u32,
            meter_after
                .output_tokens
                .saturating_sub(meter_before.output_tokens) as u32,
        ),
    })
}
