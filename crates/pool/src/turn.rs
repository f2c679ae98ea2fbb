//! Chat turn engine — one API-level request, driven as an explicit state
//! machine across interleaved generation and function-call rounds.
//!
//! States: `Generating` runs one model round; `ResolvingCalls` executes the
//! leading evocable calls host-side and loops back; `SurfacingCalls` hands
//! unresolvable calls to the caller; `Done` commits and returns.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lg_domain::chat::{
    ChatHistoryItem, FunctionCallRef, FunctionCallSegment, ModelSegment, Role,
};
use lg_domain::function::{merge_functions, FunctionMap};
use lg_domain::stream::{FinishReason, Usage};
use lg_domain::{Error, Result};
use lg_runtime::{
    ChatGeneration, ChunkSender, CompiledGrammar, Constraint, ContextShift, EmittedFunctionCall,
    LastEvaluation, StopReason,
};

use crate::instance::{Instance, PendingCall};
use crate::requests::{ChatRequest, ChatResult};

/// Minimum prefix overlap required before the runtime falls back to a
/// context shift instead of resuming the cache.
const MIN_CONTEXT_OVERLAP: f32 = 0.5;
/// Parallel function calls the model may emit per round.
const MAX_PARALLEL_FUNCTION_CALLS: usize = 2;
/// Hard cap on generation rounds within one request.
const MAX_FUNCTION_ROUNDS: usize = 16;

enum TurnState {
    Generating,
    ResolvingCalls {
        calls: Vec<EmittedFunctionCall>,
        remainder: Vec<EmittedFunctionCall>,
    },
    SurfacingCalls(Vec<EmittedFunctionCall>),
    Done(FinishReason),
}

pub(crate) async fn run_chat_turn(
    instance: &mut Instance,
    req: &ChatRequest,
    incoming: &[ChatHistoryItem],
    on_chunk: Option<&ChunkSender>,
    signal: &CancellationToken,
) -> Result<ChatResult> {
    // ── Function set and output constraint ───────────────────────────
    let functions = merge_functions(&instance.config.functions, &req.functions);
    let grammar: Option<CompiledGrammar> = match &req.grammar {
        Some(name) => Some(instance.grammar(name)?.clone()),
        None => None,
    };
    // Grammar wins over functions, by rule rather than accident.
    let use_functions = grammar.is_none() && !functions.is_empty();
    if grammar.is_some() && !functions.is_empty() {
        tracing::debug!("grammar constraint set; ignoring functions for this request");
    }

    // ── History assembly ─────────────────────────────────────────────
    let warm = !req.reset_context && instance.warm_extends(incoming);
    let mut working: Vec<ChatHistoryItem>;
    let mut context_window: Vec<ChatHistoryItem>;
    let mut context_shift: ContextShift;

    if warm {
        working = instance.chat_history.clone();
        match &instance.last_evaluation {
            Some(le) => {
                context_window = le.context_window.clone();
                context_shift = le.context_shift.clone();
            }
            None => {
                context_window = Vec::new();
                context_shift = ContextShift::default();
            }
        }

        // Splice function-result messages against the pending-call table.
        for msg in req.messages.iter().filter(|m| m.role == Role::Function) {
            let Some(call_id) = msg.call_id.as_deref() else {
                tracing::warn!("function result without call_id; dropping");
                continue;
            };
            match instance.pending_calls.remove(call_id) {
                Some(pending) => {
                    let result = parse_result(&msg.content);
                    let raw = instance.context.render_function_result(
                        &pending.name,
                        &pending.params,
                        &result,
                    );
                    let segment = FunctionCallSegment {
                        name: pending.name,
                        description: pending.description,
                        params: pending.params,
                        result: Some(result),
                        raw: Some(raw),
                    };
                    append_call_segment(&mut working, &mut context_window, segment);
                }
                None => {
                    tracing::warn!(
                        call_id,
                        "function result does not match a pending call; dropping"
                    );
                }
            }
        }

        if let Some(last) = req.messages.last() {
            if last.role == Role::User {
                working.push(ChatHistoryItem::User {
                    text: last.content.clone(),
                });
            }
        }
    } else {
        instance.reset_chat().await?;
        for msg in req.messages.iter().filter(|m| m.role == Role::Function) {
            tracing::warn!(
                call_id = msg.call_id.as_deref().unwrap_or("?"),
                "function result on a fresh context has no pending call; dropping"
            );
        }
        working = incoming.to_vec();
        context_window = Vec::new();
        context_shift = ContextShift::default();
    }

    // Generation writes into a trailing model item.
    if !matches!(working.last(), Some(ChatHistoryItem::Model { .. })) {
        working.push(ChatHistoryItem::model_placeholder());
    }

    // ── Generation loop ──────────────────────────────────────────────
    let meter_before = instance.context.token_meter();
    let mut state = TurnState::Generating;
    let mut rounds = 0usize;
    let mut surfaced: Vec<FunctionCallRef> = Vec::new();
    let finish;

    loop {
        state = match state {
            TurnState::Generating => {
                rounds += 1;
                if rounds > MAX_FUNCTION_ROUNDS {
                    tracing::warn!(
                        limit = MAX_FUNCTION_ROUNDS,
                        "function-call round limit reached"
                    );
                    state = TurnState::Done(FinishReason::Error);
                    continue;
                }
                let constraint = if let Some(g) = &grammar {
                    Constraint::Grammar(g)
                } else if use_functions {
                    Constraint::Functions {
                        defs: &functions,
                        document_params: true,
                        max_parallel: MAX_PARALLEL_FUNCTION_CALLS,
                    }
                } else {
                    Constraint::None
                };
                let cache_hint = if context_window.is_empty() {
                    None
                } else {
                    Some(context_window.as_slice())
                };

                let out = match instance
                    .context
                    .generate_chat(ChatGeneration {
                        history: &working,
                        sampling: &req.sampling,
                        token_bias: &req.token_bias,
                        stop_triggers: &req.stop_triggers,
                        constraint,
                        last_context_window: cache_hint,
                        context_shift: &context_shift,
                        minimum_overlap_ratio: MIN_CONTEXT_OVERLAP,
                        trim_whitespace_suffix: false,
                        stop_on_abort: true,
                        on_chunk,
                        signal,
                    })
                    .await
                {
                    Ok(out) => out,
                    // A mid-stream failure still resolves the request:
                    // whatever tokens were streamed have already reached
                    // the caller, and the result reports finish reason
                    // `error`. Other error kinds propagate.
                    Err(Error::Runtime(message)) => {
                        tracing::warn!(
                            error = %message,
                            "generation failed mid-stream; returning partial result"
                        );
                        state = TurnState::Done(FinishReason::Error);
                        continue;
                    }
                    Err(other) => return Err(other),
                };

                if out.stop_reason == StopReason::Abort {
                    // Keep the partial text for the result; the instance
                    // itself reverts to the last successful turn below.
                    working = out.last_evaluation.clean_history;
                    TurnState::Done(FinishReason::Abort)
                } else {
                    let LastEvaluation {
                        clean_history,
                        context_window: cw,
                        context_shift: cs,
                    } = out.last_evaluation;
                    working = clean_history;
                    context_window = cw;
                    context_shift = cs;

                    if out.function_calls.is_empty() {
                        TurnState::Done(map_stop_reason(out.stop_reason))
                    } else {
                        for call in &out.function_calls {
                            if !functions.contains_key(&call.name) {
                                return Err(Error::UndefinedFunction(call.name.clone()));
                            }
                        }
                        let mut calls = out.function_calls;
                        let remainder = calls.split_off(evocable_prefix_len(&calls, &functions));
                        if calls.is_empty() {
                            TurnState::SurfacingCalls(remainder)
                        } else {
                            TurnState::ResolvingCalls { calls, remainder }
                        }
                    }
                }
            }

            TurnState::ResolvingCalls { calls, remainder } => {
                // Run the evocable prefix concurrently; join preserves
                // emission order for the history appends.
                let futures: Vec<_> = calls
                    .iter()
                    .map(|call| {
                        let handler = functions
                            .get(&call.name)
                            .and_then(|def| def.handler.clone());
                        let name = call.name.clone();
                        let params = call.params.clone();
                        async move {
                            match handler {
                                Some(h) => h.call(params).await,
                                None => Err(Error::UndefinedFunction(name)),
                            }
                        }
                    })
                    .collect();
                let results = futures_util::future::join_all(futures).await;

                for (call, result) in calls.iter().zip(results) {
                    let result = result.map_err(|e| Error::FunctionFailed {
                        name: call.name.clone(),
                        message: e.to_string(),
                    })?;
                    let raw =
                        instance
                            .context
                            .render_function_result(&call.name, &call.params, &result);
                    let segment = FunctionCallSegment {
                        name: call.name.clone(),
                        description: call.description.clone().or_else(|| {
                            functions.get(&call.name).map(|d| d.description.clone())
                        }),
                        params: call.params.clone(),
                        result: Some(result),
                        raw: Some(raw),
                    };
                    append_call_segment(&mut working, &mut context_window, segment);
                }

                if remainder.is_empty() {
                    TurnState::Generating
                } else {
                    TurnState::SurfacingCalls(remainder)
                }
            }

            TurnState::SurfacingCalls(calls) => {
                for call in calls {
                    let id = Uuid::new_v4().to_string();
                    instance.pending_calls.insert(
                        id.clone(),
                        PendingCall {
                            name: call.name.clone(),
                            description: call.description.clone(),
                            params: call.params.clone(),
                        },
                    );
                    surfaced.push(FunctionCallRef {
                        id,
                        name: call.name,
                        parameters: call.params,
                    });
                }
                finish = FinishReason::FunctionCall;
                break;
            }

            TurnState::Done(reason) => {
                finish = reason;
                break;
            }
        };
    }

    // ── Commit and account ───────────────────────────────────────────
    let content = match finish {
        FinishReason::FunctionCall => String::new(),
        _ => working
            .last()
            .map(ChatHistoryItem::model_text)
            .unwrap_or_default(),
    };

    if matches!(finish, FinishReason::Abort | FinishReason::Error) {
        // Partial history is discarded: reload the clean history of the
        // prior successful turn. An aborted or errored turn commits
        // nothing, since the sequence state past that point is unknown.
        match &instance.last_evaluation {
            Some(le) => instance.chat_history = le.clean_history.clone(),
            None => instance.chat_history.clear(),
        }
    } else {
        instance.chat_history = working;
        instance.last_evaluation = Some(LastEvaluation {
            clean_history: instance.chat_history.clone(),
            context_window,
            context_shift,
        });
    }

    let meter_after = instance.context.token_meter();
    let usage = Usage::new(
        meter_after.input_tokens.saturating_sub(meter_before.input_tokens) as u32,
        meter_after
            .output_tokens
            .saturating_sub(meter_before.output_tokens) as u32,
    );

    tracing::debug!(
        rounds,
        finish = ?finish,
        surfaced = surfaced.len(),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "chat turn finished"
    );

    Ok(ChatResult {
        content,
        function_calls: surfaced,
        finish_reason: finish,
        usage,
    })
}

/// Length of the longest leading run of evocable calls. The first
/// non-evocable call and everything after it — evocable or not — is
/// surfaced to the caller in emission order.
fn evocable_prefix_len(calls: &[EmittedFunctionCall], functions: &FunctionMap) -> usize {
    calls
        .iter()
        .position(|call| {
            functions
                .get(&call.name)
                .map_or(true, |def| !def.evocable())
        })
        .unwrap_or(calls.len())
}

/// A function-result payload is JSON when it parses, a plain string
/// otherwise.
fn parse_result(content: &str) -> serde_json::Value {
    serde_json::from_str(content).unwrap_or_else(|_| serde_json::Value::String(content.to_string()))
}

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::FunctionCalls => FinishReason::FunctionCall,
        StopReason::StopGenerationTrigger | StopReason::CustomStopTrigger => {
            FinishReason::StopTrigger
        }
        StopReason::MaxTokens => FinishReason::MaxTokens,
        StopReason::EogToken => FinishReason::EogToken,
        StopReason::Abort => FinishReason::Abort,
    }
}

/// Append a resolved call segment into the trailing model item of both the
/// working history and the context-window mirror, so prefix-cache state
/// stays consistent.
fn append_call_segment(
    history: &mut Vec<ChatHistoryItem>,
    context_window: &mut Vec<ChatHistoryItem>,
    segment: FunctionCallSegment,
) {
    push_segment(history, segment.clone());
    push_segment(context_window, segment);
}

fn push_segment(items: &mut Vec<ChatHistoryItem>, segment: FunctionCallSegment) {
    if !matches!(items.last(), Some(ChatHistoryItem::Model { .. })) {
        items.push(ChatHistoryItem::model_placeholder());
    }
    if let Some(ChatHistoryItem::Model { response }) = items.last_mut() {
        response.push(ModelSegment::FunctionCall(segment));
    }
}
