//! The instance pool: admission, affinity routing, eviction, shutdown.
//!
//! The slot table and wait queue live behind one mutex; every transition
//! (admission, grant, release, drain) happens under it, so dispatch
//! decisions are serialized. Leased instances move out of their slot for
//! the duration of a request — the lease is the only synchronization an
//! instance needs.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use lg_domain::chat::{assemble_history, ChatHistoryItem};
use lg_domain::config::{Config, ModelConfig};
use lg_domain::{Error, Result};
use lg_runtime::{ChunkSender, InferenceRuntime};

use crate::downloader::Downloader;
use crate::instance::Instance;
use crate::requests::{
    ChatRequest, ChatResult, CompletionRequest, CompletionResult, EmbeddingRequest,
    EmbeddingResult, Payload, Request, Response,
};
use crate::{completion, embedding, turn};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options and status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PoolOptions {
    pub concurrency: usize,
    pub models_dir: Option<PathBuf>,
    pub models: HashMap<String, ModelConfig>,
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.pool.concurrency,
            models_dir: config.pool.models_dir.clone(),
            models: config.models.clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub models: HashMap<String, Vec<SlotStatus>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotStatus {
    pub slot: u64,
    pub state: SlotStateKind,
    pub last_used: DateTime<Utc>,
    /// Hash of the leading warm-history messages, for operator debugging.
    pub fingerprint: Option<String>,
    pub pending_calls: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStateKind {
    Loading,
    Idle,
    Busy,
    Evicting,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internal state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SlotState {
    Loading,
    Idle(Instance),
    Busy,
    Evicting,
}

impl SlotState {
    fn kind(&self) -> SlotStateKind {
        match self {
            SlotState::Loading => SlotStateKind::Loading,
            SlotState::Idle(_) => SlotStateKind::Idle,
            SlotState::Busy => SlotStateKind::Busy,
            SlotState::Evicting => SlotStateKind::Evicting,
        }
    }
}

struct Slot {
    id: u64,
    model: String,
    state: SlotState,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    fingerprint: Option<String>,
    pending_calls: usize,
}

struct Waiter {
    request_id: Uuid,
    model: String,
    tx: oneshot::Sender<Grant>,
}

/// What a queued request receives when the pool has work for it.
enum Grant {
    /// A warm instance, ready to use.
    Ready { slot_id: u64, instance: Instance },
    /// A reserved slot; the receiver drives the spawn.
    Spawn { slot_id: u64 },
    /// Another model's instance to dispose, then spawn into its slot.
    Evict { slot_id: u64, old: Instance },
}

struct PoolState {
    slots: HashMap<u64, Slot>,
    queue: VecDeque<Waiter>,
    next_slot_id: u64,
    draining: bool,
    in_flight: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Pool {
    runtime: Arc<dyn InferenceRuntime>,
    downloader: Downloader,
    concurrency: usize,
    models_dir: PathBuf,
    models: HashMap<String, Arc<ModelConfig>>,
    state: Mutex<PoolState>,
    /// Abort tokens of queued and in-flight requests, for dispose fan-out.
    aborts: Mutex<HashMap<Uuid, CancellationToken>>,
    drained: Notify,
}

impl Pool {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, options: PoolOptions) -> Result<Self> {
        let models_dir = options.models_dir.unwrap_or_else(default_models_dir);
        std::fs::create_dir_all(&models_dir)?;
        tracing::info!(
            concurrency = options.concurrency,
            models = options.models.len(),
            models_dir = %models_dir.display(),
            "pool ready"
        );
        Ok(Self {
            runtime,
            downloader: Downloader::new(),
            concurrency: options.concurrency.max(1),
            models_dir,
            models: options
                .models
                .into_iter()
                .map(|(name, config)| (name, Arc::new(config)))
                .collect(),
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                queue: VecDeque::new(),
                next_slot_id: 0,
                draining: false,
                in_flight: 0,
            }),
            aborts: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        })
    }

    // ── Public request surface ───────────────────────────────────────

    pub async fn request_chat(
        &self,
        model: &str,
        req: ChatRequest,
        on_chunk: Option<ChunkSender>,
        signal: CancellationToken,
    ) -> Result<ChatResult> {
        match self
            .request(Request {
                model: model.to_string(),
                payload: Payload::Chat(req),
                on_chunk,
                signal,
            })
            .await?
        {
            Response::Chat(result) => Ok(result),
            _ => Err(Error::Runtime("unexpected response kind".into())),
        }
    }

    pub async fn request_completion(
        &self,
        model: &str,
        req: CompletionRequest,
        on_chunk: Option<ChunkSender>,
        signal: CancellationToken,
    ) -> Result<CompletionResult> {
        match self
            .request(Request {
                model: model.to_string(),
                payload: Payload::Completion(req),
                on_chunk,
                signal,
            })
            .await?
        {
            Response::Completion(result) => Ok(result),
            _ => Err(Error::Runtime("unexpected response kind".into())),
        }
    }

    pub async fn request_embedding(
        &self,
        model: &str,
        req: EmbeddingRequest,
        signal: CancellationToken,
    ) -> Result<EmbeddingResult> {
        match self
            .request(Request {
                model: model.to_string(),
                payload: Payload::Embedding(req),
                on_chunk: None,
                signal,
            })
            .await?
        {
            Response::Embedding(result) => Ok(result),
            _ => Err(Error::Runtime("unexpected response kind".into())),
        }
    }

    /// Serve one request end to end: admission, lease, turn, release.
    pub async fn request(&self, req: Request) -> Result<Response> {
        let Request {
            model,
            payload,
            on_chunk,
            signal,
        } = req;

        let config = self
            .models
            .get(&model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model.clone()))?;
        if let Payload::Chat(chat) = &payload {
            if let Some(grammar) = &chat.grammar {
                if !config.grammars.contains_key(grammar) {
                    return Err(Error::UnknownGrammar(grammar.clone()));
                }
            }
        }

        let request_id = Uuid::new_v4();
        self.aborts.lock().insert(request_id, signal.clone());
        let result = self
            .serve(&model, payload, on_chunk, &signal, request_id)
            .await;
        self.aborts.lock().remove(&request_id);
        result
    }

    /// Snapshot of per-model slot states, queue depth and in-flight count.
    pub fn status(&self) -> PoolStatus {
        let st = self.state.lock();
        let mut models: HashMap<String, Vec<SlotStatus>> = HashMap::new();
        for slot in st.slots.values() {
            models.entry(slot.model.clone()).or_default().push(SlotStatus {
                slot: slot.id,
                state: slot.state.kind(),
                last_used: slot.last_used_at,
                fingerprint: slot.fingerprint.clone(),
                pending_calls: slot.pending_calls,
            });
        }
        for slots in models.values_mut() {
            slots.sort_by_key(|s| s.slot);
        }
        PoolStatus {
            queue_depth: st.queue.len(),
            in_flight: st.in_flight,
            models,
        }
    }

    /// Drain the pool: fail queued requests, abort in-flight ones, and
    /// dispose every instance. Resolves once no slots remain.
    pub async fn dispose(&self) {
        let (waiters, idle_instances) = {
            let mut st = self.state.lock();
            st.draining = true;
            let waiters: Vec<Waiter> = st.queue.drain(..).collect();
            let idle_ids: Vec<u64> = st
                .slots
                .values()
                .filter(|s| matches!(s.state, SlotState::Idle(_)))
                .map(|s| s.id)
                .collect();
            let mut idle = Vec::new();
            for id in idle_ids {
                if let Some(slot) = st.slots.remove(&id) {
                    if let SlotState::Idle(instance) = slot.state {
                        idle.push(instance);
                    }
                }
            }
            (waiters, idle)
        };
        // Dropping a waiter's sender resolves its wait with ShuttingDown.
        drop(waiters);
        drop(idle_instances);

        let tokens: Vec<CancellationToken> = self.aborts.lock().values().cloned().collect();
        for token in tokens {
            token.cancel();
        }

        loop {
            if self.state.lock().slots.is_empty() {
                break;
            }
            self.drained.notified().await;
        }
        tracing::info!("pool drained");
    }

    // ── Serving ──────────────────────────────────────────────────────

    async fn serve(
        &self,
        model: &str,
        payload: Payload,
        on_chunk: Option<ChunkSender>,
        signal: &CancellationToken,
        request_id: Uuid,
    ) -> Result<Response> {
        let affinity: Option<Vec<ChatHistoryItem>> = match &payload {
            Payload::Chat(chat) => Some(assemble_history(&chat.messages)),
            _ => None,
        };

        let (slot_id, mut instance) = self
            .lease(model, affinity.as_deref(), request_id, signal)
            .await?;

        let span = tracing::debug_span!("request", model, slot = slot_id, request = %request_id);
        let result = async {
            match &payload {
                Payload::Chat(chat) => turn::run_chat_turn(
                    &mut instance,
                    chat,
                    affinity.as_deref().unwrap_or(&[]),
                    on_chunk.as_ref(),
                    signal,
                )
                .await
                .map(Response::Chat),
                Payload::Completion(completion_req) => completion::run_completion(
                    &mut instance,
                    completion_req,
                    on_chunk.as_ref(),
                    signal,
                )
                .await
                .map(Response::Completion),
                Payload::Embedding(embedding_req) => {
                    embedding::run_embedding(&mut instance, embedding_req)
                        .await
                        .map(Response::Embedding)
                }
            }
        }
        .instrument(span)
        .await;

        // Mid-generation failures keep the instance unless the adapter
        // reported the context unusable.
        let evict = matches!(&result, Err(Error::ContextUnusable(_)));
        if let Err(e) = &result {
            tracing::warn!(model, error = %e, "request failed");
        }
        self.release(slot_id, instance, evict);
        result
    }

    // ── Admission ────────────────────────────────────────────────────

    async fn lease(
        &self,
        model: &str,
        affinity: Option<&[ChatHistoryItem]>,
        request_id: Uuid,
        signal: &CancellationToken,
    ) -> Result<(u64, Instance)> {
        enum Decision {
            Ready(u64, Instance),
            Spawn(u64),
            Wait(oneshot::Receiver<Grant>),
        }

        let decision = {
            let mut st = self.state.lock();
            if st.draining {
                return Err(Error::ShuttingDown);
            }
            if let Some((slot_id, instance)) = take_idle_slot(&mut st, model, affinity) {
                st.in_flight += 1;
                Decision::Ready(slot_id, instance)
            } else if st.slots.len() < self.concurrency {
                let slot_id = insert_loading_slot(&mut st, model);
                st.in_flight += 1;
                Decision::Spawn(slot_id)
            } else {
                let (tx, rx) = oneshot::channel();
                st.queue.push_back(Waiter {
                    request_id,
                    model: model.to_string(),
                    tx,
                });
                // An idle slot of another model may already be available;
                // the dispatch pass evicts it for the queue head.
                self.dispatch_locked(&mut st);
                Decision::Wait(rx)
            }
        };

        match decision {
            Decision::Ready(slot_id, instance) => Ok((slot_id, instance)),
            Decision::Spawn(slot_id) => self.spawn_for_slot(slot_id, model, signal).await,
            Decision::Wait(mut rx) => {
                tokio::select! {
                    biased;
                    grant = &mut rx => match grant {
                        Ok(grant) => self.accept_grant(grant, model, signal).await,
                        Err(_) => Err(Error::ShuttingDown),
                    },
                    _ = signal.cancelled() => {
                        // Either still queued (remove) or a grant raced the
                        // abort (roll it back).
                        let racing_grant = {
                            let mut st = self.state.lock();
                            let before = st.queue.len();
                            st.queue.retain(|w| w.request_id != request_id);
                            if st.queue.len() == before {
                                rx.try_recv().ok()
                            } else {
                                None
                            }
                        };
                        if let Some(grant) = racing_grant {
                            self.return_grant(grant);
                        }
                        Err(Error::Aborted)
                    }
                }
            }
        }
    }

    async fn accept_grant(
        &self,
        grant: Grant,
        model: &str,
        signal: &CancellationToken,
    ) -> Result<(u64, Instance)> {
        match grant {
            Grant::Ready { slot_id, instance } => Ok((slot_id, instance)),
            Grant::Spawn { slot_id } => self.spawn_for_slot(slot_id, model, signal).await,
            Grant::Evict { slot_id, old } => {
                tracing::info!(
                    slot = slot_id,
                    old_model = %old.model_name(),
                    new_model = model,
                    "evicting instance for queued request"
                );
                drop(old);
                self.spawn_for_slot(slot_id, model, signal).await
            }
        }
    }

    /// Roll back a grant whose request aborted before using it.
    fn return_grant(&self, grant: Grant) {
        let mut st = self.state.lock();
        match grant {
            Grant::Ready { slot_id, instance } => {
                restore_idle(&mut st, slot_id, instance);
            }
            Grant::Spawn { slot_id } => {
                st.slots.remove(&slot_id);
            }
            Grant::Evict { slot_id, old } => {
                // The eviction never happened; the old instance stays warm.
                restore_idle(&mut st, slot_id, old);
            }
        }
        st.in_flight = st.in_flight.saturating_sub(1);
        self.dispatch_locked(&mut st);
    }

    async fn spawn_for_slot(
        &self,
        slot_id: u64,
        model: &str,
        signal: &CancellationToken,
    ) -> Result<(u64, Instance)> {
        {
            let mut st = self.state.lock();
            if let Some(slot) = st.slots.get_mut(&slot_id) {
                slot.model = model.to_string();
                slot.state = SlotState::Loading;
                slot.fingerprint = None;
                slot.pending_calls = 0;
            }
        }

        let config = self
            .models
            .get(model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
        let file = self.resolve_file(&config);

        let spawned = Instance::spawn(
            &self.runtime,
            &self.downloader,
            model,
            &config,
            &file,
            signal,
        )
        .await;

        match spawned {
            Ok(instance) => {
                let draining = {
                    let mut st = self.state.lock();
                    if st.draining {
                        true
                    } else {
                        if let Some(slot) = st.slots.get_mut(&slot_id) {
                            slot.state = SlotState::Busy;
                        }
                        false
                    }
                };
                if draining {
                    self.remove_slot(slot_id);
                    drop(instance);
                    return Err(Error::ShuttingDown);
                }
                Ok((slot_id, instance))
            }
            Err(e) => {
                // Spawn failures leave the slot empty; a later request may
                // retry. Freed capacity can serve the queue.
                tracing::warn!(model, error = %e, "instance spawn failed");
                self.remove_slot(slot_id);
                Err(e)
            }
        }
    }

    fn remove_slot(&self, slot_id: u64) {
        let mut st = self.state.lock();
        st.slots.remove(&slot_id);
        st.in_flight = st.in_flight.saturating_sub(1);
        self.dispatch_locked(&mut st);
        self.drained.notify_one();
    }

    // ── Release and dispatch ─────────────────────────────────────────

    fn release(&self, slot_id: u64, instance: Instance, evict: bool) {
        let mut st = self.state.lock();
        st.in_flight = st.in_flight.saturating_sub(1);

        if st.draining {
            st.slots.remove(&slot_id);
            drop(st);
            drop(instance);
            self.drained.notify_one();
            return;
        }

        if evict {
            tracing::warn!(slot = slot_id, "disposing instance with unusable context");
            st.slots.remove(&slot_id);
            self.dispatch_locked(&mut st);
            drop(st);
            drop(instance);
            return;
        }

        if let Some(slot) = st.slots.get_mut(&slot_id) {
            slot.fingerprint = instance.fingerprint();
            slot.pending_calls = instance.pending_call_count();
            slot.state = SlotState::Idle(instance);
            slot.last_used = Instant::now();
            slot.last_used_at = Utc::now();
        }
        self.dispatch_locked(&mut st);
    }

    /// Match idle slots and free capacity against the wait queue. Runs
    /// under the state lock; grants are delivered synchronously.
    fn dispatch_locked(&self, st: &mut PoolState) {
        if st.draining {
            return;
        }
        loop {
            if st.queue.is_empty() {
                return;
            }

            // 1. Oldest waiter whose model has an idle slot.
            if let Some(pos) = st
                .queue
                .iter()
                .position(|w| pick_idle_lru(st, Some(&w.model)).is_some())
            {
                let waiter = match st.queue.remove(pos) {
                    Some(w) => w,
                    None => continue,
                };
                let Some((slot_id, instance)) = take_idle_slot(st, &waiter.model, None) else {
                    continue;
                };
                st.in_flight += 1;
                if let Err(Grant::Ready { slot_id, instance }) =
                    waiter.tx.send(Grant::Ready { slot_id, instance })
                {
                    // Receiver vanished (request future dropped).
                    restore_idle(st, slot_id, instance);
                    st.in_flight = st.in_flight.saturating_sub(1);
                }
                continue;
            }

            // 2. Freed capacity: reserve a slot and let the waiter spawn.
            if st.slots.len() < self.concurrency {
                let Some(waiter) = st.queue.pop_front() else {
                    return;
                };
                let slot_id = insert_loading_slot(st, &waiter.model);
                st.in_flight += 1;
                if waiter.tx.send(Grant::Spawn { slot_id }).is_err() {
                    st.slots.remove(&slot_id);
                    st.in_flight = st.in_flight.saturating_sub(1);
                }
                continue;
            }

            // 3. No match, no capacity: evict the LRU idle slot (any
            //    model) for the oldest waiter.
            if let Some(slot_id) = pick_idle_lru(st, None) {
                let Some(waiter) = st.queue.pop_front() else {
                    return;
                };
                let Some(old) = take_instance_for_eviction(st, slot_id, &waiter.model) else {
                    st.queue.push_front(waiter);
                    return;
                };
                st.in_flight += 1;
                if let Err(Grant::Evict { slot_id, old }) =
                    waiter.tx.send(Grant::Evict { slot_id, old })
                {
                    restore_idle(st, slot_id, old);
                    st.in_flight = st.in_flight.saturating_sub(1);
                }
                continue;
            }

            // Queue waits for the next release.
            return;
        }
    }

    fn resolve_file(&self, config: &ModelConfig) -> PathBuf {
        if config.file.is_absolute() {
            config.file.clone()
        } else {
            self.models_dir.join(&config.file)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slot-table helpers (all run under the state lock)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Admission routing: take the idle slot of `model` with the best affinity
/// score (ties broken by most recent use), or the least-recently-used idle
/// slot when nothing overlaps.
fn take_idle_slot(
    st: &mut PoolState,
    model: &str,
    affinity: Option<&[ChatHistoryItem]>,
) -> Option<(u64, Instance)> {
    let slot_id = select_idle_slot(st, model, affinity)?;
    let slot = st.slots.get_mut(&slot_id)?;
    match mem::replace(&mut slot.state, SlotState::Busy) {
        SlotState::Idle(instance) => Some((slot_id, instance)),
        other => {
            slot.state = other;
            None
        }
    }
}

fn select_idle_slot(
    st: &PoolState,
    model: &str,
    affinity: Option<&[ChatHistoryItem]>,
) -> Option<u64> {
    let mut best_scored: Option<(usize, Instant, u64)> = None;
    let mut lru: Option<(Instant, u64)> = None;

    for slot in st.slots.values() {
        if slot.model != model {
            continue;
        }
        let SlotState::Idle(instance) = &slot.state else {
            continue;
        };
        let score = affinity
            .map(|incoming| instance.affinity_score(incoming))
            .unwrap_or(0);
        if score >= 1 {
            let candidate = (score, slot.last_used, slot.id);
            if best_scored
                .map(|(s, t, _)| (score, slot.last_used) > (s, t))
                .unwrap_or(true)
            {
                best_scored = Some(candidate);
            }
        }
        if lru
            .map(|(t, _)| slot.last_used < t)
            .unwrap_or(true)
        {
            lru = Some((slot.last_used, slot.id));
        }
    }

    best_scored
        .map(|(_, _, id)| id)
        .or_else(|| lru.map(|(_, id)| id))
}

/// Least-recently-used idle slot, optionally restricted to one model.
fn pick_idle_lru(st: &PoolState, model: Option<&str>) -> Option<u64> {
    st.slots
        .values()
        .filter(|slot| matches!(slot.state, SlotState::Idle(_)))
        .filter(|slot| model.map_or(true, |m| slot.model == m))
        .min_by_key(|slot| slot.last_used)
        .map(|slot| slot.id)
}

fn take_instance_for_eviction(
    st: &mut PoolState,
    slot_id: u64,
    new_model: &str,
) -> Option<Instance> {
    let slot = st.slots.get_mut(&slot_id)?;
    match mem::replace(&mut slot.state, SlotState::Evicting) {
        SlotState::Idle(instance) => {
            slot.model = new_model.to_string();
            slot.fingerprint = None;
            slot.pending_calls = 0;
            Some(instance)
        }
        other => {
            slot.state = other;
            None
        }
    }
}

fn restore_idle(st: &mut PoolState, slot_id: u64, instance: Instance) {
    if let Some(slot) = st.slots.get_mut(&slot_id) {
        slot.model = instance.model_name().to_string();
        slot.fingerprint = instance.fingerprint();
        slot.pending_calls = instance.pending_call_count();
        slot.state = SlotState::Idle(instance);
    }
}

fn insert_loading_slot(st: &mut PoolState, model: &str) -> u64 {
    let slot_id = st.next_slot_id;
    st.next_slot_id += 1;
    st.slots.insert(
        slot_id,
        Slot {
            id: slot_id,
            model: model.to_string(),
            state: SlotState::Loading,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            fingerprint: None,
            pending_calls: 0,
        },
    );
    slot_id
}

fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("llamagate")
        .join("models")
}
