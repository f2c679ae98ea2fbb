//! The llamagate core: a bounded pool of warm model instances, the chat
//! turn engine, the text-completion and embedding paths, and the weight
//! downloader.
//!
//! Requests target a model by name; the pool routes each one to an
//! instance that minimizes re-ingestion of prompt tokens, spawning,
//! queueing, or evicting as capacity allows.

mod completion;
mod downloader;
mod embedding;
mod instance;
mod pool;
mod requests;
mod turn;

pub use downloader::Downloader;
pub use pool::{Pool, PoolOptions, PoolStatus, SlotStateKind, SlotStatus};
pub use requests::{
    ChatRequest, ChatResult, CompletionRequest, CompletionResult, EmbeddingRequest,
    EmbeddingResult, Payload, Request, Response,
};
