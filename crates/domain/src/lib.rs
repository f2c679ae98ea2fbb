//! Shared vocabulary types for the llamagate workspace.
//!
//! Everything here is plain data: no I/O, no async runtime state. The
//! inference adapter, the pool, and the HTTP gateway all speak these types.

pub mod chat;
pub mod config;
pub mod error;
pub mod function;
pub mod sampling;
pub mod stream;

pub use error::{Error, Result};
