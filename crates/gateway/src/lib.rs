//! HTTP adapters for the llamagate pool.
//!
//! The binary (`llamagate`) wires a backend into [`bootstrap::serve`]; the
//! API modules translate wire requests into pool requests and stream
//! results back out, over JSON or SSE.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
