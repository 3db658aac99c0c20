//! Chess analysis server: multiplexes authenticated client sessions onto a
//! dynamically-sized pool of UCI engine subprocesses and turns raw engine
//! output into move suggestions and move-quality classifications.

pub mod adapters;
pub mod auth;
pub mod classify;
pub mod config;
pub mod error;
pub mod eval;
pub mod pool;
pub mod server;
pub mod session;
pub mod suggest;
pub mod uci;

pub use color_eyre::Result;
