//! Gateway mediating between untrusted tool callers and an in-process
//! editor plugin: frames requests off a TCP listener, runs them through
//! policy/dedup/audit, and forwards surviving calls to the editor's own
//! TCP session or a local tool.

pub mod audit;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod recipe;
pub mod server;
pub mod session;
pub mod subprocess;

pub use error::{Error, Result};
