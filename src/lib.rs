pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod k8s;
pub mod probe;
pub mod trace;

pub use error::{NodescopeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
