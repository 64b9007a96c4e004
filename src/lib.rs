// apiflow — Multi-step API workflow engine with templated variables

pub mod action;
pub mod config;
pub mod http;
pub mod logger;
pub mod storage;
pub mod variable;
pub mod workflow;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
