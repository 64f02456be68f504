//! Executor configuration.

pub mod settings;

pub use settings::{ExecutorConfig, TrivyConfig};
