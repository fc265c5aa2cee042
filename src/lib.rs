pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod exec;
pub mod network;
pub mod paths;
pub mod qemu;
pub mod setup;

// Re-export core types for convenience
pub use config::RuntimeConfig;
pub use error::LaunchError;
