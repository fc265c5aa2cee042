pub mod args;
mod types;

pub use args::{BootModeOpt, Cli, Commands, RunArgs};
