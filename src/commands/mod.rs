pub mod run;

pub use run::{cmd_run, LaunchOutcome, LaunchPlan, LaunchStage, Launcher, NetworkSummary};
