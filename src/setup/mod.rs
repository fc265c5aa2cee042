pub mod preflight;

pub use preflight::{check_capabilities, HostCapabilities};
