//! Error classes for a launch attempt.
//!
//! Functions return `anyhow::Result` and attach `.context()` as they go; the
//! underlying class is one of [`LaunchError`] and can be recovered with
//! `err.downcast_ref::<LaunchError>()` (anyhow looks through context layers).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bad user input, detected before the host is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// The host is not in a state we can work with.
    #[error("environment error: {0}")]
    Environment(String),

    /// Missing capability or device-cgroup restriction.
    #[error("permission error: {0}")]
    Permission(String),

    /// A checked host command exited nonzero.
    #[error("command `{command}` failed with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
}

impl LaunchError {
    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        LaunchError::Config(msg.into()).into()
    }

    pub fn environment(msg: impl Into<String>) -> anyhow::Error {
        LaunchError::Environment(msg.into()).into()
    }

    pub fn permission(msg: impl Into<String>) -> anyhow::Error {
        LaunchError::Permission(msg.into()).into()
    }

    pub fn is_config(&self) -> bool {
        matches!(self, LaunchError::Config(_))
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, LaunchError::Environment(_))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, LaunchError::Permission(_))
    }
}

/// Returns the launch error class carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&LaunchError> {
    err.downcast_ref::<LaunchError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Result<()> = Err(LaunchError::config("bad cidr"));
        let err = err.context("parsing --network").unwrap_err();

        let class = classify(&err).expect("class survives context");
        assert!(class.is_config());
        assert!(format!("{:#}", err).contains("bad cidr"));
    }

    #[test]
    fn test_command_error_message() {
        let err = LaunchError::Command {
            command: "ip link add dev br0 type bridge".to_string(),
            status: 2,
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ip link add dev br0"));
        assert!(msg.contains("status 2"));
    }
}
