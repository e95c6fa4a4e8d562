//! Error types for the governor.
//!
//! `GovernorError` consolidates the error kinds the governor can encounter as
//! a single enum via `thiserror`, the same shape the rest of this project's
//! configuration and IPC layers use. Denials, unknown leases and expirations
//! are *not* represented here — per the protocol design those are ordinary
//! return values (`AcquireOutcome`, `ReleaseOutcome`), not error paths. This
//! enum covers the kinds that are genuine failures: bad configuration, a
//! probe that can't read host memory, a malformed wire message, an IPC
//! endpoint that can't be bound or reached, and the two shim-side tool
//! failures.

use thiserror::Error;

/// Convenience alias for results using the governor's error type.
pub type GovResult<T> = std::result::Result<T, GovernorError>;

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("configuration is invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("failed to load configuration: {0}")]
    Config(#[from] figment::Error),

    #[error("memory probe unavailable: {0}")]
    MemoryProbeUnavailable(String),

    #[error("malformed protocol message: {0}")]
    ProtocolMalformed(String),

    #[error("IPC endpoint unavailable: {0}")]
    IpcUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("real tool '{0}' could not be located")]
    ToolNotFound(String),

    #[error("failed to spawn child process: {0}")]
    ChildSpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_invalid_message_contains_detail() {
        let err = GovernorError::ConfigurationInvalid("hard_stop_ratio <= soft_stop_ratio".into());
        assert!(err.to_string().contains("hard_stop_ratio"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let gov_err: GovernorError = io_err.into();
        assert!(matches!(gov_err, GovernorError::Io(_)));
    }

    #[test]
    fn tool_not_found_names_the_tool() {
        let err = GovernorError::ToolNotFound("cl.exe".into());
        assert!(err.to_string().contains("cl.exe"));
    }
}
