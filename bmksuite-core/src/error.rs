//! Error types for the benchmark suite core.
//!
//! Uses `thiserror` for public API error types. Only the orchestrator raises
//! `SuiteError`, and only at phase boundaries: the end of pre-flight and the
//! end of cleanup. Lower layers convert command failures into sentinel values
//! or exit codes instead of erroring.

use std::path::PathBuf;

/// Top-level error type for the suite.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("Pre-flight checks failed: {}", failed_checks.join("; "))]
    Preflight { failed_checks: Vec<String> },

    #[error("Some benchmarks failed: {}", failed.join(", "))]
    BenchmarkFailure { failed: Vec<String> },

    #[error("All benchmarks failed: {}", failed.join(", "))]
    BenchmarkFullFailure { failed: Vec<String> },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SuiteError {
    /// Process exit code used by the CLI for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            SuiteError::Preflight { .. } => 2,
            SuiteError::BenchmarkFailure { .. } => 3,
            SuiteError::BenchmarkFullFailure { .. } => 4,
            _ => 1,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Configuration section '{section}' not found for benchmark {benchmark}")]
    MissingSection { benchmark: String, section: String },

    #[error("Required parameter(s) not found for benchmark {benchmark}: {}", fields.join(", "))]
    MissingFields {
        benchmark: String,
        fields: Vec<String>,
    },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Raised when the delegated scorer package cannot be installed at the
/// requested version.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to install {package}: exit code {exit_code}")]
    InstallFailed { package: String, exit_code: i32 },

    #[error("Installed version {installed} still differs from requested {requested} after reinstall")]
    VersionMismatch {
        installed: String,
        requested: String,
    },

    #[error("Package {package} still not found after installation")]
    StillMissing { package: String },
}

/// Errors from the message-queue publisher.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Report file does not exist: {path}")]
    MissingReport { path: PathBuf },

    #[error("No valid authentication pair (certificate, key) or (username, password) configured")]
    MissingCredentials,

    #[error("Connection to {server}:{port} failed: {message}")]
    Connection {
        server: String,
        port: u16,
        message: String,
    },

    #[error("TLS setup failed: {message}")]
    Tls { message: String },

    #[error("Broker returned an error frame: {message}")]
    Broker { message: String },

    #[error("Unexpected frame from broker: {command}")]
    UnexpectedFrame { command: String },

    #[error("STOMP protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from exporting run artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Run directory does not exist: {path}")]
    MissingDirectory { path: PathBuf },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Directory traversal error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A type alias for results using the top-level `SuiteError`.
pub type Result<T> = std::result::Result<T, SuiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_preflight() {
        let err = SuiteError::Preflight {
            failed_checks: vec![
                "singularity is not installed in the system".into(),
                "not enough disk space".into(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Pre-flight checks failed: singularity is not installed in the system; not enough disk space"
        );
    }

    #[test]
    fn test_error_display_failures() {
        let err = SuiteError::BenchmarkFailure {
            failed: vec!["db12".into()],
        };
        assert_eq!(err.to_string(), "Some benchmarks failed: db12");

        let err = SuiteError::BenchmarkFullFailure {
            failed: vec!["db12".into(), "hs06".into()],
        };
        assert_eq!(err.to_string(), "All benchmarks failed: db12, hs06");
    }

    #[test]
    fn test_error_display_config() {
        let err = SuiteError::Config(ConfigError::MissingFields {
            benchmark: "spec2017".into(),
            fields: vec!["image".into(), "hepspec_volume".into()],
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Required parameter(s) not found for benchmark spec2017: image, hepspec_volume"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let preflight = SuiteError::Preflight {
            failed_checks: vec![],
        };
        let partial = SuiteError::BenchmarkFailure { failed: vec![] };
        let full = SuiteError::BenchmarkFullFailure { failed: vec![] };
        let io: SuiteError = std::io::Error::other("boom").into();

        assert_eq!(preflight.exit_code(), 2);
        assert_eq!(partial.exit_code(), 3);
        assert_eq!(full.exit_code(), 4);
        assert_eq!(io.exit_code(), 1);
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: SuiteError = serde_err.into();
        assert!(matches!(err, SuiteError::Serialization(_)));
    }

    #[test]
    fn test_install_error_display() {
        let err = InstallError::VersionMismatch {
            installed: "v1.4".into(),
            requested: "v1.5".into(),
        };
        assert_eq!(
            err.to_string(),
            "Installed version v1.4 still differs from requested v1.5 after reinstall"
        );
    }
}
