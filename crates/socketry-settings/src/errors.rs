//! Settings errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid JSON, or a field has the wrong type.
    #[error("cannot parse settings file {}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Position and cause of the failure.
        #[source]
        source: serde_json::Error,
    },
    /// A merged value the server cannot run with.
    #[error("invalid setting {field}: {reason}")]
    InvalidField {
        /// Dotted camelCase path, as written in the file.
        field: &'static str,
        /// What the value must satisfy.
        reason: &'static str,
    },
}

/// Settings result.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn read_error_names_path_and_keeps_cause() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/socketry.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "cannot read settings file /etc/socketry.json");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("denied"));
    }

    #[test]
    fn parse_error_reports_position() {
        let source = serde_json::from_str::<serde_json::Value>("{\n  oops").unwrap_err();
        let err = SettingsError::Parse {
            path: PathBuf::from("settings.json"),
            source,
        };
        assert_eq!(err.to_string(), "cannot parse settings file settings.json");
        let cause = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(cause.contains("line 2"), "{cause}");
    }

    #[test]
    fn invalid_field_display() {
        let err = SettingsError::InvalidField {
            field: "heartbeat.tryTimes",
            reason: "must be at least 1",
        };
        assert_eq!(err.to_string(), "invalid setting heartbeat.tryTimes: must be at least 1");
    }
}
