//! Error types for PinForge

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum PfError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown switch: {0}")]
    UnknownSwitch(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Driver {driver} is claimed by both {first} and {second}")]
    CoilConflict {
        driver: String,
        first: String,
        second: String,
    },

    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Invalid timeout: {0}")]
    Timeout(String),

    #[error("Request refused: {0}")]
    Refused(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PfError {
    /// True for errors raised while validating a machine configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PfError::Config(_)
                | PfError::UnknownDevice(_)
                | PfError::UnknownSwitch(_)
                | PfError::UnknownDriver(_)
                | PfError::DuplicateName(_)
                | PfError::CoilConflict { .. }
                | PfError::Topology(_)
                | PfError::Timeout(_)
        )
    }
}

/// Result type alias
pub type PfResult<T> = Result<T, PfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_classification() {
        assert!(PfError::Topology("cycle".into()).is_config());
        assert!(
            PfError::CoilConflict {
                driver: "c_eject".into(),
                first: "a".into(),
                second: "b".into(),
            }
            .is_config()
        );
        assert!(!PfError::Refused("ball search running".into()).is_config());
    }

    #[test]
    fn test_display_names_driver() {
        let err = PfError::CoilConflict {
            driver: "c_trough".into(),
            first: "trough".into(),
            second: "lock".into(),
        };
        assert_eq!(
            err.to_string(),
            "Driver c_trough is claimed by both trough and lock"
        );
    }
}
