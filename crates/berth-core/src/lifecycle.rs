use crate::CoreError;
use std::fmt;

/// Lifecycle of the managed engine daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    NotInstalled,
    Installing,
    Stopped,
    Starting,
    Running,
    Failed(String),
}

impl DaemonState {
    /// Initial state derived from what is on disk.
    pub fn observe(binaries_ready: bool) -> Self {
        if binaries_ready {
            Self::Stopped
        } else {
            Self::NotInstalled
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstalled => f.write_str("not_installed"),
            Self::Installing => f.write_str("installing"),
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

pub fn validate_transition(from: &DaemonState, to: &DaemonState) -> Result<(), CoreError> {
    use DaemonState::{Failed, Installing, NotInstalled, Running, Starting, Stopped};

    let valid = from == to
        || matches!(
            (from, to),
            (NotInstalled | Stopped | Failed(_), Installing)
                | (Installing, Stopped | Failed(_))
                | (Stopped | Failed(_), Starting)
                | (Starting, Running | Failed(_) | Stopped)
                // an engine we did not start may already answer
                | (NotInstalled | Stopped | Failed(_), Running)
                | (Running | Failed(_), Stopped)
                | (Failed(_), Failed(_))
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DaemonState::{Failed, Installing, NotInstalled, Running, Starting, Stopped};

    fn failed() -> DaemonState {
        Failed("boom".to_owned())
    }

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(&NotInstalled, &Installing).is_ok());
        assert!(validate_transition(&Installing, &Stopped).is_ok());
        assert!(validate_transition(&Installing, &failed()).is_ok());
        assert!(validate_transition(&Stopped, &Starting).is_ok());
        assert!(validate_transition(&Starting, &Running).is_ok());
        assert!(validate_transition(&Starting, &failed()).is_ok());
        assert!(validate_transition(&Running, &Stopped).is_ok());
        assert!(validate_transition(&Running, &Running).is_ok()); // repeated ensure
        assert!(validate_transition(&NotInstalled, &Running).is_ok()); // external engine
        assert!(validate_transition(&failed(), &Starting).is_ok());
        assert!(validate_transition(&failed(), &Installing).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(&NotInstalled, &Starting).is_err());
        assert!(validate_transition(&NotInstalled, &Stopped).is_err());
        assert!(validate_transition(&Running, &Starting).is_err());
        assert!(validate_transition(&Running, &Installing).is_err());
        assert!(validate_transition(&Installing, &Running).is_err());
        assert!(validate_transition(&Stopped, &failed()).is_err());
    }

    #[test]
    fn observed_state() {
        assert_eq!(DaemonState::observe(false), NotInstalled);
        assert_eq!(DaemonState::observe(true), Stopped);
        assert_eq!(failed().to_string(), "failed (boom)");
    }

    #[test]
    fn error_names_both_states() {
        let err = validate_transition(&Running, &Installing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition: running -> installing"
        );
    }
}
