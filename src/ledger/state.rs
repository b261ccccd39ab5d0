//! Submission lifecycle states and their transition table

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    Received,
    Validating,
    Valid,
    Invalid,
    Encrypting,
    Encrypted,
    Uploading,
    Uploaded,
    Reported,
    Archived,
    Error,
}

impl SubmissionState {
    pub const ALL: [SubmissionState; 11] = [
        Self::Received,
        Self::Validating,
        Self::Valid,
        Self::Invalid,
        Self::Encrypting,
        Self::Encrypted,
        Self::Uploading,
        Self::Uploaded,
        Self::Reported,
        Self::Archived,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Encrypting => "encrypting",
            Self::Encrypted => "encrypted",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Reported => "reported",
            Self::Archived => "archived",
            Self::Error => "error",
        }
    }

    /// States reachable by a regular append
    ///
    /// Leaving `Error` is not a regular append; it goes through recovery.
    pub fn successors(&self) -> &'static [SubmissionState] {
        use SubmissionState::*;
        match self {
            Received => &[Validating, Error],
            Validating => &[Valid, Invalid, Error],
            Valid => &[Encrypting, Error],
            Encrypting => &[Encrypted, Error],
            Encrypted => &[Uploading, Error],
            Uploading => &[Uploaded, Error],
            Uploaded => &[Reported, Error],
            Reported => &[Archived, Error],
            Invalid | Archived | Error => &[],
        }
    }

    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Archived)
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown submission state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_linear() {
        use SubmissionState::*;
        let path = [
            Received, Validating, Valid, Encrypting, Encrypted, Uploading, Uploaded, Reported, Archived,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Received.can_transition_to(Encrypting));
        assert!(!Uploaded.can_transition_to(Uploading));
    }

    #[test]
    fn test_error_reachable_from_non_terminal_only() {
        for state in SubmissionState::ALL {
            let expected = !state.is_terminal() && state != SubmissionState::Error;
            assert_eq!(state.can_transition_to(SubmissionState::Error), expected, "{}", state);
        }
        assert!(SubmissionState::Error.successors().is_empty());
    }

    #[test]
    fn test_parse_round_trips() {
        for state in SubmissionState::ALL {
            assert_eq!(state.as_str().parse::<SubmissionState>().unwrap(), state);
        }
        assert_eq!("Uploaded".parse::<SubmissionState>().unwrap(), SubmissionState::Uploaded);
        assert!("finished".parse::<SubmissionState>().is_err());
    }
}
