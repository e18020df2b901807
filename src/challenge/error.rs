use reqwest::StatusCode;
use thiserror::Error;

/// Which use of the birthdate endpoint produced an unexpected status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStage {
    /// The first submission that may trigger a challenge.
    Initial,
    /// The resubmission after the challenge was completed.
    Confirmation,
}

/// Which call to the challenge continuation endpoint was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStage {
    Continue,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    #[error("Missing required fields")]
    Validation,

    #[error("Failed to get CSRF token. Make sure your cookie is valid.")]
    Auth,

    #[error("{}", upstream_message(.stage, .status))]
    Upstream {
        stage: MutationStage,
        status: StatusCode,
        body: String,
    },

    #[error("{0}")]
    Protocol(String),

    #[error("{}", challenge_message(.stage, .status))]
    Challenge {
        stage: ChallengeStage,
        status: StatusCode,
        body: String,
    },

    #[error("Password verification failed: {0}")]
    Verification(String),

    #[error("{0}")]
    Internal(String),
}

fn upstream_message(stage: &MutationStage, status: &StatusCode) -> String {
    match stage {
        MutationStage::Initial => {
            format!("Unexpected response from Roblox: {}", status.as_u16())
        }
        MutationStage::Confirmation => {
            format!("Birthdate change was not confirmed: {}", status.as_u16())
        }
    }
}

fn challenge_message(stage: &ChallengeStage, status: &StatusCode) -> String {
    match stage {
        ChallengeStage::Continue => format!("Challenge continue failed: {}", status.as_u16()),
        ChallengeStage::Complete => format!("Final challenge failed: {}", status.as_u16()),
    }
}

impl ChallengeError {
    /// Stable tag exposed to API callers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Auth => "auth_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Protocol(_) => "protocol_error",
            Self::Challenge { .. } => "challenge_error",
            Self::Verification(_) => "verification_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Raw upstream body, when the failure carried one.
    #[must_use]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Upstream { body, .. } | Self::Challenge { body, .. } if !body.is_empty() => {
                Some(body.as_str())
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for ChallengeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Internal(format!("Upstream request failed: {err}"))
    }
}
