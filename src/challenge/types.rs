use super::error::ChallengeError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub const SESSION_COOKIE_PREFIX: &str = ".ROBLOSECURITY=";

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDate {
    pub month: u32,
    pub day: u32,
    pub year: u32,
}

/// Unvalidated input as received from a caller.
#[derive(Clone, Copy, Default)]
pub struct ChangeForm<'a> {
    pub credential: Option<&'a str>,
    pub password: Option<&'a str>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub year: Option<u32>,
}

/// A single birthdate change, alive only for one `execute` call.
#[derive(Debug)]
pub struct ChangeRequest {
    credential: SecretString,
    password: SecretString,
    date: TargetDate,
}

impl ChangeRequest {
    /// Build a request after checking every field is present and non-empty.
    ///
    /// # Errors
    /// Returns `ChallengeError::Validation` if any of the five fields is missing, blank or zero.
    pub fn validate(form: &ChangeForm<'_>) -> Result<Self, ChallengeError> {
        let credential = non_empty(form.credential)?;
        let password = non_empty(form.password)?;
        let month = non_zero(form.month)?;
        let day = non_zero(form.day)?;
        let year = non_zero(form.year)?;

        Ok(Self {
            credential: SecretString::from(normalize_credential(credential)),
            password: SecretString::from(password.to_string()),
            date: TargetDate { month, day, year },
        })
    }

    /// Value for the `Cookie` header, always carrying the session cookie name.
    #[must_use]
    pub fn cookie(&self) -> &str {
        self.credential.expose_secret()
    }

    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    #[must_use]
    pub const fn date(&self) -> TargetDate {
        self.date
    }
}

fn non_empty(value: Option<&str>) -> Result<&str, ChallengeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ChallengeError::Validation),
    }
}

fn non_zero(value: Option<u32>) -> Result<u32, ChallengeError> {
    match value {
        Some(v) if v != 0 => Ok(v),
        _ => Err(ChallengeError::Validation),
    }
}

fn normalize_credential(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(SESSION_COOKIE_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{SESSION_COOKIE_PREFIX}{trimmed}")
    }
}

/// Ordered, append-only record of what the orchestrator did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StepLog(Vec<String>);

impl StepLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.0.push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<String> {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Each field is written by exactly one step and read by a later one.
#[derive(Debug, Default)]
pub(crate) struct ChallengeContext {
    pub csrf_token: Option<String>,
    pub challenge_id: Option<String>,
    pub challenge_type: Option<String>,
    pub challenge_metadata: Option<String>,
    pub continued_id: Option<String>,
    pub continued_type: Option<String>,
    pub continued_metadata: Option<Map<String, Value>>,
    pub user_id: Option<String>,
    pub inner_challenge_id: Option<String>,
    pub verification_token: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub date: TargetDate,
    /// False when the account accepted the change without a challenge.
    pub challenged: bool,
    pub log: StepLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: ChallengeError,
    pub log: StepLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Applied),
    Failure(Failure),
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn log(&self) -> &StepLog {
        match self {
            Self::Success(applied) => &applied.log,
            Self::Failure(failure) => &failure.log,
        }
    }
}
