use super::{
    client::UpstreamClient,
    error::{ChallengeError, ChallengeStage, MutationStage},
    metadata,
    types::{
        Applied, ChallengeContext, ChangeForm, ChangeRequest, Failure, Outcome, StepLog,
    },
};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::{fmt, str::FromStr};
use tracing::{error, info, instrument, warn};

/// Status of a mutation the account accepted without further verification.
pub const IMMEDIATE_SUCCESS: StatusCode = StatusCode::OK;
/// Status reserved by the birthdate endpoint for "challenge required".
pub const VERIFICATION_REQUIRED: StatusCode = StatusCode::FORBIDDEN;
/// `actionType` the two-step service expects for password re-verification.
pub const PASSWORD_ACTION_TYPE: u8 = 7;

pub const CHALLENGE_ID_HEADER: &str = "rblx-challenge-id";
pub const CHALLENGE_TYPE_HEADER: &str = "rblx-challenge-type";
pub const CHALLENGE_METADATA_HEADER: &str = "rblx-challenge-metadata";

/// What happens after the challenge is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Repeat the birthdate submission and require `200`.
    #[default]
    Resubmit,
    /// Treat a completed challenge as proof the change was applied. Unverified.
    AssumeApplied,
}

impl CompletionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resubmit => "resubmit",
            Self::AssumeApplied => "assume-applied",
        }
    }
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resubmit" => Ok(Self::Resubmit),
            "assume-applied" | "assume_applied" => Ok(Self::AssumeApplied),
            other => Err(format!(
                "invalid completion mode '{other}', expected resubmit or assume-applied"
            )),
        }
    }
}

/// Drives the birthdate change sequence against the upstream endpoints.
///
/// Holds no per-request state, so a single instance can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    client: UpstreamClient,
    mode: CompletionMode,
}

impl Orchestrator {
    #[must_use]
    pub const fn new(client: UpstreamClient, mode: CompletionMode) -> Self {
        Self { client, mode }
    }

    #[must_use]
    pub const fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Validate raw input and run the sequence. Invalid input never reaches the network.
    pub async fn submit(&self, form: &ChangeForm<'_>) -> Outcome {
        match ChangeRequest::validate(form) {
            Ok(request) => self.execute(request).await,
            Err(error) => {
                warn!("Rejected change request: {}", error);
                Outcome::Failure(Failure {
                    error,
                    log: StepLog::new(),
                })
            }
        }
    }

    /// Run the full sequence once. No step is retried.
    #[instrument(skip_all, fields(mode = %self.mode))]
    pub async fn execute(&self, request: ChangeRequest) -> Outcome {
        let mut log = StepLog::new();
        let mut ctx = ChallengeContext::default();
        let mut step = Step(0);

        match self.run(&request, &mut ctx, &mut log, &mut step).await {
            Ok(challenged) => {
                info!(challenged, "Birthdate change applied");
                Outcome::Success(Applied {
                    date: request.date(),
                    challenged,
                    log,
                })
            }
            Err(err) => {
                if matches!(err, ChallengeError::Internal(_)) {
                    error!(step = step.0, "Birthdate change aborted: {}", err);
                } else {
                    warn!(step = step.0, kind = err.kind(), "Birthdate change failed: {}", err);
                }
                log.push(format!("Step {} failed: {}", step.0, err));
                Outcome::Failure(Failure { error: err, log })
            }
        }
    }

    async fn run(
        &self,
        request: &ChangeRequest,
        ctx: &mut ChallengeContext,
        log: &mut StepLog,
        step: &mut Step,
    ) -> Result<bool, ChallengeError> {
        step.0 = 1;
        self.fetch_csrf_token(request, ctx, log).await?;

        step.0 = 2;
        let response = self.submit_change(request, ctx).await?;
        if response.status == IMMEDIATE_SUCCESS {
            log.push("Step 2: Birthdate changed without challenge");
            return Ok(false);
        }
        if response.status != VERIFICATION_REQUIRED {
            return Err(ChallengeError::Upstream {
                stage: MutationStage::Initial,
                status: response.status,
                body: response.body,
            });
        }
        log.push("Step 2: Verification required");

        step.0 = 3;
        extract_challenge(&response, ctx, log)?;

        step.0 = 4;
        self.continue_challenge(request, ctx, log).await?;

        step.0 = 5;
        self.verify_password(request, ctx, log).await?;

        step.0 = 6;
        self.complete_challenge(request, ctx, log).await?;

        step.0 = 7;
        match self.mode {
            CompletionMode::Resubmit => {
                let response = self.submit_change(request, ctx).await?;
                if response.status != IMMEDIATE_SUCCESS {
                    return Err(ChallengeError::Upstream {
                        stage: MutationStage::Confirmation,
                        status: response.status,
                        body: response.body,
                    });
                }
                log.push("Step 7: Birthdate change confirmed");
            }
            CompletionMode::AssumeApplied => {
                log.push("Step 7: Birthdate change assumed applied (not confirmed)");
            }
        }

        Ok(true)
    }

    #[instrument(skip_all, fields(step = 1))]
    async fn fetch_csrf_token(
        &self,
        request: &ChangeRequest,
        ctx: &mut ChallengeContext,
        log: &mut StepLog,
    ) -> Result<(), ChallengeError> {
        let response = self
            .client
            .post(
                &self.client.endpoints().birthdate(),
                request.cookie(),
                None,
                None,
            )
            .await?;

        let token = response
            .header(super::client::CSRF_HEADER)
            .ok_or(ChallengeError::Auth)?;

        ctx.csrf_token = Some(token);
        log.push("Step 1: CSRF token obtained");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn submit_change(
        &self,
        request: &ChangeRequest,
        ctx: &ChallengeContext,
    ) -> Result<super::client::UpstreamResponse, ChallengeError> {
        let csrf = required(ctx.csrf_token.as_deref(), "CSRF token")?;
        let date = request.date();
        let body = json!({
            "birthMonth": date.month,
            "birthDay": date.day,
            "birthYear": date.year,
            "password": request.password(),
        });

        Ok(self
            .client
            .post(
                &self.client.endpoints().birthdate(),
                request.cookie(),
                Some(csrf),
                Some(&body),
            )
            .await?)
    }

    #[instrument(skip_all, fields(step = 4))]
    async fn continue_challenge(
        &self,
        request: &ChangeRequest,
        ctx: &mut ChallengeContext,
        log: &mut StepLog,
    ) -> Result<(), ChallengeError> {
        let csrf = required(ctx.csrf_token.as_deref(), "CSRF token")?;
        let body = json!({
            "challengeId": required(ctx.challenge_id.as_deref(), "challenge id")?,
            "challengeType": required(ctx.challenge_type.as_deref(), "challenge type")?,
            "challengeMetadata": required(ctx.challenge_metadata.as_deref(), "challenge metadata")?,
        });

        let response = self
            .client
            .post(
                &self.client.endpoints().challenge_continue(),
                request.cookie(),
                Some(csrf),
                Some(&body),
            )
            .await?;

        if response.status != StatusCode::OK {
            return Err(ChallengeError::Challenge {
                stage: ChallengeStage::Continue,
                status: response.status,
                body: response.body,
            });
        }

        let data = response.json().ok_or_else(|| {
            ChallengeError::Protocol("Challenge continue response is not JSON".to_string())
        })?;
        let continued_id = string_field(&data, "challengeId")?;
        let continued_type = string_field(&data, "challengeType")?;
        let nested = match data.get("challengeMetadata") {
            Some(Value::String(raw)) => metadata::decode_continuation_metadata(raw)?,
            Some(Value::Object(map)) => map.clone(),
            _ => {
                return Err(ChallengeError::Protocol(
                    "Challenge continue response missing challengeMetadata".to_string(),
                ));
            }
        };

        log.push("Step 4: Challenge continued");
        log.push(format!("   New Challenge ID: {continued_id}"));
        log.push(format!("   New Challenge Type: {continued_type}"));

        let user_id = metadata::user_id(&nested)?;
        let inner_challenge_id = metadata::inner_challenge_id(&nested)?;

        log.push(format!("   User ID: {user_id}"));
        log.push(format!("   Inner Challenge ID: {inner_challenge_id}"));

        ctx.continued_id = Some(continued_id);
        ctx.continued_type = Some(continued_type);
        ctx.continued_metadata = Some(nested);
        ctx.user_id = Some(user_id);
        ctx.inner_challenge_id = Some(inner_challenge_id);
        Ok(())
    }

    #[instrument(skip_all, fields(step = 5))]
    async fn verify_password(
        &self,
        request: &ChangeRequest,
        ctx: &mut ChallengeContext,
        log: &mut StepLog,
    ) -> Result<(), ChallengeError> {
        let csrf = required(ctx.csrf_token.as_deref(), "CSRF token")?;
        let user_id = required(ctx.user_id.as_deref(), "user id")?;
        let url = self
            .client
            .endpoints()
            .password_verify(user_id)
            .map_err(|e| ChallengeError::Internal(e.to_string()))?;
        let body = json!({
            "challengeId": required(ctx.inner_challenge_id.as_deref(), "inner challenge id")?,
            "actionType": PASSWORD_ACTION_TYPE,
            "code": request.password(),
        });

        let response = self
            .client
            .post(&url, request.cookie(), Some(csrf), Some(&body))
            .await?;

        if response.status != StatusCode::OK {
            let message = metadata::first_error_message(&response.body)
                .unwrap_or_else(|| response.status.as_u16().to_string());
            return Err(ChallengeError::Verification(message));
        }

        let token = response
            .json()
            .as_ref()
            .and_then(|data| data.get(metadata::VERIFICATION_TOKEN_FIELD))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ChallengeError::Protocol("No verification token received".to_string()))?;

        log.push("Step 5: Password verified");
        log.push(format!(
            "   Verification Token: {}",
            metadata::token_preview(&token)
        ));

        ctx.verification_token = Some(SecretString::from(token));
        Ok(())
    }

    #[instrument(skip_all, fields(step = 6))]
    async fn complete_challenge(
        &self,
        request: &ChangeRequest,
        ctx: &ChallengeContext,
        log: &mut StepLog,
    ) -> Result<(), ChallengeError> {
        let csrf = required(ctx.csrf_token.as_deref(), "CSRF token")?;
        let nested = ctx
            .continued_metadata
            .as_ref()
            .ok_or_else(|| missing("challenge metadata"))?;
        let token = ctx
            .verification_token
            .as_ref()
            .ok_or_else(|| missing("verification token"))?;

        let merged = metadata::merge_verification_token(nested, token.expose_secret());
        log.push(format!(
            "   Sending full metadata with {} fields",
            merged.len()
        ));

        let encoded = serde_json::to_string(&merged)
            .map_err(|e| ChallengeError::Internal(format!("Failed to encode metadata: {e}")))?;
        let body = json!({
            "challengeId": required(ctx.continued_id.as_deref(), "continued challenge id")?,
            "challengeType": required(ctx.continued_type.as_deref(), "continued challenge type")?,
            "challengeMetadata": encoded,
        });

        let response = self
            .client
            .post(
                &self.client.endpoints().challenge_continue(),
                request.cookie(),
                Some(csrf),
                Some(&body),
            )
            .await?;

        if response.status != StatusCode::OK {
            return Err(ChallengeError::Challenge {
                stage: ChallengeStage::Complete,
                status: response.status,
                body: response.body,
            });
        }

        log.push("Step 6: Challenge completed");
        Ok(())
    }
}

// Number of the step currently running; reported in the failure entry.
struct Step(u8);

fn extract_challenge(
    response: &super::client::UpstreamResponse,
    ctx: &mut ChallengeContext,
    log: &mut StepLog,
) -> Result<(), ChallengeError> {
    let id = response.header(CHALLENGE_ID_HEADER);
    let kind = response.header(CHALLENGE_TYPE_HEADER);
    let meta = response.header(CHALLENGE_METADATA_HEADER);

    let (Some(id), Some(kind), Some(meta)) = (id, kind, meta) else {
        warn!(
            status = response.status.as_u16(),
            "Challenge headers missing, body: {}", response.body
        );
        return Err(ChallengeError::Protocol(
            "Challenge headers not found. Roblox might have blocked the request or changed the API."
                .to_string(),
        ));
    };

    log.push("Step 3: Challenge received");
    log.push(format!("   Challenge ID: {id}"));
    log.push(format!("   Challenge Type: {kind}"));

    ctx.challenge_id = Some(id);
    ctx.challenge_type = Some(kind);
    ctx.challenge_metadata = Some(meta);
    Ok(())
}

fn string_field(data: &Value, key: &str) -> Result<String, ChallengeError> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ChallengeError::Protocol(format!("Challenge continue response missing {key}"))
        })
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ChallengeError> {
    value.ok_or_else(|| missing(what))
}

fn missing(what: &str) -> ChallengeError {
    ChallengeError::Internal(format!("{what} was not set by an earlier step"))
}
