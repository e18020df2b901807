use crate::challenge::{ChallengeError, ChangeForm, Orchestrator, Outcome, TargetDate};
use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

pub const SUCCESS_MESSAGE: &str = "Birthdate changed successfully!";

/// Inbound change request. Date parts may be sent as numbers or numeric strings.
#[derive(ToSchema, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BirthdateChange {
    /// Session cookie, with or without the `.ROBLOSECURITY=` prefix.
    cookie: Option<String>,
    password: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    #[schema(value_type = Option<u32>)]
    birth_month: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    #[schema(value_type = Option<u32>)]
    birth_day: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    #[schema(value_type = Option<u32>)]
    birth_year: Option<u32>,
}

impl BirthdateChange {
    fn form(&self) -> ChangeForm<'_> {
        ChangeForm {
            credential: self.cookie.as_deref(),
            password: self.password.as_deref(),
            month: self.birth_month,
            day: self.birth_day,
            year: self.birth_year,
        }
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSuccess {
    success: bool,
    message: String,
    new_birthdate: TargetDate,
    logs: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChangeFailure {
    success: bool,
    error: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    logs: Vec<String>,
}

impl ChangeFailure {
    fn from_error(error: &ChallengeError, logs: Vec<String>) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            kind: error.kind().to_string(),
            details: error.details().map(str::to_string),
            logs,
        }
    }
}

#[utoipa::path(
    post,
    path= "/api/change-birthdate",
    request_body = BirthdateChange,
    responses (
        (status = 200, description = "Birthdate changed", body = ChangeSuccess),
        (status = 400, description = "Missing required fields", body = ChangeFailure),
        (status = 403, description = "Session cookie rejected, no CSRF token issued", body = ChangeFailure),
        (status = 500, description = "Upstream flow failed; logs show the failing step", body = ChangeFailure),
    ),
    tag = "birthdate",
)]
#[instrument(skip_all)]
pub async fn change_birthdate(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    payload: Result<Json<BirthdateChange>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            debug!("Invalid payload: {}", rejection);
            let error = ChallengeError::Validation;
            return (
                error.http_status(),
                Json(ChangeFailure::from_error(&error, Vec::new())),
            )
                .into_response();
        }
    };

    match orchestrator.submit(&payload.form()).await {
        Outcome::Success(applied) => (
            StatusCode::OK,
            Json(ChangeSuccess {
                success: true,
                message: SUCCESS_MESSAGE.to_string(),
                new_birthdate: applied.date,
                logs: applied.log.into_entries(),
            }),
        )
            .into_response(),
        Outcome::Failure(failure) => (
            failure.error.http_status(),
            Json(ChangeFailure::from_error(
                &failure.error,
                failure.log.into_entries(),
            )),
        )
            .into_response(),
    }
}
