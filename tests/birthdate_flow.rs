use anyhow::{Context, Result, ensure};
use dobchange::challenge::{
    Applied, ChallengeError, ChallengeStage, ChangeForm, CompletionMode, Endpoints, MutationStage,
    Orchestrator, Outcome, TargetDate, UpstreamClient, UpstreamConfig,
};
use reqwest::StatusCode;
use serde_json::{Map, Value, json};
use std::net::TcpListener;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

const CSRF: &str = "csrf-abc";
const OUTER_CHALLENGE_ID: &str = "outer-1";
const CONTINUED_CHALLENGE_ID: &str = "cont-1";
const INNER_CHALLENGE_ID: &str = "inner-9";
const USER_ID: &str = "12345";
const CHALLENGE_METADATA: &str = "eyJ1c2VySWQiOiIxMjM0NSJ9";
const VERIFICATION_TOKEN: &str = "tok-abcdefghijklmnopqrstuvwxyz";
const PASSWORD: &str = "hunter2";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn orchestrator(server: &MockServer, mode: CompletionMode) -> Result<Orchestrator> {
    orchestrator_with(Endpoints::single(&server.uri()), mode)
}

fn orchestrator_with(endpoints: Endpoints, mode: CompletionMode) -> Result<Orchestrator> {
    let client = UpstreamClient::new(UpstreamConfig {
        endpoints,
        proxy: None,
    })?;
    let orchestrator = Orchestrator::new(client, mode);
    ensure!(orchestrator.mode() == mode);
    Ok(orchestrator)
}

fn form() -> ChangeForm<'static> {
    ChangeForm {
        credential: Some(".ROBLOSECURITY=abc123"),
        password: Some(PASSWORD),
        month: Some(6),
        day: Some(15),
        year: Some(1995),
    }
}

fn birthdate_with_csrf() -> MockBuilder {
    Mock::given(method("POST"))
        .and(path("/v1/birthdate"))
        .and(header("x-csrf-token", CSRF))
}

/// First birthdate call carries no CSRF token and is answered with one.
async fn mount_csrf(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/birthdate"))
        .and(header("cookie", ".ROBLOSECURITY=abc123"))
        .respond_with(ResponseTemplate::new(403).insert_header("x-csrf-token", CSRF))
        .with_priority(10)
        .mount(server)
        .await;
}

async fn mount_challenge_issued(server: &MockServer) {
    birthdate_with_csrf()
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("rblx-challenge-id", OUTER_CHALLENGE_ID)
                .insert_header("rblx-challenge-type", "reauthentication")
                .insert_header("rblx-challenge-metadata", CHALLENGE_METADATA),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;
}

async fn mount_continue(server: &MockServer) {
    let nested = json!({
        "userId": USER_ID,
        "challengeId": INNER_CHALLENGE_ID,
        "shouldShowRememberDeviceCheckbox": false,
        "verificationToken": "stale"
    });
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .and(body_partial_json(json!({
            "challengeId": OUTER_CHALLENGE_ID,
            "challengeType": "reauthentication",
            "challengeMetadata": CHALLENGE_METADATA
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "challengeId": CONTINUED_CHALLENGE_ID,
            "challengeType": "reauthentication",
            "challengeMetadata": nested.to_string()
        })))
        .mount(server)
        .await;
}

async fn mount_verify(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!(
            "/v1/users/{USER_ID}/challenges/password/verify"
        )))
        .and(body_partial_json(json!({
            "challengeId": INNER_CHALLENGE_ID,
            "actionType": 7,
            "code": PASSWORD
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"verificationToken": VERIFICATION_TOKEN})),
        )
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .and(body_partial_json(
            json!({"challengeId": CONTINUED_CHALLENGE_ID}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

async fn mount_through_verification(server: &MockServer) {
    mount_csrf(server).await;
    mount_challenge_issued(server).await;
    mount_continue(server).await;
    mount_verify(server).await;
}

fn success(outcome: Outcome) -> Result<Applied> {
    ensure!(
        outcome.is_success(),
        "expected success, got log {:?}",
        outcome.log().entries()
    );
    match outcome {
        Outcome::Success(applied) => Ok(applied),
        Outcome::Failure(failure) => anyhow::bail!("unexpected failure: {}", failure.error),
    }
}

fn failure(outcome: Outcome) -> Result<(ChallengeError, Vec<String>)> {
    ensure!(
        !outcome.is_success(),
        "expected failure, got success: {:?}",
        outcome.log().entries()
    );
    match outcome {
        Outcome::Failure(failure) => Ok((failure.error, failure.log.into_entries())),
        Outcome::Success(_) => anyhow::bail!("unexpected success"),
    }
}

async fn completion_metadata(server: &MockServer) -> Result<Map<String, Value>> {
    let requests = server
        .received_requests()
        .await
        .context("request recording disabled")?;
    let completion = requests
        .iter()
        .filter(|request| request.url.path() == "/challenge/v1/continue")
        .filter_map(|request| serde_json::from_slice::<Value>(&request.body).ok())
        .find(|body| body["challengeId"] == json!(CONTINUED_CHALLENGE_ID))
        .context("no completion request recorded")?;
    let encoded = completion["challengeMetadata"]
        .as_str()
        .context("challengeMetadata must be a JSON string")?;
    Ok(serde_json::from_str(encoded)?)
}

#[tokio::test]
async fn full_challenge_flow_resubmits_and_confirms() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_through_verification(&server).await;
    mount_complete(&server).await;
    birthdate_with_csrf()
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(2)
        .mount(&server)
        .await;

    let outcome = orchestrator(&server, CompletionMode::Resubmit)?
        .submit(&form())
        .await;

    let applied = success(outcome)?;
    ensure!(applied.challenged);
    assert_eq!(
        applied.date,
        TargetDate {
            month: 6,
            day: 15,
            year: 1995
        }
    );

    let entries = applied.log.entries();
    assert_eq!(entries.len(), 15);
    assert_eq!(entries[0], "Step 1: CSRF token obtained");
    assert_eq!(entries[1], "Step 2: Verification required");
    assert_eq!(entries[2], "Step 3: Challenge received");
    assert_eq!(entries[3], format!("   Challenge ID: {OUTER_CHALLENGE_ID}"));
    assert!(entries.contains(&format!("   User ID: {USER_ID}")));
    assert!(entries.contains(&format!("   Inner Challenge ID: {INNER_CHALLENGE_ID}")));
    assert!(entries.contains(&"   Verification Token: tok-abcdefghijklmnop...".to_string()));
    assert!(entries.contains(&"   Sending full metadata with 4 fields".to_string()));
    assert!(entries.contains(&"Step 6: Challenge completed".to_string()));
    assert_eq!(entries[14], "Step 7: Birthdate change confirmed");

    let merged = completion_metadata(&server).await?;
    assert_eq!(merged.len(), 4);
    assert_eq!(merged["verificationToken"], json!(VERIFICATION_TOKEN));
    assert_eq!(merged["userId"], json!(USER_ID));
    assert_eq!(merged["challengeId"], json!(INNER_CHALLENGE_ID));
    assert_eq!(merged["shouldShowRememberDeviceCheckbox"], json!(false));

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 6);
    ensure!(
        requests
            .iter()
            .all(|r| r.headers.get("cookie").and_then(|v| v.to_str().ok())
                == Some(".ROBLOSECURITY=abc123")),
        "every call must carry the session cookie"
    );
    Ok(())
}

#[tokio::test]
async fn assume_applied_skips_resubmission() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_through_verification(&server).await;
    mount_complete(&server).await;

    let outcome = orchestrator(&server, CompletionMode::AssumeApplied)?
        .submit(&form())
        .await;

    let applied = success(outcome)?;
    ensure!(applied.challenged);
    assert_eq!(
        applied.log.entries().last().map(String::as_str),
        Some("Step 7: Birthdate change assumed applied (not confirmed)")
    );

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 5);
    Ok(())
}

#[tokio::test]
async fn immediate_success_stops_after_two_calls() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    birthdate_with_csrf()
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(1)
        .mount(&server)
        .await;

    let outcome = orchestrator(&server, CompletionMode::Resubmit)?
        .submit(&form())
        .await;

    let applied = success(outcome)?;
    ensure!(!applied.challenged);
    assert_eq!(
        applied.log.into_entries(),
        vec![
            "Step 1: CSRF token obtained".to_string(),
            "Step 2: Birthdate changed without challenge".to_string(),
        ]
    );
    assert_eq!(
        server.received_requests().await.unwrap_or_default().len(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn missing_csrf_token_is_an_auth_failure() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/birthdate"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(error, ChallengeError::Auth);
    assert_eq!(error.http_status(), StatusCode::FORBIDDEN);
    assert_eq!(log.len(), 1);
    ensure!(log[0].starts_with("Step 1 failed"));
    assert_eq!(
        server.received_requests().await.unwrap_or_default().len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn unexpected_initial_status_is_reported() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    birthdate_with_csrf()
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .with_priority(1)
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(
        error,
        ChallengeError::Upstream {
            stage: MutationStage::Initial,
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "slow down".to_string(),
        }
    );
    assert_eq!(error.to_string(), "Unexpected response from Roblox: 429");
    assert_eq!(error.details(), Some("slow down"));
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 2 failed: Unexpected response from Roblox: 429")
    );
    Ok(())
}

#[tokio::test]
async fn missing_challenge_headers_is_a_protocol_error() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    birthdate_with_csrf()
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("rblx-challenge-id", OUTER_CHALLENGE_ID)
                .insert_header("rblx-challenge-type", "reauthentication"),
        )
        .with_priority(1)
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    ensure!(matches!(error, ChallengeError::Protocol(ref msg) if msg.contains("Challenge headers not found")));
    assert_eq!(log.len(), 3);
    ensure!(log[2].starts_with("Step 3 failed"));
    assert_eq!(
        server.received_requests().await.unwrap_or_default().len(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn continue_failure_keeps_upstream_body() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"errors":[{"code":1}]}"#),
        )
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(
        error,
        ChallengeError::Challenge {
            stage: ChallengeStage::Continue,
            status: StatusCode::BAD_REQUEST,
            body: r#"{"errors":[{"code":1}]}"#.to_string(),
        }
    );
    assert_eq!(error.to_string(), "Challenge continue failed: 400");
    assert_eq!(error.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 4 failed: Challenge continue failed: 400")
    );
    Ok(())
}

#[tokio::test]
async fn wrong_password_surfaces_upstream_message() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;
    mount_continue(&server).await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/v1/users/{USER_ID}/challenges/password/verify"
        )))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errors": [{"code": 8, "message": "Incorrect password"}]
        })))
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(
        error,
        ChallengeError::Verification("Incorrect password".to_string())
    );
    assert_eq!(
        error.to_string(),
        "Password verification failed: Incorrect password"
    );
    ensure!(log.iter().any(|entry| entry == "Step 4: Challenge continued"));
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 5 failed: Password verification failed: Incorrect password")
    );
    Ok(())
}

#[tokio::test]
async fn verification_without_token_is_a_protocol_error() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;
    mount_continue(&server).await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/v1/users/{USER_ID}/challenges/password/verify"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let (error, _) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(
        error,
        ChallengeError::Protocol("No verification token received".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn completion_failure_is_reported() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_through_verification(&server).await;
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .and(body_partial_json(
            json!({"challengeId": CONTINUED_CHALLENGE_ID}),
        ))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(error.to_string(), "Final challenge failed: 403");
    assert_eq!(error.details(), Some("denied"));
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 6 failed: Final challenge failed: 403")
    );
    Ok(())
}

#[tokio::test]
async fn unconfirmed_resubmission_is_a_failure() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_through_verification(&server).await;
    mount_complete(&server).await;
    birthdate_with_csrf()
        .respond_with(ResponseTemplate::new(403))
        .with_priority(2)
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    ensure!(matches!(
        error,
        ChallengeError::Upstream {
            stage: MutationStage::Confirmation,
            status: StatusCode::FORBIDDEN,
            ..
        }
    ));
    assert_eq!(error.to_string(), "Birthdate change was not confirmed: 403");
    ensure!(log.iter().any(|entry| entry == "Step 6: Challenge completed"));
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 7 failed: Birthdate change was not confirmed: 403")
    );
    Ok(())
}

#[tokio::test]
async fn invalid_input_never_reaches_upstream() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;

    let incomplete = ChangeForm {
        year: None,
        ..form()
    };
    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&incomplete)
            .await,
    )?;

    assert_eq!(error, ChallengeError::Validation);
    assert_eq!(error.http_status(), StatusCode::BAD_REQUEST);
    ensure!(log.is_empty());
    ensure!(
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn transport_failure_keeps_earlier_steps() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;

    // Nothing listens on port 1, so the continue call cannot connect.
    let endpoints = Endpoints {
        challenge: "http://127.0.0.1:1".to_string(),
        ..Endpoints::single(&server.uri())
    };
    let (error, log) = failure(
        orchestrator_with(endpoints, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(error.kind(), "internal_error");
    assert_eq!(error.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(log.len(), 6);
    assert_eq!(log[0], "Step 1: CSRF token obtained");
    assert_eq!(log[1], "Step 2: Verification required");
    assert_eq!(log[2], "Step 3: Challenge received");
    assert_eq!(log[4], "   Challenge Type: reauthentication");
    ensure!(
        log[5].starts_with("Step 4 failed: Upstream request failed"),
        "unexpected last entry: {}",
        log[5]
    );
    Ok(())
}

#[tokio::test]
async fn continuation_without_inner_challenge_id_fails() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "challengeId": CONTINUED_CHALLENGE_ID,
            "challengeType": "reauthentication",
            "challengeMetadata": json!({"userId": USER_ID}).to_string()
        })))
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(error.kind(), "protocol_error");
    ensure!(log.iter().any(|entry| entry == "Step 4: Challenge continued"));
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 4 failed: Challenge metadata missing challengeId")
    );
    let requests = server.received_requests().await.unwrap_or_default();
    ensure!(
        requests
            .iter()
            .all(|r| !r.url.path().contains("/challenges/password/verify")),
        "password verification must not run"
    );
    Ok(())
}

#[tokio::test]
async fn continuation_with_non_json_body_fails() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_challenge_issued(&server).await;
    Mock::given(method("POST"))
        .and(path("/challenge/v1/continue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
        .mount(&server)
        .await;

    let (error, log) = failure(
        orchestrator(&server, CompletionMode::Resubmit)?
            .submit(&form())
            .await,
    )?;

    assert_eq!(
        error,
        ChallengeError::Protocol("Challenge continue response is not JSON".to_string())
    );
    assert_eq!(
        log.last().map(String::as_str),
        Some("Step 4 failed: Challenge continue response is not JSON")
    );
    Ok(())
}
