mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, StatusCode};
use common::{base_request, expect_status, TestApp, ADMIN_TOKEN};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct Tokens {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct Me {
    user_id: Option<String>,
    login: Option<String>,
    is_admin: bool,
}

async fn http_login(app: &TestApp, login: &str, password: &str) -> Result<Tokens> {
    let response = app
        .post_json(
            "/api/auth/login",
            &json!({ "login": login, "password": password }),
            None,
        )
        .await?;
    let body = expect_status(response, StatusCode::OK).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[tokio::test]
async fn login_and_me_roundtrip() -> Result<()> {
    let app = TestApp::new()?;
    let user_id = app.insert_user("alice", "s3cret").await?;

    let tokens = http_login(&app, "alice", "s3cret").await?;
    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.expires_in, 15 * 60);

    let response = app.get("/api/auth/me", Some(&tokens.access_token)).await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let me: Me = serde_json::from_slice(&body)?;
    assert_eq!(me.user_id, Some(user_id.to_string()));
    assert_eq!(me.login.as_deref(), Some("alice"));
    assert!(!me.is_admin);

    let response = app.get("/api/auth/me", Some(ADMIN_TOKEN)).await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let me: Me = serde_json::from_slice(&body)?;
    assert!(me.is_admin);
    assert!(me.user_id.is_none());
    Ok(())
}

#[tokio::test]
async fn login_failures_look_identical() -> Result<()> {
    let app = TestApp::new()?;
    app.insert_user("alice", "s3cret").await?;

    let unknown = app
        .post_json(
            "/api/auth/login",
            &json!({ "login": "nobody", "password": "s3cret" }),
            None,
        )
        .await?;
    let unknown = expect_status(unknown, StatusCode::UNAUTHORIZED).await?;

    let wrong = app
        .post_json(
            "/api/auth/login",
            &json!({ "login": "alice", "password": "nope" }),
            None,
        )
        .await?;
    let wrong = expect_status(wrong, StatusCode::UNAUTHORIZED).await?;
    assert_eq!(unknown, wrong);
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() -> Result<()> {
    let app = TestApp::new()?;
    app.insert_user("alice", "s3cret").await?;
    let first = http_login(&app, "alice", "s3cret").await?;

    let payload = json!({ "refresh_token": first.refresh_token });
    let response = app
        .post_json("/api/auth/refresh", &payload, Some(&first.access_token))
        .await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let second: Tokens = serde_json::from_slice(&body)?;
    assert_ne!(second.refresh_token, first.refresh_token);

    let replay = app
        .post_json("/api/auth/refresh", &payload, Some(&first.access_token))
        .await?;
    let body = expect_status(replay, StatusCode::UNAUTHORIZED).await?;
    let error: Value = serde_json::from_slice(&body)?;
    assert_eq!(error["error"], "unable to refresh session");

    let missing_bearer = app.post_json("/api/auth/refresh", &payload, None).await?;
    expect_status(missing_bearer, StatusCode::UNAUTHORIZED).await?;
    Ok(())
}

#[tokio::test]
async fn refresh_from_another_browser_is_refused() -> Result<()> {
    let app = TestApp::new()?;
    app.insert_user("alice", "s3cret").await?;
    let tokens = http_login(&app, "alice", "s3cret").await?;
    let payload = serde_json::to_vec(&json!({ "refresh_token": tokens.refresh_token }))?;

    let mut request = base_request(Method::POST, "/api/auth/refresh", Some(&tokens.access_token))
        .header("content-type", "application/json")
        .body(Body::from(payload))?;
    request
        .headers_mut()
        .insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
    let response = app.send(request).await?;
    let body = expect_status(response, StatusCode::UNAUTHORIZED).await?;
    let error: Value = serde_json::from_slice(&body)?;
    assert_eq!(error["error"], "unable to refresh session");

    // The original browser cannot use the burned token afterwards.
    let response = app
        .post_json(
            "/api/auth/refresh",
            &json!({ "refresh_token": tokens.refresh_token }),
            Some(&tokens.access_token),
        )
        .await?;
    expect_status(response, StatusCode::UNAUTHORIZED).await?;

    // The burned token no longer authenticates either.
    let response = app.get("/api/auth/me", Some(&tokens.access_token)).await?;
    expect_status(response, StatusCode::UNAUTHORIZED).await?;
    Ok(())
}

#[tokio::test]
async fn logout_ends_the_session() -> Result<()> {
    let app = TestApp::new()?;
    app.insert_user("alice", "s3cret").await?;
    let tokens = http_login(&app, "alice", "s3cret").await?;

    let response = app
        .post_json("/api/auth/logout", &json!({}), Some(&tokens.access_token))
        .await?;
    expect_status(response, StatusCode::NO_CONTENT).await?;

    let again = app
        .post_json("/api/auth/logout", &json!({}), Some(&tokens.access_token))
        .await?;
    expect_status(again, StatusCode::NO_CONTENT).await?;

    let response = app.get("/api/auth/me", Some(&tokens.access_token)).await?;
    expect_status(response, StatusCode::UNAUTHORIZED).await?;
    Ok(())
}

#[tokio::test]
async fn registration_is_admin_only() -> Result<()> {
    let app = TestApp::new()?;
    app.insert_user("alice", "s3cret").await?;
    let tokens = http_login(&app, "alice", "s3cret").await?;
    let payload = json!({ "login": "bob", "password": "hunter2" });

    let forbidden = app
        .post_json("/api/register", &payload, Some(&tokens.access_token))
        .await?;
    expect_status(forbidden, StatusCode::FORBIDDEN).await?;

    let anonymous = app.post_json("/api/register", &payload, None).await?;
    expect_status(anonymous, StatusCode::UNAUTHORIZED).await?;

    let created = app
        .post_json("/api/register", &payload, Some(ADMIN_TOKEN))
        .await?;
    let body = expect_status(created, StatusCode::CREATED).await?;
    let user: Value = serde_json::from_slice(&body)?;
    assert_eq!(user["login"], "bob");
    assert!(user.get("password_hash").is_none());

    let duplicate = app
        .post_json("/api/register", &payload, Some(ADMIN_TOKEN))
        .await?;
    expect_status(duplicate, StatusCode::CONFLICT).await?;

    let invalid = app
        .post_json(
            "/api/register",
            &json!({ "login": "b!", "password": "x" }),
            Some(ADMIN_TOKEN),
        )
        .await?;
    expect_status(invalid, StatusCode::BAD_REQUEST).await?;

    http_login(&app, "bob", "hunter2").await?;
    Ok(())
}

#[tokio::test]
async fn users_manage_their_own_profile() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("alice", "s3cret").await?;
    let bob = app.insert_user("bob", "s3cret").await?;
    let tokens = http_login(&app, "alice", "s3cret").await?;
    let token = Some(tokens.access_token.as_str());

    let response = app.get(&format!("/api/users/{bob}"), token).await?;
    expect_status(response, StatusCode::FORBIDDEN).await?;

    let response = app
        .put_json(
            &format!("/api/users/{alice}"),
            &json!({ "login": "alicia" }),
            token,
        )
        .await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let user: Value = serde_json::from_slice(&body)?;
    assert_eq!(user["login"], "alicia");

    let response = app
        .put_json(
            &format!("/api/users/{alice}"),
            &json!({ "login": "bob" }),
            token,
        )
        .await?;
    expect_status(response, StatusCode::CONFLICT).await?;

    let response = app.get("/api/users?limit=1", token).await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let page: Value = serde_json::from_slice(&body)?;
    assert_eq!(page["items"].as_array().map(Vec::len), Some(1));
    let cursor = page["next_cursor"].as_str().expect("second page").to_string();

    let response = app
        .get(&format!("/api/users?limit=1&cursor={cursor}"), token)
        .await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let page: Value = serde_json::from_slice(&body)?;
    assert_eq!(page["items"].as_array().map(Vec::len), Some(1));
    assert!(page["next_cursor"].is_null());

    let response = app
        .put_json(
            &format!("/api/users/{alice}/password"),
            &json!({ "password": "n3w" }),
            token,
        )
        .await?;
    expect_status(response, StatusCode::NO_CONTENT).await?;

    let response = app.get("/api/auth/me", token).await?;
    expect_status(response, StatusCode::UNAUTHORIZED).await?;
    http_login(&app, "alicia", "n3w").await?;

    let response = app.delete(&format!("/api/users/{bob}"), Some(ADMIN_TOKEN)).await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let deleted: Value = serde_json::from_slice(&body)?;
    assert_eq!(deleted["documents_removed"], 0);
    Ok(())
}

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    let app = TestApp::new()?;
    let response = app.get("/api/health", None).await?;
    let body = expect_status(response, StatusCode::OK).await?;
    let health: Value = serde_json::from_slice(&body)?;
    assert_eq!(health["status"], "ok");
    Ok(())
}
