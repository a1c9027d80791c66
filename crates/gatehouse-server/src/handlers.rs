use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{
    apps::AppEntry,
    auth::ParsedHeader,
    error::ApiError,
    ledger::{self, CrashOutcome, LedgerError},
    store::{model, ArchivedCrash, IndividualCrash},
    users::{AccountError, Directory, LoginError},
    AppState,
};

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::invalid_body())
}

/// The app a request acts on. Management keys name it in the path; every
/// other key acts on its own app.
fn target_app<'a>(
    state: &'a AppState,
    hdr: &ParsedHeader,
    path_app: Option<&str>,
) -> Result<&'a AppEntry, ApiError> {
    if state.is_management(&hdr.key) {
        let app_id = path_app.filter(|id| !id.is_empty()).ok_or_else(|| {
            ApiError::bad_request("Management requests must name an app")
        })?;
        return state
            .registry
            .get(app_id)
            .ok_or_else(|| ApiError::bad_request("Unknown app"));
    }
    state
        .registry
        .get(&hdr.key.app_id)
        .ok_or_else(ApiError::invalid_key)
}

fn directory(state: &AppState) -> Result<&Directory, ApiError> {
    state.users.as_ref().ok_or_else(|| {
        error!("user endpoint reached without a user directory");
        ApiError::misconfigured()
    })
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "internal error");
    ApiError::internal()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Count ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CountRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub id: String,
}

pub async fn count_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "count", false).await?;
    let req: CountRequest = parse_body(&body)?;
    if req.platform.is_empty() {
        return Err(ApiError::invalid_body());
    }
    let app = target_app(&state, &hdr, None)?;
    let table = ledger::count_table(app)?;
    let id = ledger::record_ping(table, req.id.as_deref(), &req.platform, model::today()).await?;
    Ok((StatusCode::CREATED, Json(CountResponse { id })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    #[serde(default)]
    pub platform: Option<String>,
}

async fn get_count_for(
    state: AppState,
    headers: HeaderMap,
    path_app: Option<String>,
    query: CountQuery,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "management", true).await?;
    let app = target_app(&state, &hdr, path_app.as_deref())?;
    let table = ledger::count_table(app).map_err(|e| match e {
        LedgerError::Misconfigured { .. } => {
            ApiError::bad_request("App does not keep a count table")
        }
        e => e.into(),
    })?;
    let count = ledger::count_for(table, query.platform.as_deref().unwrap_or("")).await?;
    Ok(Json(json!({ "count": count })).into_response())
}

pub async fn get_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CountQuery>,
) -> Result<Response, ApiError> {
    get_count_for(state, headers, None, query).await
}

pub async fn management_get_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<String>,
    Query(query): Query<CountQuery>,
) -> Result<Response, ApiError> {
    get_count_for(state, headers, Some(app_id), query).await
}

// ── Crash ─────────────────────────────────────────────────────────────────────

pub async fn report_crash(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "crash", false).await?;
    let crash: IndividualCrash = parse_body(&body)?;
    if crash.platform.is_empty()
        || crash.version.is_empty()
        || crash.error.is_empty()
        || crash.stack.is_empty()
    {
        return Err(ApiError::invalid_body());
    }
    let app = target_app(&state, &hdr, None)?;
    let status = match ledger::report_crash(app, crash).await? {
        CrashOutcome::Stored(_) => StatusCode::CREATED,
        CrashOutcome::Filtered | CrashOutcome::Archived => StatusCode::OK,
    };
    Ok(status.into_response())
}

async fn delete_crash_in(app: &AppEntry, crash_id: &str) -> Result<Response, ApiError> {
    if crash_id.is_empty() {
        return Err(ApiError::bad_request("Bad request"));
    }
    ledger::delete_crash(app, crash_id).await?;
    Ok(StatusCode::OK.into_response())
}

pub async fn delete_crash(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(crash_id): Path<String>,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "management", false).await?;
    delete_crash_in(target_app(&state, &hdr, None)?, &crash_id).await
}

pub async fn management_delete_crash(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, crash_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "management", true).await?;
    delete_crash_in(target_app(&state, &hdr, Some(&app_id))?, &crash_id).await
}

async fn archive_crash_in(app: &AppEntry, body: &[u8]) -> Result<Response, ApiError> {
    let marker: ArchivedCrash = parse_body(body)?;
    if marker.error.is_empty() || marker.stack.is_empty() {
        return Err(ApiError::invalid_body());
    }
    let sweep = ledger::archive_crash(app, marker.normalized()).await?;
    Ok(Json(sweep).into_response())
}

pub async fn archive_crash(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "management", false).await?;
    archive_crash_in(target_app(&state, &hdr, None)?, &body).await
}

pub async fn management_archive_crash(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "management", true).await?;
    archive_crash_in(target_app(&state, &hdr, Some(&app_id))?, &body).await
}

// ── Users ─────────────────────────────────────────────────────────────────────

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::PasswordLength => ApiError::password(),
            AccountError::IncorrectPassword => {
                ApiError::new(StatusCode::UNAUTHORIZED, "password", "Incorrect password")
            }
            AccountError::Taken => ApiError::taken(),
            AccountError::Store(e) => e.into(),
            AccountError::Hash(e) => internal(e),
            AccountError::Session(e) => internal(e),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub username: String,
    pub token: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.verify_header(&headers, "user", false).await?;
    let req: CreateUserRequest = parse_body(&body)?;
    if req.username.is_empty() || req.password.is_empty() || req.email.is_empty() {
        return Err(ApiError::invalid_body());
    }
    let (user, token) = directory(&state)?
        .register(&req.username, &req.password, &req.email)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            username: user.username,
            token,
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Login failures are reported in the body with a 200, not as an error status.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Unix seconds at which the lockout ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.verify_header(&headers, "user", false).await?;
    let req: LoginRequest = parse_body(&body)?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::invalid_body());
    }
    let dir = directory(&state)?;
    let resp = match dir.try_login(&req.username, &req.password).await {
        Ok(user) => LoginResponse {
            token: Some(dir.issue_token(&user).map_err(internal)?),
            ..Default::default()
        },
        Err(LoginError::Timeout { until }) => {
            let secs = (until - Utc::now()).num_seconds().max(0);
            LoginResponse {
                error: Some("timeout"),
                error_msg: Some(format!("Timed out for {secs} seconds")),
                timeout: Some(until.timestamp()),
                ..Default::default()
            }
        }
        Err(LoginError::Incorrect) => LoginResponse {
            error: Some("incorrect"),
            error_msg: Some("Incorrect username or password".into()),
            ..Default::default()
        },
        Err(LoginError::Store(e)) => return Err(e.into()),
        Err(LoginError::Hash(e)) => return Err(internal(e)),
    };
    Ok(Json(resp).into_response())
}

pub async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    state.verify_header(&headers, "management", true).await?;
    if user_id.is_empty() {
        return Err(ApiError::bad_request("Bad request"));
    }
    directory(&state)?.remove(&user_id).await?;
    Ok(StatusCode::OK.into_response())
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "user", false).await?;
    let user = hdr.user.ok_or_else(ApiError::invalid_token)?;
    Ok(Json(user).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hdr = state.verify_header(&headers, "user", false).await?;
    let user = hdr.user.ok_or_else(ApiError::invalid_token)?;
    let req: ChangePasswordRequest = parse_body(&body)?;
    if req.current_password.is_empty() || req.new_password.is_empty() {
        return Err(ApiError::invalid_body());
    }
    let dir = directory(&state)?;
    let updated = dir
        .change_password(&user.id, &req.current_password, &req.new_password)
        .await?;
    let token = dir.issue_token(&updated).map_err(internal)?;
    info!(user_id = %updated.id, "session reissued after password change");
    Ok(Json(json!({ "token": token })).into_response())
}
