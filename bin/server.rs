// Ledger Desk - Web Server
// REST API with Axum over the ledger_desk library

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use clap::Parser;
use ledger_desk::auth::{self, AuthSettings, ProfileUpdate, Session, SignUpMetadata};
use ledger_desk::config::DEFAULT_CONFIG_FILE;
use ledger_desk::files::{sanitize_filename, FileFilters, MAX_FILE_SIZE};
use ledger_desk::merge::MergeJobStatus;
use ledger_desk::processing::{self, FileProcessor, RemoteFunctionProcessor};
use ledger_desk::{
    clients, files, merge, open_database, open_store, records, routes, AppError, Config,
    ListOptions, LocalObjectStore, ObjectStore, RelationshipStatus,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    store: Arc<LocalObjectStore>,
    processor: Arc<dyn FileProcessor>,
    auth: AuthSettings,
}

impl AppState {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError(AppError::Storage("database lock poisoned".to_string())))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// Errors
// ============================================================================

struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &AppError) -> StatusCode {
    use ledger_desk::InvitationError;
    match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Invitation(InvitationError::NotFound) => StatusCode::NOT_FOUND,
        AppError::Invitation(_) => StatusCode::GONE,
        AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        AppError::Forbidden(_) => StatusCode::FORBIDDEN,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Remote(_) => StatusCode::BAD_GATEWAY,
        AppError::Storage(_)
        | AppError::Database(_)
        | AppError::Io(_)
        | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        } else {
            log::debug!("Request rejected ({}): {}", status, self.0);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            code: Some(self.0.code()),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Session extractors
// ============================================================================

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Signed-in caller; 401 when the bearer token is missing or expired
struct CurrentSession(Session);

#[async_trait]
impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError(AppError::Unauthorized))?;
        let conn = state.lock()?;
        let session = auth::session_from_token(&conn, &token)?;
        Ok(CurrentSession(session))
    }
}

/// Caller session if a valid token was sent
struct MaybeSession(Option<Session>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Ok(MaybeSession(None));
        };
        let conn = state.lock()?;
        match auth::session_from_token(&conn, &token) {
            Ok(session) => Ok(MaybeSession(Some(session))),
            Err(AppError::Unauthorized) => Ok(MaybeSession(None)),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct SignUpRequest {
    email: String,
    password: String,
    #[serde(flatten)]
    metadata: SignUpMetadata,
}

#[derive(Deserialize)]
struct SignInRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct PasswordRequest {
    password: String,
}

#[derive(Deserialize)]
struct InviteRequest {
    email: String,
}

#[derive(Deserialize)]
struct RelationshipStatusRequest {
    status: RelationshipStatus,
}

#[derive(Deserialize)]
struct CreateMergeRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "fileIds")]
    file_ids: Vec<String>,
}

#[derive(Deserialize)]
struct MergeStatusRequest {
    status: MergeJobStatus,
}

#[derive(Deserialize)]
struct FileQuery {
    #[serde(default, alias = "fileId")]
    file_id: Option<String>,
}

#[derive(Deserialize)]
struct GuardQuery {
    path: String,
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

#[derive(Serialize)]
struct DownloadResponse {
    url: String,
}

#[derive(Serialize)]
struct GuardResponse {
    decision: routes::GuardDecision,
    location: Option<String>,
}

fn csv_response(file_name: &str, csv: String) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(file_name));
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response()
}

// ============================================================================
// Auth & profile handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/auth/signup
async fn sign_up(State(state): State<AppState>, Json(body): Json<SignUpRequest>) -> ApiResult<Session> {
    let conn = state.lock()?;
    let session = auth::sign_up(&conn, &state.auth, &body.email, &body.password, &body.metadata)?;
    ok(session)
}

/// POST /api/auth/signin
async fn sign_in(State(state): State<AppState>, Json(body): Json<SignInRequest>) -> ApiResult<Session> {
    let conn = state.lock()?;
    ok(auth::sign_in(&conn, &state.auth, &body.email, &body.password)?)
}

/// POST /api/auth/signout
async fn sign_out(State(state): State<AppState>, CurrentSession(session): CurrentSession) -> ApiResult<()> {
    let conn = state.lock()?;
    auth::sign_out(&conn, &session.token)?;
    ok(())
}

/// GET /api/profile
async fn get_profile(CurrentSession(session): CurrentSession) -> ApiResult<auth::Profile> {
    ok(session.profile)
}

/// PUT /api/profile
async fn update_profile(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<ProfileUpdate>,
) -> ApiResult<auth::Profile> {
    let conn = state.lock()?;
    ok(auth::update_profile(&conn, &session, &body)?)
}

/// PUT /api/profile/password
async fn update_password(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<PasswordRequest>,
) -> ApiResult<()> {
    let conn = state.lock()?;
    auth::update_password(&conn, &state.auth, &session, &body.password)?;
    ok(())
}

// ============================================================================
// Client & invitation handlers
// ============================================================================

/// GET /api/clients
async fn list_clients(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<Vec<clients::RelationshipWithProfile>> {
    let conn = state.lock()?;
    ok(clients::list_clients(&conn, &session)?)
}

/// POST /api/clients/invite
async fn invite_client(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<InviteRequest>,
) -> ApiResult<clients::ClientRelationship> {
    let conn = state.lock()?;
    ok(clients::invite_client(&conn, &session, &body.email)?)
}

/// POST /api/clients/:id/resend
async fn resend_invitation(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<clients::ClientRelationship> {
    let conn = state.lock()?;
    ok(clients::resend_invitation(&conn, &session, &id)?)
}

/// PUT /api/clients/:id/status
async fn update_client_status(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    Json(body): Json<RelationshipStatusRequest>,
) -> ApiResult<clients::ClientRelationship> {
    let conn = state.lock()?;
    ok(clients::update_relationship_status(&conn, &session, &id, body.status)?)
}

/// DELETE /api/clients/:id
async fn remove_client(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let conn = state.lock()?;
    clients::remove_client(&conn, &session, &id)?;
    ok(())
}

/// GET /api/invitations/:token - public lookup for the invite page
async fn get_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<clients::RelationshipWithProfile> {
    let conn = state.lock()?;
    ok(clients::get_invitation(&conn, &token)?)
}

/// POST /api/invitations/:token/accept
async fn accept_invitation(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(token): Path<String>,
) -> ApiResult<clients::ClientRelationship> {
    let conn = state.lock()?;
    ok(clients::accept_invitation(&conn, &session, &token)?)
}

// ============================================================================
// File handlers
// ============================================================================

/// GET /api/files
async fn list_files(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(filters): Query<FileFilters>,
) -> ApiResult<Vec<files::FileRow>> {
    let conn = state.lock()?;
    ok(files::list_files(&conn, &session, &filters)?)
}

/// POST /api/files - multipart field `file`
async fn upload_file(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    mut multipart: Multipart,
) -> ApiResult<files::FileRow> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(e.to_string()))?;
        upload = Some((name, bytes.to_vec()));
    }

    let (name, bytes) =
        upload.ok_or_else(|| AppError::Validation("Missing multipart field 'file'".to_string()))?;
    let conn = state.lock()?;
    ok(files::upload_file(&conn, state.store.as_ref(), &session, &name, &bytes)?)
}

/// GET /api/files/:id
async fn get_file(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<files::FileRow> {
    let conn = state.lock()?;
    ok(files::get_file(&conn, &session, &id)?)
}

/// DELETE /api/files/:id
async fn delete_file(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let conn = state.lock()?;
    files::delete_file(&conn, state.store.as_ref(), &session, &id)?;
    ok(())
}

/// GET /api/files/:id/download - signed URL, valid for one hour
async fn download_url(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<DownloadResponse> {
    let conn = state.lock()?;
    let url = files::file_download_url(&conn, state.store.as_ref(), &session, &id)?;
    ok(DownloadResponse { url })
}

/// POST /api/files/:id/process
async fn process_file(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<files::FileRow> {
    let file = processing::process_file(&state.db, state.processor.as_ref(), &session, &id).await?;
    ok(file)
}

/// GET /api/files/:id/records
async fn file_records(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<Vec<records::Record>> {
    let conn = state.lock()?;
    ok(records::records_by_file(&conn, &session, &id)?)
}

// ============================================================================
// Record handlers
// ============================================================================

/// GET /api/records
async fn list_records(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(options): Query<ListOptions>,
) -> ApiResult<records::RecordPage> {
    let conn = state.lock()?;
    ok(records::list_records(&conn, &session, &options)?)
}

/// GET /api/records/stats
async fn record_stats(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(query): Query<FileQuery>,
) -> ApiResult<records::RecordStats> {
    let conn = state.lock()?;
    ok(records::record_stats(&conn, &session, query.file_id.as_deref())?)
}

/// GET /api/records/export - CSV download
async fn export_records(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let conn = state.lock()?;
    let csv = records::export_records(&conn, &session, query.file_id.as_deref())?;
    Ok(csv_response("records.csv", csv))
}

// ============================================================================
// Merge handlers
// ============================================================================

/// GET /api/merge
async fn list_merge_jobs(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<Vec<merge::MergeJobDetail>> {
    let conn = state.lock()?;
    ok(merge::list_merge_jobs(&conn, &session)?)
}

/// POST /api/merge
async fn create_merge_job(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<CreateMergeRequest>,
) -> ApiResult<merge::MergeJobDetail> {
    let mut conn = state.lock()?;
    ok(merge::create_merge_job(&mut conn, &session, body.name.as_deref(), &body.file_ids)?)
}

/// GET /api/merge/:id
async fn get_merge_job(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<merge::MergeJobDetail> {
    let conn = state.lock()?;
    ok(merge::get_merge_job(&conn, &session, &id)?)
}

/// DELETE /api/merge/:id
async fn delete_merge_job(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let conn = state.lock()?;
    merge::delete_merge_job(&conn, &session, &id)?;
    ok(())
}

/// GET /api/merge/:id/result
async fn merge_result(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<merge::MergeResult> {
    let conn = state.lock()?;
    ok(merge::get_merge_result(&conn, &session, &id)?)
}

/// GET /api/merge/:id/export - CSV download
async fn export_merge(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let conn = state.lock()?;
    let result = merge::get_merge_result(&conn, &session, &id)?;
    let csv = merge::export_merge_to_csv(&result.records)?;
    Ok(csv_response(&format!("{}.csv", result.job.job.name), csv))
}

/// POST /api/merge/:id/export-file
async fn export_merge_file(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> ApiResult<merge::MergeJobDetail> {
    let mut conn = state.lock()?;
    ok(merge::export_merge_to_file(&mut conn, state.store.as_ref(), &session, &id)?)
}

/// PUT /api/merge/:id/status
async fn update_merge_status(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    Json(body): Json<MergeStatusRequest>,
) -> ApiResult<merge::MergeJobDetail> {
    let conn = state.lock()?;
    ok(merge::update_merge_job_status(&conn, &session, &id, body.status)?)
}

// ============================================================================
// Navigation & storage
// ============================================================================

/// GET /api/route-guard?path=
async fn route_guard(MaybeSession(session): MaybeSession, Query(query): Query<GuardQuery>) -> ApiResult<GuardResponse> {
    let decision = routes::guard(&query.path, session.as_ref());
    let location = decision.location();
    ok(GuardResponse { decision, location })
}

/// GET /storage/:bucket/*path?expires=&signature=
async fn signed_download(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let valid = state
        .store
        .signer()
        .verify(&bucket, &key, query.expires, &query.signature, Utc::now());
    if !valid {
        return Err(AppError::Forbidden("invalid or expired signature".to_string()).into());
    }

    let bytes = state.store.read(&bucket, &key)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from(bytes),
    )
        .into_response())
}

// ============================================================================
// Router
// ============================================================================

fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let upload_limit = MAX_FILE_SIZE as usize + 1024 * 1024;

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/auth/signup", post(sign_up))
        .route("/auth/signin", post(sign_in))
        .route("/auth/signout", post(sign_out))
        .route("/profile", get(get_profile).put(update_profile))
        .route("/profile/password", put(update_password))
        .route("/clients", get(list_clients))
        .route("/clients/invite", post(invite_client))
        .route("/clients/:id", axum::routing::delete(remove_client))
        .route("/clients/:id/resend", post(resend_invitation))
        .route("/clients/:id/status", put(update_client_status))
        .route("/invitations/:token", get(get_invitation))
        .route("/invitations/:token/accept", post(accept_invitation))
        .route(
            "/files",
            get(list_files)
                .post(upload_file)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/:id", get(get_file).delete(delete_file))
        .route("/files/:id/download", get(download_url))
        .route("/files/:id/process", post(process_file))
        .route("/files/:id/records", get(file_records))
        .route("/records", get(list_records))
        .route("/records/stats", get(record_stats))
        .route("/records/export", get(export_records))
        .route("/merge", get(list_merge_jobs).post(create_merge_job))
        .route("/merge/:id", get(get_merge_job).delete(delete_merge_job))
        .route("/merge/:id/result", get(merge_result))
        .route("/merge/:id/export", get(export_merge))
        .route("/merge/:id/export-file", post(export_merge_file))
        .route("/merge/:id/status", put(update_merge_status))
        .route("/route-guard", get(route_guard));

    let mut app = Router::new()
        .nest("/api", api_routes)
        .route("/storage/:bucket/*path", get(signed_download))
        .with_state(state);

    // Single-page frontend: unknown paths fall back to index.html
    if let Some(dir) = static_dir {
        let index = dir.join("index.html");
        app = app.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)));
    }

    app.layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "ledger-server")]
#[command(version)]
#[command(about = "Ledger Desk HTTP API", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🌐 Ledger Desk - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let conn = open_database(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    log::info!("Database opened: {}", config.database.path.display());

    let store = open_store(&config)?;
    let processor = RemoteFunctionProcessor::new(&config.processing)?;
    log::info!("Processing endpoint: {}", processor.endpoint());

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        store: Arc::new(store),
        processor: Arc::new(processor),
        auth: AuthSettings::from_config(&config.auth),
    };
    let app = build_router(state, config.server.static_dir.clone());

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    println!("\n🚀 Server running on {}", config.server.public_url);
    println!("   API: {}/api/health", config.server.public_url);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use ledger_desk::db::to_db_time;
    use ledger_desk::{AppResult, NewRecord, ProcessOutcome};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct FixedProcessor;

    #[async_trait]
    impl FileProcessor for FixedProcessor {
        async fn process(&self, _file_id: &str) -> AppResult<ProcessOutcome> {
            let row = |nalog: &str, data: &str, dolguja: &str, invoice: &str| NewRecord {
                nalog: Some(nalog.to_string()),
                data: Some(data.to_string()),
                dolguja: Some(dolguja.to_string()),
                invoice_number: Some(invoice.to_string()),
                ..NewRecord::default()
            };
            Ok(ProcessOutcome {
                records: vec![
                    row("1", "2024-01-02", "100", "INV-1"),
                    row("2", "2024-01-01", "50", "INV-2"),
                ],
            })
        }
    }

    struct TestApp {
        app: Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let conn = Connection::open_in_memory().unwrap();
        ledger_desk::setup_database(&conn).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            db: Arc::new(Mutex::new(conn)),
            store: Arc::new(LocalObjectStore::new(dir.path(), "http://localhost:3000", "secret")),
            processor: Arc::new(FixedProcessor),
            auth: AuthSettings {
                password_iterations: 1_000,
                session_ttl: chrono::Duration::hours(1),
            },
        };
        TestApp {
            app: build_router(state.clone(), None),
            state,
            _dir: dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = send(app, request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn sign_up_as(app: &Router, email: &str, role: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/auth/signup",
            None,
            Some(json!({ "email": email, "password": "password123", "role": role })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn upload(app: &Router, token: &str, name: &str, content: &str) -> Value {
        let boundary = "ledgerdeskboundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{n}\"\r\n\
             Content-Type: text/csv\r\n\r\n{c}\r\n--{b}--\r\n",
            b = boundary,
            n = name,
            c = content
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/files")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, bytes) = send(app, request).await;
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::OK, "{}", value);
        value["data"].clone()
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app();
        let (status, body) = call(&t.app, "GET", "/api/health", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_profile_requires_token() {
        let t = test_app();
        let token = sign_up_as(&t.app, "acc@example.com", "accountant").await;

        let (status, body) = call(&t.app, "GET", "/api/profile", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, body) = call(&t.app, "GET", "/api/profile", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["role"], "accountant");

        call(&t.app, "POST", "/api/auth/signout", Some(&token), None).await;
        let (status, _) = call(&t.app, "GET", "/api/profile", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signup_validation_is_bad_request() {
        let t = test_app();
        let (status, body) = call(
            &t.app,
            "POST",
            "/api/auth/signup",
            None,
            Some(json!({ "email": "nope", "password": "1" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_client_cannot_use_merge_api() {
        let t = test_app();
        let token = sign_up_as(&t.app, "client@example.com", "client").await;

        let (status, body) = call(&t.app, "GET", "/api/merge", Some(&token), None).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_invitation_flow_and_expiry() {
        let t = test_app();
        let accountant = sign_up_as(&t.app, "acc@example.com", "accountant").await;
        let client = sign_up_as(&t.app, "client@example.com", "client").await;

        let (_, invite) = call(
            &t.app,
            "POST",
            "/api/clients/invite",
            Some(&accountant),
            Some(json!({ "email": "client@example.com" })),
        )
        .await;
        let token = invite["data"]["invite_token"].as_str().unwrap().to_string();

        let (status, found) = call(&t.app, "GET", &format!("/api/invitations/{}", token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["data"]["profile"]["email"], "acc@example.com");

        let (status, _) = call(
            &t.app,
            "POST",
            &format!("/api/invitations/{}/accept", token),
            Some(&client),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // A second invitation that has run out
        let (_, second) = call(
            &t.app,
            "POST",
            "/api/clients/invite",
            Some(&accountant),
            Some(json!({ "email": "later@example.com" })),
        )
        .await;
        let id = second["data"]["id"].as_str().unwrap().to_string();
        let late_token = second["data"]["invite_token"].as_str().unwrap().to_string();
        {
            let conn = t.state.db.lock().unwrap();
            conn.execute(
                "UPDATE client_relationships SET expires_at = ?1 WHERE id = ?2",
                rusqlite::params![to_db_time(Utc::now() - chrono::Duration::seconds(1)), id],
            )
            .unwrap();
        }

        let (status, body) =
            call(&t.app, "GET", &format!("/api/invitations/{}", late_token), None, None).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["error"], "Invitation has expired");
        assert_eq!(body["code"], "INVITATION_EXPIRED");

        let (_, listed) = call(&t.app, "GET", "/api/clients", Some(&accountant), None).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_process_merge_and_export() {
        let t = test_app();
        let token = sign_up_as(&t.app, "acc@example.com", "accountant").await;

        let jan = upload(&t.app, &token, "jan.csv", "a,b").await;
        let feb = upload(&t.app, &token, "feb.csv", "c,d").await;
        assert_eq!(jan["status"], "uploaded");

        for file in [&jan, &feb] {
            let uri = format!("/api/files/{}/process", file["id"].as_str().unwrap());
            let (status, body) = call(&t.app, "POST", &uri, Some(&token), None).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            assert_eq!(body["data"]["status"], "processed");
            assert_eq!(body["data"]["record_count"], 2);
        }

        let (_, page) = call(&t.app, "GET", "/api/records?limit=3&sort_desc=false", Some(&token), None).await;
        assert_eq!(page["data"]["total"], 4);
        assert_eq!(page["data"]["total_pages"], 2);

        let (status, job) = call(
            &t.app,
            "POST",
            "/api/merge",
            Some(&token),
            Some(json!({ "name": "Q1", "fileIds": [jan["id"], feb["id"]] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", job);
        let job_id = job["data"]["id"].as_str().unwrap().to_string();

        let (_, result) = call(&t.app, "GET", &format!("/api/merge/{}/result", job_id), Some(&token), None).await;
        let stats = &result["data"]["stats"];
        assert_eq!(stats["totalRecords"], 4);
        assert_eq!(stats["totalDolguja"], 300.0);
        assert_eq!(stats["balance"], -300.0);
        assert_eq!(stats["overlapCount"], 2);
        assert_eq!(stats["bySource"]["jan.csv"]["count"], 2);

        let request = Request::builder()
            .uri(format!("/api/merge/{}/export", job_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = send(&t.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let csv = String::from_utf8(bytes).unwrap();
        assert!(csv.starts_with("Извор,Налог,Дата"));
        assert_eq!(csv.lines().count(), 5);

        let (status, exported) = call(
            &t.app,
            "POST",
            &format!("/api/merge/{}/export-file", job_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", exported);
        assert_eq!(exported["data"]["status"], "completed");
        assert_eq!(exported["data"]["output_file"]["file_type"], "csv");
    }

    #[tokio::test]
    async fn test_merge_needs_two_files() {
        let t = test_app();
        let token = sign_up_as(&t.app, "acc@example.com", "accountant").await;
        let only = upload(&t.app, &token, "jan.csv", "a").await;

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/merge",
            Some(&token),
            Some(json!({ "file_ids": [only["id"]] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_signed_download() {
        let t = test_app();
        let token = sign_up_as(&t.app, "acc@example.com", "accountant").await;
        let file = upload(&t.app, &token, "jan.csv", "hello").await;

        let (_, body) = call(
            &t.app,
            "GET",
            &format!("/api/files/{}/download", file["id"].as_str().unwrap()),
            Some(&token),
            None,
        )
        .await;
        let url = body["data"]["url"].as_str().unwrap();
        let path = url.strip_prefix("http://localhost:3000").unwrap().to_string();

        let request = Request::builder().uri(&path).body(Body::empty()).unwrap();
        let (status, bytes) = send(&t.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"hello");

        let tampered = path.replace("/uploads/", "/exports/");
        let request = Request::builder().uri(&tampered).body(Body::empty()).unwrap();
        let (status, _) = send(&t.app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_route_guard_endpoint() {
        let t = test_app();
        let client = sign_up_as(&t.app, "client@example.com", "client").await;

        let (_, body) = call(&t.app, "GET", "/api/route-guard?path=%2Ffiles", None, None).await;
        assert_eq!(body["data"]["decision"]["action"], "redirect_to_login");
        assert_eq!(body["data"]["decision"]["redirect"], "/files");

        let (_, body) = call(&t.app, "GET", "/api/route-guard?path=%2Fmerge", Some(&client), None).await;
        assert_eq!(body["data"]["decision"]["action"], "redirect_to_dashboard");
        assert_eq!(body["data"]["location"], "/");

        let (_, body) = call(&t.app, "GET", "/api/route-guard?path=%2Ffiles", Some(&client), None).await;
        assert_eq!(body["data"]["decision"]["action"], "allow");
    }
}
