// ⚙️ Processing - turn an uploaded file into records via a remote function
//
// Flow: uploaded → processing → (remote call) → processed | error
// The connection is only borrowed around the synchronous steps, never while
// the remote call is in flight.

use crate::auth::Session;
use crate::config::ProcessingConfig;
use crate::error::{AppError, AppResult};
use crate::files::{get_file, update_file_status, FileRow, FileStatus};
use crate::records::{insert_records, NewRecord};
use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Records extracted from one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOutcome {
    #[serde(default)]
    pub records: Vec<NewRecord>,
}

#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, file_id: &str) -> AppResult<ProcessOutcome>;
}

// ============================================================================
// REMOTE FUNCTION
// ============================================================================

/// Calls `POST {functions_url}/functions/v1/process-file` with `{"fileId": ...}`
pub struct RemoteFunctionProcessor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RemoteFunctionProcessor {
    pub fn new(config: &ProcessingConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Remote(e.to_string()))?;

        Ok(RemoteFunctionProcessor {
            client,
            endpoint: format!(
                "{}/functions/v1/process-file",
                config.functions_url.trim_end_matches('/')
            ),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl FileProcessor for RemoteFunctionProcessor {
    async fn process(&self, file_id: &str) -> AppResult<ProcessOutcome> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "fileId": file_id }));
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Remote(remote_error_message(status.as_u16(), &body)));
        }

        response
            .json::<ProcessOutcome>()
            .await
            .map_err(|e| AppError::Remote(format!("invalid response: {}", e)))
    }
}

/// Prefer the function's own `{"error": "..."}` message when it sends one
fn remote_error_message(status: u16, body: &str) -> String {
    let reported = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));
    match reported {
        Some(message) => message,
        None if body.trim().is_empty() => format!("process-file returned HTTP {}", status),
        None => format!("process-file returned HTTP {}: {}", status, body.trim()),
    }
}

// ============================================================================
// STATE TRANSITIONS
// ============================================================================

/// Owner check and `processing` status
pub fn begin_processing(conn: &Connection, session: &Session, file_id: &str) -> AppResult<FileRow> {
    get_file(conn, session, file_id)?;
    update_file_status(conn, file_id, FileStatus::Processing, None, None)
}

/// Store the extracted records and mark the file `processed`
pub fn complete_processing(
    conn: &mut Connection,
    file: &FileRow,
    outcome: &ProcessOutcome,
) -> AppResult<FileRow> {
    let inserted = insert_records(conn, &file.id, &file.owner_id, &outcome.records)?;
    log::info!("Processed {}: {} records", file.file_name, inserted);
    update_file_status(
        conn,
        &file.id,
        FileStatus::Processed,
        Some(inserted as i64),
        None,
    )
}

/// Mark the file `error`; the original failure is returned to the caller
pub fn fail_processing(conn: &Connection, file_id: &str, error: AppError) -> AppError {
    log::warn!("Processing {} failed: {}", file_id, error);
    if let Err(e) = update_file_status(
        conn,
        file_id,
        FileStatus::Error,
        None,
        Some(&error.to_string()),
    ) {
        log::error!("Could not mark {} as failed: {}", file_id, e);
    }
    error
}

fn lock(conn: &Mutex<Connection>) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| AppError::Storage("database lock poisoned".to_string()))
}

/// Full processing run over a shared connection
pub async fn process_file(
    conn: &Mutex<Connection>,
    processor: &dyn FileProcessor,
    session: &Session,
    file_id: &str,
) -> AppResult<FileRow> {
    let file = {
        let guard = lock(conn)?;
        begin_processing(&guard, session, file_id)?
    };

    let outcome = processor.process(file_id).await;

    let mut guard = lock(conn)?;
    match outcome {
        Ok(outcome) => match complete_processing(&mut guard, &file, &outcome) {
            Ok(file) => Ok(file),
            Err(e) => Err(fail_processing(&guard, file_id, e)),
        },
        Err(e) => Err(fail_processing(&guard, file_id, e)),
    }
}
