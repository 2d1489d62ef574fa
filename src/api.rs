// Scores REST API
// Upload, statistics and chart endpoints over a single shared SQLite connection.

use crate::chart::render_subject_mean_chart;
use crate::db::{self, UploadEvent};
use crate::error::ImportError;
use crate::reconciliation::{import_upload, ImportReport};
use crate::stats::{self, StudentStat, SubjectExtremes, SubjectStat, TopPerformer};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    /// Wrap an opened, schema-ready connection
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("database mutex poisoned")))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Serialize)]
struct Detail {
    detail: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// Client sent something we can't use (400)
    BadRequest(String),
    /// Nothing to aggregate yet (404 "No data")
    NoData,
    /// Anything else; logged, never shown to the client (500)
    Internal(anyhow::Error),
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Store(inner) => ApiError::Internal(inner),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => {
                warn!(%msg, "rejected request");
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::NoData => (StatusCode::NOT_FOUND, "No data".to_string()),
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(Detail { detail })).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

/// GET /health
async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// POST /scores/upload - multipart field `file`
async fn upload_scores(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ImportReport>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;

    let report = {
        let mut conn = state.conn()?;
        import_upload(&mut conn, &filename, &bytes)?
    };

    Ok(Json(report))
}

fn load_relation(state: &AppState) -> Result<Vec<db::ScoreRecord>, ApiError> {
    let conn = state.conn()?;
    Ok(stats::build_relation(&conn)?)
}

/// GET /stats/subjects
async fn subject_stats(State(state): State<AppState>) -> Result<Json<Vec<SubjectStat>>, ApiError> {
    let relation = load_relation(&state)?;
    Ok(Json(stats::per_subject_stats(&relation)))
}

/// GET /stats/students
async fn student_stats(State(state): State<AppState>) -> Result<Json<Vec<StudentStat>>, ApiError> {
    let relation = load_relation(&state)?;
    Ok(Json(stats::per_student_stats(&relation)))
}

/// GET /top-performer
async fn top_performer(State(state): State<AppState>) -> Result<Json<TopPerformer>, ApiError> {
    let relation = load_relation(&state)?;
    stats::top_performer(&relation)
        .map(Json)
        .ok_or(ApiError::NoData)
}

/// GET /subjects/extremes
async fn subject_extremes(
    State(state): State<AppState>,
) -> Result<Json<SubjectExtremes>, ApiError> {
    let relation = load_relation(&state)?;
    stats::subject_extremes(&relation)
        .map(Json)
        .ok_or(ApiError::NoData)
}

/// GET /charts/subjects-mean
async fn subjects_mean_chart(State(state): State<AppState>) -> Result<Response, ApiError> {
    let relation = load_relation(&state)?;
    if relation.is_empty() {
        return Err(ApiError::NoData);
    }

    let png = render_subject_mean_chart(&relation)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// GET /uploads - upload history, newest first
async fn upload_history(State(state): State<AppState>) -> Result<Json<Vec<UploadEvent>>, ApiError> {
    let conn = state.conn()?;
    Ok(Json(db::get_upload_events(&conn)?))
}

// ============================================================================
// Router
// ============================================================================

/// All API routes with permissive CORS and request tracing
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scores/upload", post(upload_scores))
        .route("/stats/subjects", get(subject_stats))
        .route("/stats/students", get(student_stats))
        .route("/top-performer", get(top_performer))
        .route("/subjects/extremes", get(subject_extremes))
        .route("/charts/subjects-mean", get(subjects_mean_chart))
        .route("/uploads", get(upload_history))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-SCORES-TEST-BOUNDARY";

    fn test_app() -> Router {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        router(AppState::new(conn))
    }

    fn upload_request(filename: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        );

        Request::builder()
            .method("POST")
            .uri("/scores/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, json) = send_json(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_empty_store_behavior() {
        let app = test_app();

        let (status, json) = send_json(&app, get_request("/stats/subjects")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));

        let (status, json) = send_json(&app, get_request("/stats/students")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));

        for uri in ["/top-performer", "/subjects/extremes", "/charts/subjects-mean"] {
            let (status, json) = send_json(&app, get_request(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(json, serde_json::json!({"detail": "No data"}));
        }
    }

    #[tokio::test]
    async fn test_upload_long_then_stats() {
        let app = test_app();

        let (status, json) = send_json(
            &app,
            upload_request(
                "scores.csv",
                "student_name,subject,score\nAlice,Math,80\nBob,Math,90\nCara,Math,100\nAlice,Art,60\n",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"status": "ok", "rows_imported": 4}));

        let (_, json) = send_json(&app, get_request("/stats/subjects")).await;
        assert_eq!(json[0]["subject"], "Art");
        assert_eq!(json[1]["subject"], "Math");
        assert_eq!(json[1]["mean"], 90.0);
        assert_eq!(json[1]["stddev"], 10.0);
        assert_eq!(json[1]["count"], 3);

        let (status, json) = send_json(&app, get_request("/top-performer")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"student": "Cara", "average": 100.0}));

        let (_, json) = send_json(&app, get_request("/subjects/extremes")).await;
        assert_eq!(json["highest_subject"]["subject"], "Math");
        assert_eq!(json["lowest_subject"]["subject"], "Art");
    }

    #[tokio::test]
    async fn test_upload_wide_reports_subjects() {
        let app = test_app();

        let (status, json) = send_json(
            &app,
            upload_request("wide.csv", "student_name,Math,Science\nBob,70,\nEve,80,85\n"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({"status": "ok", "rows_imported": 2, "subjects_detected": 2})
        );
    }

    #[tokio::test]
    async fn test_upload_client_errors_are_400() {
        let app = test_app();

        let (status, json) =
            send_json(&app, upload_request("scores.txt", "student_name,subject,score\n")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("Use CSV or Excel"));

        let (status, json) =
            send_json(&app, upload_request("scores.csv", "name,Math\nBob,70\n")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("student_name"));

        let (status, json) = send_json(
            &app,
            upload_request("scores.csv", "student_name,subject,score\nBob,Math,seventy\n"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().starts_with("Failed to read file"));

        // Nothing from the failed uploads is visible
        let (_, json) = send_json(&app, get_request("/stats/students")).await;
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let app = test_app();
        let body = format!("--{b}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{b}--\r\n", b = BOUNDARY);
        let request = Request::builder()
            .method("POST")
            .uri("/scores/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "Missing 'file' field");
    }

    #[tokio::test]
    async fn test_chart_returns_png() {
        let app = test_app();
        send(
            &app,
            upload_request("scores.csv", "student_name,subject,score\nAlice,Math,80\n"),
        )
        .await;

        let response = app
            .clone()
            .oneshot(get_request("/charts/subjects-mean"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_upload_history() {
        let app = test_app();
        send(
            &app,
            upload_request("first.csv", "student_name,subject,score\nAlice,Math,80\n"),
        )
        .await;
        send(&app, upload_request("second.csv", "student_name,Math\nBob,70\n")).await;

        let (status, json) = send_json(&app, get_request("/uploads")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["filename"], "second.csv");
        assert_eq!(json[0]["layout"], "wide");
        assert_eq!(json[1]["filename"], "first.csv");
    }
}
