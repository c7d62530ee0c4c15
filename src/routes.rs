use crate::config::Config;
use crate::credential::CredentialStore;
use crate::models::{ArtifactFormat, BookMetadata, Chapter, RunState};
use crate::run::{RunContext, RunError, RunStatus};
use crate::services::chapterizer::{Chapterizer, RunRequest};
use crate::services::llm::LLMClient;
use crate::services::review::check_edited;
use crate::services::sink::{DirectorySink, bundle_directory};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::{Html, IntoResponse, Json},
    routing::{get, post, put},
};
use http::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub run: Arc<RunContext>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let credentials = CredentialStore::new(config.api_key.clone());
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            run: Arc::new(RunContext::new()),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

fn conflict(err: RunError) -> ApiError {
    api_error(StatusCode::CONFLICT, err.to_string())
}

fn ok() -> Json<Value> {
    Json(json!({ "success": true }))
}

pub fn build_router(state: AppState) -> Router {
    let downloads = ServeDir::new(&state.config.output_dir);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/api-key", put(set_api_key).delete(clear_api_key))
        .route("/upload", post(upload_pdf))
        .route("/status", get(run_status))
        .route("/report", get(run_report))
        .route("/chapters", post(confirm_chapters))
        .route("/cancel", post(cancel_run))
        .route("/reset", post(reset_run))
        .route("/archive/:run_id", get(download_archive))
        .nest_service("/download", downloads)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
}

async fn index() -> Html<&'static str> {
    Html(
        r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>Textbook Chapter Q&amp;A Service</title>
        <meta charset="utf-8">
        <style>
            body { font-family: Arial, sans-serif; margin: 40px; }
            .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
            .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
        </style>
    </head>
    <body>
        <h1>Textbook Chapter Q&amp;A Service</h1>

        <div class="info-box">
            <h2>Service Information</h2>
            <p>Upload a textbook PDF. The table of contents is read by a language model,
            the book is split into one PDF per chapter, and the questions of every chapter
            are extracted and classified.</p>
        </div>

        <h2>Available Endpoints:</h2>
        <div class="endpoint">GET / - This information page</div>
        <div class="endpoint">GET /health - Health check</div>
        <div class="endpoint">PUT /api-key - Set the model API key</div>
        <div class="endpoint">DELETE /api-key - Clear the model API key</div>
        <div class="endpoint">POST /upload - Start a run</div>
        <div class="endpoint">GET /status - Current run as JSON</div>
        <div class="endpoint">GET /report - Current run as a page</div>
        <div class="endpoint">POST /chapters - Confirm a reviewed chapter list</div>
        <div class="endpoint">POST /cancel - Stop the current run</div>
        <div class="endpoint">POST /reset - Clear a finished run</div>
        <div class="endpoint">GET /download/{run_id}/{file} - One generated file</div>
        <div class="endpoint">GET /archive/{run_id} - Every generated file as a zip</div>

        <h2>How to Use:</h2>
        <p>POST a multipart form to /upload with a 'pdf_file', a 'board' and a 'subject'.
        Optional fields: 'format' (markdown or question_bank) and 'review' (true to confirm
        the chapter list before slicing). Then poll /status.</p>
    </body>
    </html>
    "#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
struct ApiKeyRequest {
    api_key: String,
}

async fn set_api_key(
    State(state): State<AppState>,
    Json(request): Json<ApiKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.credentials.set(&request.api_key) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "API key must not be empty.",
        ));
    }
    info!("API key updated");
    Ok(ok())
}

async fn clear_api_key(State(state): State<AppState>) -> Json<Value> {
    state.credentials.clear();
    // An active run keeps going with the key it started with.
    if state.run.reset().is_ok() {
        info!("API key cleared, run state reset");
    } else {
        info!("API key cleared");
    }
    ok()
}

#[derive(Default)]
struct UploadForm {
    pdf: Option<Vec<u8>>,
    file_name: Option<String>,
    content_type: Option<String>,
    board: String,
    subject: String,
    format: Option<String>,
    review: bool,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let bad_request = |e: axum::extract::multipart::MultipartError| {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        };
        let mut form = UploadForm::default();

        while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "pdf_file" => {
                    form.file_name = field.file_name().map(str::to_string);
                    form.content_type = field.content_type().map(str::to_string);
                    form.pdf = Some(field.bytes().await.map_err(bad_request)?.to_vec());
                }
                "board" => form.board = field.text().await.map_err(bad_request)?,
                "subject" => form.subject = field.text().await.map_err(bad_request)?,
                "format" => form.format = Some(field.text().await.map_err(bad_request)?),
                "review" => {
                    let value = field.text().await.map_err(bad_request)?;
                    form.review = matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "true" | "1" | "yes" | "on"
                    );
                }
                _ => {}
            }
        }

        Ok(form)
    }
}

/// Either the declared type says PDF or the header appears near the start.
fn looks_like_pdf(bytes: &[u8], content_type: Option<&str>) -> bool {
    if content_type == Some("application/pdf") {
        return !bytes.is_empty();
    }
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|window| window == b"%PDF-")
}

async fn upload_pdf(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let form = UploadForm::read(multipart).await?;

    let metadata = BookMetadata {
        board: form.board.trim().to_string(),
        subject: form.subject.trim().to_string(),
    };
    if !metadata.is_complete() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Please select board and enter subject before analyzing.",
        ));
    }

    let Some(pdf) = form.pdf else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Please upload a PDF file."));
    };
    if !looks_like_pdf(&pdf, form.content_type.as_deref()) {
        warn!(
            "Rejected upload {:?}: not a PDF",
            form.file_name.as_deref().unwrap_or("unnamed")
        );
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Please upload a valid PDF file.",
        ));
    }

    let format = match form.format.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value
            .parse::<ArtifactFormat>()
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?,
        _ => state.config.pipeline.default_format,
    };

    let api_key = state.credentials.get();
    if state.config.llm.provider.requires_api_key() && api_key.is_none() {
        return Err(api_error(
            StatusCode::PRECONDITION_FAILED,
            "Please set your API key before analyzing.",
        ));
    }
    let client = LLMClient::new(state.config.llm.clone(), api_key)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let file_name = form.file_name.unwrap_or_else(|| "upload.pdf".to_string());
    let run_id = state
        .run
        .begin(&file_name, metadata.clone())
        .map_err(conflict)?;

    let sink = match DirectorySink::new(state.config.output_dir.join(run_id.to_string())) {
        Ok(sink) => sink,
        Err(e) => {
            state.run.fail(&e.to_string());
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    info!(
        "Starting run {run_id} for {file_name} ({} bytes, {format:?}, review: {}), writing to {}",
        pdf.len(),
        form.review,
        sink.dir().display()
    );
    let client = Arc::new(client);
    let chapterizer = Chapterizer::new(
        client.clone(),
        client,
        sink,
        state.config.pipeline.clone(),
    );
    let request = RunRequest {
        pdf,
        metadata,
        format,
        review: form.review,
    };
    let run = state.run.clone();
    spawn_run(state.run.clone(), async move {
        chapterizer.process_book(&run, request).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "run_id": run_id,
            "status_url": "/status",
            "archive_url": format!("/archive/{run_id}")
        })),
    ))
}

/// Drive a run in the background. If the task dies without settling the
/// run, it is marked as failed so `/reset` and `/upload` work again.
fn spawn_run<F>(run: Arc<RunContext>, pipeline: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let worker = tokio::spawn(pipeline);
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!("Run task aborted: {e}");
            if run.state().is_active() {
                run.fail("The run stopped unexpectedly.");
            }
        }
    });
}

async fn run_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.run.snapshot())
}

async fn run_report(State(state): State<AppState>) -> Html<String> {
    Html(render_report(&state.run.snapshot()))
}

fn render_report(status: &RunStatus) -> String {
    use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

    let mut chapters = String::new();
    for chapter in &status.chapters {
        chapters.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            text(&chapter.title),
            chapter.start_page,
            chapter.end_page
        ));
    }

    let mut artifacts = String::new();
    if let Some(run_id) = status.run_id {
        for file in &status.artifacts {
            let href = format!("/download/{run_id}/{file}");
            artifacts.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                attr(&href),
                text(file)
            ));
        }
    }

    let error = status
        .error
        .as_deref()
        .map(|e| format!("<p class=\"error\">{}</p>", text(e)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Run Report</title>
    <meta charset="utf-8">
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        .error {{ color: #b00020; }}
        pre {{ background-color: #f5f5f5; padding: 10px; border-radius: 4px; }}
        td {{ padding: 2px 12px; }}
    </style>
</head>
<body>
    <h1>Run Report</h1>
    <p><b>File:</b> {file}</p>
    <p><b>State:</b> {state}</p>
    <p><b>Progress:</b> {progress}</p>
    {error}
    <h2>Chapters</h2>
    <table>
        <tr><th>Title</th><th>Start</th><th>End</th></tr>
        {chapters}
    </table>
    <h2>Files</h2>
    <ul>
        {artifacts}
    </ul>
    <h2>Log</h2>
    <pre>{log}</pre>
</body>
</html>
"#,
        file = text(status.file_name.as_deref().unwrap_or("-")),
        state = status.state.as_str(),
        progress = text(&status.progress),
        log = text(&status.log.join("\n")),
    )
}

#[derive(Deserialize)]
struct ConfirmChapters {
    chapters: Vec<Chapter>,
}

async fn confirm_chapters(
    State(state): State<AppState>,
    Json(request): Json<ConfirmChapters>,
) -> Result<Json<Value>, ApiError> {
    if state.run.state() != RunState::ReviewingChapters {
        return Err(conflict(RunError::NotReviewing));
    }
    if request.chapters.is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "At least one chapter is required.",
        ));
    }

    let issues = check_edited(&request.chapters, state.config.pipeline.page_cap);
    if !issues.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "error": "Please fix the highlighted chapters.",
                "issues": issues
            })),
        ));
    }

    state
        .run
        .submit_review(request.chapters)
        .map_err(conflict)?;
    Ok(ok())
}

async fn cancel_run(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.run.cancel().map_err(conflict)?;
    Ok(ok())
}

async fn reset_run(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.run.reset().map_err(conflict)?;
    Ok(ok())
}

async fn download_archive(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let dir = state.config.output_dir.join(run_id.to_string());
    if !dir.is_dir() {
        return Err(api_error(StatusCode::NOT_FOUND, "Unknown run."));
    }

    let bytes = tokio::task::spawn_blocking(move || bundle_directory(&dir))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{run_id}.zip\""),
            ),
        ],
        bytes,
    ))
}
