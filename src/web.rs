//! HTTP JSON API.
//!
//! Routes, served both at the root and under `/api/v1/rag`:
//! - `POST /ingest` multipart upload, field `file`
//! - `GET /documents`
//! - `DELETE /documents/{id}`
//! - `POST /reset`
//! - `POST /chat` with `{query, session_id?}`
//! - `GET /status`
//!
//! Cross-origin requests are allowed from any origin so a browser client
//! on another port can call the API.

use std::sync::Arc;

use axum::{
    Json,
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::{
    deletion::DeleteOutcome,
    error::{Error, Result},
    query::ChatAnswer,
    service::{DocService, StatusReport},
};

/// Prefix the browser client uses.
pub const API_PREFIX: &str = "/api/v1/rag";

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub id: String,
    pub filename: String,
    pub message: String,
    pub chunks_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub documents: Vec<DocumentSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Crate errors rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateId(_) => StatusCode::CONFLICT,
            Error::Ingest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(service: Arc<DocService>) -> Router {
    let body_limit = service.settings().max_upload_bytes + MULTIPART_OVERHEAD;
    let routes = Router::new()
        .route("/ingest", post(ingest))
        .route("/documents", get(list_documents))
        .route("/documents/{id}", delete(delete_document))
        .route("/reset", post(reset))
        .route("/chat", post(chat))
        .route("/status", get(status));

    Router::new()
        .merge(routes.clone())
        .nest(API_PREFIX, routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve the API on `bind` until Ctrl-C. Runs the reconciler in the
/// background when `reconcile.interval_secs` is non-zero.
pub async fn serve(service: Arc<DocService>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %listener.local_addr()?, "listening");

    let reconcile_task = service
        .reconciler()
        .spawn_periodic(service.settings().reconcile_interval);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;

    if let Some(task) = reconcile_task {
        task.abort();
    }
    Ok(())
}

async fn ingest(
    State(service): State<Arc<DocService>>,
    mut multipart: Multipart,
) -> ApiResult<IngestResponse> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(Error::Validation("missing multipart field 'file'".into()).into());
    };

    let report = service.ingest(&filename, bytes.to_vec()).await?;
    Ok(Json(IngestResponse {
        id: report.id,
        filename: report.filename,
        message: report.message,
        chunks_count: report.chunk_count,
    }))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    Error::Validation(format!("invalid upload: {}", err.body_text())).into()
}

async fn list_documents(
    State(service): State<Arc<DocService>>,
) -> ApiResult<ListFilesResponse> {
    let documents: Vec<DocumentSummary> = service
        .list()
        .await?
        .into_iter()
        .map(|r| DocumentSummary {
            id: r.id,
            filename: r.filename,
        })
        .collect();
    Ok(Json(ListFilesResponse {
        count: documents.len(),
        documents,
    }))
}

async fn delete_document(
    State(service): State<Arc<DocService>>,
    Path(id): Path<String>,
) -> ApiResult<MessageResponse> {
    match service.delete(&id).await? {
        outcome @ DeleteOutcome::Deleted { .. } => Ok(Json(MessageResponse {
            message: outcome.message(),
        })),
        DeleteOutcome::NotFound { id } => Err(Error::NotFound {
            kind: "document",
            name: id,
        }
        .into()),
    }
}

async fn reset(State(service): State<Arc<DocService>>) -> ApiResult<MessageResponse> {
    let report = service.reset().await?;
    Ok(Json(MessageResponse {
        message: format!(
            "Reset complete: removed {} documents and {} chunks",
            report.documents_removed, report.chunks_removed
        ),
    }))
}

async fn chat(
    State(service): State<Arc<DocService>>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatAnswer> {
    let answer = service
        .chat(&request.query, request.session_id.as_deref())
        .await?;
    Ok(Json(answer))
}

async fn status(State(service): State<Arc<DocService>>) -> ApiResult<StatusReport> {
    Ok(Json(service.status().await?))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        data_dir::DataDir,
        service::Components,
        settings::Settings,
    };

    const BOUNDARY: &str = "docubot-test-boundary";

    fn test_service(tmp: &tempfile::TempDir) -> Arc<DocService> {
        let settings = Settings {
            max_upload_bytes: 1024,
            ..Settings::default()
        };
        let components = Components::from_settings(&settings).unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        Arc::new(DocService::with_components(data_dir, settings, components).unwrap())
    }

    fn upload(filename: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             {content}\r\n\
             --{BOUNDARY}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/ingest")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send<T: serde::de::DeserializeOwned>(
        service: &Arc<DocService>,
        request: Request<Body>,
    ) -> (StatusCode, T) {
        let response = router(service.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn ingest_list_chat_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);

        let (status, ingested): (_, IngestResponse) = send(
            &service,
            upload("refund-policy.md", "Refunds are issued within thirty days."),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ingested.filename, "refund-policy.md");
        assert_eq!(ingested.message, "Ingest successfully!");
        assert_eq!(ingested.chunks_count, 1);

        let (status, listed): (_, ListFilesResponse) =
            send(&service, empty_request("GET", "/documents")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.count, 1);
        assert_eq!(listed.documents[0].id, ingested.id);

        let (status, answer): (_, serde_json::Value) = send(
            &service,
            json_request(
                "POST",
                "/chat",
                serde_json::json!({"query": "What is the refund policy?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["sources"], serde_json::json!(["refund-policy.md"]));
        assert_eq!(answer["topic_changed"], true);

        let uri = format!("/documents/{}", ingested.id);
        let (status, _): (_, MessageResponse) =
            send(&service, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, err): (_, ErrorBody) =
            send(&service, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(err.error.contains(&ingested.id));
    }

    #[tokio::test]
    async fn prefixed_routes_match_root_routes() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);

        let mut request = upload("faq.md", "Support answers within one day.");
        *request.uri_mut() = format!("{API_PREFIX}/ingest").parse().unwrap();
        let (status, ingested): (_, IngestResponse) =
            send(&service, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ingested.filename, "faq.md");

        let (status, answer): (_, serde_json::Value) = send(
            &service,
            json_request(
                "POST",
                &format!("{API_PREFIX}/chat"),
                serde_json::json!({"query": "How fast does support answer?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["sources"], serde_json::json!(["faq.md"]));

        let (status, listed): (_, ListFilesResponse) =
            send(&service, empty_request("GET", "/documents")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.count, 1);
    }

    #[tokio::test]
    async fn cross_origin_requests_are_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri(format!("{API_PREFIX}/chat"))
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();
        let response = router(service.clone()).oneshot(preflight).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );

        let mut request = json_request(
            "POST",
            "/chat",
            serde_json::json!({"query": "hello"}),
        );
        request
            .headers_mut()
            .insert("origin", "http://localhost:5173".parse().unwrap());
        let response = router(service).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn chat_without_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);

        let (status, answer): (_, serde_json::Value) = send(
            &service,
            json_request("POST", "/chat", serde_json::json!({"query": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["answer"], crate::query::NO_DOCUMENTS_ANSWER);
        assert_eq!(answer["sources"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);

        let (status, err): (_, ErrorBody) = send(
            &service,
            json_request("POST", "/chat", serde_json::json!({"query": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err.error.contains("query"));

        let (status, _): (_, ErrorBody) =
            send(&service, upload("empty.md", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_empties_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let service = test_service(&tmp);
        let (_, _): (_, IngestResponse) =
            send(&service, upload("a.md", "alpha")).await;

        let (status, message): (_, MessageResponse) =
            send(&service, empty_request("POST", "/reset")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(message.message.contains("1 documents"));

        let (_, listed): (_, ListFilesResponse) =
            send(&service, empty_request("GET", "/documents")).await;
        assert_eq!(listed.count, 0);
    }

    #[test]
    fn error_status_mapping() {
        let status = |e: Error| ApiError(e).status();
        assert_eq!(status(Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(Error::NotFound {
                kind: "document",
                name: "x".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(Error::Timeout {
                operation: "route",
                after: std::time::Duration::from_secs(1)
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(Error::external("answerer", "503", true)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(Error::external("answerer", "401", false)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
