use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use futures::{stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use workbench_agent_client::{CustomDataEntry, LlmSource, ResearchAgent};
use workbench_error::{AgentError, ErrorType, ProblemDetails, WorkbenchError};

use crate::scanner::GeneratedFile;
use crate::sessions::{
    CreateSessionOptions, RunUpdate, SessionInfo, SessionManager,
};

pub struct AppState {
    session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(session_manager: SessionManager) -> Self {
        Self {
            session_manager: Arc::new(session_manager),
        }
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:session_id",
            post(create_session_with_id).delete(delete_session),
        )
        .route("/sessions/:session_id/query", post(post_query))
        .route("/sessions/:session_id/stop", post(post_stop))
        .route("/sessions/:session_id/events", get(get_updates))
        .route("/sessions/:session_id/events/sse", get(get_updates_sse))
        .route("/sessions/:session_id/files", get(get_files))
        .route(
            "/sessions/:session_id/data",
            get(list_custom_data).post(add_custom_data),
        )
        .route(
            "/sessions/:session_id/data/:name",
            delete(remove_custom_data),
        )
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("WORKBENCH_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("WORKBENCH_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_sessions,
        create_session,
        create_session_with_id,
        delete_session,
        post_query,
        post_stop,
        get_updates,
        get_updates_sse,
        get_files,
        list_custom_data,
        add_custom_data,
        remove_custom_data
    ),
    components(
        schemas(
            HealthResponse,
            SessionInfo,
            SessionListResponse,
            CreateSessionRequest,
            CreateSessionResponse,
            QueryRequest,
            QueryResponse,
            UpdatesQuery,
            SseQuery,
            UpdatesResponse,
            RunUpdate,
            FilesResponse,
            GeneratedFile,
            AddDataRequest,
            DataListResponse,
            CustomDataEntry,
            RemoveDataResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session management"),
        (name = "runs", description = "Question runs and their update streams"),
        (name = "data", description = "Custom data catalog")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:7860")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Workbench(#[from] WorkbenchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Workbench(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub agent_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_error: Option<String>,
    pub results_dir: String,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SseQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesResponse {
    pub updates: Vec<RunUpdate>,
    pub has_more: bool,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesResponse {
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddDataRequest {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataListResponse {
    pub entries: Vec<CustomDataEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveDataResponse {
    pub removed: bool,
}

const WORKBENCH_INFO: &str = "\
This is a Research Workbench server. Available endpoints:\n\
  - GET  /              - Server info\n\
  - GET  /v1/health     - Health check\n\
  - GET  /v1/sessions   - Session listing\n\n\
Create a session, POST a question to /v1/sessions/{id}/query, and read\n\
progress from /v1/sessions/{id}/events or the /events/sse stream.";

async fn get_root() -> &'static str {
    WORKBENCH_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{WORKBENCH_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let sessions = state.session_manager.list_sessions().await;
    Json(SessionListResponse { sessions })
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, body = CreateSessionResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    create_session_inner(&state, request.session_id.clone(), request).await
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, body = CreateSessionResponse),
        (status = 400, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Client session id")),
    tag = "sessions"
)]
async fn create_session_with_id(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    request: Option<Json<CreateSessionRequest>>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    if request
        .session_id
        .as_ref()
        .is_some_and(|body_id| body_id != &session_id)
    {
        return Err(WorkbenchError::InvalidRequest {
            message: "session id in path and body disagree".to_string(),
        }
        .into());
    }
    create_session_inner(&state, Some(session_id), request).await
}

async fn create_session_inner(
    state: &AppState,
    session_id: Option<String>,
    request: CreateSessionRequest,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let source = request.source.as_deref().map(parse_source).transpose()?;
    let options = CreateSessionOptions {
        model: request.model,
        source,
        base_url: request.base_url,
        api_key: request.api_key,
        verbose: request.verbose,
    };
    let created = state
        .session_manager
        .create_session(session_id, options)
        .await?;
    Ok(Json(CreateSessionResponse {
        session_id: created.session_id,
        agent_ready: created.agent_ready,
        agent_error: created.agent_error,
        results_dir: created.results_dir.to_string_lossy().to_string(),
        evicted: created.evicted,
    }))
}

fn parse_source(value: &str) -> Result<LlmSource, WorkbenchError> {
    LlmSource::parse(value).ok_or_else(|| {
        let known = LlmSource::all()
            .iter()
            .map(|source| source.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        WorkbenchError::InvalidRequest {
            message: format!("unknown llm source {value:?}, expected one of: {known}"),
        }
    })
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.session_manager.remove_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/query",
    request_body = QueryRequest,
    responses(
        (status = 202, body = QueryResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "runs"
)]
async fn post_query(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<(StatusCode, Json<QueryResponse>), ApiError> {
    let run_id = state
        .session_manager()
        .start_run(&session_id, &request.question)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(QueryResponse { run_id })))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/stop",
    responses(
        (status = 202, description = "Stop requested"),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "runs"
)]
async fn post_stop(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.session_manager.stop_run(&session_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("offset" = Option<u64>, Query, description = "Last seen update sequence (exclusive)"),
        ("limit" = Option<u64>, Query, description = "Max updates to return")
    ),
    responses(
        (status = 200, body = UpdatesResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn get_updates(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<UpdatesResponse>, ApiError> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.map(|limit| limit as usize);
    let page = state
        .session_manager
        .updates_after(&session_id, offset, limit)
        .await?;
    Ok(Json(UpdatesResponse {
        updates: page.updates,
        has_more: page.has_more,
        last_sequence: page.last_sequence,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events/sse",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("offset" = Option<u64>, Query, description = "Last seen update sequence (exclusive)")
    ),
    responses((status = 200, description = "SSE update stream")),
    tag = "runs"
)]
async fn get_updates_sse(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let offset = query.offset.unwrap_or(0);
    let subscription = state
        .session_manager
        .subscribe_updates(&session_id, offset)
        .await?;

    let initial_stream = stream::iter(
        subscription
            .initial
            .into_iter()
            .map(|update| Ok::<Event, Infallible>(to_sse_event(update))),
    );

    let live_stream = BroadcastStream::new(subscription.receiver).filter_map(|result| async move {
        match result {
            Ok(update) => Some(Ok::<Event, Infallible>(to_sse_event(update))),
            Err(_) => None,
        }
    });

    let stream = initial_stream.chain(live_stream);
    Ok(Sse::new(stream))
}

fn to_sse_event(update: RunUpdate) -> Event {
    Event::default()
        .json_data(&update)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/files",
    responses(
        (status = 200, body = FilesResponse),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_files(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<FilesResponse>, ApiError> {
    let files = state.session_manager.session_files(&session_id).await?;
    Ok(Json(FilesResponse { files }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/data",
    responses(
        (status = 200, body = DataListResponse),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "data"
)]
async fn list_custom_data(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<DataListResponse>, ApiError> {
    let agent = state.session_manager.agent_handle(&session_id).await?;
    let entries = call_agent(agent, |agent| agent.list_custom_data()).await?;
    Ok(Json(DataListResponse { entries }))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/data",
    request_body = AddDataRequest,
    responses(
        (status = 204, description = "Data entry registered"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "data"
)]
async fn add_custom_data(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<AddDataRequest>,
) -> Result<StatusCode, ApiError> {
    if request.name.trim().is_empty() {
        return Err(WorkbenchError::InvalidRequest {
            message: "data entry name must not be empty".to_string(),
        }
        .into());
    }
    let agent = state.session_manager.agent_handle(&session_id).await?;
    call_agent(agent, move |agent| {
        agent.add_data(&request.name, &request.description)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}/data/{name}",
    responses(
        (status = 200, body = RemoveDataResponse),
        (status = 404, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("name" = String, Path, description = "Data entry name")
    ),
    tag = "data"
)]
async fn remove_custom_data(
    State(state): State<Arc<AppState>>,
    Path((session_id, name)): Path<(String, String)>,
) -> Result<Json<RemoveDataResponse>, ApiError> {
    let agent = state.session_manager.agent_handle(&session_id).await?;
    let removed = call_agent(agent, move |agent| agent.remove_custom_data(&name)).await?;
    Ok(Json(RemoveDataResponse { removed }))
}

/// Runs one synchronous agent call on the blocking pool.
async fn call_agent<T, F>(agent: Arc<dyn ResearchAgent>, op: F) -> Result<T, WorkbenchError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ResearchAgent) -> Result<T, AgentError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || op(agent.as_ref()))
        .await
        .map_err(|err| AgentError::Call(format!("agent task failed: {err}")))?;
    Ok(result?)
}
