use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NoSession,
    RunActive,
    AgentNotReady,
    AgentFailure,
    WorkspaceError,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:workbench:error:invalid_request",
            Self::NoSession => "urn:workbench:error:no_session",
            Self::RunActive => "urn:workbench:error:run_active",
            Self::AgentNotReady => "urn:workbench:error:agent_not_ready",
            Self::AgentFailure => "urn:workbench:error:agent_failure",
            Self::WorkspaceError => "urn:workbench:error:workspace_error",
            Self::StreamError => "urn:workbench:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NoSession => "No Session",
            Self::RunActive => "Run Active",
            Self::AgentNotReady => "Agent Not Ready",
            Self::AgentFailure => "Agent Failure",
            Self::WorkspaceError => "Workspace Error",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NoSession => 404,
            Self::RunActive => 409,
            Self::AgentNotReady => 409,
            Self::AgentFailure => 502,
            Self::WorkspaceError => 500,
            Self::StreamError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Errors crossing the agent boundary. The coordinator treats the agent as
/// opaque, so these carry text, not structure.
#[derive(Debug, Clone, Error, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum AgentError {
    #[error("agent initialization failed: {0}")]
    Init(String),
    #[error("{0}")]
    Call(String),
    #[error("cannot infer llm source for model: {0}")]
    UnknownSource(String),
}

#[derive(Debug, Error)]
pub enum WorkbenchError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("No session assigned. Create a session before asking a question.")]
    NoSession { session_id: String },
    #[error("a task is already running for session {session_id}")]
    RunActive { session_id: String },
    #[error("agent not initialized: {message}")]
    AgentNotReady {
        session_id: String,
        message: String,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("workspace error: {message}")]
    Workspace { message: String },
    #[error("stream error: {message}")]
    Stream { message: String },
}

impl WorkbenchError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NoSession { .. } => ErrorType::NoSession,
            Self::RunActive { .. } => ErrorType::RunActive,
            Self::AgentNotReady { .. } => ErrorType::AgentNotReady,
            Self::Agent(_) => ErrorType::AgentFailure,
            Self::Workspace { .. } => ErrorType::WorkspaceError,
            Self::Stream { .. } => ErrorType::StreamError,
        }
    }

    /// Text shown to the person at the workbench, as opposed to the wire
    /// detail. For most variants the two coincide.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::NoSession { session_id }
            | Self::RunActive { session_id }
            | Self::AgentNotReady { session_id, .. } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<WorkbenchError> for ProblemDetails {
    fn from(value: WorkbenchError) -> Self {
        value.to_problem_details()
    }
}

impl From<&WorkbenchError> for ProblemDetails {
    fn from(value: &WorkbenchError) -> Self {
        value.to_problem_details()
    }
}
