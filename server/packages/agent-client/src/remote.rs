//! HTTP adapter for agents served by an external research engine. The
//! engine hosts the actual biomedical agent; this side only forwards the
//! narrow capability surface the coordinator consumes.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use workbench_error::AgentError;

use crate::{AgentSettings, CustomDataEntry, IntermediateOutput, LlmSource, ResearchAgent};

/// Control and accessor calls fail fast; the blocking `run` call has no
/// client-side deadline (the coordinator's watchdog bounds it).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug)]
pub struct RemoteAgent {
    endpoint: String,
    agent_id: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CreateAgentRequest<'a> {
    model: &'a str,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    data_path: String,
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct CreateAgentResponse {
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    question: &'a str,
    workspace: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    answer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentStateResponse {
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    intermediate_outputs: Vec<IntermediateOutput>,
    #[serde(default)]
    current_step: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddDataRequest<'a> {
    name: &'a str,
    description: &'a str,
}

impl RemoteAgent {
    /// Registers an agent on the engine with the session's settings bundle.
    /// Any failure here becomes the session's `agent_init_error`.
    pub fn connect(settings: &AgentSettings, source: LlmSource) -> Result<Self, AgentError> {
        let endpoint = settings
            .engine_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                AgentError::Init(format!(
                    "source {} needs a research engine url and none is configured",
                    source.as_str()
                ))
            })?;
        let client = Client::builder()
            .timeout(None)
            .build()
            .map_err(|err| AgentError::Init(format!("build http client: {err}")))?;

        let request = CreateAgentRequest {
            model: &settings.model,
            source: source.as_str(),
            base_url: settings.base_url.as_deref(),
            api_key: settings.api_key.as_deref(),
            data_path: settings.data_path.display().to_string(),
            verbose: settings.verbose,
        };
        let response = client
            .post(format!("{endpoint}/v1/agents"))
            .timeout(CONTROL_TIMEOUT)
            .json(&request)
            .send()
            .map_err(|err| AgentError::Init(format!("reach research engine: {err}")))?;
        let response = check_status(response).map_err(|err| AgentError::Init(err.to_string()))?;
        let created: CreateAgentResponse = response
            .json()
            .map_err(|err| AgentError::Init(format!("decode engine response: {err}")))?;

        Ok(Self {
            endpoint,
            agent_id: created.agent_id,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/agents/{}{}", self.endpoint, self.agent_id, path);
        self.client.request(method, url)
    }

    fn fetch_state(&self) -> AgentStateResponse {
        let result = self
            .request(Method::GET, "/state")
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport_error)
            .and_then(check_status)
            .and_then(|response| {
                response
                    .json::<AgentStateResponse>()
                    .map_err(|err| AgentError::Call(format!("decode agent state: {err}")))
            });
        match result {
            Ok(state) => state,
            Err(err) => {
                tracing::debug!(agent_id = %self.agent_id, error = %err, "agent state poll failed");
                AgentStateResponse::default()
            }
        }
    }

    fn post_control(&self, path: &str) -> Result<(), AgentError> {
        let response = self
            .request(Method::POST, path)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport_error)?;
        check_status(response).map(|_| ())
    }
}

impl ResearchAgent for RemoteAgent {
    fn run(&self, question: &str, workspace: &Path) -> Result<Option<String>, AgentError> {
        let request = RunRequest {
            question,
            workspace: workspace.display().to_string(),
        };
        let response = self
            .request(Method::POST, "/run")
            .json(&request)
            .send()
            .map_err(transport_error)?;
        let response = check_status(response)?;
        let finished: RunResponse = response
            .json()
            .map_err(|err| AgentError::Call(format!("decode run response: {err}")))?;
        Ok(finished.answer)
    }

    fn execution_logs(&self) -> Vec<String> {
        self.fetch_state().logs
    }

    fn intermediate_outputs(&self) -> Vec<IntermediateOutput> {
        self.fetch_state().intermediate_outputs
    }

    fn current_step(&self) -> Option<String> {
        self.fetch_state().current_step
    }

    fn clear_execution_logs(&self) {
        if let Err(err) = self.post_control("/logs/clear") {
            tracing::debug!(agent_id = %self.agent_id, error = %err, "clearing agent logs failed");
        }
    }

    fn stop(&self) -> Result<(), AgentError> {
        self.post_control("/stop")
    }

    fn add_data(&self, name: &str, description: &str) -> Result<(), AgentError> {
        let response = self
            .request(Method::POST, "/data")
            .timeout(CONTROL_TIMEOUT)
            .json(&AddDataRequest { name, description })
            .send()
            .map_err(transport_error)?;
        check_status(response).map(|_| ())
    }

    fn list_custom_data(&self) -> Result<Vec<CustomDataEntry>, AgentError> {
        let response = self
            .request(Method::GET, "/data")
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport_error)?;
        let response = check_status(response)?;
        response
            .json()
            .map_err(|err| AgentError::Call(format!("decode custom data list: {err}")))
    }

    fn remove_custom_data(&self, name: &str) -> Result<bool, AgentError> {
        let response = self
            .request(Method::DELETE, &format!("/data/{name}"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).map(|_| true)
    }
}

fn transport_error(err: reqwest::Error) -> AgentError {
    AgentError::Call(format!("research engine request failed: {err}"))
}

fn check_status(response: Response) -> Result<Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    Err(AgentError::Call(format!(
        "research engine returned {status}: {body}"
    )))
}
