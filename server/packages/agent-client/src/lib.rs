use std::path::{Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use workbench_error::AgentError;

pub mod mock;
pub mod remote;

pub use mock::{MockAgent, MockFinish, MockScript};
pub use remote::RemoteAgent;

/// Model families assumed to be served by a local Ollama install when
/// auto-detecting.
const OPEN_WEIGHT_FAMILIES: &[&str] = &[
    "llama", "mistral", "qwen", "gemma", "phi", "dolphin", "orca", "vicuna",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum LlmSource {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure-openai")]
    AzureOpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "custom")]
    Custom,
    #[serde(rename = "mock")]
    Mock,
}

impl LlmSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmSource::OpenAi => "openai",
            LlmSource::AzureOpenAi => "azure-openai",
            LlmSource::Anthropic => "anthropic",
            LlmSource::Ollama => "ollama",
            LlmSource::Gemini => "gemini",
            LlmSource::Custom => "custom",
            LlmSource::Mock => "mock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(LlmSource::OpenAi),
            "azure-openai" => Some(LlmSource::AzureOpenAi),
            "anthropic" => Some(LlmSource::Anthropic),
            "ollama" => Some(LlmSource::Ollama),
            "gemini" => Some(LlmSource::Gemini),
            "custom" => Some(LlmSource::Custom),
            "mock" => Some(LlmSource::Mock),
            _ => None,
        }
    }

    pub fn all() -> &'static [LlmSource] {
        &[
            LlmSource::OpenAi,
            LlmSource::AzureOpenAi,
            LlmSource::Anthropic,
            LlmSource::Ollama,
            LlmSource::Gemini,
            LlmSource::Custom,
            LlmSource::Mock,
        ]
    }
}

/// Resolve the provider for a model name: mock names short-circuit to the
/// in-process agent, then well-known prefixes, then "custom serving if a
/// base url is set", then open-weights names route to Ollama. Anything else
/// is a hard error so a typo never silently picks a provider.
pub fn infer_source(model: &str, base_url: Option<&str>) -> Result<LlmSource, AgentError> {
    if model == "mock" || model.starts_with("mock:") {
        return Ok(LlmSource::Mock);
    }
    if model.starts_with("claude-") {
        return Ok(LlmSource::Anthropic);
    }
    if model.starts_with("gpt-") {
        return Ok(LlmSource::OpenAi);
    }
    if model.starts_with("gemini-") {
        return Ok(LlmSource::Gemini);
    }
    if base_url.is_some() {
        return Ok(LlmSource::Custom);
    }
    let lower = model.to_lowercase();
    if model.contains('/') || OPEN_WEIGHT_FAMILIES.iter().any(|name| lower.contains(name)) {
        return Ok(LlmSource::Ollama);
    }
    Err(AgentError::UnknownSource(model.to_string()))
}

/// Configuration bundle handed to the agent at construction. The coordinator
/// passes these through without interpreting them (the agent owns its own
/// LLM wiring); only `source` resolution happens on this side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub model: String,
    pub source: Option<LlmSource>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub data_path: PathBuf,
    pub verbose: bool,
    /// Endpoint of the research engine service backing non-mock agents.
    pub engine_url: Option<String>,
}

impl AgentSettings {
    pub fn resolved_source(&self) -> Result<LlmSource, AgentError> {
        match self.source {
            Some(source) => Ok(source),
            None => infer_source(&self.model, self.base_url.as_deref()),
        }
    }
}

/// One unit of agent-reported progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct IntermediateOutput {
    pub step: u32,
    pub message_type: String,
    pub timestamp: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CustomDataEntry {
    pub name: String,
    pub description: String,
}

/// Capability surface of the research agent. The coordinator never sees
/// inside the agent: it starts one blocking run at a time, samples the
/// accessors from another thread while the run executes, and asks for a
/// best-effort stop. Implementations must keep the accessors safe to call
/// concurrently with `run`.
pub trait ResearchAgent: Send + Sync {
    /// Blocking entry point. `workspace` is the absolute directory the agent
    /// should write artifacts into for this run. `Ok(None)` means the run
    /// finished without producing an answer.
    fn run(&self, question: &str, workspace: &Path) -> Result<Option<String>, AgentError>;

    fn execution_logs(&self) -> Vec<String>;

    fn intermediate_outputs(&self) -> Vec<IntermediateOutput>;

    fn current_step(&self) -> Option<String>;

    fn clear_execution_logs(&self);

    /// Ask the agent to wind down the current run. Cooperative; the run may
    /// take a while to notice.
    fn stop(&self) -> Result<(), AgentError>;

    fn add_data(&self, name: &str, description: &str) -> Result<(), AgentError>;

    fn list_custom_data(&self) -> Result<Vec<CustomDataEntry>, AgentError>;

    /// Returns false when no entry of that name exists.
    fn remove_custom_data(&self, name: &str) -> Result<bool, AgentError>;
}

impl std::fmt::Debug for dyn ResearchAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ResearchAgent")
    }
}

/// Construct the agent a session binds to. Mock agents run in-process;
/// every real provider source is served by the remote research engine.
pub fn build_agent(settings: &AgentSettings) -> Result<Arc<dyn ResearchAgent>, AgentError> {
    let source = settings.resolved_source()?;
    match source {
        LlmSource::Mock => Ok(Arc::new(MockAgent::new(MockScript::from_model_spec(
            &settings.model,
        )))),
        _ => {
            let agent = RemoteAgent::connect(settings, source)?;
            Ok(Arc::new(agent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_source_from_model_prefixes() {
        assert_eq!(infer_source("mock", None).unwrap(), LlmSource::Mock);
        assert_eq!(
            infer_source("mock:500:answer:ok", None).unwrap(),
            LlmSource::Mock
        );
        assert_eq!(
            infer_source("claude-3-5-sonnet-20241022", None).unwrap(),
            LlmSource::Anthropic
        );
        assert_eq!(infer_source("gpt-4o", None).unwrap(), LlmSource::OpenAi);
        assert_eq!(
            infer_source("gemini-2.0-flash", None).unwrap(),
            LlmSource::Gemini
        );
    }

    #[test]
    fn base_url_routes_to_custom_serving() {
        assert_eq!(
            infer_source("sglang-served", Some("http://localhost:8000/v1")).unwrap(),
            LlmSource::Custom
        );
    }

    #[test]
    fn open_weight_names_route_to_ollama() {
        assert_eq!(infer_source("llama3.1:70b", None).unwrap(), LlmSource::Ollama);
        assert_eq!(
            infer_source("org/finetuned-model", None).unwrap(),
            LlmSource::Ollama
        );
        assert_eq!(infer_source("Qwen2.5-72B", None).unwrap(), LlmSource::Ollama);
    }

    #[test]
    fn unknown_model_is_an_error_not_a_guess() {
        let err = infer_source("mystery-model", None).unwrap_err();
        assert!(matches!(err, AgentError::UnknownSource(_)));
    }

    #[test]
    fn explicit_source_wins_over_inference() {
        let settings = AgentSettings {
            model: "claude-3-5-sonnet-20241022".to_string(),
            source: Some(LlmSource::Custom),
            base_url: Some("http://localhost:8000/v1".to_string()),
            api_key: None,
            data_path: PathBuf::from("/tmp/data"),
            verbose: false,
            engine_url: None,
        };
        assert_eq!(settings.resolved_source().unwrap(), LlmSource::Custom);
    }

    #[test]
    fn source_names_round_trip() {
        for source in LlmSource::all() {
            assert_eq!(LlmSource::parse(source.as_str()), Some(*source));
        }
        assert_eq!(LlmSource::parse("watsonx"), None);
    }
}
