use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RuntimeConfig;
use crate::router::{
    build_router_with_state, AppState, FilesResponse, HealthResponse, SessionListResponse,
};
use crate::sessions::SessionManager;
use workbench_agent_client::{AgentSettings, LlmSource};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7860;

#[derive(Parser, Debug)]
#[command(name = "workbench-server", bin_name = "workbench-server")]
#[command(about = "Session-scoped coordinator for the research workbench", version)]
#[command(arg_required_else_help = true)]
pub struct WorkbenchCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the workbench HTTP server.
    Serve(ServeArgs),
    /// Call the HTTP API of a running server without writing client code.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Shared data store linked into every session workspace.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Parent directory for per-session working directories.
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Default model for sessions that do not pick their own.
    #[arg(long, default_value = "mock")]
    model: String,

    /// Default llm source; inferred from the model name when omitted.
    #[arg(long)]
    source: Option<String>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    /// Endpoint of the research engine service backing non-mock agents.
    #[arg(long)]
    engine_url: Option<String>,

    #[arg(long)]
    verbose_agent: bool,

    #[arg(long, default_value_t = 10)]
    max_sessions: usize,

    #[arg(long, default_value_t = 5)]
    keep_newest: usize,

    /// Cadence at which agent progress is sampled, in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// How long a stop waits for the worker before giving up on
    /// confirmation, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    stop_join_timeout_ms: u64,

    /// Watchdog ceiling on a single run, in seconds.
    #[arg(long, default_value_t = 3600)]
    max_run_secs: u64,

    #[arg(long, default_value_t = 64)]
    scan_max_depth: usize,

    #[arg(long, default_value_t = 10_000)]
    scan_max_files: usize,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Check the server is up.
    Health(ClientArgs),
    /// List sessions.
    Sessions(ClientArgs),
    /// List the files a session's runs have produced.
    Files(FilesArgs),
}

#[derive(Args, Debug)]
pub struct FilesArgs {
    session_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run() -> Result<(), CliError> {
    let cli = WorkbenchCli::parse();
    init_logging();
    match &cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Api(subcommand) => run_api(&subcommand.command),
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_serve(args: &ServeArgs) -> Result<(), CliError> {
    let config = build_config(args)?;
    let manager = SessionManager::new(config);
    manager.ensure_shared_store()?;

    let state = Arc::new(AppState::new(manager));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(args)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", args.host, args.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_config(args: &ServeArgs) -> Result<RuntimeConfig, CliError> {
    let source = match args.source.as_deref() {
        Some(value) => Some(LlmSource::parse(value).ok_or_else(|| {
            CliError::InvalidConfig(format!("unknown llm source: {value}"))
        })?),
        None => None,
    };
    Ok(RuntimeConfig {
        data_dir: args.data_dir.clone(),
        results_root: args.results_dir.clone(),
        max_sessions: args.max_sessions,
        keep_newest: args.keep_newest,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        stop_join_timeout: Duration::from_millis(args.stop_join_timeout_ms),
        max_run_duration: Duration::from_secs(args.max_run_secs),
        scan_max_depth: args.scan_max_depth,
        scan_max_files: args.scan_max_files,
        agent_defaults: AgentSettings {
            model: args.model.clone(),
            source,
            base_url: args.base_url.clone(),
            api_key: args.api_key.clone(),
            data_path: args.data_dir.clone(),
            verbose: args.verbose_agent,
            engine_url: args.engine_url.clone(),
        },
    })
}

fn build_cors_layer(args: &ServeArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origins allowed, so cross-origin requests stay rejected.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    cors = cors.allow_methods(Any).allow_headers(Any);
    Ok(cors)
}

fn run_api(command: &ApiCommand) -> Result<(), CliError> {
    match command {
        ApiCommand::Health(args) => {
            let client = ClientContext::new(args)?;
            let response = client.get(&format!("{API_PREFIX}/health"))?;
            print_json_response::<HealthResponse>(response)
        }
        ApiCommand::Sessions(args) => {
            let client = ClientContext::new(args)?;
            let response = client.get(&format!("{API_PREFIX}/sessions"))?;
            print_json_response::<SessionListResponse>(response)
        }
        ApiCommand::Files(args) => {
            let client = ClientContext::new(&args.client)?;
            let response = client.get(&format!(
                "{API_PREFIX}/sessions/{}/files",
                args.session_id
            ))?;
            print_json_response::<FilesResponse>(response)
        }
    }
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.client.request(Method::GET, self.url(path)).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
