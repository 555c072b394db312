use std::path::PathBuf;
use std::time::Duration;

use workbench_agent_client::AgentSettings;

/// Runtime knobs for the coordinator. `cli::run` builds one from flags;
/// `Default` is the shape the test harness starts from.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Shared data store linked into every session workspace.
    pub data_dir: PathBuf,
    /// Parent directory for per-session working directories.
    pub results_root: PathBuf,
    /// Session count that triggers eviction of the least recently active.
    pub max_sessions: usize,
    /// How many of the most recently active sessions eviction keeps.
    pub keep_newest: usize,
    /// Cadence at which agent progress is sampled during a run.
    pub poll_interval: Duration,
    /// How long a stop waits for the worker to confirm before the run is
    /// reported as stop-unconfirmed and left to finish detached.
    pub stop_join_timeout: Duration,
    /// Watchdog ceiling on a single run.
    pub max_run_duration: Duration,
    pub scan_max_depth: usize,
    pub scan_max_files: usize,
    /// Template for new sessions; per-request overrides are merged on top.
    pub agent_defaults: AgentSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            results_root: PathBuf::from("results"),
            max_sessions: 10,
            keep_newest: 5,
            poll_interval: Duration::from_millis(500),
            stop_join_timeout: Duration::from_secs(5),
            max_run_duration: Duration::from_secs(3600),
            scan_max_depth: 64,
            scan_max_files: 10_000,
            agent_defaults: AgentSettings {
                model: "mock".to_string(),
                source: None,
                base_url: None,
                api_key: None,
                data_path: PathBuf::from("data"),
                verbose: false,
                engine_url: None,
            },
        }
    }
}
