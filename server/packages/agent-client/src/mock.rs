use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use workbench_error::AgentError;

use crate::{CustomDataEntry, IntermediateOutput, ResearchAgent};

const RUN_SLICE: Duration = Duration::from_millis(20);

/// How a scripted run ends.
#[derive(Debug, Clone)]
pub enum MockFinish {
    Answer(String),
    NoResult,
    Fail(String),
    Panic(String),
}

/// Script for one mock run: emit `logs` and `outputs` spread evenly over
/// `run_for`, write `artifacts` into the workspace, then finish as told.
#[derive(Debug, Clone)]
pub struct MockScript {
    pub run_for: Duration,
    pub logs: Vec<String>,
    pub outputs: Vec<String>,
    pub artifacts: Vec<(String, String)>,
    pub finish: MockFinish,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            run_for: Duration::from_secs(2),
            logs: vec![
                "parsing question".to_string(),
                "selecting tools".to_string(),
                "running analysis".to_string(),
                "summarizing findings".to_string(),
            ],
            outputs: vec![
                "Loaded the shared data catalog.".to_string(),
                "Drafted an analysis plan.".to_string(),
            ],
            artifacts: Vec::new(),
            finish: MockFinish::Answer("Mock analysis complete.".to_string()),
        }
    }
}

impl MockScript {
    /// Builds a script from a mock model string so callers can shape a run
    /// without touching this crate's types. Accepted forms:
    ///
    /// - `mock`
    /// - `mock:<run millis>`
    /// - `mock:<run millis>:answer:<text>` (also `fail:<text>`, `panic:<text>`, `noresult`)
    /// - any of the above with a trailing `:files=<a,b/c.csv>` list of artifacts
    ///
    /// Unrecognized pieces fall back to the defaults.
    pub fn from_model_spec(model: &str) -> Self {
        let mut script = MockScript::default();
        let Some(rest) = model.strip_prefix("mock") else {
            return script;
        };
        let mut rest = rest.strip_prefix(':').unwrap_or("");
        if let Some(at) = rest.rfind(":files=") {
            let list = &rest[at + ":files=".len()..];
            script.artifacts = list
                .split(',')
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), "generated by mock\n".to_string()))
                .collect();
            rest = &rest[..at];
        }
        if rest.is_empty() {
            return script;
        }
        let mut parts = rest.splitn(3, ':');
        if let Some(millis) = parts.next().and_then(|raw| raw.parse::<u64>().ok()) {
            script.run_for = Duration::from_millis(millis);
        }
        match (parts.next(), parts.next()) {
            (Some("answer"), Some(text)) => script.finish = MockFinish::Answer(text.to_string()),
            (Some("fail"), Some(text)) => script.finish = MockFinish::Fail(text.to_string()),
            (Some("panic"), Some(text)) => script.finish = MockFinish::Panic(text.to_string()),
            (Some("noresult"), _) => script.finish = MockFinish::NoResult,
            _ => {}
        }
        script
    }
}

#[derive(Debug, Default)]
struct MockState {
    logs: Vec<String>,
    outputs: Vec<IntermediateOutput>,
    current_step: Option<String>,
}

/// In-process agent driven by a [`MockScript`]. Used by the test suite and
/// by `--agent mock` demo sessions; behaves like the real agent from the
/// coordinator's point of view (blocking run, concurrently readable
/// accessors, cooperative stop).
#[derive(Debug)]
pub struct MockAgent {
    script: MockScript,
    state: Mutex<MockState>,
    custom_data: Mutex<BTreeMap<String, String>>,
    stop_requested: AtomicBool,
    stop_calls: AtomicU64,
}

impl MockAgent {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            state: Mutex::new(MockState::default()),
            custom_data: Mutex::new(BTreeMap::new()),
            stop_requested: AtomicBool::new(false),
            stop_calls: AtomicU64::new(0),
        }
    }

    /// Number of times `stop` has been called, for assertions on the
    /// redundant fast-path stop.
    pub fn stop_call_count(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn push_log(&self, line: &str) {
        let mut state = self.state.lock().expect("mock state lock");
        state.logs.push(line.to_string());
    }

    fn push_output(&self, index: usize, content: &str) {
        let step = (index + 1) as u32;
        let mut state = self.state.lock().expect("mock state lock");
        state.current_step = Some(format!("Step {step}"));
        state.outputs.push(IntermediateOutput {
            step,
            message_type: "observation".to_string(),
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            content: content.to_string(),
        });
    }

    fn write_artifacts(&self, workspace: &Path) -> Result<(), AgentError> {
        for (relative, contents) in &self.script.artifacts {
            let path = workspace.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| AgentError::Call(format!("write artifact {relative}: {err}")))?;
            }
            fs::write(&path, contents)
                .map_err(|err| AgentError::Call(format!("write artifact {relative}: {err}")))?;
        }
        Ok(())
    }
}

impl ResearchAgent for MockAgent {
    fn run(&self, question: &str, workspace: &Path) -> Result<Option<String>, AgentError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("mock state lock");
            state.outputs.clear();
            state.current_step = None;
        }
        self.push_log(&format!("received question: {question}"));

        let started = Instant::now();
        let total_logs = self.script.logs.len();
        let total_outputs = self.script.outputs.len();
        let mut emitted_logs = 0;
        let mut emitted_outputs = 0;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.push_log("stop requested, winding down");
                return Ok(None);
            }
            let elapsed = started.elapsed();
            let fraction = if self.script.run_for.is_zero() {
                1.0
            } else {
                (elapsed.as_secs_f64() / self.script.run_for.as_secs_f64()).min(1.0)
            };
            let due_logs = (fraction * total_logs as f64).ceil() as usize;
            while emitted_logs < due_logs {
                let line = self.script.logs[emitted_logs].clone();
                self.push_log(&line);
                emitted_logs += 1;
            }
            let due_outputs = (fraction * total_outputs as f64).ceil() as usize;
            while emitted_outputs < due_outputs {
                let content = self.script.outputs[emitted_outputs].clone();
                self.push_output(emitted_outputs, &content);
                emitted_outputs += 1;
            }
            if elapsed >= self.script.run_for {
                break;
            }
            thread::sleep(RUN_SLICE.min(self.script.run_for - elapsed));
        }

        self.write_artifacts(workspace)?;
        match &self.script.finish {
            MockFinish::Answer(answer) => Ok(Some(answer.clone())),
            MockFinish::NoResult => Ok(None),
            MockFinish::Fail(message) => Err(AgentError::Call(message.clone())),
            MockFinish::Panic(message) => panic!("{}", message),
        }
    }

    fn execution_logs(&self) -> Vec<String> {
        self.state.lock().expect("mock state lock").logs.clone()
    }

    fn intermediate_outputs(&self) -> Vec<IntermediateOutput> {
        self.state.lock().expect("mock state lock").outputs.clone()
    }

    fn current_step(&self) -> Option<String> {
        self.state
            .lock()
            .expect("mock state lock")
            .current_step
            .clone()
    }

    fn clear_execution_logs(&self) {
        let mut state = self.state.lock().expect("mock state lock");
        state.logs.clear();
        state.outputs.clear();
        state.current_step = None;
    }

    fn stop(&self) -> Result<(), AgentError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn add_data(&self, name: &str, description: &str) -> Result<(), AgentError> {
        self.custom_data
            .lock()
            .expect("mock data lock")
            .insert(name.to_string(), description.to_string());
        Ok(())
    }

    fn list_custom_data(&self) -> Result<Vec<CustomDataEntry>, AgentError> {
        let data = self.custom_data.lock().expect("mock data lock");
        Ok(data
            .iter()
            .map(|(name, description)| CustomDataEntry {
                name: name.clone(),
                description: description.clone(),
            })
            .collect())
    }

    fn remove_custom_data(&self, name: &str) -> Result<bool, AgentError> {
        Ok(self
            .custom_data
            .lock()
            .expect("mock data lock")
            .remove(name)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_script() -> MockScript {
        MockScript {
            run_for: Duration::from_millis(60),
            logs: vec!["one".to_string(), "two".to_string()],
            outputs: vec!["first".to_string()],
            artifacts: Vec::new(),
            finish: MockFinish::Answer("ok".to_string()),
        }
    }

    #[test]
    fn scripted_run_emits_logs_and_answer() {
        let agent = MockAgent::new(quick_script());
        let workspace = std::env::temp_dir();
        let answer = agent.run("hello", &workspace).unwrap();
        assert_eq!(answer.as_deref(), Some("ok"));
        let logs = agent.execution_logs();
        assert!(logs.iter().any(|line| line == "one"));
        assert!(logs.iter().any(|line| line == "two"));
        assert_eq!(agent.intermediate_outputs().len(), 1);
        assert_eq!(agent.current_step().as_deref(), Some("Step 1"));
    }

    #[test]
    fn stop_short_circuits_a_long_run() {
        let mut script = quick_script();
        script.run_for = Duration::from_secs(10);
        let agent = std::sync::Arc::new(MockAgent::new(script));

        let handle = {
            let agent = agent.clone();
            thread::spawn(move || agent.run("hello", &std::env::temp_dir()))
        };
        thread::sleep(Duration::from_millis(50));
        agent.stop().unwrap();
        let answer = handle.join().unwrap().unwrap();
        assert_eq!(answer, None);
        assert_eq!(agent.stop_call_count(), 1);
    }

    #[test]
    fn clear_resets_accessor_state() {
        let agent = MockAgent::new(quick_script());
        agent.run("hello", &std::env::temp_dir()).unwrap();
        assert!(!agent.execution_logs().is_empty());
        agent.clear_execution_logs();
        assert!(agent.execution_logs().is_empty());
        assert!(agent.intermediate_outputs().is_empty());
        assert_eq!(agent.current_step(), None);
    }

    #[test]
    fn model_spec_parsing() {
        let script = MockScript::from_model_spec("mock");
        assert_eq!(script.run_for, Duration::from_secs(2));
        assert!(matches!(script.finish, MockFinish::Answer(_)));

        let script = MockScript::from_model_spec("mock:250:fail:boom");
        assert_eq!(script.run_for, Duration::from_millis(250));
        assert!(matches!(script.finish, MockFinish::Fail(ref m) if m == "boom"));

        let script = MockScript::from_model_spec("mock:100:noresult");
        assert!(matches!(script.finish, MockFinish::NoResult));

        let script = MockScript::from_model_spec("mock:500:answer:ok:files=report.md,plots/a.png");
        assert!(matches!(script.finish, MockFinish::Answer(ref m) if m == "ok"));
        assert_eq!(
            script.artifacts.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["report.md", "plots/a.png"]
        );
    }

    #[test]
    fn custom_data_round_trip() {
        let agent = MockAgent::new(quick_script());
        agent.add_data("expression.csv", "RNA-seq counts").unwrap();
        agent.add_data("variants.vcf", "called variants").unwrap();
        let listed = agent.list_custom_data().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "expression.csv");
        assert!(agent.remove_custom_data("variants.vcf").unwrap());
        assert!(!agent.remove_custom_data("variants.vcf").unwrap());
        assert_eq!(agent.list_custom_data().unwrap().len(), 1);
    }
}
