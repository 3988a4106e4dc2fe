//! In-memory stand-ins for the OS, the operator and external tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;

use crate::errors::DeployError;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::operator::Operator;
use crate::platform::{ChartEntry, ChartRegistry};
use crate::process::{ProcessTable, TermSignal};
use crate::resources::{ResourceBackend, ResourceKind};

/// Operator answering from a fixed script.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    replies: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    /// Replies with `replies` in order, then reports closed input.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            questions: Mutex::new(Vec::new()),
        }
    }

    /// Number of prompts shown.
    #[must_use]
    pub fn prompt_count(&self) -> usize {
        self.questions.lock().len()
    }

    /// Questions asked, in order.
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn prompt(&self, question: &str) -> io::Result<Option<String>> {
        self.questions.lock().push(question.to_string());
        Ok(self.replies.lock().pop_front())
    }
}

/// Which signal makes a fake process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitsOn {
    /// SIGTERM is enough.
    Graceful,
    /// Only SIGKILL works.
    Forced,
    /// Nothing works.
    Never,
}

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    exits_on: ExitsOn,
}

#[derive(Debug, Default)]
struct ProcessState {
    listeners: BTreeMap<u16, u32>,
    processes: HashMap<u32, FakeProcess>,
    signals: Vec<(u32, TermSignal)>,
    query_error: Option<String>,
    query_error_after_signal: Option<String>,
}

/// Process table kept in memory.
#[derive(Debug, Default)]
pub struct FakeProcessTable {
    state: Mutex<ProcessState>,
}

impl FakeProcessTable {
    /// Creates a table with no processes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds process `pid` listening on `port`.
    #[must_use]
    pub fn with_listener(self, port: u16, pid: u32, name: &str, exits_on: ExitsOn) -> Self {
        {
            let mut state = self.state.lock();
            state.listeners.insert(port, pid);
            state.processes.insert(
                pid,
                FakeProcess {
                    name: name.to_string(),
                    exits_on,
                },
            );
        }
        self
    }

    /// Makes every port query fail with `message`.
    #[must_use]
    pub fn with_query_error(self, message: &str) -> Self {
        self.state.lock().query_error = Some(message.to_string());
        self
    }

    /// Makes port queries fail with `message` once any signal was sent.
    #[must_use]
    pub fn with_query_error_after_signal(self, message: &str) -> Self {
        self.state.lock().query_error_after_signal = Some(message.to_string());
        self
    }

    /// Signals delivered so far.
    #[must_use]
    pub fn signals(&self) -> Vec<(u32, TermSignal)> {
        self.state.lock().signals.clone()
    }
}

impl ProcessTable for FakeProcessTable {
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>> {
        let state = self.state.lock();
        if let Some(message) = &state.query_error {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, message.clone()));
        }
        Ok(state.listeners.get(&port).copied())
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        self.state.lock().processes.get(&pid).map(|p| p.name.clone())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().processes.contains_key(&pid)
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()> {
        let mut state = self.state.lock();
        state.signals.push((pid, signal));
        if let Some(message) = state.query_error_after_signal.take() {
            state.query_error = Some(message);
        }
        let Some(process) = state.processes.get(&pid) else {
            return Err(io::Error::from_raw_os_error(nix::errno::Errno::ESRCH as i32));
        };
        let exits = match process.exits_on {
            ExitsOn::Graceful => true,
            ExitsOn::Forced => signal == TermSignal::Forced,
            ExitsOn::Never => false,
        };
        if exits {
            state.processes.remove(&pid);
            state.listeners.retain(|_, owner| *owner != pid);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    output: CommandOutput,
    once: bool,
    used: bool,
}

/// Command runner answering from prefix-matched rules.
///
/// Rules are tried in insertion order; a `respond_once` rule is skipped after
/// its first use. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeCommandRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCommandRunner {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, prefix: &str, output: CommandOutput, once: bool) -> Self {
        self.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            output,
            once,
            used: false,
        });
        self
    }

    /// Answers every command starting with `prefix`.
    #[must_use]
    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.push(prefix, output, false)
    }

    /// Answers the next command starting with `prefix`, once.
    #[must_use]
    pub fn respond_once(self, prefix: &str, output: CommandOutput) -> Self {
        self.push(prefix, output, true)
    }

    /// Every command run, rendered.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of commands run starting with `prefix`.
    #[must_use]
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        let rendered = spec.to_string();
        self.calls.lock().push(rendered.clone());

        let mut rules = self.rules.lock();
        let matched = rules
            .iter_mut()
            .find(|rule| !(rule.once && rule.used) && rendered.starts_with(&rule.prefix));
        Ok(matched.map_or_else(
            || CommandOutput::success(""),
            |rule| {
                rule.used = true;
                rule.output.clone()
            },
        ))
    }
}

#[derive(Debug, Default)]
struct BackendState {
    existing: HashSet<String>,
    create_calls: HashMap<String, usize>,
}

/// Resource backend kept in memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    kind: ResourceKind,
    silent_create_failure: bool,
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    /// Creates an empty backend for `kind`.
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            silent_create_failure: false,
            state: Mutex::new(BackendState::default()),
        }
    }

    /// Pre-populates `identifier`.
    #[must_use]
    pub fn with_existing(self, identifier: &str) -> Self {
        self.state.lock().existing.insert(identifier.to_string());
        self
    }

    /// Makes creates succeed without producing anything.
    #[must_use]
    pub fn with_silent_create_failure(mut self) -> Self {
        self.silent_create_failure = true;
        self
    }

    /// Number of creates issued for `identifier`.
    #[must_use]
    pub fn create_calls(&self, identifier: &str) -> usize {
        self.state.lock().create_calls.get(identifier).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceBackend for InMemoryBackend {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn exists(&self, identifier: &str) -> Result<bool, DeployError> {
        Ok(self.state.lock().existing.contains(identifier))
    }

    async fn create(&self, identifier: &str) -> Result<(), DeployError> {
        let mut state = self.state.lock();
        *state.create_calls.entry(identifier.to_string()).or_default() += 1;
        if !self.silent_create_failure {
            state.existing.insert(identifier.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    charts: BTreeMap<String, Vec<String>>,
    running: HashSet<String>,
    onboarded_urls: Vec<String>,
    instantiated: Vec<String>,
    undeployed: Vec<String>,
    reject_onboarding: bool,
}

/// Chart registry kept in memory.
///
/// Onboarding registers the descriptor given to [`FakeChartRegistry::serving`]
/// under its name and version.
#[derive(Debug, Default)]
pub struct FakeChartRegistry {
    descriptor: Option<(String, String)>,
    state: Mutex<RegistryState>,
}

impl FakeChartRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The descriptor registered by onboarding.
    #[must_use]
    pub fn serving(mut self, name: &str, version: &str) -> Self {
        self.descriptor = Some((name.to_string(), version.to_string()));
        self
    }

    /// Pre-registers a chart.
    #[must_use]
    pub fn with_chart(self, name: &str, version: &str) -> Self {
        self.state
            .lock()
            .charts
            .entry(name.to_string())
            .or_default()
            .push(version.to_string());
        self
    }

    /// Marks a workload as already instantiated.
    #[must_use]
    pub fn with_running(self, name: &str) -> Self {
        self.state.lock().running.insert(name.to_string());
        self
    }

    /// Fails every onboarding request.
    #[must_use]
    pub fn rejecting_onboarding(self) -> Self {
        self.state.lock().reject_onboarding = true;
        self
    }

    /// Artifact URLs submitted for onboarding.
    #[must_use]
    pub fn onboarded_urls(&self) -> Vec<String> {
        self.state.lock().onboarded_urls.clone()
    }

    /// Workloads instantiated.
    #[must_use]
    pub fn instantiated(&self) -> Vec<String> {
        self.state.lock().instantiated.clone()
    }

    /// Workloads removed.
    #[must_use]
    pub fn undeployed(&self) -> Vec<String> {
        self.state.lock().undeployed.clone()
    }
}

#[async_trait]
impl ChartRegistry for FakeChartRegistry {
    async fn list_descriptors(&self) -> Result<Vec<ChartEntry>, DeployError> {
        Ok(self
            .state
            .lock()
            .charts
            .iter()
            .map(|(name, versions)| ChartEntry {
                name: name.clone(),
                versions: versions.clone(),
            })
            .collect())
    }

    async fn onboard(&self, artifact_url: &str) -> Result<(), DeployError> {
        let mut state = self.state.lock();
        if state.reject_onboarding {
            return Err(DeployError::Registry {
                operation: "POST /api/v1/onboard/download".to_string(),
                status: 400,
                body: "invalid descriptor".to_string(),
            });
        }
        state.onboarded_urls.push(artifact_url.to_string());
        if let Some((name, version)) = &self.descriptor {
            state.charts.entry(name.clone()).or_default().push(version.clone());
        }
        Ok(())
    }

    async fn instantiate(&self, name: &str) -> Result<(), DeployError> {
        let mut state = self.state.lock();
        if !state.charts.contains_key(name) {
            return Err(DeployError::Registry {
                operation: "POST /ric/v1/xapps".to_string(),
                status: 404,
                body: format!("{name} is not onboarded"),
            });
        }
        state.instantiated.push(name.to_string());
        state.running.insert(name.to_string());
        Ok(())
    }

    async fn undeploy(&self, name: &str) -> Result<(), DeployError> {
        let mut state = self.state.lock();
        if !state.running.remove(name) {
            return Err(DeployError::Registry {
                operation: format!("DELETE /ric/v1/xapps/{name}"),
                status: 404,
                body: String::new(),
            });
        }
        state.undeployed.push(name.to_string());
        Ok(())
    }
}
