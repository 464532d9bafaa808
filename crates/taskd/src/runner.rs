//! Agent process lifecycle.
//!
//! Each phase runs the agent CLI through a small `/bin/sh` wrapper started in
//! its own process group with stdio redirected to files under
//! `<data>/runs/<task-id>/`. The wrapper records the agent's exit status in an
//! `.exit` file, so a phase survives a daemon restart: the next daemon adopts
//! the registered pid, replays the output files and keeps tailing them.
//!
//! A pipeline runs the phases of one task in order and reports progress as
//! [`PhaseEvent`]s on a channel owned by the task store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use task_core::prompt::phase_prompt;
use task_core::stream::parse_line;
use task_core::{Config, Id, Phase, PhaseEvent, ProcessRegistration, Task, TaskMode};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{is_process_running, signal_group, ProcessRegistry, RegistryError};
use crate::tail::LineTail;

/// How often output files are polled for new lines.
const TAIL_INTERVAL: Duration = Duration::from_millis(200);

/// Interval between "still running" log lines.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Extra time `stop` waits for a pipeline beyond the grace period.
const STOP_SLACK: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Exit status `sh` reports when the command does not exist.
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("task {0} already has a running pipeline")]
    AlreadyRunning(Id),
    #[error("spawned process has no pid")]
    MissingPid,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub agent_bin: String,
    pub agent_args: Vec<String>,
    /// Wall-clock limit per phase (zero disables).
    pub phase_timeout: Duration,
    /// Limit on time without new output (zero disables).
    pub idle_timeout: Duration,
    /// Liveness check interval for adopted processes.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Root of per-task run files.
    pub runs_dir: PathBuf,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_bin: config.agent_bin.clone(),
            agent_args: config.agent_command_args(),
            phase_timeout: Duration::from_secs(config.phase_timeout_sec),
            idle_timeout: Duration::from_secs(config.idle_timeout_sec),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
            runs_dir: config.data_dir.join("runs"),
        }
    }
}

/// What a pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub task_id: Id,
    pub mode: TaskMode,
    /// Text handed to each phase's prompt template.
    pub prompt: String,
    pub working_dir: PathBuf,
    pub image_path: Option<String>,
    /// Phases to spawn, in order.
    pub phases: Vec<Phase>,
}

impl PipelineSpec {
    /// Every phase of the task's mode.
    pub fn for_task(task: &Task) -> Self {
        Self::with_phases(task, task.mode.phases().to_vec())
    }

    /// The phases following `phase` in the task's mode.
    pub fn after_phase(task: &Task, phase: Phase) -> Self {
        let next = |p: &Phase| task.mode.next_phase(*p);
        let phases = std::iter::successors(task.mode.next_phase(phase), next).collect();
        Self::with_phases(task, phases)
    }

    /// A single editor phase with a caller-supplied prompt.
    pub fn follow_up(task: &Task, prompt: &str) -> Self {
        let mut spec = Self::with_phases(task, vec![Phase::Editor]);
        spec.prompt = prompt.to_string();
        spec
    }

    fn with_phases(task: &Task, phases: Vec<Phase>) -> Self {
        Self {
            task_id: task.id.clone(),
            mode: task.mode,
            prompt: task.prompt.clone(),
            working_dir: PathBuf::from(&task.workspace_path),
            image_path: task.image_path.clone(),
            phases,
        }
    }

    fn compose_prompt(&self, phase: Phase) -> String {
        let mut prompt = phase_prompt(phase, self.mode, &self.prompt);
        if let Some(image) = &self.image_path {
            prompt.push_str(&format!(
                "\nAn image is attached for reference at {image}. Look at it before starting.\n"
            ));
        }
        prompt
    }
}

/// How watching a phase process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Exited(i32),
    /// The process is gone and left no exit status behind.
    Unknown,
    TimedOut(Duration),
    Idle(Duration),
    /// The phase never got a running process.
    SpawnFailed(String),
    Cancelled,
}

impl PhaseOutcome {
    /// Failure description, or `None` for a clean exit.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Exited(0) => None,
            Self::Exited(EXIT_COMMAND_NOT_FOUND) => Some(format!(
                "agent command not found (exit code {EXIT_COMMAND_NOT_FOUND})"
            )),
            Self::Exited(code) => Some(format!("agent exited with code {code}")),
            Self::Unknown => Some("exit status unknown".to_string()),
            Self::TimedOut(limit) => Some(format!("timed out after {}s", limit.as_secs())),
            Self::Idle(limit) => Some(format!("no output for {}s", limit.as_secs())),
            Self::SpawnFailed(reason) => Some(reason.clone()),
            Self::Cancelled => Some("stopped".to_string()),
        }
    }
}

/// Quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run files for one phase.
#[derive(Debug, Clone)]
struct RunFiles {
    prompt: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    exit: PathBuf,
    script: PathBuf,
}

impl RunFiles {
    fn new(dir: &Path, phase: Phase) -> Self {
        let stem = format!("{}-{}", phase, Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let file = |ext: &str| dir.join(format!("{stem}.{ext}"));
        Self {
            prompt: file("prompt"),
            stdout: file("out"),
            stderr: file("err"),
            exit: file("exit"),
            script: file("sh"),
        }
    }

    fn from_registration(reg: &ProcessRegistration) -> Self {
        Self {
            prompt: PathBuf::from(&reg.stdin_path),
            stdout: PathBuf::from(&reg.stdout_path),
            stderr: PathBuf::from(&reg.stderr_path),
            exit: PathBuf::from(&reg.exit_code_path),
            script: PathBuf::from(&reg.script_path),
        }
    }

    /// Wrapper that runs the agent and records its exit status atomically.
    fn wrapper_script(&self, agent_bin: &str, agent_args: &[String]) -> String {
        let mut command = shell_quote(agent_bin);
        for arg in agent_args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let exit = self.exit.display().to_string();
        let exit_tmp = format!("{exit}.tmp");
        format!(
            "#!/bin/sh\n\
             {command} < {prompt} > {stdout} 2> {stderr}\n\
             status=$?\n\
             printf '%s\\n' \"$status\" > {exit_tmp}\n\
             mv {exit_tmp} {exit}\n\
             exit \"$status\"\n",
            prompt = shell_quote(&self.prompt.display().to_string()),
            stdout = shell_quote(&self.stdout.display().to_string()),
            stderr = shell_quote(&self.stderr.display().to_string()),
            exit_tmp = shell_quote(&exit_tmp),
            exit = shell_quote(&exit),
        )
    }

    /// Remove the prompt and wrapper; output and exit files are kept.
    async fn cleanup(&self) {
        for path in [&self.prompt, &self.script] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "failed to remove run file");
                }
            }
        }
    }

    async fn read_exit_code(&self) -> Option<i32> {
        let text = tokio::fs::read_to_string(&self.exit).await.ok()?;
        text.trim().parse().ok()
    }
}

/// A phase process we either spawned or adopted.
enum ProcessHandle {
    Spawned(Child),
    Adopted { pid: u32, exit_file: PathBuf },
}

impl ProcessHandle {
    fn pid(&self) -> Option<u32> {
        match self {
            Self::Spawned(child) => child.id(),
            Self::Adopted { pid, .. } => Some(*pid),
        }
    }

    fn is_spawned(&self) -> bool {
        matches!(self, Self::Spawned(_))
    }

    fn is_alive(&mut self) -> bool {
        match self {
            Self::Spawned(child) => matches!(child.try_wait(), Ok(None)),
            // An existing exit file means the wrapper finished even if the pid was reused.
            Self::Adopted { pid, exit_file } => !exit_file.exists() && is_process_running(*pid),
        }
    }

    fn spawned_exit_code(&mut self) -> Option<i32> {
        match self {
            Self::Spawned(child) => child.try_wait().ok().flatten().and_then(|s| s.code()),
            Self::Adopted { .. } => None,
        }
    }

    /// SIGTERM the process group, then SIGKILL after `grace`.
    async fn terminate(&mut self, grace: Duration) {
        let Some(pid) = self.pid() else {
            return;
        };
        if let Err(e) = signal_group(pid, Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to send SIGTERM");
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(pid, "process ignored SIGTERM; sending SIGKILL");
        if let Err(e) = signal_group(pid, Signal::SIGKILL) {
            warn!(pid, error = %e, "failed to send SIGKILL");
        }
        if let Self::Spawned(child) = self {
            let _ = child.wait().await;
        }
    }
}

/// Output and error tails for one phase.
struct PhaseTails {
    stdout: LineTail,
    stderr: LineTail,
}

impl PhaseTails {
    fn new(files: &RunFiles) -> Self {
        Self {
            stdout: LineTail::new(&files.stdout),
            stderr: LineTail::new(&files.stderr),
        }
    }

    /// Forward new lines; returns how many were read.
    async fn pump(
        &mut self,
        phase: Phase,
        tx: &mpsc::Sender<PhaseEvent>,
        historical: bool,
    ) -> usize {
        let stdout = read_or_warn(&mut self.stdout, false).await;
        let stderr = read_or_warn(&mut self.stderr, false).await;
        forward(phase, stdout, stderr, tx, historical).await
    }

    /// Forward everything left, including unterminated last lines.
    async fn drain(&mut self, phase: Phase, tx: &mpsc::Sender<PhaseEvent>, historical: bool) {
        let stdout = read_or_warn(&mut self.stdout, true).await;
        let stderr = read_or_warn(&mut self.stderr, true).await;
        forward(phase, stdout, stderr, tx, historical).await;
    }
}

async fn read_or_warn(tail: &mut LineTail, finish: bool) -> Vec<String> {
    let result = if finish {
        tail.finish().await
    } else {
        tail.read_lines().await
    };
    result.unwrap_or_else(|e| {
        warn!(path = %tail.path().display(), error = %e, "failed to read agent output");
        Vec::new()
    })
}

async fn forward(
    phase: Phase,
    stdout: Vec<String>,
    stderr: Vec<String>,
    tx: &mpsc::Sender<PhaseEvent>,
    historical: bool,
) -> usize {
    let count = stdout.len() + stderr.len();
    for raw in stdout {
        for line in parse_line(&raw) {
            let _ = tx
                .send(PhaseEvent::Output {
                    phase,
                    line,
                    historical,
                })
                .await;
        }
    }
    for text in stderr {
        if text.trim().is_empty() {
            continue;
        }
        let _ = tx
            .send(PhaseEvent::Stderr {
                phase,
                text,
                historical,
            })
            .await;
    }
    count
}

struct ActivePipeline {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<Id, ActivePipeline>>>;

fn lock_active(active: &ActiveMap) -> MutexGuard<'_, HashMap<Id, ActivePipeline>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state handed to every pipeline task.
#[derive(Clone)]
struct PipelineContext {
    config: Arc<RunnerConfig>,
    registry: ProcessRegistry,
}

/// Starts, adopts and stops per-task phase pipelines.
#[derive(Clone)]
pub struct PipelineManager {
    ctx: PipelineContext,
    active: ActiveMap,
}

impl PipelineManager {
    pub fn new(config: RunnerConfig, registry: ProcessRegistry) -> Self {
        Self {
            ctx: PipelineContext {
                config: Arc::new(config),
                registry,
            },
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.ctx.registry
    }

    pub fn is_running(&self, task_id: &Id) -> bool {
        lock_active(&self.active)
            .get(task_id)
            .is_some_and(|p| !p.handle.is_finished())
    }

    pub fn running_count(&self) -> usize {
        lock_active(&self.active)
            .values()
            .filter(|p| !p.handle.is_finished())
            .count()
    }

    /// Spawn the pipeline's phases in order.
    pub fn start(&self, spec: PipelineSpec) -> Result<mpsc::Receiver<PhaseEvent>> {
        self.launch(spec, None)
    }

    /// Re-attach to a registered process, then run the pipeline's phases.
    pub fn adopt(
        &self,
        spec: PipelineSpec,
        registration: ProcessRegistration,
    ) -> Result<mpsc::Receiver<PhaseEvent>> {
        self.launch(spec, Some(registration))
    }

    fn launch(
        &self,
        spec: PipelineSpec,
        adopted: Option<ProcessRegistration>,
    ) -> Result<mpsc::Receiver<PhaseEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let run_id = Uuid::now_v7();
        let task_id = spec.task_id.clone();

        // Held across spawn so the task cannot deregister before it is inserted.
        let mut active = lock_active(&self.active);
        if active.get(&task_id).is_some_and(|p| !p.handle.is_finished()) {
            return Err(RunnerError::AlreadyRunning(task_id));
        }

        let ctx = self.ctx.clone();
        let map = Arc::clone(&self.active);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let task_id = spec.task_id.clone();
            ctx.drive(spec, adopted, tx, token).await;
            let mut active = lock_active(&map);
            if active.get(&task_id).is_some_and(|p| p.run_id == run_id) {
                active.remove(&task_id);
            }
        });
        active.insert(
            task_id,
            ActivePipeline {
                run_id,
                cancel,
                handle,
            },
        );
        Ok(rx)
    }

    /// Stop a task's pipeline, terminating its agent process.
    ///
    /// Falls back to the registry when no pipeline is attached. Returns
    /// whether anything was stopped.
    pub async fn stop(&self, task_id: &Id) -> Result<bool> {
        let pipeline = lock_active(&self.active).remove(task_id);
        if let Some(pipeline) = pipeline {
            info!(%task_id, "stopping pipeline");
            pipeline.cancel.cancel();
            let wait = self.ctx.config.grace_period + STOP_SLACK;
            if tokio::time::timeout(wait, pipeline.handle).await.is_err() {
                warn!(%task_id, "pipeline did not stop in time");
            }
            return Ok(true);
        }

        if let Some(registration) = self.ctx.registry.unregister(task_id).await? {
            let mut handle = ProcessHandle::Adopted {
                pid: registration.pid,
                exit_file: PathBuf::from(&registration.exit_code_path),
            };
            if handle.is_alive() {
                info!(%task_id, pid = registration.pid, "terminating unattached agent");
                handle.terminate(self.ctx.config.grace_period).await;
            }
            RunFiles::from_registration(&registration).cleanup().await;
            return Ok(true);
        }
        Ok(false)
    }
}

impl PipelineContext {
    async fn drive(
        &self,
        spec: PipelineSpec,
        adopted: Option<ProcessRegistration>,
        tx: mpsc::Sender<PhaseEvent>,
        cancel: CancellationToken,
    ) {
        if let Some(registration) = adopted {
            let phase = registration.phase;
            let outcome = self.follow_adopted(registration, &tx, &cancel).await;
            if !self.settle(phase, &outcome, &tx).await {
                return;
            }
        }

        for phase in spec.phases.iter().copied() {
            if cancel.is_cancelled() {
                return;
            }
            let outcome = self.run_phase(&spec, phase, &tx, &cancel).await;
            if !self.settle(phase, &outcome, &tx).await {
                return;
            }
        }
        let _ = tx.send(PhaseEvent::Completed).await;
    }

    /// Report a phase outcome; returns whether the pipeline should continue.
    async fn settle(&self, phase: Phase, outcome: &PhaseOutcome, tx: &mpsc::Sender<PhaseEvent>) -> bool {
        match outcome {
            PhaseOutcome::Cancelled => false,
            outcome => match outcome.failure_reason() {
                None => {
                    let _ = tx.send(PhaseEvent::PhaseCompleted { phase }).await;
                    true
                }
                Some(reason) => {
                    let _ = tx.send(PhaseEvent::Failed { phase, reason }).await;
                    false
                }
            },
        }
    }

    async fn spawn_phase(
        &self,
        spec: &PipelineSpec,
        phase: Phase,
        files: &RunFiles,
    ) -> Result<(Child, ProcessRegistration)> {
        let prompt = spec.compose_prompt(phase);
        tokio::fs::write(&files.prompt, &prompt).await?;
        let script = files.wrapper_script(&self.config.agent_bin, &self.config.agent_args);
        tokio::fs::write(&files.script, script).await?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg(&files.script)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        debug!(
            task_id = %spec.task_id,
            %phase,
            agent = %self.config.agent_bin,
            working_dir = %spec.working_dir.display(),
            "spawning agent"
        );
        let child = cmd.spawn()?;
        let pid = child.id().ok_or(RunnerError::MissingPid)?;

        let registration = ProcessRegistration {
            pid,
            task_id: spec.task_id.clone(),
            phase,
            started_at: Utc::now(),
            working_dir: spec.working_dir.display().to_string(),
            prompt,
            stdin_path: files.prompt.display().to_string(),
            stdout_path: files.stdout.display().to_string(),
            stderr_path: files.stderr.display().to_string(),
            exit_code_path: files.exit.display().to_string(),
            script_path: files.script.display().to_string(),
        };
        Ok((child, registration))
    }

    async fn run_phase(
        &self,
        spec: &PipelineSpec,
        phase: Phase,
        tx: &mpsc::Sender<PhaseEvent>,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        let dir = self.config.runs_dir.join(spec.task_id.to_string());
        let files = RunFiles::new(&dir, phase);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(task_id = %spec.task_id, error = %e, "failed to create run directory");
            return PhaseOutcome::SpawnFailed(format!("failed to create run directory: {e}"));
        }

        let (child, registration) = match self.spawn_phase(spec, phase, &files).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(task_id = %spec.task_id, %phase, error = %e, "failed to spawn agent");
                files.cleanup().await;
                return PhaseOutcome::SpawnFailed(format!("failed to spawn agent: {e}"));
            }
        };
        let mut handle = ProcessHandle::Spawned(child);

        if let Err(e) = self.registry.register(registration).await {
            warn!(task_id = %spec.task_id, error = %e, "failed to register agent; terminating");
            handle.terminate(self.config.grace_period).await;
            files.cleanup().await;
            return PhaseOutcome::SpawnFailed(format!("failed to register agent: {e}"));
        }

        info!(task_id = %spec.task_id, %phase, pid = ?handle.pid(), "phase started");
        let _ = tx.send(PhaseEvent::PhaseStarted { phase }).await;

        let deadline = deadline_after(self.config.phase_timeout, Duration::ZERO);
        let mut tails = PhaseTails::new(&files);
        let outcome = self
            .watch(&spec.task_id, phase, &mut handle, &files, &mut tails, deadline, tx, cancel)
            .await;

        self.finish_phase(&spec.task_id, &files).await;
        outcome
    }

    async fn follow_adopted(
        &self,
        registration: ProcessRegistration,
        tx: &mpsc::Sender<PhaseEvent>,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        let task_id = registration.task_id.clone();
        let phase = registration.phase;
        let files = RunFiles::from_registration(&registration);
        let mut handle = ProcessHandle::Adopted {
            pid: registration.pid,
            exit_file: files.exit.clone(),
        };
        info!(%task_id, %phase, pid = registration.pid, "adopting agent process");

        let mut tails = PhaseTails::new(&files);
        let mut replayed = 0;
        loop {
            let batch = tails.pump(phase, tx, true).await;
            if batch == 0 {
                break;
            }
            replayed += batch;
        }
        debug!(%task_id, lines = replayed, "replayed agent output");
        let _ = tx.send(PhaseEvent::Reconnected { phase }).await;

        let elapsed = Utc::now()
            .signed_duration_since(registration.started_at)
            .to_std()
            .unwrap_or_default();
        let deadline = deadline_after(self.config.phase_timeout, elapsed);
        let outcome = self
            .watch(&task_id, phase, &mut handle, &files, &mut tails, deadline, tx, cancel)
            .await;

        self.finish_phase(&task_id, &files).await;
        outcome
    }

    async fn finish_phase(&self, task_id: &Id, files: &RunFiles) {
        if let Err(e) = self.registry.unregister(task_id).await {
            warn!(%task_id, error = %e, "failed to unregister agent");
        }
        files.cleanup().await;
    }

    /// Tail output and watch the process until it exits, times out or is cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn watch(
        &self,
        task_id: &Id,
        phase: Phase,
        handle: &mut ProcessHandle,
        files: &RunFiles,
        tails: &mut PhaseTails,
        deadline: Option<Instant>,
        tx: &mpsc::Sender<PhaseEvent>,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        let mut tick = tokio::time::interval(TAIL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut last_poll = Instant::now();
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(%task_id, %phase, "cancellation requested; terminating agent");
                    handle.terminate(self.config.grace_period).await;
                    tails.drain(phase, tx, false).await;
                    return PhaseOutcome::Cancelled;
                }
                _ = tick.tick() => {}
            }

            if tails.pump(phase, tx, false).await > 0 {
                last_activity = Instant::now();
            }

            let poll_due =
                handle.is_spawned() || last_poll.elapsed() >= self.config.poll_interval;
            if poll_due {
                last_poll = Instant::now();
                if !handle.is_alive() {
                    tails.drain(phase, tx, false).await;
                    return match files.read_exit_code().await {
                        Some(code) => PhaseOutcome::Exited(code),
                        None => handle
                            .spawned_exit_code()
                            .map_or(PhaseOutcome::Unknown, PhaseOutcome::Exited),
                    };
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    %task_id,
                    %phase,
                    timeout_sec = self.config.phase_timeout.as_secs(),
                    "phase timed out; terminating agent"
                );
                handle.terminate(self.config.grace_period).await;
                tails.drain(phase, tx, false).await;
                return PhaseOutcome::TimedOut(self.config.phase_timeout);
            }

            if !self.config.idle_timeout.is_zero()
                && last_activity.elapsed() >= self.config.idle_timeout
            {
                warn!(
                    %task_id,
                    %phase,
                    idle_sec = self.config.idle_timeout.as_secs(),
                    "agent produced no output; terminating"
                );
                handle.terminate(self.config.grace_period).await;
                tails.drain(phase, tx, false).await;
                return PhaseOutcome::Idle(self.config.idle_timeout);
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                last_heartbeat = Instant::now();
                info!(
                    %task_id,
                    %phase,
                    elapsed_sec = started.elapsed().as_secs(),
                    stdout_bytes = tails.stdout.offset(),
                    "agent still running"
                );
            }
        }
    }
}

/// Deadline for a phase that has already run for `elapsed`.
fn deadline_after(limit: Duration, elapsed: Duration) -> Option<Instant> {
    if limit.is_zero() {
        None
    } else {
        Some(Instant::now() + limit.saturating_sub(elapsed))
    }
}
