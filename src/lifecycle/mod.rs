//! Agent lifecycle controller
//!
//! Maps each agent session onto at most one OS worker process. Pause,
//! resume, and stop are delivered over a command-file channel the worker
//! polls, rather than OS suspend signals, so the protocol works the same on
//! every platform; `stop` falls back to killing the process after a grace
//! period.

use crate::config::MusterConfig;
use crate::session::{AgentStatus, SessionRegistry, SessionUpdate};
use crate::{MusterError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Commands written to a worker's control file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Park cooperatively; keep the current assignment
    Pause,
    /// Unpark and continue
    Resume,
    /// Finish up and exit
    Stop,
}

impl WorkerCommand {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

/// Controller for worker processes, one per agent
pub struct AgentProcessController {
    registry: SessionRegistry,
    config: MusterConfig,
    children: Arc<Mutex<HashMap<String, Child>>>,
}

impl AgentProcessController {
    /// Create a controller over the given registry and config
    pub fn new(registry: SessionRegistry, config: MusterConfig) -> Self {
        Self {
            registry,
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn control_dir(&self, agent_id: &str) -> PathBuf {
        self.config.state_dir.join("control").join(agent_id)
    }

    fn command_file(&self, agent_id: &str) -> PathBuf {
        self.control_dir(agent_id).join("command")
    }

    fn write_command(&self, agent_id: &str, command: WorkerCommand) -> Result<()> {
        let dir = self.control_dir(agent_id);
        fs::create_dir_all(&dir)?;
        fs::write(self.command_file(agent_id), command.as_str())?;
        debug!(agent_id, command = command.as_str(), "Worker command written");
        Ok(())
    }

    /// Check whether an agent currently has a live worker process
    pub fn running(&self, agent_id: &str) -> bool {
        self.children.lock().unwrap().contains_key(agent_id)
    }

    /// Agent ids with a tracked worker process
    pub fn list_running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.children.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a worker process for an agent
    ///
    /// Creates the session (idle) first, then spawns the configured worker
    /// command with the agent id appended. A spawn failure is recorded on
    /// the session (status failed, error counted) and propagated.
    pub fn start(&self, agent_id: &str) -> Result<u32> {
        if self.running(agent_id) {
            return Err(MusterError::Spawn {
                agent_id: agent_id.to_string(),
                detail: "already running".to_string(),
            });
        }

        self.registry.create(agent_id)?;
        let dir = self.control_dir(agent_id);
        fs::create_dir_all(&dir)?;
        // A leftover stop command from a previous run would park the new
        // worker immediately.
        let _ = fs::remove_file(self.command_file(agent_id));

        let program = &self.config.worker_command[0];
        let spawned = Command::new(program)
            .args(&self.config.worker_command[1..])
            .arg(agent_id)
            .env("MUSTER_STATE_DIR", &self.config.state_dir)
            .env("MUSTER_CONTROL_FILE", self.command_file(agent_id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child.id();
                self.children
                    .lock()
                    .unwrap()
                    .insert(agent_id.to_string(), child);
                info!(agent_id, pid, "Worker started");
                Ok(pid)
            }
            Err(e) => {
                let detail = format!("failed to spawn '{}': {}", program, e);
                self.registry.update(
                    agent_id,
                    SessionUpdate::status(AgentStatus::Failed).with_error(&detail),
                )?;
                Err(MusterError::Spawn {
                    agent_id: agent_id.to_string(),
                    detail,
                })
            }
        }
    }

    /// Pause a running agent
    ///
    /// Writes a pause command for the worker to park on and flips the
    /// session to paused.
    pub fn pause(&self, agent_id: &str) -> Result<()> {
        if !self.running(agent_id) {
            return Err(MusterError::NotFound(format!(
                "no running worker for '{}'",
                agent_id
            )));
        }
        self.write_command(agent_id, WorkerCommand::Pause)?;
        self.registry
            .update(agent_id, SessionUpdate::status(AgentStatus::Paused))?;
        info!(agent_id, "Worker paused");
        Ok(())
    }

    /// Resume a paused agent
    pub fn resume(&self, agent_id: &str) -> Result<()> {
        let session = self.registry.get(agent_id)?;
        if session.status != AgentStatus::Paused {
            return Err(MusterError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: session.status.to_string(),
                to: AgentStatus::Idle.to_string(),
            });
        }
        self.write_command(agent_id, WorkerCommand::Resume)?;
        self.registry
            .update(agent_id, SessionUpdate::status(AgentStatus::Idle))?;
        info!(agent_id, "Worker resumed");
        Ok(())
    }

    /// Stop an agent's worker
    ///
    /// Asks the worker to exit, waits up to the grace period, then kills it.
    /// The session always ends up idle regardless of how the process died.
    pub fn stop(&self, agent_id: &str) -> Result<()> {
        let child = self.children.lock().unwrap().remove(agent_id);
        let Some(mut child) = child else {
            return Err(MusterError::NotFound(format!(
                "no running worker for '{}'",
                agent_id
            )));
        };

        self.write_command(agent_id, WorkerCommand::Stop)?;
        let deadline = Instant::now() + self.config.stop_grace();
        let graceful = loop {
            match child.try_wait()? {
                Some(_) => break true,
                None if Instant::now() >= deadline => break false,
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        };

        if !graceful {
            warn!(agent_id, "Worker did not exit within grace period, killing");
            child.kill()?;
            let _ = child.wait();
        }

        self.reset_to_idle(agent_id)?;
        info!(agent_id, graceful, "Worker stopped");
        Ok(())
    }

    /// Whatever state the worker died in, the resting state is idle.
    /// Resetting from paused goes through idle anyway and failed is allowed
    /// to reset.
    fn reset_to_idle(&self, agent_id: &str) -> Result<()> {
        let session = self.registry.get(agent_id)?;
        if session.status != AgentStatus::Idle {
            let step = if session.status.can_transition_to(AgentStatus::Idle) {
                SessionUpdate::status(AgentStatus::Idle)
            } else {
                SessionUpdate::default()
            };
            self.registry
                .update(agent_id, step.clearing_assignment())?;
        }
        Ok(())
    }

    /// Stop every tracked agent concurrently
    ///
    /// Each worker gets the per-agent grace period, capped by the aggregate
    /// deadline; whichever comes first, a worker still alive at the
    /// aggregate deadline is force-killed. The children are drained from the
    /// tracking map up front so the deadline covers every stop in progress.
    pub fn stop_all(&self, timeout: Duration) -> Result<usize> {
        let children: Vec<(String, Child)> = {
            let mut map = self.children.lock().unwrap();
            map.drain().collect()
        };
        let total = children.len();
        let deadline = Instant::now() + timeout;
        let stopped = Arc::new(Mutex::new(0usize));

        std::thread::scope(|scope| {
            for (id, mut child) in children {
                let stopped = Arc::clone(&stopped);
                let kill_at = deadline.min(Instant::now() + self.config.stop_grace());
                scope.spawn(move || {
                    let _ = self.write_command(&id, WorkerCommand::Stop);
                    let graceful = loop {
                        match child.try_wait() {
                            Ok(Some(_)) => break true,
                            Ok(None) if Instant::now() >= kill_at => break false,
                            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                            Err(_) => break false,
                        }
                    };
                    if !graceful {
                        warn!(agent_id = %id, "Force-killing worker at stop_all deadline");
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    if self.reset_to_idle(&id).is_ok() {
                        *stopped.lock().unwrap() += 1;
                    }
                });
            }
        });

        let count = *stopped.lock().unwrap();
        info!(stopped = count, total, "All workers stopped");
        Ok(count)
    }

    /// Reconcile unsolicited process exits with session state
    ///
    /// Any tracked worker that has exited without a `stop` call is treated
    /// as a crash: the session moves to failed with the exit status recorded
    /// and the error counter bumped. Returns the crashed agent ids.
    pub fn reap(&self) -> Result<Vec<String>> {
        let mut crashed = Vec::new();
        let mut children = self.children.lock().unwrap();

        let mut exited = Vec::new();
        for (id, child) in children.iter_mut() {
            if let Some(status) = child.try_wait()? {
                exited.push((id.clone(), status));
            }
        }
        for (id, status) in exited {
            children.remove(&id);
            let detail = match status.code() {
                Some(code) => format!("worker exited unexpectedly with code {}", code),
                None => "worker terminated by signal".to_string(),
            };
            warn!(agent_id = %id, %status, "Worker crash detected");
            crate::monitor::metrics::record_worker_crash(&id);
            self.registry.update(
                &id,
                SessionUpdate::status(AgentStatus::Failed).with_error(&detail),
            )?;
            crashed.push(id);
        }

        Ok(crashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::store::StateStore;
    use tempfile::TempDir;

    /// Controller whose workers sleep until killed
    fn sleeper_controller() -> (TempDir, AgentProcessController) {
        let temp = TempDir::new().unwrap();
        let config = MusterConfig::new(temp.path())
            .with_worker_command(vec!["sleep".to_string(), "60".to_string()]);
        let store = StateStore::open(&config.state_dir).unwrap();
        let registry = SessionRegistry::new(store).with_retry(RetryConfig {
            max_retries: 0,
            ..RetryConfig::quick()
        });
        let mut config = config;
        config.stop_grace_secs = 0;
        (temp, AgentProcessController::new(registry, config))
    }

    #[test]
    fn test_start_creates_session_and_process() {
        let (_temp, controller) = sleeper_controller();

        let pid = controller.start("a1").unwrap();
        assert!(pid > 0);
        assert!(controller.running("a1"));

        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Idle);

        controller.stop("a1").unwrap();
    }

    #[test]
    fn test_start_twice_fails() {
        let (_temp, controller) = sleeper_controller();
        controller.start("a1").unwrap();

        let second = controller.start("a1");
        assert!(matches!(second, Err(MusterError::Spawn { .. })));

        controller.stop("a1").unwrap();
    }

    #[test]
    fn test_spawn_failure_recorded_on_session() {
        let temp = TempDir::new().unwrap();
        let config = MusterConfig::new(temp.path())
            .with_worker_command(vec!["definitely-not-a-real-binary-xyz".to_string()]);
        let store = StateStore::open(&config.state_dir).unwrap();
        let registry = SessionRegistry::new(store).with_retry(RetryConfig {
            max_retries: 0,
            ..RetryConfig::quick()
        });
        let controller = AgentProcessController::new(registry, config);

        let result = controller.start("a1");
        assert!(matches!(result, Err(MusterError::Spawn { .. })));

        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Failed);
        assert_eq!(session.error_count, 1);
        assert!(session.last_error.unwrap().contains("failed to spawn"));
    }

    #[test]
    fn test_pause_and_resume() {
        let (temp, controller) = sleeper_controller();
        controller.start("a1").unwrap();

        controller.pause("a1").unwrap();
        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Paused);
        let command = fs::read_to_string(
            temp.path().join("control").join("a1").join("command"),
        )
        .unwrap();
        assert_eq!(command, "pause");

        controller.resume("a1").unwrap();
        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Idle);

        controller.stop("a1").unwrap();
    }

    #[test]
    fn test_resume_requires_paused() {
        let (_temp, controller) = sleeper_controller();
        controller.start("a1").unwrap();

        let result = controller.resume("a1");
        assert!(matches!(result, Err(MusterError::InvalidTransition { .. })));

        controller.stop("a1").unwrap();
    }

    #[test]
    fn test_stop_kills_and_resets_to_idle() {
        let (_temp, controller) = sleeper_controller();
        controller.start("a1").unwrap();
        controller.pause("a1").unwrap();

        // Sleeper ignores the stop command, so this exercises the kill path
        controller.stop("a1").unwrap();
        assert!(!controller.running("a1"));

        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Idle);
    }

    #[test]
    fn test_reap_marks_crash() {
        let temp = TempDir::new().unwrap();
        let mut config = MusterConfig::new(temp.path())
            .with_worker_command(vec!["false".to_string()]);
        config.stop_grace_secs = 0;
        let store = StateStore::open(&config.state_dir).unwrap();
        let registry = SessionRegistry::new(store).with_retry(RetryConfig {
            max_retries: 0,
            ..RetryConfig::quick()
        });
        let controller = AgentProcessController::new(registry, config);

        controller.start("a1").unwrap();
        // Give `false` a moment to exit
        std::thread::sleep(Duration::from_millis(200));

        let crashed = controller.reap().unwrap();
        assert_eq!(crashed, vec!["a1".to_string()]);
        assert!(!controller.running("a1"));

        let session = controller.registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Failed);
        assert_eq!(session.error_count, 1);
        assert!(session
            .last_error
            .unwrap()
            .contains("exited unexpectedly"));
    }

    #[test]
    fn test_stop_all() {
        let (_temp, controller) = sleeper_controller();
        controller.start("a1").unwrap();
        controller.start("a2").unwrap();
        controller.start("a3").unwrap();

        let stopped = controller.stop_all(Duration::from_secs(5)).unwrap();
        assert_eq!(stopped, 3);
        assert!(controller.list_running().is_empty());
    }

    #[test]
    fn test_stop_all_deadline_overrides_grace() {
        let temp = TempDir::new().unwrap();
        let mut config = MusterConfig::new(temp.path())
            .with_worker_command(vec!["sleep".to_string(), "60".to_string()]);
        // Per-agent grace far beyond the aggregate timeout
        config.stop_grace_secs = 60;
        let store = StateStore::open(&config.state_dir).unwrap();
        let registry = SessionRegistry::new(store).with_retry(RetryConfig {
            max_retries: 0,
            ..RetryConfig::quick()
        });
        let controller = AgentProcessController::new(registry, config);

        controller.start("a1").unwrap();
        controller.start("a2").unwrap();

        let started = Instant::now();
        let stopped = controller.stop_all(Duration::from_millis(200)).unwrap();

        // Sleepers ignore the stop command, so both hit the force-kill at
        // the aggregate deadline rather than waiting out their 60s grace
        assert_eq!(stopped, 2);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(controller.list_running().is_empty());
    }
}
