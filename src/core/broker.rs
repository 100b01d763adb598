use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::Message;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::protocol::{BrowserEvent, BrowserMessage, DaemonCommand, DaemonMessage};
use crate::config::ConfigStore;
use crate::core::environment::{EnvironmentConfig, EnvironmentDto, EnvironmentStore, EnvironmentType};
use crate::core::errors::BrokerError;
use crate::core::process::{Process, ProcessStatus, ProcessStore};
use crate::core::repo::{Repo, RepoStore};
use crate::core::worktree::{self, Worktree, WorktreeStore};
use crate::hub::{self, BrowserHub, DaemonHub, CLOSE_NORMAL};

/// Minimum accepted terminal width for a spawn.
pub const MIN_COLS: u16 = 20;

/// Minimum accepted terminal height for a spawn.
pub const MIN_ROWS: u16 = 5;

/// Parameters for spawning a process on a worktree.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub agent: String,
    pub task: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub yolo_mode: bool,
}

/// The session broker: routes daemon frames into domain state and browser
/// deliveries, and browser frames back out to daemons.
///
/// Every frame effect and control-surface mutation runs under one critical
/// section so observers never see half-updated records; deliveries inside
/// it are non-blocking enqueues, so the section never waits on I/O.
#[derive(Debug)]
pub struct Broker {
    pub config: Arc<ConfigStore>,
    pub envs: EnvironmentStore,
    pub repos: RepoStore,
    pub worktrees: WorktreeStore,
    pub processes: ProcessStore,
    pub daemons: DaemonHub,
    pub browsers: BrowserHub,
    state_lock: Mutex<()>,
}

impl Broker {
    #[must_use]
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            envs: EnvironmentStore::new(),
            repos: RepoStore::new(),
            worktrees: WorktreeStore::new(),
            processes: ProcessStore::new(),
            daemons: DaemonHub::new(),
            browsers: BrowserHub::new(),
            state_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.state_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merged config + runtime environment list (the `env-update` payload).
    #[must_use]
    pub fn environment_view(&self) -> Vec<EnvironmentDto> {
        self.envs.merged_view(&self.config.environments())
    }

    fn broadcast_env_update(&self) {
        self.browsers.broadcast(&BrowserEvent::EnvUpdate {
            environments: self.environment_view(),
        });
    }

    /// Serialize and enqueue a command for the environment's daemon.
    ///
    /// Returns false when no daemon is connected or the enqueue failed; the
    /// control surface rolls back on false.
    pub fn send_command(&self, env_id: &str, command: &DaemonCommand) -> bool {
        let Ok(payload) = serde_json::to_string(command) else {
            return false;
        };
        self.daemons.try_send_to_env(env_id, Message::Text(payload.into()))
    }

    // ---- daemon connection lifecycle -----------------------------------

    /// Track a freshly authenticated daemon socket.
    pub fn daemon_connected(&self, tx: mpsc::Sender<Message>) -> Uuid {
        self.daemons.register(tx)
    }

    /// Apply one daemon frame.
    pub fn daemon_message(&self, conn_id: Uuid, message: DaemonMessage) {
        let _guard = self.lock();
        match message {
            DaemonMessage::Register {
                env_id,
                env_name,
                capabilities,
                workspace: _,
            } => self.handle_register(conn_id, &env_id, &env_name, capabilities),
            DaemonMessage::Heartbeat => {
                if let Some(env_id) = self.daemons.env_of(conn_id) {
                    self.envs.heartbeat(&env_id);
                }
            }
            DaemonMessage::PtyData { process_id, data } => {
                self.handle_pty_data(&process_id, &data);
            }
            DaemonMessage::PtySize {
                process_id,
                cols,
                rows,
            } => {
                self.browsers.send_to_subscribers(
                    &process_id,
                    &BrowserEvent::PtySize {
                        process_id: process_id.clone(),
                        cols,
                        rows,
                    },
                );
            }
            DaemonMessage::ProcessStarted { process_id } => {
                if let Some(process) = self.processes.mark_running(&process_id) {
                    self.browsers
                        .broadcast(&BrowserEvent::ProcessUpdate { process });
                }
            }
            DaemonMessage::ProcessExit {
                process_id,
                exit_code,
            } => {
                if let Some(process) = self.processes.mark_exited(&process_id, exit_code) {
                    self.browsers
                        .broadcast(&BrowserEvent::ProcessUpdate { process });
                } else {
                    tracing::debug!(process_id = %process_id, "Exit report for unknown process");
                }
            }
            DaemonMessage::WorktreeReady {
                worktree_id,
                path,
                branch,
            } => {
                if let Some(worktree) = self.worktrees.mark_ready(&worktree_id, &path, &branch) {
                    self.browsers
                        .broadcast(&BrowserEvent::WorktreeUpdate { worktree });
                }
            }
            DaemonMessage::BranchChanged {
                worktree_id,
                branch,
            } => {
                if let Some(worktree) = self.worktrees.set_branch(&worktree_id, &branch) {
                    self.browsers
                        .broadcast(&BrowserEvent::WorktreeUpdate { worktree });
                }
            }
            DaemonMessage::ReposList { repos } => {
                let Some(env_id) = self.daemons.env_of(conn_id) else {
                    tracing::warn!("repos-list from an unregistered daemon, dropping");
                    return;
                };
                // The local inventory is owned by the workspace scan.
                if env_id == "local" {
                    return;
                }
                let repos = repos
                    .into_iter()
                    .map(|info| Repo {
                        name: info.name,
                        path: info.path,
                        default_branch: info.default_branch,
                        env_id: Some(env_id.clone()),
                    })
                    .collect();
                self.repos.replace_for_env(&env_id, repos);
            }
        }
    }

    /// Socket close or error: run the disconnect cascade exactly once.
    pub fn daemon_closed(&self, conn_id: Uuid) {
        let _guard = self.lock();
        let Some(env_id) = self.daemons.unregister(conn_id) else {
            return;
        };
        tracing::info!(env_id = %env_id, "Daemon disconnected");
        self.cascade_env_disconnect(&env_id);
    }

    fn handle_register(
        &self,
        conn_id: Uuid,
        reported_id: &str,
        reported_name: &str,
        capabilities: Vec<String>,
    ) {
        let configs = self.config.environments();
        let env_id = match_environment(&configs, reported_id, reported_name);

        if let Some(displaced) = self.daemons.claim_env(conn_id, &env_id) {
            tracing::info!(env_id = %env_id, "Replacing previous daemon connection");
            let _ = displaced.try_send(hub::close_message(
                CLOSE_NORMAL,
                "replaced by new registration",
            ));
        }

        tracing::info!(
            env_id = %env_id,
            reported_name = %reported_name,
            capabilities = ?capabilities,
            "Daemon registered"
        );
        self.envs.mark_connected(&env_id, capabilities);

        // Ask for the daemon's repo inventory right away.
        if !self.send_command(&env_id, &DaemonCommand::ListRepos) {
            tracing::warn!(env_id = %env_id, "Could not request initial repo inventory");
        }

        self.broadcast_env_update();
    }

    fn handle_pty_data(&self, process_id: &str, data: &str) {
        let Ok(bytes) = BASE64_STANDARD.decode(data) else {
            tracing::warn!(process_id = %process_id, "Dropping pty-data with invalid base64");
            return;
        };
        if self.processes.get(process_id).is_none() {
            tracing::debug!(process_id = %process_id, "Output for unknown process, dropping");
            return;
        }

        self.processes.append_buffer(process_id, &bytes);

        if let Some(process) = self.processes.mark_running(process_id) {
            self.browsers
                .broadcast(&BrowserEvent::ProcessUpdate { process });
        }

        self.browsers.send_to_subscribers(
            process_id,
            &BrowserEvent::PtyData {
                process_id: process_id.to_string(),
                data: String::from_utf8_lossy(&bytes).into_owned(),
            },
        );
    }

    fn cascade_env_disconnect(&self, env_id: &str) {
        for process in self.processes.stop_all_for_env(env_id) {
            self.browsers
                .broadcast(&BrowserEvent::ProcessUpdate { process });
        }
        self.envs.mark_disconnected(env_id);
        self.broadcast_env_update();
    }

    // ---- browser connection lifecycle ----------------------------------

    /// Track a new browser socket and deliver the initial state snapshot:
    /// environments first, then worktrees, then processes, so the client
    /// never sees dangling references.
    pub fn browser_connected(&self, tx: mpsc::Sender<Message>) -> Uuid {
        let _guard = self.lock();
        let conn_id = self.browsers.register(tx);

        self.browsers.send_to(
            conn_id,
            &BrowserEvent::EnvUpdate {
                environments: self.environment_view(),
            },
        );
        for worktree in self.worktrees.list() {
            self.browsers
                .send_to(conn_id, &BrowserEvent::WorktreeUpdate { worktree });
        }
        for process in self.processes.list() {
            self.browsers
                .send_to(conn_id, &BrowserEvent::ProcessUpdate { process });
        }
        conn_id
    }

    /// Apply one browser frame.
    pub fn browser_message(&self, conn_id: Uuid, message: BrowserMessage) {
        let _guard = self.lock();
        match message {
            BrowserMessage::Attach {
                process_id,
                skip_buffer,
            } => {
                let Some(process) = self.processes.get(&process_id) else {
                    self.browsers.send_to(
                        conn_id,
                        &BrowserEvent::Error {
                            message: format!("unknown process {process_id}"),
                        },
                    );
                    return;
                };

                self.browsers.attach(conn_id, &process_id);

                if !skip_buffer {
                    let snapshot = self.processes.buffer_snapshot(&process_id);
                    self.browsers.send_to(
                        conn_id,
                        &BrowserEvent::PtyData {
                            process_id: process_id.clone(),
                            data: String::from_utf8_lossy(&snapshot).into_owned(),
                        },
                    );
                }

                self.browsers
                    .send_to(conn_id, &BrowserEvent::ProcessUpdate { process });
            }
            BrowserMessage::Detach { process_id } => {
                self.browsers.detach(conn_id, &process_id);
            }
            BrowserMessage::Input { process_id, data } => {
                let Some(process) = self.processes.get(&process_id) else {
                    return;
                };
                let sent = self.send_command(
                    &process.env_id,
                    &DaemonCommand::PtyInput {
                        process_id,
                        data: BASE64_STANDARD.encode(data.as_bytes()),
                    },
                );
                if !sent {
                    tracing::debug!(env_id = %process.env_id, "Dropped input for disconnected daemon");
                }
            }
            BrowserMessage::Resize {
                process_id,
                cols,
                rows,
            } => {
                let Some(process) = self.processes.get(&process_id) else {
                    return;
                };
                let _ = self.send_command(
                    &process.env_id,
                    &DaemonCommand::Resize {
                        process_id,
                        cols,
                        rows,
                    },
                );
            }
        }
    }

    /// Socket close: drop the connection from every registry map.
    pub fn browser_closed(&self, conn_id: Uuid) {
        let _guard = self.lock();
        self.browsers.unregister(conn_id);
    }

    // ---- control surface operations ------------------------------------

    /// Create a worktree record and ask the daemon to materialize it.
    ///
    /// # Errors
    /// Not-found for an unknown repo, precondition when the environment is
    /// not connected, transport (after rollback) when the send fails.
    pub fn create_worktree(&self, repo_name: &str) -> Result<Worktree, BrokerError> {
        let _guard = self.lock();
        let repo = self
            .repos
            .get(repo_name)
            .ok_or_else(|| BrokerError::NotFound(format!("repo not found: {repo_name}")))?;
        let env_id = repo.env_id.clone().unwrap_or_else(|| "local".to_string());
        if !self.daemons.is_connected(&env_id) {
            return Err(BrokerError::Precondition(format!(
                "environment {env_id} is not connected"
            )));
        }

        let id = worktree::generate_id();
        let record = Worktree {
            id: id.clone(),
            repo_name: repo.name.clone(),
            path: String::new(),
            branch: format!("agent/{id}"),
            is_main: false,
            env_id: Some(env_id.clone()),
            created_at: Utc::now(),
        };
        self.worktrees.insert(record.clone());

        let sent = self.send_command(
            &env_id,
            &DaemonCommand::CreateWorktree {
                worktree_id: id.clone(),
                repo_name: repo.name.clone(),
                repo_path: repo.path.clone(),
            },
        );
        if !sent {
            self.worktrees.remove(&id);
            return Err(BrokerError::Transport(env_id));
        }

        self.browsers.broadcast(&BrowserEvent::WorktreeUpdate {
            worktree: record.clone(),
        });
        Ok(record)
    }

    /// Create a process record and ask the daemon to spawn the PTY.
    ///
    /// # Errors
    /// Validation for a too-small terminal, not-found / precondition for
    /// the worktree, transport (after rollback) when the send fails.
    pub fn spawn_process(
        &self,
        worktree_id: &str,
        spec: SpawnSpec,
    ) -> Result<Process, BrokerError> {
        let _guard = self.lock();
        self.spawn_process_locked(worktree_id, spec)
    }

    fn spawn_process_locked(
        &self,
        worktree_id: &str,
        spec: SpawnSpec,
    ) -> Result<Process, BrokerError> {
        if spec.cols < MIN_COLS || spec.rows < MIN_ROWS {
            return Err(BrokerError::Validation(format!(
                "terminal too small: need at least {MIN_COLS}x{MIN_ROWS}"
            )));
        }
        let worktree = self
            .worktrees
            .get(worktree_id)
            .ok_or_else(|| BrokerError::NotFound(format!("worktree not found: {worktree_id}")))?;
        if !worktree.is_ready() {
            return Err(BrokerError::Precondition(format!(
                "worktree {worktree_id} is not ready yet"
            )));
        }
        let env_id = worktree
            .env_id
            .clone()
            .unwrap_or_else(|| "local".to_string());
        if !self.daemons.is_connected(&env_id) {
            return Err(BrokerError::Precondition(format!(
                "environment {env_id} is not connected"
            )));
        }

        let process = Process {
            id: Uuid::new_v4().to_string(),
            worktree_id: worktree.id.clone(),
            agent: spec.agent.clone(),
            env_id: env_id.clone(),
            status: ProcessStatus::Pending,
            created_at: Utc::now(),
            exit_code: None,
        };
        self.processes.insert(process.clone());

        let sent = self.send_command(
            &env_id,
            &DaemonCommand::Spawn {
                process_id: process.id.clone(),
                worktree_id: worktree.id.clone(),
                worktree_path: worktree.path.clone(),
                agent: spec.agent,
                args: Vec::new(),
                task: spec.task,
                cols: Some(spec.cols),
                rows: Some(spec.rows),
                yolo_mode: Some(spec.yolo_mode),
            },
        );
        if !sent {
            self.processes.remove(&process.id);
            return Err(BrokerError::Transport(env_id));
        }

        self.browsers.broadcast(&BrowserEvent::ProcessUpdate {
            process: process.clone(),
        });
        Ok(process)
    }

    /// Forward a kill to the owning daemon; the record stays until the
    /// daemon reports the exit.
    ///
    /// # Errors
    /// Not-found for an unknown process, transport when the send fails.
    pub fn kill_process(&self, process_id: &str) -> Result<(), BrokerError> {
        let _guard = self.lock();
        let process = self
            .processes
            .get(process_id)
            .ok_or_else(|| BrokerError::NotFound(format!("process not found: {process_id}")))?;
        let sent = self.send_command(
            &process.env_id,
            &DaemonCommand::Kill {
                process_id: process.id,
            },
        );
        if sent {
            Ok(())
        } else {
            Err(BrokerError::Transport(process.env_id))
        }
    }

    /// Delete a process record and its buffer.
    ///
    /// # Errors
    /// Not-found for an unknown process.
    pub fn remove_process(&self, process_id: &str) -> Result<(), BrokerError> {
        let _guard = self.lock();
        self.processes
            .remove(process_id)
            .ok_or_else(|| BrokerError::NotFound(format!("process not found: {process_id}")))?;
        self.browsers.drop_process(process_id);
        self.browsers.broadcast(&BrowserEvent::ProcessRemoved {
            process_id: process_id.to_string(),
        });
        Ok(())
    }

    /// Delete a worktree: stop descendants, ask the daemon to remove the
    /// checkout, drop the record.
    ///
    /// # Errors
    /// Not-found for an unknown worktree, validation for the main worktree.
    pub fn delete_worktree(&self, worktree_id: &str) -> Result<(), BrokerError> {
        let _guard = self.lock();
        let worktree = self
            .worktrees
            .get(worktree_id)
            .ok_or_else(|| BrokerError::NotFound(format!("worktree not found: {worktree_id}")))?;
        if worktree.is_main {
            return Err(BrokerError::Validation(
                "the main worktree cannot be removed".to_string(),
            ));
        }
        let env_id = worktree
            .env_id
            .clone()
            .unwrap_or_else(|| "local".to_string());

        for process in self.processes.list_for_worktree(worktree_id) {
            if matches!(process.status, ProcessStatus::Pending | ProcessStatus::Running) {
                let _ = self.send_command(
                    &env_id,
                    &DaemonCommand::Kill {
                        process_id: process.id.clone(),
                    },
                );
                if let Some(stopped) = self.processes.mark_exited(&process.id, None) {
                    self.browsers
                        .broadcast(&BrowserEvent::ProcessUpdate { process: stopped });
                }
            }
        }

        let _ = self.send_command(
            &env_id,
            &DaemonCommand::RemoveWorktree {
                worktree_id: worktree.id.clone(),
                worktree_path: worktree.path.clone(),
            },
        );

        self.worktrees.remove(worktree_id);
        self.browsers.broadcast(&BrowserEvent::WorktreeRemoved {
            worktree_id: worktree_id.to_string(),
        });
        Ok(())
    }

    /// Add an environment definition and announce it.
    ///
    /// # Errors
    /// Surfaces config persistence failures as validation errors.
    pub fn create_environment(
        &self,
        name: String,
        env_type: EnvironmentType,
        vm_name: Option<String>,
    ) -> Result<EnvironmentConfig, BrokerError> {
        let _guard = self.lock();
        let env = EnvironmentConfig {
            id: worktree::generate_id(),
            name,
            env_type,
            vm_name,
            workspace_path: None,
        };
        self.config
            .add_environment(env.clone())
            .map_err(|err| BrokerError::Validation(err.to_string()))?;
        self.broadcast_env_update();
        Ok(env)
    }

    /// Remove an environment: close its daemon socket, cascade processes,
    /// drop config + runtime state.
    ///
    /// # Errors
    /// Validation for `local`, not-found for an unknown id.
    pub fn delete_environment(&self, env_id: &str) -> Result<(), BrokerError> {
        let _guard = self.lock();
        if env_id == "local" {
            return Err(BrokerError::Validation(
                "the local environment cannot be removed".to_string(),
            ));
        }
        if self.config.environment(env_id).is_none() {
            return Err(BrokerError::NotFound(format!(
                "environment not found: {env_id}"
            )));
        }

        if let Some(tx) = self.daemons.take_env(env_id) {
            let _ = tx.try_send(hub::close_message(CLOSE_NORMAL, "environment deleted"));
        }
        for process in self.processes.stop_all_for_env(env_id) {
            self.browsers
                .broadcast(&BrowserEvent::ProcessUpdate { process });
        }

        self.config
            .remove_environment(env_id)
            .map_err(|err| BrokerError::Validation(err.to_string()))?;
        self.envs.remove(env_id);
        self.broadcast_env_update();
        Ok(())
    }
}

/// Choose the config id a registering daemon should be recorded under.
///
/// Ladder: exact id match, exact name match, `vmName` match for `exe`
/// environments, first `local` environment, then the daemon-supplied id
/// verbatim. Last writer wins when two daemons contend for the same slot.
fn match_environment(
    configs: &[EnvironmentConfig],
    reported_id: &str,
    reported_name: &str,
) -> String {
    if !reported_id.is_empty() {
        if let Some(env) = configs.iter().find(|env| env.id == reported_id) {
            return env.id.clone();
        }
    }
    if let Some(env) = configs.iter().find(|env| env.name == reported_name) {
        return env.id.clone();
    }
    if let Some(env) = configs.iter().find(|env| {
        env.env_type == EnvironmentType::Exe && env.vm_name.as_deref() == Some(reported_name)
    }) {
        return env.id.clone();
    }
    if let Some(env) = configs
        .iter()
        .find(|env| env.env_type == EnvironmentType::Local)
    {
        return env.id.clone();
    }
    reported_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, name: &str, env_type: EnvironmentType, vm: Option<&str>) -> EnvironmentConfig {
        EnvironmentConfig {
            id: id.to_string(),
            name: name.to_string(),
            env_type,
            vm_name: vm.map(str::to_string),
            workspace_path: None,
        }
    }

    #[test]
    fn registration_matching_ladder() {
        let configs = vec![
            config("local", "Local", EnvironmentType::Local, None),
            config("env-a", "alpha", EnvironmentType::Exe, Some("vm-alpha")),
        ];

        assert_eq!(match_environment(&configs, "env-a", "whatever"), "env-a");
        assert_eq!(match_environment(&configs, "", "alpha"), "env-a");
        assert_eq!(match_environment(&configs, "", "vm-alpha"), "env-a");
        assert_eq!(match_environment(&configs, "", "unrelated"), "local");

        let no_local = vec![config("env-a", "alpha", EnvironmentType::Exe, None)];
        assert_eq!(match_environment(&no_local, "custom", "unrelated"), "custom");
    }
}
