//! The supervisor service.

use async_trait::async_trait;
use mcpr_core::ServerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Restart and liveness tuning.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    /// Restarts allowed within the sliding window before the circuit opens.
    pub max_restarts: u32,
    /// The sliding window.
    pub restart_window: Duration,
    /// First restart delay.
    pub initial_backoff: Duration,
    /// Delay multiplier per restart.
    pub backoff_multiplier: f64,
    /// Delay ceiling.
    pub max_backoff: Duration,
    /// Heartbeat interval; twice this with no heartbeat means unhealthy.
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Liveness of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Running and heard from recently.
    Healthy,
    /// Running but silent past the heartbeat deadline.
    Unhealthy,
    /// Observed dead; not yet scheduled for restart.
    Crashed,
    /// A restart is scheduled or in progress.
    Restarting,
    /// Restart quota exhausted; circuit open until operator reset.
    Failed,
    /// Never reported.
    Unknown,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What the supervisor announces on its event channel.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A server's health changed.
    HealthChanged {
        /// The server.
        server_id: ServerId,
        /// Its new health.
        health: Health,
    },
    /// A restart completed and a new process is live.
    Restarted {
        /// The server.
        server_id: ServerId,
        /// Pid of the fresh process.
        pid: u32,
    },
}

/// Invoked to actually respawn a server. Returns the new pid.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    /// Spawn a fresh process for `server_id`.
    async fn restart(&self, server_id: &ServerId) -> Result<u32, String>;
}

/// A point-in-time view of one supervised server.
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    /// The server.
    pub server_id: ServerId,
    /// Current health.
    pub health: Health,
    /// Current pid, when known.
    pub pid: Option<u32>,
    /// Restarts inside the current window.
    pub restart_count: usize,
    /// Current backoff delay.
    pub backoff: Duration,
}

struct Record {
    pid: Option<u32>,
    restarts: Vec<Instant>,
    backoff: Duration,
    health: Health,
    last_heartbeat: Instant,
    restart_task: Option<JoinHandle<()>>,
}

struct Shared {
    records: Mutex<HashMap<ServerId, Record>>,
    policy: SupervisorPolicy,
    events: broadcast::Sender<SupervisorEvent>,
    handler: Mutex<Option<Arc<dyn RestartHandler>>>,
    shutdown: CancellationToken,
}

/// The supervision service. Cheap to clone; all clones share state.
///
/// Single-writer discipline: every mutation happens under the records lock,
/// which is never held across an await point.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create a supervisor with the given policy.
    #[must_use]
    pub fn new(policy: SupervisorPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                policy,
                events,
                handler: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install the restart handler (the component that can respawn servers).
    pub fn set_restart_handler(&self, handler: Arc<dyn RestartHandler>) {
        *self.shared.handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Subscribe to health and restart events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    /// Start supervising a server that just came up.
    pub fn register(&self, server_id: ServerId, pid: Option<u32>) {
        let mut records = self.lock_records();
        records.insert(
            server_id.clone(),
            Record {
                pid,
                restarts: Vec::new(),
                backoff: self.shared.policy.initial_backoff,
                health: Health::Healthy,
                last_heartbeat: Instant::now(),
                restart_task: None,
            },
        );
        drop(records);
        self.emit_health(&server_id, Health::Healthy);
    }

    /// Stop supervising a server (graceful stop or removal).
    pub fn deregister(&self, server_id: &ServerId) {
        let mut records = self.lock_records();
        if let Some(record) = records.remove(server_id) {
            if let Some(task) = record.restart_task {
                task.abort();
            }
            debug!(server = %server_id, "supervision ended");
        }
    }

    /// Report that a server's process died.
    ///
    /// Inside quota: schedules a restart after the current backoff and marks
    /// the server `Restarting`. Quota exhausted: marks it `Failed` and stops
    /// scheduling until [`Supervisor::reset`].
    pub fn report_crash(&self, server_id: &ServerId, exit_code: Option<i32>) {
        let policy = self.shared.policy;
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(server_id) else {
            warn!(server = %server_id, "crash reported for unsupervised server");
            return;
        };

        // Exactly one restart timer per server.
        if record.restart_task.is_some() || record.health == Health::Failed {
            return;
        }

        record.pid = None;
        record.health = Health::Crashed;
        let now = Instant::now();
        record
            .restarts
            .retain(|t| now.duration_since(*t) < policy.restart_window);

        if record.restarts.len() >= policy.max_restarts as usize {
            record.health = Health::Failed;
            drop(records);
            warn!(server = %server_id, ?exit_code, "restart quota exhausted, circuit open");
            self.emit_health(server_id, Health::Failed);
            return;
        }

        let delay = record.backoff;
        record.health = Health::Restarting;
        let task = tokio::spawn(restart_after(self.clone(), server_id.clone(), delay));
        record.restart_task = Some(task);
        drop(records);

        info!(server = %server_id, ?exit_code, delay_ms = delay.as_millis() as u64, "restart scheduled");
        self.emit_health(server_id, Health::Restarting);
    }

    /// Record a heartbeat; an unhealthy server heard from again recovers.
    pub fn report_heartbeat(&self, server_id: &ServerId) {
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(server_id) else {
            return;
        };
        record.last_heartbeat = Instant::now();
        if record.health == Health::Unhealthy {
            record.health = Health::Healthy;
            drop(records);
            self.emit_health(server_id, Health::Healthy);
        }
    }

    /// Operator reset: close the circuit, clear restart history, restore the
    /// initial backoff.
    pub fn reset(&self, server_id: &ServerId) {
        let mut records = self.lock_records();
        if let Some(record) = records.get_mut(server_id) {
            record.restarts.clear();
            record.backoff = self.shared.policy.initial_backoff;
            record.health = Health::Unknown;
            drop(records);
            info!(server = %server_id, "supervision circuit reset");
            self.emit_health(server_id, Health::Unknown);
        }
    }

    /// Health of one server.
    #[must_use]
    pub fn health(&self, server_id: &ServerId) -> Option<Health> {
        self.lock_records().get(server_id).map(|r| r.health)
    }

    /// Snapshot of every supervised server.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SupervisorSnapshot> {
        self.lock_records()
            .iter()
            .map(|(server_id, r)| SupervisorSnapshot {
                server_id: server_id.clone(),
                health: r.health,
                pid: r.pid,
                restart_count: r.restarts.len(),
                backoff: r.backoff,
            })
            .collect()
    }

    /// Run the periodic heartbeat checker until shutdown.
    pub fn spawn_heartbeat_checker(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let interval = supervisor.shared.policy.heartbeat_interval;
            loop {
                tokio::select! {
                    () = supervisor.shared.shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                supervisor.check_heartbeats();
            }
        })
    }

    /// Cancel timers and the checker; supervision records are dropped.
    pub fn dispose(&self) {
        self.shared.shutdown.cancel();
        let mut records = self.lock_records();
        for record in records.values_mut() {
            if let Some(task) = record.restart_task.take() {
                task.abort();
            }
        }
    }

    fn check_heartbeats(&self) {
        let deadline = self.shared.policy.heartbeat_interval * 2;
        let stale: Vec<ServerId> = {
            let mut records = self.lock_records();
            let now = Instant::now();
            records
                .iter_mut()
                .filter(|(_, r)| {
                    r.health == Health::Healthy
                        && now.duration_since(r.last_heartbeat) > deadline
                })
                .map(|(id, r)| {
                    r.health = Health::Unhealthy;
                    id.clone()
                })
                .collect()
        };
        for server_id in stale {
            warn!(server = %server_id, "no heartbeat, marking unhealthy");
            self.emit_health(&server_id, Health::Unhealthy);
        }
    }

    fn complete_restart(&self, server_id: &ServerId, outcome: Result<u32, String>) {
        let policy = self.shared.policy;
        match outcome {
            Ok(pid) => {
                let mut records = self.lock_records();
                let Some(record) = records.get_mut(server_id) else {
                    return;
                };
                record.restart_task = None;
                record.pid = Some(pid);
                record.restarts.push(Instant::now());
                record.backoff = Duration::from_secs_f64(
                    (record.backoff.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_backoff.as_secs_f64()),
                );
                record.health = Health::Healthy;
                record.last_heartbeat = Instant::now();
                drop(records);

                info!(server = %server_id, pid, "restart succeeded");
                let _ = self.shared.events.send(SupervisorEvent::Restarted {
                    server_id: server_id.clone(),
                    pid,
                });
                self.emit_health(server_id, Health::Healthy);
            }
            Err(error) => {
                {
                    let mut records = self.lock_records();
                    if let Some(record) = records.get_mut(server_id) {
                        record.restart_task = None;
                        record.health = Health::Crashed;
                        // Failed attempts consume quota too, or a broken
                        // binary would retry forever.
                        record.restarts.push(Instant::now());
                        record.backoff = Duration::from_secs_f64(
                            (record.backoff.as_secs_f64() * policy.backoff_multiplier)
                                .min(policy.max_backoff.as_secs_f64()),
                        );
                    }
                }
                warn!(server = %server_id, %error, "restart failed");
                // A failed restart is another crash: backs off again or
                // exhausts the quota.
                self.report_crash(server_id, None);
            }
        }
    }

    fn emit_health(&self, server_id: &ServerId, health: Health) {
        let _ = self.shared.events.send(SupervisorEvent::HealthChanged {
            server_id: server_id.clone(),
            health,
        });
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<ServerId, Record>> {
        self.shared.records.lock().expect("supervisor records poisoned")
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.lock_records().len())
            .finish_non_exhaustive()
    }
}

async fn restart_after(supervisor: Supervisor, server_id: ServerId, delay: Duration) {
    tokio::select! {
        () = supervisor.shared.shutdown.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    let handler = supervisor
        .shared
        .handler
        .lock()
        .expect("handler lock poisoned")
        .clone();
    let Some(handler) = handler else {
        warn!(server = %server_id, "no restart handler installed");
        return;
    };

    let outcome = handler.restart(&server_id).await;
    supervisor.complete_restart(&server_id, outcome);
}
