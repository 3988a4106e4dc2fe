//! Port reclaiming.
//!
//! Stale listeners left behind by a previous run must not block the current
//! one. [`PortReclaimer`] finds the process bound to a port, asks the operator
//! before touching it, terminates it gracefully and escalates to a forced kill
//! only if it outlives the grace period.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::PortsConfig;
use crate::errors::DeployError;
use crate::operator::Confirmer;
use crate::pipeline::health::{FnCondition, HealthGate, HealthProbe};

/// Termination signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermSignal {
    /// SIGTERM.
    Graceful,
    /// SIGKILL.
    Forced,
}

impl TermSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Graceful => Signal::SIGTERM,
            Self::Forced => Signal::SIGKILL,
        }
    }
}

/// The OS surface the reclaimer needs.
pub trait ProcessTable: Send + Sync {
    /// Pid of the process listening on TCP `port`, `None` when nothing listens.
    ///
    /// A listener whose owner cannot be identified is an error.
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>>;

    /// Display name of `pid`.
    fn process_name(&self, pid: u32) -> Option<String>;

    /// Returns true while `pid` exists and has not exited.
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends `signal` to `pid`.
    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()>;
}

/// [`ProcessTable`] backed by procfs and `kill(2)`.
#[derive(Debug, Clone)]
pub struct ProcfsProcessTable {
    proc_root: PathBuf,
}

impl Default for ProcfsProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProcessTable {
    /// Reads from `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads from an alternative procfs mount.
    #[must_use]
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn listening_inodes(&self, port: u16) -> io::Result<Vec<u64>> {
        let mut inodes = Vec::new();
        let mut found_table = false;
        for table in ["net/tcp", "net/tcp6"] {
            match std::fs::read_to_string(self.proc_root.join(table)) {
                Ok(content) => {
                    found_table = true;
                    inodes.extend(parse_listening_inodes(&content, port));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if found_table {
            Ok(inodes)
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no TCP tables under {}", self.proc_root.display()),
            ))
        }
    }

    fn pid_holding_inode(&self, inodes: &[u64]) -> io::Result<Option<u32>> {
        let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may vanish or deny access while we walk them.
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = std::fs::read_link(fd.path()) {
                    if targets.iter().any(|t| Path::new(t) == link) {
                        return Ok(Some(pid));
                    }
                }
            }
        }
        Ok(None)
    }

    fn is_zombie(&self, pid: u32) -> bool {
        std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.split_whitespace().next().map(|state| state == "Z")
            })
            .unwrap_or(false)
    }
}

/// Extracts socket inodes in LISTEN state bound to `port` from a
/// `/proc/net/tcp`-format table.
#[must_use]
pub fn parse_listening_inodes(content: &str, port: u16) -> Vec<u64> {
    const LISTEN: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port {
                return None;
            }
            fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

fn to_pid(pid: u32) -> io::Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))
}

impl ProcessTable for ProcfsProcessTable {
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>> {
        let inodes = self.listening_inodes(port)?;
        if inodes.is_empty() {
            return Ok(None);
        }
        // A bound socket whose holder we cannot see is not a free port.
        self.pid_holding_inode(&inodes)?.map(Some).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "port {port} is bound (socket inode {}) but no visible process holds it",
                    inodes[0]
                ),
            )
        })
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        match kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => !self.is_zombie(pid),
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()> {
        kill(to_pid(pid)?, signal.as_nix()).map_err(io::Error::from)
    }
}

/// Lifecycle of a reclaimed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// An owner was found.
    Discovered,
    /// The operator approved terminating the owner.
    Confirmed,
    /// SIGTERM was sent.
    SignaledGraceful,
    /// SIGKILL was sent.
    SignaledForced,
    /// The port is free.
    Released,
    /// The port could not be freed.
    Abandoned,
}

/// A fixed port and what was found holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReservation {
    /// TCP port.
    pub port: u16,
    /// Process that held the port.
    pub owner_pid: Option<u32>,
    /// Display name of that process.
    pub owner_name: Option<String>,
    /// Where in the reclaim lifecycle the port is.
    pub state: ReservationState,
}

impl PortReservation {
    fn free(port: u16) -> Self {
        Self {
            port,
            owner_pid: None,
            owner_name: None,
            state: ReservationState::Released,
        }
    }

    fn owner_label(&self) -> String {
        match (&self.owner_name, self.owner_pid) {
            (Some(name), Some(pid)) => format!("{name} (pid {pid})"),
            (None, Some(pid)) => format!("pid {pid}"),
            _ => "unknown process".to_string(),
        }
    }
}

/// Why a reclaim gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbortReason {
    /// The operator declined to terminate the owner.
    Declined,
    /// The port is still bound after both signals.
    StillBound {
        /// Pid bound to the port at the final check.
        pid: u32,
    },
    /// The OS could not be queried.
    QueryFailed {
        /// Underlying error.
        message: String,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declined => write!(f, "operator declined"),
            Self::StillBound { pid } => write!(f, "still bound by pid {pid}"),
            Self::QueryFailed { message } => write!(f, "query failed: {message}"),
        }
    }
}

/// Result of [`PortReclaimer::reclaim`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReclaimOutcome {
    /// The port is free.
    Freed {
        /// Final reservation record.
        reservation: PortReservation,
    },
    /// The port could not be freed; the pipeline must stop.
    Aborted {
        /// Final reservation record.
        reservation: PortReservation,
        /// What went wrong.
        #[serde(flatten)]
        reason: AbortReason,
    },
}

impl ReclaimOutcome {
    /// Returns true when the port ended up free.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        matches!(self, Self::Freed { .. })
    }

    /// The reservation record.
    #[must_use]
    pub fn reservation(&self) -> &PortReservation {
        match self {
            Self::Freed { reservation } | Self::Aborted { reservation, .. } => reservation,
        }
    }

    /// Maps an abort onto [`DeployError`].
    pub fn into_result(self) -> Result<PortReservation, DeployError> {
        match self {
            Self::Freed { reservation } => Ok(reservation),
            Self::Aborted {
                reservation,
                reason,
            } => Err(match reason {
                AbortReason::Declined => {
                    DeployError::operator_abort(format!("reclaim port {}", reservation.port))
                }
                AbortReason::StillBound { pid } => DeployError::precondition(format!(
                    "port {} is still bound by pid {pid} after forced termination; free it manually",
                    reservation.port
                )),
                AbortReason::QueryFailed { message } => DeployError::precondition(format!(
                    "cannot determine owner of port {}: {message}",
                    reservation.port
                )),
            }),
        }
    }
}

/// Frees TCP ports held by stale processes.
#[derive(Clone)]
pub struct PortReclaimer {
    table: Arc<dyn ProcessTable>,
    confirmer: Confirmer,
    grace_period: Duration,
    poll_interval: Duration,
}

impl PortReclaimer {
    /// Creates a reclaimer with a 2s grace period polled every 100ms.
    #[must_use]
    pub fn new(table: Arc<dyn ProcessTable>, confirmer: Confirmer) -> Self {
        let defaults = PortsConfig::default();
        Self {
            table,
            confirmer,
            grace_period: defaults.grace_period(),
            poll_interval: defaults.poll_interval(),
        }
    }

    /// Creates a reclaimer tuned by `config`.
    #[must_use]
    pub fn from_config(
        table: Arc<dyn ProcessTable>,
        confirmer: Confirmer,
        config: &PortsConfig,
    ) -> Self {
        Self::new(table, confirmer)
            .with_grace_period(config.grace_period())
            .with_poll_interval(config.poll_interval())
    }

    /// Sets how long a process gets to exit after each signal.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets the liveness polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    fn exit_probe(&self, pid: u32) -> HealthProbe {
        let table = self.table.clone();
        let condition = FnCondition::new(format!("pid {pid} has exited"), move || {
            !table.is_alive(pid)
        });
        let polls = self.grace_period.as_millis() / self.poll_interval.as_millis().max(1);
        let max_attempts = u32::try_from(polls).unwrap_or(u32::MAX).saturating_add(1);
        HealthProbe::new(
            format!("exit of pid {pid}"),
            Arc::new(condition),
            self.poll_interval,
            max_attempts,
        )
    }

    /// Sends `signal` and waits up to the grace period for the process to exit.
    async fn terminate(&self, pid: u32, signal: TermSignal) -> bool {
        info!(pid, ?signal, "Signaling port owner");
        if let Err(e) = self.table.signal(pid, signal) {
            if e.raw_os_error() == Some(Errno::ESRCH as i32) {
                return true;
            }
            warn!(pid, ?signal, error = %e, "Failed to signal port owner");
        }
        HealthGate::new().wait(&self.exit_probe(pid)).await.is_ready()
    }

    fn recheck(&self, mut reservation: PortReservation) -> ReclaimOutcome {
        match self.table.owner_of(reservation.port) {
            Ok(None) => {
                reservation.state = ReservationState::Released;
                info!(port = reservation.port, "Port released");
                ReclaimOutcome::Freed { reservation }
            }
            Ok(Some(pid)) => {
                reservation.state = ReservationState::Abandoned;
                warn!(port = reservation.port, pid, "Port still bound after termination");
                ReclaimOutcome::Aborted {
                    reservation,
                    reason: AbortReason::StillBound { pid },
                }
            }
            Err(e) => {
                reservation.state = ReservationState::Abandoned;
                ReclaimOutcome::Aborted {
                    reservation,
                    reason: AbortReason::QueryFailed {
                        message: e.to_string(),
                    },
                }
            }
        }
    }

    /// Frees `port`, asking the operator before terminating its owner.
    pub async fn reclaim(&self, port: u16) -> ReclaimOutcome {
        let owner = match self.table.owner_of(port) {
            Ok(owner) => owner,
            Err(e) => {
                warn!(port, error = %e, "Cannot query port owner");
                let mut reservation = PortReservation::free(port);
                reservation.state = ReservationState::Abandoned;
                return ReclaimOutcome::Aborted {
                    reservation,
                    reason: AbortReason::QueryFailed {
                        message: e.to_string(),
                    },
                };
            }
        };

        let Some(pid) = owner else {
            info!(port, "Port already free");
            return ReclaimOutcome::Freed {
                reservation: PortReservation::free(port),
            };
        };

        let mut reservation = PortReservation {
            port,
            owner_pid: Some(pid),
            owner_name: self.table.process_name(pid),
            state: ReservationState::Discovered,
        };
        warn!(port, pid, owner = ?reservation.owner_name, "Port is in use");

        let question = format!(
            "Port {port} is in use by {}. Terminate it?",
            reservation.owner_label()
        );
        if !self.confirmer.confirm(&question).await.is_yes() {
            reservation.state = ReservationState::Abandoned;
            return ReclaimOutcome::Aborted {
                reservation,
                reason: AbortReason::Declined,
            };
        }
        reservation.state = ReservationState::Confirmed;
        info!(port, pid, "Operator approved terminating port owner");

        reservation.state = ReservationState::SignaledGraceful;
        if !self.terminate(pid, TermSignal::Graceful).await {
            reservation.state = ReservationState::SignaledForced;
            self.terminate(pid, TermSignal::Forced).await;
        }

        self.recheck(reservation)
    }

    /// Frees every port in order, stopping at the first one that cannot be freed.
    pub async fn reclaim_all(&self, ports: &[u16]) -> Result<Vec<PortReservation>, DeployError> {
        let mut released = Vec::with_capacity(ports.len());
        for port in ports {
            released.push(self.reclaim(*port).await.into_result()?);
        }
        Ok(released)
    }
}

impl fmt::Debug for PortReclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReclaimer")
            .field("grace_period", &self.grace_period)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
