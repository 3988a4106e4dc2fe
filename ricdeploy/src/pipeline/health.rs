//! Bounded polling gates.
//!
//! A [`HealthGate`] polls a [`Condition`] at a fixed interval up to a maximum
//! number of attempts. It is used wherever the pipeline has to wait for
//! something to become true (a process exiting, a pod running, a descriptor
//! showing up in a listing) instead of sleeping for a fixed time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::errors::DeployError;

/// Something that is polled until it holds.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Evaluates the condition once. Errors count as "not yet".
    async fn check(&self) -> Result<bool, DeployError>;
}

/// A condition backed by a synchronous closure.
pub struct FnCondition<F>
where
    F: Fn() -> bool + Send + Sync,
{
    description: String,
    func: F,
}

impl<F> FnCondition<F>
where
    F: Fn() -> bool + Send + Sync,
{
    /// Creates a closure-backed condition.
    pub fn new(description: impl Into<String>, func: F) -> Self {
        Self {
            description: description.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Condition for FnCondition<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn check(&self) -> Result<bool, DeployError> {
        Ok((self.func)())
    }
}

/// A condition plus its polling discipline.
#[derive(Clone)]
pub struct HealthProbe {
    name: String,
    condition: Arc<dyn Condition>,
    poll_interval: Duration,
    max_attempts: u32,
}

impl HealthProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        condition: Arc<dyn Condition>,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            name: name.into(),
            condition,
            poll_interval,
            max_attempts,
        }
    }

    /// Creates a probe using the configured tuning.
    #[must_use]
    pub fn from_config(
        name: impl Into<String>,
        condition: Arc<dyn Condition>,
        config: &HealthConfig,
    ) -> Self {
        Self::new(name, condition, config.poll_interval(), config.max_attempts)
    }

    /// Probe name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval between polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Maximum number of polls.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbe")
            .field("name", &self.name)
            .field("condition", &self.condition.describe())
            .field("poll_interval", &self.poll_interval)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// How a gate resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum GateOutcome {
    /// The condition held on poll number `attempts`.
    Ready {
        /// Polls performed.
        attempts: u32,
    },
    /// The condition never held.
    TimedOut {
        /// Polls performed.
        attempts: u32,
    },
}

impl GateOutcome {
    /// Returns true on [`GateOutcome::Ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Number of polls performed.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Ready { attempts } | Self::TimedOut { attempts } => *attempts,
        }
    }

    /// Converts a timeout into [`DeployError::HealthTimeout`] for `probe`.
    pub fn into_result(self, probe: &str) -> Result<u32, DeployError> {
        match self {
            Self::Ready { attempts } => Ok(attempts),
            Self::TimedOut { attempts } => Err(DeployError::health_timeout(probe, attempts)),
        }
    }
}

/// Polls probes until they hold or run out of attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthGate;

impl HealthGate {
    /// Creates a gate.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Polls `probe` and reports the outcome. A timeout is always logged.
    pub async fn wait(&self, probe: &HealthProbe) -> GateOutcome {
        let description = probe.condition.describe();
        for attempt in 1..=probe.max_attempts {
            match probe.condition.check().await {
                Ok(true) => {
                    info!(probe = %probe.name, attempt, "Health gate ready");
                    return GateOutcome::Ready { attempts: attempt };
                }
                Ok(false) => {
                    debug!(probe = %probe.name, attempt, condition = %description, "Not ready yet");
                }
                Err(e) => {
                    debug!(probe = %probe.name, attempt, error = %e, "Probe check failed");
                }
            }
            if attempt < probe.max_attempts {
                tokio::time::sleep(probe.poll_interval).await;
            }
        }

        warn!(
            probe = %probe.name,
            attempts = probe.max_attempts,
            condition = %description,
            "Health gate timed out"
        );
        GateOutcome::TimedOut {
            attempts: probe.max_attempts,
        }
    }

    /// Polls `probe` and fails with [`DeployError::HealthTimeout`] on timeout.
    pub async fn require(&self, probe: &HealthProbe) -> Result<u32, DeployError> {
        self.wait(probe).await.into_result(probe.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_probe(ready_on: Option<u32>, max_attempts: u32) -> (HealthProbe, Arc<AtomicU32>) {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let condition = FnCondition::new("counter reaches target", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            ready_on.is_some_and(|target| n >= target)
        });
        let probe = HealthProbe::new(
            "counting",
            Arc::new(condition),
            Duration::from_millis(1),
            max_attempts,
        );
        (probe, polls)
    }

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let (probe, polls) = counting_probe(Some(3), 5);
        let outcome = HealthGate::new().wait(&probe).await;

        assert_eq!(outcome, GateOutcome::Ready { attempts: 3 });
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_after_max_attempts() {
        let (probe, polls) = counting_probe(None, 5);
        let outcome = HealthGate::new().wait(&probe).await;

        assert_eq!(outcome, GateOutcome::TimedOut { attempts: 5 });
        assert_eq!(polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let (probe, polls) = counting_probe(Some(1), 5);
        assert!(HealthGate::new().wait(&probe).await.is_ready());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out_without_polling() {
        let (probe, polls) = counting_probe(Some(1), 0);
        let outcome = HealthGate::new().wait(&probe).await;
        assert_eq!(outcome, GateOutcome::TimedOut { attempts: 0 });
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_require_maps_timeout() {
        let (probe, _) = counting_probe(None, 2);
        let err = HealthGate::new().require(&probe).await.unwrap_err();
        assert!(matches!(err, DeployError::HealthTimeout { attempts: 2, .. }));
    }

    #[derive(Debug)]
    struct Flaky(AtomicU32);

    #[async_trait]
    impl Condition for Flaky {
        fn describe(&self) -> String {
            "errors then succeeds".to_string()
        }

        async fn check(&self) -> Result<bool, DeployError> {
            if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DeployError::config("not reachable"))
            } else {
                Ok(true)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_count_as_not_ready() {
        let probe = HealthProbe::new(
            "flaky",
            Arc::new(Flaky(AtomicU32::new(0))),
            Duration::from_secs(2),
            4,
        );
        let outcome = HealthGate::new().wait(&probe).await;
        assert_eq!(outcome, GateOutcome::Ready { attempts: 3 });
    }
}
