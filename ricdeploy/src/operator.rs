//! Operator confirmation for human-in-the-loop steps.
//!
//! Every decision the orchestrator cannot make on its own (killing a process
//! that holds a reserved port, continuing past a failed stage) goes through a
//! [`Confirmer`]. Interactive prompts are bounded by `max_attempts`; the
//! non-interactive modes answer without asking so the pipeline can run
//! unattended.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// A yes/no decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Answer {
    /// Proceed.
    Yes,
    /// Stop.
    No,
}

impl Answer {
    /// Returns true for [`Answer::Yes`].
    #[must_use]
    pub fn is_yes(self) -> bool {
        self == Self::Yes
    }
}

/// Parses an operator reply. Accepts `y`, `yes`, `n`, `no` in any case.
#[must_use]
pub fn parse_answer(reply: &str) -> Option<Answer> {
    match reply.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Answer::Yes),
        "n" | "no" => Some(Answer::No),
        _ => None,
    }
}

/// How confirmations are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Ask the operator.
    #[default]
    Interactive,
    /// Answer yes without asking.
    AssumeYes,
    /// Answer no without asking.
    AssumeNo,
}

/// Prompt behavior: mode plus the bound on invalid replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptPolicy {
    /// How confirmations are obtained.
    pub mode: PromptMode,
    /// Maximum number of prompts per question before treating it as "no".
    pub max_attempts: u32,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            mode: PromptMode::Interactive,
            max_attempts: 3,
        }
    }
}

impl PromptPolicy {
    /// Creates a policy that never prompts and always answers `answer`.
    #[must_use]
    pub fn unattended(answer: Answer) -> Self {
        Self {
            mode: match answer {
                Answer::Yes => PromptMode::AssumeYes,
                Answer::No => PromptMode::AssumeNo,
            },
            ..Self::default()
        }
    }
}

/// Source of operator replies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Operator: Send + Sync {
    /// Presents `question` and returns the raw reply, or `None` when input is closed.
    async fn prompt(&self, question: &str) -> io::Result<Option<String>>;
}

/// Operator reading from stdin and writing prompts to stderr.
///
/// The terminal is read on the blocking pool; concurrent prompts are
/// serialised so question and reply stay paired.
#[derive(Debug, Default)]
pub struct ConsoleOperator {
    lock: Arc<Mutex<()>>,
}

impl ConsoleOperator {
    /// Creates a console operator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn prompt(&self, question: &str) -> io::Result<Option<String>> {
        let lock = self.lock.clone();
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut stderr = io::stderr().lock();
            write!(stderr, "{question} [y/n]: ")?;
            stderr.flush()?;

            let mut line = String::new();
            let read = io::stdin().lock().read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            Ok(Some(line))
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Asks yes/no questions according to a [`PromptPolicy`].
#[derive(Clone)]
pub struct Confirmer {
    operator: Arc<dyn Operator>,
    policy: PromptPolicy,
}

impl Confirmer {
    /// Creates a confirmer.
    #[must_use]
    pub fn new(operator: Arc<dyn Operator>, policy: PromptPolicy) -> Self {
        Self { operator, policy }
    }

    /// Creates a confirmer backed by the console.
    #[must_use]
    pub fn console(policy: PromptPolicy) -> Self {
        Self::new(Arc::new(ConsoleOperator::new()), policy)
    }

    /// Returns the active policy.
    #[must_use]
    pub fn policy(&self) -> PromptPolicy {
        self.policy
    }

    /// Obtains a decision for `question`.
    ///
    /// Invalid replies are re-prompted up to `max_attempts` times in total.
    /// Exhausted attempts, closed input and read errors all resolve to
    /// [`Answer::No`].
    pub async fn confirm(&self, question: &str) -> Answer {
        match self.policy.mode {
            PromptMode::AssumeYes => {
                debug!(question, "Auto-confirmed (assume yes)");
                return Answer::Yes;
            }
            PromptMode::AssumeNo => {
                debug!(question, "Auto-declined (assume no)");
                return Answer::No;
            }
            PromptMode::Interactive => {}
        }

        for attempt in 1..=self.policy.max_attempts {
            match self.operator.prompt(question).await {
                Ok(Some(reply)) => {
                    if let Some(answer) = parse_answer(&reply) {
                        return answer;
                    }
                    warn!(attempt, reply = reply.trim(), "Unrecognised answer, expected y or n");
                }
                Ok(None) => {
                    warn!(question, "Input closed while waiting for confirmation");
                    return Answer::No;
                }
                Err(e) => {
                    warn!(question, error = %e, "Failed to read confirmation");
                    return Answer::No;
                }
            }
        }

        warn!(
            question,
            attempts = self.policy.max_attempts,
            "No valid answer given, treating as no"
        );
        Answer::No
    }
}

impl std::fmt::Debug for Confirmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Confirmer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOperator;

    fn interactive(max_attempts: u32) -> PromptPolicy {
        PromptPolicy {
            mode: PromptMode::Interactive,
            max_attempts,
        }
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Some(Answer::Yes));
        assert_eq!(parse_answer("  YES "), Some(Answer::Yes));
        assert_eq!(parse_answer("n"), Some(Answer::No));
        assert_eq!(parse_answer("No"), Some(Answer::No));
        assert_eq!(parse_answer("maybe"), None);
        assert_eq!(parse_answer(""), None);
    }

    #[tokio::test]
    async fn test_assume_modes_do_not_prompt() {
        let operator = Arc::new(ScriptedOperator::new(["n"]));
        let yes = Confirmer::new(operator.clone(), PromptPolicy::unattended(Answer::Yes));
        assert_eq!(yes.confirm("kill?").await, Answer::Yes);

        let no = Confirmer::new(operator.clone(), PromptPolicy::unattended(Answer::No));
        assert_eq!(no.confirm("kill?").await, Answer::No);

        assert_eq!(operator.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_reprompts_on_invalid_input() {
        let operator = Arc::new(ScriptedOperator::new(["what", "ok", "y"]));
        let confirmer = Confirmer::new(operator.clone(), interactive(3));

        assert_eq!(confirmer.confirm("continue?").await, Answer::Yes);
        assert_eq!(operator.prompt_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_is_no() {
        let operator = Arc::new(ScriptedOperator::new(["a", "b", "y"]));
        let confirmer = Confirmer::new(operator.clone(), interactive(2));

        assert_eq!(confirmer.confirm("continue?").await, Answer::No);
        assert_eq!(operator.prompt_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_input_is_no() {
        let operator = Arc::new(ScriptedOperator::new(Vec::<&str>::new()));
        let confirmer = Confirmer::new(operator, interactive(3));
        assert_eq!(confirmer.confirm("continue?").await, Answer::No);
    }

    #[tokio::test]
    async fn test_read_error_is_no() {
        let mut operator = MockOperator::new();
        operator
            .expect_prompt()
            .times(1)
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin gone")));
        let confirmer = Confirmer::new(Arc::new(operator), interactive(3));

        assert_eq!(confirmer.confirm("continue?").await, Answer::No);
    }
}
