//! Retrying a supervised command through an ordered list of variants.
//!
//! Each fallback rewrites the command the previous attempt used, so steps
//! compose: a later step sees every earlier substitution.

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackStep {
    /// Replace the argument at `index` with `value`.
    SubstituteArg {
        index: usize,
        value: String,
        reason: String,
    },
    /// Remove every occurrence of `flag`.
    DropFlag { flag: String, reason: String },
}

impl FallbackStep {
    pub fn reason(&self) -> &str {
        match self {
            Self::SubstituteArg { reason, .. } | Self::DropFlag { reason, .. } => reason,
        }
    }

    /// The rewritten command, or `None` when the step would not change it.
    pub fn apply(&self, command: &[String]) -> Option<Vec<String>> {
        match self {
            Self::SubstituteArg { index, value, .. } => {
                let current = command.get(*index)?;
                if current == value {
                    return None;
                }
                let mut next = command.to_vec();
                next[*index] = value.clone();
                Some(next)
            }
            Self::DropFlag { flag, .. } => {
                if !command.iter().any(|arg| arg == flag) {
                    return None;
                }
                Some(command.iter().filter(|arg| *arg != flag).cloned().collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt<T> {
    pub command: Vec<String>,
    pub fallback: Option<String>,
    pub result: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainRun<T> {
    pub attempts: Vec<Attempt<T>>,
    pub succeeded: bool,
}

impl<T> ChainRun<T> {
    pub fn fallback_used(&self) -> bool {
        self.attempts.len() > 1
    }

    /// Reasons of every fallback that ran, joined with `;`.
    pub fn fallback_reason(&self) -> String {
        self.attempts
            .iter()
            .filter_map(|attempt| attempt.fallback.as_deref())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn last(&self) -> Option<&Attempt<T>> {
        self.attempts.last()
    }
}

/// Runs `primary`, then each step in order while the latest attempt failed
/// and `is_recoverable` accepts it. Steps that would not change the command
/// are skipped. An `Err` from `attempt` stops the chain.
pub fn run_chain<T, E>(
    primary: Vec<String>,
    steps: &[FallbackStep],
    mut attempt: impl FnMut(&[String]) -> Result<T, E>,
    is_success: impl Fn(&T) -> bool,
    is_recoverable: impl Fn(&T) -> bool,
) -> Result<ChainRun<T>, E> {
    let first = attempt(&primary)?;
    let mut succeeded = is_success(&first);
    let mut attempts = vec![Attempt {
        command: primary,
        fallback: None,
        result: first,
    }];

    for step in steps {
        let Some(latest) = attempts.last() else {
            break;
        };
        if succeeded || !is_recoverable(&latest.result) {
            continue;
        }
        let Some(command) = step.apply(&latest.command) else {
            continue;
        };

        warn!(reason = %step.reason(), "retrying with fallback");
        let result = attempt(&command)?;
        succeeded = is_success(&result);
        attempts.push(Attempt {
            command,
            fallback: Some(step.reason().to_string()),
            result,
        });
    }

    info!(attempts = attempts.len(), succeeded, "fallback chain finished");
    Ok(ChainRun {
        attempts,
        succeeded,
    })
}
