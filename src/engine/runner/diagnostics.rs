use std::fmt::{Display, Formatter};
use std::time::Duration;

use console::style;

use crate::error::TaskError;

/// How a single task ended.
#[derive(Debug)]
pub enum Outcome {
    Succeeded { duration: Duration },
    Failed(TaskError),
    /// Never started because a task it depends on failed.
    Skipped { blocked_by: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

/// Per-task outcomes of one run, in completion order.
#[derive(Debug, Default)]
pub struct Report {
    outcomes: Vec<(String, Outcome)>,
}

impl Report {
    pub(crate) fn push(&mut self, name: String, outcome: Outcome) {
        self.outcomes.push((name, outcome));
    }

    pub fn merge(&mut self, other: Report) {
        self.outcomes.extend(other.outcomes);
    }

    /// True when every task that was part of the run succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_success())
    }

    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .rev()
            .find(|(task, _)| task == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TaskError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            Outcome::Failed(error) => Some((name.as_str(), error)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Log a one-line summary, followed by every failure.
    pub fn log(&self) {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;

        for (_, outcome) in &self.outcomes {
            match outcome {
                Outcome::Succeeded { .. } => succeeded += 1,
                Outcome::Failed(_) => failed += 1,
                Outcome::Skipped { .. } => skipped += 1,
            }
        }

        if failed == 0 && skipped == 0 {
            tracing::info!("{} task(s) succeeded", style(succeeded).green());
            return;
        }

        tracing::error!(
            "{} succeeded, {} failed, {} skipped",
            style(succeeded).green(),
            style(failed).red(),
            style(skipped).yellow(),
        );

        for (name, error) in self.failures() {
            tracing::error!(task = name, "{error}");
        }
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (name, outcome) in &self.outcomes {
            match outcome {
                Outcome::Succeeded { duration } => writeln!(f, "ok      {name} ({duration:.2?})")?,
                Outcome::Failed(error) => writeln!(f, "failed  {name}: {error}")?,
                Outcome::Skipped { blocked_by } => {
                    writeln!(f, "skipped {name} (blocked by {blocked_by})")?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_every_task() {
        let mut report = Report::default();
        assert!(report.is_success());

        report.push("a".into(), Outcome::Succeeded { duration: Duration::ZERO });
        assert!(report.is_success());

        report.push("b".into(), Outcome::Skipped { blocked_by: "c".into() });
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn latest_outcome_wins() {
        let mut report = Report::default();
        report.push("js".into(), Outcome::Failed(TaskError::MissingDependency("x".into())));

        let mut rerun = Report::default();
        rerun.push("js".into(), Outcome::Succeeded { duration: Duration::ZERO });
        report.merge(rerun);

        assert!(report.outcome("js").is_some_and(Outcome::is_success));
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn display_lists_each_task() {
        let mut report = Report::default();
        report.push("css".into(), Outcome::Skipped { blocked_by: "icons".into() });
        assert_eq!(report.to_string(), "skipped css (blocked by icons)\n");
    }
}
