use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one task inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    UpstreamFailed,
}

impl TaskStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::UpstreamFailed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
            TaskStatus::UpstreamFailed => "UPSTREAM_FAILED",
        };
        f.write_str(label)
    }
}

/// Policy deciding whether a task is eligible once all of its upstream
/// tasks have reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    #[default]
    AllSuccess,
    OneSuccess,
    NoneFailedMinOneSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Run,
    Skip,
    UpstreamFailed,
}

impl TriggerRule {
    /// Decide what happens to a task given the terminal statuses of its
    /// direct upstream tasks. Tasks without upstream always run.
    pub fn resolve(self, upstream: &[TaskStatus]) -> Resolution {
        if upstream.is_empty() {
            return Resolution::Run;
        }

        let any_failed = upstream.iter().any(|s| s.is_failure());
        let any_success = upstream.iter().any(|s| *s == TaskStatus::Success);

        match self {
            TriggerRule::AllSuccess => {
                if upstream.iter().all(|s| *s == TaskStatus::Success) {
                    Resolution::Run
                } else if any_failed {
                    Resolution::UpstreamFailed
                } else {
                    Resolution::Skip
                }
            }
            TriggerRule::OneSuccess => {
                if any_success {
                    Resolution::Run
                } else if any_failed {
                    Resolution::UpstreamFailed
                } else {
                    Resolution::Skip
                }
            }
            TriggerRule::NoneFailedMinOneSuccess => {
                if any_failed {
                    Resolution::UpstreamFailed
                } else if any_success {
                    Resolution::Run
                } else {
                    Resolution::Skip
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn all_success_requires_every_upstream() {
        assert_eq!(TriggerRule::AllSuccess.resolve(&[Success, Success]), Resolution::Run);
        assert_eq!(
            TriggerRule::AllSuccess.resolve(&[Success, Failed]),
            Resolution::UpstreamFailed
        );
        assert_eq!(
            TriggerRule::AllSuccess.resolve(&[Success, UpstreamFailed]),
            Resolution::UpstreamFailed
        );
        assert_eq!(TriggerRule::AllSuccess.resolve(&[Success, Skipped]), Resolution::Skip);
    }

    #[test]
    fn failure_wins_over_skip_under_all_success() {
        assert_eq!(
            TriggerRule::AllSuccess.resolve(&[Skipped, Failed]),
            Resolution::UpstreamFailed
        );
    }

    #[test]
    fn none_failed_min_one_success_tolerates_skips() {
        let rule = TriggerRule::NoneFailedMinOneSuccess;
        assert_eq!(rule.resolve(&[Skipped, Success]), Resolution::Run);
        assert_eq!(rule.resolve(&[Skipped, Skipped]), Resolution::Skip);
        assert_eq!(rule.resolve(&[Success, Failed]), Resolution::UpstreamFailed);
    }

    #[test]
    fn one_success_runs_despite_failures() {
        let rule = TriggerRule::OneSuccess;
        assert_eq!(rule.resolve(&[Failed, Success]), Resolution::Run);
        assert_eq!(rule.resolve(&[Failed, Skipped]), Resolution::UpstreamFailed);
        assert_eq!(rule.resolve(&[Skipped]), Resolution::Skip);
    }

    #[test]
    fn roots_always_run() {
        assert_eq!(TriggerRule::AllSuccess.resolve(&[]), Resolution::Run);
    }
}
