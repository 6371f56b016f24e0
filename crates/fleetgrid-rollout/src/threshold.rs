//! Failure-threshold evaluation for auto-pause.

use fleetgrid_state::{DeploymentProgress, FailureThreshold};

/// Check a deployment's terminal outcomes against its failure threshold.
///
/// Returns the pause reason when the threshold is crossed. Only terminal
/// outcomes count: `completed` and `failed` devices, plus the deployment's
/// running count of consecutive terminal failures.
pub fn breach(
    threshold: &FailureThreshold,
    progress: &DeploymentProgress,
    consecutive_failures: u32,
) -> Option<String> {
    match *threshold {
        FailureThreshold::None => None,

        FailureThreshold::Count { max_failures } => {
            let max_failures = max_failures.max(1);
            (progress.failed >= max_failures).then(|| {
                format!(
                    "{} devices failed (threshold {max_failures})",
                    progress.failed
                )
            })
        }

        FailureThreshold::Rate {
            percent,
            min_samples,
        } => {
            let finished = progress.completed + progress.failed;
            if progress.failed == 0 || finished < min_samples.max(1) {
                return None;
            }
            let failed_pct = u64::from(progress.failed) * 100;
            (failed_pct >= u64::from(percent) * u64::from(finished)).then(|| {
                format!(
                    "failure rate {}% over {finished} devices (threshold {percent}%)",
                    failed_pct / u64::from(finished)
                )
            })
        }

        FailureThreshold::Consecutive { count } => {
            let count = count.max(1);
            (consecutive_failures >= count).then(|| {
                format!("{consecutive_failures} consecutive failures (threshold {count})")
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(completed: u32, failed: u32, skipped: u32) -> DeploymentProgress {
        DeploymentProgress {
            total: completed + failed + skipped,
            completed,
            failed,
            skipped,
            ..Default::default()
        }
    }

    #[test]
    fn none_never_breaches() {
        assert!(breach(&FailureThreshold::None, &progress(0, 50, 0), 50).is_none());
    }

    #[test]
    fn count_breaches_at_threshold() {
        let t = FailureThreshold::Count { max_failures: 3 };
        assert!(breach(&t, &progress(10, 2, 0), 0).is_none());
        let reason = breach(&t, &progress(10, 3, 0), 0).unwrap();
        assert_eq!(reason, "3 devices failed (threshold 3)");
    }

    #[test]
    fn count_zero_needs_one_failure() {
        let t = FailureThreshold::Count { max_failures: 0 };
        assert!(breach(&t, &progress(5, 0, 0), 0).is_none());
        assert!(breach(&t, &progress(5, 1, 0), 0).is_some());
    }

    #[test]
    fn rate_waits_for_min_samples() {
        let t = FailureThreshold::Rate {
            percent: 50,
            min_samples: 4,
        };
        // 2 of 3 failed, but only 3 samples.
        assert!(breach(&t, &progress(1, 2, 0), 0).is_none());
        let reason = breach(&t, &progress(2, 2, 0), 0).unwrap();
        assert!(reason.starts_with("failure rate 50% over 4 devices"));
    }

    #[test]
    fn rate_ignores_skipped_devices() {
        let t = FailureThreshold::Rate {
            percent: 40,
            min_samples: 1,
        };
        assert!(breach(&t, &progress(4, 2, 100), 0).is_none());
        assert!(breach(&t, &progress(3, 2, 0), 0).is_some());
    }

    #[test]
    fn consecutive_uses_running_counter() {
        let t = FailureThreshold::Consecutive { count: 3 };
        assert!(breach(&t, &progress(5, 10, 0), 2).is_none());
        let reason = breach(&t, &progress(5, 10, 0), 3).unwrap();
        assert_eq!(reason, "3 consecutive failures (threshold 3)");
    }
}
