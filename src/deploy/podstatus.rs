//! Pod-status classification on readiness-wait timeout (spec.md §4.F).
//!
//! `classify` is consulted on every wait poll: some reasons are immediately
//! permanent (crash-looping, bad image reference, malformed container
//! config); the rest are transient and keep the small (~5-attempt) retry
//! loop going. If the retry budget itself runs out while still seeing a
//! transient reason, [`on_retry_budget_exhausted`] picks the typed error to
//! surface — `ImagePullFailed` for image-pull reasons, `HealthCheckTimeout`
//! otherwise.

use crate::error::ControlPlaneError;

pub enum Classification {
    Retry,
    Permanent(ControlPlaneError),
}

/// The handful of fields `classify` needs out of a pod's status, kept
/// narrow so this stays a pure function independent of the live
/// `kube::Api` client. `reason` is whichever of waiting/terminated reason
/// the pod currently reports (spec.md §4.F names both lists together).
pub struct PodSnapshot {
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub restart_count: i32,
}

pub fn classify(pod: &PodSnapshot) -> Classification {
    match pod.reason.as_deref() {
        Some("CrashLoopBackOff") => Classification::Permanent(ControlPlaneError::PodCrashLoopBackOff {
            message: "CrashLoopBackOff".to_string(),
        }),
        Some(reason @ ("InvalidImageName" | "CreateContainerConfigError" | "RunContainerError")) => {
            Classification::Permanent(ControlPlaneError::PodConfigurationFailed { message: reason.to_string() })
        }
        Some(reason @ ("Failed" | "Evicted")) => {
            Classification::Permanent(ControlPlaneError::PodConfigurationFailed { message: reason.to_string() })
        }
        Some("ImagePullBackOff" | "ErrImagePull" | "ContainerCreating" | "PodInitializing" | "Unschedulable") => {
            Classification::Retry
        }
        _ => match pod.exit_code {
            Some(code) if code != 0 && pod.restart_count > 3 => {
                Classification::Permanent(ControlPlaneError::PodCrashLoopBackOff {
                    message: format!("exit code {code} after {} restarts", pod.restart_count),
                })
            }
            _ => Classification::Retry,
        },
    }
}

/// Typed error to surface once the bounded retry budget (spec.md §4.F
/// "≈5") is exhausted while `classify` is still returning `Retry`.
pub fn on_retry_budget_exhausted(pod: &PodSnapshot) -> ControlPlaneError {
    match pod.reason.as_deref() {
        Some(reason @ ("ImagePullBackOff" | "ErrImagePull")) => {
            ControlPlaneError::ImagePullFailed { message: reason.to_string() }
        }
        Some("Unschedulable") => ControlPlaneError::PodSchedulingFailed {
            message: "unschedulable after retry budget exhausted".to_string(),
        },
        _ => ControlPlaneError::HealthCheckTimeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(reason: Option<&str>) -> PodSnapshot {
        PodSnapshot { reason: reason.map(str::to_string), exit_code: None, restart_count: 0 }
    }

    #[test]
    fn image_pull_backoff_retries() {
        assert!(matches!(classify(&snapshot(Some("ImagePullBackOff"))), Classification::Retry));
    }

    #[test]
    fn image_pull_backoff_exhaustion_is_image_pull_failed() {
        assert!(matches!(
            on_retry_budget_exhausted(&snapshot(Some("ImagePullBackOff"))),
            ControlPlaneError::ImagePullFailed { .. }
        ));
    }

    #[test]
    fn crash_loop_backoff_is_immediately_permanent() {
        assert!(matches!(
            classify(&snapshot(Some("CrashLoopBackOff"))),
            Classification::Permanent(ControlPlaneError::PodCrashLoopBackOff { .. })
        ));
    }

    #[test]
    fn exit_nonzero_with_many_restarts_is_permanent() {
        let pod = PodSnapshot { reason: None, exit_code: Some(1), restart_count: 5 };
        assert!(matches!(classify(&pod), Classification::Permanent(ControlPlaneError::PodCrashLoopBackOff { .. })));
    }

    #[test]
    fn exit_nonzero_with_few_restarts_retries() {
        let pod = PodSnapshot { reason: None, exit_code: Some(1), restart_count: 1 };
        assert!(matches!(classify(&pod), Classification::Retry));
    }

    #[test]
    fn no_reason_no_exit_retries() {
        assert!(matches!(classify(&snapshot(None)), Classification::Retry));
    }
}
