//! Pod Security Admission enforcement matrix (spec.md §4.F).

use k8s_openapi::api::core::v1::{
    Capabilities, PodSecurityContext, SeccompProfile, SecurityContext,
};

use crate::config::PsaLevel;

/// Desired container-level `securityContext` for `level`.
pub fn container_security_context(level: PsaLevel) -> SecurityContext {
    match level {
        PsaLevel::Privileged => SecurityContext::default(),
        PsaLevel::Baseline => SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        },
        PsaLevel::Restricted => SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            run_as_group: Some(1000),
            capabilities: Some(Capabilities { drop: Some(vec!["ALL".to_string()]), add: None }),
            seccomp_profile: Some(SeccompProfile { type_: "RuntimeDefault".to_string(), localhost_profile: None }),
            ..Default::default()
        },
    }
}

/// Desired pod-level `securityContext` for `level`.
pub fn pod_security_context(level: PsaLevel) -> PodSecurityContext {
    match level {
        PsaLevel::Privileged => PodSecurityContext::default(),
        PsaLevel::Baseline => PodSecurityContext {
            seccomp_profile: Some(SeccompProfile { type_: "RuntimeDefault".to_string(), localhost_profile: None }),
            ..Default::default()
        },
        PsaLevel::Restricted => PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            run_as_group: Some(1000),
            fs_group: Some(1000),
            seccomp_profile: Some(SeccompProfile { type_: "RuntimeDefault".to_string(), localhost_profile: None }),
            ..Default::default()
        },
    }
}

/// Audits a live deployment's security contexts field-by-field against the
/// matrix for `level`; any deviation forces redeploy (spec.md §4.F
/// `needsPSAUpdate`).
pub fn needs_psa_update(
    live_container: &SecurityContext,
    live_pod: &PodSecurityContext,
    level: PsaLevel,
) -> bool {
    live_container != &container_security_context(level) || live_pod != &pod_security_context(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_level_imposes_no_constraints() {
        let ctx = container_security_context(PsaLevel::Privileged);
        assert_eq!(ctx, SecurityContext::default());
    }

    #[test]
    fn restricted_level_drops_all_capabilities() {
        let ctx = container_security_context(PsaLevel::Restricted);
        assert_eq!(ctx.run_as_non_root, Some(true));
        assert_eq!(ctx.capabilities.unwrap().drop, Some(vec!["ALL".to_string()]));
    }

    #[test]
    fn mismatched_live_context_needs_update() {
        let live = container_security_context(PsaLevel::Baseline);
        let pod = pod_security_context(PsaLevel::Baseline);
        assert!(!needs_psa_update(&live, &pod, PsaLevel::Baseline));
        assert!(needs_psa_update(&live, &pod, PsaLevel::Restricted));
    }
}
