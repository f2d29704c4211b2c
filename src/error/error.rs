//! Error types for the MCP control plane.

use thiserror::Error;

/// Result type alias used throughout the control plane.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Discriminated error kinds, one per spec.md §7 "Error kinds" row.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Record or referenced object does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// ACR/model-access policy denied the request.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Request failed validation.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Optimistic-concurrency conflict; retried internally, only surfaced
    /// after the retry budget is exhausted.
    #[error("conflict after retry budget exhausted: {message}")]
    Conflict { message: String },

    /// Capacity precheck found no room in the namespace's resource quotas.
    #[error("insufficient capacity: contact administrator")]
    InsufficientCapacity,

    /// Backend probe reported the workload unhealthy.
    #[error("server is not healthy: {message}")]
    HealthCheckFailed { message: String },

    /// Backend probe did not become healthy within the wait budget.
    #[error("server is not healthy: timed out waiting for readiness")]
    HealthCheckTimeout,

    /// Upstream MCP server returned no response.
    #[error("no response from MCP server")]
    NoResult,

    /// Upstream MCP server requires the caller to complete OAuth first.
    #[error("authentication required")]
    AuthRequired,

    /// Upstream MCP server does not implement the requested method.
    #[error("server does not support {method}")]
    MethodNotFound { method: String },

    /// The deployment backend cannot perform the requested action for this
    /// runtime (e.g. log streaming on a `remote` server).
    #[error("not supported by backend: {message}")]
    NotSupportedByBackend { message: String },

    /// Per-user token-usage budget exceeded.
    #[error("too many requests: token budget exceeded")]
    TooManyRequests,

    /// Caller is not authenticated.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Typed pod/deployment failure classifications (§4.F).
    #[error("image pull failed: {message}")]
    ImagePullFailed { message: String },
    #[error("pod crash loop backoff: {message}")]
    PodCrashLoopBackOff { message: String },
    #[error("pod configuration failed: {message}")]
    PodConfigurationFailed { message: String },
    #[error("pod scheduling failed: {message}")]
    PodSchedulingFailed { message: String },

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ControlPlaneError {
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden { message: message.into() }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest { message: message.into() }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn health_check_failed<S: Into<String>>(message: S) -> Self {
        Self::HealthCheckFailed { message: message.into() }
    }

    pub fn method_not_found<S: Into<String>>(method: S) -> Self {
        Self::MethodNotFound { method: method.into() }
    }

    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Self::NotSupportedByBackend { message: message.into() }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Whether the reconciler runtime should retry this error rather than
    /// treat it as a terminal handler failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Conflict { .. }
                | ControlPlaneError::Kube(_)
                | ControlPlaneError::Http(_)
                | ControlPlaneError::Io(_)
                | ControlPlaneError::HealthCheckTimeout
        )
    }

    /// `NotFound` on cascade-delete is always swallowed (spec.md §7).
    pub fn is_not_found(&self) -> bool {
        match self {
            ControlPlaneError::NotFound { .. } => true,
            ControlPlaneError::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Category tag for structured logging.
    pub fn category(&self) -> &'static str {
        match self {
            ControlPlaneError::NotFound { .. } => "not_found",
            ControlPlaneError::Forbidden { .. } => "forbidden",
            ControlPlaneError::BadRequest { .. } => "bad_request",
            ControlPlaneError::Conflict { .. } => "conflict",
            ControlPlaneError::InsufficientCapacity => "insufficient_capacity",
            ControlPlaneError::HealthCheckFailed { .. } => "health_check_failed",
            ControlPlaneError::HealthCheckTimeout => "health_check_timeout",
            ControlPlaneError::NoResult => "no_result",
            ControlPlaneError::AuthRequired => "auth_required",
            ControlPlaneError::MethodNotFound { .. } => "method_not_found",
            ControlPlaneError::NotSupportedByBackend { .. } => "not_supported_by_backend",
            ControlPlaneError::TooManyRequests => "too_many_requests",
            ControlPlaneError::Unauthorized { .. } => "unauthorized",
            ControlPlaneError::ImagePullFailed { .. } => "image_pull_failed",
            ControlPlaneError::PodCrashLoopBackOff { .. } => "pod_crash_loop_backoff",
            ControlPlaneError::PodConfigurationFailed { .. } => "pod_configuration_failed",
            ControlPlaneError::PodSchedulingFailed { .. } => "pod_scheduling_failed",
            ControlPlaneError::Kube(_) => "kube",
            ControlPlaneError::Http(_) => "http",
            ControlPlaneError::Serde(_) => "serde",
            ControlPlaneError::Yaml(_) => "yaml",
            ControlPlaneError::Io(_) => "io",
            ControlPlaneError::Internal(_) => "internal",
        }
    }

    /// HTTP status mapping used by the `web` layer (spec.md §7 table).
    pub fn status_code(&self) -> u16 {
        match self {
            ControlPlaneError::NotFound { .. } => 404,
            ControlPlaneError::Forbidden { .. } => 403,
            ControlPlaneError::BadRequest { .. } => 400,
            ControlPlaneError::Conflict { .. } => 409,
            ControlPlaneError::InsufficientCapacity => 503,
            ControlPlaneError::HealthCheckFailed { .. } => 503,
            ControlPlaneError::HealthCheckTimeout => 503,
            ControlPlaneError::NoResult => 503,
            ControlPlaneError::AuthRequired => 412,
            ControlPlaneError::MethodNotFound { .. } => 424,
            ControlPlaneError::NotSupportedByBackend { .. } => 400,
            ControlPlaneError::TooManyRequests => 429,
            ControlPlaneError::Unauthorized { .. } => 401,
            ControlPlaneError::ImagePullFailed { .. }
            | ControlPlaneError::PodCrashLoopBackOff { .. }
            | ControlPlaneError::PodConfigurationFailed { .. }
            | ControlPlaneError::PodSchedulingFailed { .. } => 503,
            ControlPlaneError::Kube(_) => 502,
            ControlPlaneError::Http(_) => 502,
            ControlPlaneError::Serde(_) | ControlPlaneError::Yaml(_) => 400,
            ControlPlaneError::Io(_) | ControlPlaneError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable_but_forbidden_is_not() {
        assert!(ControlPlaneError::conflict("stale version").is_retryable());
        assert!(!ControlPlaneError::forbidden("no access").is_retryable());
    }

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(ControlPlaneError::AuthRequired.status_code(), 412);
        assert_eq!(ControlPlaneError::method_not_found("tools/list").status_code(), 424);
        assert_eq!(ControlPlaneError::TooManyRequests.status_code(), 429);
        assert_eq!(ControlPlaneError::InsufficientCapacity.status_code(), 503);
    }
}
