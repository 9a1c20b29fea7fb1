//! Orchestrator configuration — loaded from environment variables.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// GitHub personal access token for API calls. Empty means anonymous
    /// access (public repositories only, lower rate limit).
    pub github_token: String,
    /// Default repository for the tag-listing endpoint.
    pub github_default_repo: String,
    /// Parent directory for ephemeral build workspaces.
    pub workspace_dir: PathBuf,
    /// Docker binary invoked for builds and inspection.
    pub docker_bin: String,
    /// Maximum number of concurrent image builds.
    pub max_concurrent_builds: usize,
    /// Hard timeout on a single `docker build` invocation.
    pub build_timeout_secs: u64,
    /// Cap on a stored build log; older lines are dropped from the head.
    pub max_log_bytes: usize,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let github_token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        let github_default_repo = std::env::var("ORCH_DEFAULT_REPO")
            .unwrap_or_else(|_| "habitio/bre-cortex".to_string());
        let workspace_dir = std::env::var("ORCH_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let docker_bin = std::env::var("ORCH_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        let max_concurrent_builds = std::env::var("ORCH_MAX_CONCURRENT_BUILDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);
        let build_timeout_secs = std::env::var("ORCH_BUILD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1800);
        let max_log_bytes = std::env::var("ORCH_MAX_LOG_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256 * 1024);

        if github_token.is_empty() {
            tracing::warn!("GITHUB_TOKEN not set -- private repositories unavailable");
        }

        Self {
            github_token,
            github_default_repo,
            workspace_dir,
            docker_bin,
            max_concurrent_builds,
            build_timeout_secs,
            max_log_bytes,
        }
    }

    /// Token as an `Option`, empty string meaning unset.
    pub fn github_token_opt(&self) -> Option<String> {
        if self.github_token.is_empty() {
            None
        } else {
            Some(self.github_token.clone())
        }
    }
}
