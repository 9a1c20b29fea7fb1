//! docker_images — one Docker image built from a GitHub tag.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::docker_images;

/// Lifecycle of a build attempt.
///
/// `pending → building → success | failed`. The only shortcut is
/// `pending → failed` when the snapshot download fails before the image
/// builder is ever invoked. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "building" => Ok(BuildStatus::Building),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = docker_images)]
pub struct DockerImage {
    pub id: i64,
    pub name: String,
    pub tag: String,
    pub github_repo: String,
    pub github_ref: String,
    pub commit_sha: String,
    pub build_status: String,
    pub build_log: Option<String>,
    pub build_error: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DockerImage {
    /// Full image reference passed to `docker build -t`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = docker_images)]
pub struct NewDockerImage {
    pub name: String,
    pub tag: String,
    pub github_repo: String,
    pub github_ref: String,
    pub commit_sha: String,
    pub build_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Building,
            BuildStatus::Success,
            BuildStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("running".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn only_success_and_failed_are_terminal() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }
}
