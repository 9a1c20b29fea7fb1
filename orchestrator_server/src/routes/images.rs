//! JSON shapes for the image API, plus label metadata parsing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::image::DockerImage;
use crate::services::github::TagInfo;

/// Request body for `POST /api/v1/images`.
#[derive(Debug, Deserialize)]
pub struct ImageBuildRequest {
    /// GitHub repository, `owner/repo`.
    pub repo: String,
    /// Git tag to build.
    pub tag: String,
    /// Commit SHA for provenance.
    pub commit_sha: String,
    /// Base image name; the built image is tagged `image_name:tag`.
    #[serde(default = "default_image_name")]
    pub image_name: String,
    /// Dockerfile location relative to the repo root.
    #[serde(default = "default_dockerfile_path")]
    pub dockerfile_path: String,
}

fn default_image_name() -> String {
    "bre-payments".to_string()
}

fn default_dockerfile_path() -> String {
    "Dockerfile".to_string()
}

/// Build record as returned by the API.
#[derive(Debug, Serialize)]
pub struct ImageJson {
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

impl From<DockerImage> for ImageJson {
    fn from(image: DockerImage) -> Self {
        Self {
            id: image.id,
            name: image.name,
            tag: image.tag,
            github_repo: image.github_repo,
            github_ref: image.github_ref,
            commit_sha: image.commit_sha,
            build_status: image.build_status,
            build_log: image.build_log,
            build_error: image.build_error,
            built_at: image.built_at,
            created_at: image.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TagsResponse {
    pub tags: Vec<TagInfo>,
}

/// Response for `GET /api/v1/images/{id}/inspect`.
#[derive(Debug, Serialize)]
pub struct ImageInspectJson {
    pub image_name: String,
    pub env_vars: Vec<String>,
    pub env_metadata: Vec<EnvVarMetadata>,
    pub labels: BTreeMap<String, String>,
    pub created: Option<String>,
}

/// Metadata for one environment variable, parsed from image labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvVarMetadata {
    pub name: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl EnvVarMetadata {
    fn required(&self) -> bool {
        matches!(self.attributes.get("required"), Some(Value::Bool(true)))
    }
}

/// Parse env-var metadata from image labels of the form
/// `io.habit.cortex.env.<VAR_NAME>.<attribute>`. String booleans become
/// real booleans. Required variables sort first, then by name.
pub fn parse_env_metadata(labels: &BTreeMap<String, String>) -> Vec<EnvVarMetadata> {
    const PREFIX: &str = "io.habit.cortex.env.";

    let mut vars: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(PREFIX) else {
            continue;
        };
        let Some((var_name, attribute)) = rest.split_once('.') else {
            continue;
        };

        let parsed = match value.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(value.clone()),
        };
        vars.entry(var_name.to_string())
            .or_default()
            .insert(attribute.to_string(), parsed);
    }

    let mut result: Vec<EnvVarMetadata> = vars
        .into_iter()
        .map(|(name, attributes)| EnvVarMetadata { name, attributes })
        .collect();
    result.sort_by(|a, b| (!a.required(), &a.name).cmp(&(!b.required(), &b.name)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_env_metadata_from_labels() {
        let labels = labels(&[
            ("io.habit.cortex.env.APPLICATION_ID.required", "true"),
            ("io.habit.cortex.env.APPLICATION_ID.description", "App identifier"),
            ("io.habit.cortex.env.LOG_LEVEL.required", "false"),
            ("io.habit.cortex.env.LOG_LEVEL.default", "info"),
            ("maintainer", "habit"),
        ]);

        let metadata = parse_env_metadata(&labels);
        assert_eq!(metadata.len(), 2);

        assert_eq!(metadata[0].name, "APPLICATION_ID");
        assert_eq!(metadata[0].attributes["required"], Value::Bool(true));
        assert_eq!(
            metadata[0].attributes["description"],
            Value::String("App identifier".to_string())
        );

        assert_eq!(metadata[1].name, "LOG_LEVEL");
        assert_eq!(metadata[1].attributes["required"], Value::Bool(false));
        assert_eq!(metadata[1].attributes["default"], Value::String("info".to_string()));
    }

    #[test]
    fn required_vars_sort_before_optional() {
        let labels = labels(&[
            ("io.habit.cortex.env.ZULU.required", "true"),
            ("io.habit.cortex.env.ALPHA.required", "false"),
            ("io.habit.cortex.env.BRAVO.required", "true"),
        ]);

        let metadata = parse_env_metadata(&labels);
        let names: Vec<&str> = metadata.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["BRAVO", "ZULU", "ALPHA"]);
    }

    #[test]
    fn malformed_labels_are_skipped() {
        let labels = labels(&[
            ("io.habit.cortex.env.NOATTRIBUTE", "true"),
            ("unrelated.label", "x"),
        ]);
        assert!(parse_env_metadata(&labels).is_empty());
    }

    #[test]
    fn build_request_defaults() {
        let req: ImageBuildRequest = serde_json::from_str(
            r#"{"repo": "habitio/bre-cortex", "tag": "v1.2.3", "commit_sha": "abc123"}"#,
        )
        .unwrap();
        assert_eq!(req.image_name, "bre-payments");
        assert_eq!(req.dockerfile_path, "Dockerfile");
    }
}
