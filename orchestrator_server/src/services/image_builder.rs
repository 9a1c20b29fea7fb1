//! Image builder — turns a GitHub snapshot into a local Docker image.
//!
//! Pipeline for one attempt: ephemeral workspace → tarball download →
//! unpack (stripping the single top-level directory GitHub archives carry)
//! → Dockerfile lookup → `docker build` with line-streamed output.
//!
//! This module never touches the database. Output lines go to an unbounded
//! channel; the executor owns flushing them into the build record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use walkdir::WalkDir;

use crate::config::OrchestratorConfig;
use crate::services::github::{GithubClient, GithubError};

pub type LogSink = UnboundedSender<String>;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("snapshot download failed: {0}")]
    Download(#[source] GithubError),
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("failed to unpack snapshot: {0}")]
    Unpack(String),
    #[error("{0}")]
    MissingDockerfile(String),
    #[error("could not invoke {program}: {source}")]
    Invoke {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("docker build failed: exit code {0}")]
    ExitCode(i32),
    #[error("docker build timed out after {0}s")]
    Timeout(u64),
}

/// Inputs for one build attempt.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// GitHub repository, `owner/repo`.
    pub repo: String,
    /// Git ref (tag) to build from.
    pub git_ref: String,
    /// Full image reference, `name:tag`.
    pub image_ref: String,
    /// Dockerfile location relative to the repo root. A sub-path such as
    /// `cortex-orchestrator/Dockerfile` selects that directory as the
    /// build context.
    pub dockerfile_path: String,
}

pub struct ImageBuilder {
    github: GithubClient,
    docker_bin: String,
    workspace_dir: PathBuf,
    build_timeout: Duration,
}

impl ImageBuilder {
    pub fn new(config: &OrchestratorConfig, github: GithubClient) -> Self {
        Self {
            github,
            docker_bin: config.docker_bin.clone(),
            workspace_dir: config.workspace_dir.clone(),
            build_timeout: Duration::from_secs(config.build_timeout_secs),
        }
    }

    /// Acquire a uniquely-named ephemeral workspace. Dropping the returned
    /// guard removes the directory on every exit path.
    pub fn create_workspace(&self) -> Result<TempDir, BuildError> {
        let workspace = tempfile::Builder::new()
            .prefix("docker-build-")
            .tempdir_in(&self.workspace_dir)?;
        Ok(workspace)
    }

    /// Download the source tarball into the workspace. Runs before the
    /// record transitions to `building`; a failure here fails the build
    /// without any log output having been produced.
    pub async fn fetch_snapshot(
        &self,
        spec: &BuildSpec,
        workspace: &Path,
    ) -> Result<PathBuf, BuildError> {
        let tarball = workspace.join("snapshot.tar.gz");
        self.github
            .download_tarball(&spec.repo, &spec.git_ref, &tarball)
            .await
            .map_err(BuildError::Download)?;
        Ok(tarball)
    }

    /// Unpack a downloaded snapshot and run `docker build` against it,
    /// streaming every output line to `log` as it is produced.
    pub async fn build_from_snapshot(
        &self,
        spec: &BuildSpec,
        workspace: &Path,
        tarball: &Path,
        log: LogSink,
    ) -> Result<(), BuildError> {
        let _ = log.send(format!("Extracting snapshot of {}@{}...", spec.repo, spec.git_ref));

        let repo_root = {
            let tarball = tarball.to_path_buf();
            let dest = workspace.to_path_buf();
            tokio::task::spawn_blocking(move || unpack_snapshot(&tarball, &dest))
                .await
                .map_err(|e| BuildError::Unpack(e.to_string()))??
        };

        let (context, dockerfile) = resolve_build_context(&repo_root, &spec.dockerfile_path)?;

        let _ = log.send(format!("Building Docker image: {}", spec.image_ref));
        let _ = log.send(format!("Build context: {}", context.display()));
        let _ = log.send(format!("Dockerfile: {dockerfile}"));

        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["build", "--pull", "--force-rm", "-f", &dockerfile, "-t", &spec.image_ref, "."])
            .current_dir(&context);

        let status = run_streamed(cmd, &self.docker_bin, &log, self.build_timeout).await?;
        if !status.success() {
            return Err(BuildError::ExitCode(status.code().unwrap_or(-1)));
        }

        let _ = log.send(format!("Successfully built image: {}", spec.image_ref));
        Ok(())
    }
}

/// Unpack a gzipped tarball into `dest` and return the repository root.
///
/// GitHub tarballs contain a single `owner-repo-sha` top-level directory;
/// that directory is the repo root. Blocking — call from `spawn_blocking`.
pub fn unpack_snapshot(tarball: &Path, dest: &Path) -> Result<PathBuf, BuildError> {
    let file = std::fs::File::open(tarball)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| BuildError::Unpack(e.to_string()))?;

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dest)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .next()
        .ok_or_else(|| BuildError::Unpack("no directory found in extracted snapshot".to_string()))
}

/// Resolve `dockerfile_path` against the unpacked repo root into a build
/// context directory and a Dockerfile name. A missing Dockerfile reports
/// any Dockerfiles found elsewhere in the tree to guide the caller.
pub fn resolve_build_context(
    repo_root: &Path,
    dockerfile_path: &str,
) -> Result<(PathBuf, String), BuildError> {
    let rel = Path::new(dockerfile_path);
    let (context, dockerfile) = match rel.parent() {
        Some(parent) if parent != Path::new("") => {
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Dockerfile".to_string());
            (repo_root.join(parent), name)
        }
        _ => (repo_root.to_path_buf(), dockerfile_path.to_string()),
    };

    let full_path = context.join(&dockerfile);
    if full_path.is_file() {
        return Ok((context, dockerfile));
    }

    let found: Vec<String> = WalkDir::new(repo_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == "Dockerfile")
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(repo_root)
                .ok()
                .map(|p| p.display().to_string())
        })
        .collect();

    let mut msg = format!("Dockerfile not found at {}.", full_path.display());
    if found.is_empty() {
        msg.push_str(" No Dockerfiles found in repository.");
    } else {
        msg.push_str(&format!(" Found Dockerfiles at: {}", found.join(", ")));
    }
    Err(BuildError::MissingDockerfile(msg))
}

/// Spawn a command with piped stdout/stderr and forward each line to the
/// sink. Kills the child on timeout.
pub async fn run_streamed(
    mut cmd: Command,
    program: &str,
    log: &LogSink,
    timeout: Duration,
) -> Result<std::process::ExitStatus, BuildError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| BuildError::Invoke {
        program: program.to_string(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let result = tokio::time::timeout(timeout, async {
        let out = async {
            if let Some(stdout) = stdout {
                pump_lines(stdout, log).await;
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                pump_lines(stderr, log).await;
            }
        };
        tokio::join!(out, err);
        child.wait().await
    })
    .await;

    match result {
        Ok(status) => Ok(status.map_err(|source| BuildError::Invoke {
            program: program.to_string(),
            source,
        })?),
        Err(_) => Err(BuildError::Timeout(timeout.as_secs())),
    }
}

/// Forward each line to the sink, converting invalid UTF-8 lossily so a
/// stray byte in the build output never aborts log capture.
async fn pump_lines<R: AsyncRead + Unpin>(reader: R, log: &LogSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let _ = log.send(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                tracing::debug!("output stream read error: {e}");
                break;
            }
        }
    }
}

// ── Image inspection ──

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("image not found in local Docker daemon: {0}")]
    NotFound(String),
    #[error("could not invoke {program}: {source}")]
    Invoke {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("docker inspect failed: {0}")]
    Failed(String),
    #[error("unexpected docker inspect output: {0}")]
    Parse(String),
}

/// Configuration baked into a built image.
#[derive(Debug, Clone)]
pub struct ImageInspection {
    pub env_vars: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub created: Option<String>,
}

/// Read env vars, labels, and creation date off a locally built image.
pub async fn inspect_image(
    docker_bin: &str,
    image_ref: &str,
) -> Result<ImageInspection, InspectError> {
    let output = Command::new(docker_bin)
        .args(["image", "inspect", image_ref])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| InspectError::Invoke {
            program: docker_bin.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("No such image") || stderr.contains("No such object") {
            return Err(InspectError::NotFound(image_ref.to_string()));
        }
        return Err(InspectError::Failed(stderr));
    }

    let parsed: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
        .map_err(|e| InspectError::Parse(e.to_string()))?;
    let detail = parsed
        .first()
        .ok_or_else(|| InspectError::Parse("empty inspect result".to_string()))?;

    Ok(parse_inspect_output(detail))
}

/// Map a raw `docker image inspect` object to [`ImageInspection`].
pub fn parse_inspect_output(detail: &serde_json::Value) -> ImageInspection {
    let config = &detail["Config"];

    let env_vars = config["Env"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let labels = config["Labels"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let created = detail["Created"].as_str().map(|s| s.to_string());

    ImageInspection {
        env_vars,
        labels,
        created,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    /// Build a gzipped tarball shaped like a GitHub snapshot: a single
    /// `owner-repo-sha` top-level directory containing the given files.
    fn make_snapshot(dir: &Path, top_level: &str, files: &[(&str, &str)]) -> PathBuf {
        let tarball = dir.join("snapshot.tar.gz");
        let file = std::fs::File::create(&tarball).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    format!("{top_level}/{name}"),
                    content.as_bytes(),
                )
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        tarball
    }

    #[test]
    fn unpack_strips_top_level_directory() {
        let workspace = tempfile::tempdir().unwrap();
        let tarball = make_snapshot(
            workspace.path(),
            "habitio-bre-cortex-c5b97d5",
            &[("Dockerfile", "FROM scratch\n"), ("src/main.py", "print()\n")],
        );

        let repo_root = unpack_snapshot(&tarball, workspace.path()).unwrap();

        assert!(repo_root.ends_with("habitio-bre-cortex-c5b97d5"));
        assert!(repo_root.join("Dockerfile").is_file());
        assert!(repo_root.join("src/main.py").is_file());
    }

    #[test]
    fn unpack_rejects_snapshot_without_directory() {
        let workspace = tempfile::tempdir().unwrap();
        // Tarball with a bare file, no top-level directory.
        let tarball = workspace.path().join("flat.tar.gz");
        let file = std::fs::File::create(&tarball).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "loose", b"data\n".as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = unpack_snapshot(&tarball, workspace.path()).unwrap_err();
        assert!(matches!(err, BuildError::Unpack(_)));
        assert!(err.to_string().contains("no directory found"));
    }

    #[test]
    fn resolves_dockerfile_at_repo_root() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let (context, dockerfile) = resolve_build_context(repo.path(), "Dockerfile").unwrap();
        assert_eq!(context, repo.path());
        assert_eq!(dockerfile, "Dockerfile");
    }

    #[test]
    fn resolves_dockerfile_in_subdirectory() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("cortex-orchestrator")).unwrap();
        std::fs::write(
            repo.path().join("cortex-orchestrator/Dockerfile"),
            "FROM scratch\n",
        )
        .unwrap();

        let (context, dockerfile) =
            resolve_build_context(repo.path(), "cortex-orchestrator/Dockerfile").unwrap();
        assert_eq!(context, repo.path().join("cortex-orchestrator"));
        assert_eq!(dockerfile, "Dockerfile");
    }

    #[test]
    fn missing_dockerfile_lists_candidates() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("deploy")).unwrap();
        std::fs::write(repo.path().join("deploy/Dockerfile"), "FROM scratch\n").unwrap();

        let err = resolve_build_context(repo.path(), "Dockerfile").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Dockerfile not found"));
        assert!(msg.contains("deploy/Dockerfile"));
    }

    #[test]
    fn missing_dockerfile_without_candidates() {
        let repo = tempfile::tempdir().unwrap();

        let err = resolve_build_context(repo.path(), "Dockerfile").unwrap_err();
        assert!(err.to_string().contains("No Dockerfiles found"));
    }

    #[tokio::test]
    async fn streamed_command_captures_output_and_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo step one; echo step two >&2; exit 3"]);

        let status = run_streamed(cmd, "sh", &tx, Duration::from_secs(10))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(status.code(), Some(3));
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert!(lines.contains(&"step one".to_string()));
        assert!(lines.contains(&"step two".to_string()));
    }

    #[tokio::test]
    async fn streamed_command_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'a\\nb\\n'"]);

        let status = run_streamed(cmd, "sh", &tx, Duration::from_secs(10))
            .await
            .unwrap();
        drop(tx);

        assert!(status.success());
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn streamed_command_tolerates_invalid_utf8() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        // Middle line carries raw non-UTF-8 bytes, as docker output can.
        cmd.args(["-c", r"printf 'ok\n\377\376 raw\nafter\n'"]);

        let status = run_streamed(cmd, "sh", &tx, Duration::from_secs(10))
            .await
            .unwrap();
        drop(tx);

        assert!(status.success());
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ok");
        assert!(lines[1].contains('\u{FFFD}'));
        assert_eq!(lines[2], "after");
    }

    #[test]
    fn download_failure_names_the_snapshot_phase() {
        // Pollers key on this prefix to tell a pending-phase failure from
        // a docker one; the record goes pending -> failed with no log.
        let err = BuildError::Download(GithubError::NotFound(
            "habitio/bre-cortex@v9.9.9".to_string(),
        ));
        let msg = err.to_string();
        assert!(msg.starts_with("snapshot download failed"));

        let rate_limited = BuildError::Download(GithubError::RateLimited);
        assert!(rate_limited.to_string().starts_with("snapshot download failed"));
    }

    #[tokio::test]
    async fn streamed_command_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);

        let err = run_streamed(cmd, "sh", &tx, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_program_is_an_invoke_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cmd = Command::new("definitely-not-a-real-binary-xyz");

        let err = run_streamed(cmd, "definitely-not-a-real-binary-xyz", &tx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Invoke { .. }));
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let workspace = tempfile::Builder::new()
            .prefix("docker-build-")
            .tempdir()
            .unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::File::create(path.join("leftover"))
            .unwrap()
            .write_all(b"x")
            .unwrap();
        assert!(path.exists());

        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn parses_inspect_output() {
        let detail: serde_json::Value = serde_json::json!({
            "Id": "sha256:abc",
            "Created": "2024-11-02T10:20:30Z",
            "Config": {
                "Env": ["PATH=/usr/local/bin", "PORT=8000"],
                "Labels": {
                    "io.habit.cortex.env.APPLICATION_ID.required": "true",
                    "maintainer": "habit"
                }
            }
        });

        let inspection = parse_inspect_output(&detail);
        assert_eq!(inspection.env_vars, vec!["PATH=/usr/local/bin", "PORT=8000"]);
        assert_eq!(inspection.labels.get("maintainer").map(String::as_str), Some("habit"));
        assert_eq!(inspection.created.as_deref(), Some("2024-11-02T10:20:30Z"));
    }

    #[test]
    fn inspect_output_tolerates_missing_config() {
        let detail = serde_json::json!({ "Id": "sha256:abc" });
        let inspection = parse_inspect_output(&detail);
        assert!(inspection.env_vars.is_empty());
        assert!(inspection.labels.is_empty());
        assert!(inspection.created.is_none());
    }
}
