//! Build executor — runs one accepted build on a background task.
//!
//! `spawn_build` is fire-and-forget: the HTTP handler returns 201 while the
//! build runs to a terminal state on its own task. Concurrency is capped by
//! a semaphore; waiting for a permit happens inside the spawned task so the
//! API response is never delayed.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::config::OrchestratorConfig;
use crate::db::Pool;
use crate::models::image::DockerImage;
use crate::services::github::GithubClient;
use crate::services::image_builder::{BuildSpec, ImageBuilder};
use crate::services::image_service;

/// Dispatch a pending build. Returns immediately.
pub fn spawn_build(
    pool: Pool,
    config: OrchestratorConfig,
    limiter: Arc<Semaphore>,
    image: DockerImage,
    dockerfile_path: String,
) {
    tokio::spawn(async move {
        let image_id = image.id;
        let image_ref = image.image_ref();
        if let Err(e) = run_build(pool.clone(), config, limiter, image, dockerfile_path).await {
            tracing::error!(image_id, image = %image_ref, "Build worker failed: {e}");
            // Best effort: do not leave the record stuck in a non-terminal
            // state when the worker itself errored.
            if let Ok(mut conn) = pool.get().await {
                let _ = image_service::finish_failed(
                    &mut conn,
                    image_id,
                    None,
                    &format!("build worker error: {e}"),
                )
                .await;
            }
        }
    });
}

/// Execute one build attempt end-to-end.
///
/// Transition order: the snapshot is downloaded while the record is still
/// `pending`, so a download failure goes `pending -> failed` directly and
/// the record never shows a log-streaming phase that did not happen.
async fn run_build(
    pool: Pool,
    config: OrchestratorConfig,
    limiter: Arc<Semaphore>,
    image: DockerImage,
    dockerfile_path: String,
) -> anyhow::Result<()> {
    let permit = limiter.clone().acquire_owned().await?;
    crate::metrics::builds_in_flight(
        config
            .max_concurrent_builds
            .saturating_sub(limiter.available_permits()),
    );

    let spec = BuildSpec {
        repo: image.github_repo.clone(),
        git_ref: image.tag.clone(),
        image_ref: image.image_ref(),
        dockerfile_path,
    };

    tracing::info!(
        image_id = image.id,
        image = %spec.image_ref,
        repo = %spec.repo,
        git_ref = %spec.git_ref,
        "Executing build"
    );

    let github = GithubClient::new(config.github_token_opt());
    let builder = ImageBuilder::new(&config, github);
    let start = Instant::now();

    // Workspace guard lives for the whole attempt; dropped on every path.
    let workspace = builder.create_workspace()?;

    let tarball = match builder.fetch_snapshot(&spec, workspace.path()).await {
        Ok(tarball) => tarball,
        Err(e) => {
            tracing::warn!(image_id = image.id, "Snapshot download failed: {e}");
            let mut conn = pool.get().await?;
            image_service::finish_failed(&mut conn, image.id, None, &e.to_string()).await?;
            crate::metrics::build_duration(start.elapsed().as_millis() as u64);
            drop(permit);
            crate::metrics::builds_in_flight(
                config
                    .max_concurrent_builds
                    .saturating_sub(limiter.available_permits()),
            );
            return Ok(());
        }
    };

    {
        let mut conn = pool.get().await?;
        image_service::mark_building(&mut conn, image.id).await?;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let drain = tokio::spawn(drain_log(
        pool.clone(),
        image.id,
        rx,
        config.max_log_bytes,
    ));

    let result = builder
        .build_from_snapshot(&spec, workspace.path(), &tarball, tx)
        .await;

    // The sink was moved into the build; once it returns the channel is
    // closed and the drain task flushes its final state.
    let final_log = drain.await?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let mut conn = pool.get().await?;
    match result {
        Ok(()) => {
            image_service::finish_success(&mut conn, image.id, &final_log).await?;
            tracing::info!(
                image_id = image.id,
                image = %spec.image_ref,
                duration_ms,
                "Build succeeded"
            );
        }
        Err(e) => {
            image_service::finish_failed(&mut conn, image.id, Some(&final_log), &e.to_string())
                .await?;
            tracing::warn!(
                image_id = image.id,
                image = %spec.image_ref,
                duration_ms,
                "Build failed: {e}"
            );
        }
    }
    crate::metrics::build_duration(duration_ms);

    drop(permit);
    crate::metrics::builds_in_flight(
        config
            .max_concurrent_builds
            .saturating_sub(limiter.available_permits()),
    );

    Ok(())
}

/// Accumulate streamed log lines and flush the buffer to the record as each
/// line arrives, so pollers see live progress. Returns the final log text.
async fn drain_log(
    pool: Pool,
    image_id: i64,
    mut rx: mpsc::UnboundedReceiver<String>,
    max_log_bytes: usize,
) -> String {
    let mut buffer = String::new();
    let mut conn = None;

    while let Some(line) = rx.recv().await {
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(&line);
        truncate_log(&mut buffer, max_log_bytes);

        if conn.is_none() {
            conn = pool.get().await.ok();
        }
        if let Some(conn) = conn.as_mut() {
            if let Err(e) = image_service::write_log(conn, image_id, &buffer).await {
                tracing::warn!(image_id, "Failed to flush build log: {e}");
            }
        }
    }

    buffer
}

/// Drop lines from the head once the buffer exceeds `max_bytes`, keeping
/// the tail and a truncation marker.
pub fn truncate_log(buffer: &mut String, max_bytes: usize) {
    const MARKER: &str = "...truncated...\n";
    if buffer.len() <= max_bytes {
        return;
    }

    let keep_from = buffer.len() - max_bytes;
    // Cut at the next line boundary past the byte budget; fall back to the
    // next char boundary for a single oversized line.
    let mut cut = match buffer[..].char_indices().find(|(i, _)| *i >= keep_from) {
        Some((i, _)) => i,
        None => return,
    };
    if let Some(nl) = buffer[cut..].find('\n') {
        cut += nl + 1;
    }
    let tail = buffer.split_off(cut);
    buffer.clear();
    buffer.push_str(MARKER);
    buffer.push_str(&tail);
}
