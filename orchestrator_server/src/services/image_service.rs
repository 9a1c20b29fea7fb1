//! Build record persistence — every state transition is a discrete write.
//!
//! After creation a record is written only by the build task that owns it,
//! so readers polling `GET /images/{id}` observe monotonic progress without
//! row locking.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::image::{BuildStatus, DockerImage, NewDockerImage};
use crate::schema::docker_images;

/// Insert a new build record (status must be `pending`).
pub async fn create_image(
    conn: &mut AsyncPgConnection,
    new_image: NewDockerImage,
) -> Result<DockerImage, diesel::result::Error> {
    let result = diesel::insert_into(docker_images::table)
        .values(&new_image)
        .get_result::<DockerImage>(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Pending.as_str());
    tracing::info!(
        image_id = result.id,
        image = %result.image_ref(),
        repo = %result.github_repo,
        "Build record created"
    );

    Ok(result)
}

/// Look up a record by image coordinates (duplicate check).
pub async fn find_by_name_tag(
    conn: &mut AsyncPgConnection,
    name: &str,
    tag: &str,
) -> anyhow::Result<Option<DockerImage>> {
    let result = docker_images::table
        .filter(docker_images::name.eq(name))
        .filter(docker_images::tag.eq(tag))
        .first::<DockerImage>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// Get a record by ID.
pub async fn get_image(
    conn: &mut AsyncPgConnection,
    image_id: i64,
) -> anyhow::Result<Option<DockerImage>> {
    let result = docker_images::table
        .find(image_id)
        .first::<DockerImage>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// List records newest first, optionally filtered by status.
pub async fn list_images(
    conn: &mut AsyncPgConnection,
    status: Option<BuildStatus>,
) -> anyhow::Result<Vec<DockerImage>> {
    let mut query = docker_images::table
        .order(docker_images::created_at.desc())
        .into_boxed();

    if let Some(status) = status {
        query = query.filter(docker_images::build_status.eq(status.as_str()));
    }

    Ok(query.load(conn).await?)
}

/// Delete a record. Returns false when no row matched. The image artifact
/// in the Docker daemon, if any, is untouched.
pub async fn delete_image(conn: &mut AsyncPgConnection, image_id: i64) -> anyhow::Result<bool> {
    let deleted = diesel::delete(docker_images::table.find(image_id))
        .execute(conn)
        .await?;
    Ok(deleted > 0)
}

/// Transition `pending -> building`.
pub async fn mark_building(conn: &mut AsyncPgConnection, image_id: i64) -> anyhow::Result<()> {
    diesel::update(docker_images::table.find(image_id))
        .set(docker_images::build_status.eq(BuildStatus::Building.as_str()))
        .execute(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Building.as_str());
    Ok(())
}

/// Flush the accumulated build log. The buffer only ever grows, so each
/// write replaces the column with a superset of the previous value.
pub async fn write_log(
    conn: &mut AsyncPgConnection,
    image_id: i64,
    log: &str,
) -> anyhow::Result<()> {
    diesel::update(docker_images::table.find(image_id))
        .set(docker_images::build_log.eq(log))
        .execute(conn)
        .await?;
    Ok(())
}

/// Transition `building -> success`, stamping `built_at`.
pub async fn finish_success(
    conn: &mut AsyncPgConnection,
    image_id: i64,
    log: &str,
) -> anyhow::Result<()> {
    diesel::update(docker_images::table.find(image_id))
        .set((
            docker_images::build_status.eq(BuildStatus::Success.as_str()),
            docker_images::build_log.eq(log),
            docker_images::built_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Success.as_str());
    Ok(())
}

/// Changeset for the `failed` transition. `build_log: None` leaves the
/// column untouched rather than writing NULL, so a worker-error fallback
/// can never erase log content already streamed to the record.
#[derive(AsChangeset)]
#[diesel(table_name = docker_images)]
struct FailedChangeset<'a> {
    build_status: &'a str,
    build_log: Option<&'a str>,
    build_error: &'a str,
}

/// Transition to `failed` with a structured error. `log` is `None` for
/// setup failures that never produced build output; any log already
/// persisted for the record is retained in that case.
pub async fn finish_failed(
    conn: &mut AsyncPgConnection,
    image_id: i64,
    log: Option<&str>,
    error: &str,
) -> anyhow::Result<()> {
    diesel::update(docker_images::table.find(image_id))
        .set(FailedChangeset {
            build_status: BuildStatus::Failed.as_str(),
            build_log: log,
            build_error: error,
        })
        .execute(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Failed.as_str());
    Ok(())
}
