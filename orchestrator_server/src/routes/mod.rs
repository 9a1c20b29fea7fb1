//! HTTP routes for the image build API.

pub mod images;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::Semaphore;

use crate::config::OrchestratorConfig;
use crate::db::Pool;
use crate::models::image::{BuildStatus, NewDockerImage};
use crate::services::image_builder::{self, InspectError};
use crate::services::github::{GithubClient, GithubError};
use crate::services::{executor, image_service};

use images::{ImageBuildRequest, ImageInspectJson, ImageJson, TagsResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: OrchestratorConfig,
    /// Caps concurrent builds; permits are acquired inside the spawned
    /// build task, never in a request handler.
    pub build_limiter: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pool: Pool, config: OrchestratorConfig) -> Self {
        let build_limiter = Arc::new(Semaphore::new(config.max_concurrent_builds));
        Self {
            pool,
            config,
            build_limiter,
        }
    }
}

/// Build the image API router (nested at `/api/v1/images`).
pub fn images_router(state: AppState) -> Router {
    Router::new()
        .route("/github-tags", get(list_github_tags))
        .route("/", get(list_images).post(create_image_build))
        .route("/{image_id}", get(get_image).delete(delete_image))
        .route("/{image_id}/inspect", get(inspect_image))
        .with_state(state)
}

// ── Error mapping ──

/// API error carrying an HTTP status and a `detail` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, detail)
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail }));
        (self.status, body).into_response()
    }
}

impl From<GithubError> for ApiError {
    fn from(err: GithubError) -> Self {
        match err {
            GithubError::NotFound(what) => Self::not_found(format!("Not found on GitHub: {what}")),
            GithubError::RateLimited => {
                Self::new(StatusCode::BAD_GATEWAY, "GitHub API rate limit exceeded")
            }
            other => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("Failed to fetch from GitHub: {other}"),
            ),
        }
    }
}

async fn get_conn(
    pool: &Pool,
) -> Result<diesel_async::pooled_connection::deadpool::Object<diesel_async::AsyncPgConnection>, ApiError>
{
    pool.get()
        .await
        .map_err(|e| ApiError::internal(format!("database pool error: {e}")))
}

// ── Tag listing ──

#[derive(serde::Deserialize)]
pub struct TagsQuery {
    pub repo: Option<String>,
}

/// Tags enriched with commit details for the first 20 entries.
const ENRICH_LIMIT: usize = 20;
const MESSAGE_PREVIEW_CHARS: usize = 100;

async fn list_github_tags(
    State(state): State<AppState>,
    Query(query): Query<TagsQuery>,
) -> Result<Json<TagsResponse>, ApiError> {
    let repo = query
        .repo
        .unwrap_or_else(|| state.config.github_default_repo.clone());
    let client = GithubClient::new(state.config.github_token_opt());

    let mut tags = client.list_tags(&repo).await?;

    for tag in tags.iter_mut().take(ENRICH_LIMIT) {
        match client.get_commit(&repo, &tag.commit.sha).await {
            Ok(details) => {
                tag.commit.date = Some(details.date);
                tag.commit.author = Some(details.author);
                tag.commit.message =
                    Some(details.message.chars().take(MESSAGE_PREVIEW_CHARS).collect());
            }
            Err(e) => {
                tracing::warn!(repo = %repo, tag = %tag.name, "Failed to get commit details: {e}");
            }
        }
    }

    Ok(Json(TagsResponse { tags }))
}

// ── Build records ──

async fn create_image_build(
    State(state): State<AppState>,
    Json(req): Json<ImageBuildRequest>,
) -> Result<(StatusCode, Json<ImageJson>), ApiError> {
    let mut conn = get_conn(&state.pool).await?;

    if let Some(existing) = image_service::find_by_name_tag(&mut conn, &req.image_name, &req.tag)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
    {
        return Err(ApiError::conflict(format!(
            "Image {}:{} already exists with ID {}",
            req.image_name, req.tag, existing.id
        )));
    }

    let new_image = NewDockerImage {
        name: req.image_name.clone(),
        tag: req.tag.clone(),
        github_repo: req.repo,
        github_ref: format!("refs/tags/{}", req.tag),
        commit_sha: req.commit_sha,
        build_status: BuildStatus::Pending.as_str().to_string(),
    };

    let image = match image_service::create_image(&mut conn, new_image).await {
        Ok(image) => image,
        // Concurrent POSTs can both pass the pre-check; the unique
        // constraint settles the race.
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(ApiError::conflict(format!(
                "Image {}:{} already exists",
                req.image_name, req.tag
            )));
        }
        Err(e) => return Err(ApiError::internal(e.to_string())),
    };

    executor::spawn_build(
        state.pool.clone(),
        state.config.clone(),
        state.build_limiter.clone(),
        image.clone(),
        req.dockerfile_path,
    );

    Ok((StatusCode::CREATED, Json(image.into())))
}

#[derive(serde::Deserialize)]
pub struct ListImagesQuery {
    pub status_filter: Option<String>,
}

async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ListImagesQuery>,
) -> Result<Json<Vec<ImageJson>>, ApiError> {
    let status = match query.status_filter.as_deref() {
        Some(raw) => Some(
            raw.parse::<BuildStatus>()
                .map_err(|e| ApiError::bad_request(format!("invalid status filter: {e}")))?,
        ),
        None => None,
    };

    let mut conn = get_conn(&state.pool).await?;
    let images = image_service::list_images(&mut conn, status)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(images.into_iter().map(ImageJson::from).collect()))
}

async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
) -> Result<Json<ImageJson>, ApiError> {
    let mut conn = get_conn(&state.pool).await?;
    let image = image_service::get_image(&mut conn, image_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("Image {image_id} not found")))?;

    Ok(Json(image.into()))
}

async fn inspect_image(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
) -> Result<Json<ImageInspectJson>, ApiError> {
    let mut conn = get_conn(&state.pool).await?;
    let image = image_service::get_image(&mut conn, image_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("Image {image_id} not found")))?;

    if image.build_status != BuildStatus::Success.as_str() {
        return Err(ApiError::bad_request(format!(
            "Image build status is '{}', must be 'success' to inspect",
            image.build_status
        )));
    }

    let image_ref = image.image_ref();
    let inspection = image_builder::inspect_image(&state.config.docker_bin, &image_ref)
        .await
        .map_err(|e| match e {
            InspectError::NotFound(_) => ApiError::not_found(format!(
                "Docker image '{image_ref}' not found on host. The image may have been removed."
            )),
            other => ApiError::internal(format!("Failed to inspect image: {other}")),
        })?;

    let env_metadata = images::parse_env_metadata(&inspection.labels);

    Ok(Json(ImageInspectJson {
        image_name: image_ref,
        env_vars: inspection.env_vars,
        env_metadata,
        labels: inspection.labels,
        created: inspection.created,
    }))
}

async fn delete_image(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let mut conn = get_conn(&state.pool).await?;
    let deleted = image_service::delete_image(&mut conn, image_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if !deleted {
        return Err(ApiError::not_found(format!("Image {image_id} not found")));
    }

    // Record only; any built artifact stays in the Docker daemon.
    tracing::info!(image_id, "Deleted image build record");
    Ok(StatusCode::NO_CONTENT)
}
