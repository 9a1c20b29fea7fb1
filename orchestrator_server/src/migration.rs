//! Startup migration for the orchestrator tables.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

/// SQL migration for the image build pipeline.
///
/// `UNIQUE (name, tag)` backs the duplicate-build conflict check: a second
/// build request for the same image coordinates is rejected with 409.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS docker_images (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL,
    tag             VARCHAR(100) NOT NULL,
    github_repo     VARCHAR(255) NOT NULL,
    github_ref      VARCHAR(255) NOT NULL,
    commit_sha      VARCHAR(40) NOT NULL,
    build_status    VARCHAR(50) NOT NULL DEFAULT 'pending',
    build_log       TEXT,
    build_error     TEXT,
    built_at        TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (name, tag)
);

CREATE INDEX IF NOT EXISTS idx_docker_images_name ON docker_images (name);
CREATE INDEX IF NOT EXISTS idx_docker_images_status ON docker_images (build_status);
CREATE INDEX IF NOT EXISTS idx_docker_images_created ON docker_images (created_at DESC);
"#;

/// Run the orchestrator migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("orchestrator migration failed: {e}"))?;
    Ok(())
}
