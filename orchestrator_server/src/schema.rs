//! Diesel table definitions for the orchestrator.
//!
//! One table: docker_images — one row per image build attempt.

diesel::table! {
    docker_images (id) {
        id -> Int8,
        name -> Varchar,
        tag -> Varchar,
        github_repo -> Varchar,
        github_ref -> Varchar,
        commit_sha -> Varchar,
        build_status -> Varchar,
        build_log -> Nullable<Text>,
        build_error -> Nullable<Text>,
        built_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}
