//! Orchestrator services — GitHub access, image building, build records.

pub mod executor;
pub mod github;
pub mod image_builder;
pub mod image_service;
