//! Orchestrator data models.

pub mod image;
