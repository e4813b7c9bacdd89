//! Core data models for the media post pipeline.
//!
//! These entities represent the durable post record and the value produced by
//! the label/moderation analysis. They map to the database via a row type and
//! serialize naturally as JSON via `serde`.

pub mod analysis;
pub mod post;
