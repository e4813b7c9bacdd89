//! Service layer: the orchestrator and its collaborators.
//!
//! `post_service` coordinates everything at creation time; `transform` is the
//! decoupled worker driven by storage-change events. They share only the key
//! scheme and the object store.

pub mod imaging;
pub mod object_store;
pub mod post_service;
pub mod transform;
pub mod vision;
