//! HTTP handlers, grouped by surface area.

pub mod event_handlers;
pub mod health_handlers;
pub mod media_handlers;
pub mod post_handlers;
