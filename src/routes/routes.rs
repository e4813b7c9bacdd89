//! Defines routes for the post pipeline and its supporting surfaces.
//!
//! ## Structure
//! - **Post endpoints**
//!   - `POST   /posts` — create a post from a multipart upload
//!   - `GET    /posts` — cursor-paginated feed, newest first
//!   - `GET    /posts/{id}` — single post with variant URL map
//!   - `POST   /posts/{id}/analyze` — re-run content analysis
//!   - `DELETE /posts/{id}` — remove the post and its stored objects
//!
//! - **Event intake**
//!   - `POST   /events/object-created` — storage-change notification feed
//!
//! - **Media delivery**
//!   - `GET    /media/{*key}` — stream a stored object
//!
//! The wildcard `*key` allows nested keys like `posts/{user}/{post}/thumb.jpg`.

use crate::{
    handlers::{
        event_handlers::object_created,
        health_handlers::{healthz, readyz},
        media_handlers::get_media,
        post_handlers::{create_post, delete_post, get_feed, get_post, reanalyze_post},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the application router.
///
/// The router carries shared state (`AppState`) to all handlers. The body
/// limit applies to the multipart upload route and everything else alike.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // post endpoints
        .route("/posts", post(create_post).get(get_feed))
        .route("/posts/{id}", get(get_post).delete(delete_post))
        .route("/posts/{id}/analyze", post(reanalyze_post))
        // event intake
        .route("/events/object-created", post(object_created))
        // media delivery
        .route("/media/{*key}", get(get_media))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
