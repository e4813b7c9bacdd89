//! Shared application state handed to every handler.

use crate::services::object_store::FsObjectStore;
use crate::services::post_service::PostService;
use crate::services::transform::TransformWorker;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub posts: PostService,
    pub worker: TransformWorker,
    pub store: FsObjectStore,
    pub db: Arc<SqlitePool>,
    /// Base for public media URLs; `None` means serve via `/media/{key}`.
    pub public_base_url: Option<String>,
}
