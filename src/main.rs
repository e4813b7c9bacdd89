use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod keys;
mod models;
mod routes;
mod services;
mod state;

use services::{
    object_store::FsObjectStore,
    post_service::PostService,
    transform::TransformWorker,
    vision::{HttpVisionBackend, VisionService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting picfeed with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // Touch the database file before SQLx connects; a clearer error than
    // the pool's "unable to open database file".
    if let Err(e) = fs::OpenOptions::new().create(true).append(true).open(db_path) {
        tracing::warn!("Failed to open database file {}: {}", db_path, e);
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        db::apply_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize services ---
    let store = FsObjectStore::new(cfg.storage_dir.clone());
    let vision_timeout = Duration::from_millis(cfg.vision_timeout_ms);
    let vision = match cfg.vision_endpoint.as_deref() {
        Some(endpoint) => {
            tracing::info!("Vision analysis enabled via {}", endpoint);
            VisionService::new(
                Arc::new(HttpVisionBackend::new(
                    endpoint,
                    cfg.vision_api_key.clone(),
                    vision_timeout,
                )),
                vision_timeout,
            )
        }
        None => {
            tracing::warn!("No vision endpoint configured; analysis will degrade");
            VisionService::disabled()
        }
    };
    let posts = PostService::new(
        db.clone(),
        store.clone(),
        vision,
        cfg.allowed_mime.clone(),
    );
    let worker = TransformWorker::new(store.clone());

    let app_state = state::AppState {
        posts,
        worker,
        store,
        db,
        public_base_url: cfg.public_base_url.clone(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes()).with_state(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
