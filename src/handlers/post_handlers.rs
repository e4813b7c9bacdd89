//! HTTP handlers for post creation, reads, re-analysis, and deletion.
//!
//! Identity arrives in the `x-user-id` header, set by the upstream
//! authentication layer; this service never verifies credentials itself.

use crate::{
    errors::AppError,
    keys::VariantTag,
    models::post::PostView,
    services::post_service::NewPost,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Pull the authenticated owner id out of the request headers.
fn owner_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))?;
    Uuid::parse_str(raw)
        .map_err(|_| AppError::new(StatusCode::UNAUTHORIZED, "malformed x-user-id header"))
}

/// `POST /posts` — multipart: `file` (required), `caption`, `filter`.
pub async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let owner = owner_id(&headers)?;

    let mut file: Option<(bytes::Bytes, String)> = None;
    let mut caption = String::new();
    let mut selected_filter: Option<VariantTag> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file part is missing a content type"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed reading file part: {e}")))?;
                file = Some((data, content_type));
            }
            "caption" => {
                caption = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed reading caption: {e}")))?;
            }
            "filter" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed reading filter: {e}")))?;
                selected_filter = match raw.as_str() {
                    "" | "original" => None,
                    tag => Some(tag.parse::<VariantTag>().map_err(|_| {
                        AppError::bad_request(format!("unknown filter `{tag}`"))
                    })?),
                };
            }
            _ => {}
        }
    }

    let (bytes, declared_mime) =
        file.ok_or_else(|| AppError::bad_request("missing `file` part"))?;

    let new = NewPost {
        bytes,
        declared_mime,
        caption,
        selected_filter,
    };

    // Detach the orchestration from the connection: a client disconnect must
    // not cancel in-flight uploads mid-creation.
    let service = state.posts.clone();
    let post = tokio::spawn(async move { service.create_post(owner, new).await })
        .await
        .map_err(|e| AppError::internal(format!("creation task panicked: {e}")))??;

    let view = PostView::from_post(&post, state.public_base_url.as_deref(), false);
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<usize>,
    pub cursor: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

/// `GET /posts` — cursor-paginated feed, newest first. The cursor is the
/// `(cursor, cursor_id)` pair echoed back from the previous page.
pub async fn get_feed(
    State(state): State<AppState>,
    Query(q): Query<FeedQuery>,
) -> Result<impl IntoResponse, AppError> {
    let cursor = match (q.cursor, q.cursor_id) {
        (Some(created_at), Some(id)) => Some((created_at, id)),
        (None, None) => None,
        _ => {
            return Err(AppError::bad_request(
                "cursor and cursor_id must be supplied together",
            ));
        }
    };
    let posts = state.posts.feed(q.limit.unwrap_or(10), cursor).await?;
    let next_cursor = posts.last().map(|p| p.created_at);
    let next_cursor_id = posts.last().map(|p| p.id);
    let views: Vec<PostView> = posts
        .iter()
        .map(|p| PostView::from_post(p, state.public_base_url.as_deref(), false))
        .collect();
    Ok(Json(json!({
        "posts": views,
        "next_cursor": next_cursor,
        "next_cursor_id": next_cursor_id,
    })))
}

/// `GET /posts/{id}` — detail view, includes the full variant URL map.
pub async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let post = state.posts.get_post(id).await?;
    let view = PostView::from_post(&post, state.public_base_url.as_deref(), true);
    Ok(Json(view))
}

/// `POST /posts/{id}/analyze` — re-run the label/moderation analysis.
pub async fn reanalyze_post(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let owner = owner_id(&headers)?;
    let result = state.posts.reanalyze(owner, id).await?;
    Ok(Json(json!({
        "labels": result.label_names(),
        "nsfw": result.nsfw,
        "face_count": result.face_count,
    })))
}

/// `DELETE /posts/{id}` — idempotent removal of the record and its objects.
pub async fn delete_post(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let owner = owner_id(&headers)?;
    state.posts.delete_post(owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
