//! The durable post record and its embedded media value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a post. Everything the creation path persists is
/// already `Ready`; `Processing` exists for externally managed backfills.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Processing,
    Ready,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Processing => "processing",
            PostStatus::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(PostStatus::Processing),
            "ready" => Some(PostStatus::Ready),
            _ => None,
        }
    }
}

/// Aggregate counters, initialized to zero at creation. Mutated only by the
/// external social collaborators, never by this pipeline.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct Counts {
    pub likes: i64,
    pub comments: i64,
}

/// Embedded media value. Every key in here is derivable purely from
/// (owner id, post id, role); the variant map starts empty and is only a
/// bookkeeping mirror — variant presence is always an object-store question.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Media {
    pub key_original: String,
    pub key_thumb: String,
    /// Cosmetic preference chosen by the uploader; `original` or `t1`..`t10`.
    pub selected_filter: String,
    /// Variant tag → key, populated lazily. Absent means "not yet produced".
    pub variants: BTreeMap<String, String>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// One published piece of media content.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub caption: String,
    pub status: PostStatus,
    pub counts: Counts,
    pub media: Media,
    pub labels: Vec<String>,
    pub nsfw: bool,
    pub face_count: u32,
    pub vision_raw: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Raw database row; JSON columns stay as text until [`PostRow::into_post`].
#[derive(FromRow, Debug)]
pub struct PostRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub caption: String,
    pub status: String,
    pub likes: i64,
    pub comments: i64,
    pub key_original: String,
    pub key_thumb: String,
    pub selected_filter: String,
    pub variants: String,
    pub mime: String,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub labels: String,
    pub nsfw: bool,
    pub face_count: i64,
    pub vision_raw: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PostRow {
    /// Decode the JSON columns into the domain value.
    pub fn into_post(self) -> Result<Post, serde_json::Error> {
        let variants: BTreeMap<String, String> = serde_json::from_str(&self.variants)?;
        let labels: Vec<String> = serde_json::from_str(&self.labels)?;
        let vision_raw = match self.vision_raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(Post {
            id: self.id,
            user_id: self.user_id,
            caption: self.caption,
            status: PostStatus::parse(&self.status).unwrap_or(PostStatus::Ready),
            counts: Counts {
                likes: self.likes,
                comments: self.comments,
            },
            media: Media {
                key_original: self.key_original,
                key_thumb: self.key_thumb,
                selected_filter: self.selected_filter,
                variants,
                mime: self.mime,
                width: self.width.max(0) as u32,
                height: self.height.max(0) as u32,
                size_bytes: self.size_bytes.max(0) as u64,
            },
            labels,
            nsfw: self.nsfw,
            face_count: self.face_count.max(0) as u32,
            vision_raw,
            created_at: self.created_at,
        })
    }
}

/// Resolve an object key to a public URL: configured CDN base when present,
/// otherwise this service's own `/media/{key}` route.
pub fn public_url(base: Option<&str>, key: &str) -> String {
    match base {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => format!("/media/{}", key),
    }
}

/// Media portion of the API view, with keys resolved to URLs.
#[derive(Serialize, Debug)]
pub struct MediaView {
    pub original: String,
    pub thumb: String,
    pub selected_filter: String,
    /// URL of the chosen variant when a non-original filter was requested.
    /// May 404 until the transform worker catches up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, String>>,
    pub width: u32,
    pub height: u32,
    pub mime: String,
}

/// What API callers see for one post.
#[derive(Serialize, Debug)]
pub struct PostView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub caption: String,
    pub created_at: DateTime<Utc>,
    pub counts: Counts,
    pub status: PostStatus,
    pub labels: Vec<String>,
    pub nsfw: bool,
    pub face_count: u32,
    pub media: MediaView,
}

impl PostView {
    /// Serialize a post for the API. `include_variants` gates the full
    /// tag → URL map (detail view); the chosen variant URL is always exposed
    /// when the uploader picked one.
    pub fn from_post(post: &Post, url_base: Option<&str>, include_variants: bool) -> Self {
        let selected = post
            .media
            .variants
            .get(&post.media.selected_filter)
            .map(|key| public_url(url_base, key));
        let variants = include_variants.then(|| {
            post.media
                .variants
                .iter()
                .map(|(tag, key)| (tag.clone(), public_url(url_base, key)))
                .collect()
        });
        Self {
            id: post.id,
            user_id: post.user_id,
            caption: post.caption.clone(),
            created_at: post.created_at,
            counts: post.counts,
            status: post.status,
            labels: post.labels.clone(),
            nsfw: post.nsfw,
            face_count: post.face_count,
            media: MediaView {
                original: public_url(url_base, &post.media.key_original),
                thumb: public_url(url_base, &post.media.key_thumb),
                selected_filter: post.media.selected_filter.clone(),
                selected,
                variants,
                width: post.media.width,
                height: post.media.height,
                mime: post.media.mime.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_prefers_configured_base() {
        assert_eq!(
            public_url(Some("https://cdn.example.com/"), "posts/a/b/thumb.jpg"),
            "https://cdn.example.com/posts/a/b/thumb.jpg"
        );
        assert_eq!(
            public_url(None, "posts/a/b/thumb.jpg"),
            "/media/posts/a/b/thumb.jpg"
        );
    }

    #[test]
    fn row_decodes_json_columns() {
        let row = PostRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            caption: "hello".into(),
            status: "ready".into(),
            likes: 0,
            comments: 0,
            key_original: "posts/a/b/original.jpeg".into(),
            key_thumb: "posts/a/b/thumb.jpg".into(),
            selected_filter: "t2".into(),
            variants: r#"{"t2":"posts/a/b/t2.jpg"}"#.into(),
            mime: "image/jpeg".into(),
            width: 100,
            height: 80,
            size_bytes: 1234,
            labels: r#"["Dog","Pet"]"#.into(),
            nsfw: false,
            face_count: 0,
            vision_raw: None,
            created_at: Utc::now(),
        };
        let post = row.into_post().expect("row should decode");
        assert_eq!(post.labels, vec!["Dog", "Pet"]);
        assert_eq!(
            post.media.variants.get("t2").map(String::as_str),
            Some("posts/a/b/t2.jpg")
        );

        let view = PostView::from_post(&post, None, false);
        assert_eq!(view.media.selected.as_deref(), Some("/media/posts/a/b/t2.jpg"));
        assert!(view.media.variants.is_none());
    }
}
