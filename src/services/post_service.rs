//! src/services/post_service.rs
//!
//! PostService — the post creation orchestrator. Allocates identity before
//! any byte is persisted, computes every dependent key up front, runs the
//! synchronous derivation (metadata + thumbnail), uploads the two mandatory
//! assets with join semantics, folds in best-effort analysis, and only then
//! commits the record. A post row never exists without its original and
//! thumbnail objects already durable.

use crate::keys::{AssetRole, VariantTag, post_key};
use crate::models::analysis::AnalysisResult;
use crate::models::post::{Counts, Media, Post, PostRow, PostStatus};
use crate::services::imaging::{self, ImagingError};
use crate::services::object_store::{FsObjectStore, StoreError};
use crate::services::vision::{AnalysisOutcome, VisionService};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PostError {
    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("storage write failed: {0}")]
    StorageWriteFailed(#[source] StoreError),
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("post `{0}` not found")]
    NotFound(Uuid),
    #[error("post belongs to another user")]
    Forbidden,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PostResult<T> = Result<T, PostError>;

/// One inbound creation request, already pulled out of the multipart body.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub bytes: Bytes,
    pub declared_mime: String,
    pub caption: String,
    /// Cosmetic preference; `None` means "original".
    pub selected_filter: Option<VariantTag>,
}

const POST_COLUMNS: &str = "id, user_id, caption, status, likes, comments, key_original, \
     key_thumb, selected_filter, variants, mime, width, height, size_bytes, labels, nsfw, \
     face_count, vision_raw, created_at";

#[derive(Clone)]
pub struct PostService {
    db: Arc<SqlitePool>,
    store: FsObjectStore,
    vision: VisionService,
    allowed_mime: Vec<String>,
}

impl PostService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: FsObjectStore,
        vision: VisionService,
        allowed_mime: Vec<String>,
    ) -> Self {
        Self {
            db,
            store,
            vision,
            allowed_mime,
        }
    }

    /// Turn one uploaded buffer into a durably-visible post.
    pub async fn create_post(&self, owner_id: Uuid, new: NewPost) -> PostResult<Post> {
        let mime = new.declared_mime.to_ascii_lowercase();
        if !self.allowed_mime.iter().any(|m| m == &mime) {
            return Err(PostError::UnsupportedMediaType(mime));
        }

        if mime.starts_with("video/") {
            return self.create_video_post(owner_id, new, mime).await;
        }
        self.create_image_post(owner_id, new).await
    }

    /// Reduced path for video payloads: no decoding, no thumbnail, no
    /// analysis. The original key doubles as the thumbnail reference.
    async fn create_video_post(
        &self,
        owner_id: Uuid,
        new: NewPost,
        mime: String,
    ) -> PostResult<Post> {
        // Identity first, so the key is computable before any network call.
        let post_id = Uuid::new_v4();
        let ext = mime.split('/').nth(1).unwrap_or("mp4").to_string();
        let key_original = post_key(owner_id, post_id, &AssetRole::Original { ext });

        let size_bytes = new.bytes.len() as u64;
        self.store
            .put(&key_original, &new.bytes)
            .await
            .map_err(PostError::StorageWriteFailed)?;

        let post = Post {
            id: post_id,
            user_id: owner_id,
            caption: new.caption.trim().to_string(),
            status: PostStatus::Ready,
            counts: Counts::default(),
            media: Media {
                key_thumb: key_original.clone(),
                key_original,
                selected_filter: "original".to_string(),
                variants: BTreeMap::new(),
                mime,
                width: 0,
                height: 0,
                size_bytes,
            },
            labels: Vec::new(),
            nsfw: false,
            face_count: 0,
            vision_raw: None,
            created_at: Utc::now(),
        };
        self.insert(&post).await?;
        info!(post_id = %post.id, "created video post");
        Ok(post)
    }

    async fn create_image_post(&self, owner_id: Uuid, new: NewPost) -> PostResult<Post> {
        // 1) Allocate identity before any network call.
        let post_id = Uuid::new_v4();

        // 2) Metadata + thumbnail from the buffer header; a decode failure
        //    aborts before anything is written.
        let bytes = new.bytes.clone();
        let derived = tokio::task::spawn_blocking(move || {
            let (image, meta) = imaging::decode(&bytes)?;
            let thumb = imaging::make_thumb(&image)?;
            Ok::<_, ImagingError>((meta, thumb))
        })
        .await
        .map_err(|e| PostError::Internal(format!("derivation task panicked: {e}")))?;
        let (meta, thumb) = derived.map_err(|err| match err {
            ImagingError::Unreadable(msg) => PostError::UnreadableImage(msg),
            ImagingError::Encode(msg) => PostError::Internal(msg),
        })?;

        // 3) Keys for the mandatory assets, plus the chosen variant's key.
        //    Only the thumbnail is produced synchronously; the variant bytes
        //    arrive later through the transform worker under this same key.
        let key_original = post_key(
            owner_id,
            post_id,
            &AssetRole::Original {
                ext: meta.ext.clone(),
            },
        );
        let key_thumb = post_key(owner_id, post_id, &AssetRole::Thumb);
        let mut variants = BTreeMap::new();
        if let Some(tag) = new.selected_filter {
            variants.insert(
                tag.as_str().to_string(),
                post_key(owner_id, post_id, &AssetRole::Variant(tag)),
            );
        }

        // 4) Mandatory uploads, concurrently; first failure aborts the whole
        //    creation so the record can never reference a missing asset.
        tokio::try_join!(
            self.store.put(&key_original, &new.bytes),
            self.store.put(&key_thumb, &thumb),
        )
        .map_err(PostError::StorageWriteFailed)?;

        // 5) Best-effort analysis against the now-durable original.
        let analysis = match self.vision.analyze_best_effort(&key_original).await {
            AnalysisOutcome::Ok(result) => result,
            AnalysisOutcome::Degraded(reason) => {
                warn!(post_id = %post_id, reason, "creating post with empty analysis");
                AnalysisResult::empty()
            }
        };

        // 6) Commit: the single durability boundary.
        let post = Post {
            id: post_id,
            user_id: owner_id,
            caption: new.caption.trim().to_string(),
            status: PostStatus::Ready,
            counts: Counts::default(),
            media: Media {
                key_original,
                key_thumb,
                selected_filter: new
                    .selected_filter
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_else(|| "original".to_string()),
                variants,
                mime: meta.mime,
                width: meta.width,
                height: meta.height,
                size_bytes: new.bytes.len() as u64,
            },
            labels: analysis.label_names(),
            nsfw: analysis.nsfw,
            face_count: analysis.face_count,
            vision_raw: (!analysis.raw.is_null()).then(|| analysis.raw.clone()),
            created_at: Utc::now(),
        };
        self.insert(&post).await?;
        info!(post_id = %post.id, labels = post.labels.len(), "created image post");
        Ok(post)
    }

    /// Re-run the analysis against the stored original and overwrite the
    /// analysis fields. Idempotent; a failure leaves prior values untouched.
    pub async fn reanalyze(&self, owner_id: Uuid, post_id: Uuid) -> PostResult<AnalysisResult> {
        let post = self.get_post(post_id).await?;
        if post.user_id != owner_id {
            return Err(PostError::Forbidden);
        }

        if !self.store.exists(&post.media.key_original).await? {
            return Err(PostError::AnalysisFailed(format!(
                "original object `{}` is missing",
                post.media.key_original
            )));
        }

        let result = self
            .vision
            .analyze(&post.media.key_original)
            .await
            .map_err(|e| PostError::AnalysisFailed(e.to_string()))?;

        sqlx::query("UPDATE posts SET labels = ?, nsfw = ?, face_count = ?, vision_raw = ? WHERE id = ?")
            .bind(serde_json::to_string(&result.label_names())?)
            .bind(result.nsfw)
            .bind(result.face_count as i64)
            .bind(Some(serde_json::to_string(&result.raw)?))
            .bind(post_id)
            .execute(&*self.db)
            .await?;

        Ok(result)
    }

    pub async fn get_post(&self, post_id: Uuid) -> PostResult<Post> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id = ?"
        ))
        .bind(post_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => PostError::NotFound(post_id),
            other => PostError::Sqlx(other),
        })?;
        Ok(row.into_post()?)
    }

    /// Cursor feed: newest first. The cursor is the `(created_at, id)` pair
    /// of the last item seen; the id breaks timestamp ties so rows sharing a
    /// `created_at` are never skipped across page boundaries.
    pub async fn feed(
        &self,
        limit: usize,
        cursor: Option<(DateTime<Utc>, Uuid)>,
    ) -> PostResult<Vec<Post>> {
        let limit = limit.clamp(1, 50) as i64;
        let rows = match cursor {
            Some((created_at, id)) => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "SELECT {POST_COLUMNS} FROM posts \
                     WHERE created_at < ?1 OR (created_at = ?1 AND id < ?2) \
                     ORDER BY created_at DESC, id DESC LIMIT ?3"
                ))
                .bind(created_at)
                .bind(id)
                .bind(limit)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "SELECT {POST_COLUMNS} FROM posts \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&*self.db)
                .await?
            }
        };
        rows.into_iter()
            .map(|r| r.into_post().map_err(PostError::from))
            .collect()
    }

    /// Remove the record and every derivable object. Idempotent end to end:
    /// a missing record is a no-op and variants that never materialized do
    /// not fail the object sweep.
    pub async fn delete_post(&self, owner_id: Uuid, post_id: Uuid) -> PostResult<()> {
        let post = match self.get_post(post_id).await {
            Ok(post) => post,
            Err(PostError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if post.user_id != owner_id {
            return Err(PostError::Forbidden);
        }

        sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&*self.db)
            .await?;

        self.store.delete(&post.media.key_original).await?;
        self.store.delete(&post.media.key_thumb).await?;
        for tag in VariantTag::ALL {
            let key = post_key(owner_id, post_id, &AssetRole::Variant(tag));
            self.store.delete(&key).await?;
        }
        info!(%post_id, "deleted post and objects");
        Ok(())
    }

    async fn insert(&self, post: &Post) -> PostResult<()> {
        sqlx::query(&format!(
            "INSERT INTO posts ({POST_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(post.id)
        .bind(post.user_id)
        .bind(&post.caption)
        .bind(post.status.as_str())
        .bind(post.counts.likes)
        .bind(post.counts.comments)
        .bind(&post.media.key_original)
        .bind(&post.media.key_thumb)
        .bind(&post.media.selected_filter)
        .bind(serde_json::to_string(&post.media.variants)?)
        .bind(&post.media.mime)
        .bind(post.media.width as i64)
        .bind(post.media.height as i64)
        .bind(post.media.size_bytes as i64)
        .bind(serde_json::to_string(&post.labels)?)
        .bind(post.nsfw)
        .bind(post.face_count as i64)
        .bind(match &post.vision_raw {
            Some(raw) => Some(serde_json::to_string(raw)?),
            None => None,
        })
        .bind(post.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::analysis::Label;
    use crate::services::vision::test_support::MockBackend;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 40])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encode");
        Bytes::from(buf)
    }

    fn allowed() -> Vec<String> {
        vec![
            "image/jpeg".into(),
            "image/png".into(),
            "image/webp".into(),
            "video/mp4".into(),
        ]
    }

    async fn service_with(backend: MockBackend) -> (tempfile::TempDir, PostService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        let pool = Arc::new(db::test_pool().await);
        let vision = VisionService::new(Arc::new(backend), Duration::from_secs(5));
        let svc = PostService::new(pool, store, vision, allowed());
        (dir, svc)
    }

    fn image_upload(caption: &str) -> NewPost {
        NewPost {
            bytes: png_bytes(100, 100),
            declared_mime: "image/png".into(),
            caption: caption.into(),
            selected_filter: None,
        }
    }

    async fn count_posts(svc: &PostService) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts")
            .fetch_one(&*svc.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_persists_record_and_mandatory_objects() {
        let backend = MockBackend::with_labels(vec![Label::new("Dog", 96.0)]);
        let (_dir, svc) = service_with(backend).await;
        let owner = Uuid::new_v4();

        let post = svc.create_post(owner, image_upload("hello")).await.unwrap();

        assert_eq!(post.status, PostStatus::Ready);
        assert_eq!(post.caption, "hello");
        assert_eq!(post.counts.likes, 0);
        assert_eq!(post.counts.comments, 0);
        assert_eq!(post.media.mime, "image/png");
        assert_eq!((post.media.width, post.media.height), (100, 100));
        assert!(post.media.variants.is_empty());
        assert_eq!(post.labels, vec!["Dog"]);

        assert!(svc.store.exists(&post.media.key_original).await.unwrap());
        assert!(svc.store.exists(&post.media.key_thumb).await.unwrap());

        let fetched = svc.get_post(post.id).await.unwrap();
        assert_eq!(fetched.media.key_original, post.media.key_original);
    }

    #[tokio::test]
    async fn unreadable_payload_creates_nothing() {
        let (dir, svc) = service_with(MockBackend::failing()).await;
        let owner = Uuid::new_v4();

        let result = svc
            .create_post(
                owner,
                NewPost {
                    bytes: Bytes::from_static(b"not an image at all"),
                    declared_mime: "image/jpeg".into(),
                    caption: String::new(),
                    selected_filter: None,
                },
            )
            .await;

        assert!(matches!(result, Err(PostError::UnreadableImage(_))));
        assert_eq!(count_posts(&svc).await, 0);
        // Nothing was written before the decode failed.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn disallowed_mime_is_rejected_before_any_work() {
        let (_dir, svc) = service_with(MockBackend::failing()).await;
        let mut upload = image_upload("");
        upload.declared_mime = "image/tiff".into();

        let result = svc.create_post(Uuid::new_v4(), upload).await;
        assert!(matches!(result, Err(PostError::UnsupportedMediaType(_))));
        assert_eq!(count_posts(&svc).await, 0);
    }

    #[tokio::test]
    async fn analysis_failure_degrades_to_empty_fields() {
        let (_dir, svc) = service_with(MockBackend::failing()).await;

        let post = svc
            .create_post(Uuid::new_v4(), image_upload("still works"))
            .await
            .unwrap();

        assert!(post.labels.is_empty());
        assert!(!post.nsfw);
        assert_eq!(post.face_count, 0);
        assert!(post.vision_raw.is_none());
        assert_eq!(post.status, PostStatus::Ready);
    }

    #[tokio::test]
    async fn video_takes_the_reduced_path() {
        let (_dir, svc) = service_with(MockBackend::failing()).await;
        let owner = Uuid::new_v4();

        let post = svc
            .create_post(
                owner,
                NewPost {
                    bytes: Bytes::from_static(b"fake mp4 payload"),
                    declared_mime: "video/mp4".into(),
                    caption: "clip".into(),
                    selected_filter: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(post.media.key_thumb, post.media.key_original);
        assert!(post.media.key_original.ends_with("original.mp4"));
        assert!(post.media.variants.is_empty());
        assert!(post.labels.is_empty());
        assert!(svc.store.exists(&post.media.key_original).await.unwrap());
    }

    #[tokio::test]
    async fn selected_filter_key_is_precomputed_but_not_materialized() {
        let (_dir, svc) = service_with(MockBackend::with_labels(Vec::new())).await;
        let owner = Uuid::new_v4();
        let mut upload = image_upload("");
        upload.selected_filter = Some(VariantTag::T2);

        let post = svc.create_post(owner, upload).await.unwrap();

        let expected = post_key(owner, post.id, &AssetRole::Variant(VariantTag::T2));
        assert_eq!(post.media.selected_filter, "t2");
        assert_eq!(post.media.variants.get("t2"), Some(&expected));
        // The key exists in the record, the bytes do not exist yet.
        assert!(!svc.store.exists(&expected).await.unwrap());
    }

    #[tokio::test]
    async fn reanalyze_with_missing_original_keeps_prior_fields() {
        let backend = MockBackend::with_labels(vec![Label::new("Cat", 91.0)]);
        let (_dir, svc) = service_with(backend).await;
        let owner = Uuid::new_v4();
        let post = svc.create_post(owner, image_upload("")).await.unwrap();

        // Simulate external removal of the original object.
        svc.store.delete(&post.media.key_original).await.unwrap();

        let result = svc.reanalyze(owner, post.id).await;
        assert!(matches!(result, Err(PostError::AnalysisFailed(_))));

        let unchanged = svc.get_post(post.id).await.unwrap();
        assert_eq!(unchanged.labels, vec!["Cat"]);
    }

    #[tokio::test]
    async fn reanalyze_overwrites_analysis_fields() {
        let (_dir, svc) = service_with(MockBackend::failing()).await;
        let owner = Uuid::new_v4();
        let post = svc.create_post(owner, image_upload("")).await.unwrap();
        assert!(post.labels.is_empty());

        // The analysis service recovered; rebuild the service around it.
        let recovered = VisionService::new(
            Arc::new(MockBackend::with_labels(vec![Label::new("Beach", 89.0)])),
            Duration::from_secs(5),
        );
        let svc = PostService::new(svc.db.clone(), svc.store.clone(), recovered, allowed());

        let result = svc.reanalyze(owner, post.id).await.unwrap();
        assert_eq!(result.labels.len(), 1);

        let refreshed = svc.get_post(post.id).await.unwrap();
        assert_eq!(refreshed.labels, vec!["Beach"]);
        assert!(refreshed.vision_raw.is_some());
    }

    #[tokio::test]
    async fn reanalyze_enforces_ownership() {
        let (_dir, svc) = service_with(MockBackend::with_labels(Vec::new())).await;
        let post = svc
            .create_post(Uuid::new_v4(), image_upload(""))
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            svc.reanalyze(stranger, post.id).await,
            Err(PostError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn feed_pages_newest_first() {
        let (_dir, svc) = service_with(MockBackend::with_labels(Vec::new())).await;
        let owner = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..3 {
            let post = svc
                .create_post(owner, image_upload(&format!("post {i}")))
                .await
                .unwrap();
            ids.push(post.id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let page = svc.feed(2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[1]);

        let older = svc
            .feed(2, Some((page[1].created_at, page[1].id)))
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, ids[0]);
    }

    #[tokio::test]
    async fn feed_does_not_skip_posts_sharing_a_timestamp() {
        let (_dir, svc) = service_with(MockBackend::with_labels(Vec::new())).await;
        let owner = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let post = svc.create_post(owner, image_upload("")).await.unwrap();
            ids.push(post.id);
        }

        // Collapse all rows onto one timestamp, as a burst of uploads can.
        let shared = Utc::now();
        sqlx::query("UPDATE posts SET created_at = ?")
            .bind(shared)
            .execute(&*svc.db)
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = svc.feed(2, cursor).await.unwrap();
            if page.is_empty() {
                break;
            }
            let last = page.last().unwrap();
            cursor = Some((last.created_at, last.id));
            seen.extend(page.into_iter().map(|p| p.id));
        }

        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn failed_mandatory_upload_leaves_no_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the store root should be makes every write
        // fail at directory creation.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"occupied").unwrap();

        let store = FsObjectStore::new(&blocked);
        let pool = Arc::new(db::test_pool().await);
        let vision = VisionService::new(
            Arc::new(MockBackend::with_labels(Vec::new())),
            Duration::from_secs(5),
        );
        let svc = PostService::new(pool, store, vision, allowed());

        let result = svc.create_post(Uuid::new_v4(), image_upload("")).await;
        assert!(matches!(result, Err(PostError::StorageWriteFailed(_))));
        assert_eq!(count_posts(&svc).await, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_sweeps_objects() {
        let (_dir, svc) = service_with(MockBackend::with_labels(Vec::new())).await;
        let owner = Uuid::new_v4();
        let post = svc.create_post(owner, image_upload("")).await.unwrap();

        svc.delete_post(owner, post.id).await.unwrap();
        assert!(!svc.store.exists(&post.media.key_original).await.unwrap());
        assert!(!svc.store.exists(&post.media.key_thumb).await.unwrap());
        assert!(matches!(
            svc.get_post(post.id).await,
            Err(PostError::NotFound(_))
        ));

        // Second delete of a gone post is a no-op.
        svc.delete_post(owner, post.id).await.unwrap();
    }
}
