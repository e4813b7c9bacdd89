//! src/services/transform.rs
//!
//! TransformWorker — the out-of-band unit that reacts to a storage-change
//! notification for an `original` object and materializes the thumbnail
//! equivalent plus the ten stylistic variants under their predetermined
//! keys. It never talks to the orchestrator: the shared key scheme is the
//! whole contract.
//!
//! Delivery is at-least-once upstream, so the worker is idempotent: the
//! transforms are deterministic and the store overwrites atomically.
//! Failures are per-variant and logged; retry comes from redelivery, not
//! from the worker.

use crate::keys::{self, AssetRole, VariantTag, post_key};
use crate::services::imaging::{self, ImagingError};
use crate::services::object_store::{FsObjectStore, StoreError};
use futures::future::join_all;
use image::DynamicImage;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("original object unavailable: {0}")]
    Fetch(#[from] StoreError),
    #[error("original could not be decoded: {0}")]
    Decode(String),
    #[error("transform task panicked: {0}")]
    Join(String),
}

/// One storage-change notification as delivered by the event source.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageEvent {
    #[serde(default)]
    pub bucket: Option<String>,
    pub key: String,
}

/// What one invocation did.
#[derive(Debug)]
pub enum TransformReport {
    /// The key did not name an `original` asset; nothing was done.
    Skipped,
    /// Variants were processed; `failed` counts the ones that did not land.
    Processed { written: Vec<String>, failed: usize },
}

#[derive(Clone)]
pub struct TransformWorker {
    store: FsObjectStore,
}

impl TransformWorker {
    pub fn new(store: FsObjectStore) -> Self {
        Self { store }
    }

    /// Filtering rule, exposed so the event intake can acknowledge
    /// uninteresting notifications without scheduling work.
    pub fn accepts(key: &str) -> bool {
        keys::is_original_key(key)
    }

    /// Process one notification end to end.
    pub async fn handle_event(&self, event: &StorageEvent) -> Result<TransformReport, TransformError> {
        let Some(origin) = keys::parse_original(&event.key) else {
            // Guards against re-triggering on our own variant writes.
            info!(key = %event.key, "ignoring non-original object event");
            return Ok(TransformReport::Skipped);
        };

        let bytes = self.store.get(&event.key).await?;
        let image = tokio::task::spawn_blocking(move || imaging::decode(&bytes))
            .await
            .map_err(|e| TransformError::Join(e.to_string()))?
            .map_err(|e| TransformError::Decode(e.to_string()))?
            .0;
        let image = Arc::new(image);

        // Thumbnail plus all ten variants, computed and uploaded
        // concurrently. No ordering between them; each key becomes
        // independently visible as it lands.
        let mut jobs = Vec::with_capacity(VariantTag::ALL.len() + 1);
        jobs.push(self.derive_one(AssetRole::Thumb, &origin, image.clone()));
        for tag in VariantTag::ALL {
            jobs.push(self.derive_one(AssetRole::Variant(tag), &origin, image.clone()));
        }
        let results = join_all(jobs).await;

        let mut written = Vec::new();
        let mut failed = 0;
        for result in results {
            match result {
                Ok(key) => written.push(key),
                Err(()) => failed += 1,
            }
        }

        info!(
            key = %event.key,
            written = written.len(),
            failed,
            "transform pass complete"
        );
        Ok(TransformReport::Processed { written, failed })
    }

    /// Compute and upload a single derived asset. A failure here is local:
    /// it is logged and reported as a unit, never propagated to siblings.
    async fn derive_one(
        &self,
        role: AssetRole,
        origin: &keys::OriginalRef,
        image: Arc<DynamicImage>,
    ) -> Result<String, ()> {
        let key = post_key(origin.owner_id, origin.post_id, &role);
        let role_for_task = role.clone();
        let computed = tokio::task::spawn_blocking(move || match role_for_task {
            AssetRole::Thumb => imaging::make_thumb(&image),
            AssetRole::Variant(tag) => imaging::make_variant(tag, &image),
            AssetRole::Original { .. } => {
                Err(ImagingError::Encode("original is never derived".into()))
            }
        })
        .await;

        let bytes = match computed {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(%key, error = %err, "variant computation failed");
                return Err(());
            }
            Err(err) => {
                warn!(%key, error = %err, "variant task panicked");
                return Err(());
            }
        };

        match self.store.put(&key, &bytes).await {
            Ok(_) => Ok(key),
            Err(err) => {
                warn!(%key, error = %err, "variant upload failed");
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use uuid::Uuid;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 2 % 256) as u8, (y * 3 % 256) as u8, 128])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encode");
        buf
    }

    async fn seeded_original() -> (tempfile::TempDir, TransformWorker, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        let key = post_key(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &AssetRole::Original { ext: "png".into() },
        );
        store.put(&key, &png_bytes(64, 48)).await.unwrap();
        (dir, TransformWorker::new(store), key)
    }

    fn event(key: &str) -> StorageEvent {
        StorageEvent {
            bucket: Some("media".into()),
            key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn writes_thumb_and_all_variants() {
        let (_dir, worker, key) = seeded_original().await;
        let origin = keys::parse_original(&key).unwrap();

        let report = worker.handle_event(&event(&key)).await.unwrap();
        let TransformReport::Processed { written, failed } = report else {
            panic!("expected processed report");
        };
        assert_eq!(failed, 0);
        assert_eq!(written.len(), 11);

        for tag in VariantTag::ALL {
            let variant_key = post_key(origin.owner_id, origin.post_id, &AssetRole::Variant(tag));
            assert!(worker.store.exists(&variant_key).await.unwrap(), "{tag}");
        }
        let thumb_key = post_key(origin.owner_id, origin.post_id, &AssetRole::Thumb);
        assert!(worker.store.exists(&thumb_key).await.unwrap());
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let (_dir, worker, key) = seeded_original().await;
        let origin = keys::parse_original(&key).unwrap();
        let variant_key = post_key(
            origin.owner_id,
            origin.post_id,
            &AssetRole::Variant(VariantTag::T1),
        );

        worker.handle_event(&event(&key)).await.unwrap();
        let first = worker.store.get(&variant_key).await.unwrap();

        worker.handle_event(&event(&key)).await.unwrap();
        let second = worker.store.get(&variant_key).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn variant_and_foreign_keys_are_skipped() {
        let (_dir, worker, key) = seeded_original().await;
        let origin = keys::parse_original(&key).unwrap();
        let variant_key = post_key(
            origin.owner_id,
            origin.post_id,
            &AssetRole::Variant(VariantTag::T3),
        );

        for skip_key in [variant_key.as_str(), "avatars/u1/pic.jpg"] {
            let report = worker.handle_event(&event(skip_key)).await.unwrap();
            assert!(matches!(report, TransformReport::Skipped), "{skip_key}");
        }
    }

    #[tokio::test]
    async fn missing_original_is_an_error_for_redelivery() {
        let dir = tempfile::tempdir().unwrap();
        let worker = TransformWorker::new(FsObjectStore::new(dir.path()));
        let key = post_key(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &AssetRole::Original { ext: "png".into() },
        );

        assert!(matches!(
            worker.handle_event(&event(&key)).await,
            Err(TransformError::Fetch(_))
        ));
    }
}
