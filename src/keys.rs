//! src/keys.rs
//!
//! Deterministic object-key scheme shared by the post creation path and the
//! out-of-band transform worker. Both sides compute
//! `posts/{owner_id}/{post_id}/{role}.{ext}` from the same inputs, which is
//! the only coordination mechanism between them: no message carries a key,
//! every key is re-derivable.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Top-level prefix for all post assets.
pub const POSTS_PREFIX: &str = "posts";

/// Output extension for every derived asset (thumb and variants).
/// Originals keep the extension of their declared format.
pub const DERIVED_EXT: &str = "jpg";

/// Identifier of one stylistic variant (`t1`..`t10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VariantTag {
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
    T7,
    T8,
    T9,
    T10,
}

impl VariantTag {
    /// All tags, in pipeline order.
    pub const ALL: [VariantTag; 10] = [
        VariantTag::T1,
        VariantTag::T2,
        VariantTag::T3,
        VariantTag::T4,
        VariantTag::T5,
        VariantTag::T6,
        VariantTag::T7,
        VariantTag::T8,
        VariantTag::T9,
        VariantTag::T10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantTag::T1 => "t1",
            VariantTag::T2 => "t2",
            VariantTag::T3 => "t3",
            VariantTag::T4 => "t4",
            VariantTag::T5 => "t5",
            VariantTag::T6 => "t6",
            VariantTag::T7 => "t7",
            VariantTag::T8 => "t8",
            VariantTag::T9 => "t9",
            VariantTag::T10 => "t10",
        }
    }
}

impl fmt::Display for VariantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantTag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VariantTag::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

/// Purpose of an asset within a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRole {
    /// The uploaded bytes, kept in their declared format.
    Original { ext: String },
    /// The fast, synchronously produced thumbnail.
    Thumb,
    /// One of the lazily produced stylistic variants.
    Variant(VariantTag),
}

impl AssetRole {
    fn file_name(&self) -> String {
        match self {
            AssetRole::Original { ext } => format!("original.{}", ext),
            AssetRole::Thumb => format!("thumb.{}", DERIVED_EXT),
            AssetRole::Variant(tag) => format!("{}.{}", tag.as_str(), DERIVED_EXT),
        }
    }
}

/// Compute the storage key for one asset of one post.
///
/// Total over its valid input domain: ids are UUIDs (validated upstream) and
/// the role carries its own extension, so there is no failure case. Post ids
/// are globally unique, which makes the mapping collision-free across posts.
pub fn post_key(owner_id: Uuid, post_id: Uuid, role: &AssetRole) -> String {
    format!(
        "{}/{}/{}/{}",
        POSTS_PREFIX,
        owner_id,
        post_id,
        role.file_name()
    )
}

/// Parsed reference to an `original` object, recovered from a raw key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalRef {
    pub owner_id: Uuid,
    pub post_id: Uuid,
    pub ext: String,
}

/// Parse a storage key that refers to an `original` asset.
///
/// Returns `None` for anything else — thumbs, variants, foreign prefixes,
/// malformed ids. The transform worker uses this as its filtering rule so a
/// notification caused by its own variant writes can never re-trigger it.
pub fn parse_original(key: &str) -> Option<OriginalRef> {
    let mut parts = key.split('/');
    if parts.next()? != POSTS_PREFIX {
        return None;
    }
    let owner_id = Uuid::parse_str(parts.next()?).ok()?;
    let post_id = Uuid::parse_str(parts.next()?).ok()?;
    let file = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let ext = file.strip_prefix("original.")?;
    if ext.is_empty() || ext.contains('.') {
        return None;
    }
    Some(OriginalRef {
        owner_id,
        post_id,
        ext: ext.to_string(),
    })
}

/// True when `key` names an `original` asset under the posts prefix.
pub fn is_original_key(key: &str) -> bool {
    parse_original(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let owner = Uuid::new_v4();
        let post = Uuid::new_v4();
        let role = AssetRole::Variant(VariantTag::T7);
        assert_eq!(post_key(owner, post, &role), post_key(owner, post, &role));
    }

    #[test]
    fn keys_do_not_collide_across_posts() {
        let owner = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(
            post_key(owner, a, &AssetRole::Thumb),
            post_key(owner, b, &AssetRole::Thumb)
        );
    }

    #[test]
    fn original_key_round_trips() {
        let owner = Uuid::new_v4();
        let post = Uuid::new_v4();
        let key = post_key(
            owner,
            post,
            &AssetRole::Original {
                ext: "png".to_string(),
            },
        );
        let parsed = parse_original(&key).expect("should parse");
        assert_eq!(parsed.owner_id, owner);
        assert_eq!(parsed.post_id, post);
        assert_eq!(parsed.ext, "png");
    }

    #[test]
    fn variant_and_thumb_keys_are_filtered() {
        let owner = Uuid::new_v4();
        let post = Uuid::new_v4();
        for tag in VariantTag::ALL {
            assert!(!is_original_key(&post_key(
                owner,
                post,
                &AssetRole::Variant(tag)
            )));
        }
        assert!(!is_original_key(&post_key(owner, post, &AssetRole::Thumb)));
        assert!(!is_original_key("avatars/abc/original.jpg"));
        assert!(!is_original_key("posts/not-a-uuid/also-not/original.jpg"));
    }

    #[test]
    fn variant_tag_parses_from_str() {
        assert_eq!("t10".parse::<VariantTag>(), Ok(VariantTag::T10));
        assert!("t11".parse::<VariantTag>().is_err());
        assert!("original".parse::<VariantTag>().is_err());
    }
}
