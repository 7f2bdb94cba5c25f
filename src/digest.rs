//! Canonical image digests.
//!
//! A digest is compared and displayed without its `sha256:` prefix, so two
//! images are the same content exactly when their canonical digests match,
//! whatever tags they carry.

use thiserror::Error;

use crate::runtime::Image;

pub const SHA256_PREFIX: &str = "sha256:";

/// Length of the digest shown in notifications.
const SHORT_LEN: usize = 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    #[error("Cannot get digest from a missing image")]
    MissingImage,
    #[error("Image '{0}' has no usable digest")]
    InvalidDigest(String),
}

/// Strip the `sha256:` prefix from a digest.
pub fn remove_sha_prefix(digest: &str) -> &str {
    digest.trim_start_matches(SHA256_PREFIX)
}

/// Locate the content digest of an image.
///
/// Order: the content descriptor, then the digest part of the first repo
/// digest, then the image id.
pub fn resolve(image: Option<&Image>) -> Result<String, DigestError> {
    let image = image.ok_or(DigestError::MissingImage)?;

    let digest = image
        .descriptor_digest
        .as_deref()
        .filter(|d| !d.is_empty())
        .or_else(|| {
            image
                .repo_digests
                .first()
                .and_then(|d| d.split('@').nth(1))
                .filter(|d| !d.is_empty())
        })
        .unwrap_or(image.id.as_str());

    match remove_sha_prefix(digest) {
        "" => Err(DigestError::InvalidDigest(image.id.clone())),
        canonical => Ok(canonical.to_string()),
    }
}

/// Same content iff the canonical digests are equal.
pub fn same_content(a: &str, b: &str) -> bool {
    remove_sha_prefix(a) == remove_sha_prefix(b)
}

pub fn short_digest(digest: &str) -> &str {
    let canonical = remove_sha_prefix(digest);
    match canonical.char_indices().nth(SHORT_LEN) {
        Some((idx, _)) => &canonical[..idx],
        None => canonical,
    }
}
