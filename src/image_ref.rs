use std::fmt;

use crate::digest::SHA256_PREFIX;

pub const LATEST_TAG: &str = "latest";

/// A parsed image reference: `repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    /// Pinned digest including its algorithm prefix, if any.
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        // Careful with registry hosts carrying a port, e.g.
        // localhost:5000/myimage:tag. A colon followed by a slash is a port.
        if let Some(colon_pos) = name.rfind(':') {
            let after_colon = &name[colon_pos + 1..];
            if !after_colon.contains('/') {
                return Self {
                    repository: name[..colon_pos].to_string(),
                    tag: after_colon.to_string(),
                    digest,
                };
            }
        }

        Self {
            repository: name.to_string(),
            tag: LATEST_TAG.to_string(),
            digest,
        }
    }

    /// The same repository at the `latest` tag, without any pinned digest.
    pub fn with_latest(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: LATEST_TAG.to_string(),
            digest: None,
        }
    }

    /// The same reference without its pinned digest.
    pub fn unpinned(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: None,
        }
    }

    /// `repository:tag`
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// `repository:tag@sha256:<digest>` for a canonical (unprefixed) digest.
    pub fn pinned(&self, digest: &str) -> String {
        format!("{}@{SHA256_PREFIX}{digest}", self.tagged())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.tagged(), digest),
            None => f.write_str(&self.tagged()),
        }
    }
}

/// Containers started from a bare image id cannot be pulled again.
pub fn is_image_id(reference: &str) -> bool {
    reference.starts_with(SHA256_PREFIX)
}
