use std::fmt::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use crate::types::MediaKind;

/// The longest file extension kept from a media URL.
const MAX_EXTENSION_LEN: usize = 8;

/// The identity of a media asset in the cache.
///
/// The key is a sha-256 hash over human-readable, stable metadata: the normalized media URL
/// and an optional content fingerprint. Two feed items referring to the same media resolve to
/// equal keys, which is what deduplicates downloads across the subsystem.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    extension: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a piece of media at `url`.
    ///
    /// The `url` is expected to be normalized already, see [`normalize_url`].
    pub fn for_media(url: &Url, kind: MediaKind, fingerprint: Option<&str>) -> Self {
        let mut builder = Self::builder();
        builder.write_media_meta(url, fingerprint);
        builder.with_extension(media_extension(url, kind)).build()
    }

    /// Create an empty [`CacheKeyBuilder`].
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: String::new(),
            extension: String::new(),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the file extension used for the cached file, without the leading dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns the hashed path for this cache key.
    ///
    /// The path is a sha-256 hash hex-formatted like so: `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    /// Returns the path of a cached file relative to the cache's data directory.
    ///
    /// This is the [`cache_path`](Self::cache_path) with the `version` of the download and the
    /// media's file extension appended, so that players which sniff the container from the file
    /// name keep working. Every download of a key is stored under its own version.
    pub fn relative_path(&self, version: u64) -> PathBuf {
        let mut path = self.cache_path();
        let _ = write!(path, ".{version}");
        if !self.extension.is_empty() {
            path.push('.');
            path.push_str(&self.extension);
        }
        PathBuf::from(path)
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        let mut builder = Self::builder();
        builder.metadata = key.into();
        builder.with_extension("mp4").build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// The intention of it is to accept human readable, but most importantly **stable**, input.
/// This input is then hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    metadata: String,
    extension: String,
}

impl CacheKeyBuilder {
    /// Writes metadata about a piece of media into the [`CacheKey`].
    pub fn write_media_meta(&mut self, url: &Url, fingerprint: Option<&str>) {
        self.metadata.push_str("url: ");
        self.metadata.push_str(url.as_str());
        self.metadata.push('\n');
        if let Some(fingerprint) = fingerprint {
            self.metadata.push_str("fingerprint: ");
            self.metadata.push_str(fingerprint);
            self.metadata.push('\n');
        }
    }

    /// Sets the file extension of the cached file.
    ///
    /// The extension does not contribute to the hash.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let digest = Sha256::digest(&self.metadata);
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);

        CacheKey {
            metadata: self.metadata.into(),
            extension: self.extension.into(),
            hash,
        }
    }
}

/// Parses and normalizes a media URL.
///
/// Parsing already lowercases the scheme and host, drops default ports and normalizes
/// percent-encoding. The fragment is never sent to the origin and is stripped as well.
pub fn normalize_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);
    Ok(url)
}

/// Derives a safe file extension from the last path segment of `url`.
///
/// Protects against:
/// * path separators or `..` sneaking into the file name
/// * overly long or non-alphanumeric "extensions" of extension-less paths
fn media_extension(url: &Url, kind: MediaKind) -> String {
    let extension = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        });

    match extension {
        Some(ext) => ext.to_ascii_lowercase(),
        None => kind.default_extension().to_owned(),
    }
}
