//! URL-keyed disk cache: a body blob replayed verbatim plus a small
//! metadata record driving freshness and revalidation.
//!
//! Bodies commit atomically (write to a process-unique temp file, rename on
//! clean end-of-stream); metadata reads and writes serialize on one
//! store-wide mutex. Concurrent writers for the same URL both commit and the
//! last rename wins; a reader always sees a complete old or new body.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::http::ResponseInfo;

const CACHE_SUFFIX: &str = ".cache";
const META_SUFFIX: &str = ".meta";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// 64-bit FNV-1a over the absolute URL.
pub fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// 16 lowercase hex digits naming both on-disk artifacts.
pub fn cache_key(url: &str) -> String {
    hex::encode(fnv1a(url).to_be_bytes())
}

/// Parsed form of a `<key>.meta` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMeta {
    /// Epoch seconds when the entry was stored or last revalidated.
    pub stored_at: u64,
    /// Absolute expiry; 0 means not inherently fresh.
    pub expires: u64,
    pub must_revalidate: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl CacheMeta {
    /// Fresh entries replay without contacting the origin.
    pub fn is_fresh(&self, at: u64) -> bool {
        !self.must_revalidate && self.expires != 0 && at < self.expires
    }

    /// Folds an upstream response head into the record. `max-age` wins over
    /// `Expires`; absent freshness information keeps the previous expiry.
    pub fn apply_response(&mut self, info: &ResponseInfo, at: u64) {
        if let Some(max_age) = info.max_age {
            self.expires = at + max_age;
        } else if let Some(expires) = info.expires {
            self.expires = expires;
        }

        self.must_revalidate = info.must_revalidate || info.no_cache;

        if let Some(last_modified) = &info.last_modified {
            self.last_modified = Some(last_modified.clone());
        }
        if let Some(etag) = &info.etag {
            self.etag = Some(etag.clone());
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("stored_at={}\n", self.stored_at));
        out.push_str(&format!("expires={}\n", self.expires));
        out.push_str(&format!("must_revalidate={}\n", u8::from(self.must_revalidate)));
        if let Some(last_modified) = &self.last_modified {
            out.push_str(&format!("last_modified={last_modified}\n"));
        }
        if let Some(etag) = &self.etag {
            out.push_str(&format!("etag={etag}\n"));
        }
        out
    }

    fn parse(text: &str) -> Self {
        let mut meta = CacheMeta::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "stored_at" => meta.stored_at = value.parse().unwrap_or(0),
                "expires" => meta.expires = value.parse().unwrap_or(0),
                "must_revalidate" => meta.must_revalidate = value.parse().unwrap_or(0u8) != 0,
                "last_modified" => meta.last_modified = Some(value.to_string()),
                "etag" => meta.etag = Some(value.to_string()),
                _ => {}
            }
        }
        meta
    }
}

/// The cache directory plus the metadata serializer.
pub struct CacheStore {
    dir: PathBuf,
    meta_lock: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl CacheStore {
    /// Opens (creating if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            meta_lock: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{CACHE_SUFFIX}"))
    }

    pub fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{META_SUFFIX}"))
    }

    /// Reads the metadata record for `key`, only when both artifacts exist.
    pub async fn read_meta(&self, key: &str) -> Option<CacheMeta> {
        let _guard = self.meta_lock.lock().await;
        if !self.body_path(key).is_file() {
            return None;
        }
        let text = std::fs::read_to_string(self.meta_path(key)).ok()?;
        Some(CacheMeta::parse(&text))
    }

    /// Writes the metadata record atomically (temp + rename) under the
    /// store-wide lock. Last writer wins.
    pub async fn write_meta(&self, key: &str, meta: &CacheMeta) -> Result<(), CacheError> {
        let _guard = self.meta_lock.lock().await;
        let path = self.meta_path(key);
        let tmp = path.with_extension("meta.tmp");
        std::fs::write(&tmp, meta.render())?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("metadata written for {}", key);
        Ok(())
    }

    /// Opens the cached body for replay.
    pub async fn open_body(&self, key: &str) -> Result<File, CacheError> {
        Ok(File::open(self.body_path(key)).await?)
    }

    /// Starts streaming a new body into a temp file. The writer commits with
    /// a rename or removes its temp file on drop.
    pub async fn begin_body(&self, key: &str) -> Result<BodyWriter, CacheError> {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!(
            "{key}{CACHE_SUFFIX}.tmp.{}.{seq}",
            std::process::id()
        ));
        let file = File::create(&tmp_path).await?;
        Ok(BodyWriter {
            file: Some(file),
            tmp_path,
            final_path: self.body_path(key),
            committed: false,
        })
    }
}

/// In-flight cache body. Dropping without [`BodyWriter::commit`] unlinks the
/// temp file, whatever exit path got us there.
pub struct BodyWriter {
    file: Option<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl BodyWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
        }
        Ok(())
    }

    /// Flushes and renames the temp file into place.
    pub async fn commit(mut self) -> Result<(), CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        debug!("cache body committed: {}", self.final_path.display());
        Ok(())
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            if std::fs::remove_file(&self.tmp_path).is_ok() {
                warn!("abandoned partial cache body {}", self.tmp_path.display());
            }
        }
    }
}
