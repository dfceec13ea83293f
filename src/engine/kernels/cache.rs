//! On-disk kernel artifact cache.
//!
//! Layout under the cache directory:
//!
//! ```text
//! <cache_dir>/<key>/kernels.json   artifact envelope
//! <cache_dir>/<key>.lock           write claim, present only while writing
//! ```
//!
//! The envelope carries the serialized payload together with its sha256, so
//! a torn or edited file is detected and recompiled instead of trusted.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CompiledKernel, KernelError};

pub const ARTIFACT_FILE: &str = "kernels.json";
pub const ENVELOPE_FORMAT: u32 = 1;

/// Cached kernels for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelArtifact {
    pub key: String,
    pub source_version: String,
    pub fingerprint: String,
    pub kernels: Vec<CompiledKernel>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: u32,
    created_at: DateTime<Utc>,
    checksum: String,
    payload: String,
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Directory holding one key's artifact.
pub fn artifact_dir(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(key)
}

pub fn artifact_path(cache_dir: &Path, key: &str) -> PathBuf {
    artifact_dir(cache_dir, key).join(ARTIFACT_FILE)
}

pub fn lock_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{}.lock", key))
}

/// Read the artifact for `key`.
///
/// `Ok(None)` when nothing is cached. A present but unreadable, unparsable
/// or checksum-mismatched artifact is `CacheCorrupt`.
pub fn read_artifact(cache_dir: &Path, key: &str) -> Result<Option<KernelArtifact>, KernelError> {
    let path = artifact_path(cache_dir, key);
    let raw = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(KernelError::CacheCorrupt {
                path,
                reason: e.to_string(),
            })
        }
    };
    let corrupt = |reason: String| KernelError::CacheCorrupt {
        path: path.clone(),
        reason,
    };

    let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|e| corrupt(format!("envelope: {}", e)))?;
    if envelope.format != ENVELOPE_FORMAT {
        return Err(corrupt(format!("envelope format {}", envelope.format)));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    let artifact: KernelArtifact =
        serde_json::from_str(&envelope.payload).map_err(|e| corrupt(format!("payload: {}", e)))?;
    if artifact.key != key {
        return Err(corrupt(format!("artifact is for key {}", artifact.key)));
    }
    Ok(Some(artifact))
}

/// Write the artifact atomically: temp file in the key directory, then rename.
pub fn write_artifact(cache_dir: &Path, artifact: &KernelArtifact) -> Result<PathBuf, KernelError> {
    let dir = artifact_dir(cache_dir, &artifact.key);
    fs::create_dir_all(&dir)?;

    let payload = serde_json::to_string(artifact).map_err(std::io::Error::other)?;
    let envelope = Envelope {
        format: ENVELOPE_FORMAT,
        created_at: Utc::now(),
        checksum: checksum(&payload),
        payload,
    };
    let body = serde_json::to_vec_pretty(&envelope).map_err(std::io::Error::other)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    let path = dir.join(ARTIFACT_FILE);
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// Remove a corrupt artifact. Missing files are fine.
pub fn discard_artifact(cache_dir: &Path, key: &str) -> Result<(), KernelError> {
    match fs::remove_file(artifact_path(cache_dir, key)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// -- Write claim --------------------------------------------------------------

/// Exclusive claim on writing one key's artifact. Removed on drop.
#[derive(Debug)]
pub struct CacheClaim {
    path: PathBuf,
}

impl CacheClaim {
    /// Try to take the claim, waiting up to `wait`.
    ///
    /// A lock file older than `stale_after` is assumed abandoned by a
    /// crashed writer and removed. Returns `Ok(None)` if another writer
    /// still holds the claim when `wait` runs out.
    pub fn acquire(
        cache_dir: &Path,
        key: &str,
        wait: Duration,
        stale_after: Duration,
    ) -> Result<Option<Self>, KernelError> {
        fs::create_dir_all(cache_dir)?;
        let path = lock_path(cache_dir, key);
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after) {
                        tracing::warn!(lock = %path.display(), "Removing stale kernel cache lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheClaim {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kernels::{OpKind, Variant};
    use tempfile::TempDir;

    fn artifact(key: &str) -> KernelArtifact {
        KernelArtifact {
            key: key.into(),
            source_version: "test".into(),
            fingerprint: "fp".into(),
            kernels: vec![CompiledKernel {
                op: OpKind::RmsNorm,
                variant: Variant::Scalar,
                tile: 1,
                revision: 1,
                self_test_error: 0.0,
            }],
        }
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let a = artifact("abc");
        let path = write_artifact(dir.path(), &a).unwrap();
        assert_eq!(path, artifact_path(dir.path(), "abc"));
        assert_eq!(read_artifact(dir.path(), "abc").unwrap(), Some(a));
    }

    #[test]
    fn absent_artifact_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_artifact(dir.path(), "nothing").unwrap(), None);
    }

    #[test]
    fn tampered_payload_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(dir.path(), &artifact("abc")).unwrap();
        let body = fs::read_to_string(&path).unwrap().replace("RmsNorm", "Softmax");
        fs::write(&path, body).unwrap();
        assert!(matches!(
            read_artifact(dir.path(), "abc"),
            Err(KernelError::CacheCorrupt { .. })
        ));
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(artifact_dir(dir.path(), "abc")).unwrap();
        fs::write(artifact_path(dir.path(), "abc"), b"\x00\x01not json").unwrap();
        assert!(matches!(
            read_artifact(dir.path(), "abc"),
            Err(KernelError::CacheCorrupt { .. })
        ));
    }

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let wait = Duration::from_millis(50);
        let stale = Duration::from_secs(600);
        let first = CacheClaim::acquire(dir.path(), "k", wait, stale).unwrap();
        assert!(first.is_some());
        assert!(CacheClaim::acquire(dir.path(), "k", wait, stale).unwrap().is_none());
        drop(first);
        assert!(!lock_path(dir.path(), "k").exists());
        assert!(CacheClaim::acquire(dir.path(), "k", wait, stale).unwrap().is_some());
    }

    #[test]
    fn stale_claim_is_taken_over() {
        let dir = TempDir::new().unwrap();
        fs::write(lock_path(dir.path(), "k"), b"999999").unwrap();
        thread::sleep(Duration::from_millis(30));
        let claim = CacheClaim::acquire(dir.path(), "k", Duration::ZERO, Duration::from_millis(1)).unwrap();
        assert!(claim.is_some());
    }
}
