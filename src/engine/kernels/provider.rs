//! Load-or-compile front of the kernel cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::cache::{self, CacheClaim, KernelArtifact};
use super::cpu;
use super::templates::{builtin_templates, KernelTemplate, OpKind, Variant, KERNEL_SOURCE_VERSION};
use super::{CompiledKernel, KernelError, KernelSet, KernelSource};
use crate::engine::device::DeviceCapability;
use crate::telemetry;

/// Self-test hook: returns the max deviation of `variant` from the reference.
pub(crate) type SelfTestFn = fn(OpKind, Variant, usize) -> f32;

#[derive(Debug, Clone)]
pub struct KernelProviderConfig {
    /// How long to wait for another writer's claim before skipping persistence.
    pub lock_wait: Duration,
    /// Age after which a leftover claim is considered abandoned.
    pub lock_stale_after: Duration,
    /// Write compiled sets back to disk.
    pub persist: bool,
}

impl Default for KernelProviderConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(2),
            lock_stale_after: Duration::from_secs(60),
            persist: true,
        }
    }
}

pub struct KernelProvider {
    config: KernelProviderConfig,
    templates: Vec<KernelTemplate>,
    self_test: SelfTestFn,
    memo: Mutex<HashMap<(PathBuf, String), KernelSet>>,
}

impl KernelProvider {
    pub fn new(config: KernelProviderConfig) -> Self {
        Self::with_self_test(config, cpu::self_test)
    }

    pub(crate) fn with_self_test(config: KernelProviderConfig, self_test: SelfTestFn) -> Self {
        Self {
            config,
            templates: builtin_templates(),
            self_test,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// sha256 over the capability fingerprint and kernel source version.
    pub fn cache_key(capability: &DeviceCapability) -> String {
        let mut hasher = Sha256::new();
        hasher.update(capability.fingerprint());
        hasher.update(b"|");
        hasher.update(KERNEL_SOURCE_VERSION);
        hex::encode(hasher.finalize())
    }

    /// Return the kernel set for `capability`, from memory, disk or a fresh
    /// compile, in that order.
    pub fn get_or_compile(
        &self,
        capability: &DeviceCapability,
        cache_dir: &Path,
    ) -> Result<Arc<KernelSet>, KernelError> {
        let key = Self::cache_key(capability);
        let memo_key = (cache_dir.to_path_buf(), key.clone());

        if let Some(set) = self.memo.lock().get(&memo_key) {
            tracing::debug!(key = %key, "Kernel set served from memory");
            telemetry::record_kernel_cache("memory");
            return Ok(Arc::new(set.clone().with_source(KernelSource::Memory)));
        }

        if let Some(set) = self.load_cached(capability, cache_dir, &key)? {
            telemetry::record_kernel_cache("disk");
            self.memo.lock().insert(memo_key, set.clone());
            return Ok(Arc::new(set));
        }

        telemetry::record_kernel_cache("compiled");
        let kernels = self.compile(capability)?;
        tracing::info!(
            key = %key,
            family = %capability.family,
            kernels = kernels.len(),
            "Compiled kernel set"
        );
        if self.config.persist {
            self.persist(capability, cache_dir, &key, &kernels);
        }
        let set = KernelSet::new(key, kernels, KernelSource::Compiled);
        self.memo.lock().insert(memo_key, set.clone());
        Ok(Arc::new(set))
    }

    fn load_cached(
        &self,
        capability: &DeviceCapability,
        cache_dir: &Path,
        key: &str,
    ) -> Result<Option<KernelSet>, KernelError> {
        let artifact = match cache::read_artifact(cache_dir, key) {
            Ok(Some(a)) => a,
            Ok(None) => return Ok(None),
            Err(e @ KernelError::CacheCorrupt { .. }) => {
                discard(cache_dir, key, &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Err(reason) = self.validate_artifact(capability, &artifact) {
            let e = KernelError::CacheCorrupt {
                path: cache::artifact_path(cache_dir, key),
                reason,
            };
            discard(cache_dir, key, &e);
            return Ok(None);
        }

        tracing::debug!(key = %key, "Kernel set loaded from disk cache");
        Ok(Some(KernelSet::new(
            key.to_string(),
            artifact.kernels,
            KernelSource::DiskCache,
        )))
    }

    fn validate_artifact(&self, capability: &DeviceCapability, artifact: &KernelArtifact) -> Result<(), String> {
        if artifact.source_version != KERNEL_SOURCE_VERSION {
            return Err(format!("source version {}", artifact.source_version));
        }
        if artifact.fingerprint != capability.fingerprint() {
            return Err("capability fingerprint differs".into());
        }
        for template in &self.templates {
            let kernel = artifact
                .kernels
                .iter()
                .find(|k| k.op == template.op)
                .ok_or_else(|| format!("missing op {}", template.op))?;
            if kernel.revision != template.revision {
                return Err(format!("{} revision {}", kernel.op, kernel.revision));
            }
            if !kernel.family().is_supported() {
                return Err(format!("{} variant {} unsupported here", kernel.op, kernel.family()));
            }
            if kernel.tile == 0 || kernel.tile > capability.max_tile.max(1) {
                return Err(format!("{} tile {}", kernel.op, kernel.tile));
            }
        }
        Ok(())
    }

    /// Specialise every template for `capability` and self-test the result.
    pub fn compile(&self, capability: &DeviceCapability) -> Result<Vec<CompiledKernel>, KernelError> {
        let max_tile = capability.max_tile.max(1);
        self.templates
            .iter()
            .map(|template| {
                let tile = if template.tiled { max_tile } else { 1 };
                let mut last_failure = String::from("no usable variant");
                for variant in template.variants(capability.family) {
                    if !variant.family().is_supported() {
                        continue;
                    }
                    let err = (self.self_test)(template.op, variant, tile);
                    let tolerance = cpu::tolerance(template.op);
                    if err.is_finite() && err <= tolerance {
                        return Ok(CompiledKernel {
                            op: template.op,
                            variant,
                            tile,
                            revision: template.revision,
                            self_test_error: err,
                        });
                    }
                    tracing::warn!(
                        op = %template.op,
                        ?variant,
                        deviation = err,
                        tolerance,
                        "Kernel variant failed self-test"
                    );
                    last_failure = format!("self-test deviation {} exceeds {}", err, tolerance);
                }
                Err(KernelError::Compile {
                    op: template.op,
                    reason: last_failure,
                })
            })
            .collect()
    }

    fn persist(&self, capability: &DeviceCapability, cache_dir: &Path, key: &str, kernels: &[CompiledKernel]) {
        let claim = match CacheClaim::acquire(
            cache_dir,
            key,
            self.config.lock_wait,
            self.config.lock_stale_after,
        ) {
            Ok(Some(c)) => c,
            Ok(None) => {
                tracing::info!(key = %key, "Kernel cache busy; using compiled set without persisting");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Kernel cache claim failed");
                return;
            }
        };

        let artifact = KernelArtifact {
            key: key.to_string(),
            source_version: KERNEL_SOURCE_VERSION.to_string(),
            fingerprint: capability.fingerprint(),
            kernels: kernels.to_vec(),
        };
        match cache::write_artifact(cache_dir, &artifact) {
            Ok(path) => tracing::debug!(path = %path.display(), "Kernel artifact written"),
            Err(e) => tracing::warn!(error = %e, "Kernel artifact write failed"),
        }
        drop(claim);
    }

    /// Drop memoised sets, for one cache directory or all of them.
    pub fn flush(&self, cache_dir: Option<&Path>) -> usize {
        let mut memo = self.memo.lock();
        let before = memo.len();
        match cache_dir {
            Some(dir) => memo.retain(|(d, _), _| d != dir),
            None => memo.clear(),
        }
        before - memo.len()
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }
}

/// Remove a corrupt artifact. A failed removal is logged, not returned; the
/// caller recompiles either way.
fn discard(cache_dir: &Path, key: &str, cause: &KernelError) {
    tracing::warn!(error = %cause, "Discarding kernel cache artifact");
    telemetry::record_kernel_cache("corrupt");
    if let Err(e) = cache::discard_artifact(cache_dir, key) {
        tracing::warn!(error = %e, key = %key, "Corrupt kernel artifact could not be removed");
    }
}

impl Default for KernelProvider {
    fn default() -> Self {
        Self::new(KernelProviderConfig::default())
    }
}

impl std::fmt::Debug for KernelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProvider")
            .field("config", &self.config)
            .field("templates", &self.templates.len())
            .field("memo", &self.memo_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scalar() -> DeviceCapability {
        DeviceCapability::scalar()
    }

    #[test]
    fn compiles_every_op() {
        let provider = KernelProvider::default();
        let kernels = provider.compile(&scalar()).unwrap();
        assert_eq!(kernels.len(), OpKind::ALL.len());
        assert!(kernels.iter().all(|k| k.variant == Variant::Scalar));
    }

    #[test]
    fn second_call_hits_memory_then_disk_after_flush() {
        let dir = TempDir::new().unwrap();
        let provider = KernelProvider::default();
        let cap = scalar();

        let first = provider.get_or_compile(&cap, dir.path()).unwrap();
        assert_eq!(first.source(), KernelSource::Compiled);
        assert!(cache::artifact_path(dir.path(), first.key()).exists());

        let second = provider.get_or_compile(&cap, dir.path()).unwrap();
        assert_eq!(second.source(), KernelSource::Memory);

        assert_eq!(provider.flush(Some(dir.path())), 1);
        let third = provider.get_or_compile(&cap, dir.path()).unwrap();
        assert_eq!(third.source(), KernelSource::DiskCache);
        assert_eq!(third.key(), first.key());
    }

    #[test]
    fn key_ignores_memory_budget() {
        let a = scalar();
        let b = scalar().with_memory_budget(1);
        assert_eq!(KernelProvider::cache_key(&a), KernelProvider::cache_key(&b));
    }

    #[test]
    fn failed_self_test_is_a_compile_error() {
        fn broken(op: OpKind, _: Variant, _: usize) -> f32 {
            if op == OpKind::Rope {
                f32::NAN
            } else {
                0.0
            }
        }
        let provider = KernelProvider::with_self_test(KernelProviderConfig::default(), broken);
        match provider.compile(&scalar()) {
            Err(KernelError::Compile { op, .. }) => assert_eq!(op, OpKind::Rope),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[test]
    fn unpersisted_provider_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let provider = KernelProvider::new(KernelProviderConfig {
            persist: false,
            ..Default::default()
        });
        let set = provider.get_or_compile(&scalar(), dir.path()).unwrap();
        assert!(!cache::artifact_path(dir.path(), set.key()).exists());
    }
}
