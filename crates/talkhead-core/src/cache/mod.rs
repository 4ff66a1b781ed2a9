//! Feature cache: per-identity bundles, built at most once and reused.

mod bundle;
mod store;

pub use bundle::{
    BundleMetadata, FeatureBundle, ParsingMode, PreparedTemplate, PreprocessParams, RegionBox,
    FORMAT_VERSION,
};
pub use store::BundleStore;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::backends::TemplatePreprocessor;
use crate::error::{Error, Result};

/// A request to resolve (or build) the bundle for one identity.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: String,
    pub source_image: PathBuf,
    pub params: PreprocessParams,
    pub force_refresh: bool,
}

impl BuildRequest {
    pub fn new(id: impl Into<String>, source_image: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source_image: source_image.into(),
            params: PreprocessParams::default(),
            force_refresh: false,
        }
    }

    pub fn with_params(mut self, params: PreprocessParams) -> Self {
        self.params = params;
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

type BuildCell = Arc<OnceCell<Arc<FeatureBundle>>>;

/// Disk-backed bundle cache with a small warm layer in front of it.
///
/// Concurrent [`get_or_build`](Self::get_or_build) calls for one id share a
/// single build. Loads take a per-id read lock and commits take the write
/// lock, so a reader never pairs a new blob with an old sidecar.
pub struct FeatureCache {
    store: Arc<BundleStore>,
    preprocessor: Arc<dyn TemplatePreprocessor>,
    warm: Mutex<WarmSet>,
    inflight: tokio::sync::Mutex<HashMap<String, BuildCell>>,
    entry_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    builds: AtomicU64,
}

impl FeatureCache {
    pub fn new(
        cache_dir: PathBuf,
        preprocessor: Arc<dyn TemplatePreprocessor>,
        warm_capacity: usize,
    ) -> Result<Self> {
        let store = BundleStore::new(cache_dir)?;
        info!("Feature cache at {:?}", store.dir());
        Ok(Self {
            store: Arc::new(store),
            preprocessor,
            warm: Mutex::new(WarmSet::new(warm_capacity)),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            entry_locks: Mutex::new(HashMap::new()),
            builds: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Number of builds started since this cache was created.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }

    /// Return the cached bundle for `request.id`, building it when missing,
    /// corrupt, built with other parameters, or when a refresh is forced.
    pub async fn get_or_build(&self, request: BuildRequest) -> Result<Arc<FeatureBundle>> {
        validate_id(&request.id)?;

        if !request.force_refresh {
            if let Some(bundle) = self.lookup(&request.id, Some(&request.params)).await? {
                return Ok(bundle);
            }
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(request.id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                // Another caller may have committed the entry while we queued.
                if !request.force_refresh {
                    if let Some(bundle) = self.lookup(&request.id, Some(&request.params)).await? {
                        return Ok(bundle);
                    }
                }
                self.build(&request).await
            })
            .await
            .cloned();

        {
            let mut inflight = self.inflight.lock().await;
            if inflight
                .get(&request.id)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                inflight.remove(&request.id);
            }
        }

        result
    }

    /// Cached bundle for `id` regardless of its build parameters.
    pub async fn get(&self, id: &str) -> Result<Option<Arc<FeatureBundle>>> {
        validate_id(id)?;
        self.lookup(id, None).await
    }

    /// Both artifacts for `id` are on disk. Does not load or validate them.
    pub fn exists(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        Ok(self.store.exists(id))
    }

    pub fn cache_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.store.blob_path(id))
    }

    /// Delete an entry from disk and from the warm layer.
    pub async fn invalidate(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let removed = self.remove_entry(id).await?;
        if removed {
            info!("Invalidated cache entry {}", id);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<BundleMetadata>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list())
            .await
            .map_err(|e| Error::Backend(format!("Cache listing task failed: {e}")))?
    }

    fn entry_lock(&self, id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.entry_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Warm layer first, then disk. Corrupt entries are deleted and reported
    /// as a miss.
    async fn lookup(
        &self,
        id: &str,
        params: Option<&PreprocessParams>,
    ) -> Result<Option<Arc<FeatureBundle>>> {
        let wanted = |bundle: &FeatureBundle| params.map_or(true, |p| bundle.metadata.params == *p);

        if let Some(bundle) = self.warm_get(id) {
            if wanted(&bundle) {
                return Ok(Some(bundle));
            }
            debug!("Warm entry {} was built with other parameters", id);
            return Ok(None);
        }

        let loaded = {
            let lock = self.entry_lock(id);
            let _read = lock.read().await;
            let store = self.store.clone();
            let owned_id = id.to_string();
            tokio::task::spawn_blocking(move || store.load(&owned_id))
                .await
                .map_err(|e| Error::Backend(format!("Cache load task failed: {e}")))?
        };

        match loaded {
            Ok(Some(bundle)) => {
                if !wanted(&bundle) {
                    info!("Cache entry {} was built with other parameters; rebuilding", id);
                    return Ok(None);
                }
                let bundle = Arc::new(bundle);
                self.warm_insert(bundle.clone());
                debug!("Loaded cache entry {} ({} frames)", id, bundle.len());
                Ok(Some(bundle))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_recoverable() => {
                warn!("Discarding cache entry {}: {}", id, e);
                self.remove_entry(id).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn build(&self, request: &BuildRequest) -> Result<Arc<FeatureBundle>> {
        if !request.source_image.is_file() {
            return Err(Error::NotFound(format!(
                "Template image not found: {}",
                request.source_image.display()
            )));
        }

        self.builds.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        info!(
            "Building features for {} from {:?}",
            request.id, request.source_image
        );

        let preprocessor = self.preprocessor.clone();
        let id = request.id.clone();
        let image = request.source_image.clone();
        let params = request.params.clone();
        let bundle = tokio::task::spawn_blocking(move || {
            let prepared = preprocessor.prepare(&image, &params)?;
            FeatureBundle::from_prepared(&id, image, params, prepared)
        })
        .await
        .map_err(|e| Error::Backend(format!("Preprocessing task failed: {e}")))??;
        let bundle = Arc::new(bundle);

        {
            let lock = self.entry_lock(&request.id);
            let _write = lock.write().await;
            let store = self.store.clone();
            let to_save = bundle.clone();
            tokio::task::spawn_blocking(move || store.save(&to_save))
                .await
                .map_err(|e| Error::Backend(format!("Cache write task failed: {e}")))??;
            self.warm_insert(bundle.clone());
        }

        info!(
            "Built {} ({} cycle frames) in {:.2}s",
            request.id,
            bundle.len(),
            started.elapsed().as_secs_f32()
        );
        Ok(bundle)
    }

    async fn remove_entry(&self, id: &str) -> Result<bool> {
        let lock = self.entry_lock(id);
        let _write = lock.write().await;
        let was_warm = self.warm_remove(id);
        let store = self.store.clone();
        let owned_id = id.to_string();
        let deleted = tokio::task::spawn_blocking(move || store.delete(&owned_id))
            .await
            .map_err(|e| Error::Backend(format!("Cache delete task failed: {e}")))??;
        Ok(deleted || was_warm)
    }

    fn warm_get(&self, id: &str) -> Option<Arc<FeatureBundle>> {
        self.warm.lock().unwrap_or_else(|e| e.into_inner()).get(id)
    }

    fn warm_insert(&self, bundle: Arc<FeatureBundle>) {
        self.warm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bundle);
    }

    fn warm_remove(&self, id: &str) -> bool {
        self.warm.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
    }
}

/// Ids name files in the cache directory, so they are restricted to a
/// filename-safe alphabet.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Invalid template id '{id}': use letters, digits, '_', '-' or '.'"
        )))
    }
}

/// Insertion-ordered bounded map; the oldest entry is evicted first.
struct WarmSet {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Arc<FeatureBundle>>,
}

impl WarmSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, id: &str) -> Option<Arc<FeatureBundle>> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, bundle: Arc<FeatureBundle>) {
        if self.capacity == 0 {
            return;
        }
        let id = bundle.id().to_string();
        if self.entries.insert(id.clone(), bundle).is_none() {
            self.order.push_back(id);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        self.order.retain(|existing| existing != id);
        self.entries.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingPreprocessor;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        preprocessor: Arc<CountingPreprocessor>,
        cache: Arc<FeatureCache>,
    }

    impl Fixture {
        fn new(delay: Duration) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let preprocessor = Arc::new(CountingPreprocessor::new(3).with_delay(delay));
            let cache = Arc::new(
                FeatureCache::new(dir.path().join("cache"), preprocessor.clone(), 4).unwrap(),
            );
            std::fs::write(dir.path().join("alice.jpg"), b"jpeg").unwrap();
            Self {
                dir,
                preprocessor,
                cache,
            }
        }

        fn image(&self) -> PathBuf {
            self.dir.path().join("alice.jpg")
        }

        /// A second cache over the same directory with an empty warm layer.
        fn cold_cache(&self) -> FeatureCache {
            FeatureCache::new(self.dir.path().join("cache"), self.preprocessor.clone(), 4).unwrap()
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_build() {
        let fixture = Fixture::new(Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = fixture.cache.clone();
            let request = BuildRequest::new("alice", fixture.image());
            handles.push(tokio::spawn(async move { cache.get_or_build(request).await }));
        }
        for handle in handles {
            let bundle = handle.await.unwrap().unwrap();
            assert_eq!(bundle.id(), "alice");
            assert_eq!(bundle.len(), 6);
        }

        assert_eq!(fixture.cache.build_count(), 1);
        assert_eq!(fixture.preprocessor.calls(), 1);
    }

    #[tokio::test]
    async fn test_committed_entry_is_reused_across_instances() {
        let fixture = Fixture::new(Duration::ZERO);
        fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();
        assert!(fixture.cache.exists("alice").unwrap());

        let cold = fixture.cold_cache();
        let bundle = cold
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();
        assert!(bundle.validate());
        assert_eq!(cold.build_count(), 0);
        assert_eq!(fixture.preprocessor.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_rebuilds() {
        let fixture = Fixture::new(Duration::ZERO);
        let request = BuildRequest::new("alice", fixture.image());
        fixture.cache.get_or_build(request.clone()).await.unwrap();
        fixture
            .cache
            .get_or_build(request.force_refresh(true))
            .await
            .unwrap();
        assert_eq!(fixture.cache.build_count(), 2);
    }

    #[tokio::test]
    async fn test_changed_params_rebuild() {
        let fixture = Fixture::new(Duration::ZERO);
        fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();

        let params = PreprocessParams {
            bbox_shift: 5,
            ..Default::default()
        };
        let bundle = fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()).with_params(params.clone()))
            .await
            .unwrap();
        assert_eq!(bundle.metadata.params, params);
        assert_eq!(fixture.cache.build_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found() {
        let fixture = Fixture::new(Duration::ZERO);
        let result = fixture
            .cache
            .get_or_build(BuildRequest::new("ghost", fixture.dir.path().join("ghost.jpg")))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!fixture.cache.exists("ghost").unwrap());
        assert_eq!(fixture.preprocessor.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_rebuilt() {
        let fixture = Fixture::new(Duration::ZERO);
        fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();
        std::fs::write(fixture.cache.store().blob_path("alice"), b"garbage").unwrap();

        let cold = fixture.cold_cache();
        assert!(cold.get("alice").await.unwrap().is_none());
        assert!(!cold.exists("alice").unwrap());

        let bundle = cold
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();
        assert!(bundle.validate());
        assert_eq!(cold.build_count(), 1);
        assert!(cold.store().load("alice").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_entry() {
        let fixture = Fixture::new(Duration::ZERO);
        let blocker = fixture.cache.store().blob_path("alice");
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        let result = fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await;
        assert!(result.is_err());
        assert_eq!(fixture.cache.build_count(), 1);
        assert!(!fixture.cache.exists("alice").unwrap());
        assert!(fixture.cache.get("alice").await.unwrap().is_none());
        assert!(!fixture.cache.store().metadata_path("alice").exists());

        let leftovers: Vec<_> = std::fs::read_dir(fixture.dir.path().join("cache"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_invalidate_clears_both_layers() {
        let fixture = Fixture::new(Duration::ZERO);
        fixture
            .cache
            .get_or_build(BuildRequest::new("alice", fixture.image()))
            .await
            .unwrap();

        assert!(fixture.cache.invalidate("alice").await.unwrap());
        assert!(fixture.cache.get("alice").await.unwrap().is_none());
        assert!(!fixture.cache.invalidate("alice").await.unwrap());
        assert!(fixture.cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_ids_are_rejected() {
        let fixture = Fixture::new(Duration::ZERO);
        for id in ["", "../etc", "a/b", ".hidden", "sp ace"] {
            let result = fixture
                .cache
                .get_or_build(BuildRequest::new(id, fixture.image()))
                .await;
            assert!(matches!(result, Err(Error::InvalidInput(_))), "id {id:?}");
        }
        assert!(validate_id("alice_01.v2-b").is_ok());
    }

    #[test]
    fn test_warm_set_evicts_oldest() {
        let mut warm = WarmSet::new(2);
        for id in ["a", "b", "c"] {
            let bundle = FeatureBundle::from_prepared(
                id,
                PathBuf::from("x.jpg"),
                PreprocessParams::default(),
                crate::testing::prepared_template(1),
            )
            .unwrap();
            warm.insert(Arc::new(bundle));
        }
        assert!(warm.get("a").is_none());
        assert!(warm.get("b").is_some());
        assert!(warm.get("c").is_some());
    }
}
