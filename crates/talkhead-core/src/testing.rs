//! Deterministic collaborators for tests.
//!
//! Compiled for this crate's unit tests and, behind the `test-support`
//! feature, for downstream integration tests.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use candle_core::{Device, Tensor};

use crate::backends::{
    Collaborators, FeatureExtractor, MediaWriter, RenderBackend, Replica, ReplicaLoader,
    TemplatePreprocessor, WriteRequest,
};
use crate::backends::{Compositor, PasteCompositor};
use crate::cache::{PreparedTemplate, PreprocessParams, RegionBox};
use crate::error::{Error, Result};

/// Side length of the square frames produced by [`prepared_template`].
pub const FRAME_SIZE: usize = 8;
/// Side length of rendered regions.
pub const REGION_SIZE: usize = 4;
/// Width of conditioning and reference feature vectors.
pub const FEATURE_DIM: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A template with `frames` distinct frames. Frame `i` and its reference
/// feature are filled with `i`, and its region is offset by `i % 4`.
pub fn prepared_template(frames: usize) -> PreparedTemplate {
    let device = Device::Cpu;
    let mut template = PreparedTemplate {
        frames: Vec::with_capacity(frames),
        regions: Vec::with_capacity(frames),
        reference_features: Vec::with_capacity(frames),
        masks: Vec::with_capacity(frames),
        mask_regions: Vec::with_capacity(frames),
    };
    for i in 0..frames {
        let value = i as f32;
        let offset = (i % 4) as i64;
        let region = RegionBox::new(
            offset,
            offset,
            offset + REGION_SIZE as i64,
            offset + REGION_SIZE as i64,
        );
        template.frames.push(
            Tensor::full(value, (FRAME_SIZE, FRAME_SIZE, 3), &device)
                .unwrap_or_else(|e| panic!("frame tensor: {e}")),
        );
        template.reference_features.push(
            Tensor::full(value, FEATURE_DIM, &device)
                .unwrap_or_else(|e| panic!("feature tensor: {e}")),
        );
        template.masks.push(
            Tensor::full(255u8, (REGION_SIZE, REGION_SIZE), &device)
                .unwrap_or_else(|e| panic!("mask tensor: {e}")),
        );
        template.regions.push(region);
        template.mask_regions.push(region);
    }
    template
}

/// First element of a tensor as `f32`; handy for checking frame order.
pub fn first_value(tensor: &Tensor) -> f32 {
    tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map(|values| values.first().copied().unwrap_or(f32::NAN))
        .unwrap_or(f32::NAN)
}

/// Counts builds and optionally sleeps to widen race windows.
pub struct CountingPreprocessor {
    frames: usize,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingPreprocessor {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TemplatePreprocessor for CountingPreprocessor {
    fn prepare(&self, _image_path: &Path, _params: &PreprocessParams) -> Result<PreparedTemplate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(prepared_template(self.frames))
    }
}

/// When the stub backend reports out-of-memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OomMode {
    #[default]
    Never,
    Always,
    /// Batches larger than this fail
    AboveBatch(usize),
}

#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub oom: OomMode,
    /// Every call fails with a non-memory error
    pub fail: bool,
    /// Batches with a row whose first conditioning value equals this fail
    pub fail_containing: Option<f32>,
    pub delay: Duration,
    /// Add a few milliseconds derived from the batch contents to `delay`
    pub jitter: bool,
    pub free_memory: u64,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            oom: OomMode::Never,
            fail: false,
            fail_containing: None,
            delay: Duration::ZERO,
            jitter: false,
            free_memory: 8 * 1024 * 1024 * 1024,
        }
    }
}

/// Renders a `REGION_SIZE`² region filled with the first value of each
/// conditioning row.
pub struct StubBackend {
    accelerator: usize,
    behavior: StubBehavior,
    calls: AtomicUsize,
    clears: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    released: AtomicBool,
    batch_sizes: Mutex<Vec<usize>>,
}

impl StubBackend {
    pub fn new(accelerator: usize, behavior: StubBehavior) -> Self {
        Self {
            accelerator,
            behavior,
            calls: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `render` calls seen.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.batch_sizes).clone()
    }

    fn render_rows(&self, conditioning: &Tensor, batch: usize) -> Result<Vec<Tensor>> {
        let oom = match self.behavior.oom {
            OomMode::Never => false,
            OomMode::Always => true,
            OomMode::AboveBatch(limit) => batch > limit,
        };
        if oom {
            return Err(Error::OutOfMemory {
                accelerator: self.accelerator,
                message: format!("stub refused a batch of {batch}"),
            });
        }
        if self.behavior.fail {
            return Err(Error::Backend("stub backend failure".to_string()));
        }

        let firsts = conditioning
            .narrow(1, 0, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        if let Some(value) = self.behavior.fail_containing {
            if firsts.contains(&value) {
                return Err(Error::Backend(format!("stub refused a batch with {value}")));
            }
        }

        let mut delay = self.behavior.delay;
        if self.behavior.jitter {
            let seed = firsts.first().copied().unwrap_or(0.0) as u64;
            delay += Duration::from_millis((seed * 7) % 5);
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        firsts
            .into_iter()
            .map(|value| {
                Tensor::full(value, (REGION_SIZE, REGION_SIZE, 3), conditioning.device())
                    .map_err(Error::from)
            })
            .collect()
    }
}

impl RenderBackend for StubBackend {
    fn render(&self, conditioning: &Tensor, reference: &Tensor) -> Result<Vec<Tensor>> {
        let batch = conditioning.dim(0)?;
        if reference.dim(0)? != batch {
            return Err(Error::Backend(format!(
                "conditioning has {} rows, reference has {}",
                batch,
                reference.dim(0)?
            )));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.batch_sizes).push(batch);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let result = self.render_rows(conditioning, batch);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn free_memory(&self) -> u64 {
        self.behavior.free_memory
    }

    fn clear_transient(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Loads a [`StubBackend`] per accelerator and keeps a handle to each.
pub struct StubLoader {
    behavior: StubBehavior,
    fail_ids: HashSet<usize>,
    load_delay: Duration,
    backends: Mutex<BTreeMap<usize, Arc<StubBackend>>>,
    loading: AtomicUsize,
    max_loading: AtomicUsize,
}

impl StubLoader {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            fail_ids: HashSet::new(),
            load_delay: Duration::ZERO,
            backends: Mutex::new(BTreeMap::new()),
            loading: AtomicUsize::new(0),
            max_loading: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, ids: impl IntoIterator<Item = usize>) -> Self {
        self.fail_ids.extend(ids);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn backend(&self, accelerator: usize) -> Option<Arc<StubBackend>> {
        lock(&self.backends).get(&accelerator).cloned()
    }

    /// Highest number of overlapping `load` calls seen.
    pub fn max_concurrent_loads(&self) -> usize {
        self.max_loading.load(Ordering::SeqCst)
    }
}

impl ReplicaLoader for StubLoader {
    fn load(&self, accelerator: usize) -> Result<Replica> {
        let loading = self.loading.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_loading.fetch_max(loading, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.loading.fetch_sub(1, Ordering::SeqCst);

        if self.fail_ids.contains(&accelerator) {
            return Err(Error::AcceleratorUnavailable(format!(
                "stub accelerator {accelerator} refused to load"
            )));
        }
        let backend = Arc::new(StubBackend::new(accelerator, self.behavior.clone()));
        lock(&self.backends).insert(accelerator, backend.clone());
        Ok(Replica {
            device: Device::Cpu,
            backend,
        })
    }
}

/// Returns `frames` conditioning features; feature `i` is filled with `i`.
pub struct StubExtractor {
    frames: usize,
}

impl StubExtractor {
    pub fn new(frames: usize) -> Self {
        Self { frames }
    }
}

impl FeatureExtractor for StubExtractor {
    fn extract(&self, _audio_path: &Path, _fps: u32) -> Result<Vec<Tensor>> {
        (0..self.frames)
            .map(|i| Tensor::full(i as f32, FEATURE_DIM, &Device::Cpu).map_err(Error::from))
            .collect()
    }
}

/// Returns the rendered region itself so tests can read frame order back.
pub struct PassthroughCompositor;

impl Compositor for PassthroughCompositor {
    fn blend(
        &self,
        _frame: &Tensor,
        region: &Tensor,
        _region_box: RegionBox,
        _mask: &Tensor,
        _mask_box: RegionBox,
    ) -> Result<Tensor> {
        Ok(region.clone())
    }
}

/// One clip handed to [`MemoryWriter`].
#[derive(Debug, Clone)]
pub struct WrittenClip {
    pub frames: Vec<Tensor>,
    pub audio_path: PathBuf,
    pub audio_offset_secs: f32,
    pub fps: u32,
    pub output_path: PathBuf,
}

/// Keeps every written clip in memory.
#[derive(Default)]
pub struct MemoryWriter {
    clips: Mutex<Vec<WrittenClip>>,
}

impl MemoryWriter {
    pub fn clips(&self) -> Vec<WrittenClip> {
        lock(&self.clips).clone()
    }
}

impl MediaWriter for MemoryWriter {
    fn write(&self, request: WriteRequest<'_>) -> Result<PathBuf> {
        lock(&self.clips).push(WrittenClip {
            frames: request.frames.to_vec(),
            audio_path: request.audio_path.to_path_buf(),
            audio_offset_secs: request.audio_offset_secs,
            fps: request.fps,
            output_path: request.output_path.to_path_buf(),
        });
        Ok(request.output_path.to_path_buf())
    }
}

/// Stub collaborators plus handles for inspecting them.
pub struct TestRig {
    pub preprocessor: Arc<CountingPreprocessor>,
    pub loader: Arc<StubLoader>,
    pub extractor: Arc<StubExtractor>,
    pub writer: Arc<MemoryWriter>,
    /// Blend for real instead of passing regions through
    pub paste: bool,
}

impl TestRig {
    /// `audio_frames` conditioning features per extracted clip.
    pub fn new(audio_frames: usize) -> Self {
        Self::with_behavior(audio_frames, StubBehavior::default())
    }

    pub fn with_behavior(audio_frames: usize, behavior: StubBehavior) -> Self {
        Self {
            preprocessor: Arc::new(CountingPreprocessor::new(3)),
            loader: Arc::new(StubLoader::new(behavior)),
            extractor: Arc::new(StubExtractor::new(audio_frames)),
            writer: Arc::new(MemoryWriter::default()),
            paste: false,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let compositor: Arc<dyn Compositor> = if self.paste {
            Arc::new(PasteCompositor)
        } else {
            Arc::new(PassthroughCompositor)
        };
        Collaborators {
            loader: self.loader.clone(),
            preprocessor: self.preprocessor.clone(),
            extractor: self.extractor.clone(),
            compositor,
            writer: self.writer.clone(),
        }
    }
}
