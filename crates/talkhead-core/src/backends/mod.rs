//! Boundaries to the external collaborators.
//!
//! The serving core never looks inside the generative model, the audio
//! feature extractor, the compositor or the media encoder. It talks to them
//! through the traits below. All methods block; the core calls them from
//! `spawn_blocking` tasks.

mod compositor;
mod dry_run;

pub use compositor::PasteCompositor;
pub use dry_run::{DryRunExtractor, DryRunLoader, DryRunPreprocessor, DryRunWriter};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::cache::{PreparedTemplate, PreprocessParams, RegionBox};
use crate::error::Result;

/// One model replica resident on one accelerator.
pub trait RenderBackend: Send + Sync {
    /// Render one region per row of `conditioning`/`reference`.
    ///
    /// Both inputs are already on the replica's device and share their first
    /// dimension. Implementations return exactly one region per row, in row
    /// order, and signal memory exhaustion with
    /// [`Error::OutOfMemory`](crate::Error::OutOfMemory).
    fn render(&self, conditioning: &Tensor, reference: &Tensor) -> Result<Vec<Tensor>>;

    /// Best-effort estimate of free accelerator memory in bytes.
    fn free_memory(&self) -> u64;

    /// Drop cached allocations after an out-of-memory failure.
    fn clear_transient(&self) -> Result<()> {
        Ok(())
    }

    /// Release the replica's accelerator resources at shutdown.
    fn release(&self) {}
}

/// A loaded replica and the device its inputs must live on.
#[derive(Clone)]
pub struct Replica {
    pub device: Device,
    pub backend: Arc<dyn RenderBackend>,
}

/// Loads one model replica for an accelerator ordinal.
pub trait ReplicaLoader: Send + Sync {
    fn load(&self, accelerator: usize) -> Result<Replica>;
}

/// Turns an audio clip into per-frame conditioning features.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, audio_path: &Path, fps: u32) -> Result<Vec<Tensor>>;
}

/// Region detection, masking and reference feature extraction for a
/// template image.
pub trait TemplatePreprocessor: Send + Sync {
    fn prepare(&self, image_path: &Path, params: &PreprocessParams) -> Result<PreparedTemplate>;
}

/// Blends a rendered region back into a full reference frame.
pub trait Compositor: Send + Sync {
    fn blend(
        &self,
        frame: &Tensor,
        region: &Tensor,
        region_box: RegionBox,
        mask: &Tensor,
        mask_box: RegionBox,
    ) -> Result<Tensor>;
}

/// Everything the media writer needs to produce one output file.
pub struct WriteRequest<'a> {
    pub frames: &'a [Tensor],
    pub audio_path: &'a Path,
    /// Offset of the first frame into the audio clip, in seconds
    pub audio_offset_secs: f32,
    pub fps: u32,
    pub output_path: &'a Path,
}

/// Muxes frames and audio into a container.
pub trait MediaWriter: Send + Sync {
    fn write(&self, request: WriteRequest<'_>) -> Result<PathBuf>;
}

/// The full set of collaborators a [`RenderService`](crate::RenderService)
/// is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn ReplicaLoader>,
    pub preprocessor: Arc<dyn TemplatePreprocessor>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub compositor: Arc<dyn Compositor>,
    pub writer: Arc<dyn MediaWriter>,
}

impl Collaborators {
    /// Collaborators that exercise the service without a model: regions are
    /// blank, features are derived from the audio length only, and outputs
    /// are JSON manifests.
    pub fn dry_run() -> Self {
        Self {
            loader: Arc::new(DryRunLoader::default()),
            preprocessor: Arc::new(DryRunPreprocessor::default()),
            extractor: Arc::new(DryRunExtractor::default()),
            compositor: Arc::new(PasteCompositor),
            writer: Arc::new(DryRunWriter),
        }
    }
}
