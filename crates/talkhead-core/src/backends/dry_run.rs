//! Model-free collaborators that let the service run end to end.
//!
//! Frames are blank, rendered regions are filled with the audio energy of
//! their frame, and the writer emits a JSON manifest instead of a video.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use serde::Serialize;

use super::{FeatureExtractor, MediaWriter, RenderBackend, Replica, ReplicaLoader, TemplatePreprocessor, WriteRequest};
use crate::audio;
use crate::cache::{PreparedTemplate, PreprocessParams, RegionBox};
use crate::error::{Error, Result};

const FRAME_SIZE: usize = 64;
const REGION_SIZE: usize = 32;
const FEATURE_DIM: usize = 16;

#[derive(Debug, Clone)]
pub struct DryRunPreprocessor {
    pub frames: usize,
}

impl Default for DryRunPreprocessor {
    fn default() -> Self {
        Self { frames: 4 }
    }
}

impl TemplatePreprocessor for DryRunPreprocessor {
    fn prepare(&self, image_path: &Path, params: &PreprocessParams) -> Result<PreparedTemplate> {
        std::fs::metadata(image_path).map_err(|_| {
            Error::NotFound(format!("Template image not found: {}", image_path.display()))
        })?;

        let device = Device::Cpu;
        let shift = params.bbox_shift.clamp(-8, 8) as i64;
        let top = (FRAME_SIZE - REGION_SIZE) as i64 / 2 + shift;
        let left = (FRAME_SIZE - REGION_SIZE) as i64 / 2;
        let region = RegionBox::new(left, top, left + REGION_SIZE as i64, top + REGION_SIZE as i64);

        let frames = self.frames.max(1);
        let mut template = PreparedTemplate {
            frames: Vec::with_capacity(frames),
            regions: vec![region; frames],
            reference_features: Vec::with_capacity(frames),
            masks: Vec::with_capacity(frames),
            mask_regions: vec![region; frames],
        };
        for i in 0..frames {
            template
                .frames
                .push(Tensor::zeros((FRAME_SIZE, FRAME_SIZE, 3), DType::U8, &device)?);
            template
                .reference_features
                .push(Tensor::full(i as f32, FEATURE_DIM, &device)?);
            template
                .masks
                .push(Tensor::full(255u8, (REGION_SIZE, REGION_SIZE), &device)?);
        }
        Ok(template)
    }
}

/// One feature per video frame, filled with that frame's RMS energy.
#[derive(Debug, Clone, Default)]
pub struct DryRunExtractor;

impl FeatureExtractor for DryRunExtractor {
    fn extract(&self, audio_path: &Path, fps: u32) -> Result<Vec<Tensor>> {
        let waveform = audio::read_wav(audio_path)?;
        audio::frame_energy(&waveform, fps)
            .into_iter()
            .map(|energy| Ok(Tensor::full(energy, FEATURE_DIM, &Device::Cpu)?))
            .collect()
    }
}

pub struct DryRunBackend {
    device: Device,
    free_memory: u64,
}

impl RenderBackend for DryRunBackend {
    fn render(&self, conditioning: &Tensor, _reference: &Tensor) -> Result<Vec<Tensor>> {
        let levels = conditioning.mean(1)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        levels
            .into_iter()
            .map(|level| {
                let value = (level.clamp(0.0, 1.0) * 255.0) as u8;
                Ok(Tensor::full(value, (REGION_SIZE, REGION_SIZE, 3), &self.device)?)
            })
            .collect()
    }

    fn free_memory(&self) -> u64 {
        self.free_memory
    }
}

#[derive(Debug, Clone)]
pub struct DryRunLoader {
    pub free_memory: u64,
}

impl Default for DryRunLoader {
    fn default() -> Self {
        Self {
            free_memory: 16 * 1024 * 1024 * 1024,
        }
    }
}

impl ReplicaLoader for DryRunLoader {
    fn load(&self, _accelerator: usize) -> Result<Replica> {
        let device = Device::Cpu;
        Ok(Replica {
            device: device.clone(),
            backend: Arc::new(DryRunBackend {
                device,
                free_memory: self.free_memory,
            }),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    frames: usize,
    frame_shape: Vec<usize>,
    fps: u32,
    audio_path: &'a Path,
    audio_offset_secs: f32,
}

/// Writes a JSON manifest describing the clip to `output_path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunWriter;

impl MediaWriter for DryRunWriter {
    fn write(&self, request: WriteRequest<'_>) -> Result<PathBuf> {
        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manifest = Manifest {
            frames: request.frames.len(),
            frame_shape: request
                .frames
                .first()
                .map(|f| f.dims().to_vec())
                .unwrap_or_default(),
            fps: request.fps,
            audio_path: request.audio_path,
            audio_offset_secs: request.audio_offset_secs,
        };
        std::fs::write(request.output_path, serde_json::to_vec_pretty(&manifest)?)?;
        Ok(request.output_path.to_path_buf())
    }
}
