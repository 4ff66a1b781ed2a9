//! Runtime request/response types.
//!
//! Field names follow the wire protocol (camelCase), so the session layer
//! can embed these directly in its command enum.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::accelerator::AcceleratorSnapshot;
use crate::cache::{ParsingMode, PreprocessParams};
use crate::scheduler::StatsSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessRequest {
    pub template_id: String,
    pub template_image_path: PathBuf,
    #[serde(default)]
    pub bbox_shift: i32,
    #[serde(default)]
    pub parsing_mode: ParsingMode,
    /// Pixels kept around the generated region; defaults to 10
    #[serde(default)]
    pub extra_margin: Option<u32>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl PreprocessRequest {
    pub fn params(&self) -> PreprocessParams {
        let defaults = PreprocessParams::default();
        PreprocessParams {
            bbox_shift: self.bbox_shift,
            parsing_mode: self.parsing_mode,
            extra_margin: self.extra_margin.unwrap_or(defaults.extra_margin),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub template_id: String,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub template_id: String,
    pub audio_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub abort_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRequest {
    pub template_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub message: String,
    /// Unix time in seconds
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessResult {
    pub template_id: String,
    pub message: String,
    pub cycle_len: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub output_path: PathBuf,
    pub frames: usize,
    pub failed_frames: usize,
    pub batch_size: usize,
    pub elapsed_secs: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub model_loaded: bool,
    pub accelerator_count: usize,
    pub in_flight_jobs: usize,
    pub cached_templates: usize,
    pub shutting_down: bool,
    pub accelerators: Vec<AcceleratorSnapshot>,
    pub scheduler: StatsSnapshot,
}
