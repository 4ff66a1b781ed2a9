//! Feature bundle: the per-identity data reused by every render job.

use std::path::PathBuf;

use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// On-disk format version. Entries written with another version are rebuilt.
pub const FORMAT_VERSION: u32 = 1;

/// Axis-aligned box in pixel coordinates, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl RegionBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i64 {
        self.y2 - self.y1
    }

    pub fn to_array(self) -> [i64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn from_slice(values: &[i64]) -> Option<Self> {
        match values {
            [x1, y1, x2, y2] => Some(Self::new(*x1, *y1, *x2, *y2)),
            _ => None,
        }
    }
}

/// Face-parsing strategy used when building blend masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParsingMode {
    /// Mask only the lower face, below the jaw line
    #[default]
    Jaw,
    /// Use the raw parsing output
    Raw,
}

/// Parameters that shape a bundle build. A cached entry built with other
/// parameters is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessParams {
    /// Vertical shift applied to the detected region
    #[serde(default)]
    pub bbox_shift: i32,

    #[serde(default)]
    pub parsing_mode: ParsingMode,

    /// Extra pixels kept around the generated region
    #[serde(default = "default_extra_margin")]
    pub extra_margin: u32,
}

fn default_extra_margin() -> u32 {
    10
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            bbox_shift: 0,
            parsing_mode: ParsingMode::default(),
            extra_margin: default_extra_margin(),
        }
    }
}

/// Sidecar record stored next to every bundle blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub id: String,
    pub source_image: PathBuf,
    pub params: PreprocessParams,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub cycle_len: usize,
    /// SHA-256 over every cycle element, hex encoded
    pub checksum: String,
}

/// Output of the template preprocessor: one entry per source frame, in
/// playback order. The cache turns it into a looping cycle.
#[derive(Debug, Clone)]
pub struct PreparedTemplate {
    pub frames: Vec<Tensor>,
    pub regions: Vec<RegionBox>,
    pub reference_features: Vec<Tensor>,
    pub masks: Vec<Tensor>,
    pub mask_regions: Vec<RegionBox>,
}

impl PreparedTemplate {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn check_lengths(&self) -> Result<()> {
        let n = self.len();
        if n == 0 {
            return Err(Error::Backend("Preprocessor returned no frames".to_string()));
        }
        if self.regions.len() != n
            || self.reference_features.len() != n
            || self.masks.len() != n
            || self.mask_regions.len() != n
        {
            return Err(Error::Backend(format!(
                "Preprocessor returned mismatched lengths: frames={}, regions={}, features={}, masks={}, mask_regions={}",
                n,
                self.regions.len(),
                self.reference_features.len(),
                self.masks.len(),
                self.mask_regions.len()
            )));
        }
        Ok(())
    }
}

/// Precomputed per-identity features.
///
/// All five cycles have the same even length; index `i` in every cycle
/// describes the same logical frame. Bundles are never mutated after they
/// are built.
#[derive(Debug, Clone)]
pub struct FeatureBundle {
    pub metadata: BundleMetadata,
    pub frame_cycle: Vec<Tensor>,
    pub region_cycle: Vec<RegionBox>,
    pub reference_feature_cycle: Vec<Tensor>,
    pub mask_cycle: Vec<Tensor>,
    pub mask_region_cycle: Vec<RegionBox>,
}

/// Append the reversed sequence so playback loops without a jump.
fn mirror<T: Clone>(forward: Vec<T>) -> Vec<T> {
    let mut cycle = forward.clone();
    cycle.extend(forward.into_iter().rev());
    cycle
}

impl FeatureBundle {
    /// Build a bundle from preprocessor output and stamp its checksum.
    pub fn from_prepared(
        id: &str,
        source_image: PathBuf,
        params: PreprocessParams,
        prepared: PreparedTemplate,
    ) -> Result<Self> {
        prepared.check_lengths()?;

        let mut bundle = Self {
            metadata: BundleMetadata {
                id: id.to_string(),
                source_image,
                params,
                created_at: Utc::now(),
                format_version: FORMAT_VERSION,
                cycle_len: prepared.len() * 2,
                checksum: String::new(),
            },
            frame_cycle: mirror(prepared.frames),
            region_cycle: mirror(prepared.regions),
            reference_feature_cycle: mirror(prepared.reference_features),
            mask_cycle: mirror(prepared.masks),
            mask_region_cycle: mirror(prepared.mask_regions),
        };
        bundle.metadata.checksum = bundle.content_checksum()?;
        Ok(bundle)
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn len(&self) -> usize {
        self.frame_cycle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_cycle.is_empty()
    }

    /// Cycle position for output frame `k`.
    pub fn cycle_index(&self, k: usize) -> usize {
        k % self.len().max(1)
    }

    pub fn frame(&self, k: usize) -> &Tensor {
        &self.frame_cycle[self.cycle_index(k)]
    }

    pub fn region(&self, k: usize) -> RegionBox {
        self.region_cycle[self.cycle_index(k)]
    }

    pub fn reference_feature(&self, k: usize) -> &Tensor {
        &self.reference_feature_cycle[self.cycle_index(k)]
    }

    pub fn mask(&self, k: usize) -> &Tensor {
        &self.mask_cycle[self.cycle_index(k)]
    }

    pub fn mask_region(&self, k: usize) -> RegionBox {
        self.mask_region_cycle[self.cycle_index(k)]
    }

    /// True when the bundle is structurally sound and its checksum matches.
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Same as [`validate`](Self::validate) but reports what is wrong.
    pub fn check(&self) -> Result<()> {
        let n = self.frame_cycle.len();
        if n < 2 || n % 2 != 0 {
            return Err(Error::Corrupt(format!(
                "{}: cycle length {} is not an even number >= 2",
                self.id(),
                n
            )));
        }
        let lengths = [
            self.region_cycle.len(),
            self.reference_feature_cycle.len(),
            self.mask_cycle.len(),
            self.mask_region_cycle.len(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(Error::Corrupt(format!(
                "{}: cycle lengths differ (frames={}, others={:?})",
                self.id(),
                n,
                lengths
            )));
        }
        if self.metadata.cycle_len != n {
            return Err(Error::Corrupt(format!(
                "{}: metadata records {} frames, bundle has {}",
                self.id(),
                self.metadata.cycle_len,
                n
            )));
        }
        if self.metadata.format_version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "{}: format version {} (expected {})",
                self.id(),
                self.metadata.format_version,
                FORMAT_VERSION
            )));
        }

        let actual = self.content_checksum().map_err(|e| {
            Error::Corrupt(format!("{}: failed to hash contents: {}", self.id(), e))
        })?;
        if actual != self.metadata.checksum {
            return Err(Error::Corrupt(format!(
                "{}: checksum mismatch (recorded {}, computed {})",
                self.id(),
                self.metadata.checksum,
                actual
            )));
        }
        Ok(())
    }

    /// SHA-256 over the shapes and contents of every cycle element.
    pub fn content_checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for (i, frame) in self.frame_cycle.iter().enumerate() {
            hash_tensor(&mut hasher, &format!("frame.{i}"), frame)?;
        }
        for (i, feature) in self.reference_feature_cycle.iter().enumerate() {
            hash_tensor(&mut hasher, &format!("reference.{i}"), feature)?;
        }
        for (i, mask) in self.mask_cycle.iter().enumerate() {
            hash_tensor(&mut hasher, &format!("mask.{i}"), mask)?;
        }
        for region in self.region_cycle.iter().chain(self.mask_region_cycle.iter()) {
            for value in region.to_array() {
                hasher.update(value.to_le_bytes());
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn hash_tensor(hasher: &mut Sha256, name: &str, tensor: &Tensor) -> Result<()> {
    hasher.update(name.as_bytes());
    hasher.update(format!("{:?}", tensor.dtype()).as_bytes());
    for dim in tensor.dims() {
        hasher.update((*dim as u64).to_le_bytes());
    }

    let flat = tensor.flatten_all()?;
    let bytes: Vec<u8> = match tensor.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::I64 => flat
            .to_vec1::<i64>()?
            .into_iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        _ => flat
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .into_iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
    };
    hasher.update(&bytes);
    Ok(())
}
