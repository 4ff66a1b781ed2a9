//! On-disk layout of the feature cache.
//!
//! Each identity owns two files in the cache directory:
//! - `<id>.safetensors`: every cycle element as a named tensor
//! - `<id>.json`: the human-readable [`BundleMetadata`] including the checksum
//!
//! Both are written under a temporary name and renamed into place, so a
//! failed build never leaves a visible entry behind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::{debug, warn};

use super::bundle::{BundleMetadata, FeatureBundle, RegionBox};
use crate::error::{Error, Result};

const BLOB_EXT: &str = "safetensors";
const META_EXT: &str = "json";

/// Filesystem access for bundle blobs and sidecars. All methods block.
#[derive(Debug, Clone)]
pub struct BundleStore {
    dir: PathBuf,
}

impl BundleStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{BLOB_EXT}"))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{META_EXT}"))
    }

    /// Both artifacts are present.
    pub fn exists(&self, id: &str) -> bool {
        self.blob_path(id).is_file() && self.metadata_path(id).is_file()
    }

    /// Persist a bundle, replacing any previous entry for its id.
    pub fn save(&self, bundle: &FeatureBundle) -> Result<()> {
        let id = bundle.id();
        let stamp = uuid::Uuid::new_v4().simple().to_string();
        let blob_tmp = self.dir.join(format!(".{id}.{stamp}.{BLOB_EXT}.tmp"));
        let meta_tmp = self.dir.join(format!(".{id}.{stamp}.{META_EXT}.tmp"));

        let staged = self
            .write_blob(bundle, &blob_tmp)
            .and_then(|_| write_metadata(&bundle.metadata, &meta_tmp));
        if let Err(e) = staged {
            remove_quietly(&blob_tmp);
            remove_quietly(&meta_tmp);
            return Err(e);
        }

        // The sidecar goes last: an entry is only complete once its metadata exists.
        let committed = fs::rename(&blob_tmp, self.blob_path(id))
            .and_then(|_| fs::rename(&meta_tmp, self.metadata_path(id)));
        if let Err(e) = committed {
            remove_quietly(&blob_tmp);
            remove_quietly(&meta_tmp);
            remove_quietly(&self.metadata_path(id));
            return Err(e.into());
        }

        debug!("Saved bundle {} ({} frames) to {:?}", id, bundle.len(), self.dir);
        Ok(())
    }

    fn write_blob(&self, bundle: &FeatureBundle, path: &Path) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (i, frame) in bundle.frame_cycle.iter().enumerate() {
            tensors.insert(format!("frame.{i}"), frame.clone());
        }
        for (i, feature) in bundle.reference_feature_cycle.iter().enumerate() {
            tensors.insert(format!("reference.{i}"), feature.clone());
        }
        for (i, mask) in bundle.mask_cycle.iter().enumerate() {
            tensors.insert(format!("mask.{i}"), mask.clone());
        }
        tensors.insert("regions".to_string(), boxes_to_tensor(&bundle.region_cycle)?);
        tensors.insert(
            "mask_regions".to_string(),
            boxes_to_tensor(&bundle.mask_region_cycle)?,
        );

        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load an entry. `Ok(None)` means one of the artifacts is missing;
    /// anything unreadable or inconsistent is reported as `Corrupt`.
    pub fn load(&self, id: &str) -> Result<Option<FeatureBundle>> {
        if !self.exists(id) {
            return Ok(None);
        }

        let metadata = self.read_metadata(id)?;
        if metadata.id != id {
            return Err(Error::Corrupt(format!(
                "{id}: sidecar belongs to '{}'",
                metadata.id
            )));
        }

        let mut tensors = candle_core::safetensors::load(self.blob_path(id), &Device::Cpu)
            .map_err(|e| Error::Corrupt(format!("{id}: unreadable blob: {e}")))?;

        let n = metadata.cycle_len;
        let mut take = |name: String| {
            tensors
                .remove(&name)
                .ok_or_else(|| Error::Corrupt(format!("{id}: blob is missing '{name}'")))
        };

        let frame_cycle = (0..n)
            .map(|i| take(format!("frame.{i}")))
            .collect::<Result<Vec<_>>>()?;
        let reference_feature_cycle = (0..n)
            .map(|i| take(format!("reference.{i}")))
            .collect::<Result<Vec<_>>>()?;
        let mask_cycle = (0..n)
            .map(|i| take(format!("mask.{i}")))
            .collect::<Result<Vec<_>>>()?;
        let region_cycle = tensor_to_boxes(id, &take("regions".to_string())?)?;
        let mask_region_cycle = tensor_to_boxes(id, &take("mask_regions".to_string())?)?;

        let bundle = FeatureBundle {
            metadata,
            frame_cycle,
            region_cycle,
            reference_feature_cycle,
            mask_cycle,
            mask_region_cycle,
        };
        bundle.check()?;
        Ok(Some(bundle))
    }

    pub fn read_metadata(&self, id: &str) -> Result<BundleMetadata> {
        let path = self.metadata_path(id);
        let raw = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{id}: no cache entry")),
            _ => Error::Io(e),
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Corrupt(format!("{id}: unreadable sidecar: {e}")))
    }

    /// Remove both artifacts. Returns whether anything was deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut removed = false;
        // Sidecar first so a half-deleted entry is already invisible.
        for path in [self.metadata_path(id), self.blob_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Metadata of every complete entry, sorted by id.
    pub fn list(&self) -> Result<Vec<BundleMetadata>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') || !self.blob_path(id).is_file() {
                continue;
            }
            match self.read_metadata(id) {
                Ok(metadata) => entries.push(metadata),
                Err(e) => warn!("Skipping cache entry {}: {}", id, e),
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

fn write_metadata(metadata: &BundleMetadata, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(path, json)?;
    Ok(())
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

fn boxes_to_tensor(boxes: &[RegionBox]) -> Result<Tensor> {
    let flat: Vec<i64> = boxes.iter().flat_map(|b| b.to_array()).collect();
    Ok(Tensor::from_vec(flat, (boxes.len(), 4), &Device::Cpu)?)
}

fn tensor_to_boxes(id: &str, tensor: &Tensor) -> Result<Vec<RegionBox>> {
    let rows = tensor
        .to_vec2::<i64>()
        .map_err(|e| Error::Corrupt(format!("{id}: malformed region table: {e}")))?;
    rows.iter()
        .map(|row| {
            RegionBox::from_slice(row)
                .ok_or_else(|| Error::Corrupt(format!("{id}: region row has {} values", row.len())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bundle::PreprocessParams;
    use crate::testing::prepared_template;

    fn sample_bundle(id: &str) -> FeatureBundle {
        FeatureBundle::from_prepared(
            id,
            PathBuf::from(format!("{id}.jpg")),
            PreprocessParams::default(),
            prepared_template(3),
        )
        .unwrap()
    }

    fn values(tensors: &[Tensor]) -> Vec<Vec<f32>> {
        tensors
            .iter()
            .map(|t| {
                t.to_dtype(candle_core::DType::F32)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        let original = sample_bundle("alice");

        store.save(&original).unwrap();
        let loaded = store.load("alice").unwrap().expect("entry should exist");

        assert!(loaded.validate());
        assert_eq!(loaded.metadata, original.metadata);
        assert_eq!(values(&loaded.frame_cycle), values(&original.frame_cycle));
        assert_eq!(
            values(&loaded.reference_feature_cycle),
            values(&original.reference_feature_cycle)
        );
        assert_eq!(values(&loaded.mask_cycle), values(&original.mask_cycle));
        assert_eq!(loaded.region_cycle, original.region_cycle);
        assert_eq!(loaded.mask_region_cycle, original.mask_region_cycle);
    }

    #[test]
    fn test_missing_sidecar_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        store.save(&sample_bundle("bob")).unwrap();

        fs::remove_file(store.metadata_path("bob")).unwrap();
        assert!(!store.exists("bob"));
        assert!(store.load("bob").unwrap().is_none());
    }

    #[test]
    fn test_tampered_checksum_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        let mut bundle = sample_bundle("carol");
        store.save(&bundle).unwrap();

        bundle.metadata.checksum = "0".repeat(64);
        write_metadata(&bundle.metadata, &store.metadata_path("carol")).unwrap();

        assert!(matches!(store.load("carol"), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        store.save(&sample_bundle("dave")).unwrap();

        fs::write(store.blob_path("dave"), b"not a safetensors file").unwrap();
        assert!(matches!(store.load("dave"), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_no_temp_files_left_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        store.save(&sample_bundle("erin")).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().to_path_buf()).unwrap();
        store.save(&sample_bundle("zed")).unwrap();
        store.save(&sample_bundle("amy")).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["amy", "zed"]);

        assert!(store.delete("amy").unwrap());
        assert!(!store.delete("amy").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
