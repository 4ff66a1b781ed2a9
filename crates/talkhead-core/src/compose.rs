//! Turning rendered regions into full frames.

use candle_core::Tensor;
use tracing::warn;

use crate::backends::Compositor;
use crate::cache::FeatureBundle;
use crate::error::Result;
use crate::scheduler::FrameResult;

#[derive(Debug, Clone)]
pub struct ComposedClip {
    pub frames: Vec<Tensor>,
    /// Frames that fell back to the untouched reference frame
    pub failed: usize,
}

/// Rendered regions of a scheduler run, by position.
pub fn regions_from_results(results: &[FrameResult]) -> Vec<Option<Tensor>> {
    results.iter().map(|r| r.region().cloned()).collect()
}

/// Blend `regions[i]` into the reference frame for output frame
/// `start_frame + i`. Missing regions and blend errors produce the reference
/// frame itself, so the clip always has one frame per region slot.
pub fn compose_frames(
    compositor: &dyn Compositor,
    bundle: &FeatureBundle,
    start_frame: usize,
    regions: Vec<Option<Tensor>>,
) -> Result<ComposedClip> {
    let mut frames = Vec::with_capacity(regions.len());
    let mut failed = 0;

    for (offset, region) in regions.into_iter().enumerate() {
        let k = start_frame + offset;
        let reference = bundle.frame(k);
        let frame = match region {
            Some(region) => match compositor.blend(
                reference,
                &region,
                bundle.region(k),
                bundle.mask(k),
                bundle.mask_region(k),
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Compositing frame {} failed: {}", k, e);
                    failed += 1;
                    reference.clone()
                }
            },
            None => {
                failed += 1;
                reference.clone()
            }
        };
        frames.push(frame);
    }

    Ok(ComposedClip { frames, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PreprocessParams;
    use crate::testing::{first_value, prepared_template, PassthroughCompositor};
    use candle_core::Device;
    use std::path::PathBuf;

    #[test]
    fn test_missing_regions_fall_back_to_reference_frame() {
        let bundle = FeatureBundle::from_prepared(
            "alice",
            PathBuf::from("alice.jpg"),
            PreprocessParams::default(),
            prepared_template(2),
        )
        .unwrap();
        let region = Tensor::full(9f32, (4, 4, 3), &Device::Cpu).unwrap();
        let regions = vec![Some(region.clone()), None, Some(region), None];

        let clip = compose_frames(&PassthroughCompositor, &bundle, 1, regions).unwrap();
        assert_eq!(clip.frames.len(), 4);
        assert_eq!(clip.failed, 2);
        assert_eq!(first_value(&clip.frames[0]), 9.0);
        // Output frame 2 maps to cycle position 2, the reversed copy of frame 1.
        assert_eq!(first_value(&clip.frames[1]), 1.0);
        assert_eq!(clip.frames[1].dims(), &[8, 8, 3]);
    }
}
