//! Reconstruction of skipped frames from rendered neighbours.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Produces an in-between region from the two nearest rendered regions.
///
/// `t` is the position between `before` (0.0) and `after` (1.0). An
/// optical-flow implementation plugs in here.
pub trait Interpolator: Send + Sync {
    fn interpolate(&self, before: &Tensor, after: &Tensor, t: f32) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearInterpolator;

impl Interpolator for LinearInterpolator {
    fn interpolate(&self, before: &Tensor, after: &Tensor, t: f32) -> Result<Tensor> {
        let t = t.clamp(0.0, 1.0) as f64;
        let a = before.to_dtype(DType::F32)?.affine(1.0 - t, 0.0)?;
        let b = after.to_dtype(DType::F32)?.affine(t, 0.0)?;
        Ok((a + b)?.to_dtype(before.dtype())?)
    }
}

/// Fill `0..total` from the rendered positions.
///
/// Gaps between two rendered frames are interpolated, gaps at either end
/// repeat the nearest rendered frame, and positions with no rendered frame
/// at all stay `None`. The result always has exactly `total` entries.
pub fn reconstruct_frames(
    total: usize,
    rendered: &BTreeMap<usize, Tensor>,
    interpolator: &dyn Interpolator,
) -> Result<Vec<Option<Tensor>>> {
    let mut frames = Vec::with_capacity(total);
    for k in 0..total {
        if let Some(frame) = rendered.get(&k) {
            frames.push(Some(frame.clone()));
            continue;
        }
        let before = rendered.range(..k).next_back();
        let after = rendered.range(k + 1..).next();
        let frame = match (before, after) {
            (Some((&p, a)), Some((&n, b))) => {
                let t = (k - p) as f32 / (n - p) as f32;
                Some(interpolator.interpolate(a, b, t)?)
            }
            (Some((_, only)), None) | (None, Some((_, only))) => Some(only.clone()),
            (None, None) => None,
        };
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::plan::keyframe_indices;
    use crate::testing::first_value;
    use candle_core::Device;

    fn rendered_at(keys: &[usize]) -> BTreeMap<usize, Tensor> {
        keys.iter()
            .map(|&k| (k, Tensor::full(k as f32, (2, 2), &Device::Cpu).unwrap()))
            .collect()
    }

    #[test]
    fn test_reconstruction_always_returns_every_frame() {
        for total in [1usize, 2, 7, 24, 25, 50] {
            for skip in 1..=6 {
                let keys = keyframe_indices(total, skip);
                let frames =
                    reconstruct_frames(total, &rendered_at(&keys), &LinearInterpolator).unwrap();
                assert_eq!(frames.len(), total, "total {total} skip {skip}");
                assert!(frames.iter().all(Option::is_some));
            }
        }
    }

    #[test]
    fn test_linear_midpoint() {
        let frames = reconstruct_frames(5, &rendered_at(&[0, 4]), &LinearInterpolator).unwrap();
        let values: Vec<f32> = frames.iter().map(|f| first_value(f.as_ref().unwrap())).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_edges_hold_and_empty_stays_empty() {
        let frames = reconstruct_frames(4, &rendered_at(&[1]), &LinearInterpolator).unwrap();
        assert!(frames.iter().all(|f| first_value(f.as_ref().unwrap()) == 1.0));

        let frames = reconstruct_frames(3, &BTreeMap::new(), &LinearInterpolator).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(Option::is_none));
    }
}
