//! Mask-weighted paste of a rendered region into its reference frame.

use std::ops::Range;

use candle_core::{DType, Tensor};

use super::Compositor;
use crate::cache::RegionBox;
use crate::error::{Error, Result};

/// Pastes the region at its box, then blends the pasted frame over the
/// original inside the mask box using the mask as alpha (`0..=255`).
///
/// Frames and regions are `[H, W, C]`, masks are `[H, W]` and must match
/// their boxes exactly; resizing is the preprocessor's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasteCompositor;

impl Compositor for PasteCompositor {
    fn blend(
        &self,
        frame: &Tensor,
        region: &Tensor,
        region_box: RegionBox,
        mask: &Tensor,
        mask_box: RegionBox,
    ) -> Result<Tensor> {
        let (height, width, channels) = frame.dims3()?;
        let (rows, cols) = box_ranges(region_box, height, width)?;
        let (mask_rows, mask_cols) = box_ranges(mask_box, height, width)?;

        let expected = [rows.len(), cols.len(), channels];
        if region.dims() != expected {
            return Err(Error::InvalidInput(format!(
                "region shape {:?} does not fit box {:?}",
                region.dims(),
                expected
            )));
        }
        if mask.dims() != [mask_rows.len(), mask_cols.len()] {
            return Err(Error::InvalidInput(format!(
                "mask shape {:?} does not fit box {}x{}",
                mask.dims(),
                mask_rows.len(),
                mask_cols.len()
            )));
        }

        let original = frame.to_dtype(DType::F32)?;
        let pasted = original.slice_assign(
            &[rows, cols, 0..channels],
            &region.to_dtype(DType::F32)?,
        )?;

        let window = |t: &Tensor| -> Result<Tensor> {
            Ok(t
                .narrow(0, mask_rows.start, mask_rows.len())?
                .narrow(1, mask_cols.start, mask_cols.len())?)
        };
        let alpha = mask
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(2)?
            .broadcast_as((mask_rows.len(), mask_cols.len(), channels))?
            .contiguous()?;
        let inverse = alpha.affine(-1.0, 1.0)?;
        let blended = ((window(&pasted)? * &alpha)? + (window(&original)? * &inverse)?)?;

        let composed = original.slice_assign(&[mask_rows, mask_cols, 0..channels], &blended)?;
        Ok(composed.to_dtype(frame.dtype())?)
    }
}

fn box_ranges(region: RegionBox, height: usize, width: usize) -> Result<(Range<usize>, Range<usize>)> {
    let inside = region.x1 >= 0
        && region.y1 >= 0
        && region.x1 < region.x2
        && region.y1 < region.y2
        && region.x2 as usize <= width
        && region.y2 as usize <= height;
    if !inside {
        return Err(Error::InvalidInput(format!(
            "box {:?} is outside a {}x{} frame",
            region.to_array(),
            width,
            height
        )));
    }
    Ok((
        region.y1 as usize..region.y2 as usize,
        region.x1 as usize..region.x2 as usize,
    ))
}
