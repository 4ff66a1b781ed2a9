//! Blocking execution of one batch on an acquired accelerator.

use candle_core::{Device, Tensor};
use tracing::{debug, warn};

use super::{FrameOutcome, FrameResult, WorkItem};
use crate::accelerator::AcceleratorGuard;
use crate::cache::FeatureBundle;
use crate::error::{Error, Result};

pub(super) struct BatchOutcome {
    pub results: Vec<FrameResult>,
    pub oom_retries: usize,
}

/// Render `items` in slices, halving the slice after each out-of-memory
/// failure until `retry_limit` retries are spent. Items that cannot be
/// rendered come back as [`FrameOutcome::Failed`].
pub(super) fn execute_batch(
    guard: AcceleratorGuard,
    bundle: &FeatureBundle,
    items: Vec<WorkItem>,
    retry_limit: usize,
) -> BatchOutcome {
    let accelerator = guard.id();
    let mut results = Vec::with_capacity(items.len());
    let mut size = items.len().max(1);
    let mut oom_retries = 0;
    let mut offset = 0;

    while offset < items.len() {
        let end = (offset + size).min(items.len());
        let slice = &items[offset..end];

        match render_slice(&guard, bundle, slice) {
            Ok(regions) => {
                for (item, region) in slice.iter().zip(regions) {
                    results.push(FrameResult::new(item, Some(accelerator), FrameOutcome::Rendered(region)));
                }
                offset = end;
            }
            Err(e) if e.is_out_of_memory() => {
                if oom_retries >= retry_limit {
                    warn!(
                        "Accelerator {} still out of memory after {} retries; failing {} item(s)",
                        accelerator,
                        oom_retries,
                        items.len() - offset
                    );
                    let reason = e.to_string();
                    for item in &items[offset..] {
                        results.push(FrameResult::new(
                            item,
                            Some(accelerator),
                            FrameOutcome::Failed(reason.clone()),
                        ));
                    }
                    break;
                }
                oom_retries += 1;
                if let Err(clear_err) = guard.backend().clear_transient() {
                    warn!("Failed to clear accelerator {} memory: {}", accelerator, clear_err);
                }
                let halved = (size / 2).max(1);
                warn!(
                    "Out of memory on accelerator {} with {} item(s); retrying with {}",
                    accelerator,
                    slice.len(),
                    halved
                );
                size = halved;
            }
            Err(e) => {
                warn!(
                    "Batch slice of {} item(s) failed on accelerator {}: {}",
                    slice.len(),
                    accelerator,
                    e
                );
                let reason = e.to_string();
                for item in slice {
                    results.push(FrameResult::new(
                        item,
                        Some(accelerator),
                        FrameOutcome::Failed(reason.clone()),
                    ));
                }
                offset = end;
            }
        }
    }

    BatchOutcome {
        results,
        oom_retries,
    }
}

/// Move one slice's inputs to the device, render, and copy the regions back.
fn render_slice(guard: &AcceleratorGuard, bundle: &FeatureBundle, items: &[WorkItem]) -> Result<Vec<Tensor>> {
    let device = guard.device();
    let conditioning: Vec<&Tensor> = items.iter().map(|item| &item.conditioning).collect();
    let reference: Vec<&Tensor> = items
        .iter()
        .map(|item| bundle.reference_feature(item.cycle_index))
        .collect();

    let conditioning = Tensor::stack(&conditioning, 0)?.to_device(device)?;
    let reference = Tensor::stack(&reference, 0)?.to_device(device)?;

    let regions = guard.backend().render(&conditioning, &reference)?;
    if regions.len() != items.len() {
        return Err(Error::Backend(format!(
            "backend returned {} regions for {} inputs",
            regions.len(),
            items.len()
        )));
    }
    debug!("Accelerator {} rendered {} frame(s)", guard.id(), items.len());

    regions
        .into_iter()
        .map(|region| region.to_device(&Device::Cpu).map_err(Error::from))
        .collect()
}
