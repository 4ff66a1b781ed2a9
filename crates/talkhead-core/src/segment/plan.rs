//! Segment boundaries and per-segment quality tiers.
//!
//! Everything here works in video frames; durations from the config are
//! converted with the job's frame rate.

use std::ops::Range;

use serde::Serialize;

use crate::config::SegmentConfig;

/// How a segment is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Tier {
    /// Every frame, in small batches
    Full { batch_size: usize },
    /// Every `factor`-th frame; the rest are interpolated
    Skip { factor: usize },
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Full { .. } => "full",
            Tier::Skip { .. } => "skip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPlan {
    pub index: usize,
    pub start_frame: usize,
    pub frame_count: usize,
    pub tier: Tier,
}

impl SegmentPlan {
    pub fn frames(&self) -> Range<usize> {
        self.start_frame..self.start_frame + self.frame_count
    }
}

struct FrameBounds {
    target: usize,
    min: usize,
    max: usize,
}

impl FrameBounds {
    fn new(config: &SegmentConfig, fps: u32) -> Self {
        let fps = fps.max(1) as f32;
        let max = ((config.max_secs * fps).floor() as usize).max(1);
        let min = ((config.min_secs * fps).ceil() as usize).clamp(1, max);
        let target = ((config.target_secs * fps).round() as usize).clamp(min, max);
        Self { target, min, max }
    }
}

/// Cut every `target` frames. A tail shorter than the minimum joins the
/// previous segment when the result stays within the maximum.
pub fn fixed_cuts(total_frames: usize, fps: u32, config: &SegmentConfig) -> Vec<Range<usize>> {
    let bounds = FrameBounds::new(config, fps);
    let mut cuts = Vec::new();
    let mut start = 0;
    while start < total_frames {
        let end = (start + bounds.target).min(total_frames);
        cuts.push(start..end);
        start = end;
    }
    merge_short_tail(&mut cuts, &bounds);
    cuts
}

/// Cut at the quietest frame between `min` and `max` frames after each
/// segment start. Ties go to the frame closest to the target length.
pub fn activity_cuts(energy: &[f32], fps: u32, config: &SegmentConfig) -> Vec<Range<usize>> {
    let bounds = FrameBounds::new(config, fps);
    let total = energy.len();
    let mut cuts = Vec::new();
    let mut start = 0;

    while start < total {
        if total - start <= bounds.max {
            cuts.push(start..total);
            break;
        }
        let window = (start + bounds.min)..(start + bounds.max).min(total);
        let target = start + bounds.target;
        let cut = window
            .min_by(|&a, &b| {
                energy[a]
                    .total_cmp(&energy[b])
                    .then(a.abs_diff(target).cmp(&b.abs_diff(target)))
            })
            .unwrap_or(start + bounds.target);
        cuts.push(start..cut);
        start = cut;
    }
    merge_short_tail(&mut cuts, &bounds);
    cuts
}

fn merge_short_tail(cuts: &mut Vec<Range<usize>>, bounds: &FrameBounds) {
    if cuts.len() < 2 {
        return;
    }
    let last = cuts[cuts.len() - 1].clone();
    let previous = cuts[cuts.len() - 2].clone();
    if last.len() < bounds.min && previous.len() + last.len() <= bounds.max {
        cuts.pop();
        if let Some(previous) = cuts.last_mut() {
            previous.end = last.end;
        }
    }
}

/// Short segments favour latency with full density and small batches;
/// longer ones render every `skip_factor`-th frame.
pub fn choose_tier(frame_count: usize, fps: u32, config: &SegmentConfig) -> Tier {
    let duration = frame_count as f32 / fps.max(1) as f32;
    if duration <= config.short_segment_secs || config.skip_factor <= 1 {
        Tier::Full {
            batch_size: config.short_batch_size.max(1),
        }
    } else {
        Tier::Skip {
            factor: config.skip_factor,
        }
    }
}

/// Frames rendered for a skip-frame segment: every `factor`-th frame plus
/// the last one, so interpolation never has to extrapolate at the end.
pub fn keyframe_indices(frame_count: usize, factor: usize) -> Vec<usize> {
    if frame_count == 0 {
        return Vec::new();
    }
    let mut keys: Vec<usize> = (0..frame_count).step_by(factor.max(1)).collect();
    if keys.last() != Some(&(frame_count - 1)) {
        keys.push(frame_count - 1);
    }
    keys
}

/// Cut a job of `total_frames` into segments and pick each segment's tier.
/// Activity cuts are used when configured and `energy` is available.
pub fn plan_segments(
    total_frames: usize,
    fps: u32,
    config: &SegmentConfig,
    energy: Option<&[f32]>,
) -> Vec<SegmentPlan> {
    let cuts = match energy {
        Some(energy) if config.cut_mode == crate::config::CutMode::Activity => {
            let energy = &energy[..energy.len().min(total_frames)];
            let mut cuts = activity_cuts(energy, fps, config);
            // Energy can be shorter than the feature sequence; cover the rest.
            let covered = cuts.last().map(|c| c.end).unwrap_or(0);
            if covered < total_frames {
                cuts.extend(
                    fixed_cuts(total_frames - covered, fps, config)
                        .into_iter()
                        .map(|c| c.start + covered..c.end + covered),
                );
            }
            cuts
        }
        _ => fixed_cuts(total_frames, fps, config),
    };

    cuts.into_iter()
        .enumerate()
        .map(|(index, range)| SegmentPlan {
            index,
            start_frame: range.start,
            frame_count: range.len(),
            tier: choose_tier(range.len(), fps, config),
        })
        .collect()
}
