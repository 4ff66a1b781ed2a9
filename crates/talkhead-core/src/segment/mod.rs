//! Streaming: a job is cut into short segments that are rendered, composed
//! and written one after another, so playback can start early.

mod interpolate;
mod plan;
mod state;

pub use interpolate::{reconstruct_frames, Interpolator, LinearInterpolator};
pub use plan::{
    activity_cuts, choose_tier, fixed_cuts, keyframe_indices, plan_segments, SegmentPlan, Tier,
};
pub use state::SegmentState;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Tensor;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{Compositor, MediaWriter, WriteRequest};
use crate::cache::FeatureBundle;
use crate::compose::compose_frames;
use crate::config::{InterpolationMode, SegmentConfig};
use crate::error::{Error, Result};
use crate::scheduler::{BatchScheduler, FrameOutcome, WorkItem};

/// Everything one streaming job needs.
pub struct SegmentJob {
    pub bundle: Arc<FeatureBundle>,
    /// Conditioning features for the whole clip, one per output frame
    pub features: Vec<Tensor>,
    /// Per-frame audio energy, used for activity cuts
    pub energy: Option<Vec<f32>>,
    pub audio_path: PathBuf,
    pub output_dir: PathBuf,
    pub fps: u32,
    pub abort_on_failure: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentOutput {
    pub plan: SegmentPlan,
    pub output_path: PathBuf,
    pub rendered_frames: usize,
    pub failed_frames: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    /// Segments attempted, failed ones included
    pub segments: usize,
    pub failed_segments: usize,
    pub cancelled: bool,
    pub state: SegmentState,
}

#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Segment(SegmentOutput),
    SegmentFailed { plan: SegmentPlan, error: String },
    Finished(StreamSummary),
}

pub struct SegmentProcessor {
    scheduler: Arc<BatchScheduler>,
    compositor: Arc<dyn Compositor>,
    writer: Arc<dyn MediaWriter>,
    interpolator: Arc<dyn Interpolator>,
    config: SegmentConfig,
}

impl SegmentProcessor {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        compositor: Arc<dyn Compositor>,
        writer: Arc<dyn MediaWriter>,
        config: SegmentConfig,
    ) -> Self {
        let interpolator: Arc<dyn Interpolator> = match config.interpolation {
            InterpolationMode::Linear => Arc::new(LinearInterpolator),
        };
        Self {
            scheduler,
            compositor,
            writer,
            interpolator,
            config,
        }
    }

    pub fn with_interpolator(mut self, interpolator: Arc<dyn Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn plan(&self, total_frames: usize, fps: u32, energy: Option<&[f32]>) -> Vec<SegmentPlan> {
        plan_segments(total_frames, fps, &self.config, energy)
    }

    /// Run `job` on a new task and return its event stream.
    pub fn start(
        self: &Arc<Self>,
        job: SegmentJob,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<SegmentEvent> {
        let (tx, rx) = mpsc::channel(8);
        let processor = self.clone();
        tokio::spawn(async move {
            processor.run(job, tx, cancel).await;
        });
        rx
    }

    /// Process every segment in order, emitting one event per segment and a
    /// final [`SegmentEvent::Finished`]. A dropped receiver cancels the job.
    pub async fn run(
        &self,
        job: SegmentJob,
        events: mpsc::Sender<SegmentEvent>,
        cancel: CancellationToken,
    ) -> StreamSummary {
        let mut state = SegmentState::Idle;
        let mut summary = StreamSummary {
            segments: 0,
            failed_segments: 0,
            cancelled: false,
            state,
        };

        let outcome = self
            .run_segments(&job, &events, &cancel, &mut state, &mut summary)
            .await;
        let next = match outcome {
            Ok(()) if !summary.cancelled => SegmentState::Done,
            Ok(()) => SegmentState::Failed,
            Err(e) => {
                warn!("Streaming job stopped: {}", e);
                SegmentState::Failed
            }
        };
        if !state.is_terminal() {
            state = next;
        }
        summary.state = state;

        info!(
            "Streaming job finished: {} segment(s), {} failed{}",
            summary.segments,
            summary.failed_segments,
            if summary.cancelled { ", cancelled" } else { "" }
        );
        let _ = events.send(SegmentEvent::Finished(summary.clone())).await;
        summary
    }

    async fn run_segments(
        &self,
        job: &SegmentJob,
        events: &mpsc::Sender<SegmentEvent>,
        cancel: &CancellationToken,
        state: &mut SegmentState,
        summary: &mut StreamSummary,
    ) -> Result<()> {
        state.advance(SegmentState::Segmenting)?;
        let plans = self.plan(job.features.len(), job.fps, job.energy.as_deref());
        info!(
            "Streaming {} frame(s) as {} segment(s) at {} fps",
            job.features.len(),
            plans.len(),
            job.fps
        );

        for plan in plans {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            summary.segments += 1;
            let event = match self.process_segment(job, &plan, state, cancel).await {
                Ok(output) => {
                    debug!(
                        "Segment {} ready: {} frame(s) at {:?}",
                        plan.index, plan.frame_count, output.output_path
                    );
                    SegmentEvent::Segment(output)
                }
                Err(Error::Cancelled) => {
                    summary.segments -= 1;
                    summary.cancelled = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Segment {} failed: {}", plan.index, e);
                    summary.failed_segments += 1;
                    SegmentEvent::SegmentFailed {
                        plan: plan.clone(),
                        error: e.to_string(),
                    }
                }
            };

            let failed = matches!(event, SegmentEvent::SegmentFailed { .. });
            if events.send(event).await.is_err() {
                debug!("Stream receiver dropped; stopping");
                summary.cancelled = true;
                return Ok(());
            }
            if failed && job.abort_on_failure {
                state.advance(SegmentState::Failed)?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn process_segment(
        &self,
        job: &SegmentJob,
        plan: &SegmentPlan,
        state: &mut SegmentState,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutput> {
        let (positions, batch_size) = match plan.tier {
            Tier::Full { batch_size } => ((0..plan.frame_count).collect::<Vec<_>>(), Some(batch_size)),
            Tier::Skip { factor } => {
                state.advance(SegmentState::Preparing)?;
                (keyframe_indices(plan.frame_count, factor), None)
            }
        };
        state.advance(SegmentState::Dispatching)?;

        let items = positions
            .iter()
            .map(|&position| {
                let frame = plan.start_frame + position;
                WorkItem {
                    index: position,
                    conditioning: job.features[frame].clone(),
                    cycle_index: job.bundle.cycle_index(frame),
                }
            })
            .collect();
        let output = self
            .scheduler
            .run(items, job.bundle.clone(), batch_size, cancel)
            .await?;
        if output.report.cancelled > 0 {
            return Err(Error::Cancelled);
        }

        let rendered: BTreeMap<usize, Tensor> = output
            .results
            .into_iter()
            .filter_map(|result| match result.outcome {
                FrameOutcome::Rendered(region) => Some((result.index, region)),
                _ => None,
            })
            .collect();
        if rendered.is_empty() {
            return Err(Error::Backend(format!(
                "segment {}: no frame rendered",
                plan.index
            )));
        }

        state.advance(SegmentState::Composing)?;
        let rendered_frames = rendered.len();
        let mut regions =
            reconstruct_frames(plan.frame_count, &rendered, self.interpolator.as_ref())?;
        // Dispatched frames that failed are composed from the reference frame
        // and counted, never filled from their neighbours.
        for &position in &positions {
            if !rendered.contains_key(&position) {
                regions[position] = None;
            }
        }

        let compositor = self.compositor.clone();
        let writer = self.writer.clone();
        let bundle = job.bundle.clone();
        let audio_path = job.audio_path.clone();
        let output_path = job.output_dir.join(format!("segment_{:04}.mp4", plan.index));
        let start_frame = plan.start_frame;
        let fps = job.fps;
        let (output_path, failed_frames) = tokio::task::spawn_blocking(move || -> Result<_> {
            let clip = compose_frames(compositor.as_ref(), &bundle, start_frame, regions)?;
            let path = writer.write(WriteRequest {
                frames: &clip.frames,
                audio_path: &audio_path,
                audio_offset_secs: start_frame as f32 / fps.max(1) as f32,
                fps,
                output_path: &output_path,
            })?;
            Ok((path, clip.failed))
        })
        .await
        .map_err(|e| Error::Backend(format!("Segment writer task failed: {e}")))??;

        Ok(SegmentOutput {
            plan: plan.clone(),
            output_path,
            rendered_frames,
            failed_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::AcceleratorPool;
    use crate::cache::PreprocessParams;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{
        first_value, prepared_template, MemoryWriter, PassthroughCompositor, StubBehavior,
        StubLoader, FEATURE_DIM,
    };
    use candle_core::Device;
    use std::time::Duration;

    struct Harness {
        processor: Arc<SegmentProcessor>,
        loader: Arc<StubLoader>,
        writer: Arc<MemoryWriter>,
    }

    async fn harness(behavior: StubBehavior) -> Harness {
        let loader = Arc::new(StubLoader::new(behavior));
        let (pool, _) = AcceleratorPool::initialize(&[0, 1], loader.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::new(pool),
            SchedulerConfig::default(),
        ));
        let writer = Arc::new(MemoryWriter::default());
        let processor = Arc::new(SegmentProcessor::new(
            scheduler,
            Arc::new(PassthroughCompositor),
            writer.clone(),
            SegmentConfig::default(),
        ));
        Harness {
            processor,
            loader,
            writer,
        }
    }

    fn job(frames: usize, abort_on_failure: bool) -> SegmentJob {
        let bundle = FeatureBundle::from_prepared(
            "alice",
            PathBuf::from("alice.jpg"),
            PreprocessParams::default(),
            prepared_template(3),
        )
        .unwrap();
        SegmentJob {
            bundle: Arc::new(bundle),
            features: (0..frames)
                .map(|i| Tensor::full(i as f32, FEATURE_DIM, &Device::Cpu).unwrap())
                .collect(),
            energy: None,
            audio_path: PathBuf::from("hello.wav"),
            output_dir: PathBuf::from("out"),
            fps: 25,
            abort_on_failure,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<SegmentEvent>) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_segments_are_emitted_in_order_with_every_frame() {
        let harness = harness(StubBehavior::default()).await;
        let events = collect(harness.processor.start(job(60, false), CancellationToken::new())).await;

        assert_eq!(events.len(), 4);
        let outputs: Vec<&SegmentOutput> = events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::Segment(output) => Some(output),
                _ => None,
            })
            .collect();
        let tiers: Vec<&str> = outputs.iter().map(|o| o.plan.tier.name()).collect();
        assert_eq!(tiers, vec!["skip", "skip", "full"]);
        assert_eq!(outputs[0].output_path, PathBuf::from("out/segment_0000.mp4"));

        let clips = harness.writer.clips();
        let lengths: Vec<usize> = clips.iter().map(|c| c.frames.len()).collect();
        assert_eq!(lengths, vec![25, 25, 10]);
        assert!((clips[1].audio_offset_secs - 1.0).abs() < 1e-6);

        // Interpolating a linear ramp reproduces it exactly.
        let values: Vec<f32> = clips
            .iter()
            .flat_map(|c| c.frames.iter().map(first_value))
            .collect();
        let expected: Vec<f32> = (0..60).map(|i| i as f32).collect();
        assert_eq!(values, expected);

        // Two skip segments render 13 keyframes each; the short tail renders all 10.
        let rendered: usize = (0..2)
            .map(|id| harness.loader.backend(id).unwrap().batch_sizes().iter().sum::<usize>())
            .sum();
        assert_eq!(rendered, 36);

        match events.last() {
            Some(SegmentEvent::Finished(summary)) => {
                assert_eq!(summary.segments, 3);
                assert_eq!(summary.failed_segments, 0);
                assert_eq!(summary.state, SegmentState::Done);
            }
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_frames_in_full_segment_are_reported() {
        // Frames 50..53 share a batch in the full-density tail segment.
        let harness = harness(StubBehavior {
            fail_containing: Some(52.0),
            ..Default::default()
        })
        .await;
        let events = collect(harness.processor.start(job(60, false), CancellationToken::new())).await;

        let tail = events
            .iter()
            .find_map(|e| match e {
                SegmentEvent::Segment(output) if output.plan.index == 2 => Some(output),
                _ => None,
            })
            .expect("tail segment");
        assert_eq!(tail.plan.tier.name(), "full");
        assert_eq!(tail.rendered_frames, 6);
        assert_eq!(tail.failed_frames, 4);

        let clips = harness.writer.clips();
        let tail_clip = &clips[2];
        assert_eq!(tail_clip.frames.len(), 10);
        for frame in &tail_clip.frames[..4] {
            // Reference frame, not a repeated neighbour region.
            assert_eq!(frame.dims(), &[8, 8, 3]);
        }
        let rendered: Vec<f32> = tail_clip.frames[4..].iter().map(first_value).collect();
        assert_eq!(rendered, vec![54.0, 55.0, 56.0, 57.0, 58.0, 59.0]);
    }

    #[tokio::test]
    async fn test_failed_segments_do_not_abort_by_default() {
        let harness = harness(StubBehavior {
            fail: true,
            ..Default::default()
        })
        .await;
        let events = collect(harness.processor.start(job(60, false), CancellationToken::new())).await;

        let failed = events
            .iter()
            .filter(|e| matches!(e, SegmentEvent::SegmentFailed { .. }))
            .count();
        assert_eq!(failed, 3);
        match events.last() {
            Some(SegmentEvent::Finished(summary)) => {
                assert_eq!(summary.failed_segments, 3);
                assert_eq!(summary.state, SegmentState::Done);
            }
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_on_first_failure() {
        let harness = harness(StubBehavior {
            fail: true,
            ..Default::default()
        })
        .await;
        let events = collect(harness.processor.start(job(60, true), CancellationToken::new())).await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            SegmentEvent::Finished(summary) => {
                assert_eq!(summary.segments, 1);
                assert_eq!(summary.state, SegmentState::Failed);
            }
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_job_writes_nothing() {
        let harness = harness(StubBehavior::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = collect(harness.processor.start(job(60, false), cancel)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SegmentEvent::Finished(StreamSummary { cancelled: true, .. })
        ));
        assert!(harness.writer.clips().is_empty());
    }
}
