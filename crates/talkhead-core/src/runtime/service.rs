//! Runtime service orchestrator.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::accelerator::{AcceleratorPool, InitReport};
use crate::audio;
use crate::backends::{Collaborators, Compositor, FeatureExtractor, MediaWriter, WriteRequest};
use crate::cache::{BuildRequest, BundleMetadata, FeatureBundle, FeatureCache};
use crate::compose::{compose_frames, regions_from_results};
use crate::config::{CutMode, ServeConfig};
use crate::error::{Error, Result};
use crate::runtime::types::{
    CacheStatus, InferenceRequest, InferenceResult, PingResult, PreprocessRequest,
    PreprocessResult, ServiceStatus, StreamRequest,
};
use crate::scheduler::{BatchScheduler, SchedulerConfig, WorkItem};
use crate::segment::{SegmentEvent, SegmentJob, SegmentProcessor};

/// Owns the process-wide warm state and implements every command.
///
/// Construct once at startup with [`RenderService::start`] and share it
/// behind an `Arc`.
pub struct RenderService {
    config: ServeConfig,
    cache: Arc<FeatureCache>,
    pool: Arc<AcceleratorPool>,
    scheduler: Arc<BatchScheduler>,
    segments: Arc<SegmentProcessor>,
    extractor: Arc<dyn FeatureExtractor>,
    compositor: Arc<dyn Compositor>,
    writer: Arc<dyn MediaWriter>,
    init_report: InitReport,
    jobs: TaskTracker,
    accepting: AtomicBool,
}

impl RenderService {
    /// Initialize the accelerator pool and the feature cache.
    pub async fn start(config: ServeConfig, collaborators: Collaborators) -> Result<Self> {
        info!(
            "Starting render service with accelerators {:?}",
            config.accelerators
        );
        let (pool, init_report) = AcceleratorPool::initialize(
            &config.accelerators,
            collaborators.loader.clone(),
            Duration::from_millis(config.acquire_timeout_ms),
        )
        .await?;
        if init_report.is_partial() {
            warn!(
                "Running with accelerators {:?}; failed: {:?}",
                init_report.ready_ids(),
                init_report.failed_ids()
            );
        }
        let pool = Arc::new(pool);

        let cache = Arc::new(FeatureCache::new(
            config.cache_dir.clone(),
            collaborators.preprocessor.clone(),
            config.memory_cache_entries,
        )?);
        let scheduler = Arc::new(BatchScheduler::new(
            pool.clone(),
            SchedulerConfig::from(&config),
        ));
        let segments = Arc::new(SegmentProcessor::new(
            scheduler.clone(),
            collaborators.compositor.clone(),
            collaborators.writer.clone(),
            config.segment.clone(),
        ));

        Ok(Self {
            config,
            cache,
            pool,
            scheduler,
            segments,
            extractor: collaborators.extractor,
            compositor: collaborators.compositor,
            writer: collaborators.writer,
            init_report,
            jobs: TaskTracker::new(),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn init_report(&self) -> &InitReport {
        &self.init_report
    }

    pub fn pool(&self) -> &Arc<AcceleratorPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<FeatureCache> {
        &self.cache
    }

    pub fn ping(&self) -> PingResult {
        PingResult {
            message: "pong".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    /// Build (or reuse) the feature bundle for a template.
    pub async fn preprocess(&self, request: PreprocessRequest) -> Result<PreprocessResult> {
        let _job = self.begin_job()?;
        let params = request.params();
        let bundle = self
            .cache
            .get_or_build(
                BuildRequest::new(request.template_id.clone(), request.template_image_path)
                    .with_params(params)
                    .force_refresh(request.force_refresh),
            )
            .await?;

        Ok(PreprocessResult {
            message: format!(
                "Template {} ready ({} cycle frames)",
                request.template_id,
                bundle.len()
            ),
            template_id: request.template_id,
            cycle_len: bundle.len(),
        })
    }

    /// Render a whole clip in one scheduler run and write it out.
    pub async fn inference(
        &self,
        request: InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceResult> {
        let _job = self.begin_job()?;
        let started = Instant::now();
        let fps = self.resolve_fps(request.fps)?;
        if request.batch_size == Some(0) {
            return Err(Error::InvalidInput("batchSize must be at least 1".to_string()));
        }

        let bundle = self.cached_bundle(&request.template_id).await?;
        let features = self.extract(&request.audio_path, fps).await?;
        let total = features.len();
        let items = WorkItem::sequence(features, &bundle, 0);

        let output = self
            .scheduler
            .run(items, bundle.clone(), request.batch_size, cancel)
            .await?;
        if output.report.cancelled > 0 {
            debug!(
                "Inference for {} cancelled with {} frame(s) outstanding",
                request.template_id, output.report.cancelled
            );
            return Err(Error::Cancelled);
        }

        let regions = regions_from_results(&output.results);
        let compositor = self.compositor.clone();
        let writer = self.writer.clone();
        let audio_path = request.audio_path.clone();
        let output_path = request.output_path.clone();
        let (output_path, failed_frames) = tokio::task::spawn_blocking(move || -> Result<_> {
            let clip = compose_frames(compositor.as_ref(), &bundle, 0, regions)?;
            let path = writer.write(WriteRequest {
                frames: &clip.frames,
                audio_path: &audio_path,
                audio_offset_secs: 0.0,
                fps,
                output_path: &output_path,
            })?;
            Ok((path, clip.failed))
        })
        .await
        .map_err(|e| Error::Backend(format!("Writer task failed: {e}")))??;

        let elapsed_secs = started.elapsed().as_secs_f32();
        info!(
            "Inference for {} wrote {} frame(s) to {:?} in {:.2}s ({} failed)",
            request.template_id, total, output_path, elapsed_secs, failed_frames
        );
        Ok(InferenceResult {
            output_path,
            frames: total,
            failed_frames,
            batch_size: output.report.batch_size,
            elapsed_secs,
        })
    }

    /// Start a streaming job and return its segment events.
    pub async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<SegmentEvent>> {
        let job = self.begin_job()?;
        let fps = self.resolve_fps(request.fps)?;
        let bundle = self.cached_bundle(&request.template_id).await?;
        let features = self.extract(&request.audio_path, fps).await?;

        let energy = if self.config.segment.cut_mode == CutMode::Activity {
            let audio_path = request.audio_path.clone();
            match tokio::task::spawn_blocking(move || audio::read_wav(&audio_path)).await {
                Ok(Ok(waveform)) => Some(audio::frame_energy(&waveform, fps)),
                Ok(Err(e)) => {
                    warn!("Falling back to fixed cuts: {}", e);
                    None
                }
                Err(e) => {
                    warn!("Falling back to fixed cuts: {}", e);
                    None
                }
            }
        } else {
            None
        };

        tokio::fs::create_dir_all(&request.output_dir).await?;

        let segment_job = SegmentJob {
            bundle,
            features,
            energy,
            audio_path: request.audio_path,
            output_dir: request.output_dir,
            fps,
            abort_on_failure: request
                .abort_on_failure
                .unwrap_or(self.config.segment.abort_on_failure),
        };

        let (tx, rx) = mpsc::channel(8);
        let processor = self.segments.clone();
        self.jobs.spawn(async move {
            let _job = job;
            processor.run(segment_job, tx, cancel).await;
        });
        Ok(rx)
    }

    pub fn check_cache(&self, template_id: &str) -> Result<CacheStatus> {
        let exists = self.cache.exists(template_id)?;
        let cache_path = if exists {
            Some(self.cache.cache_path(template_id)?)
        } else {
            None
        };
        Ok(CacheStatus { exists, cache_path })
    }

    pub async fn list_cache(&self) -> Result<Vec<BundleMetadata>> {
        self.cache.list().await
    }

    pub async fn invalidate(&self, template_id: &str) -> Result<bool> {
        self.cache.invalidate(template_id).await
    }

    pub async fn status(&self) -> ServiceStatus {
        let cached_templates = match self.cache.list().await {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!("Failed to list cache for status: {}", e);
                0
            }
        };
        ServiceStatus {
            model_loaded: !self.pool.is_empty(),
            accelerator_count: self.pool.len(),
            in_flight_jobs: self.jobs.len(),
            cached_templates,
            shutting_down: self.is_shutting_down(),
            accelerators: self.pool.snapshot(),
            scheduler: self.scheduler.stats(),
        }
    }

    /// Stop accepting new jobs. In-flight jobs keep running.
    pub fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Render service no longer accepts jobs");
        }
        self.jobs.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Wait for in-flight jobs after [`begin_shutdown`](Self::begin_shutdown).
    /// Returns false if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let pending = self.jobs.len();
        if pending > 0 {
            info!("Waiting for {} in-flight job(s)", pending);
        }
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.jobs.wait()).await.is_ok(),
            None => {
                self.jobs.wait().await;
                true
            }
        }
    }

    /// Release accelerator replicas. Call after [`drain`](Self::drain).
    pub fn release_accelerators(&self) {
        self.pool.shutdown();
    }

    fn begin_job(&self) -> Result<TaskTrackerToken> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(self.jobs.token())
    }

    fn resolve_fps(&self, fps: Option<u32>) -> Result<u32> {
        match fps.unwrap_or(self.config.default_fps) {
            0 => Err(Error::InvalidInput("fps must be at least 1".to_string())),
            fps => Ok(fps),
        }
    }

    async fn cached_bundle(&self, template_id: &str) -> Result<Arc<FeatureBundle>> {
        self.cache.get(template_id).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Template {template_id} is not cached; run preprocess first"
            ))
        })
    }

    async fn extract(&self, audio_path: &Path, fps: u32) -> Result<Vec<candle_core::Tensor>> {
        if !audio_path.is_file() {
            return Err(Error::NotFound(format!(
                "Audio file not found: {}",
                audio_path.display()
            )));
        }
        let extractor = self.extractor.clone();
        let path = audio_path.to_path_buf();
        let features = tokio::task::spawn_blocking(move || extractor.extract(&path, fps))
            .await
            .map_err(|e| Error::Backend(format!("Feature extraction task failed: {e}")))??;
        if features.is_empty() {
            return Err(Error::InvalidInput(format!(
                "No audio frames in {}",
                audio_path.display()
            )));
        }
        debug!("Extracted {} conditioning feature(s)", features.len());
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::TemplateRequest;
    use crate::testing::{first_value, StubBehavior, TestRig};
    use std::path::PathBuf;

    struct Fixture {
        dir: tempfile::TempDir,
        rig: TestRig,
        service: Arc<RenderService>,
    }

    impl Fixture {
        async fn new(accelerators: usize, audio_frames: usize, behavior: StubBehavior) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("alice.jpg"), b"jpeg").unwrap();
            std::fs::write(dir.path().join("bob.jpg"), b"jpeg").unwrap();
            std::fs::write(dir.path().join("hello.wav"), b"wav").unwrap();

            let rig = TestRig::with_behavior(audio_frames, behavior);
            let config = ServeConfig {
                cache_dir: dir.path().join("cache"),
                accelerators: (0..accelerators).collect(),
                ..Default::default()
            };
            let service = Arc::new(RenderService::start(config, rig.collaborators()).await.unwrap());
            Self { dir, rig, service }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn preprocess_request(&self, id: &str) -> PreprocessRequest {
            serde_json::from_value(serde_json::json!({
                "templateId": id,
                "templateImagePath": self.path(&format!("{id}.jpg")),
            }))
            .unwrap()
        }

        fn inference_request(&self, id: &str, output: &str) -> InferenceRequest {
            InferenceRequest {
                template_id: id.to_string(),
                audio_path: self.path("hello.wav"),
                output_path: self.path(output),
                fps: None,
                batch_size: None,
            }
        }
    }

    #[tokio::test]
    async fn test_preprocess_then_check_cache() {
        let fixture = Fixture::new(1, 10, StubBehavior::default()).await;
        assert!(!fixture.service.check_cache("alice").unwrap().exists);

        let result = fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();
        assert_eq!(result.template_id, "alice");
        assert_eq!(result.cycle_len, 6);

        let status = fixture.service.check_cache("alice").unwrap();
        assert!(status.exists);
        assert!(status.cache_path.unwrap().ends_with("alice.safetensors"));
    }

    #[tokio::test]
    async fn test_inference_renders_every_frame_in_order() {
        let fixture = Fixture::new(2, 50, StubBehavior::default()).await;
        fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();

        let result = fixture
            .service
            .inference(
                fixture.inference_request("alice", "out.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.frames, 50);
        assert_eq!(result.failed_frames, 0);
        assert_eq!(result.output_path, fixture.path("out.mp4"));

        let clips = fixture.rig.writer.clips();
        assert_eq!(clips.len(), 1);
        let values: Vec<f32> = clips[0].frames.iter().map(first_value).collect();
        let expected: Vec<f32> = (0..50).map(|i| i as f32).collect();
        assert_eq!(values, expected);
        assert_eq!(fixture.service.pool().total_load(), 0);
    }

    #[tokio::test]
    async fn test_inference_requires_cached_template_and_audio() {
        let fixture = Fixture::new(1, 5, StubBehavior::default()).await;
        let result = fixture
            .service
            .inference(
                fixture.inference_request("alice", "out.mp4"),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();
        let mut request = fixture.inference_request("alice", "out.mp4");
        request.audio_path = fixture.path("missing.wav");
        let result = fixture
            .service
            .inference(request, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_frames_fall_back_to_reference() {
        let behavior = StubBehavior {
            fail: true,
            ..Default::default()
        };
        let fixture = Fixture::new(1, 8, behavior).await;
        fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();

        let result = fixture
            .service
            .inference(
                fixture.inference_request("alice", "out.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.frames, 8);
        assert_eq!(result.failed_frames, 8);
        assert_eq!(fixture.rig.writer.clips()[0].frames.len(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_inferences_return_load_to_zero() {
        let behavior = StubBehavior {
            delay: Duration::from_millis(2),
            ..Default::default()
        };
        let fixture = Fixture::new(4, 40, behavior).await;
        for id in ["alice", "bob"] {
            fixture
                .service
                .preprocess(fixture.preprocess_request(id))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            fixture
                .service
                .inference(fixture.inference_request("alice", "a.mp4"), &cancel),
            fixture
                .service
                .inference(fixture.inference_request("bob", "b.mp4"), &cancel),
        );
        assert_eq!(a.unwrap().frames, 40);
        assert_eq!(b.unwrap().frames, 40);
        assert_eq!(fixture.service.pool().total_load(), 0);
        assert_eq!(fixture.service.status().await.scheduler.jobs, 2);
    }

    #[tokio::test]
    async fn test_stream_emits_segments_then_finished() {
        let fixture = Fixture::new(2, 60, StubBehavior::default()).await;
        fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();

        let mut rx = fixture
            .service
            .stream(
                StreamRequest {
                    template_id: "alice".to_string(),
                    audio_path: fixture.path("hello.wav"),
                    output_dir: fixture.path("segments"),
                    fps: Some(25),
                    abort_on_failure: None,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut segments = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SegmentEvent::Segment(output) => {
                    assert_eq!(output.plan.index, segments);
                    segments += 1;
                }
                SegmentEvent::SegmentFailed { error, .. } => panic!("segment failed: {error}"),
                SegmentEvent::Finished(summary) => {
                    assert_eq!(summary.segments, 3);
                    break;
                }
            }
        }
        assert_eq!(segments, 3);
        assert!(fixture.path("segments").is_dir());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs_and_drains() {
        let fixture = Fixture::new(1, 5, StubBehavior::default()).await;
        fixture.service.begin_shutdown();

        let result = fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
        assert!(fixture.service.drain(Some(Duration::from_secs(1))).await);
        assert!(fixture.service.status().await.shutting_down);

        fixture.service.release_accelerators();
        assert!(fixture.rig.loader.backend(0).unwrap().released());
    }

    #[tokio::test]
    async fn test_invalidate_and_list() {
        let fixture = Fixture::new(1, 5, StubBehavior::default()).await;
        fixture
            .service
            .preprocess(fixture.preprocess_request("alice"))
            .await
            .unwrap();
        assert_eq!(fixture.service.list_cache().await.unwrap().len(), 1);

        let request: TemplateRequest =
            serde_json::from_str(r#"{"templateId":"alice"}"#).unwrap();
        assert!(fixture.service.invalidate(&request.template_id).await.unwrap());
        assert!(!fixture.service.check_cache("alice").unwrap().exists);
        assert_eq!(fixture.service.status().await.cached_templates, 0);
    }
}
