//! Talkhead Core - serving core for talking-head video rendering
//!
//! Given a still template image and an audio clip, the service renders a
//! video of the template speaking the audio. This crate holds everything
//! that does not depend on a particular model:
//!
//! - [`cache`]: per-template feature bundles, built at most once and reused
//! - [`accelerator`]: one model replica per accelerator, with exclusive use
//! - [`scheduler`]: batched rendering across the pool with OOM back-off
//! - [`segment`]: streaming jobs cut into short, independently written clips
//! - [`runtime`]: the [`RenderService`] that ties them together
//!
//! Model-specific work (face detection, audio features, the generator) is
//! supplied through the traits in [`backends`].
//!
//! # Example
//!
//! ```ignore
//! use talkhead_core::{Collaborators, RenderService, ServeConfig};
//!
//! let service = RenderService::start(ServeConfig::default(), Collaborators::dry_run()).await?;
//! let pong = service.ping();
//! ```

pub mod accelerator;
pub mod audio;
pub mod backends;
pub mod cache;
pub mod compose;
pub mod config;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod segment;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use accelerator::{AcceleratorPool, AcceleratorSnapshot, InitOutcome, InitReport};
pub use backends::{
    Collaborators, Compositor, FeatureExtractor, MediaWriter, RenderBackend, Replica,
    ReplicaLoader, TemplatePreprocessor,
};
pub use cache::{BundleMetadata, FeatureBundle, FeatureCache};
pub use config::{SegmentConfig, ServeConfig, ServerConfig};
pub use error::{Error, Result};
pub use runtime::RenderService;
pub use scheduler::{BatchScheduler, JobReport, StatsSnapshot};
pub use segment::{SegmentEvent, SegmentProcessor, StreamSummary};
