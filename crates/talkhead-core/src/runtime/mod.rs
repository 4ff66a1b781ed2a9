//! Runtime orchestration layer.
//!
//! [`RenderService`] owns the accelerator pool, the feature cache and the
//! collaborators, and exposes one method per protocol command.

mod service;
mod types;

pub use service::RenderService;
pub use types::{
    CacheStatus, InferenceRequest, InferenceResult, PingResult, PreprocessRequest,
    PreprocessResult, ServiceStatus, StreamRequest, TemplateRequest,
};
