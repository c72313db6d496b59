//! Application Services
//!
//! - [`IngestionPipeline`]: drives feed sessions through persistence, the
//!   history window and the broadcast hub.

mod pipeline;

pub use pipeline::{IngestionPipeline, PipelineConfig, PipelineError, PipelineState};
