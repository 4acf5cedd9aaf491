#![deny(clippy::print_stdout, clippy::print_stderr)]

mod config;
mod error;
mod pipeline;
mod telemetry;

pub use config::Config;
pub use config::{DmsSection, LedgerSection, LlmSection, ReconcileSection, ReviewSection, StoreSection};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::Pipeline;
pub use telemetry::{PipelineCounters, PipelineTelemetry};
