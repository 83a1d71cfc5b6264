// warden/src/lib.rs
//
// Warden: detection loops score host telemetry, fusion turns anomalies into
// Threats, the policy engine decides on containment, and the dispatcher fans
// notifications out to operators.

pub mod config;
pub mod detect;
pub mod engine;
pub mod events;
pub mod intake;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod response;
pub mod sampler;
pub mod scorer;
pub mod store;

pub use config::PipelineConfig;
pub use pipeline::{PipelineBuilder, PipelineError, PipelineHandle};
