// warden/src/sampler/mod.rs
//
// Domain samplers. Each call returns one Sample per observed subject; an
// empty Vec is a successful quiet cycle, an Err fails the cycle.

pub mod log;
pub mod network;
pub mod system;

pub use log::LogSampler;
pub use network::NetworkSampler;
pub use system::SystemSampler;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::Sample;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampler unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Sampler: Send + Sync {
    fn name(&self) -> &str;
    async fn sample(&self) -> Result<Vec<Sample>, SamplerError>;
}

/// Host label used as the subject of host-wide samples.
pub fn host_subject() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
