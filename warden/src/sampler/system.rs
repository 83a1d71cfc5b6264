// warden/src/sampler/system.rs
//
// Host resource sampler backed by sysinfo. The refresh walks /proc, so it
// runs on the blocking pool.
//
//   host sample     cpu_percent, memory_percent, process_count, load_1m
//   process samples subject = "name:pid", top CPU consumers
//                   cpu_percent, memory_percent

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::System;

use super::{host_subject, Sampler, SamplerError};
use crate::events::Sample;

pub struct SystemSampler {
    host:          String,
    top_processes: usize,
    sys:           Arc<Mutex<System>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            host:          host_subject(),
            top_processes: 10,
            sys:           Arc::new(Mutex::new(System::new_all())),
        }
    }

    pub fn with_top_processes(mut self, n: usize) -> Self {
        self.top_processes = n;
        self
    }
}

impl Default for SystemSampler {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Sampler for SystemSampler {
    fn name(&self) -> &str { "system" }

    async fn sample(&self) -> Result<Vec<Sample>, SamplerError> {
        let sys = self.sys.clone();
        let host = self.host.clone();
        let top = self.top_processes;

        tokio::task::spawn_blocking(move || {
            let mut sys = sys.lock();
            sys.refresh_all();

            let total_memory = sys.total_memory() as f64;
            if total_memory <= 0.0 {
                return Err(SamplerError::Unavailable("total memory reported as zero".into()));
            }
            let memory_percent = sys.used_memory() as f64 / total_memory * 100.0;

            let mut samples = vec![Sample::new(host)
                .with("cpu_percent", sys.global_cpu_info().cpu_usage() as f64)
                .with("memory_percent", memory_percent)
                .with("process_count", sys.processes().len() as f64)
                .with("load_1m", System::load_average().one)];

            let mut procs: Vec<(String, f64, f64)> = sys
                .processes()
                .iter()
                .map(|(pid, p)| {
                    (
                        format!("{}:{}", p.name(), pid.as_u32()),
                        p.cpu_usage() as f64,
                        p.memory() as f64 / total_memory * 100.0,
                    )
                })
                .collect();
            procs.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            for (subject, cpu, mem) in procs.into_iter().take(top) {
                samples.push(
                    Sample::new(subject)
                        .with("cpu_percent", cpu)
                        .with("memory_percent", mem),
                );
            }
            Ok(samples)
        })
        .await
        .map_err(|e| SamplerError::Unavailable(format!("system refresh task failed: {}", e)))?
    }
}
