// warden/src/engine/safelist.rs
//
// Subjects exempt from automated action: IPs, process names (matched against
// "name:pid" subjects) and exact subject keys.

use std::collections::HashSet;
use std::net::IpAddr;

use parking_lot::RwLock;

use crate::config::ResponseConfig;

#[derive(Debug, Default)]
struct Sets {
    ips:       HashSet<IpAddr>,
    processes: HashSet<String>,
    subjects:  HashSet<String>,
}

#[derive(Debug, Default)]
pub struct SafeList {
    sets: RwLock<Sets>,
}

impl SafeList {
    pub fn from_config(config: &ResponseConfig) -> Self {
        Self {
            sets: RwLock::new(Sets {
                ips:       config.safe_ips.iter().copied().collect(),
                processes: config.safe_processes.iter().cloned().collect(),
                subjects:  config.safe_subjects.iter().cloned().collect(),
            }),
        }
    }

    pub fn contains(&self, subject: &str) -> bool {
        let sets = self.sets.read();
        if sets.subjects.contains(subject) {
            return true;
        }
        if let Ok(ip) = subject.parse::<IpAddr>() {
            return sets.ips.contains(&ip);
        }
        if sets.processes.contains(subject) {
            return true;
        }
        match subject.rsplit_once(':') {
            Some((name, pid)) if pid.parse::<u32>().is_ok() => sets.processes.contains(name),
            _ => false,
        }
    }

    pub fn add_ip(&self, ip: IpAddr) { self.sets.write().ips.insert(ip); }

    pub fn add_process(&self, name: impl Into<String>) { self.sets.write().processes.insert(name.into()); }

    pub fn add_subject(&self, subject: impl Into<String>) { self.sets.write().subjects.insert(subject.into()); }

    pub fn remove_ip(&self, ip: &IpAddr) -> bool { self.sets.write().ips.remove(ip) }

    pub fn remove_subject(&self, subject: &str) -> bool { self.sets.write().subjects.remove(subject) }
}
