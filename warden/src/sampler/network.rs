// warden/src/sampler/network.rs
//
// Network sampler.
//
//   host sample   subject = hostname
//                 bytes_per_sec, packets_per_sec (all interfaces, sysinfo)
//                 connections (non-listening TCP sockets)
//   peer samples  subject = remote IP, busiest peers first
//                 connections, established, distinct_local_ports,
//                 sensitive_port_connections (22, 23, 3389, 5900)
//
// Per-peer data comes from /proc/net/tcp and /proc/net/tcp6. Loopback and
// unspecified remotes are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Networks;
use tracing::debug;

use super::{host_subject, Sampler, SamplerError};
use crate::events::Sample;

const SENSITIVE_PORTS: [u16; 4] = [22, 23, 3389, 5900];
const TCP_ESTABLISHED: u8 = 0x01;
const TCP_LISTEN: u8 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpEntry {
    pub local:  SocketAddr,
    pub remote: SocketAddr,
    pub state:  u8,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PeerStats {
    pub connections: usize,
    pub established: usize,
    pub local_ports: BTreeSet<u16>,
    pub sensitive:   usize,
}

struct RateState {
    networks:  Networks,
    last_poll: Instant,
}

pub struct NetworkSampler {
    host:       String,
    tables:     Vec<PathBuf>,
    max_peers:  usize,
    rates:      Mutex<RateState>,
}

impl NetworkSampler {
    pub fn new() -> Self {
        Self {
            host:      host_subject(),
            tables:    vec!["/proc/net/tcp".into(), "/proc/net/tcp6".into()],
            max_peers: 32,
            rates:     Mutex::new(RateState {
                networks:  Networks::new_with_refreshed_list(),
                last_poll: Instant::now(),
            }),
        }
    }

    /// Read connection tables from other files (tests, containers).
    pub fn with_tables(mut self, tables: Vec<PathBuf>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_max_peers(mut self, n: usize) -> Self {
        self.max_peers = n;
        self
    }

    fn interface_rates(&self) -> (f64, f64) {
        let mut state = self.rates.lock();
        state.networks.refresh();
        let elapsed = state.last_poll.elapsed().as_secs_f64().max(1e-3);
        state.last_poll = Instant::now();

        let (mut bytes, mut packets) = (0u64, 0u64);
        for (_name, data) in state.networks.iter() {
            bytes += data.received() + data.transmitted();
            packets += data.packets_received() + data.packets_transmitted();
        }
        (bytes as f64 / elapsed, packets as f64 / elapsed)
    }
}

impl Default for NetworkSampler {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Sampler for NetworkSampler {
    fn name(&self) -> &str { "network" }

    async fn sample(&self) -> Result<Vec<Sample>, SamplerError> {
        let mut entries = Vec::new();
        let mut readable = 0;
        for path in &self.tables {
            match tokio::fs::read_to_string(path).await {
                Ok(raw) => {
                    readable += 1;
                    entries.extend(parse_proc_net_tcp(&raw));
                }
                Err(e) => debug!(path = %path.display(), error = %e, "connection table unreadable"),
            }
        }
        if readable == 0 && !self.tables.is_empty() {
            return Err(SamplerError::Unavailable("no readable TCP connection table".into()));
        }

        let (bytes_per_sec, packets_per_sec) = self.interface_rates();
        let open = entries.iter().filter(|e| e.state != TCP_LISTEN).count();

        let mut samples = vec![Sample::new(self.host.clone())
            .with("bytes_per_sec", bytes_per_sec)
            .with("packets_per_sec", packets_per_sec)
            .with("connections", open as f64)];

        let mut peers: Vec<(IpAddr, PeerStats)> = peer_stats(&entries).into_iter().collect();
        // Busiest first; IP order breaks ties so cycles are reproducible.
        peers.sort_by(|a, b| b.1.connections.cmp(&a.1.connections).then(a.0.cmp(&b.0)));
        for (ip, stats) in peers.into_iter().take(self.max_peers) {
            samples.push(
                Sample::new(ip.to_string())
                    .with("connections", stats.connections as f64)
                    .with("established", stats.established as f64)
                    .with("distinct_local_ports", stats.local_ports.len() as f64)
                    .with("sensitive_port_connections", stats.sensitive as f64),
            );
        }
        Ok(samples)
    }
}

// ── /proc/net/tcp parsing ────────────────────────────────────────────────────

/// Parse the kernel's TCP socket table. Malformed lines are skipped.
pub fn parse_proc_net_tcp(raw: &str) -> Vec<TcpEntry> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _slot = cols.next()?;
            let local = parse_endpoint(cols.next()?)?;
            let remote = parse_endpoint(cols.next()?)?;
            let state = u8::from_str_radix(cols.next()?, 16).ok()?;
            Some(TcpEntry { local, remote, state })
        })
        .collect()
}

fn parse_endpoint(s: &str) -> Option<SocketAddr> {
    let (addr, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(u32::from_str_radix(addr, 16).ok()?.to_ne_bytes())),
        32 => {
            // Four native-endian 32-bit words.
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            let v6 = Ipv6Addr::from(octets);
            v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Aggregate non-listening sockets by remote address.
pub fn peer_stats(entries: &[TcpEntry]) -> BTreeMap<IpAddr, PeerStats> {
    let mut peers: BTreeMap<IpAddr, PeerStats> = BTreeMap::new();
    for e in entries {
        let ip = e.remote.ip();
        if e.state == TCP_LISTEN || ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        let p = peers.entry(ip).or_default();
        p.connections += 1;
        if e.state == TCP_ESTABLISHED {
            p.established += 1;
        }
        p.local_ports.insert(e.local.port());
        if SENSITIVE_PORTS.contains(&e.local.port()) {
            p.sensitive += 1;
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    // Little-endian host encoding, as written by the kernel on x86/arm.
    const TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0 100 0 0 10 0
   1: 0F02000A:0016 0500000A:C350 01 00000000:00000000 00:00000000 00000000     0        0 2 1 0 20 4 30 10 -1
   2: 0F02000A:0050 0500000A:C351 06 00000000:00000000 00:00000000 00000000     0        0 3 1 0 20 4 30 10 -1
   3: 0F02000A:1F90 0500000A:C352 01 00000000:00000000 00:00000000 00000000     0        0 4 1 0 20 4 30 10 -1
   4: 0100007F:0CEA 0100007F:D000 01 00000000:00000000 00:00000000 00000000     0        0 5 1 0 20 4 30 10 -1
   5: garbage
";

    #[cfg(target_endian = "little")]
    #[test]
    fn parses_ipv4_table() {
        let entries = parse_proc_net_tcp(TABLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].local, "10.0.2.15:22".parse().unwrap());
        assert_eq!(entries[1].remote, "10.0.0.5:50000".parse().unwrap());
        assert_eq!(entries[1].state, TCP_ESTABLISHED);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn aggregates_peers_without_loopback() {
        let peers = peer_stats(&parse_proc_net_tcp(TABLE));
        assert_eq!(peers.len(), 1);
        let p = &peers[&"10.0.0.5".parse::<IpAddr>().unwrap()];
        assert_eq!(p.connections, 3);
        assert_eq!(p.established, 2);
        assert_eq!(p.local_ports.len(), 3);
        assert_eq!(p.sensitive, 1);
    }

    #[cfg(target_endian = "little")]
    #[tokio::test]
    async fn samples_host_and_peers_from_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcp");
        std::fs::write(&path, TABLE).unwrap();

        let sampler = NetworkSampler::new().with_tables(vec![path]);
        let samples = sampler.sample().await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].feature("connections"), Some(4.0));
        assert_eq!(samples[1].subject, "10.0.0.5");
        assert_eq!(samples[1].feature("distinct_local_ports"), Some(3.0));
    }

    #[tokio::test]
    async fn missing_tables_fail_the_cycle() {
        let sampler = NetworkSampler::new().with_tables(vec!["/nonexistent/warden/tcp".into()]);
        assert!(matches!(sampler.sample().await, Err(SamplerError::Unavailable(_))));
    }
}
