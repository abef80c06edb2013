use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::models::{PortResult, ScanResult, DEFAULT_PORTS, DEFAULT_VERSIONS};
use crate::probe::{ProbeError, ProbeRequest, Prober, RawChannel, DEFAULT_SOURCE_PORT};

/// Timeout for the plain TCP connect that gates each port's probes
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Where source-port allocation wraps to once it runs past 65535
const EPHEMERAL_PORT_START: u16 = 49152;

/// Scan settings shared by every host
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Source address of every probe
    pub local: Ipv4Addr,
    pub ports: Vec<u16>,
    pub versions: Vec<u8>,
    pub connect_timeout: Duration,
    /// First source port handed out; the only one used when hosts are
    /// scanned one at a time
    pub source_port: u16,
    /// Hosts scanned concurrently
    pub concurrency: usize,
}

impl ScanConfig {
    pub fn new(local: Ipv4Addr) -> Self {
        Self {
            local,
            ports: DEFAULT_PORTS.to_vec(),
            versions: DEFAULT_VERSIONS.to_vec(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            source_port: DEFAULT_SOURCE_PORT,
            concurrency: 1,
        }
    }
}

/// Hands out source ports so that no two in-flight probes share one.
///
/// A lease always starts its search at the base port, so with a single probe
/// in flight every probe uses the base port.
pub struct SourcePorts {
    base: u16,
    leased: Mutex<HashSet<u16>>,
}

/// A source port held for the lifetime of one probe
pub struct PortLease<'a> {
    port: u16,
    pool: &'a SourcePorts,
}

impl PortLease<'_> {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        self.pool.leased.lock().remove(&self.port);
    }
}

impl SourcePorts {
    pub fn new(base: u16) -> Self {
        Self { base, leased: Mutex::new(HashSet::new()) }
    }

    pub fn lease(&self) -> PortLease<'_> {
        let mut leased = self.leased.lock();
        let mut port = self.base;
        while leased.contains(&port) {
            port = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
        }
        leased.insert(port);
        PortLease { port, pool: self }
    }
}

/// First IPv4 address of `host`, or `None` when it does not resolve to one
pub async fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => addrs.into_iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(ipv4) => Some(ipv4),
            IpAddr::V6(_) => None,
        }),
        Err(e) => {
            debug!("DNS resolution failed for hostname {}: {}", host, e);
            None
        }
    }
}

/// Whether a plain TCP connect to `remote:port` completes within `timeout`
pub async fn tcp_connectable(remote: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(remote), port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("Connect to {} failed: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("Connect to {} timed out after {:?}", addr, timeout);
            false
        }
    }
}

/// Walks hosts, ports and versions and assembles the result tree.
pub struct MptcpScanner<C> {
    config: ScanConfig,
    prober: Prober<C>,
    source_ports: SourcePorts,
}

impl<C: RawChannel> MptcpScanner<C> {
    pub fn new(config: ScanConfig, prober: Prober<C>) -> Self {
        let source_ports = SourcePorts::new(config.source_port);
        Self { config, prober, source_ports }
    }

    /// Scan every host, returning results in input order.
    ///
    /// A raw socket failure ends the whole scan: it means the process lacks
    /// the privilege to probe at all.
    pub async fn scan_hosts(&self, hosts: Vec<String>) -> Result<Vec<ScanResult>, ProbeError> {
        info!(
            "Scanning {} hosts from {} (ports {:?}, versions {:?}, {} at a time)",
            hosts.len(),
            self.config.local,
            self.config.ports,
            self.config.versions,
            self.config.concurrency
        );

        stream::iter(hosts)
            .map(|host| async move { self.scan_host(&host).await })
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Resolve, connect-test and probe one host
    pub async fn scan_host(&self, host: &str) -> Result<ScanResult, ProbeError> {
        let Some(remote) = resolve_ipv4(host).await else {
            warn!("= {} could not be resolved to an IPv4 address", host);
            return Ok(ScanResult::unresolved(host));
        };
        info!("= {} <==> {}", host, remote);

        let mut result = ScanResult { host: host.to_string(), address: remote.to_string(), port_results: Vec::new() };
        for &port in &self.config.ports {
            result.port_results.push(self.scan_port(remote, port).await?);
        }
        Ok(result)
    }

    async fn scan_port(&self, remote: Ipv4Addr, port: u16) -> Result<PortResult, ProbeError> {
        if !tcp_connectable(remote, port, self.config.connect_timeout).await {
            info!("== {}:{} unconnected, skipping MPTCP probes", remote, port);
            return Ok(PortResult::unconnectable(port));
        }

        let mut port_result = PortResult { port, tcp_connectable: true, mptcp_results: Vec::new() };
        for &version in &self.config.versions {
            let lease = self.source_ports.lease();
            let request = ProbeRequest {
                local: self.config.local,
                remote,
                port,
                version,
                source_port: lease.port(),
            };

            let outcome = self.prober.probe(request).await?;
            match outcome.elapsed {
                Some(elapsed) => info!("== {}:{} v{} answered in {:?}", remote, port, version, elapsed),
                None => info!("== {}:{} v{} timed out after {:?}", remote, port, version, self.prober.timeout()),
            }
            port_result.mptcp_results.push(outcome.result);
        }
        Ok(port_result)
    }
}
