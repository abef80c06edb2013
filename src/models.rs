use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Ports probed when none are configured
pub const DEFAULT_PORTS: [u16; 2] = [80, 443];
/// MPTCP versions probed when none are configured
pub const DEFAULT_VERSIONS: [u8; 2] = [0, 1];
/// Highest version that fits the 4-bit version field
pub const MAX_MPTCP_VERSION: u8 = 15;

/// Classification of one MPTCP probe.
///
/// The boolean classifiers are independent of each other except where the
/// probe orders them: at most one of `no_mptcp_option`, `wrong_receiver_key`
/// and `wrong_version` is ever set, and `timeout` excludes all the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MptcpResult {
    pub sender_version: u8,
    pub receiver_version: u8,
    /// Raw control-flag bits of the response
    pub flags: u8,

    #[serde(rename = "NoMPTCPOption")]
    pub no_mptcp_option: bool,
    pub wrong_version: bool,
    pub wrong_receiver_key: bool,
    #[serde(rename = "RST")]
    pub rst: bool,
    #[serde(rename = "SYNACK")]
    pub syn_ack: bool,
    pub timeout: bool,

    /// Round-trip time from transmit to the matching response.
    /// Absent when the probe timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl MptcpResult {
    pub fn new(sender_version: u8) -> Self {
        Self { sender_version, ..Self::default() }
    }

    /// A probe whose peer completed the handshake with a well-formed
    /// MP_CAPABLE option.
    pub fn is_mptcp_capable(&self) -> bool {
        !self.no_mptcp_option && !self.wrong_version && !self.wrong_receiver_key && !self.timeout && self.syn_ack
    }

    pub fn set_latency(&mut self, elapsed: Duration) {
        self.latency_ms = Some(elapsed.as_secs_f64() * 1000.0);
    }
}

/// Outcome of every probe against one port of one host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortResult {
    pub port: u16,
    #[serde(rename = "TCPConnectable")]
    pub tcp_connectable: bool,
    /// One entry per probed version, in probe order. Empty when the port
    /// was not connectable.
    #[serde(rename = "MPTCPResults", default, deserialize_with = "null_as_empty")]
    pub mptcp_results: Vec<MptcpResult>,
}

impl PortResult {
    pub fn unconnectable(port: u16) -> Self {
        Self { port, tcp_connectable: false, mptcp_results: Vec::new() }
    }
}

/// Everything learned about one host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanResult {
    pub host: String,
    /// Resolved IPv4 address, empty when resolution failed
    pub address: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub port_results: Vec<PortResult>,
}

impl ScanResult {
    pub fn unresolved(host: &str) -> Self {
        Self { host: host.to_string(), address: String::new(), port_results: Vec::new() }
    }

    pub fn is_resolved(&self) -> bool {
        !self.address.is_empty()
    }
}

// Result documents from older scans carry `null` where a list was never filled
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Error types for port and version list parsing
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Invalid port number: {0}")]
    InvalidPort(String),

    #[error("Port range start is greater than end: {0} > {1}")]
    RangeStartGreaterThanEnd(u16, u16),

    #[error("Invalid MPTCP version: {0} (expected 0-15)")]
    InvalidVersion(String),

    #[error("Empty list")]
    Empty,
}

/// Single port or range of ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRange {
    Single(u16),
    Range(u16, u16),
}

impl PortRange {
    /// Parse a string like "80,443,8000-9000" into a vector of PortRange
    pub fn parse(port_str: &str) -> Result<Vec<Self>, PortRangeError> {
        let mut ranges = Vec::new();

        for part in port_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((start_str, end_str)) = part.split_once('-') {
                let start = parse_port(start_str)?;
                let end = parse_port(end_str)?;

                // Make sure start <= end
                if start > end {
                    return Err(PortRangeError::RangeStartGreaterThanEnd(start, end));
                }

                ranges.push(PortRange::Range(start, end));
            } else {
                ranges.push(PortRange::Single(parse_port(part)?));
            }
        }

        if ranges.is_empty() {
            return Err(PortRangeError::Empty);
        }
        Ok(ranges)
    }

    /// Flatten parsed ranges into individual ports, keeping order and
    /// dropping repeats.
    pub fn expand(ranges: &[PortRange]) -> Vec<u16> {
        let mut ports = Vec::new();
        for range in ranges {
            let (start, end) = match *range {
                PortRange::Single(port) => (port, port),
                PortRange::Range(start, end) => (start, end),
            };
            for port in start..=end {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports
    }
}

fn parse_port(value: &str) -> Result<u16, PortRangeError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(PortRangeError::InvalidPort(value.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Parse a comma-separated list of MPTCP versions such as "0,1"
pub fn parse_versions(version_str: &str) -> Result<Vec<u8>, PortRangeError> {
    let mut versions = Vec::new();
    for part in version_str.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        match part.parse::<u8>() {
            Ok(version) if version <= MAX_MPTCP_VERSION => {
                if !versions.contains(&version) {
                    versions.push(version);
                }
            }
            _ => return Err(PortRangeError::InvalidVersion(part.to_string())),
        }
    }

    if versions.is_empty() {
        return Err(PortRangeError::Empty);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ports_and_ranges() {
        let ranges = PortRange::parse("80, 443,8000-8002").unwrap();
        assert_eq!(
            ranges,
            vec![PortRange::Single(80), PortRange::Single(443), PortRange::Range(8000, 8002)]
        );
        assert_eq!(PortRange::expand(&ranges), vec![80, 443, 8000, 8001, 8002]);
    }

    #[test]
    fn expand_drops_repeated_ports() {
        let ranges = PortRange::parse("443,80-81,443").unwrap();
        assert_eq!(PortRange::expand(&ranges), vec![443, 80, 81]);
    }

    #[test]
    fn rejects_bad_port_lists() {
        assert_eq!(PortRange::parse("http"), Err(PortRangeError::InvalidPort("http".into())));
        assert_eq!(PortRange::parse("0"), Err(PortRangeError::InvalidPort("0".into())));
        assert_eq!(PortRange::parse("90-80"), Err(PortRangeError::RangeStartGreaterThanEnd(90, 80)));
        assert_eq!(PortRange::parse(" , "), Err(PortRangeError::Empty));
    }

    #[test]
    fn parses_versions() {
        assert_eq!(parse_versions("0,1").unwrap(), vec![0, 1]);
        assert_eq!(parse_versions("1, 1 ,0").unwrap(), vec![1, 0]);
        assert_eq!(parse_versions("16"), Err(PortRangeError::InvalidVersion("16".into())));
        assert_eq!(parse_versions(""), Err(PortRangeError::Empty));
    }

    #[test]
    fn serializes_with_pascal_case_field_names() {
        let mut probe = MptcpResult::new(1);
        probe.syn_ack = true;
        probe.flags = 0x12;
        let result = ScanResult {
            host: "example.com".into(),
            address: "93.184.216.34".into(),
            port_results: vec![PortResult { port: 80, tcp_connectable: true, mptcp_results: vec![probe] }],
        };

        let json = serde_json::to_value(&result).unwrap();
        let port = &json["PortResults"][0];
        assert_eq!(json["Host"], "example.com");
        assert_eq!(port["TCPConnectable"], true);
        assert_eq!(port["MPTCPResults"][0]["SYNACK"], true);
        assert_eq!(port["MPTCPResults"][0]["NoMPTCPOption"], false);
        assert_eq!(port["MPTCPResults"][0]["SenderVersion"], 1);
        assert!(port["MPTCPResults"][0].get("LatencyMs").is_none());
    }

    #[test]
    fn reads_older_documents_without_latency() {
        let json = r#"[{"Host":"a.example","Address":"","PortResults":null}]"#;
        let parsed: Vec<ScanResult> = serde_json::from_str(json).unwrap();
        assert!(!parsed[0].is_resolved());
        assert!(parsed[0].port_results.is_empty());

        let json = r#"[{"Host":"a.example","Address":"1.2.3.4","PortResults":[
            {"Port":443,"TCPConnectable":false,"MPTCPResults":null},
            {"Port":80,"TCPConnectable":true,"MPTCPResults":[
                {"SenderVersion":0,"ReceiverVersion":0,"Flags":18,"NoMPTCPOption":false,
                 "WrongVersion":false,"WrongReceiverKey":false,"RST":false,"SYNACK":true,"Timeout":false}]}]}]"#;
        let parsed: Vec<ScanResult> = serde_json::from_str(json).unwrap();
        assert!(parsed[0].port_results[0].mptcp_results.is_empty());
        assert!(parsed[0].port_results[1].mptcp_results[0].is_mptcp_capable());
    }
}
