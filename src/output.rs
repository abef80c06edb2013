use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use crate::models::{MptcpResult, PortResult, ScanResult};

/// Save scan results to a JSON file
pub fn save_json_results(results: &[ScanResult], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {:?}", output_path))?;

    file.write_all(json.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", output_path))?;

    Ok(())
}

/// Load a result document, including ones from earlier scans without `LatencyMs`
pub fn load_json_results(input_path: &Path) -> Result<Vec<ScanResult>> {
    let file = File::open(input_path)
        .with_context(|| format!("Failed to open result file: {:?}", input_path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse result file: {:?}", input_path))
}

/// Aggregate statistics over a finished scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub mptcp_hosts: Vec<String>,
    pub wrong_receiver_key_hosts: Vec<String>,
    pub unresolved: usize,
    pub unconnected: usize,
    pub timeout_port80: usize,
    pub timeout_port443: usize,
    pub timeout_either: usize,
    pub timeout_both: usize,
}

fn any_probe(result: &ScanResult, predicate: impl Fn(&MptcpResult) -> bool) -> bool {
    result.is_resolved()
        && result
            .port_results
            .iter()
            .any(|port| port.tcp_connectable && port.mptcp_results.iter().any(&predicate))
}

// Vacuously true when the port was never connectable
fn all_timed_out(result: &ScanResult, port: u16) -> bool {
    result
        .port_results
        .iter()
        .filter(|p| p.tcp_connectable && p.port == port)
        .all(|p| p.mptcp_results.iter().all(|m| m.timeout))
}

fn has_wrong_receiver_key(m: &MptcpResult) -> bool {
    !m.no_mptcp_option && !m.wrong_version && m.wrong_receiver_key && !m.timeout && m.syn_ack
}

impl Summary {
    pub fn from_results(results: &[ScanResult]) -> Self {
        let mut summary = Summary { total: results.len(), ..Summary::default() };

        for result in results {
            if !result.is_resolved() {
                summary.unresolved += 1;
                continue;
            }

            if any_probe(result, MptcpResult::is_mptcp_capable) {
                summary.mptcp_hosts.push(result.host.clone());
            }
            if any_probe(result, has_wrong_receiver_key) {
                summary.wrong_receiver_key_hosts.push(result.host.clone());
            }
            if result.port_results.iter().all(|p| !p.tcp_connectable) {
                summary.unconnected += 1;
            }

            let (on_80, on_443) = (all_timed_out(result, 80), all_timed_out(result, 443));
            summary.timeout_port80 += on_80 as usize;
            summary.timeout_port443 += on_443 as usize;
            summary.timeout_either += (on_80 || on_443) as usize;
            summary.timeout_both += (on_80 && on_443) as usize;
        }

        summary
    }
}

fn describe_probe(m: &MptcpResult) -> String {
    if m.timeout {
        return style("timeout").dim().to_string();
    }
    if m.is_mptcp_capable() {
        return style(format!("MPTCP v{}", m.receiver_version)).green().bold().to_string();
    }

    let mut notes = Vec::new();
    if m.rst {
        notes.push("RST");
    }
    if m.no_mptcp_option {
        notes.push("no option");
    }
    if m.wrong_version {
        notes.push("wrong version");
    }
    if m.wrong_receiver_key {
        notes.push("echoed key");
    }
    if m.syn_ack {
        notes.push("SYN-ACK");
    }
    style(notes.join(", ")).yellow().to_string()
}

fn print_port(port: &PortResult) {
    if !port.tcp_connectable {
        println!("  {:<6} {}", port.port, style("unconnected").red());
        return;
    }

    let probes: Vec<String> = port
        .mptcp_results
        .iter()
        .map(|m| format!("v{}: {}", m.sender_version, describe_probe(m)))
        .collect();
    println!("  {:<6} {}", style(port.port).yellow().bold(), probes.join("  "));
}

/// Print per-host results to the console
pub fn print_results(results: &[ScanResult]) {
    println!("{}", style("MPTCP Scan Results").cyan().bold());
    for result in results {
        if !result.is_resolved() {
            println!("{} {}", style(&result.host).green(), style("(unresolved)").red());
            continue;
        }
        println!("{} ({})", style(&result.host).green(), result.address);
        for port in &result.port_results {
            print_port(port);
        }
    }
    println!();
}

/// Print aggregate statistics to the console
pub fn print_summary(summary: &Summary) {
    println!("{}", style("Summary").cyan().bold());
    println!("{}", style("=======").cyan());
    println!("Hosts scanned: {}", summary.total);
    println!("MPTCP hosts: {}", style(summary.mptcp_hosts.len()).green().bold());
    for host in &summary.mptcp_hosts {
        println!("  - {}", host);
    }
    println!("Wrong receiver key hosts: {}", style(summary.wrong_receiver_key_hosts.len()).yellow().bold());
    for host in &summary.wrong_receiver_key_hosts {
        println!("  - {}", host);
    }
    println!("Unresolved hosts: {}", summary.unresolved);
    println!("Unconnected hosts: {}", summary.unconnected);
    println!(
        "Timeout hosts: {} (port 80: {}, port 443: {}, both: {})",
        summary.timeout_either, summary.timeout_port80, summary.timeout_port443, summary.timeout_both
    );
}
