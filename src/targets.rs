use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

/// Extract the host from one line of a host list.
///
/// Accepts bare hostnames and ranked CSV lines (`rank,host[,...]`). Blank
/// lines and `#` comments yield `None`.
pub fn parse_host_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let host = match line.split_once(',') {
        Some((_rank, rest)) => rest.split(',').next().unwrap_or_default().trim(),
        None => line,
    };

    (!host.is_empty()).then(|| host.to_string())
}

/// Read at most `count` hosts from `reader`, in order
pub fn read_hosts<R: BufRead>(reader: R, count: usize) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for line in reader.lines() {
        if hosts.len() >= count {
            break;
        }
        let line = line.context("Failed to read host list")?;
        if let Some(host) = parse_host_line(&line) {
            hosts.push(host);
        }
    }
    Ok(hosts)
}

/// Load the host list at `path`
pub fn load_hosts(path: &Path, count: usize) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open host list: {:?}", path))?;
    read_hosts(BufReader::new(file), count)
}
