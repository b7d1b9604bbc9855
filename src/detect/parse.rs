//! Text parsing helpers for detection probes.
//!
//! All of these tolerate malformed input by returning empty/zero results.
//! A probe that cannot be parsed yields a thinner inventory, never an error.

use std::collections::BTreeMap;
use std::process::Command;

/// Parse a `docker ps` port column into the first published host port and
/// its protocol.
///
/// Accepts strings like `0.0.0.0:8443->8443/tcp, :::8443->8443/tcp` or
/// `8080/tcp` (unpublished). Returns `None` when nothing is published.
pub fn parse_port_binding(ports: &str) -> Option<(u16, String)> {
    for segment in ports.split(',') {
        let segment = segment.trim();
        let Some((host_part, container_part)) = segment.split_once("->") else {
            continue;
        };
        let Some((_, port_str)) = host_part.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };
        let protocol = container_part
            .rsplit_once('/')
            .map(|(_, proto)| proto.trim().to_string())
            .unwrap_or_else(|| "tcp".to_string());
        return Some((port, protocol));
    }
    None
}

/// Parse a `docker ps` label column (`k=v,k2=v2`) into a map.
///
/// Entries without a separator are skipped.
pub fn parse_labels(labels: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in labels.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((key, value)) = entry.split_once('=') {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Identify the process listening on a TCP port: `(pid, name)`.
///
/// Asks `ss` for the socket owner first, falling back to an `lsof` table
/// scan. Both are best-effort; `None` means the occupier stays anonymous.
pub fn port_owner(port: u16) -> Option<(u32, String)> {
    port_owner_ss(port).or_else(|| port_owner_lsof(port))
}

fn port_owner_ss(port: u16) -> Option<(u32, String)> {
    let output = Command::new("ss")
        .args(["-H", "-tlnp", &format!("sport = :{}", port)])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let users_part = line.split_whitespace().last()?;
        for part in users_part.split(',') {
            if let Some(pid_str) = part.strip_prefix("pid=") {
                if let Ok(pid) = pid_str.parse::<u32>() {
                    let name = std::fs::read_to_string(format!("/proc/{}/comm", pid))
                        .map(|s| s.trim().to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    return Some((pid, name));
                }
            }
        }
    }
    None
}

fn port_owner_lsof(port: u16) -> Option<(u32, String)> {
    let output = Command::new("lsof")
        .args(["-i", &format!(":{}", port), "-P", "-n", "-F", "pcn"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    // Field format: pPID, cCOMMAND, nNAME; the first complete pair wins.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut pid: Option<u32> = None;
    for line in stdout.lines() {
        if let Some(stripped) = line.strip_prefix('p') {
            pid = stripped.parse::<u32>().ok();
        } else if let Some(stripped) = line.strip_prefix('c') {
            if let Some(pid) = pid {
                return Some((pid, stripped.to_string()));
            }
        }
    }
    pid.map(|p| (p, "unknown".to_string()))
}
