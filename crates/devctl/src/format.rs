//! Plain-text rendering of entries and resource snapshots.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use devctl_core::{EntryKind, EntrySummary, ResourceSnapshot};

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Formats a byte count with binary units, one decimal above bytes.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = UNITS.first().copied().unwrap_or("B");

    for next in UNITS.iter().skip(1) {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = *next;
    }

    if unit == "B" {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {unit}")
    }
}

/// Compact age like `45s`, `12m`, `3h`, `2d`.
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

/// Renders `ls` output. An empty list gets a one-line hint.
pub fn format_entries(entries: &[EntrySummary], now: DateTime<Utc>) -> String {
    if entries.is_empty() {
        return "No services or jobs running.\n".to_string();
    }

    let id_width = entries
        .iter()
        .map(|e| e.id.as_str().len())
        .max()
        .unwrap_or(0)
        .max(2);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<id_width$}  {:<7}  {:<11}  {:>7}  {:>8}  {:>6}  COMMAND",
        "ID", "KIND", "STATE", "PID", "RESTARTS", "UP"
    );

    for entry in entries {
        let kind = match entry.kind {
            EntryKind::Service => "service",
            EntryKind::Job => "job",
        };
        let pid = entry
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let up = match (entry.pid, entry.last_start) {
            (Some(_), Some(started)) => format_age(started, now),
            _ => "-".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<id_width$}  {:<7}  {:<11}  {:>7}  {:>8}  {:>6}  {}",
            entry.id.as_str(),
            kind,
            entry.state.label(),
            pid,
            entry.restart_count,
            up,
            entry.command
        );
    }

    out
}

/// Renders one `top` frame.
pub fn format_snapshot(snapshot: &ResourceSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "memory {} / {} (peak {})  cpus {}  services {}  jobs {}  repositories {}",
        format_bytes(snapshot.used_memory_bytes),
        format_bytes(snapshot.total_memory_bytes),
        format_bytes(snapshot.peak_memory_bytes),
        snapshot.cpu_count,
        snapshot.active_services,
        snapshot.active_jobs,
        snapshot.repository_count,
    );

    let mut roots: Vec<_> = snapshot.roots.iter().collect();
    roots.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes));

    let id_width = roots.iter().map(|r| r.id.len()).max().unwrap_or(0).max(4);
    let _ = writeln!(out, "{:<id_width$}  {:>7}  {:>5}  {:>10}", "ROOT", "PID", "PROCS", "MEMORY");
    for root in roots {
        let _ = writeln!(
            out,
            "{:<id_width$}  {:>7}  {:>5}  {:>10}",
            root.id,
            root.pid,
            root.process_count,
            format_bytes(root.memory_bytes)
        );
    }

    if !snapshot.containers.is_empty() {
        let _ = writeln!(
            out,
            "containers {}",
            format_bytes(snapshot.container_memory_bytes)
        );
        for container in &snapshot.containers {
            let _ = writeln!(
                out,
                "  {:<30}  {:>10}",
                container.name,
                format_bytes(container.memory_bytes)
            );
        }
    }

    out
}
