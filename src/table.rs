//! Two-column field/value table of a host and its datastores.

use hvctl_esxi::status::{OverallStatus, PowerState};
use hvctl_esxi::types::{DatastoreListing, HostInfo};

const GIB: u64 = 1024 * 1024 * 1024;

fn overall_label(status: OverallStatus) -> &'static str {
    match status {
        OverallStatus::Normal => "Normal (green)",
        OverallStatus::Warning => "Warning (yellow)",
        OverallStatus::Error => "Error (red)",
        OverallStatus::Unknown => "Unknown (gray)",
    }
}

fn power_label(state: PowerState) -> &'static str {
    match state {
        PowerState::PoweredOn => "Powered on",
        PowerState::PoweredOff => "Powered off",
        PowerState::Standby => "Standby",
        PowerState::Unknown => "Unknown",
    }
}

/// Rows in display order: host fields, then one row per datastore, then
/// one row per datastore that could not be read.
pub fn rows(host: &HostInfo, listing: &DatastoreListing) -> Vec<(String, String)> {
    let mut name = host.name.clone();
    if host.stale {
        name.push_str(" (stale)");
    }
    let mut rows = vec![
        ("Host name".to_string(), name),
        ("Overall status".to_string(), overall_label(host.overall_status).to_string()),
        ("Power state".to_string(), power_label(host.power_state).to_string()),
        ("CPU".to_string(), format!("{} MHz", host.cpu_mhz)),
        ("Memory".to_string(), format!("{} GB", host.memory_bytes / GIB)),
        ("Datastores".to_string(), format!("{} disk(s)", host.datastore_refs.len())),
    ];

    for ds in &listing.datastores {
        rows.push((
            ds.name.clone(),
            format!(
                "Capacity: {} GB, Free: {} GB, Used: {} GB",
                ds.capacity_bytes / GIB,
                ds.free_bytes / GIB,
                ds.used_bytes() / GIB
            ),
        ));
    }
    for (reference, err) in &listing.failures {
        rows.push((reference.value.clone(), format!("Unavailable: {}", err.message)));
    }
    rows
}

/// Render rows as a boxed ASCII table with a `Field | Value` header.
pub fn render(rows: &[(String, String)]) -> String {
    let header = ("Field", "Value");
    let width = |s: &str| s.chars().count();
    let left = rows
        .iter()
        .map(|(k, _)| width(k))
        .chain([width(header.0)])
        .max()
        .unwrap_or(0);
    let right = rows
        .iter()
        .map(|(_, v)| width(v))
        .chain([width(header.1)])
        .max()
        .unwrap_or(0);

    let rule = format!("+{}+{}+\n", "-".repeat(left + 2), "-".repeat(right + 2));
    let line = |k: &str, v: &str| format!("| {k:<left$} | {v:<right$} |\n");

    let mut out = String::new();
    out.push_str(&rule);
    out.push_str(&line(header.0, header.1));
    out.push_str(&rule);
    for (k, v) in rows {
        out.push_str(&line(k, v));
    }
    out.push_str(&rule);
    out
}
