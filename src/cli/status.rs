//! `status`: what was loaded where, from the load ledger.

use std::fmt::Write;
use std::path::Path;

use crate::state::{LoadRecord, now_unix};

/// Format an age in a human-readable way.
pub fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}

/// Loaded packages, flagging targets that no longer exist on disk.
pub fn format_status(records: &[LoadRecord], cache_root: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Cache: {}", cache_root.display());
    let _ = writeln!(out);
    let _ = writeln!(out, "Loaded packages ({})", records.len());
    if records.is_empty() {
        let _ = writeln!(out, "  (none)");
        return out;
    }

    let now = now_unix();
    for record in records {
        let missing = if record.target.exists() { "" } else { " [missing]" };
        let source = if record.sub_path.is_empty() {
            record.key.to_string()
        } else {
            format!("{}:{}", record.key, record.sub_path)
        };
        let short = record.commit.get(..12).unwrap_or(&record.commit);
        let _ = writeln!(out, "  {}{}", record.package_name, missing);
        let _ = writeln!(out, "    Target:   {}", record.target.display());
        let _ = writeln!(out, "    Source:   {}", source);
        let _ = writeln!(
            out,
            "    Version:  {} ({}, {})",
            record.ref_name, short, record.selector
        );
        let _ = writeln!(
            out,
            "    Loaded:   {} ago",
            format_age(now.saturating_sub(record.loaded_at).max(0) as u64)
        );
    }
    out
}
