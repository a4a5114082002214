//! Text tables for batch loads, batch publishes and the cache listing.

use std::fmt::Write;
use std::path::Path;

use crate::cache::CacheEntry;
use crate::cli::status::format_age;
use crate::load::BatchReport;
use crate::publish::PublishResult;
use crate::state::now_unix;

/// One line per package, then `Summary: X/N packages loaded successfully`.
pub fn format_batch_report(report: &BatchReport, project_root: &Path) -> String {
    let width = report
        .results
        .iter()
        .map(|r| r.package_name.len())
        .max()
        .unwrap_or(0)
        .max("PACKAGE".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<7}  {:<12}  {}", "PACKAGE", "STATUS", "COMMIT", "DETAIL");
    let _ = writeln!(out, "{}", "-".repeat(width + 40));
    for result in &report.results {
        match &result.outcome {
            Ok(loaded) => {
                let target = loaded
                    .target
                    .strip_prefix(project_root)
                    .unwrap_or(&loaded.target);
                let mut detail = format!("{} -> {}", loaded.resolved.ref_name, target.display());
                if let Some(hook) = &loaded.hook {
                    if !hook.ran {
                        detail.push_str(" (post-load skipped)");
                    }
                }
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:<12}  {}",
                    result.package_name,
                    "SUCCESS",
                    loaded.resolved.short(),
                    detail
                );
            }
            Err(err) => {
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:<12}  {}",
                    result.package_name, "FAILED", "-", err
                );
            }
        }
    }
    let _ = writeln!(
        out,
        "\nSummary: {}/{} packages loaded successfully",
        report.successes().count(),
        report.len()
    );
    out
}

/// One line per published package, then
/// `Summary: X/N packages published successfully`.
pub fn format_publish_report(results: &[PublishResult]) -> String {
    let width = results
        .iter()
        .map(|r| r.package_name.len())
        .max()
        .unwrap_or(0)
        .max("PACKAGE".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<7}  {:<12}  {}", "PACKAGE", "STATUS", "COMMIT", "DETAIL");
    let _ = writeln!(out, "{}", "-".repeat(width + 40));
    for result in results {
        match &result.outcome {
            Ok(outcome) => {
                let mut detail = match &outcome.tag {
                    Some(tag) => format!("tagged {}", tag.name),
                    None => "untagged".to_string(),
                };
                if outcome.commit.is_none() {
                    detail.push_str(", no changes");
                }
                if outcome.pushed {
                    detail.push_str(", pushed");
                }
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:<12}  {}",
                    result.package_name,
                    "SUCCESS",
                    outcome.head.get(..12).unwrap_or(&outcome.head),
                    detail
                );
            }
            Err(err) => {
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:<12}  {}",
                    result.package_name, "FAILED", "-", err
                );
            }
        }
    }
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let _ = writeln!(
        out,
        "\nSummary: {}/{} packages published successfully",
        succeeded,
        results.len()
    );
    out
}

/// Cached mirrors with their size and fetch age.
pub fn format_cache_list(entries: &[CacheEntry]) -> String {
    if entries.is_empty() {
        return "No repositories cached\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<50} {:>6} {:>10} {:>12}", "REPO", "REFS", "SIZE", "LAST FETCH");
    let _ = writeln!(out, "{}", "-".repeat(81));
    let now = now_unix();
    for entry in entries {
        let fetched = entry
            .last_fetch
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| format_age(now.saturating_sub(d.as_secs() as i64).max(0) as u64))
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(
            out,
            "{:<50} {:>6} {:>10} {:>12}",
            entry.key.to_string(),
            entry.known_refs.len(),
            format_size(entry.size_bytes()),
            fetched
        );
    }
    out
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
