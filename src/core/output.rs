//! Human-readable rendering for `--format text`.
//!
//! JSON stays the primary output; these helpers keep the text form bounded
//! and scannable in a terminal.

use colored::Colorize;

use crate::core::diff::ChangeSet;
use crate::core::model::LadderResult;
use crate::core::probe::Probe;
use crate::core::snapshot::{Snapshot, SnapshotSummary};

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render up to `max_items` messages with compact formatting.
pub fn preview_messages(messages: &[String], max_items: usize, max_chars: usize) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let shown = messages
        .iter()
        .take(max_items)
        .map(|m| compact_line(m, max_chars))
        .collect::<Vec<_>>()
        .join(" | ");
    if messages.len() > max_items {
        format!("{} (+{} more)", shown, messages.len() - max_items)
    } else {
        shown
    }
}

fn confidence_label(confidence: f64) -> String {
    let text = format!("{:.2}", confidence);
    if confidence >= 0.7 {
        text.green().to_string()
    } else if confidence > 0.0 {
        text.yellow().to_string()
    } else {
        text.red().to_string()
    }
}

pub fn render_ladder(result: &LadderResult, probe: &dyn Probe) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "{} {} (levels 1..={})",
        "target".bold(),
        result.target.to_string().bright_cyan(),
        result.max_level_requested
    ));
    for level in result.levels.values() {
        let source = if level.from_cache { " [cached]" } else { "" };
        out.push(format!(
            "  L{} {:<12} {}{}",
            level.level,
            probe.level_name(level.level),
            confidence_label(level.confidence),
            source.dimmed()
        ));
        if !level.warnings.is_empty() {
            out.push(format!(
                "      {}",
                preview_messages(&level.warnings, 3, 100).yellow()
            ));
        }
    }
    if let Some(halt) = &result.halted {
        out.push(format!(
            "  {} at L{}: {}",
            "halted".red().bold(),
            halt.level,
            compact_line(&halt.reason, 120)
        ));
    }
    out.push(format!(
        "{} {}",
        "overall".bold(),
        confidence_label(result.overall_confidence)
    ));
    out.join("\n")
}

pub fn render_snapshot(snapshot: &Snapshot) -> String {
    let line = format!(
        "{} {} {} L{} entities={} size={} confidence={}",
        "snapshot".bold(),
        snapshot.snapshot_id.bright_cyan(),
        snapshot.target,
        snapshot.discovery_level,
        snapshot.statistics.entity_count,
        snapshot.statistics.total_size,
        confidence_label(snapshot.statistics.overall_confidence)
    );
    match &snapshot.halted {
        Some(halt) => format!(
            "{}\n  {} at L{}: {}",
            line,
            "partial".yellow(),
            halt.level,
            halt.reason
        ),
        None => line,
    }
}

pub fn render_snapshot_list(rows: &[SnapshotSummary]) -> String {
    if rows.is_empty() {
        return "no snapshots".dimmed().to_string();
    }
    rows.iter()
        .map(|r| {
            format!(
                "{}  {}  {}  L{}  {} entities  {}",
                r.snapshot_id.bright_cyan(),
                r.timestamp,
                r.target,
                r.discovery_level,
                r.entity_count,
                confidence_label(r.overall_confidence)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_changes(changes: &ChangeSet) -> String {
    let mut out = vec![format!(
        "{} {} -> {}",
        "diff".bold(),
        changes.base,
        changes.target
    )];
    if changes.is_empty() {
        out.push("  no entity changes".dimmed().to_string());
    }
    for path in &changes.added {
        out.push(format!("  {} {}", "+".green().bold(), path));
    }
    for path in &changes.removed {
        out.push(format!("  {} {}", "-".red().bold(), path));
    }
    for path in &changes.modified {
        out.push(format!("  {} {}", "~".yellow().bold(), path));
    }
    for (key, delta) in &changes.aggregate_deltas {
        if *delta != 0 {
            out.push(format!("  {} {:+}", key, delta));
        }
    }
    out.join("\n")
}
