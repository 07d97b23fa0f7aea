//! Unified-diff digestion for DIFF_SUMMARY events.

use diffy::{Line, Patch};
use tracing::debug;

/// Aggregate statistics for one provider-produced diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Number of files in the diff.
    pub files_changed: u64,
    /// Added line count.
    pub insertions: u64,
    /// Removed line count.
    pub deletions: u64,
}

/// Summarize a (possibly multi-file) unified diff.
///
/// Each file section is parsed with [`diffy::Patch`] for hunk-accurate
/// counts; a section diffy cannot parse falls back to counting `+`/`-`
/// lines directly, so a slightly off-spec diff still yields a usable
/// summary.
#[must_use]
pub fn summarize_unified(unified: &str) -> DiffStats {
    let mut stats = DiffStats::default();

    for section in split_file_sections(unified) {
        stats.files_changed += 1;
        // diffy expects the section to begin at its `--- ` header; strip
        // any `diff --git` / `index` preamble lines first.
        let body = section
            .find("--- ")
            .map_or(section.as_str(), |at| &section[at..]);
        match Patch::from_str(body) {
            Ok(patch) => {
                for hunk in patch.hunks() {
                    for line in hunk.lines() {
                        match line {
                            Line::Insert(_) => stats.insertions += 1,
                            Line::Delete(_) => stats.deletions += 1,
                            Line::Context(_) => {}
                        }
                    }
                }
            }
            Err(err) => {
                debug!(%err, "diffy parse failed, counting lines directly");
                let (ins, del) = count_marker_lines(&section);
                stats.insertions += ins;
                stats.deletions += del;
            }
        }
    }

    stats
}

/// Split a multi-file unified diff into per-file sections.
///
/// `git diff` output is split on `diff --git ` headers; plain unified
/// diffs on `--- ` headers.
fn split_file_sections(unified: &str) -> Vec<String> {
    let marker = if unified.contains("diff --git ") {
        "diff --git "
    } else {
        "--- "
    };

    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in unified.lines() {
        if line.starts_with(marker) {
            if !current.is_empty() {
                sections.push(std::mem::take(&mut current));
            }
        } else if current.is_empty() {
            // Preamble before the first header.
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        sections.push(current);
    }

    sections
}

fn count_marker_lines(section: &str) -> (u64, u64) {
    let mut insertions = 0;
    let mut deletions = 0;
    for line in section.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            insertions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deletions += 1;
        }
    }
    (insertions, deletions)
}
