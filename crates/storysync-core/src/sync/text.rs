//! Line-based three-way merge for free-text fields.
//!
//! Both sides are diffed against the base with Myers' algorithm (via
//! `similar`). Each side yields a list of hunks (a base line range plus the
//! replacement lines). Hunks from the two sides are applied together when
//! they touch disjoint base ranges; identical hunks are applied once. Any
//! other overlap, or two different edits starting at the same base line, is
//! a collision and the merge gives up.

use std::ops::Range;

use similar::{Algorithm, DiffTag, capture_diff_slices};

/// The two sides edited overlapping base lines differently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("text edits collide at base lines {}..{}", .base_lines.start, .base_lines.end)]
pub struct TextCollision {
    pub base_lines: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk<'a> {
    base: Range<usize>,
    lines: Vec<&'a str>,
}

fn hunks<'a>(base: &[&str], side: &[&'a str]) -> Vec<Hunk<'a>> {
    let mut out: Vec<Hunk<'a>> = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, base, side) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        let lines = side[new].to_vec();
        match out.last_mut() {
            // Coalesce a delete directly followed by an insert (and similar
            // adjacent ops) into one replacement hunk.
            Some(prev) if prev.base.end == old.start => {
                prev.base.end = old.end;
                prev.lines.extend(lines);
            }
            _ => out.push(Hunk { base: old, lines }),
        }
    }
    out
}

/// Merge `local` and `remote` edits of `base`.
///
/// # Errors
///
/// Returns [`TextCollision`] when the two sides changed overlapping lines
/// in different ways.
pub fn merge_lines(base: &str, local: &str, remote: &str) -> Result<String, TextCollision> {
    if local == remote {
        return Ok(local.to_string());
    }
    if local == base {
        return Ok(remote.to_string());
    }
    if remote == base {
        return Ok(local.to_string());
    }

    let base_lines: Vec<&str> = base.lines().collect();
    let local_lines: Vec<&str> = local.lines().collect();
    let remote_lines: Vec<&str> = remote.lines().collect();

    let mut all: Vec<(Hunk<'_>, u8)> = hunks(&base_lines, &local_lines)
        .into_iter()
        .map(|h| (h, 0))
        .chain(hunks(&base_lines, &remote_lines).into_iter().map(|h| (h, 1)))
        .collect();
    all.sort_by(|(a, sa), (b, sb)| {
        a.base
            .start
            .cmp(&b.base.start)
            .then(a.base.end.cmp(&b.base.end))
            .then(sa.cmp(sb))
    });

    let mut out: Vec<&str> = Vec::with_capacity(base_lines.len());
    let mut pos = 0;
    let mut prev: Option<(Range<usize>, Vec<&str>, u8)> = None;

    for (hunk, side) in all {
        if let Some((prev_range, prev_lines, prev_side)) = &prev {
            let overlaps = hunk.base.start < prev_range.end || hunk.base.start == prev_range.start;
            if overlaps && *prev_side != side {
                if hunk.base == *prev_range && hunk.lines == *prev_lines {
                    continue;
                }
                return Err(TextCollision {
                    base_lines: prev_range.start.min(hunk.base.start)
                        ..prev_range.end.max(hunk.base.end),
                });
            }
        }

        out.extend_from_slice(&base_lines[pos.min(hunk.base.start)..hunk.base.start]);
        out.extend(hunk.lines.iter().copied());
        pos = pos.max(hunk.base.end);

        let replace_prev = prev
            .as_ref()
            .is_none_or(|(range, _, _)| hunk.base.end >= range.end);
        if replace_prev {
            prev = Some((hunk.base.clone(), hunk.lines.clone(), side));
        }
    }
    out.extend_from_slice(&base_lines[pos.min(base_lines.len())..]);

    let mut merged = out.join("\n");
    if trailing_newline(base, local, remote) && !merged.is_empty() {
        merged.push('\n');
    }
    Ok(merged)
}

/// Three-way merge of the "ends with a newline" bit.
fn trailing_newline(base: &str, local: &str, remote: &str) -> bool {
    let (b, l, r) = (base.ends_with('\n'), local.ends_with('\n'), remote.ends_with('\n'));
    if l == b { r } else { l }
}
