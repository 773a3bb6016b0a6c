//! Locates a hunk's context lines inside the target file.
//!
//! Matching runs in three passes of increasing whitespace tolerance: exact,
//! right-trimmed, then fully trimmed. The returned fuzz score records which
//! pass succeeded (0, 1, or 100 per line set). EOF-anchored hunks first try
//! the exact tail of the file; a match found anywhere else costs 10,000.

/// Searches `lines` for `context` starting at `start`. Returns the match
/// index and the fuzz cost of the pass that found it.
pub(crate) fn seek_context(
    lines: &[String],
    context: &[String],
    start: usize,
    eof: bool,
) -> Option<(usize, u64)> {
    if eof {
        let tail = lines.len().saturating_sub(context.len());
        if let Some(found) = seek_context_core(lines, context, tail) {
            return Some(found);
        }
        return seek_context_core(lines, context, start).map(|(index, fuzz)| (index, fuzz + 10_000));
    }
    seek_context_core(lines, context, start)
}

fn seek_context_core(lines: &[String], context: &[String], start: usize) -> Option<(usize, u64)> {
    if context.is_empty() {
        return Some((start, 0));
    }

    let last_start = (lines.len() + 1).checked_sub(context.len())?;

    for i in start..last_start {
        if lines[i..i + context.len()]
            .iter()
            .zip(context)
            .all(|(a, b)| a == b)
        {
            return Some((i, 0));
        }
    }
    for i in start..last_start {
        if lines[i..i + context.len()]
            .iter()
            .zip(context)
            .all(|(a, b)| a.trim_end() == b.trim_end())
        {
            return Some((i, 1));
        }
    }
    for i in start..last_start {
        if lines[i..i + context.len()]
            .iter()
            .zip(context)
            .all(|(a, b)| a.trim() == b.trim())
        {
            return Some((i, 100));
        }
    }
    None
}
