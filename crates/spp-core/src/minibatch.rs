//! Minibatching: several lanes' prompts in one request.
//!
//! A chunk of `n > 1` prompts is sent as a single user message listing
//! `Task 1:` … `Task n:`. The model is asked to reply with one section per
//! task, each opened by a line starting `Answer <k>:`. The response is split
//! on those markers and must yield exactly `n` sections numbered `1..=n`.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SppError};

/// Consecutive index ranges of at most `size` elements covering `0..len`.
pub fn chunk_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Merge `prompts` into one request body.
///
/// A single prompt is returned unchanged.
pub fn format_minibatch(prompts: &[String]) -> String {
    if prompts.len() == 1 {
        return prompts[0].clone();
    }

    let mut out = format!(
        "Complete each of the following {} tasks independently.\n\
         Reply with one section per task. Start each section on its own line \
         with \"Answer <task number>:\" and do not add any other text.\n",
        prompts.len()
    );
    for (i, prompt) in prompts.iter().enumerate() {
        out.push_str(&format!("\nTask {}:\n{}\n", i + 1, prompt.trim_end()));
    }
    out
}

fn answer_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"(?mi)^[ \t]*\**answer[ \t]+(\d+)\**[ \t]*:\**[ \t]*").expect("static regex"))
}

/// Split a minibatch response back into `expected` per-task answers.
///
/// On failure `got` is the number of leading sections numbered `1, 2, ...`
/// in sequence, or the total section count when all expected sections are
/// present but followed by extras.
pub fn split_minibatch(response: &str, expected: usize) -> Result<Vec<String>> {
    if expected == 1 {
        return Ok(vec![response.to_string()]);
    }

    let markers: Vec<(usize, usize, usize)> = answer_marker()
        .captures_iter(response)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1)?.as_str().parse().ok()?;
            Some((number, whole.start(), whole.end()))
        })
        .collect();

    // Sections count only while numbered 1, 2, 3, ... without gaps.
    let in_order = markers
        .iter()
        .enumerate()
        .take_while(|(i, (number, _, _))| *number == i + 1)
        .count();
    if in_order != expected || markers.len() != expected {
        let got = if in_order == expected { markers.len() } else { in_order };
        return Err(SppError::MinibatchLength { expected, got });
    }

    Ok(markers
        .iter()
        .enumerate()
        .map(|(i, &(_, _, body_start))| {
            let body_end = markers.get(i + 1).map_or(response.len(), |next| next.1);
            response[body_start..body_end].trim().to_string()
        })
        .collect())
}
