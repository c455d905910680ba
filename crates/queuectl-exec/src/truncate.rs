//! Output truncation.
//!
//! Captured output ends up in log lines and the `last_error` column, so it
//! is bounded. The middle is dropped: the head shows what the command was
//! doing and the tail usually holds the final error.

/// Default cap on captured characters per stream.
pub const DEFAULT_MAX_CHARS: usize = 30_000;

/// Truncate `output` to at most `max_chars` characters, keeping the first and
/// last halves and replacing the middle with a marker.
///
/// Splits on character boundaries, never inside a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head_end = byte_offset(output, half);
    let tail_start = byte_offset(output, total - half);
    let omitted = total - 2 * half;

    format!(
        "{}\n... [{omitted} chars truncated] ...\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Byte offset of the `n`th character (or the end of the string).
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
