//! Output truncation for tool results handed back to the model.

/// Default ceiling for a single tool result.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 20_000;

/// Truncate `output` to roughly `max_chars` characters, keeping the first 40%
/// and the last 60% with a marker in between. Counts characters, not bytes, so
/// multi-byte text is never split inside a code point.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }

    let head_size = max_chars * 40 / 100;
    let tail_size = max_chars - head_size;
    let removed = total - head_size - tail_size;
    let head: String = output.chars().take(head_size).collect();
    let tail: String = output.chars().skip(total - tail_size).collect();
    format!(
        "{}\n[WARNING: Output truncated. {} characters removed from middle]\n{}",
        head, removed, tail
    )
}
