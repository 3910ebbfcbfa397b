//! Bounding the output kept in an in-memory `TaskExecution`.
//!
//! The log file always receives the full stream; only the copy held in the
//! execution history is capped. Middle-omission keeps the first lines (what
//! the task announced) and the last lines (how it ended).

/// Default cap on captured output characters (30 000).
pub const DEFAULT_MAX_CHARS: usize = 30_000;

/// Cap `output` at `max_chars` characters, omitting the middle.
///
/// ```text
/// <first max_chars/2 chars>
///
/// ... [OUTPUT TRUNCATED: N chars omitted] ...
///
/// <last max_chars/2 chars>
/// ```
///
/// Splits on character boundaries, never inside a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    // Byte length is an upper bound on char count.
    if output.len() <= max_chars {
        return output.to_owned();
    }

    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let omitted = total - 2 * half;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();

    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_output_untouched() {
        let log = "starting\nsynced 12 rows\ndone";
        assert_eq!(truncate_output(log, 100), log);
    }

    #[test]
    fn exact_fit_untouched() {
        let s = "x".repeat(64);
        assert_eq!(truncate_output(&s, 64), s);
    }

    #[test]
    fn keeps_first_and_last_lines() {
        let mut lines = vec!["BEGIN".to_string()];
        lines.extend((0..1_000).map(|i| format!("row {i}")));
        lines.push("END".to_string());
        let output = lines.join("\n");

        let capped = truncate_output(&output, 200);
        assert!(capped.starts_with("BEGIN"));
        assert!(capped.ends_with("END"));
        assert!(capped.contains("OUTPUT TRUNCATED"));
        assert!(capped.len() < output.len());
    }

    #[test]
    fn omitted_count_is_exact() {
        let s = "a".repeat(101);
        let capped = truncate_output(&s, 100);
        assert!(capped.contains("1 chars omitted"));
    }

    #[test]
    fn multibyte_text_is_not_split() {
        // 3 bytes per char: byte length exceeds the cap, char count does not.
        let s = "任务".repeat(10);
        assert_eq!(truncate_output(&s, 25), s);

        let long = "日志".repeat(100);
        let capped = truncate_output(&long, 10);
        assert!(capped.starts_with("日志日志日"));
    }
}
