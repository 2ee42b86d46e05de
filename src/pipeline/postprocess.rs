//! Post-processing: deterministic cleanup of backend-generated Markdown.
//!
//! Vision models ignore formatting instructions often enough that every page
//! goes through the same small set of string rules before it is written. The
//! rules never touch wording, only framing: fences around the whole reply,
//! line endings, whitespace, and math-fence syntax.
//!
//! ## Rule Order
//!
//! Fences are stripped before line endings are normalised because the fence
//! regex anchors on `\n`; blank-line collapsing runs after every rule that can
//! remove lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all post-processing rules to a raw page transcription.
///
/// Rules (applied in order):
/// 1. Strip an outer ```` ```markdown ```` fence wrapping the whole reply
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Rewrite ```` ```math ```` / ```` ```latex ```` fences as `$$` blocks
/// 5. Remove spurious separator rows inside table bodies
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Collapse 4+ consecutive newlines to 3
/// 8. Ensure the text ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = math_fences_to_dollars(&s);
    let s = remove_mid_table_separators(&s);
    let s = remove_invisible_chars(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Math fences → $$ blocks ──────────────────────────────────────────
//
// Output math is `$…$` / `$$…$$` only; some models still emit GitHub's
// ```` ```math ```` fence.

static RE_MATH_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?ms)^```(?:math|latex|tex)[ \t]*\n(.*?)\n```[ \t]*$").unwrap());

fn math_fences_to_dollars(input: &str) -> String {
    RE_MATH_FENCE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            format!("$$\n{}\n$$", caps[1].trim())
        })
        .to_string()
}

// ── Rule 5: Remove spurious mid-table separator rows ────────────────────────
//
// GFM allows a separator only as the second row of a table. Models that
// transcribe multi-part tables sometimes repeat it between row groups.

fn remove_mid_table_separators(input: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut row_in_table = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            row_in_table += 1;
            if is_separator_row(line) && row_in_table != 2 {
                continue;
            }
        } else {
            row_in_table = 0;
        }
        result.push(line);
    }

    result.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 8: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_whole_reply_fence_only() {
        assert_eq!(strip_markdown_fences("```markdown\n# Hello\nWorld\n```"), "# Hello\nWorld");
        assert_eq!(strip_markdown_fences("```\n# Hello\n```"), "# Hello");
        let inner = "Text\n```python\nx = 1\n```\nmore";
        assert_eq!(strip_markdown_fences(inner), inner);
    }

    #[test]
    fn line_endings_and_trailing_whitespace() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(trim_trailing_whitespace("  hello   \nworld  "), "  hello\nworld");
    }

    #[test]
    fn math_fence_becomes_display_math() {
        let input = "Energy:\n```math\nE = mc^2\n```\nafter";
        assert_eq!(math_fences_to_dollars(input), "Energy:\n$$\nE = mc^2\n$$\nafter");

        let code = "```rust\nlet x = 1;\n```";
        assert_eq!(math_fences_to_dollars(code), code);
    }

    #[test]
    fn only_header_separator_survives() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |\n| --- | --- |\n| 3 | 4 |";
        let result = remove_mid_table_separators(input);
        assert_eq!(result.lines().filter(|l| is_separator_row(l)).count(), 1);
        assert!(result.ends_with("| 3 | 4 |"));

        let normal = "| H1 | H2 |\n|:---|---:|\n| a | b |";
        assert_eq!(remove_mid_table_separators(normal), normal);
    }

    #[test]
    fn invisible_chars_and_blank_lines() {
        assert_eq!(remove_invisible_chars("he\u{200B}llo\u{FEFF}"), "hello");
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
        assert_eq!(ensure_final_newline("hello\n\n\n"), "hello\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn figure_links_are_preserved() {
        let input = "![figure comp_02](figures/page-003/comp_02.png)";
        assert_eq!(clean_markdown(input), format!("{input}\n"));
    }

    #[test]
    fn full_pipeline() {
        let input = "```markdown\n# Title\r\n\r\nSome text   \n\n\n\n\n\n## Section\n```math\nx^2\n```\n```";
        let result = clean_markdown(input);
        assert!(result.starts_with("# Title\n\nSome text\n"));
        assert!(result.contains("$$\nx^2\n$$"));
        assert!(!result.contains("\n\n\n\n"));
        assert!(result.ends_with("$$\n"));
    }
}
