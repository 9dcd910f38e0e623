//! Parsing of root-model output: fenced REPL code blocks, terminal
//! directives, and size-bounded truncation.
//!
//! The root model communicates through plain text. Two things are extracted
//! from each response:
//!
//! - fenced code blocks opened by a ```` ```repl ```` line and closed by a
//!   bare ```` ``` ```` line, executed in document order;
//! - a terminal directive, `FINAL(<answer>)` or `FINAL_VAR(<name>)` at the
//!   start of a line, which ends the run.
//!
//! An absent directive is not an error; it drives the next iteration (or the
//! fallback path once the iteration limit is reached).

const REPL_FENCE_OPEN: &str = "```repl";
const FENCE_CLOSE: &str = "```";

const FINAL_VAR_PREFIX: &str = "FINAL_VAR(";
const FINAL_PREFIX: &str = "FINAL(";

/// A terminal directive parsed from root-model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `FINAL(<answer>)`: the answer is the literal text between the parens.
    Final(String),
    /// `FINAL_VAR(<name>)`: the answer is the value of an interpreter
    /// variable, resolved through the worker.
    FinalVar(String),
}

/// Extract all non-empty ```` ```repl ```` code blocks, in document order.
///
/// The opening fence must be the tag `repl` on its own line; the closing
/// fence is a bare ```` ``` ```` line. Bodies are trimmed of surrounding
/// blank lines; bodies that are empty after trimming are discarded, as is an
/// unterminated trailing fence.
pub fn extract_repl_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut body: Option<Vec<&str>> = None;

    for line in text.lines() {
        match body.as_mut() {
            None => {
                if line.trim_end() == REPL_FENCE_OPEN {
                    body = Some(Vec::new());
                }
            }
            Some(lines) => {
                if line.trim_end() == FENCE_CLOSE {
                    let code = trim_blank_edges(lines);
                    if !code.is_empty() {
                        blocks.push(code);
                    }
                    body = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }

    blocks
}

/// Join body lines, dropping leading and trailing blank lines.
fn trim_blank_edges(lines: &[&str]) -> String {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(start, |i| i + 1);
    lines[start..end].join("\n")
}

/// Parse the terminal directive from a root response, if any.
///
/// Matching is case-sensitive and line-anchored. `FINAL_VAR(<name>)` wins
/// over `FINAL(<answer>)` when both are present. A `FINAL` answer extends to
/// the closing paren at the end of its line (so it may itself contain
/// parens); a `FINAL_VAR` name is trimmed and stripped of one surrounding
/// quote pair.
pub fn parse_directive(text: &str) -> Option<Directive> {
    let mut first_final: Option<Directive> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(FINAL_VAR_PREFIX)
            && let Some(inner) = rest.split(')').next()
            && rest.contains(')')
        {
            return Some(Directive::FinalVar(clean_var_name(inner)));
        }

        if first_final.is_none()
            && let Some(rest) = line.strip_prefix(FINAL_PREFIX)
            && let Some(inner) = rest.strip_suffix(')')
        {
            first_final = Some(Directive::Final(inner.to_string()));
        }
    }

    first_final
}

/// Trim a `FINAL_VAR` argument and strip one surrounding single- or
/// double-quote pair.
pub fn clean_var_name(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Head-truncate `text` to `max` characters, appending a marker with the
/// omitted count.
///
/// Text already at or under the limit passes through unchanged, as does text
/// that already ends in a truncation marker with a head of exactly `max`
/// characters, so re-truncating truncated text is a no-op.
pub fn truncate(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max || is_truncated(text, max) {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    let omitted = total - max;
    format!("{head}\n... [truncated {omitted} chars]")
}

fn is_truncated(text: &str, max: usize) -> bool {
    let Some(idx) = text.rfind("\n... [truncated ") else {
        return false;
    };
    text.ends_with(" chars]") && text[..idx].chars().count() == max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_blocks_in_order() {
        let text = "thinking\n```repl\nx = 1\n```\nmore\n```repl\ny = 2\nprint(y)\n```\n";
        let blocks = extract_repl_blocks(text);
        assert_eq!(blocks, vec!["x = 1".to_string(), "y = 2\nprint(y)".to_string()]);
    }

    #[test]
    fn blank_edges_trimmed_and_empty_discarded() {
        let text = "```repl\n\n\nx = 1\n\n```\n```repl\n\n   \n```\n";
        let blocks = extract_repl_blocks(text);
        assert_eq!(blocks, vec!["x = 1".to_string()]);
    }

    #[test]
    fn unterminated_fence_discarded() {
        let blocks = extract_repl_blocks("```repl\nx = 1\n");
        assert!(blocks.is_empty());
    }

    #[test]
    fn other_fence_tags_ignored() {
        let blocks = extract_repl_blocks("```python\nx = 1\n```\n");
        assert!(blocks.is_empty());
    }

    #[test]
    fn interior_blank_lines_preserved() {
        let blocks = extract_repl_blocks("```repl\na = 1\n\nb = 2\n```\n");
        assert_eq!(blocks, vec!["a = 1\n\nb = 2".to_string()]);
    }

    #[test]
    fn render_roundtrip() {
        let originals = vec!["x = 6*7\nprint(x)".to_string(), "y = [1, 2]".to_string()];
        let rendered: String = originals
            .iter()
            .map(|code| format!("```repl\n{code}\n```\n"))
            .collect();
        assert_eq!(extract_repl_blocks(&rendered), originals);
    }

    #[test]
    fn final_at_line_start() {
        assert_eq!(
            parse_directive("done\nFINAL(42)"),
            Some(Directive::Final("42".into()))
        );
    }

    #[test]
    fn final_answer_may_contain_parens() {
        assert_eq!(
            parse_directive("FINAL(f(x) = y(z))"),
            Some(Directive::Final("f(x) = y(z)".into()))
        );
    }

    #[test]
    fn final_not_at_line_start_ignored() {
        assert_eq!(parse_directive("the answer is FINAL(42)"), None);
        assert_eq!(parse_directive("  FINAL(42)"), None);
    }

    #[test]
    fn final_without_trailing_paren_ignored() {
        assert_eq!(parse_directive("FINAL(42) trailing"), None);
    }

    #[test]
    fn final_var_wins_over_final() {
        let text = "FINAL(y)\nFINAL_VAR(x)";
        assert_eq!(parse_directive(text), Some(Directive::FinalVar("x".into())));
    }

    #[test]
    fn final_var_quotes_stripped() {
        assert_eq!(
            parse_directive("FINAL_VAR(\"answer\")"),
            Some(Directive::FinalVar("answer".into()))
        );
        assert_eq!(
            parse_directive("FINAL_VAR(' result ')"),
            Some(Directive::FinalVar(" result ".into()))
        );
        assert_eq!(
            parse_directive("FINAL_VAR( answer )"),
            Some(Directive::FinalVar("answer".into()))
        );
    }

    #[test]
    fn case_sensitive() {
        assert_eq!(parse_directive("final(42)"), None);
        assert_eq!(parse_directive("Final_Var(x)"), None);
    }

    #[test]
    fn truncate_pass_through_at_limit() {
        assert_eq!(truncate("hello", 5), "hello");
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn truncate_appends_marker() {
        let out = truncate("abcdefghij", 4);
        assert_eq!(out, "abcd\n... [truncated 6 chars]");
    }

    #[test]
    fn truncate_idempotent() {
        let once = truncate("abcdefghij", 4);
        assert_eq!(truncate(&once, 4), once);
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        let out = truncate("ééééé", 2);
        assert!(out.starts_with("éé\n"));
        assert!(out.contains("truncated 3 chars"));
    }
}
