//! Size-bounded redaction for logged text.
//!
//! Prompts, context previews, and REPL outputs can be arbitrarily large.
//! Before they land in traces or event payloads they are cut down to a
//! head/tail window with a marker carrying the omitted length and a SHA-256
//! digest of the full text, so operators can correlate redacted records with
//! the originals they hold elsewhere.
//!
//! All functions here are pure; the policy decides the thresholds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Room reserved for the omitted-count/digest marker when sizing head and
/// tail windows against a threshold. Generous: the fixed marker text plus a
/// 16-hex digest and a 20-digit count fit well inside it.
const MARKER_ALLOWANCE: usize = 64;

/// Thresholds for redaction, overridable at harness construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionPolicy {
    /// Limit for LM prompts recorded on subcall traces.
    pub max_prompt_chars: usize,
    /// Limit for the head-only context preview kept in run metadata.
    pub max_context_preview_chars: usize,
    /// Limit for REPL stdout/stderr recorded on execution traces.
    pub max_repl_output_chars: usize,
    /// Characters kept from the start of redacted text.
    pub head_chars: usize,
    /// Characters kept from the end of redacted text.
    pub tail_chars: usize,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            max_prompt_chars: 4_000,
            max_context_preview_chars: 2_000,
            max_repl_output_chars: 8_000,
            head_chars: 1_500,
            tail_chars: 1_500,
        }
    }
}

impl RedactionPolicy {
    /// Coerce the policy into a shape redaction can honor: every threshold
    /// gets a small floor, and the head/tail windows are shrunk until
    /// `head + tail + marker` fits inside the smallest head/tail threshold.
    /// A clamped policy's redacted output is always at or under its
    /// threshold, which is what keeps [`redact`] idempotent.
    pub fn clamped(mut self) -> Self {
        let floor = MARKER_ALLOWANCE + 2;
        self.max_prompt_chars = self.max_prompt_chars.max(floor);
        self.max_context_preview_chars = self.max_context_preview_chars.max(floor);
        self.max_repl_output_chars = self.max_repl_output_chars.max(floor);

        // Floored above, so the budget is at least 2.
        let budget = self.max_prompt_chars.min(self.max_repl_output_chars) - MARKER_ALLOWANCE;
        if self.head_chars.saturating_add(self.tail_chars) > budget {
            let half = (budget / 2).max(1);
            self.head_chars = half;
            self.tail_chars = half;
        }
        self
    }
}

/// Record of a redaction that was applied, kept alongside the redacted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redaction {
    pub redacted: bool,
    pub original_length: usize,
    /// Hex SHA-256 of the full, unredacted text.
    pub digest: String,
}

/// Hex SHA-256 digest of `text`.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Apply head/tail redaction if `text` exceeds `threshold` characters.
///
/// Returns the (possibly redacted) text and, when redaction happened, a
/// [`Redaction`] record. Output under the threshold passes through, which
/// makes the operation idempotent whenever `head + tail + marker` fits
/// inside the threshold; [`RedactionPolicy::clamped`] guarantees that
/// shape. Windows larger than the text itself are tolerated (the omitted
/// count saturates to zero).
pub fn redact(policy: &RedactionPolicy, text: &str, threshold: usize) -> (String, Option<Redaction>) {
    let total = text.chars().count();
    if total <= threshold {
        return (text.to_string(), None);
    }

    let digest = sha256_hex(text);
    let head: String = text.chars().take(policy.head_chars).collect();
    let tail_start = total.saturating_sub(policy.tail_chars);
    let tail: String = text.chars().skip(tail_start).collect();
    let omitted = total
        .saturating_sub(policy.head_chars)
        .saturating_sub(policy.tail_chars);
    let marker = format!("\n[... {omitted} chars omitted, sha256:{} ...]\n", &digest[..16]);

    (
        format!("{head}{marker}{tail}"),
        Some(Redaction {
            redacted: true,
            original_length: total,
            digest,
        }),
    )
}

/// Head-only preview used for context metadata: the first
/// `max_context_preview_chars` characters plus a digest marker.
pub fn preview(policy: &RedactionPolicy, text: &str) -> (String, Option<Redaction>) {
    let total = text.chars().count();
    if total <= policy.max_context_preview_chars {
        return (text.to_string(), None);
    }

    let digest = sha256_hex(text);
    let head: String = text
        .chars()
        .take(policy.max_context_preview_chars)
        .collect();
    let omitted = total - policy.max_context_preview_chars;

    (
        format!("{head}\n[... {omitted} more chars, sha256:{} ...]", &digest[..16]),
        Some(Redaction {
            redacted: true,
            original_length: total,
            digest,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_policy() -> RedactionPolicy {
        RedactionPolicy {
            max_prompt_chars: 100,
            max_context_preview_chars: 10,
            max_repl_output_chars: 100,
            head_chars: 8,
            tail_chars: 8,
        }
    }

    #[test]
    fn short_text_passes_through() {
        let policy = small_policy();
        let (out, note) = redact(&policy, "short", 100);
        assert_eq!(out, "short");
        assert!(note.is_none());
    }

    #[test]
    fn long_text_keeps_head_and_tail() {
        let policy = small_policy();
        let text = "A".repeat(50) + &"Z".repeat(150);
        let (out, note) = redact(&policy, &text, 100);

        assert!(out.starts_with("AAAAAAAA"));
        assert!(out.ends_with("ZZZZZZZZ"));
        assert!(out.contains("184 chars omitted"));

        let note = note.expect("redaction note");
        assert!(note.redacted);
        assert_eq!(note.original_length, 200);
        assert_eq!(note.digest, sha256_hex(&text));
    }

    #[test]
    fn redact_is_idempotent() {
        let policy = small_policy();
        let text = "x".repeat(500);
        let (once, _) = redact(&policy, &text, 100);
        let (twice, note) = redact(&policy, &once, 100);
        assert_eq!(once, twice);
        assert!(note.is_none());
    }

    #[test]
    fn windows_wider_than_threshold_do_not_underflow() {
        // head + tail exceed both the threshold and the text length; the
        // omitted count saturates instead of wrapping.
        let policy = RedactionPolicy {
            max_prompt_chars: 100,
            max_context_preview_chars: 10,
            max_repl_output_chars: 100,
            head_chars: 1_500,
            tail_chars: 1_500,
        };
        let text = "y".repeat(200);
        let (out, note) = redact(&policy, &text, 100);
        assert!(out.contains("0 chars omitted"));
        assert_eq!(note.expect("note").original_length, 200);
    }

    #[test]
    fn clamped_policy_fits_windows_under_thresholds() {
        let policy = RedactionPolicy {
            max_prompt_chars: 100,
            max_context_preview_chars: 10,
            max_repl_output_chars: 100,
            head_chars: 1_500,
            tail_chars: 1_500,
        }
        .clamped();

        assert!(policy.head_chars + policy.tail_chars + MARKER_ALLOWANCE <= policy.max_prompt_chars);

        // A clamped policy stays idempotent even at the threshold that
        // would have panicked before clamping.
        let text = "q".repeat(10_000);
        let (once, _) = redact(&policy, &text, policy.max_prompt_chars);
        assert!(once.chars().count() <= policy.max_prompt_chars);
        let (twice, note) = redact(&policy, &once, policy.max_prompt_chars);
        assert_eq!(once, twice);
        assert!(note.is_none());
    }

    #[test]
    fn clamped_floors_degenerate_thresholds() {
        let policy = RedactionPolicy {
            max_prompt_chars: 0,
            max_context_preview_chars: 0,
            max_repl_output_chars: 0,
            head_chars: 0,
            tail_chars: 0,
        }
        .clamped();
        assert!(policy.max_prompt_chars > MARKER_ALLOWANCE);
        assert!(policy.max_context_preview_chars > MARKER_ALLOWANCE);
        assert!(policy.max_repl_output_chars > MARKER_ALLOWANCE);
        assert!(policy.head_chars >= 1);
        assert!(policy.tail_chars >= 1);
    }

    #[test]
    fn clamped_leaves_sane_policies_alone() {
        let policy = RedactionPolicy::default().clamped();
        let default = RedactionPolicy::default();
        assert_eq!(policy.max_prompt_chars, default.max_prompt_chars);
        assert_eq!(policy.head_chars, default.head_chars);
        assert_eq!(policy.tail_chars, default.tail_chars);
    }

    #[test]
    fn preview_is_head_only() {
        let policy = small_policy();
        let (out, note) = preview(&policy, "0123456789abcdef");
        assert!(out.starts_with("0123456789\n"));
        assert!(out.contains("6 more chars"));
        assert_eq!(note.expect("note").original_length, 16);
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = sha256_hex("hello");
        let b = sha256_hex("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
