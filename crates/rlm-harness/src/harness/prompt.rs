//! Prompt text and message construction for the root conversation.

use crate::harness::context::ContextMetadata;
use crate::parse::truncate;
use crate::worker::ExecResult;

/// Fixed system prompt: declares the interpreter helpers and mandates a
/// terminal directive.
pub const SYSTEM_PROMPT: &str = r#"You are a reasoning model with access to a persistent Python REPL.

The REPL namespace contains the data you were asked about:
- `context` — the context payload (string, list, or dict)
- `question` — the user question, when one was provided

These callables are available inside the REPL:
- `llm_query(prompt, model=None)` — ask a language model a single question; returns its answer as a string
- `llm_query_batched(prompts, model=None)` — ask several questions at once; returns a list of answers in prompt order
- `FINAL_VAR(name)` — read back the value of a variable you created
- `SHOW_VARS()` — list the variables currently defined

To run code, write a fenced block tagged `repl`:

```repl
print(len(context))
```

Each block's stdout, stderr, and defined variables are reported back to you.
State persists across blocks and across turns.

Work iteratively: inspect the context, compute, and issue llm_query calls for
semantic work over text you have isolated. Keep each block small enough to
reason about its output.

You MUST end the task with exactly one terminal directive at the start of a line:
- `FINAL(<answer>)` — the literal final answer, or
- `FINAL_VAR(<variable name>)` — the name of a REPL variable holding the final answer.

Do not emit a directive until you are confident in the answer."#;

/// Stock instruction appended to every per-turn user message.
const TURN_INSTRUCTION: &str =
    "Use ```repl blocks to run code, or finish with FINAL(...) / FINAL_VAR(...).";

/// Final user message on the fallback path, demanding a directive.
pub const FALLBACK_PROMPT: &str = "You have reached the iteration limit. Based on everything \
above, answer now: reply with FINAL(<answer>) or FINAL_VAR(<variable name>) on its own line, \
and nothing else.";

/// Assistant preamble summarizing the context without inlining it.
pub fn context_preamble(meta: &ContextMetadata) -> String {
    format!(
        "I have loaded the context into the REPL.\n\
         - type: {}\n\
         - total characters: {}\n\
         - items: {} ({})\n\
         I will inspect `question` first, then examine `context` in the REPL \
         before answering.",
        meta.context_type,
        meta.total_chars,
        meta.item_count,
        meta.lengths_summary(),
    )
}

/// The per-turn user message. Iteration indices are 1-based.
pub fn turn_message(iteration: u32) -> String {
    let lead = if iteration <= 1 {
        "Start by reading the question and context variables in the REPL."
    } else {
        "Continue from prior execution outputs."
    };
    format!("{lead}\n{TURN_INSTRUCTION}")
}

/// Feedback message for one executed block, with stdout/stderr truncated
/// independently.
pub fn execution_feedback(code: &str, result: &ExecResult, max_output_chars: usize) -> String {
    let stdout = truncate(&result.stdout, max_output_chars);
    let stderr = truncate(&result.stderr, max_output_chars);
    let variables = result.variable_names();
    let variables = if variables.is_empty() {
        "(none)".to_string()
    } else {
        variables.join(", ")
    };

    format!(
        "Code executed:\n```python\n{code}\n```\n\n\
         REPL output:\nSTDOUT:\n{stdout}\n\nSTDERR:\n{stderr}\n\n\
         Variables now available: {variables}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::context::ContextInput;
    use crate::redact::RedactionPolicy;

    #[test]
    fn system_prompt_declares_helpers_and_directives() {
        for needle in [
            "llm_query(",
            "llm_query_batched(",
            "FINAL_VAR(",
            "SHOW_VARS()",
            "FINAL(",
            "```repl",
        ] {
            assert!(SYSTEM_PROMPT.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn preamble_reports_metadata() {
        let meta = ContextInput::Text("abcde".into()).metadata(&RedactionPolicy::default());
        let preamble = context_preamble(&meta);
        assert!(preamble.contains("type: string"));
        assert!(preamble.contains("total characters: 5"));
        assert!(preamble.contains("question"));
    }

    #[test]
    fn first_turn_differs_from_later_turns() {
        assert!(turn_message(1).contains("Start by reading"));
        assert!(turn_message(2).contains("Continue from prior"));
        assert!(turn_message(1).contains("FINAL_VAR"));
    }

    #[test]
    fn feedback_includes_code_output_and_variables() {
        let result = ExecResult {
            stdout: "42\n".into(),
            stderr: String::new(),
            locals: serde_json::from_str(r#"{"x": "int: 42", "y": "str: 'hi'"}"#).unwrap(),
            execution_time: 0.1,
        };
        let feedback = execution_feedback("x = 6*7\nprint(x)", &result, 100);
        assert!(feedback.starts_with("Code executed:\n```python\nx = 6*7\nprint(x)\n```"));
        assert!(feedback.contains("STDOUT:\n42\n"));
        assert!(feedback.contains("Variables now available: x, y"));
    }

    #[test]
    fn feedback_truncates_each_stream_independently() {
        let result = ExecResult {
            stdout: "o".repeat(50),
            stderr: "e".repeat(50),
            locals: serde_json::Map::new(),
            execution_time: 0.0,
        };
        let feedback = execution_feedback("pass", &result, 10);
        assert!(feedback.contains("truncated 40 chars"));
        assert!(feedback.contains("Variables now available: (none)"));
        // Both streams carry their own marker.
        assert_eq!(feedback.matches("truncated 40 chars").count(), 2);
    }
}
