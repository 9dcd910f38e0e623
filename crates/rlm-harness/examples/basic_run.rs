//! Minimal harness example: one question over a string context.
//!
//! Spawns the interpreter from `RLM_WORKER` (an argv-style command, split on
//! whitespace), runs the loop, and prints the answer plus run statistics.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... RLM_WORKER="python3 -u worker.py" cargo run --example basic_run
//! ```

use rlm_harness::prelude::*;

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter("rlm_harness=debug")
        .init();

    // 1. Create the OpenRouter client.
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let client = OpenRouterClient::new(api_key).map_err(|e| e.to_string())?;

    // 2. Configure the harness.
    let worker = std::env::var("RLM_WORKER")
        .map_err(|_| "Set RLM_WORKER to the interpreter command, e.g. \"python3 -u worker.py\"")?;
    let config = RlmConfig::new("anthropic/claude-sonnet-4", "openai/gpt-5-mini")
        .with_interpreter_command(worker.split_whitespace())
        .with_max_iterations(8)
        .with_max_total_subcalls(50);

    // 3. Run one completion.
    let context = std::fs::read_to_string("README.md")
        .unwrap_or_else(|_| "The RLM harness answers questions over large contexts.".into());

    let result = Rlm::new(client, config)
        .with_event_sink(LoggingSink)
        .completion(CompletionRequest {
            context: ContextInput::Text(context),
            question: Some("Summarize this document in one sentence.".into()),
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())?;

    // 4. Print results.
    println!("\n{}", result.answer);
    println!(
        "\n--- {} iteration(s) | {} subcall(s) | {}ms ---",
        result.iterations, result.subcall_count, result.execution_time_ms
    );

    Ok(())
}
