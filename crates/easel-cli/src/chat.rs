//! Interactive chat loop: read prompts from stdin, print engine events
//! as they apply.

use std::io::Write;
use std::sync::Arc;

use easel_engine::{ConversationEngine, EngineEvent, StepOutcome};
use easel_wire::StreamEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(engine: Arc<ConversationEngine>, session: Option<String>) -> anyhow::Result<()> {
    let mut current = session;
    if let Some(id) = &current {
        if !engine.sessions().iter().any(|s| &s.id == id) {
            eprintln!("Unknown session '{id}'; a new one will be created on first prompt.");
            current = None;
        }
    }

    // Printer task: renders applied events until the engine is dropped.
    let mut rx = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(applied) = rx.recv().await {
            print_event(&applied);
        }
    });

    println!("easel - type a prompt, or 'exit' to quit.");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }

        match engine.send_prompt(current.as_deref(), prompt).await {
            Ok(turn_ref) => {
                current = Some(turn_ref.session_id.clone());
                print_turn_outcome(&engine, &turn_ref.session_id, &turn_ref.turn_id);
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    engine.flush().await;
    printer.abort();
    Ok(())
}

fn print_event(applied: &EngineEvent) {
    match &applied.event {
        StreamEvent::TextDelta(delta) => {
            print!("{}", delta.delta);
            std::io::stdout().flush().ok();
        }
        StreamEvent::ToolStart(start) => {
            println!("\n[{}] running…", start.tool);
        }
        StreamEvent::ToolResult(result) => {
            let status = result.status.as_deref().unwrap_or("done");
            println!("[{}] {status}", result.tool);
        }
        StreamEvent::RenderReady(ready) => {
            println!("render '{}' ready ({})", ready.render_id, ready.backend);
        }
        StreamEvent::ValidateResult(validate) => {
            println!(
                "validation: score {:.1}, {}",
                validate.score,
                if validate.passed { "passed" } else { "failed" }
            );
        }
        StreamEvent::TurnComplete(_) | StreamEvent::Error(_) | StreamEvent::Unknown { .. } => {}
    }
}

fn print_turn_outcome(engine: &ConversationEngine, session_id: &str, turn_id: &str) {
    let Some(turn) = engine
        .turns(session_id)
        .into_iter()
        .find(|t| t.id == turn_id)
    else {
        return;
    };

    println!();
    if let Some(error) = &turn.error {
        eprintln!("turn failed: {error}");
        return;
    }
    if let Some(render) = &turn.render {
        println!("({} bytes of {})", render.len(), render.media_type);
    }
    let failed_steps = turn
        .steps
        .iter()
        .filter(|s| s.outcome == Some(StepOutcome::Error))
        .count();
    if failed_steps > 0 {
        println!("({failed_steps} tool step(s) reported errors)");
    }
}
