//! codewright — autonomous coding-agent runtime.
//!
//! One orchestration instance serves one workspace/session. Requests come
//! from the command line (one-shot) or stdin (line per turn); approvals and
//! write/exec confirmations are answered by the `--yes` flag or left to
//! their safe defaults (pending / denied). Richer UIs sit on the trace
//! event stream, not inside this binary.

mod config;
mod context;
mod events;
mod executor;
mod intent;
mod orchestrator;
mod planner;
mod policy;
mod providers;
mod sandbox;
mod state;
#[cfg(test)]
mod testing;
mod tools;
mod traits;
mod utils;
mod verifier;

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use orchestrator::Orchestrator;
use policy::ApprovalPrompt;
use tools::ConfirmationRequest;

struct CliArgs {
    config_path: PathBuf,
    auto_yes: bool,
    prompt: Option<String>,
    resume: Option<String>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut config_path = PathBuf::from("codewright.toml");
    let mut auto_yes = false;
    let mut prompt: Option<String> = None;
    let mut resume: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = PathBuf::from(
                    args.next().ok_or("--config requires a path")?,
                );
            }
            "--yes" | "-y" => auto_yes = true,
            "--resume" => {
                resume = Some(args.next().ok_or("--resume requires a request id")?);
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown flag: {other}\n{}", usage()));
            }
            other => {
                prompt = Some(match prompt {
                    Some(existing) => format!("{existing} {other}"),
                    None => other.to_string(),
                });
            }
        }
    }

    Ok(CliArgs {
        config_path,
        auto_yes,
        prompt,
        resume,
    })
}

fn usage() -> String {
    "usage: codewright [--config <path>] [--yes] [--resume <request-id>] [prompt...]\n\
     With no prompt, reads one request per line from stdin."
        .to_string()
}

/// `--yes` answers every confirmation and approval positively; without it
/// both channels are left unwired and degrade to their safe defaults.
fn auto_responders() -> (mpsc::Sender<ApprovalPrompt>, tools::ConfirmSender) {
    let (approval_tx, mut approval_rx) = mpsc::channel::<ApprovalPrompt>(4);
    tokio::spawn(async move {
        while let Some(prompt) = approval_rx.recv().await {
            info!(
                request_id = %prompt.request_id,
                risk = %prompt.risk,
                "auto-approving (--yes)"
            );
            let _ = prompt.reply.send(true);
        }
    });

    let (confirm_tx, mut confirm_rx) = mpsc::channel::<ConfirmationRequest>(4);
    tokio::spawn(async move {
        while let Some(request) = confirm_rx.recv().await {
            info!(tool = %request.tool, risk = %request.risk, "auto-confirming (--yes)");
            let _ = request.reply.send(true);
        }
    });

    (approval_tx, confirm_tx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return Ok(());
        }
    };

    let config = if args.config_path.exists() {
        AppConfig::load(&args.config_path)?
    } else {
        info!(
            path = %args.config_path.display(),
            "no config file found; using defaults"
        );
        AppConfig::default()
    };

    let (resolver, confirm) = if args.auto_yes {
        let (approval_tx, confirm_tx) = auto_responders();
        (Some(approval_tx), Some(confirm_tx))
    } else {
        (None, None)
    };

    let orchestrator = Orchestrator::new(config, resolver, confirm).await?;

    if let Some(request_id) = &args.resume {
        let report = orchestrator.resume_approval(request_id).await?;
        println!("[{}] {}", report.stop.as_str(), report.answer);
        return Ok(());
    }

    if let Some(prompt) = &args.prompt {
        let report = orchestrator.handle_request(prompt).await?;
        println!("[{}] {}", report.stop.as_str(), report.answer);
        return Ok(());
    }

    // Line-per-turn REPL. Turns are strictly sequential: one request runs to
    // its terminal state before the next line is read.
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" || line == ":q" {
            break;
        }
        let report = if let Some(request_id) = line.strip_prefix(":resume ") {
            orchestrator.resume_approval(request_id.trim()).await?
        } else {
            orchestrator.handle_request(line).await?
        };
        println!("[{}] {}", report.stop.as_str(), report.answer);
    }

    Ok(())
}
