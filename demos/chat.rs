//! Interactive chat REPL against a local model server.
//!
//! Usage:
//!   cargo run --example chat -- llama3.2
//!   cargo run --example chat -- llama3.2 --system-prompt prompt.txt -l 30 -u Ana -t
//!   cargo run --example chat -- llama3.2 -s http://127.0.0.1:8100 -p secret
//!   cargo run --example chat -- llama3.2 -c logs/demo_2025-01-31_10-00-00
//!   cargo run --example chat -- gpt-4o --provider openai --base-url https://api.openai.com
//!
//! Commands: "/history", "/rewind N", "/backup [label]", "exit".
//! Ctrl-C cancels the running turn; pressing it three times quits.

use std::io::{self, BufRead, Write};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use toolchat::session::{HISTORY_FILE, PARAMS_FILE};
use toolchat::{
    ChatConfig, ChatEvent, ChatOptions, ChatSession, InferenceProvider, OllamaProvider,
    OpenAiProvider, RemoteToolInvoker,
};

const FORCE_EXIT_PRESSES: usize = 3;
const BACKUP_ROOT: &str = "./logs";

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a local model that can call tools")]
struct Cli {
    /// Model to use
    model: String,

    /// File holding the system prompt
    #[arg(long)]
    system_prompt: Option<PathBuf>,

    /// Messages of history sent with each request
    #[arg(long, short = 'l', default_value_t = 20)]
    max_length: usize,

    /// Name shown for your messages in the history view
    #[arg(long, short = 'u', default_value = "User")]
    user_name: String,

    /// Backup folder to resume from
    #[arg(long, short = 'c')]
    prev_context: Option<PathBuf>,

    /// Tell the model the current date and time
    #[arg(long, short = 't')]
    add_date_time: bool,

    /// Tool server base URL
    #[arg(long, short = 's')]
    server_address: Option<String>,

    /// Bearer token for the tool server
    #[arg(long, short = 'p')]
    server_password: Option<String>,

    /// Provider: "openai" (OpenAI-compatible) or "ollama" (native API)
    #[arg(long, default_value = "openai")]
    provider: String,

    /// API base URL
    #[arg(long, default_value = "http://localhost:11434")]
    base_url: String,

    /// Model calls allowed per turn
    #[arg(long, default_value_t = 16)]
    max_rounds: usize,
}

fn build_provider(cli: &Cli) -> Box<dyn InferenceProvider> {
    match cli.provider.as_str() {
        "ollama" => Box::new(OllamaProvider::new().with_base_url(&cli.base_url)),
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "ollama".into());
            Box::new(OpenAiProvider::new(&cli.base_url).with_api_key(key))
        }
        other => {
            eprintln!("error: unknown provider '{other}'. Use 'openai' or 'ollama'.");
            std::process::exit(1);
        }
    }
}

/// Argument of `/rewind`; a bare command rewinds one turn.
fn rewind_turns(arg: &str) -> Result<i64, ParseIntError> {
    match arg.trim() {
        "" => Ok(1),
        n => n.parse(),
    }
}

async fn backup(chat: &ChatSession, label: Option<&str>) {
    match chat.backup(BACKUP_ROOT, label).await {
        Ok(dir) => eprintln!("\x1b[2m  [saved to {}]\x1b[0m", dir.display()),
        Err(e) => eprintln!("\x1b[1;31mbackup failed:\x1b[0m {e}"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let provider = build_provider(&cli);

    let system_prompt = match cli.system_prompt {
        Some(ref path) => tokio::fs::read_to_string(path).await.unwrap_or_else(|e| {
            eprintln!("error: cannot read {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => String::new(),
    };

    let config = ChatConfig {
        model: cli.model.clone(),
        max_history: cli.max_length,
        user_name: cli.user_name.clone(),
        max_tool_rounds: cli.max_rounds,
        tool_server_url: None,
        options: ChatOptions {
            inject_wall_clock: cli.add_date_time,
            ..ChatOptions::default()
        },
    };

    let mut chat = ChatSession::new(provider, system_prompt, config);
    if let Some(ref url) = cli.server_address {
        let mut invoker = RemoteToolInvoker::new(url);
        if let Some(ref password) = cli.server_password {
            invoker = invoker.with_token(password);
        }
        chat = chat.connect_tool_server(invoker).await;
    }

    if let Some(ref dir) = cli.prev_context {
        let restored = match chat.deserialize_context(dir.join(HISTORY_FILE)).await {
            Ok(()) => chat.deserialize_params(dir.join(PARAMS_FILE)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = restored {
            eprintln!("error: cannot resume from {}: {e}", dir.display());
            std::process::exit(1);
        }
    }

    // Ctrl-C cancels whatever turn is running; repeated presses force an exit.
    let current = Arc::new(Mutex::new(CancellationToken::new()));
    let presses = Arc::new(AtomicUsize::new(0));
    {
        let current = current.clone();
        let presses = presses.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let n = presses.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= FORCE_EXIT_PRESSES {
                    eprintln!("\nforced exit.");
                    std::process::exit(130);
                }
                if let Ok(token) = current.lock() {
                    token.cancel();
                }
                eprintln!(
                    "\n\x1b[2m  [interrupted, {} more to quit]\x1b[0m",
                    FORCE_EXIT_PRESSES - n
                );
            }
        });
    }

    eprintln!("toolchat");
    eprintln!("provider: {} ({})", cli.provider, cli.base_url);
    eprintln!("model: {}", chat.config().model);
    eprintln!("tools: {}", chat.tools().tool_names().join(", "));
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36m{}>\x1b[0m ", chat.config().user_name);
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }
        if trimmed == "/history" {
            println!("{}", chat.formatted_history());
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("/rewind") {
            let turns = match rewind_turns(rest) {
                Ok(turns) => turns,
                Err(e) => {
                    eprintln!("\x1b[1;31merror:\x1b[0m /rewind expects a number of turns: {e}");
                    continue;
                }
            };
            match chat.rewind(turns) {
                Ok(removed) => eprintln!("\x1b[2m  [removed {removed} messages]\x1b[0m"),
                Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("/backup") {
            let label = Some(rest.trim()).filter(|l| !l.is_empty());
            backup(&chat, label).await;
            continue;
        }

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = current.lock() {
            *slot = cancel.clone();
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<ChatEvent>(64);
        let model = chat.config().model.clone();

        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ChatEvent::ToolCall { name, arguments } => {
                        eprintln!("\x1b[33m  [tool: {name}]\x1b[0m {arguments}");
                    }
                    ChatEvent::ToolResult { name, output } => {
                        let truncated: String = output.chars().take(200).collect();
                        let ellipsis = if truncated.len() < output.len() { "..." } else { "" };
                        eprintln!("\x1b[33m  [result: {name}]\x1b[0m {truncated}{ellipsis}");
                    }
                    ChatEvent::Finished { rounds } => {
                        if rounds > 1 {
                            eprintln!("\x1b[2m  ({rounds} rounds)\x1b[0m");
                        }
                    }
                    _ => {}
                }
            }
        });

        let result = chat.run_turn(trimmed, Some(cancel), Some(tx)).await;
        printer.await.ok();
        match result {
            Ok(reply) => {
                presses.store(0, Ordering::SeqCst);
                eprint!("\x1b[1;32m{model}>\x1b[0m ");
                println!("{}", reply.text);
                eprintln!(
                    "\x1b[2m  [{}in / {}out tokens]\x1b[0m",
                    reply.usage.input_tokens, reply.usage.output_tokens
                );
            }
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
    }

    backup(&chat, None).await;
    eprintln!("bye.");
}
