use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chatstream_core::{
    auth::StaticAuth,
    config::SessionConfig,
    error::ChatError,
    http_client::HttpSseTransport,
    model::{ChatMessage, MessageStatus, Role},
    session::{ChatSession, UpdateSink},
    transport::ScriptedTransport,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatstream CLI: stream or replay assistant replies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the reply as it streams (token from CHATSTREAM_TOKEN)
    Chat {
        #[arg(short, long, help = "Session config (JSON or TOML)")]
        config: PathBuf,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Feed a recorded stream through the pipeline and print the final message as JSON
    Replay {
        #[arg(short, long, help = "Recording with one stream line per line")]
        file: PathBuf,
        #[arg(long, default_value_t = 50)]
        debounce_ms: u64,
        #[arg(short, long, default_value = "replay")]
        message: String,
    },
}

/// Prints newly arrived content as it streams and counts updates.
#[derive(Default)]
struct PrintSink {
    echo: bool,
    state: Mutex<PrintState>,
}

#[derive(Default)]
struct PrintState {
    message_id: String,
    printed: usize,
    updates: usize,
}

impl PrintSink {
    fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    fn updates(&self) -> usize {
        self.state.lock().map(|s| s.updates).unwrap_or(0)
    }
}

impl UpdateSink for PrintSink {
    fn message_updated(&self, message: ChatMessage) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.updates += 1;
        if !self.echo || message.status == MessageStatus::Failed {
            return;
        }
        if state.message_id != message.id {
            state.message_id = message.id.clone();
            state.printed = 0;
        }
        if let Some(fresh) = message.content.get(state.printed..) {
            print!("{fresh}");
            io::stdout().flush().ok();
            state.printed = message.content.len();
        }
    }

    fn error(&self, err: &ChatError) {
        eprintln!("\n[{}: {err}]", err.kind());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Chat { config, message } => {
            let cfg = SessionConfig::from_path(&config)?;
            let transport = Arc::new(HttpSseTransport::from_config(&cfg.endpoint)?);
            let auth = Arc::new(StaticAuth::from_token(std::env::var("CHATSTREAM_TOKEN").ok()));
            let sink = Arc::new(PrintSink::echo());
            let mut session = ChatSession::new(cfg, transport, auth, sink);

            let stop = session.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.stop();
                }
            });

            let outcome = session.handle_submit(&message).await?;
            println!();
            eprintln!("[{}]", outcome.as_str());
        }
        Commands::Replay {
            file,
            debounce_ms,
            message,
        } => {
            let recording = std::fs::read_to_string(&file)?;
            let mut cfg = SessionConfig::for_url(format!("replay://{}", file.display()));
            cfg.stream.debounce_ms = debounce_ms;

            let transport = Arc::new(ScriptedTransport::new());
            transport.push_recording(&recording);
            let sink = Arc::new(PrintSink::default());
            let mut session = ChatSession::new(
                cfg,
                transport,
                Arc::new(StaticAuth::anonymous()),
                sink.clone(),
            );

            let outcome = session.handle_submit(&message).await?;
            if let Some(reply) = session
                .messages_newest_first()
                .find(|m| m.role == Role::Assistant)
            {
                println!("{}", serde_json::to_string_pretty(reply)?);
            }
            eprintln!("[{} after {} updates]", outcome.as_str(), sink.updates());
        }
    }

    Ok(())
}
