use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use storyloom_client::session::StreamStatus;
use storyloom_client::{
    select_transport, ClientConfig, HttpSessionApi, SendOptions, SessionMachine,
    TransportPreference,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::render::{scene_lines, Printer};

#[derive(Parser, Debug)]
#[command(name = "storyloom")]
#[command(about = "Drive a storyloom agent session from the terminal")]
pub struct Cli {
    /// REST base URL (e.g., http://localhost:8000/api)
    #[arg(long, env = "STORYLOOM_API_BASE_URL", global = true)]
    pub api_base_url: Option<String>,

    /// Run socket base URL; enables the websocket transport
    #[arg(long, env = "STORYLOOM_WS_BASE_URL", global = true)]
    pub ws_base_url: Option<String>,

    #[arg(long, env = "STORYLOOM_AUTH_TOKEN", global = true, hide_env_values = true)]
    pub auth_token: Option<String>,

    /// auto, websocket or event_stream
    #[arg(long, env = "STORYLOOM_TRANSPORT", global = true)]
    pub transport: Option<TransportPreference>,

    /// Print the final session view as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message and stream the reply
    Chat {
        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,

        /// Model override for this run
        #[arg(short, long)]
        model: Option<String>,

        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },

    /// Load a session and print it
    Load {
        session: String,

        /// Keep streaming if the session has an active run
        #[arg(short, long)]
        follow: bool,
    },

    /// Approve a session pending review
    Approve {
        session: String,
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Reject a session pending review
    Reject {
        session: String,
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Ask the server to cancel a run
    Cancel { run_id: String },

    /// Follow a session's active run, reconnecting with backoff on failure
    Watch { session: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let api = Arc::new(HttpSessionApi::from_config(&config).context("building REST client")?);
    let transport =
        select_transport(&config, api.clone()).context("selecting stream transport")?;
    info!(target = "storyloom.cli", transport = ?transport.kind(), api = %config.api_base_url, "client ready");
    let machine = SessionMachine::from_config(&config, api.clone(), transport);
    let mut printer = Printer::default();

    match cli.command {
        Commands::Chat {
            session,
            model,
            text,
        } => {
            if let Some(session) = session {
                machine.load_session(&session).await?;
                machine.stop();
                printer.update(&machine.snapshot())?;
            }
            let run_id = machine
                .send_message(
                    &text.join(" "),
                    SendOptions {
                        model,
                        metadata: None,
                    },
                )
                .await?;
            info!(target = "storyloom.cli", %run_id, "run started");
            let status = follow(&machine, &mut printer).await?;
            finish_stream(&machine, status)?;
        }
        Commands::Load { session, follow: keep } => {
            machine.load_session(&session).await?;
            if keep {
                let status = follow(&machine, &mut printer).await?;
                finish_stream(&machine, status)?;
            } else {
                machine.stop();
                printer.update(&machine.snapshot())?;
            }
            for line in scene_lines(&machine.snapshot().scenes) {
                println!("{line}");
            }
        }
        Commands::Approve { session, note } => {
            let review = machine.approve_session(&session, note.as_deref()).await?;
            println!("session {session}: {}", review.status);
        }
        Commands::Reject { session, note } => {
            let review = machine.reject_session(&session, note.as_deref()).await?;
            println!("session {session}: {}", review.status);
        }
        Commands::Cancel { run_id } => {
            api.cancel(&run_id).await?;
            println!("cancel requested for run {run_id}");
        }
        Commands::Watch { session } => {
            watch(&config, &machine, &session).await?;
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&machine.snapshot())?);
    }
    Ok(())
}

/// Environment first, then flags.
fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("loading configuration")?;
    if let Some(url) = &cli.api_base_url {
        config.api_base_url = url.trim().to_string();
    }
    if let Some(url) = &cli.ws_base_url {
        config.ws_base_url = Some(url.trim().to_string()).filter(|url| !url.is_empty());
    }
    if let Some(token) = &cli.auth_token {
        config.auth_token = Some(token.trim().to_string()).filter(|token| !token.is_empty());
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    config.api_base()?;
    Ok(config)
}

/// Renders changes until the stream ends. Ctrl-C cancels the run server-side.
async fn follow(machine: &SessionMachine, printer: &mut Printer) -> Result<StreamStatus> {
    let mut revisions = machine.watch_revision();
    loop {
        let view = machine.snapshot();
        printer.update(&view)?;
        if !view.is_streaming {
            printer.end_line()?;
            return Ok(view.stream_status);
        }
        tokio::select! {
            changed = revisions.changed() => {
                changed.context("session machine went away")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target = "storyloom.cli", "interrupted, cancelling run");
                machine.cancel_run().await?;
            }
        }
    }
}

fn finish_stream(machine: &SessionMachine, status: StreamStatus) -> Result<()> {
    if status == StreamStatus::Error {
        let error = machine.snapshot().error.unwrap_or_default();
        bail!("stream failed: {error}");
    }
    Ok(())
}

/// Follows `session`, reloading it with backoff whenever its stream fails.
async fn watch(config: &ClientConfig, machine: &SessionMachine, session: &str) -> Result<()> {
    let printer = Mutex::new(Printer::default());
    config
        .reconnect_policy()
        .retry(|attempt| {
            let printer = &printer;
            async move {
                if attempt > 0 {
                    warn!(target = "storyloom.cli", session, attempt, "stream dropped, reconnecting");
                }
                watch_once(machine, session, &mut *printer.lock().await).await
            }
        })
        .await
        .with_context(|| format!("giving up on session {session}"))
}

async fn watch_once(machine: &SessionMachine, session: &str, printer: &mut Printer) -> Result<()> {
    machine.load_session(session).await?;
    let status = follow(machine, printer).await?;
    finish_stream(machine, status)?;
    info!(target = "storyloom.cli", session, ?status, "nothing left to follow");
    Ok(())
}
