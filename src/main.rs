use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Level;
use tron_client::{
    Address, AuthorizationHandler, ClientConfig, ClientError, DaemonClient, QuestionHandler,
    Transcript,
};
use tron_core::ids::SessionId;
use tron_core::payloads::{
    AuthorizationDecision, AuthorizationRequest, QuestionAnswer, QuestionRequest,
};
use tron_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "tron", about = "Talk to a running tron agent daemon", version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(
        long,
        global = true,
        env = "TRON_LOG_FORMAT",
        default_value = "pretty",
        help = "Log encoding on stderr (json or pretty)"
    )]
    log_format: LogFormat,

    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "More logging (-v, -vv)")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(
        long,
        global = true,
        env = "TRON_SOCKET",
        value_name = "ADDRESS",
        help = "Daemon address: unix:<path>, tcp:<host:port> or a socket path"
    )]
    socket: Option<Address>,

    #[arg(long, global = true, env = "TRON_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, global = true, default_value_t = 30, help = "Request timeout in seconds")]
    timeout: u64,
}

impl ConnectionArgs {
    fn to_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.socket.clone().unwrap_or_default())
            .with_identity("tron-cli", env!("CARGO_PKG_VERSION"));
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        config.request_timeout = Duration::from_secs(self.timeout.max(1));
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, ping and print connection diagnostics
    Status,
    /// List sessions known to the daemon
    Sessions,
    /// List workspaces known to the daemon
    Workspaces,
    /// Send one message and stream the reply
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Attach to this session instead of creating one
    #[arg(long)]
    session: Option<String>,

    /// Workspace for a newly created session
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Approve every tool authorization request
    #[arg(long)]
    yes: bool,

    /// Message text
    #[arg(required = true, num_args = 1..)]
    message: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_telemetry(&TelemetryConfig {
        log_level,
        format: cli.log_format,
        ..Default::default()
    })?;

    let config = cli.connection.to_config();
    let address = config.address.clone();
    let client = DaemonClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to daemon at {address}"))?;

    let outcome = match cli.command {
        Command::Status => status(&client).await,
        Command::Sessions => sessions(&client).await,
        Command::Workspaces => workspaces(&client).await,
        Command::Chat(args) => chat(&client, args).await,
    };
    client.disconnect().await;
    outcome
}

async fn status(client: &DaemonClient) -> Result<()> {
    let rtt = client.ping().await?;
    println!("address:  {}", client.config().address);
    println!("state:    {}", client.state());
    println!("rtt:      {:.1} ms", rtt.as_secs_f64() * 1000.0);
    println!(
        "stats:    {}",
        serde_json::to_string(&client.stats().snapshot())?
    );
    Ok(())
}

async fn sessions(client: &DaemonClient) -> Result<()> {
    let sessions = client.list_sessions().await?;
    if sessions.is_empty() {
        println!("no sessions");
    }
    for session in sessions {
        let workspace = session
            .workspace
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}",
            session.session_id,
            session.title.unwrap_or_default(),
            workspace
        );
    }
    Ok(())
}

async fn workspaces(client: &DaemonClient) -> Result<()> {
    for workspace in client.list_workspaces().await? {
        println!(
            "{}\t{}",
            workspace.path.display(),
            workspace.name.unwrap_or_default()
        );
    }
    Ok(())
}

/// Prints each request to stderr and applies a fixed policy.
struct CliAuthorizer {
    approve: bool,
}

#[async_trait]
impl AuthorizationHandler for CliAuthorizer {
    async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationDecision, ClientError> {
        let tool = request.tool_name.as_deref().unwrap_or("tool");
        eprintln!("[authorization] {tool}: {}", request.description);
        if self.approve {
            Ok(AuthorizationDecision::approve())
        } else {
            eprintln!("[authorization] denied (re-run with --yes to approve)");
            Ok(AuthorizationDecision::deny("denied by tron-cli"))
        }
    }
}

/// Non-interactive: picks the first option of every question.
struct FirstOption;

#[async_trait]
impl QuestionHandler for FirstOption {
    async fn answer(&self, request: QuestionRequest) -> Result<QuestionAnswer, ClientError> {
        eprintln!("[question] {}", request.prompt);
        if request.multi {
            let answers = request
                .questions
                .iter()
                .filter_map(|q| q.options.first().map(|o| (q.id.clone(), o.label.clone())))
                .collect();
            return Ok(QuestionAnswer::Multi(answers));
        }
        match request.options.first() {
            Some(option) => Ok(QuestionAnswer::Single(option.label.clone())),
            None => Err(ClientError::Handler("no options to choose from".into())),
        }
    }
}

async fn chat(client: &DaemonClient, args: ChatArgs) -> Result<()> {
    let callbacks = client.callbacks();
    callbacks.set_authorization_handler(Arc::new(CliAuthorizer { approve: args.yes }));
    callbacks.set_question_handler(Arc::new(FirstOption));

    let transcript = Arc::new(Mutex::new(Transcript::new()));
    let sink = transcript.clone();
    callbacks.on_chat_message(move |message| {
        let mut transcript = sink.lock();
        let streamed = transcript
            .message(&message.message_id)
            .is_some_and(|text| !text.is_empty());
        if !transcript.apply(&message) {
            return;
        }
        // Deltas are printed as they arrive; a final frame only prints when
        // nothing was streamed for its message.
        if !message.is_final || !streamed {
            print!("{}", message.content);
            let _ = std::io::stdout().flush();
        }
    });
    callbacks.on_tool_call(|call| eprintln!("[tool] {}", call.name));
    callbacks.on_progress(|progress| eprintln!("[progress] {}", progress.message));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    callbacks.on_chat_complete(move |complete| {
        let _ = done_tx.send(complete.stop_reason);
    });
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    callbacks.on_connection_lost(move |reason| {
        let _ = lost_tx.send(reason);
    });

    let session_id = match args.session {
        Some(id) => client.attach_session(SessionId::from_raw(id)).await?.session_id,
        None => client.create_session(args.workspace).await?.session_id,
    };
    tracing::info!(session_id = %session_id, "chatting");

    client.chat_send(session_id, args.message.join(" ")).await?;

    tokio::select! {
        stop = done_rx.recv() => {
            println!();
            if let Some(Some(reason)) = stop {
                tracing::info!(stop_reason = %reason, "turn complete");
            }
            Ok(())
        }
        reason = lost_rx.recv() => {
            bail!("connection lost: {}", reason.unwrap_or_default())
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            Ok(())
        }
    }
}
