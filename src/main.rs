//! Relayport CLI - forward local ports through a reliable session channel

mod broker;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relayport_session::{
    run_forwarding_session, AgentSession, ChannelConfig, ForwardingMode, ForwardingRequest,
    SessionBroker, SessionEnd, SessionError, SessionSummary, StaticBroker,
};
use relayport_transport::{DefaultTransportProvider, TcpTransport};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::broker::HttpSessionBroker;
use crate::config::{effective_profile, ProfileFile};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Relayport - forward local ports to remote targets over a session channel
#[derive(Parser, Debug)]
#[command(name = "relayport")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "RELAYPORT_LOG")]
    log_level: String,

    /// Profiles file (default: ~/.relayport/profiles.yaml)
    #[arg(long, global = true, env = "RELAYPORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Multiplexed,
    Single,
}

impl From<ModeArg> for ForwardingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Multiplexed => ForwardingMode::Multiplexed,
            ModeArg::Single => ForwardingMode::Single,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Forward a local port to a port on a remote target
    #[command(long_about = r#"
Bind a local port and forward every connection to a port on a remote
target through one reliable session channel.

EXAMPLES:
  # Forward localhost:50000 to port 8080 on the target named jenkins
  relayport forward --target jenkins --remote-port 8080 --local-port 50000

  # Connect straight to an agent, no broker involved
  relayport forward --target i-0abc --stream-url tcp://10.0.0.5:7000

ENVIRONMENT VARIABLES:
  RELAYPORT_PROFILE     Profile to use, same as --profile
  AWS_PROFILE           Used only when neither --profile nor RELAYPORT_PROFILE
                        is set; an explicit profile always wins over it
  RELAYPORT_STREAM_URL  Fixed stream URL, bypasses the broker
  RELAYPORT_TOKEN       Session token for a fixed stream URL
    "#)]
    Forward {
        /// Profile from the profiles file; wins over AWS_PROFILE, which is
        /// only consulted when this is unset (then "default")
        #[arg(long, env = "RELAYPORT_PROFILE")]
        profile: Option<String>,

        /// Target name or id
        #[arg(long, visible_alias = "instance-name")]
        target: String,

        /// Port on the remote target
        #[arg(long, visible_alias = "src-port", default_value = "8080")]
        remote_port: u16,

        /// Local port to listen on (0 picks a free port)
        #[arg(long, visible_alias = "dst-port", default_value = "50000")]
        local_port: u16,

        /// Local address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Connect straight to this stream URL instead of asking the broker
        #[arg(long, env = "RELAYPORT_STREAM_URL")]
        stream_url: Option<String>,

        /// Token presented with a fixed stream URL
        #[arg(long, env = "RELAYPORT_TOKEN", default_value = "")]
        token: String,

        /// Connection sharing mode (overrides the profile)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// Accept session channels and forward their connections to a target service
    Agent {
        /// Address to accept channels on
        #[arg(long, default_value = "0.0.0.0:7000", env = "RELAYPORT_AGENT_LISTEN")]
        listen: SocketAddr,

        /// Target service address, e.g. 127.0.0.1:8080
        #[arg(long)]
        target: String,

        /// Token clients must present
        #[arg(long, env = "RELAYPORT_TOKEN")]
        token: Option<String>,

        /// Profile whose tuning applies
        #[arg(long, env = "RELAYPORT_PROFILE")]
        profile: Option<String>,
    },
}

/// Setup logging with the specified log level
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `cancel` on Ctrl+C
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    });
}

fn log_summary(summary: &SessionSummary) {
    info!(
        end = ?summary.end,
        bytes_sent = summary.bytes_sent,
        bytes_received = summary.bytes_received,
        connections = summary.connections,
        retransmissions = summary.retransmissions,
        "Session finished"
    );
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    profiles: &ProfileFile,
    profile: Option<String>,
    target: String,
    remote_port: u16,
    local_addr: SocketAddr,
    stream_url: Option<String>,
    token: String,
    mode: Option<ModeArg>,
    cancel: CancellationToken,
) -> Result<SessionSummary> {
    let profile_name = effective_profile(profile);
    let profile = profiles.profile(&profile_name)?;
    info!("Using profile '{}'", profile_name);

    let mut config = profile.channel_config();
    if let Some(mode) = mode {
        config = config.with_mode(mode.into());
    }

    let broker: Box<dyn SessionBroker> = match stream_url.or_else(|| profile.stream_url.clone()) {
        Some(url) => {
            info!("Connecting directly to {}", url);
            Box::new(StaticBroker::new(url, token))
        }
        None => {
            let broker_url = profile.broker_url.clone().with_context(|| {
                format!(
                    "Profile '{}' has neither broker_url nor stream_url",
                    profile_name
                )
            })?;
            Box::new(HttpSessionBroker::new(broker_url, profile.credentials()?))
        }
    };

    let request = ForwardingRequest {
        target,
        remote_port,
        local_addr,
    };
    let provider = DefaultTransportProvider::new().with_connect_timeout(config.connect_timeout);
    let summary = run_forwarding_session(
        &request,
        &profile.resolver(),
        broker.as_ref(),
        &provider,
        config,
        cancel,
    )
    .await?;
    Ok(summary)
}

async fn agent(
    listen: SocketAddr,
    target: String,
    token: Option<String>,
    config: ChannelConfig,
    cancel: CancellationToken,
) -> Result<()> {
    config.validate()?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind agent listener on {}", listen))?;
    info!("🚀 Agent listening on {}, forwarding to {}", listen, target);

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept channel: {}", e);
                        continue;
                    }
                };
                info!("🔗 Channel connection from {}", peer);

                let mut session = AgentSession::new(target.clone(), config.clone())?;
                if let Some(token) = &token {
                    session = session.with_token(token.clone());
                }
                let transport = Box::new(TcpTransport::from_stream(stream));
                let cancel = cancel.child_token();
                sessions.spawn(async move {
                    match session.serve(transport, cancel).await {
                        Ok(summary) => log_summary(&summary),
                        Err(e) => error!("Session from {} failed in {} phase: {}", peer, e.phase(), e),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    while sessions.join_next().await.is_some() {}
    info!("Agent stopped");
    Ok(())
}

/// Print a failure with the phase it happened in
fn report(e: &anyhow::Error) {
    match e.downcast_ref::<SessionError>() {
        Some(session) => error!("❌ Failed during {}: {:#}", session.phase(), e),
        None => error!("❌ {:#}", e),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let profiles = match ProfileFile::load(cli.config.as_deref()) {
        Ok(profiles) => profiles,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = match cli.command {
        Commands::Forward {
            profile,
            target,
            remote_port,
            local_port,
            bind,
            stream_url,
            token,
            mode,
        } => forward(
            &profiles,
            profile,
            target,
            remote_port,
            SocketAddr::new(bind, local_port),
            stream_url,
            token,
            mode,
            cancel,
        )
        .await
        .map(|summary| {
            log_summary(&summary);
            if summary.end == SessionEnd::PeerClosed {
                info!("Remote side closed the session");
            }
        }),
        Commands::Agent {
            listen,
            target,
            token,
            profile,
        } => match profiles.profile(&effective_profile(profile)) {
            Ok(profile) => agent(listen, target, token, profile.channel_config(), cancel).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
