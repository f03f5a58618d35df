//! Huddle CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use futures::StreamExt;
use huddle_core::prelude::*;
use huddle_core::{
    Directory, NegotiationError, PeerConnector, RemoteBehavior, Role, SessionDescription,
    TransportEventSink, TransportSession,
};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;

mod display;
#[cfg(test)]
mod display_tests;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Display name (defaults to the directory user or a random name)
    #[arg(short, long, env = "HUDDLE_IDENTITY")]
    identity: Option<String>,

    /// Configuration file (JSON)
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory file (JSON) with the user and their friends
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Peer connection backend
    #[arg(long, value_enum, default_value = "loopback")]
    backend: Backend,

    /// How the simulated remote reacts to our calls
    #[arg(long, value_enum)]
    remote: Option<RemoteArg>,

    /// Delay before the simulated remote reacts, in milliseconds
    #[arg(long)]
    answer_delay_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// In-process loopback peer
    Loopback,
    /// RTCPeerConnection from the webrtc crate
    #[cfg(feature = "webrtc-backend")]
    Webrtc,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RemoteArg {
    Answer,
    Decline,
    Busy,
    Silent,
}

impl From<RemoteArg> for RemoteBehavior {
    fn from(arg: RemoteArg) -> Self {
        match arg {
            RemoteArg::Answer => Self::Answer,
            RemoteArg::Decline => Self::Decline,
            RemoteArg::Busy => Self::Busy,
            RemoteArg::Silent => Self::Silent,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Call a friend
    Call {
        /// Friend to call
        peer: String,

        /// Hang up after this many seconds (Ctrl-C hangs up earlier)
        #[arg(long, default_value = "10")]
        hold_secs: u64,

        /// Switch to screen sharing once connected
        #[arg(long)]
        share_screen: bool,

        /// Send a chat message once the channel opens
        #[arg(long)]
        message: Option<String>,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept without asking
        #[arg(long, conflicts_with = "reject")]
        auto_accept: bool,

        /// Reject without asking
        #[arg(long)]
        reject: bool,

        /// Have a friend call us right away, then exit when the call ends
        #[arg(long)]
        simulate: bool,

        /// Hang up accepted calls after this many seconds
        #[arg(long, default_value = "10")]
        hold_secs: u64,
    },

    /// Show configuration, friends and backend status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(remote) = cli.remote {
        config.remote_behavior = remote.into();
    }
    if let Some(ms) = cli.answer_delay_ms {
        config.answer_delay = Duration::from_millis(ms);
    }
    let directory = Arc::new(load_directory(cli.directory.as_deref())?);

    let identity = cli
        .identity
        .or_else(|| directory.current_user().map(|u| u.username))
        .unwrap_or_else(generate_random_identity);
    println!("🔗 Using identity: {}", identity);

    match cli.command {
        Commands::Call {
            peer,
            hold_secs,
            share_screen,
            message,
        } => {
            let calls = spawn_manager(&config, cli.backend, directory);
            handle_call(&calls, &peer, hold_secs, share_screen, message).await?;
            calls.shutdown().await?;
        }
        Commands::Listen {
            auto_accept,
            reject,
            simulate,
            hold_secs,
        } => {
            let calls = spawn_manager(&config, cli.backend, directory);
            handle_listen(&calls, auto_accept, reject, simulate, hold_secs).await?;
            calls.shutdown().await?;
        }
        Commands::Status => {
            handle_status(&config, directory.as_ref()).await?;
        }
    }

    Ok(())
}

fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("chat", "huddle", "huddle").map(|dirs| dirs.config_dir().to_path_buf())
}

fn load_config(path: Option<&Path>) -> Result<CallManagerConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match config_dir().map(|dir| dir.join("config.json")) {
            Some(path) if path.exists() => path,
            _ => return Ok(CallManagerConfig::default()),
        },
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn load_directory(path: Option<&Path>) -> Result<InMemoryDirectory> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match config_dir().map(|dir| dir.join("directory.json")) {
            Some(path) if path.exists() => path,
            _ => return Ok(InMemoryDirectory::seeded()),
        },
    };
    InMemoryDirectory::load(&path).with_context(|| format!("loading directory {}", path.display()))
}

fn spawn_manager(
    config: &CallManagerConfig,
    backend: Backend,
    directory: Arc<InMemoryDirectory>,
) -> CallHandle<PeerIdentityString> {
    let connector: Arc<dyn PeerConnector> = match backend {
        Backend::Loopback => Arc::new(LoopbackConnector::new()),
        #[cfg(feature = "webrtc-backend")]
        Backend::Webrtc => {
            println!("⚠️  The simulated remote cannot complete real connectivity checks;");
            println!("   webrtc calls will end when the negotiation timeout expires.");
            Arc::new(WebRtcConnector::new(config.ice_servers.clone()))
        }
    };
    let signaling: Arc<SignalingSimulator<PeerIdentityString>> =
        Arc::new(config.simulator(connector.clone(), directory));

    CallSessionManager::builder(signaling)
        .with_config(config.clone())
        .with_media(Arc::new(SimulatedDevices::new()))
        .with_connector(connector)
        .spawn()
}

/// Print events until one matches `done`. Returns false if the call went idle first.
async fn follow_until(
    events: &mut BroadcastStream<CallEvent<PeerIdentityString>>,
    mut done: impl FnMut(&CallEvent<PeerIdentityString>) -> bool,
) -> Result<bool> {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Some(line) = display::describe(&event) {
                    println!("{line}");
                }
                if done(&event) {
                    return Ok(true);
                }
                if matches!(event, CallEvent::StateChanged(CallState::Idle)) {
                    return Ok(false);
                }
            }
            Err(e) => {
                tracing::warn!("Event stream lagged: {}", e);
            }
        }
    }
    bail!("call manager stopped")
}

async fn hold_call(
    calls: &CallHandle<PeerIdentityString>,
    events: &mut BroadcastStream<CallEvent<PeerIdentityString>>,
    hold: Duration,
) -> Result<()> {
    tokio::select! {
        ended = follow_until(events, |_| false) => {
            ended?;
            return Ok(());
        }
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    for line in display::summary(&calls.snapshot().await?) {
        println!("   {line}");
    }
    calls.end().await?;
    follow_until(events, |e| matches!(e, CallEvent::StateChanged(CallState::Idle))).await?;
    Ok(())
}

async fn handle_call(
    calls: &CallHandle<PeerIdentityString>,
    peer: &str,
    hold_secs: u64,
    share_screen: bool,
    message: Option<String>,
) -> Result<()> {
    println!("📞 Calling {}...", peer);
    let mut events = BroadcastStream::new(calls.subscribe());

    let call_id = match calls.start(PeerIdentityString::new(peer)).await {
        Ok(call_id) => call_id,
        Err(e) => {
            println!("❌ Could not start call: {}", e);
            return Ok(());
        }
    };
    println!("📞 Call initiated with ID: {}", call_id);

    let mut connected = false;
    let mut chat_open = false;
    let ready = follow_until(&mut events, |event| {
        match event {
            CallEvent::StateChanged(CallState::Connected) => connected = true,
            CallEvent::AuxChannelOpened { .. } => chat_open = true,
            _ => {}
        }
        connected && chat_open
    })
    .await?;
    if !ready {
        return Ok(());
    }

    if share_screen {
        if let Err(e) = calls.toggle_screen_share().await {
            println!("⚠️  Screen share failed: {}", e);
        }
    }
    if let Some(message) = message {
        calls.send_message(message).await?;
    }

    hold_call(calls, &mut events, Duration::from_secs(hold_secs)).await
}

async fn handle_listen(
    calls: &CallHandle<PeerIdentityString>,
    auto_accept: bool,
    reject: bool,
    simulate: bool,
    hold_secs: u64,
) -> Result<()> {
    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }
    let mut events = BroadcastStream::new(calls.subscribe());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    if simulate {
        calls.simulate_incoming_call().await?;
    }

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                tracing::warn!("Event stream lagged: {}", e);
                continue;
            }
            None => break,
        };
        if let Some(line) = display::describe(&event) {
            println!("{line}");
        }

        if let CallEvent::IncomingCall { .. } = event {
            let accept = if reject {
                false
            } else if auto_accept {
                true
            } else {
                println!("   Accept? [y/N]");
                matches!(
                    stdin.next_line().await?.as_deref().map(str::trim),
                    Some("y" | "Y" | "yes")
                )
            };

            if accept {
                println!("✅ Accepting call...");
                if let Err(e) = calls.accept().await {
                    println!("❌ Could not accept: {}", e);
                } else if follow_until(&mut events, |e| {
                    matches!(e, CallEvent::StateChanged(CallState::Connected))
                })
                .await?
                {
                    hold_call(calls, &mut events, Duration::from_secs(hold_secs)).await?;
                }
            } else {
                calls.reject().await?;
            }

            if simulate {
                break;
            }
        }
    }

    Ok(())
}

async fn handle_status(config: &CallManagerConfig, directory: &dyn Directory) -> Result<()> {
    println!("📊 Huddle Status");
    println!("================");
    match directory.current_user() {
        Some(user) => println!("👤 Signed in as {} <{}>", user.username, user.email),
        None => println!("👤 Not signed in"),
    }
    println!("👥 Friends:");
    for friend in directory.list_friends() {
        let marker = if friend.blocked { " (blocked)" } else { "" };
        println!("   {} <{}> {:?}{}", friend.username, friend.email, friend.presence, marker);
    }
    println!();

    if let Some(dir) = config_dir() {
        println!("📁 Config directory: {}", dir.display());
    }
    println!("⚙️  Configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();

    check_backend("Loopback", &LoopbackConnector::new(), config).await;
    #[cfg(feature = "webrtc-backend")]
    check_backend("WebRTC", &WebRtcConnector::new(config.ice_servers.clone()), config).await;
    #[cfg(not(feature = "webrtc-backend"))]
    println!("⚠️  WebRTC backend: not compiled in");

    println!();
    println!("Available commands:");
    println!("  huddle call <peer> [options]  - Call a friend");
    println!("  huddle listen [options]       - Wait for calls");
    println!("  huddle status                 - Show this status");
    println!();
    println!("Use 'huddle --help' for detailed options");

    Ok(())
}

/// Build an offer on a throwaway connection to prove the backend works
async fn check_backend(name: &str, connector: &dyn PeerConnector, config: &CallManagerConfig) {
    let result: Result<SessionDescription, NegotiationError> = async {
        let mut transport = TransportSession::open(
            connector,
            Role::Caller,
            TransportEventSink::detached(),
            &config.aux_channel_label,
        )
        .await?;
        let offer = transport.create_offer().await;
        transport.close().await;
        offer
    }
    .await;

    match result {
        Ok(offer) => {
            let sections = offer.sdp.lines().filter(|l| l.starts_with("m=")).count();
            println!("✅ {name} backend: offer with {sections} media section(s)");
        }
        Err(e) => println!("❌ {name} backend: {e}"),
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "dune", "ember", "fjord", "grove", "heath", "iris", "juniper",
        "kestrel", "lark", "maple", "nettle", "oak", "pine", "quill", "reed", "sage", "thistle",
        "umber", "vale", "willow", "yarrow",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{}-{}", word, rng.gen_range(100..1000))
}
