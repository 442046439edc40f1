//! Command-line demo client for the ringline call engine.
//!
//! Connects to a signaling server, places or answers a call, and prints
//! every engine event until the call ends or ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use url::Url;

use ringline_core::{
    CallEvent, CallService, Connector, HttpIceEndpoint, IceEndpoint, MediaKind, WsConnector,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "ringline", about = "Place and receive calls from the terminal")]
struct Cli {
    /// Signaling server URL
    #[arg(long, env = "RINGLINE_SERVER", default_value = "wss://localhost:8443/ws")]
    server: Url,

    /// Local user id
    #[arg(long, env = "RINGLINE_USER")]
    user: String,

    /// Identity token for the signaling server
    #[arg(long, env = "RINGLINE_TOKEN")]
    token: String,

    /// Optional ICE credential endpoint URL
    #[arg(long, env = "RINGLINE_ICE_URL")]
    ice_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place a call to a peer
    Call {
        /// Peer user id to call
        peer: String,
        /// Request a video call instead of audio-only
        #[arg(long)]
        video: bool,
        /// Optional correlation token
        #[arg(long)]
        context: Option<String>,
    },
    /// Wait for incoming calls
    Listen {
        /// Accept the first incoming call automatically
        #[arg(long)]
        auto_accept: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut builder = CallService::<WsConnector>::builder(&cli.user, &cli.token, cli.server.clone());
    if let Some(ice_url) = &cli.ice_url {
        let endpoint: Arc<dyn IceEndpoint> =
            Arc::new(HttpIceEndpoint::new(ice_url).context("ice endpoint setup")?);
        builder = builder.with_ice_endpoint(endpoint);
    }
    let service = builder.build();

    let mut events = service.subscribe();
    service.connect().await.context("signaling connect")?;
    tracing::info!(server = %cli.server, user = cli.user, "connected");

    let auto_accept = matches!(cli.command, Command::Listen { auto_accept: true });
    match &cli.command {
        Command::Call { peer, video, context } => {
            let media = if *video { MediaKind::Video } else { MediaKind::Audio };
            service.start_call(peer, media, context.clone()).await;
        }
        Command::Listen { .. } => {
            tracing::info!("waiting for incoming calls");
        }
    }

    run_event_loop(&service, &mut events, auto_accept).await;

    service.disconnect();
    Ok(())
}

async fn run_event_loop<C: Connector>(
    service: &CallService<C>,
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    auto_accept: bool,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("hanging up");
                service.end_call(Some("user_quit".to_string())).await;
                break;
            }
            _ = heartbeat.tick() => {
                service.heartbeat().await;
            }
            event = events.recv() => {
                let Ok(event) = event else { break };
                match &event {
                    CallEvent::IncomingCall { call_id, from_user_id, media_kind, .. } => {
                        println!("incoming {media_kind} call {call_id} from {from_user_id}");
                        if auto_accept {
                            println!("auto-accepting {call_id}");
                            service.accept_call(call_id).await;
                        }
                    }
                    CallEvent::CallRinging { call_id, role } => {
                        println!("call {call_id} ringing ({role:?})");
                    }
                    CallEvent::CallActive { call_id, media_kind } => {
                        println!("call {call_id} active ({media_kind})");
                    }
                    CallEvent::RemoteStreamReady { call_id, media } => {
                        println!("call {call_id}: remote {} track ({})", media.kind, media.mime_type);
                    }
                    CallEvent::CallEnded { call_id, reason, .. } => {
                        println!("call {call_id:?} ended ({reason:?})");
                        break;
                    }
                    CallEvent::CallRejected { call_id, reason } => {
                        println!("call {call_id} rejected ({reason:?})");
                        break;
                    }
                    CallEvent::CallCanceled { call_id, reason } => {
                        println!("call {call_id} canceled ({reason:?})");
                        if !auto_accept {
                            break;
                        }
                    }
                    CallEvent::Error { code, message } => {
                        eprintln!("error [{code}]: {message}");
                    }
                    other => {
                        tracing::debug!(?other, "event");
                    }
                }
            }
        }
    }
}
