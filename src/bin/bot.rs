//! Demo binary wiring `VoiceConnection` to a live WebRTC stack and a
//! WebSocket signalling gateway. This is the worked example the surrounding
//! bot framework's own entry point would follow, not a deployable service
//! of its own.
//!
//! Wiring mirrors the teacher's `server/src/main.rs`: tracing init, then
//! `dotenvy::dotenv()`, then config-from-env, then build-and-run.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use voxmesh_core::clock::{FrameClock, SystemClock};
use voxmesh_core::config::{require_env, EffectConfig, VoiceChannelIdentity, VoiceConnectionConfig};
use voxmesh_core::rtc::live::{build_api, rtc_configuration, LiveFactory};
use voxmesh_core::rtc::PeerConnectionFactory;
use voxmesh_core::signalling::gateway::{ConnectionStatus, WebSocketGateway};
use voxmesh_core::voice::connection::PlaybackEvent;
use voxmesh_core::VoiceConnection;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "voxmesh_core=debug".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();

    let config = VoiceConnectionConfig::from_env().context("loading voice connection config")?;
    let identity = VoiceChannelIdentity {
        local_peer_id: require_env("VOXMESH_PEER_ID")?,
        server_id: require_env("VOXMESH_SERVER_ID")?,
        channel_id: require_env("VOXMESH_CHANNEL_ID")?,
    };
    let gateway_url = require_env("VOXMESH_GATEWAY_URL")?;

    let api = Arc::new(build_api().context("building WebRTC API")?);
    let rtc_config = rtc_configuration(&config.ice_servers);
    let factory = Arc::new(LiveFactory::new(api, rtc_config));

    let gateway = Arc::new(WebSocketGateway::connect(gateway_url));
    let clock = Arc::new(SystemClock);

    let conn = VoiceConnection::new(identity, config, factory, clock, gateway.clone());

    spawn_reconnect_watcher(conn.clone(), gateway.clone());
    spawn_playback_watcher(conn.clone());

    conn.join().await.context("joining voice channel")?;
    info!(channel = conn.channel_id(), "voice connection joined");

    if let Ok(clip) = std::env::var("VOXMESH_STARTUP_CLIP") {
        if let Err(err) = conn.play_file(clip, EffectConfig::default(), true).await {
            error!(error = %err, "failed to start startup clip");
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    conn.leave().await.ok();
    gateway.disconnect().await;

    Ok(())
}

/// Bridges `WebSocketGateway`'s reconnect-with-backoff status into
/// `VoiceConnection::handle_transport_reconnected` (spec.md §4.5
/// "Signalling reconnect").
fn spawn_reconnect_watcher<F, C>(conn: Arc<VoiceConnection<F, C>>, gateway: Arc<WebSocketGateway>)
where
    F: PeerConnectionFactory,
    C: FrameClock,
{
    tokio::spawn(async move {
        let mut status_rx = gateway.watch_status();
        let mut was_reconnecting = false;
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow();
            match status {
                ConnectionStatus::Reconnecting { .. } => was_reconnecting = true,
                ConnectionStatus::Connected if was_reconnecting => {
                    was_reconnecting = false;
                    conn.handle_transport_reconnected().await;
                }
                _ => {}
            }
        }
    });
}

/// Logs the `finish`/`error` playback events spec.md §7 defines. A real bot
/// framework would forward these to whatever surfaced `play_file` in the
/// first place.
fn spawn_playback_watcher<F, C>(conn: Arc<VoiceConnection<F, C>>)
where
    F: PeerConnectionFactory,
    C: FrameClock,
{
    tokio::spawn(async move {
        let mut events = conn.take_playback_events().await;
        while let Some(event) = events.recv().await {
            match event {
                PlaybackEvent::Finished { kind } => info!(?kind, "playback finished"),
                PlaybackEvent::Error { kind, message } => error!(?kind, %message, "playback error"),
            }
        }
    });
}
