//! Configuration: ICE server assembly, tier table, playback effect config.
//!
//! Follows the teacher's `Config::from_env()` idiom (`server/src/config.rs`):
//! `std::env::var(...).ok()` chains with `anyhow::Context` on anything the
//! caller truly cannot proceed without, and plain defaults for everything
//! else.

use anyhow::Context;

/// A single STUN/TURN server entry, as sent in the WebRTC `iceServers` list.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// The full set of ICE servers for a `VoiceConnection`: built once, unchanged
/// after construction (spec.md §3).
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub servers: Vec<IceServer>,
}

const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

impl IceServerConfig {
    /// Builds the fixed set of public STUN servers plus an optional
    /// TURN/TURNS entry derived from `TURN_URL`/`TURN_USER`/`TURN_PASS`
    /// (spec.md §6, §9). TURNS is auto-derived when `TURN_URL` uses the
    /// `turn:` scheme, mirroring the teacher's `sfu.rs::rtc_config()`.
    pub fn from_env() -> Self {
        let mut servers: Vec<IceServer> = vec![IceServer {
            urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            username: None,
            credential: None,
        }];

        if let Ok(turn_url) = std::env::var("TURN_URL") {
            let username = std::env::var("TURN_USER").ok();
            let credential = std::env::var("TURN_PASS").ok();

            let mut urls = vec![turn_url.clone()];
            if let Some(upgraded) = turn_url.strip_prefix("turn:") {
                urls.push(format!("turns:{upgraded}"));
            }

            servers.push(IceServer {
                urls,
                username,
                credential,
            });
        }

        Self { servers }
    }

    /// Appends additional caller-supplied entries to the built-in list
    /// (spec.md §9: `iceServers` recognised option).
    pub fn with_extra(mut self, extra: Vec<IceServer>) -> Self {
        self.servers.extend(extra);
        self
    }

    pub fn has_turn(&self) -> bool {
        self.servers.len() > 1
    }
}

/// One row of the tiered-scaling table (spec.md §3, §4.5).
#[derive(Debug, Clone, Copy)]
pub struct TierRow {
    pub name: &'static str,
    pub max_peers: usize,
    pub concurrent: usize,
    pub cooldown_ms: u64,
    pub stagger_base_ms: u64,
    pub stagger_per_peer_ms: u64,
}

/// The four immutable tier rows from spec.md §4.5.
pub const TIERS: [TierRow; 4] = [
    TierRow {
        name: "small",
        max_peers: 10,
        concurrent: 2,
        cooldown_ms: 1000,
        stagger_base_ms: 300,
        stagger_per_peer_ms: 200,
    },
    TierRow {
        name: "medium",
        max_peers: 25,
        concurrent: 2,
        cooldown_ms: 1500,
        stagger_base_ms: 800,
        stagger_per_peer_ms: 400,
    },
    TierRow {
        name: "large",
        max_peers: 50,
        concurrent: 1,
        cooldown_ms: 2000,
        stagger_base_ms: 1500,
        stagger_per_peer_ms: 600,
    },
    TierRow {
        name: "massive",
        max_peers: 100,
        concurrent: 1,
        cooldown_ms: 3000,
        stagger_base_ms: 2500,
        stagger_per_peer_ms: 800,
    },
];

/// Selects the tier for `peers.size + queue.len` (spec.md §4.5). The
/// `massive` row is returned when no smaller row's threshold covers the
/// count, matching "|peers| + |queue|... compared against each row's
/// `max_peers` threshold".
pub fn select_tier(peer_and_queue_count: usize) -> TierRow {
    TIERS
        .iter()
        .copied()
        .find(|t| peer_and_queue_count <= t.max_peers)
        .unwrap_or(TIERS[TIERS.len() - 1])
}

/// Identity that is immutable for the lifetime of a `VoiceConnection`
/// (spec.md §3 `VoiceChannelIdentity`).
#[derive(Debug, Clone)]
pub struct VoiceChannelIdentity {
    pub local_peer_id: String,
    pub server_id: String,
    pub channel_id: String,
}

/// Structured audio effect configuration (spec.md §4.2.3, §9).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EffectConfig {
    /// Pitch shift in semitones; maps to an `atempo` filter stage.
    #[serde(default)]
    pub pitch: Option<f32>,
    /// Reverb strength in `[0, 1]`.
    #[serde(default)]
    pub reverb: Option<f32>,
    /// Distortion amount in `[0, 1]`, mapped to a compressor proxy filter.
    #[serde(default)]
    pub distortion: Option<f32>,
    #[serde(default)]
    pub echo: bool,
    #[serde(default)]
    pub tremolo: bool,
    #[serde(default)]
    pub robot: bool,
    #[serde(default)]
    pub alien: bool,
}

impl EffectConfig {
    /// Named presets from spec.md §9 (`none`, `robot`, `alien`, `echo`,
    /// `reverb`, `pitchup`, `pitchdown`).
    pub fn from_preset(name: &str) -> Self {
        match name {
            "robot" => Self {
                robot: true,
                ..Default::default()
            },
            "alien" => Self {
                alien: true,
                ..Default::default()
            },
            "echo" => Self {
                echo: true,
                ..Default::default()
            },
            "reverb" => Self {
                reverb: Some(0.5),
                ..Default::default()
            },
            "pitchup" => Self {
                pitch: Some(4.0),
                ..Default::default()
            },
            "pitchdown" => Self {
                pitch: Some(-4.0),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

/// Top-level configuration for a `VoiceConnection` (spec.md §9
/// "Configuration").
#[derive(Debug, Clone)]
pub struct VoiceConnectionConfig {
    pub ice_servers: IceServerConfig,
    pub debug: bool,
    pub max_connected_peers: usize,
    pub heartbeat_interval_ms: u64,
    pub video_width: u32,
    pub video_height: u32,
}

impl VoiceConnectionConfig {
    /// Loads from the environment, following the teacher's
    /// `Config::from_env()` idiom. `dotenvy::dotenv()` is the caller's
    /// responsibility (the demo binary), not this library's.
    pub fn from_env() -> anyhow::Result<Self> {
        let debug = std::env::var("VOXMESH_DEBUG")
            .ok()
            .map(|v| v == "1")
            .unwrap_or(false);

        let max_connected_peers = std::env::var("VOXMESH_MAX_PEERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let video_width = std::env::var("VOXMESH_VIDEO_WIDTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(640);
        let video_height = std::env::var("VOXMESH_VIDEO_HEIGHT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(360);

        Ok(Self {
            ice_servers: IceServerConfig::from_env(),
            debug,
            max_connected_peers,
            heartbeat_interval_ms: 5_000,
            video_width,
            video_height,
        })
    }

    /// Used by tests that need a config without touching the environment.
    pub fn default_for_test() -> Self {
        Self {
            ice_servers: IceServerConfig {
                servers: vec![IceServer {
                    urls: vec!["stun:stun.l.google.com:19302".to_string()],
                    username: None,
                    credential: None,
                }],
            },
            debug: true,
            max_connected_peers: 100,
            heartbeat_interval_ms: 5_000,
            video_width: 640,
            video_height: 360,
        }
    }
}

/// Ensures `anyhow::Context` is actually exercised the way the teacher uses
/// it, for configuration values that genuinely have no safe default.
pub fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn tier_selection_matches_spec_table() {
        assert_eq!(select_tier(0).name, "small");
        assert_eq!(select_tier(10).name, "small");
        assert_eq!(select_tier(11).name, "medium");
        assert_eq!(select_tier(50).name, "large");
        assert_eq!(select_tier(51).name, "massive");
        assert_eq!(select_tier(100).name, "massive");
        assert_eq!(select_tier(1000).name, "massive");
    }

    #[test]
    #[serial]
    fn ice_server_config_always_has_stun() {
        std::env::remove_var("TURN_URL");
        let cfg = IceServerConfig::from_env();
        assert!(!cfg.has_turn());
        assert_eq!(cfg.servers.len(), 1);
    }

    #[test]
    #[serial]
    fn turn_url_derives_turns_variant() {
        std::env::set_var("TURN_URL", "turn:example.com:3478");
        std::env::set_var("TURN_USER", "u");
        std::env::set_var("TURN_PASS", "p");
        let cfg = IceServerConfig::from_env();
        assert!(cfg.has_turn());
        let turn_entry = &cfg.servers[1];
        assert!(turn_entry.urls.iter().any(|u| u.starts_with("turns:")));
        std::env::remove_var("TURN_URL");
        std::env::remove_var("TURN_USER");
        std::env::remove_var("TURN_PASS");
    }
}
