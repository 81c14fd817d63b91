use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / profile / TOML / env vars)
// =============================================================================
//
//   relay.toml:      [relay]
//                    buffer_bytes = 4096
//
//   env var:         RELAY_RELAY__BUFFER_BYTES=4096   (double underscore = nesting)

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=127.0.0.1
    Local,
    /// host=0.0.0.0
    Public,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub registry: RegistryFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_true")]
    pub ws_enabled: bool,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_port: default_ws_port(),
            ws_enabled: true,
        }
    }
}

/// RPC session settings (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Seconds a new connection has to send Version. 0 disables the deadline.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_frame_kb")]
    pub max_frame_kb: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_frame_kb: default_max_frame_kb(),
        }
    }
}

/// Relay pump settings (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Scratch buffer size for each pump read.
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    /// Chunks queued towards a peer before the pump waits.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: default_buffer_bytes(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Client registry settings (lives under `[registry]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryFileConfig {
    #[serde(default = "default_true")]
    pub evict_on_disconnect: bool,
}

impl Default for RegistryFileConfig {
    fn default() -> Self {
        Self {
            evict_on_disconnect: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7331
}
fn default_ws_port() -> u16 {
    7332
}
fn default_true() -> bool {
    true
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_frame_kb() -> usize {
    1024
}
fn default_buffer_bytes() -> usize {
    1024
}
fn default_queue_depth() -> usize {
    64
}

impl FileConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.buffer_bytes == 0 {
            bail!("relay.buffer_bytes must be greater than 0");
        }
        if self.relay.queue_depth == 0 {
            bail!("relay.queue_depth must be greater than 0");
        }
        if self.session.max_frame_kb == 0 {
            bail!("session.max_frame_kb must be greater than 0");
        }
        if self.server.ws_enabled && self.server.ws_port == self.server.port && self.server.port != 0
        {
            bail!(
                "server.port and server.ws_port must differ (both {})",
                self.server.port
            );
        }
        Ok(())
    }
}

/// Build a figment that layers: defaults → profile defaults → TOML file → RELAY_* env vars.
///
/// The CLI profile takes priority over a profile named in the file or env.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_REGISTRY__EVICT_ON_DISCONNECT=false`  →  `registry.evict_on_disconnect = false`
pub fn load_config(config_file: Option<&Path>, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let with_file = |figment: Figment| match config_file {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment,
    };

    // Pass 1: peek at profile from file/env (CLI overrides)
    let base = with_file(Figment::from(Serialized::defaults(FileConfig::default())))
        .merge(Env::prefixed("RELAY_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: profile defaults between struct defaults and the file
    let profile_layer = profile_to_file_config(profile.as_ref());

    with_file(
        Figment::from(Serialized::defaults(FileConfig::default()))
            .merge(Serialized::defaults(profile_layer)),
    )
    .merge(Env::prefixed("RELAY_").split("__"))
}

/// Convert a profile into a `FileConfig` with the profile's values filled in.
fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Local) => FileConfig {
            profile: Some(Profile::Local),
            server: ServerFileConfig {
                host: "127.0.0.1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        Some(Profile::Public) => FileConfig {
            profile: Some(Profile::Public),
            server: ServerFileConfig {
                host: "0.0.0.0".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        None => FileConfig::default(),
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// `None` when the WebSocket listener is disabled.
    pub ws_port: Option<u16>,
}

/// Per-connection settings handed to every session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for the first Version call (None = disabled)
    pub handshake_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
    pub relay_buffer_bytes: usize,
    pub relay_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&SessionFileConfig::default(), &RelayFileConfig::default())
    }
}

impl SessionConfig {
    pub fn from_file(session: &SessionFileConfig, relay: &RelayFileConfig) -> Self {
        Self {
            handshake_timeout: if session.handshake_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(session.handshake_timeout_secs))
            },
            max_frame_bytes: session.max_frame_kb * 1024,
            relay_buffer_bytes: relay.buffer_bytes,
            relay_queue_depth: relay.queue_depth,
        }
    }
}

/// Broker behaviour (runtime view).
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Drop a client's registry entry when its connection closes.
    pub evict_on_disconnect: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            evict_on_disconnect: true,
        }
    }
}

/// Everything the server needs, resolved.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub listen: ListenConfig,
    pub session: SessionConfig,
    pub broker: BrokerConfig,
}

impl RuntimeConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            listen: ListenConfig {
                host: fc.server.host.clone(),
                port: fc.server.port,
                ws_port: fc.server.ws_enabled.then_some(fc.server.ws_port),
            },
            session: SessionConfig::from_file(&fc.session, &fc.relay),
            broker: BrokerConfig {
                evict_on_disconnect: fc.registry.evict_on_disconnect,
            },
        }
    }
}
