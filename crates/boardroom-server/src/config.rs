use std::time::Duration;

use serde::Deserialize;

/// Top-level server configuration, loaded from `boardroom.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth: AuthFileConfig,
    pub limits: LimitsConfig,
    pub hub: HubConfig,
    pub sessions: SessionsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            auth: AuthFileConfig::default(),
            limits: LimitsConfig::default(),
            hub: HubConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

/// Auth section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    /// Bearer token for the REST API. None = auth disabled.
    pub bearer_token: Option<String>,
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    pub max_sse_subscribers: usize,
    pub ws_rate_limit_per_sec: f64,
    pub max_message_size: usize,
    pub event_queue_capacity: usize,
    pub event_broadcast_capacity: usize,
    /// Capacity of the hub's register/unregister channels.
    pub hub_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 500,
            max_sse_subscribers: 100,
            ws_rate_limit_per_sec: 30.0,
            max_message_size: 16 * 1024,
            event_queue_capacity: 1000,
            event_broadcast_capacity: 1024,
            hub_channel_capacity: 256,
        }
    }
}

/// Connection hub and outbound pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub high_queue_capacity: usize,
    pub normal_queue_capacity: usize,
    pub low_queue_capacity: usize,
    /// Normal-tier frames written per drain pass before high is rechecked.
    pub normal_batch: usize,
    pub low_batch: usize,
    pub min_send_interval_ms: u64,
    pub ping_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub liveness_check_interval_secs: u64,
    pub refresh_interval_secs: u64,
    /// Relay unrecognized inbound message types to the rest of the game.
    pub relay_unknown_messages: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            high_queue_capacity: 64,
            normal_queue_capacity: 128,
            low_queue_capacity: 256,
            normal_batch: 8,
            low_batch: 4,
            min_send_interval_ms: 2,
            ping_interval_secs: 30,
            inactivity_timeout_secs: 90,
            liveness_check_interval_secs: 15,
            refresh_interval_secs: 30,
            relay_unknown_messages: true,
        }
    }
}

impl HubConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }
}

/// Game session lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub min_players: usize,
    pub max_players: u8,
    pub starting_balance: i64,
    /// Sessions with no activity for this long are removed.
    pub idle_timeout_secs: u64,
    /// LOBBY with at most one player older than this is removed.
    pub empty_lobby_secs: u64,
    /// LOBBY never started within this window is removed.
    pub unstarted_lobby_secs: u64,
    /// Grace before a LOBBY host without a live socket counts as lost.
    pub host_connect_grace_secs: u64,
    pub cleanup_interval_secs: u64,
    pub disconnect_grace_secs: u64,
    pub abandoned_cleanup_delay_secs: u64,
    pub completed_cleanup_delay_secs: u64,
    pub store_probe_timeout_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 8,
            starting_balance: 1500,
            idle_timeout_secs: 24 * 60 * 60,
            empty_lobby_secs: 15 * 60,
            unstarted_lobby_secs: 30 * 60,
            host_connect_grace_secs: 120,
            cleanup_interval_secs: 60,
            disconnect_grace_secs: 60,
            abandoned_cleanup_delay_secs: 30,
            completed_cleanup_delay_secs: 300,
            store_probe_timeout_ms: 500,
        }
    }
}

impl SessionsConfig {
    /// Clamp a requested seat count into the supported range. An inverted
    /// range collapses to `max_players`.
    pub fn clamp_max_players(&self, requested: u8) -> u8 {
        let lo = u8::try_from(self.min_players)
            .unwrap_or(u8::MAX)
            .min(self.max_players);
        requested.clamp(lo, self.max_players)
    }
}

impl ServerConfig {
    /// Validate configuration, exiting the process on invalid values.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(
                addr = %self.listen_addr,
                "listen_addr is not a valid socket address"
            );
            std::process::exit(1);
        }

        if self.auth.bearer_token.is_some() {
            tracing::warn!(
                "bearer_token is set in config file, use BOARDROOM_API_TOKEN env var in production"
            );
        }

        if let Err(field) = self.check_values() {
            tracing::error!(field, "invalid configuration value");
            std::process::exit(1);
        }
    }

    /// The first field holding an invalid value, if any.
    pub fn check_values(&self) -> Result<(), &'static str> {
        let l = &self.limits;
        let h = &self.hub;
        let s = &self.sessions;
        let checks: [(bool, &'static str); 23] = [
            (l.max_ws_connections == 0, "limits.max_ws_connections"),
            (l.max_sse_subscribers == 0, "limits.max_sse_subscribers"),
            (l.ws_rate_limit_per_sec <= 0.0, "limits.ws_rate_limit_per_sec"),
            (l.max_message_size == 0, "limits.max_message_size"),
            (l.event_queue_capacity == 0, "limits.event_queue_capacity"),
            (l.event_broadcast_capacity == 0, "limits.event_broadcast_capacity"),
            (l.hub_channel_capacity == 0, "limits.hub_channel_capacity"),
            (h.high_queue_capacity == 0, "hub.high_queue_capacity"),
            (h.normal_queue_capacity == 0, "hub.normal_queue_capacity"),
            (h.low_queue_capacity == 0, "hub.low_queue_capacity"),
            (h.normal_batch == 0, "hub.normal_batch"),
            (h.low_batch == 0, "hub.low_batch"),
            (h.ping_interval_secs == 0, "hub.ping_interval_secs"),
            (h.inactivity_timeout_secs == 0, "hub.inactivity_timeout_secs"),
            (h.liveness_check_interval_secs == 0, "hub.liveness_check_interval_secs"),
            (h.refresh_interval_secs == 0, "hub.refresh_interval_secs"),
            (s.min_players < 2, "sessions.min_players (at least 2)"),
            (
                (s.max_players as usize) < s.min_players,
                "sessions.max_players (at least min_players)",
            ),
            (s.starting_balance <= 0, "sessions.starting_balance"),
            (s.idle_timeout_secs == 0, "sessions.idle_timeout_secs"),
            (s.cleanup_interval_secs == 0, "sessions.cleanup_interval_secs"),
            (s.disconnect_grace_secs == 0, "sessions.disconnect_grace_secs"),
            (s.store_probe_timeout_ms == 0, "sessions.store_probe_timeout_ms"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, field)) => Err(*field),
            None => Ok(()),
        }
    }

    /// Load config from `boardroom.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("boardroom.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from boardroom.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse boardroom.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No boardroom.toml found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `BOARDROOM_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("BOARDROOM_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Some(token) = lookup("BOARDROOM_API_TOKEN")
            && !token.is_empty()
        {
            self.auth.bearer_token = Some(token);
        }
        if let Some(val) = lookup("BOARDROOM_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_ws_connections = n;
        }
        if let Some(val) = lookup("BOARDROOM_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            self.limits.ws_rate_limit_per_sec = n;
        }
        if let Some(val) = lookup("BOARDROOM_INACTIVITY_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.hub.inactivity_timeout_secs = n;
        }
        if let Some(val) = lookup("BOARDROOM_DISCONNECT_GRACE_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.sessions.disconnect_grace_secs = n;
        }
        if let Some(val) = lookup("BOARDROOM_RELAY_UNKNOWN")
            && let Ok(b) = val.parse::<bool>()
        {
            self.hub.relay_unknown_messages = b;
        }
    }
}
