use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(nested = true)]
    pub graph: GraphConfig,

    #[envconfig(default = "300")]
    pub dedup_ttl_secs: u64,

    #[envconfig(default = "10000")]
    pub dedup_max_entries: usize,

    #[envconfig(default = "30")]
    pub rate_limit_per_window: usize,

    #[envconfig(default = "60")]
    pub rate_limit_window_secs: u64,

    // Comma separated
    #[envconfig(default = "http://localhost:3000")]
    pub allowed_origins: String,

    #[envconfig(default = "Lead")]
    pub default_event_name: String,

    #[envconfig(default = "website")]
    pub default_action_source: String,

    #[envconfig(default = "1048576")]
    pub max_body_bytes: usize,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "capi-relay")]
    pub otel_service_name: String,

    // Level of the spans exported to OpenTelemetry
    #[envconfig(default = "info")]
    pub log_level: tracing::Level,
}

impl Config {
    pub fn allowed_origins(&self) -> Vec<String> {
        self.allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Envconfig, Clone)]
pub struct GraphConfig {
    // Required unless PRINT_SINK is set
    pub pixel_id: Option<String>,
    pub access_token: Option<String>,

    #[envconfig(default = "https://graph.facebook.com")]
    pub graph_api_url: String,

    #[envconfig(default = "v19.0")]
    pub graph_api_version: String,

    #[envconfig(default = "10000")]
    pub request_timeout_ms: EnvMsDuration,

    // Bodies larger than this are sent gzipped
    #[envconfig(default = "2048")]
    pub compression_threshold_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
