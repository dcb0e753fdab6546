//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use weft_cluster::routing::RoutingStrategy;
use weft_cluster::worker::RegisterWhen;

/// Runtime configuration for weft-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set (given a reachable generation
/// runtime command).
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8080"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins. When `None`
    /// (default), all origins are allowed (`*`).
    pub cors_allowed_origins: Option<String>,

    /// Run a worker (and spawn the generation runtime) inside this
    /// process. Disable when workers join over an external bus.
    pub embed_worker: bool,

    /// Generation runtime launch command and arguments.
    pub runtime_command: String,
    pub runtime_args: Vec<String>,

    /// Models the embedded worker advertises.
    pub models: Vec<String>,

    /// Models loaded eagerly at startup.
    pub prewarm: Vec<String>,

    /// `ready` delays registration until pre-warm finishes (failures are
    /// fatal); `warming` registers immediately and loads in the background.
    pub register_when: RegisterWhen,

    pub heartbeat_interval: Duration,
    pub worker_queue_capacity: usize,
    pub worker_max_concurrent: usize,

    /// Routing strategy: `round_robin`, `least_loaded`, `latency_aware`,
    /// or `consistent_hash`.
    pub strategy: RoutingStrategy,

    /// Per-attempt deadline for buffered requests.
    pub request_timeout: Duration,
    /// Per-attempt deadline for streaming requests.
    pub streaming_timeout: Duration,

    pub retry_enabled: bool,
    pub max_retries: u32,

    /// Optional TTFT SLO threshold in milliseconds; set to enable the QoS
    /// monitor's default objective.
    pub slo_ttft_ms: Option<f64>,
    /// Optional p95 latency SLO threshold in milliseconds.
    pub slo_latency_ms: Option<f64>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("WEFT_BIND", "0.0.0.0:8080"),
            log_level: env_or("WEFT_LOG", "info"),
            log_json: env_flag("WEFT_LOG_JSON", false),
            cors_allowed_origins: std::env::var("WEFT_CORS_ORIGINS").ok(),
            embed_worker: env_flag("WEFT_EMBED_WORKER", true),
            runtime_command: env_or("WEFT_RUNTIME_CMD", "weft-runtime"),
            runtime_args: env_list("WEFT_RUNTIME_ARGS"),
            models: env_list("WEFT_MODELS"),
            prewarm: env_list("WEFT_PREWARM"),
            register_when: match env_or("WEFT_REGISTER_WHEN", "warming").as_str() {
                "ready" => RegisterWhen::Ready,
                _ => RegisterWhen::Warming,
            },
            heartbeat_interval: Duration::from_millis(parse_env("WEFT_HEARTBEAT_MS", 5_000)),
            worker_queue_capacity: parse_env("WEFT_QUEUE_CAPACITY", 64),
            worker_max_concurrent: parse_env("WEFT_MAX_CONCURRENT", 8),
            strategy: match env_or("WEFT_ROUTING", "least_loaded").as_str() {
                "round_robin" => RoutingStrategy::RoundRobin,
                "latency_aware" => RoutingStrategy::LatencyAware {
                    k: parse_env("WEFT_LATENCY_K", 50.0),
                },
                "consistent_hash" => RoutingStrategy::ConsistentHash,
                _ => RoutingStrategy::LeastLoaded,
            },
            request_timeout: Duration::from_millis(parse_env("WEFT_REQUEST_TIMEOUT_MS", 30_000)),
            streaming_timeout: Duration::from_millis(parse_env(
                "WEFT_STREAMING_TIMEOUT_MS",
                300_000,
            )),
            retry_enabled: env_flag("WEFT_RETRY", true),
            max_retries: parse_env("WEFT_MAX_RETRIES", 2),
            slo_ttft_ms: std::env::var("WEFT_SLO_TTFT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            slo_latency_ms: std::env::var("WEFT_SLO_LATENCY_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
