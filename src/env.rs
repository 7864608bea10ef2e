use envconfig::Envconfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            _ => Err(format!("invalid mode: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    Strict,
    Tofu,
    Insecure,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(HostKeyPolicy::Strict),
            "tofu" => Ok(HostKeyPolicy::Tofu),
            "insecure" => Ok(HostKeyPolicy::Insecure),
            _ => Err(format!("invalid host key policy: {}", s)),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Env {
    #[cfg_attr(
        debug_assertions,
        envconfig(from = "APP_MODE", default = "development")
    )]
    #[cfg_attr(
        not(debug_assertions),
        envconfig(from = "APP_MODE", default = "production")
    )]
    #[allow(dead_code)]
    pub mode: Mode,

    #[envconfig(from = "LISTEN_ADDR", default = "0.0.0.0:8081")]
    pub listen_addr: String,

    #[envconfig(from = "DEPLOYMENT_SECRET", default = "")]
    pub deployment_secret: String,

    #[envconfig(from = "MAX_UPLOAD_BYTES", default = "104857600")]
    pub max_upload_bytes: u64,

    #[envconfig(from = "MAX_FOLDER_BYTES", default = "524288000")]
    pub max_folder_bytes: u64,

    #[envconfig(from = "MAX_SESSIONS", default = "1024")]
    pub max_sessions: usize,

    #[envconfig(from = "PING_INTERVAL_MS", default = "25000")]
    pub ping_interval_ms: u64,

    #[envconfig(from = "PING_TIMEOUT_MS", default = "60000")]
    pub ping_timeout_ms: u64,

    #[envconfig(from = "SESSION_IDLE_TIMEOUT_MS", default = "1800000")]
    pub session_idle_timeout_ms: u64,

    #[envconfig(from = "HOST_KEY_POLICY", default = "tofu")]
    pub host_key_policy: HostKeyPolicy,

    #[envconfig(from = "KNOWN_HOSTS_PATH", default = "")]
    pub known_hosts_path: String,

    #[envconfig(from = "MAX_CONCURRENT_OPS", default = "4")]
    pub max_concurrent_ops: usize,

    #[envconfig(from = "UPLOAD_WINDOW", default = "4")]
    pub upload_window: u32,

    #[envconfig(from = "UPLOAD_CHUNK_SIZE", default = "262144")]
    pub upload_chunk_size: u32,

    #[envconfig(from = "OUTBOUND_QUEUE_BYTES", default = "8388608")]
    pub outbound_queue_bytes: usize,

    #[envconfig(from = "TERMINAL_HIGH_WATER", default = "1048576")]
    pub terminal_high_water: usize,

    #[envconfig(from = "TERMINAL_LOW_WATER", default = "262144")]
    pub terminal_low_water: usize,

    #[envconfig(from = "MAX_FRAME_PAYLOAD_BYTES", default = "4194304")]
    pub max_frame_payload_bytes: u32,

    #[envconfig(from = "TELEMETRY_INTERVAL_MS", default = "1000")]
    pub telemetry_interval_ms: u64,

    #[envconfig(from = "DATABASE_URL", default = "")]
    pub database_url: String,
}

pub fn init() -> anyhow::Result<Env> {
    let config = Env::init_from_env()?;
    Ok(config)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
