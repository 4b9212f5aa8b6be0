use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration, sourced from the environment.
///
/// The deployment model supplies everything through environment variables
/// (an `.env` file in development): the workspace image tag, the shared
/// volume, the user directory file, and the cookie secret are required;
/// the rest have defaults suitable for a single-host deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the gateway listener (default: 0.0.0.0)
    pub bind: String,

    /// Gateway listen port (default: 8080)
    pub port: u16,

    /// Workspace image tag; containers run `world:<tag>`
    pub image_tag: String,

    /// Shared volume bound into every workspace at /world
    pub volume: String,

    /// Path to the user directory JSON file
    pub directory_path: PathBuf,

    /// Secret used to sign session cookies
    pub cookie_secret: String,

    /// Seconds of inactivity before a workspace is torn down (default: 600)
    pub idle_timeout_secs: u64,

    /// Interval between monitor sweeps in seconds (default: 10)
    pub sweep_interval_secs: u64,

    /// Host port range workspaces are allocated from (default: 1000-65535)
    pub port_range: (u16, u16),

    /// Wall-clock deadline for the readiness poll in seconds (default: 60)
    pub ready_timeout_secs: u64,

    /// Backoff between readiness attempts in milliseconds (default: 250)
    pub ready_interval_ms: u64,

    /// Grace period given to a container between stop and force-removal
    /// (default: 10)
    pub stop_grace_secs: u64,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            bind: var("WORLDHUB_BIND").unwrap_or_else(default_bind),
            port: parse_var(&var, "WORLDHUB_PORT")?.unwrap_or(DEFAULT_PORT),
            image_tag: require(&var, "IMAGE")?,
            volume: require(&var, "VOLUME")?,
            directory_path: PathBuf::from(require(&var, "DIRECTORY")?),
            cookie_secret: require(&var, "COOKIE_SECRET")?,
            idle_timeout_secs: parse_var(&var, "TIMEOUT")?.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval_secs: parse_var(&var, "WORLDHUB_SWEEP_SECS")?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            port_range: match var("WORLDHUB_PORT_RANGE") {
                Some(raw) => parse_port_range(&raw)?,
                None => DEFAULT_PORT_RANGE,
            },
            ready_timeout_secs: parse_var(&var, "WORLDHUB_READY_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
            ready_interval_ms: parse_var(&var, "WORLDHUB_READY_INTERVAL_MS")?
                .unwrap_or(DEFAULT_READY_INTERVAL_MS),
            stop_grace_secs: parse_var(&var, "WORLDHUB_STOP_GRACE_SECS")?
                .unwrap_or(DEFAULT_STOP_GRACE_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.cookie_secret.len() < 16 {
            anyhow::bail!("COOKIE_SECRET must be at least 16 bytes");
        }
        let (low, high) = self.port_range;
        if low >= high {
            anyhow::bail!(
                "WORLDHUB_PORT_RANGE is empty: {}-{} (expected low < high)",
                low,
                high
            );
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("TIMEOUT must be greater than zero");
        }
        Ok(())
    }

    /// Full image reference for workspace containers.
    pub fn image(&self) -> String {
        format!("world:{}", self.image_tag)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_PORT_RANGE: (u16, u16) = (1000, 65535);
const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READY_INTERVAL_MS: u64 = 250;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn require<F>(var: &F, key: &str) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => anyhow::bail!("Missing required environment variable: {}", key),
    }
}

fn parse_var<F, T>(var: &F, key: &str) -> anyhow::Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        None => Ok(None),
    }
}

/// Parse a "low-high" port range specification.
fn parse_port_range(raw: &str) -> anyhow::Result<(u16, u16)> {
    let (low, high) = raw
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Invalid WORLDHUB_PORT_RANGE: '{}' (expected low-high)", raw))?;

    let low: u16 = low
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid port range lower bound: '{}'", low))?;
    let high: u16 = high
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid port range upper bound: '{}'", high))?;

    Ok((low, high))
}
