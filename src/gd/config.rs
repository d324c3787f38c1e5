use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

pub const ENV_BIND: &str = "GUARDIAN_BIND";
pub const ENV_PORT: &str = "GUARDIAN_PORT";
pub const ENV_SECRET: &str = "GUARDIAN_SECRET";
pub const ENV_SECRET_FILE: &str = "GUARDIAN_SECRET_FILE";
pub const ENV_HEARTBEAT_FILE: &str = "GUARDIAN_HEARTBEAT_FILE";
pub const ENV_HEARTBEAT_INTERVAL_SEC: &str = "GUARDIAN_HEARTBEAT_INTERVAL_SEC";
pub const ENV_HEARTBEAT_TIMEOUT_SEC: &str = "GUARDIAN_HEARTBEAT_TIMEOUT_SEC";
pub const ENV_HEARTBEAT_POLL_SEC: &str = "GUARDIAN_HEARTBEAT_POLL_SEC";
pub const ENV_RESTART_BASE_DELAY_SEC: &str = "GUARDIAN_RESTART_BASE_DELAY_SEC";
pub const ENV_RESTART_MAX_DELAY_SEC: &str = "GUARDIAN_RESTART_MAX_DELAY_SEC";
pub const ENV_RESTART_WINDOW_SEC: &str = "GUARDIAN_RESTART_WINDOW_SEC";
pub const ENV_RESTART_MAX_COUNT: &str = "GUARDIAN_RESTART_MAX_COUNT";
pub const ENV_RESTART_COOLDOWN_SEC: &str = "GUARDIAN_RESTART_COOLDOWN_SEC";
pub const ENV_LOG_TAIL_LIMIT: &str = "GUARDIAN_LOG_TAIL_LIMIT";
pub const ENV_SIGNATURE_MAX_SKEW_SEC: &str = "GUARDIAN_SIGNATURE_MAX_SKEW_SEC";
pub const ENV_NONCE_TTL_SEC: &str = "GUARDIAN_NONCE_TTL_SEC";

/// Variables handed to the worker so it knows where and how often to write its heartbeat.
pub const WORKER_ENV_HEARTBEAT_FILE: &str = "GUARDIAN_WORKER_HEARTBEAT_FILE";
pub const WORKER_ENV_HEARTBEAT_INTERVAL_MS: &str = "GUARDIAN_WORKER_HEARTBEAT_INTERVAL_MS";

/// Prefix shared by every supervisor-only variable. These are stripped from the worker environment.
pub const SUPERVISOR_ENV_PREFIX: &str = "GUARDIAN_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Env,
    File,
    Generated,
    GeneratedEphemeral,
}

impl SecretSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSource::Env => "env",
            SecretSource::File => "file",
            SecretSource::Generated => "generated",
            SecretSource::GeneratedEphemeral => "generated-ephemeral",
        }
    }
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct GuardianConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Explicit secret from the environment, if any (input to provisioning).
    pub explicit_secret: Option<String>,
    pub secret_file: PathBuf,
    pub heartbeat_file: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub heartbeat_poll_ms: u64,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    pub restart_window_ms: u64,
    pub restart_max_count: usize,
    pub restart_cooldown_ms: u64,
    pub log_tail_limit: usize,
    pub signature_max_skew_ms: u64,
    pub nonce_ttl_ms: u64,
}

impl std::fmt::Debug for GuardianConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("explicit_secret", &self.explicit_secret.as_ref().map(|_| "<redacted>"))
            .field("secret_file", &self.secret_file)
            .field("heartbeat_file", &self.heartbeat_file)
            .field("heartbeat_timeout_ms", &self.heartbeat_timeout_ms)
            .field("heartbeat_poll_ms", &self.heartbeat_poll_ms)
            .field("restart_base_delay_ms", &self.restart_base_delay_ms)
            .field("restart_max_delay_ms", &self.restart_max_delay_ms)
            .field("restart_max_count", &self.restart_max_count)
            .finish_non_exhaustive()
    }
}

impl GuardianConfig {
    /// Defaults for every field, with state paths rooted at `home` (or the working directory).
    pub fn defaults(home: Option<&str>) -> Self {
        let state_dir = match home.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => PathBuf::from(h).join(".guardian"),
            None => PathBuf::from(".guardian"),
        };
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 8787,
            explicit_secret: None,
            secret_file: state_dir.join("control-secret"),
            heartbeat_file: state_dir.join("heartbeat.json"),
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 90_000,
            heartbeat_poll_ms: 5_000,
            restart_base_delay_ms: 2_000,
            restart_max_delay_ms: 60_000,
            restart_window_ms: 300_000,
            restart_max_count: 8,
            restart_cooldown_ms: 300_000,
            log_tail_limit: 500,
            signature_max_skew_ms: 300_000,
            nonce_ttl_ms: 600_000,
        }
    }

    pub fn bind_is_loopback(&self) -> bool {
        self.bind.is_loopback()
    }

    pub fn listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind, self.port)
    }
}

/// Parse an optional integer variable with inclusive bounds.
///
/// Absent or blank values return `None`; anything present must parse and fit `[min, max]`.
fn bounded(env: &HashMap<String, String>, name: &str, min: u64, max: u64) -> anyhow::Result<Option<u64>> {
    let Some(raw) = env.get(name) else {
        return Ok(None);
    };
    let t = raw.trim();
    if t.is_empty() {
        return Ok(None);
    }
    let v: u64 = t
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} must be an integer (got {raw:?})"))?;
    anyhow::ensure!(
        (min..=max).contains(&v),
        "{name} must be between {min} and {max} (got {v})"
    );
    Ok(Some(v))
}

fn secs_to_ms(env: &HashMap<String, String>, name: &str, min: u64, max: u64, slot: &mut u64) -> anyhow::Result<()> {
    if let Some(v) = bounded(env, name, min, max)? {
        *slot = v * 1000;
    }
    Ok(())
}

fn non_empty(env: &HashMap<String, String>, name: &str) -> Option<String> {
    env.get(name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve a `GuardianConfig` from a snapshot of the process environment.
///
/// Pure: reads only the given map. Any malformed or out-of-range value fails the whole resolution.
pub fn resolve(env: &HashMap<String, String>) -> anyhow::Result<GuardianConfig> {
    let mut cfg = GuardianConfig::defaults(env.get("HOME").map(String::as_str));

    if let Some(b) = non_empty(env, ENV_BIND) {
        let b = if b.eq_ignore_ascii_case("localhost") { "127.0.0.1".to_string() } else { b };
        cfg.bind = b
            .parse()
            .map_err(|e| anyhow::anyhow!("{ENV_BIND} must be an IP address (got {b:?}): {e}"))?;
    }
    if let Some(p) = bounded(env, ENV_PORT, 1, 65_535)? {
        cfg.port = p as u16;
    }
    cfg.explicit_secret = env
        .get(ENV_SECRET)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(p) = non_empty(env, ENV_SECRET_FILE) {
        cfg.secret_file = PathBuf::from(p);
    }
    if let Some(p) = non_empty(env, ENV_HEARTBEAT_FILE) {
        cfg.heartbeat_file = PathBuf::from(p);
    }

    secs_to_ms(env, ENV_HEARTBEAT_INTERVAL_SEC, 1, 300, &mut cfg.heartbeat_interval_ms)?;
    secs_to_ms(env, ENV_HEARTBEAT_TIMEOUT_SEC, 5, 3600, &mut cfg.heartbeat_timeout_ms)?;
    secs_to_ms(env, ENV_HEARTBEAT_POLL_SEC, 1, 300, &mut cfg.heartbeat_poll_ms)?;
    secs_to_ms(env, ENV_RESTART_BASE_DELAY_SEC, 1, 300, &mut cfg.restart_base_delay_ms)?;
    secs_to_ms(env, ENV_RESTART_MAX_DELAY_SEC, 1, 3600, &mut cfg.restart_max_delay_ms)?;
    secs_to_ms(env, ENV_RESTART_WINDOW_SEC, 10, 86_400, &mut cfg.restart_window_ms)?;
    if let Some(n) = bounded(env, ENV_RESTART_MAX_COUNT, 1, 1000)? {
        cfg.restart_max_count = n as usize;
    }
    secs_to_ms(env, ENV_RESTART_COOLDOWN_SEC, 1, 86_400, &mut cfg.restart_cooldown_ms)?;
    if let Some(n) = bounded(env, ENV_LOG_TAIL_LIMIT, 10, 20_000)? {
        cfg.log_tail_limit = n as usize;
    }
    secs_to_ms(env, ENV_SIGNATURE_MAX_SKEW_SEC, 1, 3600, &mut cfg.signature_max_skew_ms)?;
    secs_to_ms(env, ENV_NONCE_TTL_SEC, 1, 86_400, &mut cfg.nonce_ttl_ms)?;

    anyhow::ensure!(
        cfg.restart_max_delay_ms >= cfg.restart_base_delay_ms,
        "{ENV_RESTART_MAX_DELAY_SEC} ({}s) must not be smaller than {ENV_RESTART_BASE_DELAY_SEC} ({}s)",
        cfg.restart_max_delay_ms / 1000,
        cfg.restart_base_delay_ms / 1000
    );

    Ok(cfg)
}

/// Snapshot the current process environment (non-UTF-8 entries are skipped).
pub fn process_env() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn absent_values_use_defaults() {
        let cfg = resolve(&env(&[("HOME", "/home/op")])).unwrap();
        assert_eq!(cfg.port, 8787);
        assert!(cfg.bind_is_loopback());
        assert_eq!(cfg.heartbeat_timeout_ms, 90_000);
        assert_eq!(cfg.restart_max_count, 8);
        assert_eq!(cfg.secret_file, PathBuf::from("/home/op/.guardian/control-secret"));
        assert!(cfg.explicit_secret.is_none());
    }

    #[test]
    fn seconds_are_stored_as_millis() {
        let cfg = resolve(&env(&[
            (ENV_HEARTBEAT_TIMEOUT_SEC, "30"),
            (ENV_RESTART_COOLDOWN_SEC, "45"),
            (ENV_NONCE_TTL_SEC, " 7 "),
        ]))
        .unwrap();
        assert_eq!(cfg.heartbeat_timeout_ms, 30_000);
        assert_eq!(cfg.restart_cooldown_ms, 45_000);
        assert_eq!(cfg.nonce_ttl_ms, 7_000);
    }

    #[test]
    fn out_of_range_names_the_variable() {
        let err = resolve(&env(&[(ENV_PORT, "0")])).unwrap_err().to_string();
        assert!(err.contains(ENV_PORT), "{err}");
        let err = resolve(&env(&[(ENV_HEARTBEAT_TIMEOUT_SEC, "4")])).unwrap_err().to_string();
        assert!(err.contains(ENV_HEARTBEAT_TIMEOUT_SEC), "{err}");
        let err = resolve(&env(&[(ENV_RESTART_MAX_COUNT, "1001")])).unwrap_err().to_string();
        assert!(err.contains("between 1 and 1000"), "{err}");
    }

    #[test]
    fn malformed_values_are_fatal_not_defaulted() {
        let err = resolve(&env(&[(ENV_LOG_TAIL_LIMIT, "lots")])).unwrap_err().to_string();
        assert!(err.contains(ENV_LOG_TAIL_LIMIT), "{err}");
        assert!(resolve(&env(&[(ENV_BIND, "not-an-ip")])).is_err());
    }

    #[test]
    fn max_delay_below_base_is_rejected() {
        let r = resolve(&env(&[
            (ENV_RESTART_BASE_DELAY_SEC, "30"),
            (ENV_RESTART_MAX_DELAY_SEC, "10"),
        ]));
        assert!(r.is_err());
    }

    #[test]
    fn blank_secret_counts_as_absent() {
        let cfg = resolve(&env(&[(ENV_SECRET, "   ")])).unwrap();
        assert!(cfg.explicit_secret.is_none());
        let cfg = resolve(&env(&[(ENV_BIND, "0.0.0.0"), (ENV_SECRET, "s3cret")])).unwrap();
        assert_eq!(cfg.explicit_secret.as_deref(), Some("s3cret"));
        assert!(!cfg.bind_is_loopback());
    }
}
