use crate::gd::config::{GuardianConfig, SecretSource};
use crate::gd::logbuf::LogRing;
use rand::RngCore;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Minimum secret length accepted when the control plane listens beyond loopback.
pub const MIN_REMOTE_SECRET_LEN: usize = 16;

const GENERATED_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub secret: String,
    pub source: SecretSource,
}

/// Explicit value, else the secret file. Never generates.
pub fn read_existing(cfg: &GuardianConfig) -> anyhow::Result<Option<ResolvedSecret>> {
    if let Some(s) = cfg.explicit_secret.as_deref() {
        return Ok(Some(ResolvedSecret {
            secret: s.to_string(),
            source: SecretSource::Env,
        }));
    }
    match std::fs::read_to_string(&cfg.secret_file) {
        Ok(raw) => {
            let t = raw.trim();
            if t.is_empty() {
                return Ok(None);
            }
            Ok(Some(ResolvedSecret {
                secret: t.to_string(),
                source: SecretSource::File,
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(
            "failed to read secret file {}: {e}",
            cfg.secret_file.display()
        )),
    }
}

pub fn generate_secret() -> String {
    let mut buf = [0u8; GENERATED_SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Write `secret` plus a trailing newline, owner read/write only.
pub fn persist_secret(path: &Path, secret: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("create {}: {e}", parent.display()))?;
        }
    }
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| anyhow::anyhow!("open {}: {e}", path.display()))?;
    // The file may have existed with looser bits.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| anyhow::anyhow!("chmod {}: {e}", path.display()))?;
    f.write_all(format!("{secret}\n").as_bytes())
        .map_err(|e| anyhow::anyhow!("write {}: {e}", path.display()))?;
    Ok(())
}

/// Resolve the control secret: explicit → file → generated (persisted) → generated-ephemeral.
///
/// Fails when the bind address is reachable remotely and the secret is too short.
pub fn provision(cfg: &GuardianConfig, log: &LogRing) -> anyhow::Result<ResolvedSecret> {
    let resolved = match read_existing(cfg) {
        Ok(Some(r)) => r,
        Ok(None) => generate_and_persist(cfg, log),
        Err(e) => {
            log.event("secret", format!("read_failed err={e} fallback=generate"));
            generate_and_persist(cfg, log)
        }
    };

    anyhow::ensure!(
        cfg.bind_is_loopback() || resolved.secret.chars().count() >= MIN_REMOTE_SECRET_LEN,
        "control secret must be at least {MIN_REMOTE_SECRET_LEN} characters when binding to non-loopback address {}",
        cfg.bind
    );

    log.event(
        "secret",
        format!(
            "source={} file={}",
            resolved.source,
            cfg.secret_file.display()
        ),
    );
    Ok(resolved)
}

fn generate_and_persist(cfg: &GuardianConfig, log: &LogRing) -> ResolvedSecret {
    let secret = generate_secret();
    match persist_secret(&cfg.secret_file, &secret) {
        Ok(()) => ResolvedSecret {
            secret,
            source: SecretSource::Generated,
        },
        Err(e) => {
            log.event(
                "secret",
                format!("warning=persist_failed err={e} decision=ephemeral"),
            );
            ResolvedSecret {
                secret,
                source: SecretSource::GeneratedEphemeral,
            }
        }
    }
}
