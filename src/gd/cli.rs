use crate::gd::auth::{self, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TS};
use crate::gd::{config, daemon, secret};
use clap::{Parser, Subcommand};
use rand::RngCore;

#[derive(Debug, Parser)]
#[command(
    name = "guardian",
    version,
    about = "single-worker supervisor with an authenticated HTTP control plane",
    args_conflicts_with_subcommands = true
)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Cmd>,

    /// Worker command line, e.g. `guardian -- node worker.js`
    #[arg(last = true)]
    pub worker: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Supervise the worker and serve the control API (default)
    Run {
        /// Worker command line after `--`
        #[arg(last = true, required = true)]
        worker: Vec<String>,
    },
    /// Print the signature headers for one control request
    Sign {
        #[arg(long, default_value = "POST")]
        method: String,
        /// Request path without the query string, e.g. /restart
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Nonce to use (random when omitted)
        #[arg(long)]
        nonce: Option<String>,
    },
    /// Show where `run` would take the control secret from
    SecretSource,
}

fn random_nonce() -> String {
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Header lines for a signed request, in the order clients usually send them.
pub fn signed_headers(
    secret: &str,
    method: &str,
    path: &str,
    body: &str,
    timestamp_ms: i64,
    nonce: &str,
) -> anyhow::Result<Vec<(&'static str, String)>> {
    let method = method.trim().to_ascii_uppercase();
    anyhow::ensure!(path.starts_with('/'), "path must start with '/' (got {path:?})");
    anyhow::ensure!(!path.contains('?'), "path must not include a query string (got {path:?})");
    let ts = timestamp_ms.to_string();
    let sig = auth::sign(secret, &method, path, &ts, nonce, body.as_bytes())?;
    Ok(vec![
        (HEADER_TS, ts),
        (HEADER_NONCE, nonce.to_string()),
        (HEADER_SIGNATURE, format!("sha256={sig}")),
    ])
}

fn cmd_sign(method: &str, path: &str, body: &str, nonce: Option<String>) -> anyhow::Result<()> {
    let cfg = config::resolve(&config::process_env())?;
    let Some(resolved) = secret::read_existing(&cfg)? else {
        anyhow::bail!(
            "no control secret found (set {} or start guardian once to create {})",
            config::ENV_SECRET,
            cfg.secret_file.display()
        );
    };
    let nonce = nonce.unwrap_or_else(random_nonce);
    let now = chrono::Utc::now().timestamp_millis();
    for (k, v) in signed_headers(&resolved.secret, method, path, body, now, &nonce)? {
        println!("{k}: {v}");
    }
    Ok(())
}

fn cmd_secret_source() -> anyhow::Result<()> {
    let cfg = config::resolve(&config::process_env())?;
    match secret::read_existing(&cfg)? {
        Some(r) => println!("{} ({})", r.source, cfg.secret_file.display()),
        None => println!("none: a new secret will be generated into {}", cfg.secret_file.display()),
    }
    Ok(())
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    match args.cmd {
        Some(Cmd::Run { worker }) => daemon::run_guardian(worker).await,
        Some(Cmd::Sign {
            method,
            path,
            body,
            nonce,
        }) => cmd_sign(&method, &path, &body, nonce),
        Some(Cmd::SecretSource) => cmd_secret_source(),
        None => {
            anyhow::ensure!(
                !args.worker.is_empty(),
                "no worker command given; usage: guardian [run] -- <program> [args...]"
            );
            daemon::run_guardian(args.worker).await
        }
    }
}
