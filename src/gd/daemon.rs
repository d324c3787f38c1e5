use crate::gd::auth::Authenticator;
use crate::gd::config::{self, GuardianConfig};
use crate::gd::logbuf::LogRing;
use crate::gd::supervisor::{Supervisor, WorkerCommand};
use crate::gd::web::{self, WebState};
use crate::gd::{build_info, secret};
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

fn log_config(logs: &LogRing, cfg: &GuardianConfig) {
    logs.event(
        "config",
        format!(
            "bind={} port={} heartbeat_file={} heartbeat_timeout_ms={} heartbeat_poll_ms={} restart_base_ms={} restart_max_ms={} restart_window_ms={} restart_max_count={} cooldown_ms={} log_tail_limit={}",
            cfg.bind,
            cfg.port,
            cfg.heartbeat_file.display(),
            cfg.heartbeat_timeout_ms,
            cfg.heartbeat_poll_ms,
            cfg.restart_base_delay_ms,
            cfg.restart_max_delay_ms,
            cfg.restart_window_ms,
            cfg.restart_max_count,
            cfg.restart_cooldown_ms,
            cfg.log_tail_limit
        ),
    );
}

/// Supervise `worker` and serve the control API until SIGINT/SIGTERM.
pub async fn run_guardian(worker: Vec<String>) -> anyhow::Result<()> {
    let cfg = config::resolve(&config::process_env())?;
    let command = WorkerCommand::from_argv(&worker)?;

    let logs = Arc::new(LogRing::new(cfg.log_tail_limit));
    logs.event(
        "boot",
        format!("{} pid={} worker={:?}", build_info::banner(), std::process::id(), command.program),
    );
    log_config(&logs, &cfg);

    let resolved = secret::provision(&cfg, &logs)?;
    let auth = Arc::new(Authenticator::new(
        resolved.secret,
        cfg.signature_max_skew_ms,
        cfg.nonce_ttl_ms,
    ));

    // Bind before spawning anything so a busy port fails boot cleanly.
    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control api on {addr}"))?;
    logs.event("web", format!("listening addr={addr} loopback={}", cfg.bind_is_loopback()));

    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    let sup = Supervisor::new(cfg, command, Arc::clone(&logs));
    sup.boot();
    sup.spawn_heartbeat_timer();

    let web_down = Arc::new(AtomicBool::new(false));
    let mut server = tokio::spawn(web::serve(
        listener,
        web::build_router(WebState::new(sup.clone(), auth)),
        Arc::clone(&web_down),
    ));

    let early_exit = tokio::select! {
        _ = term.recv() => { logs.event("shutdown", "signal=SIGTERM"); None }
        _ = int.recv() => { logs.event("shutdown", "signal=SIGINT"); None }
        r = &mut server => Some(r),
    };

    sup.shutdown().await;
    web_down.store(true, Ordering::Relaxed);
    let served = match early_exit {
        Some(r) => r,
        None => server.await,
    };
    logs.event("shutdown", "done");
    match served {
        Ok(r) => r.context("control api stopped"),
        Err(e) => Err(anyhow::anyhow!("control api task failed: {e}")),
    }
}
