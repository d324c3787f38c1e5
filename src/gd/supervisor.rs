use crate::gd::config::{
    GuardianConfig, SUPERVISOR_ENV_PREFIX, WORKER_ENV_HEARTBEAT_FILE, WORKER_ENV_HEARTBEAT_INTERVAL_MS,
};
use crate::gd::heartbeat;
use crate::gd::logbuf::{LogRing, Stream};
use crate::gd::restart::{self, RestartHistory, RestartPolicy};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time between SIGTERM and SIGKILL when stopping the worker.
pub const STOP_GRACE: Duration = Duration::from_secs(8);
/// How long to wait for the exit to be observed after SIGKILL.
const KILL_SETTLE: Duration = Duration::from_secs(3);

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn from_argv(argv: &[String]) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("worker command is empty"))?;
        anyhow::ensure!(!program.trim().is_empty(), "worker program is empty");
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerExitInfo {
    /// `None` when the worker was terminated by a signal.
    pub code: Option<i32>,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Exited,
    Restarting,
    Cooldown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stopped => "STOPPED",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Stopping => "STOPPING",
            Phase::Exited => "EXITED",
            Phase::Restarting => "RESTARTING",
            Phase::Cooldown => "COOLDOWN",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at_ms: Option<i64>,
    pub heartbeat_age_ms: Option<u64>,
    pub stale_heartbeat: bool,
    pub last_exit: Option<WorkerExitInfo>,
    pub manual_stop: bool,
    pub cooldown_remaining_ms: u64,
    pub recent_restart_count: usize,
    pub phase: &'static str,
    pub restart_in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub ok: bool,
    pub guardian_pid: u32,
    pub uptime_ms: u64,
    pub worker: WorkerStatus,
}

#[derive(Debug)]
struct TrackedChild {
    pid: u32,
    started_at_ms: i64,
    epoch: u64,
    exited: watch::Receiver<Option<WorkerExitInfo>>,
}

#[derive(Debug)]
struct SupervisorState {
    child: Option<TrackedChild>,
    phase: Phase,
    last_exit: Option<WorkerExitInfo>,
    manual_stop: bool,
    /// Set by `restart()` so the exit it causes does not also schedule an auto-restart.
    restart_requested: bool,
    history: RestartHistory,
    cooldown_until_ms: Option<i64>,
    epoch: u64,
    timer_gen: u64,
    restart_timer: Option<(u64, JoinHandle<()>)>,
    heartbeat_timer: Option<JoinHandle<()>>,
}

impl SupervisorState {
    fn cancel_restart_timer(&mut self) -> bool {
        match self.restart_timer.take() {
            Some((_, h)) => {
                h.abort();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    cfg: GuardianConfig,
    policy: RestartPolicy,
    command: WorkerCommand,
    logs: Arc<LogRing>,
    state: Mutex<SupervisorState>,
    restart_in_flight: AtomicBool,
    shutting_down: AtomicBool,
    started_at_ms: i64,
    stop_grace: Duration,
}

/// Owns the single worker slot: starting, stopping, restarting, exit handling and timers.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(cfg: GuardianConfig, command: WorkerCommand, logs: Arc<LogRing>) -> Self {
        Self::with_stop_grace(cfg, command, logs, STOP_GRACE)
    }

    pub fn with_stop_grace(cfg: GuardianConfig, command: WorkerCommand, logs: Arc<LogRing>, stop_grace: Duration) -> Self {
        let policy = RestartPolicy::from_config(&cfg);
        Self {
            inner: Arc::new(Inner {
                cfg,
                policy,
                command,
                logs,
                state: Mutex::new(SupervisorState {
                    child: None,
                    phase: Phase::Stopped,
                    last_exit: None,
                    manual_stop: false,
                    restart_requested: false,
                    history: RestartHistory::new(),
                    cooldown_until_ms: None,
                    epoch: 0,
                    timer_gen: 0,
                    restart_timer: None,
                    heartbeat_timer: None,
                }),
                restart_in_flight: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                started_at_ms: now_ms(),
                stop_grace,
            }),
        }
    }

    pub fn logs(&self) -> &Arc<LogRing> {
        &self.inner.logs
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn event(&self, component: &str, msg: impl AsRef<str>) {
        self.inner.logs.event(component, msg);
    }

    fn set_phase(&self, st: &mut SupervisorState, phase: Phase, reason: &str) {
        if st.phase != phase {
            self.event("phase", format!("from={} to={} reason={reason}", st.phase, phase));
            st.phase = phase;
        }
    }

    /// Start the worker unless one is already tracked.
    ///
    /// Returns `Ok(false)` when nothing was started (already running, cooldown, shutting down).
    pub fn start(&self, reason: &str, force: bool) -> anyhow::Result<bool> {
        let now = now_ms();
        let mut st = self.lock();
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.event("start", format!("reason={reason:?} outcome=refused cause=shutting_down"));
            return Ok(false);
        }
        if let Some(c) = st.child.as_ref() {
            self.event("start", format!("reason={reason:?} outcome=noop cause=already_running pid={}", c.pid));
            return Ok(false);
        }
        let remaining = restart::cooldown_remaining_ms(st.cooldown_until_ms, now);
        if remaining > 0 && !force {
            self.event(
                "start",
                format!("reason={reason:?} outcome=refused cause=cooldown remaining_ms={remaining}"),
            );
            self.set_phase(&mut st, Phase::Cooldown, "start_refused");
            return Ok(false);
        }

        self.set_phase(&mut st, Phase::Starting, reason);
        let mut child = match self.spawn_worker() {
            Ok(c) => c,
            Err(e) => {
                self.event("start", format!("reason={reason:?} outcome=spawn_error err={e}"));
                self.set_phase(&mut st, Phase::Exited, "spawn_error");
                return Err(e);
            }
        };
        let pid = child.id().unwrap_or(0);
        st.epoch = st.epoch.wrapping_add(1);
        let epoch = st.epoch;
        let (tx, rx) = watch::channel(None);
        st.child = Some(TrackedChild {
            pid,
            started_at_ms: now,
            epoch,
            exited: rx,
        });
        st.manual_stop = false;
        st.cancel_restart_timer();

        if let Some(out) = child.stdout.take() {
            spawn_output_pump(Arc::clone(&self.inner.logs), Stream::Stdout, out);
        }
        if let Some(err) = child.stderr.take() {
            spawn_output_pump(Arc::clone(&self.inner.logs), Stream::Stderr, err);
        }
        let sup = self.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    if let Some(sig) = status.signal() {
                        sup.event("watch", format!("event=exit_observed pid={pid} signal={sig}"));
                    }
                    status.code()
                }
                Err(e) => {
                    sup.event("watch", format!("event=wait_error pid={pid} err={e}"));
                    None
                }
            };
            let info = WorkerExitInfo { code, at_ms: now_ms() };
            sup.on_exit(epoch, info);
            let _ = tx.send(Some(info));
        });

        self.event(
            "start",
            format!("reason={reason:?} outcome=started pid={pid} force={force}"),
        );
        self.set_phase(&mut st, Phase::Running, "started");
        Ok(true)
    }

    fn spawn_worker(&self) -> anyhow::Result<tokio::process::Child> {
        let cmd_def = &self.inner.command;
        let mut cmd = Command::new(&cmd_def.program);
        cmd.args(&cmd_def.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        for (k, _) in std::env::vars_os() {
            if k.to_string_lossy().starts_with(SUPERVISOR_ENV_PREFIX) {
                cmd.env_remove(&k);
            }
        }
        cmd.env(WORKER_ENV_HEARTBEAT_FILE, &self.inner.cfg.heartbeat_file)
            .env(
                WORKER_ENV_HEARTBEAT_INTERVAL_MS,
                self.inner.cfg.heartbeat_interval_ms.to_string(),
            );
        cmd.spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn worker {:?}: {e}", cmd_def.program))
    }

    fn on_exit(&self, epoch: u64, info: WorkerExitInfo) {
        let mut st = self.lock();
        let current = st.child.as_ref().map(|c| c.epoch);
        if current != Some(epoch) {
            self.event("watch", format!("ignore_exit reason=stale_epoch got={epoch} want={current:?}"));
            return;
        }
        st.child = None;
        st.last_exit = Some(info);
        self.event(
            "watch",
            format!(
                "event=exit code={}",
                info.code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
            ),
        );

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.set_phase(&mut st, Phase::Stopped, "exit_during_shutdown");
            return;
        }
        if st.manual_stop {
            self.set_phase(&mut st, Phase::Stopped, "exit_after_manual_stop");
            return;
        }
        if st.restart_requested {
            st.restart_requested = false;
            self.set_phase(&mut st, Phase::Restarting, "exit_for_restart");
            return;
        }
        self.set_phase(&mut st, Phase::Exited, "exit_observed");
        self.schedule_auto_restart(&mut st, info.at_ms);
    }

    fn schedule_auto_restart(&self, st: &mut SupervisorState, now: i64) {
        let policy = &self.inner.policy;
        st.history.prune(now, policy.window_ms);
        st.history.record(now);
        let decision = restart::next_restart(policy, st.history.len(), now);
        if let Some(until) = decision.cooldown_until_ms {
            st.cooldown_until_ms = Some(until);
            self.event(
                "restart",
                format!(
                    "decision=cooldown reason=crash_loop recent_restarts={} max_restarts={} window_ms={} cooldown_ms={}",
                    st.history.len(),
                    policy.max_restarts,
                    policy.window_ms,
                    policy.cooldown_ms
                ),
            );
            self.set_phase(st, Phase::Cooldown, "crash_loop");
        }
        let delay_ms = decision
            .delay_ms
            .max(restart::cooldown_remaining_ms(st.cooldown_until_ms, now));
        self.event(
            "restart",
            format!(
                "decision=backoff attempt={} delay_ms={delay_ms} recent_restarts={}",
                decision.attempt,
                st.history.len()
            ),
        );

        self.arm_restart_timer(st, delay_ms);
    }

    fn arm_restart_timer(&self, st: &mut SupervisorState, delay_ms: u64) {
        st.cancel_restart_timer();
        st.timer_gen = st.timer_gen.wrapping_add(1);
        let gen = st.timer_gen;
        let sup = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            sup.fire_restart_timer(gen);
        });
        st.restart_timer = Some((gen, handle));
    }

    /// Whether an exit or failed spawn should still lead to an automatic restart.
    fn wants_auto_restart(&self, st: &SupervisorState) -> bool {
        st.child.is_none() && !st.manual_stop && !self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn fire_restart_timer(&self, gen: u64) {
        {
            let mut st = self.lock();
            let ours = matches!(st.restart_timer.as_ref(), Some((g, _)) if *g == gen);
            if !ours {
                return;
            }
            // Drop our own handle without aborting the running task.
            st.restart_timer = None;
        }
        match self.start("auto-restart", false) {
            Ok(true) => {}
            Ok(false) => {
                // Cooldown deadlines are wall-clock; the timer is monotonic and may wake early.
                let mut st = self.lock();
                let remaining = restart::cooldown_remaining_ms(st.cooldown_until_ms, now_ms());
                if remaining > 0 && self.wants_auto_restart(&st) {
                    self.event("restart", format!("decision=retry_after_cooldown delay_ms={remaining}"));
                    self.arm_restart_timer(&mut st, remaining);
                }
            }
            Err(e) => {
                // A failed spawn counts as another crash.
                let mut st = self.lock();
                if self.wants_auto_restart(&st) {
                    self.event("restart", format!("outcome=spawn_error err={e}"));
                    self.schedule_auto_restart(&mut st, now_ms());
                }
            }
        }
    }

    /// Boot-time start: a spawn failure is handed to the restart scheduler instead of failing boot.
    pub fn boot(&self) {
        if let Err(e) = self.start("boot", false) {
            let mut st = self.lock();
            self.event("boot", format!("outcome=spawn_error err={e} decision=schedule_restart"));
            self.schedule_auto_restart(&mut st, now_ms());
        }
    }

    /// Stop the worker: SIGTERM, wait up to the grace period, then SIGKILL.
    ///
    /// With `manual`, the following exit does not trigger an auto-restart and any pending
    /// auto-restart is cancelled. Returns whether a worker was running.
    pub async fn stop(&self, reason: &str, manual: bool) -> anyhow::Result<bool> {
        let (pid, mut exited) = {
            let mut st = self.lock();
            if manual {
                st.manual_stop = true;
                if st.cancel_restart_timer() {
                    self.event("stop", "pending_auto_restart=cancelled");
                }
            }
            let Some(pair) = st.child.as_ref().map(|c| (c.pid, c.exited.clone())) else {
                self.event("stop", format!("reason={reason:?} outcome=noop cause=not_running"));
                if manual {
                    self.set_phase(&mut st, Phase::Stopped, "manual_stop_idle");
                }
                return Ok(false);
            };
            self.set_phase(&mut st, Phase::Stopping, reason);
            pair
        };

        self.event(
            "stop",
            format!("reason={reason:?} manual={manual} attempt=signal sig=SIGTERM pid={pid}"),
        );
        if exited.borrow().is_none() {
            // ESRCH here just means it already exited; the watch below is authoritative.
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let grace = self.inner.stop_grace;
        let t0 = std::time::Instant::now();
        let exited_in_grace = tokio::time::timeout(grace, exited.wait_for(|v| v.is_some()))
            .await
            .is_ok();
        if exited_in_grace {
            self.event("stop", format!("outcome=grace_exit elapsed_ms={}", t0.elapsed().as_millis()));
            return Ok(true);
        }

        self.event(
            "stop",
            format!("outcome=grace_expired grace_ms={} decision=kill pid={pid}", grace.as_millis()),
        );
        if exited.borrow().is_none() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let exited_after_kill = tokio::time::timeout(KILL_SETTLE, exited.wait_for(|v| v.is_some()))
            .await
            .is_ok();
        if !exited_after_kill {
            self.event("stop", format!("outcome=kill_unobserved pid={pid}"));
            anyhow::bail!("worker pid {pid} still running after SIGKILL");
        }
        self.event("stop", "outcome=killed");
        Ok(true)
    }

    /// Stop (non-manual) then force-start. Only one restart runs at a time; concurrent callers get `Ok(false)`.
    pub async fn restart(&self, reason: &str) -> anyhow::Result<bool> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.event("restart", format!("reason={reason:?} outcome=refused cause=shutting_down"));
            return Ok(false);
        }
        if self.inner.restart_in_flight.swap(true, Ordering::SeqCst) {
            self.event("restart", format!("reason={reason:?} outcome=rejected cause=in_flight"));
            return Ok(false);
        }
        let _guard = RestartGuard { sup: self };
        self.restart_in_flight_body(reason).await
    }

    async fn restart_in_flight_body(&self, reason: &str) -> anyhow::Result<bool> {
        {
            let mut st = self.lock();
            let now = now_ms();
            st.cancel_restart_timer();
            st.manual_stop = false;
            st.restart_requested = st.child.is_some();
            st.history.prune(now, self.inner.policy.window_ms);
            st.history.record(now);
            self.set_phase(&mut st, Phase::Restarting, reason);
        }
        self.event("restart", format!("reason={reason:?} attempt=stop"));
        self.stop(reason, false).await?;

        if self.lock().manual_stop {
            self.event("restart", format!("reason={reason:?} outcome=aborted cause=manual_stop"));
            return Ok(false);
        }
        match self.start(reason, true) {
            Ok(started) => Ok(started),
            Err(e) => {
                let mut st = self.lock();
                if self.wants_auto_restart(&st) {
                    self.event("restart", format!("reason={reason:?} outcome=spawn_error decision=schedule_restart"));
                    self.schedule_auto_restart(&mut st, now_ms());
                }
                Err(e)
            }
        }
    }

    pub fn is_restart_in_flight(&self) -> bool {
        self.inner.restart_in_flight.load(Ordering::SeqCst)
    }

    /// Heartbeat reading for the current child, with its start time.
    fn heartbeat_reading(&self, now: i64) -> Option<(i64, heartbeat::HeartbeatReading)> {
        let started = self.lock().child.as_ref().map(|c| c.started_at_ms)?;
        Some((started, heartbeat::read(&self.inner.cfg.heartbeat_file, started, now)))
    }

    /// One watchdog poll: restart the worker when its heartbeat is stale.
    ///
    /// Returns whether a restart was issued.
    pub async fn check_heartbeat(&self) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) || self.is_restart_in_flight() {
            return false;
        }
        let now = now_ms();
        let Some((started, reading)) = self.heartbeat_reading(now) else {
            return false;
        };
        if !heartbeat::is_stale(reading, started, now, self.inner.cfg.heartbeat_timeout_ms) {
            return false;
        }
        self.event(
            "heartbeat",
            format!(
                "event=stale age_ms={} uptime_ms={} timeout_ms={}",
                reading
                    .reported_age_ms()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                now - started,
                self.inner.cfg.heartbeat_timeout_ms
            ),
        );
        match self.restart("stale heartbeat").await {
            Ok(issued) => issued,
            Err(e) => {
                self.event("heartbeat", format!("restart_error err={e}"));
                true
            }
        }
    }

    /// Start polling the heartbeat file on the configured interval.
    pub fn spawn_heartbeat_timer(&self) {
        let sup = self.clone();
        let poll = Duration::from_millis(self.inner.cfg.heartbeat_poll_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut iv = tokio::time::interval(poll);
            iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            iv.tick().await;
            loop {
                iv.tick().await;
                sup.check_heartbeat().await;
            }
        });
        let mut st = self.lock();
        if let Some(old) = st.heartbeat_timer.replace(handle) {
            old.abort();
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let now = now_ms();
        let reading = self.heartbeat_reading(now);
        let st = self.lock();
        let (heartbeat_age_ms, stale_heartbeat) = match reading {
            Some((started, r)) => (
                r.reported_age_ms(),
                heartbeat::is_stale(r, started, now, self.inner.cfg.heartbeat_timeout_ms),
            ),
            None => (None, false),
        };
        let window = self.inner.policy.window_ms;
        StatusSnapshot {
            ok: true,
            guardian_pid: std::process::id(),
            uptime_ms: now.saturating_sub(self.inner.started_at_ms).max(0) as u64,
            worker: WorkerStatus {
                running: st.child.is_some(),
                pid: st.child.as_ref().map(|c| c.pid),
                started_at_ms: st.child.as_ref().map(|c| c.started_at_ms),
                heartbeat_age_ms,
                stale_heartbeat,
                last_exit: st.last_exit,
                manual_stop: st.manual_stop,
                cooldown_remaining_ms: restart::cooldown_remaining_ms(st.cooldown_until_ms, now),
                recent_restart_count: st.history.recent(now, window),
                phase: st.phase.as_str(),
                restart_in_flight: self.is_restart_in_flight(),
            },
        }
    }

    /// Cease supervision: timers first, then a final graceful-then-forceful stop of the worker.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let (hb, rt) = {
            let mut st = self.lock();
            (st.heartbeat_timer.take(), st.restart_timer.take())
        };
        if let Some(h) = hb {
            h.abort();
        }
        if let Some((_, h)) = rt {
            h.abort();
        }
        self.event("shutdown", "timers=cancelled attempt=stop_worker");
        if let Err(e) = self.stop("shutdown", false).await {
            self.event("shutdown", format!("stop_error err={e}"));
        }
        let mut st = self.lock();
        self.set_phase(&mut st, Phase::Stopped, "shutdown");
    }
}

/// Clears the in-flight flag and any unconsumed restart marker, also when the restart future is dropped.
struct RestartGuard<'a> {
    sup: &'a Supervisor,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.sup.lock().restart_requested = false;
        self.sup.inner.restart_in_flight.store(false, Ordering::SeqCst);
    }
}

/// Forward a child pipe into the log ring line by line. A trailing partial line is flushed at EOF.
fn spawn_output_pump<R>(logs: Arc<LogRing>, stream: Stream, pipe: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    logs.worker_line(stream, line.trim_end_matches(&['\r', '\n'][..]));
                }
                Err(e) => {
                    logs.event("output", format!("stream={} read_error err={e}", stream.as_str()));
                    break;
                }
            }
        }
    });
}
