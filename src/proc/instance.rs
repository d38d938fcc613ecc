//! # ProcessInstance: one supervised child process.
//!
//! Every instance is driven by a single actor task, so lifecycle
//! transitions are serialized per instance by construction:
//!
//! ```text
//! PENDING → SPAWNING → RUNNING → (TERMINATING →)? EXITED
//!                    → SPAWN_FAILED
//! ```
//!
//! ## Event flow
//! ```text
//! spawn ok:    publish `spawn` + `proc.<name>.spawn`
//! exec error:  publish `spawn_error` + `proc.<name>.spawn_error`
//! exit:        publish `exit` + `proc.<name>.exit` with
//!              {exit_status, term_signal, reaped}
//! ```
//!
//! ## Termination ladder
//! A stop request sends SIGTERM and arms the graceful timer. If the
//! child has not been reaped when it fires, SIGKILL is sent and a
//! bounded forced-kill grace starts; when that elapses too, the
//! instance is forcibly released and reports `reaped = forced` while a
//! detached task keeps waiting to drain the zombie.
//!
//! ## Rules
//! - Concurrent stop requests collapse; a later request may only
//!   shorten the graceful timer, never extend it.
//! - Signals to an already-terminated instance are a no-op.
//! - Every exit path cancels the mux, the stats sampler and all timers.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ManagerConfig;
use crate::error::Error;
use crate::events::{job_topic, Event, EventEmitter, EventKind, Reaped, Topic};
use crate::jobs::{substitute_env, IdSpec, ProcessSpec};
use crate::proc::mux::StreamMux;
use crate::proc::stats;

/// Lifecycle states of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Spawning,
    Running,
    Terminating,
    Exited,
    SpawnFailed,
}

impl InstanceState {
    /// Stable snake_case name for logs and read views.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Spawning => "spawning",
            InstanceState::Running => "running",
            InstanceState::Terminating => "terminating",
            InstanceState::Exited => "exited",
            InstanceState::SpawnFailed => "spawn_failed",
        }
    }

    /// True while an OS process may still be alive.
    pub fn alive(&self) -> bool {
        matches!(
            self,
            InstanceState::Spawning | InstanceState::Running | InstanceState::Terminating
        )
    }
}

/// Control messages accepted by the instance actor.
#[derive(Debug)]
pub(crate) enum InstanceControl {
    /// Begin (or shorten) graceful termination.
    Stop { graceful: Option<Duration> },
    /// Deliver a raw signal to the OS process.
    Signal(i32),
}

/// What the actor reports back to the manager when the instance is
/// gone.
#[derive(Debug)]
pub(crate) struct ExitNotice {
    pub pid: u64,
    pub qname: String,
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
    pub reaped: Reaped,
    /// True when the exit was caused by an explicit stop request.
    pub expected: bool,
    pub uptime: Duration,
    pub spawn_failed: bool,
}

/// Everything needed to launch one instance.
pub(crate) struct InstanceParams {
    pub pid: u64,
    pub qname: String,
    pub spec: Arc<ProcessSpec>,
    /// Environment overlay for one-off (commit) spawns.
    pub extra_env: Option<HashMap<String, String>>,
    /// Graceful timeout override for one-off spawns.
    pub graceful_override: Option<Duration>,
    pub cfg: ManagerConfig,
}

/// Shared, cloneable view of a live instance.
#[derive(Clone)]
pub struct InstanceHandle {
    pid: u64,
    qname: String,
    name: String,
    created_at: SystemTime,
    detach: bool,
    spec: Arc<ProcessSpec>,
    os_pid: Arc<OnceLock<u32>>,
    state: watch::Receiver<InstanceState>,
    ctl: mpsc::UnboundedSender<InstanceControl>,
    mux: Arc<StreamMux>,
}

impl InstanceHandle {
    /// Manager-internal pid; never reused.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Qualified template name.
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// Unqualified template name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn detach(&self) -> bool {
        self.detach
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    /// Backing OS pid, once spawned.
    pub fn os_pid(&self) -> Option<u32> {
        self.os_pid.get().copied()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// The instance's stream multiplexer.
    pub fn mux(&self) -> &Arc<StreamMux> {
        &self.mux
    }

    /// Requests termination. Idempotent; a second request only
    /// shortens the graceful timer.
    pub fn stop(&self, graceful: Option<Duration>) {
        let _ = self.ctl.send(InstanceControl::Stop { graceful });
    }

    /// Delivers a signal. No-op once the instance terminated.
    pub fn signal(&self, signum: i32) {
        let _ = self.ctl.send(InstanceControl::Signal(signum));
    }
}

/// Launches one instance and returns its handle. The fork/exec and the
/// `spawn` (or `spawn_error`) event happen before this returns, so
/// callers observe spawn events in call order; supervision continues on
/// a dedicated task.
pub(crate) fn spawn_instance(
    params: InstanceParams,
    emitter: EventEmitter,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
) -> InstanceHandle {
    let (state_tx, state_rx) = watch::channel(InstanceState::Pending);
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let os_pid = Arc::new(OnceLock::new());

    let mux = StreamMux::new(
        params.pid,
        params.qname.clone(),
        emitter.clone(),
        params.cfg.stream_backlog,
        params.cfg.stdin_queue,
        token.clone(),
    );
    for label in &params.spec.custom_streams {
        mux.register_channel(label);
    }

    let handle = InstanceHandle {
        pid: params.pid,
        qname: params.qname.clone(),
        name: params.spec.name.clone(),
        created_at: SystemTime::now(),
        detach: params.spec.detach,
        spec: Arc::clone(&params.spec),
        os_pid: Arc::clone(&os_pid),
        state: state_rx,
        ctl: ctl_tx,
        mux: Arc::clone(&mux),
    };

    let actor = InstanceActor {
        params,
        emitter,
        exit_tx,
        state_tx,
        ctl_rx,
        os_pid,
        mux,
        token,
    };
    actor.launch();

    handle
}

/// How the supervision loop ended.
enum WaitOutcome {
    /// The OS process was reaped.
    Reaped(std::io::Result<std::process::ExitStatus>),
    /// SIGKILL plus the forced grace elapsed without a reap.
    ForcedRelease,
}

/// Phase of the termination ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    /// No stop requested yet.
    None,
    /// SIGTERM sent, graceful timer armed.
    Graceful,
    /// SIGKILL sent, forced-kill grace armed.
    Killed,
}

struct InstanceActor {
    params: InstanceParams,
    emitter: EventEmitter,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    state_tx: watch::Sender<InstanceState>,
    ctl_rx: mpsc::UnboundedReceiver<InstanceControl>,
    os_pid: Arc<OnceLock<u32>>,
    mux: Arc<StreamMux>,
    token: CancellationToken,
}

impl InstanceActor {
    /// Fork/exec runs on the caller's task so that `spawn` events fire
    /// in the exact order the scheduler decided; supervision then moves
    /// to its own task.
    fn launch(self) {
        let pid = self.params.pid;
        let qname = self.params.qname.clone();
        let name = self.params.spec.name.clone();

        self.set_state(InstanceState::Spawning);
        let mut command = match self.build_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.fail_spawn(&name, &qname, e);
                return;
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_spawn(&name, &qname, e.into());
                return;
            }
        };
        let started = Instant::now();
        let os_pid = child.id().unwrap_or(0);
        let _ = self.os_pid.set(os_pid);

        // Wire stdio through the mux before announcing the spawn so
        // the first chunks cannot race the `spawn` event.
        let (out_label, err_label, _merged) = self.params.spec.output_labels();
        if let (Some(label), Some(stdout)) = (out_label, child.stdout.take()) {
            self.mux.attach_output(label, stdout);
        }
        if let (Some(label), Some(stderr)) = (err_label, child.stderr.take()) {
            self.mux.attach_output(label, stderr);
        }
        if let Some(stdin) = child.stdin.take() {
            self.mux.attach_stdin(stdin);
        }

        stats::spawn_sampler(
            self.emitter.clone(),
            self.params.cfg.stats_interval,
            pid,
            os_pid,
            qname.clone(),
            self.token.child_token(),
        );

        self.set_state(InstanceState::Running);
        debug!(pid, os_pid, %qname, "instance running");
        let spawn_ev = Event::now(EventKind::Spawn)
            .with_name(&qname)
            .with_pid(pid)
            .with_os_pid(os_pid);
        self.emitter.publish(Topic::new("spawn"), spawn_ev.clone());
        self.emitter.publish(job_topic(&name, EventKind::Spawn), spawn_ev);

        tokio::spawn(self.supervise(child, started, os_pid, name, qname));
    }

    async fn supervise(
        mut self,
        mut child: tokio::process::Child,
        started: Instant,
        os_pid: u32,
        name: String,
        qname: String,
    ) {
        let pid = self.params.pid;
        let graceful_default = self.params.graceful_override.unwrap_or_else(|| {
            self.params
                .spec
                .graceful_timeout_or(self.params.cfg.graceful_timeout)
        });

        let mut phase = StopPhase::None;
        let mut deadline: Option<TokioInstant> = None;
        let mut ctl_open = true;

        let outcome = loop {
            tokio::select! {
                status = child.wait() => break WaitOutcome::Reaped(status),

                ctl = self.ctl_rx.recv(), if ctl_open => match ctl {
                    None => ctl_open = false,
                    Some(InstanceControl::Signal(signum)) => {
                        deliver_signal(pid, os_pid, signum);
                    }
                    Some(InstanceControl::Stop { graceful }) => {
                        let until = TokioInstant::now()
                            + graceful.unwrap_or(graceful_default);
                        match phase {
                            StopPhase::None => {
                                phase = StopPhase::Graceful;
                                self.set_state(InstanceState::Terminating);
                                deliver_signal(pid, os_pid, Signal::SIGTERM as i32);
                                deadline = Some(until);
                            }
                            StopPhase::Graceful => {
                                // Collapse: only ever shorten the timer.
                                deadline = Some(deadline.map_or(until, |d| d.min(until)));
                            }
                            StopPhase::Killed => {}
                        }
                    }
                },

                _ = sleep_until_opt(deadline), if deadline.is_some() => match phase {
                    StopPhase::Graceful => {
                        let err = Error::TerminateTimeout {
                            pid,
                            timeout: graceful_default,
                        };
                        warn!(
                            pid, os_pid, %qname,
                            label = err.as_label(),
                            "{err}; escalating to SIGKILL"
                        );
                        phase = StopPhase::Killed;
                        deliver_signal(pid, os_pid, Signal::SIGKILL as i32);
                        deadline = Some(
                            TokioInstant::now() + self.params.cfg.forced_kill_grace,
                        );
                    }
                    StopPhase::Killed => break WaitOutcome::ForcedRelease,
                    StopPhase::None => deadline = None,
                },
            }
        };

        let status = match outcome {
            WaitOutcome::Reaped(status) => status,
            WaitOutcome::ForcedRelease => {
                // The child survived SIGKILL plus the grace: release it
                // forcibly and drain the zombie in the background.
                warn!(pid, os_pid, %qname, "forcibly releasing instance");
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                self.finish(
                    &name,
                    &qname,
                    None,
                    Some(Signal::SIGKILL as i32),
                    Reaped::Forced,
                    true,
                    started.elapsed(),
                );
                return;
            }
        };

        let (exit_status, term_signal) = match status {
            Ok(status) => (status.code(), status.signal()),
            Err(e) => {
                warn!(pid, os_pid, error = %e, "wait failed, treating as reaped");
                (None, None)
            }
        };
        let reaped = match phase {
            StopPhase::Killed => Reaped::Forced,
            StopPhase::Graceful => Reaped::Graceful,
            StopPhase::None => Reaped::Normal,
        };
        self.finish(
            &name,
            &qname,
            exit_status,
            term_signal,
            reaped,
            phase != StopPhase::None,
            started.elapsed(),
        );
    }

    /// Builds the `Command` from the spec: `$VAR` substitution against
    /// the resolved environment, shell wrapping, identity, stdio.
    fn build_command(&self) -> Result<Command, Error> {
        let spec = &self.params.spec;
        let env = spec.resolved_env(self.params.extra_env.as_ref());

        let raw_args = spec.args.to_vec();
        let (program, args) = if spec.shell {
            // `sh -c <cmd>` with any extra args appended.
            let mut args = vec!["-c".to_string(), substitute_env(&spec.cmd, &env)];
            args.extend(raw_args.iter().map(|a| substitute_env(a, &env)));
            ("sh".to_string(), args)
        } else if raw_args.is_empty() {
            // Allow `cmd` to carry its own arguments.
            let mut parts = spec.cmd.split_whitespace();
            let program = parts.next().unwrap_or_default().to_string();
            let args = parts.map(|a| substitute_env(a, &env)).collect();
            (substitute_env(&program, &env), args)
        } else {
            (
                substitute_env(&spec.cmd, &env),
                raw_args.iter().map(|a| substitute_env(a, &env)).collect(),
            )
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(&env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(uid) = &spec.uid {
            cmd.uid(resolve_uid(uid)?);
        }
        if let Some(gid) = &spec.gid {
            cmd.gid(resolve_gid(gid)?);
        }
        if spec.detach {
            cmd.process_group(0);
        } else {
            cmd.kill_on_drop(true);
        }

        use std::process::Stdio;
        cmd.stdin(if spec.redirect_input {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let (out, err, _merged) = spec.output_labels();
        cmd.stdout(if out.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if err.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        Ok(cmd)
    }

    fn fail_spawn(&self, name: &str, qname: &str, err: Error) {
        let pid = self.params.pid;
        warn!(pid, %qname, error = %err, "spawn failed");
        self.set_state(InstanceState::SpawnFailed);
        self.mux.close();

        let ev = Event::now(EventKind::SpawnError)
            .with_name(qname)
            .with_pid(pid)
            .with_error(err.to_string());
        self.emitter.publish(Topic::new("spawn_error"), ev.clone());
        self.emitter
            .publish(job_topic(name, EventKind::SpawnError), ev);

        let _ = self.exit_tx.send(ExitNotice {
            pid,
            qname: qname.to_string(),
            exit_status: None,
            term_signal: None,
            reaped: Reaped::Normal,
            expected: false,
            uptime: Duration::ZERO,
            spawn_failed: true,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        name: &str,
        qname: &str,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        reaped: Reaped,
        expected: bool,
        uptime: Duration,
    ) {
        let pid = self.params.pid;
        self.mux.close();
        self.set_state(InstanceState::Exited);
        debug!(
            pid,
            %qname,
            exit_status,
            term_signal,
            reaped = reaped.as_str(),
            "instance exited"
        );

        let ev = Event::now(EventKind::Exit)
            .with_name(qname)
            .with_pid(pid)
            .with_os_pid(self.os_pid.get().copied().unwrap_or(0))
            .with_exit(exit_status, term_signal, reaped);
        self.emitter.publish(Topic::new("exit"), ev.clone());
        self.emitter.publish(job_topic(name, EventKind::Exit), ev);

        let _ = self.exit_tx.send(ExitNotice {
            pid,
            qname: qname.to_string(),
            exit_status,
            term_signal,
            reaped,
            expected,
            uptime,
            spawn_failed: false,
        });
    }

    fn set_state(&self, state: InstanceState) {
        let _ = self.state_tx.send(state);
    }
}

async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn deliver_signal(pid: u64, os_pid: u32, signum: i32) {
    if os_pid == 0 {
        return;
    }
    match Signal::try_from(signum) {
        Ok(sig) => {
            if let Err(e) = kill(NixPid::from_raw(os_pid as i32), sig) {
                debug!(pid, os_pid, signum, error = %e, "signal delivery failed");
            }
        }
        Err(_) => warn!(pid, os_pid, signum, "unknown signal number"),
    }
}

fn resolve_uid(id: &IdSpec) -> Result<u32, Error> {
    match id {
        IdSpec::Num(n) => Ok(*n),
        IdSpec::Name(name) => nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
            .ok_or_else(|| Error::Spawn {
                errno: 0,
                reason: format!("unknown user '{name}'"),
            }),
    }
}

fn resolve_gid(id: &IdSpec) -> Result<u32, Error> {
    match id {
        IdSpec::Num(n) => Ok(*n),
        IdSpec::Name(name) => nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
            .ok_or_else(|| Error::Spawn {
                errno: 0,
                reason: format!("unknown group '{name}'"),
            }),
    }
}
