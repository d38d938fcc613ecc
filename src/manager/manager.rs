//! # Manager: registry, scheduler, and convergence loop.
//!
//! The [`Manager`] owns every template and instance. All registry state
//! lives on one loop task; external threads reach it through
//! [`ManagerHandle`] over the command channel, so no lock ever guards
//! the registry itself.
//!
//! ## Architecture
//! ```text
//! ManagerHandle ──► Command channel ──► Manager::run()
//!                                           │
//!                                           ├──► templates / sessions
//!                                           ├──► reconcile(template)
//!                                           │        ├──► spawn_instance()
//!                                           │        └──► reap newest (LIFO)
//!                                           │
//!     instance actors ──► exit notices ─────┤
//!                                           ├──► flapping verdicts
//!                                           └──► drain / shutdown
//! ```
//!
//! ## Rules
//! - Convergence is level-triggered: every mutation and every exit
//!   notice re-runs `reconcile` for the affected template; repeated
//!   mutations coalesce.
//! - `running(T) <= desired(T)` at all times; spawning only closes the
//!   gap upward, reaping only downward, newest instance first.
//! - Batch activation starts templates in ascending priority order,
//!   stable by registration time; shutdown walks the reverse order.
//! - Internal pids increase monotonically and are never reused.
//! - Exit notices for instances terminated by an explicit request never
//!   feed the flapping detector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::Error;
use crate::events::{job_topic, Event, EventEmitter, EventKind, Topic};
use crate::jobs::{valid_name, FlappingVerdict, ProcessSpec, ProcessTemplate};
use crate::manager::commands::{Command, Reply};
use crate::manager::handle::ManagerHandle;
use crate::proc::{spawn_instance, ExitNotice, InstanceParams};
use crate::wire::{JobInfo, JobStats, ScaleOp};

/// The process supervision core.
pub struct Manager {
    cfg: ManagerConfig,
    emitter: EventEmitter,
    /// Templates by qualified name.
    templates: HashMap<String, ProcessTemplate>,
    /// Session id to template names, registration order.
    sessions: BTreeMap<String, Vec<String>>,
    /// Shared pid index; the loop is the only writer.
    instances: Arc<DashMap<u64, crate::proc::InstanceHandle>>,
    /// One-off pids to their owning template.
    oneoffs: HashMap<u64, String>,
    next_pid: u64,
    next_reg: u64,
    /// Batch activation has happened; loads spawn immediately.
    active: bool,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    shutdown: Option<ShutdownState>,
}

struct ShutdownState {
    replies: Vec<Reply<()>>,
    deadline: TokioInstant,
}

impl Manager {
    /// Creates a manager. Call [`Manager::handle`] for the API entry
    /// point, then drive [`Manager::run`] on the runtime.
    pub fn new(cfg: ManagerConfig) -> Self {
        let emitter = EventEmitter::new(cfg.subscription_queue);
        let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_queue);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            emitter,
            templates: HashMap::new(),
            sessions: BTreeMap::new(),
            instances: Arc::new(DashMap::new()),
            oneoffs: HashMap::new(),
            next_pid: 0,
            next_reg: 0,
            active: false,
            cmd_tx,
            cmd_rx,
            exit_tx,
            exit_rx,
            shutdown: None,
        }
    }

    /// Creates a manager and spawns its loop. Templates loaded before
    /// [`ManagerHandle::start_all`] register without spawning, so boot
    /// configs activate in priority order.
    pub fn spawn(cfg: ManagerConfig) -> (ManagerHandle, tokio::task::JoinHandle<()>) {
        let manager = Manager::new(cfg);
        let handle = manager.handle();
        let join = tokio::spawn(manager.run());
        (handle, join)
    }

    /// Returns a cloneable API handle.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            tx: self.cmd_tx.clone(),
            emitter: self.emitter.clone(),
            instances: Arc::clone(&self.instances),
        }
    }

    /// Runs the loop until shutdown completes.
    pub async fn run(mut self) {
        info!("manager loop started");
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd),
                Some(notice) = self.exit_rx.recv() => self.handle_exit(notice),
                _ = shutdown_deadline(&self.shutdown) => {
                    warn!("shutdown grace exceeded, leaving stragglers to their kill ladders");
                    break;
                }
                else => break,
            }
            if self.shutdown.is_some() && self.drained() {
                break;
            }
        }
        if let Some(state) = self.shutdown.take() {
            for reply in state.replies {
                let _ = reply.send(Ok(()));
            }
        }
        self.emitter.close();
        info!("manager loop stopped");
    }

    fn drained(&self) -> bool {
        self.instances.iter().all(|e| e.value().detach())
    }

    // ---------------------------
    // Command dispatch
    // ---------------------------

    fn handle_command(&mut self, cmd: Command) {
        if self.shutdown.is_some() {
            if let Command::Shutdown { reply } = cmd {
                if let Some(state) = &mut self.shutdown {
                    state.replies.push(reply);
                }
            } else {
                reject_closed(cmd);
            }
            return;
        }

        match cmd {
            Command::Load {
                session,
                spec,
                start,
                reply,
            } => {
                let _ = reply.send(self.load(&session, spec, start));
            }
            Command::Update { qname, spec, reply } => {
                let _ = reply.send(self.update(&qname, spec));
            }
            Command::Unload { qname, reply } => {
                let _ = reply.send(self.unload(&qname));
            }
            Command::Scale { qname, op, reply } => {
                let _ = reply.send(self.scale(&qname, op));
            }
            Command::StartJob { qname, reply } => {
                let _ = reply.send(self.start_job(&qname));
            }
            Command::StopJob { qname, reply } => {
                let _ = reply.send(self.stop_job(&qname));
            }
            Command::ReloadJob { qname, reply } => {
                let _ = reply.send(self.reload_job(&qname));
            }
            Command::StartAll { reply } => {
                self.start_all();
                let _ = reply.send(Ok(()));
            }
            Command::RestartAll { reply } => {
                self.restart_all();
                let _ = reply.send(Ok(()));
            }
            Command::SignalJob {
                qname,
                signum,
                reply,
            } => {
                let _ = reply.send(self.signal_job(&qname, signum));
            }
            Command::StopPid { pid, reply } => {
                let _ = reply.send(self.stop_pid(pid));
            }
            Command::Commit {
                qname,
                env,
                graceful,
                reply,
            } => {
                let _ = reply.send(self.commit(&qname, env, graceful));
            }
            Command::JobInfo { qname, reply } => {
                let _ = reply.send(self.job_info(&qname));
            }
            Command::JobStats { qname, reply } => self.job_stats(&qname, reply),
            Command::JobPids { qname, reply } => {
                let _ = reply.send(
                    self.template(&qname)
                        .map(|t| t.running().to_vec()),
                );
            }
            Command::JobState { qname, reply } => {
                let _ = reply.send(self.template(&qname).map(|t| t.active()));
            }
            Command::ListJobs { reply } => {
                let jobs = self
                    .sessions
                    .iter()
                    .flat_map(|(sid, names)| {
                        names.iter().map(move |n| format!("{sid}.{n}"))
                    })
                    .collect();
                let _ = reply.send(Ok(jobs));
            }
            Command::ListSessions { reply } => {
                let _ = reply.send(Ok(self.sessions.keys().cloned().collect()));
            }
            Command::SessionJobs { session, reply } => {
                let result = self
                    .sessions
                    .get(&session)
                    .map(|names| {
                        names.iter().map(|n| format!("{session}.{n}")).collect()
                    })
                    .ok_or(Error::NotFound { name: session });
                let _ = reply.send(result);
            }
            Command::FlapRetry { qname } => self.flap_retry(&qname),
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    fn template(&self, qname: &str) -> Result<&ProcessTemplate, Error> {
        self.templates.get(qname).ok_or_else(|| Error::NotFound {
            name: qname.to_string(),
        })
    }

    fn template_mut(&mut self, qname: &str) -> Result<&mut ProcessTemplate, Error> {
        self.templates
            .get_mut(qname)
            .ok_or_else(|| Error::NotFound {
                name: qname.to_string(),
            })
    }

    // ---------------------------
    // Template lifecycle
    // ---------------------------

    fn load(&mut self, session: &str, spec: ProcessSpec, start: bool) -> Result<String, Error> {
        spec.validate()?;
        if !valid_name(session) {
            return Err(Error::InvalidSpec {
                field: "session",
                reason: format!("'{session}' must match [A-Za-z0-9_-]+"),
            });
        }

        let qname = format!("{}.{}", session, spec.name);
        if self.templates.contains_key(&qname) {
            return Err(Error::AlreadyExists { name: qname });
        }

        let reg = self.next_reg;
        self.next_reg += 1;
        let template = ProcessTemplate::new(session, spec, reg);
        self.sessions
            .entry(session.to_string())
            .or_default()
            .push(template.name().to_string());
        self.templates.insert(qname.clone(), template);

        info!(%qname, "template loaded");
        self.publish(Topic::new("create"), Event::now(EventKind::Create).with_name(&qname));

        if start && self.active {
            self.activate(&qname);
        }
        Ok(qname)
    }

    fn update(&mut self, qname: &str, spec: ProcessSpec) -> Result<(), Error> {
        spec.validate()?;
        let t = self.template_mut(qname)?;
        if t.name() != spec.name {
            return Err(Error::InvalidSpec {
                field: "name",
                reason: "update cannot rename a template".into(),
            });
        }

        let material = t.spec().material_change(&spec);
        t.replace_spec(spec);
        self.publish(Topic::new("update"), Event::now(EventKind::Update).with_name(qname));

        if material {
            // Terminate old before spawning new: the instances keep
            // their slots until exit, which defers the replacements.
            let victims: Vec<u64> = self
                .templates
                .get(qname)
                .map(|t| t.running().to_vec())
                .unwrap_or_default();
            if let Some(t) = self.templates.get_mut(qname) {
                for pid in &victims {
                    t.mark_replacing(*pid);
                }
            }
            self.stop_instances(&victims);
        }
        self.reconcile(qname);
        Ok(())
    }

    fn unload(&mut self, qname: &str) -> Result<(), Error> {
        let t = self.template_mut(qname)?;
        if t.draining() {
            return Ok(());
        }
        t.set_draining();
        let name = t.name().to_string();
        let victims: Vec<u64> = t.running().to_vec();
        let oneoffs: Vec<u64> = t.oneoffs().collect();

        info!(%qname, "template unloading");
        self.publish(Topic::new("delete"), Event::now(EventKind::Delete).with_name(qname));
        self.publish(Topic::new("stop"), Event::now(EventKind::Stop).with_name(qname));
        self.publish(
            job_topic(&name, EventKind::Stop),
            Event::now(EventKind::Stop).with_name(qname),
        );

        self.stop_instances(&victims);
        self.stop_instances(&oneoffs);
        self.maybe_remove_drained(qname);
        Ok(())
    }

    fn scale(&mut self, qname: &str, op: ScaleOp) -> Result<u32, Error> {
        let t = self.template_mut(qname)?;
        let n = match op {
            ScaleOp::Delta(delta) => t.adjust_desired(delta),
            ScaleOp::Absolute(n) => t.set_desired(n),
        };
        self.publish(Topic::new("update"), Event::now(EventKind::Update).with_name(qname));
        self.reconcile(qname);
        Ok(n)
    }

    fn start_job(&mut self, qname: &str) -> Result<(), Error> {
        self.template(qname)?;
        self.activate(qname);
        Ok(())
    }

    /// Unstops a template, resets its desired count, and converges.
    fn activate(&mut self, qname: &str) {
        let Some(t) = self.templates.get_mut(qname) else {
            return;
        };
        let name = t.name().to_string();
        t.set_stopped(false);
        t.set_parked(false);
        t.reset_desired();

        self.publish(Topic::new("start"), Event::now(EventKind::Start).with_name(qname));
        self.publish(
            job_topic(&name, EventKind::Start),
            Event::now(EventKind::Start).with_name(qname),
        );
        self.reconcile(qname);
    }

    fn stop_job(&mut self, qname: &str) -> Result<(), Error> {
        let t = self.template_mut(qname)?;
        if t.stopped() {
            // Idempotent: no events for a second stop.
            return Ok(());
        }
        t.set_stopped(true);
        let name = t.name().to_string();
        let victims: Vec<u64> = t.running().to_vec();
        for pid in &victims {
            t.remove_running(*pid);
        }

        self.publish(Topic::new("stop"), Event::now(EventKind::Stop).with_name(qname));
        self.publish(
            job_topic(&name, EventKind::Stop),
            Event::now(EventKind::Stop).with_name(qname),
        );
        self.stop_instances(&victims);
        Ok(())
    }

    fn reload_job(&mut self, qname: &str) -> Result<(), Error> {
        let t = self.template_mut(qname)?;
        t.set_stopped(false);
        t.set_parked(false);
        t.reset_desired();
        let victims: Vec<u64> = t.running().to_vec();
        for pid in &victims {
            t.mark_replacing(*pid);
        }

        self.publish(
            Topic::new("restart"),
            Event::now(EventKind::Restart).with_name(qname),
        );
        // Old instances hold their slots until exit; replacements spawn
        // as the exits come in.
        self.stop_instances(&victims);
        self.reconcile(qname);
        Ok(())
    }

    fn start_all(&mut self) {
        self.active = true;
        let mut order: Vec<(i32, u64, String)> = self
            .templates
            .values()
            .map(|t| (t.priority(), t.reg_seq(), t.qname().to_string()))
            .collect();
        order.sort();
        for (_, _, qname) in order {
            self.activate(&qname);
        }
    }

    /// Rolls every template over to fresh instances, same order as
    /// batch activation. Hosted apps restart separately through the
    /// [`ApplicationHost`](crate::ApplicationHost).
    fn restart_all(&mut self) {
        let mut order: Vec<(i32, u64, String)> = self
            .templates
            .values()
            .filter(|t| !t.stopped() && !t.draining())
            .map(|t| (t.priority(), t.reg_seq(), t.qname().to_string()))
            .collect();
        order.sort();
        for (_, _, qname) in order {
            let _ = self.reload_job(&qname);
        }
    }

    fn signal_job(&mut self, qname: &str, signum: i32) -> Result<(), Error> {
        let t = self.template(qname)?;
        for pid in t.running() {
            if let Some(h) = self.instances.get(pid) {
                h.signal(signum);
            }
        }
        Ok(())
    }

    fn stop_pid(&mut self, pid: u64) -> Result<(), Error> {
        let handle = self
            .instances
            .get(&pid)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound {
                name: pid.to_string(),
            })?;
        let qname = handle.qname().to_string();
        let name = handle.name().to_string();

        if let Some(t) = self.templates.get_mut(&qname) {
            t.remove_running(pid);
        }
        self.publish(
            Topic::new("stop_pid"),
            Event::now(EventKind::StopPid).with_name(&qname).with_pid(pid),
        );
        self.publish(
            job_topic(&name, EventKind::StopPid),
            Event::now(EventKind::StopPid).with_name(&qname).with_pid(pid),
        );
        handle.stop(None);
        Ok(())
    }

    fn commit(
        &mut self,
        qname: &str,
        env: Option<HashMap<String, String>>,
        graceful: Option<std::time::Duration>,
    ) -> Result<u64, Error> {
        let t = self.template(qname)?;
        if t.parked() {
            // The command is crash-looping; refuse one-offs until the
            // retry window clears.
            return Err(Error::Flapping {
                name: qname.to_string(),
            });
        }
        let spec = Arc::clone(t.spec());
        let qname_owned = t.qname().to_string();

        let pid = self.alloc_pid();
        let handle = spawn_instance(
            InstanceParams {
                pid,
                qname: qname_owned.clone(),
                spec,
                extra_env: env,
                graceful_override: graceful,
                cfg: self.cfg.clone(),
            },
            self.emitter.clone(),
            self.exit_tx.clone(),
        );
        self.instances.insert(pid, handle);
        self.oneoffs.insert(pid, qname_owned.clone());
        if let Some(t) = self.templates.get_mut(&qname_owned) {
            t.push_oneoff(pid);
        }
        debug!(pid, qname = %qname_owned, "one-off committed");
        Ok(pid)
    }

    // ---------------------------
    // Read views
    // ---------------------------

    fn job_info(&self, qname: &str) -> Result<JobInfo, Error> {
        let t = self.template(qname)?;
        Ok(JobInfo {
            name: t.qname().to_string(),
            active: t.active(),
            running: t.running().len(),
            max_processes: t.desired(),
            processes: t.running().to_vec(),
            config: (**t.spec()).clone(),
        })
    }

    /// Sampling reads the whole process table; push it off the loop.
    fn job_stats(&self, qname: &str, reply: Reply<JobStats>) {
        let t = match self.template(qname) {
            Ok(t) => t,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let name = t.qname().to_string();
        let targets: Vec<(u64, u32)> = t
            .running()
            .iter()
            .filter_map(|pid| {
                self.instances
                    .get(pid)
                    .and_then(|h| h.os_pid().map(|os| (*pid, os)))
            })
            .collect();

        tokio::task::spawn_blocking(move || {
            let sampled = targets
                .into_iter()
                .map(|(pid, os_pid)| (pid, os_pid, crate::proc::stats::sample_once(os_pid)))
                .collect();
            let _ = reply.send(Ok(JobStats::aggregate(name, sampled)));
        });
    }

    // ---------------------------
    // Convergence
    // ---------------------------

    /// Level-triggered convergence for one template.
    fn reconcile(&mut self, qname: &str) {
        if self.shutdown.is_some() {
            return;
        }
        let (needed, name) = {
            let Some(t) = self.templates.get(qname) else {
                return;
            };
            if !t.may_spawn() {
                return;
            }
            (
                t.desired() as i64 - t.running().len() as i64,
                t.name().to_string(),
            )
        };

        if needed > 0 {
            for _ in 0..needed {
                self.spawn_one(qname);
            }
        } else if needed < 0 {
            for _ in 0..(-needed) {
                let Some(pid) = self
                    .templates
                    .get(qname)
                    .and_then(|t| t.newest_removable())
                else {
                    break;
                };
                let os_pid = self.instances.get(&pid).and_then(|h| h.os_pid());
                let ev = Event::now(EventKind::Reap)
                    .with_name(qname)
                    .with_pid(pid)
                    .with_os_pid(os_pid.unwrap_or(0));
                self.publish(Topic::new("reap"), ev.clone());
                self.publish(job_topic(&name, EventKind::Reap), ev);

                if let Some(t) = self.templates.get_mut(qname) {
                    t.remove_running(pid);
                }
                self.stop_instances(&[pid]);
            }
        }
    }

    fn spawn_one(&mut self, qname: &str) {
        let Some(t) = self.templates.get(qname) else {
            return;
        };
        let spec = Arc::clone(t.spec());
        let qname_owned = t.qname().to_string();
        let pid = self.alloc_pid();

        let handle = spawn_instance(
            InstanceParams {
                pid,
                qname: qname_owned,
                spec,
                extra_env: None,
                graceful_override: None,
                cfg: self.cfg.clone(),
            },
            self.emitter.clone(),
            self.exit_tx.clone(),
        );
        self.instances.insert(pid, handle);
        if let Some(t) = self.templates.get_mut(qname) {
            t.push_running(pid);
        }
    }

    fn alloc_pid(&mut self) -> u64 {
        self.next_pid += 1;
        self.next_pid
    }

    // ---------------------------
    // Exit handling
    // ---------------------------

    fn handle_exit(&mut self, notice: ExitNotice) {
        debug!(
            pid = notice.pid,
            qname = %notice.qname,
            exit_status = ?notice.exit_status,
            term_signal = ?notice.term_signal,
            reaped = notice.reaped.as_str(),
            expected = notice.expected,
            "exit notice"
        );
        let ExitNotice {
            pid,
            qname,
            expected,
            uptime,
            spawn_failed,
            ..
        } = notice;
        self.instances.remove(&pid);
        let was_oneoff = self.oneoffs.remove(&pid).is_some();

        let Some(t) = self.templates.get_mut(&qname) else {
            return;
        };
        t.remove_running(pid);
        t.remove_oneoff(pid);

        if t.draining() {
            self.maybe_remove_drained(&qname);
            return;
        }
        if was_oneoff || self.shutdown.is_some() || t.stopped() {
            // One-offs are never restarted; their exits carry no
            // supervision meaning.
            return;
        }

        if !expected || spawn_failed {
            match t.record_unexpected_exit(uptime, Instant::now()) {
                Some(FlappingVerdict::Retry { delay }) => {
                    warn!(%qname, ?delay, "flapping detected, deferring spawns");
                    t.set_parked(true);
                    let victims: Vec<u64> = t.running().to_vec();
                    for v in &victims {
                        t.remove_running(*v);
                    }
                    self.publish(
                        Topic::new("flap"),
                        Event::now(EventKind::Flap).with_name(&qname).with_delay(delay),
                    );
                    self.stop_instances(&victims);

                    let tx = self.cmd_tx.clone();
                    let qname = qname.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Command::FlapRetry { qname }).await;
                    });
                    return;
                }
                Some(FlappingVerdict::GiveUp) => {
                    warn!(%qname, "flapping retries exhausted, stopping template");
                    t.set_stopped(true);
                    let victims: Vec<u64> = t.running().to_vec();
                    for v in &victims {
                        t.remove_running(*v);
                    }
                    self.publish(
                        Topic::new("stopped_flapping"),
                        Event::now(EventKind::StoppedFlapping).with_name(&qname),
                    );
                    self.stop_instances(&victims);
                    return;
                }
                Some(FlappingVerdict::Ok) | None => {}
            }
        }

        self.reconcile(&qname);
    }

    /// Removes a draining template once its last instance is gone.
    fn maybe_remove_drained(&mut self, qname: &str) {
        let gone = !self
            .instances
            .iter()
            .any(|e| e.value().qname() == qname);
        if !gone {
            return;
        }
        if let Some(t) = self.templates.remove(qname) {
            if let Some(names) = self.sessions.get_mut(t.session()) {
                names.retain(|n| n != t.name());
                if names.is_empty() {
                    self.sessions.remove(t.session());
                }
            }
            info!(%qname, "template removed after drain");
        }
    }

    // ---------------------------
    // Flap retry / shutdown
    // ---------------------------

    fn flap_retry(&mut self, qname: &str) {
        let Some(t) = self.templates.get_mut(qname) else {
            return;
        };
        if !t.parked() {
            return;
        }
        t.set_parked(false);
        debug!(%qname, "flapping retry window elapsed, respawning");
        self.reconcile(qname);
    }

    fn begin_shutdown(&mut self, reply: Reply<()>) {
        info!("manager shutdown requested");
        let mut order: Vec<(i32, u64, String)> = self
            .templates
            .values()
            .map(|t| (t.priority(), t.reg_seq(), t.qname().to_string()))
            .collect();
        // Reverse of the startup order.
        order.sort();
        order.reverse();

        for (_, _, qname) in order {
            if let Some(t) = self.templates.get_mut(&qname) {
                t.set_stopped(true);
                let victims: Vec<u64> = t.running().to_vec();
                for pid in &victims {
                    t.remove_running(*pid);
                }
                self.stop_instances(&victims);
            }
        }
        // One-offs go too, except detached ones.
        let oneoffs: Vec<u64> = self.oneoffs.keys().copied().collect();
        self.stop_instances(&oneoffs);

        self.shutdown = Some(ShutdownState {
            replies: vec![reply],
            deadline: TokioInstant::now() + self.cfg.shutdown_grace,
        });
    }

    // ---------------------------
    // Helpers
    // ---------------------------

    fn publish(&self, topic: Topic, event: Event) {
        self.emitter.publish(topic, event);
    }

    /// Requests graceful termination of the given instances, skipping
    /// detached ones.
    fn stop_instances(&self, pids: &[u64]) {
        for pid in pids {
            if let Some(h) = self.instances.get(pid) {
                if !h.detach() {
                    h.stop(None);
                }
            }
        }
    }
}

async fn shutdown_deadline(state: &Option<ShutdownState>) {
    match state {
        Some(s) => tokio::time::sleep_until(s.deadline).await,
        None => std::future::pending().await,
    }
}

fn reject_closed(cmd: Command) {
    match cmd {
        Command::Load { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::Update { reply, .. } | Command::Unload { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::Scale { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::StartJob { reply, .. }
        | Command::StopJob { reply, .. }
        | Command::ReloadJob { reply, .. }
        | Command::StartAll { reply }
        | Command::RestartAll { reply }
        | Command::SignalJob { reply, .. }
        | Command::StopPid { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::Commit { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::JobInfo { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::JobStats { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::JobPids { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::ListJobs { reply } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::JobState { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::ListSessions { reply } | Command::SessionJobs { reply, .. } => {
            let _ = reply.send(Err(Error::ManagerClosed));
        }
        Command::FlapRetry { .. } => {}
        Command::Shutdown { .. } => {}
    }
}
