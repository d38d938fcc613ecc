//! # ManagerHandle: the thread-safe public API.
//!
//! A cheap, cloneable handle external adapters call into from any
//! thread or task. Registry mutations travel to the manager loop as
//! commands with oneshot replies; instance-scoped operations (streams,
//! stdin, signals by pid) go through the shared pid index without a
//! loop round-trip, so a busy loop never delays an I/O path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::events::{
    job_stats_topic, stream_topic, EventEmitter, Pattern, SubscribeOptions, Subscription,
};
use crate::jobs::ProcessSpec;
use crate::manager::commands::Command;
use crate::proc::{stats, InstanceHandle, ProcStats};
use crate::wire::{InstanceInfo, JobInfo, JobStats, ScaleOp};

/// Cloneable entry point to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) emitter: EventEmitter,
    pub(crate) instances: Arc<DashMap<u64, InstanceHandle>>,
}

impl ManagerHandle {
    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::ManagerClosed)?;
        rx.await.map_err(|_| Error::ManagerClosed)?
    }

    // ---- template lifecycle ----

    /// Loads a template into a session. Returns the qualified name.
    pub async fn load(&self, session: &str, spec: ProcessSpec) -> Result<String, Error> {
        self.load_opts(session, spec, true).await
    }

    /// Loads a template, optionally without starting it (boot-config
    /// path; a later [`start_all`](Self::start_all) activates by
    /// priority).
    pub async fn load_opts(
        &self,
        session: &str,
        spec: ProcessSpec,
        start: bool,
    ) -> Result<String, Error> {
        let session = if session.is_empty() { "default" } else { session };
        self.send(|reply| Command::Load {
            session: session.to_string(),
            spec,
            start,
            reply,
        })
        .await
    }

    /// Replaces a template's spec. Material changes (command, args,
    /// env, identity, cwd, stream declarations) respawn all instances;
    /// replica-count trivia converge in place.
    pub async fn update(&self, qname: &str, spec: ProcessSpec) -> Result<(), Error> {
        self.send(|reply| Command::Update {
            qname: qname.to_string(),
            spec,
            reply,
        })
        .await
    }

    /// Drains and removes a template. The registry entry disappears
    /// after the last instance emits `exit`.
    pub async fn unload(&self, qname: &str) -> Result<(), Error> {
        self.send(|reply| Command::Unload {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Adjusts the desired replica count. Negative deltas terminate the
    /// most recently spawned instances first.
    pub async fn scale(&self, qname: &str, op: ScaleOp) -> Result<u32, Error> {
        self.send(|reply| Command::Scale {
            qname: qname.to_string(),
            op,
            reply,
        })
        .await
    }

    /// Activates a template.
    pub async fn start(&self, qname: &str) -> Result<(), Error> {
        self.send(|reply| Command::StartJob {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Stops a template. Idempotent: stopping a stopped template emits
    /// nothing.
    pub async fn stop(&self, qname: &str) -> Result<(), Error> {
        self.send(|reply| Command::StopJob {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Stops every instance, then starts fresh ones once the old have
    /// terminated.
    pub async fn reload(&self, qname: &str) -> Result<(), Error> {
        self.send(|reply| Command::ReloadJob {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Batch-activates all templates in ascending priority order,
    /// stable by registration time within a bucket.
    pub async fn start_all(&self) -> Result<(), Error> {
        self.send(|reply| Command::StartAll { reply }).await
    }

    /// Rolls every active template over to fresh instances, in batch
    /// activation order.
    pub async fn restart_all(&self) -> Result<(), Error> {
        self.send(|reply| Command::RestartAll { reply }).await
    }

    /// Gracefully drains everything (reverse priority order) and stops
    /// the manager loop.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.send(|reply| Command::Shutdown { reply }).await
    }

    // ---- signals ----

    /// Delivers a signal to all instances of a template.
    pub async fn signal_job(&self, qname: &str, signum: i32) -> Result<(), Error> {
        self.send(|reply| Command::SignalJob {
            qname: qname.to_string(),
            signum,
            reply,
        })
        .await
    }

    /// Delivers a signal to one instance. No-op once it terminated.
    pub fn signal_pid(&self, pid: u64, signum: i32) -> Result<(), Error> {
        let instance = self.instance(pid)?;
        instance.signal(signum);
        Ok(())
    }

    /// Stops one instance by pid.
    pub async fn stop_pid(&self, pid: u64) -> Result<(), Error> {
        self.send(|reply| Command::StopPid { pid, reply }).await
    }

    // ---- one-off spawns ----

    /// Spawns one unsupervised instance of a template's command with an
    /// optional environment overlay. Returns its internal pid; it is
    /// never restarted.
    pub async fn commit(
        &self,
        qname: &str,
        env: Option<HashMap<String, String>>,
        graceful: Option<Duration>,
    ) -> Result<u64, Error> {
        self.send(|reply| Command::Commit {
            qname: qname.to_string(),
            env,
            graceful,
            reply,
        })
        .await
    }

    // ---- read views ----

    /// Template plus running info.
    pub async fn info(&self, qname: &str) -> Result<JobInfo, Error> {
        self.send(|reply| Command::JobInfo {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Aggregate resource stats for a template.
    pub async fn stats(&self, qname: &str) -> Result<JobStats, Error> {
        self.send(|reply| Command::JobStats {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Internal pids of a template's instances, oldest first.
    pub async fn pids(&self, qname: &str) -> Result<Vec<u64>, Error> {
        self.send(|reply| Command::JobPids {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// Wire state: true when the template actively supervises.
    pub async fn job_state(&self, qname: &str) -> Result<bool, Error> {
        self.send(|reply| Command::JobState {
            qname: qname.to_string(),
            reply,
        })
        .await
    }

    /// All qualified job names.
    pub async fn jobs(&self) -> Result<Vec<String>, Error> {
        self.send(|reply| Command::ListJobs { reply }).await
    }

    /// All session ids.
    pub async fn sessions(&self) -> Result<Vec<String>, Error> {
        self.send(|reply| Command::ListSessions { reply }).await
    }

    /// Qualified job names under one session.
    pub async fn session_jobs(&self, session: &str) -> Result<Vec<String>, Error> {
        self.send(|reply| Command::SessionJobs {
            session: session.to_string(),
            reply,
        })
        .await
    }

    /// Internal pids of every live instance.
    pub fn all_pids(&self) -> Vec<u64> {
        let mut pids: Vec<u64> = self.instances.iter().map(|e| *e.key()).collect();
        pids.sort_unstable();
        pids
    }

    /// Handle to one live instance.
    pub fn instance(&self, pid: u64) -> Result<InstanceHandle, Error> {
        self.instances
            .get(&pid)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound {
                name: pid.to_string(),
            })
    }

    /// Read view of one instance.
    pub fn instance_info(&self, pid: u64) -> Result<InstanceInfo, Error> {
        let h = self.instance(pid)?;
        let state = h.state();
        Ok(InstanceInfo {
            pid: h.pid(),
            name: h.qname().to_string(),
            cmd: h.spec().cmd.clone(),
            args: h.spec().args.to_vec(),
            os_pid: h.os_pid(),
            create_time: h
                .created_at()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs()),
            active: state.alive(),
            state: state.as_str(),
        })
    }

    /// One-shot resource sample of an instance.
    pub async fn instance_stats(&self, pid: u64) -> Result<ProcStats, Error> {
        let h = self.instance(pid)?;
        let os_pid = h.os_pid().ok_or_else(|| Error::NotFound {
            name: pid.to_string(),
        })?;
        let sample = tokio::task::spawn_blocking(move || stats::sample_once(os_pid))
            .await
            .map_err(|_| Error::ManagerClosed)?;
        sample.ok_or_else(|| Error::NotFound {
            name: pid.to_string(),
        })
    }

    // ---- streams ----

    /// Writes to an instance's stdin, applying back-pressure by
    /// awaiting queue capacity.
    pub async fn write_stdin(&self, pid: u64, data: Vec<u8>) -> Result<(), Error> {
        let h = self.instance(pid)?;
        h.mux().write(data).await
    }

    /// Non-blocking stdin write; [`Error::WouldBlock`] when the queue
    /// is full.
    pub fn try_write_stdin(&self, pid: u64, data: Vec<u8>) -> Result<(), Error> {
        let h = self.instance(pid)?;
        h.mux().try_write(data)
    }

    /// Subscribes to one output stream of an instance.
    pub fn subscribe_stream(
        &self,
        pid: u64,
        label: &str,
        opts: SubscribeOptions,
    ) -> Result<Subscription, Error> {
        let h = self.instance(pid)?;
        if !h.mux().has_label(label) {
            return Err(Error::NotFound {
                name: label.to_string(),
            });
        }
        Ok(self
            .emitter
            .subscribe(Pattern::new(stream_topic(pid, label).as_str()), opts))
    }

    /// Recent-output backlog of one stream (opt-in replay for late
    /// subscribers).
    pub fn stream_backlog(&self, pid: u64, label: &str) -> Result<Vec<u8>, Error> {
        let h = self.instance(pid)?;
        h.mux().backlog(label)
    }

    // ---- event feeds ----

    /// Raw event subscription for watch feeds and plugins.
    pub fn subscribe(&self, pattern: Pattern, opts: SubscribeOptions) -> Subscription {
        self.emitter.subscribe(pattern, opts)
    }

    /// Subscribes to stat samples for all instances of a template.
    /// Sampling only runs while such a subscription is live.
    pub fn monitor(&self, qname: &str, opts: SubscribeOptions) -> Subscription {
        self.emitter
            .subscribe(Pattern::new(job_stats_topic(qname).as_str()), opts)
    }

    /// The underlying emitter, for embedding scenarios.
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }
}
