//! # Stable wire contracts for external adapters.
//!
//! The HTTP/websocket/CLI front-ends live outside this crate, but the
//! payloads they relay are part of the core's contract: response DTOs,
//! the scale operation grammar (`+N`, `-N`, `=N`), signal values by
//! name or number, and the event feed encodings.
//!
//! Nothing here performs I/O; adapters serialize these types as-is.

use serde::{Deserialize, Serialize, Serializer};

use crate::error::Error;
use crate::events::{Delivery, Event};
use crate::jobs::ProcessSpec;
use crate::proc::ProcStats;

/// Process exit codes for CLI adapters.
pub mod exit_codes {
    /// Success.
    pub const OK: i32 = 0;
    /// Generic error.
    pub const ERROR: i32 = 1;
    /// Usage error.
    pub const USAGE: i32 = 2;
    /// Could not reach the node.
    pub const CONNECT: i32 = 3;
    /// Conflict (duplicate template, HTTP 409).
    pub const CONFLICT: i32 = 4;
}

/// `{"ok": true}` acknowledgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OkReply {
    pub ok: bool,
}

impl OkReply {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// `GET /sessions` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsReply {
    pub sessions: Vec<String>,
}

/// `GET /jobs` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsReply {
    pub jobs: Vec<String>,
}

/// `GET /jobs/<sid>` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJobsReply {
    pub sessionid: String,
    pub jobs: Vec<String>,
}

/// `GET /jobs/<sid>/<name>/pids` and `GET /pids` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsReply {
    pub pids: Vec<u64>,
}

/// `POST .../commit` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommitReply {
    pub pid: u64,
}

/// `GET /jobs/<sid>/<name>` payload: template plus running info.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// Qualified name.
    pub name: String,
    /// True while the template actively supervises.
    pub active: bool,
    /// Live instance count.
    pub running: usize,
    /// Desired replica count.
    pub max_processes: u32,
    /// Internal pids of live instances.
    pub processes: Vec<u64>,
    /// The declarative spec.
    pub config: ProcessSpec,
}

/// One instance's slice of a stats aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatsEntry {
    pub pid: u64,
    pub os_pid: u32,
    #[serde(flatten)]
    pub stats: ProcStats,
}

/// `GET /jobs/<sid>/<name>/stats` payload.
///
/// Aggregates serialize as numbers, or the literal string `"N/A"` when
/// no instance could be sampled (the original wire behavior).
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub name: String,
    pub stats: Vec<InstanceStatsEntry>,
    #[serde(serialize_with = "na_or_num")]
    pub cpu: Option<f32>,
    #[serde(serialize_with = "na_or_num")]
    pub max_cpu: Option<f32>,
    #[serde(serialize_with = "na_or_num")]
    pub min_cpu: Option<f32>,
    #[serde(serialize_with = "na_or_num")]
    pub mem: Option<f32>,
    #[serde(serialize_with = "na_or_num")]
    pub max_mem: Option<f32>,
    #[serde(serialize_with = "na_or_num")]
    pub min_mem: Option<f32>,
}

impl JobStats {
    /// Builds the aggregate the way the wire always reported it: sums
    /// and extrema over instances, `N/A` as soon as any sample is
    /// missing.
    pub fn aggregate(name: impl Into<String>, entries: Vec<(u64, u32, Option<ProcStats>)>) -> Self {
        let complete = !entries.is_empty() && entries.iter().all(|(_, _, s)| s.is_some());
        let stats: Vec<InstanceStatsEntry> = entries
            .iter()
            .filter_map(|(pid, os_pid, s)| {
                s.map(|stats| InstanceStatsEntry {
                    pid: *pid,
                    os_pid: *os_pid,
                    stats,
                })
            })
            .collect();

        let fold = |f: fn(&ProcStats) -> f32| -> (Option<f32>, Option<f32>, Option<f32>) {
            if !complete {
                return (None, None, None);
            }
            let values: Vec<f32> = stats.iter().map(|e| f(&e.stats)).collect();
            let sum = values.iter().sum::<f32>();
            let max = values.iter().copied().fold(f32::MIN, f32::max);
            let min = values.iter().copied().fold(f32::MAX, f32::min);
            (Some(sum), Some(max), Some(min))
        };

        let (cpu, max_cpu, min_cpu) = fold(|s| s.cpu);
        let (mem, max_mem, min_mem) = fold(|s| s.mem);

        Self {
            name: name.into(),
            stats,
            cpu,
            max_cpu,
            min_cpu,
            mem,
            max_mem,
            min_mem,
        }
    }
}

/// `GET /<pid>` payload.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    /// Internal pid.
    pub pid: u64,
    /// Qualified template name.
    pub name: String,
    pub cmd: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_pid: Option<u32>,
    /// Creation time, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    /// True while the OS process may be alive.
    pub active: bool,
    /// Lifecycle state name.
    pub state: &'static str,
}

/// `GET/POST .../numprocesses` reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleReply {
    pub numprocesses: u32,
}

/// A scale value as it appears on the wire: an integer delta or an
/// op string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleValue {
    Num(i64),
    Op(String),
}

/// `POST .../numprocesses` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub scale: ScaleValue,
}

/// A parsed scale operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOp {
    /// Adjust the desired count by a signed delta.
    Delta(i64),
    /// Set the desired count.
    Absolute(u32),
}

impl ScaleOp {
    /// Parses the wire grammar: `+N` and `-N` are deltas, `=N` is
    /// absolute, bare digits and integers are positive deltas.
    pub fn parse(value: &ScaleValue) -> Result<Self, Error> {
        match value {
            ScaleValue::Num(n) => Ok(ScaleOp::Delta(*n)),
            ScaleValue::Op(s) => {
                let s = s.trim();
                let err = || Error::InvalidScaleOp {
                    value: s.to_string(),
                };
                if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                    return s.parse::<i64>().map(ScaleOp::Delta).map_err(|_| err());
                }
                let mut chars = s.chars();
                let op = chars.next().ok_or_else(err)?;
                let n: i64 = chars.as_str().parse().map_err(|_| err())?;
                match op {
                    '+' => Ok(ScaleOp::Delta(n)),
                    '-' => Ok(ScaleOp::Delta(-n)),
                    '=' => u32::try_from(n).map(ScaleOp::Absolute).map_err(|_| err()),
                    _ => Err(err()),
                }
            }
        }
    }
}

/// `GET .../state` reply: 0 stopped, 1 active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply(pub u8);

impl From<bool> for StateReply {
    fn from(active: bool) -> Self {
        StateReply(active as u8)
    }
}

/// `POST .../state` body: 0 stop, 1 start, 2 reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    Stop,
    Start,
    Reload,
}

impl TryFrom<u8> for StateCommand {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(StateCommand::Stop),
            1 => Ok(StateCommand::Start),
            2 => Ok(StateCommand::Reload),
            other => Err(Error::InvalidState {
                reason: format!("state command must be 0, 1 or 2, got {other}"),
            }),
        }
    }
}

/// A signal as it appears on the wire: a number, or a name with or
/// without the `SIG` prefix, case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Num(i32),
    Name(String),
}

/// `POST .../signal` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: SignalValue,
}

/// Resolves a wire signal value to a signal number.
pub fn parse_signal_value(value: &SignalValue) -> Result<i32, Error> {
    match value {
        SignalValue::Num(n) => {
            nix::sys::signal::Signal::try_from(*n).map_err(|_| Error::InvalidSignal {
                value: n.to_string(),
            })?;
            Ok(*n)
        }
        SignalValue::Name(name) => {
            let upper = name.trim().to_ascii_uppercase();
            let full = if upper.starts_with("SIG") {
                upper
            } else {
                format!("SIG{upper}")
            };
            full.parse::<nix::sys::signal::Signal>()
                .map(|s| s as i32)
                .map_err(|_| Error::InvalidSignal {
                    value: name.clone(),
                })
        }
    }
}

/// Encodes one delivery for `feed=eventsource`:
/// `event: <name>\ndata: <json>\n\n`.
pub fn encode_eventsource(delivery: &Delivery) -> String {
    let data = serde_json::to_string(delivery.event.as_ref()).unwrap_or_else(|_| "{}".into());
    format!("event: {}\ndata: {}\n\n", delivery.topic, data)
}

/// Encodes one event for `feed=continuous`: one JSON object per line.
/// `feed=longpoll` sends a single such line and closes; that is the
/// adapter's concern.
pub fn encode_continuous(event: &Event) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    line.push('\n');
    line
}

fn na_or_num<S: Serializer>(v: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(n) => s.serialize_f32(*n),
        None => s.serialize_str("N/A"),
    }
}
