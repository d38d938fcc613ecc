//! # Declarative job specification.
//!
//! [`ProcessSpec`] is the wire-visible schema external adapters POST to
//! load a template. It describes how to launch a process: command,
//! arguments, environment, identity, stream declarations, replica count
//! and policies.
//!
//! ## Rules
//! - `name` is `[A-Za-z0-9_-]+`, unique within a session; the qualified
//!   form is `session.name`.
//! - `args` accepts a JSON array or a single string (whitespace-split).
//! - `uid`/`gid` accept numeric ids or account names.
//! - At most two `redirect_output` labels; repeating one label merges
//!   stderr into stdout.
//! - `$VAR` substitution applies to `cmd` and `args` against the
//!   resolved environment at spawn time, not at load time.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::jobs::flapping::FlappingPolicy;

/// Argument vector: a JSON array, or a single string split on
/// whitespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    List(Vec<String>),
    Line(String),
}

impl Default for ArgSpec {
    fn default() -> Self {
        ArgSpec::List(Vec::new())
    }
}

impl ArgSpec {
    /// Returns the argument vector form.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ArgSpec::List(v) => v.clone(),
            ArgSpec::Line(s) => s.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// True when no arguments were given.
    pub fn is_empty(&self) -> bool {
        match self {
            ArgSpec::List(v) => v.is_empty(),
            ArgSpec::Line(s) => s.trim().is_empty(),
        }
    }
}

/// A user or group id: numeric, or an account name resolved at spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdSpec {
    Num(u32),
    Name(String),
}

/// Declarative specification for a supervised job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Template name, unique within a session.
    pub name: String,
    /// Program to run.
    pub cmd: String,
    /// Argument vector.
    #[serde(default, skip_serializing_if = "ArgSpec::is_empty")]
    pub args: ArgSpec,
    /// Explicit environment overlay.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// User id to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdSpec>,
    /// Group id to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdSpec>,
    /// Working directory (defaults to the manager's).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Launch in a separate process group; not terminated at manager
    /// shutdown.
    #[serde(default)]
    pub detach: bool,
    /// Run the command through `sh -c`.
    #[serde(default)]
    pub shell: bool,
    /// Inherit the manager's OS environment under the explicit overlay.
    #[serde(default)]
    pub os_env: bool,
    /// Desired replica count.
    #[serde(default = "default_numprocesses")]
    pub numprocesses: u32,
    /// Start priority; lower starts earlier.
    #[serde(default)]
    pub priority: i32,
    /// Crash-rate policy, wire form `[attempts, window, retry_in,
    /// max_retry]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flapping: Option<FlappingPolicy>,
    /// Output labels, at most two (stdout then stderr). A repeated
    /// label merges stderr into stdout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_output: Vec<String>,
    /// Open a writable stdin pipe.
    #[serde(default)]
    pub redirect_input: bool,
    /// Graceful shutdown timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_timeout: Option<f64>,
    /// Extra labeled channels beyond stdio.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_streams: Vec<String>,
    /// Extra channel labels declared for external plumbing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_channels: Vec<String>,
}

fn default_numprocesses() -> u32 {
    1
}

impl ProcessSpec {
    /// Minimal spec with defaults, handy for tests and embedding.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: ArgSpec::default(),
            env: HashMap::new(),
            uid: None,
            gid: None,
            cwd: None,
            detach: false,
            shell: false,
            os_env: false,
            numprocesses: 1,
            priority: 0,
            flapping: None,
            redirect_output: Vec::new(),
            redirect_input: false,
            graceful_timeout: None,
            custom_streams: Vec::new(),
            custom_channels: Vec::new(),
        }
    }

    /// Validates the spec. Called on load and update.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || !self.name.chars().all(is_name_char) {
            return Err(Error::InvalidSpec {
                field: "name",
                reason: format!("'{}' must match [A-Za-z0-9_-]+", self.name),
            });
        }
        if self.cmd.trim().is_empty() {
            return Err(Error::InvalidSpec {
                field: "cmd",
                reason: "command must not be empty".into(),
            });
        }
        if self.redirect_output.len() > 2 {
            return Err(Error::InvalidSpec {
                field: "redirect_output",
                reason: format!(
                    "at most 2 labels, got {}",
                    self.redirect_output.len()
                ),
            });
        }
        for label in self.redirect_output.iter().chain(&self.custom_streams) {
            if label.is_empty() || !label.chars().all(is_name_char) {
                return Err(Error::InvalidSpec {
                    field: "redirect_output",
                    reason: format!("label '{label}' must match [A-Za-z0-9_-]+"),
                });
            }
        }
        for label in &self.custom_streams {
            if self.redirect_output.contains(label) {
                return Err(Error::InvalidSpec {
                    field: "custom_streams",
                    reason: format!("label '{label}' collides with redirect_output"),
                });
            }
        }
        if let Some(secs) = self.graceful_timeout {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::InvalidSpec {
                    field: "graceful_timeout",
                    reason: format!("{secs} must be >= 0"),
                });
            }
        }
        Ok(())
    }

    /// Graceful timeout as a duration, falling back to `default`.
    pub fn graceful_timeout_or(&self, default: Duration) -> Duration {
        match self.graceful_timeout {
            Some(secs) => Duration::from_secs_f64(secs),
            None => default,
        }
    }

    /// Effective stdout/stderr labels after applying the merge rule.
    ///
    /// Returns `(stdout_label, stderr_label, merged)`.
    pub fn output_labels(&self) -> (Option<&str>, Option<&str>, bool) {
        match self.redirect_output.as_slice() {
            [] => (None, None, false),
            [out] => (Some(out.as_str()), None, false),
            [out, err, ..] => {
                let merged = out == err;
                (Some(out.as_str()), Some(err.as_str()), merged)
            }
        }
    }

    /// Resolves the environment the child will see: the OS environment
    /// when `os_env` is set, overlaid by the explicit `env`, overlaid by
    /// `extra` (commit overrides).
    pub fn resolved_env(&self, extra: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if self.os_env {
            env.extend(std::env::vars());
        }
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(extra) = extra {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }

    /// Returns true when replacing `self` by `other` requires respawning
    /// existing instances. Replica count, priority, timeouts and the
    /// flapping policy converge in place.
    pub fn material_change(&self, other: &ProcessSpec) -> bool {
        self.cmd != other.cmd
            || self.args != other.args
            || self.env != other.env
            || self.uid != other.uid
            || self.gid != other.gid
            || self.cwd != other.cwd
            || self.detach != other.detach
            || self.shell != other.shell
            || self.os_env != other.os_env
            || self.redirect_output != other.redirect_output
            || self.redirect_input != other.redirect_input
            || self.custom_streams != other.custom_streams
            || self.custom_channels != other.custom_channels
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// True when the string is a valid template or session name.
pub(crate) fn valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_name_char)
}

/// Substitutes `$VAR` and `${VAR}` references against `env`.
///
/// Unknown variables expand to the empty string; `$$` escapes a literal
/// dollar sign.
pub fn substitute_env(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    if let Some(v) = env.get(&name) {
                        out.push_str(v);
                    }
                } else {
                    // Unterminated brace: keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(v) = env.get(&name) {
                    out.push_str(v);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}
