//! Declarative job configuration and per-template runtime state.
//!
//! ## Contents
//! - [`ProcessSpec`] the wire-visible job schema and its validation
//! - [`FlappingPolicy`], [`FlappingWindow`] crash-rate detection
//! - [`ProcessTemplate`] manager-owned runtime state per template

mod flapping;
mod spec;
mod template;

pub use flapping::{FlappingPolicy, FlappingVerdict, FlappingWindow};
pub use spec::{substitute_env, ArgSpec, IdSpec, ProcessSpec};
pub use template::ProcessTemplate;

pub(crate) use spec::valid_name;

/// Splits a possibly-qualified job name into `(session, name)`.
///
/// Unqualified names resolve against the `default` session. A slash is
/// accepted as a separator for path-shaped callers.
pub fn split_qname(name: &str) -> (&str, &str) {
    if let Some((session, rest)) = name.split_once('.') {
        (session, rest)
    } else if let Some((session, rest)) = name.split_once('/') {
        (session, rest)
    } else {
        ("default", name)
    }
}
