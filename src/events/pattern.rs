//! # Dot-path topics and subscription patterns.
//!
//! Topics are dot-separated paths (`proc.web.spawn`, `stream.3.out`).
//! A [`Pattern`] selects topics:
//! - a literal segment matches itself,
//! - an empty segment matches exactly one arbitrary segment
//!   (`proc..exit` matches `proc.web.exit` and `proc.db.exit`),
//! - the pattern `"."` matches every topic,
//! - a pattern matches any topic it is a prefix of, so subscribing to
//!   `proc.web` also receives `proc.web.spawn` and `proc.web.exit`.

use std::fmt;

/// An owned dot-path event topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Builds a topic from its string form.
    pub fn new(path: impl Into<String>) -> Self {
        Topic(path.into())
    }

    /// Returns the full dot-path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic::new(s)
    }
}

/// One pattern segment.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    /// Matches the segment literally.
    Literal(String),
    /// Empty pattern segment: matches exactly one arbitrary segment.
    Any,
}

/// A compiled subscription pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    match_all: bool,
}

impl Pattern {
    /// Compiles a pattern from its string form.
    ///
    /// A trailing dot is ignored (`"proc.web."` equals `"proc.web"`),
    /// matching the loose form accepted by the original wire protocol.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw == "." {
            return Pattern {
                raw,
                segments: Vec::new(),
                match_all: true,
            };
        }

        let trimmed = raw.strip_suffix('.').unwrap_or(&raw);
        let segments = trimmed
            .split('.')
            .map(|s| {
                if s.is_empty() {
                    Segment::Any
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();

        Pattern {
            raw,
            segments,
            match_all: false,
        }
    }

    /// Returns the original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if this pattern selects the given topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        if self.match_all {
            return true;
        }

        let mut topic_segs = topic.segments();
        for seg in &self.segments {
            let Some(t) = topic_segs.next() else {
                // Pattern is longer than the topic.
                return false;
            };
            match seg {
                Segment::Any => {}
                Segment::Literal(lit) => {
                    if lit != t {
                        return false;
                    }
                }
            }
        }
        // Remaining topic segments are fine: prefix subscription.
        true
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::new(s)
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        Pattern::new(pattern).matches(&Topic::new(topic))
    }

    #[test]
    fn literal_exact() {
        assert!(matches("exit", "exit"));
        assert!(!matches("exit", "spawn"));
        assert!(matches("proc.web.exit", "proc.web.exit"));
    }

    #[test]
    fn prefix_fanout() {
        assert!(matches("proc.web", "proc.web.exit"));
        assert!(matches("proc", "proc.web.exit"));
        assert!(!matches("proc.web.exit", "proc.web"));
    }

    #[test]
    fn single_segment_wildcard() {
        assert!(matches("proc..exit", "proc.web.exit"));
        assert!(matches("proc..exit", "proc.db.exit"));
        assert!(!matches("proc..exit", "proc.exit"));
        assert!(matches("stream..out", "stream.42.out"));
    }

    #[test]
    fn dot_matches_everything() {
        assert!(matches(".", "exit"));
        assert!(matches(".", "proc.web.spawn"));
        assert!(matches(".", "stats.7"));
    }

    #[test]
    fn trailing_dot_is_ignored() {
        assert!(matches("proc.web.", "proc.web.exit"));
        assert!(matches("proc.web.", "proc.web"));
    }

    #[test]
    fn wildcard_does_not_match_missing_segment() {
        assert!(!matches("stream..out", "stream.out"));
    }
}
