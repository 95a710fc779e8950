//! Subscriptions and topic-pattern matching (spec.md §4.3).

use uuid::Uuid;

use crate::codec::control::SubscriptionOptionsWire;

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub prefix: bool,
    pub all: bool,
    pub topicsonly: bool,
    pub periodic: f64,
}

impl From<SubscriptionOptionsWire> for SubscriptionOptions {
    fn from(wire: SubscriptionOptionsWire) -> Self {
        Self {
            prefix: wire.prefix,
            all: wire.all,
            topicsonly: wire.topicsonly,
            periodic: wire.periodic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub connection: Uuid,
    pub subuid: i64,
    pub patterns: Vec<String>,
    pub options: SubscriptionOptions,
}

impl Subscription {
    /// Whether `topic_name` is covered by this subscription's patterns.
    /// In prefix mode an empty pattern matches every topic (spec.md §4.3).
    pub fn matches(&self, topic_name: &str) -> bool {
        if self.options.prefix {
            self.patterns
                .iter()
                .any(|p| p.is_empty() || topic_name.starts_with(p.as_str()))
        } else {
            self.patterns.iter().any(|p| p == topic_name)
        }
    }

    pub fn period_micros(&self) -> u64 {
        (self.options.periodic.max(0.0) * 1_000_000.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(patterns: &[&str], prefix: bool) -> Subscription {
        Subscription {
            connection: Uuid::nil(),
            subuid: 1,
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            options: SubscriptionOptions {
                prefix,
                all: false,
                topicsonly: false,
                periodic: 0.1,
            },
        }
    }

    #[test]
    fn exact_match_requires_equality() {
        let s = sub(&["/a/b"], false);
        assert!(s.matches("/a/b"));
        assert!(!s.matches("/a/b/c"));
    }

    #[test]
    fn prefix_match_covers_descendants() {
        let s = sub(&["/a"], true);
        assert!(s.matches("/a"));
        assert!(s.matches("/a/b"));
        assert!(!s.matches("/b"));
    }

    #[test]
    fn empty_prefix_matches_every_topic() {
        let s = sub(&[""], true);
        assert!(s.matches("/anything"));
        assert!(s.matches(""));
    }
}
