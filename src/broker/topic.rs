//! Topic table: name/id bijection, publisher sets, and retained values
//! (spec.md §3, §4.2).

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::codec::control::Properties;
use crate::error::BrokerError;
use crate::value::Value;

/// Identifies one publisher of a topic: the connection that opened it and
/// the `pubuid` it chose for the publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublisherKey {
    pub connection: Uuid,
    pub pubuid: i64,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub id: u32,
    pub name: String,
    pub type_str: String,
    pub type_index: u8,
    pub properties: Properties,
    pub publishers: HashSet<PublisherKey>,
    pub retained: Option<(u64, Value)>,
}

impl Topic {
    /// A topic is `persistent` once its properties carry that flag set true.
    pub fn persistent(&self) -> bool {
        self.properties
            .get("persistent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Owns the name<->id bijection and every topic's metadata and retained
/// value. Topic ids start at 1; 0 and -1 are reserved (spec.md §3).
#[derive(Debug)]
pub struct TopicTable {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, Topic>,
    next_id: u32,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTable {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Topic> {
        self.by_id.get(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Topic> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.by_id.values()
    }

    /// Registers `publisher` against the named topic, creating it on first
    /// publish. A topic's type is fixed by its first publisher; a later
    /// publish with a different type is rejected, never silently coerced
    /// (spec.md §9 divergence from the reference implementation).
    ///
    /// Returns `(topic_id, is_new_topic, properties_changed)`. Callers use
    /// `is_new_topic` to gate the `announce` to first-publisher only and
    /// `properties_changed` to decide whether a `properties` control message
    /// is owed to existing subscribers (spec.md §4.4).
    pub fn publish(
        &mut self,
        name: &str,
        type_str: &str,
        type_index: u8,
        properties: Properties,
        publisher: PublisherKey,
    ) -> Result<(u32, bool, bool), BrokerError> {
        if let Some(&id) = self.by_name.get(name) {
            let topic = self.by_id.get_mut(&id).expect("by_name/by_id consistency");
            if topic.type_str != type_str {
                return Err(BrokerError::TypeMismatch {
                    name: name.to_owned(),
                    existing: topic.type_str.clone(),
                    attempted: type_str.to_owned(),
                });
            }
            topic.publishers.insert(publisher);
            let mut properties_changed = false;
            for (key, value) in properties {
                if topic.properties.get(&key) != Some(&value) {
                    properties_changed = true;
                }
                topic.properties.insert(key, value);
            }
            return Ok((id, false, properties_changed));
        }

        let id = self.next_id;
        self.next_id += 1;
        let mut publishers = HashSet::new();
        publishers.insert(publisher);
        self.by_id.insert(
            id,
            Topic {
                id,
                name: name.to_owned(),
                type_str: type_str.to_owned(),
                type_index,
                properties,
                publishers,
                retained: None,
            },
        );
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Removes `publisher` from its topic. Returns the topic id, and whether
    /// the topic itself was removed (no publishers left and not persistent).
    pub fn unpublish(&mut self, publisher: PublisherKey, topic_id: u32) -> Option<(u32, bool)> {
        let topic = self.by_id.get_mut(&topic_id)?;
        topic.publishers.remove(&publisher);
        if topic.publishers.is_empty() && !topic.persistent() {
            self.by_name.remove(&topic.name);
            self.by_id.remove(&topic_id);
            Some((topic_id, true))
        } else {
            Some((topic_id, false))
        }
    }

    /// Drops every publication held by `connection`, as on disconnect.
    /// Returns `(topic_id, removed)` for each topic that lost a publisher.
    pub fn unpublish_connection(&mut self, connection: Uuid) -> Vec<(u32, bool)> {
        let affected: Vec<u32> = self
            .by_id
            .values()
            .filter(|t| t.publishers.iter().any(|p| p.connection == connection))
            .map(|t| t.id)
            .collect();

        let mut results = Vec::new();
        for id in affected {
            let keys: Vec<PublisherKey> = self.by_id[&id]
                .publishers
                .iter()
                .filter(|p| p.connection == connection)
                .copied()
                .collect();
            let mut removed = false;
            for key in keys {
                if let Some((_, r)) = self.unpublish(key, id) {
                    removed = removed || r;
                }
            }
            results.push((id, removed));
        }
        results
    }

    pub fn set_properties(
        &mut self,
        name: &str,
        update: Properties,
    ) -> Result<u32, BrokerError> {
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| BrokerError::UnknownTopic(name.to_owned()))?;
        let topic = self.by_id.get_mut(&id).expect("by_name/by_id consistency");
        for (key, value) in update {
            if value.is_null() {
                topic.properties.remove(&key);
            } else {
                topic.properties.insert(key, value);
            }
        }
        Ok(id)
    }

    /// Updates the topic's retained value iff `timestamp_us` is strictly
    /// newer than the one currently retained (spec.md §4.2, §8 property 3:
    /// the retained timestamp is the maximum across all accepted frames).
    /// Returns whether the value was accepted; a stale (out-of-order) frame
    /// is rejected and the retained value is left untouched.
    pub fn record_value(&mut self, id: u32, timestamp_us: u64, value: Value) -> bool {
        let Some(topic) = self.by_id.get_mut(&id) else {
            return false;
        };
        let stale = matches!(topic.retained, Some((existing_ts, _)) if timestamp_us <= existing_ts);
        if stale {
            return false;
        }
        topic.retained = Some((timestamp_us, value));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> PublisherKey {
        PublisherKey {
            connection: Uuid::nil(),
            pubuid: n,
        }
    }

    #[test]
    fn default_table_also_starts_ids_at_one() {
        let mut table = TopicTable::default();
        let (id, is_new, _) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        assert_eq!(id, 1);
        assert!(is_new);
    }

    #[test]
    fn publish_assigns_sequential_ids_starting_at_one() {
        let mut table = TopicTable::new();
        let (a, _, _) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        let (b, _, _) = table
            .publish("/b", "double", 1, Properties::new(), key(2))
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn republishing_same_name_reuses_the_topic() {
        let mut table = TopicTable::new();
        let (a, a_is_new, _) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        let (b, b_is_new, _) = table
            .publish("/a", "double", 1, Properties::new(), key(2))
            .unwrap();
        assert_eq!(a, b);
        assert!(a_is_new);
        assert!(!b_is_new);
    }

    #[test]
    fn republish_with_new_properties_reports_a_change() {
        let mut table = TopicTable::new();
        table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        let mut props = Properties::new();
        props.insert("retained".into(), serde_json::Value::Bool(true));
        let (_, is_new, changed) = table
            .publish("/a", "double", 1, props.clone(), key(2))
            .unwrap();
        assert!(!is_new);
        assert!(changed);

        let (_, is_new, changed) = table
            .publish("/a", "double", 1, props, key(3))
            .unwrap();
        assert!(!is_new);
        assert!(!changed);
    }

    #[test]
    fn type_mismatch_on_republish_is_rejected() {
        let mut table = TopicTable::new();
        table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        let err = table
            .publish("/a", "string", 4, Properties::new(), key(2))
            .unwrap_err();
        assert!(matches!(err, BrokerError::TypeMismatch { .. }));
    }

    #[test]
    fn unpublish_removes_topic_once_publishers_are_empty() {
        let mut table = TopicTable::new();
        table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        let (id, removed) = table.unpublish(key(1), 1).unwrap();
        assert_eq!(id, 1);
        assert!(removed);
        assert!(table.get_by_id(1).is_none());
    }

    #[test]
    fn persistent_topic_survives_last_unpublish() {
        let mut table = TopicTable::new();
        let mut props = Properties::new();
        props.insert("persistent".into(), serde_json::Value::Bool(true));
        table.publish("/a", "double", 1, props, key(1)).unwrap();
        let (_, removed) = table.unpublish(key(1), 1).unwrap();
        assert!(!removed);
        assert!(table.get_by_id(1).is_some());
    }

    #[test]
    fn record_value_keeps_the_newest_timestamp() {
        let mut table = TopicTable::new();
        let (id, ..) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        assert!(table.record_value(id, 100, Value::Double(1.0)));
        assert!(table.record_value(id, 200, Value::Double(2.0)));
        assert_eq!(
            table.get_by_id(id).unwrap().retained,
            Some((200, Value::Double(2.0)))
        );
    }

    #[test]
    fn record_value_rejects_an_out_of_order_timestamp() {
        let mut table = TopicTable::new();
        let (id, ..) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        assert!(table.record_value(id, 200, Value::Double(2.0)));
        assert!(!table.record_value(id, 100, Value::Double(1.0)));
        assert_eq!(
            table.get_by_id(id).unwrap().retained,
            Some((200, Value::Double(2.0)))
        );
    }

    #[test]
    fn record_value_rejects_a_duplicate_timestamp() {
        let mut table = TopicTable::new();
        let (id, ..) = table
            .publish("/a", "double", 1, Properties::new(), key(1))
            .unwrap();
        assert!(table.record_value(id, 200, Value::Double(2.0)));
        assert!(!table.record_value(id, 200, Value::Double(99.0)));
        assert_eq!(
            table.get_by_id(id).unwrap().retained,
            Some((200, Value::Double(2.0)))
        );
    }
}
