//! Publications: a connection's binding of a `pubuid` to a topic (spec.md §3).

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Publication {
    pub connection: Uuid,
    pub pubuid: i64,
    pub topic_id: u32,
}
