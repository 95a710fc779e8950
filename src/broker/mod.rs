//! The broker: topic table, connection registry, subscription matching, and
//! the periodic coalescing sweep (spec.md §4).
//!
//! Every operation locks one broker-wide `RwLock` covering the topic table
//! and the connection registry together, mirroring the single registry lock
//! the websocket service used for its connection map, generalized to also
//! cover NT4's publisher/subscriber bookkeeping. Each connection still gets
//! its own bounded outbound queue rather than sharing one broadcast channel,
//! because periodic/`all` coalescing policy is per (connection, topic,
//! subscription) and a single broadcast channel can't express that.

pub mod publication;
pub mod subscription;
pub mod topic;

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::codec::binary::{encode_timesync_response, encode_value_frame};
use crate::codec::control::{
    AnnounceParams, PropertiesParams, PublishParams, ServerControlMessage, SetPropertiesParams,
    SubscribeParams, UnannounceParams, UnpublishParams, UnsubscribeParams,
};
use crate::error::BrokerError;
use crate::value::{type_index_for_type_str, Value};

use publication::Publication;
use subscription::{Subscription, SubscriptionOptions};
use topic::{PublisherKey, TopicTable};

/// Outbound traffic destined for one connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Control(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<OutboundMessage>,
    /// "4.1" or "4.0", chosen during subprotocol negotiation.
    protocol_version: &'static str,
    connected_at: chrono::DateTime<chrono::Utc>,
    publications: HashMap<i64, Publication>,
    subscriptions: HashMap<i64, Subscription>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: TopicTable,
    connections: HashMap<Uuid, ConnectionEntry>,
}

/// Central NT4 broker shared by every connection handler.
pub struct Broker {
    state: RwLock<BrokerState>,
    start: Instant,
    queue_capacity: usize,
    /// Per (connection, topic, subuid) coalescing state, keyed by a flat
    /// tuple to avoid a nested map for an operation this hot.
    coalesce: RwLock<HashMap<(Uuid, u32, i64), CoalesceEntry>>,
}

#[derive(Debug, Clone)]
struct CoalesceEntry {
    /// Broker clock (`now_micros()`) at the last successful send, not the
    /// publisher-supplied value timestamp — the two run on unrelated epochs.
    last_sent_us: u64,
    period_us: u64,
    pending: Option<(u64, Value)>,
}

impl Broker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            start: Instant::now(),
            queue_capacity,
            coalesce: RwLock::new(HashMap::new()),
        }
    }

    /// Server clock: monotonic microseconds since the broker started
    /// (spec.md §4, time-sync semantics).
    pub fn now_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    #[instrument(skip(self), fields(connection = %id))]
    pub async fn register_connection(
        &self,
        protocol_version: &'static str,
    ) -> (Uuid, mpsc::Receiver<OutboundMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                sender: tx,
                protocol_version,
                connected_at: chrono::Utc::now(),
                publications: HashMap::new(),
                subscriptions: HashMap::new(),
            },
        );
        debug!(total = state.connections.len(), "connection registered");
        (id, rx)
    }

    /// Tears down a connection: releases its publications (announcing their
    /// removal to anyone still subscribed) and drops its subscriptions.
    #[instrument(skip(self))]
    pub async fn remove_connection(&self, id: Uuid) {
        let mut state = self.state.write().await;
        let Some(removed) = state.connections.remove(&id) else {
            return;
        };
        let session_seconds = (chrono::Utc::now() - removed.connected_at).num_seconds();
        debug!(session_seconds, "connection session ended");
        let names_before: HashMap<u32, String> = state
            .topics
            .iter()
            .map(|t| (t.id, t.name.clone()))
            .collect();
        let unpublished = state.topics.unpublish_connection(id);
        let mut failed = Vec::new();
        for (topic_id, topic_removed) in unpublished {
            if topic_removed {
                let name = names_before.get(&topic_id).cloned().unwrap_or_default();
                failed.extend(self.broadcast_unannounce_locked(&state, topic_id, &name));
            }
        }
        self.coalesce.write().await.retain(|(conn, _, _), _| *conn != id);
        debug!(remaining = state.connections.len(), "connection removed");
        drop(state);
        self.close_overflowing(failed).await;
    }

    #[instrument(skip(self, params), fields(connection = %conn, name = %params.name))]
    pub async fn handle_publish(
        &self,
        conn: Uuid,
        params: PublishParams,
    ) -> Result<(), BrokerError> {
        let type_index = type_index_for_type_str(&params.type_str).ok_or_else(|| {
            BrokerError::TypeMismatch {
                name: params.name.clone(),
                existing: String::new(),
                attempted: params.type_str.clone(),
            }
        })?;

        let mut state = self.state.write().await;
        let key = PublisherKey {
            connection: conn,
            pubuid: params.pubuid,
        };
        let (topic_id, is_new_topic, properties_changed) = state.topics.publish(
            &params.name,
            &params.type_str,
            type_index,
            params.properties.clone(),
            key,
        )?;

        if let Some(entry) = state.connections.get_mut(&conn) {
            entry.publications.insert(
                params.pubuid,
                Publication {
                    connection: conn,
                    pubuid: params.pubuid,
                    topic_id,
                },
            );
        }

        let properties = state
            .topics
            .get_by_id(topic_id)
            .map(|t| t.properties.clone())
            .unwrap_or_default();

        // Subscribers already know this topic once it exists; re-announcing on
        // every additional publisher would be redundant (spec.md §4.4: announce
        // only the first publisher, a `properties` message on later merges).
        let mut failed = Vec::new();
        if is_new_topic {
            let announce = ServerControlMessage::Announce(AnnounceParams {
                name: params.name.clone(),
                id: topic_id,
                type_str: params.type_str.clone(),
                properties,
                pubuid: Some(params.pubuid),
            });
            failed.extend(self.broadcast_to_matching_subscribers_locked(&state, &params.name, &[announce]));
        } else if properties_changed {
            let message = ServerControlMessage::Properties(PropertiesParams {
                name: params.name.clone(),
                ack: None,
                properties,
            });
            failed.extend(self.broadcast_to_matching_subscribers_locked(&state, &params.name, &[message]));
        }
        drop(state);
        self.close_overflowing(failed).await;
        Ok(())
    }

    #[instrument(skip(self, params), fields(connection = %conn))]
    pub async fn handle_unpublish(
        &self,
        conn: Uuid,
        params: UnpublishParams,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        let topic_id = state
            .connections
            .get_mut(&conn)
            .and_then(|entry| entry.publications.remove(&params.pubuid))
            .map(|p| p.topic_id)
            .ok_or(BrokerError::UnknownPubuid(params.pubuid))?;

        let key = PublisherKey {
            connection: conn,
            pubuid: params.pubuid,
        };
        let name_before = state
            .topics
            .get_by_id(topic_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        let mut failed = Vec::new();
        if let Some((id, removed)) = state.topics.unpublish(key, topic_id) {
            if removed {
                failed = self.broadcast_unannounce_locked(&state, id, &name_before);
            }
        }
        drop(state);
        self.close_overflowing(failed).await;
        Ok(())
    }

    #[instrument(skip(self, params), fields(connection = %conn))]
    pub async fn handle_subscribe(&self, conn: Uuid, params: SubscribeParams) {
        let options: SubscriptionOptions = params.options.clone().into();
        let subscription = Subscription {
            connection: conn,
            subuid: params.subuid,
            patterns: params.topics.clone(),
            options,
        };

        let mut state = self.state.write().await;
        let matching: Vec<(String, u32, Option<(u64, Value)>)> = state
            .topics
            .iter()
            .filter(|t| subscription.matches(&t.name))
            .map(|t| (t.name.clone(), t.id, t.retained.clone()))
            .collect();

        if let Some(entry) = state.connections.get_mut(&conn) {
            entry.subscriptions.insert(params.subuid, subscription.clone());
        }

        let mut overflowed = false;
        for (name, id, retained) in matching {
            let topic = state.topics.get_by_id(id);
            let announce = ServerControlMessage::Announce(AnnounceParams {
                name,
                id,
                type_str: topic.map(|t| t.type_str.clone()).unwrap_or_default(),
                properties: topic.map(|t| t.properties.clone()).unwrap_or_default(),
                pubuid: None,
            });
            if !self.send_to_locked(&state, conn, OutboundMessage::Control(
                crate::codec::control::encode_control_batch(&[announce]),
            )) {
                overflowed = true;
                break;
            }

            if !params.options.topicsonly {
                if let Some((timestamp_us, value)) = retained {
                    let frame = encode_value_frame(id, timestamp_us, &value);
                    self.send_to_locked(&state, conn, OutboundMessage::Binary(frame));
                }
            }
        }
        drop(state);
        if overflowed {
            self.close_overflowing(vec![conn]).await;
        }
    }

    #[instrument(skip(self, params), fields(connection = %conn))]
    pub async fn handle_unsubscribe(&self, conn: Uuid, params: UnsubscribeParams) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.connections.get_mut(&conn) {
            entry.subscriptions.remove(&params.subuid);
        }
        self.coalesce
            .write()
            .await
            .retain(|(c, _, sub), _| !(*c == conn && *sub == params.subuid));
    }

    #[instrument(skip(self, params), fields(connection = %conn, name = %params.name))]
    pub async fn handle_setproperties(
        &self,
        conn: Uuid,
        params: SetPropertiesParams,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        let topic_id = state.topics.set_properties(&params.name, params.update.clone())?;
        let properties = state
            .topics
            .get_by_id(topic_id)
            .map(|t| t.properties.clone())
            .unwrap_or_default();
        let message = ServerControlMessage::Properties(PropertiesParams {
            name: params.name.clone(),
            ack: None,
            properties,
        });
        let failed = self.broadcast_to_matching_subscribers_locked(&state, &params.name, &[message]);
        drop(state);
        self.close_overflowing(failed).await;
        Ok(())
    }

    /// Accepts a value frame from a publisher, validating topic ownership
    /// and declared type, then fans it out per subscriber coalescing policy.
    #[instrument(skip(self, payload), fields(connection = %conn, topic_id))]
    pub async fn handle_value(
        &self,
        conn: Uuid,
        topic_id: u32,
        timestamp_us: u64,
        type_index: u8,
        payload: &rmpv::Value,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;

        let owns = state
            .connections
            .get(&conn)
            .map(|entry| entry.publications.values().any(|p| p.topic_id == topic_id))
            .unwrap_or(false);
        if !owns {
            return Err(BrokerError::UnauthorizedValue(topic_id));
        }

        let expected_index = state
            .topics
            .get_by_id(topic_id)
            .map(|t| t.type_index)
            .ok_or(BrokerError::UnauthorizedValue(topic_id))?;
        if expected_index != type_index {
            warn!(topic_id, expected_index, type_index, "dropping type-mismatched value");
            return Ok(());
        }

        let value = match Value::from_msgpack(type_index, payload) {
            Some(v) => v,
            None => {
                warn!(topic_id, type_index, "dropping undecodable value payload");
                return Ok(());
            }
        };

        if !state.topics.record_value(topic_id, timestamp_us, value.clone()) {
            trace!(topic_id, timestamp_us, "dropping out-of-order value frame");
            return Ok(());
        }

        let topic_name = state
            .topics
            .get_by_id(topic_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();

        let subscribers: Vec<(Uuid, i64, bool, u64)> = state
            .connections
            .iter()
            .flat_map(|(&cid, entry)| {
                entry
                    .subscriptions
                    .values()
                    .filter(|s| s.matches(&topic_name) && !s.options.topicsonly)
                    .filter(move |s| cid != conn || s.options.all)
                    .map(move |s| (cid, s.subuid, s.options.all, s.period_micros()))
                    .collect::<Vec<_>>()
            })
            .collect();
        drop(state);

        let now = self.now_micros();
        let state = self.state.read().await;
        let mut coalesce = self.coalesce.write().await;
        let mut overflowed = Vec::new();
        for (cid, subuid, all, period_us) in subscribers {
            let key = (cid, topic_id, subuid);
            let entry = coalesce.entry(key).or_insert(CoalesceEntry {
                last_sent_us: 0,
                period_us,
                pending: None,
            });
            entry.period_us = period_us;
            let elapsed = now.saturating_sub(entry.last_sent_us);
            if all || elapsed >= period_us {
                let frame = encode_value_frame(topic_id, timestamp_us, &value);
                if self.send_to_locked(&state, cid, OutboundMessage::Binary(frame)) {
                    entry.last_sent_us = now;
                    entry.pending = None;
                } else {
                    overflowed.push(cid);
                }
            } else {
                entry.pending = Some((timestamp_us, value.clone()));
            }
        }
        drop(coalesce);
        drop(state);
        self.close_overflowing(overflowed).await;
        Ok(())
    }

    #[instrument(skip(self), fields(connection = %conn))]
    pub async fn handle_timesync(
        &self,
        conn: Uuid,
        client_index: i64,
        seq: i64,
        client_time_us: i64,
    ) {
        let state = self.state.read().await;
        let server_time_us = self.now_micros();
        let frame = encode_timesync_response(client_index, seq, client_time_us, server_time_us);
        self.send_to_locked(&state, conn, OutboundMessage::Binary(frame));
    }

    /// Flushes any pending coalesced sample whose period has elapsed,
    /// walking topics in ascending id order (spec.md §4.4).
    #[instrument(skip(self))]
    pub async fn sweep_pending(&self) {
        let now = self.now_micros();
        let state = self.state.read().await;
        let mut coalesce = self.coalesce.write().await;

        let mut keys: Vec<(Uuid, u32, i64)> = coalesce.keys().copied().collect();
        keys.sort_by_key(|(_, topic_id, _)| *topic_id);

        let mut overflowed = Vec::new();
        for key in keys {
            let (cid, topic_id, _subuid) = key;
            let Some(entry) = coalesce.get_mut(&key) else {
                continue;
            };
            if now.saturating_sub(entry.last_sent_us) < entry.period_us {
                continue;
            }
            let Some((timestamp_us, value)) = entry.pending.take() else {
                continue;
            };
            let frame = encode_value_frame(topic_id, timestamp_us, &value);
            if self.send_to_locked(&state, cid, OutboundMessage::Binary(frame)) {
                entry.last_sent_us = now;
            } else {
                entry.pending = Some((timestamp_us, value));
                overflowed.push(cid);
            }
        }
        drop(coalesce);
        drop(state);
        self.close_overflowing(overflowed).await;
    }

    /// Spawns the background task that periodically calls `sweep_pending`.
    pub fn spawn_sweep_task(self: std::sync::Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.sweep_pending().await;
            }
        });
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.state.read().await.topics.iter().count()
    }

    /// Counts connections negotiated on each NT4 subprotocol version, for
    /// the `/stats` endpoint.
    pub async fn protocol_version_counts(&self) -> HashMap<&'static str, usize> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for entry in state.connections.values() {
            *counts.entry(entry.protocol_version).or_insert(0) += 1;
        }
        counts
    }

    /// Enqueues `message` on `conn`'s outbound queue. Returns `false` if the
    /// queue was full and nothing was sent; callers decide what a dropped
    /// send means for their message class (spec.md §5 backpressure rule).
    fn send_to_locked(&self, state: &BrokerState, conn: Uuid, message: OutboundMessage) -> bool {
        match state.connections.get(&conn) {
            Some(entry) => {
                let ok = entry.sender.try_send(message).is_ok();
                if !ok {
                    warn!(connection = %conn, "outbound queue full");
                }
                ok
            }
            None => false,
        }
    }

    /// Broadcasts control messages (announce/unannounce/properties) to every
    /// connection with a matching subscription. Control messages are never
    /// silently dropped: a connection whose queue can't take the message is
    /// returned so the caller can close it (spec.md §5, §7).
    fn broadcast_to_matching_subscribers_locked(
        &self,
        state: &BrokerState,
        topic_name: &str,
        messages: &[ServerControlMessage],
    ) -> Vec<Uuid> {
        let text = crate::codec::control::encode_control_batch(messages);
        let mut failed = Vec::new();
        for (cid, entry) in state.connections.iter() {
            if entry.subscriptions.values().any(|s| s.matches(topic_name))
                && !self.send_to_locked(state, *cid, OutboundMessage::Control(text.clone()))
            {
                failed.push(*cid);
            }
        }
        failed
    }

    fn broadcast_unannounce_locked(&self, state: &BrokerState, topic_id: u32, name: &str) -> Vec<Uuid> {
        let message = ServerControlMessage::Unannounce(UnannounceParams {
            name: name.to_owned(),
            id: Some(topic_id),
        });
        let text = crate::codec::control::encode_control_batch(&[message]);
        let targets: Vec<Uuid> = state
            .connections
            .iter()
            .filter(|(_, entry)| entry.subscriptions.values().any(|s| s.matches(name)))
            .map(|(cid, _)| *cid)
            .collect();
        let mut failed = Vec::new();
        for cid in targets {
            if !self.send_to_locked(state, cid, OutboundMessage::Control(text.clone())) {
                failed.push(cid);
            }
        }
        trace!(topic_id, "unannounce broadcast");
        failed
    }

    /// Closes connections whose outbound queue could not take a frame even
    /// after coalescing already dropped what it could (spec.md §5). Must be
    /// called after releasing any lock held by the caller.
    async fn close_overflowing(&self, failed: Vec<Uuid>) {
        for cid in failed {
            warn!(connection = %cid, "closing connection after outbound queue overflow");
            self.remove_connection(cid).await;
        }
    }
}
