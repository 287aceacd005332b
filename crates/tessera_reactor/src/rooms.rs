//! Rooms: presence and topic broadcast over the reactor's connection.
//!
//! A room is entered when its first presence or topic listener registers and
//! left when the last one goes. Rooms are kept in the order they were
//! entered; that order is the replay order after a reconnect.

use crate::listeners::{Callback, ListenerSet, Outbox};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessera_codec::Value;

/// Presence in a room as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    /// Room id.
    pub room_id: String,
    /// This session's published presence.
    pub user: Option<Value>,
    /// Presence of every other session, keyed by server session id.
    pub peers: BTreeMap<String, Value>,
    /// True until the server confirms the join on the current connection.
    pub is_loading: bool,
    /// Why the server refused the join, if it did.
    pub error: Option<String>,
}

/// A message published on a room topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    /// Room id.
    pub room_id: String,
    /// Topic name.
    pub topic: String,
    /// Server session id of the publisher.
    pub peer_id: String,
    /// Payload.
    pub data: Value,
    /// The publisher's presence, if known.
    pub peer: Option<Value>,
}

struct Room {
    id: String,
    joined: bool,
    error: Option<String>,
    user: Option<Value>,
    peers: BTreeMap<String, Value>,
    presence_listeners: ListenerSet<Presence>,
    topics: BTreeMap<String, ListenerSet<TopicMessage>>,
    last_delivered: Option<Presence>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            joined: false,
            error: None,
            user: None,
            peers: BTreeMap::new(),
            presence_listeners: ListenerSet::default(),
            topics: BTreeMap::new(),
            last_delivered: None,
        }
    }

    fn is_unused(&self) -> bool {
        self.presence_listeners.is_empty() && self.topics.is_empty()
    }

    fn presence(&self) -> Presence {
        Presence {
            room_id: self.id.clone(),
            user: self.user.clone(),
            peers: self.peers.clone(),
            is_loading: !self.joined && self.error.is_none(),
            error: self.error.clone(),
        }
    }

    /// Queues the presence for every listener if it differs from the last
    /// one delivered.
    fn publish(&mut self, outbox: &mut Outbox) {
        let presence = self.presence();
        if self.last_delivered.as_ref() == Some(&presence) {
            return;
        }
        let shared = Arc::new(presence.clone());
        self.presence_listeners.notify_all(&shared, outbox);
        self.last_delivered = Some(presence);
    }
}

/// Whether a room is still in use after a listener left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
    /// The room has no listeners left and was removed.
    Left,
    /// Other listeners keep the room.
    Stayed,
    /// The room or listener was not registered.
    NotFound,
}

/// Rooms with at least one listener, in the order they were entered.
#[derive(Default)]
pub(crate) struct RoomRegistry {
    rooms: Vec<Room>,
}

impl RoomRegistry {
    pub(crate) fn len(&self) -> usize {
        self.rooms.len()
    }

    fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.iter_mut().find(|r| r.id == room_id)
    }

    /// Returns the room, entering it first if needed. The flag is true if the
    /// room was just entered.
    fn enter(&mut self, room_id: &str) -> (&mut Room, bool) {
        match self.rooms.iter().position(|r| r.id == room_id) {
            Some(index) => (&mut self.rooms[index], false),
            None => {
                self.rooms.push(Room::new(room_id));
                let index = self.rooms.len() - 1;
                (&mut self.rooms[index], true)
            }
        }
    }

    fn leave_if_unused(&mut self, room_id: &str) -> Departure {
        match self.rooms.iter().position(|r| r.id == room_id) {
            Some(index) if self.rooms[index].is_unused() => {
                self.rooms.remove(index);
                Departure::Left
            }
            Some(_) => Departure::Stayed,
            None => Departure::NotFound,
        }
    }

    /// Registers a presence listener and queues the current presence for it.
    /// Returns the listener id, its active flag, and whether the room was
    /// just entered.
    pub(crate) fn add_presence_listener(
        &mut self,
        room_id: &str,
        callback: Callback<Presence>,
        outbox: &mut Outbox,
    ) -> (u64, Arc<AtomicBool>, bool) {
        let (room, entered) = self.enter(room_id);
        let (listener, active) = room.presence_listeners.add(callback);
        let current = room.presence();
        room.presence_listeners
            .notify_one(listener, &Arc::new(current.clone()), outbox);
        if room.last_delivered.is_none() {
            room.last_delivered = Some(current);
        }
        (listener, active, entered)
    }

    pub(crate) fn remove_presence_listener(&mut self, room_id: &str, listener: u64) -> Departure {
        let removed = self
            .get_mut(room_id)
            .is_some_and(|room| room.presence_listeners.remove(listener));
        if !removed {
            return Departure::NotFound;
        }
        self.leave_if_unused(room_id)
    }

    /// Registers a topic listener. Returns the listener id, its active flag,
    /// and whether the room was just entered.
    pub(crate) fn add_topic_listener(
        &mut self,
        room_id: &str,
        topic: &str,
        callback: Callback<TopicMessage>,
    ) -> (u64, Arc<AtomicBool>, bool) {
        let (room, entered) = self.enter(room_id);
        let (listener, active) = room
            .topics
            .entry(topic.to_string())
            .or_default()
            .add(callback);
        (listener, active, entered)
    }

    pub(crate) fn remove_topic_listener(
        &mut self,
        room_id: &str,
        topic: &str,
        listener: u64,
    ) -> Departure {
        let Some(room) = self.get_mut(room_id) else {
            return Departure::NotFound;
        };
        let Some(listeners) = room.topics.get_mut(topic) else {
            return Departure::NotFound;
        };
        if !listeners.remove(listener) {
            return Departure::NotFound;
        }
        if listeners.is_empty() {
            room.topics.remove(topic);
        }
        self.leave_if_unused(room_id)
    }

    /// Shallow-merges `data` into this session's presence. Returns the full
    /// presence to send, or `None` if the room has not been entered.
    pub(crate) fn set_user(
        &mut self,
        room_id: &str,
        data: &BTreeMap<String, Value>,
        outbox: &mut Outbox,
    ) -> Option<Value> {
        let room = self.get_mut(room_id)?;
        let mut merged = room
            .user
            .as_ref()
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        for (key, value) in data {
            merged.insert(key.clone(), value.clone());
        }
        let user = Value::Map(merged);
        room.user = Some(user.clone());
        room.publish(outbox);
        Some(user)
    }

    pub(crate) fn on_joined(&mut self, room_id: &str, outbox: &mut Outbox) -> bool {
        let Some(room) = self.get_mut(room_id) else {
            return false;
        };
        room.joined = true;
        room.error = None;
        room.publish(outbox);
        true
    }

    pub(crate) fn on_join_error(&mut self, room_id: &str, message: &str, outbox: &mut Outbox) -> bool {
        let Some(room) = self.get_mut(room_id) else {
            return false;
        };
        room.joined = false;
        room.error = Some(message.to_string());
        room.publish(outbox);
        true
    }

    /// Replaces the peer list. The entry for `own_session` is this client
    /// and is left out.
    pub(crate) fn on_presence(
        &mut self,
        room_id: &str,
        mut peers: BTreeMap<String, Value>,
        own_session: Option<&str>,
        outbox: &mut Outbox,
    ) -> bool {
        let Some(room) = self.get_mut(room_id) else {
            return false;
        };
        if let Some(own) = own_session {
            peers.remove(own);
        }
        room.peers = peers;
        room.publish(outbox);
        true
    }

    /// Queues a broadcast for the topic's listeners, attaching the
    /// publisher's presence. Returns false if nobody listens.
    pub(crate) fn on_broadcast(
        &self,
        room_id: &str,
        topic: &str,
        peer_id: &str,
        data: Value,
        own_session: Option<&str>,
        outbox: &mut Outbox,
    ) -> bool {
        let Some(room) = self.get(room_id) else {
            return false;
        };
        let Some(listeners) = room.topics.get(topic) else {
            return false;
        };
        let peer = if own_session == Some(peer_id) {
            room.user.clone()
        } else {
            room.peers.get(peer_id).cloned()
        };
        let message = Arc::new(TopicMessage {
            room_id: room_id.to_string(),
            topic: topic.to_string(),
            peer_id: peer_id.to_string(),
            data,
            peer,
        });
        listeners.notify_all(&message, outbox);
        true
    }

    /// Forgets every join confirmation. Rooms read as loading until the
    /// server confirms them again.
    pub(crate) fn mark_all_rejoining(&mut self, outbox: &mut Outbox) {
        for room in &mut self.rooms {
            room.joined = false;
            room.error = None;
            room.publish(outbox);
        }
    }

    /// Room ids with this session's presence, in the order they were
    /// entered.
    pub(crate) fn replay(&self) -> Vec<(String, Option<Value>)> {
        self.rooms
            .iter()
            .map(|room| (room.id.clone(), room.user.clone()))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        for room in &mut self.rooms {
            room.presence_listeners.clear();
            for listeners in room.topics.values_mut() {
                listeners.clear();
            }
        }
        self.rooms.clear();
    }
}
