//! Protocol messages exchanged over the reactor's single connection.

use crate::dataset::{Attributes, Dataset, EntityKey};
use crate::operation::Operation;
use crate::query::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_codec::{from_cbor, to_cbor, CodecResult, Value};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A message sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Session initialisation. Must be the first frame on a new transport.
    Join {
        /// Application id.
        app_id: String,
        /// Stable device id.
        device_id: String,
        /// Protocol version.
        protocol_version: u16,
        /// Credential token, if any.
        token: Option<String>,
    },
    /// Registers a query subscription.
    AddQuery {
        /// Content-addressed subscription id.
        subscription_id: SubscriptionId,
        /// Query shape.
        query: Value,
    },
    /// Unregisters a query subscription.
    RemoveQuery {
        /// Subscription id.
        subscription_id: SubscriptionId,
    },
    /// Submits a transaction.
    Transact {
        /// Local sequence number used to correlate the outcome.
        seq: u64,
        /// Operations, applied in order.
        operations: Vec<Operation>,
    },
    /// Heartbeat probe.
    Ping {
        /// Echoed back in the pong.
        nonce: u64,
    },
    /// Enters a room.
    JoinRoom {
        /// Room id.
        room_id: String,
    },
    /// Leaves a room.
    LeaveRoom {
        /// Room id.
        room_id: String,
    },
    /// Replaces this session's presence in a room.
    SetPresence {
        /// Room id.
        room_id: String,
        /// Full presence map of this session.
        data: Value,
    },
    /// Publishes a message to every peer subscribed to a topic.
    ClientBroadcast {
        /// Room id.
        room_id: String,
        /// Topic name.
        topic: String,
        /// Payload.
        data: Value,
    },
}

impl ClientMessage {
    /// Returns the wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::AddQuery { .. } => "add-query",
            ClientMessage::RemoveQuery { .. } => "remove-query",
            ClientMessage::Transact { .. } => "transact",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::SetPresence { .. } => "set-presence",
            ClientMessage::ClientBroadcast { .. } => "client-broadcast",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// One entity written by a delta patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpsert {
    /// Entity key.
    pub key: EntityKey,
    /// Full attribute set after the change.
    pub attrs: Attributes,
}

/// Payload of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PatchBody {
    /// Replaces the snapshot wholesale.
    Full {
        /// New snapshot contents.
        data: Dataset,
    },
    /// Applies changes on top of the current snapshot.
    Delta {
        /// Entities created or replaced.
        upserts: Vec<EntityUpsert>,
        /// Entities removed.
        deletes: Vec<EntityKey>,
    },
}

impl PatchBody {
    /// Returns true for a full snapshot.
    pub fn is_full(&self) -> bool {
        matches!(self, PatchBody::Full { .. })
    }
}

/// Error codes carried by server `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The credential was missing, invalid or expired.
    Unauthorized,
    /// The server could not parse a client frame.
    InvalidMessage,
    /// A query could not be evaluated.
    QueryFailed,
    /// The client is sending too fast.
    RateLimited,
    /// Unexpected server failure.
    Internal,
    /// A code this client does not know.
    #[serde(other)]
    Unknown,
}

/// Reason attached to a rejected transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectReason {
    /// Machine-readable code, e.g. `permission-denied`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RejectReason {
    /// Creates a reject reason.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A message sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The join was accepted.
    JoinOk {
        /// Server-assigned session id.
        session_id: String,
    },
    /// New data for a subscription.
    Patch {
        /// Subscription id.
        subscription_id: SubscriptionId,
        /// Monotonic snapshot version.
        version: u64,
        /// Snapshot or delta.
        body: PatchBody,
    },
    /// A transaction was committed.
    Ack {
        /// Local sequence number of the transaction.
        seq: u64,
    },
    /// A transaction was refused.
    Reject {
        /// Local sequence number of the transaction.
        seq: u64,
        /// Why it was refused.
        reason: RejectReason,
    },
    /// Credential rotation.
    Refresh {
        /// Replacement token.
        token: String,
    },
    /// Protocol-level failure.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Description.
        message: String,
        /// Subscription the error relates to, if any.
        subscription_id: Option<SubscriptionId>,
    },
    /// Heartbeat reply.
    Pong {
        /// Nonce from the matching ping.
        nonce: u64,
    },
    /// The room was joined.
    JoinRoomOk {
        /// Room id.
        room_id: String,
    },
    /// The room could not be joined.
    JoinRoomError {
        /// Room id.
        room_id: String,
        /// Description.
        message: String,
    },
    /// Presence of every session in a room, keyed by server session id.
    /// Includes the receiving session.
    RefreshPresence {
        /// Room id.
        room_id: String,
        /// Presence map per session.
        peers: BTreeMap<String, Value>,
    },
    /// A message published by a session in the room.
    ServerBroadcast {
        /// Room id.
        room_id: String,
        /// Topic name.
        topic: String,
        /// Server session id of the publisher.
        peer_id: String,
        /// Payload.
        data: Value,
    },
}

impl ServerMessage {
    /// Returns the wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::JoinOk { .. } => "join-ok",
            ServerMessage::Patch { .. } => "patch",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Reject { .. } => "reject",
            ServerMessage::Refresh { .. } => "refresh",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::JoinRoomOk { .. } => "join-room-ok",
            ServerMessage::JoinRoomError { .. } => "join-room-error",
            ServerMessage::RefreshPresence { .. } => "refresh-presence",
            ServerMessage::ServerBroadcast { .. } => "server-broadcast",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use serde_json::json;

    #[test]
    fn client_kinds_match_wire_tag() {
        let query = Query::parse(&Value::from(json!({"todos": {}}))).unwrap();
        let messages = vec![
            ClientMessage::Join {
                app_id: "app".into(),
                device_id: "dev".into(),
                protocol_version: PROTOCOL_VERSION,
                token: None,
            },
            ClientMessage::AddQuery {
                subscription_id: query.id().clone(),
                query: query.shape().clone(),
            },
            ClientMessage::RemoveQuery {
                subscription_id: query.id().clone(),
            },
            ClientMessage::Transact {
                seq: 7,
                operations: vec![Operation::delete("todos", "1")],
            },
            ClientMessage::Ping { nonce: 3 },
            ClientMessage::JoinRoom {
                room_id: "lobby".into(),
            },
            ClientMessage::LeaveRoom {
                room_id: "lobby".into(),
            },
            ClientMessage::SetPresence {
                room_id: "lobby".into(),
                data: Value::from(json!({"name": "ada"})),
            },
            ClientMessage::ClientBroadcast {
                room_id: "lobby".into(),
                topic: "emoji".into(),
                data: Value::from(json!({"char": "x"})),
            },
        ];

        for message in messages {
            let bytes = message.encode().unwrap();
            let raw: Value = tessera_codec::from_cbor(&bytes).unwrap();
            assert_eq!(raw.get("op").and_then(Value::as_text), Some(message.kind()));
            assert_eq!(ClientMessage::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn delta_patch_decodes() {
        let query = Query::parse(&Value::from(json!({"todos": {}}))).unwrap();
        let message = ServerMessage::Patch {
            subscription_id: query.id().clone(),
            version: 4,
            body: PatchBody::Delta {
                upserts: vec![EntityUpsert {
                    key: EntityKey::new("todos", "1"),
                    attrs: [("title".to_string(), Value::from("x"))].into(),
                }],
                deletes: vec![EntityKey::new("todos", "2")],
            },
        };
        let decoded = ServerMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "patch");
    }

    #[test]
    fn room_messages_use_kebab_case_tags() {
        let raw = Value::from(json!({
            "op": "refresh-presence",
            "room_id": "lobby",
            "peers": {"s1": {"name": "ada"}, "s2": {}}
        }));
        let bytes = tessera_codec::to_cbor(&raw).unwrap();
        match ServerMessage::decode(&bytes).unwrap() {
            ServerMessage::RefreshPresence { room_id, peers } => {
                assert_eq!(room_id, "lobby");
                assert_eq!(peers.len(), 2);
                assert_eq!(peers["s1"].get("name"), Some(&Value::from("ada")));
            }
            other => panic!("unexpected {other:?}"),
        }

        let broadcast = ServerMessage::ServerBroadcast {
            room_id: "lobby".into(),
            topic: "emoji".into(),
            peer_id: "s2".into(),
            data: Value::from("wave"),
        };
        let raw: Value = tessera_codec::from_cbor(&broadcast.encode().unwrap()).unwrap();
        assert_eq!(raw.get("op").and_then(Value::as_text), Some("server-broadcast"));
    }

    #[test]
    fn unknown_error_codes_still_decode() {
        let raw = Value::from(json!({
            "op": "error",
            "code": "brand-new-code",
            "message": "hm",
            "subscription_id": null
        }));
        let bytes = tessera_codec::to_cbor(&raw).unwrap();
        match ServerMessage::decode(&bytes).unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Unknown),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_a_decode_error() {
        let raw = Value::from(json!({"op": "teleport"}));
        let bytes = tessera_codec::to_cbor(&raw).unwrap();
        assert!(ServerMessage::decode(&bytes).is_err());
    }
}
