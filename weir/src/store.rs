// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Persistent per-client-id session state, owned by the dispatcher.

use codec::{PacketId, PublishPacket, QoS};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc::Sender;

use crate::commands::DispatcherToSessionCmd;
use crate::error::{Error, ErrorKind};
use crate::types::{CloseReason, SessionId};

/// Will message taken from a Connect packet, published on ungraceful close.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Acknowledgement state of one outbound QoS 1/2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// QoS 1, waiting for PublishAck.
    AwaitingPuback,

    /// QoS 2, waiting for PublishReceived.
    AwaitingPubrec,

    /// QoS 2, PublishRelease sent, waiting for PublishComplete.
    AwaitingPubcomp,
}

/// One outbound publish in the in-flight window.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet: PublishPacket,
    pub state: InflightState,
    pub queued_at: Instant,
}

/// Session state of one client id.
///
/// With `clean_session` unset the state survives reconnects; the connection
/// fields (`session_id`, `sender`) are attached and detached as connections
/// come and go.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_session: bool,
    session_id: Option<SessionId>,
    sender: Option<Sender<DispatcherToSessionCmd>>,
    will: Option<Will>,
    keep_alive: u16,

    /// Granted QoS per subscribed topic filter.
    pub subscriptions: HashMap<String, QoS>,

    /// Outbound QoS 1/2 window, ordered by packet id.
    pub outbound_inflight: BTreeMap<u16, InflightMessage>,

    /// Inbound QoS 2 publishes awaiting PublishRelease.
    pub inbound_inflight: HashSet<u16>,

    next_packet_id: u16,

    /// Publishes queued while no connection is attached.
    pub queued: VecDeque<PublishPacket>,

    /// Estimated bytes handed to the connection but not yet written.
    pub pending_out_bytes: usize,

    /// Packet ids recorded in the in-flight window whose delivery is paused
    /// by backpressure.
    pub blocked: VecDeque<u16>,
}

impl Session {
    fn new(client_id: &str, clean_session: bool) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean_session,
            session_id: None,
            sender: None,
            will: None,
            keep_alive: 0,
            subscriptions: HashMap::new(),
            outbound_inflight: BTreeMap::new(),
            inbound_inflight: HashSet::new(),
            next_packet_id: 1,
            queued: VecDeque::new(),
            pending_out_bytes: 0,
            blocked: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    #[must_use]
    pub const fn sender(&self) -> Option<&Sender<DispatcherToSessionCmd>> {
        self.sender.as_ref()
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Allocate the next free packet id for an outbound publish.
    ///
    /// Ids are handed out monotonically, wrap past 65535 and skip values
    /// still in the in-flight window.
    ///
    /// # Errors
    ///
    /// Returns error if all 65535 ids are awaiting acknowledgement.
    pub fn allocate_packet_id(&mut self) -> Result<PacketId, Error> {
        if self.outbound_inflight.len() >= usize::from(u16::MAX) {
            return Err(Error::from_string(
                ErrorKind::InflightExhausted,
                format!("No free packet id for client {}", self.client_id),
            ));
        }

        let mut id = self.next_packet_id;
        loop {
            if id == 0 {
                id = 1;
            }
            if !self.outbound_inflight.contains_key(&id) {
                break;
            }
            id = id.wrapping_add(1);
        }
        self.next_packet_id = id.wrapping_add(1);
        Ok(PacketId::new(id))
    }
}

/// What `SessionStore::detach` left behind for the dispatcher to act on.
#[derive(Debug)]
pub struct Detached {
    pub client_id: String,

    /// Will to publish, present only when the close reason fires it.
    pub will: Option<Will>,

    /// Topic filters of an erased clean session, to be removed from
    /// the subscription trie.
    pub removed_filters: Vec<String>,
}

/// Owns every session, keyed by client id, with an index from the ids of
/// currently attached connections.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ids: HashMap<SessionId, String>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    /// Resolve a connection id to its client id.
    #[must_use]
    pub fn client_id_of(&self, session_id: SessionId) -> Option<String> {
        self.ids.get(&session_id).cloned()
    }

    pub fn by_session_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        let client_id = self.ids.get(&session_id)?;
        self.sessions.get_mut(client_id)
    }

    /// Attach a connection to the session of `client_id`, creating the
    /// session if absent. Returns true if prior session state was present.
    ///
    /// The caller must have detached any previous connection and discarded
    /// prior state of a clean session first.
    pub fn attach(
        &mut self,
        client_id: &str,
        clean_session: bool,
        keep_alive: u16,
        will: Option<Will>,
        session_id: SessionId,
        sender: Sender<DispatcherToSessionCmd>,
    ) -> bool {
        let present = self.sessions.contains_key(client_id);
        let session = self
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| Session::new(client_id, clean_session));
        session.clean_session = clean_session;
        session.keep_alive = keep_alive;
        session.will = will;
        session.session_id = Some(session_id);
        session.sender = Some(sender);
        session.pending_out_bytes = 0;
        self.ids.insert(session_id, client_id.to_string());
        present
    }

    /// Detach the connection `session_id` from its session.
    ///
    /// A clean session is erased; a persistent one keeps subscriptions,
    /// in-flight window and offline queue. The session's will is dropped
    /// either way and returned when `reason` fires it.
    pub fn detach(&mut self, session_id: SessionId, reason: CloseReason) -> Option<Detached> {
        let client_id = self.ids.remove(&session_id)?;
        let session = self.sessions.get_mut(&client_id)?;

        session.session_id = None;
        session.sender = None;
        session.blocked.clear();
        session.pending_out_bytes = 0;
        let will = session.will.take();
        let will = if reason.fires_will() { will } else { None };

        let removed_filters = if session.clean_session {
            let session = self.sessions.remove(&client_id)?;
            session.subscriptions.into_keys().collect()
        } else {
            Vec::new()
        };

        Some(Detached {
            client_id,
            will,
            removed_filters,
        })
    }

    /// Erase session state of `client_id`, returning the removed session.
    ///
    /// Used when a connect with clean session discards prior state.
    pub fn remove(&mut self, client_id: &str) -> Option<Session> {
        let session = self.sessions.remove(client_id)?;
        if let Some(session_id) = session.session_id {
            self.ids.remove(&session_id);
        }
        Some(session)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of sessions, connected or persisted.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.sessions.len()
    }

    /// Client ids of connected sessions with paused deliveries.
    #[must_use]
    pub fn blocked_client_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|session| session.is_connected() && !session.blocked.is_empty())
            .map(|session| session.client_id.clone())
            .collect()
    }
}
