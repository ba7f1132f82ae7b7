//! Ephemeral presence shared among collaborators.
//!
//! Awareness state (who is connected, where their cursor is) is synced
//! separately from the document: it is never persisted, never part of the
//! undo history, and never flows through a unit of work. Local identity is
//! kept while disconnected and re-published whenever a backend is attached.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::element::{ElementId, Point};
use crate::event::EventChannel;

/// Staleness threshold - drop cursors not updated in 5 seconds
const STALE_THRESHOLD: Duration = Duration::from_secs(5);

/// Number of distinct cursor colors a UI can map `color_index` onto.
pub const PRESENCE_COLOR_COUNT: u8 = 8;

/// Ephemeral client identifier, minted per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable color slot for this client.
    pub fn color_index(&self) -> u8 {
        self.0.as_bytes()[0] % PRESENCE_COLOR_COUNT
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A collaborator's identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub name: String,
    pub color_index: u8,
}

impl UserState {
    pub fn new(name: impl Into<String>, color_index: u8) -> Self {
        Self {
            name: name.into(),
            color_index,
        }
    }
}

/// A collaborator's cursor record. Highest recency wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: Point,
    pub selected: Option<ElementId>,
    pub timestamp_ms: u64,
}

impl CursorState {
    pub fn new(position: Point, selected: Option<ElementId>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            position,
            selected,
            timestamp_ms,
        }
    }
}

/// Presence message types for the connection protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceMessage {
    User { client: ClientId, state: UserState },
    Cursor { client: ClientId, state: CursorState },
    /// Peer leaving gracefully.
    Leave { client: ClientId },
    /// Request all peers to send their presence (on connect).
    RequestAll,
}

/// Connection-specific channel presence updates are published through.
pub trait PresenceBackend {
    fn publish_user(&self, client: ClientId, state: &UserState) -> Result<()>;

    fn publish_cursor(&self, client: ClientId, state: &CursorState) -> Result<()>;

    /// Release the channel's resources; called before a new backend is
    /// attached and on detach.
    fn close(&self);
}

/// Change notification for presence observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AwarenessEvent {
    Updated { client: ClientId },
    Removed { client: ClientId },
}

/// Manages local and remote presence state for one document.
pub struct Awareness {
    local_client: ClientId,
    local_user: Option<UserState>,
    backend: Option<Box<dyn PresenceBackend>>,
    users: HashMap<ClientId, UserState>,
    cursors: HashMap<ClientId, (CursorState, Instant)>,
    events: EventChannel<AwarenessEvent>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::with_client(ClientId::new())
    }

    pub fn with_client(local_client: ClientId) -> Self {
        Self {
            local_client,
            local_user: None,
            backend: None,
            users: HashMap::new(),
            cursors: HashMap::new(),
            events: EventChannel::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.local_client
    }

    pub fn events(&self) -> &EventChannel<AwarenessEvent> {
        &self.events
    }

    /// Attach a connection-specific backend, detaching (and closing) any
    /// previous one first. The last known local identity is re-published so
    /// reconnects never lose it; remote state from the old connection is
    /// dropped.
    pub fn set_backend(&mut self, backend: Option<Box<dyn PresenceBackend>>) -> Result<()> {
        if let Some(old) = self.backend.take() {
            old.close();
        }
        self.users.clear();
        self.cursors.clear();
        self.backend = backend;
        if let (Some(backend), Some(user)) = (&self.backend, &self.local_user) {
            backend.publish_user(self.local_client, user)?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Set the local identity. Held while disconnected and pushed to the
    /// backend on every (re)connect.
    pub fn update_user(&mut self, state: UserState) -> Result<()> {
        if let Some(backend) = &self.backend {
            backend.publish_user(self.local_client, &state)?;
        }
        self.local_user = Some(state);
        Ok(())
    }

    /// Publish the local cursor, fire-and-forget: nothing is queued while
    /// disconnected and publish failures are dropped.
    pub fn update_cursor(&mut self, state: CursorState) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.publish_cursor(self.local_client, &state) {
                trace!(error = %e, "dropped cursor update");
            }
        }
    }

    pub fn local_user(&self) -> Option<&UserState> {
        self.local_user.as_ref()
    }

    /// Ingest a remote presence message. The local client's own echoes are
    /// ignored.
    pub fn apply_remote(&mut self, message: PresenceMessage) {
        match message {
            PresenceMessage::User { client, state } => {
                if client == self.local_client {
                    return;
                }
                self.users.insert(client, state);
                self.events.emit(&AwarenessEvent::Updated { client });
            }
            PresenceMessage::Cursor { client, state } => {
                if client == self.local_client {
                    return;
                }
                // Highest recency wins; late packets lose.
                if let Some((existing, _)) = self.cursors.get(&client) {
                    if existing.timestamp_ms > state.timestamp_ms {
                        return;
                    }
                }
                self.cursors.insert(client, (state, Instant::now()));
                self.events.emit(&AwarenessEvent::Updated { client });
            }
            PresenceMessage::Leave { client } => self.remove_client(client),
            PresenceMessage::RequestAll => {}
        }
    }

    /// Drop a disconnected peer's state.
    pub fn remove_client(&mut self, client: ClientId) {
        let known = self.users.remove(&client).is_some();
        let had_cursor = self.cursors.remove(&client).is_some();
        if known || had_cursor {
            self.events.emit(&AwarenessEvent::Removed { client });
        }
    }

    /// Latest known remote identities.
    pub fn user_states(&self) -> Vec<(ClientId, UserState)> {
        let mut states: Vec<_> = self
            .users
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        states.sort_by_key(|(id, _)| id.0);
        states
    }

    /// Latest known remote cursors. Never contains the local client.
    pub fn cursor_states(&self) -> Vec<(ClientId, CursorState)> {
        let mut states: Vec<_> = self
            .cursors
            .iter()
            .map(|(id, (s, _))| (*id, s.clone()))
            .collect();
        states.sort_by_key(|(id, _)| id.0);
        states
    }

    /// Remove cursors that have not been updated recently.
    pub fn prune_stale(&mut self) {
        self.prune_older_than(STALE_THRESHOLD);
    }

    pub fn prune_older_than(&mut self, threshold: Duration) {
        let now = Instant::now();
        let stale: Vec<ClientId> = self
            .cursors
            .iter()
            .filter(|(_, (_, seen))| now.duration_since(*seen) >= threshold)
            .map(|(id, _)| *id)
            .collect();
        for client in stale {
            self.cursors.remove(&client);
            self.events.emit(&AwarenessEvent::Removed { client });
        }
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingBackend {
        published: Rc<RefCell<Vec<PresenceMessage>>>,
        closed: Rc<Cell<bool>>,
    }

    impl PresenceBackend for RecordingBackend {
        fn publish_user(&self, client: ClientId, state: &UserState) -> Result<()> {
            self.published.borrow_mut().push(PresenceMessage::User {
                client,
                state: state.clone(),
            });
            Ok(())
        }

        fn publish_cursor(&self, client: ClientId, state: &CursorState) -> Result<()> {
            self.published.borrow_mut().push(PresenceMessage::Cursor {
                client,
                state: state.clone(),
            });
            Ok(())
        }

        fn close(&self) {
            self.closed.set(true);
        }
    }

    #[test]
    fn identity_is_republished_on_reconnect() {
        let mut awareness = Awareness::new();
        awareness
            .update_user(UserState::new("ada", 3))
            .unwrap();

        let backend = RecordingBackend::default();
        let published = backend.published.clone();
        awareness.set_backend(Some(Box::new(backend))).unwrap();

        let log = published.borrow();
        assert_eq!(log.len(), 1);
        assert!(matches!(&log[0], PresenceMessage::User { state, .. } if state.name == "ada"));
    }

    #[test]
    fn swapping_backends_closes_the_previous_one() {
        let mut awareness = Awareness::new();
        let first = RecordingBackend::default();
        let closed = first.closed.clone();
        awareness.set_backend(Some(Box::new(first))).unwrap();

        let other = ClientId::new();
        awareness.apply_remote(PresenceMessage::User {
            client: other,
            state: UserState::new("bob", 1),
        });
        assert_eq!(awareness.user_states().len(), 1);

        awareness
            .set_backend(Some(Box::new(RecordingBackend::default())))
            .unwrap();
        assert!(closed.get());
        // Remote state belonged to the old connection.
        assert!(awareness.user_states().is_empty());
    }

    #[test]
    fn own_echoes_are_excluded_from_cursor_set() {
        let mut awareness = Awareness::new();
        let local = awareness.client_id();
        let remote = ClientId::new();

        awareness.apply_remote(PresenceMessage::Cursor {
            client: local,
            state: CursorState::new(Point::new(1.0, 1.0), None),
        });
        awareness.apply_remote(PresenceMessage::Cursor {
            client: remote,
            state: CursorState::new(Point::new(2.0, 2.0), None),
        });

        let cursors = awareness.cursor_states();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].0, remote);
    }

    #[test]
    fn stale_cursor_loses_to_newer_one() {
        let mut awareness = Awareness::new();
        let remote = ClientId::new();

        let mut newer = CursorState::new(Point::new(5.0, 5.0), None);
        newer.timestamp_ms = 2_000;
        let mut older = CursorState::new(Point::new(1.0, 1.0), None);
        older.timestamp_ms = 1_000;

        awareness.apply_remote(PresenceMessage::Cursor {
            client: remote,
            state: newer,
        });
        awareness.apply_remote(PresenceMessage::Cursor {
            client: remote,
            state: older,
        });

        assert_eq!(awareness.cursor_states()[0].1.position, Point::new(5.0, 5.0));
    }

    #[test]
    fn cursor_updates_are_not_queued_while_disconnected() {
        let mut awareness = Awareness::new();
        awareness.update_cursor(CursorState::new(Point::new(0.0, 0.0), None));

        let backend = RecordingBackend::default();
        let published = backend.published.clone();
        awareness.set_backend(Some(Box::new(backend))).unwrap();
        // Nothing replayed: only identity is re-sent, cursors are live-only.
        assert!(published.borrow().is_empty());
    }

    #[test]
    fn prune_drops_idle_cursors() {
        let mut awareness = Awareness::new();
        let remote = ClientId::new();
        awareness.apply_remote(PresenceMessage::Cursor {
            client: remote,
            state: CursorState::new(Point::new(0.0, 0.0), None),
        });
        assert_eq!(awareness.cursor_states().len(), 1);

        awareness.prune_older_than(Duration::ZERO);
        assert!(awareness.cursor_states().is_empty());
    }

    #[test]
    fn leave_removes_all_state() {
        let mut awareness = Awareness::new();
        let remote = ClientId::new();
        awareness.apply_remote(PresenceMessage::User {
            client: remote,
            state: UserState::new("bob", 0),
        });
        awareness.apply_remote(PresenceMessage::Cursor {
            client: remote,
            state: CursorState::new(Point::new(0.0, 0.0), None),
        });

        awareness.apply_remote(PresenceMessage::Leave { client: remote });
        assert!(awareness.user_states().is_empty());
        assert!(awareness.cursor_states().is_empty());
    }
}
