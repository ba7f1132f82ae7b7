//! Storage-agnostic CRDT root/map contracts and the collaboration config.
//!
//! The document mutates shared state only through these interfaces; the
//! backend owns all merge logic. Two implementations ship with the crate:
//! an in-memory no-op backend (collaboration disabled, benchmarking) and an
//! automerge-backed replicated backend. Which one a document uses is decided
//! once, at document construction, via `CollabConfig` - there is no global
//! mutable backend registration.

pub mod automerge;
pub mod memory;

pub use self::automerge::{AutomergeRoot, RemoteChanges};
pub use self::memory::MemoryRoot;

use std::rc::Rc;

use anyhow::Result;

use crate::event::SubscriberId;

/// Name of the root map holding element records (element id -> record).
pub const DOCUMENT_MAP: &str = "document";
/// Name of the root map holding layer records (layer id -> ordered ids).
pub const LAYERS_MAP: &str = "layers";
/// Name of the root map reserved for replicated presence channels.
pub const AWARENESS_MAP: &str = "awareness";

/// Whether a change was produced by this process or merged in from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Change notification fired by a map: which keys changed and where the
/// change came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent {
    pub map: String,
    pub keys: Vec<String>,
    pub origin: ChangeOrigin,
}

/// A shared, replicated string-keyed map of opaque byte records.
pub trait CrdtMap {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>>;

    fn subscribe(&self, callback: Box<dyn Fn(&MapEvent)>) -> SubscriberId;

    fn unsubscribe(&self, id: SubscriberId) -> bool;
}

/// The root of the shared state: a set of named maps, created lazily and
/// stable for the root's lifetime.
pub trait CrdtRoot {
    fn get_map(&self, name: &str) -> Rc<dyn CrdtMap>;
}

/// Explicit collaboration configuration passed to the document factory.
///
/// Tests and offline documents inject `CollabConfig::in_memory()`; a
/// collaborative document is built with `CollabConfig::replicated()`, whose
/// returned `AutomergeRoot` handle also feeds the sync connection.
#[derive(Clone)]
pub struct CollabConfig {
    root: Rc<dyn CrdtRoot>,
}

impl CollabConfig {
    /// Collaboration disabled: process-local maps, no replication.
    pub fn in_memory() -> Self {
        Self {
            root: MemoryRoot::shared(),
        }
    }

    /// Automerge-backed replication. The concrete root handle is returned
    /// alongside so the caller can wire persistence and sync.
    pub fn replicated() -> (Self, Rc<AutomergeRoot>) {
        let root = AutomergeRoot::shared();
        (
            Self {
                root: root.clone(),
            },
            root,
        )
    }

    /// Use a caller-provided root (custom backends, loaded documents).
    pub fn with_root(root: Rc<dyn CrdtRoot>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Rc<dyn CrdtRoot> {
        self.root.clone()
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}
