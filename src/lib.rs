//! Transactional document model and collaboration core for the Easel
//! diagram editor.
//!
//! The crate keeps a mutable, hierarchical diagram document consistent
//! under three pressures at once:
//!
//! - batched in-process mutations that must appear atomic to observers -
//!   every edit runs inside a [`uow::UnitOfWork`] that snapshots touched
//!   elements, diffs them on commit, and fires one notification per element;
//! - an undo/redo history that reverses exactly what was committed -
//!   [`undo::UndoManager`] over self-contained [`undo::UndoableAction`]s;
//! - optional real-time collaboration - a pluggable CRDT root/map
//!   abstraction ([`crdt`]) with an in-memory no-op backend and an
//!   automerge-backed replicated backend, plus ephemeral presence
//!   ([`awareness`]) and a background sync worker ([`sync`]).
//!
//! Rendering, geometry, and the shape catalog live outside this crate and
//! consume it through the mutation API on [`diagram::Diagram`] and the
//! change events it emits.

pub mod awareness;
pub mod crdt;
pub mod diagram;
pub mod element;
pub mod event;
pub mod layer;
pub mod sync;
pub mod undo;
pub mod uow;

pub use awareness::{
    Awareness, AwarenessEvent, ClientId, CursorState, PresenceBackend, PresenceMessage, UserState,
};
pub use crdt::{
    AutomergeRoot, ChangeOrigin, CollabConfig, CrdtMap, CrdtRoot, MapEvent, MemoryRoot,
    RemoteChanges,
};
pub use diagram::{Diagram, DiagramEvent, DiagramId, RemovedElement};
pub use element::{
    Bounds, Capability, Element, ElementId, ElementKind, ElementType, Point, Props,
};
pub use event::{EventChannel, SubscriberId};
pub use layer::{Layer, LayerId, LayerRecord};
pub use sync::{Connection, SyncCommand, SyncEvent};
pub use undo::{UndoManager, UndoableAction};
pub use uow::{CommitResult, ElementUpdate, FieldChange, UnitOfWork};
