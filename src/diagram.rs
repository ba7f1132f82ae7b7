//! The diagram document - THE source of truth for all model state.
//!
//! Every edit goes through this document inside a `UnitOfWork`. It owns:
//! - the element registry and the ordered layers
//! - the change event channel
//! - the CRDT root holding the replicated form of the model
//!
//! Remote peers mutate the same document shape through
//! `apply_remote_changes`, which re-applies merged map changes through the
//! identical unit-of-work path used for local edits.

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, ensure, Result};
use tracing::warn;
use uuid::Uuid;

use crate::crdt::{CollabConfig, CrdtRoot, RemoteChanges, DOCUMENT_MAP, LAYERS_MAP};
use crate::element::{
    builtin_types, Bounds, Capability, Element, ElementId, ElementKind, ElementType, Point, Props,
};
use crate::event::EventChannel;
use crate::layer::{Layer, LayerId, LayerRecord};
use crate::uow::{CommitResult, FieldChange, UnitOfWork};

/// Diagram identifier - UUID for global uniqueness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagramId(pub Uuid);

impl DiagramId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DiagramId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DiagramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change notifications observers receive from a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagramEvent {
    ElementAdded {
        id: ElementId,
    },
    /// Fired once per touched element on commit with the minimal diff, and
    /// with an empty diff for mid-scope `notify()` refreshes.
    ElementChanged {
        id: ElementId,
        fields: Vec<FieldChange>,
    },
    ElementRemoved {
        id: ElementId,
    },
    /// Document-level change marker, fired for scopes begun with
    /// `track_changes`.
    Changed,
}

/// Everything needed to reverse an element removal.
#[derive(Debug, Clone)]
pub struct RemovedElement {
    pub element: Element,
    pub layer: LayerId,
    /// Stacking position among the layer's roots; `None` if the element
    /// was a child at removal time.
    pub position: Option<usize>,
}

/// A diagram document.
pub struct Diagram {
    id: DiagramId,
    pub(crate) elements: HashMap<ElementId, Element>,
    pub(crate) layers: Vec<Layer>,
    types: HashMap<String, ElementType>,
    events: EventChannel<DiagramEvent>,
    root: Rc<dyn CrdtRoot>,
}

impl Diagram {
    /// Create a document against the configured collaboration backend,
    /// hydrating any state already present in the shared maps (joined
    /// session or loaded file).
    pub fn new(config: CollabConfig) -> Result<Self> {
        let mut diagram = Self {
            id: DiagramId::new(),
            elements: HashMap::new(),
            layers: Vec::new(),
            types: builtin_types()
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
            events: EventChannel::new(),
            root: config.root(),
        };
        diagram.hydrate()?;
        Ok(diagram)
    }

    pub fn id(&self) -> DiagramId {
        self.id
    }

    /// Open a unit of work for one logical operation.
    pub fn begin(&self, track_changes: bool) -> UnitOfWork {
        UnitOfWork::new(track_changes)
    }

    pub fn events(&self) -> &EventChannel<DiagramEvent> {
        &self.events
    }

    pub fn root(&self) -> Rc<dyn CrdtRoot> {
        self.root.clone()
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Declare a new element type. Capabilities are checked by lookup when
    /// the type is used, never by per-type dispatch.
    pub fn register_type(&mut self, ty: ElementType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn element_type(&self, name: &str) -> Option<&ElementType> {
        self.types.get(name)
    }

    // --- Layer operations ---

    pub fn add_layer(&mut self, layer: Layer, uow: &mut UnitOfWork) -> Result<LayerId> {
        let id = layer.id;
        ensure!(self.layer(id).is_none(), "duplicate layer id: {id}");
        ensure!(
            layer.elements.is_empty(),
            "new layers start empty; add elements through the document"
        );
        uow.register_layer(id, None);
        self.layers.push(layer);
        Ok(id)
    }

    pub fn remove_layer(&mut self, id: LayerId, uow: &mut UnitOfWork) -> Result<()> {
        let layer = self
            .layer(id)
            .ok_or_else(|| anyhow!("unknown layer: {id}"))?;
        ensure!(
            layer.elements.is_empty(),
            "layer {} still contains elements",
            layer.name
        );
        uow.register_layer(id, Some(layer));
        self.layers.retain(|l| l.id != id);
        Ok(())
    }

    /// Update layer settings (name, visibility, lock). Membership is managed
    /// by the element mutators and stays untouched here.
    pub fn update_layer(
        &mut self,
        id: LayerId,
        f: impl FnOnce(&mut Layer),
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let index = self
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| anyhow!("unknown layer: {id}"))?;
        uow.register_layer(id, Some(&self.layers[index]));
        let layer = &mut self.layers[index];
        let elements = layer.elements.clone();
        f(layer);
        layer.id = id;
        layer.elements = elements;
        Ok(())
    }

    // --- Element operations ---

    /// Add a detached element as a root of the given layer.
    pub fn add_element(
        &mut self,
        layer_id: LayerId,
        element: Element,
        uow: &mut UnitOfWork,
    ) -> Result<ElementId> {
        self.insert_element(layer_id, element, None, uow)
    }

    /// Add a detached element at a specific stacking position.
    pub fn insert_element(
        &mut self,
        layer_id: LayerId,
        mut element: Element,
        position: Option<usize>,
        uow: &mut UnitOfWork,
    ) -> Result<ElementId> {
        self.require_type(&element.type_name)?;
        let id = element.id;
        ensure!(!self.elements.contains_key(&id), "duplicate element id: {id}");
        ensure!(
            element.parent.is_none() && element.children.is_empty(),
            "elements are added detached; nest them with attach_child"
        );
        let index = self
            .layers
            .iter()
            .position(|l| l.id == layer_id)
            .ok_or_else(|| anyhow!("unknown layer: {layer_id}"))?;
        if let Some(pos) = position {
            ensure!(
                pos <= self.layers[index].elements.len(),
                "position {pos} out of bounds"
            );
        }

        uow.register_layer(layer_id, Some(&self.layers[index]));
        uow.register_element(id, None);

        element.layer = Some(layer_id);
        self.elements.insert(id, element);
        let layer = &mut self.layers[index];
        match position {
            Some(pos) => layer.elements.insert(pos, id),
            None => layer.elements.push(id),
        }
        Ok(id)
    }

    /// Remove an element, detaching it from its parent if nested. Children
    /// must be removed or detached first; cascades are expressed as
    /// compound actions by the caller.
    pub fn remove_element(
        &mut self,
        id: ElementId,
        uow: &mut UnitOfWork,
    ) -> Result<RemovedElement> {
        let el = self
            .elements
            .get(&id)
            .ok_or_else(|| anyhow!("unknown element: {id}"))?
            .clone();
        ensure!(
            el.children.is_empty(),
            "element {id} still has children; remove or detach them first"
        );
        let layer_id = el
            .layer
            .ok_or_else(|| anyhow!("element {id} is not attached to any layer"))?;

        uow.register_element(id, Some(&el));

        if let Some(parent_id) = el.parent {
            if let Some(parent) = self.elements.get(&parent_id) {
                uow.register_element(parent_id, Some(parent));
            }
            if let Some(parent) = self.elements.get_mut(&parent_id) {
                parent.children.retain(|c| *c != id);
            }
        }

        let mut position = None;
        if let Some(layer) = self.layer(layer_id) {
            uow.register_layer(layer_id, Some(layer));
            position = layer.position_of(id);
        }
        if let Some(layer) = self.layers.iter_mut().find(|l| l.id == layer_id) {
            layer.elements.retain(|e| *e != id);
        }

        self.elements.remove(&id);
        Ok(RemovedElement {
            element: el,
            layer: layer_id,
            position,
        })
    }

    /// Mutate an element in place. Identity and tree links are managed by
    /// the structural mutators and are preserved across the closure.
    pub fn update_element(
        &mut self,
        id: ElementId,
        f: impl FnOnce(&mut Element),
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let el = self.resolve(id)?;
        ensure!(
            el.is_attached(),
            "element {id} is not attached to any layer"
        );
        uow.register_element(id, Some(el));

        let el = self
            .elements
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown element: {id}"))?;
        let (parent, children, layer) = (el.parent, el.children.clone(), el.layer);
        f(el);
        el.id = id;
        el.parent = parent;
        el.children = children;
        el.layer = layer;
        Ok(())
    }

    /// Mutate the property bag of an element.
    pub fn update_props(
        &mut self,
        id: ElementId,
        f: impl FnOnce(&mut Props),
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        self.update_element(id, |el| f(&mut el.props), uow)
    }

    pub fn set_bounds(
        &mut self,
        id: ElementId,
        bounds: Bounds,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let el = self.resolve(id)?;
        let ty = self.require_type(&el.type_name)?;
        ensure!(
            ty.allows(Capability::Resize),
            "element type {} has no explicit bounds",
            ty.name
        );
        self.update_element(id, |el| el.bounds = Some(bounds), uow)
    }

    /// Nest `child` under `parent`. The child leaves the layer's root list;
    /// parent pointer and children list stay in agreement.
    pub fn attach_child(
        &mut self,
        parent_id: ElementId,
        child_id: ElementId,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        ensure!(parent_id != child_id, "cannot attach {parent_id} to itself");
        let parent = self.resolve(parent_id)?.clone();
        let child = self.resolve(child_id)?.clone();
        let ty = self.require_type(&parent.type_name)?;
        ensure!(
            ty.allows(Capability::Children),
            "element type {} cannot contain children",
            ty.name
        );
        ensure!(
            child.parent.is_none(),
            "element {child_id} already has a parent"
        );
        let layer_id = parent
            .layer
            .ok_or_else(|| anyhow!("element {parent_id} is not attached to any layer"))?;
        ensure!(
            child.layer == Some(layer_id),
            "parent and child must live on the same layer"
        );

        uow.register_element(parent_id, Some(&parent));
        uow.register_element(child_id, Some(&child));
        if let Some(layer) = self.layer(layer_id) {
            uow.register_layer(layer_id, Some(layer));
        }

        if let Some(p) = self.elements.get_mut(&parent_id) {
            p.children.push(child_id);
        }
        if let Some(c) = self.elements.get_mut(&child_id) {
            c.parent = Some(parent_id);
        }
        if let Some(layer) = self.layers.iter_mut().find(|l| l.id == layer_id) {
            layer.elements.retain(|e| *e != child_id);
        }
        Ok(())
    }

    /// Undo the nesting of `child`; it rejoins the layer's root list.
    pub fn detach_child(
        &mut self,
        parent_id: ElementId,
        child_id: ElementId,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let parent = self.resolve(parent_id)?.clone();
        let child = self.resolve(child_id)?.clone();
        ensure!(
            child.parent == Some(parent_id) && parent.children.contains(&child_id),
            "element {child_id} is not a child of {parent_id}"
        );
        let layer_id = child
            .layer
            .ok_or_else(|| anyhow!("element {child_id} is not attached to any layer"))?;

        uow.register_element(parent_id, Some(&parent));
        uow.register_element(child_id, Some(&child));
        if let Some(layer) = self.layer(layer_id) {
            uow.register_layer(layer_id, Some(layer));
        }

        if let Some(p) = self.elements.get_mut(&parent_id) {
            p.children.retain(|c| *c != child_id);
        }
        if let Some(c) = self.elements.get_mut(&child_id) {
            c.parent = None;
        }
        if let Some(layer) = self.layers.iter_mut().find(|l| l.id == layer_id) {
            layer.elements.push(child_id);
        }
        Ok(())
    }

    /// Reconnect an edge. Endpoints must be connectable element types.
    pub fn set_edge_ends(
        &mut self,
        id: ElementId,
        source: Option<ElementId>,
        target: Option<ElementId>,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        for end in [source, target].into_iter().flatten() {
            let el = self.resolve(end)?;
            let ty = self.require_type(&el.type_name)?;
            ensure!(
                ty.allows(Capability::Connect),
                "element type {} cannot anchor an edge",
                ty.name
            );
        }
        let el = self.resolve(id)?;
        ensure!(el.is_edge(), "element {id} is not an edge");
        self.update_element(
            id,
            |el| {
                if let ElementKind::Edge {
                    source: s,
                    target: t,
                    ..
                } = &mut el.kind
                {
                    *s = source;
                    *t = target;
                }
            },
            uow,
        )
    }

    pub fn set_waypoints(
        &mut self,
        id: ElementId,
        waypoints: Vec<Point>,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let el = self.resolve(id)?;
        ensure!(el.is_edge(), "element {id} is not an edge");
        self.update_element(
            id,
            |el| {
                if let ElementKind::Edge { waypoints: w, .. } = &mut el.kind {
                    *w = waypoints;
                }
            },
            uow,
        )
    }

    // --- Snapshot restoration ---

    /// Reinstate a whole-element snapshot, re-creating the element if it no
    /// longer exists and reconciling its placement (layer root list or
    /// parent's children) with the snapshot's links.
    pub(crate) fn restore_element(
        &mut self,
        snapshot: Element,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        let id = snapshot.id;
        let layer_id = snapshot
            .layer
            .ok_or_else(|| anyhow!("snapshot of {id} is not attached to any layer"))?;
        ensure!(
            self.layer(layer_id).is_some(),
            "snapshot of {id} references unknown layer {layer_id}"
        );

        uow.register_element(id, self.elements.get(&id));

        // Unhook the current placement where it disagrees with the snapshot.
        if let Some(current) = self.elements.get(&id).cloned() {
            if current.parent != snapshot.parent {
                if let Some(old_parent) = current.parent {
                    if let Some(p) = self.elements.get(&old_parent) {
                        uow.register_element(old_parent, Some(p));
                    }
                    if let Some(p) = self.elements.get_mut(&old_parent) {
                        p.children.retain(|c| *c != id);
                    }
                }
            }
            if current.parent.is_none()
                && (snapshot.parent.is_some() || current.layer != snapshot.layer)
            {
                if let Some(old_layer) = current.layer {
                    if let Some(l) = self.layer(old_layer) {
                        uow.register_layer(old_layer, Some(l));
                    }
                    if let Some(l) = self.layers.iter_mut().find(|l| l.id == old_layer) {
                        l.elements.retain(|e| *e != id);
                    }
                }
            }
        }

        match snapshot.parent {
            None => {
                if let Some(layer) = self.layer(layer_id) {
                    if !layer.contains(id) {
                        uow.register_layer(layer_id, Some(layer));
                        if let Some(l) = self.layers.iter_mut().find(|l| l.id == layer_id) {
                            l.elements.push(id);
                        }
                    }
                }
            }
            Some(parent_id) => {
                let parent = self
                    .elements
                    .get(&parent_id)
                    .ok_or_else(|| anyhow!("snapshot of {id} references missing parent {parent_id}"))?
                    .clone();
                if !parent.children.contains(&id) {
                    uow.register_element(parent_id, Some(&parent));
                    if let Some(p) = self.elements.get_mut(&parent_id) {
                        p.children.push(id);
                    }
                }
            }
        }

        self.elements.insert(id, snapshot);
        Ok(())
    }

    // --- Remote changes ---

    /// Re-apply changes a remote merge made to the shared maps, through the
    /// same unit-of-work path local edits take. The records in the maps are
    /// the truth; this reconciles the in-memory model with them.
    pub fn apply_remote_changes(&mut self, changes: &RemoteChanges) -> Result<CommitResult> {
        let mut uow = UnitOfWork::remote();

        let layers_map = self.root.get_map(LAYERS_MAP);
        for key in changes.keys_for(LAYERS_MAP) {
            let lid = LayerId(Uuid::parse_str(key)?);
            match layers_map.get(key)? {
                Some(bytes) => {
                    let record: LayerRecord = rmp_serde::from_slice(&bytes)?;
                    uow.register_layer(lid, self.layer(lid));
                    self.put_layer_raw(record.into_layer(lid));
                }
                None => {
                    uow.register_layer(lid, self.layer(lid));
                    self.drop_layer_raw(lid);
                }
            }
        }

        let documents = self.root.get_map(DOCUMENT_MAP);
        for key in changes.keys_for(DOCUMENT_MAP) {
            let id = ElementId(Uuid::parse_str(key)?);
            match documents.get(key)? {
                Some(bytes) => {
                    let el: Element = rmp_serde::from_slice(&bytes)?;
                    uow.register_element(id, self.elements.get(&id));
                    self.put_element_raw(el);
                }
                None => {
                    let current = self.elements.get(&id).cloned();
                    if current.is_some() {
                        uow.register_element(id, current.as_ref());
                        self.drop_element_raw(id);
                    }
                }
            }
        }

        uow.commit(self)
    }

    // --- State export ---

    /// Deterministic serialized form of the model state, independent of the
    /// backend the document runs on. Equal documents produce equal bytes.
    pub fn export_state(&self) -> Result<Vec<u8>> {
        let mut elements: Vec<(&ElementId, &Element)> = self.elements.iter().collect();
        elements.sort_by_key(|(id, _)| **id);
        let state = (&elements, &self.layers);
        Ok(rmp_serde::to_vec(&state)?)
    }

    // --- Internals ---

    fn resolve(&self, id: ElementId) -> Result<&Element> {
        self.elements
            .get(&id)
            .ok_or_else(|| anyhow!("unknown element: {id}"))
    }

    fn require_type(&self, name: &str) -> Result<&ElementType> {
        self.types
            .get(name)
            .ok_or_else(|| anyhow!("unknown element type: {name}"))
    }

    fn hydrate(&mut self) -> Result<()> {
        for (key, bytes) in self.root.get_map(LAYERS_MAP).entries()? {
            match (
                Uuid::parse_str(&key),
                rmp_serde::from_slice::<LayerRecord>(&bytes),
            ) {
                (Ok(id), Ok(record)) => self.layers.push(record.into_layer(LayerId(id))),
                _ => warn!(key = %key, "skipping malformed layer record"),
            }
        }
        for (key, bytes) in self.root.get_map(DOCUMENT_MAP).entries()? {
            match (Uuid::parse_str(&key), rmp_serde::from_slice::<Element>(&bytes)) {
                (Ok(id), Ok(el)) => {
                    self.elements.insert(ElementId(id), el);
                }
                _ => warn!(key = %key, "skipping malformed element record"),
            }
        }
        Ok(())
    }

    pub(crate) fn put_element_raw(&mut self, element: Element) {
        self.elements.insert(element.id, element);
    }

    pub(crate) fn drop_element_raw(&mut self, id: ElementId) {
        self.elements.remove(&id);
    }

    pub(crate) fn put_layer_raw(&mut self, layer: Layer) {
        match self.layers.iter_mut().find(|l| l.id == layer.id) {
            Some(slot) => *slot = layer,
            None => self.layers.push(layer),
        }
    }

    pub(crate) fn drop_layer_raw(&mut self, id: LayerId) {
        self.layers.retain(|l| l.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn diagram() -> (Diagram, LayerId) {
        let mut diagram = Diagram::new(CollabConfig::in_memory()).unwrap();
        let mut uow = diagram.begin(false);
        let layer = diagram.add_layer(Layer::new("Layer 1"), &mut uow).unwrap();
        uow.commit(&mut diagram).unwrap();
        (diagram, layer)
    }

    fn event_log(diagram: &Diagram) -> Rc<RefCell<Vec<DiagramEvent>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        diagram.events().subscribe(move |e| sink.borrow_mut().push(e.clone()));
        log
    }

    #[test]
    fn three_adds_commit_as_three_added_entries() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);
        for i in 1..=3u128 {
            let el = Element::node("node").with_id(ElementId(Uuid::from_u128(i)));
            diagram.add_element(layer, el, &mut uow).unwrap();
        }
        let result = uow.commit(&mut diagram).unwrap();

        assert_eq!(result.added.len(), 3);
        assert!(result.updated.is_empty());
        assert!(result.removed.is_empty());
    }

    #[test]
    fn exactly_one_notification_per_element_per_commit() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);
        let id = diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        uow.commit(&mut diagram).unwrap();

        let log = event_log(&diagram);
        let mut uow = diagram.begin(false);
        diagram
            .update_props(id, |p| {
                p.insert("a".into(), json!(1));
            }, &mut uow)
            .unwrap();
        diagram
            .update_props(id, |p| {
                p.insert("b".into(), json!(2));
            }, &mut uow)
            .unwrap();
        diagram
            .set_bounds(id, Bounds::new(1.0, 1.0, 10.0, 10.0), &mut uow)
            .unwrap();

        // Nothing leaks mid-scope.
        assert!(log.borrow().is_empty());

        uow.commit(&mut diagram).unwrap();
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        let DiagramEvent::ElementChanged { id: changed, fields } = &log[0] else {
            panic!("expected ElementChanged, got {:?}", log[0]);
        };
        assert_eq!(*changed, id);
        // The diff spans first-seen to committed state.
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["bounds", "props.a", "props.b"]);
    }

    #[test]
    fn notify_fires_interim_refreshes_without_closing_the_scope() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);
        let id = diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();

        let log = event_log(&diagram);
        uow.notify(&diagram);
        uow.notify(&diagram);
        assert_eq!(log.borrow().len(), 2);
        assert!(matches!(
            log.borrow()[0],
            DiagramEvent::ElementChanged { ref fields, .. } if fields.is_empty()
        ));

        let result = uow.commit(&mut diagram).unwrap();
        // The commit is still exactly-once with the full pre-scope diff.
        assert!(result.added.contains_key(&id));
        assert_eq!(log.borrow().len(), 3);
        assert!(matches!(log.borrow()[2], DiagramEvent::ElementAdded { .. }));
    }

    #[test]
    fn abandoned_scope_fires_nothing_and_mirrors_nothing() {
        let (mut diagram, layer) = diagram();
        let log = event_log(&diagram);

        let mut uow = diagram.begin(false);
        diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        drop(uow);

        assert!(log.borrow().is_empty());
        assert!(diagram
            .root()
            .get_map(DOCUMENT_MAP)
            .entries()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rollback_restores_the_pre_scope_state() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);
        let id = diagram
            .add_element(
                layer,
                Element::node("node").with_prop("fill", json!("red")),
                &mut uow,
            )
            .unwrap();
        uow.commit(&mut diagram).unwrap();
        let before = diagram.export_state().unwrap();

        let log = event_log(&diagram);
        let mut uow = diagram.begin(false);
        diagram
            .update_props(id, |p| {
                p.insert("fill".into(), json!("blue"));
            }, &mut uow)
            .unwrap();
        diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        uow.rollback(&mut diagram);

        assert_eq!(diagram.export_state().unwrap(), before);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn empty_commit_fires_document_change_only_when_tracked() {
        let (mut diagram, _) = diagram();
        let log = event_log(&diagram);

        let uow = diagram.begin(false);
        uow.commit(&mut diagram).unwrap();
        assert!(log.borrow().is_empty());

        let uow = diagram.begin(true);
        uow.commit(&mut diagram).unwrap();
        assert_eq!(*log.borrow(), vec![DiagramEvent::Changed]);
    }

    #[test]
    fn preconditions_fail_fast() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);

        // Unknown element.
        let ghost = ElementId::new();
        assert!(diagram
            .update_props(ghost, |_| {}, &mut uow)
            .is_err());

        // Unknown type.
        assert!(diagram
            .add_element(layer, Element::node("swimlane"), &mut uow)
            .is_err());

        // Duplicate id.
        let el = Element::node("node");
        let id = diagram.add_element(layer, el.clone(), &mut uow).unwrap();
        assert!(diagram.add_element(layer, el, &mut uow).is_err());

        // Labels cannot contain children.
        let label = diagram
            .add_element(layer, Element::node("label"), &mut uow)
            .unwrap();
        assert!(diagram.attach_child(label, id, &mut uow).is_err());

        // Parents with children cannot be removed directly.
        diagram.attach_child(id, label, &mut uow).unwrap();
        assert!(diagram.remove_element(id, &mut uow).is_err());

        // Edges cannot anchor on labels.
        let edge = diagram
            .add_element(layer, Element::edge("edge", None, None), &mut uow)
            .unwrap();
        assert!(diagram
            .set_edge_ends(edge, Some(label), None, &mut uow)
            .is_err());
    }

    #[test]
    fn attach_detach_keep_tree_and_layer_agreement() {
        let (mut diagram, layer) = diagram();
        let mut uow = diagram.begin(false);
        let parent = diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        let child = diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        uow.commit(&mut diagram).unwrap();

        let mut uow = diagram.begin(false);
        diagram.attach_child(parent, child, &mut uow).unwrap();
        uow.commit(&mut diagram).unwrap();

        assert_eq!(diagram.element(parent).unwrap().children, vec![child]);
        assert_eq!(diagram.element(child).unwrap().parent, Some(parent));
        assert_eq!(diagram.layer(layer).unwrap().elements, vec![parent]);

        let mut uow = diagram.begin(false);
        diagram.detach_child(parent, child, &mut uow).unwrap();
        uow.commit(&mut diagram).unwrap();

        assert!(diagram.element(parent).unwrap().children.is_empty());
        assert_eq!(diagram.element(child).unwrap().parent, None);
        assert_eq!(diagram.layer(layer).unwrap().elements, vec![parent, child]);
    }

    #[test]
    fn remote_changes_reapply_through_the_local_path() {
        let (config_a, root_a) = CollabConfig::replicated();
        let mut a = Diagram::new(config_a).unwrap();
        let mut uow = a.begin(false);
        let layer = a.add_layer(Layer::new("base"), &mut uow).unwrap();
        let id = a
            .add_element(layer, Element::node("node").with_prop("fill", json!("red")), &mut uow)
            .unwrap();
        uow.commit(&mut a).unwrap();

        let (config_b, root_b) = CollabConfig::replicated();
        let mut b = Diagram::new(config_b).unwrap();
        let log = event_log(&b);

        let changes = root_b.merge_remote(&mut root_a.fork()).unwrap();
        let result = b.apply_remote_changes(&changes).unwrap();

        assert_eq!(result.added.len(), 1);
        assert!(b.element(id).is_some());
        assert_eq!(b.layer(layer).unwrap().elements, vec![id]);
        assert!(log
            .borrow()
            .iter()
            .any(|e| matches!(e, DiagramEvent::ElementAdded { id: added } if *added == id)));
        assert_eq!(a.export_state().unwrap(), b.export_state().unwrap());

        // A removal flows the same way.
        let mut uow = a.begin(false);
        a.remove_element(id, &mut uow).unwrap();
        uow.commit(&mut a).unwrap();

        let changes = root_b.merge_remote(&mut root_a.fork()).unwrap();
        let result = b.apply_remote_changes(&changes).unwrap();
        assert_eq!(result.removed.len(), 1);
        assert!(b.element(id).is_none());
        assert_eq!(a.export_state().unwrap(), b.export_state().unwrap());
    }

    fn scripted_mutations(diagram: &mut Diagram) {
        let layer_id = LayerId(Uuid::from_u128(0x10));
        let mut uow = diagram.begin(false);
        diagram
            .add_layer(Layer::with_id(layer_id, "base"), &mut uow)
            .unwrap();
        let n1 = Element::node("node")
            .with_id(ElementId(Uuid::from_u128(1)))
            .with_bounds(Bounds::new(0.0, 0.0, 100.0, 80.0));
        let n2 = Element::node("node")
            .with_id(ElementId(Uuid::from_u128(2)))
            .with_bounds(Bounds::new(200.0, 0.0, 100.0, 80.0));
        let e1 = Element::edge("edge", Some(n1.id), Some(n2.id))
            .with_id(ElementId(Uuid::from_u128(3)));
        let (n1, n2, e1) = (
            diagram.add_element(layer_id, n1, &mut uow).unwrap(),
            diagram.add_element(layer_id, n2, &mut uow).unwrap(),
            diagram.add_element(layer_id, e1, &mut uow).unwrap(),
        );
        uow.commit(diagram).unwrap();

        let mut uow = diagram.begin(false);
        diagram
            .update_props(n1, |p| {
                p.insert("name".into(), json!("start"));
            }, &mut uow)
            .unwrap();
        diagram
            .set_waypoints(e1, vec![Point::new(100.0, 40.0), Point::new(200.0, 40.0)], &mut uow)
            .unwrap();
        diagram.remove_element(n2, &mut uow).unwrap();
        diagram.set_edge_ends(e1, Some(n1), None, &mut uow).unwrap();
        uow.commit(diagram).unwrap();
    }

    #[test]
    fn noop_backend_is_behaviorally_transparent() {
        let mut in_memory = Diagram::new(CollabConfig::in_memory()).unwrap();
        let (config, _root) = CollabConfig::replicated();
        let mut replicated = Diagram::new(config).unwrap();

        scripted_mutations(&mut in_memory);
        scripted_mutations(&mut replicated);

        assert_eq!(
            in_memory.export_state().unwrap(),
            replicated.export_state().unwrap()
        );
    }

    #[test]
    fn documents_hydrate_from_persisted_shared_state() {
        let (config, root) = CollabConfig::replicated();
        let mut original = Diagram::new(config).unwrap();
        scripted_mutations(&mut original);

        let loaded_root = crate::crdt::AutomergeRoot::load(&root.save()).unwrap();
        let loaded = Diagram::new(CollabConfig::with_root(loaded_root)).unwrap();

        assert_eq!(
            original.export_state().unwrap(),
            loaded.export_state().unwrap()
        );
    }
}
