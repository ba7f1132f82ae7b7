//! Unit of work: the transactional scope for all document mutations.
//!
//! Every mutator registers the touched element here together with its
//! pre-mutation snapshot (captured at most once per scope - the earliest
//! state wins). Committing diffs first-seen snapshots against current state,
//! mirrors local changes into the shared CRDT maps, and fires exactly one
//! change notification per touched element. Observers never see a partial
//! view of a scope.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crdt::{ChangeOrigin, DOCUMENT_MAP, LAYERS_MAP};
use crate::diagram::{Diagram, DiagramEvent};
use crate::element::{Element, ElementId, ElementKind};
use crate::layer::{Layer, LayerId, LayerRecord};

/// One changed field of an element, as JSON values for uniform comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

fn jval<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Minimal field-by-field diff between two snapshots of the same element.
pub fn diff_elements(before: &Element, after: &Element) -> Vec<FieldChange> {
    let mut fields = Vec::new();
    let mut push = |field: &str, b: serde_json::Value, a: serde_json::Value| {
        if b != a {
            fields.push(FieldChange {
                field: field.to_string(),
                before: b,
                after: a,
            });
        }
    };

    push("type", jval(&before.type_name), jval(&after.type_name));
    push("bounds", jval(&before.bounds), jval(&after.bounds));
    push("parent", jval(&before.parent), jval(&after.parent));
    push("children", jval(&before.children), jval(&after.children));
    push("layer", jval(&before.layer), jval(&after.layer));

    match (&before.kind, &after.kind) {
        (ElementKind::Node, ElementKind::Node) => {}
        (
            ElementKind::Edge {
                source: s1,
                target: t1,
                waypoints: w1,
            },
            ElementKind::Edge {
                source: s2,
                target: t2,
                waypoints: w2,
            },
        ) => {
            push("source", jval(s1), jval(s2));
            push("target", jval(t1), jval(t2));
            push("waypoints", jval(w1), jval(w2));
        }
        _ => push("kind", jval(&before.kind), jval(&after.kind)),
    }

    let mut keys: Vec<&String> = before.props.keys().chain(after.props.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let b = before
            .props
            .get(key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let a = after
            .props
            .get(key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        push(&format!("props.{key}"), b, a);
    }

    fields
}

/// An element that changed within a committed scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementUpdate {
    pub before: Element,
    pub after: Element,
    pub fields: Vec<FieldChange>,
}

/// Snapshot sets returned by `UnitOfWork::commit`, split by what happened
/// to each touched element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResult {
    pub added: HashMap<ElementId, Element>,
    pub updated: HashMap<ElementId, ElementUpdate>,
    pub removed: HashMap<ElementId, Element>,
    /// Touch order of the elements present in the three sets above.
    pub order: Vec<ElementId>,
}

impl CommitResult {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Transactional scope for document mutations.
///
/// Construction performs no mutation; abandoning a unit of work without
/// committing fires nothing and writes nothing to the shared state. Nested
/// units are not supported - one logical operation, cascading side effects
/// included, uses exactly one unit of work.
pub struct UnitOfWork {
    origin: ChangeOrigin,
    track_changes: bool,
    tracking: bool,
    before_elements: HashMap<ElementId, Option<Element>>,
    element_order: Vec<ElementId>,
    before_layers: HashMap<LayerId, Option<Layer>>,
    layer_order: Vec<LayerId>,
}

impl UnitOfWork {
    /// Begin a local scope. `track_changes` additionally fires a
    /// document-level `Changed` event on commit, even for an empty scope.
    pub fn new(track_changes: bool) -> Self {
        Self {
            origin: ChangeOrigin::Local,
            track_changes,
            tracking: true,
            before_elements: HashMap::new(),
            element_order: Vec::new(),
            before_layers: HashMap::new(),
            layer_order: Vec::new(),
        }
    }

    /// Scope for re-applying changes merged in from a peer. Commits fire
    /// notifications as usual but skip CRDT mirroring to prevent echo.
    pub fn remote() -> Self {
        Self {
            origin: ChangeOrigin::Remote,
            ..Self::new(false)
        }
    }

    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    /// Ids touched so far, in first-touch order.
    pub fn touched(&self) -> &[ElementId] {
        &self.element_order
    }

    /// Disable further snapshot capture. Used when the caller already knows
    /// it will discard the result of this scope.
    pub fn stop_tracking(&mut self) {
        self.tracking = false;
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Capture an element's pre-mutation state, first touch only.
    pub(crate) fn register_element(&mut self, id: ElementId, current: Option<&Element>) {
        if !self.tracking {
            return;
        }
        if let std::collections::hash_map::Entry::Vacant(slot) = self.before_elements.entry(id) {
            slot.insert(current.cloned());
            self.element_order.push(id);
        }
    }

    /// Capture a layer's pre-mutation state, first touch only.
    pub(crate) fn register_layer(&mut self, id: LayerId, current: Option<&Layer>) {
        if !self.tracking {
            return;
        }
        if let std::collections::hash_map::Entry::Vacant(slot) = self.before_layers.entry(id) {
            slot.insert(current.cloned());
            self.layer_order.push(id);
        }
    }

    /// Force an intermediate visual refresh without closing the scope.
    ///
    /// Fires `ElementChanged` with an empty diff for every touched element
    /// still present. May be called any number of times (live-drag
    /// previews); first-seen snapshots are not disturbed.
    pub fn notify(&self, diagram: &Diagram) {
        for id in &self.element_order {
            if diagram.element(*id).is_some() {
                diagram.events().emit(&DiagramEvent::ElementChanged {
                    id: *id,
                    fields: Vec::new(),
                });
            }
        }
    }

    /// Finalize the scope: diff, mirror, notify.
    pub fn commit(self, diagram: &mut Diagram) -> Result<CommitResult> {
        let mut result = CommitResult::default();

        for id in &self.element_order {
            let before = self.before_elements[id].clone();
            let after = diagram.element(*id).cloned();
            match (before, after) {
                (None, Some(el)) => {
                    result.order.push(*id);
                    result.added.insert(*id, el);
                }
                (Some(b), Some(a)) => {
                    let fields = diff_elements(&b, &a);
                    if !fields.is_empty() {
                        result.order.push(*id);
                        result.updated.insert(
                            *id,
                            ElementUpdate {
                                before: b,
                                after: a,
                                fields,
                            },
                        );
                    }
                }
                (Some(b), None) => {
                    result.order.push(*id);
                    result.removed.insert(*id, b);
                }
                // Added and removed again within the same scope.
                (None, None) => {}
            }
        }

        if self.origin == ChangeOrigin::Local {
            self.mirror(diagram, &result)?;
        }

        for id in &result.order {
            let event = if result.added.contains_key(id) {
                DiagramEvent::ElementAdded { id: *id }
            } else if let Some(update) = result.updated.get(id) {
                DiagramEvent::ElementChanged {
                    id: *id,
                    fields: update.fields.clone(),
                }
            } else {
                DiagramEvent::ElementRemoved { id: *id }
            };
            diagram.events().emit(&event);
        }
        if self.track_changes {
            diagram.events().emit(&DiagramEvent::Changed);
        }

        debug!(
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            "committed unit of work"
        );
        Ok(result)
    }

    /// Write the committed diff through the shared map interface.
    fn mirror(&self, diagram: &Diagram, result: &CommitResult) -> Result<()> {
        if result.is_empty() && self.layer_order.is_empty() {
            return Ok(());
        }
        let documents = diagram.root().get_map(DOCUMENT_MAP);
        for id in &result.order {
            let key = id.to_string();
            if let Some(el) = result.added.get(id) {
                documents.set(&key, rmp_serde::to_vec(el)?)?;
            } else if let Some(update) = result.updated.get(id) {
                documents.set(&key, rmp_serde::to_vec(&update.after)?)?;
            } else {
                documents.delete(&key)?;
            }
        }

        let layers = diagram.root().get_map(LAYERS_MAP);
        for lid in &self.layer_order {
            let key = lid.to_string();
            match diagram.layer(*lid) {
                Some(layer) => layers.set(&key, rmp_serde::to_vec(&LayerRecord::from(layer))?)?,
                None => layers.delete(&key)?,
            }
        }
        Ok(())
    }

    /// Restore every first-seen snapshot, silently. No events fire and
    /// nothing is written to the shared state.
    pub fn rollback(self, diagram: &mut Diagram) {
        for id in self.element_order.iter().rev() {
            match &self.before_elements[id] {
                Some(el) => {
                    diagram.put_element_raw(el.clone());
                }
                None => {
                    diagram.drop_element_raw(*id);
                }
            }
        }
        for lid in self.layer_order.iter().rev() {
            match &self.before_layers[lid] {
                Some(layer) => diagram.put_layer_raw(layer.clone()),
                None => diagram.drop_layer_raw(*lid),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Bounds;

    #[test]
    fn diff_reports_only_changed_fields() {
        let before = Element::node("node")
            .with_bounds(Bounds::new(0.0, 0.0, 10.0, 10.0))
            .with_prop("fill", serde_json::json!("red"));
        let mut after = before.clone();
        after.bounds = Some(Bounds::new(5.0, 0.0, 10.0, 10.0));
        after.props.insert("fill".into(), serde_json::json!("blue"));
        after.props.insert("stroke".into(), serde_json::json!(2));

        let fields = diff_elements(&before, &after);
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["bounds", "props.fill", "props.stroke"]);

        let stroke = fields.iter().find(|f| f.field == "props.stroke").unwrap();
        assert_eq!(stroke.before, serde_json::Value::Null);
        assert_eq!(stroke.after, serde_json::json!(2));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let el = Element::node("node").with_prop("x", serde_json::json!(1));
        assert!(diff_elements(&el, &el.clone()).is_empty());
    }

    #[test]
    fn first_seen_snapshot_wins() {
        let mut uow = UnitOfWork::new(false);
        let v1 = Element::node("node").with_prop("rev", serde_json::json!(1));
        let mut v2 = v1.clone();
        v2.props.insert("rev".into(), serde_json::json!(2));

        uow.register_element(v1.id, Some(&v1));
        uow.register_element(v1.id, Some(&v2));

        assert_eq!(uow.touched().len(), 1);
        assert_eq!(
            uow.before_elements[&v1.id].as_ref().unwrap().props["rev"],
            serde_json::json!(1)
        );
    }

    #[test]
    fn stop_tracking_disables_capture() {
        let mut uow = UnitOfWork::new(false);
        uow.stop_tracking();
        let el = Element::node("node");
        uow.register_element(el.id, Some(&el));
        assert!(uow.touched().is_empty());
    }
}
