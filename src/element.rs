//! Document elements: nodes, edges, and their type descriptors.
//!
//! Elements carry identity, a property bag, bounds, and tree links
//! (parent/children). What a given element type is allowed to do is declared
//! data-first on its `ElementType` descriptor as a capability set, checked by
//! lookup instead of virtual dispatch.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::layer::LayerId;

/// Element identifier - UUID for global uniqueness (CRDT-friendly)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub Uuid);

impl ElementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounds of an element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest bounds containing both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Bounds::new(x, y, right - x, bottom - y)
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Bounds {
        Bounds::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// Property bag attached to every element. BTreeMap keeps serialization
/// deterministic so snapshots of equal state are byte-equal.
pub type Props = BTreeMap<String, serde_json::Value>;

/// The structural variant of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    /// A shape placed on the canvas.
    Node,
    /// A connection between two elements, routed through waypoints.
    Edge {
        source: Option<ElementId>,
        target: Option<ElementId>,
        waypoints: Vec<Point>,
    },
}

/// A document element. The element is its own snapshot type: a clone is a
/// structurally-complete copy of all mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    /// Key into the element type registry.
    pub type_name: String,
    pub kind: ElementKind,
    pub props: Props,
    pub bounds: Option<Bounds>,
    pub parent: Option<ElementId>,
    pub children: Vec<ElementId>,
    /// Layer this element is attached to. `None` until added to the document.
    pub layer: Option<LayerId>,
}

impl Element {
    /// Construct a detached node element.
    pub fn node(type_name: impl Into<String>) -> Self {
        Self {
            id: ElementId::new(),
            type_name: type_name.into(),
            kind: ElementKind::Node,
            props: Props::new(),
            bounds: None,
            parent: None,
            children: Vec::new(),
            layer: None,
        }
    }

    /// Construct a detached edge element.
    pub fn edge(
        type_name: impl Into<String>,
        source: Option<ElementId>,
        target: Option<ElementId>,
    ) -> Self {
        Self {
            id: ElementId::new(),
            type_name: type_name.into(),
            kind: ElementKind::Edge {
                source,
                target,
                waypoints: Vec::new(),
            },
            props: Props::new(),
            bounds: None,
            parent: None,
            children: Vec::new(),
            layer: None,
        }
    }

    pub fn with_id(mut self, id: ElementId) -> Self {
        self.id = id;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, ElementKind::Edge { .. })
    }

    /// True once the element has been added to a layer.
    pub fn is_attached(&self) -> bool {
        self.layer.is_some()
    }
}

/// A capability an element type may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// May own child elements (containers, edges with labels).
    Children,
    /// May serve as an edge source or target.
    Connect,
    /// May be resized through `set_bounds`.
    Resize,
}

/// Descriptor for a registered element type. New kinds declare their
/// capabilities as data; nothing is overridden per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementType {
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl ElementType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Built-in descriptors every document starts with.
pub fn builtin_types() -> Vec<ElementType> {
    vec![
        ElementType::new("node")
            .with(Capability::Children)
            .with(Capability::Connect)
            .with(Capability::Resize),
        ElementType::new("edge").with(Capability::Children),
        ElementType::new("label").with(Capability::Resize),
    ]
}
