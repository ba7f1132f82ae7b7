//! Layers organizing the root elements of a document.
//!
//! Layers provide visibility and lock controls and own the ordered list of
//! their root elements (higher layers render above lower layers).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::ElementId;

/// Layer identifier - UUID for global uniqueness (CRDT-friendly)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Layer data structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    /// Ordered root elements of this layer. Child elements hang off their
    /// parents and never appear here.
    pub elements: Vec<ElementId>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: LayerId::new(),
            name: name.into(),
            visible: true,
            locked: false,
            elements: Vec::new(),
        }
    }

    pub fn with_id(id: LayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            visible: true,
            locked: false,
            elements: Vec::new(),
        }
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains(&id)
    }

    /// Position of an element in this layer's stacking order.
    pub fn position_of(&self, id: ElementId) -> Option<usize> {
        self.elements.iter().position(|e| *e == id)
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new("Layer 1")
    }
}

/// The replicated record for a layer: everything but the id, which is the
/// map key on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    pub elements: Vec<ElementId>,
}

impl From<&Layer> for LayerRecord {
    fn from(layer: &Layer) -> Self {
        Self {
            name: layer.name.clone(),
            visible: layer.visible,
            locked: layer.locked,
            elements: layer.elements.clone(),
        }
    }
}

impl LayerRecord {
    pub fn into_layer(self, id: LayerId) -> Layer {
        Layer {
            id,
            name: self.name,
            visible: self.visible,
            locked: self.locked,
            elements: self.elements,
        }
    }
}
