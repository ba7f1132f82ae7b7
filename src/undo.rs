//! Undo/redo manager over discrete, reversible actions.
//!
//! Every action is self-contained: replaying it against the same document
//! state is deterministic and never reaches back into the unit of work that
//! produced it. Fine-grained actions (add, remove, property change) reverse
//! their own recorded parameters; the snapshot action restores whole-element
//! state and is the right choice whenever an operation's forward effect is
//! not a pure function of its parameters (cascading geometry, style
//! recalculation).

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::diagram::Diagram;
use crate::element::{Element, ElementId};
use crate::layer::LayerId;
use crate::uow::{CommitResult, UnitOfWork};

/// One target of a bulk property change with its captured prior value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyTarget {
    pub id: ElementId,
    /// Value before the change; `None` when the key was absent.
    pub previous: Option<Value>,
}

/// Per-element before/after pair of a snapshot action.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub id: ElementId,
    pub before: Option<Element>,
    pub after: Option<Element>,
}

/// A reversible document edit.
#[derive(Debug, Clone)]
pub enum UndoableAction {
    /// Add one detached element as a layer root.
    AddElement { layer: LayerId, element: Element },
    /// Remove one element, restoring it at its old stacking position on
    /// undo (or under its old parent if it was nested).
    RemoveElement {
        layer: LayerId,
        element: Element,
        position: Option<usize>,
    },
    /// Set one property key to one value across several elements.
    ChangeProperties {
        key: String,
        value: Value,
        targets: Vec<PropertyTarget>,
    },
    /// Ordered aggregate undone/redone as a single history entry. Undo runs
    /// children in reverse construction order.
    Compound {
        label: String,
        actions: Vec<UndoableAction>,
    },
    /// Whole-element state restoration, in touch order. Restoring an entry
    /// whose element no longer exists re-creates it.
    Snapshot { entries: Vec<SnapshotEntry> },
}

impl UndoableAction {
    /// Removal action for an existing element, capturing everything needed
    /// to reverse it.
    pub fn remove_element(diagram: &Diagram, id: ElementId) -> Result<Self> {
        let element = diagram
            .element(id)
            .ok_or_else(|| anyhow!("unknown element: {id}"))?
            .clone();
        let layer = element
            .layer
            .ok_or_else(|| anyhow!("element {id} is not attached to any layer"))?;
        let position = diagram.layer(layer).and_then(|l| l.position_of(id));
        Ok(Self::RemoveElement {
            layer,
            element,
            position,
        })
    }

    /// Bulk property change, capturing each element's prior value.
    pub fn change_properties(
        diagram: &Diagram,
        key: impl Into<String>,
        value: Value,
        ids: &[ElementId],
    ) -> Result<Self> {
        let key = key.into();
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let el = diagram
                .element(*id)
                .ok_or_else(|| anyhow!("unknown element: {id}"))?;
            targets.push(PropertyTarget {
                id: *id,
                previous: el.props.get(&key).cloned(),
            });
        }
        Ok(Self::ChangeProperties {
            key,
            value,
            targets,
        })
    }

    pub fn compound(label: impl Into<String>, actions: Vec<UndoableAction>) -> Self {
        Self::Compound {
            label: label.into(),
            actions,
        }
    }

    /// Snapshot action covering everything a committed unit of work touched.
    pub fn from_commit(result: &CommitResult) -> Self {
        let entries = result
            .order
            .iter()
            .map(|id| {
                if let Some(el) = result.added.get(id) {
                    SnapshotEntry {
                        id: *id,
                        before: None,
                        after: Some(el.clone()),
                    }
                } else if let Some(update) = result.updated.get(id) {
                    SnapshotEntry {
                        id: *id,
                        before: Some(update.before.clone()),
                        after: Some(update.after.clone()),
                    }
                } else {
                    SnapshotEntry {
                        id: *id,
                        before: result.removed.get(id).cloned(),
                        after: None,
                    }
                }
            })
            .collect();
        Self::Snapshot { entries }
    }

    /// Apply the action's forward effect.
    pub fn execute(&self, diagram: &mut Diagram) -> Result<()> {
        match self {
            Self::AddElement { layer, element } => {
                let mut uow = UnitOfWork::new(false);
                diagram.add_element(*layer, element.clone(), &mut uow)?;
                uow.commit(diagram)?;
                Ok(())
            }
            Self::RemoveElement { element, .. } => {
                let mut uow = UnitOfWork::new(false);
                diagram.remove_element(element.id, &mut uow)?;
                uow.commit(diagram)?;
                Ok(())
            }
            Self::ChangeProperties {
                key,
                value,
                targets,
            } => {
                let mut uow = UnitOfWork::new(false);
                for target in targets {
                    diagram.update_props(
                        target.id,
                        |props| {
                            props.insert(key.clone(), value.clone());
                        },
                        &mut uow,
                    )?;
                }
                uow.commit(diagram)?;
                Ok(())
            }
            Self::Compound { actions, .. } => {
                for action in actions {
                    action.execute(diagram)?;
                }
                Ok(())
            }
            Self::Snapshot { entries } => apply_snapshots(diagram, entries.iter(), |e| &e.after),
        }
    }

    /// Reverse the action's effect.
    pub fn undo(&self, diagram: &mut Diagram) -> Result<()> {
        match self {
            Self::AddElement { element, .. } => {
                let mut uow = UnitOfWork::new(false);
                diagram.remove_element(element.id, &mut uow)?;
                uow.commit(diagram)?;
                Ok(())
            }
            Self::RemoveElement {
                layer,
                element,
                position,
            } => {
                let mut uow = UnitOfWork::new(false);
                if element.parent.is_none() {
                    diagram.insert_element(*layer, element.clone(), *position, &mut uow)?;
                } else {
                    diagram.restore_element(element.clone(), &mut uow)?;
                }
                uow.commit(diagram)?;
                Ok(())
            }
            Self::ChangeProperties { key, targets, .. } => {
                let mut uow = UnitOfWork::new(false);
                for target in targets.iter().rev() {
                    let previous = target.previous.clone();
                    diagram.update_props(
                        target.id,
                        |props| {
                            match previous {
                                Some(value) => props.insert(key.clone(), value),
                                None => props.remove(key),
                            };
                        },
                        &mut uow,
                    )?;
                }
                uow.commit(diagram)?;
                Ok(())
            }
            Self::Compound { actions, .. } => {
                for action in actions.iter().rev() {
                    action.undo(diagram)?;
                }
                Ok(())
            }
            Self::Snapshot { entries } => {
                apply_snapshots(diagram, entries.iter().rev(), |e| &e.before)
            }
        }
    }

    /// Replay after an undo. Falls back to `execute` where no specialized
    /// redo side exists.
    pub fn redo(&self, diagram: &mut Diagram) -> Result<()> {
        match self {
            Self::Compound { actions, .. } => {
                for action in actions {
                    action.redo(diagram)?;
                }
                Ok(())
            }
            _ => self.execute(diagram),
        }
    }
}

/// Restore one side of a snapshot set inside a single unit of work.
fn apply_snapshots<'a>(
    diagram: &mut Diagram,
    entries: impl Iterator<Item = &'a SnapshotEntry>,
    side: impl Fn(&SnapshotEntry) -> &Option<Element>,
) -> Result<()> {
    let mut uow = UnitOfWork::new(false);
    for entry in entries {
        match side(entry) {
            Some(el) => diagram.restore_element(el.clone(), &mut uow)?,
            None => {
                if diagram.element(entry.id).is_some() {
                    diagram.remove_element(entry.id, &mut uow)?;
                }
            }
        }
    }
    uow.commit(diagram)?;
    Ok(())
}

/// Linear undo/redo history with a bounded depth.
pub struct UndoManager {
    undo_stack: Vec<UndoableAction>,
    redo_stack: Vec<UndoableAction>,
    max_history: usize,
}

impl UndoManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_history,
        }
    }

    /// Push without executing - for actions whose mutation already happened
    /// through a committed unit of work. Truncates the redo tail.
    pub fn add(&mut self, action: UndoableAction) {
        self.undo_stack.push(action);
        self.redo_stack.clear();

        // Limit history size
        while self.undo_stack.len() > self.max_history {
            self.undo_stack.remove(0);
        }
    }

    /// Execute, then push.
    pub fn add_and_execute(
        &mut self,
        action: UndoableAction,
        diagram: &mut Diagram,
    ) -> Result<()> {
        action.execute(diagram)?;
        self.add(action);
        Ok(())
    }

    /// Reverse the most recent action. Returns false on an empty history.
    pub fn undo(&mut self, diagram: &mut Diagram) -> Result<bool> {
        let Some(action) = self.undo_stack.pop() else {
            return Ok(false);
        };
        if let Err(e) = action.undo(diagram) {
            self.undo_stack.push(action);
            return Err(e);
        }
        self.redo_stack.push(action);
        Ok(true)
    }

    /// Replay the most recently undone action. Returns false if nothing is
    /// there to redo.
    pub fn redo(&mut self, diagram: &mut Diagram) -> Result<bool> {
        let Some(action) = self.redo_stack.pop() else {
            return Ok(false);
        };
        if let Err(e) = action.redo(diagram) {
            self.redo_stack.push(action);
            return Err(e);
        }
        self.undo_stack.push(action);
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Clear all history
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(100)
    }
}
