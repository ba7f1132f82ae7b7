//! In-memory no-op backend: the map contract without replication.
//!
//! Used when collaboration is disabled and for benchmarking mutation paths
//! without network cost. Behaviorally transparent: a document driven through
//! this backend and one driven through a connected-but-solo replicated
//! backend end up with identical contents.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::Result;

use crate::crdt::{ChangeOrigin, CrdtMap, CrdtRoot, MapEvent};
use crate::event::{EventChannel, SubscriberId};

/// Process-local map of byte records.
pub struct MemoryMap {
    name: String,
    entries: RefCell<BTreeMap<String, Vec<u8>>>,
    events: EventChannel<MapEvent>,
}

impl MemoryMap {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RefCell::new(BTreeMap::new()),
            events: EventChannel::new(),
        }
    }

    fn fire(&self, key: &str) {
        self.events.emit(&MapEvent {
            map: self.name.clone(),
            keys: vec![key.to_string()],
            origin: ChangeOrigin::Local,
        });
    }
}

impl CrdtMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        self.fire(key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.entries.borrow_mut().remove(key).is_some() {
            self.fire(key);
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn subscribe(&self, callback: Box<dyn Fn(&MapEvent)>) -> SubscriberId {
        self.events.subscribe(move |e| callback(e))
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id)
    }
}

/// Root owning the named in-memory maps.
pub struct MemoryRoot {
    maps: RefCell<HashMap<String, Rc<MemoryMap>>>,
}

impl MemoryRoot {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self {
            maps: RefCell::new(HashMap::new()),
        })
    }
}

impl CrdtRoot for MemoryRoot {
    fn get_map(&self, name: &str) -> Rc<dyn CrdtMap> {
        self.maps
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(MemoryMap::new(name)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn map_handles_are_stable() {
        let root = MemoryRoot::shared();
        let a = root.get_map("document");
        let b = root.get_map("document");
        a.set("k", vec![1]).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(vec![1]));
    }

    #[test]
    fn set_and_delete_fire_local_events() {
        let root = MemoryRoot::shared();
        let map = root.get_map("document");

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        map.subscribe(Box::new(move |e| {
            assert_eq!(e.origin, ChangeOrigin::Local);
            assert_eq!(e.keys, vec!["k".to_string()]);
            f.set(f.get() + 1);
        }));

        map.set("k", vec![1]).unwrap();
        map.delete("k").unwrap();
        // Deleting a missing key is silent.
        map.delete("k").unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn entries_are_sorted_by_key() {
        let root = MemoryRoot::shared();
        let map = root.get_map("document");
        map.set("b", vec![2]).unwrap();
        map.set("a", vec![1]).unwrap();
        let entries = map.entries().unwrap();
        assert_eq!(
            entries,
            vec![("a".to_string(), vec![1]), ("b".to_string(), vec![2])]
        );
    }
}
