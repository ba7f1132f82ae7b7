//! Automerge-backed replicated root/map.
//!
//! Each named map is an `ObjType::Map` under the automerge ROOT; values are
//! byte scalars (MessagePack records produced by the document layer). Merge
//! logic is automerge's entirely - this module only translates between the
//! map contract and automerge transactions, and reports which keys a remote
//! merge actually changed.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use automerge::{transaction::Transactable, Automerge, ObjType, ReadDoc, Value, ROOT};
use tracing::debug;

use crate::crdt::{ChangeOrigin, CrdtMap, CrdtRoot, MapEvent};
use crate::event::{EventChannel, SubscriberId};

/// Keys changed by a remote merge, grouped by map name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteChanges {
    pub maps: Vec<(String, Vec<String>)>,
}

impl RemoteChanges {
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Changed keys for one map, empty if the map was untouched.
    pub fn keys_for(&self, map: &str) -> &[String] {
        self.maps
            .iter()
            .find(|(name, _)| name == map)
            .map(|(_, keys)| keys.as_slice())
            .unwrap_or(&[])
    }
}

/// A named map stored in the shared automerge document.
pub struct AutomergeMap {
    name: String,
    doc: Rc<RefCell<Automerge>>,
    events: EventChannel<MapEvent>,
}

impl AutomergeMap {
    fn new(name: &str, doc: Rc<RefCell<Automerge>>) -> Self {
        Self {
            name: name.to_string(),
            doc,
            events: EventChannel::new(),
        }
    }

    fn fire(&self, keys: Vec<String>, origin: ChangeOrigin) {
        self.events.emit(&MapEvent {
            map: self.name.clone(),
            keys,
            origin,
        });
    }
}

impl CrdtMap for AutomergeMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let doc = self.doc.borrow();
        let obj = match doc.get(ROOT, &self.name)? {
            Some((_, obj)) => obj,
            None => return Ok(None),
        };
        match doc.get(&obj, key)? {
            Some((Value::Scalar(s), _)) => Ok(s.to_bytes().map(|b| b.to_vec())),
            _ => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        {
            let mut doc = self.doc.borrow_mut();
            let mut tx = doc.transaction();
            // Get or create this map within the transaction
            let obj = match tx.get(ROOT, &self.name)? {
                Some((_, obj)) => obj,
                None => tx.put_object(ROOT, &self.name, ObjType::Map)?,
            };
            tx.put(&obj, key, value)?;
            tx.commit();
        }
        self.fire(vec![key.to_string()], ChangeOrigin::Local);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let removed = {
            let mut doc = self.doc.borrow_mut();
            let mut tx = doc.transaction();
            let obj = match tx.get(ROOT, &self.name)? {
                Some((_, obj)) => obj,
                None => return Ok(()),
            };
            if tx.get(&obj, key)?.is_none() {
                return Ok(());
            }
            tx.delete(&obj, key)?;
            tx.commit();
            true
        };
        if removed {
            self.fire(vec![key.to_string()], ChangeOrigin::Local);
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let doc = self.doc.borrow();
        let obj = match doc.get(ROOT, &self.name)? {
            Some((_, obj)) => obj,
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::new();
        for key in doc.keys(&obj) {
            if let Some((Value::Scalar(s), _)) = doc.get(&obj, &key)? {
                if let Some(bytes) = s.to_bytes() {
                    entries.push((key.clone(), bytes.to_vec()));
                }
            }
        }
        Ok(entries)
    }

    fn subscribe(&self, callback: Box<dyn Fn(&MapEvent)>) -> SubscriberId {
        self.events.subscribe(move |e| callback(e))
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id)
    }
}

/// The automerge document holding every named map of one diagram.
pub struct AutomergeRoot {
    doc: Rc<RefCell<Automerge>>,
    maps: RefCell<HashMap<String, Rc<AutomergeMap>>>,
}

impl AutomergeRoot {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self {
            doc: Rc::new(RefCell::new(Automerge::new())),
            maps: RefCell::new(HashMap::new()),
        })
    }

    /// Wrap an existing automerge document (joined session, loaded file).
    pub fn from_automerge(doc: Automerge) -> Rc<Self> {
        Rc::new(Self {
            doc: Rc::new(RefCell::new(doc)),
            maps: RefCell::new(HashMap::new()),
        })
    }

    pub fn load(bytes: &[u8]) -> Result<Rc<Self>> {
        Ok(Self::from_automerge(Automerge::load(bytes)?))
    }

    pub fn load_from(path: &Path) -> Result<Rc<Self>> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }

    /// Serialized form of the whole shared state.
    pub fn save(&self) -> Vec<u8> {
        self.doc.borrow_mut().save()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.save())?;
        Ok(())
    }

    /// Clone of the underlying document, for handing to a sync worker.
    pub fn fork(&self) -> Automerge {
        self.doc.borrow().clone()
    }

    /// Merge a remote document and report exactly which keys changed.
    ///
    /// Fires a Remote `MapEvent` per affected map. The diff is computed over
    /// map contents before and after the merge, so keys automerge resolved
    /// back to their current value do not show up as changes.
    pub fn merge_remote(&self, other: &mut Automerge) -> Result<RemoteChanges> {
        let before = self.contents()?;
        {
            let mut doc = self.doc.borrow_mut();
            doc.merge(other)?;
        }
        let after = self.contents()?;

        let mut changes = RemoteChanges::default();
        let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for name in names {
            let empty = BTreeMap::new();
            let old = before.get(name.as_str()).unwrap_or(&empty);
            let new = after.get(name.as_str()).unwrap_or(&empty);

            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            let changed: Vec<String> = keys
                .into_iter()
                .filter(|k| old.get(*k) != new.get(*k))
                .cloned()
                .collect();
            if !changed.is_empty() {
                changes.maps.push((name.clone(), changed));
            }
        }

        if !changes.is_empty() {
            debug!(
                maps = changes.maps.len(),
                "merged remote changes into shared state"
            );
        }
        for (name, keys) in &changes.maps {
            let map = self.map(name);
            map.fire(keys.clone(), ChangeOrigin::Remote);
        }
        Ok(changes)
    }

    fn map(&self, name: &str) -> Rc<AutomergeMap> {
        self.maps
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(AutomergeMap::new(name, self.doc.clone())))
            .clone()
    }

    /// Scalar contents of every named map under ROOT.
    fn contents(&self) -> Result<HashMap<String, BTreeMap<String, Vec<u8>>>> {
        let doc = self.doc.borrow();
        let mut all = HashMap::new();
        let names: Vec<String> = doc.keys(ROOT).collect();
        for name in names {
            let obj = match doc.get(ROOT, &name)? {
                Some((Value::Object(ObjType::Map), obj)) => obj,
                _ => continue,
            };
            let mut contents = BTreeMap::new();
            for key in doc.keys(&obj) {
                if let Some((Value::Scalar(s), _)) = doc.get(&obj, &key)? {
                    if let Some(bytes) = s.to_bytes() {
                        contents.insert(key.clone(), bytes.to_vec());
                    }
                }
            }
            all.insert(name, contents);
        }
        Ok(all)
    }
}

impl CrdtRoot for AutomergeRoot {
    fn get_map(&self, name: &str) -> Rc<dyn CrdtMap> {
        self.map(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::DOCUMENT_MAP;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn contents_of(root: &AutomergeRoot) -> Vec<(String, Vec<u8>)> {
        root.get_map(DOCUMENT_MAP).entries().unwrap()
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let root = AutomergeRoot::shared();
        let map = root.get_map(DOCUMENT_MAP);

        map.set("k", vec![1, 2, 3]).unwrap();
        assert_eq!(map.get("k").unwrap(), Some(vec![1, 2, 3]));

        map.set("k", vec![9]).unwrap();
        assert_eq!(map.get("k").unwrap(), Some(vec![9]));

        map.delete("k").unwrap();
        assert_eq!(map.get("k").unwrap(), None);
        assert!(map.entries().unwrap().is_empty());
    }

    #[test]
    fn sequential_history_converges_regardless_of_merge_direction() {
        let a = AutomergeRoot::shared();
        let map_a = a.get_map(DOCUMENT_MAP);
        map_a.set("k", b"v1".to_vec()).unwrap();
        map_a.set("k", b"v2".to_vec()).unwrap();
        map_a.delete("k").unwrap();

        // B receives the same causal history through a merge.
        let b = AutomergeRoot::shared();
        b.merge_remote(&mut a.fork()).unwrap();
        a.merge_remote(&mut b.fork()).unwrap();

        assert_eq!(contents_of(&a), contents_of(&b));
        assert!(contents_of(&a).is_empty());
    }

    #[test]
    fn concurrent_writes_converge_to_one_winner() {
        let a = AutomergeRoot::shared();
        let b = AutomergeRoot::shared();

        a.get_map(DOCUMENT_MAP).set("k", b"from-a".to_vec()).unwrap();
        b.get_map(DOCUMENT_MAP).set("k", b"from-b".to_vec()).unwrap();

        a.merge_remote(&mut b.fork()).unwrap();
        b.merge_remote(&mut a.fork()).unwrap();

        let va = a.get_map(DOCUMENT_MAP).get("k").unwrap();
        let vb = b.get_map(DOCUMENT_MAP).get("k").unwrap();
        assert_eq!(va, vb);
        assert!(va == Some(b"from-a".to_vec()) || va == Some(b"from-b".to_vec()));
    }

    #[test]
    fn remote_merge_fires_events_with_changed_keys() {
        let a = AutomergeRoot::shared();
        let b = AutomergeRoot::shared();
        b.get_map(DOCUMENT_MAP).set("x", vec![1]).unwrap();
        b.get_map(DOCUMENT_MAP).set("y", vec![2]).unwrap();

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        a.get_map(DOCUMENT_MAP).subscribe(Box::new(move |e| {
            assert_eq!(e.origin, ChangeOrigin::Remote);
            let mut keys = e.keys.clone();
            keys.sort();
            assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
            f.set(f.get() + 1);
        }));

        let changes = a.merge_remote(&mut b.fork()).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(changes.keys_for(DOCUMENT_MAP).len(), 2);

        // Merging the same history again is a no-op.
        let changes = a.merge_remote(&mut b.fork()).unwrap();
        assert!(changes.is_empty());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn save_load_roundtrip() {
        let root = AutomergeRoot::shared();
        root.get_map(DOCUMENT_MAP).set("k", vec![7]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.automerge");
        root.save_to(&path).unwrap();

        let loaded = AutomergeRoot::load_from(&path).unwrap();
        assert_eq!(contents_of(&loaded), contents_of(&root));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, Vec<u8>),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, proptest::collection::vec(any::<u8>(), 1..8)).prop_map(|(k, v)| Op::Set(k, v)),
            (0u8..4).prop_map(Op::Delete),
        ]
    }

    fn apply(root: &AutomergeRoot, op: &Op) {
        let map = root.get_map(DOCUMENT_MAP);
        match op {
            Op::Set(k, v) => map.set(&k.to_string(), v.clone()).unwrap(),
            Op::Delete(k) => map.delete(&k.to_string()).unwrap(),
        }
    }

    proptest! {
        #[test]
        fn any_op_split_converges(
            ops_a in proptest::collection::vec(op_strategy(), 0..12),
            ops_b in proptest::collection::vec(op_strategy(), 0..12),
        ) {
            let a = AutomergeRoot::shared();
            let b = AutomergeRoot::shared();
            for op in &ops_a {
                apply(&a, op);
            }
            for op in &ops_b {
                apply(&b, op);
            }

            a.merge_remote(&mut b.fork()).unwrap();
            b.merge_remote(&mut a.fork()).unwrap();

            prop_assert_eq!(contents_of(&a), contents_of(&b));
        }
    }
}
