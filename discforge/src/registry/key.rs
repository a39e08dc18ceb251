//! Registry-key operations: `CreateSubKey`, `DeleteSubKey`, `SetValue`,
//! and the traversal helpers they share. A `KeyHandle` is just a
//! `(hive, cell index)` pair; callers dereference it through the hive on
//! every access rather than holding borrowed state.

use std::cell::RefCell;
use std::rc::Rc;

use super::cell::{
    CellIndex, HashedList, HashedListEntry, IndirectKind, IndirectList, KeyNodeCell, ListKind,
    SubKeyList, ValueCell, ValueType, FLAG_ROOT, NONE,
};
use super::filetime::system_time_to_filetime;
use super::hive::Hive;
use super::{HiveError, Result};
use crate::stream::SparseStream;
use discforge_codec::read_i32_le;

fn split_first_component(path: &str) -> (&str, Option<&str>) {
    let path = path.trim_start_matches(['\\', '/']);
    match path.find(['\\', '/']) {
        Some(i) => (&path[..i], Some(&path[i + 1..]).filter(|rest| !rest.is_empty())),
        None => (path, None),
    }
}

pub struct KeyHandle<S: SparseStream> {
    hive: Rc<RefCell<Hive<S>>>,
    index: CellIndex,
}

impl<S: SparseStream> Clone for KeyHandle<S> {
    fn clone(&self) -> Self {
        Self {
            hive: Rc::clone(&self.hive),
            index: self.index,
        }
    }
}

impl<S: SparseStream> KeyHandle<S> {
    pub fn root(hive: Rc<RefCell<Hive<S>>>) -> Result<Self> {
        let index = hive.borrow().root();
        Ok(Self { hive, index })
    }

    /// A handle to the key cell at `index`, without validating that it
    /// actually decodes as one.
    pub fn at(hive: Rc<RefCell<Hive<S>>>, index: CellIndex) -> Self {
        Self { hive, index }
    }

    pub fn index(&self) -> CellIndex {
        self.index
    }

    fn node(&self) -> Result<KeyNodeCell> {
        let bytes = self.hive.borrow().cell_bytes(self.index)?;
        KeyNodeCell::decode(&bytes)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.node()?.name)
    }

    /// This key's last-write timestamp. Fails if `index` does not
    /// decode as a key node (e.g. it names a value cell instead).
    pub fn timestamp(&self) -> Result<u64> {
        Ok(self.node()?.timestamp)
    }

    pub fn sub_key_count(&self) -> Result<u32> {
        Ok(self.node()?.num_sub_keys)
    }

    fn list_leaf_children(&self, list_index: CellIndex) -> Result<Vec<CellIndex>> {
        if list_index == NONE {
            return Ok(Vec::new());
        }
        let bytes = self.hive.borrow().cell_bytes(list_index)?;
        match SubKeyList::decode(&bytes)? {
            SubKeyList::Hashed(h) => Ok(h.entries.iter().map(|e| e.child).collect()),
            SubKeyList::Indirect(list) => {
                let mut out = Vec::new();
                for &sub in &list.entries {
                    match list.kind {
                        IndirectKind::Li => out.push(sub),
                        IndirectKind::Ri => out.extend(self.list_leaf_children(sub)?),
                    }
                }
                Ok(out)
            }
        }
    }

    pub fn sub_keys(&self) -> Result<Vec<KeyHandle<S>>> {
        let node = self.node()?;
        let children = self.list_leaf_children(node.sub_keys_index)?;
        Ok(children
            .into_iter()
            .map(|index| KeyHandle {
                hive: Rc::clone(&self.hive),
                index,
            })
            .collect())
    }

    pub fn sub_key_names(&self) -> Result<Vec<String>> {
        self.sub_keys()?.iter().map(|k| k.name()).collect()
    }

    pub fn open_sub_key(&self, name: &str) -> Result<Option<KeyHandle<S>>> {
        for child in self.sub_keys()? {
            if child.name()?.eq_ignore_ascii_case(name) {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    fn value_list(&self, node: &KeyNodeCell) -> Result<Vec<CellIndex>> {
        if node.value_list_index == NONE || node.num_values == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.hive.borrow().cell_bytes(node.value_list_index)?;
        Ok(bytes
            .chunks_exact(4)
            .take(node.num_values as usize)
            .map(|c| read_i32_le(c, 0).unwrap())
            .collect())
    }

    /// Value names in sorted, case-insensitive order.
    pub fn value_names(&self) -> Result<Vec<String>> {
        let node = self.node()?;
        let mut names = Vec::new();
        for index in self.value_list(&node)? {
            let bytes = self.hive.borrow().cell_bytes(index)?;
            names.push(ValueCell::decode(&bytes)?.name);
        }
        names.sort_by_key(|n| n.to_ascii_uppercase());
        Ok(names)
    }

    /// `(name, cellIndex)` for every value, sorted case-insensitively by
    /// name like `value_names()`.
    pub fn value_entries(&self) -> Result<Vec<(String, CellIndex)>> {
        let node = self.node()?;
        let mut entries = Vec::new();
        for index in self.value_list(&node)? {
            let bytes = self.hive.borrow().cell_bytes(index)?;
            entries.push((ValueCell::decode(&bytes)?.name, index));
        }
        entries.sort_by_key(|(name, _)| name.to_ascii_uppercase());
        Ok(entries)
    }

    pub fn get_value(&self, name: &str) -> Result<Option<(ValueType, Vec<u8>)>> {
        let node = self.node()?;
        for index in self.value_list(&node)? {
            let bytes = self.hive.borrow().cell_bytes(index)?;
            let vk = ValueCell::decode(&bytes)?;
            if vk.name.eq_ignore_ascii_case(name) {
                let data = if let Some(inline) = vk.inline {
                    inline[..vk.data_length as usize].to_vec()
                } else {
                    let raw = self.hive.borrow().cell_bytes(vk.data_index)?;
                    raw[..vk.data_length as usize].to_vec()
                };
                return Ok(Some((vk.data_type, data)));
            }
        }
        Ok(None)
    }

    /// Insert or overwrite a value, keeping the value-list's name order
    /// case-insensitively sorted.
    pub fn set_value(&self, name: &str, data_type: ValueType, data: &[u8]) -> Result<()> {
        let node = self.node()?;
        let mut indices = self.value_list(&node)?;

        let mut existing_slot = None;
        let mut existing_vk = None;
        for (slot, &idx) in indices.iter().enumerate() {
            let bytes = self.hive.borrow().cell_bytes(idx)?;
            let decoded = ValueCell::decode(&bytes)?;
            if decoded.name.eq_ignore_ascii_case(name) {
                existing_slot = Some(slot);
                existing_vk = Some(decoded);
                break;
            }
        }

        let inline = data.len() <= 4
            && matches!(data_type, ValueType::Dword | ValueType::DwordBigEndian);
        let vk = if inline {
            let mut buf = [0u8; 4];
            buf[..data.len()].copy_from_slice(data);
            ValueCell::new_inline(name.to_string(), data_type, buf, data.len() as u32)
        } else {
            let data_index = self.hive.borrow_mut().allocate(data.len() as u32)?;
            self.hive.borrow_mut().update(data_index, data, true)?;
            ValueCell::new_indexed(name.to_string(), data_type, data_index, data.len() as u32)
        };
        let encoded = vk.encode();

        // The old out-of-line data cell, if any, is superseded regardless
        // of whether the new value is inline or indexed.
        if let Some(old) = &existing_vk {
            if let Some(old_data_index) = old.inline.is_none().then_some(old.data_index) {
                self.hive.borrow_mut().free(old_data_index)?;
            }
        }

        if let Some(slot) = existing_slot {
            let idx = indices[slot];
            indices[slot] = self.hive.borrow_mut().update(idx, &encoded, true)?;
        } else {
            let idx = self.hive.borrow_mut().allocate(encoded.len() as u32)?;
            self.hive.borrow_mut().write_cell(idx, &encoded)?;
            indices.push(idx);
            indices.sort_by_cached_key(|&idx| {
                self.hive
                    .borrow()
                    .cell_bytes(idx)
                    .ok()
                    .and_then(|b| ValueCell::decode(&b).ok())
                    .map(|v| v.name.to_ascii_uppercase())
                    .unwrap_or_default()
            });
        }

        let mut packed = Vec::with_capacity(indices.len() * 4);
        for idx in &indices {
            packed.extend_from_slice(&idx.to_le_bytes());
        }
        let list_index = if node.value_list_index == NONE {
            let idx = self.hive.borrow_mut().allocate(packed.len() as u32)?;
            self.hive.borrow_mut().write_cell(idx, &packed)?;
            idx
        } else {
            self.hive
                .borrow_mut()
                .update(node.value_list_index, &packed, true)?
        };

        let mut updated = node;
        updated.value_list_index = list_index;
        updated.num_values = indices.len() as u32;
        self.rewrite_node(&updated)
    }

    fn rewrite_node(&self, node: &KeyNodeCell) -> Result<()> {
        let encoded = node.encode();
        let new_index = self.hive.borrow_mut().update(self.index, &encoded, true)?;
        if new_index != self.index {
            return Err(HiveError::Corrupt(
                "key node relocated mid-operation; caller must refresh its handle".into(),
            ));
        }
        Ok(())
    }

    /// Case-insensitive name of the key stored at `index`, for sorting
    /// sub-key list entries by name.
    fn child_name(&self, index: CellIndex) -> String {
        self.hive
            .borrow()
            .cell_bytes(index)
            .ok()
            .and_then(|b| KeyNodeCell::decode(&b).ok())
            .map(|n| n.name.to_ascii_uppercase())
            .unwrap_or_default()
    }

    fn ensure_lf_list(&self, node: &mut KeyNodeCell, child: CellIndex, name: &str) -> Result<()> {
        let hash = HashedList::name_hash(ListKind::Lf, name);
        if node.sub_keys_index == NONE {
            let list = HashedList {
                kind: ListKind::Lf,
                entries: vec![HashedListEntry {
                    child,
                    name_hash: hash,
                }],
            };
            let encoded = list.encode();
            let idx = self.hive.borrow_mut().allocate(encoded.len() as u32)?;
            self.hive.borrow_mut().write_cell(idx, &encoded)?;
            node.sub_keys_index = idx;
            return Ok(());
        }

        let bytes = self.hive.borrow().cell_bytes(node.sub_keys_index)?;
        match SubKeyList::decode(&bytes)? {
            SubKeyList::Hashed(mut list) => {
                list.entries.push(HashedListEntry {
                    child,
                    name_hash: hash,
                });
                list.entries
                    .sort_by_cached_key(|e| self.child_name(e.child));
                let encoded = list.encode();
                let new_idx = self
                    .hive
                    .borrow_mut()
                    .update(node.sub_keys_index, &encoded, true)?;
                node.sub_keys_index = new_idx;
                Ok(())
            }
            SubKeyList::Indirect(mut list) if list.kind == IndirectKind::Li => {
                list.entries.push(child);
                list.entries.sort_by_cached_key(|&idx| self.child_name(idx));
                let encoded = list.encode();
                let new_idx = self
                    .hive
                    .borrow_mut()
                    .update(node.sub_keys_index, &encoded, true)?;
                node.sub_keys_index = new_idx;
                Ok(())
            }
            SubKeyList::Indirect(_) => Err(HiveError::Corrupt(
                "ri (indirect-of-indirect) sub-key lists are not produced by this writer".into(),
            )),
        }
    }

    /// Create (or return, if it already exists) the key named by `path`,
    /// creating every missing intermediate key along the way.
    pub fn create_sub_key(&self, path: &str) -> Result<KeyHandle<S>> {
        let (first, rest) = split_first_component(path);
        if first.is_empty() {
            return Ok(self.clone());
        }

        let child = match self.open_sub_key(first)? {
            Some(child) => child,
            None => {
                let mut node = self.node()?;
                let new_node = KeyNodeCell {
                    flags: 0,
                    timestamp: system_time_to_filetime(std::time::SystemTime::now()),
                    parent: self.index,
                    sub_keys_index: NONE,
                    num_sub_keys: 0,
                    value_list_index: NONE,
                    num_values: 0,
                    security_index: node.security_index,
                    class_name_index: NONE,
                    class_name_length: 0,
                    max_name_len: 0,
                    max_class_len: 0,
                    max_value_name_len: 0,
                    max_value_data_len: 0,
                    name: first.to_string(),
                };
                let encoded = new_node.encode();
                let child_index = self.hive.borrow_mut().allocate(encoded.len() as u32)?;
                self.hive.borrow_mut().write_cell(child_index, &encoded)?;

                self.ensure_lf_list(&mut node, child_index, first)?;
                node.num_sub_keys += 1;
                self.rewrite_node(&node)?;

                KeyHandle {
                    hive: Rc::clone(&self.hive),
                    index: child_index,
                }
            }
        };

        match rest {
            Some(rest) => child.create_sub_key(rest),
            None => Ok(child),
        }
    }

    pub fn open_path(&self, path: &str) -> Result<Option<KeyHandle<S>>> {
        let (first, rest) = split_first_component(path);
        if first.is_empty() {
            return Ok(Some(self.clone()));
        }
        match self.open_sub_key(first)? {
            Some(child) => match rest {
                Some(rest) => child.open_path(rest),
                None => Ok(Some(child)),
            },
            None => Ok(None),
        }
    }

    fn free_security(&self, security_index: CellIndex) -> Result<()> {
        if security_index == NONE {
            return Ok(());
        }
        let bytes = self.hive.borrow().cell_bytes(security_index)?;
        let mut sk = super::cell::SecurityCell::decode(&bytes)?;
        if sk.usage_count > 1 {
            sk.usage_count -= 1;
            self.hive
                .borrow_mut()
                .update(security_index, &sk.encode(), false)?;
            return Ok(());
        }
        // Last reference: unlink from the ring and free.
        if sk.prev != NONE && sk.prev != security_index {
            let prev_bytes = self.hive.borrow().cell_bytes(sk.prev)?;
            let mut prev = super::cell::SecurityCell::decode(&prev_bytes)?;
            prev.next = sk.next;
            self.hive.borrow_mut().update(sk.prev, &prev.encode(), false)?;
        }
        if sk.next != NONE && sk.next != security_index {
            let next_bytes = self.hive.borrow().cell_bytes(sk.next)?;
            let mut next = super::cell::SecurityCell::decode(&next_bytes)?;
            next.prev = sk.prev;
            self.hive.borrow_mut().update(sk.next, &next.encode(), false)?;
        }
        self.hive.borrow_mut().free(security_index)
    }

    /// Delete the key named by `path`. Deletion of a key with children is
    /// forbidden regardless of `throw_if_missing`.
    pub fn delete_sub_key(&self, path: &str, throw_if_missing: bool) -> Result<()> {
        let (first, rest) = split_first_component(path);
        if let Some(rest) = rest {
            let child = self.open_sub_key(first)?;
            return match child {
                Some(child) => child.delete_sub_key(rest, throw_if_missing),
                None if throw_if_missing => {
                    Err(HiveError::NotFound(format!("sub-key {first} not found")))
                }
                None => Ok(()),
            };
        }

        let target = match self.open_sub_key(first)? {
            Some(t) => t,
            None if throw_if_missing => {
                return Err(HiveError::NotFound(format!("sub-key {first} not found")))
            }
            None => return Ok(()),
        };

        let target_node = target.node()?;
        if target_node.num_sub_keys > 0 {
            return Err(HiveError::HasChildren(first.to_string()));
        }

        for index in target.value_list(&target_node)? {
            let bytes = self.hive.borrow().cell_bytes(index)?;
            let vk = ValueCell::decode(&bytes)?;
            if vk.inline.is_none() {
                self.hive.borrow_mut().free(vk.data_index)?;
            }
            self.hive.borrow_mut().free(index)?;
        }
        if target_node.value_list_index != NONE {
            self.hive.borrow_mut().free(target_node.value_list_index)?;
        }
        if target_node.class_name_index != NONE {
            self.hive.borrow_mut().free(target_node.class_name_index)?;
        }
        self.free_security(target_node.security_index)?;
        if target_node.sub_keys_index != NONE {
            self.hive.borrow_mut().free(target_node.sub_keys_index)?;
        }
        self.hive.borrow_mut().free(target.index)?;

        let mut parent_node = self.node()?;
        self.remove_from_sub_key_list(&mut parent_node, target.index)?;
        parent_node.num_sub_keys = parent_node.num_sub_keys.saturating_sub(1);
        self.rewrite_node(&parent_node)
    }

    fn remove_from_sub_key_list(&self, node: &mut KeyNodeCell, child: CellIndex) -> Result<()> {
        if node.sub_keys_index == NONE {
            return Ok(());
        }
        let bytes = self.hive.borrow().cell_bytes(node.sub_keys_index)?;
        match SubKeyList::decode(&bytes)? {
            SubKeyList::Hashed(mut list) => {
                list.entries.retain(|e| e.child != child);
                if list.entries.is_empty() {
                    self.hive.borrow_mut().free(node.sub_keys_index)?;
                    node.sub_keys_index = NONE;
                } else {
                    let encoded = list.encode();
                    node.sub_keys_index =
                        self.hive.borrow_mut().update(node.sub_keys_index, &encoded, true)?;
                }
                Ok(())
            }
            SubKeyList::Indirect(mut list) => {
                list.entries.retain(|&e| e != child);
                if list.entries.is_empty() {
                    self.hive.borrow_mut().free(node.sub_keys_index)?;
                    node.sub_keys_index = NONE;
                } else {
                    let encoded = list.encode();
                    node.sub_keys_index =
                        self.hive.borrow_mut().update(node.sub_keys_index, &encoded, true)?;
                }
                Ok(())
            }
        }
    }

    pub fn is_root(&self) -> Result<bool> {
        Ok(self.node()?.flags & FLAG_ROOT != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn new_hive() -> Rc<RefCell<Hive<MemoryStream>>> {
        let stream = Rc::new(RefCell::new(MemoryStream::new()));
        Rc::new(RefCell::new(Hive::initialize(stream).unwrap()))
    }

    #[test]
    fn create_sub_key_builds_missing_intermediates() {
        let hive = new_hive();
        let root = KeyHandle::root(hive).unwrap();
        root.create_sub_key("SOFTWARE\\Foo\\Bar").unwrap();

        let software = root.open_sub_key("SOFTWARE").unwrap().unwrap();
        assert_eq!(software.sub_key_count().unwrap(), 1);
        let foo = software.open_sub_key("Foo").unwrap().unwrap();
        assert_eq!(foo.sub_key_count().unwrap(), 1);
        assert!(foo.open_sub_key("Bar").unwrap().is_some());
    }

    #[test]
    fn set_then_get_value_round_trips_and_sorts_names() {
        let hive = new_hive();
        let root = KeyHandle::root(hive).unwrap();
        let key = root.create_sub_key("Config").unwrap();

        key.set_value("Retries", ValueType::Dword, &3u32.to_le_bytes())
            .unwrap();
        key.set_value("Label", ValueType::String, b"hello\0").unwrap();

        let (ty, data) = key.get_value("retries").unwrap().unwrap();
        assert_eq!(ty, ValueType::Dword);
        assert_eq!(u32::from_le_bytes(data.try_into().unwrap()), 3);

        let names = key.value_names().unwrap();
        assert_eq!(names, vec!["Label".to_string(), "Retries".to_string()]);
    }

    #[test]
    fn overwriting_a_value_frees_its_old_out_of_line_data_cell() {
        let hive = new_hive();
        let root = KeyHandle::root(hive).unwrap();
        let key = root.create_sub_key("Config").unwrap();

        key.set_value("Blob", ValueType::Binary, &[1u8; 64]).unwrap();
        let (_, first) = key.get_value("Blob").unwrap().unwrap();
        assert_eq!(first.len(), 64);

        key.set_value("Blob", ValueType::Binary, &[2u8; 16]).unwrap();
        let (ty, second) = key.get_value("Blob").unwrap().unwrap();
        assert_eq!(ty, ValueType::Binary);
        assert_eq!(second, vec![2u8; 16]);
        assert_eq!(key.value_names().unwrap(), vec!["Blob".to_string()]);
    }

    #[test]
    fn delete_sub_key_with_children_is_forbidden() {
        let hive = new_hive();
        let root = KeyHandle::root(hive).unwrap();
        root.create_sub_key("A\\B").unwrap();
        assert!(matches!(
            root.delete_sub_key("A", false),
            Err(HiveError::HasChildren(_))
        ));
    }

    #[test]
    fn delete_leaf_sub_key_updates_parent_count() {
        let hive = new_hive();
        let root = KeyHandle::root(hive).unwrap();
        root.create_sub_key("A\\B").unwrap();
        let a = root.open_sub_key("A").unwrap().unwrap();
        a.delete_sub_key("B", true).unwrap();
        assert_eq!(a.sub_key_count().unwrap(), 0);
    }
}
