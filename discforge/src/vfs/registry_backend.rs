//! Plugs a registry hive into the VFS façade: sub-keys present as
//! directories, values present as regular files whose content is their
//! raw bytes. Entry ids are cell indices, widened to `u64`; a value's id
//! and its owning key's id share the same index space since both are
//! just cell offsets in the same hive, so no tagging is needed to tell
//! them apart — `attributes()` only needs to decode the cell to know
//! which kind it is.

use std::cell::RefCell;
use std::rc::Rc;

use super::backend::{Attributes, EntryId, EntryKind, VfsBackend};
use crate::error::Result;
use crate::registry::{filetime_to_system_time, CellIndex, Hive, KeyHandle, ValueCell};
use crate::stream::SparseStream;

pub struct RegistryBackend<S: SparseStream> {
    hive: Rc<RefCell<Hive<S>>>,
}

impl<S: SparseStream> RegistryBackend<S> {
    pub fn new(hive: Rc<RefCell<Hive<S>>>) -> Self {
        Self { hive }
    }

    fn key_at(&self, index: CellIndex) -> KeyHandle<S> {
        KeyHandle::at(Rc::clone(&self.hive), index)
    }
}

fn pack(index: CellIndex) -> EntryId {
    index as u32 as u64
}

fn unpack(id: EntryId) -> CellIndex {
    id as u32 as i32
}

impl<S: SparseStream> VfsBackend for RegistryBackend<S> {
    fn root(&self) -> EntryId {
        pack(self.hive.borrow().root())
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn is_case_sensitive(&self) -> bool {
        false
    }

    fn attributes(&self, id: EntryId) -> Result<Attributes> {
        let key = self.key_at(unpack(id));
        if let Ok(timestamp) = key.timestamp() {
            return Ok(Attributes {
                kind: EntryKind::Directory,
                size: 0,
                modified: Some(filetime_to_system_time(timestamp)),
            });
        }
        // Not a key cell; id must name a value belonging to some key.
        let bytes = self.hive.borrow().cell_bytes(unpack(id))?;
        let value = ValueCell::decode(&bytes)?;
        Ok(Attributes {
            kind: EntryKind::Regular,
            size: value.data_length as u64,
            modified: None,
        })
    }

    fn children(&self, id: EntryId) -> Result<Vec<(String, EntryId)>> {
        let key = self.key_at(unpack(id));
        let mut out = Vec::new();
        for sub in key.sub_keys()? {
            out.push((sub.name()?, pack(sub.index())));
        }
        for (name, index) in key.value_entries()? {
            out.push((name, pack(index)));
        }
        Ok(out)
    }

    fn symlink_target(&self, _id: EntryId) -> Result<Option<String>> {
        Ok(None)
    }

    fn read_at(&self, id: EntryId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.hive.borrow().cell_bytes(unpack(id))?;
        let value = ValueCell::decode(&bytes)?;
        let data = if let Some(inline) = value.inline {
            inline[..value.data_length as usize].to_vec()
        } else {
            let raw = self.hive.borrow().cell_bytes(value.data_index)?;
            raw[..value.data_length as usize].to_vec()
        };
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }
}
