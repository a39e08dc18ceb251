//! The capability set a filesystem plugs into the VFS with: enumerate
//! children, look a name up, fetch attributes, open a content stream, and
//! report whether an entry is a symlink. SquashFS and the registry hive
//! both implement it, so the façade can host either behind one `ls`/`open`
//! surface.

use std::time::SystemTime;

use crate::error::Result;

/// A backend-assigned identifier stable for the lifetime of the backend.
/// SquashFS uses its packed `(block, offset)` metadata reference;
/// the registry uses a cell index widened to `u64`.
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Other,
}

#[derive(Debug, Clone)]
pub struct Attributes {
    pub kind: EntryKind,
    /// Content length in bytes, where known (0 for directories).
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Capability set a concrete filesystem exposes to the VFS façade.
pub trait VfsBackend {
    fn root(&self) -> EntryId;

    /// Whether this backend accepts `Create`/`OpenOrCreate`/`CreateNew`
    /// and attribute mutation.
    fn is_writable(&self) -> bool {
        false
    }

    /// Whether name comparisons in `lookup`/search are case-sensitive.
    fn is_case_sensitive(&self) -> bool {
        false
    }

    fn attributes(&self, id: EntryId) -> Result<Attributes>;

    /// Children of a directory entry, as `(name, id)` pairs. "." and
    /// ".." are never included; the façade synthesizes them on request.
    fn children(&self, id: EntryId) -> Result<Vec<(String, EntryId)>>;

    /// Look up a single child by name, honoring `is_case_sensitive()`.
    /// The default implementation linear-scans `children()`; a backend
    /// with a faster hashed or indexed lookup overrides this.
    fn lookup(&self, dir: EntryId, name: &str) -> Result<Option<EntryId>> {
        let case_sensitive = self.is_case_sensitive();
        for (child_name, id) in self.children(dir)? {
            let matches = if case_sensitive {
                child_name == name
            } else {
                child_name.eq_ignore_ascii_case(name)
            };
            if matches {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// The literal link target of a symlink entry, or `None` if `id`
    /// does not name a symlink.
    fn symlink_target(&self, id: EntryId) -> Result<Option<String>>;

    /// Read up to `buf.len()` bytes of a regular file's content starting
    /// at `pos`. Returns the number of bytes copied (0 at or past EOF).
    fn read_at(&self, id: EntryId, pos: u64, buf: &mut [u8]) -> Result<usize>;
}
