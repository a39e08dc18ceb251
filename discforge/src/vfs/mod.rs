//! VFS façade: a single navigable-tree surface over whatever
//! `VfsBackend` a caller plugs in (SquashFS image, registry hive, ...).
//!
//! Path resolution: split the path, walk component by component, resolve a
//! symlink encountered mid-walk against its link's parent (or the
//! filesystem root for an absolute target), then resume walking the
//! remainder from wherever that landed.

pub mod backend;
pub mod path;
mod registry_backend;
mod squashfs_backend;

pub use backend::{Attributes, EntryId, EntryKind, VfsBackend};
pub use path::Path;
pub use registry_backend::RegistryBackend;
pub use squashfs_backend::SquashFsBackend;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{DiscforgeError, Result};

/// `MAXSYMLINKS`-equivalent: resolving a path gives up after this many
/// hops through symlinks, treating the excess as a loop.
const MAX_SYMLINK_HOPS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    OpenOrCreate,
    CreateNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// A resolved, cacheable handle to one backend entry.
#[derive(Debug, Clone)]
pub struct FileObject {
    pub id: EntryId,
    pub name: String,
    pub attributes: Attributes,
}

impl FileObject {
    pub fn is_directory(&self) -> bool {
        self.attributes.kind == EntryKind::Directory
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\')
}

/// Owns a backend and the lazily-populated cache mapping its
/// `EntryId`s to constructed `FileObject`s. The façade never invalidates
/// this cache on its own; a backend that detects out-of-band change is
/// responsible for that.
pub struct Vfs<B: VfsBackend> {
    backend: B,
    cache: RefCell<HashMap<EntryId, Rc<FileObject>>>,
}

impl<B: VfsBackend> Vfs<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn cached(&self, id: EntryId, name: &str) -> Result<Rc<FileObject>> {
        if let Some(obj) = self.cache.borrow().get(&id) {
            return Ok(Rc::clone(obj));
        }
        let attributes = self.backend.attributes(id)?;
        let obj = Rc::new(FileObject {
            id,
            name: name.to_string(),
            attributes,
        });
        self.cache.borrow_mut().insert(id, Rc::clone(&obj));
        Ok(obj)
    }

    /// The root directory's self-entry.
    pub fn root(&self) -> Result<Rc<FileObject>> {
        self.cached(self.backend.root(), "")
    }

    /// Resolve an absolute path (`/` and `\` both accepted as
    /// separators; empty, `/`, or `\` all mean the root).
    pub fn get_directory_entry(&self, path: &str) -> Result<Option<Rc<FileObject>>> {
        let path = Path::new(path);
        let components: Vec<&str> = path.components().collect();
        self.walk(self.backend.root(), String::new(), &components, 0)
    }

    fn walk(
        &self,
        dir: EntryId,
        dir_name: String,
        components: &[&str],
        hops: u32,
    ) -> Result<Option<Rc<FileObject>>> {
        let (head, rest) = match components.split_first() {
            Some(split) => split,
            None => return Ok(Some(self.cached(dir, &dir_name)?)),
        };

        let child = match self.backend.lookup(dir, head)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let attrs = self.backend.attributes(child)?;

        if attrs.kind != EntryKind::Symlink {
            return self.walk(child, head.to_string(), rest, hops);
        }

        if hops >= MAX_SYMLINK_HOPS {
            return Err(DiscforgeError::SymlinkLoop(head.to_string()));
        }
        let target = self
            .backend
            .symlink_target(child)?
            .unwrap_or_default();
        let target_path = Path::new(target.as_str());
        let target_components: Vec<&str> = target_path.components().collect();
        let (base, base_name) = if is_absolute(&target) {
            (self.backend.root(), String::new())
        } else {
            (dir, dir_name)
        };

        match self.walk(base, base_name, &target_components, hops + 1)? {
            Some(resolved) => self.walk(resolved.id, resolved.name.clone(), rest, hops + 1),
            None => Ok(None),
        }
    }

    /// Children of `path`, with synthesized `.`/`..` entries prepended
    /// the way a real directory listing would show them.
    pub fn list_directory(&self, path: &str) -> Result<Vec<Rc<FileObject>>> {
        let dir = self
            .get_directory_entry(path)?
            .ok_or_else(|| DiscforgeError::NotFound(path.to_string()))?;
        if !dir.is_directory() {
            return Err(DiscforgeError::NotSupported(format!(
                "{path} is not a directory"
            )));
        }

        let mut out = Vec::new();
        out.push(self.cached(dir.id, ".")?);

        let parent_entry = match Path::new(path).parent() {
            Some(parent_path) => self.get_directory_entry(parent_path.as_str())?,
            None => None,
        };
        out.push(Rc::new(FileObject {
            id: parent_entry.as_ref().map_or(dir.id, |p| p.id),
            name: "..".to_string(),
            attributes: parent_entry.map_or_else(|| dir.attributes.clone(), |p| p.attributes.clone()),
        }));

        for (name, id) in self.backend.children(dir.id)? {
            out.push(self.cached(id, &name)?);
        }
        Ok(out)
    }

    /// Open `path` under the given mode/access. A read-only backend
    /// accepts only `(Open, Read)`; anything else fails `NotSupported`.
    pub fn open_file(&self, path: &str, mode: OpenMode, access: Access) -> Result<Rc<FileObject>> {
        let existing = self.get_directory_entry(path)?;

        if !self.backend.is_writable() {
            if mode != OpenMode::Open || access != Access::Read {
                return Err(DiscforgeError::NotSupported(
                    "read-only backend accepts only mode=Open, access=Read".into(),
                ));
            }
            return existing.ok_or_else(|| DiscforgeError::NotFound(path.to_string()));
        }

        match (mode, existing) {
            (OpenMode::Open, Some(obj)) => Ok(obj),
            (OpenMode::Open, None) => Err(DiscforgeError::NotFound(path.to_string())),
            (OpenMode::CreateNew, Some(_)) => Err(DiscforgeError::AlreadyExists(path.to_string())),
            (OpenMode::Create, Some(obj)) | (OpenMode::OpenOrCreate, Some(obj)) => Ok(obj),
            (OpenMode::Create, None)
            | (OpenMode::OpenOrCreate, None)
            | (OpenMode::CreateNew, None) => Err(DiscforgeError::NotSupported(
                "backend does not implement file creation".into(),
            )),
        }
    }

    /// Read up to `buf.len()` bytes of `file`'s content starting at
    /// `pos`.
    pub fn read(&self, file: &FileObject, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.backend.read_at(file.id, pos, buf)
    }

    /// Recursively (or not) search `path` for entries whose name matches
    /// a `*`/`?` glob.
    pub fn search(&self, path: &str, pattern: &str, recursive: bool) -> Result<Vec<Rc<FileObject>>> {
        let start = self
            .get_directory_entry(path)?
            .ok_or_else(|| DiscforgeError::NotFound(path.to_string()))?;
        if !start.is_directory() {
            return Err(DiscforgeError::NotSupported(format!(
                "{path} is not a directory"
            )));
        }
        let mut out = Vec::new();
        self.search_dir(&start, pattern, recursive, &mut out)?;
        Ok(out)
    }

    fn search_dir(
        &self,
        dir: &FileObject,
        pattern: &str,
        recursive: bool,
        out: &mut Vec<Rc<FileObject>>,
    ) -> Result<()> {
        for (name, id) in self.backend.children(dir.id)? {
            if glob_match(pattern, &name, self.backend.is_case_sensitive()) {
                out.push(self.cached(id, &name)?);
            }
            if recursive {
                let attrs = self.backend.attributes(id)?;
                if attrs.kind == EntryKind::Directory {
                    let child = self.cached(id, &name)?;
                    self.search_dir(&child, pattern, recursive, out)?;
                }
            }
        }
        Ok(())
    }
}

fn glob_match(pattern: &str, name: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        glob_match_bytes(pattern.as_bytes(), name.as_bytes())
    } else {
        glob_match_bytes(
            pattern.to_ascii_uppercase().as_bytes(),
            name.to_ascii_uppercase().as_bytes(),
        )
    }
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_bytes(&pattern[1..], text)
                || (!text.is_empty() && glob_match_bytes(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_bytes(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match_bytes(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match("*.txt", "readme.txt", true));
        assert!(glob_match("a?c", "abc", true));
        assert!(!glob_match("a?c", "ac", true));
        assert!(glob_match("README*", "readme.md", false));
        assert!(!glob_match("README*", "readme.md", true));
    }
}
