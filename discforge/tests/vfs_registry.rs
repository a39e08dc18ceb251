//! End-to-end coverage of the VFS façade over a registry-hive backend:
//! path resolution, directory listing with synthesized `.`/`..`, file
//! reads, and glob search, all through `discforge::vfs::Vfs` rather than
//! the registry API directly.

use std::cell::RefCell;
use std::rc::Rc;

use discforge::registry::{Hive, KeyHandle, ValueType};
use discforge::stream::MemoryStream;
use discforge::vfs::{Access, OpenMode, RegistryBackend, Vfs};

fn populated_hive() -> Rc<RefCell<Hive<MemoryStream>>> {
    let stream = Rc::new(RefCell::new(MemoryStream::new()));
    let hive = Rc::new(RefCell::new(Hive::initialize(stream).unwrap()));

    let root = KeyHandle::root(Rc::clone(&hive)).unwrap();
    let foo = root.create_sub_key("SOFTWARE\\Foo").unwrap();
    foo.create_sub_key("Bar").unwrap();
    foo.set_value("Retries", ValueType::Dword, &3u32.to_le_bytes())
        .unwrap();
    foo.set_value("Label", ValueType::String, b"hello\0")
        .unwrap();

    hive
}

#[test]
fn resolves_nested_sub_key_as_a_directory() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    let entry = vfs
        .get_directory_entry("SOFTWARE/Foo/Bar")
        .unwrap()
        .expect("sub-key should resolve");
    assert!(entry.is_directory());
}

#[test]
fn missing_path_resolves_to_none() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    assert!(vfs
        .get_directory_entry("SOFTWARE\\Nope")
        .unwrap()
        .is_none());
}

#[test]
fn list_directory_includes_dot_entries_sub_keys_and_values() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    let entries = vfs.list_directory("SOFTWARE/Foo").unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
    assert!(names.contains(&"Bar"));
    assert!(names.contains(&"Retries"));
    assert!(names.contains(&"Label"));
}

#[test]
fn reads_value_content_through_open_file() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    let file = vfs
        .open_file("SOFTWARE/Foo/Retries", OpenMode::Open, Access::Read)
        .unwrap();
    assert!(!file.is_directory());

    let mut buf = [0u8; 4];
    let n = vfs.read(&file, 0, &mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(u32::from_le_bytes(buf), 3);
}

#[test]
fn read_only_backend_rejects_write_access() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    let result = vfs.open_file("SOFTWARE/Foo", OpenMode::Open, Access::Write);
    assert!(result.is_err());
}

#[test]
fn search_matches_a_glob_across_a_subtree() {
    let hive = populated_hive();
    let vfs = Vfs::new(RegistryBackend::new(hive));

    let matches = vfs.search("SOFTWARE", "B*", true).unwrap();
    let names: Vec<&str> = matches.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Bar"]);
}
