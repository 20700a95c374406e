use std::sync::Arc;

use tempfile::tempdir;
use zns_lfs::device::{FileBackedDevice, Geometry};
use zns_lfs::ftl::{Ftl, FtlParams};
use zns_lfs::Filesystem;

fn small_geometry() -> Geometry {
    Geometry {
        zones: 24,
        blocks_per_zone: 8,
        lba_size: 512,
        mdts: 4096,
    }
}

fn mount_fresh(geometry: Geometry) -> (Filesystem, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("device.img");
    let device = FileBackedDevice::open(&path, geometry, true).unwrap();
    let ftl = Ftl::init(
        Arc::new(device),
        FtlParams {
            log_zones: 4,
            gc_watermark: 0.25,
            force_reset: true,
        },
    )
    .unwrap();
    let fs = Filesystem::mount(ftl).unwrap();
    (fs, dir)
}

#[test]
fn root_exists_on_fresh_mount() {
    let (fs, _dir) = mount_fresh(small_geometry());
    assert!(fs.exists("/"));
    assert_eq!(fs.get_children("/").unwrap(), Vec::<String>::new());
}

#[test]
fn create_and_list_directory() {
    let (fs, _dir) = mount_fresh(small_geometry());
    fs.create_dir("/a").unwrap();
    assert!(fs.exists("/a"));
    assert_eq!(fs.get_children("/").unwrap(), vec!["a".to_string()]);

    // Creating the same directory again is an error...
    assert!(fs.create_dir("/a").is_err());
    // ...but create_dir_if_missing tolerates it.
    fs.create_dir_if_missing("/a").unwrap();
}

#[test]
fn write_then_read_round_trips() {
    let (fs, _dir) = mount_fresh(small_geometry());
    fs.create_dir("/a").unwrap();
    {
        let mut f = fs.open_writable("/a/hello.txt", false).unwrap();
        f.append(b"hello, ").unwrap();
        f.append(b"world").unwrap();
        f.close().unwrap();
    }
    assert_eq!(fs.read_file("/a/hello.txt").unwrap(), b"hello, world");
}

#[test]
fn append_mode_extends_existing_file() {
    let (fs, _dir) = mount_fresh(small_geometry());
    {
        let mut f = fs.open_writable("/note.txt", false).unwrap();
        f.append(b"first").unwrap();
    }
    {
        let mut f = fs.open_writable("/note.txt", true).unwrap();
        f.append(b"second").unwrap();
    }
    assert_eq!(fs.read_file("/note.txt").unwrap(), b"firstsecond");
}

#[test]
fn overwrite_without_append_truncates() {
    let (fs, _dir) = mount_fresh(small_geometry());
    {
        let mut f = fs.open_writable("/note.txt", false).unwrap();
        f.append(b"a long first version").unwrap();
    }
    {
        let mut f = fs.open_writable("/note.txt", false).unwrap();
        f.append(b"short").unwrap();
    }
    assert_eq!(fs.read_file("/note.txt").unwrap(), b"short");
}

#[test]
fn rename_moves_entry_and_preserves_content() {
    let (fs, _dir) = mount_fresh(small_geometry());
    fs.create_dir("/a").unwrap();
    {
        let mut f = fs.open_writable("/a/old.txt", false).unwrap();
        f.append(b"payload").unwrap();
    }
    fs.rename("/a/old.txt", "/a/new.txt").unwrap();
    assert!(!fs.exists("/a/old.txt"));
    assert!(fs.exists("/a/new.txt"));
    assert_eq!(fs.read_file("/a/new.txt").unwrap(), b"payload");
}

#[test]
fn delete_removes_entry() {
    let (fs, _dir) = mount_fresh(small_geometry());
    {
        let mut f = fs.open_writable("/gone.txt", false).unwrap();
        f.append(b"bye").unwrap();
    }
    fs.delete("/gone.txt").unwrap();
    assert!(!fs.exists("/gone.txt"));
    assert!(fs.delete("/gone.txt").is_err());
}

#[test]
fn lock_is_exclusive_and_releasable() {
    let (fs, _dir) = mount_fresh(small_geometry());
    fs.lock("/LOCK").unwrap();
    assert!(fs.lock("/LOCK").is_err());
    fs.unlock("/LOCK").unwrap();
    fs.lock("/LOCK").unwrap();
}

#[test]
fn lookup_of_missing_path_is_not_found() {
    let (fs, _dir) = mount_fresh(small_geometry());
    assert!(matches!(
        fs.read_file("/nope.txt"),
        Err(zns_lfs::Error::NotFound)
    ));
}

#[test]
fn many_small_files_survive_background_gc() {
    // Enough files, each forcing at least one log-zone append, to run
    // the log ring past its watermark and exercise the FTL's
    // background GC merge path while the filesystem keeps writing.
    let (fs, _dir) = mount_fresh(small_geometry());
    fs.create_dir("/many").unwrap();
    let mut names = Vec::new();
    for i in 0..80 {
        let name = format!("/many/file{i}.txt");
        let content = format!("contents of file {i}").into_bytes();
        {
            let mut f = fs.open_writable(&name, false).unwrap();
            f.append(&content).unwrap();
            f.close().unwrap();
        }
        names.push((name, content));
    }
    for (name, content) in &names {
        assert_eq!(&fs.read_file(name).unwrap(), content);
    }
    assert!(
        fs.ftl().gc_cycles_completed() > 0,
        "expected at least one background GC merge cycle to have run"
    );
}

#[test]
fn ftl_read_write_round_trip_below_filesystem_layer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raw.img");
    let geometry = small_geometry();
    let device = FileBackedDevice::open(&path, geometry, true).unwrap();
    let ftl = Ftl::init(
        Arc::new(device),
        FtlParams {
            log_zones: 4,
            gc_watermark: 0.25,
            force_reset: true,
        },
    )
    .unwrap();
    let lba_size = geometry.lba_size as usize;
    let payload = vec![0xABu8; lba_size * 2];
    ftl.write(0, &payload, payload.len()).unwrap();
    let mut out = vec![0u8; payload.len()];
    ftl.read(0, &mut out, out.len()).unwrap();
    assert_eq!(out, payload);
    ftl.deinit();
}
