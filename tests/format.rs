use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use evfs::{Error, Evfs};

// Only one store can be live per process; serialize the tests in this
// binary around it.
static STORE_LOCK: Mutex<()> = Mutex::new(());

fn exclusive() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    STORE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("test.db")
}

#[test]
fn create_accepts_both_cluster_size_extremes() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    let fs = Evfs::create(db_path(&dir), 64, 10, 8).expect("create with 64-byte clusters");
    fs.close().unwrap();

    let fs = Evfs::create(db_path(&dir), 4096, 10, 8).expect("create with 4096-byte clusters");
    fs.close().unwrap();
}

#[test]
fn create_rejects_bad_cluster_sizes() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    for size in [31, 127, 8192, 96] {
        match Evfs::create(db_path(&dir), size, 10, 8) {
            Err(Error::InvalidInput) => {}
            other => panic!("cluster size {} accepted: {:?}", size, other.map(|_| ())),
        }
    }
}

#[test]
fn create_rejects_one_gibibyte_stores() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    // exactly 1 GiB
    match Evfs::create(db_path(&dir), 4096, 262_144, 8) {
        Err(Error::InvalidInput) => {}
        other => panic!("1 GiB store accepted: {:?}", other.map(|_| ())),
    }
}

#[test]
fn create_with_zero_cache_blocks_works() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    let fs = Evfs::create(db_path(&dir), 128, 10, 0).unwrap();
    let handle = fs.create_entry("uncached").unwrap();
    assert_eq!(fs.write(handle, b"pass through").unwrap(), 12);
    fs.seek(handle, 0).unwrap();
    let mut buf = [0u8; 12];
    assert_eq!(fs.read(handle, &mut buf).unwrap(), 12);
    assert_eq!(&buf, b"pass through");
    fs.close().unwrap();
}

#[test]
fn double_create_fails_with_already_exists() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    let fs = Evfs::create(db_path(&dir), 128, 10, 85).unwrap();
    match Evfs::create(db_path(&dir), 128, 10, 85) {
        Err(Error::AlreadyExists) => {}
        other => panic!("double create accepted: {:?}", other.map(|_| ())),
    }
    // the first instance stays usable
    let handle = fs.create_entry("survivor").unwrap();
    assert_eq!(fs.write(handle, b"ok").unwrap(), 2);
    fs.close().unwrap();

    // and after close a new create succeeds again
    let fs = Evfs::create(db_path(&dir), 128, 10, 85).unwrap();
    fs.close().unwrap();
}

#[test]
fn open_rejects_missing_and_foreign_files() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();

    match Evfs::open(dir.path().join("absent.db"), 8) {
        Err(Error::Io(_)) => {}
        other => panic!("missing file opened: {:?}", other.map(|_| ())),
    }

    let foreign = dir.path().join("foreign.db");
    let mut file = std::fs::File::create(&foreign).unwrap();
    file.write_all(&[0x42; 4096]).unwrap();
    drop(file);
    match Evfs::open(&foreign, 8) {
        Err(Error::BadFormat) => {}
        other => panic!("foreign file opened: {:?}", other.map(|_| ())),
    }
}

#[test]
fn open_rejects_truncated_stores() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let fs = Evfs::create(&path, 128, 10, 8).unwrap();
    fs.close().unwrap();

    // chop off the last cluster so the recorded geometry disagrees
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(128 * 9).unwrap();
    drop(file);

    match Evfs::open(&path, 8) {
        Err(Error::BadFormat) => {}
        other => panic!("truncated store opened: {:?}", other.map(|_| ())),
    }
}

#[test]
fn close_releases_the_store_for_reopen() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let fs = Evfs::create(&path, 128, 10, 8).unwrap();
    fs.close().unwrap();

    let fs = Evfs::open(&path, 8).unwrap();
    let stat = fs.stat().unwrap();
    assert_eq!(stat.cluster_size(), 128);
    assert_eq!(stat.cluster_count(), 10);
    assert_eq!(stat.entries(), 0);
    fs.close().unwrap();
}

#[test]
fn drop_releases_the_store_too() {
    let _guard = exclusive();
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    {
        let _fs = Evfs::create(&path, 128, 10, 8).unwrap();
    }
    let fs = Evfs::open(&path, 8).unwrap();
    fs.close().unwrap();
}
