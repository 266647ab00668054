use super::*;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use tempfile::TempDir;

fn lock_path(dir: &TempDir) -> PathBuf {
    dir.path().join("CONTROL_LOCK")
}

fn invalid_copies(dir: &TempDir) -> usize {
    fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| {
            let name = entry.as_ref().unwrap().file_name();
            let name = name.to_string_lossy();
            name.starts_with("CONTROL_LOCK-") && name.ends_with("-INVALID")
        })
        .count()
}

#[test]
fn test_claim_contest_and_release() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    {
        let mut lock = WriteLock::acquire(&path).unwrap();
        assert_eq!(lock.try_lock(None).unwrap(), None);
        assert_eq!(lock.try_lock(Some(1000)).unwrap(), Some(1000));
        assert_eq!(lock.try_lock(Some(2000)).unwrap(), Some(1000));
    }
    assert_eq!(fs::read_to_string(&path).unwrap(), "1000");
    assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o600);

    let mut lock = WriteLock::acquire(&path).unwrap();
    assert!(lock.unlock(2000).is_err());
    assert_eq!(lock.try_lock(None).unwrap(), Some(1000));
    lock.unlock(1000).unwrap();
    assert!(lock.unlock(1000).is_err());
    drop(lock);
    assert_eq!(fs::read_to_string(&path).unwrap(), "");
}

#[test]
fn test_nested_scope_rejected() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    let outer = WriteLock::acquire(&path).unwrap();
    let err = WriteLock::acquire(&path).err().unwrap();
    assert!(matches!(err, ServiceError::ArgumentInvalid { .. }), "{err}");
    drop(outer);
    assert!(WriteLock::acquire(&path).is_ok());
}

#[test]
fn test_scopes_on_different_files_are_independent() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let _a = WriteLock::acquire(&lock_path(&first)).unwrap();
    assert!(WriteLock::acquire(&lock_path(&second)).is_ok());
}

#[test]
fn test_advisory_lock_held_for_scope() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    let lock = WriteLock::acquire(&path).unwrap();
    let other = File::open(&path).unwrap();
    assert!(other.try_lock_exclusive().is_err());
    drop(lock);
    assert!(other.try_lock_exclusive().is_ok());
}

#[test]
fn test_trailing_newline_tolerated() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    drop(WriteLock::acquire(&path).unwrap());
    fs::write(&path, "5001\n").unwrap();

    let mut lock = WriteLock::acquire(&path).unwrap();
    assert_eq!(lock.try_lock(Some(1000)).unwrap(), Some(5001));
}

#[test]
fn test_garbage_contents_treated_as_free() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    drop(WriteLock::acquire(&path).unwrap());
    fs::write(&path, "not a pid").unwrap();

    let mut lock = WriteLock::acquire(&path).unwrap();
    assert_eq!(lock.try_lock(Some(1000)).unwrap(), Some(1000));
    drop(lock);
    assert_eq!(fs::read_to_string(&path).unwrap(), "1000");
}

#[test]
fn test_insecure_lock_file_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    fs::write(&path, "666").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

    let mut lock = WriteLock::acquire(&path).unwrap();
    assert_eq!(lock.try_lock(None).unwrap(), None);
    assert_eq!(invalid_copies(&dir), 1);
}

#[test]
fn test_symlinked_lock_file_quarantined() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("target");
    fs::write(&target, "").unwrap();
    let path = lock_path(&dir);
    symlink(&target, &path).unwrap();

    let mut lock = WriteLock::acquire(&path).unwrap();
    assert_eq!(lock.try_lock(Some(7)).unwrap(), Some(7));
    drop(lock);
    assert_eq!(invalid_copies(&dir), 1);
    assert_eq!(fs::read_to_string(&target).unwrap(), "");
}

#[test]
fn test_missing_run_root_fails_and_releases_registration() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent").join("CONTROL_LOCK");
    let err = WriteLock::acquire(&path).err().unwrap();
    assert!(matches!(err, ServiceError::Internal { .. }), "{err}");
    let err = WriteLock::acquire(&path).err().unwrap();
    assert!(matches!(err, ServiceError::Internal { .. }), "{err}");
}

#[test]
fn test_scope_released_on_panic() {
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    let panicking = path.clone();
    let result = std::panic::catch_unwind(move || {
        let _lock = WriteLock::acquire(&panicking).unwrap();
        panic!("handler failed inside scope");
    });
    assert!(result.is_err());
    assert!(WriteLock::acquire(&path).is_ok());
}
