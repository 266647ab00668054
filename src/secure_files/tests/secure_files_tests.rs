use super::*;
use std::os::unix::fs::symlink;
use tempfile::TempDir;

fn mode_of(path: &Path) -> u32 {
    fs::symlink_metadata(path).unwrap().mode() & 0o7777
}

/// Names of siblings of `path` that were quarantined with `suffix`.
fn quarantined(path: &Path, suffix: &str) -> Vec<PathBuf> {
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let mut found: Vec<PathBuf> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| {
            let other = p.file_name().unwrap().to_string_lossy().into_owned();
            other.starts_with(&format!("{}-", name)) && other.ends_with(&format!("-{}", suffix))
        })
        .collect();
    found.sort();
    found
}

fn write_with_mode(path: &Path, contents: &str, mode: u32) {
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, Permissions::from_mode(mode)).unwrap();
}

#[test]
fn test_suffixed_path_format() {
    let path = suffixed_path(Path::new("/run/geopm-service/session-1.json"), "INVALID");
    let text = path.to_string_lossy().into_owned();
    let rest = text
        .strip_prefix("/run/geopm-service/session-1.json-")
        .unwrap();
    let uuid = rest.strip_suffix("-INVALID").unwrap();
    assert!(uuid::Uuid::parse_str(uuid).is_ok(), "{text}");
}

#[test]
fn test_make_dirs_creates_with_exact_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a").join("b");
    secure_make_dirs(&path, 0o711).unwrap();

    let meta = fs::symlink_metadata(&path).unwrap();
    assert!(meta.is_dir());
    assert_eq!(meta.mode() & 0o7777, 0o711);
    assert_eq!(meta.uid(), daemon_uid());
    assert_eq!(meta.gid(), daemon_gid());
    assert_eq!(mode_of(&dir.path().join("a")), 0o711);
}

#[test]
fn test_make_dirs_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run");
    secure_make_dirs(&path, 0o700).unwrap();
    fs::write(path.join("keep"), "x").unwrap();
    secure_make_dirs(&path, 0o700).unwrap();

    assert!(path.join("keep").exists());
    assert!(quarantined(&path, INVALID_SUFFIX).is_empty());
}

#[test]
fn test_make_dirs_quarantines_wrong_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run");
    fs::create_dir(&path).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(0o777)).unwrap();
    fs::write(path.join("planted"), "x").unwrap();

    secure_make_dirs(&path, 0o711).unwrap();

    assert_eq!(mode_of(&path), 0o711);
    assert!(!path.join("planted").exists());
    let moved = quarantined(&path, INVALID_SUFFIX);
    assert_eq!(moved.len(), 1);
    assert!(moved[0].join("planted").exists());
}

#[test]
fn test_make_dirs_quarantines_symlink_and_regular_file() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("elsewhere");
    fs::create_dir(&target).unwrap();
    let link = dir.path().join("linked");
    symlink(&target, &link).unwrap();
    let file = dir.path().join("plain");
    fs::write(&file, "x").unwrap();

    secure_make_dirs(&link, 0o700).unwrap();
    secure_make_dirs(&file, 0o700).unwrap();

    assert!(fs::symlink_metadata(&link).unwrap().is_dir());
    assert!(fs::symlink_metadata(&file).unwrap().is_dir());
    assert_eq!(quarantined(&link, INVALID_SUFFIX).len(), 1);
    assert_eq!(quarantined(&file, INVALID_SUFFIX).len(), 1);
    assert!(target.exists());
}

#[test]
fn test_make_file_writes_contents_and_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session-1.json");
    secure_make_file(&path, b"{}").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    assert_eq!(mode_of(&path), SECURE_FILE_MODE);
    assert!(quarantined(&path, TMP_SUFFIX).is_empty());
}

#[test]
fn test_make_file_replaces_existing_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("CONTROL_LOCK");
    write_with_mode(&path, "old contents", 0o644);

    secure_make_file(&path, b"new").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    assert_eq!(mode_of(&path), SECURE_FILE_MODE);
}

#[test]
fn test_make_file_missing_parent_fails_without_leftovers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent").join("file");
    assert!(secure_make_file(&path, b"x").is_err());
    assert!(!dir.path().join("absent").exists());
}

#[test]
fn test_read_missing_file_is_none() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nothing");
    assert_eq!(secure_read_file(&path).unwrap(), None);
    assert!(quarantined(&path, INVALID_SUFFIX).is_empty());
}

#[test]
fn test_read_trusted_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("allowed_signals");
    secure_make_file(&path, b"TIME\nENERGY_PACKAGE\n").unwrap();
    assert_eq!(
        secure_read_file(&path).unwrap().as_deref(),
        Some("TIME\nENERGY_PACKAGE\n")
    );
}

#[test]
fn test_read_wrong_mode_is_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session-4000.json");
    write_with_mode(&path, "{}", 0o644);

    assert_eq!(secure_read_file(&path).unwrap(), None);
    assert!(!path.exists());
    let moved = quarantined(&path, INVALID_SUFFIX);
    assert_eq!(moved.len(), 1);
    assert_eq!(fs::read_to_string(&moved[0]).unwrap(), "{}");
}

#[test]
fn test_read_symlink_is_quarantined_and_target_untouched() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("target");
    write_with_mode(&target, "secret", 0o600);
    let link = dir.path().join("link");
    symlink(&target, &link).unwrap();

    assert_eq!(secure_read_file(&link).unwrap(), None);
    assert!(fs::symlink_metadata(&link).is_err());
    assert_eq!(quarantined(&link, INVALID_SUFFIX).len(), 1);
    assert_eq!(fs::read_to_string(&target).unwrap(), "secret");
}

#[test]
fn test_read_fifo_is_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fifo");
    nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

    assert_eq!(secure_read_file(&path).unwrap(), None);
    assert_eq!(quarantined(&path, INVALID_SUFFIX).len(), 1);
}

#[test]
fn test_read_non_utf8_is_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("binary");
    secure_make_file(&path, &[0xff, 0xfe, 0x00]).unwrap();

    assert_eq!(secure_read_file(&path).unwrap(), None);
    assert_eq!(quarantined(&path, INVALID_SUFFIX).len(), 1);
}

#[test]
fn test_remove_if_exists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch-status-1-in");
    fs::write(&path, "").unwrap();
    assert!(remove_if_exists(&path).unwrap());
    assert!(!remove_if_exists(&path).unwrap());
}
