use std::{
    collections::BTreeSet,
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use crate::domain::normalize_keys;

pub const SSH_DIR_MODE: u32 = 0o700;
pub const AUTHORIZED_KEYS_MODE: u32 = 0o644;

pub fn authorized_keys_path(home: &Path) -> PathBuf {
    home.join(".ssh").join("authorized_keys")
}

/// A missing file reads as no keys.
pub fn read_authorized_keys(home: &Path) -> io::Result<BTreeSet<String>> {
    match fs::read_to_string(authorized_keys_path(home)) {
        Ok(contents) => Ok(normalize_keys(contents.lines())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e),
    }
}

/// Replaces the key file atomically, creating `.ssh` if needed. Both end up
/// owned by `uid:gid`. A symlinked `.ssh` is refused, and the temp file is
/// created exclusively under a random name.
pub fn write_authorized_keys(
    home: &Path,
    keys: &BTreeSet<String>,
    uid: u32,
    gid: u32,
) -> io::Result<()> {
    let path = authorized_keys_path(home);
    let ssh_dir = home.join(".ssh");

    match fs::symlink_metadata(&ssh_dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a symlink", ssh_dir.display()),
            ));
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", ssh_dir.display()),
            ));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&ssh_dir)?;
            let dir = open_dir_nofollow(&ssh_dir)?;
            set_mode_and_owner(&dir, SSH_DIR_MODE, uid, gid)?;
        }
        Err(e) => return Err(e),
    }

    let mut contents = String::new();
    for key in keys {
        contents.push_str(key);
        contents.push('\n');
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".authorized_keys.")
        .tempfile_in(&ssh_dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    set_mode_and_owner(tmp.as_file(), AUTHORIZED_KEYS_MODE, uid, gid)?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
}

/// Returns whether a file was removed.
pub fn remove_authorized_keys(home: &Path) -> io::Result<bool> {
    match fs::remove_file(authorized_keys_path(home)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn open_dir_nofollow(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn open_dir_nofollow(path: &Path) -> io::Result<fs::File> {
    fs::File::open(path)
}

/// Goes through the open handle so a swapped-in symlink is never followed.
#[cfg(unix)]
fn set_mode_and_owner(file: &fs::File, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    std::os::unix::fs::fchown(file, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn set_mode_and_owner(_file: &fs::File, _mode: u32, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;

    fn me() -> (u32, u32) {
        unsafe { (libc::getuid(), libc::getgid()) }
    }

    #[test]
    fn write_then_read_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        let (uid, gid) = me();

        let keys = normalize_keys(["ssh-ed25519 BBBB b", "ssh-ed25519 AAAA a"]);
        write_authorized_keys(&home, &keys, uid, gid).unwrap();

        let path = authorized_keys_path(&home);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ssh-ed25519 AAAA a\nssh-ed25519 BBBB b\n"
        );
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            AUTHORIZED_KEYS_MODE
        );
        assert_eq!(
            fs::metadata(home.join(".ssh")).unwrap().permissions().mode() & 0o777,
            SSH_DIR_MODE
        );
        assert_eq!(read_authorized_keys(&home).unwrap(), keys);

        let fewer = normalize_keys(["ssh-ed25519 AAAA a"]);
        write_authorized_keys(&home, &fewer, uid, gid).unwrap();
        assert_eq!(read_authorized_keys(&home).unwrap(), fewer);
    }

    #[test]
    fn missing_file_reads_empty_and_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path();
        assert!(read_authorized_keys(home).unwrap().is_empty());
        assert!(!remove_authorized_keys(home).unwrap());

        let (uid, gid) = me();
        write_authorized_keys(home, &normalize_keys(["k"]), uid, gid).unwrap();
        assert!(remove_authorized_keys(home).unwrap());
        assert!(!authorized_keys_path(home).exists());
    }

    #[test]
    fn planted_temp_symlink_is_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("mallory");
        let ssh_dir = home.join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        let victim = tmp.path().join("shadow");
        fs::write(&victim, "root:$6$secret:19000::::::\n").unwrap();
        std::os::unix::fs::symlink(
            &victim,
            ssh_dir.join(format!(".authorized_keys.tmp.{}", std::process::id())),
        )
        .unwrap();

        let (uid, gid) = me();
        write_authorized_keys(&home, &normalize_keys(["ssh-ed25519 EVIL"]), uid, gid).unwrap();

        assert_eq!(
            fs::read_to_string(&victim).unwrap(),
            "root:$6$secret:19000::::::\n"
        );
        assert_eq!(
            fs::read_to_string(authorized_keys_path(&home)).unwrap(),
            "ssh-ed25519 EVIL\n"
        );
    }

    #[test]
    fn existing_key_file_symlink_is_replaced_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("mallory");
        fs::create_dir_all(home.join(".ssh")).unwrap();
        let victim = tmp.path().join("victim");
        fs::write(&victim, "untouched\n").unwrap();
        std::os::unix::fs::symlink(&victim, authorized_keys_path(&home)).unwrap();

        let (uid, gid) = me();
        write_authorized_keys(&home, &normalize_keys(["k"]), uid, gid).unwrap();

        assert_eq!(fs::read_to_string(&victim).unwrap(), "untouched\n");
        assert!(
            !fs::symlink_metadata(authorized_keys_path(&home))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }

    #[test]
    fn symlinked_ssh_dir_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("mallory");
        fs::create_dir_all(&home).unwrap();
        let elsewhere = tmp.path().join("etc");
        fs::create_dir_all(&elsewhere).unwrap();
        std::os::unix::fs::symlink(&elsewhere, home.join(".ssh")).unwrap();

        let (uid, gid) = me();
        let err = write_authorized_keys(&home, &normalize_keys(["k"]), uid, gid).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!elsewhere.join("authorized_keys").exists());
        assert_eq!(fs::read_dir(&elsewhere).unwrap().count(), 0);
    }
}
