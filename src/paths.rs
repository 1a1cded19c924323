use std::path::{Path, PathBuf};

/// Maps absolute system paths under an alternative root. `/` is the live
/// system; anything else is a staging or test tree.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: PathBuf) -> Self {
        let root = if root.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            root
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_alternate_root(&self) -> bool {
        self.root != Path::new("/")
    }

    pub fn map_abs(&self, abs: &Path) -> PathBuf {
        if abs == Path::new("/") {
            return self.root.clone();
        }
        let stripped = abs.strip_prefix("/").unwrap_or(abs);
        self.root.join(stripped)
    }

    pub fn etc_passwd(&self) -> PathBuf {
        self.map_abs(Path::new("/etc/passwd"))
    }

    pub fn etc_group(&self) -> PathBuf {
        self.map_abs(Path::new("/etc/group"))
    }

    pub fn etc_shadow(&self) -> PathBuf {
        self.map_abs(Path::new("/etc/shadow"))
    }

    pub fn proc_dir(&self) -> PathBuf {
        self.map_abs(Path::new("/proc"))
    }
}
