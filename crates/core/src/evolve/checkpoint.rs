use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directories never captured or touched by a restore.
const SKIPPED_DIRS: &[&str] = &[".git", "target"];

/// In-memory copy of a work tree, restorable byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCheckpoint {
    root: PathBuf,
    /// Relative path to contents.
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    /// Relative path to link target, as read from the link.
    links: BTreeMap<PathBuf, PathBuf>,
}

impl TreeCheckpoint {
    /// Capture every file, directory and symlink under `root`, skipping
    /// `.git` and `target`. Links are recorded, never followed.
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut checkpoint = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };
        checkpoint.walk(root)?;
        Ok(checkpoint)
    }

    fn walk(&mut self, dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            let rel = relative(&self.root, &path);
            if file_type.is_dir() {
                if is_skipped(&rel) {
                    continue;
                }
                self.dirs.insert(rel);
                self.walk(&path)?;
            } else if file_type.is_symlink() {
                self.links.insert(rel, fs::read_link(&path)?);
            } else if file_type.is_file() {
                self.files.insert(rel, fs::read(&path)?);
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Put the tree back: rewrite changed files, recreate deleted ones and
    /// remove anything created since the capture. Links are removed before
    /// any write so nothing is written through one.
    pub fn restore(&self) -> io::Result<usize> {
        let current = Self::capture(&self.root)?;
        let mut touched = 0;

        for rel in current.files.keys() {
            if !self.files.contains_key(rel) {
                fs::remove_file(self.root.join(rel))?;
                touched += 1;
            }
        }
        for (rel, target) in &current.links {
            if self.links.get(rel) != Some(target) {
                fs::remove_file(self.root.join(rel))?;
                touched += 1;
            }
        }
        // deepest first so parents are empty when reached
        let mut new_dirs: Vec<&PathBuf> = current
            .dirs
            .iter()
            .filter(|d| !self.dirs.contains(*d))
            .collect();
        new_dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for rel in new_dirs {
            fs::remove_dir_all(self.root.join(rel))?;
            touched += 1;
        }

        for rel in &self.dirs {
            fs::create_dir_all(self.root.join(rel))?;
        }
        for (rel, contents) in &self.files {
            if current.files.get(rel) != Some(contents) {
                fs::write(self.root.join(rel), contents)?;
                touched += 1;
            }
        }
        for (rel, target) in &self.links {
            if current.links.get(rel) != Some(target) {
                make_link(target, &self.root.join(rel))?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(unix)]
fn make_link(target: &Path, at: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, at)
}

#[cfg(not(unix))]
fn make_link(_target: &Path, at: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {}", at.display()),
    ))
}

fn relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

fn is_skipped(rel: &Path) -> bool {
    rel.components().count() == 1
        && rel
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(dir: &Path) {
        fs::create_dir_all(dir.join("src/nested")).unwrap();
        fs::write(dir.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        fs::write(dir.join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(dir.join("src/nested/mod.rs"), [0u8, 159, 146, 150]).unwrap();
    }

    #[test]
    fn restore_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let before = TreeCheckpoint::capture(dir.path()).unwrap();
        assert_eq!(before.file_count(), 3);

        fs::write(dir.path().join("src/lib.rs"), "pub fn broken(").unwrap();
        fs::remove_file(dir.path().join("Cargo.toml")).unwrap();
        fs::create_dir_all(dir.path().join("src/extra/deep")).unwrap();
        fs::write(dir.path().join("src/extra/deep/new.rs"), "x").unwrap();
        fs::write(dir.path().join("NEW.md"), "notes").unwrap();

        before.restore().unwrap();
        let after = TreeCheckpoint::capture(dir.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn git_and_target_are_left_alone() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/out"), "bin").unwrap();
        let checkpoint = TreeCheckpoint::capture(dir.path()).unwrap();
        assert_eq!(checkpoint.file_count(), 3);

        fs::write(dir.path().join("target/debug/out2"), "bin2").unwrap();
        checkpoint.restore().unwrap();
        assert!(dir.path().join("target/debug/out2").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_and_restored() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        seed(dir.path());
        symlink("lib.rs", dir.path().join("src/alias.rs")).unwrap();
        let before = TreeCheckpoint::capture(dir.path()).unwrap();
        assert_eq!(before.file_count(), 3);

        fs::remove_file(dir.path().join("src/alias.rs")).unwrap();
        symlink(outside.path(), dir.path().join("escape")).unwrap();

        before.restore().unwrap();
        assert!(fs::symlink_metadata(dir.path().join("escape")).is_err());
        assert_eq!(
            fs::read_link(dir.path().join("src/alias.rs")).unwrap(),
            PathBuf::from("lib.rs")
        );
        assert_eq!(TreeCheckpoint::capture(dir.path()).unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn restore_never_writes_through_a_new_symlink() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, "keep me").unwrap();
        seed(dir.path());
        let before = TreeCheckpoint::capture(dir.path()).unwrap();

        fs::remove_file(dir.path().join("src/lib.rs")).unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("src/lib.rs")).unwrap();

        before.restore().unwrap();
        assert_eq!(fs::read_to_string(&victim).unwrap(), "keep me");
        let lib = dir.path().join("src/lib.rs");
        assert!(fs::symlink_metadata(&lib).unwrap().file_type().is_file());
        assert_eq!(fs::read_to_string(&lib).unwrap(), "pub fn a() {}\n");
    }

    #[test]
    fn untouched_tree_restores_nothing() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let checkpoint = TreeCheckpoint::capture(dir.path()).unwrap();
        assert_eq!(checkpoint.restore().unwrap(), 0);
    }
}
