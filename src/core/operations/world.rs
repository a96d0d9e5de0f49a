//! The "world" favorites set.
//!
//! Packages the user asked for by name are recorded in the world file so
//! later updates keep them installed. The file holds one atom per line.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Persistent set of favorite atoms.
pub trait WorldSet: Send {
    /// Adds `atom`. Returns false when it was already present.
    fn add(&mut self, atom: &str) -> Result<bool>;

    /// Removes `atom`. Returns false when it was not present.
    fn remove(&mut self, atom: &str) -> Result<bool>;

    fn contains(&self, atom: &str) -> bool;
}

/// World set stored in a plain text file, sorted, one atom per line.
#[derive(Debug)]
pub struct FileWorldSet {
    path: PathBuf,
    atoms: BTreeSet<String>,
}

impl FileWorldSet {
    /// Loads the set from `path`; a missing file is an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let atoms = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read world file: {}", path.display()));
            }
        };
        Ok(Self { path, atoms })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.atoms.iter().map(String::as_str)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create world file directory: {}", parent.display())
            })?;
        }
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        for atom in &self.atoms {
            writeln!(file, "{}", atom)
                .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        }
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename temp file to: {}", self.path.display()))
    }
}

impl WorldSet for FileWorldSet {
    fn add(&mut self, atom: &str) -> Result<bool> {
        if !self.atoms.insert(atom.to_string()) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn remove(&mut self, atom: &str) -> Result<bool> {
        if !self.atoms.remove(atom) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn contains(&self, atom: &str) -> bool {
        self.atoms.contains(atom)
    }
}

/// World set kept in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryWorldSet {
    atoms: BTreeSet<String>,
}

impl MemoryWorldSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorldSet for MemoryWorldSet {
    fn add(&mut self, atom: &str) -> Result<bool> {
        Ok(self.atoms.insert(atom.to_string()))
    }

    fn remove(&mut self, atom: &str) -> Result<bool> {
        Ok(self.atoms.remove(atom))
    }

    fn contains(&self, atom: &str) -> bool {
        self.atoms.contains(atom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// # World File Persistence
    ///
    /// Tests that additions and removals are written to disk.
    ///
    /// ## Test Scenario
    /// - Adds two atoms, re-adds one, removes the other, reloads
    ///
    /// ## Expected Outcome
    /// - Duplicate add reports false
    /// - The reloaded file holds only the remaining atom
    #[test]
    fn test_world_file_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("var/lib/pkgmerge/world");

        let mut world = FileWorldSet::load(&path).unwrap();
        assert!(world.add("app-editors/vim").unwrap());
        assert!(world.add("dev-vcs/git").unwrap());
        assert!(!world.add("dev-vcs/git").unwrap());
        assert!(world.remove("app-editors/vim").unwrap());
        assert!(!world.remove("app-editors/vim").unwrap());

        let reloaded = FileWorldSet::load(&path).unwrap();
        assert_eq!(reloaded.atoms().collect::<Vec<_>>(), vec!["dev-vcs/git"]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "dev-vcs/git\n");
    }

    /// # Comments Ignored
    ///
    /// Tests that comments and blank lines are skipped on load.
    ///
    /// ## Test Scenario
    /// - Loads a hand edited world file
    ///
    /// ## Expected Outcome
    /// - Only the atoms are read
    #[test]
    fn test_comments_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("world");
        fs::write(&path, "# favorites\n\napp-shells/zsh\n  sys-apps/less  \n").unwrap();

        let world = FileWorldSet::load(&path).unwrap();
        assert!(world.contains("app-shells/zsh"));
        assert!(world.contains("sys-apps/less"));
        assert_eq!(world.atoms().count(), 2);
    }
}
