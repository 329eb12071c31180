//! Configuration document sources
use super::ComposeError;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Provides the raw text of base documents and group members.
///
/// Implementations must be safe to share between threads; they are read-only.
pub trait ConfigSource: fmt::Debug + Send + Sync {
    /// Text of the base document `name`, if it exists.
    fn load_base(&self, name: &str) -> Result<Option<String>, ComposeError>;

    /// Text of member `member` of group `group`, if it exists.
    ///
    /// Members may be nested: `dqn/pixels`.
    fn load_member(&self, group: &str, member: &str) -> Result<Option<String>, ComposeError>;

    /// Names of all groups the source knows about.
    fn groups(&self) -> Result<Vec<String>, ComposeError>;

    /// Names of all members of a group, sorted.
    fn members(&self, group: &str) -> Result<Vec<String>, ComposeError>;
}

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Configuration documents stored in a directory.
///
/// Layout:
/// * `<root>/<base>.yaml` - base documents
/// * `<root>/<group>/<member>.yaml` - group members, possibly in nested directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_document(&self, stem: &Path) -> Result<Option<String>, ComposeError> {
        for ext in EXTENSIONS {
            let path = stem.with_extension(ext);
            match fs::read_to_string(&path) {
                Ok(text) => return Ok(Some(text)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ComposeError::Io { path, source }),
            }
        }
        Ok(None)
    }

    fn collect_members(
        dir: &Path,
        prefix: &str,
        members: &mut Vec<String>,
    ) -> Result<(), ComposeError> {
        let entries = fs::read_dir(dir).map_err(|source| ComposeError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| ComposeError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let qualified = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if path.is_dir() {
                Self::collect_members(&path, &qualified, members)?;
            } else if has_config_extension(&path) {
                members.push(qualified);
            }
        }
        Ok(())
    }
}

fn has_config_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| EXTENSIONS.contains(&ext))
}

/// Reject member names that would escape the group directory.
fn is_safe_member(member: &str) -> bool {
    !member.is_empty() && member.split('/').all(|part| !part.is_empty() && part != "..")
}

impl ConfigSource for DirSource {
    fn load_base(&self, name: &str) -> Result<Option<String>, ComposeError> {
        if !is_safe_member(name) {
            return Ok(None);
        }
        self.read_document(&self.root.join(name))
    }

    fn load_member(&self, group: &str, member: &str) -> Result<Option<String>, ComposeError> {
        if !is_safe_member(group) || !is_safe_member(member) {
            return Ok(None);
        }
        self.read_document(&self.root.join(group).join(member))
    }

    fn groups(&self) -> Result<Vec<String>, ComposeError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ComposeError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut groups = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ComposeError::Io {
                    path: self.root.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                    groups.push(name.to_string());
                }
            }
        }
        groups.sort();
        Ok(groups)
    }

    fn members(&self, group: &str) -> Result<Vec<String>, ComposeError> {
        let dir = self.root.join(group);
        if !is_safe_member(group) || !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut members = Vec::new();
        Self::collect_members(&dir, "", &mut members)?;
        members.sort();
        Ok(members)
    }
}

/// Configuration documents held in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySource {
    bases: BTreeMap<String, String>,
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a base document.
    #[must_use]
    pub fn with_base<N: Into<String>, T: Into<String>>(mut self, name: N, text: T) -> Self {
        self.bases.insert(name.into(), text.into());
        self
    }

    /// Add (or replace) a group member document.
    #[must_use]
    pub fn with_member<G, M, T>(mut self, group: G, member: M, text: T) -> Self
    where
        G: Into<String>,
        M: Into<String>,
        T: Into<String>,
    {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(member.into(), text.into());
        self
    }
}

impl ConfigSource for MemorySource {
    fn load_base(&self, name: &str) -> Result<Option<String>, ComposeError> {
        Ok(self.bases.get(name).cloned())
    }

    fn load_member(&self, group: &str, member: &str) -> Result<Option<String>, ComposeError> {
        Ok(self
            .groups
            .get(group)
            .and_then(|members| members.get(member))
            .cloned())
    }

    fn groups(&self) -> Result<Vec<String>, ComposeError> {
        Ok(self.groups.keys().cloned().collect())
    }

    fn members(&self, group: &str) -> Result<Vec<String>, ComposeError> {
        Ok(self
            .groups
            .get(group)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn dir_source_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("config.yaml"), "num_workers: 2\n").unwrap();
        fs::create_dir_all(root.join("network/dqn")).unwrap();
        fs::write(root.join("network/dqn/pixels.yaml"), "in_keys: [pixels]\n").unwrap();
        fs::write(root.join("network/dqn/state.yml"), "in_keys: [observation]\n").unwrap();
        fs::write(root.join("network/README"), "not a config").unwrap();
        fs::create_dir_all(root.join("collector")).unwrap();

        let source = DirSource::new(root);
        assert_eq!(
            source.load_base("config").unwrap().as_deref(),
            Some("num_workers: 2\n")
        );
        assert_eq!(source.load_base("missing").unwrap(), None);
        assert_eq!(source.groups().unwrap(), vec!["collector", "network"]);
        assert_eq!(
            source.members("network").unwrap(),
            vec!["dqn/pixels", "dqn/state"]
        );
        assert!(source.members("collector").unwrap().is_empty());
        assert_eq!(
            source.load_member("network", "dqn/state").unwrap().as_deref(),
            Some("in_keys: [observation]\n")
        );
        assert_eq!(source.load_member("network", "../config").unwrap(), None);
    }

    #[test]
    fn memory_source_members() {
        let source = MemorySource::new()
            .with_base("config", "a: 1")
            .with_member("env", "cartpole", "x: 1")
            .with_member("env", "pendulum", "x: 2");
        assert_eq!(source.groups().unwrap(), vec!["env"]);
        assert_eq!(source.members("env").unwrap(), vec!["cartpole", "pendulum"]);
        assert_eq!(source.members("other").unwrap(), Vec::<String>::new());
        assert_eq!(
            source.load_member("env", "pendulum").unwrap().as_deref(),
            Some("x: 2")
        );
    }
}
