//! Configuration trees and their archive format.
//!
//! A node's configuration directory is handled as one [`ConfigTree`] (relative
//! path -> mode + bytes). Archives are deterministic gzip-compressed tars:
//! entries sorted by path, zeroed owners and mtimes. Packing the same tree
//! twice therefore yields the same bytes, so the archive checksum doubles as a
//! checksum of the configuration itself.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};

use crate::error::ArchiveError;

pub const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub mode: u32,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigTree {
    files: BTreeMap<String, ConfigFile>,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.insert_with_mode(path, DEFAULT_FILE_MODE, contents);
    }

    pub fn insert_with_mode(&mut self, path: impl Into<String>, mode: u32, contents: impl Into<Vec<u8>>) {
        let path = path.into();
        let path = path.trim_start_matches("./").to_string();
        self.files.insert(
            path,
            ConfigFile {
                mode: mode & 0o7777,
                contents: contents.into(),
            },
        );
    }

    /// Builder-style insert, handy for fixtures.
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn get(&self, path: &str) -> Option<&ConfigFile> {
        self.files.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<ConfigFile> {
        self.files.remove(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &ConfigFile)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.contents.len() as u64).sum()
    }

    /// Checksum of the tree's canonical archive.
    pub fn checksum(&self) -> Result<String, ArchiveError> {
        Ok(sha256_hex(&pack(self)?))
    }

    /// Digest over paths and contents only. Permission fixes after a restore
    /// change modes, so read-back comparisons use this instead of [`Self::checksum`].
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, file) in &self.files {
            hasher.update((path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update((file.contents.len() as u64).to_le_bytes());
            hasher.update(&file.contents);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Packs a tree into a deterministic `.tar.gz`.
pub fn pack(tree: &ConfigTree) -> Result<Vec<u8>, ArchiveError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (path, file) in tree.files() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, path, file.contents.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Unpacks a `.tar.gz` produced either by [`pack`] or by `tar -czf - .` on a node.
pub fn unpack(bytes: &[u8]) -> Result<ConfigTree, ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut tree = ConfigTree::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let raw_path = entry.path()?.into_owned();

        match entry_type {
            tar::EntryType::Directory
            | tar::EntryType::XGlobalHeader
            | tar::EntryType::XHeader
            | tar::EntryType::GNULongName
            | tar::EntryType::GNULongLink => continue,
            tar::EntryType::Regular | tar::EntryType::Continuous => {}
            other => {
                return Err(ArchiveError::UnsupportedEntry {
                    path: raw_path.display().to_string(),
                    kind: format!("{other:?}"),
                })
            }
        }

        let Some(path) = normalize_entry_path(&raw_path)? else {
            continue;
        };
        let mode = entry.header().mode()?;
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        tree.insert_with_mode(path, mode, contents);
    }

    Ok(tree)
}

/// Strips `./` prefixes and rejects anything that could escape the target directory.
fn normalize_entry_path(path: &Path) -> Result<Option<String>, ArchiveError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return Err(ArchiveError::UnsafePath(path.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ConfigTree {
        let mut tree = ConfigTree::new()
            .with_file("openclaw.json", br#"{"gateway":{"port":18789}}"#.to_vec())
            .with_file("agents/main/agent.json", br#"{"name":"main"}"#.to_vec());
        tree.insert_with_mode("auth-profiles.json", 0o600, b"{}".to_vec());
        tree
    }

    #[test]
    fn pack_is_deterministic() {
        let tree = sample_tree();
        assert_eq!(pack(&tree).unwrap(), pack(&tree).unwrap());
        assert_eq!(tree.checksum().unwrap(), tree.checksum().unwrap());
    }

    #[test]
    fn unpack_restores_contents_and_modes() {
        let tree = sample_tree();
        let restored = unpack(&pack(&tree).unwrap()).unwrap();
        assert_eq!(restored, tree);
        assert_eq!(restored.get("auth-profiles.json").unwrap().mode, 0o600);
    }

    #[test]
    fn checksum_changes_with_content() {
        let tree = sample_tree();
        let mut edited = tree.clone();
        edited.insert("openclaw.json", b"{}".to_vec());
        assert_ne!(tree.checksum().unwrap(), edited.checksum().unwrap());
    }

    #[test]
    fn content_digest_ignores_modes() {
        let tree = sample_tree();
        let mut relaxed = tree.clone();
        relaxed.insert_with_mode("auth-profiles.json", 0o644, b"{}".to_vec());
        assert_eq!(tree.content_digest(), relaxed.content_digest());
        assert_ne!(tree.checksum().unwrap(), relaxed.checksum().unwrap());
    }

    #[test]
    fn unpack_accepts_dot_prefixed_entries() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "./", std::io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(2);
        file.set_mode(0o640);
        builder.append_data(&mut file, "./openclaw.json", &b"{}"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let tree = unpack(&bytes).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get("openclaw.json").unwrap().mode, 0o640);
    }

    #[test]
    fn normalize_rejects_parent_components() {
        assert!(normalize_entry_path(Path::new("../etc/passwd")).is_err());
        assert!(normalize_entry_path(Path::new("/etc/passwd")).is_err());
        assert_eq!(normalize_entry_path(Path::new("./a/b.json")).unwrap().as_deref(), Some("a/b.json"));
        assert_eq!(normalize_entry_path(Path::new("./")).unwrap(), None);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
