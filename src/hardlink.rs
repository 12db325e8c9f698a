use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::rpm::parser::RpmFileEntry;
use crate::rpm::RpmFileInfo;

// The file flags are not compared; they differ legitimately between
// hard links (e.g. one link marked ghost).
fn check_consistency(first: &RpmFileInfo, new_info: &RpmFileInfo) -> Result<()> {
    if first.digest.length != new_info.digest.length {
        bail!("intra-inode length mismatch for {}", new_info.name);
    }
    if first.digest.value != new_info.digest.value {
        bail!("intra-inode checksum mismatch for {}", new_info.name);
    }
    if first.nlinks != new_info.nlinks {
        bail!("intra-inode link count mismatch for {}", new_info.name);
    }
    if first.user != new_info.user {
        bail!("intra-inode user mismatch for {}", new_info.name);
    }
    if first.group != new_info.group {
        bail!("intra-inode group mismatch for {}", new_info.name);
    }
    if first.mtime != new_info.mtime {
        bail!("intra-inode mtime mismatch for {}", new_info.name);
    }
    if first.mode != new_info.mode {
        bail!("intra-inode mode mismatch for {}", new_info.name);
    }
    Ok(())
}

struct Inode {
    entries: Vec<RpmFileInfo>,
}

impl Inode {
    fn new(info: RpmFileInfo) -> Result<Self> {
        if info.nlinks < 2 {
            bail!("invalid link count for {}", info.name);
        }
        Ok(Self {
            entries: vec![info],
        })
    }

    fn add(&mut self, info: RpmFileInfo) -> Result<()> {
        let first = &self.entries[0];
        if first.nlinks as usize == self.entries.len() {
            bail!("all inode references already seen at {}", info.name);
        }
        check_consistency(first, &info)?;
        self.entries.push(info);
        Ok(())
    }

    fn complete(&self) -> bool {
        self.entries[0].nlinks as usize == self.entries.len()
    }
}

/// Reconstructs hard-link groups from the CPIO stream. Directory entries
/// pointing at a shared inode are held back until the reference that
/// carries the contents arrives; then the whole group is released.
#[derive(Default)]
pub struct HardlinkMap {
    inodes: HashMap<u32, Inode>,
}

impl HardlinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one payload entry and returns the file entries that become
    /// ready to store. Non-hardlinked entries pass straight through.
    /// Zero inodes sometimes stem from ghost files and are not real
    /// hard links.
    pub fn push(&mut self, entry: RpmFileEntry) -> Result<Vec<RpmFileEntry>> {
        let RpmFileEntry { info, contents } = entry;
        if info.nlinks <= 1 || info.ino == 0 {
            return Ok(vec![RpmFileEntry { info, contents }]);
        }
        let ino = info.ino;
        match self.inodes.get_mut(&ino) {
            None => {
                self.inodes.insert(ino, Inode::new(info)?);
                Ok(Vec::new())
            }
            Some(inode) => {
                inode.add(info)?;
                if inode.complete() {
                    // The last entry for this inode carries the contents.
                    // Patch in the previously recorded references.
                    let r = inode
                        .entries
                        .iter()
                        .map(|info| RpmFileEntry {
                            info: info.clone(),
                            contents: contents.clone(),
                        })
                        .collect();
                    Ok(r)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    fn info(name: &str, ino: u32, nlinks: u32) -> RpmFileInfo {
        RpmFileInfo {
            name: name.to_owned(),
            user: "root".to_owned(),
            group: "root".to_owned(),
            mtime: 1,
            mode: 0o100755,
            flags: 0,
            ino,
            nlinks,
            digest: Checksum::empty_sha256(),
        }
    }

    fn entry(name: &str, ino: u32, nlinks: u32, contents: &[u8]) -> RpmFileEntry {
        RpmFileEntry {
            info: info(name, ino, nlinks),
            contents: contents.to_vec(),
        }
    }

    #[test]
    fn test_passthrough() {
        let mut map = HardlinkMap::new();
        let out = map.push(entry("/a", 7, 1, b"x")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].info.name, "/a");
    }

    #[test]
    fn test_group_released_on_last_reference() {
        let mut map = HardlinkMap::new();
        assert!(map.push(entry("/a", 7, 3, b"")).unwrap().is_empty());
        assert!(map.push(entry("/b", 7, 3, b"")).unwrap().is_empty());
        let out = map.push(entry("/c", 7, 3, b"shared")).unwrap();
        let names: Vec<_> = out.iter().map(|e| e.info.name.as_str()).collect();
        assert_eq!(names, vec!["/a", "/b", "/c"]);
        assert!(out.iter().all(|e| e.contents == b"shared"));
    }

    #[test]
    fn test_distinct_inodes_do_not_mix() {
        let mut map = HardlinkMap::new();
        assert!(map.push(entry("/a", 7, 2, b"")).unwrap().is_empty());
        assert!(map.push(entry("/x", 8, 2, b"")).unwrap().is_empty());
        let out = map.push(entry("/b", 7, 2, b"one")).unwrap();
        assert_eq!(out.len(), 2);
        let out = map.push(entry("/y", 8, 2, b"two")).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.contents == b"two"));
    }

    #[test]
    fn test_inconsistent_links_rejected() {
        let mut map = HardlinkMap::new();
        assert!(map.push(entry("/a", 7, 2, b"")).unwrap().is_empty());
        let mut bad = entry("/b", 7, 2, b"");
        bad.info.mode = 0o100644;
        assert!(map.push(bad).is_err());
    }

    #[test]
    fn test_excess_reference_rejected() {
        let mut map = HardlinkMap::new();
        assert!(map.push(entry("/a", 7, 2, b"")).unwrap().is_empty());
        assert_eq!(map.push(entry("/b", 7, 2, b"z")).unwrap().len(), 2);
        let err = map.push(entry("/c", 7, 2, b"")).unwrap_err();
        assert!(err.to_string().contains("already seen"), "{}", err);
    }
}
