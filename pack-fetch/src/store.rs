//! On-disk copy of mounted packs: entry files under `output_dir/<pack>/` and a manifest
//! `output_dir/<pack>.entries.toml` naming the archive checksum each file came from.
//! Entries whose manifest checksum still matches are handed back to the core instead of being fetched.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use pack_core::{integrity, PackManager, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default)]
    entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    /// File-table CRC of the compressed payload.
    checksum: u32,
    /// CRC-32 of the bytes on disk.
    content_crc: u32,
}

/// One entry of a pack as it is (or will be) on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFile {
    pub name: String,
    /// File-table CRC of the compressed payload.
    pub checksum: u32,
    pub data: Vec<u8>,
}

fn manifest_path(out: &Path, pack: &str) -> PathBuf {
    out.join(format!("{pack}.entries.toml"))
}

fn read_manifest(out: &Path, pack: &str) -> anyhow::Result<Manifest> {
    let path = manifest_path(out, pack);
    match std::fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Copy a mounted pack's entries out of the manager so they can be written without its lock.
pub fn collect<T: Transport>(m: &PackManager<T>, pack: &str) -> Vec<EntryFile> {
    let Some(mounted) = m.mounted(pack) else {
        return Vec::new();
    };
    let index = mounted.index();
    index
        .names
        .iter()
        .zip(&index.entries)
        .filter_map(|(name, record)| {
            Some(EntryFile {
                name: name.clone(),
                checksum: record.checksum,
                data: mounted.get(name)?.to_vec(),
            })
        })
        .collect()
}

/// Write `files` under `out/<pack>/` and record them in the manifest.
/// Files already on disk with the same checksum and content are left alone. Returns how many were written.
pub fn write_pack(out: &Path, pack: &str, files: &[EntryFile]) -> anyhow::Result<usize> {
    let root = out.join(pack);
    std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
    let previous = read_manifest(out, pack).unwrap_or_else(|e| {
        warn!(pack = %pack, error = %e, "ignoring unreadable manifest");
        Manifest::default()
    });

    let mut manifest = Manifest::default();
    let mut written = 0;
    for file in files {
        let Some(path) = entry_path(&root, &file.name) else {
            warn!(pack = %pack, entry = %file.name, "skipping entry with unsafe path");
            continue;
        };
        let entry = ManifestEntry {
            checksum: file.checksum,
            content_crc: integrity::compute(&file.data),
        };
        if previous.entries.get(&file.name) == Some(&entry) && on_disk_matches(&path, entry.content_crc) {
            debug!(pack = %pack, entry = %file.name, "unchanged on disk");
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&path, &file.data)
                .with_context(|| format!("writing {}", path.display()))?;
            written += 1;
        }
        manifest.entries.insert(file.name.clone(), entry);
    }

    let path = manifest_path(out, pack);
    let text = toml::to_string(&manifest).context("encoding manifest")?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(written)
}

fn on_disk_matches(path: &Path, content_crc: u32) -> bool {
    std::fs::read(path).is_ok_and(|bytes| integrity::compute(&bytes) == content_crc)
}

/// Entries of `pack` already in `out` whose bytes still match the manifest.
pub fn load_local(out: &Path, pack: &str) -> anyhow::Result<Vec<EntryFile>> {
    let manifest = read_manifest(out, pack)?;
    let root = out.join(pack);
    let mut found = Vec::new();
    for (name, entry) in manifest.entries {
        let Some(path) = entry_path(&root, &name) else {
            continue;
        };
        match std::fs::read(&path) {
            Ok(data) if integrity::compute(&data) == entry.content_crc => found.push(EntryFile {
                name,
                checksum: entry.checksum,
                data,
            }),
            Ok(_) => debug!(pack = %pack, entry = %name, "local copy changed, will refetch"),
            Err(e) => debug!(pack = %pack, entry = %name, error = %e, "local copy unreadable"),
        }
    }
    Ok(found)
}

/// Delete the pack's directory and manifest. Returns false when neither existed.
pub fn remove_local(out: &Path, pack: &str) -> anyhow::Result<bool> {
    let mut removed = false;
    let root = out.join(pack);
    match std::fs::remove_dir_all(&root) {
        Ok(()) => removed = true,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", root.display())),
    }
    let manifest = manifest_path(out, pack);
    match std::fs::remove_file(&manifest) {
        Ok(()) => removed = true,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", manifest.display())),
    }
    if removed {
        info!(pack = %pack, dir = %out.display(), "local copy removed");
    }
    Ok(removed)
}

/// Join an archive entry name below `root`, refusing absolute or parent components.
pub fn entry_path(root: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    let mut path = root.to_path_buf();
    let mut any = false;
    for part in rel.components() {
        match part {
            Component::Normal(p) => {
                path.push(p);
                any = true;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    any.then_some(path)
}
