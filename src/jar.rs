//! Jar archive plumbing shared by every pipeline stage.
//!
//! Jars are immutable by convention: stages read a whole archive into
//! memory, transform it, and replace the target file in one step. The only
//! in-place-style edit we ever perform is a manifest attribute patch, and
//! even that rewrites the archive through a scratch sibling.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use failure::Error;
use failure_derive::Fail;
use indexmap::IndexMap;
use zip::{ZipArchive, ZipWriter};
use zip::write::FileOptions;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

#[derive(Debug, Fail)]
#[fail(display = "Missing jar entry {:?}", _0)]
pub struct MissingEntry(pub String);

#[inline]
pub fn is_class_file(name: &str) -> bool {
    name.ends_with(".class")
}

/// Reads every regular entry of a jar into memory, in archive order.
pub fn read_jar(path: &Path) -> Result<IndexMap<String, Vec<u8>>, Error> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut entries = IndexMap::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue
        }
        let name = entry.name().to_owned();
        let mut buffer = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buffer)?;
        entries.insert(name, buffer);
    }
    Ok(entries)
}

/// Reads a single entry, or `None` if the jar doesn't contain it.
pub fn read_jar_entry(path: &Path, name: &str) -> Result<Option<Vec<u8>>, Error> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buffer = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buffer)?;
    Ok(Some(buffer))
}

/// Writes a fresh jar at `path` containing exactly `entries`.
pub fn write_jar(path: &Path, entries: &IndexMap<String, Vec<u8>>) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    for (name, data) in entries {
        writer.start_file(name.as_str(), FileOptions::default())?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

/// Replaces `target` with a jar containing `entries`.
///
/// The archive is first written to a scratch sibling so an interrupted run
/// never leaves a half-written final artifact behind under the real name.
pub fn replace_jar(target: &Path, entries: &IndexMap<String, Vec<u8>>) -> Result<(), Error> {
    let scratch = scratch_sibling(target);
    write_jar(&scratch, entries)?;
    fs::rename(&scratch, target)?;
    Ok(())
}

fn scratch_sibling(target: &Path) -> ::std::path::PathBuf {
    let name = target.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    target.with_file_name(format!("{}.tmp", name))
}

/// Copies classes present in `source` but missing from `target` back into
/// `target`, unmodified. Merge tooling deduplicates overlapping classes;
/// nothing from the pre-merge input may be silently dropped.
pub fn copy_missing_classes(source: &Path, target: &Path) -> Result<(), Error> {
    let source_entries = read_jar(source)?;
    let mut target_entries = read_jar(target)?;
    let mut changed = false;
    for (name, data) in &source_entries {
        if is_class_file(name) && !target_entries.contains_key(name) {
            target_entries.insert(name.clone(), data.clone());
            changed = true;
        }
    }
    if changed {
        replace_jar(target, &target_entries)?;
    }
    Ok(())
}

/// Copies every non-class, non-`META-INF` resource of `source` into a fresh
/// jar at `target`, replacing whatever was there.
pub fn copy_non_class_files(source: &Path, target: &Path) -> Result<(), Error> {
    let source_entries = read_jar(source)?;
    let mut target_entries = IndexMap::new();
    for (name, data) in source_entries {
        if !is_class_file(&name) && !name.starts_with("META-INF") {
            target_entries.insert(name, data);
        }
    }
    if target.exists() {
        fs::remove_file(target)?;
    }
    write_jar(target, &target_entries)?;
    Ok(())
}

/// A jar manifest's main section.
///
/// Attributes after the first blank line (per-entry sections, signature
/// digests) are carried through opaquely as `tail` so an attribute patch
/// does not destroy them; `sanitized` drops them on purpose.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    main: IndexMap<String, String>,
    tail: Vec<u8>,
}
impl Manifest {
    pub fn parse(data: &[u8]) -> Manifest {
        let mut main: IndexMap<String, String> = IndexMap::new();
        let mut offset = 0;
        let mut last_key: Option<String> = None;
        while offset < data.len() {
            let end = data[offset..].iter().position(|&b| b == b'\n')
                .map(|i| offset + i)
                .unwrap_or(data.len());
            let raw = &data[offset..end];
            let line = ::std::str::from_utf8(raw).unwrap_or("").trim_end_matches('\r');
            offset = end.saturating_add(1);
            if line.is_empty() {
                break
            }
            if let Some(continued) = line.strip_prefix(' ') {
                if let Some(ref key) = last_key {
                    if let Some(value) = main.get_mut(key) {
                        value.push_str(continued);
                    }
                }
                continue
            }
            if let Some(separator) = line.find(": ") {
                let key = line[..separator].to_owned();
                let value = line[separator + 2..].to_owned();
                main.insert(key.clone(), value);
                last_key = Some(key);
            }
        }
        let tail = data.get(offset..).unwrap_or(&[]).to_vec();
        Manifest { main, tail }
    }
    #[inline]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.main.get(key).map(String::as_str)
    }
    #[inline]
    pub fn set_attribute(&mut self, key: &str, value: &str) {
        self.main.insert(key.into(), value.into());
    }
    /// Strips signing digests and per-entry sections, keeping plain main
    /// attributes. Used when merging a distribution jar whose manifest may
    /// still carry its publisher's signature data.
    pub fn sanitized(&self) -> Manifest {
        let main = self.main.iter()
            .filter(|(key, _)| {
                !key.ends_with("-Digest")
                    && !key.contains("-Digest-")
                    && key.as_str() != "Magic"
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Manifest { main, tail: Vec::new() }
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.main {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.tail);
        out
    }
}

/// Reads the manifest of a jar, or `None` when absent.
pub fn read_manifest(path: &Path) -> Result<Option<Manifest>, Error> {
    Ok(read_jar_entry(path, MANIFEST_PATH)?.map(|data| Manifest::parse(&data)))
}

/// Patches a single main attribute of a jar's manifest, leaving every other
/// entry of the archive byte-identical.
pub fn patch_manifest_attribute(path: &Path, key: &str, value: &str) -> Result<(), Error> {
    let mut entries = read_jar(path)?;
    let manifest_data = entries.get(MANIFEST_PATH)
        .ok_or_else(|| MissingEntry(MANIFEST_PATH.into()))?;
    let mut manifest = Manifest::parse(manifest_data);
    manifest.set_attribute(key, value);
    entries.insert(MANIFEST_PATH.into(), manifest.to_bytes());
    replace_jar(path, &entries)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn sample_jar(dir: &TempDir) -> ::std::path::PathBuf {
        let path = dir.path().join("sample.jar");
        let mut entries = IndexMap::new();
        entries.insert(MANIFEST_PATH.to_owned(), b"Manifest-Version: 1.0\r\n\r\n".to_vec());
        entries.insert("com/example/A.class".to_owned(), vec![1, 2, 3]);
        entries.insert("assets/lang/en_us.json".to_owned(), b"{}".to_vec());
        write_jar(&path, &entries).unwrap();
        path
    }

    #[test]
    fn round_trips_entries() {
        let dir = TempDir::new().unwrap();
        let path = sample_jar(&dir);
        let entries = read_jar(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["com/example/A.class"], vec![1, 2, 3]);
        assert_eq!(read_jar_entry(&path, "nope").unwrap(), None);
    }

    #[test]
    fn manifest_attribute_patch() {
        let dir = TempDir::new().unwrap();
        let path = sample_jar(&dir);
        patch_manifest_attribute(&path, "Loom-Patch-Version", "9").unwrap();
        let manifest = read_manifest(&path).unwrap().unwrap();
        assert_eq!(manifest.attribute("Loom-Patch-Version"), Some("9"));
        assert_eq!(manifest.attribute("Manifest-Version"), Some("1.0"));
        // other entries untouched
        let entries = read_jar(&path).unwrap();
        assert_eq!(entries["com/example/A.class"], vec![1, 2, 3]);
    }

    #[test]
    fn manifest_continuation_lines() {
        let manifest = Manifest::parse(
            b"Manifest-Version: 1.0\r\nMain-Class: com.exa\r\n mple.Main\r\n\r\n",
        );
        assert_eq!(manifest.attribute("Main-Class"), Some("com.example.Main"));
    }

    #[test]
    fn sanitize_strips_digests() {
        let mut manifest = Manifest::parse(b"Manifest-Version: 1.0\r\n\r\n");
        manifest.set_attribute("SHA-256-Digest", "abcd");
        manifest.set_attribute("Implementation-Title", "forge");
        let clean = manifest.sanitized();
        assert_eq!(clean.attribute("SHA-256-Digest"), None);
        assert_eq!(clean.attribute("Implementation-Title"), Some("forge"));
    }

    #[test]
    fn copies_missing_classes_only() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.jar");
        let target = dir.path().join("target.jar");
        let mut source_entries = IndexMap::new();
        source_entries.insert("com/A.class".to_owned(), vec![1]);
        source_entries.insert("com/B.class".to_owned(), vec![2]);
        source_entries.insert("data.txt".to_owned(), vec![3]);
        write_jar(&source, &source_entries).unwrap();
        let mut target_entries = IndexMap::new();
        target_entries.insert("com/B.class".to_owned(), vec![9]);
        write_jar(&target, &target_entries).unwrap();

        copy_missing_classes(&source, &target).unwrap();
        let merged = read_jar(&target).unwrap();
        assert_eq!(merged["com/A.class"], vec![1]);
        // existing class not overwritten
        assert_eq!(merged["com/B.class"], vec![9]);
        // resources aren't copied by the class walk
        assert!(!merged.contains_key("data.txt"));
    }
}
