//! Merges the patched game jar with the loader's distribution jar.
//!
//! The merge is driven through the same machinery a remap would use -- an
//! identity mapping over two tracked input tags -- purely to inherit its
//! class-level conflict handling and resource filtering. Policies applied on
//! the way through: manifest sanitizing, the universal exclude filter, the
//! distribution's `inject/` payload (minus the name-mapping service
//! descriptor), and a final guard that copies back any class the merge
//! deduplicated away.

use std::fs;
use std::path::Path;

use failure::Error;
use indexmap::IndexMap;
use log::{debug, info};
use regex::Regex;

use crate::config::UserdevConfig;
use crate::jar::{self, Manifest, MANIFEST_PATH};
use crate::utils::{TempFiles, WorkerPanicked};

/// The loader's name-mapping service registration. Exactly one of these may
/// exist in the merged output: the target runtime crashes on duplicate
/// service registrations for the same namespace pair, and ours must win.
pub const NAME_MAPPING_SERVICE_PATH: &str =
    "META-INF/services/cpw.mods.modlauncher.api.INameMappingService";

/// Tracks which input an entry came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum InputTag {
    Game,
    Distribution,
}

pub struct MergeEngine {
    universal_filters: Vec<Regex>,
    inject_prefix: String,
}
impl MergeEngine {
    pub fn new(config: &UserdevConfig) -> Result<MergeEngine, Error> {
        let universal_filters = config.universal_filters.iter()
            .map(|glob| glob_to_regex(glob))
            .collect::<Result<Vec<Regex>, Error>>()?;
        let mut inject_prefix = config.inject_dir().to_owned();
        if !inject_prefix.ends_with('/') {
            inject_prefix.push('/');
        }
        Ok(MergeEngine { universal_filters, inject_prefix })
    }

    /// Merges `distribution_jar` (and, for modern loaders, the userdev jar's
    /// own classes) into `game_jar`, replacing it. A scratch jar is built
    /// first and only copied over the target on success.
    pub fn merge(
        &self,
        game_jar: &Path,
        distribution_jar: &Path,
        extra_distribution: Option<&Path>,
        temp: &TempFiles,
    ) -> Result<(), Error> {
        info!(":merging loader distribution into {}", game_jar.display());
        // Both inputs are read concurrently on their own tags and joined
        // before any write-out begins.
        let read_result = crossbeam::thread::scope(|scope| {
            let game = scope.spawn(|_| jar::read_jar(game_jar));
            let distribution = scope.spawn(|_| jar::read_jar(distribution_jar));
            (game.join(), distribution.join())
        });
        let (game, distribution) = match read_result {
            Ok(results) => results,
            Err(_) => return Err(WorkerPanicked.into()),
        };
        let game_entries = game.map_err(|_| WorkerPanicked)??;
        let mut distribution_entries = distribution.map_err(|_| WorkerPanicked)??;
        if let Some(extra) = extra_distribution {
            // The extra jar participates as a class input only; its
            // resources (configs, directive files) stay out of the merge.
            for (name, data) in jar::read_jar(extra)? {
                if jar::is_class_file(&name) {
                    distribution_entries.entry(name).or_insert(data);
                }
            }
        }

        let mut merged: IndexMap<String, (InputTag, Vec<u8>)> = IndexMap::new();
        for (name, data) in game_entries.iter() {
            merged.insert(name.clone(), (InputTag::Game, data.clone()));
        }
        self.apply_distribution(&mut merged, &distribution_entries)?;

        // Guard: every class of the pre-merge input must survive the merge.
        for (name, data) in game_entries.iter() {
            if jar::is_class_file(name) && !merged.contains_key(name) {
                merged.insert(name.clone(), (InputTag::Game, data.clone()));
            }
        }

        let output: IndexMap<String, Vec<u8>> = merged.into_iter()
            .map(|(name, (_, data))| (name, data))
            .collect();
        let scratch = temp.file("merged", ".tmp.jar")?;
        jar::write_jar(&scratch, &output)?;
        fs::copy(&scratch, game_jar)?;
        Ok(())
    }

    fn apply_distribution(
        &self,
        merged: &mut IndexMap<String, (InputTag, Vec<u8>)>,
        distribution: &IndexMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        for (name, data) in distribution {
            if let Some(inject_path) = name.strip_prefix(&self.inject_prefix) {
                // The inject payload lands at the archive root, except the
                // name-mapping service descriptor: the game side already
                // registers one and duplicates crash the runtime.
                if inject_path == NAME_MAPPING_SERVICE_PATH {
                    debug!("skipping duplicate name mapping service from inject");
                    continue
                }
                merged.entry(inject_path.to_owned())
                    .or_insert_with(|| (InputTag::Distribution, data.clone()));
                continue
            }
            if jar::is_class_file(name) {
                // Distribution classes win over the game's on overlap.
                merged.insert(name.clone(), (InputTag::Distribution, data.clone()));
                continue
            }
            if self.is_filtered(name) {
                debug!("universal filter excluded {}", name);
                continue
            }
            if name == MANIFEST_PATH {
                let sanitized = Manifest::parse(data).sanitized();
                merged.insert(name.clone(), (InputTag::Distribution, sanitized.to_bytes()));
                continue
            }
            if is_signature_file(name) {
                continue
            }
            if name == NAME_MAPPING_SERVICE_PATH && merged.contains_key(name) {
                continue
            }
            merged.insert(name.clone(), (InputTag::Distribution, data.clone()));
        }
        Ok(())
    }

    fn is_filtered(&self, name: &str) -> bool {
        let name = name.trim_start_matches('/');
        self.universal_filters.iter().any(|filter| filter.is_match(name))
    }
}

/// Jar signing metadata can't survive a merge; the signatures no longer
/// verify anything.
fn is_signature_file(name: &str) -> bool {
    name.starts_with("META-INF/")
        && (name.ends_with(".SF") || name.ends_with(".DSA") || name.ends_with(".RSA"))
}

/// Compiles one exclude glob into an anchored regex. `*` stays within one
/// path segment, `**` crosses segments.
pub fn glob_to_regex(glob: &str) -> Result<Regex, Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut chars = glob.trim_start_matches('/').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    Ok(Regex::new(&pattern)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{AccessTransformerLocation, BinaryPatcherConfig};
    use tempfile::TempDir;

    fn engine(filters: &[&str]) -> MergeEngine {
        let config = UserdevConfig {
            binpatcher: BinaryPatcherConfig {
                dependency: "a:b:1".into(),
                args: Vec::new(),
            },
            binpatches: None,
            ats: AccessTransformerLocation::default(),
            universal_filters: filters.iter().map(|s| (*s).to_owned()).collect(),
            side_annotations: Vec::new(),
            inject: Some("inject".into()),
            patches_original_prefix: None,
            patches_modified_prefix: None,
        };
        MergeEngine::new(&config).unwrap()
    }

    #[test]
    fn glob_compilation() {
        let regex = glob_to_regex("assets/*.json").unwrap();
        assert!(regex.is_match("assets/sounds.json"));
        assert!(!regex.is_match("assets/lang/en_us.json"));
        let deep = glob_to_regex("data/**").unwrap();
        assert!(deep.is_match("data/tags/items/planks.json"));
        assert!(!deep.is_match("assets/x"));
    }

    #[test]
    fn merge_keeps_all_classes_and_one_service_descriptor() {
        let dir = TempDir::new().unwrap();
        let temp = TempFiles::new().unwrap();
        let game = dir.path().join("game.jar");
        let distribution = dir.path().join("forge-universal.jar");

        let mut game_entries = IndexMap::new();
        game_entries.insert(MANIFEST_PATH.to_owned(), b"Manifest-Version: 1.0\r\n\r\n".to_vec());
        game_entries.insert("com/game/A.class".to_owned(), b"class-a".to_vec());
        game_entries.insert("com/game/B.class".to_owned(), b"class-b-original".to_vec());
        game_entries.insert(NAME_MAPPING_SERVICE_PATH.to_owned(), b"our.NamingService".to_vec());
        jar::write_jar(&game, &game_entries).unwrap();

        let mut distribution_entries = IndexMap::new();
        distribution_entries.insert(
            MANIFEST_PATH.to_owned(),
            b"Manifest-Version: 1.0\r\nSHA-256-Digest: nope\r\nImplementation-Title: forge\r\n\r\n".to_vec(),
        );
        distribution_entries.insert("com/game/B.class".to_owned(), b"class-b-patched".to_vec());
        distribution_entries.insert("com/loader/C.class".to_owned(), b"class-c".to_vec());
        distribution_entries.insert("META-INF/FORGE.SF".to_owned(), b"signature".to_vec());
        distribution_entries.insert("unwanted/readme.txt".to_owned(), b"drop me".to_vec());
        distribution_entries.insert(
            format!("inject/{}", NAME_MAPPING_SERVICE_PATH),
            b"their.NamingService".to_vec(),
        );
        distribution_entries.insert("inject/META-INF/extra.cfg".to_owned(), b"injected".to_vec());
        jar::write_jar(&distribution, &distribution_entries).unwrap();

        engine(&["unwanted/**"]).merge(&game, &distribution, None, &temp).unwrap();

        let merged = jar::read_jar(&game).unwrap();
        // every pre-merge class survived; overlapping class came from the
        // distribution
        assert_eq!(merged["com/game/A.class"], b"class-a".to_vec());
        assert_eq!(merged["com/game/B.class"], b"class-b-patched".to_vec());
        assert_eq!(merged["com/loader/C.class"], b"class-c".to_vec());
        // exactly one name mapping service descriptor, and it's ours
        assert_eq!(merged[NAME_MAPPING_SERVICE_PATH], b"our.NamingService".to_vec());
        assert_eq!(
            merged.keys().filter(|name| name.ends_with("INameMappingService")).count(),
            1
        );
        // inject payload landed at the root
        assert_eq!(merged["META-INF/extra.cfg"], b"injected".to_vec());
        // filtered resource and signing data removed, manifest sanitized
        assert!(!merged.contains_key("unwanted/readme.txt"));
        assert!(!merged.contains_key("META-INF/FORGE.SF"));
        let manifest = Manifest::parse(&merged[MANIFEST_PATH]);
        assert_eq!(manifest.attribute("SHA-256-Digest"), None);
        assert_eq!(manifest.attribute("Implementation-Title"), Some("forge"));
    }

    #[test]
    fn extra_distribution_classes_participate() {
        let dir = TempDir::new().unwrap();
        let temp = TempFiles::new().unwrap();
        let game = dir.path().join("game.jar");
        let distribution = dir.path().join("universal.jar");
        let userdev = dir.path().join("userdev.jar");

        let mut game_entries = IndexMap::new();
        game_entries.insert("com/game/A.class".to_owned(), b"a".to_vec());
        jar::write_jar(&game, &game_entries).unwrap();
        jar::write_jar(&distribution, &IndexMap::new()).unwrap();
        let mut userdev_entries = IndexMap::new();
        userdev_entries.insert("com/loader/Dev.class".to_owned(), b"dev".to_vec());
        jar::write_jar(&userdev, &userdev_entries).unwrap();

        engine(&[]).merge(&game, &distribution, Some(&userdev), &temp).unwrap();
        let merged = jar::read_jar(&game).unwrap();
        assert!(merged.contains_key("com/game/A.class"));
        assert!(merged.contains_key("com/loader/Dev.class"));
    }
}
