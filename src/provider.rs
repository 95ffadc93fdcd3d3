//! The patched-jar production pipeline.
//!
//! Stages run strictly in order -- remap to the intermediate namespace,
//! binary patch, merge the loader distribution, access transform, remap to
//! official names, core-mod post-processing -- and a manifest version tag on
//! the final jar is the sole durable cache signal. Once one stage has to
//! regenerate its output, every later stage regenerates unconditionally;
//! that fact is threaded through the run as an explicit `PipelineOutcome`
//! value and handed back to the caller instead of living in shared state.

use std::fs;
use std::path::PathBuf;

use failure::Error;
use failure_derive::Fail;
use log::{info, warn};

use crate::binpatch::PatchApplier;
use crate::config::UserdevConfig;
use crate::coremod::CoreModClassRemapper;
use crate::jar;
use crate::mappings::{MappingService, OFFICIAL_NAMESPACE};
use crate::merge::MergeEngine;
use crate::patches::{LegacyPatchConverter, PatchProvider, PatchSource};
use crate::platform::{DistributionKind, Platform};
use crate::postprocess::{self, ClassTransformer};
use crate::remap::{self, ClassPostProcessor, JarRemapper, RemappedJar, SidedClassStripper};
use crate::transform;
use crate::utils::TempFiles;

/// Manifest attribute naming the pipeline version that produced a jar.
pub const PATCH_VERSION_KEY: &str = "Loom-Patch-Version";
/// Exact-match cache validity signal; any other value invalidates everything.
pub const CURRENT_PATCH_VERSION: &str = "9";
/// Configuration name the client-extra jar is registered under.
pub const EXTRA_CONFIGURATION: &str = "forgeExtra";

#[derive(Debug, Fail)]
pub enum PipelineError {
    #[fail(display = "A legacy platform needs a legacy patch converter")]
    MissingConverter,
    #[fail(display = "A modern platform needs the installer artifact")]
    MissingInstaller,
    #[fail(display = "Userdev config declares no joined patches")]
    MissingJoinedPatches,
}

/// The game jars feeding one run: the clean distribution input for the
/// chosen kind, plus the client jar whose resources become the extra jar.
#[derive(Debug, Clone)]
pub struct GameJars {
    pub clean: PathBuf,
    pub client: PathBuf,
}

pub struct PipelineContext<'a> {
    pub cache_dir: PathBuf,
    pub platform: Platform,
    pub loader_version: String,
    pub kind: DistributionKind,
    /// Forces full re-extraction and regeneration of every cached artifact.
    pub refresh: bool,
    /// True when development names are mojang-official; the
    /// parameter-annotation fixer only applies when they aren't.
    pub official_names: bool,
    pub game_jars: GameJars,
    pub userdev_jar: PathBuf,
    pub universal_jar: PathBuf,
    pub installer_jar: Option<PathBuf>,
    pub mappings: &'a MappingService,
    pub patcher: &'a dyn PatchApplier,
    pub legacy_converter: Option<&'a dyn LegacyPatchConverter>,
    pub annotation_fixer: Option<&'a dyn ClassTransformer>,
}

/// Stage artifact paths, derived from loader id + version + stage id.
#[derive(Debug, Clone)]
pub struct PatchedFiles {
    pub intermediate_jar: PathBuf,
    pub patched_intermediate_jar: PathBuf,
    pub patched_intermediate_at_jar: PathBuf,
    pub patched_jar: PathBuf,
    pub client_extra_jar: PathBuf,
}

/// What a run did, threaded through the stages and returned to the caller.
/// External consumers re-derive their own state from `dirty` rather than
/// re-checking file timestamps.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub dirty: bool,
    pub patched_jar: PathBuf,
    /// (configuration name, artifact) pairs to register downstream.
    pub dependencies: Vec<(String, PathBuf)>,
}
impl PipelineOutcome {
    fn clean(patched_jar: PathBuf) -> PipelineOutcome {
        PipelineOutcome { dirty: false, patched_jar, dependencies: Vec::new() }
    }
}

pub struct PatchedProvider<'a> {
    context: PipelineContext<'a>,
    config: UserdevConfig,
    files: PatchedFiles,
    working_dir: PathBuf,
}
impl<'a> PatchedProvider<'a> {
    pub fn new(context: PipelineContext<'a>) -> Result<PatchedProvider<'a>, Error> {
        let config = UserdevConfig::from_jar(&context.userdev_jar)?;
        let working_dir = context.cache_dir
            .join(context.platform.id())
            .join(&context.loader_version);
        fs::create_dir_all(&working_dir)?;
        // The loader id must appear verbatim in the artifact names; the
        // loader's launcher uses it to recognise the game.
        let prefix = format!("{}-{}-", context.platform.id(), context.loader_version);
        let kind = context.kind.id();
        let intermediate = context.platform.intermediate_id();
        let files = PatchedFiles {
            intermediate_jar: working_dir
                .join(format!("{}minecraft-{}-{}.jar", prefix, kind, intermediate)),
            patched_intermediate_jar: working_dir
                .join(format!("{}minecraft-{}-{}-patched.jar", prefix, kind, intermediate)),
            patched_intermediate_at_jar: working_dir
                .join(format!("{}minecraft-{}-{}-at-patched.jar", prefix, kind, intermediate)),
            patched_jar: working_dir.join(format!("{}minecraft-{}-patched.jar", prefix, kind)),
            client_extra_jar: working_dir.join(format!("{}client-extra.jar", prefix)),
        };
        Ok(PatchedProvider { context, config, files, working_dir })
    }

    #[inline]
    pub fn files(&self) -> &PatchedFiles {
        &self.files
    }
    #[inline]
    pub fn config(&self) -> &UserdevConfig {
        &self.config
    }

    fn global_caches(&self) -> [&PathBuf; 5] {
        [
            &self.files.intermediate_jar,
            &self.files.patched_intermediate_jar,
            &self.files.patched_intermediate_at_jar,
            &self.files.patched_jar,
            &self.files.client_extra_jar,
        ]
    }
    fn clean_all_cache(&self) -> Result<(), Error> {
        for path in self.global_caches() {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
    fn check_cache(&self) -> Result<(), Error> {
        let missing = self.global_caches().iter().any(|path| !path.exists());
        if self.context.refresh || missing || !self.is_patched_jar_up_to_date()? {
            self.clean_all_cache()?;
        }
        Ok(())
    }
    fn is_patched_jar_up_to_date(&self) -> Result<bool, Error> {
        if !self.files.patched_jar.exists() {
            return Ok(false)
        }
        let manifest = match jar::read_manifest(&self.files.patched_jar)? {
            Some(manifest) => manifest,
            None => return Ok(false),
        };
        let value = manifest.attribute(PATCH_VERSION_KEY);
        if value == Some(CURRENT_PATCH_VERSION) {
            Ok(true)
        } else {
            warn!(
                ":patched jars not up to date. current version: {}",
                value.unwrap_or("<none>")
            );
            Ok(false)
        }
    }

    /// Stages one to three: intermediate remap, binary patch + merge, access
    /// transform. Returns the dirty state for the remaining stages.
    pub fn provide(&self) -> Result<PipelineOutcome, Error> {
        self.check_cache()?;
        let mut outcome = PipelineOutcome::clean(self.files.patched_jar.clone());
        let temp = TempFiles::new()?;

        if !self.files.intermediate_jar.exists() {
            outcome.dirty = true;
            self.remap_to_intermediate()?;
        }
        if outcome.dirty || !self.files.patched_intermediate_jar.exists() {
            outcome.dirty = true;
            self.patch_jars()?;
            self.merge_distribution(&temp)?;
        }
        if outcome.dirty || !self.files.patched_intermediate_at_jar.exists() {
            outcome.dirty = true;
            self.access_transform(&temp)?;
        }
        Ok(outcome)
    }

    /// Stage four: remap to official names, rewrite core-mod managers, stamp
    /// the version tag and refill the client-extra jar. Only runs when an
    /// earlier stage was dirty; either way the extra jar is registered as a
    /// downstream dependency.
    pub fn remap_patched_jar(&self, mut outcome: PipelineOutcome) -> Result<PipelineOutcome, Error> {
        if outcome.dirty {
            let tree = self.context.mappings.tree(self.context.platform.mapping_option())?;
            let mapper = tree.name_mapper(
                self.context.platform.intermediate_id(),
                OFFICIAL_NAMESPACE,
            )?;
            let remapper = JarRemapper::new(
                mapper,
                &self.context.mappings.mappings_path().display().to_string(),
            ).fix_records(true);
            remapper.remap_jar(&RemappedJar {
                input: self.files.patched_intermediate_at_jar.clone(),
                output: self.files.patched_jar.clone(),
                source_namespace: self.context.platform.intermediate_id().to_owned(),
                classpath: vec![self.context.universal_jar.clone()],
            })?;
            postprocess::transform_classes(&self.files.patched_jar, &CoreModClassRemapper)?;
            jar::patch_manifest_attribute(
                &self.files.patched_jar,
                PATCH_VERSION_KEY,
                CURRENT_PATCH_VERSION,
            )?;
            self.fill_client_extra_jar()?;
        }
        remap::ensure_backup_jars(
            &[self.files.patched_jar.clone()],
            outcome.dirty,
        )?;
        outcome.dependencies.push((
            EXTRA_CONFIGURATION.to_owned(),
            self.files.client_extra_jar.clone(),
        ));
        Ok(outcome)
    }

    /// The whole pipeline: `provide` then `remap_patched_jar`.
    pub fn run(&self) -> Result<PipelineOutcome, Error> {
        let outcome = self.provide()?;
        self.remap_patched_jar(outcome)
    }

    /// Stage one: the clean distribution jar is remapped from its official
    /// (obfuscated) names into the loader's intermediate namespace. Single-
    /// sided distributions drop classes annotated for the other side here.
    fn remap_to_intermediate(&self) -> Result<(), Error> {
        let tree = self.context.mappings.tree(self.context.platform.mapping_option())?;
        let mapper = tree.name_mapper(
            OFFICIAL_NAMESPACE,
            self.context.platform.intermediate_id(),
        )?;
        let stripper = self.sided_class_stripper();
        let mut remapper = JarRemapper::new(
            mapper,
            &self.context.mappings.mappings_path().display().to_string(),
        ).fix_records(true);
        if let Some(ref stripper) = stripper {
            remapper = remapper.post_processor(stripper as &dyn ClassPostProcessor);
        }
        remapper.remap_jar(&RemappedJar {
            input: self.context.game_jars.clean.clone(),
            output: self.files.intermediate_jar.clone(),
            source_namespace: OFFICIAL_NAMESPACE.to_owned(),
            classpath: Vec::new(),
        })
    }
    fn sided_class_stripper(&self) -> Option<SidedClassStripper> {
        if self.config.side_annotations.is_empty() {
            return None
        }
        let keep_side = match self.context.kind {
            DistributionKind::Client => "CLIENT",
            DistributionKind::Server => "SERVER",
            DistributionKind::Merged => return None,
        };
        Some(SidedClassStripper::new(&self.config.side_annotations, keep_side))
    }

    /// Stage two, first half: apply the binary patch set, then restore any
    /// class the patch tool dropped and clean up debug metadata.
    fn patch_jars(&self) -> Result<(), Error> {
        info!(":patching jars");
        let patches = self.resolve_patches()?;
        if self.files.patched_intermediate_jar.exists() {
            fs::remove_file(&self.files.patched_intermediate_jar)?;
        }
        self.context.patcher.patch(
            &self.files.intermediate_jar,
            &self.files.patched_intermediate_jar,
            &patches,
        )?;
        jar::copy_missing_classes(
            &self.files.intermediate_jar,
            &self.files.patched_intermediate_jar,
        )?;
        postprocess::delete_parameter_names(&self.files.patched_intermediate_jar)?;
        if !self.context.official_names {
            if let Some(fixer) = self.context.annotation_fixer {
                postprocess::fix_parameter_annotations(
                    &self.files.patched_intermediate_jar,
                    fixer,
                )?;
            }
        }
        Ok(())
    }

    /// Which patch set feeds this run: per-side sets come from the patch
    /// source resolver, the merged set ships inside the userdev jar.
    fn resolve_patches(&self) -> Result<PathBuf, Error> {
        match self.context.kind {
            DistributionKind::Merged => {
                let entry = self.config.binpatches.as_deref()
                    .ok_or(PipelineError::MissingJoinedPatches)?;
                let data = jar::read_jar_entry(&self.context.userdev_jar, entry)?
                    .ok_or_else(|| jar::MissingEntry(entry.to_owned()))?;
                let target = self.working_dir.join("patches-joined.lzma");
                if !target.exists() || self.context.refresh {
                    fs::write(&target, data)?;
                }
                Ok(target)
            }
            DistributionKind::Client | DistributionKind::Server => {
                let provider = PatchProvider::new(&self.working_dir)?;
                let source = self.patch_source()?;
                provider.provide(&source, self.context.refresh)?;
                Ok(match self.context.kind {
                    DistributionKind::Client => provider.client_patches,
                    _ => provider.server_patches,
                })
            }
        }
    }
    fn patch_source(&self) -> Result<PatchSource, Error> {
        if self.context.platform.is_legacy() {
            let converter = self.context.legacy_converter
                .ok_or(PipelineError::MissingConverter)?;
            Ok(PatchSource::Legacy {
                universal_jar: &self.context.universal_jar,
                converter,
            })
        } else {
            let installer_jar = self.context.installer_jar.as_deref()
                .ok_or(PipelineError::MissingInstaller)?;
            Ok(PatchSource::Modern { installer_jar })
        }
    }

    /// Stage two, second half: merge the loader's distribution jar (and, on
    /// modern platforms, the userdev jar's own classes) into the patched
    /// intermediate jar.
    fn merge_distribution(&self, temp: &TempFiles) -> Result<(), Error> {
        let engine = MergeEngine::new(&self.config)?;
        let extra = if self.context.platform.is_modern() {
            Some(self.context.userdev_jar.as_path())
        } else {
            None
        };
        engine.merge(
            &self.files.patched_intermediate_jar,
            &self.context.universal_jar,
            extra,
            temp,
        )
    }

    /// Stage three: extract, normalize and apply the userdev access
    /// transforms.
    fn access_transform(&self, temp: &TempFiles) -> Result<(), Error> {
        info!(":access transforming minecraft");
        let directive_files = transform::extract_access_transformers(
            &self.context.userdev_jar,
            &self.config.ats,
            temp,
        )?;
        transform::access_transform(
            &self.files.patched_intermediate_jar,
            &self.files.patched_intermediate_at_jar,
            &directive_files,
        )
    }

    /// Non-class, non-`META-INF` client resources are split into their own
    /// jar for downstream dependency registration.
    fn fill_client_extra_jar(&self) -> Result<(), Error> {
        jar::copy_non_class_files(
            &self.context.game_jars.client,
            &self.files.client_extra_jar,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{flags, minimal_class, ClassFile, MemberInfo};
    use crate::config::CONFIG_ENTRY;
    use crate::jar::MANIFEST_PATH;
    use crate::mappings::MappingService;
    use crate::merge::NAME_MAPPING_SERVICE_PATH;
    use indexmap::IndexMap;
    use std::path::Path;
    use tempfile::TempDir;

    const TREE: &str = "tiny\t2\t0\tofficial\tsrg\tnamed\n\
        c\ta\tcom/game/ASrg\tcom/game/A\n\
        c\tb\tcom/game/BSrg\tcom/game/B\n";

    /// Copies clean to output and drops in one marker class, standing in
    /// for the external binary patch tool.
    struct StubPatcher;
    impl PatchApplier for StubPatcher {
        fn patch(&self, clean: &Path, output: &Path, patches: &Path) -> Result<(), Error> {
            assert!(patches.exists(), "patch set must be resolved before the tool runs");
            let mut entries = jar::read_jar(clean)?;
            entries.insert(
                "com/game/Patched.class".to_owned(),
                minimal_class("com/game/Patched", "java/lang/Object").write(),
            );
            jar::write_jar(output, &entries)?;
            Ok(())
        }
    }

    fn class_with_private_field(name: &str) -> Vec<u8> {
        let mut class = minimal_class(name, "java/lang/Object");
        let field_name = class.pool.push_utf8("field");
        let descriptor = class.pool.push_utf8("I");
        class.fields.push(MemberInfo {
            access_flags: flags::ACC_PRIVATE,
            name_index: field_name,
            descriptor_index: descriptor,
            attributes: Vec::new(),
        });
        class.write()
    }

    struct Fixture {
        _dir: TempDir,
        cache: PathBuf,
        clean: PathBuf,
        client: PathBuf,
        userdev: PathBuf,
        universal: PathBuf,
        installer: PathBuf,
        mappings_path: PathBuf,
    }
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let clean = root.join("minecraft-merged.jar");
        let mut entries = IndexMap::new();
        entries.insert(MANIFEST_PATH.to_owned(), b"Manifest-Version: 1.0\r\n\r\n".to_vec());
        entries.insert("a.class".to_owned(), minimal_class("a", "java/lang/Object").write());
        entries.insert("b.class".to_owned(), minimal_class("b", "java/lang/Object").write());
        entries.insert("assets/logo.png".to_owned(), vec![0x89]);
        entries.insert(NAME_MAPPING_SERVICE_PATH.to_owned(), b"our.Naming".to_vec());
        jar::write_jar(&clean, &entries).unwrap();

        // client jar shares the classes and carries extra resources
        let client = root.join("minecraft-client.jar");
        entries.insert("assets/sounds.json".to_owned(), b"{}".to_vec());
        jar::write_jar(&client, &entries).unwrap();

        let universal = root.join("forge-universal.jar");
        let mut universal_entries = IndexMap::new();
        // distribution overrides B (in intermediate names) and adds C
        universal_entries.insert(
            "com/game/BSrg.class".to_owned(),
            class_with_private_field("com/game/BSrg"),
        );
        universal_entries.insert(
            "com/loader/C.class".to_owned(),
            minimal_class("com/loader/C", "java/lang/Object").write(),
        );
        universal_entries.insert("unwanted/notes.txt".to_owned(), b"drop".to_vec());
        jar::write_jar(&universal, &universal_entries).unwrap();

        let userdev = root.join("forge-userdev.jar");
        let mut userdev_entries = IndexMap::new();
        userdev_entries.insert(
            CONFIG_ENTRY.to_owned(),
            br#"{
                "binpatcher": {
                    "version": "net.minecraftforge:binarypatcher:1.1.1:fatjar",
                    "args": ["--clean", "{clean}", "--output", "{output}", "--apply", "{patch}"]
                },
                "binpatches": "joined.lzma",
                "ats": "ats/",
                "universalFilters": ["unwanted/**"],
                "inject": "inject"
            }"#.to_vec(),
        );
        userdev_entries.insert("joined.lzma".to_owned(), b"patch-blob".to_vec());
        userdev_entries.insert(
            "ats/accesstransformer.cfg".to_owned(),
            b"public com.game.BSrg field".to_vec(),
        );
        userdev_entries.insert("inject/META-INF/dev.cfg".to_owned(), b"injected".to_vec());
        jar::write_jar(&userdev, &userdev_entries).unwrap();

        let installer = root.join("forge-installer.jar");
        let mut installer_entries = IndexMap::new();
        installer_entries.insert("data/client.lzma".to_owned(), b"client-patches".to_vec());
        installer_entries.insert("data/server.lzma".to_owned(), b"server-patches".to_vec());
        jar::write_jar(&installer, &installer_entries).unwrap();

        let mappings_path = root.join("mappings.tiny");
        fs::write(&mappings_path, TREE).unwrap();

        Fixture {
            cache: root.join("cache"),
            clean, client, userdev, universal, installer, mappings_path,
            _dir: dir,
        }
    }

    fn run_pipeline(fixture: &Fixture, service: &MappingService, refresh: bool) -> PipelineOutcome {
        let context = PipelineContext {
            cache_dir: fixture.cache.clone(),
            platform: Platform::Forge,
            loader_version: "1.20.1-47.2.0".into(),
            kind: DistributionKind::Merged,
            refresh,
            official_names: true,
            game_jars: GameJars {
                clean: fixture.clean.clone(),
                client: fixture.client.clone(),
            },
            userdev_jar: fixture.userdev.clone(),
            universal_jar: fixture.universal.clone(),
            installer_jar: Some(fixture.installer.clone()),
            mappings: service,
            patcher: &StubPatcher,
            legacy_converter: None,
            annotation_fixer: None,
        };
        PatchedProvider::new(context).unwrap().run().unwrap()
    }

    #[test]
    fn end_to_end_pipeline() {
        let fixture = fixture();
        let service = MappingService::new(fixture.mappings_path.clone(), None);

        let outcome = run_pipeline(&fixture, &service, false);
        assert!(outcome.dirty);
        assert_eq!(
            outcome.dependencies,
            vec![(EXTRA_CONFIGURATION.to_owned(), fixture.cache
                .join("forge").join("1.20.1-47.2.0")
                .join("forge-1.20.1-47.2.0-client-extra.jar"))]
        );

        let final_entries = jar::read_jar(&outcome.patched_jar).unwrap();
        // A survived the merge untouched, B came from the distribution
        // (overridden, with the field), C was added by the distribution.
        assert!(final_entries.contains_key("a.class"));
        assert!(final_entries.contains_key("b.class"));
        assert!(final_entries.contains_key("com/loader/C.class"));
        // the stub patch tool's marker class made it through every stage
        assert!(final_entries.contains_key("com/game/Patched.class"));
        // access transform: B.field is public in the final output
        let b_class = ClassFile::parse(&final_entries["b.class"]).unwrap();
        let field = &b_class.fields[0];
        assert_eq!(b_class.pool.utf8(field.name_index).unwrap(), "field");
        assert_eq!(field.access_flags & flags::ACC_PUBLIC, flags::ACC_PUBLIC);
        // filtered distribution resource never arrived; inject payload did
        assert!(!final_entries.contains_key("unwanted/notes.txt"));
        assert!(final_entries.contains_key("META-INF/dev.cfg"));
        // exactly one name-mapping service descriptor
        assert_eq!(
            final_entries.keys().filter(|name| name.ends_with("INameMappingService")).count(),
            1
        );
        // the durable cache signal
        let manifest = jar::read_manifest(&outcome.patched_jar).unwrap().unwrap();
        assert_eq!(manifest.attribute(PATCH_VERSION_KEY), Some(CURRENT_PATCH_VERSION));
        // backup jar for decompilation
        assert!(remap::backup_jar_path(&outcome.patched_jar).exists());
        // client extra carries resources only
        let extra = jar::read_jar(&outcome.dependencies[0].1).unwrap();
        assert!(extra.contains_key("assets/sounds.json"));
        assert!(extra.keys().all(|name| !name.ends_with(".class")));
    }

    #[test]
    fn second_run_is_clean_and_does_no_work() {
        let fixture = fixture();
        let service = MappingService::new(fixture.mappings_path.clone(), None);

        let first = run_pipeline(&fixture, &service, false);
        assert!(first.dirty);
        let bytes_before = fs::read(&first.patched_jar).unwrap();

        let second = run_pipeline(&fixture, &service, false);
        assert!(!second.dirty);
        assert_eq!(fs::read(&second.patched_jar).unwrap(), bytes_before);
        // the extra jar is still registered on clean runs
        assert_eq!(second.dependencies.len(), 1);
    }

    #[test]
    fn stale_version_tag_invalidates_everything() {
        let fixture = fixture();
        let service = MappingService::new(fixture.mappings_path.clone(), None);

        let first = run_pipeline(&fixture, &service, false);
        jar::patch_manifest_attribute(&first.patched_jar, PATCH_VERSION_KEY, "8").unwrap();

        let second = run_pipeline(&fixture, &service, false);
        assert!(second.dirty, "a mismatched tag must force a full rebuild");
        let manifest = jar::read_manifest(&second.patched_jar).unwrap().unwrap();
        assert_eq!(manifest.attribute(PATCH_VERSION_KEY), Some(CURRENT_PATCH_VERSION));
    }

    #[test]
    fn refresh_flag_forces_rebuild() {
        let fixture = fixture();
        let service = MappingService::new(fixture.mappings_path.clone(), None);
        assert!(run_pipeline(&fixture, &service, false).dirty);
        assert!(run_pipeline(&fixture, &service, true).dirty);
    }
}
