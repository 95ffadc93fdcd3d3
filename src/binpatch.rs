//! Applies the distributed binary patch set to a clean jar by driving the
//! loader's own patch tool. The patch format is opaque to us: the tool is
//! resolved from its maven coordinate, spawned with the configured argument
//! template, and trusted on its exit status.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use failure::Error;
use failure_derive::Fail;
use log::{debug, info};

use crate::config::BinaryPatcherConfig;
use crate::jar;
use crate::utils::{self, DependencyDownloader};

#[derive(Debug, Fail)]
pub enum PatchToolError {
    #[fail(display = "Patch tool {} exited with {}", _0, _1)]
    NonZeroExit(String, i32),
    #[fail(display = "Patch tool {} was killed by a signal", _0)]
    Killed(String),
    #[fail(display = "Patch tool {} produced no output at {}", _0, _1)]
    NoOutput(String, String),
    #[fail(display = "No Main-Class manifest attribute in patch tool jars")]
    NoMainClass,
}

/// The patch-application contract the pipeline depends on. The production
/// implementation spawns the loader's own tool; tests may substitute one.
pub trait PatchApplier {
    fn patch(&self, clean: &Path, output: &Path, patches: &Path) -> Result<(), Error>;
}

pub struct BinaryPatcher<'a> {
    config: &'a BinaryPatcherConfig,
    downloader: &'a dyn DependencyDownloader,
    java_executable: PathBuf,
}
impl<'a> BinaryPatcher<'a> {
    pub fn new(
        config: &'a BinaryPatcherConfig,
        downloader: &'a dyn DependencyDownloader,
    ) -> BinaryPatcher<'a> {
        BinaryPatcher { config, downloader, java_executable: PathBuf::from("java") }
    }
    pub fn with_java(mut self, java_executable: PathBuf) -> BinaryPatcher<'a> {
        self.java_executable = java_executable;
        self
    }

}
impl<'a> PatchApplier for BinaryPatcher<'a> {
    fn patch(&self, clean: &Path, output: &Path, patches: &Path) -> Result<(), Error> {
        let classpath = self.downloader.resolve(&self.config.dependency)?;
        let main_class = find_main_class(&classpath)?;
        let args = substitute_args(&self.config.args, clean, output, patches)?;
        info!(":applying binary patches with {}", self.config.dependency);
        debug!("patch tool invocation: {} {:?}", main_class, args);
        let status = Command::new(&self.java_executable)
            .arg("-cp")
            .arg(utils::join_classpath(&classpath))
            .arg(&main_class)
            .args(&args)
            .status()?;
        if !status.success() {
            return Err(match status.code() {
                Some(code) => PatchToolError::NonZeroExit(self.config.dependency.clone(), code),
                None => PatchToolError::Killed(self.config.dependency.clone()),
            }.into())
        }
        if !output.exists() {
            return Err(PatchToolError::NoOutput(
                self.config.dependency.clone(),
                output.display().to_string(),
            ).into())
        }
        Ok(())
    }
}

/// Substitutes the `{clean}`/`{output}`/`{patch}` placeholders of the
/// configured argument template with absolute paths; all other arguments
/// pass through verbatim.
pub fn substitute_args(
    template: &[String],
    clean: &Path,
    output: &Path,
    patches: &Path,
) -> Result<Vec<String>, Error> {
    let clean = absolute(clean)?;
    let output = absolute(output)?;
    let patches = absolute(patches)?;
    Ok(template.iter()
        .map(|arg| match arg.as_str() {
            "{clean}" => clean.display().to_string(),
            "{output}" => output.display().to_string(),
            "{patch}" => patches.display().to_string(),
            other => other.to_owned(),
        })
        .collect())
}

fn absolute(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

/// Reads the `Main-Class` attribute from the first tool jar that declares
/// one. The downloader hands us a classpath; only jar files are inspected.
pub fn find_main_class(files: &[PathBuf]) -> Result<String, Error> {
    for file in files {
        if file.extension().map(|ext| ext == "jar").unwrap_or(false) {
            if let Some(manifest) = jar::read_manifest(file)? {
                if let Some(main_class) = manifest.attribute("Main-Class") {
                    return Ok(main_class.to_owned())
                }
            }
        }
    }
    Err(PatchToolError::NoMainClass.into())
}
