//! Extracts the distributed binary patch set out of an installer or
//! universal archive into stable cache paths.

use std::fs;
use std::path::{Path, PathBuf};

use failure::Error;
use log::info;

use crate::jar;

/// Archive paths of the patch blobs in a modern installer distribution.
pub const MODERN_CLIENT_PATCHES: &str = "data/client.lzma";
pub const MODERN_SERVER_PATCHES: &str = "data/server.lzma";
/// The single combined patch blob shipped by legacy distributions.
pub const LEGACY_PATCH_BLOB: &str = "binpatches.pack.lzma";
pub const LEGACY_CLIENT_PREFIX: &str = "binpatch/client/";
pub const LEGACY_SERVER_PREFIX: &str = "binpatch/server/";

/// Converts a legacy combined patch blob into the per-side format the patch
/// tool understands. The conversion routine itself lives outside this crate.
pub trait LegacyPatchConverter {
    fn convert(&self, blob: &[u8], prefix: &str) -> Result<Vec<u8>, Error>;
}

/// Where the raw patch data comes from. Modern distributions ship split
/// per-side blobs in the installer; legacy ones ship one combined blob in
/// the universal jar. Which variant applies is decided by the caller's
/// platform classification, never inferred here.
pub enum PatchSource<'a> {
    Modern {
        installer_jar: &'a Path,
    },
    Legacy {
        universal_jar: &'a Path,
        converter: &'a dyn LegacyPatchConverter,
    },
}

pub struct PatchProvider {
    pub client_patches: PathBuf,
    pub server_patches: PathBuf,
}
impl PatchProvider {
    pub fn new(cache_dir: &Path) -> Result<PatchProvider, Error> {
        fs::create_dir_all(cache_dir)?;
        Ok(PatchProvider {
            client_patches: cache_dir.join("patches-client.lzma"),
            server_patches: cache_dir.join("patches-server.lzma"),
        })
    }

    /// Extracts both patch files unless they already exist and no refresh
    /// was requested. Outputs are written fresh, replacing stale data.
    pub fn provide(&self, source: &PatchSource, refresh: bool) -> Result<(), Error> {
        if self.client_patches.exists() && self.server_patches.exists() && !refresh {
            return Ok(())
        }
        info!(":extracting binary patches");
        match *source {
            PatchSource::Modern { installer_jar } => {
                let client = require_entry(installer_jar, MODERN_CLIENT_PATCHES)?;
                let server = require_entry(installer_jar, MODERN_SERVER_PATCHES)?;
                fs::write(&self.client_patches, client)?;
                fs::write(&self.server_patches, server)?;
            }
            PatchSource::Legacy { universal_jar, converter } => {
                let blob = require_entry(universal_jar, LEGACY_PATCH_BLOB)?;
                fs::write(&self.client_patches, converter.convert(&blob, LEGACY_CLIENT_PREFIX)?)?;
                fs::write(&self.server_patches, converter.convert(&blob, LEGACY_SERVER_PREFIX)?)?;
            }
        }
        Ok(())
    }
}

fn require_entry(archive: &Path, name: &str) -> Result<Vec<u8>, Error> {
    jar::read_jar_entry(archive, name)?
        .ok_or_else(|| jar::MissingEntry(format!("{} in {}", name, archive.display())).into())
}
