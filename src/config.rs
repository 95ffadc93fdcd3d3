//! The userdev distribution's development configuration: which tool applies
//! the binary patches and how to invoke it, where access-transform
//! directives live, and what the universal jar wants filtered away. Parsed
//! from the `config.json` entry of the userdev archive.

use std::path::Path;

use failure::Error;
use failure_derive::Fail;
use serde_derive::Deserialize;

use crate::jar;

pub const CONFIG_ENTRY: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserdevConfig {
    pub binpatcher: BinaryPatcherConfig,
    /// Path of the joined (merged-distribution) patch blob inside the
    /// userdev jar itself.
    #[serde(default)]
    pub binpatches: Option<String>,
    #[serde(default)]
    pub ats: AccessTransformerLocation,
    /// Resource paths the universal jar does not want in the merged output,
    /// as glob patterns.
    #[serde(default)]
    pub universal_filters: Vec<String>,
    /// Internal names of side-only annotations whose classes get stripped
    /// when remapping a single-sided distribution.
    #[serde(default, alias = "sass")]
    pub side_annotations: Vec<String>,
    /// Name of the distribution's auxiliary inject directory.
    #[serde(default)]
    pub inject: Option<String>,
    #[serde(default)]
    pub patches_original_prefix: Option<String>,
    #[serde(default)]
    pub patches_modified_prefix: Option<String>,
}
impl UserdevConfig {
    pub fn from_jar(userdev_jar: &Path) -> Result<UserdevConfig, Error> {
        let data = jar::read_jar_entry(userdev_jar, CONFIG_ENTRY)?
            .ok_or_else(|| MissingUserdevConfig(userdev_jar.display().to_string()))?;
        Ok(::serde_json::from_slice(&data)?)
    }
    #[inline]
    pub fn inject_dir(&self) -> &str {
        self.inject.as_deref().unwrap_or("inject")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinaryPatcherConfig {
    /// Maven coordinate of the patch tool.
    #[serde(alias = "version")]
    pub dependency: String,
    /// Argument template; `{clean}`, `{output}` and `{patch}` are
    /// substituted with absolute paths at invocation time.
    pub args: Vec<String>,
}

/// Where access-transform directives live inside the userdev archive:
/// either a directory to scan, or an explicit list of entry paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccessTransformerLocation {
    Directory(String),
    Paths(Vec<String>),
}
impl Default for AccessTransformerLocation {
    fn default() -> AccessTransformerLocation {
        AccessTransformerLocation::Directory("ats/".into())
    }
}

#[derive(Debug, Fail)]
#[fail(display = "No userdev config in {}", _0)]
pub struct MissingUserdevConfig(String);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_modern_config() {
        let config: UserdevConfig = ::serde_json::from_str(
            r#"{
                "binpatcher": {
                    "version": "net.minecraftforge:binarypatcher:1.1.1:fatjar",
                    "args": ["--clean", "{clean}", "--output", "{output}", "--apply", "{patch}"]
                },
                "binpatches": "joined.lzma",
                "ats": "ats/",
                "universalFilters": ["^/net/minecraftforge/fml/.*$"],
                "inject": "inject",
                "patchesOriginalPrefix": "a/",
                "patchesModifiedPrefix": "b/"
            }"#,
        ).unwrap();
        assert_eq!(config.binpatcher.dependency, "net.minecraftforge:binarypatcher:1.1.1:fatjar");
        assert_eq!(config.binpatcher.args.len(), 6);
        assert_eq!(config.binpatches.as_deref(), Some("joined.lzma"));
        assert_eq!(config.patches_original_prefix.as_deref(), Some("a/"));
        match config.ats {
            AccessTransformerLocation::Directory(ref dir) => assert_eq!(dir, "ats/"),
            ref other => panic!("unexpected location {:?}", other),
        }
    }

    #[test]
    fn parse_explicit_at_paths() {
        let config: UserdevConfig = ::serde_json::from_str(
            r#"{
                "binpatcher": {"dependency": "a:b:1", "args": []},
                "ats": ["fml_at.cfg", "forge_at.cfg"],
                "sass": ["net/minecraftforge/fml/relauncher/SideOnly"]
            }"#,
        ).unwrap();
        match config.ats {
            AccessTransformerLocation::Paths(ref paths) => {
                assert_eq!(paths, &["fml_at.cfg".to_owned(), "forge_at.cfg".to_owned()]);
            }
            ref other => panic!("unexpected location {:?}", other),
        }
        assert_eq!(config.side_annotations.len(), 1);
        assert_eq!(config.inject_dir(), "inject");
    }
}
