//! Produces a patched, remapped game runtime for mod development: the clean
//! distribution is renamed into the loader's intermediate namespace, binary
//! patched, merged with the loader's own distribution, access transformed
//! and remapped back to official names, with a manifest version tag gating
//! the on-disk cache between runs.
extern crate indexmap;
extern crate failure;
extern crate failure_derive;
extern crate itertools;
extern crate scopeguard;
extern crate log;
extern crate once_cell;
extern crate regex;
extern crate tempfile;
extern crate crossbeam;
extern crate parking_lot;
extern crate serde;
extern crate serde_derive;
extern crate serde_json;
extern crate csv;
extern crate curl;
extern crate zip;

pub mod binpatch;
pub mod classfile;
pub mod config;
pub mod coremod;
pub mod descriptor;
pub mod jar;
pub mod mappings;
pub mod merge;
pub mod patches;
pub mod platform;
pub mod postprocess;
pub mod provider;
pub mod remap;
pub mod transform;
pub mod utils;

pub use self::mappings::{MappingOption, MappingService, MappingTree};
pub use self::platform::{DistributionKind, Platform};
pub use self::provider::{
    GameJars, PatchedProvider, PipelineContext, PipelineOutcome,
    CURRENT_PATCH_VERSION, PATCH_VERSION_KEY,
};
