#[cfg(dummy)] // Needed for IntelliJ autocomplete
extern crate minecraft_patcher as patcher;
#[macro_use]
extern crate clap;
extern crate failure;
extern crate env_logger;
extern crate log;

use std::fs;
use std::path::PathBuf;

use failure::Error;
use log::info;

use patcher::binpatch::BinaryPatcher;
use patcher::config::UserdevConfig;
use patcher::mappings::{MappingService, NameTablePaths};
use patcher::utils::MavenDownloader;
use patcher::{DistributionKind, GameJars, PatchedProvider, PipelineContext, Platform};

const DEFAULT_REPOSITORIES: &[&str] = &[
    "https://maven.minecraftforge.net",
    "https://maven.neoforged.net/releases",
    "https://repo.maven.apache.org/maven2",
];

fn app() -> clap::App<'static, 'static> {
    clap_app!(minecraft_patcher =>
        (version: crate_version!())
        (about: "Produces a patched, remapped game runtime for mod development")
        (@arg cache: --cache +takes_value default_value[cache] "Specify an alternate cache location")
        (@arg refresh: --("refresh-deps") "Force re-extraction and regeneration of all cached artifacts")
        (@arg platform: --platform +takes_value default_value[forge] "Loader platform: forge, legacy-forge or neoforge")
        (@arg kind: --kind +takes_value default_value[merged] "Distribution kind: client, server or merged")
        (@arg mappings: --mappings +required +takes_value "The mapping file (official/intermediate/named)")
        (@arg mcp_fields: --("mcp-fields") +takes_value requires[mcp_methods] "Optional MCP fields.csv name table")
        (@arg mcp_methods: --("mcp-methods") +takes_value requires[mcp_fields] "Optional MCP methods.csv name table")
        (@arg clean: --clean +required +takes_value "The clean game jar for the chosen distribution kind")
        (@arg client: --client +takes_value "The client jar (defaults to the clean jar)")
        (@arg userdev: --userdev +required +takes_value "The loader userdev archive")
        (@arg universal: --universal +required +takes_value "The loader universal (distribution) jar")
        (@arg installer: --installer +takes_value "The loader installer (required on modern platforms)")
        (@arg official_names: --("official-names") "Development names are mojang-official")
        (@arg loader_version: +required "The loader version, e.g. 1.20.1-47.2.0")
    )
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let matches = app().get_matches();
    let platform = value_t!(matches, "platform", Platform).unwrap_or_else(|e| e.exit());
    let kind = value_t!(matches, "kind", DistributionKind).unwrap_or_else(|e| e.exit());
    let cache_dir = PathBuf::from(matches.value_of("cache").unwrap());
    fs::create_dir_all(&cache_dir)?;

    let name_tables = match (matches.value_of("mcp_fields"), matches.value_of("mcp_methods")) {
        (Some(fields), Some(methods)) => Some(NameTablePaths {
            fields: PathBuf::from(fields),
            methods: PathBuf::from(methods),
        }),
        _ => None,
    };
    let mappings = MappingService::new(
        PathBuf::from(matches.value_of("mappings").unwrap()),
        name_tables,
    );

    let userdev_jar = PathBuf::from(matches.value_of("userdev").unwrap());
    let config = UserdevConfig::from_jar(&userdev_jar)?;
    let downloader = MavenDownloader::new(
        cache_dir.clone(),
        DEFAULT_REPOSITORIES.iter().map(|s| (*s).to_owned()).collect(),
    );
    let patcher = BinaryPatcher::new(&config.binpatcher, &downloader);

    let clean = PathBuf::from(matches.value_of("clean").unwrap());
    let client = matches.value_of("client")
        .map(PathBuf::from)
        .unwrap_or_else(|| clean.clone());
    let context = PipelineContext {
        cache_dir,
        platform,
        loader_version: matches.value_of("loader_version").unwrap().to_owned(),
        kind,
        refresh: matches.is_present("refresh"),
        official_names: matches.is_present("official_names"),
        game_jars: GameJars { clean, client },
        userdev_jar,
        universal_jar: PathBuf::from(matches.value_of("universal").unwrap()),
        installer_jar: matches.value_of("installer").map(PathBuf::from),
        mappings: &mappings,
        patcher: &patcher,
        legacy_converter: None,
        annotation_fixer: None,
    };

    let provider = PatchedProvider::new(context)?;
    let outcome = provider.run()?;
    if outcome.dirty {
        info!("regenerated patched jar at {}", outcome.patched_jar.display());
    } else {
        info!("patched jar up to date at {}", outcome.patched_jar.display());
    }
    for (configuration, artifact) in &outcome.dependencies {
        println!("{}={}", configuration, artifact.display());
    }
    println!("{}", outcome.patched_jar.display());
    Ok(())
}
