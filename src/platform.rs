use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use failure_derive::Fail;

use crate::mappings::MappingOption;

/// Which mod-loader family a pipeline run targets. Whether a distribution is
/// "legacy" is an externally injected classification (platform capability
/// flags live outside this crate); nothing here re-derives it from artifact
/// contents.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Platform {
    Forge,
    LegacyForge,
    NeoForge,
}
impl Platform {
    /// The loader id used in cache paths and jar prefixes. These exact
    /// strings are load-bearing: the loader's own launcher only recognises
    /// the game when one of them appears in the artifact name.
    #[inline]
    pub fn id(self) -> &'static str {
        match self {
            Platform::Forge | Platform::LegacyForge => "forge",
            Platform::NeoForge => "neoforge",
        }
    }
    /// Identifier of the intermediate namespace this loader pivots through.
    #[inline]
    pub fn intermediate_id(self) -> &'static str {
        match self {
            Platform::Forge | Platform::LegacyForge => "srg",
            Platform::NeoForge => "mojang",
        }
    }
    #[inline]
    pub fn is_modern(self) -> bool {
        !self.is_legacy()
    }
    #[inline]
    pub fn is_legacy(self) -> bool {
        self == Platform::LegacyForge
    }
    #[inline]
    pub fn is_neoforge(self) -> bool {
        self == Platform::NeoForge
    }
    /// The mapping selection policy for this loader family.
    #[inline]
    pub fn mapping_option(self) -> MappingOption {
        match self {
            Platform::Forge | Platform::LegacyForge => MappingOption::WithSrg,
            Platform::NeoForge => MappingOption::WithMojang,
        }
    }
}
impl FromStr for Platform {
    type Err = InvalidPlatform;

    fn from_str(s: &str) -> Result<Platform, InvalidPlatform> {
        Ok(match s {
            "forge" => Platform::Forge,
            "legacy-forge" => Platform::LegacyForge,
            "neoforge" => Platform::NeoForge,
            _ => return Err(InvalidPlatform(s.into())),
        })
    }
}
impl Display for Platform {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match *self {
            Platform::Forge => "forge",
            Platform::LegacyForge => "legacy-forge",
            Platform::NeoForge => "neoforge",
        })
    }
}
#[derive(Debug, Fail)]
#[fail(display = "Invalid platform {:?}", _0)]
pub struct InvalidPlatform(String);

/// Which game distribution a pipeline run transforms.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DistributionKind {
    Client,
    Server,
    Merged,
}
impl DistributionKind {
    #[inline]
    pub fn id(self) -> &'static str {
        match self {
            DistributionKind::Client => "client",
            DistributionKind::Server => "server",
            DistributionKind::Merged => "merged",
        }
    }
}
impl FromStr for DistributionKind {
    type Err = InvalidDistributionKind;

    fn from_str(s: &str) -> Result<DistributionKind, InvalidDistributionKind> {
        Ok(match s {
            "client" => DistributionKind::Client,
            "server" => DistributionKind::Server,
            "merged" => DistributionKind::Merged,
            _ => return Err(InvalidDistributionKind(s.into())),
        })
    }
}
impl Display for DistributionKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.id())
    }
}
#[derive(Debug, Fail)]
#[fail(display = "Invalid distribution kind {:?}", _0)]
pub struct InvalidDistributionKind(String);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn platform_ids() {
        assert_eq!(Platform::Forge.id(), "forge");
        assert_eq!(Platform::LegacyForge.id(), "forge");
        assert_eq!(Platform::NeoForge.id(), "neoforge");
        assert_eq!(Platform::Forge.intermediate_id(), "srg");
        assert_eq!(Platform::NeoForge.intermediate_id(), "mojang");
        assert!(Platform::LegacyForge.is_legacy());
        assert!(Platform::Forge.is_modern());
    }

    #[test]
    fn parse_round_trip() {
        for platform in [Platform::Forge, Platform::LegacyForge, Platform::NeoForge] {
            assert_eq!(platform.to_string().parse::<Platform>().unwrap(), platform);
        }
        for kind in [DistributionKind::Client, DistributionKind::Server, DistributionKind::Merged] {
            assert_eq!(kind.to_string().parse::<DistributionKind>().unwrap(), kind);
        }
        assert!("fabric".parse::<Platform>().is_err());
    }
}
