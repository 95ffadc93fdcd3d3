use std::io::{self, Write, Cursor};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::cell::Cell;

use failure::Error;
use failure_derive::Fail;
use curl::easy::Easy;
use tempfile::TempDir;

#[inline]
pub fn download_buffer(url: &str) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::with_capacity(2048);
    {
        let mut cursor = Cursor::new(buffer);
        download(url, &mut cursor)?;
        buffer = cursor.into_inner();
    }
    Ok(buffer)
}

pub fn download_file(url: &str, target: &Path) -> Result<(), Error> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(target)?;
    download(url, &mut file)?;
    file.sync_all()?;
    Ok(())
}

fn download<W: Write>(url: &str, output: &mut W) -> Result<(), Error> {
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.fail_on_error(true)?;
    let mut error: Option<io::Error> = None;
    let result = {
        let mut transfer = easy.transfer();
        transfer.write_function(
            |data| if let Err(e) = output.write_all(data) {
                error = Some(e);
                Ok(0)
            } else {
                Ok(data.len())
            },
        )?;
        transfer.perform()
    };
    if easy.response_code()? == 404 {
        return Err(HttpNotFound.into())
    }
    match result {
        Err(e) => {
            if let Some(actual_error) = error.take() {
                Err(actual_error.into())
            } else {
                Err(e.into())
            }
        }
        Ok(_) => {
            assert!(error.is_none());
            Ok(())
        }
    }
}
#[derive(Debug, Fail)]
#[fail(display = "HTTP 404 not found")]
pub struct HttpNotFound;

#[derive(Debug, Fail)]
#[fail(display = "A worker thread panicked")]
pub struct WorkerPanicked;

/// Resolves tool dependencies into local jar files.
///
/// The binary patcher (and similar helper tools) are declared as maven
/// coordinates by the userdev config; something has to turn those
/// coordinates into files on disk before we can spawn the tool.
pub trait DependencyDownloader {
    fn resolve(&self, coordinate: &str) -> Result<Vec<PathBuf>, Error>;
}

/// Downloads maven coordinates into a local cache directory.
///
/// Layout mirrors a maven repository: `tools/<group path>/<artifact>/<version>/`.
pub struct MavenDownloader {
    cache: PathBuf,
    repositories: Vec<String>,
}
impl MavenDownloader {
    pub fn new(cache: PathBuf, repositories: Vec<String>) -> MavenDownloader {
        MavenDownloader { cache, repositories }
    }
    fn cached_path(&self, coordinate: &MavenCoordinate) -> PathBuf {
        let mut path = self.cache.join("tools");
        for part in coordinate.group.split('.') {
            path.push(part);
        }
        path.push(&coordinate.artifact);
        path.push(&coordinate.version);
        path.push(coordinate.file_name());
        path
    }
}
impl DependencyDownloader for MavenDownloader {
    fn resolve(&self, coordinate: &str) -> Result<Vec<PathBuf>, Error> {
        let coordinate = coordinate.parse::<MavenCoordinate>()?;
        let target = self.cached_path(&coordinate);
        if !target.exists() {
            let mut last_error: Option<Error> = None;
            let mut downloaded = false;
            for repository in &self.repositories {
                let url = format!("{}/{}", repository.trim_end_matches('/'), coordinate.repository_path());
                match download_file(&url, &target) {
                    Ok(()) => {
                        downloaded = true;
                        break
                    },
                    Err(e) => last_error = Some(e),
                }
            }
            if !downloaded {
                return Err(last_error.unwrap_or_else(|| {
                    UnresolvableDependency(coordinate.to_string()).into()
                }))
            }
        }
        Ok(vec![target])
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MavenCoordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub classifier: Option<String>,
}
impl MavenCoordinate {
    fn file_name(&self) -> String {
        match self.classifier {
            Some(ref classifier) => format!("{}-{}-{}.jar", self.artifact, self.version, classifier),
            None => format!("{}-{}.jar", self.artifact, self.version),
        }
    }
    fn repository_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name()
        )
    }
}
impl ::std::str::FromStr for MavenCoordinate {
    type Err = InvalidCoordinate;

    fn from_str(s: &str) -> Result<MavenCoordinate, InvalidCoordinate> {
        let mut parts = s.split(':');
        let error = || InvalidCoordinate(s.into());
        let group = parts.next().filter(|s| !s.is_empty()).ok_or_else(error)?;
        let artifact = parts.next().filter(|s| !s.is_empty()).ok_or_else(error)?;
        let version = parts.next().filter(|s| !s.is_empty()).ok_or_else(error)?;
        let classifier = parts.next().map(String::from);
        if parts.next().is_some() {
            return Err(error())
        }
        Ok(MavenCoordinate {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            classifier,
        })
    }
}
impl ::std::fmt::Display for MavenCoordinate {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        if let Some(ref classifier) = self.classifier {
            write!(f, ":{}", classifier)?;
        }
        Ok(())
    }
}
#[derive(Debug, Fail)]
#[fail(display = "Invalid maven coordinate {:?}", _0)]
pub struct InvalidCoordinate(String);
#[derive(Debug, Fail)]
#[fail(display = "Unresolvable dependency {}", _0)]
pub struct UnresolvableDependency(String);

/// Scratch files scoped to one pipeline invocation.
///
/// Everything handed out lives inside a single temporary directory which is
/// removed when the scope is dropped, success or not. Scratch files are never
/// reused across runs.
pub struct TempFiles {
    root: TempDir,
    counter: Cell<u32>,
}
impl TempFiles {
    pub fn new() -> Result<TempFiles, Error> {
        Ok(TempFiles {
            root: TempDir::new()?,
            counter: Cell::new(0),
        })
    }
    pub fn file(&self, prefix: &str, suffix: &str) -> Result<PathBuf, Error> {
        let id = self.counter.get();
        self.counter.set(id + 1);
        let path = self.root.path().join(format!("{}-{}{}", prefix, id, suffix));
        File::create(&path)?;
        Ok(path)
    }
    pub fn directory(&self, name: &str) -> Result<PathBuf, Error> {
        let id = self.counter.get();
        self.counter.set(id + 1);
        let path = self.root.path().join(format!("{}-{}", name, id));
        fs::create_dir(&path)?;
        Ok(path)
    }
}

/// Joins classpath entries with the platform's path separator.
pub fn join_classpath(paths: &[PathBuf]) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    paths.iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
