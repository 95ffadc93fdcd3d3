//! Access transforms: directives that widen the visibility of classes and
//! members without changing behavior. Directive files are extracted from the
//! userdev archive, normalized for a legacy syntax quirk, and then applied
//! directly to the class files of the target jar.

use std::fs;
use std::path::{Path, PathBuf};

use failure::Error;
use failure_derive::Fail;
use indexmap::IndexMap;
use itertools::Itertools;
use log::info;

use crate::classfile::{self, ClassFile, flags};
use crate::config::AccessTransformerLocation;
use crate::jar;
use crate::utils::TempFiles;

#[derive(Debug, Fail)]
#[fail(display = "Invalid access transform line {:?}", _0)]
pub struct InvalidDirective(String);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum AccessModifier {
    // Ordering is the widening order; a directive never narrows.
    Private,
    Default,
    Protected,
    Public,
}
impl AccessModifier {
    fn of_flags(access_flags: u16) -> AccessModifier {
        if access_flags & flags::ACC_PUBLIC != 0 {
            AccessModifier::Public
        } else if access_flags & flags::ACC_PROTECTED != 0 {
            AccessModifier::Protected
        } else if access_flags & flags::ACC_PRIVATE != 0 {
            AccessModifier::Private
        } else {
            AccessModifier::Default
        }
    }
    fn apply(self, access_flags: u16) -> u16 {
        if AccessModifier::of_flags(access_flags) >= self {
            return access_flags
        }
        let cleared = access_flags & !(flags::ACC_PUBLIC | flags::ACC_PROTECTED | flags::ACC_PRIVATE);
        match self {
            AccessModifier::Public => cleared | flags::ACC_PUBLIC,
            AccessModifier::Protected => cleared | flags::ACC_PROTECTED,
            AccessModifier::Private => cleared | flags::ACC_PRIVATE,
            AccessModifier::Default => cleared,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalModifier {
    Strip,
    Add,
}
impl FinalModifier {
    fn apply(self, access_flags: u16) -> u16 {
        match self {
            FinalModifier::Strip => access_flags & !flags::ACC_FINAL,
            FinalModifier::Add => access_flags | flags::ACC_FINAL,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Class,
    Field { name: String },
    AllFields,
    Method { name: String, descriptor: String },
    AllMethods,
}

#[derive(Clone, Debug)]
pub struct Directive {
    pub modifier: AccessModifier,
    pub final_modifier: Option<FinalModifier>,
    pub target: Target,
}

/// Parsed directives grouped by owner class (internal name).
#[derive(Debug, Default)]
pub struct AccessTransformSet {
    by_owner: IndexMap<String, Vec<Directive>>,
}
impl AccessTransformSet {
    pub fn parse_into(&mut self, text: &str) -> Result<(), Error> {
        for raw_line in text.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue
            }
            let mut parts = line.split_whitespace();
            let invalid = || InvalidDirective(raw_line.to_owned());
            let modifier_spec = parts.next().ok_or_else(invalid)?;
            let owner = parts.next().ok_or_else(invalid)?.replace('.', "/");
            let member = parts.next();
            if parts.next().is_some() {
                return Err(invalid().into())
            }
            let (modifier, final_modifier) = parse_modifier(modifier_spec).ok_or_else(invalid)?;
            let target = match member {
                None => Target::Class,
                Some("*") => Target::AllFields,
                Some("*()") => Target::AllMethods,
                Some(member) => match member.find('(') {
                    Some(paren) => Target::Method {
                        name: member[..paren].to_owned(),
                        descriptor: member[paren..].to_owned(),
                    },
                    None => Target::Field { name: member.to_owned() },
                },
            };
            self.by_owner.entry(owner).or_insert_with(Vec::new).push(Directive {
                modifier, final_modifier, target,
            });
        }
        Ok(())
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.by_owner.values().map(Vec::len).sum()
    }
    fn directives_for(&self, owner: &str) -> &[Directive] {
        self.by_owner.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn parse_modifier(spec: &str) -> Option<(AccessModifier, Option<FinalModifier>)> {
    let (access, final_modifier) = if let Some(access) = spec.strip_suffix("-f") {
        (access, Some(FinalModifier::Strip))
    } else if let Some(access) = spec.strip_suffix("+f") {
        (access, Some(FinalModifier::Add))
    } else {
        (spec, None)
    };
    let modifier = match access {
        "public" => AccessModifier::Public,
        "protected" => AccessModifier::Protected,
        "default" => AccessModifier::Default,
        "private" => AccessModifier::Private,
        _ => return None,
    };
    Some((modifier, final_modifier))
}

/// Fixes the legacy directive syntax where constructor entries were written
/// without the trailing void return marker.
pub fn normalize_directives(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.contains('<') && line.ends_with(')') {
                format!("{}V", line)
            } else {
                line.to_owned()
            }
        })
        .join("\n")
}

/// Locates access-transform directive entries inside the userdev archive.
/// Only entry names are resolved here; missing entries are skipped later.
fn directive_entries(
    userdev_jar: &Path,
    location: &AccessTransformerLocation,
) -> Result<Vec<String>, Error> {
    Ok(match *location {
        AccessTransformerLocation::Directory(ref dir) => {
            let prefix = if dir.ends_with('/') { dir.clone() } else { format!("{}/", dir) };
            let entries = jar::read_jar(userdev_jar)?;
            entries.keys()
                .filter(|name| {
                    name.starts_with(&prefix) && !name[prefix.len()..].contains('/')
                })
                .cloned()
                .collect()
        }
        AccessTransformerLocation::Paths(ref paths) => paths.clone(),
    })
}

/// Extracts directive files from the userdev archive into normalized scratch
/// copies. A named entry that doesn't exist is tolerated and skipped; the
/// lookup returns an `Option` which is inspected before use.
pub fn extract_access_transformers(
    userdev_jar: &Path,
    location: &AccessTransformerLocation,
    temp: &TempFiles,
) -> Result<Vec<PathBuf>, Error> {
    let mut extracted = Vec::new();
    for entry in directive_entries(userdev_jar, location)? {
        let data = match jar::read_jar_entry(userdev_jar, &entry)? {
            Some(data) => data,
            None => continue,
        };
        let text = String::from_utf8(data)?;
        let normalized = normalize_directives(&text);
        let scratch = temp.file("at-conf", ".cfg")?;
        fs::write(&scratch, normalized)?;
        extracted.push(scratch);
    }
    Ok(extracted)
}

/// Rewrites member visibility in `input` according to the directive files,
/// producing a new jar at `output`. Resources pass through verbatim.
pub fn access_transform(
    input: &Path,
    output: &Path,
    directive_files: &[PathBuf],
) -> Result<(), Error> {
    let mut directives = AccessTransformSet::default();
    for file in directive_files {
        directives.parse_into(&fs::read_to_string(file)?)?;
    }
    info!(":access transforming ({} directives)", directives.len());
    if output.exists() {
        fs::remove_file(output)?;
    }
    let mut entries = jar::read_jar(input)?;
    for (name, data) in entries.iter_mut() {
        if !jar::is_class_file(name) {
            continue
        }
        let mut class = ClassFile::parse(data)?;
        if apply_to_class(&mut class, &directives)? {
            *data = class.write();
        }
    }
    jar::write_jar(output, &entries)?;
    Ok(())
}

fn apply_to_class(class: &mut ClassFile, directives: &AccessTransformSet) -> Result<bool, Error> {
    let owner = class.name()?.to_owned();
    let mut changed = false;
    for directive in directives.directives_for(&owner) {
        match directive.target {
            Target::Class => {
                changed |= apply_flags(&mut class.access_flags, directive);
            }
            Target::Field { ref name } => {
                for index in member_indices(class, true, Some(name))? {
                    changed |= apply_flags(&mut class.fields[index].access_flags, directive);
                }
            }
            Target::AllFields => {
                for index in member_indices(class, true, None)? {
                    changed |= apply_flags(&mut class.fields[index].access_flags, directive);
                }
            }
            Target::Method { ref name, ref descriptor } => {
                for index in method_indices(class, name, descriptor)? {
                    changed |= apply_flags(&mut class.methods[index].access_flags, directive);
                }
            }
            Target::AllMethods => {
                for index in member_indices(class, false, None)? {
                    changed |= apply_flags(&mut class.methods[index].access_flags, directive);
                }
            }
        }
    }
    changed |= apply_to_inner_classes(class, directives)?;
    Ok(changed)
}

/// A class directive must also widen the matching `InnerClasses` entry, or
/// the compiler-facing access recorded there would contradict the class.
fn apply_to_inner_classes(
    class: &mut ClassFile,
    directives: &AccessTransformSet,
) -> Result<bool, Error> {
    let attribute = match classfile::find_attribute(&class.pool, &class.attributes, "InnerClasses") {
        Some(attribute) => attribute.info.clone(),
        None => return Ok(false),
    };
    let mut inner_classes = classfile::parse_inner_classes(&attribute)?;
    let mut changed = false;
    for entry in &mut inner_classes {
        let inner_name = class.pool.class_name(entry.inner_class_info)?.to_owned();
        for directive in directives.directives_for(&inner_name) {
            if directive.target == Target::Class {
                changed |= apply_flags(&mut entry.access_flags, directive);
            }
        }
    }
    if changed {
        let data = classfile::write_inner_classes(&inner_classes);
        if let Some(attribute) =
            classfile::find_attribute_mut(&class.pool, &mut class.attributes, "InnerClasses")
        {
            attribute.info = data;
        }
    }
    Ok(changed)
}

fn apply_flags(access_flags: &mut u16, directive: &Directive) -> bool {
    let mut updated = directive.modifier.apply(*access_flags);
    if let Some(final_modifier) = directive.final_modifier {
        updated = final_modifier.apply(updated);
    }
    let changed = updated != *access_flags;
    *access_flags = updated;
    changed
}

fn member_indices(
    class: &ClassFile,
    fields: bool,
    name: Option<&str>,
) -> Result<Vec<usize>, Error> {
    let members = if fields { &class.fields } else { &class.methods };
    let mut indices = Vec::new();
    for (index, member) in members.iter().enumerate() {
        if let Some(name) = name {
            if class.pool.utf8(member.name_index)? != name {
                continue
            }
        }
        indices.push(index);
    }
    Ok(indices)
}
fn method_indices(class: &ClassFile, name: &str, descriptor: &str) -> Result<Vec<usize>, Error> {
    let mut indices = Vec::new();
    for (index, method) in class.methods.iter().enumerate() {
        if class.pool.utf8(method.name_index)? == name
            && class.pool.utf8(method.descriptor_index)? == descriptor
        {
            indices.push(index);
        }
    }
    Ok(indices)
}
