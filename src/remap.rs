//! Bytecode remapping between namespaces.
//!
//! The remapper rewrites a class's constant pool under a flattened
//! `NameMapper`: class entries and descriptors are rewritten in place when
//! the utf8 entry is unambiguous, and appended-and-repointed when the entry
//! is shared with a string constant or carries context-dependent member
//! names. Auxiliary passes fix inner-class source names, generic signatures
//! and (for Java 16+) record components, and post-processors may drop
//! side-only classes entirely.

use std::fs;
use std::path::{Path, PathBuf};

use failure::Error;
use failure_derive::Fail;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use scopeguard::ScopeGuard;

use crate::classfile::{
    self, ClassFile, Constant, JAVA_16_MAJOR,
};
use crate::jar;
use crate::mappings::NameMapper;

/// One remap unit: input jar, output jar, the namespace its symbols are in,
/// and extra jars that provide context classes.
#[derive(Debug, Clone)]
pub struct RemappedJar {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_namespace: String,
    pub classpath: Vec<PathBuf>,
}

#[derive(Debug, Fail)]
#[fail(display = "Failed to remap {} with mappings from {}: {}", jar, mappings, cause)]
pub struct RemapError {
    pub jar: String,
    pub mappings: String,
    pub cause: Error,
}

/// What a post-apply visitor did to a class.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Processed {
    Unchanged,
    Modified,
    Dropped,
}

/// A visitor invoked on every class after the primary remap.
pub trait ClassPostProcessor {
    fn process(&self, name: &str, class: &mut ClassFile) -> Result<Processed, Error>;
}

/// Strips classes annotated as belonging to the other distribution side.
pub struct SidedClassStripper {
    annotations: Vec<String>,
    keep_side: String,
}
impl SidedClassStripper {
    /// `annotations` accepts internal names or descriptors; `keep_side` is
    /// the enum constant of the side being built (`CLIENT`/`SERVER`).
    pub fn new(annotations: &[String], keep_side: &str) -> SidedClassStripper {
        let annotations = annotations.iter()
            .map(|name| {
                if name.starts_with('L') && name.ends_with(';') {
                    name.clone()
                } else {
                    format!("L{};", name)
                }
            })
            .collect();
        SidedClassStripper { annotations, keep_side: keep_side.to_owned() }
    }
}
impl ClassPostProcessor for SidedClassStripper {
    fn process(&self, _name: &str, class: &mut ClassFile) -> Result<Processed, Error> {
        for attribute_name in ["RuntimeVisibleAnnotations", "RuntimeInvisibleAnnotations"] {
            let attribute = match classfile::find_attribute(&class.pool, &class.attributes, attribute_name) {
                Some(attribute) => attribute,
                None => continue,
            };
            for annotation in classfile::scan_annotations(&class.pool, &attribute.info)? {
                if !self.annotations.contains(&annotation.type_descriptor) {
                    continue
                }
                let sided_out = annotation.enum_values.iter().any(|(element, _, constant)| {
                    element == "value" && constant != &self.keep_side
                });
                if sided_out {
                    return Ok(Processed::Dropped)
                }
            }
        }
        Ok(Processed::Unchanged)
    }
}

/// Installs supplemental class signatures after the primary remap.
pub struct SignatureFixer {
    signatures: IndexMap<String, String>,
}
impl SignatureFixer {
    pub fn new(signatures: IndexMap<String, String>) -> SignatureFixer {
        SignatureFixer { signatures }
    }
}
impl ClassPostProcessor for SignatureFixer {
    fn process(&self, name: &str, class: &mut ClassFile) -> Result<Processed, Error> {
        let signature = match self.signatures.get(name) {
            Some(signature) => signature.clone(),
            None => return Ok(Processed::Unchanged),
        };
        let index = class.pool.push_utf8(&signature);
        if let Some(attribute) =
            classfile::find_attribute_mut(&class.pool, &mut class.attributes, "Signature")
        {
            if attribute.info == index.to_be_bytes() {
                return Ok(Processed::Unchanged)
            }
            attribute.info = index.to_be_bytes().to_vec();
        } else {
            let name_index = class.pool.push_utf8("Signature");
            class.attributes.push(classfile::AttributeInfo {
                name_index,
                info: index.to_be_bytes().to_vec(),
            });
        }
        Ok(Processed::Modified)
    }
}

pub struct JarRemapper<'a> {
    mapper: NameMapper,
    mappings_source: String,
    fix_records: bool,
    post_processors: Vec<&'a dyn ClassPostProcessor>,
}
impl<'a> JarRemapper<'a> {
    pub fn new(mapper: NameMapper, mappings_source: &str) -> JarRemapper<'a> {
        JarRemapper {
            mapper,
            mappings_source: mappings_source.to_owned(),
            fix_records: false,
            post_processors: Vec::new(),
        }
    }
    pub fn fix_records(mut self, fix_records: bool) -> JarRemapper<'a> {
        self.fix_records = fix_records;
        self
    }
    pub fn post_processor(mut self, processor: &'a dyn ClassPostProcessor) -> JarRemapper<'a> {
        self.post_processors.push(processor);
        self
    }

    /// Remaps one jar. Non-class resources are copied verbatim; the output
    /// goes through a scratch sibling which is removed if anything fails, so
    /// a partial output never lands under the final name.
    pub fn remap_jar(&self, descriptor: &RemappedJar) -> Result<(), Error> {
        info!(
            ":remapping {} ({} -> {})",
            descriptor.input.display(), descriptor.source_namespace, self.mappings_source
        );
        self.remap_jar_inner(descriptor).map_err(|cause| RemapError {
            jar: descriptor.input.display().to_string(),
            mappings: self.mappings_source.clone(),
            cause,
        }.into())
    }
    fn remap_jar_inner(&self, descriptor: &RemappedJar) -> Result<(), Error> {
        let entries = jar::read_jar(&descriptor.input)?;
        // Pre-read every class name (input + classpath context) and derive a
        // supplemental rename table for inner classes the tree doesn't list.
        let mut known_classes: Vec<String> = entries.keys()
            .filter(|name| jar::is_class_file(name))
            .map(|name| name.trim_end_matches(".class").to_owned())
            .collect();
        for extra in &descriptor.classpath {
            for name in jar::read_jar(extra)?.keys() {
                if jar::is_class_file(name) {
                    known_classes.push(name.trim_end_matches(".class").to_owned());
                }
            }
        }
        let mapper = self.inner_class_mapper(known_classes);

        let mut output_entries: IndexMap<String, Vec<u8>> = IndexMap::with_capacity(entries.len());
        for (name, data) in &entries {
            if !jar::is_class_file(name) {
                output_entries.insert(name.clone(), data.clone());
                continue
            }
            let class_name = name.trim_end_matches(".class");
            let mut class = ClassFile::parse(data)?;
            let mut modified = remap_class(&mut class, &mapper, self.fix_records)?;
            let remapped_name = class.name()?.to_owned();
            let mut dropped = false;
            for processor in &self.post_processors {
                match processor.process(&remapped_name, &mut class)? {
                    Processed::Unchanged => {}
                    Processed::Modified => modified = true,
                    Processed::Dropped => {
                        dropped = true;
                        break
                    }
                }
            }
            if dropped {
                debug!("stripped side-only class {}", class_name);
                continue
            }
            let entry_name = format!("{}.class", remapped_name);
            let bytes = if modified { class.write() } else { data.clone() };
            output_entries.insert(entry_name, bytes);
        }

        if let Some(parent) = descriptor.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let scratch = descriptor.output.with_extension("jar.tmp");
        let guard = scopeguard::guard(scratch.clone(), |path| {
            let _ = fs::remove_file(&path);
        });
        jar::write_jar(&scratch, &output_entries)?;
        if descriptor.output.exists() {
            fs::remove_file(&descriptor.output)?;
        }
        fs::rename(&scratch, &descriptor.output)?;
        let _ = ScopeGuard::into_inner(guard);
        Ok(())
    }

    /// Inner-class collisions: a class `a$1` whose outer `a` is mapped but
    /// which has no mapping of its own follows its outer class. Names are
    /// visited shortest-first so nested chains resolve deterministically.
    fn inner_class_mapper(&self, mut known_classes: Vec<String>) -> NameMapper {
        let mut mapper = self.mapper.clone();
        known_classes.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        known_classes.dedup();
        for name in &known_classes {
            if mapper.map_class(name).is_some() {
                continue
            }
            if let Some(split) = name.rfind('$') {
                let (outer, inner) = name.split_at(split);
                if let Some(mapped_outer) = mapper.map_class(outer) {
                    mapper.add_class(name, &format!("{}{}", mapped_outer, inner));
                }
            }
        }
        mapper
    }

    /// Runs the whole descriptor list, validating existing outputs first and
    /// recreating backup copies for downstream decompilation. Returns whether
    /// any work was done. On failure every output is deleted: a partially
    /// remapped set must not be mistaken for a valid cache.
    pub fn provide_all(&self, jars: &[RemappedJar], refresh: bool) -> Result<bool, Error> {
        let outputs_valid = jars.iter().all(|jar| jar.output.exists());
        let has_backups = jars.iter().all(|jar| backup_jar_path(&jar.output).exists());
        if outputs_valid && !refresh && has_backups {
            return Ok(false)
        }
        let result = (|| -> Result<(), Error> {
            for descriptor in jars {
                self.remap_jar(descriptor)?;
            }
            Ok(())
        })();
        if let Err(error) = result {
            for descriptor in jars {
                let _ = fs::remove_file(&descriptor.output);
            }
            return Err(error)
        }
        let outputs: Vec<PathBuf> = jars.iter().map(|jar| jar.output.clone()).collect();
        ensure_backup_jars(&outputs, true)?;
        Ok(true)
    }
}

/// Backup copies sit next to the remapped outputs and serve as the
/// decompilation inputs, so a later source-generation pass sees the jar
/// exactly as it was remapped.
pub fn backup_jar_path(output: &Path) -> PathBuf {
    let name = output.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.jar".into());
    output.with_file_name(format!("{}.backup", name))
}

/// Recreates backup jars when the outputs changed or a backup is missing.
pub fn ensure_backup_jars(outputs: &[PathBuf], dirty: bool) -> Result<(), Error> {
    for output in outputs {
        let backup = backup_jar_path(output);
        if dirty || !backup.exists() {
            fs::copy(output, &backup)?;
        }
    }
    Ok(())
}

/// Rewrites a class under the mapper. Returns whether anything changed.
pub fn remap_class(
    class: &mut ClassFile,
    mapper: &NameMapper,
    fix_records: bool,
) -> Result<bool, Error> {
    let mut changed = false;

    // Snapshot the pool: lookups below must see the original (source
    // namespace) strings even after earlier rewrites have been applied.
    let mut utf8: IndexMap<u16, String> = IndexMap::new();
    let mut class_entries: IndexMap<u16, u16> = IndexMap::new();
    let mut string_utf8: IndexSet<u16> = IndexSet::new();
    let mut nats: IndexMap<u16, (u16, u16)> = IndexMap::new();
    let mut member_refs: Vec<(u16, bool, u16, u16)> = Vec::new();
    let mut method_types: Vec<(u16, u16)> = Vec::new();
    for (index, entry) in class.pool.entries() {
        match *entry {
            Constant::Utf8(ref value) => {
                utf8.insert(index, value.clone());
            }
            Constant::Class { name } => {
                class_entries.insert(index, name);
            }
            Constant::String { value } => {
                string_utf8.insert(value);
            }
            Constant::NameAndType { name, descriptor } => {
                nats.insert(index, (name, descriptor));
            }
            Constant::FieldRef { class, name_and_type } => {
                member_refs.push((index, true, class, name_and_type));
            }
            Constant::MethodRef { class, name_and_type }
            | Constant::InterfaceMethodRef { class, name_and_type } => {
                member_refs.push((index, false, class, name_and_type));
            }
            Constant::MethodType { descriptor } => {
                method_types.push((index, descriptor));
            }
            _ => {}
        }
    }
    fn lookup(utf8: &IndexMap<u16, String>, index: u16) -> Result<&str, Error> {
        utf8.get(&index)
            .map(String::as_str)
            .ok_or_else(|| classfile::ClassFormatError::BadPoolIndex(index).into())
    }

    // Collect every utf8 index serving as a descriptor.
    let mut descriptor_utf8: IndexSet<u16> = IndexSet::new();
    for &(_, descriptor) in nats.values() {
        descriptor_utf8.insert(descriptor);
    }
    for member in class.fields.iter().chain(class.methods.iter()) {
        descriptor_utf8.insert(member.descriptor_index);
    }
    for &(_, descriptor) in &method_types {
        descriptor_utf8.insert(descriptor);
    }
    let mut lvtt_signature_utf8: IndexSet<u16> = IndexSet::new();
    for method in &class.methods {
        let code_attribute = match classfile::find_attribute(&class.pool, &method.attributes, "Code") {
            Some(attribute) => attribute,
            None => continue,
        };
        let code = classfile::CodeAttribute::parse(&code_attribute.info)?;
        for attribute in &code.attributes {
            let name = class.pool.utf8(attribute.name_index)?;
            if name == "LocalVariableTable" {
                for variable in classfile::parse_local_variables(&attribute.info)? {
                    descriptor_utf8.insert(variable.descriptor_index);
                }
            } else if name == "LocalVariableTypeTable" {
                for variable in classfile::parse_local_variables(&attribute.info)? {
                    lvtt_signature_utf8.insert(variable.descriptor_index);
                }
            }
        }
    }
    let record_fixup = fix_records && class.major_version >= JAVA_16_MAJOR;
    if record_fixup {
        if let Some(attribute) = classfile::find_attribute(&class.pool, &class.attributes, "Record") {
            for component in classfile::parse_record_components(&attribute.info)? {
                descriptor_utf8.insert(component.descriptor_index);
            }
        }
    }

    // Plan in-place rewrites. Class names and descriptors map the same way
    // wherever they appear, so rewriting the utf8 entry itself is safe,
    // except when a string constant shares it (ldc of a class name must keep
    // its runtime value) -- those sites get appended entries instead.
    let mut inplace: IndexMap<u16, String> = IndexMap::new();
    let mut repoint_classes: Vec<(u16, String)> = Vec::new();
    for (&entry_index, &name_index) in &class_entries {
        let name = lookup(&utf8, name_index)?;
        let mapped = if name.starts_with('[') {
            mapper.map_descriptor(name)
        } else {
            mapper.map_class(name)
        };
        if let Some(new_name) = mapped {
            if string_utf8.contains(&name_index) {
                repoint_classes.push((entry_index, new_name));
            } else {
                inplace.insert(name_index, new_name);
            }
        }
    }
    let mut repoint_descriptors: IndexMap<u16, String> = IndexMap::new();
    for &descriptor_index in &descriptor_utf8 {
        if inplace.contains_key(&descriptor_index) {
            // Already rewritten as an array class entry sharing this utf8.
            continue
        }
        if let Some(new_descriptor) = mapper.map_descriptor(lookup(&utf8, descriptor_index)?) {
            if string_utf8.contains(&descriptor_index) {
                repoint_descriptors.insert(descriptor_index, new_descriptor);
            } else {
                inplace.insert(descriptor_index, new_descriptor);
            }
        }
    }
    for &signature_index in &lvtt_signature_utf8 {
        if inplace.contains_key(&signature_index) || string_utf8.contains(&signature_index) {
            continue
        }
        if let Some(new_signature) = mapper.map_signature(lookup(&utf8, signature_index)?) {
            inplace.insert(signature_index, new_signature);
        }
    }

    // Member renames are context dependent (the same utf8 may name members
    // with different mappings), so they always append and repoint.
    let this_name = lookup(&utf8, *class_entries.get(&class.this_class)
        .ok_or_else(|| classfile::ClassFormatError::BadPoolIndex(class.this_class))?)?
        .to_owned();
    let mut field_renames: Vec<(usize, String)> = Vec::new();
    for (index, field) in class.fields.iter().enumerate() {
        let name = lookup(&utf8, field.name_index)?;
        let descriptor = lookup(&utf8, field.descriptor_index)?;
        if let Some(new_name) = mapper.map_field(&this_name, name, descriptor) {
            field_renames.push((index, new_name.to_owned()));
        }
    }
    let mut method_renames: Vec<(usize, String)> = Vec::new();
    for (index, method) in class.methods.iter().enumerate() {
        let name = lookup(&utf8, method.name_index)?;
        let descriptor = lookup(&utf8, method.descriptor_index)?;
        if let Some(new_name) = mapper.map_method(&this_name, name, descriptor) {
            method_renames.push((index, new_name.to_owned()));
        }
    }
    let mut ref_repoints: Vec<(u16, String, String)> = Vec::new();
    for &(ref_index, is_field, class_entry, nat_index) in &member_refs {
        let owner_utf8 = match class_entries.get(&class_entry) {
            Some(&owner_utf8) => owner_utf8,
            None => continue,
        };
        let owner = lookup(&utf8, owner_utf8)?;
        if owner.starts_with('[') {
            continue
        }
        let &(name_index, descriptor_index) = match nats.get(&nat_index) {
            Some(entry) => entry,
            None => continue,
        };
        let name = lookup(&utf8, name_index)?;
        let descriptor = lookup(&utf8, descriptor_index)?;
        let mapped = if is_field {
            mapper.map_field(owner, name, descriptor)
        } else {
            mapper.map_method(owner, name, descriptor)
        };
        if let Some(new_name) = mapped {
            let new_descriptor = mapper.map_descriptor(descriptor)
                .unwrap_or_else(|| descriptor.to_owned());
            ref_repoints.push((ref_index, new_name.to_owned(), new_descriptor));
        }
    }

    // Apply the plan.
    for (&index, value) in &inplace {
        class.pool.set(index, Constant::Utf8(value.clone()));
        changed = true;
    }
    for (entry_index, name) in repoint_classes {
        let name_index = class.pool.push_utf8(&name);
        class.pool.set(entry_index, Constant::Class { name: name_index });
        changed = true;
    }
    for (&shared_index, new_descriptor) in &repoint_descriptors {
        let descriptor_index = class.pool.push_utf8(new_descriptor);
        let nat_updates: Vec<(u16, u16)> = nats.iter()
            .filter(|(_, &(_, descriptor))| descriptor == shared_index)
            .map(|(&index, &(name, _))| (index, name))
            .collect();
        for (nat_index, name) in nat_updates {
            class.pool.set(nat_index, Constant::NameAndType { name, descriptor: descriptor_index });
        }
        for member in class.fields.iter_mut().chain(class.methods.iter_mut()) {
            if member.descriptor_index == shared_index {
                member.descriptor_index = descriptor_index;
            }
        }
        for &(type_index, descriptor) in &method_types {
            if descriptor == shared_index {
                class.pool.set(type_index, Constant::MethodType { descriptor: descriptor_index });
            }
        }
        changed = true;
    }
    for (ref_index, new_name, new_descriptor) in ref_repoints {
        let nat_index = class.pool.push_name_and_type(&new_name, &new_descriptor);
        let updated = match class.pool.get(ref_index)?.clone() {
            Constant::FieldRef { class, .. } => Constant::FieldRef { class, name_and_type: nat_index },
            Constant::MethodRef { class, .. } => Constant::MethodRef { class, name_and_type: nat_index },
            Constant::InterfaceMethodRef { class, .. } => {
                Constant::InterfaceMethodRef { class, name_and_type: nat_index }
            }
            other => other,
        };
        class.pool.set(ref_index, updated);
        changed = true;
    }
    for (index, new_name) in field_renames {
        class.fields[index].name_index = class.pool.push_utf8(&new_name);
        changed = true;
    }
    for (index, new_name) in method_renames {
        class.methods[index].name_index = class.pool.push_utf8(&new_name);
        changed = true;
    }

    changed |= remap_signatures(class, mapper, &utf8, record_fixup)?;
    changed |= fix_inner_class_names(class, &utf8)?;
    Ok(changed)
}

/// Rewrites `Signature` attributes on the class, its members and (when
/// enabled) its record components.
fn remap_signatures(
    class: &mut ClassFile,
    mapper: &NameMapper,
    original_utf8: &IndexMap<u16, String>,
    record_fixup: bool,
) -> Result<bool, Error> {
    let mut changed = false;
    let mut planned: Vec<(usize, Option<usize>, String)> = Vec::new();
    {
        let attribute_sets: Vec<(Option<usize>, &[classfile::AttributeInfo])> =
            Some((None, class.attributes.as_slice())).into_iter()
                .chain(class.fields.iter().enumerate().map(|(i, f)| (Some(i), f.attributes.as_slice())))
                .chain(class.methods.iter().enumerate()
                    .map(|(i, m)| (Some(class.fields.len() + i), m.attributes.as_slice())))
                .collect();
        for (owner, attributes) in attribute_sets {
            for (attribute_index, attribute) in attributes.iter().enumerate() {
                if class.pool.utf8(attribute.name_index)? != "Signature" {
                    continue
                }
                if attribute.info.len() != 2 {
                    continue
                }
                let signature_index = u16::from_be_bytes([attribute.info[0], attribute.info[1]]);
                let signature = match original_utf8.get(&signature_index) {
                    Some(signature) => signature,
                    None => continue,
                };
                if let Some(new_signature) = mapper.map_signature(signature) {
                    planned.push((attribute_index, owner, new_signature));
                }
            }
        }
    }
    for (attribute_index, owner, new_signature) in planned {
        let signature_index = class.pool.push_utf8(&new_signature);
        let attributes = match owner {
            None => &mut class.attributes,
            Some(index) if index < class.fields.len() => &mut class.fields[index].attributes,
            Some(index) => {
                let method_index = index - class.fields.len();
                &mut class.methods[method_index].attributes
            }
        };
        attributes[attribute_index].info = signature_index.to_be_bytes().to_vec();
        changed = true;
    }

    if record_fixup {
        let record_data = classfile::find_attribute(&class.pool, &class.attributes, "Record")
            .map(|attribute| attribute.info.clone());
        if let Some(data) = record_data {
            let mut components = classfile::parse_record_components(&data)?;
            let mut record_changed = false;
            for component in &mut components {
                for attribute in &mut component.attributes {
                    if class.pool.utf8(attribute.name_index)? != "Signature" || attribute.info.len() != 2 {
                        continue
                    }
                    let signature_index = u16::from_be_bytes([attribute.info[0], attribute.info[1]]);
                    let signature = match original_utf8.get(&signature_index) {
                        Some(signature) => signature.clone(),
                        None => continue,
                    };
                    if let Some(new_signature) = mapper.map_signature(&signature) {
                        let new_index = class.pool.push_utf8(&new_signature);
                        attribute.info = new_index.to_be_bytes().to_vec();
                        record_changed = true;
                    }
                }
            }
            if record_changed {
                let new_data = classfile::write_record_components(&components);
                if let Some(attribute) =
                    classfile::find_attribute_mut(&class.pool, &mut class.attributes, "Record")
                {
                    attribute.info = new_data;
                }
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Recomputes `InnerClasses` source names after the primary remap so the
/// recorded simple name agrees with the renamed class.
fn fix_inner_class_names(
    class: &mut ClassFile,
    original_utf8: &IndexMap<u16, String>,
) -> Result<bool, Error> {
    let attribute_data = match classfile::find_attribute(&class.pool, &class.attributes, "InnerClasses") {
        Some(attribute) => attribute.info.clone(),
        None => return Ok(false),
    };
    let mut inner_classes = classfile::parse_inner_classes(&attribute_data)?;
    let mut planned: Vec<(usize, String)> = Vec::new();
    for (index, entry) in inner_classes.iter().enumerate() {
        if entry.inner_name == 0 {
            continue
        }
        let current = class.pool.class_name(entry.inner_class_info)?;
        let simple = current.rsplit('$').next()
            .and_then(|name| name.rsplit('/').next())
            .unwrap_or(current);
        let existing = original_utf8.get(&entry.inner_name).map(String::as_str);
        if existing != Some(simple) {
            planned.push((index, simple.to_owned()));
        }
    }
    if planned.is_empty() {
        return Ok(false)
    }
    for (index, simple) in planned {
        inner_classes[index].inner_name = class.pool.push_utf8(&simple);
    }
    let new_data = classfile::write_inner_classes(&inner_classes);
    if let Some(attribute) =
        classfile::find_attribute_mut(&class.pool, &mut class.attributes, "InnerClasses")
    {
        attribute.info = new_data;
    }
    Ok(true)
}
