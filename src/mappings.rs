//! Cross-namespace symbol mappings.
//!
//! A `MappingTree` holds class/field/method/parameter names across the
//! `official` (obfuscated), intermediate (`srg` or `mojang`) and `named`
//! namespaces, parsed from a tab-separated mapping file. Trees are shared
//! read-only for the lifetime of a pipeline run; `MappingService` caches one
//! per mapping option so repeated stages never re-parse.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use failure::Error;
use failure_derive::Fail;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_derive::Deserialize;

use crate::descriptor;

pub const OFFICIAL_NAMESPACE: &str = "official";
pub const SRG_NAMESPACE: &str = "srg";
pub const MOJANG_NAMESPACE: &str = "mojang";
pub const NAMED_NAMESPACE: &str = "named";

/// Mapping selection policy. Loader families pivot through different
/// intermediate namespaces, so the service validates (and caches) a tree
/// per option.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MappingOption {
    /// Plain official ↔ named mappings, no intermediate required.
    Official,
    WithSrg,
    WithMojang,
}
impl MappingOption {
    #[inline]
    pub fn required_namespace(self) -> Option<&'static str> {
        match self {
            MappingOption::Official => None,
            MappingOption::WithSrg => Some(SRG_NAMESPACE),
            MappingOption::WithMojang => Some(MOJANG_NAMESPACE),
        }
    }
}

#[derive(Debug, Fail)]
pub enum MappingParseError {
    #[fail(display = "Missing mapping header")]
    MissingHeader,
    #[fail(display = "Invalid mapping line {}: {:?}", _0, _1)]
    InvalidLine(usize, String),
}
#[derive(Debug, Fail)]
#[fail(display = "Mappings have no {:?} namespace", _0)]
pub struct UnknownNamespace(String);

#[derive(Debug, Clone)]
pub struct ClassMapping {
    names: Vec<String>,
    fields: Vec<FieldMapping>,
    methods: Vec<MethodMapping>,
}
#[derive(Debug, Clone)]
pub struct FieldMapping {
    names: Vec<String>,
    /// Descriptor in the first (official) namespace.
    descriptor: String,
}
#[derive(Debug, Clone)]
pub struct MethodMapping {
    names: Vec<String>,
    descriptor: String,
    parameters: Vec<ParameterMapping>,
}
#[derive(Debug, Clone)]
pub struct ParameterMapping {
    pub lv_index: u16,
    names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MappingTree {
    namespaces: Vec<String>,
    classes: Vec<ClassMapping>,
}
impl MappingTree {
    pub fn parse<R: Read>(reader: R) -> Result<MappingTree, Error> {
        let reader = BufReader::new(reader);
        let mut lines = reader.lines().enumerate();
        let header = match lines.next() {
            Some((_, line)) => line?,
            None => return Err(MappingParseError::MissingHeader.into()),
        };
        let mut header_parts = header.split('\t');
        if header_parts.next() != Some("tiny") {
            return Err(MappingParseError::MissingHeader.into())
        }
        // major/minor format version
        header_parts.next();
        header_parts.next();
        let namespaces: Vec<String> = header_parts.map(String::from).collect();
        if namespaces.len() < 2 {
            return Err(MappingParseError::MissingHeader.into())
        }
        let count = namespaces.len();
        let mut classes: Vec<ClassMapping> = Vec::new();
        for (number, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue
            }
            let invalid = || MappingParseError::InvalidLine(number + 1, line.clone());
            let parts: Vec<&str> = line.split('\t').collect();
            if parts[0] == "c" {
                classes.push(ClassMapping {
                    names: read_names(&parts[1..], count),
                    fields: Vec::new(),
                    methods: Vec::new(),
                });
            } else if parts.len() > 2 && parts[0].is_empty() && parts[1] == "f" {
                let class = classes.last_mut().ok_or_else(invalid)?;
                class.fields.push(FieldMapping {
                    descriptor: parts[2].to_owned(),
                    names: read_names(&parts[3..], count),
                });
            } else if parts.len() > 2 && parts[0].is_empty() && parts[1] == "m" {
                let class = classes.last_mut().ok_or_else(invalid)?;
                class.methods.push(MethodMapping {
                    descriptor: parts[2].to_owned(),
                    names: read_names(&parts[3..], count),
                    parameters: Vec::new(),
                });
            } else if parts.len() > 3 && parts[0].is_empty() && parts[1].is_empty() && parts[2] == "p" {
                let class = classes.last_mut().ok_or_else(invalid)?;
                let method = class.methods.last_mut().ok_or_else(invalid)?;
                let lv_index = parts[3].parse::<u16>().map_err(|_| invalid())?;
                method.parameters.push(ParameterMapping {
                    lv_index,
                    names: read_names(&parts[4..], count),
                });
            } else {
                // Comment rows attach to the preceding element; skip them.
                match parts.iter().find(|part| !part.is_empty()) {
                    None | Some(&"c") => {}
                    Some(_) => return Err(invalid().into()),
                }
            }
        }
        Ok(MappingTree { namespaces, classes })
    }

    #[inline]
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }
    pub fn namespace(&self, id: &str) -> Option<usize> {
        self.namespaces.iter().position(|ns| ns == id)
    }
    #[inline]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Overlays crowd-sourced member names onto `target_namespace`, keyed by
    /// the member's name in `source_namespace`. This is how legacy loaders
    /// layer MCP-style CSV name tables over their intermediate names.
    pub fn apply_csv_names(
        &mut self,
        source_namespace: &str,
        target_namespace: &str,
        names: &McpNames,
    ) -> Result<(), Error> {
        let source = self.namespace(source_namespace)
            .ok_or_else(|| UnknownNamespace(source_namespace.into()))?;
        let target = self.namespace(target_namespace)
            .ok_or_else(|| UnknownNamespace(target_namespace.into()))?;
        for class in &mut self.classes {
            for field in &mut class.fields {
                if let Some(name) = names.fields.get(name_at(&field.names, source)) {
                    set_name(&mut field.names, target, name);
                }
            }
            for method in &mut class.methods {
                if let Some(name) = names.methods.get(name_at(&method.names, source)) {
                    set_name(&mut method.names, target, name);
                }
            }
        }
        Ok(())
    }

    /// Flattens the tree into a lookup table for one namespace pair. Member
    /// keys carry descriptors translated into the `from` namespace, which is
    /// what remapped class files actually reference.
    pub fn name_mapper(&self, from: &str, to: &str) -> Result<NameMapper, Error> {
        let from_index = self.namespace(from)
            .ok_or_else(|| UnknownNamespace(from.into()))?;
        let to_index = self.namespace(to)
            .ok_or_else(|| UnknownNamespace(to.into()))?;
        let mut official_to_from: IndexMap<String, String> = IndexMap::new();
        if from_index != 0 {
            for class in &self.classes {
                let official = name_at(&class.names, 0);
                let renamed = name_at(&class.names, from_index);
                if official != renamed {
                    official_to_from.insert(official.to_owned(), renamed.to_owned());
                }
            }
        }
        let translate = |descriptor: &str| {
            descriptor::map_descriptor(descriptor, &|name: &str| {
                official_to_from.get(name).cloned()
            }).unwrap_or_else(|| descriptor.to_owned())
        };

        let mut mapper = NameMapper::default();
        for class in &self.classes {
            let from_name = name_at(&class.names, from_index);
            let to_name = name_at(&class.names, to_index);
            if from_name != to_name {
                mapper.classes.insert(from_name.to_owned(), to_name.to_owned());
            }
            for field in &class.fields {
                let name = name_at(&field.names, from_index);
                let renamed = name_at(&field.names, to_index);
                if name != renamed {
                    let key = (from_name.to_owned(), name.to_owned(), translate(&field.descriptor));
                    mapper.fields.insert(key, renamed.to_owned());
                }
            }
            for method in &class.methods {
                let name = name_at(&method.names, from_index);
                let renamed = name_at(&method.names, to_index);
                if name != renamed {
                    let key = (from_name.to_owned(), name.to_owned(), translate(&method.descriptor));
                    mapper.methods.insert(key, renamed.to_owned());
                }
            }
        }
        Ok(mapper)
    }
}

#[inline]
fn name_at(names: &[String], index: usize) -> &str {
    names.get(index)
        .filter(|name| !name.is_empty())
        .map(String::as_str)
        .unwrap_or_else(|| names.get(0).map(String::as_str).unwrap_or(""))
}
fn set_name(names: &mut Vec<String>, index: usize, value: &str) {
    while names.len() <= index {
        names.push(String::new());
    }
    names[index] = value.to_owned();
}
fn read_names(parts: &[&str], count: usize) -> Vec<String> {
    let mut names: Vec<String> = parts.iter().take(count).map(|s| (*s).to_owned()).collect();
    while names.len() < count {
        names.push(String::new());
    }
    names
}

type MemberKey = (String, String, String);

/// A flattened namespace-pair view of a mapping tree.
#[derive(Debug, Default, Clone)]
pub struct NameMapper {
    classes: IndexMap<String, String>,
    fields: IndexMap<MemberKey, String>,
    methods: IndexMap<MemberKey, String>,
}
impl NameMapper {
    pub fn map_class(&self, name: &str) -> Option<String> {
        self.classes.get(name).cloned()
    }
    pub fn map_field(&self, owner: &str, name: &str, descriptor: &str) -> Option<&str> {
        self.fields
            .get(&(owner.to_owned(), name.to_owned(), descriptor.to_owned()))
            .map(String::as_str)
    }
    pub fn map_method(&self, owner: &str, name: &str, descriptor: &str) -> Option<&str> {
        self.methods
            .get(&(owner.to_owned(), name.to_owned(), descriptor.to_owned()))
            .map(String::as_str)
    }
    pub fn map_descriptor(&self, descriptor: &str) -> Option<String> {
        descriptor::map_descriptor(descriptor, &|name: &str| self.map_class(name))
    }
    pub fn map_signature(&self, signature: &str) -> Option<String> {
        descriptor::map_signature(signature, &|name: &str| self.map_class(name))
    }
    /// Registers a supplemental class rename (inner-class correction pass).
    pub fn add_class(&mut self, from: &str, to: &str) {
        self.classes.insert(from.to_owned(), to.to_owned());
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.fields.is_empty() && self.methods.is_empty()
    }
}

/// Crowd-sourced member names loaded from MCP-style CSV tables.
#[derive(Debug, Default)]
pub struct McpNames {
    pub fields: IndexMap<String, String>,
    pub methods: IndexMap<String, String>,
}
impl McpNames {
    pub fn load_fields<R: Read>(&mut self, reader: &mut ::csv::Reader<R>) -> Result<(), ::csv::Error> {
        self.fields = load_record_map(reader)?;
        Ok(())
    }
    pub fn load_methods<R: Read>(&mut self, reader: &mut ::csv::Reader<R>) -> Result<(), ::csv::Error> {
        self.methods = load_record_map(reader)?;
        Ok(())
    }
}
fn load_record_map<R: Read>(
    reader: &mut ::csv::Reader<R>,
) -> Result<IndexMap<String, String>, ::csv::Error> {
    reader.deserialize::<NameTableEntry>()
        .map(|result| result.map(|entry| (entry.searge, entry.name)))
        .collect()
}
#[derive(Debug, Deserialize)]
struct NameTableEntry {
    searge: String,
    name: String,
    #[allow(dead_code)]
    side: u32,
    #[allow(dead_code)]
    #[serde(default)]
    desc: String,
}

/// Locations of the optional CSV name tables.
#[derive(Debug, Clone)]
pub struct NameTablePaths {
    pub fields: PathBuf,
    pub methods: PathBuf,
}

/// Shared, lazily-loaded mapping trees keyed by mapping option.
pub struct MappingService {
    mappings_path: PathBuf,
    name_tables: Option<NameTablePaths>,
    trees: RwLock<IndexMap<MappingOption, Arc<MappingTree>>>,
    lock: Mutex<()>,
}
impl MappingService {
    pub fn new(mappings_path: PathBuf, name_tables: Option<NameTablePaths>) -> MappingService {
        MappingService {
            mappings_path,
            name_tables,
            trees: RwLock::new(IndexMap::new()),
            lock: Mutex::new(()),
        }
    }
    #[inline]
    pub fn mappings_path(&self) -> &::std::path::Path {
        &self.mappings_path
    }
    pub fn tree(&self, option: MappingOption) -> Result<Arc<MappingTree>, Error> {
        if let Some(tree) = self.trees.read().get(&option) {
            return Ok(tree.clone())
        }
        self.load_tree_fallback(option)
    }
    #[cold]
    fn load_tree_fallback(&self, option: MappingOption) -> Result<Arc<MappingTree>, Error> {
        // This lock guarantees only one tree is being loaded at a time
        let _guard = self.lock.lock();
        /*
         * Now that we have the lock,
         * let's check again if our option is present.
         * Someone else could've already loaded it while we were blocking
         */
        if let Some(tree) = self.trees.read().get(&option) {
            return Ok(tree.clone())
        }
        let mut tree = MappingTree::parse(File::open(&self.mappings_path)?)?;
        if let Some(required) = option.required_namespace() {
            if tree.namespace(required).is_none() {
                return Err(UnknownNamespace(required.into()).into())
            }
        }
        if let (Some(tables), Some(intermediate)) = (&self.name_tables, option.required_namespace()) {
            let mut names = McpNames::default();
            names.load_fields(&mut ::csv::Reader::from_path(&tables.fields)?)?;
            names.load_methods(&mut ::csv::Reader::from_path(&tables.methods)?)?;
            tree.apply_csv_names(intermediate, NAMED_NAMESPACE, &names)?;
        }
        let tree = Arc::new(tree);
        self.trees.write().insert(option, tree.clone());
        Ok(tree)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "tiny\t2\t0\tofficial\tsrg\tnamed\n\
        c\ta\tnet/minecraft/FooSrg\tnet/minecraft/Foo\n\
        \tf\tI\tb\tfield_123_a\tcounter\n\
        \tm\t(La;)V\tc\tfunc_456_b\tupdate\n\
        \t\tp\t1\t\tp_456_1_\tother\n\
        c\td\tnet/minecraft/BarSrg\tnet/minecraft/Bar\n";

    fn sample_tree() -> MappingTree {
        MappingTree::parse(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn parses_namespaces_and_classes() {
        let tree = sample_tree();
        assert_eq!(tree.namespaces(), &["official", "srg", "named"]);
        assert_eq!(tree.class_count(), 2);
        assert_eq!(tree.namespace("srg"), Some(1));
        assert_eq!(tree.namespace("intermediary"), None);
    }

    #[test]
    fn maps_official_to_srg() {
        let tree = sample_tree();
        let mapper = tree.name_mapper("official", "srg").unwrap();
        assert_eq!(mapper.map_class("a").as_deref(), Some("net/minecraft/FooSrg"));
        assert_eq!(mapper.map_field("a", "b", "I"), Some("field_123_a"));
        // method descriptor is keyed in the source namespace (official)
        assert_eq!(mapper.map_method("a", "c", "(La;)V"), Some("func_456_b"));
        assert_eq!(mapper.map_class("unknown"), None);
    }

    #[test]
    fn maps_srg_to_named_with_translated_descriptors() {
        let tree = sample_tree();
        let mapper = tree.name_mapper("srg", "named").unwrap();
        assert_eq!(
            mapper.map_class("net/minecraft/FooSrg").as_deref(),
            Some("net/minecraft/Foo")
        );
        // the method key's descriptor must be in the srg namespace
        assert_eq!(
            mapper.map_method("net/minecraft/FooSrg", "func_456_b", "(Lnet/minecraft/FooSrg;)V"),
            Some("update")
        );
        assert_eq!(
            mapper.map_descriptor("(Lnet/minecraft/FooSrg;)Lnet/minecraft/BarSrg;").as_deref(),
            Some("(Lnet/minecraft/Foo;)Lnet/minecraft/Bar;")
        );
    }

    #[test]
    fn csv_names_layer_over_intermediate() {
        let mut tree = sample_tree();
        let mut names = McpNames::default();
        names.fields.insert("field_123_a".into(), "tickCounter".into());
        names.methods.insert("func_456_b".into(), "tick".into());
        tree.apply_csv_names("srg", "named", &names).unwrap();
        let mapper = tree.name_mapper("srg", "named").unwrap();
        assert_eq!(
            mapper.map_field("net/minecraft/FooSrg", "field_123_a", "I"),
            Some("tickCounter")
        );
        assert_eq!(
            mapper.map_method("net/minecraft/FooSrg", "func_456_b", "(Lnet/minecraft/FooSrg;)V"),
            Some("tick")
        );
    }

    #[test]
    fn mcp_csv_tables_parse() {
        let data = "searge,name,side,desc\nfield_123_a,tickCounter,2,The counter\n";
        let mut names = McpNames::default();
        names.load_fields(&mut ::csv::Reader::from_reader(data.as_bytes())).unwrap();
        assert_eq!(names.fields.get("field_123_a").map(String::as_str), Some("tickCounter"));
    }

    #[test]
    fn service_caches_trees_per_option() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mappings.tiny");
        ::std::fs::write(&path, SAMPLE).unwrap();
        let service = MappingService::new(path, None);
        let first = service.tree(MappingOption::WithSrg).unwrap();
        let second = service.tree(MappingOption::WithSrg).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(service.tree(MappingOption::WithMojang).is_err());
    }
}
