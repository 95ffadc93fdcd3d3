//! Per-class post-processing passes over a finished jar.
//!
//! Every pass implements `ClassTransformer` and is fanned out over the jar's
//! class entries on a bounded worker pool; the calling stage blocks until
//! all workers join. A class is rewritten only when the resulting bytes
//! differ, so untouched entries keep their exact bytes and downstream
//! timestamp checks stay quiet. The first failing entry aborts the whole
//! batch.

use std::path::Path;
use std::sync::Mutex;

use crossbeam::channel;
use failure::Error;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::classfile::{self, ClassFile};
use crate::jar;
use crate::utils::WorkerPanicked;

/// A single class-file rewriting pass. Returns the new bytes, or `None`
/// when the class is untouched. Implementations run concurrently.
pub trait ClassTransformer: Sync {
    fn transform(&self, name: &str, data: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// Runs one transformer over every class entry of `jar_path`, rewriting the
/// jar only if at least one class actually changed. Returns whether it did.
pub fn transform_classes(jar_path: &Path, transformer: &dyn ClassTransformer) -> Result<bool, Error> {
    let mut entries = jar::read_jar(jar_path)?;
    let class_entries: Vec<(String, Vec<u8>)> = entries.iter()
        .filter(|(name, _)| jar::is_class_file(name))
        .map(|(name, data)| (name.clone(), data.clone()))
        .collect();
    if class_entries.is_empty() {
        return Ok(false)
    }
    let results = run_tasks(&class_entries, transformer)?;

    let mut changed = false;
    for ((name, original), result) in class_entries.iter().zip(results) {
        if let Some(new_data) = result {
            if new_data != *original {
                entries.insert(name.clone(), new_data);
                changed = true;
            }
        }
    }
    if changed {
        jar::replace_jar(jar_path, &entries)?;
    }
    Ok(changed)
}

/// Fan-out/join: one task per class file on a bounded worker pool shared for
/// the duration of the call. The first error wins and aborts the batch.
fn run_tasks(
    items: &[(String, Vec<u8>)],
    transformer: &dyn ClassTransformer,
) -> Result<Vec<Option<Vec<u8>>>, Error> {
    let workers = ::std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .min(items.len());
    let (task_sender, task_receiver) = channel::unbounded::<usize>();
    for index in 0..items.len() {
        // The channel is unbounded and alive; this send cannot fail.
        let _ = task_sender.send(index);
    }
    drop(task_sender);

    let results: Mutex<Vec<Option<Option<Vec<u8>>>>> = Mutex::new(vec![None; items.len()]);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    let scope_result = crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let task_receiver = task_receiver.clone();
            let results = &results;
            let first_error = &first_error;
            scope.spawn(move |_| {
                while let Ok(index) = task_receiver.recv() {
                    if first_error.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                        return
                    }
                    let (name, data) = &items[index];
                    match transformer.transform(name, data) {
                        Ok(result) => {
                            results.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(result);
                        }
                        Err(error) => {
                            let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                            if slot.is_none() {
                                *slot = Some(error);
                            }
                            return
                        }
                    }
                }
            });
        }
    });
    if scope_result.is_err() {
        return Err(WorkerPanicked.into())
    }
    if let Some(error) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
        return Err(error)
    }
    Ok(results.into_inner().unwrap_or_else(|e| e.into_inner())
        .into_iter()
        .map(|slot| slot.unwrap_or(None))
        .collect())
}

/// Synthetic parameter names produced by the original toolchain's renamer.
static PLACEHOLDER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^p_[0-9a-zA-Z]+_(?:[0-9a-zA-Z]+_)?$").unwrap());

/// Strips placeholder parameter/local-variable names so they never leak into
/// IDE-facing sources. Real names are preserved unchanged.
pub struct ParameterNameStripper;
impl ClassTransformer for ParameterNameStripper {
    fn transform(&self, name: &str, data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let mut class = ClassFile::parse(data)?;
        let mut changed = false;
        for method_index in 0..class.methods.len() {
            changed |= strip_method_parameters(&mut class, method_index)?;
            changed |= strip_local_variables(&mut class, method_index)?;
        }
        if changed {
            debug!("stripped placeholder names from {}", name);
            Ok(Some(class.write()))
        } else {
            Ok(None)
        }
    }
}

fn strip_method_parameters(class: &mut ClassFile, method_index: usize) -> Result<bool, Error> {
    let method = &class.methods[method_index];
    let data = match classfile::find_attribute(&class.pool, &method.attributes, "MethodParameters") {
        Some(attribute) => attribute.info.clone(),
        None => return Ok(false),
    };
    let mut parameters = classfile::parse_method_parameters(&data)?;
    let mut changed = false;
    for parameter in &mut parameters {
        if parameter.name_index == 0 {
            continue
        }
        let name = class.pool.utf8(parameter.name_index)?;
        if PLACEHOLDER_NAME.is_match(name) {
            parameter.name_index = 0;
            changed = true;
        }
    }
    if changed {
        let new_data = classfile::write_method_parameters(&parameters);
        let method = &mut class.methods[method_index];
        if let Some(attribute) =
            classfile::find_attribute_mut(&class.pool, &mut method.attributes, "MethodParameters")
        {
            attribute.info = new_data;
        }
    }
    Ok(changed)
}

fn strip_local_variables(class: &mut ClassFile, method_index: usize) -> Result<bool, Error> {
    let method = &class.methods[method_index];
    let code_data = match classfile::find_attribute(&class.pool, &method.attributes, "Code") {
        Some(attribute) => attribute.info.clone(),
        None => return Ok(false),
    };
    let mut code = classfile::CodeAttribute::parse(&code_data)?;
    let mut changed = false;
    for attribute_index in 0..code.attributes.len() {
        let attribute_name = class.pool.utf8(code.attributes[attribute_index].name_index)?;
        if attribute_name != "LocalVariableTable" && attribute_name != "LocalVariableTypeTable" {
            continue
        }
        let variables = classfile::parse_local_variables(&code.attributes[attribute_index].info)?;
        let mut kept = Vec::with_capacity(variables.len());
        for variable in variables {
            let name = class.pool.utf8(variable.name_index)?;
            if PLACEHOLDER_NAME.is_match(name) {
                changed = true;
            } else {
                kept.push(variable);
            }
        }
        code.attributes[attribute_index].info = classfile::write_local_variables(&kept);
    }
    if changed {
        let new_data = code.to_bytes();
        let method = &mut class.methods[method_index];
        if let Some(attribute) =
            classfile::find_attribute_mut(&class.pool, &mut method.attributes, "Code")
        {
            attribute.info = new_data;
        }
    }
    Ok(changed)
}

/// Runs the annotation fixer over a jar. The fixer itself is an injected
/// external transformer; this is only the fan-out plumbing plus logging.
pub fn fix_parameter_annotations(
    jar_path: &Path,
    fixer: &dyn ClassTransformer,
) -> Result<bool, Error> {
    info!(":fixing parameter annotations for {}", jar_path.display());
    transform_classes(jar_path, fixer)
}

/// Strips placeholder parameter names from every class of a jar.
pub fn delete_parameter_names(jar_path: &Path) -> Result<bool, Error> {
    info!(":deleting parameter names for {}", jar_path.display());
    transform_classes(jar_path, &ParameterNameStripper)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{
        flags, minimal_class, AttributeInfo, CodeAttribute, LocalVariable, MemberInfo,
        MethodParameter,
    };
    use indexmap::IndexMap;
    use tempfile::TempDir;

    #[test]
    fn placeholder_pattern() {
        assert!(PLACEHOLDER_NAME.is_match("p_123_"));
        assert!(PLACEHOLDER_NAME.is_match("p_77472_1_"));
        assert!(PLACEHOLDER_NAME.is_match("p_i45revised_2_"));
        assert!(!PLACEHOLDER_NAME.is_match("position"));
        assert!(!PLACEHOLDER_NAME.is_match("p_"));
        assert!(!PLACEHOLDER_NAME.is_match("prefix_p_123_"));
    }

    fn class_with_named_locals() -> ClassFile {
        let mut class = minimal_class("com/example/Foo", "java/lang/Object");
        let method_name = class.pool.push_utf8("update");
        let method_descriptor = class.pool.push_utf8("(IJ)V");
        let placeholder = class.pool.push_utf8("p_77472_1_");
        let real_name = class.pool.push_utf8("delta");
        let int_descriptor = class.pool.push_utf8("I");

        let parameters_name = class.pool.push_utf8("MethodParameters");
        let parameters = classfile::write_method_parameters(&[
            MethodParameter { name_index: placeholder, access_flags: 0 },
            MethodParameter { name_index: real_name, access_flags: 0 },
        ]);

        let table_name = class.pool.push_utf8("LocalVariableTable");
        let table = classfile::write_local_variables(&[
            LocalVariable {
                start_pc: 0, length: 1, name_index: placeholder,
                descriptor_index: int_descriptor, index: 1,
            },
            LocalVariable {
                start_pc: 0, length: 1, name_index: real_name,
                descriptor_index: int_descriptor, index: 2,
            },
        ]);
        let code_name = class.pool.push_utf8("Code");
        let code = CodeAttribute {
            max_stack: 0,
            max_locals: 4,
            code: vec![0xb1],
            exception_table: Vec::new(),
            attributes: vec![AttributeInfo { name_index: table_name, info: table }],
        };
        class.methods.push(MemberInfo {
            access_flags: flags::ACC_PUBLIC,
            name_index: method_name,
            descriptor_index: method_descriptor,
            attributes: vec![
                AttributeInfo { name_index: code_name, info: code.to_bytes() },
                AttributeInfo { name_index: parameters_name, info: parameters },
            ],
        });
        class
    }

    #[test]
    fn strips_placeholder_names_only() {
        let class = class_with_named_locals();
        let stripped = ParameterNameStripper
            .transform("com/example/Foo", &class.write())
            .unwrap()
            .expect("placeholders should modify the class");
        let parsed = ClassFile::parse(&stripped).unwrap();
        let method = &parsed.methods[0];

        let parameters_attribute =
            classfile::find_attribute(&parsed.pool, &method.attributes, "MethodParameters").unwrap();
        let parameters = classfile::parse_method_parameters(&parameters_attribute.info).unwrap();
        assert_eq!(parameters[0].name_index, 0);
        assert_eq!(parsed.pool.utf8(parameters[1].name_index).unwrap(), "delta");

        let code_attribute =
            classfile::find_attribute(&parsed.pool, &method.attributes, "Code").unwrap();
        let code = CodeAttribute::parse(&code_attribute.info).unwrap();
        let table_attribute =
            classfile::find_attribute(&parsed.pool, &code.attributes, "LocalVariableTable").unwrap();
        let variables = classfile::parse_local_variables(&table_attribute.info).unwrap();
        assert_eq!(variables.len(), 1);
        assert_eq!(parsed.pool.utf8(variables[0].name_index).unwrap(), "delta");
    }

    #[test]
    fn untouched_classes_are_skipped() {
        let mut class = minimal_class("com/example/Plain", "java/lang/Object");
        let method_name = class.pool.push_utf8("run");
        let method_descriptor = class.pool.push_utf8("()V");
        class.methods.push(MemberInfo {
            access_flags: flags::ACC_PUBLIC,
            name_index: method_name,
            descriptor_index: method_descriptor,
            attributes: Vec::new(),
        });
        assert!(ParameterNameStripper
            .transform("com/example/Plain", &class.write())
            .unwrap()
            .is_none());
    }

    #[test]
    fn jar_rewrite_only_when_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.jar");
        let mut entries = IndexMap::new();
        entries.insert("com/example/Foo.class".to_owned(), class_with_named_locals().write());
        entries.insert("resource.txt".to_owned(), b"text".to_vec());
        jar::write_jar(&path, &entries).unwrap();

        assert!(delete_parameter_names(&path).unwrap());
        // second run finds nothing left to strip
        assert!(!delete_parameter_names(&path).unwrap());
        let after = jar::read_jar(&path).unwrap();
        assert_eq!(after["resource.txt"], b"text".to_vec());
    }

    struct FailOn(&'static str);
    impl ClassTransformer for FailOn {
        fn transform(&self, name: &str, _data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
            if name.contains(self.0) {
                Err(failure::err_msg("boom"))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn first_error_aborts_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.jar");
        let mut entries = IndexMap::new();
        for index in 0..16 {
            entries.insert(
                format!("com/example/C{}.class", index),
                minimal_class(&format!("com/example/C{}", index), "java/lang/Object").write(),
            );
        }
        jar::write_jar(&path, &entries).unwrap();
        let error = transform_classes(&path, &FailOn("C7")).unwrap_err();
        assert!(error.to_string().contains("boom"));
    }
}
