//! Rewrites the loader's core-mod manager classes so side-loaded plugins on
//! the runtime classpath are discovered.
//!
//! The target classes exist only as patched bytecode, so this is raw
//! instruction synthesis: a private static classpath-scanning method is
//! assembled from an explicit instruction table and a call to it is spliced
//! in at the head of the regular discovery method. The prologue is exactly
//! four bytes, which keeps `tableswitch`/`lookupswitch` padding valid; all
//! absolute offsets (exception tables, debug tables, the first stack-map
//! frame) are shifted to match.

use failure::Error;
use failure_derive::Fail;
use log::info;

use crate::classfile::{
    self, AttributeInfo, ClassFile, CodeAttribute, ConstantPool, MemberInfo, flags,
    STACK_FRAMES_REQUIRED_MAJOR,
};
use crate::postprocess::ClassTransformer;

const FORGE_PACKAGE: &str = "net/minecraftforge/";
const FORGE_CLASS: &str = "net/minecraftforge/fml/relauncher/CoreModManager";
const CPW_PACKAGE: &str = "cpw/mods/";
const CPW_CLASS: &str = "cpw/mods/fml/relauncher/CoreModManager";

const TARGET_METHOD: &str = "discoverCoreMods";
const INJECTED_METHOD: &str = "loom$injectCoremodsFromClasspath";
const INJECTED_DESCRIPTOR: &str = "(Lnet/minecraft/launchwrapper/LaunchClassLoader;)V";

const CLASS_LOADER: &str = "net/minecraft/launchwrapper/LaunchClassLoader";

// Opcodes used by the synthesized method.
const OP_ACONST_NULL: u8 = 0x01;
const OP_ICONST_0: u8 = 0x03;
const OP_LDC: u8 = 0x12;
const OP_LDC_W: u8 = 0x13;
const OP_ILOAD_2: u8 = 0x1c;
const OP_ALOAD: u8 = 0x19;
const OP_ALOAD_0: u8 = 0x2a;
const OP_ALOAD_1: u8 = 0x2b;
const OP_ALOAD_3: u8 = 0x2d;
const OP_AALOAD: u8 = 0x32;
const OP_ASTORE: u8 = 0x3a;
const OP_ASTORE_1: u8 = 0x4c;
const OP_ASTORE_3: u8 = 0x4e;
const OP_ISTORE_2: u8 = 0x3d;
const OP_POP: u8 = 0x57;
const OP_DUP: u8 = 0x59;
const OP_IINC: u8 = 0x84;
const OP_IFEQ: u8 = 0x99;
const OP_IF_ICMPGE: u8 = 0xa2;
const OP_GOTO: u8 = 0xa7;
const OP_RETURN: u8 = 0xb1;
const OP_INVOKEVIRTUAL: u8 = 0xb6;
const OP_INVOKESPECIAL: u8 = 0xb7;
const OP_INVOKESTATIC: u8 = 0xb8;
const OP_NEW: u8 = 0xbb;
const OP_ARRAYLENGTH: u8 = 0xbe;
const OP_IFNULL: u8 = 0xc6;

#[derive(Debug, Fail)]
pub enum CoreModError {
    #[fail(display = "Branch target out of range in synthesized method")]
    BranchOutOfRange,
    #[fail(display = "Malformed StackMapTable attribute")]
    MalformedStackMap,
}

type Label = usize;

/// One row of the synthesis table.
enum Insn {
    Op(u8),
    Var(u8, u8),
    Ldc(String),
    Type(u8, String),
    Method { op: u8, owner: String, name: String, descriptor: String },
    Jump(u8, Label),
    Mark(Label),
    Iinc(u8, i8),
}

/// Rewrites the known core-mod manager classes; everything else passes
/// through untouched. Idempotent: a class that already carries the injected
/// method is left alone.
pub struct CoreModClassRemapper;
impl ClassTransformer for CoreModClassRemapper {
    fn transform(&self, name: &str, data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let class_name = name.trim_end_matches(".class");
        let package = match class_name {
            FORGE_CLASS => FORGE_PACKAGE,
            CPW_CLASS => CPW_PACKAGE,
            _ => return Ok(None),
        };
        let mut class = ClassFile::parse(data)?;
        for method in &class.methods {
            if class.pool.utf8(method.name_index)? == INJECTED_METHOD {
                return Ok(None)
            }
        }
        info!(":injecting classpath core-mod discovery into {}", class_name);
        inject_call_at_head(&mut class, class_name)?;
        append_discovery_method(&mut class, package, class_name)?;
        Ok(Some(class.write()))
    }
}

/// Splices `aload_1; invokestatic <injected>` in front of the discovery
/// method's existing code. `aload_1` picks up the class-loader parameter of
/// the (static) target method.
fn inject_call_at_head(class: &mut ClassFile, owner: &str) -> Result<(), Error> {
    let mut target_index = None;
    for (index, method) in class.methods.iter().enumerate() {
        if class.pool.utf8(method.name_index)? == TARGET_METHOD {
            target_index = Some(index);
            break
        }
    }
    // Nothing to do when the discovery method isn't in this variant.
    let target_index = match target_index {
        Some(index) => index,
        None => return Ok(()),
    };
    let call_ref = class.pool.push_method_ref(owner, INJECTED_METHOD, INJECTED_DESCRIPTOR, false);
    let code_data = match classfile::find_attribute(&class.pool, &class.methods[target_index].attributes, "Code") {
        Some(attribute) => attribute.info.clone(),
        None => return Ok(()),
    };
    let mut code = CodeAttribute::parse(&code_data)?;

    let mut prologue = Vec::with_capacity(4);
    prologue.push(OP_ALOAD_1);
    prologue.push(OP_INVOKESTATIC);
    prologue.extend_from_slice(&call_ref.to_be_bytes());
    let shift = prologue.len() as u16;
    debug_assert_eq!(shift % 4, 0, "prologue must preserve switch padding");
    prologue.extend_from_slice(&code.code);
    code.code = prologue;
    if code.max_stack < 1 {
        code.max_stack = 1;
    }
    for handler in &mut code.exception_table {
        handler.start_pc += shift;
        handler.end_pc += shift;
        handler.handler_pc += shift;
    }
    for attribute_index in 0..code.attributes.len() {
        let attribute_name = class.pool.utf8(code.attributes[attribute_index].name_index)?.to_owned();
        let info = &mut code.attributes[attribute_index].info;
        match attribute_name.as_str() {
            "LineNumberTable" => shift_line_numbers(info, shift)?,
            "LocalVariableTable" | "LocalVariableTypeTable" => shift_local_variables(info, shift)?,
            "StackMapTable" => bump_stack_map_offset(info, shift)?,
            _ => {}
        }
    }
    let new_data = code.to_bytes();
    if let Some(attribute) = classfile::find_attribute_mut(
        &class.pool,
        &mut class.methods[target_index].attributes,
        "Code",
    ) {
        attribute.info = new_data;
    }
    Ok(())
}

fn shift_line_numbers(data: &mut [u8], shift: u16) -> Result<(), Error> {
    if data.len() < 2 {
        return Err(CoreModError::MalformedStackMap.into())
    }
    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    for index in 0..count {
        let offset = 2 + index * 4;
        if offset + 2 > data.len() {
            return Err(CoreModError::MalformedStackMap.into())
        }
        let start_pc = u16::from_be_bytes([data[offset], data[offset + 1]]) + shift;
        data[offset..offset + 2].copy_from_slice(&start_pc.to_be_bytes());
    }
    Ok(())
}

/// Locals live from offset zero (parameters) keep their start and stretch;
/// later ranges slide forward.
fn shift_local_variables(data: &mut [u8], shift: u16) -> Result<(), Error> {
    let variables = classfile::parse_local_variables(data)?;
    let mut shifted = Vec::with_capacity(variables.len());
    for mut variable in variables {
        if variable.start_pc == 0 {
            variable.length += shift;
        } else {
            variable.start_pc += shift;
        }
        shifted.push(variable);
    }
    let new_data = classfile::write_local_variables(&shifted);
    data.copy_from_slice(&new_data);
    Ok(())
}

/// The first stack-map frame's offset delta is measured from the method
/// start, so the inserted prologue moves it; later frames are relative to
/// their predecessor and stay valid.
fn bump_stack_map_offset(data: &mut Vec<u8>, shift: u16) -> Result<(), Error> {
    if data.len() < 2 {
        return Err(CoreModError::MalformedStackMap.into())
    }
    let count = u16::from_be_bytes([data[0], data[1]]);
    if count == 0 {
        return Ok(())
    }
    let frame_type = *data.get(2).ok_or(CoreModError::MalformedStackMap)?;
    match frame_type {
        // same_frame: the tag is the delta
        0..=63 => {
            let new_delta = frame_type as u16 + shift;
            if new_delta <= 63 {
                data[2] = new_delta as u8;
            } else {
                // converts to same_frame_extended
                data[2] = 251;
                let delta_bytes = new_delta.to_be_bytes();
                data.insert(3, delta_bytes[0]);
                data.insert(4, delta_bytes[1]);
            }
        }
        // same_locals_1_stack_item: delta is tag - 64
        64..=127 => {
            let new_delta = (frame_type - 64) as u16 + shift;
            if new_delta <= 63 {
                data[2] = new_delta as u8 + 64;
            } else {
                // converts to same_locals_1_stack_item_frame_extended
                data[2] = 247;
                let delta_bytes = new_delta.to_be_bytes();
                data.insert(3, delta_bytes[0]);
                data.insert(4, delta_bytes[1]);
            }
        }
        // extended frames carry an explicit u2 delta
        247..=255 => {
            if data.len() < 5 {
                return Err(CoreModError::MalformedStackMap.into())
            }
            let delta = u16::from_be_bytes([data[3], data[4]]) + shift;
            data[3..5].copy_from_slice(&delta.to_be_bytes());
        }
        _ => return Err(CoreModError::MalformedStackMap.into()),
    }
    Ok(())
}

/// Appends the synthesized discovery method: walk the class loader's URLs,
/// open each jar's manifest, and hand any declared core plugin to the
/// manager's own loader.
fn append_discovery_method(class: &mut ClassFile, package: &str, owner: &str) -> Result<(), Error> {
    const LOOP: Label = 0;
    const CONTINUE: Label = 1;
    const END: Label = 2;
    let manager = format!("{}fml/relauncher/CoreModManager", package);
    let plugin_wrapper = format!("L{}$FMLPluginWrapper;", manager);
    debug_assert_eq!(manager, owner);

    let table = vec![
        // URL[] urls = classLoader.getURLs(); int i = 0;
        Insn::Op(OP_ALOAD_0),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: CLASS_LOADER.into(),
            name: "getURLs".into(),
            descriptor: "()[Ljava/net/URL;".into(),
        },
        Insn::Op(OP_ASTORE_1),
        Insn::Op(OP_ICONST_0),
        Insn::Op(OP_ISTORE_2),
        // Pre-assign the object locals so every frame below sees them.
        Insn::Op(OP_ACONST_NULL),
        Insn::Op(OP_ASTORE_3),
        Insn::Op(OP_ACONST_NULL),
        Insn::Var(OP_ASTORE, 4),
        Insn::Op(OP_ACONST_NULL),
        Insn::Var(OP_ASTORE, 5),
        Insn::Op(OP_ACONST_NULL),
        Insn::Var(OP_ASTORE, 6),
        Insn::Op(OP_ACONST_NULL),
        Insn::Var(OP_ASTORE, 7),
        Insn::Mark(LOOP),
        Insn::Op(OP_ILOAD_2),
        Insn::Op(OP_ALOAD_1),
        Insn::Op(OP_ARRAYLENGTH),
        Insn::Jump(OP_IF_ICMPGE, END),
        // URL url = urls[i];
        Insn::Op(OP_ALOAD_1),
        Insn::Op(OP_ILOAD_2),
        Insn::Op(OP_AALOAD),
        Insn::Op(OP_ASTORE_3),
        // if (!url.getProtocol().startsWith("file")) continue;
        Insn::Op(OP_ALOAD_3),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/net/URL".into(),
            name: "getProtocol".into(),
            descriptor: "()Ljava/lang/String;".into(),
        },
        Insn::Ldc("file".into()),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/lang/String".into(),
            name: "startsWith".into(),
            descriptor: "(Ljava/lang/String;)Z".into(),
        },
        Insn::Jump(OP_IFEQ, CONTINUE),
        // File file = new File(url.toURI().getPath());
        Insn::Type(OP_NEW, "java/io/File".into()),
        Insn::Op(OP_DUP),
        Insn::Op(OP_ALOAD_3),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/net/URL".into(),
            name: "toURI".into(),
            descriptor: "()Ljava/net/URI;".into(),
        },
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/net/URI".into(),
            name: "getPath".into(),
            descriptor: "()Ljava/lang/String;".into(),
        },
        Insn::Method {
            op: OP_INVOKESPECIAL,
            owner: "java/io/File".into(),
            name: "<init>".into(),
            descriptor: "(Ljava/lang/String;)V".into(),
        },
        Insn::Var(OP_ASTORE, 4),
        // if (!file.isFile()) continue;
        Insn::Var(OP_ALOAD, 4),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/io/File".into(),
            name: "isFile".into(),
            descriptor: "()Z".into(),
        },
        Insn::Jump(OP_IFEQ, CONTINUE),
        // JarFile jar = new JarFile(file);
        Insn::Type(OP_NEW, "java/util/jar/JarFile".into()),
        Insn::Op(OP_DUP),
        Insn::Var(OP_ALOAD, 4),
        Insn::Method {
            op: OP_INVOKESPECIAL,
            owner: "java/util/jar/JarFile".into(),
            name: "<init>".into(),
            descriptor: "(Ljava/io/File;)V".into(),
        },
        Insn::Var(OP_ASTORE, 5),
        // Manifest manifest = jar.getManifest(); jar.close();
        Insn::Var(OP_ALOAD, 5),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/util/jar/JarFile".into(),
            name: "getManifest".into(),
            descriptor: "()Ljava/util/jar/Manifest;".into(),
        },
        Insn::Var(OP_ASTORE, 6),
        Insn::Var(OP_ALOAD, 5),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/util/jar/JarFile".into(),
            name: "close".into(),
            descriptor: "()V".into(),
        },
        Insn::Var(OP_ALOAD, 6),
        Insn::Jump(OP_IFNULL, CONTINUE),
        // String coreMod = manifest.getMainAttributes().getValue("FMLCorePlugin");
        Insn::Var(OP_ALOAD, 6),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/util/jar/Manifest".into(),
            name: "getMainAttributes".into(),
            descriptor: "()Ljava/util/jar/Attributes;".into(),
        },
        Insn::Ldc("FMLCorePlugin".into()),
        Insn::Method {
            op: OP_INVOKEVIRTUAL,
            owner: "java/util/jar/Attributes".into(),
            name: "getValue".into(),
            descriptor: "(Ljava/lang/String;)Ljava/lang/String;".into(),
        },
        Insn::Var(OP_ASTORE, 7),
        Insn::Var(OP_ALOAD, 7),
        Insn::Jump(OP_IFNULL, CONTINUE),
        // CoreModManager.loadCoreMod(classLoader, coreMod, file);
        Insn::Op(OP_ALOAD_0),
        Insn::Var(OP_ALOAD, 7),
        Insn::Var(OP_ALOAD, 4),
        Insn::Method {
            op: OP_INVOKESTATIC,
            owner: manager.clone(),
            name: "loadCoreMod".into(),
            descriptor: format!(
                "(L{};Ljava/lang/String;Ljava/io/File;){}",
                CLASS_LOADER, plugin_wrapper
            ),
        },
        Insn::Op(OP_POP),
        Insn::Mark(CONTINUE),
        Insn::Iinc(2, 1),
        Insn::Jump(OP_GOTO, LOOP),
        Insn::Mark(END),
        Insn::Op(OP_RETURN),
    ];

    let (code_bytes, labels) = assemble(&mut class.pool, &table)?;
    let mut attributes = Vec::new();
    if class.major_version >= STACK_FRAMES_REQUIRED_MAJOR {
        let mut targets: Vec<u16> = labels.iter().map(|&(_, pc)| pc).collect();
        targets.sort_unstable();
        let frame_locals = [
            VerificationType::Object(CLASS_LOADER.to_owned()),
            VerificationType::Object("[Ljava/net/URL;".to_owned()),
            VerificationType::Integer,
            VerificationType::Object("java/net/URL".to_owned()),
            VerificationType::Object("java/io/File".to_owned()),
            VerificationType::Object("java/util/jar/JarFile".to_owned()),
            VerificationType::Object("java/util/jar/Manifest".to_owned()),
            VerificationType::Object("java/lang/String".to_owned()),
        ];
        let stack_map = build_stack_map(&mut class.pool, &targets, &frame_locals);
        let name_index = class.pool.push_utf8("StackMapTable");
        attributes.push(AttributeInfo { name_index, info: stack_map });
    }
    let code = CodeAttribute {
        max_stack: 4,
        max_locals: 8,
        code: code_bytes,
        exception_table: Vec::new(),
        attributes,
    };
    let name_index = class.pool.push_utf8(INJECTED_METHOD);
    let descriptor_index = class.pool.push_utf8(INJECTED_DESCRIPTOR);
    let code_name = class.pool.push_utf8("Code");
    class.methods.push(MemberInfo {
        access_flags: flags::ACC_PRIVATE | flags::ACC_STATIC,
        name_index,
        descriptor_index,
        attributes: vec![AttributeInfo { name_index: code_name, info: code.to_bytes() }],
    });
    Ok(())
}

enum VerificationType {
    Integer,
    Object(String),
}

/// Emits a StackMapTable with one full frame per branch target. All locals
/// are pre-assigned before the first target, so a single locals layout
/// (with empty stack) is valid at every one of them.
fn build_stack_map(
    pool: &mut ConstantPool,
    sorted_targets: &[u16],
    locals: &[VerificationType],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(sorted_targets.len() as u16).to_be_bytes());
    let mut previous: Option<u16> = None;
    for &target in sorted_targets {
        let delta = match previous {
            None => target,
            Some(previous) => target - previous - 1,
        };
        previous = Some(target);
        out.push(255); // full_frame
        out.extend_from_slice(&delta.to_be_bytes());
        out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
        for local in locals {
            match local {
                VerificationType::Integer => out.push(1),
                VerificationType::Object(name) => {
                    out.push(7);
                    let class_index = pool.push_class(name);
                    out.extend_from_slice(&class_index.to_be_bytes());
                }
            }
        }
        out.extend_from_slice(&0u16.to_be_bytes()); // empty stack
    }
    out
}

/// Two-pass assembler for the instruction table: constants are interned
/// first (fixing instruction widths), then offsets are resolved and branch
/// distances emitted.
fn assemble(pool: &mut ConstantPool, table: &[Insn]) -> Result<(Vec<u8>, Vec<(Label, u16)>), Error> {
    // Pass 1: intern constants and record encoded widths.
    let mut operands: Vec<u16> = Vec::with_capacity(table.len());
    let mut widths: Vec<u16> = Vec::with_capacity(table.len());
    for insn in table {
        let (operand, width) = match insn {
            Insn::Op(_) => (0, 1),
            Insn::Var(_, _) => (0, 2),
            Insn::Ldc(value) => {
                let index = pool.push_string(value);
                (index, if index <= 0xff { 2 } else { 3 })
            }
            Insn::Type(_, name) => (pool.push_class(name), 3),
            Insn::Method { owner, name, descriptor, .. } => {
                (pool.push_method_ref(owner, name, descriptor, false), 3)
            }
            Insn::Jump(_, _) => (0, 3),
            Insn::Mark(_) => (0, 0),
            Insn::Iinc(_, _) => (0, 3),
        };
        operands.push(operand);
        widths.push(width);
    }
    // Pass 2: lay out offsets and bind labels.
    let mut offsets: Vec<u16> = Vec::with_capacity(table.len());
    let mut labels: Vec<(Label, u16)> = Vec::new();
    let mut pc: u16 = 0;
    for (index, insn) in table.iter().enumerate() {
        offsets.push(pc);
        if let Insn::Mark(label) = insn {
            labels.push((*label, pc));
        }
        pc += widths[index];
    }
    let label_pc = |label: Label| -> Result<u16, Error> {
        labels.iter()
            .find(|&&(l, _)| l == label)
            .map(|&(_, pc)| pc)
            .ok_or_else(|| CoreModError::BranchOutOfRange.into())
    };
    // Pass 3: emit.
    let mut code = Vec::with_capacity(pc as usize);
    for (index, insn) in table.iter().enumerate() {
        match insn {
            Insn::Op(op) => code.push(*op),
            Insn::Var(op, local) => {
                code.push(*op);
                code.push(*local);
            }
            Insn::Ldc(_) => {
                let operand = operands[index];
                if operand <= 0xff {
                    code.push(OP_LDC);
                    code.push(operand as u8);
                } else {
                    code.push(OP_LDC_W);
                    code.extend_from_slice(&operand.to_be_bytes());
                }
            }
            Insn::Type(op, _) | Insn::Method { op, .. } => {
                code.push(*op);
                code.extend_from_slice(&operands[index].to_be_bytes());
            }
            Insn::Jump(op, label) => {
                let target = label_pc(*label)?;
                let distance = target as i32 - offsets[index] as i32;
                if distance > i16::MAX as i32 || distance < i16::MIN as i32 {
                    return Err(CoreModError::BranchOutOfRange.into())
                }
                code.push(*op);
                code.extend_from_slice(&(distance as i16).to_be_bytes());
            }
            Insn::Mark(_) => {}
            Insn::Iinc(local, amount) => {
                code.push(OP_IINC);
                code.push(*local);
                code.push(*amount as u8);
            }
        }
    }
    Ok((code, labels))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::minimal_class;

    fn core_mod_manager(major_version: u16) -> ClassFile {
        let mut class = minimal_class(FORGE_CLASS, "java/lang/Object");
        class.major_version = major_version;
        let name_index = class.pool.push_utf8(TARGET_METHOD);
        let descriptor_index = class.pool
            .push_utf8("(Ljava/lang/String;Lnet/minecraft/launchwrapper/LaunchClassLoader;)V");
        let code_name = class.pool.push_utf8("Code");
        let code = CodeAttribute {
            max_stack: 0,
            max_locals: 2,
            code: vec![OP_RETURN],
            exception_table: vec![classfile::ExceptionHandler {
                start_pc: 0, end_pc: 1, handler_pc: 0, catch_type: 0,
            }],
            attributes: Vec::new(),
        };
        class.methods.push(MemberInfo {
            access_flags: flags::ACC_PUBLIC | flags::ACC_STATIC,
            name_index,
            descriptor_index,
            attributes: vec![AttributeInfo { name_index: code_name, info: code.to_bytes() }],
        });
        class
    }

    fn method_named<'a>(class: &'a ClassFile, name: &str) -> Option<&'a MemberInfo> {
        class.methods.iter().find(|method| {
            class.pool.utf8(method.name_index).map(|n| n == name).unwrap_or(false)
        })
    }

    #[test]
    fn ignores_unrelated_classes() {
        let class = minimal_class("com/example/Other", "java/lang/Object");
        let result = CoreModClassRemapper
            .transform("com/example/Other.class", &class.write())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn injects_method_and_head_call() {
        let class = core_mod_manager(50);
        let transformed = CoreModClassRemapper
            .transform(&format!("{}.class", FORGE_CLASS), &class.write())
            .unwrap()
            .expect("manager class must be rewritten");
        let parsed = ClassFile::parse(&transformed).unwrap();

        let injected = method_named(&parsed, INJECTED_METHOD).expect("missing injected method");
        assert_eq!(
            parsed.pool.utf8(injected.descriptor_index).unwrap(),
            INJECTED_DESCRIPTOR
        );
        assert_eq!(
            injected.access_flags,
            flags::ACC_PRIVATE | flags::ACC_STATIC
        );
        let injected_code = classfile::find_attribute(&parsed.pool, &injected.attributes, "Code").unwrap();
        let injected_code = CodeAttribute::parse(&injected_code.info).unwrap();
        assert_eq!(*injected_code.code.last().unwrap(), OP_RETURN);
        // pre-frame era: no stack map emitted
        assert!(classfile::find_attribute(&parsed.pool, &injected_code.attributes, "StackMapTable").is_none());

        let target = method_named(&parsed, TARGET_METHOD).unwrap();
        let code_attribute = classfile::find_attribute(&parsed.pool, &target.attributes, "Code").unwrap();
        let code = CodeAttribute::parse(&code_attribute.info).unwrap();
        // prologue: aload_1; invokestatic <ref>; then the original body
        assert_eq!(code.code[0], OP_ALOAD_1);
        assert_eq!(code.code[1], OP_INVOKESTATIC);
        assert_eq!(code.code[4], OP_RETURN);
        // absolute offsets slid past the 4-byte prologue
        assert_eq!(code.exception_table[0].start_pc, 4);
        assert_eq!(code.exception_table[0].end_pc, 5);
        let call_ref = u16::from_be_bytes([code.code[2], code.code[3]]);
        match parsed.pool.get(call_ref).unwrap() {
            crate::classfile::Constant::MethodRef { name_and_type, .. } => {
                let (name, descriptor) = parsed.pool.name_and_type(*name_and_type)
                    .map(|(n, d)| (n.to_owned(), d.to_owned()))
                    .unwrap();
                assert_eq!(name, INJECTED_METHOD);
                assert_eq!(descriptor, INJECTED_DESCRIPTOR);
            }
            other => panic!("expected a method ref, got {:?}", other),
        }
    }

    #[test]
    fn emits_stack_map_for_modern_classes() {
        let class = core_mod_manager(52);
        let transformed = CoreModClassRemapper
            .transform(&format!("{}.class", FORGE_CLASS), &class.write())
            .unwrap()
            .unwrap();
        let parsed = ClassFile::parse(&transformed).unwrap();
        let injected = method_named(&parsed, INJECTED_METHOD).unwrap();
        let code_attribute = classfile::find_attribute(&parsed.pool, &injected.attributes, "Code").unwrap();
        let code = CodeAttribute::parse(&code_attribute.info).unwrap();
        let stack_map = classfile::find_attribute(&parsed.pool, &code.attributes, "StackMapTable")
            .expect("frames are mandatory from major 51 on");
        let frame_count = u16::from_be_bytes([stack_map.info[0], stack_map.info[1]]);
        assert_eq!(frame_count, 3); // loop head, continue, end
    }

    #[test]
    fn second_pass_is_idempotent() {
        let class = core_mod_manager(50);
        let first = CoreModClassRemapper
            .transform(&format!("{}.class", FORGE_CLASS), &class.write())
            .unwrap()
            .unwrap();
        let second = CoreModClassRemapper
            .transform(&format!("{}.class", FORGE_CLASS), &first)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn stack_map_offset_bump_normalizes_encoding() {
        // same_frame with delta 2 -> still same_frame
        let mut small = vec![0, 1, 2];
        bump_stack_map_offset(&mut small, 4).unwrap();
        assert_eq!(small, vec![0, 1, 6]);
        // same_frame with delta 62 -> overflows into same_frame_extended
        let mut large = vec![0, 1, 62];
        bump_stack_map_offset(&mut large, 4).unwrap();
        assert_eq!(large, vec![0, 1, 251, 0, 66]);
        // full_frame keeps its shape, delta adjusted in place
        let mut full = vec![0, 1, 255, 0, 10, 0, 0, 0, 0];
        bump_stack_map_offset(&mut full, 4).unwrap();
        assert_eq!(full[3..5], [0, 14]);
    }
}
