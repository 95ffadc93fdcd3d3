//! A minimal class-file model: just enough structure to remap symbol
//! references, adjust member access, rewrite debug metadata and synthesize
//! small methods. Attribute payloads we don't understand are carried through
//! byte-for-byte; everything here round-trips unknown data untouched.

use failure::Error;
use failure_derive::Fail;

pub const MAGIC: u32 = 0xCAFE_BABE;

/// Class-file major version of Java 16; record components gained
/// remap-sensitive signatures with this release.
pub const JAVA_16_MAJOR: u16 = 60;
/// First major version where stack map frames are mandatory.
pub const STACK_FRAMES_REQUIRED_MAJOR: u16 = 51;

pub mod flags {
    pub const ACC_PUBLIC: u16 = 0x0001;
    pub const ACC_PRIVATE: u16 = 0x0002;
    pub const ACC_PROTECTED: u16 = 0x0004;
    pub const ACC_STATIC: u16 = 0x0008;
    pub const ACC_FINAL: u16 = 0x0010;
}

#[derive(Debug, Fail)]
pub enum ClassFormatError {
    #[fail(display = "Unexpected end of class file")]
    UnexpectedEof,
    #[fail(display = "Bad class file magic {:#x}", _0)]
    BadMagic(u32),
    #[fail(display = "Unknown constant pool tag {}", _0)]
    UnknownTag(u8),
    #[fail(display = "Invalid constant pool index {}", _0)]
    BadPoolIndex(u16),
    #[fail(display = "Expected {} at constant pool index {}", _0, _1)]
    WrongConstantType(&'static str, u16),
    #[fail(display = "Invalid modified UTF-8 in constant pool")]
    InvalidUtf8,
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}
impl<'a> ByteReader<'a> {
    #[inline]
    fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader { data, pos: 0 }
    }
    fn bytes(&mut self, count: usize) -> Result<&'a [u8], ClassFormatError> {
        let end = self.pos.checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or(ClassFormatError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8, ClassFormatError> {
        Ok(self.bytes(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, ClassFormatError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32, ClassFormatError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

#[derive(Default)]
struct ByteWriter {
    buf: Vec<u8>,
}
impl ByteWriter {
    #[inline]
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }
    #[inline]
    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
    #[inline]
    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
    #[inline]
    fn bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name: u16 },
    String { value: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
    /// Occupies the phantom second slot behind `Long`/`Double`.
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    /// Index 0 is a placeholder so constant-pool indices apply directly.
    entries: Vec<Constant>,
}
impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool { entries: vec![Constant::Placeholder] }
    }
    fn parse(reader: &mut ByteReader) -> Result<ConstantPool, ClassFormatError> {
        let count = reader.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Placeholder);
        while entries.len() < count as usize {
            let tag = reader.u8()?;
            let constant = match tag {
                1 => {
                    let length = reader.u16()? as usize;
                    let bytes = reader.bytes(length)?;
                    // Modified UTF-8; names and descriptors are plain ASCII in
                    // practice, so strict UTF-8 decoding is good enough here.
                    let value = ::std::str::from_utf8(bytes)
                        .map_err(|_| ClassFormatError::InvalidUtf8)?;
                    Constant::Utf8(value.to_owned())
                }
                3 => Constant::Integer(reader.u32()? as i32),
                4 => Constant::Float(reader.u32()?),
                5 => Constant::Long(((reader.u32()? as u64) << 32 | reader.u32()? as u64) as i64),
                6 => Constant::Double((reader.u32()? as u64) << 32 | reader.u32()? as u64),
                7 => Constant::Class { name: reader.u16()? },
                8 => Constant::String { value: reader.u16()? },
                9 => Constant::FieldRef { class: reader.u16()?, name_and_type: reader.u16()? },
                10 => Constant::MethodRef { class: reader.u16()?, name_and_type: reader.u16()? },
                11 => Constant::InterfaceMethodRef { class: reader.u16()?, name_and_type: reader.u16()? },
                12 => Constant::NameAndType { name: reader.u16()?, descriptor: reader.u16()? },
                15 => Constant::MethodHandle { kind: reader.u8()?, reference: reader.u16()? },
                16 => Constant::MethodType { descriptor: reader.u16()? },
                17 => Constant::Dynamic { bootstrap: reader.u16()?, name_and_type: reader.u16()? },
                18 => Constant::InvokeDynamic { bootstrap: reader.u16()?, name_and_type: reader.u16()? },
                19 => Constant::Module { name: reader.u16()? },
                20 => Constant::Package { name: reader.u16()? },
                other => return Err(ClassFormatError::UnknownTag(other)),
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            if wide {
                entries.push(Constant::Placeholder);
            }
        }
        Ok(ConstantPool { entries })
    }
    fn write(&self, writer: &mut ByteWriter) {
        writer.u16(self.entries.len() as u16);
        for entry in self.entries.iter().skip(1) {
            match *entry {
                Constant::Utf8(ref value) => {
                    writer.u8(1);
                    writer.u16(value.len() as u16);
                    writer.bytes(value.as_bytes());
                }
                Constant::Integer(value) => {
                    writer.u8(3);
                    writer.u32(value as u32);
                }
                Constant::Float(value) => {
                    writer.u8(4);
                    writer.u32(value);
                }
                Constant::Long(value) => {
                    writer.u8(5);
                    writer.u32((value as u64 >> 32) as u32);
                    writer.u32(value as u32);
                }
                Constant::Double(value) => {
                    writer.u8(6);
                    writer.u32((value >> 32) as u32);
                    writer.u32(value as u32);
                }
                Constant::Class { name } => {
                    writer.u8(7);
                    writer.u16(name);
                }
                Constant::String { value } => {
                    writer.u8(8);
                    writer.u16(value);
                }
                Constant::FieldRef { class, name_and_type } => {
                    writer.u8(9);
                    writer.u16(class);
                    writer.u16(name_and_type);
                }
                Constant::MethodRef { class, name_and_type } => {
                    writer.u8(10);
                    writer.u16(class);
                    writer.u16(name_and_type);
                }
                Constant::InterfaceMethodRef { class, name_and_type } => {
                    writer.u8(11);
                    writer.u16(class);
                    writer.u16(name_and_type);
                }
                Constant::NameAndType { name, descriptor } => {
                    writer.u8(12);
                    writer.u16(name);
                    writer.u16(descriptor);
                }
                Constant::MethodHandle { kind, reference } => {
                    writer.u8(15);
                    writer.u8(kind);
                    writer.u16(reference);
                }
                Constant::MethodType { descriptor } => {
                    writer.u8(16);
                    writer.u16(descriptor);
                }
                Constant::Dynamic { bootstrap, name_and_type } => {
                    writer.u8(17);
                    writer.u16(bootstrap);
                    writer.u16(name_and_type);
                }
                Constant::InvokeDynamic { bootstrap, name_and_type } => {
                    writer.u8(18);
                    writer.u16(bootstrap);
                    writer.u16(name_and_type);
                }
                Constant::Module { name } => {
                    writer.u8(19);
                    writer.u16(name);
                }
                Constant::Package { name } => {
                    writer.u8(20);
                    writer.u16(name);
                }
                Constant::Placeholder => {}
            }
        }
    }
    #[inline]
    pub fn len(&self) -> u16 {
        self.entries.len() as u16
    }
    pub fn get(&self, index: u16) -> Result<&Constant, Error> {
        self.entries.get(index as usize)
            .filter(|c| !matches!(**c, Constant::Placeholder))
            .ok_or_else(|| ClassFormatError::BadPoolIndex(index).into())
    }
    pub fn utf8(&self, index: u16) -> Result<&str, Error> {
        match self.get(index)? {
            Constant::Utf8(value) => Ok(value),
            _ => Err(ClassFormatError::WrongConstantType("Utf8", index).into()),
        }
    }
    /// Resolves a `Class` entry to its internal name.
    pub fn class_name(&self, index: u16) -> Result<&str, Error> {
        match *self.get(index)? {
            Constant::Class { name } => self.utf8(name),
            _ => Err(ClassFormatError::WrongConstantType("Class", index).into()),
        }
    }
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), Error> {
        match *self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(name)?, self.utf8(descriptor)?))
            }
            _ => Err(ClassFormatError::WrongConstantType("NameAndType", index).into()),
        }
    }
    pub fn set(&mut self, index: u16, constant: Constant) {
        self.entries[index as usize] = constant;
    }
    pub fn push(&mut self, constant: Constant) -> u16 {
        let index = self.entries.len() as u16;
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Placeholder);
        }
        index
    }
    /// Interns a utf8 value, reusing an existing entry where possible.
    pub fn push_utf8(&mut self, value: &str) -> u16 {
        for (index, entry) in self.entries.iter().enumerate().skip(1) {
            if let Constant::Utf8(existing) = entry {
                if existing == value {
                    return index as u16
                }
            }
        }
        self.push(Constant::Utf8(value.to_owned()))
    }
    pub fn push_class(&mut self, name: &str) -> u16 {
        let name_index = self.push_utf8(name);
        for (index, entry) in self.entries.iter().enumerate().skip(1) {
            if let Constant::Class { name } = entry {
                if *name == name_index {
                    return index as u16
                }
            }
        }
        self.push(Constant::Class { name: name_index })
    }
    pub fn push_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.push_utf8(name);
        let descriptor_index = self.push_utf8(descriptor);
        self.push(Constant::NameAndType { name: name_index, descriptor: descriptor_index })
    }
    pub fn push_method_ref(&mut self, owner: &str, name: &str, descriptor: &str, interface: bool) -> u16 {
        let class = self.push_class(owner);
        let name_and_type = self.push_name_and_type(name, descriptor);
        self.push(if interface {
            Constant::InterfaceMethodRef { class, name_and_type }
        } else {
            Constant::MethodRef { class, name_and_type }
        })
    }
    pub fn push_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.push_class(owner);
        let name_and_type = self.push_name_and_type(name, descriptor);
        self.push(Constant::FieldRef { class, name_and_type })
    }
    pub fn push_string(&mut self, value: &str) -> u16 {
        let utf8 = self.push_utf8(value);
        self.push(Constant::String { value: utf8 })
    }
    pub fn entries(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries.iter().enumerate().skip(1)
            .map(|(index, entry)| (index as u16, entry))
    }
}

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}
impl ClassFile {
    pub fn parse(data: &[u8]) -> Result<ClassFile, Error> {
        let mut reader = ByteReader::new(data);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic(magic).into())
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let pool = ConstantPool::parse(&mut reader)?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.u16()?);
        }
        let fields = parse_members(&mut reader)?;
        let methods = parse_members(&mut reader)?;
        let attributes = parse_attributes(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(ClassFormatError::UnexpectedEof.into())
        }
        Ok(ClassFile {
            minor_version, major_version, pool, access_flags,
            this_class, super_class, interfaces, fields, methods, attributes,
        })
    }
    pub fn write(&self) -> Vec<u8> {
        let mut writer = ByteWriter::default();
        writer.u32(MAGIC);
        writer.u16(self.minor_version);
        writer.u16(self.major_version);
        self.pool.write(&mut writer);
        writer.u16(self.access_flags);
        writer.u16(self.this_class);
        writer.u16(self.super_class);
        writer.u16(self.interfaces.len() as u16);
        for &interface in &self.interfaces {
            writer.u16(interface);
        }
        write_members(&mut writer, &self.fields);
        write_members(&mut writer, &self.methods);
        write_attributes(&mut writer, &self.attributes);
        writer.buf
    }
    /// The internal name of this class.
    pub fn name(&self) -> Result<&str, Error> {
        self.pool.class_name(self.this_class)
    }
}

fn parse_members(reader: &mut ByteReader) -> Result<Vec<MemberInfo>, ClassFormatError> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(MemberInfo {
            access_flags: reader.u16()?,
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            attributes: parse_attributes(reader)?,
        });
    }
    Ok(members)
}
fn parse_attributes(reader: &mut ByteReader) -> Result<Vec<AttributeInfo>, ClassFormatError> {
    let count = reader.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.u16()?;
        let length = reader.u32()? as usize;
        attributes.push(AttributeInfo {
            name_index,
            info: reader.bytes(length)?.to_vec(),
        });
    }
    Ok(attributes)
}
fn write_members(writer: &mut ByteWriter, members: &[MemberInfo]) {
    writer.u16(members.len() as u16);
    for member in members {
        writer.u16(member.access_flags);
        writer.u16(member.name_index);
        writer.u16(member.descriptor_index);
        write_attributes(writer, &member.attributes);
    }
}
fn write_attributes(writer: &mut ByteWriter, attributes: &[AttributeInfo]) {
    writer.u16(attributes.len() as u16);
    for attribute in attributes {
        writer.u16(attribute.name_index);
        writer.u32(attribute.info.len() as u32);
        writer.bytes(&attribute.info);
    }
}

pub fn find_attribute<'a>(
    pool: &ConstantPool,
    attributes: &'a [AttributeInfo],
    name: &str,
) -> Option<&'a AttributeInfo> {
    attributes.iter().find(|attr| {
        pool.utf8(attr.name_index).map(|n| n == name).unwrap_or(false)
    })
}
pub fn find_attribute_mut<'a>(
    pool: &ConstantPool,
    attributes: &'a mut [AttributeInfo],
    name: &str,
) -> Option<&'a mut AttributeInfo> {
    attributes.iter_mut().find(|attr| {
        pool.utf8(attr.name_index).map(|n| n == name).unwrap_or(false)
    })
}

/// The decoded payload of a `Code` attribute.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<AttributeInfo>,
}
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}
impl CodeAttribute {
    pub fn parse(data: &[u8]) -> Result<CodeAttribute, Error> {
        let mut reader = ByteReader::new(data);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()? as usize;
        let code = reader.bytes(code_length)?.to_vec();
        let handler_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionHandler {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = parse_attributes(&mut reader)?;
        Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::default();
        writer.u16(self.max_stack);
        writer.u16(self.max_locals);
        writer.u32(self.code.len() as u32);
        writer.bytes(&self.code);
        writer.u16(self.exception_table.len() as u16);
        for handler in &self.exception_table {
            writer.u16(handler.start_pc);
            writer.u16(handler.end_pc);
            writer.u16(handler.handler_pc);
            writer.u16(handler.catch_type);
        }
        write_attributes(&mut writer, &self.attributes);
        writer.buf
    }
}

/// `LocalVariableTable` / `LocalVariableTypeTable` entry; for the type table
/// `descriptor_index` holds the signature index (same slot, same width).
#[derive(Debug, Clone, Copy)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}
pub fn parse_local_variables(data: &[u8]) -> Result<Vec<LocalVariable>, Error> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut variables = Vec::with_capacity(count as usize);
    for _ in 0..count {
        variables.push(LocalVariable {
            start_pc: reader.u16()?,
            length: reader.u16()?,
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            index: reader.u16()?,
        });
    }
    Ok(variables)
}
pub fn write_local_variables(variables: &[LocalVariable]) -> Vec<u8> {
    let mut writer = ByteWriter::default();
    writer.u16(variables.len() as u16);
    for variable in variables {
        writer.u16(variable.start_pc);
        writer.u16(variable.length);
        writer.u16(variable.name_index);
        writer.u16(variable.descriptor_index);
        writer.u16(variable.index);
    }
    writer.buf
}

#[derive(Debug, Clone, Copy)]
pub struct MethodParameter {
    /// Zero means "no name recorded".
    pub name_index: u16,
    pub access_flags: u16,
}
pub fn parse_method_parameters(data: &[u8]) -> Result<Vec<MethodParameter>, Error> {
    let mut reader = ByteReader::new(data);
    let count = reader.u8()?;
    let mut parameters = Vec::with_capacity(count as usize);
    for _ in 0..count {
        parameters.push(MethodParameter {
            name_index: reader.u16()?,
            access_flags: reader.u16()?,
        });
    }
    Ok(parameters)
}
pub fn write_method_parameters(parameters: &[MethodParameter]) -> Vec<u8> {
    let mut writer = ByteWriter::default();
    writer.u8(parameters.len() as u8);
    for parameter in parameters {
        writer.u16(parameter.name_index);
        writer.u16(parameter.access_flags);
    }
    writer.buf
}

#[derive(Debug, Clone, Copy)]
pub struct InnerClass {
    pub inner_class_info: u16,
    pub outer_class_info: u16,
    pub inner_name: u16,
    pub access_flags: u16,
}
pub fn parse_inner_classes(data: &[u8]) -> Result<Vec<InnerClass>, Error> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut classes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        classes.push(InnerClass {
            inner_class_info: reader.u16()?,
            outer_class_info: reader.u16()?,
            inner_name: reader.u16()?,
            access_flags: reader.u16()?,
        });
    }
    Ok(classes)
}
pub fn write_inner_classes(classes: &[InnerClass]) -> Vec<u8> {
    let mut writer = ByteWriter::default();
    writer.u16(classes.len() as u16);
    for class in classes {
        writer.u16(class.inner_class_info);
        writer.u16(class.outer_class_info);
        writer.u16(class.inner_name);
        writer.u16(class.access_flags);
    }
    writer.buf
}

#[derive(Debug, Clone)]
pub struct RecordComponent {
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}
pub fn parse_record_components(data: &[u8]) -> Result<Vec<RecordComponent>, Error> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut components = Vec::with_capacity(count as usize);
    for _ in 0..count {
        components.push(RecordComponent {
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            attributes: parse_attributes(&mut reader)?,
        });
    }
    Ok(components)
}
pub fn write_record_components(components: &[RecordComponent]) -> Vec<u8> {
    let mut writer = ByteWriter::default();
    writer.u16(components.len() as u16);
    for component in components {
        writer.u16(component.name_index);
        writer.u16(component.descriptor_index);
        write_attributes(&mut writer, &component.attributes);
    }
    writer.buf
}

/// A class-level annotation as seen by the sided-class stripper: the
/// annotation's type descriptor plus any enum-valued elements.
#[derive(Debug, Clone)]
pub struct AnnotationInfo {
    pub type_descriptor: String,
    /// (element name, enum type descriptor, enum constant name)
    pub enum_values: Vec<(String, String, String)>,
}
pub fn scan_annotations(pool: &ConstantPool, data: &[u8]) -> Result<Vec<AnnotationInfo>, Error> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(scan_annotation(pool, &mut reader)?);
    }
    Ok(annotations)
}
fn scan_annotation(pool: &ConstantPool, reader: &mut ByteReader) -> Result<AnnotationInfo, Error> {
    let type_index = reader.u16()?;
    let type_descriptor = pool.utf8(type_index)?.to_owned();
    let pair_count = reader.u16()?;
    let mut enum_values = Vec::new();
    for _ in 0..pair_count {
        let name_index = reader.u16()?;
        let element_name = pool.utf8(name_index)?.to_owned();
        if let Some((enum_type, const_name)) = scan_element_value(pool, reader)? {
            enum_values.push((element_name, enum_type, const_name));
        }
    }
    Ok(AnnotationInfo { type_descriptor, enum_values })
}
fn scan_element_value(
    pool: &ConstantPool,
    reader: &mut ByteReader,
) -> Result<Option<(String, String)>, Error> {
    let tag = reader.u8()?;
    Ok(match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            reader.u16()?;
            None
        }
        b'e' => {
            let type_name = pool.utf8(reader.u16()?)?.to_owned();
            let const_name = pool.utf8(reader.u16()?)?.to_owned();
            Some((type_name, const_name))
        }
        b'@' => {
            scan_annotation(pool, reader)?;
            None
        }
        b'[' => {
            let count = reader.u16()?;
            let mut first = None;
            for _ in 0..count {
                let value = scan_element_value(pool, reader)?;
                if first.is_none() {
                    first = value;
                }
            }
            first
        }
        other => return Err(ClassFormatError::UnknownTag(other).into()),
    })
}

/// Builds a tiny but well-formed class by hand. Test fixture shared by the
/// transform and post-processing tests.
#[cfg(test)]
pub(crate) fn minimal_class(name: &str, super_name: &str) -> ClassFile {
    let mut pool = ConstantPool::new();
    let this_class = pool.push_class(name);
    let super_class = pool.push_class(super_name);
    ClassFile {
        minor_version: 0,
        major_version: 52,
        pool,
        access_flags: flags::ACC_PUBLIC,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        attributes: Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_written_class() {
        let mut class = minimal_class("com/example/Foo", "java/lang/Object");
        let name_index = class.pool.push_utf8("value");
        let descriptor_index = class.pool.push_utf8("I");
        class.fields.push(MemberInfo {
            access_flags: flags::ACC_PRIVATE | flags::ACC_FINAL,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        let bytes = class.write();
        let parsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(parsed.name().unwrap(), "com/example/Foo");
        assert_eq!(parsed.pool.class_name(parsed.super_class).unwrap(), "java/lang/Object");
        assert_eq!(parsed.fields.len(), 1);
        let field = &parsed.fields[0];
        assert_eq!(parsed.pool.utf8(field.name_index).unwrap(), "value");
        assert_eq!(parsed.pool.utf8(field.descriptor_index).unwrap(), "I");
    }

    #[test]
    fn utf8_interning() {
        let mut class = minimal_class("A", "java/lang/Object");
        let first = class.pool.push_utf8("shared");
        let second = class.pool.push_utf8("shared");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(ClassFile::parse(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn long_constants_take_two_slots() {
        let mut class = minimal_class("A", "java/lang/Object");
        let long_index = class.pool.push(Constant::Long(42));
        let after = class.pool.push_utf8("after");
        assert_eq!(after, long_index + 2);
        let parsed = ClassFile::parse(&class.write()).unwrap();
        assert_eq!(parsed.pool.utf8(after).unwrap(), "after");
        match parsed.pool.get(long_index).unwrap() {
            Constant::Long(42) => {}
            other => panic!("unexpected constant {:?}", other),
        }
    }

    #[test]
    fn code_attribute_round_trip() {
        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 3,
            code: vec![0x2a, 0xb1],
            exception_table: vec![ExceptionHandler {
                start_pc: 0, end_pc: 1, handler_pc: 1, catch_type: 0,
            }],
            attributes: Vec::new(),
        };
        let parsed = CodeAttribute::parse(&code.to_bytes()).unwrap();
        assert_eq!(parsed.max_stack, 2);
        assert_eq!(parsed.code, vec![0x2a, 0xb1]);
        assert_eq!(parsed.exception_table.len(), 1);
        assert_eq!(parsed.exception_table[0].end_pc, 1);
    }
}
