//! Minimal JVM class-file model: enough structure to analyze hierarchies and
//! rewrite method bodies, with every attribute we do not understand carried
//! through untouched.

pub mod builder;
pub mod code;
pub mod constant_pool;
pub mod descriptor;
pub mod frames;

use crate::error::ClassFileError;
pub use constant_pool::{Constant, ConstantPool};

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_VARARGS: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_STRICT: u16 = 0x0800;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;

/// First class-file major version that carries StackMapTable frames.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ClassFileError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ClassFileError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ClassFileError> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    fn parse(reader: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        let name_index = reader.u16()?;
        let len = reader.u32()? as usize;
        Ok(Self {
            name_index,
            info: reader.bytes(len)?.to_vec(),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name_index.to_be_bytes());
        out.extend_from_slice(&(self.info.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.info);
    }
}

fn parse_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<Attribute>, ClassFileError> {
    let count = reader.u16()?;
    (0..count).map(|_| Attribute::parse(reader)).collect()
}

fn write_attributes(attributes: &[Attribute], out: &mut Vec<u8>) {
    out.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
    for attribute in attributes {
        attribute.write(out);
    }
}

/// A field or method.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl MemberInfo {
    fn parse(reader: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        Ok(Self {
            access_flags: reader.u16()?,
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            attributes: parse_attributes(reader)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.name_index.to_be_bytes());
        out.extend_from_slice(&self.descriptor_index.to_be_bytes());
        write_attributes(&self.attributes, out);
    }

    pub fn name<'p>(&self, pool: &'p ConstantPool) -> Result<&'p str, ClassFileError> {
        pool.utf8(self.name_index)
    }

    pub fn descriptor<'p>(&self, pool: &'p ConstantPool) -> Result<&'p str, ClassFileError> {
        pool.utf8(self.descriptor_index)
    }

    pub fn attribute(&self, pool: &ConstantPool, name: &str) -> Option<&Attribute> {
        find_attribute(&self.attributes, pool, name)
    }

    pub fn code(&self, pool: &ConstantPool) -> Result<Option<CodeAttribute>, ClassFileError> {
        self.attribute(pool, "Code")
            .map(|a| CodeAttribute::parse(&a.info))
            .transpose()
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

pub(crate) fn find_attribute<'a>(
    attributes: &'a [Attribute],
    pool: &ConstantPool,
    name: &str,
) -> Option<&'a Attribute> {
    attributes
        .iter()
        .find(|a| pool.utf8(a.name_index).is_ok_and(|n| n == name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// 0 catches everything.
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_len = reader.u32()? as usize;
        let code = reader.bytes(code_len)?.to_vec();
        let exception_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(exception_count as usize);
        for _ in 0..exception_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = parse_attributes(&mut reader)?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.extend_from_slice(&self.max_stack.to_be_bytes());
        out.extend_from_slice(&self.max_locals.to_be_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&(self.exception_table.len() as u16).to_be_bytes());
        for e in &self.exception_table {
            out.extend_from_slice(&e.start_pc.to_be_bytes());
            out.extend_from_slice(&e.end_pc.to_be_bytes());
            out.extend_from_slice(&e.handler_pc.to_be_bytes());
            out.extend_from_slice(&e.catch_type.to_be_bytes());
        }
        write_attributes(&self.attributes, &mut out);
        out
    }

    pub fn attribute(&self, pool: &ConstantPool, name: &str) -> Option<&Attribute> {
        find_attribute(&self.attributes, pool, name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let constant_pool = ConstantPool::parse(&mut reader)?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| reader.u16())
            .collect::<Result<Vec<_>, _>>()?;
        let field_count = reader.u16()?;
        let fields = (0..field_count)
            .map(|_| MemberInfo::parse(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        let method_count = reader.u16()?;
        let methods = (0..method_count)
            .map(|_| MemberInfo::parse(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        let attributes = parse_attributes(&mut reader)?;
        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.minor_version.to_be_bytes());
        out.extend_from_slice(&self.major_version.to_be_bytes());
        self.constant_pool.write(&mut out);
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for i in &self.interfaces {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for f in &self.fields {
            f.write(&mut out);
        }
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            m.write(&mut out);
        }
        write_attributes(&self.attributes, &mut out);
        out
    }

    /// Internal name, e.g. `com/example/Foo`.
    pub fn name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// `None` only for `java/lang/Object` (and module-info).
    pub fn super_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces
            .iter()
            .map(|i| self.constant_pool.class_name(*i))
            .collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    /// Annotation type names (Java form) declared on the class.
    pub fn annotations(&self) -> Result<Vec<String>, ClassFileError> {
        annotation_types(&self.attributes, &self.constant_pool)
    }
}

/// Annotation type names from the runtime visible and invisible annotation
/// attributes of a class or member, in Java form (`com.example.Traced`).
pub fn annotation_types(
    attributes: &[Attribute],
    pool: &ConstantPool,
) -> Result<Vec<String>, ClassFileError> {
    let mut names = Vec::new();
    for attribute in attributes {
        let attr_name = pool.utf8(attribute.name_index)?;
        if attr_name != "RuntimeVisibleAnnotations" && attr_name != "RuntimeInvisibleAnnotations" {
            continue;
        }
        let mut reader = ByteReader::new(&attribute.info);
        let count = reader.u16()?;
        for _ in 0..count {
            let type_index = reader.u16()?;
            let descriptor = pool.utf8(type_index)?;
            names.push(descriptor::FieldType::parse(descriptor)?.java_name());
            skip_annotation_body(&mut reader)?;
        }
    }
    Ok(names)
}

fn skip_annotation_body(reader: &mut ByteReader<'_>) -> Result<(), ClassFileError> {
    let pairs = reader.u16()?;
    for _ in 0..pairs {
        reader.u16()?;
        skip_element_value(reader)?;
    }
    Ok(())
}

fn skip_element_value(reader: &mut ByteReader<'_>) -> Result<(), ClassFileError> {
    match reader.u8()? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            reader.u16()?;
        }
        b'e' => {
            reader.u16()?;
            reader.u16()?;
        }
        b'@' => {
            reader.u16()?;
            skip_annotation_body(reader)?;
        }
        b'[' => {
            let n = reader.u16()?;
            for _ in 0..n {
                skip_element_value(reader)?;
            }
        }
        tag => {
            return Err(ClassFileError::BadAttribute {
                attribute: "RuntimeVisibleAnnotations",
                reason: format!("unknown element value tag {tag:#04x}"),
            });
        }
    }
    Ok(())
}

pub fn internal_to_java_name(internal: &str) -> String {
    internal.replace('/', ".")
}

pub fn java_to_internal_name(java: &str) -> String {
    java.replace('.', "/")
}
