use crate::classfile::ByteReader;
use crate::error::ClassFileError;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// A modified UTF-8 string as stored in the constant pool. `raw` is kept so
/// an untouched pool re-encodes byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaStr {
    raw: Vec<u8>,
    text: String,
}

impl JavaStr {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        let text = decode_modified_utf8(&raw);
        Self { raw, text }
    }

    pub fn new(text: &str) -> Self {
        Self {
            raw: encode_modified_utf8(text),
            text: text.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Utf8(JavaStr),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
    /// Second slot of a long or double, and slot 0.
    Unusable,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        let count = reader.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        let mut index = 1u16;
        while index < count {
            let tag = reader.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(JavaStr::from_raw(reader.bytes(len)?.to_vec()))
                }
                TAG_INTEGER => Constant::Integer(reader.u32()? as i32),
                TAG_FLOAT => Constant::Float(reader.u32()?),
                TAG_LONG => Constant::Long(reader.u64()? as i64),
                TAG_DOUBLE => Constant::Double(reader.u64()?),
                TAG_CLASS => Constant::Class {
                    name_index: reader.u16()?,
                },
                TAG_STRING => Constant::String {
                    string_index: reader.u16()?,
                },
                TAG_FIELDREF => Constant::FieldRef {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                TAG_METHODREF => Constant::MethodRef {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodRef {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name_index: reader.u16()?,
                    descriptor_index: reader.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: reader.u8()?,
                    reference_index: reader.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType {
                    descriptor_index: reader.u16()?,
                },
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                TAG_MODULE => Constant::Module {
                    name_index: reader.u16()?,
                },
                TAG_PACKAGE => Constant::Package {
                    name_index: reader.u16()?,
                },
                other => return Err(ClassFileError::UnknownConstantTag { tag: other, index }),
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            index += 1;
            if wide {
                entries.push(Constant::Unusable);
                index += 1;
            }
        }
        Ok(Self { entries })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for constant in &self.entries[1..] {
            match constant {
                Constant::Utf8(s) => {
                    out.push(TAG_UTF8);
                    out.extend_from_slice(&(s.raw().len() as u16).to_be_bytes());
                    out.extend_from_slice(s.raw());
                }
                Constant::Integer(v) => {
                    out.push(TAG_INTEGER);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Float(bits) => {
                    out.push(TAG_FLOAT);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Long(v) => {
                    out.push(TAG_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Double(bits) => {
                    out.push(TAG_DOUBLE);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Class { name_index } => put_tag_u16(out, TAG_CLASS, *name_index),
                Constant::String { string_index } => put_tag_u16(out, TAG_STRING, *string_index),
                Constant::FieldRef {
                    class_index,
                    name_and_type_index,
                } => put_tag_u16_u16(out, TAG_FIELDREF, *class_index, *name_and_type_index),
                Constant::MethodRef {
                    class_index,
                    name_and_type_index,
                } => put_tag_u16_u16(out, TAG_METHODREF, *class_index, *name_and_type_index),
                Constant::InterfaceMethodRef {
                    class_index,
                    name_and_type_index,
                } => put_tag_u16_u16(
                    out,
                    TAG_INTERFACE_METHODREF,
                    *class_index,
                    *name_and_type_index,
                ),
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => put_tag_u16_u16(out, TAG_NAME_AND_TYPE, *name_index, *descriptor_index),
                Constant::MethodHandle {
                    kind,
                    reference_index,
                } => {
                    out.push(TAG_METHOD_HANDLE);
                    out.push(*kind);
                    out.extend_from_slice(&reference_index.to_be_bytes());
                }
                Constant::MethodType { descriptor_index } => {
                    put_tag_u16(out, TAG_METHOD_TYPE, *descriptor_index)
                }
                Constant::Dynamic {
                    bootstrap_index,
                    name_and_type_index,
                } => put_tag_u16_u16(out, TAG_DYNAMIC, *bootstrap_index, *name_and_type_index),
                Constant::InvokeDynamic {
                    bootstrap_index,
                    name_and_type_index,
                } => put_tag_u16_u16(
                    out,
                    TAG_INVOKE_DYNAMIC,
                    *bootstrap_index,
                    *name_and_type_index,
                ),
                Constant::Module { name_index } => put_tag_u16(out, TAG_MODULE, *name_index),
                Constant::Package { name_index } => put_tag_u16(out, TAG_PACKAGE, *name_index),
                Constant::Unusable => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFileError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(ClassFileError::BadConstant {
                index,
                expected: "usable constant",
            }),
            Some(c) => Ok(c),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Constant::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Internal (slash separated) name of a `Class` constant.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassFileError> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// `(owner, name, descriptor)` of a field, method or interface method ref.
    pub fn member_ref(&self, index: u16) -> Result<(&str, &str, &str), ClassFileError> {
        match self.get(index)? {
            Constant::FieldRef {
                class_index,
                name_and_type_index,
            }
            | Constant::MethodRef {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "member reference",
            }),
        }
    }

    pub fn add_utf8(&mut self, text: &str) -> Result<u16, ClassFileError> {
        let found = self.position(|c| matches!(c, Constant::Utf8(s) if s.as_str() == text));
        match found {
            Some(index) => Ok(index),
            None => self.push(Constant::Utf8(JavaStr::new(text))),
        }
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(internal_name)?;
        self.add(Constant::Class { name_index })
    }

    pub fn add_string(&mut self, text: &str) -> Result<u16, ClassFileError> {
        let string_index = self.add_utf8(text)?;
        self.add(Constant::String { string_index })
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.add(Constant::Integer(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    fn add(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        match self.position(|c| *c == constant) {
            Some(index) => Ok(index),
            None => self.push(constant),
        }
    }

    fn position(&self, pred: impl Fn(&Constant) -> bool) -> Option<u16> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, c)| pred(c))
            .map(|(i, _)| i as u16)
    }

    fn push(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        let slots = if matches!(constant, Constant::Long(_) | Constant::Double(_)) {
            2
        } else {
            1
        };
        if self.entries.len() + slots > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.entries.push(constant);
        if slots == 2 {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }
}

fn put_tag_u16(out: &mut Vec<u8>, tag: u8, a: u16) {
    out.push(tag);
    out.extend_from_slice(&a.to_be_bytes());
}

fn put_tag_u16_u16(out: &mut Vec<u8>, tag: u8, a: u16, b: u16) {
    out.push(tag);
    out.extend_from_slice(&a.to_be_bytes());
    out.extend_from_slice(&b.to_be_bytes());
}

/// Lossy for unpaired surrogates, which become U+FFFD.
pub fn decode_modified_utf8(raw: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 && i + 1 < raw.len() {
            units.push((((b & 0x1F) as u16) << 6) | (raw[i + 1] & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 && i + 2 < raw.len() {
            units.push(
                (((b & 0x0F) as u16) << 12)
                    | (((raw[i + 1] & 0x3F) as u16) << 6)
                    | (raw[i + 2] & 0x3F) as u16,
            );
            i += 3;
        } else {
            units.push(0xFFFD);
            i += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
