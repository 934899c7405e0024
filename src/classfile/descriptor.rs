use crate::error::ClassFileError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<FieldType>),
}

/// Which family of load/store/return opcodes a type uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl SlotKind {
    pub fn load_opcode(self) -> u8 {
        match self {
            SlotKind::Int => 0x15,
            SlotKind::Long => 0x16,
            SlotKind::Float => 0x17,
            SlotKind::Double => 0x18,
            SlotKind::Reference => 0x19,
        }
    }

    pub fn store_opcode(self) -> u8 {
        self.load_opcode() + 0x21
    }

    pub fn return_opcode(self) -> u8 {
        match self {
            SlotKind::Int => 0xac,
            SlotKind::Long => 0xad,
            SlotKind::Float => 0xae,
            SlotKind::Double => 0xaf,
            SlotKind::Reference => 0xb0,
        }
    }

    pub fn size(self) -> u16 {
        match self {
            SlotKind::Long | SlotKind::Double => 2,
            _ => 1,
        }
    }
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<Self, ClassFileError> {
        let (ty, rest) = parse_field_type(descriptor)?;
        if !rest.is_empty() {
            return Err(ClassFileError::BadDescriptor(descriptor.to_string()));
        }
        Ok(ty)
    }

    /// `int`, `java.lang.String`, `byte[][]`.
    pub fn java_name(&self) -> String {
        match self {
            FieldType::Byte => "byte".to_string(),
            FieldType::Char => "char".to_string(),
            FieldType::Double => "double".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Int => "int".to_string(),
            FieldType::Long => "long".to_string(),
            FieldType::Short => "short".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Object(name) => name.replace('/', "."),
            FieldType::Array(inner) => format!("{}[]", inner.java_name()),
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Byte => "B".to_string(),
            FieldType::Char => "C".to_string(),
            FieldType::Double => "D".to_string(),
            FieldType::Float => "F".to_string(),
            FieldType::Int => "I".to_string(),
            FieldType::Long => "J".to_string(),
            FieldType::Short => "S".to_string(),
            FieldType::Boolean => "Z".to_string(),
            FieldType::Object(name) => format!("L{name};"),
            FieldType::Array(inner) => format!("[{}", inner.descriptor()),
        }
    }

    pub fn slot_kind(&self) -> SlotKind {
        match self {
            FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Boolean
            | FieldType::Int => SlotKind::Int,
            FieldType::Long => SlotKind::Long,
            FieldType::Float => SlotKind::Float,
            FieldType::Double => SlotKind::Double,
            FieldType::Object(_) | FieldType::Array(_) => SlotKind::Reference,
        }
    }

    pub fn slot_size(&self) -> u16 {
        self.slot_kind().size()
    }

    /// Name usable in a `Class` constant: internal name for objects, the
    /// descriptor for arrays, `None` for primitives.
    pub fn class_constant_name(&self) -> Option<String> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.descriptor()),
            _ => None,
        }
    }

    /// Wrapper metadata for primitives, `None` for references.
    pub fn boxing(&self) -> Option<Boxing> {
        let (wrapper, prim, unbox) = match self {
            FieldType::Byte => ("java/lang/Byte", "B", "byteValue"),
            FieldType::Char => ("java/lang/Character", "C", "charValue"),
            FieldType::Double => ("java/lang/Double", "D", "doubleValue"),
            FieldType::Float => ("java/lang/Float", "F", "floatValue"),
            FieldType::Int => ("java/lang/Integer", "I", "intValue"),
            FieldType::Long => ("java/lang/Long", "J", "longValue"),
            FieldType::Short => ("java/lang/Short", "S", "shortValue"),
            FieldType::Boolean => ("java/lang/Boolean", "Z", "booleanValue"),
            FieldType::Object(_) | FieldType::Array(_) => return None,
        };
        Some(Boxing {
            wrapper,
            value_of_descriptor: format!("({prim})L{wrapper};"),
            unbox_method: unbox,
            unbox_descriptor: format!("(){prim}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boxing {
    pub wrapper: &'static str,
    pub value_of_descriptor: String,
    pub unbox_method: &'static str,
    pub unbox_descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    /// `None` for `void`.
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self, ClassFileError> {
        let bad = || ClassFileError::BadDescriptor(descriptor.to_string());
        let mut rest = descriptor.strip_prefix('(').ok_or_else(bad)?;
        let mut parameters = Vec::new();
        while !rest.starts_with(')') {
            if rest.is_empty() {
                return Err(bad());
            }
            let (ty, tail) = parse_field_type(rest)?;
            parameters.push(ty);
            rest = tail;
        }
        let ret = &rest[1..];
        let return_type = if ret == "V" {
            None
        } else {
            Some(FieldType::parse(ret).map_err(|_| bad())?)
        };
        Ok(Self {
            parameters,
            return_type,
        })
    }

    pub fn parameter_slots(&self) -> u16 {
        self.parameters.iter().map(FieldType::slot_size).sum()
    }

    pub fn return_java_name(&self) -> String {
        self.return_type
            .as_ref()
            .map_or_else(|| "void".to_string(), FieldType::java_name)
    }

    pub fn parameter_java_names(&self) -> Vec<String> {
        self.parameters.iter().map(FieldType::java_name).collect()
    }
}

fn parse_field_type(s: &str) -> Result<(FieldType, &str), ClassFileError> {
    let bad = || ClassFileError::BadDescriptor(s.to_string());
    let first = s.chars().next().ok_or_else(bad)?;
    let rest = &s[first.len_utf8()..];
    let ty = match first {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        'L' => {
            let end = rest.find(';').ok_or_else(bad)?;
            if end == 0 {
                return Err(bad());
            }
            return Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (inner, tail) = parse_field_type(rest)?;
            return Ok((FieldType::Array(Box::new(inner)), tail));
        }
        _ => return Err(bad()),
    };
    Ok((ty, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_descriptors_into_java_names() -> Result<(), ClassFileError> {
        let desc = MethodDescriptor::parse("(IJ[Ljava/lang/String;[[B)Ljava/util/List;")?;
        assert_eq!(
            desc.parameter_java_names(),
            vec!["int", "long", "java.lang.String[]", "byte[][]"]
        );
        assert_eq!(desc.return_java_name(), "java.util.List");
        assert_eq!(desc.parameter_slots(), 5);
        assert_eq!(MethodDescriptor::parse("()V")?.return_type, None);
        Ok(())
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("L;").is_err());
        assert!(FieldType::parse("II").is_err());
    }

    #[test]
    fn boxing_metadata_matches_wrapper_types() {
        let b = FieldType::Long.boxing().expect("long boxes");
        assert_eq!(b.wrapper, "java/lang/Long");
        assert_eq!(b.value_of_descriptor, "(J)Ljava/lang/Long;");
        assert_eq!(b.unbox_descriptor, "()J");
        assert!(FieldType::Object("x/Y".into()).boxing().is_none());
        assert_eq!(SlotKind::Reference.store_opcode(), 0x3a);
        assert_eq!(SlotKind::Int.store_opcode(), 0x36);
    }
}
