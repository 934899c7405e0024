//! Assembles small class files from raw method bodies. Used by tests and by
//! tooling that needs a throwaway class (for example a bridge stub).

use crate::classfile::code::Label;
use crate::classfile::descriptor::MethodDescriptor;
use crate::classfile::frames::{self, Frame, VerificationType};
use crate::classfile::{
    ACC_ABSTRACT, ACC_STATIC, ACC_SUPER, Attribute, ClassFile, CodeAttribute, ConstantPool,
    ExceptionEntry, MemberInfo,
};
use crate::error::ClassFileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameValue {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal class name or array descriptor.
    Object(String),
    /// Offset of the `new` instruction.
    Uninitialized(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    pub offset: u16,
    pub locals: Vec<FrameValue>,
    pub stack: Vec<FrameValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub start: u16,
    pub end: u16,
    pub handler: u16,
    /// `None` catches everything.
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub max_stack: u16,
    pub max_locals: u16,
    /// `None` for abstract and native methods.
    pub code: Option<Vec<u8>>,
    pub handlers: Vec<HandlerSpec>,
    pub frames: Vec<FrameSpec>,
    pub annotations: Vec<String>,
}

impl MethodSpec {
    pub fn new(access: u16, name: &str, descriptor: &str, code: Vec<u8>) -> Self {
        Self {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            max_stack: 4,
            max_locals: 4,
            code: Some(code),
            handlers: Vec::new(),
            frames: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn maxs(mut self, max_stack: u16, max_locals: u16) -> Self {
        self.max_stack = max_stack;
        self.max_locals = max_locals;
        self
    }

    pub fn handler(mut self, start: u16, end: u16, handler: u16, catch_type: Option<&str>) -> Self {
        self.handlers.push(HandlerSpec {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    pub fn frame(mut self, offset: u16, locals: Vec<FrameValue>, stack: Vec<FrameValue>) -> Self {
        self.frames.push(FrameSpec {
            offset,
            locals,
            stack,
        });
        self
    }

    pub fn annotated(mut self, descriptor: &str) -> Self {
        self.annotations.push(descriptor.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClassBuilder {
    pool: ConstantPool,
    name: String,
    super_name: Option<String>,
    access: u16,
    major_version: u16,
    interfaces: Vec<String>,
    annotations: Vec<String>,
    methods: Vec<MethodSpec>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            pool: ConstantPool::new(),
            name: name.to_string(),
            super_name: (!super_name.is_empty()).then(|| super_name.to_string()),
            access: crate::classfile::ACC_PUBLIC | ACC_SUPER,
            major_version: 52,
            interfaces: Vec::new(),
            annotations: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// For code that references constants: add them here before building
    /// the method bodies.
    pub fn constant_pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    pub fn access(mut self, access: u16) -> Self {
        self.access = access;
        self
    }

    pub fn version(mut self, major_version: u16) -> Self {
        self.major_version = major_version;
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn annotation(mut self, descriptor: &str) -> Self {
        self.annotations.push(descriptor.to_string());
        self
    }

    pub fn method(
        self,
        access: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.method_spec(MethodSpec::new(access, name, descriptor, code).maxs(max_stack, max_locals))
    }

    /// A void method with an empty body carrying one annotation.
    pub fn method_with_annotation(
        self,
        access: u16,
        name: &str,
        descriptor: &str,
        annotation: &str,
    ) -> Self {
        let locals = MethodDescriptor::parse(descriptor)
            .map(|d| d.parameter_slots() + 1)
            .unwrap_or(1);
        self.method_spec(
            MethodSpec::new(access, name, descriptor, vec![crate::classfile::code::RETURN])
                .maxs(0, locals)
                .annotated(annotation),
        )
    }

    pub fn abstract_method(self, access: u16, name: &str, descriptor: &str) -> Self {
        let mut spec = MethodSpec::new(access | ACC_ABSTRACT, name, descriptor, Vec::new());
        spec.code = None;
        self.method_spec(spec)
    }

    pub fn method_spec(mut self, spec: MethodSpec) -> Self {
        self.methods.push(spec);
        self
    }

    pub fn build(self) -> Result<Vec<u8>, ClassFileError> {
        Ok(self.build_class_file()?.to_bytes())
    }

    pub fn build_class_file(mut self) -> Result<ClassFile, ClassFileError> {
        let pool = &mut self.pool;
        let this_class = pool.add_class(&self.name)?;
        let super_class = match &self.super_name {
            Some(s) => pool.add_class(s)?,
            None => 0,
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|i| pool.add_class(i))
            .collect::<Result<Vec<_>, _>>()?;
        let mut attributes = Vec::new();
        if !self.annotations.is_empty() {
            attributes.push(annotations_attribute(pool, &self.annotations)?);
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for spec in &self.methods {
            let name_index = pool.add_utf8(&spec.name)?;
            let descriptor_index = pool.add_utf8(&spec.descriptor)?;
            let mut method_attributes = Vec::new();
            if let Some(code) = &spec.code {
                method_attributes.push(code_attribute(pool, spec, code)?);
            }
            if !spec.annotations.is_empty() {
                method_attributes.push(annotations_attribute(pool, &spec.annotations)?);
            }
            methods.push(MemberInfo {
                access_flags: spec.access,
                name_index,
                descriptor_index,
                attributes: method_attributes,
            });
        }

        Ok(ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: self.pool,
            access_flags: self.access,
            this_class,
            super_class,
            interfaces,
            fields: Vec::new(),
            methods,
            attributes,
        })
    }
}

fn code_attribute(
    pool: &mut ConstantPool,
    spec: &MethodSpec,
    code: &[u8],
) -> Result<Attribute, ClassFileError> {
    let mut exception_table = Vec::with_capacity(spec.handlers.len());
    for h in &spec.handlers {
        exception_table.push(ExceptionEntry {
            start_pc: h.start,
            end_pc: h.end,
            handler_pc: h.handler,
            catch_type: match &h.catch_type {
                Some(t) => pool.add_class(t)?,
                None => 0,
            },
        });
    }
    let mut attributes = Vec::new();
    if !spec.frames.is_empty() {
        let mut frames = Vec::with_capacity(spec.frames.len());
        for f in &spec.frames {
            frames.push(Frame {
                label: Label(f.offset as u32),
                locals: resolve_values(pool, &f.locals)?,
                stack: resolve_values(pool, &f.stack)?,
            });
        }
        let info = frames::encode_full(&frames, |l| Some(l.0 as usize)).ok_or_else(|| {
            ClassFileError::BadAttribute {
                attribute: "StackMapTable",
                reason: "frame offsets must increase".to_string(),
            }
        })?;
        attributes.push(Attribute {
            name_index: pool.add_utf8("StackMapTable")?,
            info,
        });
    }
    let body = CodeAttribute {
        max_stack: spec.max_stack,
        max_locals: if spec.access & ACC_STATIC != 0 {
            spec.max_locals
        } else {
            spec.max_locals.max(1)
        },
        code: code.to_vec(),
        exception_table,
        attributes,
    };
    Ok(Attribute {
        name_index: pool.add_utf8("Code")?,
        info: body.to_bytes(),
    })
}

fn resolve_values(
    pool: &mut ConstantPool,
    values: &[FrameValue],
) -> Result<Vec<VerificationType>, ClassFileError> {
    values
        .iter()
        .map(|v| {
            Ok(match v {
                FrameValue::Top => VerificationType::Top,
                FrameValue::Int => VerificationType::Integer,
                FrameValue::Float => VerificationType::Float,
                FrameValue::Long => VerificationType::Long,
                FrameValue::Double => VerificationType::Double,
                FrameValue::Null => VerificationType::Null,
                FrameValue::UninitializedThis => VerificationType::UninitializedThis,
                FrameValue::Object(name) => VerificationType::Object(pool.add_class(name)?),
                FrameValue::Uninitialized(offset) => {
                    VerificationType::Uninitialized(Label(*offset as u32))
                }
            })
        })
        .collect()
}

fn annotations_attribute(
    pool: &mut ConstantPool,
    descriptors: &[String],
) -> Result<Attribute, ClassFileError> {
    let mut info = Vec::with_capacity(2 + descriptors.len() * 4);
    info.extend_from_slice(&(descriptors.len() as u16).to_be_bytes());
    for d in descriptors {
        info.extend_from_slice(&pool.add_utf8(d)?.to_be_bytes());
        info.extend_from_slice(&0u16.to_be_bytes());
    }
    Ok(Attribute {
        name_index: pool.add_utf8("RuntimeVisibleAnnotations")?,
        info,
    })
}
