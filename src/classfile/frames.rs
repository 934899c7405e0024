//! StackMapTable handling. Frames are expanded to explicit locals/stack lists
//! (in verification-type entries, where long and double take one entry) so
//! locals can be inserted, then written back as `full_frame`s.

use crate::classfile::code::Label;
use crate::classfile::descriptor::{FieldType, MethodDescriptor};
use crate::classfile::{ByteReader, ConstantPool};
use crate::error::ClassFileError;

const ITEM_TOP: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_UNINITIALIZED_THIS: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_UNINITIALIZED: u8 = 8;

const FULL_FRAME: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of a `Class` constant.
    Object(u16),
    /// Label of the `new` instruction that created the value.
    Uninitialized(Label),
}

impl VerificationType {
    pub fn slots(&self) -> u16 {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }

    pub fn for_field_type(ty: &FieldType, pool: &mut ConstantPool) -> Result<Self, ClassFileError> {
        Ok(match ty {
            FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Boolean
            | FieldType::Int => VerificationType::Integer,
            FieldType::Float => VerificationType::Float,
            FieldType::Long => VerificationType::Long,
            FieldType::Double => VerificationType::Double,
            FieldType::Object(_) | FieldType::Array(_) => {
                let name = ty.class_constant_name().unwrap_or_default();
                VerificationType::Object(pool.add_class(&name)?)
            }
        })
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        Ok(match reader.u8()? {
            ITEM_TOP => VerificationType::Top,
            ITEM_INTEGER => VerificationType::Integer,
            ITEM_FLOAT => VerificationType::Float,
            ITEM_DOUBLE => VerificationType::Double,
            ITEM_LONG => VerificationType::Long,
            ITEM_NULL => VerificationType::Null,
            ITEM_UNINITIALIZED_THIS => VerificationType::UninitializedThis,
            ITEM_OBJECT => VerificationType::Object(reader.u16()?),
            ITEM_UNINITIALIZED => VerificationType::Uninitialized(Label(reader.u16()? as u32)),
            tag => {
                return Err(ClassFileError::BadAttribute {
                    attribute: "StackMapTable",
                    reason: format!("unknown verification type tag {tag}"),
                });
            }
        })
    }

    fn write(&self, out: &mut Vec<u8>, resolve: &impl Fn(Label) -> Option<usize>) -> Option<()> {
        match self {
            VerificationType::Top => out.push(ITEM_TOP),
            VerificationType::Integer => out.push(ITEM_INTEGER),
            VerificationType::Float => out.push(ITEM_FLOAT),
            VerificationType::Double => out.push(ITEM_DOUBLE),
            VerificationType::Long => out.push(ITEM_LONG),
            VerificationType::Null => out.push(ITEM_NULL),
            VerificationType::UninitializedThis => out.push(ITEM_UNINITIALIZED_THIS),
            VerificationType::Object(index) => {
                out.push(ITEM_OBJECT);
                out.extend_from_slice(&index.to_be_bytes());
            }
            VerificationType::Uninitialized(label) => {
                out.push(ITEM_UNINITIALIZED);
                out.extend_from_slice(&(resolve(*label)? as u16).to_be_bytes());
            }
        }
        Some(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: Label,
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

/// Locals on method entry: `this` (uninitialized inside constructors other
/// than `Object`'s) followed by the parameters.
pub fn initial_locals(
    pool: &mut ConstantPool,
    owner_index: u16,
    method_name: &str,
    descriptor: &MethodDescriptor,
    is_static: bool,
    owner_is_object: bool,
) -> Result<Vec<VerificationType>, ClassFileError> {
    let mut locals = Vec::with_capacity(descriptor.parameters.len() + 1);
    if !is_static {
        if method_name == "<init>" && !owner_is_object {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(owner_index));
        }
    }
    for parameter in &descriptor.parameters {
        locals.push(VerificationType::for_field_type(parameter, pool)?);
    }
    Ok(locals)
}

/// Expands a StackMapTable attribute body into one full frame per entry.
pub fn decode(info: &[u8], initial: &[VerificationType]) -> Result<Vec<Frame>, ClassFileError> {
    let bad = |reason: String| ClassFileError::BadAttribute {
        attribute: "StackMapTable",
        reason,
    };
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut locals = initial.to_vec();
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = reader.u8()?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => ((frame_type - 64) as u32, vec![VerificationType::read(&mut reader)?]),
            247 => {
                let delta = reader.u16()? as u32;
                (delta, vec![VerificationType::read(&mut reader)?])
            }
            248..=250 => {
                let delta = reader.u16()? as u32;
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(bad(format!("chop of {chop} locals from {}", locals.len())));
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            251 => (reader.u16()? as u32, Vec::new()),
            252..=254 => {
                let delta = reader.u16()? as u32;
                for _ in 0..(frame_type - 251) {
                    locals.push(VerificationType::read(&mut reader)?);
                }
                (delta, Vec::new())
            }
            FULL_FRAME => {
                let delta = reader.u16()? as u32;
                let n_locals = reader.u16()?;
                locals = (0..n_locals)
                    .map(|_| VerificationType::read(&mut reader))
                    .collect::<Result<_, _>>()?;
                let n_stack = reader.u16()?;
                let stack = (0..n_stack)
                    .map(|_| VerificationType::read(&mut reader))
                    .collect::<Result<_, _>>()?;
                (delta, stack)
            }
            other => return Err(bad(format!("reserved frame type {other}"))),
        };
        let offset = match previous {
            None => delta,
            Some(p) => p + delta + 1,
        };
        previous = Some(offset);
        frames.push(Frame {
            label: Label(offset),
            locals: locals.clone(),
            stack,
        });
    }
    Ok(frames)
}

/// Inserts `inserted` so that its first entry starts at local slot `slot`,
/// padding with `Top` when the frame's locals end earlier. Returns the slot
/// of a two-slot entry that would be split, if any.
pub fn insert_locals(
    locals: &mut Vec<VerificationType>,
    slot: u16,
    inserted: &[VerificationType],
) -> Result<(), u16> {
    let mut at = 0u16;
    for (i, entry) in locals.iter().enumerate() {
        if at == slot {
            locals.splice(i..i, inserted.iter().cloned());
            return Ok(());
        }
        at += entry.slots();
        if at > slot {
            return Err(slot);
        }
    }
    while at < slot {
        locals.push(VerificationType::Top);
        at += 1;
    }
    locals.extend(inserted.iter().cloned());
    Ok(())
}

/// Encodes frames (already sorted by offset) as a StackMapTable body of
/// `full_frame` entries. `resolve` maps labels to new code offsets.
pub fn encode_full(frames: &[Frame], resolve: impl Fn(Label) -> Option<usize>) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(frames.len() * 8 + 2);
    out.extend_from_slice(&(frames.len() as u16).to_be_bytes());
    let mut previous: Option<usize> = None;
    for frame in frames {
        let offset = resolve(frame.label)?;
        let delta = match previous {
            None => offset,
            Some(p) => offset.checked_sub(p + 1)?,
        };
        previous = Some(offset);
        out.push(FULL_FRAME);
        out.extend_from_slice(&(delta as u16).to_be_bytes());
        out.extend_from_slice(&(frame.locals.len() as u16).to_be_bytes());
        for local in &frame.locals {
            local.write(&mut out, &resolve)?;
        }
        out.extend_from_slice(&(frame.stack.len() as u16).to_be_bytes());
        for item in &frame.stack {
            item.write(&mut out, &resolve)?;
        }
    }
    Some(out)
}
