//! Instruction-level view of a method body. Decoding turns every branch
//! offset into a [`Label`] so a body can be edited and re-laid out; labels
//! produced by decoding are the original bytecode offsets.

use std::collections::HashMap;

use thiserror::Error;

use crate::classfile::ByteReader;
use crate::error::ClassFileError;

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_0: u8 = 0x03;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const ALOAD: u8 = 0x19;
pub const ISTORE: u8 = 0x36;
pub const ASTORE: u8 = 0x3a;
pub const AASTORE: u8 = 0x53;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const IINC: u8 = 0x84;
pub const IFEQ: u8 = 0x99;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Any instruction without operands.
    Simple(u8),
    /// `xload`/`xstore`/`ret` with the short `_n` and `wide` forms folded in;
    /// `opcode` is always the long form (`iload`..`aload`, `istore`..`astore`, `ret`).
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    Bipush(i8),
    Sipush(i16),
    /// `ldc` or `ldc_w`, chosen at encode time.
    Ldc(u16),
    Ldc2(u16),
    /// Conditional branches, `goto` and `jsr`; `goto_w`/`jsr_w` decode to the short opcode.
    Branch { opcode: u8, target: Label },
    /// Field access, non-interface invokes, `new`, `anewarray`, `checkcast`, `instanceof`.
    Member { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    NewArray(u8),
    MultiANewArray { index: u16, dims: u8 },
    TableSwitch {
        default: Label,
        low: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Insn {
    pub fn is_return(&self) -> bool {
        matches!(self, Insn::Simple(op) if (IRETURN..=RETURN).contains(op))
    }

    pub fn is_subroutine(&self) -> bool {
        matches!(self, Insn::Branch { opcode: JSR, .. } | Insn::Local { opcode: RET, .. })
    }

    pub fn local_index_mut(&mut self) -> Option<&mut u16> {
        match self {
            Insn::Local { index, .. } | Insn::Iinc { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Shortest constant-pool-free encoding of an int push; `None` when the
    /// value needs an `ldc`.
    pub fn push_int(value: i32) -> Option<Insn> {
        match value {
            -1..=5 => Some(Insn::Simple((ICONST_0 as i32 + value) as u8)),
            -128..=127 => Some(Insn::Bipush(value as i8)),
            -32768..=32767 => Some(Insn::Sipush(value as i16)),
            _ => None,
        }
    }

    fn is_conditional_branch(opcode: u8) -> bool {
        (IFEQ..=IF_ACMPNE).contains(&opcode) || opcode == IFNULL || opcode == IFNONNULL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Label(Label),
    Insn(Insn),
}

/// Decodes `code` into a label-addressed item list: every instruction is
/// preceded by the label of its original offset and the list ends with the
/// label of `code.len()`.
pub fn decode(code: &[u8]) -> Result<Vec<Item>, ClassFileError> {
    let mut items = Vec::with_capacity(code.len());
    let mut starts = Vec::with_capacity(code.len() / 2);
    let mut reader = ByteReader::new(code);
    while reader.remaining() > 0 {
        let offset = reader.position();
        starts.push(offset);
        let insn = decode_one(&mut reader, offset)?;
        items.push(Item::Label(Label(offset as u32)));
        items.push(Item::Insn(insn));
    }
    items.push(Item::Label(Label(code.len() as u32)));

    for item in &items {
        if let Item::Insn(insn) = item {
            for target in branch_targets(insn) {
                let t = target.0 as usize;
                if starts.binary_search(&t).is_err() {
                    return Err(ClassFileError::BadBranchTarget {
                        offset: 0,
                        target: t as i64,
                    });
                }
            }
        }
    }
    Ok(items)
}

/// Decodes without labels, for inspection.
pub fn instructions(code: &[u8]) -> Result<Vec<(usize, Insn)>, ClassFileError> {
    let mut out = Vec::new();
    let mut reader = ByteReader::new(code);
    while reader.remaining() > 0 {
        let offset = reader.position();
        out.push((offset, decode_one(&mut reader, offset)?));
    }
    Ok(out)
}

pub fn branch_targets(insn: &Insn) -> Vec<Label> {
    match insn {
        Insn::Branch { target, .. } => vec![*target],
        Insn::TableSwitch {
            default, targets, ..
        } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
        Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
            .chain(pairs.iter().map(|(_, l)| *l))
            .collect(),
        _ => Vec::new(),
    }
}

fn target(offset: usize, delta: i64, code_len: usize) -> Result<Label, ClassFileError> {
    let t = offset as i64 + delta;
    if t < 0 || t >= code_len as i64 {
        return Err(ClassFileError::BadBranchTarget { offset, target: t });
    }
    Ok(Label(t as u32))
}

fn decode_one(reader: &mut ByteReader<'_>, offset: usize) -> Result<Insn, ClassFileError> {
    let code_len = reader.position() + reader.remaining();
    let opcode = reader.u8()?;
    let insn = match opcode {
        0x00..=0x0f | 0x2e..=0x35 | 0x4f..=0x83 | 0x85..=0x98 | 0xac..=0xb1 | 0xbe | 0xbf
        | 0xc2 | 0xc3 => Insn::Simple(opcode),
        BIPUSH => Insn::Bipush(reader.u8()? as i8),
        SIPUSH => Insn::Sipush(reader.u16()? as i16),
        LDC => Insn::Ldc(reader.u8()? as u16),
        LDC_W => Insn::Ldc(reader.u16()?),
        LDC2_W => Insn::Ldc2(reader.u16()?),
        0x15..=0x19 | 0x36..=0x3a | RET => Insn::Local {
            opcode,
            index: reader.u8()? as u16,
        },
        0x1a..=0x2d => Insn::Local {
            opcode: ILOAD + (opcode - 0x1a) / 4,
            index: ((opcode - 0x1a) % 4) as u16,
        },
        0x3b..=0x4e => Insn::Local {
            opcode: ISTORE + (opcode - 0x3b) / 4,
            index: ((opcode - 0x3b) % 4) as u16,
        },
        IINC => Insn::Iinc {
            index: reader.u8()? as u16,
            delta: reader.u8()? as i8 as i16,
        },
        0x99..=JSR | IFNULL | IFNONNULL => {
            let delta = reader.u16()? as i16 as i64;
            Insn::Branch {
                opcode,
                target: target(offset, delta, code_len)?,
            }
        }
        GOTO_W | JSR_W => {
            let delta = reader.u32()? as i32 as i64;
            Insn::Branch {
                opcode: if opcode == GOTO_W { GOTO } else { JSR },
                target: target(offset, delta, code_len)?,
            }
        }
        TABLESWITCH => {
            skip_padding(reader, offset)?;
            let default = target(offset, reader.u32()? as i32 as i64, code_len)?;
            let low = reader.u32()? as i32;
            let high = reader.u32()? as i32;
            if high < low {
                return Err(ClassFileError::BadBranchTarget {
                    offset,
                    target: high as i64,
                });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(target(offset, reader.u32()? as i32 as i64, code_len)?);
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            }
        }
        LOOKUPSWITCH => {
            skip_padding(reader, offset)?;
            let default = target(offset, reader.u32()? as i32 as i64, code_len)?;
            let count = reader.u32()? as usize;
            let mut pairs = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = reader.u32()? as i32;
                pairs.push((key, target(offset, reader.u32()? as i32 as i64, code_len)?));
            }
            Insn::LookupSwitch { default, pairs }
        }
        0xb2..=0xb8 | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Member {
            opcode,
            index: reader.u16()?,
        },
        INVOKEINTERFACE => {
            let index = reader.u16()?;
            let count = reader.u8()?;
            reader.u8()?;
            Insn::InvokeInterface { index, count }
        }
        INVOKEDYNAMIC => {
            let index = reader.u16()?;
            reader.u16()?;
            Insn::InvokeDynamic { index }
        }
        NEWARRAY => Insn::NewArray(reader.u8()?),
        MULTIANEWARRAY => Insn::MultiANewArray {
            index: reader.u16()?,
            dims: reader.u8()?,
        },
        WIDE => {
            let inner = reader.u8()?;
            match inner {
                IINC => Insn::Iinc {
                    index: reader.u16()?,
                    delta: reader.u16()? as i16,
                },
                0x15..=0x19 | 0x36..=0x3a | RET => Insn::Local {
                    opcode: inner,
                    index: reader.u16()?,
                },
                _ => {
                    return Err(ClassFileError::UnknownOpcode {
                        opcode: inner,
                        offset,
                    });
                }
            }
        }
        _ => return Err(ClassFileError::UnknownOpcode { opcode, offset }),
    };
    Ok(insn)
}

fn skip_padding(reader: &mut ByteReader<'_>, offset: usize) -> Result<(), ClassFileError> {
    reader.bytes(switch_padding(offset))?;
    Ok(())
}

fn switch_padding(offset: usize) -> usize {
    3 - (offset % 4)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("conditional branch at offset {0} cannot reach its target")]
    BranchOverflow(usize),
    #[error("code length {0} exceeds 65535")]
    CodeTooLarge(usize),
    #[error("label {0:?} is referenced but never placed")]
    UnknownLabel(Label),
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub labels: HashMap<Label, usize>,
}

impl Assembled {
    pub fn offset(&self, label: Label) -> Result<usize, AssembleError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(AssembleError::UnknownLabel(label))
    }
}

/// Lays out `items`, widening `goto`/`jsr` to their `_w` forms as needed,
/// and encodes them.
pub fn assemble(items: &[Item]) -> Result<Assembled, AssembleError> {
    let mut wide = vec![false; items.len()];
    loop {
        let (offsets, labels) = layout(items, &wide)?;
        let mut changed = false;
        for (i, item) in items.iter().enumerate() {
            if let Item::Insn(Insn::Branch { opcode, target }) = item {
                let to = *labels.get(target).ok_or(AssembleError::UnknownLabel(*target))?;
                let delta = to as i64 - offsets[i] as i64;
                if i16::try_from(delta).is_ok() {
                    continue;
                }
                if Insn::is_conditional_branch(*opcode) {
                    return Err(AssembleError::BranchOverflow(offsets[i]));
                }
                if !wide[i] {
                    wide[i] = true;
                    changed = true;
                }
            }
        }
        if changed {
            continue;
        }
        let total = offsets.last().copied().unwrap_or(0);
        if total > u16::MAX as usize {
            return Err(AssembleError::CodeTooLarge(total));
        }
        let mut code = Vec::with_capacity(total);
        for (i, item) in items.iter().enumerate() {
            if let Item::Insn(insn) = item {
                debug_assert_eq!(code.len(), offsets[i]);
                encode(insn, offsets[i], wide[i], &labels, &mut code)?;
            }
        }
        return Ok(Assembled { code, labels });
    }
}

/// `offsets[i]` is the offset of item `i`; the extra trailing element is the
/// total length.
fn layout(
    items: &[Item],
    wide: &[bool],
) -> Result<(Vec<usize>, HashMap<Label, usize>), AssembleError> {
    let mut offsets = Vec::with_capacity(items.len() + 1);
    let mut labels = HashMap::new();
    let mut pc = 0usize;
    for (i, item) in items.iter().enumerate() {
        offsets.push(pc);
        match item {
            Item::Label(label) => {
                labels.insert(*label, pc);
            }
            Item::Insn(insn) => pc += size(insn, pc, wide[i]),
        }
    }
    offsets.push(pc);
    Ok((offsets, labels))
}

fn size(insn: &Insn, pc: usize, wide: bool) -> usize {
    match insn {
        Insn::Simple(_) => 1,
        Insn::Local { opcode, index } => {
            if *index <= 3 && *opcode != RET {
                1
            } else if *index <= 255 {
                2
            } else {
                4
            }
        }
        Insn::Iinc { index, delta } => {
            if *index <= 255 && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Bipush(_) | Insn::NewArray(_) => 2,
        Insn::Sipush(_) | Insn::Ldc2(_) | Insn::Member { .. } => 3,
        Insn::Ldc(index) => {
            if *index <= 255 {
                2
            } else {
                3
            }
        }
        Insn::Branch { .. } => {
            if wide {
                5
            } else {
                3
            }
        }
        Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
        Insn::MultiANewArray { .. } => 4,
        Insn::TableSwitch { targets, .. } => 1 + switch_padding(pc) + 12 + 4 * targets.len(),
        Insn::LookupSwitch { pairs, .. } => 1 + switch_padding(pc) + 8 + 8 * pairs.len(),
    }
}

fn encode(
    insn: &Insn,
    pc: usize,
    wide: bool,
    labels: &HashMap<Label, usize>,
    out: &mut Vec<u8>,
) -> Result<(), AssembleError> {
    let rel = |label: &Label| -> Result<i32, AssembleError> {
        let to = labels.get(label).ok_or(AssembleError::UnknownLabel(*label))?;
        Ok((*to as i64 - pc as i64) as i32)
    };
    match insn {
        Insn::Simple(op) => out.push(*op),
        Insn::Local { opcode, index } => {
            if *index <= 3 && *opcode != RET {
                let short = if *opcode >= ISTORE {
                    0x3b + (*opcode - ISTORE) * 4
                } else {
                    0x1a + (*opcode - ILOAD) * 4
                };
                out.push(short + *index as u8);
            } else if *index <= 255 {
                out.push(*opcode);
                out.push(*index as u8);
            } else {
                out.push(WIDE);
                out.push(*opcode);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        Insn::Iinc { index, delta } => {
            if *index <= 255 && i8::try_from(*delta).is_ok() {
                out.push(IINC);
                out.push(*index as u8);
                out.push(*delta as i8 as u8);
            } else {
                out.push(WIDE);
                out.push(IINC);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Insn::Bipush(v) => {
            out.push(BIPUSH);
            out.push(*v as u8);
        }
        Insn::Sipush(v) => {
            out.push(SIPUSH);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Insn::Ldc(index) => {
            if *index <= 255 {
                out.push(LDC);
                out.push(*index as u8);
            } else {
                out.push(LDC_W);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        Insn::Ldc2(index) => {
            out.push(LDC2_W);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Insn::Branch { opcode, target } => {
            let delta = rel(target)?;
            if wide {
                out.push(if *opcode == JSR { JSR_W } else { GOTO_W });
                out.extend_from_slice(&delta.to_be_bytes());
            } else {
                out.push(*opcode);
                out.extend_from_slice(&(delta as i16).to_be_bytes());
            }
        }
        Insn::Member { opcode, index } => {
            out.push(*opcode);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Insn::InvokeInterface { index, count } => {
            out.push(INVOKEINTERFACE);
            out.extend_from_slice(&index.to_be_bytes());
            out.push(*count);
            out.push(0);
        }
        Insn::InvokeDynamic { index } => {
            out.push(INVOKEDYNAMIC);
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
        }
        Insn::NewArray(atype) => {
            out.push(NEWARRAY);
            out.push(*atype);
        }
        Insn::MultiANewArray { index, dims } => {
            out.push(MULTIANEWARRAY);
            out.extend_from_slice(&index.to_be_bytes());
            out.push(*dims);
        }
        Insn::TableSwitch {
            default,
            low,
            targets,
        } => {
            out.push(TABLESWITCH);
            out.extend(std::iter::repeat_n(0u8, switch_padding(pc)));
            out.extend_from_slice(&rel(default)?.to_be_bytes());
            out.extend_from_slice(&low.to_be_bytes());
            let high = *low + targets.len() as i32 - 1;
            out.extend_from_slice(&high.to_be_bytes());
            for t in targets {
                out.extend_from_slice(&rel(t)?.to_be_bytes());
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            out.push(LOOKUPSWITCH);
            out.extend(std::iter::repeat_n(0u8, switch_padding(pc)));
            out.extend_from_slice(&rel(default)?.to_be_bytes());
            out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
            for (key, t) in pairs {
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&rel(t)?.to_be_bytes());
            }
        }
    }
    Ok(())
}
