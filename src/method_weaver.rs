//! Splices advice calls into one method body.
//!
//! Layout of a woven method:
//!
//! ```text
//! prologue        before-handlers, travelers stored after the parameters
//! L0 .. Lend      original body, locals above the parameters shifted up;
//!                 every xreturn becomes: store value, return-handlers and
//!                 after-handlers in reverse advisor order, load, xreturn
//! H               catch-all: throw-handlers and after-handlers in reverse
//!                 order, then rethrow the original throwable
//! ```
//!
//! The catch-all covers the original body minus the inlined return-site
//! advice, so a failing return-handler is not reported a second time as a
//! throw.

use std::sync::Arc;

use crate::advice::{Advisor, Binding, HandlerShape};
use crate::classfile::code::{
    self, AASTORE, ACONST_NULL, ALOAD, ANEWARRAY, ASTORE, ATHROW, AssembleError, CHECKCAST, DUP,
    INVOKESTATIC, INVOKEVIRTUAL, IRETURN, Insn, Item, Label, POP, RETURN,
};
use crate::classfile::descriptor::{FieldType, MethodDescriptor};
use crate::classfile::frames::{self, Frame, VerificationType};
use crate::classfile::{
    ACC_ABSTRACT, ACC_BRIDGE, ACC_NATIVE, Attribute, ByteReader, CodeAttribute, ConstantPool,
    ExceptionEntry, MemberInfo, STACK_MAP_MAJOR_VERSION,
};
use crate::error::WeaveError;

pub const ON_BEFORE: &str = "onBefore";
pub const ON_RETURN: &str = "onReturn";
pub const ON_THROW: &str = "onThrow";
pub const ON_AFTER: &str = "onAfter";

/// Class-level facts the method weaver needs.
#[derive(Debug, Clone, Copy)]
pub struct ClassContext<'a> {
    /// Java name, pushed for `ClassName` bindings.
    pub class_name: &'a str,
    pub this_class: u16,
    pub owner_is_object: bool,
    pub major_version: u16,
    /// Internal name of the class that receives every handler call.
    pub bridge_class: &'a str,
}

/// Labels of the original code are its byte offsets, so fresh labels start
/// past the end of the original code.
struct Labels {
    next: u32,
}

impl Labels {
    fn fresh(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }
}

struct Plan<'a> {
    advisors: Vec<&'a Arc<Advisor>>,
    descriptor: MethodDescriptor,
    is_static: bool,
    first_local: u16,
    /// Traveler slot per advisor, `None` when the advisor has no traveler.
    traveler_slots: Vec<Option<u16>>,
    return_slot: Option<(u16, FieldType)>,
    shift: u16,
}

/// Weaves `advisors` into `method`. Returns `Ok(false)` when the method is
/// left untouched because it cannot or need not be woven.
pub fn weave_method(
    pool: &mut ConstantPool,
    method: &mut MemberInfo,
    advisors: &[Arc<Advisor>],
    class: &ClassContext<'_>,
) -> Result<bool, WeaveError> {
    let name = method.name(pool)?.to_string();
    let descriptor_text = method.descriptor(pool)?.to_string();
    if name == "<clinit>" || method.access_flags & (ACC_ABSTRACT | ACC_NATIVE | ACC_BRIDGE) != 0 {
        return Ok(false);
    }
    let Some(code_index) = method
        .attributes
        .iter()
        .position(|a| pool.utf8(a.name_index).is_ok_and(|n| n == "Code"))
    else {
        return Ok(false);
    };
    let is_constructor = name == "<init>";
    let advisors: Vec<&Arc<Advisor>> = advisors
        .iter()
        .filter(|a| !is_constructor || a.shape.before.is_none())
        .collect();
    if advisors.is_empty() {
        return Ok(false);
    }
    let method_label = format!("{}{}", name, descriptor_text);
    let code = CodeAttribute::parse(&method.attributes[code_index].info)?;
    let mut items = code::decode(&code.code)?;
    if items
        .iter()
        .any(|i| matches!(i, Item::Insn(insn) if insn.is_subroutine()))
    {
        return Err(WeaveError::Subroutines {
            method: method_label,
        });
    }

    let plan = plan_slots(advisors, &descriptor_text, method.is_static())?;
    let code_len = code.code.len() as u32;
    let mut labels = Labels { next: code_len + 1 };
    let mut emitter = Emitter {
        pool,
        class,
        plan: &plan,
        method_name: &name,
    };

    for item in &mut items {
        if let Item::Insn(insn) = item
            && let Some(index) = insn.local_index_mut()
            && *index >= plan.first_local
        {
            *index += plan.shift;
        }
    }

    let mut woven: Vec<Item> = Vec::with_capacity(items.len() + 32);
    if !is_constructor {
        emitter.prologue(&mut woven)?;
    }

    // (start, end) of each inlined return-site block, excluded from the
    // catch-all range.
    let mut return_sites: Vec<(Label, Label)> = Vec::new();
    for item in items {
        match item {
            Item::Insn(Insn::Simple(opcode)) if (IRETURN..=RETURN).contains(&opcode) => {
                let start = labels.fresh();
                let end = labels.fresh();
                woven.push(Item::Label(start));
                emitter.return_site(&mut woven, opcode)?;
                woven.push(Item::Label(end));
                return_sites.push((start, end));
            }
            other => woven.push(other),
        }
    }

    // a body of nothing but returns leaves every catch-all segment empty
    let body_can_throw = woven_body_has_code(&woven, &return_sites);
    let needs_handler = !is_constructor
        && body_can_throw
        && plan
            .advisors
            .iter()
            .any(|a| a.shape.on_throw.is_some() || a.shape.on_after.is_some());
    let throwable_slot = code.max_locals + plan.shift;
    let handler_label = labels.fresh();
    if needs_handler {
        woven.push(Item::Label(handler_label));
        emitter.handler(&mut woven, throwable_slot)?;
    }

    let assembled = code::assemble(&woven).map_err(|e| match e {
        AssembleError::BranchOverflow(_) => WeaveError::BranchOverflow {
            method: method_label.clone(),
        },
        AssembleError::CodeTooLarge(_) => WeaveError::CodeTooLarge {
            method: method_label.clone(),
        },
        AssembleError::UnknownLabel(label) => WeaveError::Unsupported {
            method: method_label.clone(),
            reason: format!("unplaced label {label:?}"),
        },
    })?;
    let offset = |label: Label| -> Result<u16, WeaveError> {
        assembled
            .offset(label)
            .map(|o| o as u16)
            .map_err(|_| WeaveError::Unsupported {
                method: method_label.clone(),
                reason: format!("no instruction at original offset {}", label.0),
            })
    };

    let mut exception_table = Vec::with_capacity(code.exception_table.len() + return_sites.len() + 1);
    for e in &code.exception_table {
        exception_table.push(ExceptionEntry {
            start_pc: offset(Label(e.start_pc as u32))?,
            end_pc: offset(Label(e.end_pc as u32))?,
            handler_pc: offset(Label(e.handler_pc as u32))?,
            catch_type: e.catch_type,
        });
    }
    if needs_handler {
        let handler_pc = offset(handler_label)?;
        let mut segment_start = offset(Label(0))?;
        let mut boundaries = Vec::with_capacity(return_sites.len() + 1);
        for (start, end) in &return_sites {
            boundaries.push((offset(*start)?, offset(*end)?));
        }
        boundaries.push((offset(Label(code_len))?, offset(Label(code_len))?));
        for (segment_end, next_start) in boundaries {
            if segment_start < segment_end {
                exception_table.push(ExceptionEntry {
                    start_pc: segment_start,
                    end_pc: segment_end,
                    handler_pc,
                    catch_type: 0,
                });
            }
            segment_start = next_start;
        }
    }

    let mut attributes = Vec::new();
    for attribute in &code.attributes {
        let attribute_name = emitter.pool.utf8(attribute.name_index)?.to_string();
        let rewritten = match attribute_name.as_str() {
            "LineNumberTable" => Some(remap_line_numbers(&attribute.info, &offset)?),
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                Some(remap_local_variables(&attribute.info, &offset, &plan)?)
            }
            // StackMapTable is rebuilt below; anything else no longer matches
            // the new offsets
            _ => None,
        };
        if let Some(info) = rewritten {
            attributes.push(Attribute {
                name_index: attribute.name_index,
                info,
            });
        }
    }

    if class.major_version >= STACK_MAP_MAJOR_VERSION {
        let original = code.attribute(emitter.pool, "StackMapTable").map(|a| a.info.clone());
        let frames = rebuild_frames(
            emitter.pool,
            class,
            &name,
            &plan,
            original.as_deref(),
            needs_handler.then_some(handler_label),
            &method_label,
        )?;
        if !frames.is_empty() {
            let info = frames::encode_full(&frames, |l| assembled.labels.get(&l).copied())
                .ok_or_else(|| WeaveError::Unsupported {
                    method: method_label.clone(),
                    reason: "stack map frames out of order after weaving".to_string(),
                })?;
            attributes.push(Attribute {
                name_index: emitter.pool.add_utf8("StackMapTable")?,
                info,
            });
        }
    }

    let extra_stack = 2 + 4 + plan
        .advisors
        .iter()
        .flat_map(|a| [&a.shape.before, &a.shape.on_return, &a.shape.on_throw, &a.shape.on_after])
        .flatten()
        .map(|s| s.bindings.len() as u16)
        .max()
        .unwrap_or(0);
    let rebuilt = CodeAttribute {
        max_stack: code.max_stack.saturating_add(extra_stack),
        max_locals: throwable_slot + u16::from(needs_handler),
        code: assembled.code,
        exception_table,
        attributes,
    };
    method.attributes[code_index].info = rebuilt.to_bytes();
    Ok(true)
}

fn woven_body_has_code(woven: &[Item], return_sites: &[(Label, Label)]) -> bool {
    let mut inside_site = false;
    let mut in_body = false;
    for item in woven {
        match item {
            Item::Label(Label(0)) => in_body = true,
            Item::Label(l) if return_sites.iter().any(|(start, _)| start == l) => inside_site = true,
            Item::Label(l) if return_sites.iter().any(|(_, end)| end == l) => inside_site = false,
            Item::Insn(_) if in_body && !inside_site => return true,
            _ => {}
        }
    }
    false
}

fn plan_slots<'a>(
    advisors: Vec<&'a Arc<Advisor>>,
    descriptor_text: &str,
    is_static: bool,
) -> Result<Plan<'a>, WeaveError> {
    let descriptor = MethodDescriptor::parse(descriptor_text)?;
    let first_local = u16::from(!is_static) + descriptor.parameter_slots();
    let mut next = first_local;
    let mut traveler_slots = Vec::with_capacity(advisors.len());
    for a in &advisors {
        if a.shape.has_traveler() {
            traveler_slots.push(Some(next));
            next += 1;
        } else {
            traveler_slots.push(None);
        }
    }
    let return_slot = match &descriptor.return_type {
        Some(ty) if advisors.iter().any(|a| a.shape.needs_return_value()) => {
            let slot = next;
            next += ty.slot_size();
            Some((slot, ty.clone()))
        }
        _ => None,
    };
    Ok(Plan {
        shift: next - first_local,
        advisors,
        descriptor,
        is_static,
        first_local,
        traveler_slots,
        return_slot,
    })
}

struct Emitter<'p, 'c> {
    pool: &'p mut ConstantPool,
    class: &'c ClassContext<'c>,
    plan: &'c Plan<'c>,
    method_name: &'c str,
}

impl Emitter<'_, '_> {
    fn prologue(&mut self, out: &mut Vec<Item>) -> Result<(), WeaveError> {
        for (i, advisor) in self.plan.advisors.iter().enumerate() {
            let Some(shape) = &advisor.shape.before else {
                continue;
            };
            self.bindings(out, i, shape, None)?;
            self.call(out, ON_BEFORE, shape)?;
            if shape.returns_value {
                match self.plan.traveler_slots[i] {
                    Some(slot) => out.push(local(ASTORE, slot)),
                    None => out.push(Item::Insn(Insn::Simple(POP))),
                }
            }
        }
        Ok(())
    }

    fn return_site(&mut self, out: &mut Vec<Item>, return_opcode: u8) -> Result<(), WeaveError> {
        if let Some((slot, ty)) = &self.plan.return_slot {
            out.push(local(ty.slot_kind().store_opcode(), *slot));
        }
        for (i, advisor) in self.plan.advisors.iter().enumerate().rev() {
            if let Some(shape) = &advisor.shape.on_return {
                self.bindings(out, i, shape, None)?;
                self.call(out, ON_RETURN, shape)?;
                if shape.returns_value {
                    self.store_replacement(out)?;
                }
            }
            if let Some(shape) = &advisor.shape.on_after {
                self.bindings(out, i, shape, None)?;
                self.call(out, ON_AFTER, shape)?;
            }
        }
        if let Some((slot, ty)) = &self.plan.return_slot {
            out.push(local(ty.slot_kind().load_opcode(), *slot));
        }
        out.push(Item::Insn(Insn::Simple(return_opcode)));
        Ok(())
    }

    fn handler(&mut self, out: &mut Vec<Item>, throwable_slot: u16) -> Result<(), WeaveError> {
        out.push(local(ASTORE, throwable_slot));
        for (i, advisor) in self.plan.advisors.iter().enumerate().rev() {
            if let Some(shape) = &advisor.shape.on_throw {
                self.bindings(out, i, shape, Some(throwable_slot))?;
                self.call(out, ON_THROW, shape)?;
            }
            if let Some(shape) = &advisor.shape.on_after {
                self.bindings(out, i, shape, Some(throwable_slot))?;
                self.call(out, ON_AFTER, shape)?;
            }
        }
        out.push(local(ALOAD, throwable_slot));
        out.push(Item::Insn(Insn::Simple(ATHROW)));
        Ok(())
    }

    fn call(&mut self, out: &mut Vec<Item>, handler: &str, shape: &HandlerShape) -> Result<(), WeaveError> {
        let index = self
            .pool
            .add_method_ref(self.class.bridge_class, handler, &shape.descriptor())?;
        out.push(Item::Insn(Insn::Member {
            opcode: INVOKESTATIC,
            index,
        }));
        Ok(())
    }

    /// A replacing return-handler leaves an `Object` on the stack; convert
    /// it back into the return slot. Void methods discard it.
    fn store_replacement(&mut self, out: &mut Vec<Item>) -> Result<(), WeaveError> {
        let Some((slot, ty)) = &self.plan.return_slot else {
            out.push(Item::Insn(Insn::Simple(POP)));
            return Ok(());
        };
        match ty.boxing() {
            Some(boxing) => {
                let class = self.pool.add_class(boxing.wrapper)?;
                out.push(Item::Insn(Insn::Member {
                    opcode: CHECKCAST,
                    index: class,
                }));
                let unbox = self.pool.add_method_ref(
                    boxing.wrapper,
                    boxing.unbox_method,
                    &boxing.unbox_descriptor,
                )?;
                out.push(Item::Insn(Insn::Member {
                    opcode: INVOKEVIRTUAL,
                    index: unbox,
                }));
            }
            None => {
                if let Some(name) = ty.class_constant_name()
                    && name != "java/lang/Object"
                {
                    let class = self.pool.add_class(&name)?;
                    out.push(Item::Insn(Insn::Member {
                        opcode: CHECKCAST,
                        index: class,
                    }));
                }
            }
        }
        out.push(local(ty.slot_kind().store_opcode(), *slot));
        Ok(())
    }

    fn bindings(
        &mut self,
        out: &mut Vec<Item>,
        advisor_index: usize,
        shape: &HandlerShape,
        throwable_slot: Option<u16>,
    ) -> Result<(), WeaveError> {
        for binding in &shape.bindings {
            match binding {
                Binding::AdvisorId => {
                    let id = self.plan.advisors[advisor_index].id as i32;
                    self.push_int(out, id)?;
                }
                Binding::Receiver => {
                    if self.plan.is_static {
                        out.push(Item::Insn(Insn::Simple(ACONST_NULL)));
                    } else {
                        out.push(local(ALOAD, 0));
                    }
                }
                Binding::MethodName => {
                    let index = self.pool.add_string(self.method_name)?;
                    out.push(Item::Insn(Insn::Ldc(index)));
                }
                Binding::ClassName => {
                    let index = self.pool.add_string(self.class.class_name)?;
                    out.push(Item::Insn(Insn::Ldc(index)));
                }
                Binding::MethodArgs => self.args_array(out)?,
                Binding::Traveler => match self.plan.traveler_slots[advisor_index] {
                    Some(slot) => out.push(local(ALOAD, slot)),
                    None => out.push(Item::Insn(Insn::Simple(ACONST_NULL))),
                },
                Binding::ReturnValue => match &self.plan.return_slot {
                    Some((slot, ty)) => {
                        let ty = ty.clone();
                        out.push(local(ty.slot_kind().load_opcode(), *slot));
                        self.box_value(out, &ty)?;
                    }
                    None => out.push(Item::Insn(Insn::Simple(ACONST_NULL))),
                },
                Binding::Throwable => match throwable_slot {
                    Some(slot) => out.push(local(ALOAD, slot)),
                    None => out.push(Item::Insn(Insn::Simple(ACONST_NULL))),
                },
            }
        }
        Ok(())
    }

    fn args_array(&mut self, out: &mut Vec<Item>) -> Result<(), WeaveError> {
        let parameters = self.plan.descriptor.parameters.clone();
        self.push_int(out, parameters.len() as i32)?;
        let object = self.pool.add_class("java/lang/Object")?;
        out.push(Item::Insn(Insn::Member {
            opcode: ANEWARRAY,
            index: object,
        }));
        let mut slot = u16::from(!self.plan.is_static);
        for (i, ty) in parameters.iter().enumerate() {
            out.push(Item::Insn(Insn::Simple(DUP)));
            self.push_int(out, i as i32)?;
            out.push(local(ty.slot_kind().load_opcode(), slot));
            self.box_value(out, ty)?;
            out.push(Item::Insn(Insn::Simple(AASTORE)));
            slot += ty.slot_size();
        }
        Ok(())
    }

    fn box_value(&mut self, out: &mut Vec<Item>, ty: &FieldType) -> Result<(), WeaveError> {
        if let Some(boxing) = ty.boxing() {
            let index = self
                .pool
                .add_method_ref(boxing.wrapper, "valueOf", &boxing.value_of_descriptor)?;
            out.push(Item::Insn(Insn::Member {
                opcode: INVOKESTATIC,
                index,
            }));
        }
        Ok(())
    }

    fn push_int(&mut self, out: &mut Vec<Item>, value: i32) -> Result<(), WeaveError> {
        let insn = match Insn::push_int(value) {
            Some(insn) => insn,
            None => Insn::Ldc(self.pool.add_integer(value)?),
        };
        out.push(Item::Insn(insn));
        Ok(())
    }
}

fn local(opcode: u8, index: u16) -> Item {
    Item::Insn(Insn::Local { opcode, index })
}

fn rebuild_frames(
    pool: &mut ConstantPool,
    class: &ClassContext<'_>,
    method_name: &str,
    plan: &Plan<'_>,
    original: Option<&[u8]>,
    handler: Option<Label>,
    method_label: &str,
) -> Result<Vec<Frame>, WeaveError> {
    let object = VerificationType::Object(pool.add_class("java/lang/Object")?);
    let travelers = plan.traveler_slots.iter().flatten().count();
    let mut inserted = vec![object.clone(); travelers];
    if let Some((_, ty)) = &plan.return_slot {
        inserted.extend(std::iter::repeat_n(VerificationType::Top, ty.slot_size() as usize));
    }

    let mut frames = match original {
        Some(info) => {
            let initial = frames::initial_locals(
                pool,
                class.this_class,
                method_name,
                &plan.descriptor,
                plan.is_static,
                class.owner_is_object,
            )?;
            frames::decode(info, &initial)?
        }
        None => Vec::new(),
    };
    if !inserted.is_empty() {
        for frame in &mut frames {
            frames::insert_locals(&mut frame.locals, plan.first_local, &inserted).map_err(|slot| {
                WeaveError::FrameSplit {
                    method: method_label.to_string(),
                    slot,
                }
            })?;
        }
    }
    if let Some(label) = handler {
        let mut locals = vec![VerificationType::Top; plan.first_local as usize];
        locals.extend(std::iter::repeat_n(object, travelers));
        let throwable = pool.add_class("java/lang/Throwable")?;
        frames.push(Frame {
            label,
            locals,
            stack: vec![VerificationType::Object(throwable)],
        });
    }
    Ok(frames)
}

fn remap_line_numbers(
    info: &[u8],
    offset: &impl Fn(Label) -> Result<u16, WeaveError>,
) -> Result<Vec<u8>, WeaveError> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.extend_from_slice(&count.to_be_bytes());
    for _ in 0..count {
        let start = reader.u16()?;
        let line = reader.u16()?;
        out.extend_from_slice(&offset(Label(start as u32))?.to_be_bytes());
        out.extend_from_slice(&line.to_be_bytes());
    }
    Ok(out)
}

fn remap_local_variables(
    info: &[u8],
    offset: &impl Fn(Label) -> Result<u16, WeaveError>,
    plan: &Plan<'_>,
) -> Result<Vec<u8>, WeaveError> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.extend_from_slice(&count.to_be_bytes());
    for _ in 0..count {
        let start = reader.u16()?;
        let length = reader.u16()?;
        let name = reader.u16()?;
        let descriptor = reader.u16()?;
        let index = reader.u16()?;
        let new_start = offset(Label(start as u32))?;
        let new_end = offset(Label(start as u32 + length as u32))?;
        let index = if index >= plan.first_local {
            index + plan.shift
        } else {
            index
        };
        out.extend_from_slice(&new_start.to_be_bytes());
        out.extend_from_slice(&(new_end - new_start).to_be_bytes());
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&descriptor.to_be_bytes());
        out.extend_from_slice(&index.to_be_bytes());
    }
    Ok(out)
}
