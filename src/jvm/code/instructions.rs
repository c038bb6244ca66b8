//! Typed instruction helpers
//!
//! These emit an instruction and also log its effect on the types of the stack and locals.

use super::opcodes::*;
use super::{CodeGenerator, EqComparison, InvokeType, Label, OrdComparison};
use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex};
use crate::jvm::verifier::{TypeKind, VType};
use crate::jvm::{Error, FrameErrorKind};

/// Opcodes for accessing a local of some type: the first of the short forms (`iload_0`) and the
/// normal form (`iload`)
fn load_opcodes(verification_type: VType<'_>) -> Option<(u8, u8)> {
    match verification_type.kind() {
        TypeKind::Top => None,
        TypeKind::Integer => Some((ILOAD_0, ILOAD)),
        TypeKind::Float => Some((FLOAD_0, FLOAD)),
        TypeKind::Long => Some((LLOAD_0, LLOAD)),
        TypeKind::Double => Some((DLOAD_0, DLOAD)),
        _ => Some((ALOAD_0, ALOAD)),
    }
}

impl<'g> CodeGenerator<'g> {
    fn invalid_local(&self, index: usize) -> Error {
        Error::Verifier {
            method: self.method.clone(),
            offset: self.bytes.pos(),
            kind: FrameErrorKind::InvalidIndex(index),
        }
    }

    /// Load and store instructions follow the same pattern:
    ///
    ///   - short form (0-3) have special bytes
    ///   - normal form (0-255) use `iload` plus a byte operand
    ///   - wide form (256-65535) use `wide iload` plus two byte operands
    fn emit_local_access(
        &mut self,
        short_form_start: u8,
        normal_form: u8,
        index: usize,
        change: i32,
    ) -> Result<(), Error> {
        let wide_index = u16::try_from(index).map_err(|_| Error::LocalIndexOverflow {
            method: self.method.clone(),
            offset: self.bytes.pos(),
            index,
        })?;
        self.change_stack_depth(change)?;
        match u8::try_from(wide_index) {
            Ok(n @ 0..=3) => self.bytes.add_u1(short_form_start + n),
            Ok(n) => {
                self.bytes.add_u1(normal_form);
                self.bytes.add_u1(n);
            }
            Err(_) => {
                self.bytes.add_u1(WIDE);
                self.bytes.add_u1(normal_form);
                self.bytes.add_u2(wide_index);
            }
        }
        Ok(())
    }

    /// Push a local onto the stack
    pub fn load(&mut self, verification_type: VType<'g>, index: usize) -> Result<(), Error> {
        let (short_form, normal_form) =
            load_opcodes(verification_type).ok_or_else(|| self.invalid_local(index))?;
        let size = verification_type.size();
        self.emit_local_access(short_form, normal_form, index, size as i32)?;
        self.max_locals = self.max_locals.max(index + size);
        self.current_block().push(verification_type);
        Ok(())
    }

    /// Pop the top of the stack into a local
    pub fn store(&mut self, verification_type: VType<'g>, index: usize) -> Result<(), Error> {
        let (short_form, normal_form) =
            load_opcodes(verification_type).ok_or_else(|| self.invalid_local(index))?;
        let size = verification_type.size();
        self.emit_local_access(
            short_form + (ISTORE_0 - ILOAD_0),
            normal_form + (ISTORE - ILOAD),
            index,
            -(size as i32),
        )?;
        self.max_locals = self.max_locals.max(index + size);
        self.current_block().store(index, verification_type);
        Ok(())
    }

    /// Increment an `int` local
    pub fn iinc(&mut self, index: usize, delta: i16) -> Result<(), Error> {
        let wide_index = u16::try_from(index).map_err(|_| Error::LocalIndexOverflow {
            method: self.method.clone(),
            offset: self.bytes.pos(),
            index,
        })?;
        match (u8::try_from(wide_index), i8::try_from(delta)) {
            (Ok(n), Ok(d)) => {
                self.bytes.add_u1(IINC);
                self.bytes.add_u1(n);
                self.bytes.add_u1(d as u8);
            }
            _ => {
                self.bytes.add_u1(WIDE);
                self.bytes.add_u1(IINC);
                self.bytes.add_u2(wide_index);
                self.bytes.add_u2(delta as u16);
            }
        }
        self.max_locals = self.max_locals.max(index + 1);
        Ok(())
    }

    /// Duplicate the value on top of the stack (`dup` or `dup2`)
    pub fn dup(&mut self, verification_type: VType<'g>) -> Result<(), Error> {
        let opcode = if verification_type.is_two_word() { DUP2 } else { DUP };
        self.emit(opcode)?;
        self.current_block().dup();
        Ok(())
    }

    /// Duplicate the top value and put it under the value below (`dup_x1` or `dup2_x1`)
    pub fn dup_x1(&mut self, verification_type: VType<'g>) -> Result<(), Error> {
        let opcode = if verification_type.is_two_word() {
            DUP2_X1
        } else {
            DUP_X1
        };
        self.emit(opcode)?;
        self.current_block().dup_x1();
        Ok(())
    }

    /// Duplicate the top value and put it two words down (`dup_x2` or `dup2_x2`)
    pub fn dup_x2(&mut self, verification_type: VType<'g>) -> Result<(), Error> {
        let opcode = if verification_type.is_two_word() {
            DUP2_X2
        } else {
            DUP_X2
        };
        self.emit(opcode)?;
        self.current_block().dup_x2();
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), Error> {
        self.emit(SWAP)?;
        self.current_block().swap();
        Ok(())
    }

    /// Discard the value on top of the stack (`pop` or `pop2`)
    pub fn pop(&mut self, verification_type: VType<'g>) -> Result<(), Error> {
        let opcode = if verification_type.is_two_word() { POP2 } else { POP };
        self.emit(opcode)?;
        self.current_block().pop();
        Ok(())
    }

    /// Push an `int` constant, using the shortest instruction for it
    pub fn iconst(&mut self, value: i16) -> Result<(), Error> {
        match value {
            -1..=5 => self.emit(ICONST_0.wrapping_add(value as u8))?,
            _ => match i8::try_from(value) {
                Ok(byte) => {
                    self.emit(BIPUSH)?;
                    self.bytes.add_u1(byte as u8);
                }
                Err(_) => {
                    self.emit(SIPUSH)?;
                    self.bytes.add_u2(value as u16);
                }
            },
        }
        let integer = self.lattice.integer();
        self.current_block().push(integer);
        Ok(())
    }

    pub fn aconst_null(&mut self) -> Result<(), Error> {
        self.emit(ACONST_NULL)?;
        let null = self.lattice.null();
        self.current_block().push(null);
        Ok(())
    }

    /// Push a narrow constant from the constant pool (`ldc` or `ldc_w`)
    pub fn ldc(&mut self, index: ConstantIndex, verification_type: VType<'g>) -> Result<(), Error> {
        match u8::try_from(index.0) {
            Ok(byte) => {
                self.emit(LDC)?;
                self.bytes.add_u1(byte);
            }
            Err(_) => {
                self.emit(LDC_W)?;
                self.bytes.add_u2(index.0);
            }
        }
        self.current_block().push(verification_type);
        Ok(())
    }

    /// Push a `long` or `double` constant from the constant pool
    pub fn ldc2_w(
        &mut self,
        index: ConstantIndex,
        verification_type: VType<'g>,
    ) -> Result<(), Error> {
        self.emit(LDC2_W)?;
        self.bytes.add_u2(index.0);
        self.current_block().push(verification_type);
        Ok(())
    }

    /// Allocate an object, pushing its uninitialized type
    ///
    /// The constructor must be called with [`CodeGenerator::invoke_constructor`].
    pub fn new_object(&mut self, class: ClassConstantIndex) -> Result<VType<'g>, Error> {
        let offset = u16::try_from(self.bytes.pos()).map_err(|_| Error::MethodCodeOverflow {
            method: self.method.clone(),
            length: self.bytes.pos(),
        })?;
        self.emit(NEW)?;
        self.bytes.add_u2((class.0).0);
        let uninitialized = self.lattice.uninitialized(offset);
        self.current_block().push(uninitialized);
        Ok(uninitialized)
    }

    /// Cast the reference on top of the stack
    pub fn checkcast(
        &mut self,
        class: ClassConstantIndex,
        verification_type: VType<'g>,
    ) -> Result<(), Error> {
        self.emit(CHECKCAST)?;
        self.bytes.add_u2((class.0).0);
        let block = self.current_block();
        block.pop();
        block.push(verification_type);
        Ok(())
    }

    pub fn instanceof(&mut self, class: ClassConstantIndex) -> Result<(), Error> {
        self.emit(INSTANCEOF)?;
        self.bytes.add_u2((class.0).0);
        let integer = self.lattice.integer();
        let block = self.current_block();
        block.pop();
        block.push(integer);
        Ok(())
    }

    /// Emit a field access
    fn field_access(
        &mut self,
        opcode: u8,
        field: ConstantIndex,
        popped: usize,
        change: i32,
        pushed: Option<VType<'g>>,
    ) -> Result<(), Error> {
        self.emit_with_stack_change(opcode, change)?;
        self.bytes.add_u2(field.0);
        let block = self.current_block();
        block.pop_n(popped);
        if let Some(pushed) = pushed {
            block.push(pushed);
        }
        Ok(())
    }

    pub fn get_field(&mut self, field: ConstantIndex, field_type: VType<'g>) -> Result<(), Error> {
        let size = field_type.size() as i32;
        self.field_access(GETFIELD, field, 1, size - 1, Some(field_type))
    }

    pub fn put_field(&mut self, field: ConstantIndex, field_type: VType<'g>) -> Result<(), Error> {
        let size = field_type.size() as i32;
        self.field_access(PUTFIELD, field, 2, -size - 1, None)
    }

    pub fn get_static(&mut self, field: ConstantIndex, field_type: VType<'g>) -> Result<(), Error> {
        let size = field_type.size() as i32;
        self.field_access(GETSTATIC, field, 0, size, Some(field_type))
    }

    pub fn put_static(&mut self, field: ConstantIndex, field_type: VType<'g>) -> Result<(), Error> {
        let size = field_type.size() as i32;
        self.field_access(PUTSTATIC, field, 1, -size, None)
    }

    /// Emit a method call
    ///
    /// `arguments` don't include the receiver, which is popped for everything but static calls.
    pub fn invoke(
        &mut self,
        invoke_type: InvokeType,
        method: ConstantIndex,
        arguments: &[VType<'g>],
        return_type: Option<VType<'g>>,
    ) -> Result<(), Error> {
        let receiver = usize::from(invoke_type != InvokeType::Static);
        let argument_words: usize = arguments.iter().map(|arg| arg.size()).sum();
        let returned_words = return_type.map_or(0, |ret| ret.size());
        let change = returned_words as i32 - (argument_words + receiver) as i32;

        self.emit_with_stack_change(invoke_type.opcode(), change)?;
        self.bytes.add_u2(method.0);
        if let InvokeType::Interface(count) = invoke_type {
            self.bytes.add_u1(count);
            self.bytes.add_u1(0);
        }

        let block = self.current_block();
        block.pop_n(arguments.len() + receiver);
        if let Some(return_type) = return_type {
            block.push(return_type);
        }
        Ok(())
    }

    /// Call a constructor (`invokespecial` of `<init>`) on an uninitialized object
    ///
    /// Every copy of the uninitialized object (on the stack or in locals) becomes initialized.
    pub fn invoke_constructor(
        &mut self,
        method: ConstantIndex,
        arguments: &[VType<'g>],
        uninitialized: VType<'g>,
        initialized: VType<'g>,
    ) -> Result<(), Error> {
        self.invoke(InvokeType::Special, method, arguments, None)?;
        self.current_block()
            .initialize(uninitialized, initialized);
        Ok(())
    }

    /// Return from the method, with a value or not
    pub fn return_value(&mut self, return_type: Option<VType<'g>>) -> Result<(), Error> {
        let opcode = match return_type.map(|ret| ret.kind()) {
            None => RETURN,
            Some(TypeKind::Integer) => IRETURN,
            Some(TypeKind::Float) => FRETURN,
            Some(TypeKind::Long) => LRETURN,
            Some(TypeKind::Double) => DRETURN,
            Some(TypeKind::Top) => return Err(self.invalid_local(0)),
            Some(_) => ARETURN,
        };
        if return_type.is_some() {
            self.current_block().pop();
        }
        self.emit(opcode)
    }

    /// Throw the exception on top of the stack
    pub fn athrow(&mut self) -> Result<(), Error> {
        self.current_block().pop();
        self.emit(ATHROW)
    }

    /// Branch if the `int` on top of the stack compares to zero
    pub fn emit_if(&mut self, comparison: OrdComparison, label: Label) -> Result<(), Error> {
        self.current_block().pop();
        self.emit_branch(comparison.if_opcode(), label)
    }

    /// Branch if the two `int`s on top of the stack compare
    pub fn emit_if_icmp(&mut self, comparison: OrdComparison, label: Label) -> Result<(), Error> {
        self.current_block().pop_n(2);
        self.emit_branch(comparison.if_icmp_opcode(), label)
    }

    /// Branch if the two references on top of the stack are (not) the same
    pub fn emit_if_acmp(&mut self, comparison: EqComparison, label: Label) -> Result<(), Error> {
        self.current_block().pop_n(2);
        self.emit_branch(comparison.if_acmp_opcode(), label)
    }

    /// Branch if the reference on top of the stack is (not) null
    pub fn emit_if_null(&mut self, comparison: EqComparison, label: Label) -> Result<(), Error> {
        self.current_block().pop();
        self.emit_branch(comparison.if_null_opcode(), label)
    }

    /// Pad the code with zeros so that the next byte is 4-byte aligned
    fn align_switch(&mut self) {
        while self.bytes.pos() % 4 != 0 {
            self.bytes.add_u1(0);
        }
    }

    /// Jump to `targets[n - low]` for the `int` `n` on top of the stack (or to `default`)
    pub fn tableswitch(&mut self, low: i32, targets: &[Label], default: Label) -> Result<(), Error> {
        let instruction = self.bytes.pos();
        self.current_block().pop();
        self.write_opcode(TABLESWITCH, -1)?;
        self.align_switch();

        let high = low.wrapping_add(targets.len() as i32).wrapping_sub(1);
        self.label_operand(default, instruction, true);
        self.bytes.add_u4(low as u32);
        self.bytes.add_u4(high as u32);
        for target in targets {
            self.label_operand(*target, instruction, true);
        }

        let block = self.current_block();
        block.jumps.push(default);
        block.jumps.extend_from_slice(targets);
        self.end_block(false);
        Ok(())
    }

    /// Jump to the label matching the `int` on top of the stack (or to `default`)
    pub fn lookupswitch(&mut self, cases: &[(i32, Label)], default: Label) -> Result<(), Error> {
        let mut cases = cases.to_vec();
        cases.sort_by_key(|(key, _)| *key);

        let instruction = self.bytes.pos();
        self.current_block().pop();
        self.write_opcode(LOOKUPSWITCH, -1)?;
        self.align_switch();

        self.label_operand(default, instruction, true);
        self.bytes.add_u4(cases.len() as u32);
        for (key, target) in &cases {
            self.bytes.add_u4(*key as u32);
            self.label_operand(*target, instruction, true);
        }

        let block = self.current_block();
        block.jumps.push(default);
        block.jumps.extend(cases.iter().map(|(_, target)| *target));
        self.end_block(false);
        Ok(())
    }
}
