use super::CodeGenerator;
use crate::jvm::class_file::{
    BytecodeArray, BytecodeIndex, ClassConstants, Code, ExceptionHandler, LineNumber,
    LineNumberTable, LocalVariable, LocalVariableTable, StackMapFrame, StackMapTable,
};
use crate::jvm::{CodeOptions, Error, Name};

/// Finished method body, with everything resolved to offsets and constant pool indices
#[derive(Debug)]
pub struct MethodCode {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub exception_table: Vec<ExceptionHandler>,

    /// Empty unless [`CodeOptions::STACK_MAP_FRAMES`] was set
    pub stack_map_frames: Vec<StackMapFrame>,

    pub line_numbers: Vec<LineNumber>,
    pub local_variables: Vec<LocalVariable>,

    /// Some 16-bit branch offset didn't fit, so the code is wrong
    ///
    /// The method should be generated again with [`CodeOptions::WIDE_GOTO`].
    pub branch_overflow: bool,
}

impl MethodCode {
    /// Build the `Code` attribute, with the tables as nested attributes (when not empty)
    pub fn into_code_attribute<C: ClassConstants>(self, constants: &mut C) -> Result<Code, Error> {
        let mut attributes = vec![];
        if !self.stack_map_frames.is_empty() {
            attributes.push(constants.attribute(StackMapTable(self.stack_map_frames))?);
        }
        if !self.line_numbers.is_empty() {
            attributes.push(constants.attribute(LineNumberTable(self.line_numbers))?);
        }
        if !self.local_variables.is_empty() {
            attributes.push(constants.attribute(LocalVariableTable(self.local_variables))?);
        }

        Ok(Code {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code_array: BytecodeArray(self.code),
            exception_table: self.exception_table,
            attributes,
        })
    }
}

impl<'g> CodeGenerator<'g> {
    /// Resolve the method body
    ///
    /// Every jump target, exception handler, and local variable scope end must have been placed,
    /// and every monitor exited. With [`CodeOptions::STACK_MAP_FRAMES`], this is also where
    /// frames are computed and unreachable code gets replaced.
    pub fn finish<C: ClassConstants>(mut self, constants: &mut C) -> Result<MethodCode, Error> {
        if !self.monitors.is_empty() {
            return Err(Error::OpenMonitors {
                method: self.method.clone(),
                count: self.monitors.len(),
            });
        }
        if let Some(label) = self.labels.first_unplaced_use() {
            return Err(Error::UnplacedLabel {
                method: self.method.clone(),
                label,
            });
        }
        for exception in &self.exceptions {
            self.address_of(exception.handler)?;
        }
        for variable in &self.local_variables {
            self.address_of(variable.scope_end)?;
        }

        let length = self.bytes.pos();
        if length == 0 || length > u16::MAX as usize {
            return Err(Error::MethodCodeOverflow {
                method: self.method.clone(),
                length,
            });
        }

        let reachable = self.reachable;
        let last_block = self.current_block();
        last_block.end = length;
        last_block.falls_through = reachable;
        let mut falls_off_end = reachable && !last_block.is_empty();

        // A label at the very end is fine, as long as nothing jumps there
        falls_off_end |= self
            .blocks
            .iter()
            .flat_map(|block| block.jumps.iter())
            .chain(self.exceptions.iter().map(|exception| &exception.handler))
            .any(|label| self.labels.address(*label) == Some(length));

        let mut max_stack = self.max_stack as usize;
        let mut stack_map_frames = vec![];
        if self.options.contains(CodeOptions::STACK_MAP_FRAMES) {
            let frames = self.compute_frames()?;
            max_stack = max_stack.max(frames.max_stack);

            let mut previous: Option<usize> = None;
            let mut previous_frame = &self.entry_frame;
            for (offset, frame) in &frames.frames {
                let offset_delta = previous.map_or(*offset, |prev| offset - prev - 1) as u16;
                let encoded = frame.stack_map_frame(offset_delta, previous_frame, constants)?;
                log::trace!("{}: frame at {} is {:?}", self.method, offset, encoded);
                stack_map_frames.push(encoded);
                previous = Some(*offset);
                previous_frame = frame;
            }
        } else if falls_off_end {
            return Err(Error::FallsOffEnd {
                method: self.method.clone(),
                offset: length,
            });
        }

        let max_stack = u16::try_from(max_stack).map_err(|_| Error::MaxStackOverflow {
            method: self.method.clone(),
            max_stack,
        })?;
        let max_locals = u16::try_from(self.max_locals).map_err(|_| Error::MaxLocalsOverflow {
            method: self.method.clone(),
            max_locals: self.max_locals,
        })?;

        let mut exception_table = vec![];
        for exception in &self.exceptions {
            let handler_pc = self.address_of(exception.handler)?;
            let catch_type = match &exception.catch_type {
                Some(name) => Some(constants.class_index(name.as_str())?),
                None => None,
            };
            exception_table.push(ExceptionHandler {
                start_pc: BytecodeIndex(exception.start_pc as u16),
                end_pc: BytecodeIndex(exception.end_pc as u16),
                handler_pc: BytecodeIndex(handler_pc as u16),
                catch_type,
            });
        }

        // Lines attached after the last instruction don't point at any code
        let line_numbers = self
            .line_numbers
            .iter()
            .filter(|(pc, _)| *pc < length)
            .map(|&(pc, line_number)| LineNumber {
                start_pc: BytecodeIndex(pc as u16),
                line_number,
            })
            .collect();

        let mut local_variables = vec![];
        for variable in &self.local_variables {
            let end_pc = self.address_of(variable.scope_end)?;
            local_variables.push(LocalVariable {
                start_pc: BytecodeIndex(variable.start_pc as u16),
                length: end_pc.saturating_sub(variable.start_pc) as u16,
                name_index: constants.utf8_index(variable.name.as_str())?,
                descriptor_index: constants.utf8_index(&variable.descriptor)?,
                index: variable.index,
            });
        }

        log::debug!(
            "{}: {} bytes of code, max stack {}, max locals {}, {} frames, {} handlers",
            self.method,
            length,
            max_stack,
            max_locals,
            stack_map_frames.len(),
            exception_table.len()
        );

        Ok(MethodCode {
            code: self.bytes.to_vec(),
            max_stack,
            max_locals,
            exception_table,
            stack_map_frames,
            line_numbers,
            local_variables,
            branch_overflow: self.branch_overflow,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ConstantIndex, ConstantsPool, VerificationTypeInfo};
    use crate::jvm::code::opcodes::*;
    use crate::jvm::code::OrdComparison;
    use crate::jvm::verifier::{TypeArenas, TypeLattice};
    use crate::jvm::BinaryName;

    #[test]
    fn clamp() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.clamp(I)I", CodeOptions::default());
        let x = code.allocate_parameter(lattice.integer());

        let positive = code.new_label();
        code.load(lattice.integer(), x).unwrap();
        code.emit_if(OrdComparison::GE, positive).unwrap();
        code.iconst(0).unwrap();
        code.store(lattice.integer(), x).unwrap();
        code.place(positive).unwrap();
        code.load(lattice.integer(), x).unwrap();
        code.return_value(Some(lattice.integer())).unwrap();

        let mut constants = ConstantsPool::new();
        let method_code = code.finish(&mut constants).unwrap();
        assert_eq!(
            method_code.code,
            vec![ILOAD_0, IFGE, 0, 5, ICONST_0, ISTORE_0, ILOAD_0, IRETURN]
        );
        assert_eq!(method_code.max_stack, 1);
        assert_eq!(method_code.max_locals, 1);
        assert_eq!(
            method_code.stack_map_frames,
            vec![StackMapFrame::SameLocalsNoStack { offset_delta: 6 }]
        );
        assert!(!method_code.branch_overflow);
    }

    #[test]
    fn loop_frames() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.count()V", CodeOptions::default());

        // for (int i = 0; i < 10; i++) {}
        let i = code.new_local(lattice.integer());
        let condition = code.new_label();
        let body = code.new_label();
        code.iconst(0).unwrap();
        code.store(lattice.integer(), i).unwrap();
        code.emit_goto(condition).unwrap();
        code.place(body).unwrap();
        code.iinc(i, 1).unwrap();
        code.place(condition).unwrap();
        code.load(lattice.integer(), i).unwrap();
        code.iconst(10).unwrap();
        code.emit_if_icmp(OrdComparison::LT, body).unwrap();
        code.return_value(None).unwrap();

        let mut constants = ConstantsPool::new();
        let method_code = code.finish(&mut constants).unwrap();

        // 0: iconst_0, istore_0, goto 8
        // 5: iinc 0 1
        // 8: iload_0, bipush 10, if_icmplt 5
        // 14: return
        assert_eq!(method_code.code.len(), 15);
        assert_eq!(
            method_code.stack_map_frames,
            vec![
                StackMapFrame::AppendLocalsNoStack {
                    offset_delta: 5,
                    locals: vec![VerificationTypeInfo::Integer],
                },
                StackMapFrame::SameLocalsNoStack { offset_delta: 2 },
            ]
        );
        assert_eq!(method_code.max_stack, 2);
    }

    #[test]
    fn handler_frames() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.safe()I", CodeOptions::default());

        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        let exception = BinaryName::from_string(String::from("java/lang/RuntimeException"))
            .unwrap();

        code.place(start).unwrap();
        code.invoke(
            InvokeType::Static,
            ConstantIndex(3),
            &[],
            Some(lattice.integer()),
        )
        .unwrap();
        code.place(end).unwrap();
        code.return_value(Some(lattice.integer())).unwrap();
        code.place_handler(handler).unwrap();
        code.pop(lattice.object()).unwrap();
        code.iconst(-1).unwrap();
        code.return_value(Some(lattice.integer())).unwrap();
        code.add_exception(start, end, handler, Some(exception)).unwrap();

        let mut constants = ConstantsPool::new();
        let method_code = code.finish(&mut constants).unwrap();
        let runtime_exception = constants.class_index("java/lang/RuntimeException").unwrap();

        assert_eq!(
            method_code.exception_table,
            vec![ExceptionHandler {
                start_pc: BytecodeIndex(0),
                end_pc: BytecodeIndex(3),
                handler_pc: BytecodeIndex(4),
                catch_type: Some(runtime_exception),
            }]
        );
        assert_eq!(
            method_code.stack_map_frames,
            vec![StackMapFrame::SameLocalsOneStack {
                offset_delta: 4,
                stack: VerificationTypeInfo::Object(runtime_exception),
            }]
        );
    }

    #[test]
    fn dead_code_is_replaced() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.dead()V", CodeOptions::default());

        let dead = code.new_label();
        code.return_value(None).unwrap();
        code.place(dead).unwrap();
        code.iconst(1).unwrap();
        code.pop(lattice.integer()).unwrap();
        code.return_value(None).unwrap();

        let mut constants = ConstantsPool::new();
        let method_code = code.finish(&mut constants).unwrap();
        assert_eq!(method_code.code, vec![RETURN, NOP, NOP, ATHROW]);
        assert_eq!(method_code.max_stack, 1);

        let throwable = constants.class_index("java/lang/Throwable").unwrap();
        assert_eq!(
            method_code.stack_map_frames,
            vec![StackMapFrame::SameLocalsOneStack {
                offset_delta: 1,
                stack: VerificationTypeInfo::Object(throwable),
            }]
        );
    }

    #[test]
    fn finish_errors() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut constants = ConstantsPool::new();

        let code = CodeGenerator::new(&lattice, "Test.empty()V", CodeOptions::default());
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::MethodCodeOverflow { length: 0, .. })
        ));

        let mut code = CodeGenerator::new(&lattice, "Test.falls()V", CodeOptions::default());
        code.emit(NOP).unwrap();
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::FallsOffEnd { offset: 1, .. })
        ));

        let mut code = CodeGenerator::new(&lattice, "Test.falls()V", CodeOptions::empty());
        code.emit(NOP).unwrap();
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::FallsOffEnd { offset: 1, .. })
        ));

        let mut code = CodeGenerator::new(&lattice, "Test.jumps(I)V", CodeOptions::empty());
        let flag = code.allocate_parameter(lattice.integer());
        let end = code.new_label();
        code.load(lattice.integer(), flag).unwrap();
        code.emit_if(OrdComparison::EQ, end).unwrap();
        code.return_value(None).unwrap();
        code.place(end).unwrap();
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::FallsOffEnd { offset: 5, .. })
        ));

        let mut code = CodeGenerator::new(&lattice, "Test.unplaced()V", CodeOptions::default());
        let nowhere = code.new_label();
        code.emit_goto(nowhere).unwrap();
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::UnplacedLabel { .. })
        ));

        let mut code = CodeGenerator::new(&lattice, "Test.locked()V", CodeOptions::default());
        code.aconst_null().unwrap();
        code.enter_monitor(lattice.object()).unwrap();
        code.return_value(None).unwrap();
        assert!(matches!(
            code.finish(&mut constants),
            Err(Error::OpenMonitors { count: 1, .. })
        ));
    }

    #[test]
    fn debug_tables() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.debug(J)V", CodeOptions::empty());
        let x = code.allocate_parameter(lattice.long());
        let end = code.new_label();

        code.add_line_number(10);
        code.add_local_variable("x".parse().unwrap(), "J", x, end)
            .unwrap();
        code.load(lattice.long(), x).unwrap();
        code.add_line_number(11);
        code.pop(lattice.long()).unwrap();
        code.return_value(None).unwrap();
        code.place(end).unwrap();
        code.add_line_number(12);

        let mut constants = ConstantsPool::new();
        let method_code = code.finish(&mut constants).unwrap();
        assert!(method_code.stack_map_frames.is_empty());
        assert_eq!(method_code.max_locals, 2);
        assert_eq!(
            method_code.line_numbers,
            vec![
                LineNumber {
                    start_pc: BytecodeIndex(0),
                    line_number: 10,
                },
                LineNumber {
                    start_pc: BytecodeIndex(1),
                    line_number: 11,
                },
            ]
        );
        assert_eq!(method_code.local_variables.len(), 1);
        assert_eq!(method_code.local_variables[0].length, 3);
        assert_eq!(
            method_code.local_variables[0].descriptor_index,
            constants.utf8_index("J").unwrap()
        );

        let code_attribute = method_code.into_code_attribute(&mut constants).unwrap();
        assert_eq!(code_attribute.attributes.len(), 2);
        assert_eq!(code_attribute.code_array.0, vec![LLOAD_0, POP2, RETURN]);
    }
}
