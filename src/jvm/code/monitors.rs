//! Exception ranges, synchronized regions, and debug tables

use super::opcodes::{MONITORENTER, MONITOREXIT};
use super::{CodeGenerator, ExceptionEntry, Label, Monitor, MonitorId, PendingLocalVariable};
use crate::jvm::verifier::VType;
use crate::jvm::{BinaryName, Error, UnqualifiedName};

impl<'g> CodeGenerator<'g> {
    /// Register an exception handler for the code between two placed labels
    ///
    /// `catch_type` of `None` catches everything. Empty ranges are silently dropped. The handler
    /// label can be placed later (with [`CodeGenerator::place_handler`]).
    pub fn add_exception(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<BinaryName>,
    ) -> Result<(), Error> {
        let start_pc = self.address_of(start)?;
        let end_pc = self.address_of(end)?;
        if start_pc >= end_pc {
            log::trace!(
                "{}: dropping empty exception range {:?}..{:?}",
                self.method,
                start,
                end
            );
            return Ok(());
        }
        self.exceptions.push(ExceptionEntry {
            start_pc,
            end_pc,
            handler,
            catch_type,
        });
        Ok(())
    }

    /// Place the label at which an exception handler starts
    ///
    /// On entry to a handler, the stack holds only the caught exception.
    pub fn place_handler(&mut self, label: Label) -> Result<(), Error> {
        self.place(label)?;
        self.stack_depth = 1;
        self.max_stack = self.max_stack.max(1);
        Ok(())
    }

    fn monitor_mut(&mut self, monitor: MonitorId) -> Result<&mut Monitor<'g>, Error> {
        let offset = self.bytes.pos();
        let method = &self.method;
        self.monitors
            .get_mut(monitor.0)
            .ok_or_else(|| Error::UnknownMonitor {
                method: method.clone(),
                offset,
                monitor,
            })
    }

    /// Enter a synchronized region, locking the reference on top of the stack
    ///
    /// The lock is kept in a fresh local so that it can be released on every path out of the
    /// region. The region is held from right after `monitorenter` until
    /// [`CodeGenerator::monitor_range_end`] or [`CodeGenerator::exit_monitor`].
    pub fn enter_monitor(&mut self, lock_type: VType<'g>) -> Result<MonitorId, Error> {
        let local = self.new_local(lock_type);
        self.dup(lock_type)?;
        self.store(lock_type, local)?;
        self.current_block().pop();
        self.emit(MONITORENTER)?;

        let monitor = MonitorId(self.monitors.len());
        self.monitors.push(Monitor {
            local,
            lock_type,
            ranges: vec![],
            open: None,
        });
        self.monitor_range_start(monitor)?;
        log::trace!("{}: entered {:?} at {}", self.method, monitor, self.bytes.pos());
        Ok(monitor)
    }

    /// Resume holding the monitor from the current position
    ///
    /// This starts a block, so that the handler releasing the monitor sees the lock local.
    pub fn monitor_range_start(&mut self, monitor: MonitorId) -> Result<(), Error> {
        self.monitor_mut(monitor)?;
        let label = self.new_label();
        self.place(label)?;
        let pos = self.bytes.pos();
        let monitor = self.monitor_mut(monitor)?;
        if monitor.open.is_none() {
            monitor.open = Some(pos);
        }
        Ok(())
    }

    /// Release the monitor before leaving the region early (eg. for a `return` or a `break`)
    ///
    /// The code that follows is not covered by the release handler until
    /// [`CodeGenerator::monitor_range_start`] is called again.
    pub fn monitor_range_end(&mut self, monitor: MonitorId) -> Result<(), Error> {
        let (local, lock_type) = {
            let monitor = self.monitor_mut(monitor)?;
            (monitor.local, monitor.lock_type)
        };
        self.load(lock_type, local)?;
        self.current_block().pop();
        self.emit(MONITOREXIT)?;

        let pos = self.bytes.pos();
        let monitor = self.monitor_mut(monitor)?;
        if let Some(start) = monitor.open.take() {
            monitor.ranges.push((start, pos));
        }
        Ok(())
    }

    /// Leave the innermost synchronized region
    ///
    /// If the end of the region is reachable, the monitor is released and control jumps past
    /// the release handler. The handler covers every range where the monitor was held: it
    /// releases the monitor and rethrows.
    pub fn exit_monitor(&mut self) -> Result<(), Error> {
        let Monitor {
            local,
            lock_type,
            mut ranges,
            open,
        } = self.monitors.pop().ok_or_else(|| Error::MonitorStackEmpty {
            method: self.method.clone(),
            offset: self.bytes.pos(),
        })?;

        let end = self.new_label();
        let handler = self.new_label();

        if self.reachable {
            self.load(lock_type, local)?;
            self.current_block().pop();
            self.emit(MONITOREXIT)?;
        }
        if let Some(start) = open {
            ranges.push((start, self.bytes.pos()));
        }
        if self.reachable {
            self.emit_goto(end)?;
        }

        // Adjacent ranges are merged, empty ones dropped
        let mut coalesced: Vec<(usize, usize)> = vec![];
        for (start, end) in ranges {
            if start >= end {
                continue;
            }
            match coalesced.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => coalesced.push((start, end)),
            }
        }

        self.place_handler(handler)?;
        self.load(lock_type, local)?;
        self.current_block().pop();
        self.emit(MONITOREXIT)?;
        self.athrow()?;

        for (start_pc, end_pc) in coalesced {
            self.exceptions.push(ExceptionEntry {
                start_pc,
                end_pc,
                handler,
                catch_type: None,
            });
        }
        self.place(end)?;
        Ok(())
    }

    /// Number of synchronized regions currently entered
    pub fn monitor_depth(&self) -> usize {
        self.monitors.len()
    }

    /// Map the current position to a source line
    ///
    /// Lines `0` and `0xFFFF` mean the line is unknown, and are ignored. Several lines at the
    /// same position keep only the last one.
    pub fn add_line_number(&mut self, line: u16) {
        if line == 0 || line == 0xFFFF {
            return;
        }
        let pos = self.bytes.pos();
        match self.line_numbers.last_mut() {
            Some(last) if last.0 == pos => last.1 = line,
            _ => self.line_numbers.push((pos, line)),
        }
    }

    /// Describe a local variable in scope from the current position to a label
    pub fn add_local_variable(
        &mut self,
        name: UnqualifiedName,
        descriptor: impl Into<String>,
        index: usize,
        scope_end: Label,
    ) -> Result<(), Error> {
        let index = u16::try_from(index).map_err(|_| Error::LocalIndexOverflow {
            method: self.method.clone(),
            offset: self.bytes.pos(),
            index,
        })?;
        self.local_variables.push(PendingLocalVariable {
            start_pc: self.bytes.pos(),
            scope_end,
            name,
            descriptor: descriptor.into(),
            index,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::opcodes::*;
    use crate::jvm::code::OrdComparison;
    use crate::jvm::verifier::{TypeArenas, TypeLattice};
    use crate::jvm::CodeOptions;

    #[test]
    fn empty_exception_ranges_are_dropped() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.empty()V", CodeOptions::default());

        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        code.place(start).unwrap();
        code.place(end).unwrap();
        code.add_exception(start, end, handler, None).unwrap();
        assert!(code.exceptions.is_empty());

        let unplaced = code.new_label();
        assert!(matches!(
            code.add_exception(start, unplaced, handler, None),
            Err(Error::UnplacedLabel { .. })
        ));
    }

    #[test]
    fn handler_depth() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.handler()V", CodeOptions::default());

        let handler = code.new_label();
        code.return_value(None).unwrap();
        code.place_handler(handler).unwrap();
        assert_eq!(code.stack_depth(), 1);
        code.athrow().unwrap();
        assert_eq!(code.stack_depth(), 0);
    }

    #[test]
    fn monitor_regions() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(
            &lattice,
            "Test.sync(Ljava/lang/Object;)V",
            CodeOptions::default(),
        );
        let lock = code.allocate_parameter(lattice.object());

        code.load(lattice.object(), lock).unwrap();
        let monitor = code.enter_monitor(lattice.object()).unwrap();
        assert_eq!(code.monitor_depth(), 1);
        assert_eq!(code.pos(), 4);
        code.emit(NOP).unwrap();
        code.exit_monitor().unwrap();
        assert_eq!(code.monitor_depth(), 0);

        assert_eq!(
            code.code(),
            &[
                ALOAD_0, DUP, ASTORE_1, MONITORENTER, NOP, ALOAD_1, MONITOREXIT, GOTO, 0, 6,
                ALOAD_1, MONITOREXIT, ATHROW,
            ]
        );
        assert_eq!(code.exceptions.len(), 1);
        assert_eq!(code.exceptions[0].start_pc, 4);
        assert_eq!(code.exceptions[0].end_pc, 7);
        assert_eq!(code.address_of(code.exceptions[0].handler).unwrap(), 10);
        assert!(code.exceptions[0].catch_type.is_none());

        assert!(matches!(
            code.monitor_range_end(monitor),
            Err(Error::UnknownMonitor { .. })
        ));
        assert!(matches!(
            code.exit_monitor(),
            Err(Error::MonitorStackEmpty { .. })
        ));
    }

    #[test]
    fn early_exits_split_monitor_ranges() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(
            &lattice,
            "Test.sync(Ljava/lang/Object;I)V",
            CodeOptions::default(),
        );
        let lock = code.allocate_parameter(lattice.object());
        let flag = code.allocate_parameter(lattice.integer());

        let skip = code.new_label();
        code.load(lattice.object(), lock).unwrap();
        let monitor = code.enter_monitor(lattice.object()).unwrap();
        code.load(lattice.integer(), flag).unwrap();
        code.emit_if(OrdComparison::EQ, skip).unwrap();
        code.monitor_range_end(monitor).unwrap();
        code.return_value(None).unwrap();
        code.place(skip).unwrap();
        code.monitor_range_start(monitor).unwrap();
        code.emit(NOP).unwrap();
        code.exit_monitor().unwrap();
        code.return_value(None).unwrap();

        // 0: aload_0, dup, astore_2, monitorenter
        // 4: iload_1, ifeq +6, aload_2, monitorexit
        // 10: return
        // 11: nop, aload_2, monitorexit, goto +6
        // 17: aload_2, monitorexit, athrow
        // 20: return
        let ranges: Vec<(usize, usize)> = code
            .exceptions
            .iter()
            .map(|entry| (entry.start_pc, entry.end_pc))
            .collect();
        assert_eq!(ranges, vec![(4, 10), (11, 14)]);
        assert_eq!(code.pos(), 21);
        assert_eq!(code.max_locals(), 3);
    }

    #[test]
    fn line_numbers() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.lines()V", CodeOptions::default());

        code.add_line_number(3);
        code.add_line_number(4);
        code.emit(NOP).unwrap();
        code.add_line_number(0);
        code.add_line_number(0xFFFF);
        code.emit(NOP).unwrap();
        code.add_line_number(7);
        assert_eq!(code.line_numbers, vec![(0, 4), (2, 7)]);
    }
}
