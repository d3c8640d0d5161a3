use tracing::{debug, warn};

use super::{prefix::RepeatMode, Cpu};
use crate::{state::SegmentRegister, vector::Exception, Bus, ExecutionError};

/// Nested hardware interrupts tracked for IRET matching. Deeper nesting
/// drops the oldest frame.
const MAX_IRQ_FRAMES: usize = 64;

/// Flag change applied after the flag word has been pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMutation {
    /// Clear IF and TF so the handler cannot be preempted or single-stepped.
    MaskInterrupts,
}

impl FlagMutation {
    fn apply(self, flags: &mut crate::Flags) {
        match self {
            FlagMutation::MaskInterrupts => flags.mask_interrupts(),
        }
    }
}

/// Decode state interrupted by a hardware IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IrqContext {
    pub segment: Option<SegmentRegister>,
    pub repeat: Option<RepeatMode>,
    pub loop_bounds: Option<(u16, u16)>,
}

/// A hardware interrupt in service. `ss:sp` is the stack top right after the
/// return frame was pushed, which is what the matching IRET will see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IrqFrame {
    pub ss: u16,
    pub sp: u16,
    pub line: u8,
    pub context: IrqContext,
}

impl<B: Bus> Cpu<B> {
    /// Reads the handler address for `vector` from the vector table.
    fn interrupt_target(&self, vector: u8) -> Result<(u16, u16), ExecutionError> {
        let slot = Exception::table_address(vector);
        let offset = self.bus.read_word(slot);
        let segment = self.bus.read_word(slot + 2);
        if offset == 0 && segment == 0 {
            warn!(vector, "interrupt vector points to 0000:0000");
            if self.config.strict_vectors {
                return Err(ExecutionError::MissingInterruptHandler(vector));
            }
        }
        Ok((segment, offset))
    }

    fn enter_interrupt(
        &mut self,
        vector: u8,
        (segment, offset): (u16, u16),
        mutation: Option<FlagMutation>,
    ) {
        debug!(
            vector,
            "interrupt from {:04X}:{:04X} to {:04X}:{:04X}",
            self.state.cs(),
            self.state.ip,
            segment,
            offset
        );
        self.push(self.state.flags.to_word());
        if let Some(mutation) = mutation {
            mutation.apply(&mut self.state.flags);
        }
        self.far_call(segment, offset);
        self.clock += 51;
    }

    /// Software interrupt or processor exception. Fails, without touching any
    /// state, only when strict vectors are on and the slot is empty.
    pub(crate) fn raise_interrupt(
        &mut self,
        vector: u8,
        mutation: Option<FlagMutation>,
    ) -> Result<(), ExecutionError> {
        let target = self.interrupt_target(vector)?;
        self.enter_interrupt(vector, target, mutation);
        Ok(())
    }

    pub(crate) fn raise_exception(
        &mut self,
        exception: Exception,
        mutation: Option<FlagMutation>,
    ) -> Result<(), ExecutionError> {
        debug!(%exception, "processor exception");
        self.raise_interrupt(exception.vector(), mutation)
    }

    /// Accepts a pending hardware interrupt, if any. The interrupted prefix,
    /// repeat and loop state is parked until the matching IRET.
    pub(crate) fn service_irq(&mut self) -> Result<bool, ExecutionError> {
        let Some(irq) = self.bus.pending_irq() else {
            return Ok(false);
        };
        let target = match self.interrupt_target(irq.vector) {
            Ok(target) => target,
            Err(err) => {
                // the controller already put the line in service
                self.bus.end_of_interrupt(irq.line);
                return Err(err);
            }
        };

        let context = IrqContext {
            segment: self.prefix.segment.take(),
            repeat: self.prefix.repeat.take(),
            loop_bounds: self.loop_bounds.take(),
        };
        debug!(line = irq.line, vector = irq.vector, "irq accepted");
        self.enter_interrupt(irq.vector, target, Some(FlagMutation::MaskInterrupts));

        if self.irq_frames.len() == MAX_IRQ_FRAMES {
            warn!("irq nesting too deep, dropping the oldest frame");
            self.irq_frames.remove(0);
        }
        self.irq_frames.push(IrqFrame {
            ss: self.state.ss(),
            sp: self.state.sp(),
            line: irq.line,
            context,
        });
        self.halted = false;
        Ok(true)
    }

    pub(crate) fn op_int3(&mut self) -> Result<(), ExecutionError> {
        self.raise_exception(Exception::Breakpoint, None)?;
        self.clock += 1;
        Ok(())
    }

    pub(crate) fn op_int(&mut self) -> Result<(), ExecutionError> {
        let vector = self.fetch_byte();
        self.raise_interrupt(vector, None)
    }

    pub(crate) fn op_into(&mut self) -> Result<(), ExecutionError> {
        if self.state.flags.overflow {
            self.raise_exception(Exception::Overflow, None)?;
            self.clock += 2;
        }
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_iret(&mut self) -> Result<(), ExecutionError> {
        let (ss, sp) = (self.state.ss(), self.state.sp());
        self.state.ip = self.pop();
        let cs = self.pop();
        self.state.set_cs(cs);
        let flags = self.pop();
        self.state.flags.load_word(flags);
        self.clock += 24;

        let ends_irq = self
            .irq_frames
            .last()
            .is_some_and(|frame| frame.ss == ss && frame.sp == sp);
        if ends_irq {
            if let Some(frame) = self.irq_frames.pop() {
                self.prefix.segment = frame.context.segment;
                self.prefix.repeat = frame.context.repeat;
                self.prefix.keep = true;
                self.loop_bounds = frame.context.loop_bounds;
                self.bus.end_of_interrupt(frame.line);
                debug!(line = frame.line, "irq finished");
            }
        }
        Ok(())
    }

    pub(crate) fn far_call(&mut self, segment: u16, offset: u16) {
        self.push(self.state.cs());
        self.push(self.state.ip);
        self.state.set_cs(segment);
        self.state.ip = offset;
    }
}
