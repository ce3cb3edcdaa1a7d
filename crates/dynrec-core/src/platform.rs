//! Collaborators the dynamic core calls out to: the interpreter, exception delivery and the
//! scheduler-facing exit status.

use crate::mem::{GuestBus, PageFault};
use crate::state::{CpuState, VECTOR_PAGE_FAULT};

/// What the core hands back to the platform scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    /// Nothing to do; call [`crate::Dynrec::run`] again on the next slice.
    Continue,
    /// Invoke platform callback `n`.
    Callback(u32),
}

/// The interpretive core used for fallbacks and for pages without code.
pub trait Interpreter {
    /// Runs until `cpu.cycles` is exhausted or a callback fires. With `cycles == 1` this executes
    /// exactly one instruction.
    fn run_normal(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> CoreExit;

    /// Full-decode variant used after an undefined opcode; defaults to [`Self::run_normal`].
    fn run_full(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> CoreExit {
        self.run_normal(cpu, bus)
    }

    /// Executes exactly one instruction, charging one cycle.
    fn step_one(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> CoreExit {
        let old = cpu.cycles;
        cpu.cycles = 1;
        let exit = self.run_normal(cpu, bus);
        cpu.cycles = old - 1;
        exit
    }
}

/// Architectural exception and interrupt delivery.
pub trait ExceptionSink {
    fn raise_exception(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut dyn GuestBus,
        vector: u8,
        error_code: Option<u32>,
    );

    /// Whether a maskable interrupt is waiting; only consulted while IF is set.
    fn irq_pending(&self, cpu: &CpuState) -> bool;

    fn page_fault(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus, fault: PageFault) {
        self.raise_exception(cpu, bus, VECTOR_PAGE_FAULT, Some(fault.error_code));
    }
}

/// Everything [`crate::Dynrec::run`] needs from the embedding machine besides memory.
pub trait Platform: Interpreter + ExceptionSink {}

impl<T: Interpreter + ExceptionSink> Platform for T {}
