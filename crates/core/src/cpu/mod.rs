mod addressing;
mod alu;
mod decode;
mod interrupts;
mod ops;
mod ops186;
mod prefix;
mod table;

use strum::{Display, EnumIter, EnumString};
use tracing::{debug, trace};

pub use alu::{AluOp, ShiftOp, PARITY};
pub use decode::{ModRm, Width, FETCH_WINDOW};
pub use interrupts::FlagMutation;
pub use prefix::{PrefixState, RepeatMode};

use crate::{
    bus::{Bus, BOOT_VECTOR, MEMORY_SIZE},
    state::CpuState,
    vector::Exception,
    CpuStats, ExecutionError, RunMode,
};
use decode::Decode;
use interrupts::IrqFrame;

pub(crate) type Handler<B> = fn(&mut Cpu<B>) -> Result<(), ExecutionError>;

#[derive(Debug, Display, Default, PartialEq, Copy, Clone, Hash, Eq, EnumIter, EnumString)]
pub enum CpuVariant {
    #[default]
    #[strum(serialize = "8086")]
    I8086,
    #[strum(serialize = "80186")]
    I80186,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    pub variant: CpuVariant,
    /// Processor clocks per timer tick.
    pub timer_ratio: u32,
    /// Report jumps through an empty vector table slot as an error.
    pub strict_vectors: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            variant: CpuVariant::I8086,
            timer_ratio: 4,
            strict_vectors: false,
        }
    }
}

pub struct Cpu<B: Bus> {
    pub state: CpuState,
    pub bus: B,
    config: CpuConfig,
    table: [Handler<B>; 256],
    decode: Decode,
    prefix: PrefixState,
    loop_bounds: Option<(u16, u16)>,
    irq_frames: Vec<IrqFrame>,
    clock: u64,
    last_timer_tick: u64,
    instructions: u64,
    timer_ticks: u64,
    halted: bool,
}

impl<B: Bus> Cpu<B> {
    pub fn new(bus: B, config: CpuConfig) -> Self {
        let config = CpuConfig {
            timer_ratio: config.timer_ratio.max(1),
            ..config
        };
        Self {
            state: CpuState::power_on(),
            bus,
            table: Self::opcode_table(config.variant),
            config,
            decode: Decode::default(),
            prefix: PrefixState::default(),
            loop_bounds: None,
            irq_frames: Vec::new(),
            clock: 0,
            last_timer_tick: 0,
            instructions: 0,
            timer_ticks: 0,
            halted: false,
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn variant(&self) -> CpuVariant {
        self.config.variant
    }

    /// Returns the processor to its power-on state. Memory is left alone.
    pub fn reset(&mut self) {
        self.state = CpuState::power_on();
        self.decode = Decode::default();
        self.prefix.clear();
        self.loop_bounds = None;
        self.irq_frames.clear();
        self.clock = 0;
        self.last_timer_tick = 0;
        self.instructions = 0;
        self.timer_ticks = 0;
        self.halted = false;
    }

    /// Copies a program to `segment:0000`. CS:IP is left untouched.
    pub fn load_program(&mut self, segment: u32, program: &[u8]) -> Result<(), ExecutionError> {
        if segment > 0xFFFF {
            return Err(ExecutionError::SegmentOutOfRange(segment));
        }
        if program.is_empty() {
            return Err(ExecutionError::EmptyProgram);
        }
        let start = segment << 4;
        if start as usize + program.len() > MEMORY_SIZE {
            return Err(ExecutionError::ProgramTooLarge {
                start,
                len: program.len(),
            });
        }
        self.bus.load_block(start, program);
        debug!(segment, len = program.len(), "program loaded");
        Ok(())
    }

    /// Loads a program and plants a far jump to it at the boot vector, so a
    /// reset processor starts executing it.
    pub fn load_bootstrapped(&mut self, segment: u32, program: &[u8]) -> Result<(), ExecutionError> {
        self.load_program(segment, program)?;
        let [lo, hi] = (segment as u16).to_le_bytes();
        self.bus.load_block(BOOT_VECTOR, &[0xEA, 0x00, 0x00, lo, hi]);
        Ok(())
    }

    pub fn set_entrypoint(&mut self, segment: u16, offset: u16) {
        self.state.set_cs(segment);
        self.state.ip = offset;
        self.halted = false;
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Active LOOP target window, if the last instruction was a taken loop.
    pub fn loop_bounds(&self) -> Option<(u16, u16)> {
        self.loop_bounds
    }

    pub fn prefix(&self) -> &PrefixState {
        &self.prefix
    }

    pub fn stats(&self) -> CpuStats {
        CpuStats {
            cycles: self.clock,
            instructions: self.instructions,
            timer_ticks: self.timer_ticks,
        }
    }

    pub fn execute(&mut self, run_mode: RunMode) -> Result<CpuStats, ExecutionError> {
        match run_mode {
            RunMode::Run => {
                while !self.stopped() {
                    self.step()?;
                }
            }
            RunMode::RunFor(instructions) => {
                for _ in 0..instructions {
                    if self.stopped() {
                        break;
                    }
                    self.step()?;
                }
            }
            RunMode::Step => self.step()?,
        }
        Ok(self.stats())
    }

    /// Halted with interrupts off: nothing can ever wake the processor.
    pub fn stopped(&self) -> bool {
        self.halted && !self.state.flags.interrupt
    }

    /// One fetch cycle: timer catch-up, fetch, dispatch, IRQ and trap check.
    pub fn step(&mut self) -> Result<(), ExecutionError> {
        self.sync_timer();

        if self.halted {
            self.clock += self.config.timer_ratio as u64;
            if self.state.flags.interrupt {
                self.service_irq()?;
            }
            return Ok(());
        }

        let trap_armed = self.state.flags.trap;

        let mut window = [0; FETCH_WINDOW];
        self.bus.read_block(self.state.code_address(), &mut window);
        self.decode.begin(window, self.state.ip);
        let cs = self.state.cs();
        let clock_before = self.clock;

        let opcode = self.fetch_byte();
        self.decode.opcode = opcode;
        (self.table[opcode as usize])(self)?;
        self.prefix.retire();
        self.instructions += 1;

        trace!(
            "[{:04X}:{:04X}] {:02X?} +{} loop={:?} {}",
            cs,
            self.decode.start_ip,
            self.decode.consumed(),
            self.clock - clock_before,
            self.loop_bounds,
            self.state
        );

        let irq_taken = self.state.flags.interrupt && self.service_irq()?;

        // Lowest priority. Never between a prefix and the instruction it
        // applies to.
        if trap_armed && !irq_taken && !self.prefix.is_pending() {
            self.raise_exception(Exception::SingleStep, Some(FlagMutation::MaskInterrupts))?;
        }
        Ok(())
    }

    fn sync_timer(&mut self) {
        let ratio = self.config.timer_ratio as u64;
        let owed = (self.clock - self.last_timer_tick) / ratio;
        for _ in 0..owed {
            self.bus.tick();
        }
        self.last_timer_tick += owed * ratio;
        self.timer_ticks += owed;
    }

    #[inline]
    pub(crate) fn fetch_byte(&mut self) -> u8 {
        let byte = match self.decode.next() {
            Some(byte) => byte,
            None => self.bus.read_byte(self.state.code_address()),
        };
        self.state.ip = self.state.ip.wrapping_add(1);
        byte
    }

    #[inline]
    pub(crate) fn fetch_word(&mut self) -> u16 {
        let lo = self.fetch_byte() as u16;
        let hi = self.fetch_byte() as u16;
        lo | hi << 8
    }

    #[inline]
    pub(crate) fn fetch_modrm(&mut self) -> ModRm {
        ModRm::from_byte(self.fetch_byte())
    }

    #[inline]
    pub(crate) fn fetch_imm(&mut self, width: Width) -> u16 {
        match width {
            Width::Byte => self.fetch_byte() as u16,
            Width::Word => self.fetch_word(),
        }
    }
}
