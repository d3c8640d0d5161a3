use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use emu86_core::{
    bus::MEMORY_SIZE, Cpu, CpuConfig, CpuStats, InterruptController, Memory, MemoryController,
    PendingIrq, PortIo, RunMode, Timer,
};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::{
    pic::{IrqLine, Pic8259},
    pit::Pit8253,
    DeviceError, PortDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortTarget {
    Pic,
    Pit,
    Attached(usize),
}

/// Memory, port map and the two on-board timing chips.
pub struct PcBus {
    pub memory: MemoryController,
    pub pic: Pic8259,
    pub pit: Pit8253,
    devices: Vec<Box<dyn PortDevice>>,
    ports: IndexMap<u16, PortTarget>,
}

impl Default for PcBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PcBus {
    pub fn new() -> Self {
        let mut bus = Self {
            memory: MemoryController::new(),
            pic: Pic8259::new(),
            pit: Pit8253::new(),
            devices: Vec::new(),
            ports: IndexMap::new(),
        };
        for port in bus.pic.port_numbers() {
            bus.ports.insert(port, PortTarget::Pic);
        }
        for port in bus.pit.port_numbers() {
            bus.ports.insert(port, PortTarget::Pit);
        }
        bus
    }

    /// Maps every port of `device`. Fails without mapping anything if one of
    /// them is already taken.
    pub fn attach(&mut self, device: Box<dyn PortDevice>) -> Result<(), DeviceError> {
        let ports = device.port_numbers();
        if let Some((port, target)) = ports
            .iter()
            .find_map(|port| self.ports.get(port).map(|target| (*port, *target)))
        {
            return Err(DeviceError::PortConflict {
                port,
                owner: self.device(target).name(),
            });
        }

        let index = self.devices.len();
        debug!(device = device.name(), ports = ?ports, "device attached");
        for port in ports {
            self.ports.insert(port, PortTarget::Attached(index));
        }
        self.devices.push(device);
        Ok(())
    }

    /// Port numbers in registration order with the name of their owner.
    pub fn port_map(&self) -> impl Iterator<Item = (u16, &'static str)> + '_ {
        self.ports
            .iter()
            .map(|(port, target)| (*port, self.device(*target).name()))
    }

    /// Puts the on-board chips back into their power-on state.
    pub fn reset_chips(&mut self) {
        self.pic = Pic8259::new();
        self.pit = Pit8253::new();
    }

    fn device(&self, target: PortTarget) -> &dyn PortDevice {
        let device: &dyn PortDevice = match target {
            PortTarget::Pic => &self.pic,
            PortTarget::Pit => &self.pit,
            PortTarget::Attached(index) => self.devices[index].as_ref(),
        };
        device
    }

    fn device_mut(&mut self, port: u16) -> Option<&mut dyn PortDevice> {
        let target = *self.ports.get(&port)?;
        let device: &mut dyn PortDevice = match target {
            PortTarget::Pic => &mut self.pic,
            PortTarget::Pit => &mut self.pit,
            PortTarget::Attached(index) => self.devices[index].as_mut(),
        };
        Some(device)
    }
}

impl Memory for PcBus {
    fn read_byte(&self, address: u32) -> u8 {
        self.memory.read_byte(address)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.memory.write_byte(address, value)
    }

    fn read_word(&self, address: u32) -> u16 {
        self.memory.read_word(address)
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.memory.write_word(address, value)
    }

    fn read_block(&self, address: u32, buffer: &mut [u8]) {
        self.memory.read_block(address, buffer)
    }

    fn load_block(&mut self, address: u32, data: &[u8]) {
        self.memory.load_block(address, data)
    }
}

impl PortIo for PcBus {
    fn read_port(&mut self, port: u16) -> u8 {
        match self.device_mut(port) {
            Some(device) => device.get_byte(port),
            None => {
                trace!(port, "read from unmapped port");
                0
            }
        }
    }

    fn write_port(&mut self, port: u16, value: u8) {
        match self.device_mut(port) {
            Some(device) => device.set_byte(port, value),
            None => trace!(port, value, "write to unmapped port"),
        }
    }

    fn read_port_word(&mut self, port: u16) -> u16 {
        if let Some(device) = self.device_mut(port).filter(|device| device.supports_word()) {
            return device.get_word(port);
        }
        let lo = self.read_port(port) as u16;
        let hi = self.read_port(port.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn write_port_word(&mut self, port: u16, value: u16) {
        if let Some(device) = self.device_mut(port).filter(|device| device.supports_word()) {
            device.set_word(port, value);
            return;
        }
        self.write_port(port, value as u8);
        self.write_port(port.wrapping_add(1), (value >> 8) as u8);
    }
}

impl InterruptController for PcBus {
    fn pending_irq(&mut self) -> Option<PendingIrq> {
        self.pic.acknowledge()
    }

    fn end_of_interrupt(&mut self, line: u8) {
        self.pic.end_of_interrupt(line);
    }
}

impl Timer for PcBus {
    fn tick(&mut self) {
        if self.pit.tick() {
            self.pic.raise(IrqLine::Timer);
        }
    }
}

/// A processor wired to a [`PcBus`], plus a stop signal the host can set
/// from another thread.
pub struct Machine {
    pub cpu: Cpu<PcBus>,
    stop: Arc<AtomicBool>,
}

impl Machine {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            cpu: Cpu::new(PcBus::new(), config),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bus(&self) -> &PcBus {
        &self.cpu.bus
    }

    pub fn attach(&mut self, device: Box<dyn PortDevice>) -> Result<(), DeviceError> {
        self.cpu.bus.attach(device)
    }

    pub fn load_program(&mut self, segment: u32, program: &[u8]) -> Result<(), DeviceError> {
        Ok(self.cpu.load_program(segment, program)?)
    }

    pub fn load_bootstrapped(&mut self, segment: u32, program: &[u8]) -> Result<(), DeviceError> {
        Ok(self.cpu.load_bootstrapped(segment, program)?)
    }

    /// Places a ROM image so that its last byte is the last byte of the
    /// address space.
    pub fn load_bios(&mut self, image: &[u8]) -> Result<(), DeviceError> {
        if image.is_empty() {
            return Err(emu86_core::ExecutionError::EmptyProgram.into());
        }
        if image.len() > MEMORY_SIZE {
            return Err(DeviceError::BiosTooLarge(image.len()));
        }
        let start = (MEMORY_SIZE - image.len()) as u32;
        self.cpu.bus.load_block(start, image);
        debug!(start, len = image.len(), "bios loaded");
        Ok(())
    }

    /// Power cycle: processor and on-board chips are reset, memory and
    /// attached devices are kept.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.cpu.bus.reset_chips();
        self.stop.store(false, Ordering::Relaxed);
    }

    /// Setting the returned flag makes `run` return after the current
    /// instruction.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn run(&mut self, run_mode: RunMode) -> Result<CpuStats, DeviceError> {
        let budget = match run_mode {
            RunMode::Run => usize::MAX,
            RunMode::RunFor(instructions) => instructions,
            RunMode::Step => 1,
        };
        for _ in 0..budget {
            if self.stop.load(Ordering::Relaxed) {
                debug!("stop requested by host");
                break;
            }
            if self.cpu.stopped() {
                break;
            }
            self.cpu.step()?;
        }
        Ok(self.cpu.stats())
    }

    pub fn stats(&self) -> CpuStats {
        self.cpu.stats()
    }
}
