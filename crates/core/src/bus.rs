use std::collections::{HashMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};

/// Size of the real-mode address space.
pub const MEMORY_SIZE: usize = 0x10_0000;
pub const ADDRESS_MASK: u32 = 0xF_FFFF;
/// First byte of the BIOS ROM window. Guest writes at or above it are dropped.
pub const ROM_START: u32 = 0xF_0000;
/// Physical address the processor starts executing from after reset.
pub const BOOT_VECTOR: u32 = 0xF_FFF0;

pub trait Memory {
    fn read_byte(&self, address: u32) -> u8;
    fn write_byte(&mut self, address: u32, value: u8);

    fn read_word(&self, address: u32) -> u16 {
        let lo = self.read_byte(address) as u16;
        let hi = self.read_byte(address.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.write_byte(address, value as u8);
        self.write_byte(address.wrapping_add(1), (value >> 8) as u8);
    }

    /// Copies `buffer.len()` bytes starting at `address` into `buffer`.
    fn read_block(&self, address: u32, buffer: &mut [u8]) {
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = self.read_byte(address.wrapping_add(i as u32));
        }
    }

    /// Host-side image load. Ignores the ROM write guard.
    fn load_block(&mut self, address: u32, data: &[u8]);
}

pub trait PortIo {
    fn read_port(&mut self, port: u16) -> u8;
    fn write_port(&mut self, port: u16, value: u8);

    fn read_port_word(&mut self, port: u16) -> u16 {
        let lo = self.read_port(port) as u16;
        let hi = self.read_port(port.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn write_port_word(&mut self, port: u16, value: u16) {
        self.write_port(port, value as u8);
        self.write_port(port.wrapping_add(1), (value >> 8) as u8);
    }
}

/// A hardware interrupt the controller wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingIrq {
    pub vector: u8,
    pub line: u8,
}

pub trait InterruptController {
    /// Hands out the highest priority request and marks it in service.
    fn pending_irq(&mut self) -> Option<PendingIrq>;
    fn end_of_interrupt(&mut self, line: u8);
}

pub trait Timer {
    fn tick(&mut self);
}

/// Everything the processor talks to.
pub trait Bus: Memory + PortIo + InterruptController + Timer {}

impl<T: Memory + PortIo + InterruptController + Timer> Bus for T {}

/// Flat 1 MiB RAM with a write protected BIOS window.
#[derive(Debug, Clone)]
pub struct MemoryController {
    memory: Box<[u8]>,
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryController {
    pub fn new() -> Self {
        Self {
            memory: vec![0; MEMORY_SIZE].into_boxed_slice(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.memory
    }
}

impl Memory for MemoryController {
    #[inline]
    fn read_byte(&self, address: u32) -> u8 {
        self.memory[(address & ADDRESS_MASK) as usize]
    }

    #[inline]
    fn write_byte(&mut self, address: u32, value: u8) {
        let address = address & ADDRESS_MASK;
        if address >= ROM_START {
            return;
        }
        self.memory[address as usize] = value;
    }

    #[inline]
    fn read_word(&self, address: u32) -> u16 {
        let address = (address & ADDRESS_MASK) as usize;
        if address + 1 < MEMORY_SIZE {
            LittleEndian::read_u16(&self.memory[address..address + 2])
        } else {
            self.memory[address] as u16 | (self.memory[0] as u16) << 8
        }
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.write_byte(address, value as u8);
        self.write_byte(address.wrapping_add(1), (value >> 8) as u8);
    }

    fn read_block(&self, address: u32, buffer: &mut [u8]) {
        let start = (address & ADDRESS_MASK) as usize;
        let end = start + buffer.len();
        if end <= MEMORY_SIZE {
            buffer.copy_from_slice(&self.memory[start..end]);
        } else {
            let split = MEMORY_SIZE - start;
            buffer[..split].copy_from_slice(&self.memory[start..]);
            buffer[split..].copy_from_slice(&self.memory[..end - MEMORY_SIZE]);
        }
    }

    fn load_block(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory[(address.wrapping_add(i as u32) & ADDRESS_MASK) as usize] = *byte;
        }
    }
}

/// Self-contained bus for tests and headless runs: plain memory, a port
/// table, a queue of hardware requests and a tick counter.
#[derive(Debug, Default)]
pub struct FlatBus {
    pub memory: MemoryController,
    pub ports: HashMap<u16, u8>,
    pub port_writes: Vec<(u16, u8)>,
    pub irq_queue: VecDeque<PendingIrq>,
    pub acknowledged: Vec<u8>,
    pub ticks: u64,
}

impl FlatBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_irq(&mut self, vector: u8, line: u8) {
        self.irq_queue.push_back(PendingIrq { vector, line });
    }
}

impl Memory for FlatBus {
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

impl PortIo for FlatBus {
    fn read_port(&mut self, port: u16) -> u8 {
        self.ports.get(&port).copied().unwrap_or(0)
    }

    fn write_port(&mut self, port: u16, value: u8) {
        self.port_writes.push((port, value));
    }
}

impl InterruptController for FlatBus {
    fn pending_irq(&mut self) -> Option<PendingIrq> {
        self.irq_queue.pop_front()
    }

    fn end_of_interrupt(&mut self, line: u8) {
        self.acknowledged.push(line);
    }
}

impl Timer for FlatBus {
    fn tick(&mut self) {
        self.ticks += 1;
    }
}
