use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;
use tracing::{debug, trace};

use crate::PortDevice;

pub const CHANNEL_PORT_BASE: u16 = 0x40;
pub const CONTROL_PORT: u16 = 0x43;

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Mode {
    #[default]
    InterruptOnTerminalCount = 0,
    OneShot = 1,
    RateGenerator = 2,
    SquareWave = 3,
    SoftwareStrobe = 4,
    HardwareStrobe = 5,
}

impl Mode {
    /// Modes 6 and 7 are aliases of 2 and 3.
    fn decode(bits: u8) -> Self {
        let bits = bits & 0x7;
        let bits = if bits >= 6 { bits - 4 } else { bits };
        Mode::from_u8(bits).unwrap_or_default()
    }
}

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Access {
    Latch = 0,
    Low = 1,
    High = 2,
    #[default]
    LowHigh = 3,
}

#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub mode: Mode,
    pub access: Access,
    reload: u16,
    counter: u32,
    latch: Option<u16>,
    read_high: bool,
    write_high: bool,
    armed: bool,
    output: bool,
}

impl Channel {
    /// A reload value of 0 counts 65536 input clocks.
    fn period(&self) -> u32 {
        if self.reload == 0 {
            0x1_0000
        } else {
            self.reload as u32
        }
    }

    pub fn counter(&self) -> u16 {
        self.counter as u16
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn program(&mut self, mode: Mode, access: Access) {
        self.mode = mode;
        self.access = access;
        self.latch = None;
        self.read_high = false;
        self.write_high = false;
        self.armed = false;
        self.output = mode != Mode::InterruptOnTerminalCount;
    }

    fn start(&mut self) {
        self.counter = match self.mode {
            Mode::SquareWave => self.period() & !1,
            _ => self.period(),
        };
        self.latch = None;
        self.armed = true;
        self.output = self.mode != Mode::InterruptOnTerminalCount;
    }

    fn write(&mut self, value: u8) {
        match self.access {
            Access::Low => {
                self.reload = value as u16;
                self.start();
            }
            Access::High => {
                self.reload = (value as u16) << 8;
                self.start();
            }
            Access::LowHigh if self.write_high => {
                self.reload = (self.reload & 0x00FF) | (value as u16) << 8;
                self.write_high = false;
                self.start();
            }
            Access::LowHigh | Access::Latch => {
                self.reload = (self.reload & 0xFF00) | value as u16;
                self.write_high = true;
                // writing the first byte stops the count
                self.armed = false;
            }
        }
    }

    fn read(&mut self) -> u8 {
        let value = self.latch.unwrap_or(self.counter as u16);
        let [lo, hi] = value.to_le_bytes();
        match self.access {
            Access::Low => {
                self.latch = None;
                lo
            }
            Access::High => {
                self.latch = None;
                hi
            }
            Access::LowHigh | Access::Latch => {
                let byte = if self.read_high { hi } else { lo };
                if self.read_high {
                    self.latch = None;
                }
                self.read_high = !self.read_high;
                byte
            }
        }
    }

    /// Advances one input clock. Returns true on a rising output edge.
    fn tick(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        match self.mode {
            Mode::InterruptOnTerminalCount | Mode::SoftwareStrobe => {
                if self.output || self.counter == 0 {
                    return false;
                }
                self.counter -= 1;
                self.output = self.counter == 0;
                self.output
            }
            Mode::RateGenerator => {
                if self.counter <= 1 {
                    self.counter = self.period();
                    true
                } else {
                    self.counter -= 1;
                    false
                }
            }
            Mode::SquareWave => {
                if self.counter <= 2 {
                    self.counter = self.period() & !1;
                    self.output = !self.output;
                    self.output
                } else {
                    self.counter -= 2;
                    false
                }
            }
            // gate driven modes need hardware the machine does not have
            Mode::OneShot | Mode::HardwareStrobe => false,
        }
    }
}

/// 8253 programmable interval timer with three channels. Only channel 0 is
/// wired to an interrupt line.
#[derive(Debug, Clone, Default)]
pub struct Pit8253 {
    channels: [Channel; 3],
}

impl Pit8253 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// One input clock on every channel. Returns whether channel 0 produced
    /// an edge for IRQ 0.
    pub fn tick(&mut self) -> bool {
        let [irq0, rest @ ..] = &mut self.channels;
        for channel in rest {
            channel.tick();
        }
        irq0.tick()
    }

    fn write_control(&mut self, value: u8) {
        let index = (value >> 6) as usize;
        let Some(channel) = self.channels.get_mut(index) else {
            trace!(value, "8254 read-back command ignored");
            return;
        };

        let access = Access::from_u8((value >> 4) & 0x3).unwrap_or_default();
        if access == Access::Latch {
            channel.latch = Some(channel.counter as u16);
            return;
        }
        let mode = Mode::decode(value >> 1);
        debug!(channel = index, %mode, %access, "pit channel programmed");
        channel.program(mode, access);
    }
}

impl PortDevice for Pit8253 {
    fn name(&self) -> &'static str {
        "8253 PIT"
    }

    fn port_numbers(&self) -> Vec<u16> {
        (CHANNEL_PORT_BASE..=CONTROL_PORT).collect()
    }

    fn get_byte(&mut self, port: u16) -> u8 {
        match self
            .channels
            .get_mut(port.wrapping_sub(CHANNEL_PORT_BASE) as usize)
        {
            Some(channel) => channel.read(),
            None => 0,
        }
    }

    fn set_byte(&mut self, port: u16, value: u8) {
        if port == CONTROL_PORT {
            self.write_control(value);
        } else if let Some(channel) = self
            .channels
            .get_mut(port.wrapping_sub(CHANNEL_PORT_BASE) as usize)
        {
            channel.write(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed(channel: u8, mode: u8, reload: u16) -> Pit8253 {
        let mut pit = Pit8253::new();
        pit.set_byte(CONTROL_PORT, channel << 6 | 0b11 << 4 | mode << 1);
        let [lo, hi] = reload.to_le_bytes();
        pit.set_byte(CHANNEL_PORT_BASE + channel as u16, lo);
        pit.set_byte(CHANNEL_PORT_BASE + channel as u16, hi);
        pit
    }

    fn edges(pit: &mut Pit8253, ticks: usize) -> Vec<usize> {
        (1..=ticks).filter(|_| pit.tick()).collect()
    }

    #[test]
    fn test_rate_generator_period() {
        let mut pit = programmed(0, 2, 4);
        assert_eq!(edges(&mut pit, 12), vec![4, 8, 12]);
    }

    #[test]
    fn test_square_wave_period() {
        let mut pit = programmed(0, 3, 6);
        // output toggles every 3 ticks, rises every 6
        assert_eq!(edges(&mut pit, 12), vec![6, 12]);
    }

    #[test]
    fn test_terminal_count_fires_once() {
        let mut pit = programmed(0, 0, 3);
        assert_eq!(edges(&mut pit, 10), vec![3]);
    }

    #[test]
    fn test_only_channel_zero_reports_edges() {
        let mut pit = programmed(2, 2, 2);
        assert!(edges(&mut pit, 10).is_empty());
        assert!(pit.channel(2).is_some_and(|channel| channel.is_armed()));
    }

    #[test]
    fn test_counter_stopped_until_fully_written() {
        let mut pit = Pit8253::new();
        pit.set_byte(CONTROL_PORT, 0b00_11_010_0);
        pit.set_byte(CHANNEL_PORT_BASE, 0x02);
        assert!(!pit.tick());
        assert!(pit.channel(0).is_some_and(|channel| !channel.is_armed()));
    }

    #[test]
    fn test_latch_freezes_read_value() {
        let mut pit = programmed(0, 2, 0x1234);
        pit.tick();
        pit.set_byte(CONTROL_PORT, 0b00_00_0000);
        pit.tick();
        pit.tick();

        let lo = pit.get_byte(CHANNEL_PORT_BASE);
        let hi = pit.get_byte(CHANNEL_PORT_BASE);
        assert_eq!(u16::from_le_bytes([lo, hi]), 0x1233);
        // latch released after both bytes
        let lo = pit.get_byte(CHANNEL_PORT_BASE);
        let hi = pit.get_byte(CHANNEL_PORT_BASE);
        assert_eq!(u16::from_le_bytes([lo, hi]), 0x1231);
    }

    #[test]
    fn test_low_byte_only_access() {
        let mut pit = Pit8253::new();
        pit.set_byte(CONTROL_PORT, 0b00_01_010_0);
        pit.set_byte(CHANNEL_PORT_BASE, 5);
        assert_eq!(pit.get_byte(CHANNEL_PORT_BASE), 5);
        assert_eq!(edges(&mut pit, 10), vec![5, 10]);
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!(Mode::decode(6), Mode::RateGenerator);
        assert_eq!(Mode::decode(7), Mode::SquareWave);
        assert_eq!(Mode::decode(1), Mode::OneShot);
    }
}
