use tracing::trace;

use super::{ops::segment_from_index, Cpu};
use crate::{state::SegmentRegister, Bus, ExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    /// REP / REPE (F3): compares keep going while ZF is set.
    WhileZero,
    /// REPNE (F2): compares keep going while ZF is clear.
    WhileNotZero,
}

impl RepeatMode {
    /// Whether a compare result ends the repetition early.
    #[inline]
    pub fn stops_on(self, zero: bool) -> bool {
        match self {
            RepeatMode::WhileZero => !zero,
            RepeatMode::WhileNotZero => zero,
        }
    }
}

/// Prefix state carried between fetch cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixState {
    pub segment: Option<SegmentRegister>,
    pub repeat: Option<RepeatMode>,
    pub lock: bool,
    /// Set by the instruction that just ran when the prefixes must survive
    /// into the next fetch.
    pub keep: bool,
}

impl PrefixState {
    /// Called once after every instruction.
    pub fn retire(&mut self) {
        if !self.keep {
            self.segment = None;
            self.repeat = None;
            self.lock = false;
        }
        self.keep = false;
    }

    pub fn is_pending(&self) -> bool {
        self.segment.is_some() || self.repeat.is_some() || self.lock
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What a string primitive did during one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StringKind {
    Transfer,
    Compare,
}

impl<B: Bus> Cpu<B> {
    pub(crate) fn op_segment_prefix(&mut self) -> Result<(), ExecutionError> {
        self.prefix.segment = Some(segment_from_index(self.decode.opcode >> 3));
        self.prefix.keep = true;
        self.clock += 2;
        Ok(())
    }

    pub(crate) fn op_repeat_prefix(&mut self) -> Result<(), ExecutionError> {
        self.prefix.repeat = Some(if self.decode.opcode == 0xF2 {
            RepeatMode::WhileNotZero
        } else {
            RepeatMode::WhileZero
        });
        self.prefix.keep = true;
        // 2 for the prefix, 9 for decoding the string instruction behind it
        self.clock += 2 + 9;
        Ok(())
    }

    pub(crate) fn op_lock(&mut self) -> Result<(), ExecutionError> {
        self.prefix.lock = true;
        self.prefix.keep = true;
        self.clock += 2;
        Ok(())
    }

    /// Runs one iteration of a string primitive under the current repeat
    /// prefix. With a prefix armed, CX counts iterations and the instruction
    /// pointer is rewound so the same opcode is fetched again.
    pub(crate) fn repeat_string(
        &mut self,
        kind: StringKind,
        iteration: fn(&mut Self) -> Result<(), ExecutionError>,
    ) -> Result<(), ExecutionError> {
        let Some(mode) = self.prefix.repeat else {
            return iteration(self);
        };

        if self.state.cx() == 0 {
            self.prefix.repeat = None;
            return Ok(());
        }

        iteration(self)?;

        let remaining = self.state.cx().wrapping_sub(1);
        self.state.set_cx(remaining);

        let stopped = kind == StringKind::Compare && mode.stops_on(self.state.flags.zero);
        if remaining == 0 || stopped {
            trace!(remaining, stopped, "repeat finished");
            self.prefix.repeat = None;
        } else {
            self.state.ip = self.decode.start_ip;
            self.prefix.keep = true;
        }
        Ok(())
    }
}
