//! Output channels: cyclic pulse trains and continuous drive.
//!
//! Each output runs a small per-tic state machine: queued cycles turn
//! the channel on for `on_tics`, then off for `off_tics`, repeating
//! until the cycle count drains (or forever in continuous mode). Level
//! edges can announce themselves with a high-priority event code and an
//! outbound transition message.

use rig_common::consts::HIGHEST_ASCII_CODE;
use rig_common::error::RigError;
use rig_common::io::SharedWrite;
use rig_common::report::{Message, OutputSettings, Reason, SharedOutbound, Source};

use crate::event_code::EventCodeChannel;

pub struct Output {
    number: u16,
    channel: u16,
    enabled: bool,
    current_value: u16,
    on_value: u16,
    off_value: u16,
    is_digital: bool,
    is_continuous: bool,
    in_cycle: bool,
    cycle_count: u16,
    on_tics: u64,
    off_tics: u64,
    code_on: u16,
    code_off: u16,
    msg_on_start: bool,
    msg_all_transitions: bool,
    cycle_off_tic: u64,
    cycle_finished_tic: u64,
    clock_tic: u64,
    start_delay_tic: u64,
    writer: SharedWrite,
}

impl Output {
    pub fn new(number: u16, channel: u16, writer: SharedWrite) -> Self {
        let mut output = Self {
            number,
            channel,
            enabled: false,
            current_value: 0,
            on_value: 1,
            off_value: 0,
            is_digital: true,
            is_continuous: false,
            in_cycle: false,
            cycle_count: 0,
            on_tics: 1,
            off_tics: 1,
            code_on: 0,
            code_off: 0,
            msg_on_start: false,
            msg_all_transitions: false,
            cycle_off_tic: 0,
            cycle_finished_tic: 0,
            clock_tic: 0,
            start_delay_tic: 0,
            writer,
        };
        // Drive a known level before the channel goes live.
        output.set_value(0);
        output.enabled = true;
        output
    }

    // ─── Timer context ───────────────────────────────────────────────────────

    /// One tic of the cycle state machine.
    pub fn advance(&mut self, tic: u64, codes: &EventCodeChannel, outbound: &SharedOutbound) {
        self.clock_tic = tic;

        if !self.enabled {
            // Leave a cut-short cycle at the off level.
            if self.in_cycle {
                self.in_cycle = false;
                if self.current_value != self.off_value {
                    self.set_level(self.off_value, codes, outbound);
                }
            }
            return;
        }

        if self.in_cycle {
            if self.clock_tic < self.cycle_finished_tic {
                if self.clock_tic >= self.cycle_off_tic && self.current_value != self.off_value {
                    self.set_level(self.off_value, codes, outbound);
                }
                return;
            }
            self.in_cycle = false;
            if self.current_value != self.off_value {
                self.set_level(self.off_value, codes, outbound);
            }
        }

        if self.cycle_count > 0 || self.is_continuous {
            let start = if self.is_continuous {
                self.cycle_count = 0;
                true
            } else if self.clock_tic >= self.start_delay_tic {
                self.cycle_count -= 1;
                true
            } else {
                false
            };

            if start {
                self.set_level(self.on_value, codes, outbound);
                self.in_cycle = true;
                self.cycle_off_tic = self.clock_tic + self.on_tics;
                self.cycle_finished_tic = self.cycle_off_tic + self.off_tics;
            }
        }
    }

    /// Drive a level and announce the edge.
    fn set_level(&mut self, value: u16, codes: &EventCodeChannel, outbound: &SharedOutbound) {
        self.writer.write(self.channel, value);
        self.current_value = value;

        if self.current_value == self.on_value {
            if self.code_on > 0 {
                if let Err(error) = codes.send_high(self.code_on) {
                    self.report_code_failure(error, outbound);
                }
            }
            if self.msg_on_start {
                outbound.enqueue(Message::OutputTransition {
                    output: self.number,
                    tic: self.clock_tic,
                    on: true,
                });
            }
        } else if self.current_value == self.off_value {
            if self.code_off > 0 {
                if let Err(error) = codes.send_high(self.code_off) {
                    self.report_code_failure(error, outbound);
                }
            }
            if self.msg_on_start && self.msg_all_transitions {
                outbound.enqueue(Message::OutputTransition {
                    output: self.number,
                    tic: self.clock_tic,
                    on: false,
                });
            }
        }
    }

    fn report_code_failure(&self, error: RigError, outbound: &SharedOutbound) {
        outbound.enqueue(Message::Diagnostic {
            source: Source::Output(self.number),
            tic: self.clock_tic,
            error: error.to_string(),
        });
    }

    // ─── Cycle control ───────────────────────────────────────────────────────

    /// Queue more pulse cycles. The start delay only applies when the
    /// queue was empty; cycles appended to a running train follow
    /// back to back.
    pub fn add_cycles(&mut self, cycles: u16, start_tic: u64) {
        if self.cycle_count == 0 {
            self.start_delay_tic = start_tic;
        } else {
            self.start_delay_tic = 0;
        }
        self.cycle_count = self.cycle_count.saturating_add(cycles);
    }

    pub fn enable(&mut self, enable: bool) {
        self.enabled = enable;
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.is_continuous = continuous;
    }

    #[inline]
    pub fn is_continuous(&self) -> bool {
        self.is_continuous
    }

    // ─── Settings ────────────────────────────────────────────────────────────

    pub fn set_on_off_values(&mut self, on_value: u16, off_value: u16) {
        self.on_value = self.clamp(on_value);
        self.off_value = self.clamp(off_value);
    }

    pub fn set_on_off_tics(&mut self, on_tics: u64, off_tics: u64) -> Result<(), RigError> {
        if on_tics == 0 || off_tics == 0 {
            return Err(RigError::Config("on_tics and off_tics cannot be 0"));
        }
        self.on_tics = on_tics;
        self.off_tics = off_tics;
        Ok(())
    }

    pub fn set_event_codes(&mut self, code_on: u16, code_off: u16) -> Result<(), RigError> {
        if !valid_event_code(code_on) || !valid_event_code(code_off) {
            return Err(RigError::Config("event code outside of range 128-255"));
        }
        self.code_on = code_on;
        self.code_off = code_off;
        Ok(())
    }

    /// Drive the channel directly. The one path that never announces.
    pub fn set_value(&mut self, value: u16) {
        let value = self.clamp(value);
        self.writer.write(self.channel, value);
        self.current_value = value;
    }

    pub fn set_msg_on_start(&mut self, enable: bool) {
        self.msg_on_start = enable;
    }

    pub fn set_msg_all_transitions(&mut self, enable: bool) {
        self.msg_all_transitions = enable;
    }

    fn clamp(&self, value: u16) -> u16 {
        if self.is_digital && value > 1 { 1 } else { value }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn number(&self) -> u16 {
        self.number
    }

    #[inline]
    pub fn value(&self) -> u16 {
        self.current_value
    }

    pub fn report_value(&self, outbound: &SharedOutbound) {
        outbound.enqueue(Message::Value {
            source: Source::Output(self.number),
            tic: self.clock_tic,
            value: self.current_value,
        });
    }

    pub fn settings(&self, reason: Reason) -> OutputSettings {
        OutputSettings {
            reason,
            timestamp: self.clock_tic,
            enabled: self.enabled,
            value: self.current_value,
            on_value: self.on_value,
            off_value: self.off_value,
            is_continuous: self.is_continuous,
            on_tics: self.on_tics,
            off_tics: self.off_tics,
            event_code_on: self.code_on,
            event_code_off: self.code_off,
            send_to_computer_on_start: self.msg_on_start,
        }
    }
}

/// Event codes share the line range reserved above ASCII.
fn valid_event_code(code: u16) -> bool {
    code > HIGHEST_ASCII_CODE && code < 256
}

/// All output channels, indexed by output number.
pub struct OutputBank {
    outputs: Vec<Output>,
}

impl OutputBank {
    pub fn new(count: u16, writer: SharedWrite) -> Self {
        let outputs = (0..count)
            .map(|number| Output::new(number, number, writer.clone()))
            .collect();
        Self { outputs }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.outputs.len() as u16
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, number: u16) -> Result<&Output, RigError> {
        self.outputs
            .get(usize::from(number))
            .ok_or(RigError::Config("output number is too high"))
    }

    pub fn get_mut(&mut self, number: u16) -> Result<&mut Output, RigError> {
        self.outputs
            .get_mut(usize::from(number))
            .ok_or(RigError::Config("output number is too high"))
    }

    pub fn advance_all(&mut self, tic: u64, codes: &EventCodeChannel, outbound: &SharedOutbound) {
        for output in &mut self.outputs {
            output.advance(tic, codes, outbound);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
