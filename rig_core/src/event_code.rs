//! Event-code output channel.
//!
//! Codes go out on a parallel set of lines plus a strobe, two timer
//! periods per code: one period latches the lines and raises the strobe,
//! the next lowers the strobe and clears the lines, so the recording
//! host always sees a clean edge. Two queues feed the lines: a small
//! high-priority queue for event codes (values above the ASCII range)
//! and a large low-priority queue for bulk data and text. The high
//! queue is always drained first.
//!
//! Foreground senders and the timer context share the queues, so all
//! state lives in a [`Shared`] cell and the channel hands out `&self`
//! methods only.

use std::sync::Arc;
use std::time::Duration;

use rig_common::consts::{
    CODE_TO_STROBE_DELAY_US, HIGHEST_ASCII_CODE, HIGH_CODE_QUEUE_LEN, LOW_CODE_QUEUE_LEN,
};
use rig_common::error::RigError;
use rig_common::io::SharedCodeLines;
use rig_common::report::{Message, SharedOutbound, Source};

use crate::critical::Shared;
use crate::ring::RingQueue;

/// Metadata identifying a text packet, echoed back in the
/// queue-available report so the host can pace its transfers.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub id: u32,
    pub index: u32,
    pub count: u32,
}

struct ChannelState {
    high: RingQueue,
    low: RingQueue,
    strobe_raised: bool,
    /// false while the counting test pattern runs.
    normal_mode: bool,
    testing_code: u16,
    /// Low-queue watermark; 0 disables the notification.
    notify_available: u16,
    /// Experiment tic as of the last service call, for diagnostics.
    tic: u64,
}

pub struct EventCodeChannel {
    state: Shared<ChannelState>,
    lines: SharedCodeLines,
    outbound: SharedOutbound,
    max_code: u16,
}

impl EventCodeChannel {
    pub fn new(
        lines: SharedCodeLines,
        outbound: SharedOutbound,
        max_code: u16,
    ) -> Result<Arc<Self>, RigError> {
        if max_code <= HIGHEST_ASCII_CODE {
            return Err(RigError::Config("code lines too narrow for event codes"));
        }
        Ok(Arc::new(Self {
            state: Shared::new(ChannelState {
                high: RingQueue::new(HIGH_CODE_QUEUE_LEN)?,
                low: RingQueue::new(LOW_CODE_QUEUE_LEN)?,
                strobe_raised: false,
                normal_mode: true,
                testing_code: 0,
                notify_available: 0,
                tic: 0,
            }),
            lines,
            outbound,
            max_code,
        }))
    }

    // ─── Foreground senders ──────────────────────────────────────────────────

    /// Queue a low-priority code. Anything nonzero up to the line width
    /// is allowed here. Fails when the queue is full.
    pub fn send_low(&self, code: u16) -> Result<(), RigError> {
        if code == 0 || code > self.max_code {
            return Err(RigError::Config("code outside of range"));
        }
        self.state.with(|state| {
            if state.low.is_full() {
                return Err(RigError::Capacity("the event code queue is full"));
            }
            state.low.write(code);
            Ok(())
        })
    }

    /// Queue a high-priority event code (outside the ASCII range).
    /// High priority cannot wait: a full queue drops the code.
    pub fn send_high(&self, code: u16) -> Result<(), RigError> {
        self.check_event_code(code)?;
        self.state.with(|state| {
            if state.high.is_full() {
                return Err(RigError::Capacity("no room for high priority event code"));
            }
            state.high.write(code);
            Ok(())
        })
    }

    /// Queue a high-priority event code ahead of anything already
    /// queued, so it goes out on the very next code slot.
    pub fn send_high_at_front(&self, code: u16) -> Result<(), RigError> {
        self.check_event_code(code)?;
        self.state.with(|state| {
            if state.high.is_empty() {
                state.high.write(code);
                return Ok(());
            }
            if state.high.is_full() {
                return Err(RigError::Capacity("no room for high priority event code"));
            }
            // Rotate: append the new code, then cycle the older codes
            // around behind it.
            let queued = state.high.in_use();
            state.high.write(code);
            for _ in 0..queued {
                let older = state
                    .high
                    .read()
                    .ok_or(RigError::Consistency("high queue drained mid-rotate"))?;
                state.high.write(older);
            }
            Ok(())
        })
    }

    /// Queue a batch of low-priority event codes, waiting for queue
    /// space as needed. Codes outside the event range are reported and
    /// skipped, the rest of the batch still goes out.
    pub fn send_codes(&self, codes: &[u16]) {
        for &code in codes {
            if code <= HIGHEST_ASCII_CODE {
                self.report_code_error("event code within ascii range", code);
                continue;
            }
            if code > self.max_code {
                self.report_code_error("event code above the line width", code);
                continue;
            }
            self.send_low_waiting(code);
        }
    }

    /// Queue a block of text for the recording host, one character per
    /// code slot, waiting for queue space as needed. Ends with a
    /// queue-available report echoing the packet metadata.
    pub fn send_text(&self, text: &str, packet: Option<PacketInfo>) {
        for ch in text.chars() {
            let code = ch as u32;
            if code == 0 || code > u32::from(HIGHEST_ASCII_CODE) {
                self.report_code_error("text char outside ascii range", code as u16);
                continue;
            }
            self.send_low_waiting(code as u16);
        }
        self.report_available(packet);
    }

    fn send_low_waiting(&self, code: u16) {
        loop {
            let queued = self.state.with(|state| {
                if state.low.is_full() {
                    false
                } else {
                    state.low.write(code);
                    true
                }
            });
            if queued {
                return;
            }
            // The timer context drains one code every other period.
            std::hint::spin_loop();
        }
    }

    // ─── Queries and mode switches ───────────────────────────────────────────

    /// Free slots in the low-priority queue.
    pub fn low_available(&self) -> u16 {
        self.state.with(|state| state.low.available())
    }

    /// Emit a queue-available report.
    pub fn report_available(&self, packet: Option<PacketInfo>) {
        let available = self.low_available();
        self.outbound.enqueue(Message::QueueAvailable {
            available,
            packet_id: packet.map(|p| p.id),
            packet_i: packet.map(|p| p.index),
            packet_count: packet.map(|p| p.count),
        });
    }

    /// Arm a notification for when the low queue drains back to exactly
    /// `available` free slots. 0 disarms.
    pub fn set_watermark(&self, available: u16) -> Result<(), RigError> {
        if available >= LOW_CODE_QUEUE_LEN {
            return Err(RigError::Config("available count is too large"));
        }
        self.state.with(|state| state.notify_available = available);
        Ok(())
    }

    /// Replace queue output with a counting test pattern (one code per
    /// slot, 0 through the line maximum, wrapping).
    pub fn set_testing_mode(&self, enable: bool) {
        self.state.with(|state| {
            if enable {
                state.testing_code = 0;
            }
            state.normal_mode = !enable;
        });
        self.outbound.enqueue(Message::Status {
            text: if enable {
                "enable event code testing mode"
            } else {
                "disable event code testing mode"
            },
        });
    }

    // ─── Timer context ───────────────────────────────────────────────────────

    /// One strobe-protocol step, called every timer period.
    ///
    /// Odd uptime counts only ever lower the strobe and clear the
    /// lines; even counts latch the next code and raise it. A code
    /// therefore occupies the lines for one full period.
    pub fn service(&self, uptime_count: i64, tic: u64) {
        self.state.with(|state| {
            state.tic = tic;

            if uptime_count & 1 != 0 {
                if state.strobe_raised {
                    self.lines.set_strobe(false);
                    state.strobe_raised = false;
                    settle();
                    self.lines.set_code(0);
                }
                return;
            }

            if state.notify_available > 0
                && state.low.available() == state.notify_available
            {
                // Equality, so the crossing is reported just once.
                self.outbound.enqueue(Message::QueueAvailable {
                    available: state.low.available(),
                    packet_id: None,
                    packet_i: None,
                    packet_count: None,
                });
            }

            if state.normal_mode {
                let next = if !state.high.is_empty() {
                    state.high.read()
                } else {
                    state.low.read()
                };
                if let Some(code) = next {
                    self.lines.set_code(code);
                    settle();
                    self.lines.set_strobe(true);
                    state.strobe_raised = true;
                }
            } else {
                self.lines.set_code(state.testing_code);
                settle();
                self.lines.set_strobe(true);
                state.strobe_raised = true;
                state.testing_code = if state.testing_code < self.max_code {
                    state.testing_code + 1
                } else {
                    0
                };
            }
        });
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn check_event_code(&self, code: u16) -> Result<(), RigError> {
        if code <= HIGHEST_ASCII_CODE || code > self.max_code {
            return Err(RigError::Config("code outside of range"));
        }
        Ok(())
    }

    fn report_code_error(&self, text: &str, code: u16) {
        let tic = self.state.with(|state| state.tic);
        self.outbound.enqueue(Message::Diagnostic {
            source: Source::EventCodes,
            tic,
            error: format!("{text}: {code}"),
        });
    }
}

/// Line settle delay between driving the code pins and the strobe pin.
fn settle() {
    std::thread::sleep(Duration::from_micros(u64::from(CODE_TO_STROBE_DELAY_US)));
}

// ─── Tests ───────────────────────────────────────────────────────────────────
