//! Capability traits consumed by the engine.
//!
//! The engine never touches peripherals directly: acquisition, output
//! drive, event-code lines, indicator lamps and the coprocessor clock
//! are all injected behind these traits at construction time. Blanket
//! impls for closures keep tests and the simulation binary terse.

use std::sync::Arc;

/// Reads one raw sample from an acquisition channel.
///
/// The coprocessor keeps the backing sample fresh in shared memory, so a
/// read never blocks.
pub trait ReadChannel: Send + Sync {
    fn read(&self, channel: u16) -> u16;
}

impl<F> ReadChannel for F
where
    F: Fn(u16) -> u16 + Send + Sync,
{
    fn read(&self, channel: u16) -> u16 {
        self(channel)
    }
}

/// Drives one output channel to a level.
pub trait WriteChannel: Send + Sync {
    fn write(&self, channel: u16, value: u16);
}

impl<F> WriteChannel for F
where
    F: Fn(u16, u16) + Send + Sync,
{
    fn write(&self, channel: u16, value: u16) {
        self(channel, value)
    }
}

/// Parallel event-code lines plus the strobe pin.
pub trait CodeLines: Send + Sync {
    /// Latch a code onto the parallel lines.
    fn set_code(&self, code: u16);
    /// Raise or lower the strobe line.
    fn set_strobe(&self, on: bool);
}

/// Indicator lamps on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lamp {
    /// Once-per-second heartbeat blink.
    Heartbeat,
    /// Attention lamp, toggled by the operator-requested sequence.
    Attention,
}

pub trait Lamps: Send + Sync {
    fn set(&self, lamp: Lamp, on: bool);
}

impl<F> Lamps for F
where
    F: Fn(Lamp, bool) + Send + Sync,
{
    fn set(&self, lamp: Lamp, on: bool) {
        self(lamp, on)
    }
}

/// Free-running uptime counter maintained by the coprocessor.
///
/// Redundant with the scheduler's own count; used only for divergence
/// diagnostics, never as a time base.
pub trait CoprocClock: Send + Sync {
    fn uptime(&self) -> i64;
}

impl<F> CoprocClock for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn uptime(&self) -> i64 {
        self()
    }
}

/// Shared handle aliases used throughout the engine.
pub type SharedRead = Arc<dyn ReadChannel>;
pub type SharedWrite = Arc<dyn WriteChannel>;
pub type SharedCodeLines = Arc<dyn CodeLines>;
pub type SharedLamps = Arc<dyn Lamps>;
pub type SharedCoprocClock = Arc<dyn CoprocClock>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    #[test]
    fn closure_capabilities() {
        let reader: SharedRead = Arc::new(|ch: u16| ch + 100);
        assert_eq!(reader.read(3), 103);

        let last = Arc::new(AtomicU16::new(0));
        let sink = last.clone();
        let writer: SharedWrite = Arc::new(move |_ch: u16, v: u16| {
            sink.store(v, Ordering::Relaxed);
        });
        writer.write(0, 42);
        assert_eq!(last.load(Ordering::Relaxed), 42);
    }
}
