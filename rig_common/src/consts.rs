//! System-wide constants for the rig workspace.
//!
//! Single source of truth for all numeric limits and cadences.
//! Imported by all crates — no duplication permitted.

use static_assertions::const_assert;

/// High-priority event-code queue capacity (only a few slots needed).
pub const HIGH_CODE_QUEUE_LEN: u16 = 20;

/// Low-priority event-code queue capacity (text packets land here).
pub const LOW_CODE_QUEUE_LEN: u16 = 500;

/// Microseconds between latching the code lines and moving the strobe.
pub const CODE_TO_STROBE_DELAY_US: u32 = 1;

/// Default event-code line width in bits (max code = 2^bits - 1).
pub const DEFAULT_CODE_BITS: u16 = 8;

/// Highest ASCII byte. Codes at or below this are text territory and are
/// rejected by the high-priority queue and by transition-code setters.
pub const HIGHEST_ASCII_CODE: u16 = 127;

/// Sub-tic multiplier: the timer fires this many times per control tic.
/// Event-code transmission runs every timer period, the expensive phase
/// every `FREQ_MULTIPLIER`-th.
pub const FREQ_MULTIPLIER: u16 = 10;

/// History lengths above this emit a non-fatal warning (copy cost grows).
pub const HISTORY_LENGTH_WARN: u16 = 4096;

/// Sentinel history-snapshot count meaning "as many samples as buffered".
pub const HISTORY_COUNT_ALL: u16 = u16::MAX;

/// Default control-tic frequency [Hz].
pub const DEFAULT_TIC_HZ: u32 = 1_000;

/// Indicator heartbeat on-duration [ms].
pub const HEARTBEAT_ON_MS: u32 = 25;

/// Indicator attention-sequence toggle period [ms].
pub const ATTENTION_PERIOD_MS: u32 = 50;

// The reserved transition-code range must exist below the smallest
// supported line width.
const_assert!(HIGHEST_ASCII_CODE < (1 << DEFAULT_CODE_BITS) - 1);
// The front-of-queue reorder is O(high capacity); keep it small.
const_assert!(HIGH_CODE_QUEUE_LEN < LOW_CODE_QUEUE_LEN);
