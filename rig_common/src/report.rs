//! Structured outbound messages.
//!
//! Everything the engine reports to the host computer — readouts,
//! transitions, history blocks, settings snapshots, diagnostics — is a
//! typed [`Message`] handed to an [`Outbound`] sink. The sink is
//! best-effort and non-blocking: a full sink returns `false` and the
//! message is dropped. The wire encoding (JSON or otherwise) is the
//! collaborator's problem; these types only need to serialize.

use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Why a settings/value message was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Get,
    Set,
    ExternalEvent,
}

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Input(u16),
    Output(u16),
    Scheduler,
    EventCodes,
}

/// A block of history samples copied out of an input's ring.
///
/// The engine keeps the second `Arc` reference until the consumer drops
/// theirs; while both exist the input's copy buffer is considered
/// in flight and further retrieval requests are rejected.
#[derive(Debug, Clone)]
pub struct HistoryBlock(pub Arc<Vec<u16>>);

impl Serialize for HistoryBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// Target fields as presented on the wire (digital or analog form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TargetFields {
    Digital {
        target: u16,
    },
    Analog {
        target_type: &'static str,
        target_value: u16,
        target_distance: u16,
    },
}

/// Full input settings snapshot, mirroring every setter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSettings {
    pub reason: Reason,
    pub timestamp: u64,
    pub enabled: bool,
    pub digital: bool,
    pub value: u16,
    pub history_enabled: bool,
    pub history_length: u16,
    pub all_transitions: bool,
    pub send_to_computer: bool,
    pub actions_enabled: bool,
    pub actions_disabled_after_met: bool,
    pub readout_enabled: bool,
    pub readout_tics: u64,
    pub timeout_tics: u64,
    pub event_code_met: u16,
    pub event_code_left: u16,
    pub output_enabled: bool,
    pub has_output: bool,
    pub output_disabled_after_met: bool,
    pub output_cycles: u16,
    pub output_delay_tics: u64,
    pub has_parent: bool,
    pub has_child: bool,
    pub target_set: bool,
    pub target_met: bool,
    pub target_met_min_tics: u64,
    pub target_left_min_tics: u64,
    pub threshold_count: u16,
    pub target: Option<TargetFields>,
}

/// Full output settings snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSettings {
    pub reason: Reason,
    pub timestamp: u64,
    pub enabled: bool,
    pub value: u16,
    pub on_value: u16,
    pub off_value: u16,
    pub is_continuous: bool,
    pub on_tics: u64,
    pub off_tics: u64,
    pub event_code_on: u16,
    pub event_code_off: u16,
    pub send_to_computer_on_start: bool,
}

/// One outbound message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Current value readout (`reason: get` in the original protocol).
    Value { source: Source, tic: u64, value: u16 },
    /// Threshold counter readout.
    ThresholdCount { input: u16, tic: u64, count: u16 },
    /// An input target transition that was promoted past hysteresis.
    Transition {
        input: u16,
        tic: u64,
        target_met: bool,
        output_queued: bool,
    },
    /// An output level transition (on/off edge of a cycle).
    OutputTransition { output: u16, tic: u64, on: bool },
    /// A copied history block.
    History {
        input: u16,
        tic: u64,
        values: HistoryBlock,
    },
    /// Input settings snapshot.
    InputSettings { input: u16, settings: InputSettings },
    /// Output settings snapshot.
    OutputSettings { output: u16, settings: OutputSettings },
    /// Low-priority queue occupancy report.
    QueueAvailable {
        available: u16,
        packet_id: Option<u32>,
        packet_i: Option<u32>,
        packet_count: Option<u32>,
    },
    /// Scheduler uptime in seconds.
    Uptime { seconds: f64 },
    /// Current experiment timestamp.
    Timestamp { tic: u64 },
    /// Free-form status note.
    Status { text: &'static str },
    /// Non-fatal failure report.
    Diagnostic {
        source: Source,
        tic: u64,
        error: String,
    },
}

/// Best-effort outbound sink.
///
/// `enqueue` must not block; returning `false` means the message was
/// dropped (the caller may count it but must carry on).
pub trait Outbound: Send + Sync {
    fn enqueue(&self, msg: Message) -> bool;
}

/// Shared sink handle.
pub type SharedOutbound = Arc<dyn Outbound>;

/// Discards everything. Useful for benches.
pub struct NullSink;

impl Outbound for NullSink {
    fn enqueue(&self, _msg: Message) -> bool {
        true
    }
}

/// Collects messages in memory. Used by tests across the workspace.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything collected so far.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut self.messages.lock().expect("sink poisoned"))
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Outbound for MemorySink {
    fn enqueue(&self, msg: Message) -> bool {
        self.messages.lock().expect("sink poisoned").push(msg);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_and_drains() {
        let sink = MemorySink::new();
        assert!(sink.enqueue(Message::Timestamp { tic: 7 }));
        assert!(sink.enqueue(Message::Status { text: "ok" }));
        assert_eq!(sink.len(), 2);
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn history_block_serializes_as_seq() {
        let block = HistoryBlock(Arc::new(vec![1u16, 2, 3]));
        let json = serde_json_like(&block);
        assert_eq!(json, "[1,2,3]");
    }

    // toml can't express a bare seq at top level; use a tiny wrapper.
    fn serde_json_like(block: &HistoryBlock) -> String {
        #[derive(Serialize)]
        struct W<'a> {
            v: &'a HistoryBlock,
        }
        let s = toml::to_string(&W { v: block }).expect("serialize");
        s.trim().trim_start_matches("v = ").replace(' ', "")
    }
}
