//! The fixed-rate tic scheduler.
//!
//! The hardware timer fires at `tic_hz * FREQ_MULTIPLIER`; only every
//! Nth period is an expensive tic that refreshes and evaluates all
//! inputs, advances all outputs, emits any due history snapshot and
//! applies a deferred clock reset. The other periods only service the
//! event-code strobe protocol, which needs the higher rate for clean
//! edges. Foreground commands mutate the same state through a
//! [`Shared`](crate::critical::Shared) cell around the whole scheduler.

use std::sync::Arc;

use rig_common::config::RigConfig;
use rig_common::consts::{
    ATTENTION_PERIOD_MS, FREQ_MULTIPLIER, HEARTBEAT_ON_MS, HISTORY_COUNT_ALL,
};
use rig_common::error::RigError;
use rig_common::io::{
    Lamp, SharedCodeLines, SharedCoprocClock, SharedLamps, SharedRead, SharedWrite,
};
use rig_common::report::{Message, SharedOutbound, Source};

use crate::event_code::EventCodeChannel;
use crate::input::InputBank;
use crate::output::OutputBank;

/// Everything the engine drives or samples, injected at construction.
pub struct Wiring {
    pub digital_in: SharedRead,
    pub analog_in: SharedRead,
    pub digital_out: SharedWrite,
    pub code_lines: SharedCodeLines,
    pub lamps: SharedLamps,
    pub coproc: SharedCoprocClock,
    pub outbound: SharedOutbound,
}

// ─── Indicator lamps ─────────────────────────────────────────────────────────

/// Heartbeat blink plus the operator-requested attention sequence.
struct Indicator {
    lamps: SharedLamps,
    heartbeat_lit: bool,
    attention_lit: bool,
    heartbeat_off_at: i64,
    on_duration: i64,
    period_tics: u32,
    pause_count: u32,
    twiddle_count: u16,
    twiddling: bool,
}

impl Indicator {
    fn new(lamps: SharedLamps, timer_hz: u32) -> Self {
        Self {
            lamps,
            heartbeat_lit: false,
            attention_lit: false,
            heartbeat_off_at: 0,
            on_duration: i64::from(HEARTBEAT_ON_MS * timer_hz / 1000),
            period_tics: (ATTENTION_PERIOD_MS * timer_hz / 1000).max(1),
            pause_count: 0,
            twiddle_count: 0,
            twiddling: false,
        }
    }

    fn set(&mut self, lamp: Lamp, on: bool) {
        match lamp {
            Lamp::Heartbeat => self.heartbeat_lit = on,
            Lamp::Attention => self.attention_lit = on,
        }
        self.lamps.set(lamp, on);
    }

    fn request_attention(&mut self, toggles: u16) {
        self.twiddle_count = self.twiddle_count.saturating_add(toggles);
    }

    fn run(&mut self, uptime: i64, second_boundary: bool) {
        if self.twiddle_count == 0 && !self.twiddling {
            if uptime == self.heartbeat_off_at {
                self.set(Lamp::Heartbeat, false);
            }
            if second_boundary {
                self.set(Lamp::Heartbeat, true);
                self.heartbeat_off_at = uptime + self.on_duration;
            }
            return;
        }

        if !self.twiddling {
            // Start out of phase so the toggles are visible.
            self.set(Lamp::Attention, false);
            self.set(Lamp::Heartbeat, true);
            self.pause_count = 0;
            self.twiddle_count -= 1;
            self.twiddling = true;
            return;
        }

        self.pause_count += 1;
        if self.pause_count % self.period_tics == 0 {
            if self.twiddle_count > 0 {
                let heartbeat = self.heartbeat_lit;
                let attention = self.attention_lit;
                self.set(Lamp::Heartbeat, !heartbeat);
                self.set(Lamp::Attention, !attention);
                self.twiddle_count -= 1;
            } else {
                self.set(Lamp::Heartbeat, false);
                self.set(Lamp::Attention, false);
                self.pause_count = 0;
                self.twiddling = false;
            }
        }
    }
}

// ─── History snapshots ───────────────────────────────────────────────────────

/// Armed periodic retrieval of history blocks for a set of inputs.
struct HistorySnapshot {
    armed: bool,
    selected: Vec<bool>,
    count: u16,
    every_tics: u64,
}

impl HistorySnapshot {
    fn new(input_count: u16) -> Self {
        Self {
            armed: false,
            selected: vec![false; usize::from(input_count)],
            count: 0,
            every_tics: 1,
        }
    }

    fn clear(&mut self) {
        self.armed = false;
        self.every_tics = 1;
        self.selected.fill(false);
    }

    fn due(&self, tic: u64) -> bool {
        self.armed && tic % self.every_tics == 0
    }

    /// Emit one block per selected input. Skipped without clearing if a
    /// previous block is still in flight or too few samples have
    /// accumulated; cleared on an occupancy mismatch, which means the
    /// selection itself stopped making sense.
    fn emit(&mut self, inputs: &mut InputBank, tic: u64, outbound: &SharedOutbound) {
        let mut available = 0u16;
        let mut selected_count = 0u16;

        for number in 0..inputs.len() {
            if !self.selected[usize::from(number)] {
                continue;
            }
            selected_count += 1;
            let input = match inputs.get(number) {
                Ok(input) => input,
                Err(_) => continue,
            };
            if input.history_copy_in_flight() {
                return;
            }
            if selected_count == 1 {
                available = input.history_used();
            } else if available != input.history_used() {
                outbound.enqueue(Message::Diagnostic {
                    source: Source::Scheduler,
                    tic,
                    error: "history lengths are not consistent for selected inputs".into(),
                });
                self.clear();
                return;
            }
        }

        if selected_count == 0 || available == 0 {
            return;
        }

        let mut actual = self.count;
        if actual > available {
            if actual == HISTORY_COUNT_ALL {
                actual = available;
            } else {
                // A specific count was requested; wait for it.
                return;
            }
        }
        if actual == 0 {
            return;
        }

        for number in 0..inputs.len() {
            if !self.selected[usize::from(number)] {
                continue;
            }
            match inputs.get_mut(number).and_then(|i| i.copy_history(actual)) {
                Ok(message) => {
                    outbound.enqueue(message);
                }
                Err(error) => {
                    outbound.enqueue(Message::Diagnostic {
                        source: Source::Input(number),
                        tic,
                        error: error.to_string(),
                    });
                }
            }
        }

        // A cadence of 1 means one shot.
        if self.every_tics == 1 {
            self.clear();
        }
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct Scheduler {
    inputs: InputBank,
    outputs: OutputBank,
    codes: Arc<EventCodeChannel>,
    outbound: SharedOutbound,
    coproc: SharedCoprocClock,
    indicator: Indicator,
    snapshot: HistorySnapshot,

    timer_hz: u32,
    tic: u64,
    uptime_count: i64,
    sub_tic: u16,
    second_tic: u32,
    second_boundary: bool,
    previous_cumulative: i64,

    reset_requested: bool,
    reset_event_code: u16,
    status_enabled: bool,
    status_full: bool,
}

impl Scheduler {
    pub fn new(config: &RigConfig, wiring: Wiring) -> Result<Self, RigError> {
        let codes = EventCodeChannel::new(
            wiring.code_lines,
            wiring.outbound.clone(),
            config.max_code(),
        )?;
        let outputs = OutputBank::new(config.outputs, wiring.digital_out);
        let inputs = InputBank::new(
            config.digital_inputs,
            config.analog_inputs,
            wiring.digital_in,
            wiring.analog_in,
        );
        let timer_hz = config.timer_hz();

        Ok(Self {
            snapshot: HistorySnapshot::new(inputs.len()),
            indicator: Indicator::new(wiring.lamps, timer_hz),
            inputs,
            outputs,
            codes,
            outbound: wiring.outbound,
            coproc: wiring.coproc,
            timer_hz,
            tic: 0,
            uptime_count: 0,
            sub_tic: 0,
            second_tic: 0,
            second_boundary: false,
            previous_cumulative: 0,
            reset_requested: false,
            reset_event_code: 0,
            status_enabled: false,
            status_full: true,
        })
    }

    // ─── Timer context ───────────────────────────────────────────────────────

    /// One timer period. Every `FREQ_MULTIPLIER`th call is an
    /// expensive tic; the rest only service the code lines.
    pub fn advance(&mut self) {
        // The redundant coprocessor count should track ours exactly;
        // report divergence once per second, when it changes.
        let cumulative = self.coproc.uptime() - self.uptime_count;
        if cumulative != self.previous_cumulative && self.second_boundary {
            self.outbound.enqueue(Message::Diagnostic {
                source: Source::Scheduler,
                tic: self.tic,
                error: format!(
                    "inconsistent coprocessor and scheduler uptimes (cumulative {cumulative})"
                ),
            });
            self.previous_cumulative = cumulative;
        }

        self.second_boundary = self.second_tic == 0;
        self.second_tic += 1;
        if self.second_tic == self.timer_hz {
            self.second_tic = 0;
        }

        if self.sub_tic == 0 {
            self.expensive_tic();
        }
        self.sub_tic += 1;
        if self.sub_tic == FREQ_MULTIPLIER {
            self.sub_tic = 0;
        }

        self.codes.service(self.uptime_count, self.tic);

        if self.status_enabled && self.second_boundary {
            self.emit_status();
        }

        self.indicator.run(self.uptime_count, self.second_boundary);

        self.uptime_count += 1;
    }

    fn expensive_tic(&mut self) {
        // All values first, so chained comparisons see one coherent
        // sample set.
        self.inputs.refresh_all(self.tic);
        self.inputs
            .evaluate_all(self.tic, &mut self.outputs, &self.codes, &self.outbound);
        self.outputs
            .advance_all(self.tic, &self.codes, &self.outbound);

        if self.snapshot.due(self.tic) {
            self.snapshot
                .emit(&mut self.inputs, self.tic, &self.outbound);
        }

        // Deferred until after everything ran, so a reset never
        // corrupts an in-flight evaluation.
        if self.reset_requested {
            if self.reset_event_code != 0 {
                if let Err(error) = self.codes.send_high_at_front(self.reset_event_code) {
                    self.outbound.enqueue(Message::Diagnostic {
                        source: Source::Scheduler,
                        tic: self.tic,
                        error: error.to_string(),
                    });
                }
            }
            self.outbound.enqueue(Message::Status {
                text: "experiment clock was reset",
            });
            self.reset_requested = false;
            self.tic = 0;
        }

        self.tic += 1;
    }

    fn emit_status(&self) {
        self.outbound.enqueue(Message::Uptime {
            seconds: self.uptime_seconds(),
        });
        if self.status_full {
            self.outbound.enqueue(Message::Timestamp { tic: self.tic });
            self.codes.report_available(None);
        }
    }

    // ─── Foreground commands ─────────────────────────────────────────────────

    /// Reset the experiment clock at the end of the next expensive tic,
    /// optionally marking the reset on the code lines ahead of
    /// anything queued.
    pub fn request_clock_reset(&mut self, event_code: Option<u16>) {
        self.reset_requested = true;
        if let Some(code) = event_code {
            self.reset_event_code = code;
        }
    }

    pub fn set_status_messages(&mut self, enable: bool, full: bool) {
        self.status_enabled = enable;
        self.status_full = full;
        self.outbound.enqueue(Message::Status {
            text: match (enable, full) {
                (true, true) => "full status messages enabled",
                (true, false) => "minimal status messages enabled",
                (false, _) => "status messages disabled",
            },
        });
    }

    pub fn request_attention(&mut self) {
        self.indicator.request_attention(10);
    }

    /// Arm periodic history retrieval for a set of inputs. All selected
    /// inputs must have history enabled, with equal lengths.
    pub fn arm_history_snapshot(
        &mut self,
        numbers: &[u16],
        count: Option<u16>,
        every_tics: u64,
    ) -> Result<(), RigError> {
        self.snapshot.clear();

        let mut length = 0u16;
        for &number in numbers {
            let input = self.inputs.get_mut(number)?;
            if input.history_length() == 0 {
                self.snapshot.clear();
                return Err(RigError::Config("history not enabled for input"));
            }
            input.enable_history_copy(true)?;
            if length == 0 {
                length = input.history_length();
            } else if length != input.history_length() {
                self.snapshot.clear();
                return Err(RigError::Consistency(
                    "history lengths are not consistent for selected inputs",
                ));
            }
            self.snapshot.selected[usize::from(number)] = true;
            self.snapshot.armed = true;
        }

        self.snapshot.count = count.unwrap_or(HISTORY_COUNT_ALL);
        self.snapshot.every_tics = every_tics.max(1);
        Ok(())
    }

    pub fn stop_history_snapshot(&mut self) {
        self.snapshot.clear();
    }

    /// Point an input at an output channel (or clear the link). Lives
    /// here because the validation needs both banks.
    pub fn link_input_output(
        &mut self,
        input: u16,
        output: Option<u16>,
    ) -> Result<(), RigError> {
        self.inputs.link_output(input, output, &self.outputs)
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.tic
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.uptime_count as f64 / f64::from(self.timer_hz)
    }

    pub fn report_uptime(&self) {
        self.outbound.enqueue(Message::Uptime {
            seconds: self.uptime_seconds(),
        });
    }

    pub fn report_timestamp(&self) {
        self.outbound.enqueue(Message::Timestamp { tic: self.tic });
    }

    #[inline]
    pub fn inputs(&self) -> &InputBank {
        &self.inputs
    }

    #[inline]
    pub fn inputs_mut(&mut self) -> &mut InputBank {
        &mut self.inputs
    }

    #[inline]
    pub fn outputs(&self) -> &OutputBank {
        &self.outputs
    }

    #[inline]
    pub fn outputs_mut(&mut self) -> &mut OutputBank {
        &mut self.outputs
    }

    #[inline]
    pub fn codes(&self) -> &Arc<EventCodeChannel> {
        &self.codes
    }

    #[inline]
    pub fn outbound(&self) -> &SharedOutbound {
        &self.outbound
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Target;
    use rig_common::report::MemorySink;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct QuietLines;
    impl rig_common::io::CodeLines for QuietLines {
        fn set_code(&self, _code: u16) {}
        fn set_strobe(&self, _on: bool) {}
    }

    struct LampLog(Mutex<Vec<(Lamp, bool)>>);
    impl rig_common::io::Lamps for LampLog {
        fn set(&self, lamp: Lamp, on: bool) {
            self.0.lock().unwrap().push((lamp, on));
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        sink: Arc<MemorySink>,
        coproc: Arc<AtomicI64>,
        lamp_log: Arc<LampLog>,
        digital: Arc<Mutex<Vec<u16>>>,
    }

    fn fixture(tic_hz: u32) -> Fixture {
        let config = RigConfig {
            tic_hz,
            digital_inputs: 4,
            analog_inputs: 4,
            outputs: 2,
            ..Default::default()
        };

        let digital = Arc::new(Mutex::new(vec![0u16; 4]));
        let digital_in: SharedRead = {
            let levels = digital.clone();
            Arc::new(move |ch: u16| levels.lock().unwrap()[usize::from(ch)])
        };
        let coproc = Arc::new(AtomicI64::new(0));
        let coproc_clock: SharedCoprocClock = {
            let count = coproc.clone();
            Arc::new(move || count.load(Ordering::Relaxed))
        };
        let sink = Arc::new(MemorySink::new());
        let lamp_log = Arc::new(LampLog(Mutex::new(Vec::new())));

        let wiring = Wiring {
            digital_in,
            analog_in: Arc::new(|_: u16| 0u16),
            digital_out: Arc::new(|_: u16, _: u16| {}),
            code_lines: Arc::new(QuietLines),
            lamps: lamp_log.clone(),
            coproc: coproc_clock,
            outbound: sink.clone(),
        };

        Fixture {
            scheduler: Scheduler::new(&config, wiring).expect("scheduler"),
            sink,
            coproc,
            lamp_log,
            digital,
        }
    }

    /// Keep the redundant clock in lockstep while advancing.
    fn advance(fixture: &mut Fixture, periods: u32) {
        for _ in 0..periods {
            fixture.scheduler.advance();
            fixture.coproc.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn one_expensive_tic_per_multiplier_periods() {
        let mut fixture = fixture(1000);
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER) * 5);
        assert_eq!(fixture.scheduler.timestamp(), 5);

        advance(&mut fixture, 3);
        // A partial group does not advance the experiment clock.
        assert_eq!(fixture.scheduler.timestamp(), 5);
    }

    #[test]
    fn clock_reset_is_deferred_to_the_end_of_a_tic() {
        let mut fixture = fixture(1000);
        {
            let input = fixture.scheduler.inputs_mut().get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
        }
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER) * 3);
        assert_eq!(fixture.scheduler.timestamp(), 3);
        fixture.sink.drain();

        fixture.digital.lock().unwrap()[0] = 1;
        fixture.scheduler.request_clock_reset(Some(200));
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER));

        // The transition was evaluated on the old clock, then the
        // reset landed and restarted the count.
        let messages = fixture.sink.drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::Transition { tic: 3, target_met: true, .. }
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::Status { text: "experiment clock was reset" }
        )));
        assert_eq!(fixture.scheduler.timestamp(), 1);
    }

    #[test]
    fn status_messages_arrive_once_per_second() {
        let mut fixture = fixture(10); // 100 periods per second
        fixture.scheduler.set_status_messages(true, true);
        fixture.sink.drain();

        advance(&mut fixture, 200);
        let messages = fixture.sink.drain();
        let uptimes = messages
            .iter()
            .filter(|m| matches!(m, Message::Uptime { .. }))
            .count();
        assert_eq!(uptimes, 2);
        assert!(messages.iter().any(|m| matches!(m, Message::Timestamp { .. })));
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, Message::QueueAvailable { .. }))
        );

        fixture.scheduler.set_status_messages(true, false);
        fixture.sink.drain();
        advance(&mut fixture, 100);
        let messages = fixture.sink.drain();
        assert!(messages.iter().any(|m| matches!(m, Message::Uptime { .. })));
        assert!(!messages.iter().any(|m| matches!(m, Message::Timestamp { .. })));
    }

    #[test]
    fn clock_divergence_is_reported_once_per_second() {
        let mut fixture = fixture(10);
        advance(&mut fixture, 150);
        assert!(
            !fixture
                .sink
                .drain()
                .iter()
                .any(|m| matches!(m, Message::Diagnostic { .. }))
        );

        // Knock the redundant clock ahead.
        fixture.coproc.fetch_add(7, Ordering::Relaxed);
        advance(&mut fixture, 300);
        let diagnostics = fixture
            .sink
            .drain()
            .into_iter()
            .filter(|m| {
                matches!(m, Message::Diagnostic { source: Source::Scheduler, .. })
            })
            .count();
        // Reported when it changed, not every second after.
        assert_eq!(diagnostics, 1);
    }

    #[test]
    fn uptime_is_scaled_by_the_timer_rate() {
        let mut fixture = fixture(10);
        advance(&mut fixture, 250);
        assert!((fixture.scheduler.uptime_seconds() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn heartbeat_blinks_on_the_second() {
        let mut fixture = fixture(10);
        advance(&mut fixture, 150);
        let log = fixture.lamp_log.0.lock().unwrap();
        let heartbeat_ons = log
            .iter()
            .filter(|(lamp, on)| *lamp == Lamp::Heartbeat && *on)
            .count();
        assert_eq!(heartbeat_ons, 2);
    }

    #[test]
    fn history_snapshot_round_trip() {
        let mut fixture = fixture(1000);
        let outbound: SharedOutbound = fixture.sink.clone();
        for number in [4u16, 5] {
            fixture
                .scheduler
                .inputs_mut()
                .get_mut(number)
                .unwrap()
                .enable_history(true, 16, &outbound)
                .expect("history");
        }

        fixture
            .scheduler
            .arm_history_snapshot(&[4, 5], None, 4)
            .expect("arm");

        // Due immediately at tic 0, one block per selected input.
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER));
        let blocks = |messages: Vec<Message>| {
            messages
                .into_iter()
                .filter(|m| matches!(m, Message::History { .. }))
                .count()
        };
        assert_eq!(blocks(fixture.sink.drain()), 2);

        // Draining released the copies; the next due tic emits again.
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER) * 4);
        assert_eq!(blocks(fixture.sink.drain()), 2);

        // While a block is still held, due tics are skipped quietly.
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER) * 4);
        advance(&mut fixture, u32::from(FREQ_MULTIPLIER) * 4);
        assert_eq!(blocks(fixture.sink.drain()), 2);
    }

    #[test]
    fn snapshot_arming_validates_lengths() {
        let mut fixture = fixture(1000);
        let outbound: SharedOutbound = Arc::new(MemorySink::new());
        fixture
            .scheduler
            .inputs_mut()
            .get_mut(4)
            .unwrap()
            .enable_history(true, 16, &outbound)
            .expect("history");
        fixture
            .scheduler
            .inputs_mut()
            .get_mut(5)
            .unwrap()
            .enable_history(true, 8, &outbound)
            .expect("history");

        assert!(matches!(
            fixture.scheduler.arm_history_snapshot(&[4, 5], None, 1),
            Err(RigError::Consistency(_))
        ));
        // No history at all.
        assert!(fixture.scheduler.arm_history_snapshot(&[0], None, 1).is_err());
    }
}
