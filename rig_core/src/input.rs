//! Input channels: acquisition, targets, hysteresis, history, chains.
//!
//! Every input owns a target description and the hysteresis state that
//! decides when a raw condition flip becomes a real transition. Inputs
//! can be chained parent to child into one composite target: the chain
//! head is the only node evaluated, and for the distance families the
//! chain is treated as coordinates of a single N-dimensional point.
//! Transitions can queue cycles on a linked output channel and emit
//! high-priority event codes.
//!
//! Chain links are indices into the fixed input array, so rewiring can
//! never dangle.

use std::sync::Arc;

use rig_common::consts::{HIGHEST_ASCII_CODE, HISTORY_LENGTH_WARN};
use rig_common::error::RigError;
use rig_common::io::SharedRead;
use rig_common::report::{
    InputSettings, Message, Reason, SharedOutbound, Source, TargetFields,
};

use crate::event_code::EventCodeChannel;
use crate::output::OutputBank;
use crate::ring::RingQueue;

// ─── Targets ─────────────────────────────────────────────────────────────────

/// Relational comparison for analog targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl Relation {
    fn holds(self, value: u16, target: u16) -> bool {
        match self {
            Relation::LessThan => value < target,
            Relation::LessOrEqual => value <= target,
            Relation::GreaterThan => value > target,
            Relation::GreaterOrEqual => value >= target,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Relation::LessThan => "<",
            Relation::LessOrEqual => "<=",
            Relation::GreaterThan => ">",
            Relation::GreaterOrEqual => ">=",
        }
    }
}

/// What an input is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Digital level match.
    Digital { polarity: bool },
    /// One-sided analog comparison.
    Relational { op: Relation, value: u16 },
    /// Per-axis band: |value - target| <= radius.
    Rectangular { value: u16, radius: u16 },
    /// N-dimensional ball across a chain, head radius shared.
    Circular { value: u16, radius: u16 },
    /// N-dimensional ellipsoid across a chain, per-node radii.
    Elliptical { value: u16, radius: u16 },
}

impl Target {
    pub fn is_digital(&self) -> bool {
        matches!(self, Target::Digital { .. })
    }

    /// Chain nodes must watch the same kind of target.
    fn compatible_with(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Digital { .. }, Target::Digital { .. }) => true,
            (Target::Relational { op: a, .. }, Target::Relational { op: b, .. }) => a == b,
            (Target::Rectangular { .. }, Target::Rectangular { .. }) => true,
            (Target::Circular { .. }, Target::Circular { .. }) => true,
            (Target::Elliptical { .. }, Target::Elliptical { .. }) => true,
            _ => false,
        }
    }

    /// Per-node check. The distance ball families only have meaning
    /// through the composite chain walk and are never met standalone.
    fn met_by(&self, value: u16) -> bool {
        match *self {
            Target::Digital { polarity } => value == u16::from(polarity),
            Target::Relational { op, value: target } => op.holds(value, target),
            Target::Rectangular { value: target, radius } => {
                (i32::from(value) - i32::from(target)).abs() <= i32::from(radius)
            }
            Target::Circular { .. } | Target::Elliptical { .. } => false,
        }
    }

    /// Analog center/radius, used by the composite sum.
    fn center_and_radius(&self) -> (u16, u16) {
        match *self {
            Target::Digital { polarity } => (u16::from(polarity), 0),
            Target::Relational { value, .. } => (value, 0),
            Target::Rectangular { value, radius }
            | Target::Circular { value, radius }
            | Target::Elliptical { value, radius } => (value, radius),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Target::Digital { .. } => "digital",
            Target::Relational { op, .. } => op.name(),
            Target::Rectangular { .. } => "rectangular_distance",
            Target::Circular { .. } => "circular_distance",
            Target::Elliptical { .. } => "elliptical_distance",
        }
    }

    fn wire_fields(&self) -> TargetFields {
        match *self {
            Target::Digital { polarity } => TargetFields::Digital {
                target: u16::from(polarity),
            },
            _ => {
                let (value, radius) = self.center_and_radius();
                TargetFields::Analog {
                    target_type: self.type_name(),
                    target_value: value,
                    target_distance: radius,
                }
            }
        }
    }
}

// ─── History ─────────────────────────────────────────────────────────────────

/// Rolling count of buffered samples below a configured value.
struct Threshold {
    value: u16,
    count: u16,
}

/// Sample history with optional threshold counting and a reusable copy
/// buffer for block retrieval.
struct History {
    ring: RingQueue,
    threshold: Option<Threshold>,
    copy: Option<Arc<Vec<u16>>>,
}

impl History {
    /// Record one sample, keeping the threshold count in sync with the
    /// window contents as old samples roll off.
    fn record(&mut self, value: u16) {
        if let Some(threshold) = &mut self.threshold {
            if self.ring.is_full() {
                if let Some(evicted) = self.ring.read() {
                    if evicted < threshold.value && threshold.count > 0 {
                        threshold.count -= 1;
                    }
                }
            }
            if value < threshold.value {
                threshold.count += 1;
                if threshold.count > self.ring.size() {
                    threshold.count = self.ring.size();
                }
            }
        }
        self.ring.write(value);
    }

    /// A previously handed-out copy is still being consumed.
    fn copy_in_flight(&self) -> bool {
        self.copy
            .as_ref()
            .is_some_and(|buf| Arc::strong_count(buf) > 1)
    }
}

// ─── Input channel ───────────────────────────────────────────────────────────

pub struct Input {
    number: u16,
    channel: u16,
    is_digital: bool,
    enabled: bool,
    current_value: u16,
    clock_tic: u64,
    reader: SharedRead,

    target: Option<Target>,
    target_met: bool,
    actions_enabled: bool,
    disable_actions_after_met: bool,
    msg_all_transitions: bool,
    msg_to_computer: bool,

    met_min_tics: u64,
    left_min_tics: u64,
    cond_met_tic: u64,
    cond_left_tic: u64,

    in_timeout: bool,
    timeout_start_tic: u64,
    timeout_tics: u64,

    readout_every_tics: u64,

    code_met: u16,
    code_left: u16,

    output: Option<u16>,
    output_enabled: bool,
    disable_output_after_met: bool,
    output_cycles: u16,
    output_delay_tics: u64,

    parent: Option<u16>,
    child: Option<u16>,

    history: Option<History>,
}

impl Input {
    fn new(number: u16, channel: u16, is_digital: bool, reader: SharedRead) -> Self {
        Self {
            number,
            channel,
            is_digital,
            enabled: true,
            current_value: 0,
            clock_tic: 0,
            reader,
            target: None,
            target_met: false,
            actions_enabled: true,
            disable_actions_after_met: false,
            msg_all_transitions: false,
            msg_to_computer: false,
            met_min_tics: 0,
            left_min_tics: 0,
            cond_met_tic: 0,
            cond_left_tic: 0,
            in_timeout: false,
            timeout_start_tic: 0,
            timeout_tics: 0,
            readout_every_tics: 0,
            code_met: 0,
            code_left: 0,
            output: None,
            output_enabled: true,
            disable_output_after_met: false,
            output_cycles: 1,
            output_delay_tics: 0,
            parent: None,
            child: None,
            history: None,
        }
    }

    // ─── Acquisition ─────────────────────────────────────────────────────────

    /// Refresh the current value and feed the history window.
    fn refresh(&mut self, tic: u64) {
        if !self.enabled {
            return;
        }
        self.clock_tic = tic;
        self.current_value = self.reader.read(self.channel);
        if let Some(history) = &mut self.history {
            history.record(self.current_value);
        }
    }

    // ─── Transition actions ──────────────────────────────────────────────────

    /// Apply a promoted transition to this node: timeout start, output
    /// trigger, messages and event codes, one-shot disarm.
    fn apply_transition(
        &mut self,
        met: bool,
        outputs: &mut OutputBank,
        codes: &EventCodeChannel,
        outbound: &SharedOutbound,
    ) {
        if !self.actions_enabled {
            self.target_met = met;
            return;
        }

        let mut should_send = self.msg_all_transitions && met != self.target_met;
        let mut output_queued = false;

        if met && !self.target_met {
            should_send = true;

            if self.timeout_tics > 0 {
                self.timeout_start_tic = self.clock_tic;
                self.in_timeout = true;
            }

            if self.output_enabled {
                if let Some(number) = self.output {
                    output_queued = true;
                    if self.disable_output_after_met {
                        self.output_enabled = false;
                    }
                    if let Ok(output) = outputs.get_mut(number) {
                        if output.is_continuous() {
                            output.enable(true);
                        } else {
                            output.add_cycles(
                                self.output_cycles,
                                self.clock_tic + self.output_delay_tics,
                            );
                        }
                    }
                }
            }
        }

        if should_send {
            self.announce_transition(met, output_queued, codes, outbound);
        }

        if !met && self.target_met {
            self.cond_met_tic = 0;
            if self.output_enabled {
                if let Some(number) = self.output {
                    if let Ok(output) = outputs.get_mut(number) {
                        if output.is_continuous() {
                            output.enable(false);
                        }
                    }
                }
            }
        }

        self.target_met = met;

        if self.disable_actions_after_met && self.target_met && self.actions_enabled {
            self.actions_enabled = false;
        }
    }

    fn announce_transition(
        &self,
        met: bool,
        output_queued: bool,
        codes: &EventCodeChannel,
        outbound: &SharedOutbound,
    ) {
        if self.msg_to_computer {
            outbound.enqueue(Message::Transition {
                input: self.number,
                tic: self.clock_tic,
                target_met: met,
                output_queued,
            });
        }

        let code = if met { self.code_met } else { self.code_left };
        if code > 0 {
            if let Err(error) = codes.send_high(code) {
                self.report_error(error.to_string(), outbound);
            }
        }
    }

    fn report_error(&self, error: String, outbound: &SharedOutbound) {
        outbound.enqueue(Message::Diagnostic {
            source: Source::Input(self.number),
            tic: self.clock_tic,
            error,
        });
    }

    // ─── Settings ────────────────────────────────────────────────────────────

    pub fn set_target(&mut self, target: Target) -> Result<(), RigError> {
        if target.is_digital() != self.is_digital {
            return Err(RigError::Config("target kind does not match the input"));
        }
        self.target = Some(target);
        Ok(())
    }

    /// Forget a met state without touching the target itself.
    pub fn reset_target(&mut self) {
        self.target_met = false;
        self.cond_met_tic = 0;
    }

    pub fn set_hysteresis(&mut self, met_min_tics: u64, left_min_tics: u64) {
        self.met_min_tics = met_min_tics;
        self.left_min_tics = left_min_tics;
    }

    /// Setting a timeout always cancels a window in progress.
    pub fn set_timeout(&mut self, timeout_tics: u64) {
        self.timeout_tics = timeout_tics;
        self.in_timeout = false;
    }

    pub fn set_readout(&mut self, enable: bool, every_tics: u64) -> Result<(), RigError> {
        if !enable {
            self.readout_every_tics = 0;
            return Ok(());
        }
        if every_tics == 0 {
            return Err(RigError::Config("readout_tics must be > 0"));
        }
        self.readout_every_tics = every_tics;
        Ok(())
    }

    pub fn set_event_codes(&mut self, code_met: u16, code_left: u16) -> Result<(), RigError> {
        let valid = |code: u16| code > HIGHEST_ASCII_CODE && code < 256;
        if !valid(code_met) || !valid(code_left) {
            return Err(RigError::Config("event code outside of range 128-255"));
        }
        self.code_met = code_met;
        self.code_left = code_left;
        Ok(())
    }

    pub fn set_actions_enabled(&mut self, enable: bool) {
        self.actions_enabled = enable;
    }

    pub fn set_disable_actions_after_met(&mut self, enable: bool) {
        self.disable_actions_after_met = enable;
    }

    pub fn set_msg_all_transitions(&mut self, enable: bool) {
        self.msg_all_transitions = enable;
    }

    pub fn set_msg_to_computer(&mut self, enable: bool) {
        self.msg_to_computer = enable;
    }

    pub fn set_output_enabled(&mut self, enable: bool) {
        self.output_enabled = enable;
    }

    pub fn set_disable_output_after_met(&mut self, enable: bool) {
        self.disable_output_after_met = enable;
    }

    pub fn set_output_cycles(&mut self, cycles: u16) -> Result<(), RigError> {
        if cycles == 0 {
            return Err(RigError::Config("output_cycles cannot be 0"));
        }
        self.output_cycles = cycles;
        Ok(())
    }

    pub fn set_output_delay(&mut self, delay_tics: u64) {
        self.output_delay_tics = delay_tics;
    }

    // ─── History ─────────────────────────────────────────────────────────────

    pub fn enable_history(
        &mut self,
        enable: bool,
        length: u16,
        outbound: &SharedOutbound,
    ) -> Result<(), RigError> {
        if enable == self.history.is_some() {
            return Ok(());
        }

        if !enable {
            // Threshold state and the copy buffer go with it.
            self.history = None;
            return Ok(());
        }

        if length == 0 {
            return Err(RigError::Config("history_length must be > 0"));
        }
        if length > HISTORY_LENGTH_WARN {
            self.report_error(
                format!("history lengths > {HISTORY_LENGTH_WARN} slow down copies"),
                outbound,
            );
        }

        self.history = Some(History {
            ring: RingQueue::new(length)?,
            threshold: None,
            copy: None,
        });
        Ok(())
    }

    /// The copy buffer is only allocated once retrieval is actually
    /// requested; it is reused for every block after that.
    pub fn enable_history_copy(&mut self, enable: bool) -> Result<(), RigError> {
        let Some(history) = &mut self.history else {
            if enable {
                return Err(RigError::Config("history is not enabled, cannot enable copy"));
            }
            return Ok(());
        };

        if enable {
            if history.copy.is_none() {
                let capacity = usize::from(history.ring.size());
                history.copy = Some(Arc::new(Vec::with_capacity(capacity)));
            }
        } else {
            history.copy = None;
        }
        Ok(())
    }

    pub fn enable_threshold(&mut self, enable: bool, value: u16) -> Result<(), RigError> {
        if !enable {
            if let Some(history) = &mut self.history {
                history.threshold = None;
            }
            return Ok(());
        }

        let Some(history) = &mut self.history else {
            return Err(RigError::Config(
                "history must be enabled to enable threshold",
            ));
        };
        // Force the window empty so the count stays exact.
        history.ring.reset();
        history.threshold = Some(Threshold { value, count: 0 });
        Ok(())
    }

    pub fn threshold_count(&self) -> Result<u16, RigError> {
        self.history
            .as_ref()
            .and_then(|h| h.threshold.as_ref())
            .map(|t| t.count)
            .ok_or(RigError::Config("threshold is not enabled"))
    }

    pub fn history_used(&self) -> u16 {
        self.history.as_ref().map_or(0, |h| h.ring.in_use())
    }

    pub fn history_length(&self) -> u16 {
        self.history.as_ref().map_or(0, |h| h.ring.size())
    }

    pub fn history_copy_in_flight(&self) -> bool {
        self.history.as_ref().is_some_and(History::copy_in_flight)
    }

    /// Drain the `count` oldest samples into the copy buffer and hand
    /// out a block. Refused while a previous block is still in flight.
    pub fn copy_history(&mut self, count: u16) -> Result<Message, RigError> {
        let Some(history) = &mut self.history else {
            return Err(RigError::Config("history is not enabled"));
        };
        if history.copy_in_flight() {
            return Err(RigError::Consistency("a history copy is still in flight"));
        }
        if count == 0 || history.ring.is_empty() || count > history.ring.in_use() {
            return Err(RigError::Capacity("history holds fewer samples"));
        }
        let Some(buffer) = &mut history.copy else {
            return Err(RigError::Config("history copy is not enabled"));
        };

        let samples = Arc::get_mut(buffer)
            .ok_or(RigError::Consistency("a history copy is still in flight"))?;
        samples.clear();
        samples.resize(usize::from(count), 0);
        history.ring.read_block(samples)?;

        Ok(Message::History {
            input: self.number,
            tic: self.clock_tic,
            values: rig_common::report::HistoryBlock(buffer.clone()),
        })
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

    #[inline]
    pub fn is_digital(&self) -> bool {
        self.is_digital
    }

    #[inline]
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    #[inline]
    pub fn target_met(&self) -> bool {
        self.target_met
    }

    #[inline]
    pub fn parent(&self) -> Option<u16> {
        self.parent
    }

    #[inline]
    pub fn child(&self) -> Option<u16> {
        self.child
    }

    pub fn report_value(&self, outbound: &SharedOutbound) {
        outbound.enqueue(Message::Value {
            source: Source::Input(self.number),
            tic: self.clock_tic,
            value: self.current_value,
        });
    }

    pub fn settings(&self, reason: Reason) -> InputSettings {
        InputSettings {
            reason,
            timestamp: self.clock_tic,
            enabled: self.enabled,
            digital: self.is_digital,
            value: self.current_value,
            history_enabled: self.history.is_some(),
            history_length: self.history_length(),
            all_transitions: self.msg_all_transitions,
            send_to_computer: self.msg_to_computer,
            actions_enabled: self.actions_enabled,
            actions_disabled_after_met: self.disable_actions_after_met,
            readout_enabled: self.readout_every_tics > 0,
            readout_tics: self.readout_every_tics,
            timeout_tics: self.timeout_tics,
            event_code_met: self.code_met,
            event_code_left: self.code_left,
            output_enabled: self.output_enabled,
            has_output: self.output.is_some(),
            output_disabled_after_met: self.disable_output_after_met,
            output_cycles: self.output_cycles,
            output_delay_tics: self.output_delay_tics,
            has_parent: self.parent.is_some(),
            has_child: self.child.is_some(),
            target_set: self.target.is_some(),
            target_met: self.target_met,
            target_met_min_tics: self.met_min_tics,
            target_left_min_tics: self.left_min_tics,
            threshold_count: self
                .history
                .as_ref()
                .and_then(|h| h.threshold.as_ref())
                .map_or(0, |t| t.count),
            target: self.target.as_ref().map(Target::wire_fields),
        }
    }
}

// ─── Input bank ──────────────────────────────────────────────────────────────

/// All input channels, digital block first, then analog.
pub struct InputBank {
    inputs: Vec<Input>,
}

impl InputBank {
    pub fn new(
        digital_count: u16,
        analog_count: u16,
        digital_reader: SharedRead,
        analog_reader: SharedRead,
    ) -> Self {
        let mut inputs = Vec::with_capacity(usize::from(digital_count + analog_count));
        for number in 0..digital_count {
            inputs.push(Input::new(number, number, true, digital_reader.clone()));
        }
        for number in digital_count..digital_count + analog_count {
            inputs.push(Input::new(
                number,
                number - digital_count,
                false,
                analog_reader.clone(),
            ));
        }
        Self { inputs }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.inputs.len() as u16
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn get(&self, number: u16) -> Result<&Input, RigError> {
        self.inputs
            .get(usize::from(number))
            .ok_or(RigError::Config("input number is too high"))
    }

    pub fn get_mut(&mut self, number: u16) -> Result<&mut Input, RigError> {
        self.inputs
            .get_mut(usize::from(number))
            .ok_or(RigError::Config("input number is too high"))
    }

    /// Point an input at an output channel (or clear the link).
    pub fn link_output(
        &mut self,
        input: u16,
        output: Option<u16>,
        outputs: &OutputBank,
    ) -> Result<(), RigError> {
        if let Some(number) = output {
            outputs.get(number)?;
        }
        self.get_mut(input)?.output = output;
        Ok(())
    }

    // ─── Chains ──────────────────────────────────────────────────────────────

    /// Attach `child` beneath `parent`. The parent must be a chain head
    /// and the child a leaf with a compatible target.
    pub fn link_child(&mut self, parent: u16, child: u16) -> Result<(), RigError> {
        if parent == child {
            return Err(RigError::Config("child cannot be set by itself"));
        }
        self.get(parent)?;
        self.get(child)?;

        let parent_input = &self.inputs[usize::from(parent)];
        let child_input = &self.inputs[usize::from(child)];

        if parent_input.parent.is_some() {
            return Err(RigError::Config("current input is not a primary input"));
        }
        if !child_input.enabled || child_input.target.is_none() {
            return Err(RigError::Config(
                "child input is not enabled or does not have a target",
            ));
        }
        if child_input.child.is_some() {
            return Err(RigError::Config("child input already has its own child input"));
        }
        if parent_input.is_digital != child_input.is_digital {
            return Err(RigError::Config(
                "child input does not have the same input type",
            ));
        }
        match (&parent_input.target, &child_input.target) {
            (Some(a), Some(b)) if a.compatible_with(b) => {}
            _ => {
                return Err(RigError::Config(
                    "child input does not have the same target type",
                ));
            }
        }

        self.inputs[usize::from(parent)].child = Some(child);
        self.inputs[usize::from(child)].parent = Some(parent);
        Ok(())
    }

    /// Detach the first child beneath `parent`, splicing a grandchild
    /// back into the chain. Without a child this is a no-op.
    pub fn unlink_child(&mut self, parent: u16) -> Result<(), RigError> {
        self.get(parent)?;
        let Some(child) = self.inputs[usize::from(parent)].child else {
            return Ok(());
        };
        let grandchild = self.inputs[usize::from(child)].child;

        self.inputs[usize::from(child)].parent = None;
        self.inputs[usize::from(child)].child = None;
        self.inputs[usize::from(parent)].child = grandchild;
        if let Some(grandchild) = grandchild {
            self.inputs[usize::from(grandchild)].parent = Some(parent);
        }
        Ok(())
    }

    // ─── Timer context ───────────────────────────────────────────────────────

    /// Refresh every input before any evaluation, so chained
    /// comparisons never read a stale sibling.
    pub fn refresh_all(&mut self, tic: u64) {
        for input in &mut self.inputs {
            input.refresh(tic);
        }
    }

    pub fn evaluate_all(
        &mut self,
        tic: u64,
        outputs: &mut OutputBank,
        codes: &EventCodeChannel,
        outbound: &SharedOutbound,
    ) {
        for number in 0..self.inputs.len() {
            self.evaluate(number, tic, outputs, codes, outbound);
        }
    }

    fn evaluate(
        &mut self,
        index: usize,
        tic: u64,
        outputs: &mut OutputBank,
        codes: &EventCodeChannel,
        outbound: &SharedOutbound,
    ) {
        {
            let input = &self.inputs[index];
            if !input.enabled {
                return;
            }

            if input.readout_every_tics > 0 && tic % input.readout_every_tics == 0 {
                input.report_value(outbound);
            }

            // Chain members are driven by their head.
            if input.parent.is_some() {
                return;
            }
        }

        {
            let input = &mut self.inputs[index];
            if input.in_timeout {
                if input.timeout_start_tic + input.timeout_tics > tic {
                    return;
                }
                input.in_timeout = false;
                input.timeout_start_tic = 0;
            }
            if input.target.is_none() {
                return;
            }
        }

        let cond_met = self.composite_met(index, outbound);

        let promoted = {
            let input = &mut self.inputs[index];
            if cond_met && input.cond_met_tic == 0 {
                input.cond_met_tic = tic;
            } else if !cond_met && input.cond_left_tic == 0 {
                input.cond_left_tic = tic;
            }
            if cond_met {
                input.cond_left_tic = 0;
            } else {
                input.cond_met_tic = 0;
            }

            if cond_met && !input.target_met {
                tic - input.cond_met_tic >= input.met_min_tics
            } else if !cond_met && input.target_met {
                tic - input.cond_left_tic >= input.left_min_tics
            } else {
                false
            }
        };

        if promoted {
            // The head first, then each chain node in order, each with
            // its own output and event-code configuration.
            self.inputs[index].apply_transition(cond_met, outputs, codes, outbound);
            let mut next = self.inputs[index].child;
            while let Some(child) = next {
                let child = usize::from(child);
                self.inputs[child].apply_transition(cond_met, outputs, codes, outbound);
                next = self.inputs[child].child;
            }
        }
    }

    /// The composite rule over a chain head.
    fn composite_met(&self, head: usize, outbound: &SharedOutbound) -> bool {
        let head_input = &self.inputs[head];
        if head_input.parent.is_some() {
            head_input.report_error("should not be checking a child".into(), outbound);
            return false;
        }

        let ball = matches!(
            head_input.target,
            Some(Target::Circular { .. }) | Some(Target::Elliptical { .. })
        );

        if !head_input.is_digital && head_input.child.is_some() && ball {
            // The chain is one point in N dimensions; sum normalized
            // squared distances along it.
            let elliptical = matches!(head_input.target, Some(Target::Elliptical { .. }));
            let head_radius = head_input
                .target
                .as_ref()
                .map_or(0, |t| t.center_and_radius().1);
            let shared_factor = inverse_square(head_radius);

            let mut sum = 0.0f32;
            let mut index = Some(head);
            while let Some(current) = index {
                let node = &self.inputs[current];
                let (center, radius) =
                    node.target.as_ref().map_or((0, 0), Target::center_and_radius);
                let factor = if elliptical {
                    inverse_square(radius)
                } else {
                    shared_factor
                };
                let term = f32::from(node.current_value) - f32::from(center);
                sum += term * term * factor;
                index = node.child.map(usize::from);
            }
            sum <= 1.0
        } else {
            // Independent AND down the chain.
            let mut index = Some(head);
            while let Some(current) = index {
                let node = &self.inputs[current];
                match &node.target {
                    Some(target) if target.met_by(node.current_value) => {}
                    _ => return false,
                }
                index = node.child.map(usize::from);
            }
            true
        }
    }
}

/// 1 / r^2 as the multiplication factor for one distance term. A zero
/// radius divides to infinity, which correctly never meets.
fn inverse_square(radius: u16) -> f32 {
    let r = f32::from(radius);
    1.0 / (r * r)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rig_common::io::{CodeLines, SharedWrite};
    use rig_common::report::MemorySink;
    use std::sync::Mutex;

    struct QuietLines;
    impl CodeLines for QuietLines {
        fn set_code(&self, _code: u16) {}
        fn set_strobe(&self, _on: bool) {}
    }

    /// Settable per-channel signal levels.
    struct Signals(Mutex<Vec<u16>>);

    impl Signals {
        fn new(channels: usize) -> Arc<Self> {
            Arc::new(Self(Mutex::new(vec![0; channels])))
        }
        fn set(&self, channel: u16, value: u16) {
            self.0.lock().unwrap()[usize::from(channel)] = value;
        }
    }

    impl rig_common::io::ReadChannel for Signals {
        fn read(&self, channel: u16) -> u16 {
            self.0.lock().unwrap()[usize::from(channel)]
        }
    }

    struct Rig {
        inputs: InputBank,
        outputs: OutputBank,
        codes: Arc<EventCodeChannel>,
        outbound: SharedOutbound,
        sink: Arc<MemorySink>,
        digital: Arc<Signals>,
        analog: Arc<Signals>,
    }

    impl Rig {
        fn new() -> Self {
            let digital = Signals::new(4);
            let analog = Signals::new(4);
            let inputs = InputBank::new(4, 4, digital.clone(), analog.clone());
            let writer: SharedWrite = Arc::new(|_: u16, _: u16| {});
            let outputs = OutputBank::new(2, writer);
            let sink = Arc::new(MemorySink::new());
            let outbound: SharedOutbound = sink.clone();
            let codes = EventCodeChannel::new(Arc::new(QuietLines), outbound.clone(), 255)
                .expect("channel");
            Self {
                inputs,
                outputs,
                codes,
                outbound,
                sink,
                digital,
                analog,
            }
        }

        fn tic(&mut self, tic: u64) {
            self.inputs.refresh_all(tic);
            self.inputs
                .evaluate_all(tic, &mut self.outputs, &self.codes, &self.outbound);
        }

        fn transitions(&self) -> Vec<(u64, bool)> {
            self.sink
                .drain()
                .into_iter()
                .filter_map(|m| match m {
                    Message::Transition {
                        tic, target_met, ..
                    } => Some((tic, target_met)),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn digital_target_promotes_after_met_min_tics() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_hysteresis(3, 0);
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
        }

        rig.digital.set(0, 1);
        for tic in 1..=10 {
            rig.tic(tic);
        }
        // Condition holds from tic 1; promotion lands exactly at 1 + 3.
        assert_eq!(rig.transitions(), vec![(4, true)]);
        assert!(rig.inputs.get(0).expect("input").target_met());
    }

    #[test]
    fn brief_flips_are_filtered_by_hysteresis() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_hysteresis(5, 0);
            input.set_msg_to_computer(true);
        }

        rig.digital.set(0, 1);
        rig.tic(1);
        rig.tic(2);
        rig.digital.set(0, 0); // flip away before the minimum
        rig.tic(3);
        rig.digital.set(0, 1);
        for tic in 4..=8 {
            rig.tic(tic);
        }
        // The clock restarts at tic 4; promotion at 4 + 5 = 9.
        assert!(rig.transitions().is_empty());
        rig.tic(9);
        assert_eq!(rig.transitions(), vec![(9, true)]);
    }

    #[test]
    fn relational_target_with_left_hysteresis() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input
                .set_target(Target::Relational {
                    op: Relation::GreaterThan,
                    value: 100,
                })
                .expect("target");
            input.set_hysteresis(0, 2);
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
        }

        rig.analog.set(0, 150);
        rig.tic(1);
        assert_eq!(rig.transitions(), vec![(1, true)]);

        rig.analog.set(0, 50);
        rig.tic(2);
        rig.tic(3);
        assert!(rig.transitions().is_empty());
        rig.tic(4);
        assert_eq!(rig.transitions(), vec![(4, false)]);
    }

    #[test]
    fn circular_pair_is_a_shared_ball() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input
                .set_target(Target::Circular { value: 0, radius: 5 })
                .expect("target");
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
        }
        {
            let input = rig.inputs.get_mut(5).expect("input");
            input
                .set_target(Target::Circular { value: 0, radius: 99 })
                .expect("target");
        }
        rig.inputs.link_child(4, 5).expect("link");

        // 3-4-5 triangle: on the boundary, inclusive.
        rig.analog.set(0, 3);
        rig.analog.set(1, 4);
        rig.tic(1);
        assert_eq!(rig.transitions(), vec![(1, true)]);

        // Just outside.
        rig.analog.set(1, 5);
        rig.tic(2);
        assert_eq!(rig.transitions(), vec![(2, false)]);
    }

    #[test]
    fn standalone_ball_target_is_never_met() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input
                .set_target(Target::Circular { value: 0, radius: 50 })
                .expect("target");
            input.set_msg_to_computer(true);
        }
        rig.analog.set(0, 0);
        for tic in 1..=3 {
            rig.tic(tic);
        }
        assert!(rig.transitions().is_empty());
    }

    #[test]
    fn rectangular_chain_is_an_and_of_bands() {
        let mut rig = Rig::new();
        for number in [4u16, 5] {
            let input = rig.inputs.get_mut(number).expect("input");
            input
                .set_target(Target::Rectangular {
                    value: 100,
                    radius: 10,
                })
                .expect("target");
            if number == 4 {
                input.set_msg_to_computer(true);
                input.set_msg_all_transitions(true);
            }
        }
        rig.inputs.link_child(4, 5).expect("link");

        rig.analog.set(0, 105);
        rig.analog.set(1, 95);
        rig.tic(1);
        assert_eq!(rig.transitions(), vec![(1, true)]);

        rig.analog.set(1, 80); // second axis out of band
        rig.tic(2);
        assert_eq!(rig.transitions(), vec![(2, false)]);
    }

    #[test]
    fn chain_link_validations() {
        let mut rig = Rig::new();
        assert!(rig.inputs.link_child(4, 4).is_err());
        assert!(rig.inputs.link_child(4, 99).is_err());
        // Child without a target.
        assert!(rig.inputs.link_child(4, 5).is_err());

        rig.inputs
            .get_mut(4)
            .unwrap()
            .set_target(Target::Circular { value: 0, radius: 5 })
            .expect("target");
        rig.inputs
            .get_mut(5)
            .unwrap()
            .set_target(Target::Elliptical { value: 0, radius: 5 })
            .expect("target");
        // Mismatched distance families.
        assert!(rig.inputs.link_child(4, 5).is_err());

        rig.inputs
            .get_mut(5)
            .unwrap()
            .set_target(Target::Circular { value: 0, radius: 7 })
            .expect("target");
        rig.inputs.link_child(4, 5).expect("link");

        // Digital/analog kinds cannot mix.
        rig.inputs
            .get_mut(0)
            .unwrap()
            .set_target(Target::Digital { polarity: true })
            .expect("target");
        assert!(rig.inputs.link_child(5, 0).is_err());

        // 5 now has a parent, so it is not a valid head.
        rig.inputs
            .get_mut(6)
            .unwrap()
            .set_target(Target::Circular { value: 0, radius: 7 })
            .expect("target");
        assert!(rig.inputs.link_child(5, 6).is_err());
    }

    #[test]
    fn unlink_splices_the_grandchild() {
        let mut rig = Rig::new();
        for number in [4u16, 5, 6] {
            rig.inputs
                .get_mut(number)
                .unwrap()
                .set_target(Target::Circular { value: 0, radius: 5 })
                .expect("target");
        }
        rig.inputs.link_child(5, 6).expect("link");
        rig.inputs.link_child(4, 5).expect("link");
        assert_eq!(rig.inputs.get(4).unwrap().child(), Some(5));

        rig.inputs.unlink_child(4).expect("unlink");
        assert_eq!(rig.inputs.get(4).unwrap().child(), Some(6));
        assert_eq!(rig.inputs.get(6).unwrap().parent(), Some(4));
        assert_eq!(rig.inputs.get(5).unwrap().parent(), None);
        assert_eq!(rig.inputs.get(5).unwrap().child(), None);

        // Unlinking a childless head stays quiet.
        rig.inputs.unlink_child(5).expect("unlink");
    }

    #[test]
    fn met_transition_queues_output_cycles() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_output_cycles(3).expect("cycles");
            input.set_output_delay(2);
            input.set_disable_output_after_met(true);
        }
        rig.inputs.link_output(0, Some(1), &rig.outputs).expect("link");

        rig.digital.set(0, 1);
        rig.tic(5);
        // Cycles queued with the delay; the output starts at tic 7.
        rig.outputs
            .advance_all(6, &rig.codes, &rig.outbound);
        assert_eq!(rig.outputs.get(1).unwrap().value(), 0);
        rig.outputs
            .advance_all(7, &rig.codes, &rig.outbound);
        assert_eq!(rig.outputs.get(1).unwrap().value(), 1);

        // One-shot: a second met edge does not queue again.
        rig.digital.set(0, 0);
        rig.tic(8);
        rig.digital.set(0, 1);
        rig.tic(9);
        let settings = rig.inputs.get(0).unwrap().settings(Reason::Get);
        assert!(!settings.output_enabled);
    }

    #[test]
    fn one_shot_actions_freeze_after_first_met() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
            input.set_disable_actions_after_met(true);
        }

        rig.digital.set(0, 1);
        rig.tic(1);
        rig.digital.set(0, 0);
        rig.tic(2);
        rig.digital.set(0, 1);
        rig.tic(3);
        // Only the first met edge produced a message.
        assert_eq!(rig.transitions(), vec![(1, true)]);
    }

    #[test]
    fn timeout_suspends_evaluation_after_met() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(0).expect("input");
            input.set_target(Target::Digital { polarity: true }).expect("target");
            input.set_msg_to_computer(true);
            input.set_msg_all_transitions(true);
            input.set_timeout(5);
        }

        rig.digital.set(0, 1);
        rig.tic(1);
        assert_eq!(rig.transitions(), vec![(1, true)]);

        // Left during the window: nothing observed until it elapses.
        rig.digital.set(0, 0);
        for tic in 2..=5 {
            rig.tic(tic);
        }
        assert!(rig.transitions().is_empty());
        rig.tic(6);
        assert_eq!(rig.transitions(), vec![(6, false)]);
    }

    #[test]
    fn threshold_counts_below_within_the_window() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input.enable_history(true, 4, &rig.outbound).expect("history");
            input.enable_threshold(true, 100).expect("threshold");
        }

        for (tic, value) in [(1u64, 50u16), (2, 150), (3, 60), (4, 70)] {
            rig.analog.set(0, value);
            rig.tic(tic);
        }
        assert_eq!(rig.inputs.get(4).unwrap().threshold_count().unwrap(), 3);

        // The window rolls: the first low sample falls off.
        rig.analog.set(0, 200);
        rig.tic(5);
        assert_eq!(rig.inputs.get(4).unwrap().threshold_count().unwrap(), 2);

        // Dropping the threshold leaves the window and its samples alone.
        rig.inputs
            .get_mut(4)
            .unwrap()
            .enable_threshold(false, 0)
            .expect("disable");
        assert!(rig.inputs.get(4).unwrap().threshold_count().is_err());
        assert_eq!(rig.inputs.get(4).unwrap().history_used(), 4);
    }

    #[test]
    fn disabling_history_takes_the_threshold_with_it() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input.enable_history(true, 4, &rig.outbound).expect("history");
            input.enable_threshold(true, 100).expect("threshold");
        }
        rig.analog.set(0, 50);
        rig.tic(1);
        assert_eq!(rig.inputs.get(4).unwrap().threshold_count().unwrap(), 1);

        let input = rig.inputs.get_mut(4).unwrap();
        input.enable_history(false, 0, &rig.outbound).expect("disable");
        assert!(input.threshold_count().is_err());
        assert_eq!(input.history_used(), 0);
        assert_eq!(input.history_length(), 0);
    }

    #[test]
    fn target_round_trip_is_idempotent() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input
                .set_target(Target::Relational {
                    op: Relation::GreaterThan,
                    value: 100,
                })
                .expect("target");
            input.set_msg_to_computer(true);
        }
        rig.analog.set(0, 150);
        rig.tic(1);
        assert_eq!(rig.transitions(), vec![(1, true)]);

        // Re-applying what the getter reports is a pure no-op.
        let read_back = *rig.inputs.get(4).unwrap().target().expect("set");
        rig.inputs.get_mut(4).unwrap().set_target(read_back).expect("reapply");
        assert_eq!(rig.inputs.get(4).unwrap().target(), Some(&read_back));
        assert!(rig.inputs.get(4).unwrap().target_met());
        rig.tic(2);
        assert!(rig.transitions().is_empty());
        assert!(rig.sink.drain().is_empty());
    }

    #[test]
    fn history_copy_drains_and_blocks_reentry() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input.enable_history(true, 8, &rig.outbound).expect("history");
            input.enable_history_copy(true).expect("copy");
        }
        for tic in 1..=5 {
            rig.analog.set(0, tic as u16 * 10);
            rig.tic(tic);
        }

        let message = rig.inputs.get_mut(4).unwrap().copy_history(3).expect("copy");
        let Message::History { values, .. } = &message else {
            panic!("expected a history block");
        };
        assert_eq!(values.0.as_slice(), &[10, 20, 30]);
        assert_eq!(rig.inputs.get(4).unwrap().history_used(), 2);

        // The block is still alive: a second request is refused.
        assert!(matches!(
            rig.inputs.get_mut(4).unwrap().copy_history(1),
            Err(RigError::Consistency(_))
        ));
        drop(message);
        rig.inputs.get_mut(4).unwrap().copy_history(1).expect("copy");
    }

    #[test]
    fn history_copy_requires_enough_samples() {
        let mut rig = Rig::new();
        {
            let input = rig.inputs.get_mut(4).expect("input");
            input.enable_history(true, 8, &rig.outbound).expect("history");
            input.enable_history_copy(true).expect("copy");
        }
        rig.tic(1);
        assert!(matches!(
            rig.inputs.get_mut(4).unwrap().copy_history(5),
            Err(RigError::Capacity(_))
        ));
        assert!(rig.inputs.get_mut(4).unwrap().copy_history(0).is_err());
    }

    #[test]
    fn readout_cadence_emits_values() {
        let mut rig = Rig::new();
        rig.inputs
            .get_mut(0)
            .unwrap()
            .set_readout(true, 3)
            .expect("readout");

        for tic in 1..=9 {
            rig.tic(tic);
        }
        let readouts = rig
            .sink
            .drain()
            .into_iter()
            .filter(|m| matches!(m, Message::Value { .. }))
            .count();
        assert_eq!(readouts, 3);
    }
}
