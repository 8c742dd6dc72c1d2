//! Rig Core Library
//!
//! Real-time core of the experiment-control instrument: a fixed-rate tic
//! scheduler that samples input channels, evaluates their targets through
//! hysteresis and composite chains, drives output pulse trains, and
//! transmits event codes to external recording equipment over a strobed
//! parallel interface.
//!
//! All mutable engine state lives behind a single global interrupt-style
//! mask (see [`critical`]); the timer context and foreground commands
//! never hold finer-grained locks.
//!
//! # Module Structure
//!
//! - [`critical`] - The global mask and the [`Shared`](critical::Shared) cell
//! - [`ring`] - Fixed-capacity ring queue of raw samples
//! - [`event_code`] - Dual-priority event-code queues and the strobe protocol
//! - [`input`] - Input channels: targets, hysteresis, history, thresholds, chains
//! - [`output`] - Output channels and cyclic pulse trains
//! - [`scheduler`] - The fixed-rate tic scheduler tying it all together
//! - [`timer`] - Wall-clock pacing that drives [`Scheduler::advance`](scheduler::Scheduler::advance)

pub mod critical;
pub mod event_code;
pub mod input;
pub mod output;
pub mod ring;
pub mod scheduler;
pub mod timer;
