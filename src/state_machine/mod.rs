//! # State Machines
//!
//! Run and step lifecycle states with explicit transition tables. The
//! executor is the only component that drives step transitions; run
//! transitions happen at composition boundaries.

pub mod states;

pub use states::{RunState, StepState};
