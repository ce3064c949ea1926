//! Quoting pipeline: pure calculator, sanity gate, order diff, and the
//! per-market cycle that wires them to the venue.

pub mod calc;
pub mod cycle;
pub mod diff;
pub mod sanity;
