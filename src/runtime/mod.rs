// src/runtime/mod.rs

//! Synchronization primitives shared by virtual users: the interrupt flag and the shutdown gate.

pub mod gate;
pub mod interrupt;

pub use gate::{GateState, ShutdownHoldGate};
pub use interrupt::InterruptFlag;
