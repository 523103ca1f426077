//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Position state tracking for the traded symbol
//! - Capital reallocation from the weakest open position
//! - Order execution with margin pre-flight
//! - The hedge lifecycle and range-threshold controllers

mod contracts;
mod executor;
mod hedge;
mod position_state;
mod range;
mod reallocation;

pub use contracts::ContractBook;
pub use executor::{OpenRequest, OrderExecutor};
pub use hedge::{CloseReason, CycleReport, HedgeController};
pub use position_state::PositionStateTracker;
pub use range::{RangeController, RangeOutcome};
pub use reallocation::{CapitalReallocator, Drain};
