//! # ctxforge Budget
//!
//! Token-budget allocation for ctxforge. Given ranked segments and a
//! [`BudgetPolicy`](ctxforge_core::BudgetPolicy), the [`BudgetEngine`]
//! decides which segments are admitted, under which reservation, and why
//! the rest were not.
//!
//! The engine never mutates its input: it returns the admitted segments, a
//! [`BudgetAllocation`](ctxforge_core::BudgetAllocation) summary, and a
//! journal with exactly one decision per input segment.

pub mod bidding;
pub mod engine;
pub mod shares;

pub use engine::{Allocated, BudgetEngine};
