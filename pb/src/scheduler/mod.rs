//! Unified task scheduling

mod core;

pub use core::{SchedulerStatus, UnifiedScheduler};
