//! Persistent state access
//!
//! A [`StateManager`] actor owns the `promptstore::Store`; everything else
//! holds a cloneable handle and talks to it over a command channel.

mod manager;
mod messages;
mod recovery;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{RecoveryStats, recover_orphans};
