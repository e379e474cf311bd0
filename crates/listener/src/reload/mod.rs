//! Process signals and connection draining across listener generations.

mod coordinator;
mod signals;

pub use coordinator::{ConnectionGuard, DrainCoordinator};
pub use signals::{SignalManager, SignalType};
