// Leader election on top of the lease layer
//
// - `controller` runs the periodic acquire/renew loop and owns the state
// - `callbacks` holds the application hooks and their ordered dispatch
// - `state` is the bookkeeping the loop mutates and everyone else reads

pub mod callbacks;
pub mod controller;
mod state;

pub use callbacks::{CallbackBuilder, LeadershipCallbacks, NewLeaderFn, StartedLeadingFn, StoppedLeadingFn};
pub use controller::ElectionController;
pub use state::ElectionMetrics;
