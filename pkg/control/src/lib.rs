pub mod bootstrap;
pub mod command;
pub mod error;
pub mod events;
pub mod kv;
pub mod model;
pub mod reconciler;
pub mod scheduler;
pub mod state_machine;

pub use command::{Command, Outcome};
pub use error::ControlError;
pub use events::{Event, EventBus};
pub use kv::Store;
pub use reconciler::Reconciler;
pub use scheduler::{Plan, Scheduler, Unplaced};
pub use state_machine::{ApplyResult, ClusterStateMachine};
