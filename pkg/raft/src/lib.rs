pub mod consensus;
pub mod error;
pub mod log;
pub mod node;
pub mod service;
pub mod state_machine;
pub mod transport;
pub mod types;

pub use consensus::{ProposalStatus, Proposal};
pub use error::RaftError;
pub use log::{FileLog, LogStorage};
pub use node::{Node, NodeConfig};
pub use service::RaftTransportService;
pub use state_machine::StateMachine;
pub use types::{ConfigChange, Configuration, ConfigurationSnapshot, ServerId};
