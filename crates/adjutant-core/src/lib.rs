pub mod approvals;
pub mod context;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod proactive;
pub mod tool_gateway;
pub mod workers;

pub use approvals::*;
pub use context::*;
pub use deploy::*;
pub use engine::*;
pub use error::*;
pub use ingest::*;
pub use ledger::*;
pub use proactive::*;
pub use tool_gateway::*;
pub use workers::*;
