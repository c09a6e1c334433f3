//! Transfer backends: the adapters between the orchestrator and whatever
//! actually moves bytes for a protocol family.

pub mod command;
pub mod direct;
pub mod mock;
pub mod registry;
pub mod traits;
pub mod types;

pub use command::CommandBackend;
pub use direct::DirectBackend;
pub use mock::MockBackend;
pub use registry::BackendRegistry;
pub use traits::{BackendError, TransferBackend};
pub use types::{ControlSignal, TransferHandle, TransferState, TransferStatus};
