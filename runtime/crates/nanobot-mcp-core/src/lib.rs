pub mod error;
pub mod hooks;
pub mod logging;
pub mod message;
pub mod pending;
pub mod state;
pub mod types;

pub use error::RpcError;
pub use hooks::{Direction, HookDefinition, HookParseError};
pub use message::{Message, MessageKind, RequestId};
pub use pending::{PendingRequests, Waited, Waiter};
pub use state::{SessionState, StateStore};
