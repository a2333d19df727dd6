pub mod config;
pub mod db;
pub mod error;
pub mod relay;
pub mod session;
pub mod store;

pub use db::SqliteStore;
pub use error::{LifecycleError, RelayError};
pub use relay::TurnRelay;
pub use session::{SessionHandle, SessionManager};
pub use store::Store;
