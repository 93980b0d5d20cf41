//! Sessions: per-connection state machine, driver and registry.

mod manager;
#[allow(clippy::module_inception)]
mod session;
mod state;

pub use manager::SessionManager;
pub(crate) use session::SessionContext;
pub use session::{Session, SessionId};
pub use state::State;
pub(crate) use state::StateCell;
