// shellgate-core: session lifecycle, requisition bus, and the hierarchical
// data models backing the shell GUI client.

pub mod config;
pub mod error;
pub mod model;
pub mod requisition;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SessionConfig;
pub use error::CoreError;
pub use requisition::{
    RegistrationId, RemoteMessage, RemoteTarget, Requisition, RequisitionHub, RequisitionKind,
};
pub use session::{ShellBackend, ShellSession};
