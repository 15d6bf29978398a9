//! The management engine: correlation, dispatch, sessions, and the manager
//! object that ties them to a transport.

pub mod correlation;
pub mod dispatcher;
pub mod manager;
pub mod registry;

pub use correlation::Correlator;
pub use dispatcher::{Dispatcher, OutboundEnvelope};
pub use manager::DeviceManager;
pub use registry::{ManagementSession, SessionRegistry};
