pub mod agent;
pub mod channel;
pub mod libssh2;
pub mod listener;
pub(crate) mod registry;
pub mod session;

pub use agent::AgentClient;
pub use channel::Channel;
pub use libssh2::Libssh2Connection;
pub use listener::Listener;
pub use session::Session;
