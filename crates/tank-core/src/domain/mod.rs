//! Domain layer: pure connection vocabulary.
//!
//! Nothing in here opens a socket, sleeps, or reads a clock.  Functions that
//! need the time take it as a parameter so they can be tested with fixed
//! instants.

pub mod endpoint;
pub mod heartbeat;
pub mod policy;
pub mod state;

pub use endpoint::{DeviceEndpoint, EndpointError, DEFAULT_PORT};
pub use heartbeat::HeartbeatState;
pub use policy::{PolicyError, ReconnectPolicy};
pub use state::ConnectionState;
