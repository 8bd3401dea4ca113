//! Robot-side client for the IM gateway.
//!
//! [`ConnectionManager`] keeps one authenticated connection alive and
//! reconnects with the last good credentials; [`RequestCorrelator`] matches
//! responses to requests; [`RobotServiceClient`] wraps both in typed calls.

mod connection;
mod correlator;
mod error;
mod robot_service;
pub mod transport;

pub use connection::{ClientConfig, ClientHandler, ConnectionManager, ConnectionState, NoopHandler};
pub use correlator::{CorrelationError, PendingRequest, PendingResponse, ReplyContext, RequestCorrelator};
pub use error::{ClientError, Result};
pub use robot_service::RobotServiceClient;
