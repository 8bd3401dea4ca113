//! Relay Gateway - server side of the robot protocol
//!
//! Robots connect over WebSocket, authenticate with `robotId` + `secret`, and
//! then call a fixed set of IM operations by name. Each session is bound to a
//! [`RobotBackend`] produced by an [`Authenticator`].

mod backend;
mod connection;
mod dispatcher;
mod error;
mod server;
mod session;

pub use backend::{Authenticator, BackendResult, RobotBackend};
pub use connection::ConnectionHandle;
pub use dispatcher::{DispatchOutcome, Dispatcher, Handler, HandlerResult, HandlerTable, DENIED_METHODS};
pub use error::{AuthError, BackendError, DispatchError, GatewayError, Result, SessionError};
pub use server::GatewayServer;
pub use session::{SessionId, SessionRegistry, SessionSnapshot};
