//! Connection layer for Brick Daemons.
//!
//! [`IpConnection`] owns one TCP connection and everything riding on it:
//! request/response correlation, callback dispatch, authentication and
//! automatic reconnects. [`Device`] is the generic facade bindings build
//! on, and [`stream`] reassembles values spread over several packets.
//!
//! This crate also provides the `brickwire` command-line tool.

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod secret;
pub mod stream;
pub mod transport;

pub use cli::Cli;
pub use config::ClientConfig;
pub use connection::{
    ConnectReason, ConnectionState, ConnectionStatus, DisconnectReason, IpConnection,
};
pub use correlator::{Correlator, Request};
pub use device::{Device, ResponseExpected};
pub use dispatcher::{CallbackEvent, CallbackKey, CallbackScope};
pub use error::{ClientError, ClientResult};
pub use stream::{Chunk, StreamReader, StreamWriter};
