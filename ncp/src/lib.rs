//! NCP: a length-framed, little-endian binary wire protocol with typed key/value parameters,
//! asynchronous request/response multiplexing over a single TCP connection, optional
//! HTTP-CONNECT tunnelling with TLS and Basic authentication, and a keep-alive state machine
//! negotiated at handshake time.

pub mod app;
pub mod client;
mod connection;
pub mod errors;
mod handshake;
pub mod packet;
pub mod server;
mod stream;
mod tls;
mod tunnel;
pub mod values;

pub use app::{Application, BadRequest};
pub use client::{connect, ConnectOptions};
pub use connection::{ConnState, Connection, Filter, Response};
pub use errors::{CommandWarning, DecodeWarning, NcpError, Result, WarningPolicy};
pub use packet::{Field, Packet};
pub use server::{accept, start_server, ServerOptions};
pub use values::Value;
