//! Application helper layer (supplement): field-handler dispatch and a `BadRequest` error,
//! mirroring the ergonomic layer `ncplib.app` provides over raw `recv()`/`send()` — the thing
//! spec.md §6's "Handler contract" assumes exists one layer up from the raw connection.

use std::collections::HashMap;
use std::thread;

use crate::connection::Connection;
use crate::errors::{NcpError, Result};
use crate::packet::Field;

/// Raised by a field handler to report a malformed request. The server translates this into
/// `LINK ERRO` with `ERRC=400`; any other handler error (or panic) is treated as an unexpected
/// fault and reported as `ERRC=500` (spec.md §6).
#[derive(Debug)]
pub struct BadRequest(pub String);

impl From<BadRequest> for NcpError {
	fn from(err: BadRequest) -> Self {
		NcpError::Decode(err.0)
	}
}

type Handler = Box<dyn Fn(&mut Connection, Field) -> std::result::Result<(), BadRequest> + Send + Sync>;

/// Dispatches incoming fields to handlers registered by field name. `ncplib.app.Application`
/// dispatches by matching a `handle_field_{packet}_{field}` method name on a user subclass; Rust
/// has no attribute-based dispatch by string, so registration is explicit here instead.
#[derive(Default)]
pub struct Application {
	handlers: HashMap<String, Handler>,
}

impl Application {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on_field(&mut self, field_name: &str, handler: impl Fn(&mut Connection, Field) -> std::result::Result<(), BadRequest> + Send + Sync + 'static) -> &mut Self {
		self.handlers.insert(field_name.to_string(), Box::new(handler));
		self
	}

	/// Runs the dispatch loop until the connection closes gracefully. Intended as a
	/// `start_server` handler: `start_server(options, move |conn| app.run(conn))`.
	pub fn run(&self, conn: &mut Connection) -> Result<()> {
		loop {
			let field = match conn.recv() {
				Ok(field) => field,
				Err(NcpError::ConnectionClosed) => return Ok(()),
				Err(err) => return Err(err),
			};

			match self.handlers.get(&field.name) {
				Some(handler) => handler(conn, field)?,
				None => log::debug!("no handler registered for field {}", field.name),
			}
		}
	}
}

/// Spawns `task` on a background OS thread, mirroring `ncplib.app`'s `start_daemon` — a
/// fire-and-forget loop a handler can kick off once (e.g. a periodic broadcast) and leave
/// running for the life of the process. `task` must not touch the `Connection` it was started
/// from: each connection's reactor and socket are exclusively owned by the thread driving that
/// connection's handler, so cross-thread access would race it.
pub fn start_daemon(task: impl FnOnce() + Send + 'static) {
	thread::spawn(task);
}
