//! Server entry point: accept options and the per-connection sequence — optional HTTP-CONNECT
//! tunnel, optional TLS, the server side of the LINK handshake, then handing the open
//! connection to the caller's handler (spec.md §6).

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustls::ServerConfig;

use crate::connection::{ConnState, Connection, Filter};
use crate::errors::{NcpError, Result};
use crate::handshake;
use crate::tls::TlsSession;
use crate::tunnel;
use crate::values::Value;

/// Server accept-time configuration (spec.md §6's "Server accept options"). `authenticate`'s
/// presence makes tunnel authentication mandatory, mirroring the reference implementation's rule
/// that passing a verifier callback is itself the opt-in.
pub struct ServerOptions {
	pub host: String,
	pub port: u16,
	pub timeout: Duration,
	pub ssl: Option<Arc<ServerConfig>>,
	pub authenticate: Option<Arc<dyn Fn(&str, &str) -> bool + Send + Sync>>,
}

impl Default for ServerOptions {
	fn default() -> Self {
		Self { host: "0.0.0.0".to_string(), port: 9999, timeout: Duration::from_secs(60), ssl: None, authenticate: None }
	}
}

/// Accepts connections in a loop, running each through the tunnel/TLS/handshake sequence and then
/// handing the resulting `Open` connection to `handler` on its own OS thread.
///
/// The accept loop itself sits outside this crate's in-scope surface (spec.md §1 puts the
/// top-level socket-listener plumbing out of scope); one-thread-per-connection is this
/// implementation's deliberately simple realization of that out-of-scope plumbing, distinct from
/// the single-threaded cooperative reactor each individual connection runs under (spec.md §5).
pub fn start_server(options: ServerOptions, handler: impl Fn(&mut Connection) -> Result<()> + Send + Sync + 'static) -> Result<()> {
	let listener = TcpListener::bind((options.host.as_str(), options.port)).map_err(NcpError::Network)?;
	let handler = Arc::new(handler);
	let options = Arc::new(options);

	for incoming in listener.incoming() {
		let stream = match incoming {
			Ok(stream) => stream,
			Err(err) => {
				log::error!("accept failed: {err}");
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let options = Arc::clone(&options);

		thread::spawn(move || {
			if let Err(err) = serve_one(stream, &options, handler.as_ref()) {
				log::error!("connection handling failed: {err}");
			}
		});
	}

	Ok(())
}

/// Runs the tunnel/TLS/handshake sequence over one freshly-accepted stream and returns the
/// resulting `Open` connection. Split out from `serve_one` so tests can drive a single accepted
/// connection directly, without going through `start_server`'s infinite accept loop.
pub fn accept(mut stream: TcpStream, options: &ServerOptions) -> Result<Connection> {
	let deadline = Instant::now() + options.timeout;
	stream.set_read_timeout(Some(options.timeout)).map_err(NcpError::Network)?;

	if options.ssl.is_some() || options.authenticate.is_some() {
		let verifier: Option<&dyn Fn(&str, &str) -> bool> = options.authenticate.as_deref();
		tunnel::server_accept_tunnel(&mut stream, verifier)?;
	}

	let tls = match &options.ssl {
		Some(config) => Some(TlsSession::server(Arc::clone(config))?),
		None => None,
	};

	let mut conn = Connection::new(stream, Filter::accept_all(), [0; 4], tls)?;
	conn.set_state(ConnState::Handshake);

	let negotiated = match handshake::server_handshake(&mut conn, deadline) {
		Ok(negotiated) => negotiated,
		Err(err) => {
			conn.set_state(ConnState::ErrorClose);
			return Err(err);
		}
	};

	conn.arm_keepalive(negotiated)?;
	conn.set_state(ConnState::Open);

	Ok(conn)
}

fn serve_one(stream: TcpStream, options: &ServerOptions, handler: &(impl Fn(&mut Connection) -> Result<()> + Send + Sync)) -> Result<()> {
	let mut conn = accept(stream, options)?;

	let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&mut conn)));

	match outcome {
		Ok(Ok(())) => {}
		Ok(Err(NcpError::Decode(detail))) => {
			log::warn!("handler reported a bad request: {detail}");
			send_link_erro(&mut conn, "Bad request", 400);
		}
		Ok(Err(err)) => {
			log::error!("connection handler returned an error: {err}");
			send_link_erro(&mut conn, "Server error", 500);
		}
		Err(panic) => {
			let detail = panic.downcast_ref::<&str>().map(|s| s.to_string()).or_else(|| panic.downcast_ref::<String>().cloned()).unwrap_or_else(|| "unknown panic".to_string());
			log::error!("connection handler panicked: {detail}");
			send_link_erro(&mut conn, "Server error", 500);
		}
	}

	conn.close();
	Ok(())
}

fn send_link_erro(conn: &mut Connection, detail: &str, code: i32) {
	let fields = vec![("ERRO".to_string(), vec![("ERRO".to_string(), Value::String(detail.to_string())), ("ERRC".to_string(), Value::I32(code))])];

	if let Err(err) = conn.send_packet("LINK", fields) {
		log::error!("failed to send closing LINK ERRO: {err}");
	}
}
