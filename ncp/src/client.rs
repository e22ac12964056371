//! Client entry point: connect-time options and the `connect()` sequence — TCP connect, optional
//! HTTP-CONNECT tunnel, optional TLS, then the client side of the LINK handshake (spec.md §6).

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;

use crate::connection::{ConnState, Connection, Filter};
use crate::errors::{NcpError, Result};
use crate::handshake;
use crate::tls::TlsSession;
use crate::tunnel;

/// Connect-time configuration (spec.md §6), a struct rather than loose keyword arguments since
/// Rust has no `**kwargs`.
pub struct ConnectOptions {
	pub host: String,
	/// `None` picks the default for the chosen transport (spec.md §6): 9999 for cleartext NCP, 80
	/// for an HTTP-CONNECT tunnel without TLS, 443 for an HTTP-CONNECT tunnel with TLS.
	pub port: Option<u16>,
	/// Display label plus the TLS SNI / tunnel target; does not affect routing.
	pub remote_hostname: String,
	/// Identity sent in the handshake's `CCRE` field (`CIW` parameter).
	pub hostname: String,
	pub timeout: Duration,
	pub ssl: bool,
	pub username: Option<String>,
	pub password: Option<String>,
	pub auto_erro: bool,
	pub auto_warn: bool,
	pub auto_ackn: bool,
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			host: "localhost".to_string(),
			port: None,
			remote_hostname: "ncp.service".to_string(),
			hostname: local_hostname(),
			timeout: Duration::from_secs(60),
			ssl: false,
			username: None,
			password: None,
			auto_erro: true,
			auto_warn: true,
			auto_ackn: true,
		}
	}
}

/// Best-effort local identity, used as the CCRE `CIW` default. The reference implementation
/// reads the host MAC address for this purpose; this workspace's dependency stack has no portable
/// MAC-address accessor, so the hostname environment variable stands in (documented in
/// DESIGN.md rather than silently diverging).
fn local_hostname() -> String {
	std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")).unwrap_or_else(|_| "ncp-client".to_string())
}

/// Derives the 4-byte `info` tag from the client's hostname, standing in for "low 4 bytes of the
/// host MAC address" (spec.md §3) for the same reason `local_hostname` substitutes for a MAC
/// lookup.
fn derive_client_id(hostname: &str) -> [u8; 4] {
	use std::hash::{Hash, Hasher};

	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	hostname.hash(&mut hasher);
	let bytes = hasher.finish().to_le_bytes();
	[bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Default port for the chosen transport (spec.md §6), used when `options.port` is `None`.
fn default_port(options: &ConnectOptions) -> u16 {
	let tunnels = options.ssl || (options.username.is_some() && options.password.is_some());

	match (tunnels, options.ssl) {
		(false, _) => 9999,
		(true, false) => 80,
		(true, true) => 443,
	}
}

fn default_client_tls_config() -> Arc<ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

	Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

/// Connects to an NCP server, optionally through an HTTP-CONNECT tunnel and/or TLS, and runs the
/// client side of the LINK handshake. Returns an `Open` `Connection` ready for `send`/`recv`.
pub fn connect(options: &ConnectOptions) -> Result<Connection> {
	let deadline = Instant::now() + options.timeout;

	let port = options.port.unwrap_or_else(|| default_port(options));
	let mut stream = TcpStream::connect((options.host.as_str(), port)).map_err(NcpError::Network)?;
	stream.set_read_timeout(Some(options.timeout)).map_err(NcpError::Network)?;

	let credentials = match (&options.username, &options.password) {
		(Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
		_ => None,
	};

	if options.ssl || credentials.is_some() {
		tunnel::client_connect_tunnel(&mut stream, credentials)?;
	}

	let tls = if options.ssl {
		let config = default_client_tls_config();
		let server_name =
			ServerName::try_from(options.remote_hostname.clone()).map_err(|_| NcpError::Decode(format!("invalid TLS server name {}", options.remote_hostname)))?;
		Some(TlsSession::client(config, server_name)?)
	} else {
		None
	};

	let client_id = derive_client_id(&options.hostname);
	let filter = Filter { auto_erro: options.auto_erro, auto_warn: options.auto_warn, auto_ackn: options.auto_ackn };

	let mut conn = Connection::new(stream, filter, client_id, tls)?;
	conn.set_state(ConnState::Handshake);

	let negotiated = match handshake::client_handshake(&mut conn, &options.hostname, options.timeout, deadline) {
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
