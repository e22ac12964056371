//! TLS record-layer plumbing (C6 support).
//!
//! `runtime::Io<T>` moves raw bytes between a socket and its actor with no notion of framing or
//! encryption — it calls `recv`/`send` on the fd directly (see `runtime::lib::Entry`). TLS is
//! layered on top by running `rustls`'s I/O-less connection API by hand inside `ConnActor`:
//! incoming chunks are ciphertext fed to `absorb_ciphertext`, and outgoing packet bytes are
//! plaintext passed to `encrypt` before they ever reach `Io::write`. The packet codec and framed
//! reader never see ciphertext; `Io<T>` never sees plaintext.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::errors::{NcpError, Result};

pub(crate) enum TlsSession {
	Client(ClientConnection),
	Server(ServerConnection),
}

impl TlsSession {
	pub(crate) fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
		let conn = ClientConnection::new(config, server_name).map_err(|err| NcpError::Decode(format!("TLS client setup failed: {err}")))?;
		Ok(TlsSession::Client(conn))
	}

	pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self> {
		let conn = ServerConnection::new(config).map_err(|err| NcpError::Decode(format!("TLS server setup failed: {err}")))?;
		Ok(TlsSession::Server(conn))
	}

	/// Feeds newly-received ciphertext through the record layer and returns any plaintext that
	/// is now available. `chunk` being empty signals the peer's TCP half-close; propagated to the
	/// rustls connection so it can notice the abrupt close on its own terms.
	pub(crate) fn absorb_ciphertext(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
		let mut cursor = Cursor::new(chunk);

		loop {
			let n = self.read_tls(&mut cursor).map_err(NcpError::Network)?;
			if n == 0 {
				break;
			}
		}

		self.process_new_packets()?;

		let mut plaintext = Vec::new();
		let mut buf = [0u8; 4096];
		loop {
			match self.read_plain(&mut buf) {
				Ok(0) => break,
				Ok(n) => plaintext.extend_from_slice(&buf[..n]),
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(err) => return Err(NcpError::Network(err)),
			}
		}

		Ok(plaintext)
	}

	/// Queues `plaintext` for encryption and drains whatever ciphertext the record layer now
	/// wants sent — including handshake messages queued before any application data exists.
	pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
		if !plaintext.is_empty() {
			self.write_plain(plaintext).map_err(NcpError::Network)?;
		}

		let mut ciphertext = Vec::new();
		while self.wants_write() {
			self.write_tls(&mut ciphertext).map_err(NcpError::Network)?;
		}

		Ok(ciphertext)
	}

	fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
		match self {
			TlsSession::Client(c) => c.read_tls(rd),
			TlsSession::Server(c) => c.read_tls(rd),
		}
	}

	fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
		match self {
			TlsSession::Client(c) => c.write_tls(wr),
			TlsSession::Server(c) => c.write_tls(wr),
		}
	}

	fn process_new_packets(&mut self) -> Result<()> {
		let result = match self {
			TlsSession::Client(c) => c.process_new_packets().map(|_| ()),
			TlsSession::Server(c) => c.process_new_packets().map(|_| ()),
		};
		result.map_err(|err| NcpError::Decode(format!("TLS record error: {err}")))
	}

	fn wants_write(&self) -> bool {
		match self {
			TlsSession::Client(c) => c.wants_write(),
			TlsSession::Server(c) => c.wants_write(),
		}
	}

	fn read_plain(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		match self {
			TlsSession::Client(c) => c.reader().read(buf),
			TlsSession::Server(c) => c.reader().read(buf),
		}
	}

	fn write_plain(&mut self, buf: &[u8]) -> std::io::Result<()> {
		match self {
			TlsSession::Client(c) => c.writer().write_all(buf),
			TlsSession::Server(c) => c.writer().write_all(buf),
		}
	}
}
