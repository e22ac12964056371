//! Connection core (C4): field buffer, send/recv surface, response objects, keep-alive
//! scheduler, predicate filtering, and the open/closing/closed lifecycle.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use runtime::Io;
use stakker::{actor, ret_nop, ActorOwn, Cx, Fwd, Stakker, FixedTimerKey, CX};
use utils::bytes::Slice;

use crate::errors::{CommandWarning, NcpError, Result, WarningPolicy};
use crate::packet::{encode_packet, Field};
use crate::stream::FramedReader;
use crate::tls::TlsSession;
use crate::values::Value;

/// One (packet type, field) pair waiting to be dequeued, in wire order.
type Pending = (String, Field);

/// The connection lifecycle (spec.md §4.4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Initial,
	Handshake,
	Open,
	Closing,
	Closed,
	ErrorClose,
}

/// The three togglable client-side filter policies (spec.md §4.4.1). A server-side connection
/// uses `Filter::accept_all()`, which never inspects a field's contents.
#[derive(Debug, Clone, Copy)]
pub struct Filter {
	pub auto_erro: bool,
	pub auto_warn: bool,
	pub auto_ackn: bool,
}

impl Default for Filter {
	fn default() -> Self {
		Self { auto_erro: true, auto_warn: true, auto_ackn: true }
	}
}

impl Filter {
	pub fn accept_all() -> Self {
		Self { auto_erro: false, auto_warn: false, auto_ackn: false }
	}

	/// Applies the filter to a dequeued field. `Ok(Some(field))` delivers the field as-is,
	/// `Ok(None)` means the field was suppressed and scanning should continue, `Err` raises a
	/// `CommandError` that terminates the call that dequeued this field.
	///
	/// `auto_erro` is checked ahead of `auto_ackn` (spec.md §4.4.1 lists it first), so a field
	/// carrying both `ERRO` and `ACKN` raises rather than being silently dropped — the resolution
	/// to spec.md §9's open question about that combination.
	fn apply(&self, packet_type: &str, field: Field, warning_policy: WarningPolicy) -> Result<Option<Field>> {
		if self.auto_erro {
			let detail = field.get("ERRO").map(value_as_display);
			let code = field.get("ERRC").map(value_as_i32);

			if detail.is_some() || code.is_some() {
				return Err(NcpError::Command { packet_type: packet_type.to_string(), field_name: field.name, field_id: field.id, detail, code });
			}
		}

		if self.auto_warn {
			let detail = field.get("WARN").map(value_as_display);
			let code = field.get("WARC").map(value_as_i32);

			if detail.is_some() || code.is_some() {
				let warning = CommandWarning { packet_type: packet_type.to_string(), field_name: field.name.clone(), field_id: field.id, detail, code };

				match warning_policy {
					WarningPolicy::Log => log::warn!("command warning in {} {} ({:?}): {:?}", warning.packet_type, warning.field_name, warning.code, warning.detail),
					WarningPolicy::Escalate => {
						return Err(NcpError::Command {
							packet_type: warning.packet_type,
							field_name: warning.field_name,
							field_id: warning.field_id,
							detail: warning.detail,
							code: warning.code,
						})
					}
				}

				if field.name == "WARN" {
					return Ok(None);
				}
			}
		}

		if self.auto_ackn && field.get("ACKN").is_some() {
			return Ok(None);
		}

		Ok(Some(field))
	}
}

fn value_as_display(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => format!("{other:?}"),
	}
}

fn value_as_i32(value: &Value) -> i32 {
	match value {
		Value::I32(v) => *v,
		Value::U32(v) => *v as i32,
		Value::I64(v) => *v as i32,
		Value::U64(v) => *v as i32,
		_ => 0,
	}
}

/// A handle returned by `send`/`send_packet`, correlating peer replies by `(field name, field
/// id)` (spec.md glossary). Carries no reference to the connection, so several responses can be
/// driven concurrently by alternating `recv()` calls against the one connection they share.
pub struct Response {
	packet_type: String,
	expected: HashSet<(String, u32)>,
}

impl Response {
	pub fn recv(&self, conn: &mut Connection) -> Result<Field> {
		let packet_type = self.packet_type.clone();
		let expected = &self.expected;
		let deadline = conn.deadline();
		conn.recv_matching(|pt, field| pt == packet_type && expected.contains(&(field.name.clone(), field.id)), deadline)
	}

	pub fn recv_field(&self, conn: &mut Connection, field_name: &str) -> Result<Field> {
		let packet_type = self.packet_type.clone();
		let expected = &self.expected;
		let deadline = conn.deadline();
		conn.recv_matching(|pt, field| pt == packet_type && field.name == field_name && expected.contains(&(field.name.clone(), field.id)), deadline)
	}
}

/// The literal keep-alive field name. Kept content-free per spec.md §4.4.3; the source material
/// available to this implementation did not preserve the exact historical name, so `ALIV` is
/// this implementation's documented choice (see DESIGN.md).
const KEEPALIVE_FIELD: &str = "ALIV";
const KEEPALIVE_PACKET: &str = "LINK";
const KEEPALIVE_ID: u32 = 1;

const LEGACY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

struct KeepAlive {
	timer: FixedTimerKey,
	interval: Duration,
}

impl KeepAlive {
	fn new() -> Self {
		Self { timer: FixedTimerKey::default(), interval: LEGACY_KEEPALIVE_INTERVAL }
	}

	/// Arms the scheduler with `interval`; every subsequent send postpones the next firing.
	fn arm(&mut self, cx: &mut Cx<ConnActor>, interval: Duration) {
		self.interval = interval;
		self.reset(cx);
	}

	/// Call whenever an outbound packet is written; piggybacking on application traffic counts
	/// as a keep-alive (spec.md §4.4.3).
	fn on_send(&mut self, cx: &mut Cx<ConnActor>) {
		self.reset(cx);
	}

	fn cancel(&mut self, cx: &mut Cx<ConnActor>) {
		cx.timer_del(self.timer);
		self.timer = FixedTimerKey::default();
	}

	fn reset(&mut self, cx: &mut Cx<ConnActor>) {
		cx.timer_del(self.timer);

		let actor = cx.access_actor().clone();
		self.timer = cx.after(self.interval, move |s| actor.apply(s, |this, cx| this.send_keepalive(cx)));
	}
}

/// The stakker actor backing a connection's socket. Owns the reactor-facing half (non-blocking
/// I/O, byte reassembly, keep-alive timer); the synchronous `Connection` handle drives it by
/// pumping the reactor and reading the shared field buffer directly.
struct ConnActor {
	link: Io<TcpStream>,
	reader: FramedReader,
	fifo: Rc<RefCell<VecDeque<Pending>>>,
	closed: Rc<Cell<bool>>,
	warnings: WarningPolicy,
	keepalive: KeepAlive,
	client_id: [u8; 4],
	/// Present when the connection was established with `ssl` enabled (spec.md §4.6). The NCP
	/// codec and framed reader only ever see the plaintext either side of this layer.
	tls: Option<TlsSession>,
}

impl ConnActor {
	fn init(cx: CX![], stream: TcpStream, fifo: Rc<RefCell<VecDeque<Pending>>>, closed: Rc<Cell<bool>>, client_id: [u8; 4], tls: Option<TlsSession>) -> Option<Self> {
		if let Err(err) = stream.set_nonblocking(true) {
			log::error!("failed to set connection non-blocking: {err}");
			return None;
		}

		let read_fwd: Fwd<Slice> = stakker::fwd_to!([cx], on_chunk() as (Slice));
		let link = Io::new(stream, read_fwd);

		let mut actor = Self { link, reader: FramedReader::new(), fifo, closed, warnings: WarningPolicy::default(), keepalive: KeepAlive::new(), client_id, tls };

		// A TLS client must send its ClientHello without waiting for any application data to
		// queue behind it.
		if let Err(err) = actor.flush_tls_output() {
			log::error!("initial TLS flush failed: {err}");
			return None;
		}

		Some(actor)
	}

	fn on_chunk(&mut self, _cx: CX![], chunk: Slice) {
		if chunk.is_empty() {
			self.closed.set(true);
			return;
		}

		let plaintext = if let Some(tls) = self.tls.as_mut() {
			match tls.absorb_ciphertext(&chunk) {
				Ok(plaintext) => plaintext,
				Err(err) => {
					log::error!("TLS record processing failed: {err}");
					self.closed.set(true);
					return;
				}
			}
		} else {
			chunk.to_vec()
		};

		if let Err(err) = self.flush_tls_output() {
			log::error!("TLS output flush failed: {err}");
			self.closed.set(true);
			return;
		}

		if plaintext.is_empty() {
			return;
		}

		self.reader.feed(&plaintext);

		let packets = match self.reader.drain() {
			Ok(packets) => packets,
			Err(err) => {
				log::error!("packet decode failed: {err}");
				self.closed.set(true);
				return;
			}
		};

		for (packet, warnings) in packets {
			for warning in warnings {
				log::warn!("decode warning on packet {}: {:?}", packet.packet_type, warning);
			}

			let mut fifo = self.fifo.borrow_mut();
			for field in packet.fields {
				fifo.push_back((packet.packet_type.clone(), field));
			}
		}
	}

	/// Drains any ciphertext the TLS record layer wants sent even without new application data —
	/// handshake messages queued in response to what `on_chunk` just absorbed.
	fn flush_tls_output(&mut self) -> Result<()> {
		let Some(tls) = self.tls.as_mut() else { return Ok(()) };

		let ciphertext = tls.encrypt(&[])?;
		if !ciphertext.is_empty() {
			self.link.write(ciphertext).map_err(|_| NcpError::Network(std::io::Error::new(std::io::ErrorKind::Other, "socket write failed")))?;
		}

		Ok(())
	}

	fn write(&mut self, packet_type: &str, id: u32, fields: &[Field]) -> Result<()> {
		let plaintext = encode_packet(packet_type, id, SystemTime::now(), self.client_id, fields);

		let out = match self.tls.as_mut() {
			Some(tls) => tls.encrypt(&plaintext)?,
			None => plaintext,
		};

		self.link.write(out).map_err(|_| NcpError::Network(std::io::Error::new(std::io::ErrorKind::Other, "socket write failed")))
	}

	fn send_keepalive(&mut self, cx: CX![]) {
		let field = Field::new(KEEPALIVE_FIELD, KEEPALIVE_ID);

		if self.write(KEEPALIVE_PACKET, KEEPALIVE_ID, &[field]).is_err() {
			log::error!("failed to send keep-alive packet");
		}

		self.keepalive.on_send(cx);
	}
}

/// A live NCP connection: one TCP socket, one private `stakker` reactor driving it, and the
/// field buffer/filter/id-generator state described in spec.md §4.4.
///
/// Each connection owns its reactor rather than sharing one process-wide instance across
/// connections (see DESIGN.md's "suspension points" entry): the pull-style `recv()` described by
/// spec.md is realized by pumping this private reactor until a matching field is available,
/// which keeps the single-threaded-cooperative-per-connection model spec.md §5 asks for without
/// needing the whole process to share one event loop.
pub struct Connection {
	stakker: Stakker,
	actor: ActorOwn<ConnActor>,
	fifo: Rc<RefCell<VecDeque<Pending>>>,
	closed: Rc<Cell<bool>>,
	id_gen: u32,
	filter: Filter,
	warnings: WarningPolicy,
	state: ConnState,
	/// Per-`recv()` timeout; `None` in legacy keep-alive mode (spec.md §4.4.3).
	timeout: Option<Duration>,
}

impl Connection {
	pub(crate) fn new(stream: TcpStream, filter: Filter, client_id: [u8; 4], tls: Option<TlsSession>) -> Result<Self> {
		let mut stakker = runtime::init();
		let fifo = Rc::new(RefCell::new(VecDeque::new()));
		let closed = Rc::new(Cell::new(false));

		let actor = actor!(stakker, ConnActor::init(stream, Rc::clone(&fifo), Rc::clone(&closed), client_id, tls), ret_nop!());

		Ok(Self { stakker, actor, fifo, closed, id_gen: 0, filter, warnings: WarningPolicy::default(), state: ConnState::Initial, timeout: None })
	}

	pub(crate) fn set_state(&mut self, state: ConnState) {
		self.state = state;
	}

	pub fn state(&self) -> ConnState {
		self.state
	}

	pub fn is_closing(&self) -> bool {
		matches!(self.state, ConnState::Closing | ConnState::Closed | ConnState::ErrorClose)
	}

	fn next_id(&mut self) -> u32 {
		self.id_gen = self.id_gen.wrapping_add(1);
		if self.id_gen == 0 {
			self.id_gen = 1;
		}
		self.id_gen
	}

	/// Arms the keep-alive scheduler and the per-`recv()` timeout after a successful negotiated
	/// handshake (spec.md §4.4.3/§4.5 step 7). `None` leaves legacy mode (3s unconditional sends,
	/// no receive timeout).
	pub(crate) fn arm_keepalive(&mut self, negotiated: Option<Duration>) -> Result<()> {
		self.timeout = negotiated;
		let interval = negotiated.map(|t| Duration::from_secs_f64(t.as_secs_f64() * 0.66)).unwrap_or(LEGACY_KEEPALIVE_INTERVAL);

		self.actor.apply(&mut self.stakker, |this, mut cx| this.keepalive.arm(&mut cx, interval));
		Ok(())
	}

	/// The negotiated per-`recv()` timeout, or `None` in legacy keep-alive mode (spec.md §4.4.3).
	pub fn timeout(&self) -> Option<Duration> {
		self.timeout
	}

	fn deadline(&self) -> Option<Instant> {
		self.timeout.map(|t| Instant::now() + t)
	}

	fn pump_once(&mut self, deadline: Option<Instant>) -> Result<()> {
		let timeout = match deadline {
			Some(d) => {
				let now = Instant::now();
				if d <= now {
					self.state = ConnState::Closing;
					return Err(NcpError::NetworkTimeout);
				}
				Some(d - now)
			}
			None => None,
		};

		runtime::pump(&mut self.stakker, timeout).map_err(|_| NcpError::Network(std::io::Error::new(std::io::ErrorKind::Other, "reactor poll failed")))?;

		Ok(())
	}

	/// Scans the FIFO for the first field matching `pred`, applying the connection filter to
	/// every candidate field encountered (spec.md §4.4.1/§4.4.2): matches that the filter
	/// suppresses are dropped and scanning continues; matches that raise are propagated
	/// immediately; non-matching fields are left buffered for a future call.
	fn recv_matching(&mut self, mut pred: impl FnMut(&str, &Field) -> bool, deadline: Option<Instant>) -> Result<Field> {
		loop {
			loop {
				let found = { self.fifo.borrow().iter().position(|(packet_type, field)| pred(packet_type, field)) };

				let Some(idx) = found else { break };

				let (packet_type, field) = self.fifo.borrow_mut().remove(idx).unwrap();

				match self.filter.apply(&packet_type, field, self.warnings) {
					Ok(Some(field)) => return Ok(field),
					Ok(None) => continue,
					Err(err) => return Err(err),
				}
			}

			if self.closed.get() && self.fifo.borrow().is_empty() {
				self.state = ConnState::Closed;
				return Err(NcpError::ConnectionClosed);
			}

			self.pump_once(deadline)?;
		}
	}

	/// Returns the next field that passes the connection's filter predicate.
	pub fn recv(&mut self) -> Result<Field> {
		let deadline = self.deadline();
		self.recv_matching(|_, _| true, deadline)
	}

	/// Repeatedly `recv()`s until a field from `packet_type` named `field_name` arrives.
	pub fn recv_field(&mut self, packet_type: &str, field_name: &str) -> Result<Field> {
		let deadline = self.deadline();
		self.recv_matching(|pt, field| pt == packet_type && field.name == field_name, deadline)
	}

	/// As `recv_field`, but against a caller-supplied deadline rather than the connection's
	/// negotiated per-`recv()` timeout. Used during the handshake (C5), before that timeout has
	/// been negotiated.
	pub(crate) fn recv_field_within(&mut self, packet_type: &str, field_name: &str, deadline: Option<Instant>) -> Result<Field> {
		self.recv_matching(|pt, field| pt == packet_type && field.name == field_name, deadline)
	}

	/// Emits one field in a fresh packet, returning a `Response` bound to it.
	pub fn send(&mut self, packet_type: &str, field_name: &str, params: Vec<(String, Value)>) -> Result<Response> {
		self.send_packet(packet_type, vec![(field_name.to_string(), params)])
	}

	/// Emits several fields in one packet, returning a `Response` bound to the full set.
	pub fn send_packet(&mut self, packet_type: &str, named_fields: Vec<(String, Vec<(String, Value)>)>) -> Result<Response> {
		if self.is_closing() {
			return Err(NcpError::ConnectionClosed);
		}

		let fields: Vec<Field> = named_fields
			.into_iter()
			.map(|(name, params)| {
				let id = self.next_id();
				Field { name, id, params }
			})
			.collect();

		let expected = fields.iter().map(|f| (f.name.clone(), f.id)).collect();

		let packet_type_owned = packet_type.to_string();
		let packet_id = self.next_id();

		self.actor.apply(&mut self.stakker, |this, mut cx| {
			if this.write(&packet_type_owned, packet_id, &fields).is_err() {
				log::error!("failed to send packet {packet_type_owned}");
			}
			this.keepalive.on_send(&mut cx);
		});

		Ok(Response { packet_type: packet_type.to_string(), expected })
	}

	/// Sends `fields` verbatim, under their own ids rather than assigning fresh ones. A server
	/// replying to a request must echo back the id the peer used, since the peer's `Response`
	/// correlates replies by `(field name, id)` (spec.md §4.4's echo scenario); `send`/`send_packet`
	/// always mint a new id, so this is the lower-level operation a conformant reply needs instead.
	pub fn reply(&mut self, packet_type: &str, fields: Vec<Field>) -> Result<()> {
		if self.is_closing() {
			return Err(NcpError::ConnectionClosed);
		}

		let packet_type_owned = packet_type.to_string();
		let packet_id = self.next_id();

		self.actor.apply(&mut self.stakker, |this, mut cx| {
			if this.write(&packet_type_owned, packet_id, &fields).is_err() {
				log::error!("failed to send packet {packet_type_owned}");
			}
			this.keepalive.on_send(&mut cx);
		});

		Ok(())
	}

	/// Closes the connection. Idempotent; cancels the keep-alive scheduler before the socket is
	/// released (via `ConnActor`'s `Io<T>` drop, when `actor` itself is dropped).
	pub fn close(&mut self) {
		if self.state == ConnState::Closed {
			return;
		}

		self.actor.apply(&mut self.stakker, |this, mut cx| this.keepalive.cancel(&mut cx));
		self.state = ConnState::Closed;
		self.closed.set(true);
	}

	/// Drains remaining traffic until the peer's orderly shutdown is observed.
	pub fn wait_closed(&mut self) -> Result<()> {
		loop {
			match self.recv() {
				Ok(_) => continue,
				Err(NcpError::ConnectionClosed) => return Ok(()),
				Err(err) => return Err(err),
			}
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn filter_raises_command_error_before_checking_ackn() {
		let filter = Filter::default();
		let field = Field::new("DATA", 1).param("ERRO", Value::String("boom".to_string())).param("ACKN", Value::I32(1));

		let err = filter.apply("LINK", field, WarningPolicy::Log).unwrap_err();
		assert!(matches!(err, NcpError::Command { detail: Some(d), .. } if d == "boom"));
	}

	#[test]
	fn filter_suppresses_ackn_fields() {
		let filter = Filter::default();
		let field = Field::new("DATA", 1).param("ACKN", Value::I32(1));
		assert_eq!(filter.apply("LINK", field, WarningPolicy::Log).unwrap(), None);
	}

	#[test]
	fn accept_all_filter_passes_errors_through() {
		let filter = Filter::accept_all();
		let field = Field::new("DATA", 1).param("ERRO", Value::String("boom".to_string()));
		let result = filter.apply("LINK", field.clone(), WarningPolicy::Log).unwrap();
		assert_eq!(result, Some(field));
	}
}
