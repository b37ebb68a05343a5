// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::{
		Error, Result,
		apm::{Event, EventListeners},
		common::{ConnectionSettings, ConnectionStringError, DEFAULT_MONGO_PORT},
		ids::{ConnectionId, IdGenerator, ServerId},
		wire::{self, ReplyMessage}
	},
	std::{
		io::{self, Read, Write},
		net::{TcpStream, ToSocketAddrs},
		str::FromStr,
		sync::Arc,
		time::Instant,
		fmt
	},
	log::{trace, debug}
};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Endpoint {
	pub host: String,
	pub port: u16
}

impl Endpoint {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_string(), port }
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for Endpoint {
	type Err = ConnectionStringError;

	/// `host`, `host:port`, `[v6addr]` or `[v6addr]:port`
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || ConnectionStringError::InvalidHost(s.to_string());

		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			let i = rest.find(']').ok_or_else(invalid)?;
			match &rest[i + 1..] {
				""   => (&rest[..i], None),
				port => (&rest[..i], Some(port.strip_prefix(':').ok_or_else(invalid)?))
			}
		} else {
			match s.find(':') {
				Some(i) => (&s[..i], Some(&s[i + 1..])),
				None    => (s, None)
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		Ok(Self {
			host: host.to_lowercase(),
			port: match port {
				Some(port) => port.parse().map_err(|_| invalid())?,
				None       => DEFAULT_MONGO_PORT
			}
		})
	}
}

pub enum Stream {
	Tcp(TcpStream),
	#[cfg(feature = "tls")]
	Tls(Box<rustls::StreamOwned<rustls::ClientSession, TcpStream>>)
}

impl fmt::Debug for Stream {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Tcp(..) => "Stream::Tcp(...)",
			#[cfg(feature = "tls")]
			Self::Tls(..) => "Stream::Tls(...)"
		})
	}
}

impl Stream {
	/// Tries each resolved address in turn, then applies the socket options and wraps the
	/// stream in TLS if configured.
	pub fn connect(endpoint: &Endpoint, settings: &ConnectionSettings) -> Result<Self> {
		let addrs = (endpoint.host.as_str(), endpoint.port).to_socket_addrs()
			.map_err(|source| Error::Open { endpoint: endpoint.clone(), source })?;

		let mut last_error = io::Error::new(io::ErrorKind::NotFound, "the host name resolved to no addresses");
		let mut tcp = None;
		for addr in addrs {
			match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
				Ok(stream) => {
					tcp = Some(stream);
					break;
				}
				Err(e) => {
					trace!("failed to connect to {} ({}): {}", endpoint, addr, e);
					last_error = e;
				}
			}
		}

		let tcp = match tcp {
			Some(tcp) => tcp,
			None if last_error.kind() == io::ErrorKind::TimedOut
				=> return Err(Error::ConnectTimeout { endpoint: endpoint.clone(), source: last_error }),
			None => return Err(Error::Open { endpoint: endpoint.clone(), source: last_error })
		};

		let configure = |tcp: &TcpStream| -> io::Result<()> {
			tcp.set_read_timeout(settings.read_timeout)?;
			tcp.set_write_timeout(settings.write_timeout)?;
			tcp.set_nodelay(true)
		};
		configure(&tcp).map_err(|source| Error::Open { endpoint: endpoint.clone(), source })?;

		#[cfg(feature = "tls")]
		if let Some(config) = &settings.tls_config {
			return Ok(Stream::Tls(Box::new(rustls::StreamOwned::new(
				rustls::ClientSession::new(&config.0,
					webpki::DNSNameRef::try_from_ascii_str(&endpoint.host)?),
				tcp
			))));
		}

		Ok(Stream::Tcp(tcp))
	}
}

impl Read for Stream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.read(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.read(buf)
		}
	}
}

impl Write for Stream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.write(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.write(buf)
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Self::Tcp(stream) => stream.flush(),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.flush()
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
	Initial,
	Open,
	Disposed
}

/// A single byte stream to one server.
///
/// `open` moves the connection from `Initial` to `Open` and is a no-op once open. Any I/O
/// failure disposes the connection, a disposed connection rejects every operation.
pub trait Connection: fmt::Debug + Send {
	fn id(&self) -> &ConnectionId;

	fn endpoint(&self) -> &Endpoint;

	fn state(&self) -> ConnectionState;

	fn opened_at(&self) -> Option<Instant>;

	fn open(&mut self) -> Result<()>;

	/// Writes one or more complete, already framed messages.
	fn send(&mut self, bytes: &[u8]) -> Result<()>;

	/// Reads the next reply, which must be the response to `response_to`.
	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage>;

	fn dispose(&mut self);

	fn is_open(&self) -> bool {
		self.state() == ConnectionState::Open
	}
}

/// Runs right after the stream of a new connection has been established, before the
/// connection is handed out. Mechanisms are implemented outside of this crate.
pub trait Authenticator: fmt::Debug + Send + Sync {
	fn authenticate(&self, connection: &mut dyn Connection) -> Result<()>;
}

pub struct BinaryConnection {
	id:        ConnectionId,
	endpoint:  Endpoint,
	settings:  Arc<ConnectionSettings>,
	listeners: Arc<EventListeners>,
	state:     ConnectionState,
	stream:    Option<Stream>,
	opened_at: Option<Instant>
}

impl fmt::Debug for BinaryConnection {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("BinaryConnection")
			.field("id", &self.id)
			.field("state", &self.state)
			.field("stream", &self.stream)
			.finish()
	}
}

impl BinaryConnection {
	pub fn new(
		id:        ConnectionId,
		endpoint:  Endpoint,
		settings:  Arc<ConnectionSettings>,
		listeners: Arc<EventListeners>
	) -> Self {
		Self {
			id,
			endpoint,
			settings,
			listeners,
			state:     ConnectionState::Initial,
			stream:    None,
			opened_at: None
		}
	}

	fn require_open(&mut self) -> Result<&mut Stream> {
		match self.state {
			ConnectionState::Open     => self.stream.as_mut().ok_or(Error::InvalidState("connection has no stream")),
			ConnectionState::Initial  => Err(Error::InvalidState("connection is not open")),
			ConnectionState::Disposed => Err(Error::Disposed("connection"))
		}
	}

	/// Disposes the connection and wraps the I/O error.
	fn fail(&mut self, source: io::Error, writing: bool) -> Error {
		self.dispose();
		let connection_id = self.id.clone();
		match source.kind() {
			io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock if writing
				=> Error::WriteTimeout { connection_id, source },
			io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
				=> Error::ReadTimeout { connection_id, source },
			_ => Error::Socket { connection_id, source }
		}
	}

	fn open_inner(&mut self) -> Result<()> {
		self.stream = Some(Stream::connect(&self.endpoint, &self.settings)?);
		self.state = ConnectionState::Open;
		self.opened_at = Some(Instant::now());

		let settings = self.settings.clone();
		for authenticator in &settings.authenticators {
			authenticator.authenticate(self)?;
		}
		Ok(())
	}
}

impl Connection for BinaryConnection {
	fn id(&self) -> &ConnectionId {
		&self.id
	}

	fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	fn state(&self) -> ConnectionState {
		self.state
	}

	fn opened_at(&self) -> Option<Instant> {
		self.opened_at
	}

	fn open(&mut self) -> Result<()> {
		match self.state {
			ConnectionState::Open     => return Ok(()),
			ConnectionState::Disposed => return Err(Error::Disposed("connection")),
			ConnectionState::Initial  => ()
		}

		let start = Instant::now();
		match self.open_inner() {
			Ok(()) => {
				debug!("{} opened in {:?}", self.id, start.elapsed());
				self.listeners.dispatch(Event::ConnectionOpened {
					connection_id: &self.id,
					duration:      start.elapsed()
				});
				Ok(())
			}
			Err(e) => {
				debug!("{} failed to open: {}", self.id, e);
				self.listeners.dispatch(Event::ConnectionOpenFailed {
					connection_id: &self.id,
					failure:       &e
				});
				self.dispose();
				Err(e)
			}
		}
	}

	fn send(&mut self, bytes: &[u8]) -> Result<()> {
		let stream = self.require_open()?;
		match stream.write_all(bytes).and_then(|_| stream.flush()) {
			Ok(()) => {
				trace!("{} sent {} bytes", self.id, bytes.len());
				Ok(())
			}
			Err(e) => Err(self.fail(e, true))
		}
	}

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
		let stream = self.require_open()?;
		let reply = match ReplyMessage::read_from(stream, wire::MAX_MESSAGE_SIZE) {
			Ok(reply) => reply,
			Err(Error::Io(e)) => return Err(self.fail(e, false)),
			Err(e) => {
				self.dispose();
				return Err(e);
			}
		};

		if let Err(e) = reply.expect_response_to(response_to) {
			self.dispose();
			return Err(e);
		}

		trace!("{} received a reply to {} with {} documents", self.id, response_to, reply.number_returned);
		Ok(reply)
	}

	fn dispose(&mut self) {
		if self.state == ConnectionState::Disposed {
			return;
		}

		let was_open = self.state == ConnectionState::Open;
		self.state = ConnectionState::Disposed;
		if let Some(Stream::Tcp(tcp)) = self.stream.take() {
			let _ = tcp.shutdown(std::net::Shutdown::Both);
		}

		if was_open {
			debug!("{} closed", self.id);
			self.listeners.dispatch(Event::ConnectionClosed { connection_id: &self.id });
		}
	}
}

impl Drop for BinaryConnection {
	fn drop(&mut self) {
		self.dispose();
	}
}

/// Creates unopened connections for the pool and the server monitor.
pub trait ConnectionFactory: fmt::Debug + Send + Sync {
	fn create(&self, server_id: &ServerId, endpoint: &Endpoint) -> Box<dyn Connection>;
}

#[derive(Debug)]
pub struct BinaryConnectionFactory {
	settings:  Arc<ConnectionSettings>,
	ids:       Arc<IdGenerator>,
	listeners: Arc<EventListeners>
}

impl BinaryConnectionFactory {
	pub fn new(settings: ConnectionSettings, ids: Arc<IdGenerator>, listeners: Arc<EventListeners>) -> Self {
		Self { settings: Arc::new(settings), ids, listeners }
	}
}

impl ConnectionFactory for BinaryConnectionFactory {
	fn create(&self, server_id: &ServerId, endpoint: &Endpoint) -> Box<dyn Connection> {
		Box::new(BinaryConnection::new(
			self.ids.next_connection_id(server_id),
			endpoint.clone(),
			self.settings.clone(),
			self.listeners.clone()
		))
	}
}
