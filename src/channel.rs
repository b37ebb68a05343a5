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

//! Request/reply conduits bound to one server.

use {
	crate::{
		Error, Result,
		connection::{Connection, ConnectionFactory, Endpoint},
		ids::{ConnectionId, ServerId},
		pool::{ConnectionPool, PooledConnection},
		sync::{self, CancellationToken},
		wire::{MessageBuffer, ReplyMessage}
	},
	std::{
		sync::{Arc, Mutex, Condvar, PoisonError},
		time::Duration,
		fmt
	},
	log::debug
};

pub trait Channel {
	fn endpoint(&self) -> &Endpoint;

	fn connection_id(&self) -> &ConnectionId;

	fn send(&mut self, buffer: &MessageBuffer) -> Result<()>;

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage>;
}

pub type BoxedChannel = Box<dyn Channel + Send>;

impl<'a> Channel for dyn Connection + 'a {
	fn endpoint(&self) -> &Endpoint {
		Connection::endpoint(self)
	}

	fn connection_id(&self) -> &ConnectionId {
		self.id()
	}

	fn send(&mut self, buffer: &MessageBuffer) -> Result<()> {
		Connection::send(self, buffer.as_bytes())
	}

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
		Connection::receive(self, response_to)
	}
}

impl Channel for PooledConnection {
	fn endpoint(&self) -> &Endpoint {
		PooledConnection::endpoint(self)
	}

	fn connection_id(&self) -> &ConnectionId {
		self.id()
	}

	fn send(&mut self, buffer: &MessageBuffer) -> Result<()> {
		Connection::send(self.connection()?, buffer.as_bytes())
	}

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
		Connection::receive(self.connection()?, response_to)
	}
}

/// Where a server gets its channels from.
#[derive(Debug, Clone)]
pub enum ChannelProvider {
	Pooled(ConnectionPool),
	Direct(DirectChannelProvider)
}

impl ChannelProvider {
	pub fn initialize(&self) -> Result<()> {
		match self {
			Self::Pooled(pool)     => pool.initialize(),
			Self::Direct(provider) => provider.initialize()
		}
	}

	pub fn get_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		Ok(match self {
			Self::Pooled(pool)     => Box::new(pool.acquire(timeout, cancel)?),
			Self::Direct(provider) => Box::new(provider.get_channel(timeout, cancel)?)
		})
	}

	/// Invalidates all existing connections.
	pub fn clear(&self) {
		match self {
			Self::Pooled(pool)     => pool.clear(),
			Self::Direct(provider) => provider.clear()
		}
	}

	pub fn dispose(&self) {
		match self {
			Self::Pooled(pool)     => pool.dispose(),
			Self::Direct(provider) => provider.dispose()
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DirectState {
	Initial,
	Open,
	Disposed
}

#[derive(Debug)]
struct DirectSlot {
	state:      DirectState,
	connection: Option<Box<dyn Connection>>,
	in_use:     bool,
	generation: u64
}

#[derive(Debug)]
struct DirectInner {
	server_id: ServerId,
	endpoint:  Endpoint,
	factory:   Arc<dyn ConnectionFactory>,
	slot:      Mutex<DirectSlot>,
	condvar:   Condvar
}

/// One dedicated connection, handed to one caller at a time.
#[derive(Debug, Clone)]
pub struct DirectChannelProvider(Arc<DirectInner>);

impl DirectChannelProvider {
	pub fn new(server_id: ServerId, endpoint: Endpoint, factory: Arc<dyn ConnectionFactory>) -> Self {
		Self(Arc::new(DirectInner {
			server_id,
			endpoint,
			factory,
			slot: Mutex::new(DirectSlot {
				state:      DirectState::Initial,
				connection: None,
				in_use:     false,
				generation: 0
			}),
			condvar: Condvar::new()
		}))
	}

	pub fn initialize(&self) -> Result<()> {
		let mut slot = self.0.slot.lock()?;
		match slot.state {
			DirectState::Disposed => Err(Error::Disposed("channel provider")),
			_ => {
				slot.state = DirectState::Open;
				Ok(())
			}
		}
	}

	pub fn get_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<DirectChannel> {
		let (mut slot, timed_out) = sync::wait_while(
			&self.0.condvar, self.0.slot.lock()?, timeout, cancel,
			|slot| slot.in_use && slot.state == DirectState::Open)?;

		match slot.state {
			DirectState::Open     => (),
			DirectState::Initial  => return Err(Error::InvalidState("the channel provider has not been initialized")),
			DirectState::Disposed => return Err(Error::Disposed("channel provider"))
		}

		if timed_out {
			return Err(Error::PoolTimeout { endpoint: self.0.endpoint.clone(), timeout });
		}

		let connection = match slot.connection.take() {
			Some(connection) if connection.is_open() => connection,
			_ => self.0.factory.create(&self.0.server_id, &self.0.endpoint)
		};
		slot.in_use = true;
		let generation = slot.generation;
		drop(slot);

		let mut channel = DirectChannel {
			id:         connection.id().clone(),
			endpoint:   self.0.endpoint.clone(),
			provider:   self.0.clone(),
			connection: Some(connection),
			generation
		};
		// an error drops the channel, which releases the slot
		channel.connection()?.open()?;
		Ok(channel)
	}

	pub fn clear(&self) {
		let mut slot = self.0.slot.lock().unwrap_or_else(PoisonError::into_inner);
		slot.generation += 1;
		if let Some(mut connection) = slot.connection.take() {
			connection.dispose();
		}
		debug!("{} direct channel cleared", self.0.server_id);
	}

	pub fn dispose(&self) {
		let mut slot = self.0.slot.lock().unwrap_or_else(PoisonError::into_inner);
		slot.state = DirectState::Disposed;
		if let Some(mut connection) = slot.connection.take() {
			connection.dispose();
		}
		self.0.condvar.notify_all();
	}
}

/// The connection of a [`DirectChannelProvider`], returned when dropped.
pub struct DirectChannel {
	id:         ConnectionId,
	endpoint:   Endpoint,
	provider:   Arc<DirectInner>,
	connection: Option<Box<dyn Connection>>,
	generation: u64
}

impl DirectChannel {
	fn connection(&mut self) -> Result<&mut dyn Connection> {
		match &mut self.connection {
			Some(connection) => Ok(&mut **connection),
			None => Err(Error::Disposed("channel"))
		}
	}
}

impl fmt::Debug for DirectChannel {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("DirectChannel")
			.field("id", &self.id)
			.finish()
	}
}

impl Channel for DirectChannel {
	fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	fn connection_id(&self) -> &ConnectionId {
		&self.id
	}

	fn send(&mut self, buffer: &MessageBuffer) -> Result<()> {
		Connection::send(self.connection()?, buffer.as_bytes())
	}

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
		Connection::receive(self.connection()?, response_to)
	}
}

impl Drop for DirectChannel {
	fn drop(&mut self) {
		let mut slot = self.provider.slot.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(mut connection) = self.connection.take() {
			if slot.state == DirectState::Open && slot.generation == self.generation && connection.is_open() {
				slot.connection = Some(connection);
			} else {
				connection.dispose();
			}
		}
		slot.in_use = false;
		self.provider.condvar.notify_one();
	}
}
