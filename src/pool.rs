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

//! A bounded pool of connections to one endpoint.
//!
//! Admission is a counting semaphore sized to `max_size`: a checked out connection holds
//! a permit, an idle one doesn't. The current size is therefore
//! `max_size - available permits + idle connections`.

use {
	crate::{
		Error, Result,
		apm::{Event, EventListeners, ConnectionCheckOutFailedReason, ConnectionRemovedReason},
		common::ConnectionPoolSettings,
		connection::{Connection, ConnectionFactory, Endpoint},
		ids::{ConnectionId, ServerId},
		sync::{CancellationToken, PeriodicTimer, Semaphore}
	},
	std::{
		collections::VecDeque,
		sync::{Arc, Weak, Mutex, PoisonError, atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering}},
		time::{Duration, Instant},
		fmt
	},
	log::{debug, info, warn}
};

/// How long maintenance waits for a permit before giving up on topping up the pool.
const MAINTENANCE_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(20);

const STATE_INITIAL:  u8 = 0;
const STATE_OPEN:     u8 = 1;
const STATE_DISPOSED: u8 = 2;

struct PooledEntry {
	connection: Box<dyn Connection>,
	generation: u64,
	last_used:  Instant
}

#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

struct PoolInner {
	server_id:     ServerId,
	endpoint:      Endpoint,
	settings:      ConnectionPoolSettings,
	factory:       Arc<dyn ConnectionFactory>,
	listeners:     Arc<EventListeners>,
	state:         AtomicU8,
	permits:       Semaphore,
	waiting:       AtomicUsize,
	idle:          Mutex<VecDeque<PooledEntry>>,
	generation:    AtomicU64,
	maintain_lock: Mutex<()>,
	timer:         Mutex<Option<PeriodicTimer>>
}

impl fmt::Debug for ConnectionPool {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("server_id", &self.0.server_id)
			.field("size", &self.size())
			.field("generation", &self.generation())
			.finish()
	}
}

impl ConnectionPool {
	pub fn new(
		server_id: ServerId,
		endpoint:  Endpoint,
		settings:  ConnectionPoolSettings,
		factory:   Arc<dyn ConnectionFactory>,
		listeners: Arc<EventListeners>
	) -> Self {
		Self(Arc::new(PoolInner {
			server_id,
			endpoint,
			settings,
			factory,
			listeners,
			state:         AtomicU8::new(STATE_INITIAL),
			permits:       Semaphore::new(settings.max_size),
			waiting:       AtomicUsize::new(0),
			idle:          Mutex::new(VecDeque::new()),
			generation:    AtomicU64::new(0),
			maintain_lock: Mutex::new(()),
			timer:         Mutex::new(None)
		}))
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.0.endpoint
	}

	pub fn settings(&self) -> &ConnectionPoolSettings {
		&self.0.settings
	}

	/// Opens the pool and starts the maintenance timer, which runs once right away.
	pub fn initialize(&self) -> Result<()> {
		match self.0.state.compare_exchange(STATE_INITIAL, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst) {
			Ok(_) => (),
			Err(STATE_OPEN) => return Ok(()),
			Err(_) => return Err(Error::Disposed("connection pool"))
		}

		let weak: Weak<PoolInner> = Arc::downgrade(&self.0);
		let timer = PeriodicTimer::start(
			"pool-maintenance",
			Duration::from_millis(0),
			self.0.settings.maintenance_interval,
			move || if let Some(inner) = weak.upgrade() {
				inner.maintain();
			}
		)?;
		*self.0.timer.lock()? = Some(timer);

		info!("{} pool opened", self.0.server_id);
		self.0.listeners.dispatch(Event::PoolOpened {
			server_id: &self.0.server_id,
			settings:  &self.0.settings
		});
		Ok(())
	}

	/// Checks out a connection, waiting at most `timeout` for a free slot. The wait is
	/// further bounded by the configured wait queue timeout.
	pub fn acquire(&self, timeout: Duration, cancel: &CancellationToken) -> Result<PooledConnection> {
		self.0.require_open()?;
		let timeout = timeout.min(self.0.settings.wait_queue_timeout);

		let start = Instant::now();
		self.0.listeners.dispatch(Event::ConnectionCheckOutStarted { server_id: &self.0.server_id });

		let waiting = self.0.waiting.fetch_add(1, Ordering::SeqCst);
		if waiting >= self.0.settings.wait_queue_size {
			self.0.waiting.fetch_sub(1, Ordering::SeqCst);
			self.0.check_out_failed(ConnectionCheckOutFailedReason::TooManyWaiters);
			return Err(Error::TooManyWaiters {
				endpoint: self.0.endpoint.clone(),
				max:      self.0.settings.wait_queue_size
			});
		}

		let acquired = self.0.permits.acquire(timeout, cancel);
		self.0.waiting.fetch_sub(1, Ordering::SeqCst);

		match acquired {
			Ok(true) => (),
			Ok(false) => {
				self.0.check_out_failed(ConnectionCheckOutFailedReason::Timeout);
				return Err(Error::PoolTimeout { endpoint: self.0.endpoint.clone(), timeout });
			}
			Err(Error::Disposed(_)) => {
				self.0.check_out_failed(ConnectionCheckOutFailedReason::PoolClosed);
				return Err(Error::Disposed("connection pool"));
			}
			Err(e) => {
				self.0.check_out_failed(match e {
					Error::Cancelled => ConnectionCheckOutFailedReason::Cancelled,
					_ => ConnectionCheckOutFailedReason::ConnectionError
				});
				return Err(e);
			}
		}

		if let Err(e) = self.0.require_open() {
			self.0.permits.release();
			self.0.check_out_failed(ConnectionCheckOutFailedReason::PoolClosed);
			return Err(e);
		}

		let entry = match self.0.take_idle() {
			Some(entry) => entry,
			None => match self.0.open_connection() {
				Ok(entry) => entry,
				Err(e) => {
					self.0.permits.release();
					self.0.check_out_failed(ConnectionCheckOutFailedReason::ConnectionError);
					return Err(e);
				}
			}
		};

		self.0.listeners.dispatch(Event::ConnectionCheckedOut {
			connection_id: entry.connection.id(),
			duration:      start.elapsed()
		});

		Ok(PooledConnection {
			id:       entry.connection.id().clone(),
			endpoint: self.0.endpoint.clone(),
			pool:     self.0.clone(),
			entry:    Some(entry)
		})
	}

	/// Condemns every existing connection, idle or checked out.
	pub fn clear(&self) {
		let generation = self.0.generation.fetch_add(1, Ordering::SeqCst) + 1;
		debug!("{} pool cleared, generation is now {}", self.0.server_id, generation);
		self.0.listeners.dispatch(Event::PoolCleared {
			server_id: &self.0.server_id,
			generation
		});
	}

	/// Closes all idle connections and stops maintenance. Connections checked out at this
	/// point are closed when they are returned.
	pub fn dispose(&self) {
		if self.0.state.swap(STATE_DISPOSED, Ordering::SeqCst) == STATE_DISPOSED {
			return;
		}

		drop(self.0.timer.lock().unwrap_or_else(PoisonError::into_inner).take());

		let idle = std::mem::take(&mut *self.0.idle.lock().unwrap_or_else(PoisonError::into_inner));
		for entry in idle {
			self.0.remove(entry, ConnectionRemovedReason::PoolClosed);
		}

		// fails everyone still waiting
		self.0.permits.close();

		info!("{} pool closed", self.0.server_id);
		self.0.listeners.dispatch(Event::PoolClosed { server_id: &self.0.server_id });
	}

	/// Runs one maintenance pass now, unless one is already running.
	pub fn maintain(&self) {
		self.0.maintain();
	}

	pub fn generation(&self) -> u64 {
		self.0.generation.load(Ordering::SeqCst)
	}

	/// Checked out plus idle connections.
	pub fn size(&self) -> usize {
		self.0.size()
	}

	/// Free permits, i.e. how many more connections could be checked out right now.
	pub fn available_count(&self) -> usize {
		self.0.permits.available()
	}

	pub fn idle_count(&self) -> usize {
		self.0.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn waiting_count(&self) -> usize {
		self.0.waiting.load(Ordering::SeqCst)
	}
}

impl PoolInner {
	fn require_open(&self) -> Result<()> {
		match self.state.load(Ordering::SeqCst) {
			STATE_OPEN     => Ok(()),
			STATE_INITIAL  => Err(Error::InvalidState("the connection pool has not been initialized")),
			_              => Err(Error::Disposed("connection pool"))
		}
	}

	fn size(&self) -> usize {
		let checked_out = self.settings.max_size.saturating_sub(self.permits.available());
		checked_out + self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	fn check_out_failed(&self, reason: ConnectionCheckOutFailedReason) {
		debug!("{} check out failed: {:?}", self.server_id, reason);
		self.listeners.dispatch(Event::ConnectionCheckOutFailed {
			server_id: &self.server_id,
			reason
		});
	}

	fn expiry(&self, entry: &PooledEntry) -> Option<ConnectionRemovedReason> {
		let now = Instant::now();
		if !entry.connection.is_open() {
			Some(ConnectionRemovedReason::Error)
		} else if entry.generation != self.generation.load(Ordering::SeqCst) {
			Some(ConnectionRemovedReason::Stale)
		} else if entry.connection.opened_at()
			.map_or(false, |opened_at| now.duration_since(opened_at) > self.settings.max_life_time) {
			Some(ConnectionRemovedReason::LifeTimeExceeded)
		} else if now.duration_since(entry.last_used) > self.settings.max_idle_time {
			Some(ConnectionRemovedReason::Idle)
		} else {
			None
		}
	}

	fn remove(&self, mut entry: PooledEntry, reason: ConnectionRemovedReason) {
		debug!("{} removed from the pool: {:?}", entry.connection.id(), reason);
		entry.connection.dispose();
		self.listeners.dispatch(Event::ConnectionRemoved {
			connection_id: entry.connection.id(),
			reason
		});
	}

	/// Pops the most recently used idle connection, discarding expired ones on the way.
	fn take_idle(&self) -> Option<PooledEntry> {
		loop {
			let entry = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop_back()?;
			match self.expiry(&entry) {
				None => return Some(entry),
				Some(reason) => self.remove(entry, reason)
			}
		}
	}

	/// Creates and opens a connection. The caller must hold a permit for it.
	fn open_connection(&self) -> Result<PooledEntry> {
		let generation = self.generation.load(Ordering::SeqCst);
		let mut connection = self.factory.create(&self.server_id, &self.endpoint);
		connection.open()?;
		self.listeners.dispatch(Event::ConnectionAdded { connection_id: connection.id() });
		Ok(PooledEntry { connection, generation, last_used: Instant::now() })
	}

	/// Adds `entry` to the idle queue unless the pool has been disposed, in which case
	/// the connection is closed. The state is checked under the queue lock, so nothing is
	/// queued after [`ConnectionPool::dispose`] drained it.
	fn push_idle(&self, entry: PooledEntry) {
		let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
		if self.state.load(Ordering::SeqCst) == STATE_DISPOSED {
			drop(idle);
			self.remove(entry, ConnectionRemovedReason::PoolClosed);
		} else {
			idle.push_back(entry);
		}
	}

	/// Puts a connection back, or discards it if it expired or the pool is gone. Releases
	/// the permit in both cases.
	fn release(&self, mut entry: PooledEntry) {
		self.listeners.dispatch(Event::ConnectionCheckedIn { connection_id: entry.connection.id() });

		match self.expiry(&entry) {
			Some(reason) => self.remove(entry, reason),
			None => {
				entry.last_used = Instant::now();
				self.push_idle(entry);
			}
		}
		self.permits.release();
	}

	fn maintain(&self) {
		let _guard = match self.maintain_lock.try_lock() {
			Ok(guard) => guard,
			Err(_) => return
		};

		if self.state.load(Ordering::SeqCst) != STATE_OPEN {
			return;
		}

		// prune at most one expired connection, oldest first
		let expired = {
			let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
			idle.iter()
				.position(|entry| self.expiry(entry).is_some())
				.and_then(|i| idle.remove(i))
		};
		if let Some(entry) = expired {
			let reason = self.expiry(&entry).unwrap_or(ConnectionRemovedReason::Stale);
			self.remove(entry, reason);
		}

		while self.size() < self.settings.min_size {
			match self.permits.acquire(MAINTENANCE_ACQUIRE_TIMEOUT, &CancellationToken::none()) {
				Ok(true) => (),
				_ => break
			}

			let opened = self.open_connection();
			match opened {
				Ok(entry) => self.push_idle(entry),
				Err(e) => {
					self.permits.release();
					warn!("{} failed to open a connection during maintenance: {}", self.server_id, e);
					break;
				}
			}
			self.permits.release();
		}
	}
}

/// A checked out connection, returned to its pool when dropped.
pub struct PooledConnection {
	id:       ConnectionId,
	endpoint: Endpoint,
	pool:     Arc<PoolInner>,
	entry:    Option<PooledEntry>
}

impl PooledConnection {
	pub fn id(&self) -> &ConnectionId {
		&self.id
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	pub fn generation(&self) -> Option<u64> {
		self.entry.as_ref().map(|entry| entry.generation)
	}

	pub fn connection(&mut self) -> Result<&mut dyn Connection> {
		match &mut self.entry {
			Some(entry) => Ok(&mut *entry.connection),
			None => Err(Error::Disposed("pooled connection"))
		}
	}
}

impl fmt::Debug for PooledConnection {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("PooledConnection")
			.field("id", &self.id)
			.field("generation", &self.generation())
			.finish()
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(entry) = self.entry.take() {
			self.pool.release(entry);
		}
	}
}
