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

//! Server descriptions and the background monitor that keeps them current.

use {
	crate::{
		Error, Result, DRIVER_NAME,
		apm::{Event, EventListeners},
		channel::{BoxedChannel, Channel, ChannelProvider, DirectChannelProvider},
		common::{
			ConnectionPoolSettings, ConnectionSettings, ServerSettings,
			DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE
		},
		connection::{BinaryConnectionFactory, Connection, ConnectionFactory, Endpoint},
		cursor::ChannelSource,
		ids::{ClusterId, ConnectionId, IdGenerator, ServerId},
		pool::ConnectionPool,
		protocol::{CommandProtocol, Protocol},
		sync::{CancellationToken, PeriodicTimer},
		wire::{MessageBuffer, ReplyMessage}
	},
	std::{
		collections::{HashMap, VecDeque},
		sync::{Arc, Weak, Mutex, RwLock, PoisonError, TryLockError, atomic::{AtomicU8, Ordering}},
		time::{Duration, Instant},
		fmt
	},
	serde::Deserialize,
	bson::{doc, Document},
	log::{debug, info, warn}
};

/// Number of ping samples the average ping time is computed over.
const PING_SAMPLES: usize = 5;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZED:   u8 = 1;
const STATE_DISPOSED:      u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerStatus {
	Connecting,
	Connected,
	Disconnected,
	Disposed
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Unknown,
	StandAlone,
	ShardRouter,
	ReplicaSetPrimary,
	ReplicaSetSecondary,
	ReplicaSetArbiter,
	/// Hidden members, members in recovery and replica set ghosts.
	ReplicaSetOther
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn is_replica_set_member(self) -> bool {
		matches!(self,
			Self::ReplicaSetPrimary
			| Self::ReplicaSetSecondary
			| Self::ReplicaSetArbiter
			| Self::ReplicaSetOther)
	}

	pub fn is_writable(self) -> bool {
		matches!(self, Self::StandAlone | Self::ShardRouter | Self::ReplicaSetPrimary)
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildInfo {
	pub bits:        i32,
	pub git_version: String,
	pub sys_info:    String,
	pub version:     String
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReplicaSetInfo {
	pub name:    String,
	pub primary: Option<Endpoint>,
	/// Hosts, passives and arbiters.
	pub members: Vec<Endpoint>,
	pub tags:    HashMap<String, String>,
	pub version: Option<i32>
}

/// Immutable snapshot of what is known about one server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub server_id:         ServerId,
	pub endpoint:          Endpoint,
	pub status:            ServerStatus,
	pub r#type:            ServerType,
	pub average_ping_time: Duration,
	pub max_document_size: usize,
	pub max_message_size:  usize,
	pub build_info:        Option<BuildInfo>,
	pub replica_set_info:  Option<ReplicaSetInfo>,
	/// Incremented by the owning server with every published change.
	pub revision:          u64
}

impl ServerDescription {
	fn with_status(server_id: &ServerId, status: ServerStatus) -> Self {
		Self {
			server_id:         server_id.clone(),
			endpoint:          server_id.endpoint.clone(),
			status,
			r#type:            ServerType::Unknown,
			average_ping_time: Duration::from_secs(0),
			max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
			max_message_size:  DEFAULT_MAX_MESSAGE_SIZE,
			build_info:        None,
			replica_set_info:  None,
			revision:          0
		}
	}

	pub fn connecting(server_id: &ServerId) -> Self {
		Self::with_status(server_id, ServerStatus::Connecting)
	}

	pub fn disconnected(server_id: &ServerId) -> Self {
		Self::with_status(server_id, ServerStatus::Disconnected)
	}

	/// Builds the description of a server that answered both discovery commands.
	pub fn connected(
		server_id:  &ServerId,
		is_master:  &IsMasterResult,
		build_info: BuildInfoResult,
		ping_time:  Duration
	) -> Self {
		let max_document_size = is_master.max_bson_object_size
			.map_or(DEFAULT_MAX_DOCUMENT_SIZE, |size| size as usize);
		let max_message_size = is_master.max_message_size_bytes
			.map_or_else(|| DEFAULT_MAX_MESSAGE_SIZE.max(max_document_size + 16 * 1024), |size| size as usize);

		Self {
			server_id:         server_id.clone(),
			endpoint:          server_id.endpoint.clone(),
			status:            ServerStatus::Connected,
			r#type:            is_master.server_type(),
			average_ping_time: ping_time,
			max_document_size,
			max_message_size,
			build_info:        Some(BuildInfo {
				bits:        build_info.bits.unwrap_or(64),
				git_version: build_info.git_version.unwrap_or_default(),
				sys_info:    build_info.sys_info.unwrap_or_default(),
				version:     build_info.version
			}),
			replica_set_info:  is_master.replica_set_info(),
			revision:          0
		}
	}

	pub fn is_connected(&self) -> bool {
		self.status == ServerStatus::Connected
	}

	/// Returns true if a listener has to be told about the transition from `self` to `other`.
	pub fn differs_from(&self, other: &Self) -> bool {
		self.average_ping_time != other.average_ping_time
			|| self.status != other.status
			|| self.r#type != other.r#type
			|| self.replica_set_info != other.replica_set_info
	}
}

/// Reply to `{ismaster: 1}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsMasterResult {
	#[serde(default)]
	pub ismaster:               bool,
	pub secondary:              Option<bool>,
	pub arbiter_only:           Option<bool>,
	pub isreplicaset:           Option<bool>,
	pub set_name:               Option<String>,
	pub primary:                Option<String>,
	pub hosts:                  Option<Vec<String>>,
	pub passives:               Option<Vec<String>>,
	pub arbiters:               Option<Vec<String>>,
	pub tags:                   Option<HashMap<String, String>>,
	pub set_version:            Option<i32>,
	pub max_bson_object_size:   Option<i32>,
	pub max_message_size_bytes: Option<i32>,
	pub msg:                    Option<String>
}

impl IsMasterResult {
	pub fn server_type(&self) -> ServerType {
		match self {
			Self { msg: Some(msg),                              .. } if msg == "isdbgrid" => ServerType::ShardRouter,
			Self { set_name: Some(_), ismaster: true,           .. } => ServerType::ReplicaSetPrimary,
			Self { set_name: Some(_), secondary: Some(true),    .. } => ServerType::ReplicaSetSecondary,
			Self { set_name: Some(_), arbiter_only: Some(true), .. } => ServerType::ReplicaSetArbiter,
			Self { set_name: Some(_),                           .. } => ServerType::ReplicaSetOther,
			Self { isreplicaset: Some(true),                    .. } => ServerType::ReplicaSetOther,
			_                                                        => ServerType::StandAlone
		}
	}

	/// Endpoints that don't parse are skipped.
	pub fn replica_set_info(&self) -> Option<ReplicaSetInfo> {
		let name = self.set_name.clone()?;
		let members = self.hosts.iter()
			.chain(&self.passives)
			.chain(&self.arbiters)
			.flatten()
			.filter_map(|host| match host.parse::<Endpoint>() {
				Ok(endpoint) => Some(endpoint),
				Err(e) => {
					warn!("ignoring replica set member `{}`: {}", host, e);
					None
				}
			})
			.collect();

		Some(ReplicaSetInfo {
			name,
			primary: self.primary.as_ref().and_then(|primary| primary.parse().ok()),
			members,
			tags:    self.tags.clone().unwrap_or_default(),
			version: self.set_version
		})
	}
}

/// Reply to `{buildinfo: 1}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfoResult {
	pub bits:        Option<i32>,
	pub git_version: Option<String>,
	pub sys_info:    Option<String>,
	#[serde(default)]
	pub version:     String
}

/// Moving average over the last few ping samples.
#[derive(Debug, Default)]
pub struct PingTimeAggregator {
	samples: VecDeque<Duration>
}

impl PingTimeAggregator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a sample and returns the new average.
	pub fn add(&mut self, sample: Duration) -> Duration {
		if self.samples.len() == PING_SAMPLES {
			self.samples.pop_front();
		}
		self.samples.push_back(sample);
		self.average()
	}

	pub fn average(&self) -> Duration {
		match self.samples.len() {
			0 => Duration::from_secs(0),
			n => self.samples.iter().sum::<Duration>() / n as u32
		}
	}

	pub fn clear(&mut self) {
		self.samples.clear();
	}
}

/// Called with the old and the new description whenever a server's description changes.
pub type DescriptionListener = Arc<dyn Fn(&Arc<ServerDescription>, &Arc<ServerDescription>) + Send + Sync>;

/// A server as seen by a cluster.
pub trait ClusterableServer: fmt::Debug + Send + Sync {
	fn id(&self) -> &ServerId;

	fn endpoint(&self) -> &Endpoint;

	fn description(&self) -> Arc<ServerDescription>;

	fn initialize(&self) -> Result<()>;

	/// Forgets everything known about the server and probes it again right away.
	fn invalidate(&self);

	fn get_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel>;

	fn subscribe(&self, listener: DescriptionListener);

	fn dispose(&self);
}

/// Monitors one endpoint and hands out channels to it.
#[derive(Clone)]
pub struct Server(Arc<ServerInner>);

struct ServerInner {
	id:                 ServerId,
	settings:           ServerSettings,
	provider:           ChannelProvider,
	monitor_factory:    Arc<dyn ConnectionFactory>,
	listeners:          Arc<EventListeners>,
	app_name:           Option<String>,
	state:              AtomicU8,
	description:        RwLock<Arc<ServerDescription>>,
	ping_times:         Mutex<PingTimeAggregator>,
	/// The monitoring connection, also the guard that keeps probes from overlapping.
	monitor_connection: Mutex<Option<Box<dyn Connection>>>,
	timer:              Mutex<Option<PeriodicTimer>>,
	subscribers:        RwLock<Vec<DescriptionListener>>
}

impl fmt::Debug for Server {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Server")
			.field("id", &self.0.id)
			.field("description", &self.0.description())
			.finish()
	}
}

impl Server {
	/// `monitor_factory` creates the connection used for discovery probes. `app_name` is
	/// reported to the server whenever a monitoring connection is opened.
	pub fn new(
		id:              ServerId,
		settings:        ServerSettings,
		provider:        ChannelProvider,
		monitor_factory: Arc<dyn ConnectionFactory>,
		listeners:       Arc<EventListeners>,
		app_name:        Option<String>
	) -> Self {
		Self(Arc::new(ServerInner {
			description:        RwLock::new(Arc::new(ServerDescription::disconnected(&id))),
			id,
			settings,
			provider,
			monitor_factory,
			listeners,
			app_name,
			state:              AtomicU8::new(STATE_UNINITIALIZED),
			ping_times:         Mutex::new(PingTimeAggregator::new()),
			monitor_connection: Mutex::new(None),
			timer:              Mutex::new(None),
			subscribers:        RwLock::new(Vec::new())
		}))
	}

	/// Probes the server as soon as possible, without discarding the current description.
	pub fn request_heartbeat(&self) {
		self.0.request_heartbeat();
	}
}

impl ChannelSource for Server {
	fn acquire_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		self.get_channel(timeout, cancel)
	}
}

impl ClusterableServer for Server {
	fn id(&self) -> &ServerId {
		&self.0.id
	}

	fn endpoint(&self) -> &Endpoint {
		&self.0.id.endpoint
	}

	fn description(&self) -> Arc<ServerDescription> {
		self.0.description()
	}

	fn initialize(&self) -> Result<()> {
		match self.0.state.compare_exchange(
			STATE_UNINITIALIZED, STATE_INITIALIZED, Ordering::SeqCst, Ordering::SeqCst) {
			Ok(_) => (),
			Err(STATE_INITIALIZED) => return Ok(()),
			Err(_) => return Err(Error::Disposed("server"))
		}

		self.0.publish(ServerDescription::connecting(&self.0.id));
		self.0.provider.initialize()?;

		let weak: Weak<ServerInner> = Arc::downgrade(&self.0);
		let timer = PeriodicTimer::start(
			"server-monitor",
			Duration::from_millis(0),
			self.0.settings.connect_retry_interval,
			move || if let Some(inner) = weak.upgrade() {
				inner.update_description();
			}
		)?;
		*self.0.timer.lock()? = Some(timer);
		debug!("{} initialized", self.0.id);
		Ok(())
	}

	fn invalidate(&self) {
		self.0.invalidate();
	}

	fn get_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		self.0.require_initialized()?;
		let channel = self.0.provider.get_channel(timeout, cancel)
			.map_err(|e| self.0.report(e))?;
		Ok(Box::new(ServerChannel {
			inner:  channel,
			server: Arc::downgrade(&self.0)
		}))
	}

	fn subscribe(&self, listener: DescriptionListener) {
		self.0.subscribers.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(listener);
	}

	fn dispose(&self) {
		if self.0.state.swap(STATE_DISPOSED, Ordering::SeqCst) == STATE_DISPOSED {
			return;
		}

		drop(self.0.timer.lock().unwrap_or_else(PoisonError::into_inner).take());
		self.0.provider.dispose();

		// a running probe drops the connection itself once it sees the disposed state
		if let Ok(mut connection) = self.0.monitor_connection.try_lock() {
			if let Some(mut connection) = connection.take() {
				connection.dispose();
			}
		}

		self.0.publish(ServerDescription::with_status(&self.0.id, ServerStatus::Disposed));
		debug!("{} disposed", self.0.id);
	}
}

impl ServerInner {
	fn description(&self) -> Arc<ServerDescription> {
		self.description.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	fn require_initialized(&self) -> Result<()> {
		match self.state.load(Ordering::SeqCst) {
			STATE_INITIALIZED   => Ok(()),
			STATE_UNINITIALIZED => Err(Error::InvalidState("server has not been initialized")),
			_                   => Err(Error::Disposed("server"))
		}
	}

	fn is_disposed(&self) -> bool {
		self.state.load(Ordering::SeqCst) == STATE_DISPOSED
	}

	/// Swaps in `description` and notifies everyone if it differs from the current one.
	fn publish(&self, mut description: ServerDescription) {
		let (old, new) = {
			let mut current = self.description.write().unwrap_or_else(PoisonError::into_inner);
			if !current.differs_from(&description) {
				return;
			}
			description.revision = current.revision + 1;
			let new = Arc::new(description);
			(std::mem::replace(&mut *current, new.clone()), new)
		};

		if old.status != new.status || old.r#type != new.r#type {
			info!("{} is now {:?} ({:?})", self.id, new.status, new.r#type);
		}

		self.listeners.dispatch(Event::ServerDescriptionChanged { old: &old, new: &new });
		let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner).clone();
		for subscriber in subscribers {
			subscriber(&old, &new);
		}
	}

	fn reschedule(&self, interval: Duration) {
		if let Some(timer) = &*self.timer.lock().unwrap_or_else(PoisonError::into_inner) {
			if timer.interval() != interval {
				debug!("{} monitor interval is now {:?}", self.id, interval);
			}
			timer.reschedule(interval);
		}
	}

	fn request_heartbeat(&self) {
		if let Some(timer) = &*self.timer.lock().unwrap_or_else(PoisonError::into_inner) {
			timer.trigger();
		}
	}

	fn invalidate(&self) {
		if self.state.load(Ordering::SeqCst) != STATE_INITIALIZED {
			return;
		}

		debug!("{} invalidated", self.id);
		self.ping_times.lock().unwrap_or_else(PoisonError::into_inner).clear();
		self.publish(ServerDescription::connecting(&self.id));
		self.provider.clear();
		self.request_heartbeat();
	}

	/// Feeds an error raised while using one of this server's channels back into monitoring.
	fn report(&self, error: Error) -> Error {
		if error.is_network_error() {
			if error.is_timeout() {
				self.request_heartbeat();
			} else {
				self.invalidate();
			}
		}
		error
	}

	/// One monitoring round. Skipped if another round is still running.
	fn update_description(&self) {
		let mut connection = match self.monitor_connection.try_lock() {
			Ok(guard) => guard,
			Err(TryLockError::WouldBlock) => return,
			Err(TryLockError::Poisoned(e)) => e.into_inner()
		};

		if self.is_disposed() {
			return;
		}

		let was_connected = self.description().is_connected();
		let result = match self.probe(&mut connection) {
			Err(e) if was_connected => {
				debug!("{} heartbeat failed ({}), retrying once", self.id, e);
				self.probe(&mut connection)
			}
			result => result
		};

		if self.is_disposed() {
			if let Some(mut connection) = connection.take() {
				connection.dispose();
			}
			return;
		}

		match result {
			Ok(description) => {
				self.publish(description);
				self.reschedule(self.settings.heartbeat_interval);
			}
			Err(e) => {
				if was_connected {
					warn!("{} is unreachable: {}", self.id, e);
					self.provider.clear();
				} else {
					debug!("{} is unreachable: {}", self.id, e);
				}
				self.ping_times.lock().unwrap_or_else(PoisonError::into_inner).clear();
				self.publish(ServerDescription::connecting(&self.id));
				self.reschedule(self.settings.connect_retry_interval);
			}
		}
	}

	fn probe(&self, slot: &mut Option<Box<dyn Connection>>) -> Result<ServerDescription> {
		self.listeners.dispatch(Event::ServerHeartbeatStarted { server_id: &self.id });

		let result = self.run_discovery(slot);
		match &result {
			Ok((_, duration)) => self.listeners.dispatch(Event::ServerHeartbeatSucceeded {
				server_id: &self.id,
				duration:  *duration
			}),
			Err(e) => {
				if let Some(mut connection) = slot.take() {
					connection.dispose();
				}
				self.listeners.dispatch(Event::ServerHeartbeatFailed {
					server_id: &self.id,
					failure:   e
				});
			}
		}
		result.map(|(description, _)| description)
	}

	/// The `client` document sent with the first `ismaster` on a connection.
	fn client_metadata(&self) -> Document {
		let version = env!("CARGO_PKG_VERSION");
		let (os, architecture) = (std::env::consts::OS, std::env::consts::ARCH);
		let mut metadata = doc! {
			"driver": { "name": DRIVER_NAME, "version": version },
			"os":     { "type": os, "architecture": architecture }
		};
		if let Some(name) = &self.app_name {
			metadata.insert("application", doc! { "name": name.as_str() });
		}
		metadata
	}

	fn run_discovery(&self, slot: &mut Option<Box<dyn Connection>>) -> Result<(ServerDescription, Duration)> {
		let mut command = doc! { "ismaster": 1 };
		if !slot.as_ref().map_or(false, |connection| connection.is_open()) {
			let mut connection = self.monitor_factory.create(&self.id, &self.id.endpoint);
			connection.open()?;
			*slot = Some(connection);
			command.insert("client", self.client_metadata());
		}
		let connection = slot.as_mut().ok_or(Error::InvalidState("no monitoring connection"))?;

		let start = Instant::now();
		let is_master: IsMasterResult = CommandProtocol::new("admin", command)
			.execute(&mut **connection)?;
		let ping_time = start.elapsed();

		let build_info: BuildInfoResult = CommandProtocol::new("admin", doc! { "buildinfo": 1 })
			.execute(&mut **connection)?;

		let average = self.ping_times.lock().unwrap_or_else(PoisonError::into_inner).add(ping_time);
		Ok((ServerDescription::connected(&self.id, &is_master, build_info, average), ping_time))
	}
}

/// Reports failures back to the server the channel belongs to.
struct ServerChannel {
	inner:  BoxedChannel,
	server: Weak<ServerInner>
}

impl ServerChannel {
	fn report(&self, error: Error) -> Error {
		match self.server.upgrade() {
			Some(server) => server.report(error),
			None => error
		}
	}
}

impl Channel for ServerChannel {
	fn endpoint(&self) -> &Endpoint {
		self.inner.endpoint()
	}

	fn connection_id(&self) -> &ConnectionId {
		self.inner.connection_id()
	}

	fn send(&mut self, buffer: &MessageBuffer) -> Result<()> {
		self.inner.send(buffer).map_err(|e| self.report(e))
	}

	fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
		self.inner.receive(response_to).map_err(|e| self.report(e))
	}
}

pub trait ServerFactory: fmt::Debug + Send + Sync {
	fn create(&self, cluster_id: ClusterId, endpoint: &Endpoint) -> Arc<dyn ClusterableServer>;
}

/// Builds [`Server`]s backed by a connection pool, or by a single dedicated connection
/// if `direct_channels` is set.
#[derive(Debug)]
pub struct DefaultServerFactory {
	pub settings:        ServerSettings,
	pub pool_settings:   ConnectionPoolSettings,
	pub direct_channels: bool,
	pub app_name:        Option<String>,
	connection_factory:  Arc<dyn ConnectionFactory>,
	monitor_factory:     Arc<dyn ConnectionFactory>,
	ids:                 Arc<IdGenerator>,
	listeners:           Arc<EventListeners>
}

impl DefaultServerFactory {
	/// Monitoring connections skip authentication and use the heartbeat timeout for I/O.
	pub fn new(
		settings:            ServerSettings,
		pool_settings:       ConnectionPoolSettings,
		connection_settings: ConnectionSettings,
		ids:                 Arc<IdGenerator>,
		listeners:           Arc<EventListeners>
	) -> Self {
		let monitor_settings = ConnectionSettings {
			connect_timeout: connection_settings.connect_timeout.min(settings.heartbeat_timeout),
			read_timeout:    Some(settings.heartbeat_timeout),
			write_timeout:   Some(settings.heartbeat_timeout),
			authenticators:  Vec::new(),
			..connection_settings.clone()
		};

		Self {
			settings,
			pool_settings,
			direct_channels:    false,
			app_name:           connection_settings.app_name.clone(),
			connection_factory: Arc::new(BinaryConnectionFactory::new(
				connection_settings, ids.clone(), listeners.clone())),
			monitor_factory:    Arc::new(BinaryConnectionFactory::new(
				monitor_settings, ids.clone(), listeners.clone())),
			ids,
			listeners
		}
	}

	/// Uses `factory` for both channels and monitoring.
	pub fn with_connection_factory(
		settings:      ServerSettings,
		pool_settings: ConnectionPoolSettings,
		factory:       Arc<dyn ConnectionFactory>,
		ids:           Arc<IdGenerator>,
		listeners:     Arc<EventListeners>
	) -> Self {
		Self {
			settings,
			pool_settings,
			direct_channels:    false,
			app_name:           None,
			connection_factory: factory.clone(),
			monitor_factory:    factory,
			ids,
			listeners
		}
	}
}

impl ServerFactory for DefaultServerFactory {
	fn create(&self, cluster_id: ClusterId, endpoint: &Endpoint) -> Arc<dyn ClusterableServer> {
		let id = self.ids.next_server_id(cluster_id, endpoint);
		let provider = if self.direct_channels {
			ChannelProvider::Direct(DirectChannelProvider::new(
				id.clone(), endpoint.clone(), self.connection_factory.clone()))
		} else {
			ChannelProvider::Pooled(ConnectionPool::new(
				id.clone(),
				endpoint.clone(),
				self.pool_settings,
				self.connection_factory.clone(),
				self.listeners.clone()
			))
		};

		Arc::new(Server::new(
			id, self.settings, provider, self.monitor_factory.clone(), self.listeners.clone(), self.app_name.clone()))
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use {
		super::*,
		crate::{
			connection::ConnectionState,
			protocol::tests::reply,
			wire::Request
		},
		std::{io, sync::atomic::AtomicUsize, thread},
		bson::Document
	};

	/// A mongod that answers the discovery commands with a scripted `ismaster` reply and
	/// breaks the connection on everything else. `None` simulates an unreachable server.
	#[derive(Debug, Default)]
	pub(crate) struct FakeMongod {
		pub ids:       IdGenerator,
		pub is_master: Arc<Mutex<Option<Document>>>,
		pub probes:    Arc<AtomicUsize>,
		/// Every `ismaster` command received, in order.
		pub commands:  Arc<Mutex<Vec<Document>>>
	}

	impl FakeMongod {
		pub(crate) fn new(is_master: Document) -> Self {
			Self {
				is_master: Arc::new(Mutex::new(Some(is_master))),
				..Self::default()
			}
		}

		pub(crate) fn set(&self, is_master: Option<Document>) {
			*self.is_master.lock().unwrap() = is_master;
		}
	}

	#[derive(Debug)]
	struct FakeMongodConnection {
		id:        ConnectionId,
		endpoint:  Endpoint,
		state:     ConnectionState,
		opened_at: Option<Instant>,
		is_master: Arc<Mutex<Option<Document>>>,
		probes:    Arc<AtomicUsize>,
		commands:  Arc<Mutex<Vec<Document>>>,
		replies:   VecDeque<ReplyMessage>
	}

	impl FakeMongodConnection {
		fn broken(&mut self) -> Error {
			self.state = ConnectionState::Disposed;
			Error::Socket {
				connection_id: self.id.clone(),
				source:        io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
			}
		}
	}

	impl Connection for FakeMongodConnection {
		fn id(&self) -> &ConnectionId { &self.id }

		fn endpoint(&self) -> &Endpoint { &self.endpoint }

		fn state(&self) -> ConnectionState { self.state }

		fn opened_at(&self) -> Option<Instant> { self.opened_at }

		fn open(&mut self) -> Result<()> {
			if self.is_master.lock().unwrap().is_none() {
				self.state = ConnectionState::Disposed;
				return Err(Error::Open {
					endpoint: self.endpoint.clone(),
					source:   io::Error::new(io::ErrorKind::ConnectionRefused, "refused")
				});
			}
			self.state = ConnectionState::Open;
			self.opened_at = Some(Instant::now());
			Ok(())
		}

		fn send(&mut self, bytes: &[u8]) -> Result<()> {
			let request = Request::read_from(&mut io::Cursor::new(bytes))?;
			let query = match request {
				Request::Query(query) => query,
				_ => return Err(self.broken())
			};

			if query.query.contains_key("ismaster") {
				self.commands.lock().unwrap().push(query.query.clone());
				self.probes.fetch_add(1, Ordering::SeqCst);
				let is_master = self.is_master.lock().unwrap().clone();
				match is_master {
					Some(document) => self.replies.push_back(reply(query.request_id, document)),
					None => return Err(self.broken())
				}
			} else if query.query.contains_key("buildinfo") {
				self.replies.push_back(reply(query.request_id, doc! {
					"ok": 1.0, "version": "3.0.15", "gitVersion": "b8ff507", "bits": 64, "sysInfo": "fake"
				}));
			} else {
				return Err(self.broken());
			}
			Ok(())
		}

		fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
			let reply = self.replies.pop_front()
				.ok_or(Error::InvalidState("nothing to receive"))?;
			reply.expect_response_to(response_to)?;
			Ok(reply)
		}

		fn dispose(&mut self) {
			self.state = ConnectionState::Disposed;
		}
	}

	impl ConnectionFactory for FakeMongod {
		fn create(&self, server_id: &ServerId, endpoint: &Endpoint) -> Box<dyn Connection> {
			Box::new(FakeMongodConnection {
				id:        self.ids.next_connection_id(server_id),
				endpoint:  endpoint.clone(),
				state:     ConnectionState::Initial,
				opened_at: None,
				is_master: self.is_master.clone(),
				probes:    self.probes.clone(),
				commands:  self.commands.clone(),
				replies:   VecDeque::new()
			})
		}
	}

	pub(crate) fn fast_settings() -> ServerSettings {
		ServerSettings {
			heartbeat_interval:     Duration::from_secs(10),
			connect_retry_interval: Duration::from_millis(10),
			heartbeat_timeout:      Duration::from_secs(1)
		}
	}

	fn server(mongod: Arc<FakeMongod>) -> Server {
		named_server(mongod, None)
	}

	fn named_server(mongod: Arc<FakeMongod>, app_name: Option<&str>) -> Server {
		let ids = Arc::new(IdGenerator::new());
		let endpoint = Endpoint::new("localhost", 27017);
		let id = ids.next_server_id(ids.next_cluster_id(), &endpoint);
		let listeners = Arc::new(EventListeners::new());
		let provider = ChannelProvider::Pooled(ConnectionPool::new(
			id.clone(), endpoint, ConnectionPoolSettings::default(), mongod.clone(), listeners.clone()));
		Server::new(id, fast_settings(), provider, mongod, listeners, app_name.map(str::to_string))
	}

	pub(crate) fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
		let deadline = Instant::now() + Duration::from_secs(5);
		while Instant::now() < deadline {
			if condition() {
				return true;
			}
			thread::sleep(Duration::from_millis(5));
		}
		false
	}

	#[test]
	fn monitor_discovers_a_standalone_server() {
		let mongod = Arc::new(FakeMongod::new(doc! { "ok": 1.0, "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024 }));
		let server = server(mongod.clone());
		assert_eq!(server.description().status, ServerStatus::Disconnected);

		server.initialize().unwrap();
		assert!(wait_for(|| server.description().is_connected()));

		let description = server.description();
		assert_eq!(description.r#type, ServerType::StandAlone);
		assert_eq!(description.max_document_size, 16 * 1024 * 1024);
		assert_eq!(description.max_message_size, 16 * 1024 * 1024 + 16 * 1024);
		assert_eq!(description.build_info.as_ref().map(|info| info.version.as_str()), Some("3.0.15"));
		assert!(description.revision >= 2);
		server.dispose();
	}

	#[test]
	fn a_previously_connected_server_is_retried_before_it_is_given_up() {
		let mongod = Arc::new(FakeMongod::new(doc! { "ok": 1.0, "ismaster": true }));
		let server = server(mongod.clone());
		let changes = Arc::new(Mutex::new(Vec::new()));
		let cloned = changes.clone();
		server.subscribe(Arc::new(move |_: &Arc<ServerDescription>, new: &Arc<ServerDescription>|
			cloned.lock().unwrap().push(new.status)));

		server.initialize().unwrap();
		assert!(wait_for(|| server.description().is_connected()));
		let probes = mongod.probes.load(Ordering::SeqCst);

		mongod.set(None);
		server.request_heartbeat();
		assert!(wait_for(|| server.description().status == ServerStatus::Connecting));
		// the retry reopens the connection, which is refused before a probe is sent
		assert_eq!(mongod.probes.load(Ordering::SeqCst), probes + 1);

		mongod.set(Some(doc! { "ok": 1.0, "ismaster": true }));
		assert!(wait_for(|| server.description().is_connected()));
		server.dispose();

		let changes = changes.lock().unwrap();
		assert_eq!(changes[0], ServerStatus::Connecting);
		assert!(changes.windows(2).all(|pair| pair[0] != pair[1] || pair[0] == ServerStatus::Connected));
		assert_eq!(changes.last(), Some(&ServerStatus::Disposed));
	}

	#[test]
	fn new_monitoring_connections_introduce_the_driver() {
		let mongod = Arc::new(FakeMongod::new(doc! { "ok": 1.0, "ismaster": true }));
		let server = named_server(mongod.clone(), Some("reporting"));
		server.initialize().unwrap();
		assert!(wait_for(|| server.description().is_connected()));

		server.request_heartbeat();
		assert!(wait_for(|| mongod.probes.load(Ordering::SeqCst) >= 2));
		server.dispose();

		let commands = mongod.commands.lock().unwrap();
		let client = commands[0].get_document("client").unwrap();
		assert_eq!(client.get_document("application").unwrap().get_str("name").unwrap(), "reporting");
		assert_eq!(client.get_document("driver").unwrap().get_str("name").unwrap(), DRIVER_NAME);
		assert!(!commands[1].contains_key("client"));
	}

	#[test]
	fn channels_require_an_initialized_server() {
		let server = server(Arc::new(FakeMongod::new(doc! { "ok": 1.0, "ismaster": true })));
		assert!(matches!(server.get_channel(Duration::from_secs(1), &CancellationToken::none()),
			Err(Error::InvalidState(_))));

		server.initialize().unwrap();
		assert!(server.get_channel(Duration::from_secs(1), &CancellationToken::none()).is_ok());

		server.dispose();
		assert!(matches!(server.get_channel(Duration::from_secs(1), &CancellationToken::none()),
			Err(Error::Disposed(_))));
		assert!(matches!(server.initialize(), Err(Error::Disposed(_))));
		assert_eq!(server.description().status, ServerStatus::Disposed);
	}

	#[test]
	fn network_errors_on_a_channel_invalidate_the_server() {
		let mongod = Arc::new(FakeMongod::new(doc! { "ok": 1.0, "ismaster": true }));
		let server = server(mongod.clone());
		server.initialize().unwrap();
		assert!(wait_for(|| server.description().is_connected()));
		let revision = server.description().revision;

		let mut channel = server.get_channel(Duration::from_secs(1), &CancellationToken::none()).unwrap();
		let result = CommandProtocol::<Document>::new("test", doc! { "count": "docs" }).execute(&mut *channel);
		assert!(matches!(result, Err(Error::Socket { .. })));
		drop(channel);

		// invalidated, then reconnected by the triggered probe
		assert!(wait_for(|| server.description().revision >= revision + 2 && server.description().is_connected()));
		server.dispose();
	}

	#[test]
	fn is_master_replies_are_classified() {
		let classify = |document: Document| bson::from_document::<IsMasterResult>(document).unwrap().server_type();
		assert_eq!(classify(doc! { "ismaster": true, "msg": "isdbgrid" }), ServerType::ShardRouter);
		assert_eq!(classify(doc! { "ismaster": true, "setName": "rs" }), ServerType::ReplicaSetPrimary);
		assert_eq!(classify(doc! { "ismaster": false, "secondary": true, "setName": "rs" }), ServerType::ReplicaSetSecondary);
		assert_eq!(classify(doc! { "ismaster": false, "arbiterOnly": true, "setName": "rs" }), ServerType::ReplicaSetArbiter);
		assert_eq!(classify(doc! { "ismaster": false, "setName": "rs" }), ServerType::ReplicaSetOther);
		assert_eq!(classify(doc! { "ismaster": false, "isreplicaset": true }), ServerType::ReplicaSetOther);
		assert_eq!(classify(doc! { "ismaster": true }), ServerType::StandAlone);
	}

	#[test]
	fn replica_set_info_collects_every_member() {
		let result: IsMasterResult = bson::from_document(doc! {
			"ismaster":   false,
			"secondary":  true,
			"setName":    "rs0",
			"setVersion": 3,
			"primary":    "A:27017",
			"hosts":      ["a:27017", "b:27018"],
			"passives":   ["c"],
			"arbiters":   ["d:1", "not a port:x"],
			"tags":       { "dc": "east" }
		}).unwrap();

		let info = result.replica_set_info().unwrap();
		assert_eq!(info.name, "rs0");
		assert_eq!(info.version, Some(3));
		assert_eq!(info.primary, Some(Endpoint::new("a", 27017)));
		assert_eq!(info.members, vec![
			Endpoint::new("a", 27017),
			Endpoint::new("b", 27018),
			Endpoint::new("c", 27017),
			Endpoint::new("d", 1)
		]);
		assert_eq!(info.tags.get("dc").map(String::as_str), Some("east"));
	}

	#[test]
	fn only_relevant_fields_make_descriptions_differ() {
		let ids = IdGenerator::new();
		let id = ids.next_server_id(ids.next_cluster_id(), &Endpoint::new("localhost", 27017));
		let connecting = ServerDescription::connecting(&id);

		let mut same = connecting.clone();
		same.revision = 9;
		same.max_message_size = 1;
		same.build_info = Some(BuildInfo { bits: 32, git_version: String::new(), sys_info: String::new(), version: "2.6".into() });
		assert!(!connecting.differs_from(&same));

		let mut pinged = connecting.clone();
		pinged.average_ping_time = Duration::from_millis(3);
		assert!(connecting.differs_from(&pinged));

		let mut typed = connecting.clone();
		typed.r#type = ServerType::StandAlone;
		assert!(connecting.differs_from(&typed));

		let mut replica = connecting.clone();
		replica.replica_set_info = Some(ReplicaSetInfo { name: "rs".into(), ..ReplicaSetInfo::default() });
		assert!(connecting.differs_from(&replica));

		assert!(connecting.differs_from(&ServerDescription::disconnected(&id)));
	}

	#[test]
	fn ping_time_averages_the_last_five_samples() {
		let mut aggregator = PingTimeAggregator::new();
		assert_eq!(aggregator.average(), Duration::from_secs(0));
		for ms in &[100, 10, 10, 10, 10] {
			aggregator.add(Duration::from_millis(*ms));
		}
		assert_eq!(aggregator.average(), Duration::from_millis(28));
		assert_eq!(aggregator.add(Duration::from_millis(20)), Duration::from_millis(12));
	}
}
