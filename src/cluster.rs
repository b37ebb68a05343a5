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

//! The deployment as a whole: membership, the aggregate description and server selection.
//!
//! A cluster either talks to exactly one server (direct mode) or discovers the members of
//! a replica set or the routers of a sharded deployment from the seed list. Every change of
//! a member's description rebuilds the cluster description and wakes up threads blocked
//! in [`Cluster::select_server`].

use {
	crate::{
		Error, Result,
		apm::{Event, EventListeners},
		channel::BoxedChannel,
		common::{ClusterConnectionMode, ClusterSettings, ConnectionPoolSettings, ConnectionSettings, ServerSettings},
		connection::Endpoint,
		cursor::ChannelSource,
		ids::{ClusterId, IdGenerator, ServerId},
		selector::{LatencyLimitingServerSelector, ServerSelector},
		server::{ClusterableServer, DefaultServerFactory, ServerDescription, ServerFactory, ServerStatus, ServerType},
		sync::{CancellationToken, ChangeSignal}
	},
	std::{
		sync::{Arc, Weak, Mutex, RwLock, PoisonError, atomic::{AtomicU8, Ordering}},
		time::{Duration, Instant},
		fmt
	},
	rand::Rng,
	log::{debug, info, warn}
};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZED:   u8 = 1;
const STATE_DISPOSED:      u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClusterType {
	Unknown,
	StandAlone,
	ReplicaSet,
	Sharded
}

impl Default for ClusterType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl From<ServerType> for ClusterType {
	fn from(r#type: ServerType) -> Self {
		match r#type {
			ServerType::Unknown     => Self::Unknown,
			ServerType::StandAlone  => Self::StandAlone,
			ServerType::ShardRouter => Self::Sharded,
			_                       => Self::ReplicaSet
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClusterState {
	Disconnected,
	Connected
}

/// Immutable snapshot of the whole deployment.
#[derive(Debug, Clone)]
pub struct ClusterDescription {
	pub cluster_id:       ClusterId,
	/// `Automatic` resolves to `Direct` for a single seed and to `ReplicaSet` given a set name.
	pub connection_mode:  ClusterConnectionMode,
	pub r#type:           ClusterType,
	pub state:            ClusterState,
	pub replica_set_name: Option<String>,
	pub servers:          Vec<Arc<ServerDescription>>
}

impl ClusterDescription {
	pub fn new(cluster_id: ClusterId, connection_mode: ClusterConnectionMode) -> Self {
		Self {
			cluster_id,
			connection_mode,
			r#type:           ClusterType::Unknown,
			state:            ClusterState::Disconnected,
			replica_set_name: None,
			servers:          Vec::new()
		}
	}

	pub fn is_direct(&self) -> bool {
		self.connection_mode == ClusterConnectionMode::Direct
	}

	pub fn server(&self, endpoint: &Endpoint) -> Option<&Arc<ServerDescription>> {
		self.servers.iter().find(|server| &server.endpoint == endpoint)
	}
}

/// Called with the old and the new description whenever the cluster description changes.
pub type ClusterListener = Arc<dyn Fn(&Arc<ClusterDescription>, &Arc<ClusterDescription>) + Send + Sync>;

/// A server handed out by [`Cluster::select_server`]. Dropping it leaves the server alone.
#[derive(Debug, Clone)]
pub struct SelectedServer {
	server:      Arc<dyn ClusterableServer>,
	description: Arc<ServerDescription>
}

impl SelectedServer {
	pub fn id(&self) -> &ServerId {
		self.server.id()
	}

	pub fn endpoint(&self) -> &Endpoint {
		self.server.endpoint()
	}

	/// The description the server was selected by.
	pub fn description(&self) -> &Arc<ServerDescription> {
		&self.description
	}

	pub fn current_description(&self) -> Arc<ServerDescription> {
		self.server.description()
	}

	pub fn get_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		self.server.get_channel(timeout, cancel)
	}

	pub fn invalidate(&self) {
		self.server.invalidate();
	}
}

impl ChannelSource for SelectedServer {
	fn acquire_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		self.get_channel(timeout, cancel)
	}
}

/// Server lifecycle calls that have to wait until the membership lock is released, since
/// they may call straight back into the cluster.
enum Action {
	Initialize(Arc<dyn ClusterableServer>),
	Invalidate(Arc<dyn ClusterableServer>),
	Dispose(Arc<dyn ClusterableServer>)
}

struct Membership {
	servers:          Vec<Arc<dyn ClusterableServer>>,
	r#type:           ClusterType,
	replica_set_name: Option<String>
}

/// What selection reads: the description and the servers it was built from.
struct Snapshot {
	description: Arc<ClusterDescription>,
	servers:     Vec<Arc<dyn ClusterableServer>>
}

impl Snapshot {
	fn find(&self, id: &ServerId) -> Option<Arc<dyn ClusterableServer>> {
		self.servers.iter().find(|server| server.id() == id).cloned()
	}
}

#[derive(Clone)]
pub struct Cluster(Arc<ClusterInner>);

struct ClusterInner {
	id:          ClusterId,
	settings:    ClusterSettings,
	mode:        ClusterConnectionMode,
	factory:     Arc<dyn ServerFactory>,
	listeners:   Arc<EventListeners>,
	state:       AtomicU8,
	members:     Mutex<Membership>,
	snapshot:    RwLock<Arc<Snapshot>>,
	signal:      ChangeSignal,
	subscribers: RwLock<Vec<ClusterListener>>
}

impl fmt::Debug for Cluster {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Cluster")
			.field("id", &self.0.id)
			.field("description", &self.description())
			.finish()
	}
}

impl Cluster {
	pub fn new(
		settings:  ClusterSettings,
		factory:   Arc<dyn ServerFactory>,
		ids:       Arc<IdGenerator>,
		listeners: Arc<EventListeners>
	) -> Self {
		let id = ids.next_cluster_id();
		let mode = match settings.connection_mode {
			ClusterConnectionMode::Automatic if settings.replica_set_name.is_some() => ClusterConnectionMode::ReplicaSet,
			ClusterConnectionMode::Automatic if settings.endpoints.len() == 1      => ClusterConnectionMode::Direct,
			mode => mode
		};
		let r#type = match mode {
			ClusterConnectionMode::ReplicaSet => ClusterType::ReplicaSet,
			ClusterConnectionMode::Sharded    => ClusterType::Sharded,
			_                                 => ClusterType::Unknown
		};

		let mut description = ClusterDescription::new(id, mode);
		description.r#type = r#type;
		description.replica_set_name = settings.replica_set_name.clone();

		Self(Arc::new(ClusterInner {
			id,
			members:     Mutex::new(Membership {
				servers:          Vec::new(),
				r#type,
				replica_set_name: settings.replica_set_name.clone()
			}),
			settings,
			mode,
			factory,
			listeners,
			state:       AtomicU8::new(STATE_UNINITIALIZED),
			snapshot:    RwLock::new(Arc::new(Snapshot {
				description: Arc::new(description),
				servers:     Vec::new()
			})),
			signal:      ChangeSignal::new(),
			subscribers: RwLock::new(Vec::new())
		}))
	}

	/// A cluster of pooled [`Server`](crate::server::Server)s talking TCP (or TLS).
	pub fn with_defaults(
		settings:            ClusterSettings,
		server_settings:     ServerSettings,
		pool_settings:       ConnectionPoolSettings,
		connection_settings: ConnectionSettings
	) -> Self {
		let ids = Arc::new(IdGenerator::new());
		let listeners = Arc::new(EventListeners::new());
		let factory = DefaultServerFactory::new(
			server_settings, pool_settings, connection_settings, ids.clone(), listeners.clone());
		Self::new(settings, Arc::new(factory), ids, listeners)
	}

	pub fn id(&self) -> ClusterId {
		self.0.id
	}

	pub fn settings(&self) -> &ClusterSettings {
		&self.0.settings
	}

	pub fn listeners(&self) -> &Arc<EventListeners> {
		&self.0.listeners
	}

	pub fn description(&self) -> Arc<ClusterDescription> {
		self.0.description()
	}

	pub fn subscribe(&self, listener: ClusterListener) {
		self.0.subscribers.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(listener);
	}

	/// Creates and initializes a server for every seed.
	pub fn initialize(&self) -> Result<()> {
		match self.0.state.compare_exchange(
			STATE_UNINITIALIZED, STATE_INITIALIZED, Ordering::SeqCst, Ordering::SeqCst) {
			Ok(_) => (),
			Err(STATE_INITIALIZED) => return Ok(()),
			Err(_) => return Err(Error::Disposed("cluster"))
		}

		let endpoints = &self.0.settings.endpoints;
		if endpoints.is_empty() {
			return Err(Error::InvalidState("a cluster needs at least one endpoint"));
		}
		if self.0.mode == ClusterConnectionMode::Direct && endpoints.len() > 1 {
			return Err(Error::InvalidState("a direct connection needs exactly one endpoint"));
		}

		info!("{} opened in {:?} mode with seeds {:?}", self.0.id, self.0.mode, endpoints);
		self.0.listeners.dispatch(Event::ClusterOpened {
			cluster_id: self.0.id,
			settings:   &self.0.settings
		});

		let mut actions = Vec::new();
		let changed = {
			let mut members = self.0.members.lock()?;
			for endpoint in endpoints {
				self.0.ensure_server(&mut members, endpoint, &mut actions);
			}
			self.0.rebuild(&members)
		};
		self.0.notify(changed);
		self.0.run(actions)
	}

	/// Selects a server within the configured server selection timeout.
	pub fn select(&self, selector: &dyn ServerSelector, cancel: &CancellationToken) -> Result<SelectedServer> {
		self.select_server(selector, self.0.settings.server_selection_timeout, cancel)
	}

	/// Waits until `selector` picks a server, the timeout elapses or the token is cancelled.
	/// Gives up right away if no server is connecting, since nothing would change.
	///
	/// The timeout is capped by the server selection timeout, and only servers within the
	/// local threshold of the fastest candidate are picked.
	pub fn select_server(
		&self,
		selector: &dyn ServerSelector,
		timeout:  Duration,
		cancel:   &CancellationToken
	) -> Result<SelectedServer> {
		let timeout = timeout.min(self.0.settings.server_selection_timeout);
		let deadline = Instant::now().checked_add(timeout);
		let window = LatencyLimitingServerSelector(self.0.settings.local_threshold);
		loop {
			self.0.require_initialized()?;
			cancel.check()?;

			let seen = self.0.signal.version();
			let snapshot = self.0.snapshot();
			let description = &snapshot.description;
			let candidates = window.select(description, selector.select(description, description.servers.clone()));

			if !candidates.is_empty() {
				let start = rand::thread_rng().gen_range(0, candidates.len());
				for candidate in candidates.iter().cycle().skip(start).take(candidates.len()) {
					if let Some(server) = snapshot.find(&candidate.server_id) {
						debug!("{} selected {} for {}", self.0.id, candidate.server_id, selector);
						return Ok(SelectedServer { server, description: candidate.clone() });
					}
				}
			}

			if !description.servers.iter().any(|server| server.status == ServerStatus::Connecting) {
				return Err(Error::NoMatchingServer { selector: selector.to_string() });
			}

			let remaining = match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Err(Error::ServerSelectionTimeout { selector: selector.to_string(), timeout });
					}
					deadline - now
				}
				None => Duration::MAX
			};
			self.0.signal.wait_for_change(seen, remaining, cancel)?;
		}
	}

	/// Disposes every server. Blocked selections fail with [`Error::Disposed`].
	pub fn dispose(&self) {
		if self.0.state.swap(STATE_DISPOSED, Ordering::SeqCst) == STATE_DISPOSED {
			return;
		}

		let changed = {
			let mut members = self.0.members.lock().unwrap_or_else(PoisonError::into_inner);
			let servers = std::mem::take(&mut members.servers);
			let changed = self.0.rebuild(&members);
			drop(members);

			for server in servers {
				server.dispose();
				self.0.listeners.dispatch(Event::ServerRemoved { server_id: server.id() });
			}
			changed
		};
		self.0.notify(changed);

		info!("{} closed", self.0.id);
		self.0.listeners.dispatch(Event::ClusterClosed { cluster_id: self.0.id });
	}
}

impl ClusterInner {
	fn snapshot(&self) -> Arc<Snapshot> {
		self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	fn description(&self) -> Arc<ClusterDescription> {
		self.snapshot().description.clone()
	}

	fn require_initialized(&self) -> Result<()> {
		match self.state.load(Ordering::SeqCst) {
			STATE_INITIALIZED   => Ok(()),
			STATE_UNINITIALIZED => Err(Error::InvalidState("cluster has not been initialized")),
			_                   => Err(Error::Disposed("cluster"))
		}
	}

	/// Adds a server for `endpoint` unless one is tracked already.
	fn ensure_server(self: &Arc<Self>, members: &mut Membership, endpoint: &Endpoint, actions: &mut Vec<Action>) {
		if members.servers.iter().any(|server| server.endpoint() == endpoint) {
			return;
		}

		let server = self.factory.create(self.id, endpoint);
		let weak: Weak<ClusterInner> = Arc::downgrade(self);
		server.subscribe(Arc::new(move |_: &Arc<ServerDescription>, new: &Arc<ServerDescription>| {
			if let Some(inner) = weak.upgrade() {
				inner.on_server_changed(new);
			}
		}));
		debug!("{} added {}", self.id, server.id());
		members.servers.push(server.clone());
		actions.push(Action::Initialize(server));
	}

	fn remove_server(&self, members: &mut Membership, id: &ServerId, actions: &mut Vec<Action>) {
		if let Some(i) = members.servers.iter().position(|server| server.id() == id) {
			let server = members.servers.remove(i);
			debug!("{} removed {}", self.id, server.id());
			actions.push(Action::Dispose(server));
		}
	}

	fn on_server_changed(self: &Arc<Self>, new: &Arc<ServerDescription>) {
		if self.state.load(Ordering::SeqCst) != STATE_INITIALIZED {
			return;
		}

		let mut actions = Vec::new();
		let changed = {
			let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
			if !members.servers.iter().any(|server| server.id() == &new.server_id) {
				return;
			}

			match self.mode {
				ClusterConnectionMode::Direct => members.r#type = new.r#type.into(),
				_ => self.reconcile(&mut members, new, &mut actions)
			}
			self.rebuild(&members)
		};
		self.notify(changed);

		if let Err(e) = self.run(actions) {
			warn!("{} failed to update its members: {}", self.id, e);
		}
	}

	/// Fits the membership to what a multi server cluster just learned about one member.
	fn reconcile(self: &Arc<Self>, members: &mut Membership, new: &ServerDescription, actions: &mut Vec<Action>) {
		if !new.is_connected() {
			return;
		}

		let implied = match new.r#type {
			ServerType::Unknown    => return,
			ServerType::StandAlone => None,
			r#type                 => Some(ClusterType::from(r#type))
		};

		if members.r#type == ClusterType::Unknown {
			if let Some(r#type) = implied {
				info!("{} is a {:?} cluster", self.id, r#type);
				members.r#type = r#type;
			}
		}

		if implied != Some(members.r#type) {
			warn!("{} removing {}, a {:?} does not belong in a {:?} cluster",
				self.id, new.server_id, new.r#type, members.r#type);
			self.remove_server(members, &new.server_id, actions);
			return;
		}

		if members.r#type == ClusterType::ReplicaSet {
			self.reconcile_replica_set(members, new, actions);
		}
	}

	fn reconcile_replica_set(self: &Arc<Self>, members: &mut Membership, new: &ServerDescription, actions: &mut Vec<Action>) {
		// ghosts don't know their set yet
		let info = match &new.replica_set_info {
			Some(info) => info,
			None => return
		};

		match &members.replica_set_name {
			None => members.replica_set_name = Some(info.name.clone()),
			Some(name) if name != &info.name => {
				warn!("{} removing {}, it is a member of `{}` instead of `{}`",
					self.id, new.server_id, info.name, name);
				self.remove_server(members, &new.server_id, actions);
				return;
			}
			_ => ()
		}

		if new.r#type == ServerType::ReplicaSetPrimary {
			for server in &members.servers {
				if server.id() != &new.server_id && server.description().r#type == ServerType::ReplicaSetPrimary {
					info!("{} invalidating {}, {} is the new primary", self.id, server.id(), new.server_id);
					actions.push(Action::Invalidate(server.clone()));
				}
			}

			let stale = members.servers.iter()
				.filter(|server| !info.members.contains(server.endpoint()))
				.map(|server| server.id().clone())
				.collect::<Vec<_>>();
			for id in &stale {
				self.remove_server(members, id, actions);
			}
		}

		for endpoint in &info.members {
			self.ensure_server(members, endpoint, actions);
		}
	}

	/// Swaps in a snapshot built from the current members, returns the old and the new description.
	fn rebuild(&self, members: &Membership) -> (Arc<ClusterDescription>, Arc<ClusterDescription>) {
		let servers = members.servers.iter()
			.map(|server| server.description())
			.collect::<Vec<_>>();

		let new = Arc::new(ClusterDescription {
			cluster_id:       self.id,
			connection_mode:  self.mode,
			r#type:           members.r#type,
			state:            if servers.iter().any(|server| server.is_connected()) {
				ClusterState::Connected
			} else {
				ClusterState::Disconnected
			},
			replica_set_name: members.replica_set_name.clone(),
			servers
		});

		let snapshot = Arc::new(Snapshot { description: new.clone(), servers: members.servers.clone() });
		let old = std::mem::replace(
			&mut *self.snapshot.write().unwrap_or_else(PoisonError::into_inner),
			snapshot);
		(old.description.clone(), new)
	}

	/// Wakes up selecting threads and tells everyone about the new description.
	fn notify(&self, (old, new): (Arc<ClusterDescription>, Arc<ClusterDescription>)) {
		self.signal.notify();
		self.listeners.dispatch(Event::ClusterDescriptionChanged { old: &old, new: &new });

		let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner).clone();
		for subscriber in subscribers {
			subscriber(&old, &new);
		}
	}

	/// Runs every action, returning the first error.
	fn run(&self, actions: Vec<Action>) -> Result<()> {
		let mut result = Ok(());
		for action in actions {
			match action {
				Action::Initialize(server) => {
					self.listeners.dispatch(Event::ServerAdded { server_id: server.id() });
					if let Err(e) = server.initialize() {
						warn!("{} failed to initialize {}: {}", self.id, server.id(), e);
						if result.is_ok() {
							result = Err(e);
						}
					}
				}
				Action::Invalidate(server) => server.invalidate(),
				Action::Dispose(server) => {
					server.dispose();
					self.listeners.dispatch(Event::ServerRemoved { server_id: server.id() });
				}
			}
		}
		result
	}
}
