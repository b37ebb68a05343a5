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
		Error,
		common::{ClusterSettings, ConnectionPoolSettings},
		ids::{ClusterId, ServerId, ConnectionId},
		server::ServerDescription,
		cluster::ClusterDescription
	},
	std::{sync::{RwLock, atomic::{AtomicBool, Ordering}}, time::Duration}
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug)]
pub enum Event<'a> {
	ClusterOpened {
		cluster_id: ClusterId,
		settings:   &'a ClusterSettings
	},
	ClusterClosed {
		cluster_id: ClusterId
	},
	ClusterDescriptionChanged {
		old: &'a ClusterDescription,
		new: &'a ClusterDescription
	},
	ServerAdded {
		server_id: &'a ServerId
	},
	ServerRemoved {
		server_id: &'a ServerId
	},
	ServerDescriptionChanged {
		old: &'a ServerDescription,
		new: &'a ServerDescription
	},
	ServerHeartbeatStarted {
		server_id: &'a ServerId
	},
	ServerHeartbeatSucceeded {
		server_id: &'a ServerId,
		duration:  Duration
	},
	ServerHeartbeatFailed {
		server_id: &'a ServerId,
		failure:   &'a Error
	},
	PoolOpened {
		server_id: &'a ServerId,
		settings:  &'a ConnectionPoolSettings
	},
	PoolCleared {
		server_id:  &'a ServerId,
		generation: u64
	},
	PoolClosed {
		server_id: &'a ServerId
	},
	ConnectionOpened {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionOpenFailed {
		connection_id: &'a ConnectionId,
		failure:       &'a Error
	},
	ConnectionClosed {
		connection_id: &'a ConnectionId
	},
	ConnectionAdded {
		connection_id: &'a ConnectionId
	},
	ConnectionRemoved {
		connection_id: &'a ConnectionId,
		reason:        ConnectionRemovedReason
	},
	ConnectionCheckOutStarted {
		server_id: &'a ServerId
	},
	ConnectionCheckOutFailed {
		server_id: &'a ServerId,
		reason:    ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionCheckedIn {
		connection_id: &'a ConnectionId
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	TooManyWaiters,
	Cancelled,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionRemovedReason {
	/// The pool has been cleared since the connection was created.
	Stale,
	Idle,
	LifeTimeExceeded,
	Error,
	PoolClosed
}

/// Synchronous fan-out of [`Event`]s to registered listeners.
pub struct EventListeners {
	listeners_set: AtomicBool,
	listeners:     RwLock<Vec<EventListener>>
}

impl EventListeners {
	pub fn new() -> Self {
		Self {
			listeners_set: AtomicBool::new(false),
			listeners:     RwLock::new(Vec::new())
		}
	}

	pub fn add(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> crate::Result<()> {
		self.listeners.write()?.push(Box::new(listener));
		self.listeners_set.store(true, Ordering::SeqCst);
		Ok(())
	}

	pub fn dispatch(&self, event: Event) {
		if !self.listeners_set.load(Ordering::SeqCst) { return; }
		if let Ok(listeners) = self.listeners.read() {
			for listener in listeners.iter() {
				listener(&event)
			}
		}
	}
}

impl Default for EventListeners {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for EventListeners {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("EventListeners")
			.field("listeners_set", &self.listeners_set)
			.finish()
	}
}
