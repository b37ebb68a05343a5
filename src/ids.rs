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

//! Correlation ids for clusters, servers and connections.
//!
//! Ids are handed out by an [`IdGenerator`] that is shared by everything created for
//! one cluster, so tests can use a fresh generator and get deterministic ids.

use {
	crate::connection::Endpoint,
	std::{fmt, sync::atomic::{AtomicU64, Ordering}}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClusterId(pub u64);

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ServerId {
	pub cluster_id: ClusterId,
	pub endpoint:   Endpoint,
	pub value:      u64
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
	pub server_id: ServerId,
	pub value:     u64
}

impl fmt::Display for ClusterId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "cluster#{}", self.0)
	}
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/server#{}({})", self.cluster_id, self.value, self.endpoint)
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/conn#{}", self.server_id, self.value)
	}
}

#[derive(Debug)]
pub struct IdGenerator {
	cluster:    AtomicU64,
	server:     AtomicU64,
	connection: AtomicU64
}

impl IdGenerator {
	pub fn new() -> Self {
		Self {
			cluster:    AtomicU64::new(1),
			server:     AtomicU64::new(1),
			connection: AtomicU64::new(1)
		}
	}

	pub fn next_cluster_id(&self) -> ClusterId {
		ClusterId(self.cluster.fetch_add(1, Ordering::SeqCst))
	}

	pub fn next_server_id(&self, cluster_id: ClusterId, endpoint: &Endpoint) -> ServerId {
		ServerId {
			cluster_id,
			endpoint: endpoint.clone(),
			value:    self.server.fetch_add(1, Ordering::SeqCst)
		}
	}

	pub fn next_connection_id(&self, server_id: &ServerId) -> ConnectionId {
		ConnectionId {
			server_id: server_id.clone(),
			value:     self.connection.fetch_add(1, Ordering::SeqCst)
		}
	}
}

impl Default for IdGenerator {
	fn default() -> Self {
		Self::new()
	}
}
