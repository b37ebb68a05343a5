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

//! Predicates choosing acceptable servers from a cluster description.

use {
	crate::{
		cluster::{ClusterDescription, ClusterType},
		common::{ReadPreference, ReadPreferenceMode},
		connection::Endpoint,
		server::{ServerDescription, ServerType}
	},
	std::{collections::HashMap, sync::Arc, time::Duration, fmt}
};

pub trait ServerSelector: fmt::Display + Send + Sync {
	/// Narrows `servers` down to the acceptable ones. The cluster picks one of the result
	/// at random.
	fn select(&self, cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>>;
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnyServerSelector;

impl ServerSelector for AnyServerSelector {
	fn select(&self, _cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		servers
	}
}

impl fmt::Display for AnyServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("any server")
	}
}

#[derive(Debug, Copy, Clone, Default)]
pub struct ConnectedServerSelector;

impl ServerSelector for ConnectedServerSelector {
	fn select(&self, _cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		servers.into_iter().filter(|server| server.is_connected()).collect()
	}
}

impl fmt::Display for ConnectedServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a connected server")
	}
}

/// Selects servers that accept writes. A directly connected server always qualifies.
#[derive(Debug, Copy, Clone, Default)]
pub struct WritableServerSelector;

impl ServerSelector for WritableServerSelector {
	fn select(&self, cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		servers.into_iter()
			.filter(|server| server.is_connected() && (cluster.is_direct() || server.r#type.is_writable()))
			.collect()
	}
}

impl fmt::Display for WritableServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a writable server")
	}
}

#[derive(Debug, Clone)]
pub struct EndpointServerSelector(pub Endpoint);

impl ServerSelector for EndpointServerSelector {
	fn select(&self, _cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		servers.into_iter().filter(|server| server.endpoint == self.0).collect()
	}
}

impl fmt::Display for EndpointServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "the server at {}", self.0)
	}
}

/// Applies a read preference. Outside of replica sets every connected server qualifies.
#[derive(Debug, Clone, Default)]
pub struct ReadPreferenceServerSelector(pub ReadPreference);

impl ReadPreferenceServerSelector {
	fn of_type(servers: &[Arc<ServerDescription>], r#type: ServerType) -> Vec<Arc<ServerDescription>> {
		servers.iter()
			.filter(|server| server.is_connected() && server.r#type == r#type)
			.cloned()
			.collect()
	}

	/// Keeps the servers matching the first tag set that matches anything at all.
	fn match_tags(&self, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		if self.0.tag_sets.is_empty() {
			return servers;
		}

		self.0.tag_sets.iter()
			.map(|tags| servers.iter()
				.filter(|server| has_tags(server, tags))
				.cloned()
				.collect::<Vec<_>>())
			.find(|matching| !matching.is_empty())
			.unwrap_or_default()
	}
}

fn has_tags(server: &ServerDescription, tags: &HashMap<String, String>) -> bool {
	let server_tags = server.replica_set_info.as_ref().map(|info| &info.tags);
	tags.iter().all(|(k, v)| server_tags.and_then(|server_tags| server_tags.get(k)) == Some(v))
}

impl ServerSelector for ReadPreferenceServerSelector {
	fn select(&self, cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		if cluster.is_direct() || cluster.r#type != ClusterType::ReplicaSet {
			return servers.into_iter().filter(|server| server.is_connected()).collect();
		}

		let primaries = || Self::of_type(&servers, ServerType::ReplicaSetPrimary);
		let secondaries = || self.match_tags(Self::of_type(&servers, ServerType::ReplicaSetSecondary));

		match self.0.mode {
			ReadPreferenceMode::Primary            => primaries(),
			ReadPreferenceMode::PrimaryPreferred   => Some(primaries())
				.filter(|primaries| !primaries.is_empty())
				.unwrap_or_else(secondaries),
			ReadPreferenceMode::Secondary          => secondaries(),
			ReadPreferenceMode::SecondaryPreferred => Some(secondaries())
				.filter(|secondaries| !secondaries.is_empty())
				.unwrap_or_else(primaries),
			ReadPreferenceMode::Nearest            => {
				let mut members = primaries();
				members.extend(Self::of_type(&servers, ServerType::ReplicaSetSecondary));
				self.match_tags(members)
			}
		}
	}
}

impl fmt::Display for ReadPreferenceServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "read preference {:?}", self.0.mode)?;
		if !self.0.tag_sets.is_empty() {
			write!(f, " with tag sets {:?}", self.0.tag_sets)?;
		}
		Ok(())
	}
}

/// Keeps the servers whose average ping time is within `threshold` of the fastest one.
#[derive(Debug, Copy, Clone)]
pub struct LatencyLimitingServerSelector(pub Duration);

impl ServerSelector for LatencyLimitingServerSelector {
	fn select(&self, _cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		let fastest = match servers.iter().map(|server| server.average_ping_time).min() {
			Some(fastest) => fastest,
			None => return servers
		};
		servers.into_iter()
			.filter(|server| server.average_ping_time <= fastest.saturating_add(self.0))
			.collect()
	}
}

impl fmt::Display for LatencyLimitingServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "servers within {:?} of the fastest", self.0)
	}
}

/// Applies several selectors one after the other.
pub struct CompositeServerSelector(pub Vec<Box<dyn ServerSelector>>);

impl ServerSelector for CompositeServerSelector {
	fn select(&self, cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		self.0.iter().fold(servers, |servers, selector| selector.select(cluster, servers))
	}
}

impl fmt::Display for CompositeServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for (i, selector) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(", then ")?;
			}
			write!(f, "{}", selector)?;
		}
		Ok(())
	}
}

pub type SelectorFn = dyn Fn(&ClusterDescription, Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> + Send + Sync;

/// A selector backed by a closure.
pub struct DelegateServerSelector {
	name:     String,
	delegate: Box<SelectorFn>
}

impl DelegateServerSelector {
	pub fn new(
		name:     &str,
		delegate: impl Fn(&ClusterDescription, Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> + Send + Sync + 'static
	) -> Self {
		Self { name: name.to_string(), delegate: Box::new(delegate) }
	}
}

impl ServerSelector for DelegateServerSelector {
	fn select(&self, cluster: &ClusterDescription, servers: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
		(self.delegate)(cluster, servers)
	}
}

impl fmt::Display for DelegateServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.name)
	}
}
