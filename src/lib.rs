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

//! The core of a MongoDB driver speaking the legacy wire protocol.
//!
//! A [`Cluster`] is created from a [`ConnectionString`] (or from settings), discovers and
//! monitors the servers of the deployment and hands out [`SelectedServer`]s. A selected
//! server provides channels, over which the [protocols](protocol) run their requests.
//! Query results are iterated with a [`BatchCursor`].
//!
//! ```no_run
//! use mongo_driver_core::*;
//!
//! let cluster = "mongodb://localhost:27017".parse::<ConnectionString>()?.connect()?;
//! let server = cluster.select(&WritableServerSelector, &CancellationToken::none())?;
//! # Ok::<(), Error>(())
//! ```

#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub use self::{
	common::*,
	ids::{ClusterId, ServerId, ConnectionId, IdGenerator},
	apm::{Event, EventListener, EventListeners},
	sync::CancellationToken,
	connection::{Endpoint, Connection, ConnectionFactory, BinaryConnectionFactory, Authenticator},
	pool::ConnectionPool,
	channel::{Channel, BoxedChannel, ChannelProvider},
	protocol::Protocol,
	cursor::{BatchCursor, ChannelSource},
	server::{Server, ServerDescription, ServerStatus, ServerType, ClusterableServer, ServerFactory, DefaultServerFactory},
	selector::*,
	cluster::{Cluster, ClusterDescription, ClusterState, ClusterType, SelectedServer}
};

pub mod common;
pub mod ids;
pub mod apm;
pub mod sync;
pub mod wire;
pub mod connection;
pub mod pool;
pub mod channel;
pub mod protocol;
pub mod cursor;
pub mod server;
pub mod selector;
pub mod cluster;

pub static DRIVER_NAME: &str = "mongo-driver-core";
