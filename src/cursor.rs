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
		Result,
		channel::{BoxedChannel, ChannelProvider},
		common::CollectionNamespace,
		protocol::{CursorBatch, GetMoreProtocol, KillCursorsProtocol, Protocol},
		sync::CancellationToken
	},
	std::{collections::VecDeque, sync::Arc, time::Duration},
	serde::de::DeserializeOwned,
	log::debug
};

/// Anything a cursor can get a channel to its server from.
pub trait ChannelSource: Send + Sync {
	fn acquire_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel>;
}

impl ChannelSource for ChannelProvider {
	fn acquire_channel(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BoxedChannel> {
		ChannelProvider::get_channel(self, timeout, cancel)
	}
}

/// Iterates the documents of a query, fetching further batches from the server the
/// cursor lives on. An open server cursor is killed when this is dropped.
pub struct BatchCursor<T> {
	source:     Arc<dyn ChannelSource>,
	namespace:  CollectionNamespace,
	cursor_id:  i64,
	batch_size: i32,
	limit:      usize,
	returned:   usize,
	timeout:    Duration,
	buffer:     VecDeque<T>,
	first:      Option<Vec<T>>
}

impl<T: DeserializeOwned> BatchCursor<T> {
	/// `limit` of 0 means no limit.
	pub fn new(
		source:     Arc<dyn ChannelSource>,
		namespace:  CollectionNamespace,
		first:      CursorBatch<T>,
		batch_size: i32,
		limit:      usize,
		timeout:    Duration
	) -> Self {
		Self {
			source,
			namespace,
			cursor_id: first.cursor_id,
			batch_size,
			limit,
			returned:  0,
			timeout,
			buffer:    VecDeque::new(),
			first:     Some(first.documents)
		}
	}

	pub fn cursor_id(&self) -> i64 {
		self.cursor_id
	}

	pub fn namespace(&self) -> &CollectionNamespace {
		&self.namespace
	}

	fn remaining(&self) -> Option<usize> {
		match self.limit {
			0     => None,
			limit => Some(limit.saturating_sub(self.returned))
		}
	}

	fn number_to_return(&self) -> i32 {
		match (self.remaining(), self.batch_size) {
			(None, batch_size) => batch_size,
			(Some(remaining), batch_size) if batch_size != 0 && (batch_size.unsigned_abs() as usize) < remaining => batch_size,
			(Some(remaining), _) => remaining.min(i32::MAX as usize) as i32
		}
	}

	/// Returns the next batch, `None` once the cursor is exhausted or the limit is reached.
	pub fn next_batch(&mut self) -> Result<Option<Vec<T>>> {
		let mut batch = match self.first.take() {
			Some(first) => first,
			None => {
				if self.cursor_id == 0 || self.remaining() == Some(0) {
					return Ok(None);
				}

				let mut channel = self.source.acquire_channel(self.timeout, &CancellationToken::none())?;
				let next = GetMoreProtocol::new(self.namespace.clone(), self.cursor_id, self.number_to_return())
					.execute(&mut *channel);
				let next: CursorBatch<T> = match next {
					Ok(next) => next,
					Err(e) => {
						// the server cursor is gone or in an unknown state
						self.cursor_id = 0;
						return Err(e);
					}
				};
				self.cursor_id = next.cursor_id;
				next.documents
			}
		};

		if let Some(remaining) = self.remaining() {
			batch.truncate(remaining);
		}
		self.returned += batch.len();

		if self.remaining() == Some(0) {
			self.kill();
		}

		Ok(if batch.is_empty() && self.cursor_id == 0 { None } else { Some(batch) })
	}
}

impl<T> BatchCursor<T> {
	fn kill(&mut self) {
		if self.cursor_id == 0 {
			return;
		}

		let cursor_id = std::mem::replace(&mut self.cursor_id, 0);
		let result = self.source.acquire_channel(self.timeout, &CancellationToken::none())
			.and_then(|mut channel| KillCursorsProtocol { cursor_ids: vec![cursor_id] }.execute(&mut *channel));
		if let Err(e) = result {
			debug!("failed to kill cursor {} on {}: {}", cursor_id, self.namespace, e);
		}
	}
}

impl<T: DeserializeOwned> Iterator for BatchCursor<T> {
	type Item = Result<T>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if let Some(document) = self.buffer.pop_front() {
				return Some(Ok(document));
			}

			match self.next_batch() {
				Ok(Some(batch)) => self.buffer.extend(batch),
				Ok(None) => return None,
				Err(e) => return Some(Err(e))
			}
		}
	}
}

impl<T> Drop for BatchCursor<T> {
	fn drop(&mut self) {
		self.kill();
	}
}
