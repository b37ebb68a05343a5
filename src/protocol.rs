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

//! Single-shot executors, one per operation kind.
//!
//! Every executor frames its request(s) into one [`MessageBuffer`], writes it to a
//! [`Channel`] in a single send and, where the operation has one, reads the reply.

use {
	crate::{
		Error, Result,
		channel::Channel,
		common::{CollectionNamespace, WriteConcern, DEFAULT_MAX_MESSAGE_SIZE},
		wire::{
			self, MessageBuffer, ReplyMessage, ResponseFlags,
			QueryMessage, QueryFlags, GetMoreMessage, InsertFlags,
			UpdateMessage, UpdateFlags, DeleteMessage, DeleteFlags, KillCursorsMessage
		}
	},
	std::{marker::PhantomData, fmt},
	serde::{Serialize, de::DeserializeOwned},
	bson::{doc, Bson, Document},
	log::trace
};

pub trait Protocol {
	type Output;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output>;
}

/// One batch of a cursor. A `cursor_id` of zero means the cursor is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorBatch<T> {
	pub cursor_id: i64,
	pub documents: Vec<T>
}

fn read_batch<T: DeserializeOwned>(reply: &ReplyMessage) -> Result<CursorBatch<T>> {
	reply.check_query_failure()?;
	Ok(CursorBatch {
		cursor_id: reply.cursor_id,
		documents: reply.documents().collect::<Result<_>>()?
	})
}

fn as_i64(value: Option<&Bson>) -> Option<i64> {
	match value? {
		Bson::Int32(v)  => Some(*v as i64),
		Bson::Int64(v)  => Some(*v),
		Bson::Double(v) => Some(*v as i64),
		_ => None
	}
}

/// `ok` is sent as a double by most servers, but older ones use ints or booleans.
pub fn is_ok(document: &Document) -> bool {
	match document.get("ok") {
		Some(Bson::Boolean(v)) => *v,
		Some(Bson::Double(v))  => *v == 1.0,
		other                  => as_i64(other) == Some(1)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryProtocol<T> {
	pub namespace:        CollectionNamespace,
	pub query:            Document,
	pub fields:           Option<Document>,
	pub skip:             i32,
	/// 0 lets the server choose, a negative value closes the cursor after one batch.
	pub number_to_return: i32,
	pub flags:            QueryFlags,
	_marker:              PhantomData<fn() -> T>
}

impl<T> QueryProtocol<T> {
	pub fn new(namespace: CollectionNamespace, query: Document) -> Self {
		Self {
			namespace,
			query,
			fields:           None,
			skip:             0,
			number_to_return: 0,
			flags:            QueryFlags::NONE,
			_marker:          PhantomData
		}
	}

	pub fn fields(mut self, fields: Document) -> Self {
		self.fields = Some(fields);
		self
	}

	pub fn skip(mut self, skip: i32) -> Self {
		self.skip = skip;
		self
	}

	pub fn number_to_return(mut self, number_to_return: i32) -> Self {
		self.number_to_return = number_to_return;
		self
	}

	pub fn flags(mut self, flags: QueryFlags) -> Self {
		self.flags = flags;
		self
	}

	fn message(&self) -> QueryMessage {
		let mut flags = self.flags;
		if flags.contains(QueryFlags::TAILABLE_CURSOR) {
			flags.set(QueryFlags::AWAIT_DATA, true);
		}

		QueryMessage {
			request_id:       wire::next_request_id(),
			namespace:        self.namespace.clone(),
			flags,
			skip:             self.skip,
			number_to_return: self.number_to_return,
			query:            self.query.clone(),
			fields:           self.fields.clone()
		}
	}
}

impl<T: DeserializeOwned> Protocol for QueryProtocol<T> {
	type Output = CursorBatch<T>;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output> {
		let message = self.message();
		let mut buf = MessageBuffer::new();
		buf.add(&message)?;
		channel.send(&buf)?;
		read_batch(&channel.receive(message.request_id)?)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreProtocol<T> {
	pub namespace:        CollectionNamespace,
	pub cursor_id:        i64,
	pub number_to_return: i32,
	_marker:              PhantomData<fn() -> T>
}

impl<T> GetMoreProtocol<T> {
	pub fn new(namespace: CollectionNamespace, cursor_id: i64, number_to_return: i32) -> Self {
		Self { namespace, cursor_id, number_to_return, _marker: PhantomData }
	}
}

impl<T: DeserializeOwned> Protocol for GetMoreProtocol<T> {
	type Output = CursorBatch<T>;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output> {
		let request_id = wire::next_request_id();
		let mut buf = MessageBuffer::new();
		buf.add(&GetMoreMessage {
			request_id,
			namespace:        self.namespace.clone(),
			number_to_return: self.number_to_return,
			cursor_id:        self.cursor_id
		})?;
		channel.send(&buf)?;

		let reply = channel.receive(request_id)?;
		if reply.flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
			return Err(Error::CursorNotFound(self.cursor_id));
		}
		read_batch(&reply)
	}
}

/// Closes server side cursors. There is no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsProtocol {
	pub cursor_ids: Vec<i64>
}

impl Protocol for KillCursorsProtocol {
	type Output = ();

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<()> {
		let mut buf = MessageBuffer::new();
		buf.add(&KillCursorsMessage {
			request_id: wire::next_request_id(),
			cursor_ids: self.cursor_ids.clone()
		})?;
		channel.send(&buf)
	}
}

/// Runs a command against `<database>.$cmd` and decodes the reply document.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandProtocol<T = Document> {
	pub database: String,
	pub command:  Document,
	pub slave_ok: bool,
	_marker:      PhantomData<fn() -> T>
}

impl<T> CommandProtocol<T> {
	pub fn new(database: &str, command: Document) -> Self {
		Self { database: database.to_string(), command, slave_ok: false, _marker: PhantomData }
	}

	pub fn slave_ok(mut self, slave_ok: bool) -> Self {
		self.slave_ok = slave_ok;
		self
	}
}

impl<T: DeserializeOwned> Protocol for CommandProtocol<T> {
	type Output = T;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<T> {
		let request_id = wire::next_request_id();
		let mut buf = MessageBuffer::new();
		buf.add(&command_message(request_id, &self.database, self.command.clone(), self.slave_ok))?;
		channel.send(&buf)?;

		let reply = channel.receive(request_id)?;
		reply.check_query_failure()?;
		let document = reply.single_document::<Document>()?;
		if !is_ok(&document) {
			return Err(Error::CommandFailure(document));
		}
		Ok(bson::from_document(document)?)
	}
}

fn command_message(request_id: i32, database: &str, command: Document, slave_ok: bool) -> QueryMessage {
	QueryMessage {
		request_id,
		namespace:        CollectionNamespace::command_collection(database),
		flags:            if slave_ok { QueryFlags::SLAVE_OK } else { QueryFlags::NONE },
		skip:             0,
		number_to_return: -1,
		query:            command,
		fields:           None
	}
}

/// The parsed reply of a getLastError command.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernResult {
	pub ok:               bool,
	pub err:              Option<String>,
	pub code:             Option<i32>,
	/// Number of documents affected.
	pub n:                i64,
	pub updated_existing: bool,
	pub upserted:         Option<Bson>,
	pub document:         Document
}

impl WriteConcernResult {
	pub fn from_document(document: Document) -> Self {
		Self {
			ok:               is_ok(&document),
			err:              match document.get("err") {
				Some(Bson::String(err)) if !err.is_empty() => Some(err.clone()),
				_ => None
			},
			code:             as_i64(document.get("code")).map(|code| code as i32),
			n:                as_i64(document.get("n")).unwrap_or(0),
			updated_existing: document.get_bool("updatedExisting").unwrap_or(false),
			upserted:         document.get("upserted").cloned(),
			document
		}
	}

	pub fn has_error(&self) -> bool {
		!self.ok || self.err.is_some()
	}
}

/// A failed write confirmation, together with every confirmation received for the same
/// operation (including the failed one).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernError {
	pub result:          WriteConcernResult,
	pub partial_results: Vec<WriteConcernResult>
}

impl fmt::Display for WriteConcernError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match (&self.result.err, self.result.code) {
			(Some(err), Some(code)) => write!(f, "write concern error {}: {}", code, err),
			(Some(err), None)       => write!(f, "write concern error: {}", err),
			(None, _)               => write!(f, "write concern error: {}", self.result.document)
		}
	}
}

/// Appends the getLastError command, if any, sends the buffer and parses the confirmation.
fn send_write<C: Channel + ?Sized>(
	channel:  &mut C,
	mut buf:  MessageBuffer,
	database: &str,
	gle:      Option<Document>
) -> Result<Option<WriteConcernResult>> {
	let gle_request_id = match gle {
		Some(command) => {
			let request_id = wire::next_request_id();
			buf.add(&command_message(request_id, database, command, false))?;
			Some(request_id)
		}
		None => None
	};

	channel.send(&buf)?;

	let request_id = match gle_request_id {
		Some(request_id) => request_id,
		None => return Ok(None)
	};

	let reply = channel.receive(request_id)?;
	reply.check_query_failure()?;
	Ok(Some(WriteConcernResult::from_document(reply.single_document()?)))
}

fn check_result(result: Option<WriteConcernResult>) -> Result<Option<WriteConcernResult>> {
	match result {
		Some(result) if result.has_error() => Err(WriteConcernError {
			partial_results: vec![result.clone()],
			result
		}.into()),
		result => Ok(result)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateProtocol {
	pub namespace:     CollectionNamespace,
	pub selector:      Document,
	pub update:        Document,
	pub flags:         UpdateFlags,
	pub write_concern: WriteConcern
}

impl Protocol for UpdateProtocol {
	/// `None` if the write was not acknowledged.
	type Output = Option<WriteConcernResult>;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output> {
		let mut buf = MessageBuffer::new();
		buf.add(&UpdateMessage {
			request_id: wire::next_request_id(),
			namespace:  self.namespace.clone(),
			flags:      self.flags,
			selector:   self.selector.clone(),
			update:     self.update.clone()
		})?;
		check_result(send_write(channel, buf, &self.namespace.database,
			self.write_concern.get_last_error_command())?)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteProtocol {
	pub namespace:     CollectionNamespace,
	pub selector:      Document,
	pub flags:         DeleteFlags,
	pub write_concern: WriteConcern
}

impl Protocol for DeleteProtocol {
	type Output = Option<WriteConcernResult>;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output> {
		let mut buf = MessageBuffer::new();
		buf.add(&DeleteMessage {
			request_id: wire::next_request_id(),
			namespace:  self.namespace.clone(),
			flags:      self.flags,
			selector:   self.selector.clone()
		})?;
		check_result(send_write(channel, buf, &self.namespace.database,
			self.write_concern.get_last_error_command())?)
	}
}

/// Inserts documents in as many messages as `max_message_size` requires.
///
/// A document that doesn't fit into the current message anymore is taken back out and
/// starts the next one. A single document larger than `max_message_size` is still sent,
/// alone in its own message.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertProtocol<T> {
	pub namespace:         CollectionNamespace,
	pub documents:         Vec<T>,
	pub write_concern:     WriteConcern,
	pub continue_on_error: bool,
	pub max_message_size:  usize,
	pub max_document_size: Option<usize>,
	pub max_batch_count:   Option<usize>
}

impl<T> InsertProtocol<T> {
	pub fn new(namespace: CollectionNamespace, documents: Vec<T>, write_concern: WriteConcern) -> Self {
		Self {
			namespace,
			documents,
			write_concern,
			continue_on_error: false,
			max_message_size:  DEFAULT_MAX_MESSAGE_SIZE,
			max_document_size: None,
			max_batch_count:   None
		}
	}
}

impl<T: Serialize> Protocol for InsertProtocol<T> {
	/// One result per confirmed batch. Intermediate batches of an unacknowledged insert
	/// that stops on errors are confirmed too.
	type Output = Vec<WriteConcernResult>;

	fn execute<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<Self::Output> {
		if self.documents.is_empty() {
			return Err(Error::InvalidState("an insert requires at least one document"));
		}

		let flags = if self.continue_on_error { InsertFlags::CONTINUE_ON_ERROR } else { InsertFlags::NONE };
		let mut documents = self.documents.iter().peekable();
		let mut carried: Option<&T> = None;
		let mut results = Vec::new();
		let mut deferred: Option<WriteConcernResult> = None;

		loop {
			let mut buf = MessageBuffer::new();
			let mut writer = buf.begin_insert(wire::next_request_id(), &self.namespace, flags)?;

			while let Some(document) = carried.take().or_else(|| documents.next()) {
				let size = writer.append(document)?;
				if let Some(max) = self.max_document_size {
					if size > max {
						return Err(Error::DocumentTooLarge { size, max });
					}
				}

				if writer.message_length() > self.max_message_size && writer.document_count() > 1 {
					writer.remove_last();
					carried = Some(document);
					break;
				}

				if self.max_batch_count == Some(writer.document_count())
					|| writer.message_length() >= self.max_message_size {
					break;
				}
			}

			trace!("inserting a batch of {} documents ({} bytes) into {}",
				writer.document_count(), writer.message_length(), self.namespace);
			writer.finish()?;

			let is_last = carried.is_none() && documents.peek().is_none();
			let gle = if self.write_concern.is_acknowledged() {
				self.write_concern.get_last_error_command()
			} else if !is_last && !self.continue_on_error {
				Some(doc! { "getlasterror": 1 })
			} else {
				None
			};

			if let Some(result) = send_write(channel, buf, &self.namespace.database, gle)? {
				results.push(result.clone());
				if result.has_error() {
					if !self.continue_on_error {
						return Err(WriteConcernError { result, partial_results: results }.into());
					}
					deferred.get_or_insert(result);
				}
			}

			if is_last {
				break;
			}
		}

		match deferred {
			Some(result) => Err(WriteConcernError { result, partial_results: results }.into()),
			None => Ok(results)
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use {
		super::*,
		crate::{
			connection::Endpoint,
			ids::{ConnectionId, IdGenerator},
			wire::{Request, HEADER_SIZE}
		},
		std::collections::VecDeque,
		rand::{Rng, SeedableRng, rngs::StdRng}
	};

	pub(crate) type Handler = Box<dyn FnMut(&Request) -> Option<ReplyMessage> + Send>;

	/// Decodes everything it is sent and answers through `handler`.
	pub(crate) struct ScriptedChannel {
		endpoint:    Endpoint,
		id:          ConnectionId,
		pub sent:    Vec<Vec<Request>>,
		pub sizes:   Vec<Vec<usize>>,
		pending:     VecDeque<ReplyMessage>,
		handler:     Handler
	}

	impl ScriptedChannel {
		pub(crate) fn new(handler: impl FnMut(&Request) -> Option<ReplyMessage> + Send + 'static) -> Self {
			let ids = IdGenerator::new();
			let endpoint = Endpoint::new("localhost", 27017);
			let server_id = ids.next_server_id(ids.next_cluster_id(), &endpoint);
			Self {
				id:      ids.next_connection_id(&server_id),
				endpoint,
				sent:    Vec::new(),
				sizes:   Vec::new(),
				pending: VecDeque::new(),
				handler: Box::new(handler)
			}
		}

		/// Replies `{ok: 1, n: 0}` to every command.
		pub(crate) fn acknowledging() -> Self {
			Self::new(|request| match request {
				Request::Query(q) if q.namespace.collection == "$cmd" => Some(reply(q.request_id, doc! { "ok": 1.0, "n": 0 })),
				_ => None
			})
		}
	}

	pub(crate) fn reply(response_to: i32, document: Document) -> ReplyMessage {
		ReplyMessage::new(response_to, ResponseFlags::NONE, 0, 0, &[document]).unwrap()
	}

	impl Channel for ScriptedChannel {
		fn endpoint(&self) -> &Endpoint {
			&self.endpoint
		}

		fn connection_id(&self) -> &ConnectionId {
			&self.id
		}

		fn send(&mut self, buffer: &MessageBuffer) -> Result<()> {
			let mut reader = std::io::Cursor::new(buffer.as_bytes());
			let mut requests = Vec::new();
			let mut sizes = Vec::new();
			while (reader.position() as usize) < buffer.len() {
				let start = reader.position();
				let request = Request::read_from(&mut reader)?;
				sizes.push((reader.position() - start) as usize);
				if let Some(reply) = (self.handler)(&request) {
					self.pending.push_back(reply);
				}
				requests.push(request);
			}
			self.sent.push(requests);
			self.sizes.push(sizes);
			Ok(())
		}

		fn receive(&mut self, response_to: i32) -> Result<ReplyMessage> {
			let reply = self.pending.pop_front()
				.ok_or(Error::InvalidState("no reply scripted"))?;
			reply.expect_response_to(response_to)?;
			Ok(reply)
		}
	}

	fn ns() -> CollectionNamespace {
		CollectionNamespace::new("test", "docs")
	}

	fn inserted(channel: &ScriptedChannel) -> Vec<Vec<Document>> {
		channel.sent.iter().map(|requests| match &requests[0] {
			Request::Insert(insert) => insert.documents.clone(),
			other => panic!("expected an insert, got {:?}", other)
		}).collect()
	}

	#[test]
	fn query_returns_a_batch_and_requests_await_data_for_tailable_cursors() {
		let mut channel = ScriptedChannel::new(|request| match request {
			Request::Query(q) => Some(ReplyMessage::new(q.request_id, ResponseFlags::NONE, 77, 0,
				&[doc! { "a": 1 }, doc! { "a": 2 }]).unwrap()),
			_ => None
		});

		let batch = QueryProtocol::<Document>::new(ns(), doc! { "a": { "$gt": 0 } })
			.number_to_return(2)
			.flags(QueryFlags::TAILABLE_CURSOR)
			.execute(&mut channel)
			.unwrap();
		assert_eq!(batch, CursorBatch { cursor_id: 77, documents: vec![doc! { "a": 1 }, doc! { "a": 2 }] });

		match &channel.sent[0][0] {
			Request::Query(q) => {
				assert!(q.flags.contains(QueryFlags::TAILABLE_CURSOR | QueryFlags::AWAIT_DATA));
				assert_eq!(q.number_to_return, 2);
			}
			other => panic!("unexpected request {:?}", other)
		}
	}

	#[test]
	fn query_failure_is_an_operation_error() {
		let mut channel = ScriptedChannel::new(|request| Some(ReplyMessage::new(request.request_id(),
			ResponseFlags::QUERY_FAILURE, 0, 0, &[doc! { "$err": "unauthorized", "code": 13 }]).unwrap()));

		match QueryProtocol::<Document>::new(ns(), doc! {}).execute(&mut channel) {
			Err(Error::QueryFailure(doc)) => assert_eq!(doc.get_i32("code").unwrap(), 13),
			other => panic!("unexpected result {:?}", other)
		}
	}

	#[test]
	fn get_more_reports_missing_cursors() {
		let mut channel = ScriptedChannel::new(|request| Some(ReplyMessage::new(request.request_id(),
			ResponseFlags::CURSOR_NOT_FOUND, 0, 0, &[]).unwrap()));
		assert!(matches!(GetMoreProtocol::<Document>::new(ns(), 5, 0).execute(&mut channel),
			Err(Error::CursorNotFound(5))));
	}

	#[test]
	fn command_checks_ok() {
		let mut channel = ScriptedChannel::new(|request| match request {
			Request::Query(q) if q.query.contains_key("ping") => Some(reply(q.request_id, doc! { "ok": 1 })),
			Request::Query(q) => Some(reply(q.request_id, doc! { "ok": 0.0, "errmsg": "no such command" })),
			_ => None
		});

		let ok: Document = CommandProtocol::new("admin", doc! { "ping": 1 }).execute(&mut channel).unwrap();
		assert_eq!(ok, doc! { "ok": 1 });

		match CommandProtocol::<Document>::new("admin", doc! { "bogus": 1 }).execute(&mut channel) {
			Err(Error::CommandFailure(doc)) => assert_eq!(doc.get_str("errmsg").unwrap(), "no such command"),
			other => panic!("unexpected result {:?}", other)
		}

		match &channel.sent[0][0] {
			Request::Query(q) => {
				assert_eq!(q.namespace.full_name(), "admin.$cmd");
				assert_eq!(q.number_to_return, -1);
			}
			other => panic!("unexpected request {:?}", other)
		}
	}

	#[test]
	fn update_piggybacks_get_last_error() {
		let mut channel = ScriptedChannel::new(|request| match request {
			Request::Query(q) => Some(reply(q.request_id, doc! { "ok": 1, "n": 3, "updatedExisting": true })),
			_ => None
		});

		let result = UpdateProtocol {
			namespace:     ns(),
			selector:      doc! { "a": 1 },
			update:        doc! { "$inc": { "b": 1 } },
			flags:         UpdateFlags::MULTI,
			write_concern: WriteConcern { journal: Some(true), ..WriteConcern::acknowledged() }
		}.execute(&mut channel).unwrap().unwrap();

		assert_eq!(result.n, 3);
		assert!(result.updated_existing);
		assert_eq!(channel.sent.len(), 1);
		match &channel.sent[0][..] {
			[Request::Update(u), Request::Query(q)] => {
				assert_eq!(u.flags, UpdateFlags::MULTI);
				assert_eq!(q.namespace.full_name(), "test.$cmd");
				assert_eq!(q.query, doc! { "getlasterror": 1, "j": true });
			}
			other => panic!("unexpected requests {:?}", other)
		}
	}

	#[test]
	fn delete_surfaces_write_concern_errors() {
		let mut channel = ScriptedChannel::new(|request| match request {
			Request::Query(q) => Some(reply(q.request_id, doc! { "ok": 1, "err": "timeout", "code": 64 })),
			_ => None
		});

		let err = DeleteProtocol {
			namespace:     ns(),
			selector:      doc! {},
			flags:         DeleteFlags::SINGLE,
			write_concern: WriteConcern::acknowledged()
		}.execute(&mut channel).unwrap_err();

		match err {
			Error::WriteConcern(e) => {
				assert_eq!(e.result.code, Some(64));
				assert_eq!(e.to_string(), "write concern error 64: timeout");
			}
			other => panic!("unexpected error {:?}", other)
		}
	}

	#[test]
	fn unacknowledged_writes_expect_no_reply() {
		let mut channel = ScriptedChannel::new(|_| None);
		let result = DeleteProtocol {
			namespace:     ns(),
			selector:      doc! {},
			flags:         DeleteFlags::NONE,
			write_concern: WriteConcern::unacknowledged()
		}.execute(&mut channel).unwrap();
		assert_eq!(result, None);
		assert_eq!(channel.sent[0].len(), 1);
	}

	#[test]
	fn forty_megabytes_of_two_megabyte_documents_take_three_batches() {
		let document = doc! { "data": "x".repeat(2 * 1024 * 1024 - 16) };
		let mut channel = ScriptedChannel::acknowledging();
		let results = InsertProtocol {
			max_message_size: 16 * 1024 * 1024,
			..InsertProtocol::new(ns(), vec![document; 20], WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap();

		assert_eq!(results.len(), 3);
		let batches = inserted(&channel);
		assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![7, 7, 6]);
		for requests in &channel.sent {
			assert!(matches!(&requests[..], [Request::Insert(_), Request::Query(_)]));
		}
		for sizes in &channel.sizes {
			assert!(sizes[0] <= 16 * 1024 * 1024);
		}
	}

	#[test]
	fn batches_concatenate_to_the_input() {
		let mut rng = StdRng::seed_from_u64(7);
		let documents = (0..200)
			.map(|i| doc! { "i": i, "pad": "p".repeat(rng.gen_range(0, 3000)) })
			.collect::<Vec<_>>();

		for &max_message_size in &[1024usize, 4096, 20_000, 1 << 20] {
			let mut channel = ScriptedChannel::acknowledging();
			InsertProtocol {
				max_message_size,
				..InsertProtocol::new(ns(), documents.clone(), WriteConcern::acknowledged())
			}.execute(&mut channel).unwrap();

			let batches = inserted(&channel);
			assert_eq!(batches.concat(), documents);
			for (batch, sizes) in batches.iter().zip(&channel.sizes) {
				assert!(sizes[0] <= max_message_size || batch.len() == 1,
					"batch of {} documents is {} bytes", batch.len(), sizes[0]);
			}
		}
	}

	#[test]
	fn oversized_document_is_sent_alone() {
		let mut channel = ScriptedChannel::acknowledging();
		let documents = vec![doc! { "a": "small" }, doc! { "a": "b".repeat(500) }, doc! { "a": "small" }];
		InsertProtocol {
			max_message_size: HEADER_SIZE + 200,
			..InsertProtocol::new(ns(), documents.clone(), WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap();

		assert_eq!(inserted(&channel), vec![
			vec![documents[0].clone()],
			vec![documents[1].clone()],
			vec![documents[2].clone()]
		]);
	}

	#[test]
	fn batch_count_limit_and_document_size_limit() {
		let mut channel = ScriptedChannel::acknowledging();
		InsertProtocol {
			max_batch_count: Some(2),
			..InsertProtocol::new(ns(), vec![doc! { "a": 1 }; 5], WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap();
		assert_eq!(inserted(&channel).iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);

		let mut channel = ScriptedChannel::acknowledging();
		let err = InsertProtocol {
			max_document_size: Some(16),
			..InsertProtocol::new(ns(), vec![doc! { "a": "too large for the limit" }], WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap_err();
		assert!(matches!(err, Error::DocumentTooLarge { max: 16, .. }));
		assert!(channel.sent.is_empty());
	}

	#[test]
	fn unacknowledged_insert_confirms_intermediate_batches_only() {
		let mut channel = ScriptedChannel::acknowledging();
		let results = InsertProtocol {
			max_batch_count: Some(1),
			..InsertProtocol::new(ns(), vec![doc! { "a": 1 }; 3], WriteConcern::unacknowledged())
		}.execute(&mut channel).unwrap();

		assert_eq!(results.len(), 2);
		assert_eq!(channel.sent.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
	}

	fn failing_on_batch(failing: usize) -> ScriptedChannel {
		let mut batch = 0;
		ScriptedChannel::new(move |request| match request {
			Request::Query(q) => {
				batch += 1;
				Some(reply(q.request_id, if batch == failing {
					doc! { "ok": 1, "err": "E11000 duplicate key", "code": 11000 }
				} else {
					doc! { "ok": 1, "n": 0 }
				}))
			}
			_ => None
		})
	}

	#[test]
	fn insert_stops_at_the_failing_batch() {
		let mut channel = failing_on_batch(2);
		let err = InsertProtocol {
			max_batch_count: Some(1),
			..InsertProtocol::new(ns(), vec![doc! { "a": 1 }; 4], WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap_err();

		match err {
			Error::WriteConcern(e) => {
				assert_eq!(e.result.code, Some(11000));
				assert_eq!(e.partial_results.len(), 2);
			}
			other => panic!("unexpected error {:?}", other)
		}
		assert_eq!(channel.sent.len(), 2);
	}

	#[test]
	fn continue_on_error_defers_the_failure() {
		let mut channel = failing_on_batch(2);
		let err = InsertProtocol {
			max_batch_count:   Some(1),
			continue_on_error: true,
			..InsertProtocol::new(ns(), vec![doc! { "a": 1 }; 4], WriteConcern::acknowledged())
		}.execute(&mut channel).unwrap_err();

		match err {
			Error::WriteConcern(e) => {
				assert_eq!(e.result.err.as_deref(), Some("E11000 duplicate key"));
				assert_eq!(e.partial_results.len(), 4);
			}
			other => panic!("unexpected error {:?}", other)
		}
		assert_eq!(channel.sent.len(), 4);
		match &channel.sent[0][0] {
			Request::Insert(insert) => assert!(insert.flags.contains(InsertFlags::CONTINUE_ON_ERROR)),
			other => panic!("unexpected request {:?}", other)
		}
	}

	#[test]
	fn write_concern_result_parsing() {
		let result = WriteConcernResult::from_document(doc! { "ok": true, "err": "", "n": 2i64, "upserted": 5 });
		assert!(result.ok);
		assert!(!result.has_error());
		assert_eq!(result.n, 2);
		assert_eq!(result.upserted, Some(Bson::Int32(5)));
		assert!(WriteConcernResult::from_document(doc! { "ok": 0 }).has_error());
	}
}
