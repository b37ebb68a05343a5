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

//! The legacy wire protocol (OP_QUERY and friends).
//!
//! see https://docs.mongodb.com/manual/reference/mongodb-wire-protocol/

use {
	crate::{Error, Result, common::CollectionNamespace},
	std::{
		io::{self, Read, Write, Seek, SeekFrom, Cursor},
		sync::atomic::{AtomicI32, Ordering},
		marker::PhantomData,
		fmt
	},
	serde::{Serialize, de::DeserializeOwned},
	bson::Document
};

pub const HEADER_SIZE: usize = 16;
/// Anything longer is treated as a protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;
/// responseFlags, cursorID, startingFrom, numberReturned
pub const REPLY_PREFIX_SIZE: usize = 20;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Process wide, so replies can never be matched to a request of another connection.
pub fn next_request_id() -> i32 {
	NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InvalidReplyError {
	/// The opcode was not REPLY
	OpCode(i32),
	/// Response_to did not match request_id
	ResponseTo { expected: i32, actual: i32 },
	/// The message length is smaller than the fixed part or larger than allowed
	MessageLength(i32),
	/// A document was required, but the reply contained none
	NoDocuments,
	/// A document length points past the end of the message
	Truncated
}

impl fmt::Display for InvalidReplyError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::OpCode(op_code)                => write!(f, "unexpected op code {}", op_code),
			Self::ResponseTo { expected, actual } => write!(f, "expected a response to {} but got one to {}", expected, actual),
			Self::MessageLength(len)             => write!(f, "invalid message length {}", len),
			Self::NoDocuments                    => f.write_str("the reply contained no documents"),
			Self::Truncated                      => f.write_str("the reply is truncated")
		}
	}
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Reply       = 1,
	Update      = 2001,
	Insert      = 2002,
	Query       = 2004,
	GetMore     = 2005,
	Delete      = 2006,
	KillCursors = 2007
}

impl OpCode {
	pub fn from_i32(v: i32) -> Option<Self> {
		Some(match v {
			1    => Self::Reply,
			2001 => Self::Update,
			2002 => Self::Insert,
			2004 => Self::Query,
			2005 => Self::GetMore,
			2006 => Self::Delete,
			2007 => Self::KillCursors,
			_    => return None
		})
	}
}

macro_rules! flags {
	($(#[$meta:meta])* $name:ident { $($flag:ident = $value:expr),* }) => {
		$(#[$meta])*
		#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
		pub struct $name(pub i32);

		impl $name {
			pub const NONE: Self = Self(0);
			$(pub const $flag: Self = Self($value);)*

			pub fn contains(self, other: Self) -> bool {
				self.0 & other.0 == other.0
			}

			pub fn set(&mut self, other: Self, on: bool) {
				if on { self.0 |= other.0 } else { self.0 &= !other.0 }
			}
		}

		impl std::ops::BitOr for $name {
			type Output = Self;

			fn bitor(self, rhs: Self) -> Self {
				Self(self.0 | rhs.0)
			}
		}
	};
}

flags!(QueryFlags {
	TAILABLE_CURSOR   = 2,
	SLAVE_OK          = 4,
	NO_CURSOR_TIMEOUT = 16,
	AWAIT_DATA        = 32,
	EXHAUST           = 64,
	PARTIAL           = 128
});

flags!(UpdateFlags {
	UPSERT = 1,
	MULTI  = 2
});

flags!(DeleteFlags {
	SINGLE = 1
});

flags!(InsertFlags {
	CONTINUE_ON_ERROR = 1
});

flags!(ResponseFlags {
	CURSOR_NOT_FOUND = 1,
	QUERY_FAILURE    = 2,
	AWAIT_CAPABLE    = 8
});

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: i32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        i32
}

impl Header {
	pub fn read(reader: &mut impl Read) -> io::Result<Self> {
		let mut buf = [0u8; HEADER_SIZE];
		reader.read_exact(&mut buf)?;
		Ok(Self::copy_from_slice(&buf))
	}

	pub fn write(self, writer: &mut impl Write) -> io::Result<()> {
		let mut buf = [0u8; HEADER_SIZE];
		self.copy_to_slice(&mut buf);
		writer.write_all(&buf)
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&self.op_code.to_le_bytes());
	}

	fn copy_from_slice(buf: &[u8]) -> Self {
		Self {
			message_length: i32::from_le_bytes([buf[0], buf[1], buf[2],  buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6],  buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]])
		}
	}
}

fn write_i32(buf: &mut impl Write, v: i32) -> io::Result<()> {
	buf.write_all(&v.to_le_bytes())
}

fn write_i64(buf: &mut impl Write, v: i64) -> io::Result<()> {
	buf.write_all(&v.to_le_bytes())
}

fn write_cstring(buf: &mut impl Write, s: &str) -> io::Result<()> {
	if s.as_bytes().contains(&0) {
		return Err(io::Error::new(io::ErrorKind::InvalidInput, "cstring contains a null byte"));
	}
	buf.write_all(s.as_bytes())?;
	buf.write_all(&[0])
}

/// Serializes `value` as a BSON document, returning the number of bytes written.
fn write_document<T: Serialize>(buf: &mut impl Write, value: &T) -> Result<usize> {
	let bytes = bson::to_vec(value)?;
	buf.write_all(&bytes)?;
	Ok(bytes.len())
}

/// Overwrites the length placeholder of the message starting at `start` with the number
/// of bytes written since, leaving the cursor at the end.
fn backpatch_length(buf: &mut Cursor<Vec<u8>>, start: u64) -> io::Result<()> {
	let end = buf.position();
	buf.seek(SeekFrom::Start(start))?;
	write_i32(buf, (end - start) as i32)?;
	buf.seek(SeekFrom::Start(end))?;
	Ok(())
}

pub trait RequestMessage {
	fn request_id(&self) -> i32;

	fn op_code(&self) -> OpCode;

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()>;

	/// Writes the header with a zero length, then the body, then backpatches the length.
	fn write_to(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		let start = buf.position();
		Header {
			message_length: 0,
			request_id:     self.request_id(),
			response_to:    0,
			op_code:        self.op_code() as i32
		}.write(buf)?;
		self.write_body(buf)?;
		backpatch_length(buf, start)?;
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
	pub request_id:       i32,
	pub namespace:        CollectionNamespace,
	pub flags:            QueryFlags,
	pub skip:             i32,
	pub number_to_return: i32,
	pub query:            Document,
	pub fields:           Option<Document>
}

impl RequestMessage for QueryMessage {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::Query }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, self.flags.0)?;
		write_cstring(buf, &self.namespace.full_name())?;
		write_i32(buf, self.skip)?;
		write_i32(buf, self.number_to_return)?;
		write_document(buf, &self.query)?;
		if let Some(fields) = &self.fields {
			write_document(buf, fields)?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
	pub request_id:       i32,
	pub namespace:        CollectionNamespace,
	pub number_to_return: i32,
	pub cursor_id:        i64
}

impl RequestMessage for GetMoreMessage {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::GetMore }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, 0)?;
		write_cstring(buf, &self.namespace.full_name())?;
		write_i32(buf, self.number_to_return)?;
		write_i64(buf, self.cursor_id)?;
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
	pub request_id: i32,
	pub namespace:  CollectionNamespace,
	pub flags:      UpdateFlags,
	pub selector:   Document,
	pub update:     Document
}

impl RequestMessage for UpdateMessage {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::Update }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, 0)?;
		write_cstring(buf, &self.namespace.full_name())?;
		write_i32(buf, self.flags.0)?;
		write_document(buf, &self.selector)?;
		write_document(buf, &self.update)?;
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
	pub request_id: i32,
	pub namespace:  CollectionNamespace,
	pub flags:      DeleteFlags,
	pub selector:   Document
}

impl RequestMessage for DeleteMessage {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::Delete }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, 0)?;
		write_cstring(buf, &self.namespace.full_name())?;
		write_i32(buf, self.flags.0)?;
		write_document(buf, &self.selector)?;
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMessage {
	pub request_id: i32,
	pub cursor_ids: Vec<i64>
}

impl RequestMessage for KillCursorsMessage {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::KillCursors }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, 0)?;
		write_i32(buf, self.cursor_ids.len() as i32)?;
		for id in &self.cursor_ids {
			write_i64(buf, *id)?;
		}
		Ok(())
	}
}

/// A complete insert message, see [`InsertMessageWriter`] for incremental construction.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage<T> {
	pub request_id: i32,
	pub namespace:  CollectionNamespace,
	pub flags:      InsertFlags,
	pub documents:  Vec<T>
}

impl<T: Serialize> RequestMessage for InsertMessage<T> {
	fn request_id(&self) -> i32 { self.request_id }

	fn op_code(&self) -> OpCode { OpCode::Insert }

	fn write_body(&self, buf: &mut Cursor<Vec<u8>>) -> Result<()> {
		write_i32(buf, self.flags.0)?;
		write_cstring(buf, &self.namespace.full_name())?;
		for document in &self.documents {
			write_document(buf, document)?;
		}
		Ok(())
	}
}

/// Builds an insert message in place, one document at a time.
///
/// The last appended document can be taken back out again, which is how batches are cut
/// at the maximum message size without serializing any document twice.
#[derive(Debug)]
pub struct InsertMessageWriter<'a> {
	buf:        &'a mut Cursor<Vec<u8>>,
	request_id: i32,
	start:      u64,
	documents:  Vec<u64>
}

impl<'a> InsertMessageWriter<'a> {
	pub fn begin(
		buf:        &'a mut Cursor<Vec<u8>>,
		request_id: i32,
		namespace:  &CollectionNamespace,
		flags:      InsertFlags
	) -> Result<Self> {
		let start = buf.position();
		Header {
			message_length: 0,
			request_id,
			response_to:    0,
			op_code:        OpCode::Insert as i32
		}.write(buf)?;
		write_i32(buf, flags.0)?;
		write_cstring(buf, &namespace.full_name())?;
		Ok(Self { buf, request_id, start, documents: Vec::new() })
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	/// Appends a document and returns its encoded size.
	pub fn append<T: Serialize>(&mut self, document: &T) -> Result<usize> {
		let offset = self.buf.position();
		match write_document(self.buf, document) {
			Ok(size) => {
				self.documents.push(offset);
				Ok(size)
			}
			Err(e) => {
				self.truncate(offset);
				Err(e)
			}
		}
	}

	/// Removes the last appended document, returning the number of bytes removed.
	pub fn remove_last(&mut self) -> Option<usize> {
		let offset = self.documents.pop()?;
		let removed = (self.buf.position() - offset) as usize;
		self.truncate(offset);
		Some(removed)
	}

	fn truncate(&mut self, offset: u64) {
		self.buf.get_mut().truncate(offset as usize);
		self.buf.set_position(offset);
	}

	pub fn document_count(&self) -> usize {
		self.documents.len()
	}

	/// Length of the message written so far, including the header.
	pub fn message_length(&self) -> usize {
		(self.buf.position() - self.start) as usize
	}

	pub fn finish(self) -> Result<()> {
		backpatch_length(self.buf, self.start)?;
		Ok(())
	}
}

/// One or more requests that go out in a single network write.
#[derive(Debug, Default)]
pub struct MessageBuffer {
	buf:         Cursor<Vec<u8>>,
	request_ids: Vec<i32>
}

impl MessageBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, message: &impl RequestMessage) -> Result<()> {
		message.write_to(&mut self.buf)?;
		self.request_ids.push(message.request_id());
		Ok(())
	}

	pub fn begin_insert(
		&mut self,
		request_id: i32,
		namespace:  &CollectionNamespace,
		flags:      InsertFlags
	) -> Result<InsertMessageWriter<'_>> {
		self.request_ids.push(request_id);
		InsertMessageWriter::begin(&mut self.buf, request_id, namespace, flags)
	}

	pub fn request_ids(&self) -> &[i32] {
		&self.request_ids
	}

	pub fn as_bytes(&self) -> &[u8] {
		self.buf.get_ref()
	}

	pub fn len(&self) -> usize {
		self.buf.get_ref().len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.get_ref().is_empty()
	}
}

/// OP_REPLY. The fixed part is read eagerly, the documents are decoded on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
	pub request_id:      i32,
	pub response_to:     i32,
	pub flags:           ResponseFlags,
	pub cursor_id:       i64,
	pub starting_from:   i32,
	pub number_returned: i32,
	payload:             Vec<u8>
}

impl ReplyMessage {
	pub fn new(
		response_to:   i32,
		flags:         ResponseFlags,
		cursor_id:     i64,
		starting_from: i32,
		documents:     &[Document]
	) -> Result<Self> {
		let mut payload = Vec::new();
		for document in documents {
			write_document(&mut payload, document)?;
		}
		Ok(Self {
			request_id:      next_request_id(),
			response_to,
			flags,
			cursor_id,
			starting_from,
			number_returned: documents.len() as i32,
			payload
		})
	}

	/// Reads a complete reply. Messages longer than `max_message_size` are rejected before
	/// anything is allocated for them.
	pub fn read_from(reader: &mut impl Read, max_message_size: usize) -> Result<Self> {
		let header = Header::read(reader)?;

		if header.op_code != OpCode::Reply as i32 {
			return Err(InvalidReplyError::OpCode(header.op_code).into());
		}

		if header.message_length < (HEADER_SIZE + REPLY_PREFIX_SIZE) as i32
			|| header.message_length as usize > max_message_size {
			return Err(InvalidReplyError::MessageLength(header.message_length).into());
		}

		let mut prefix = [0u8; REPLY_PREFIX_SIZE];
		reader.read_exact(&mut prefix)?;

		let mut payload = vec![0u8; header.message_length as usize - HEADER_SIZE - REPLY_PREFIX_SIZE];
		reader.read_exact(&mut payload)?;

		Ok(Self {
			request_id:      header.request_id,
			response_to:     header.response_to,
			flags:           ResponseFlags(i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]])),
			cursor_id:       i64::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7],
				prefix[8], prefix[9], prefix[10], prefix[11]]),
			starting_from:   i32::from_le_bytes([prefix[12], prefix[13], prefix[14], prefix[15]]),
			number_returned: i32::from_le_bytes([prefix[16], prefix[17], prefix[18], prefix[19]]),
			payload
		})
	}

	pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
		let mut buf = Vec::with_capacity(HEADER_SIZE + REPLY_PREFIX_SIZE + self.payload.len());
		Header {
			message_length: (HEADER_SIZE + REPLY_PREFIX_SIZE + self.payload.len()) as i32,
			request_id:     self.request_id,
			response_to:    self.response_to,
			op_code:        OpCode::Reply as i32
		}.write(&mut buf)?;
		write_i32(&mut buf, self.flags.0)?;
		write_i64(&mut buf, self.cursor_id)?;
		write_i32(&mut buf, self.starting_from)?;
		write_i32(&mut buf, self.number_returned)?;
		buf.extend_from_slice(&self.payload);
		writer.write_all(&buf)
	}

	pub fn expect_response_to(&self, request_id: i32) -> Result<()> {
		if self.response_to != request_id {
			return Err(InvalidReplyError::ResponseTo { expected: request_id, actual: self.response_to }.into());
		}
		Ok(())
	}

	/// Turns a QueryFailure flag into an error carrying the server's error document.
	pub fn check_query_failure(&self) -> Result<()> {
		if self.flags.contains(ResponseFlags::QUERY_FAILURE) {
			return Err(match self.documents::<Document>().next() {
				Some(Ok(doc)) => Error::QueryFailure(doc),
				Some(Err(e))  => e,
				None          => InvalidReplyError::NoDocuments.into()
			});
		}
		Ok(())
	}

	/// Decodes the returned documents one at a time. The iterator borrows the reply, so
	/// the buffer lives as long as the iteration does.
	pub fn documents<T: DeserializeOwned>(&self) -> ReplyDocuments<'_, T> {
		ReplyDocuments {
			remaining: &self.payload,
			count:     self.number_returned.max(0) as usize,
			_marker:   PhantomData
		}
	}

	/// The first document, for replies that must carry exactly one.
	pub fn single_document<T: DeserializeOwned>(&self) -> Result<T> {
		self.documents().next().unwrap_or_else(|| Err(InvalidReplyError::NoDocuments.into()))
	}
}

#[derive(Debug)]
pub struct ReplyDocuments<'a, T> {
	remaining: &'a [u8],
	count:     usize,
	_marker:   PhantomData<fn() -> T>
}

impl<'a, T: DeserializeOwned> Iterator for ReplyDocuments<'a, T> {
	type Item = Result<T>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.count == 0 {
			return None;
		}
		self.count -= 1;

		if self.remaining.len() < 4 {
			self.count = 0;
			return Some(Err(InvalidReplyError::Truncated.into()));
		}

		let len = i32::from_le_bytes([self.remaining[0], self.remaining[1], self.remaining[2], self.remaining[3]]);
		if len < 5 || len as usize > self.remaining.len() {
			self.count = 0;
			return Some(Err(InvalidReplyError::Truncated.into()));
		}

		let (document, rest) = self.remaining.split_at(len as usize);
		self.remaining = rest;
		Some(bson::from_slice(document).map_err(Error::from))
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		(0, Some(self.count))
	}
}

/// A decoded request, as seen from the server side of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
	Query(QueryMessage),
	GetMore(GetMoreMessage),
	Insert(InsertMessage<Document>),
	Update(UpdateMessage),
	Delete(DeleteMessage),
	KillCursors(KillCursorsMessage)
}

impl Request {
	pub fn request_id(&self) -> i32 {
		match self {
			Self::Query(m)       => m.request_id,
			Self::GetMore(m)     => m.request_id,
			Self::Insert(m)      => m.request_id,
			Self::Update(m)      => m.request_id,
			Self::Delete(m)      => m.request_id,
			Self::KillCursors(m) => m.request_id
		}
	}

	pub fn read_from(reader: &mut impl Read) -> Result<Self> {
		let header = Header::read(reader)?;
		if header.message_length < HEADER_SIZE as i32 || header.message_length as usize > MAX_MESSAGE_SIZE {
			return Err(InvalidReplyError::MessageLength(header.message_length).into());
		}

		let mut body = vec![0u8; header.message_length as usize - HEADER_SIZE];
		reader.read_exact(&mut body)?;
		let mut body = BodyReader(&body);
		let request_id = header.request_id;

		Ok(match OpCode::from_i32(header.op_code) {
			Some(OpCode::Query) => {
				let flags = QueryFlags(body.i32()?);
				let namespace = body.namespace()?;
				let skip = body.i32()?;
				let number_to_return = body.i32()?;
				let query = body.document()?;
				let fields = if body.0.is_empty() { None } else { Some(body.document()?) };
				Self::Query(QueryMessage { request_id, namespace, flags, skip, number_to_return, query, fields })
			}
			Some(OpCode::GetMore) => {
				body.i32()?;
				let namespace = body.namespace()?;
				let number_to_return = body.i32()?;
				let cursor_id = body.i64()?;
				Self::GetMore(GetMoreMessage { request_id, namespace, number_to_return, cursor_id })
			}
			Some(OpCode::Insert) => {
				let flags = InsertFlags(body.i32()?);
				let namespace = body.namespace()?;
				let mut documents = Vec::new();
				while !body.0.is_empty() {
					documents.push(body.document()?);
				}
				Self::Insert(InsertMessage { request_id, namespace, flags, documents })
			}
			Some(OpCode::Update) => {
				body.i32()?;
				let namespace = body.namespace()?;
				let flags = UpdateFlags(body.i32()?);
				let selector = body.document()?;
				let update = body.document()?;
				Self::Update(UpdateMessage { request_id, namespace, flags, selector, update })
			}
			Some(OpCode::Delete) => {
				body.i32()?;
				let namespace = body.namespace()?;
				let flags = DeleteFlags(body.i32()?);
				let selector = body.document()?;
				Self::Delete(DeleteMessage { request_id, namespace, flags, selector })
			}
			Some(OpCode::KillCursors) => {
				body.i32()?;
				let count = body.i32()?;
				let cursor_ids = (0..count).map(|_| body.i64()).collect::<Result<_>>()?;
				Self::KillCursors(KillCursorsMessage { request_id, cursor_ids })
			}
			_ => return Err(InvalidReplyError::OpCode(header.op_code).into())
		})
	}
}

struct BodyReader<'a>(&'a [u8]);

impl<'a> BodyReader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		if self.0.len() < n {
			return Err(InvalidReplyError::Truncated.into());
		}
		let (head, rest) = self.0.split_at(n);
		self.0 = rest;
		Ok(head)
	}

	fn i32(&mut self) -> Result<i32> {
		let b = self.take(4)?;
		Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}

	fn i64(&mut self) -> Result<i64> {
		let b = self.take(8)?;
		Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
	}

	fn namespace(&mut self) -> Result<CollectionNamespace> {
		let end = self.0.iter().position(|b| *b == 0).ok_or(InvalidReplyError::Truncated)?;
		let name = String::from_utf8_lossy(self.take(end)?).into_owned();
		self.take(1)?;
		name.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid namespace").into())
	}

	fn document(&mut self) -> Result<Document> {
		if self.0.len() < 4 {
			return Err(InvalidReplyError::Truncated.into());
		}
		let len = i32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
		if len < 5 {
			return Err(InvalidReplyError::Truncated.into());
		}
		Ok(bson::from_slice(self.take(len as usize)?)?)
	}
}

#[cfg(test)]
mod tests {
	use {super::*, bson::doc};

	fn ns() -> CollectionNamespace {
		CollectionNamespace::new("test", "coll")
	}

	fn encode(message: &impl RequestMessage) -> Vec<u8> {
		let mut buf = MessageBuffer::new();
		buf.add(message).unwrap();
		buf.as_bytes().to_vec()
	}

	#[test]
	fn query_is_bit_exact() {
		let bytes = encode(&QueryMessage {
			request_id:       7,
			namespace:        CollectionNamespace::new("a", "b"),
			flags:            QueryFlags::SLAVE_OK,
			skip:             1,
			number_to_return: -1,
			query:            doc! {},
			fields:           None
		});

		// header 16, flags 4, "a.b\0" 4, skip 4, return 4, empty document 5
		let mut expected = Vec::new();
		expected.extend_from_slice(&37i32.to_le_bytes());
		expected.extend_from_slice(&7i32.to_le_bytes());
		expected.extend_from_slice(&0i32.to_le_bytes());
		expected.extend_from_slice(&2004i32.to_le_bytes());
		expected.extend_from_slice(&4i32.to_le_bytes());
		expected.extend_from_slice(b"a.b\0");
		expected.extend_from_slice(&1i32.to_le_bytes());
		expected.extend_from_slice(&(-1i32).to_le_bytes());
		expected.extend_from_slice(&[5, 0, 0, 0, 0]);
		assert_eq!(bytes, expected);
	}

	#[test]
	fn requests_round_trip() {
		let messages = vec![
			Request::Query(QueryMessage {
				request_id:       next_request_id(),
				namespace:        ns(),
				flags:            QueryFlags::TAILABLE_CURSOR | QueryFlags::AWAIT_DATA,
				skip:             3,
				number_to_return: 10,
				query:            doc! { "x": 1 },
				fields:           Some(doc! { "_id": 0 })
			}),
			Request::GetMore(GetMoreMessage {
				request_id:       next_request_id(),
				namespace:        ns(),
				number_to_return: 5,
				cursor_id:        0x1234_5678_9abc
			}),
			Request::Insert(InsertMessage {
				request_id: next_request_id(),
				namespace:  ns(),
				flags:      InsertFlags::CONTINUE_ON_ERROR,
				documents:  vec![doc! { "a": 1 }, doc! { "b": "two" }]
			}),
			Request::Update(UpdateMessage {
				request_id: next_request_id(),
				namespace:  ns(),
				flags:      UpdateFlags::UPSERT | UpdateFlags::MULTI,
				selector:   doc! { "a": 1 },
				update:     doc! { "$set": { "a": 2 } }
			}),
			Request::Delete(DeleteMessage {
				request_id: next_request_id(),
				namespace:  ns(),
				flags:      DeleteFlags::SINGLE,
				selector:   doc! { "a": 2 }
			}),
			Request::KillCursors(KillCursorsMessage {
				request_id: next_request_id(),
				cursor_ids: vec![1, 2, 3]
			})
		];

		let mut buf = MessageBuffer::new();
		for message in &messages {
			match message {
				Request::Query(m)       => buf.add(m),
				Request::GetMore(m)     => buf.add(m),
				Request::Insert(m)      => buf.add(m),
				Request::Update(m)      => buf.add(m),
				Request::Delete(m)      => buf.add(m),
				Request::KillCursors(m) => buf.add(m)
			}.unwrap();
		}
		assert_eq!(buf.request_ids(), messages.iter().map(Request::request_id).collect::<Vec<_>>().as_slice());

		let mut reader = io::Cursor::new(buf.as_bytes());
		for message in &messages {
			assert_eq!(&Request::read_from(&mut reader).unwrap(), message);
		}
		assert_eq!(reader.position() as usize, buf.len());
	}

	#[test]
	fn insert_writer_removes_last_document() {
		let mut buf = MessageBuffer::new();
		let request_id = next_request_id();
		let mut writer = buf.begin_insert(request_id, &ns(), InsertFlags::NONE).unwrap();
		let first = writer.append(&doc! { "n": 1 }).unwrap();
		let before = writer.message_length();
		let second = writer.append(&doc! { "n": 2, "pad": "xxxxxxxx" }).unwrap();
		assert_eq!(writer.message_length(), before + second);
		assert_eq!(writer.remove_last(), Some(second));
		assert_eq!(writer.message_length(), before);
		assert_eq!(writer.document_count(), 1);
		writer.finish().unwrap();

		assert_eq!(buf.len(), HEADER_SIZE + 4 + "test.coll\0".len() + first);
		match Request::read_from(&mut io::Cursor::new(buf.as_bytes())).unwrap() {
			Request::Insert(m) => {
				assert_eq!(m.request_id, request_id);
				assert_eq!(m.documents, vec![doc! { "n": 1 }]);
			}
			other => panic!("unexpected request {:?}", other)
		}
	}

	#[test]
	fn reply_round_trip_and_lazy_documents() {
		let reply = ReplyMessage::new(42, ResponseFlags::AWAIT_CAPABLE, 99, 0,
			&[doc! { "a": 1 }, doc! { "a": 2 }, doc! { "a": 3 }]).unwrap();
		let mut bytes = Vec::new();
		reply.write_to(&mut bytes).unwrap();

		let read = ReplyMessage::read_from(&mut io::Cursor::new(&bytes), 1024).unwrap();
		assert_eq!(read, reply);
		read.expect_response_to(42).unwrap();
		assert!(matches!(read.expect_response_to(41),
			Err(Error::InvalidReply(InvalidReplyError::ResponseTo { expected: 41, actual: 42 }))));

		let mut documents = read.documents::<Document>();
		assert_eq!(documents.next().unwrap().unwrap(), doc! { "a": 1 });
		assert_eq!(documents.size_hint(), (0, Some(2)));
		assert_eq!(documents.map(|d| d.unwrap().get_i32("a").unwrap()).collect::<Vec<_>>(), vec![2, 3]);
	}

	#[test]
	fn reply_rejects_wrong_op_code_and_length() {
		let bytes = encode(&KillCursorsMessage { request_id: 1, cursor_ids: vec![] });
		assert!(matches!(ReplyMessage::read_from(&mut io::Cursor::new(&bytes), 1024),
			Err(Error::InvalidReply(InvalidReplyError::OpCode(2007)))));

		let reply = ReplyMessage::new(1, ResponseFlags::NONE, 0, 0, &[doc! { "big": "x".repeat(100) }]).unwrap();
		let mut bytes = Vec::new();
		reply.write_to(&mut bytes).unwrap();
		assert!(matches!(ReplyMessage::read_from(&mut io::Cursor::new(&bytes), 64),
			Err(Error::InvalidReply(InvalidReplyError::MessageLength(_)))));
	}

	#[test]
	fn requests_with_impossible_lengths_are_rejected() {
		for length in [-1i32, 0, 15, MAX_MESSAGE_SIZE as i32 + 1] {
			let mut bytes = Vec::new();
			bytes.extend_from_slice(&length.to_le_bytes());
			bytes.extend_from_slice(&1i32.to_le_bytes());
			bytes.extend_from_slice(&0i32.to_le_bytes());
			bytes.extend_from_slice(&2004i32.to_le_bytes());
			assert!(matches!(Request::read_from(&mut io::Cursor::new(&bytes)),
				Err(Error::InvalidReply(InvalidReplyError::MessageLength(len))) if len == length));
		}

		let mut bytes = Vec::new();
		bytes.extend_from_slice(&(-20i32).to_le_bytes());
		bytes.extend_from_slice(&[0; 8]);
		bytes.extend_from_slice(&1i32.to_le_bytes());
		assert!(matches!(ReplyMessage::read_from(&mut io::Cursor::new(&bytes), MAX_MESSAGE_SIZE),
			Err(Error::InvalidReply(InvalidReplyError::MessageLength(-20)))));
	}

	#[test]
	fn query_failure_carries_the_error_document() {
		let reply = ReplyMessage::new(1, ResponseFlags::QUERY_FAILURE, 0, 0,
			&[doc! { "$err": "bad query", "code": 2 }]).unwrap();
		match reply.check_query_failure() {
			Err(Error::QueryFailure(doc)) => assert_eq!(doc.get_str("$err").unwrap(), "bad query"),
			other => panic!("unexpected result {:?}", other)
		}

		let empty = ReplyMessage::new(1, ResponseFlags::QUERY_FAILURE, 0, 0, &[]).unwrap();
		assert!(matches!(empty.check_query_failure(), Err(Error::InvalidReply(InvalidReplyError::NoDocuments))));
		assert!(matches!(empty.single_document::<Document>(), Err(Error::InvalidReply(InvalidReplyError::NoDocuments))));
	}

	#[test]
	fn truncated_documents_are_reported() {
		let mut reply = ReplyMessage::new(1, ResponseFlags::NONE, 0, 0, &[doc! { "a": 1 }]).unwrap();
		reply.number_returned = 2;
		let mut documents = reply.documents::<Document>();
		assert!(documents.next().unwrap().is_ok());
		assert!(matches!(documents.next(), Some(Err(Error::InvalidReply(InvalidReplyError::Truncated)))));
		assert!(documents.next().is_none());
	}

	#[test]
	fn flags() {
		let mut flags = QueryFlags::SLAVE_OK | QueryFlags::TAILABLE_CURSOR;
		assert!(flags.contains(QueryFlags::SLAVE_OK));
		flags.set(QueryFlags::SLAVE_OK, false);
		assert_eq!(flags, QueryFlags::TAILABLE_CURSOR);
		assert!(!flags.contains(QueryFlags::SLAVE_OK | QueryFlags::TAILABLE_CURSOR));
	}
}
