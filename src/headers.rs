//! Header block assembly and the header-compression seam
//!
//! A logical header block is one HEADERS (or PUSH_PROMISE) frame plus zero
//! or more CONTINUATION frames, terminated by END_HEADERS. While a block is
//! open on a stream, the only legal next frame on the connection is a
//! CONTINUATION for that stream; the sequencer tracks this and hands the
//! concatenated fragments to the header codec once the block closes.
//!
//! Header compression itself is an external collaborator behind the
//! [`HeaderCodec`] trait; [`HpackCodec`] is the default implementation.

use crate::error::{Error, Result};
use crate::frames::PrioritySpec;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// A single header as a name/value pair of raw octets
pub type Header = (Vec<u8>, Vec<u8>);

/// Pluggable header compression codec
pub trait HeaderCodec: Send {
    /// Encode a header list into a header block
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes>;

    /// Decode a header block into a header list
    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>>;

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    fn set_max_table_size(&mut self, _size: u32) {}
}

/// Default [`HeaderCodec`] backed by the `hpack` crate
pub struct HpackCodec {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    max_table_size: u32,
}

impl HpackCodec {
    /// Create a codec with fresh compression contexts
    pub fn new() -> Self {
        HpackCodec {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            max_table_size: crate::DEFAULT_HEADER_TABLE_SIZE,
        }
    }

    /// The peer-advertised header table size currently in effect
    pub fn max_table_size(&self) -> u32 {
        self.max_table_size
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec for HpackCodec {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes> {
        let tuples: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
            .collect();

        let mut block = Vec::new();
        self.encoder
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }

    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>> {
        self.decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))
    }

    fn set_max_table_size(&mut self, size: u32) {
        self.max_table_size = size;
    }
}

/// Assembly buffer for one logical header block
#[derive(Debug)]
pub struct HeadersSequence {
    /// Stream the block belongs to
    stream_id: u32,
    /// Promised stream id when the block came from a PUSH_PROMISE
    promised_id: Option<u32>,
    /// Fragments in arrival order
    fragments: Vec<Bytes>,
    /// END_STREAM flag from the opening frame
    end_stream: bool,
    /// Priority carried by the opening frame
    priority: Option<PrioritySpec>,
}

impl HeadersSequence {
    fn new(
        stream_id: u32,
        promised_id: Option<u32>,
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) -> Self {
        HeadersSequence {
            stream_id,
            promised_id,
            fragments: Vec::new(),
            end_stream,
            priority,
        }
    }

    /// Stream this sequence is open on
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Concatenate all fragments into the full header block
    pub fn concat(&self) -> Bytes {
        let total: usize = self.fragments.iter().map(|f| f.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for fragment in &self.fragments {
            buf.put_slice(fragment);
        }
        buf.freeze()
    }
}

/// A header block whose terminal END_HEADERS fragment has arrived
#[derive(Debug)]
pub struct CompletedBlock {
    /// Stream the block arrived on
    pub stream_id: u32,
    /// Promised stream id for PUSH_PROMISE blocks
    pub promised_id: Option<u32>,
    /// Concatenated header block, ready for the header codec
    pub block: Bytes,
    /// END_STREAM flag from the opening frame
    pub end_stream: bool,
    /// Priority carried by the opening frame
    pub priority: Option<PrioritySpec>,
}

/// Tracks the open inbound header block and the outbound mirror
///
/// At most one inbound block can be open at a time; opening a second or
/// continuing a different stream is a connection-level protocol error.
#[derive(Debug, Default)]
pub struct HeaderSequencer {
    /// The inbound block currently being assembled
    open: Option<HeadersSequence>,
    /// Completed outbound blocks by stream, a symmetric view of what was sent
    sent: HashMap<u32, Vec<Bytes>>,
    /// The outbound block currently being accumulated
    sending: Option<(u32, BytesMut)>,
}

impl HeaderSequencer {
    /// Create an empty sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream id of the open inbound block, if any
    pub fn open_stream_id(&self) -> Option<u32> {
        self.open.as_ref().map(|s| s.stream_id())
    }

    /// Whether an inbound block is currently open
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Start assembling an inbound block from its opening fragment
    ///
    /// `promised_id` is set for PUSH_PROMISE blocks. Returns the completed
    /// block immediately when the opening fragment carries END_HEADERS.
    pub fn begin(
        &mut self,
        stream_id: u32,
        promised_id: Option<u32>,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
    ) -> Result<Option<CompletedBlock>> {
        if let Some(open) = &self.open {
            return Err(Error::Protocol(format!(
                "header block opened on stream {} while stream {} has one open",
                stream_id,
                open.stream_id()
            )));
        }

        let mut sequence = HeadersSequence::new(stream_id, promised_id, end_stream, priority);
        sequence.fragments.push(fragment);

        if end_headers {
            return Ok(Some(Self::complete(sequence)));
        }

        self.open = Some(sequence);
        Ok(None)
    }

    /// Append a CONTINUATION fragment to the open block
    pub fn append(
        &mut self,
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<Option<CompletedBlock>> {
        let open = self.open.as_mut().ok_or_else(|| {
            Error::Protocol(format!(
                "CONTINUATION on stream {} without an open header block",
                stream_id
            ))
        })?;

        if open.stream_id() != stream_id {
            return Err(Error::Protocol(format!(
                "CONTINUATION on stream {} while stream {} has an open header block",
                stream_id,
                open.stream_id()
            )));
        }

        open.fragments.push(fragment);

        if end_headers {
            let sequence = self.open.take().expect("open sequence checked above");
            return Ok(Some(Self::complete(sequence)));
        }

        Ok(None)
    }

    fn complete(sequence: HeadersSequence) -> CompletedBlock {
        CompletedBlock {
            stream_id: sequence.stream_id,
            promised_id: sequence.promised_id,
            block: sequence.concat(),
            end_stream: sequence.end_stream,
            priority: sequence.priority,
        }
    }

    /// Record an outbound header fragment so the sent side mirrors the
    /// received side
    pub fn record_sent(&mut self, stream_id: u32, fragment: &[u8], end_headers: bool) {
        let (id, buf) = self
            .sending
            .get_or_insert_with(|| (stream_id, BytesMut::new()));
        // Outbound blocks are enqueued atomically, so a mismatch here is a
        // caller bug; restart the record rather than mixing streams.
        if *id != stream_id {
            *id = stream_id;
            buf.clear();
        }
        buf.put_slice(fragment);

        if end_headers {
            let (id, buf) = self.sending.take().expect("sending block just touched");
            self.sent.entry(id).or_default().push(buf.freeze());
        }
    }

    /// Header blocks sent on a stream, in order
    pub fn sent_blocks(&self, stream_id: u32) -> &[Bytes] {
        self.sent.get(&stream_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop all assembly state
    pub fn clear(&mut self) {
        self.open = None;
        self.sending = None;
        self.sent.clear();
    }
}
