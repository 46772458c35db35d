//! HTTP/2 stream management
//!
//! Per-stream lifecycle as defined in RFC 7540 Section 5.1, plus the
//! registry that maps stream identifiers to their state. The registry is a
//! sparse map: closed streams keep a small record so late frames resolve
//! deterministically, and identifiers below the peer's high-water mark
//! that were never seen synthesise a closed record on demand.

use crate::error::{Error, Result};
use crate::headers::Header;
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Reserved (local): PUSH_PROMISE sent
    ReservedLocal,
    /// Reserved (remote): PUSH_PROMISE received
    ReservedRemote,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct Stream {
    /// Stream ID
    id: StreamId,
    /// Stream state
    state: StreamState,
    /// Stream priority
    priority: u32,
    /// Decoded header list, attached when a header block completes
    headers: Vec<Header>,
    /// Accumulated body data
    body: Vec<u8>,
    /// Frames sent on this stream
    frames_sent: u64,
    /// Frames received on this stream
    frames_received: u64,
    /// Whether we already emitted a RST_STREAM for this stream
    was_rst_sent: bool,
}

impl Stream {
    /// Create a new idle stream
    pub fn new(id: StreamId, priority: u32) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            priority,
            headers: Vec::new(),
            body: Vec::new(),
            frames_sent: 0,
            frames_received: 0,
            was_rst_sent: false,
        }
    }

    fn closed(id: StreamId, priority: u32) -> Self {
        let mut stream = Self::new(id, priority);
        stream.state = StreamState::Closed;
        stream
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Get priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Set priority; legal in any state, including closed
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Decoded headers attached to this stream
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Attach a decoded header list
    pub fn set_headers(&mut self, headers: Vec<Header>) {
        self.headers = headers;
    }

    /// Get accumulated body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take body (consumes the body data)
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Append DATA payload to the body
    pub fn push_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Frames sent counter
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames received counter
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Count one outbound frame
    pub fn record_frame_sent(&mut self) {
        self.frames_sent += 1;
    }

    /// Count one inbound frame
    pub fn record_frame_received(&mut self) {
        self.frames_received += 1;
    }

    /// Whether a RST_STREAM was already emitted for this stream
    pub fn was_rst_sent(&self) -> bool {
        self.was_rst_sent
    }

    /// Record the single permitted RST_STREAM emission
    ///
    /// Returns false if one was already recorded.
    pub fn mark_rst_sent(&mut self) -> bool {
        if self.was_rst_sent {
            return false;
        }
        self.was_rst_sent = true;
        true
    }

    /// State transition for sending a complete header block
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedLocal => {
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedRemote
                };
            }
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedLocal;
                }
            }
            StreamState::HalfClosedRemote => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
            }
            _ => {
                return Err(Error::StreamProtocol(
                    self.id,
                    format!("cannot send HEADERS in state {:?}", self.state),
                ));
            }
        }
        Ok(())
    }

    /// State transition for receiving a complete header block
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedRemote => {
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedLocal
                };
            }
            StreamState::Open => {
                // Trailers
                if end_stream {
                    self.state = StreamState::HalfClosedRemote;
                }
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
            }
            _ => return Err(Error::StreamClosed(self.id)),
        }
        Ok(())
    }

    /// State transition for sending DATA
    pub fn send_data(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }
        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => StreamState::Closed,
                _ => self.state,
            };
        }
        Ok(())
    }

    /// State transition for receiving DATA
    pub fn receive_data(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => self.state,
            };
        }
        Ok(())
    }

    /// Transition into reserved (remote) after a PUSH_PROMISE
    pub fn reserve_remote(&mut self) -> Result<()> {
        if self.state != StreamState::Idle {
            return Err(Error::StreamProtocol(
                self.id,
                format!("cannot reserve stream in state {:?}", self.state),
            ));
        }
        self.state = StreamState::ReservedRemote;
        Ok(())
    }

    /// Close the stream
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }
}

/// Stream registry
///
/// Maps stream identifiers to streams for a single connection and enforces
/// the identifier rules: client ids odd, server ids even, strictly
/// increasing per direction.
#[derive(Debug)]
pub struct StreamRegistry {
    /// Registered streams, closed records included
    streams: HashMap<StreamId, Stream>,
    /// Next locally initiated stream ID (client: odd, server: even)
    next_stream_id: StreamId,
    /// True when the local endpoint is the client
    is_client: bool,
    /// Highest locally initiated stream ID
    last_local_id: StreamId,
    /// Highest peer-initiated (or peer-promised) stream ID
    last_peer_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS
    remote_max_concurrent: Option<u32>,
    /// Our SETTINGS_MAX_CONCURRENT_STREAMS
    local_max_concurrent: Option<u32>,
    /// Default priority for streams created by frame arrival
    default_priority: u32,
}

impl StreamRegistry {
    /// Create a new registry
    ///
    /// # Arguments
    /// * `is_client` - True if this is a client (odd stream IDs), false for server (even)
    pub fn new(is_client: bool, default_priority: u32) -> Self {
        StreamRegistry {
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            is_client,
            last_local_id: 0,
            last_peer_id: 0,
            remote_max_concurrent: None,
            local_max_concurrent: None,
            default_priority,
        }
    }

    /// Set the peer's concurrency limit
    pub fn set_remote_max_concurrent(&mut self, max: Option<u32>) {
        self.remote_max_concurrent = max;
    }

    /// Set the local concurrency limit
    pub fn set_local_max_concurrent(&mut self, max: Option<u32>) {
        self.local_max_concurrent = max;
    }

    /// Highest locally initiated stream ID (0 if none)
    pub fn last_local_id(&self) -> StreamId {
        self.last_local_id
    }

    /// Highest peer-initiated stream ID (0 if none)
    pub fn last_peer_id(&self) -> StreamId {
        self.last_peer_id
    }

    /// Number of streams not yet closed
    pub fn active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state().is_closed())
            .count()
    }

    /// All registered stream IDs
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Get a stream by ID
    pub fn get(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    /// Get a mutable stream by ID
    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Open the next locally initiated stream
    pub fn create_outbound(&mut self, priority: u32) -> Result<StreamId> {
        if let Some(max) = self.remote_max_concurrent {
            if self.active_count() >= max as usize {
                return Err(Error::TooManyStreams);
            }
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.last_local_id = stream_id;

        self.streams.insert(stream_id, Stream::new(stream_id, priority));
        Ok(stream_id)
    }

    /// Register a peer-initiated stream
    ///
    /// Validates that the identifier's parity matches the peer's role and
    /// that it is strictly greater than every prior peer-opened id.
    pub fn create_inbound(&mut self, stream_id: StreamId) -> Result<&mut Stream> {
        let peer_parity = if self.is_client { 0 } else { 1 };
        if stream_id == 0 || stream_id % 2 != peer_parity {
            return Err(Error::Protocol(format!(
                "peer-initiated stream {} has wrong parity",
                stream_id
            )));
        }
        if stream_id <= self.last_peer_id {
            return Err(Error::Protocol(format!(
                "peer-initiated stream {} is not greater than {}",
                stream_id, self.last_peer_id
            )));
        }
        self.last_peer_id = stream_id;

        let priority = self.default_priority;
        Ok(self
            .streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, priority)))
    }

    /// Register a server-promised stream (client side)
    pub fn create_reserved(&mut self, promised_id: StreamId) -> Result<&mut Stream> {
        if promised_id == 0 || promised_id % 2 != 0 {
            return Err(Error::Protocol(format!(
                "promised stream {} must be even",
                promised_id
            )));
        }
        if promised_id <= self.last_peer_id {
            return Err(Error::Protocol(format!(
                "promised stream {} is not greater than {}",
                promised_id, self.last_peer_id
            )));
        }
        self.last_peer_id = promised_id;

        let priority = self.default_priority;
        let stream = self
            .streams
            .entry(promised_id)
            .or_insert_with(|| Stream::new(promised_id, priority));
        stream.reserve_remote()?;
        Ok(stream)
    }

    /// Resolve a frame's stream, synthesising a closed record for
    /// identifiers that were never registered
    ///
    /// Late frames on unregistered ids are treated as frames on a closed
    /// stream so the reply path always has a record to consult.
    pub fn lookup_or_synthesize(&mut self, stream_id: StreamId) -> &mut Stream {
        let priority = self.default_priority;
        self.streams
            .entry(stream_id)
            .or_insert_with(|| Stream::closed(stream_id, priority))
    }

    /// Mark a stream closed, keeping its record
    pub fn close_stream(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.close();
        }
    }

    /// Close every registered stream
    pub fn close_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.close();
        }
    }

    /// Close locally initiated streams above the GOAWAY last-stream-id;
    /// the peer never processed them
    pub fn prune_after_goaway(&mut self, last_stream_id: StreamId) {
        let local_parity = if self.is_client { 1 } else { 0 };
        for stream in self.streams.values_mut() {
            if stream.id() % 2 == local_parity && stream.id() > last_stream_id {
                stream.close();
            }
        }
    }

    /// Materialise stream 1 for an HTTP/1.1 upgrade hand-off
    ///
    /// On the client the upgraded request was already sent, so stream 1 is
    /// half-closed (local) and the next usable id is 3; on the server the
    /// mirror image holds.
    pub fn install_upgrade_stream(&mut self) -> &mut Stream {
        let mut stream = Stream::new(1, self.default_priority);
        if self.is_client {
            stream.state = StreamState::HalfClosedLocal;
            self.last_local_id = 1;
            self.next_stream_id = 3;
        } else {
            stream.state = StreamState::HalfClosedRemote;
            self.last_peer_id = 1;
        }
        self.streams.insert(1, stream);
        self.streams.get_mut(&1).expect("stream 1 just inserted")
    }

    /// Drop records of closed streams
    pub fn prune_closed(&mut self) {
        self.streams.retain(|_, stream| !stream.state().is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_STREAM_PRIORITY;

    fn registry(is_client: bool) -> StreamRegistry {
        StreamRegistry::new(is_client, DEFAULT_STREAM_PRIORITY)
    }

    #[test]
    fn test_stream_state_transitions() {
        let mut stream = Stream::new(1, DEFAULT_STREAM_PRIORITY);
        assert_eq!(stream.state(), StreamState::Idle);

        // Idle -> Open (send HEADERS without END_STREAM)
        stream.send_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::Open);

        // Open -> HalfClosedLocal (send DATA with END_STREAM)
        stream.send_data(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);

        // HalfClosedLocal -> Closed (receive END_STREAM)
        stream.receive_data(true).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_stream_never_moves_backwards() {
        let mut stream = Stream::new(1, DEFAULT_STREAM_PRIORITY);
        stream.send_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);

        // Sending after END_STREAM is a closed-stream error
        assert!(matches!(stream.send_data(false), Err(Error::StreamClosed(1))));
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[test]
    fn test_reserved_remote_to_half_closed_local() {
        let mut stream = Stream::new(2, DEFAULT_STREAM_PRIORITY);
        stream.reserve_remote().unwrap();
        assert_eq!(stream.state(), StreamState::ReservedRemote);

        stream.receive_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[test]
    fn test_receive_on_closed_stream() {
        let mut stream = Stream::new(1, DEFAULT_STREAM_PRIORITY);
        stream.close();

        assert!(matches!(stream.receive_data(false), Err(Error::StreamClosed(1))));
        assert!(matches!(
            stream.receive_headers(false),
            Err(Error::StreamClosed(1))
        ));
        // Priority updates stay legal after close
        stream.set_priority(5);
        assert_eq!(stream.priority(), 5);
    }

    #[test]
    fn test_rst_sent_only_once() {
        let mut stream = Stream::new(1, DEFAULT_STREAM_PRIORITY);
        assert!(stream.mark_rst_sent());
        assert!(!stream.mark_rst_sent());
        assert!(stream.was_rst_sent());
    }

    #[test]
    fn test_registry_client_ids() {
        let mut reg = registry(true);
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 1);
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 3);
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 5);
        assert_eq!(reg.last_local_id(), 5);
        assert_eq!(reg.active_count(), 3);
    }

    #[test]
    fn test_registry_server_ids() {
        let mut reg = registry(false);
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 2);
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 4);
    }

    #[test]
    fn test_registry_max_concurrent() {
        let mut reg = registry(true);
        reg.set_remote_max_concurrent(Some(2));

        reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap();
        reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap();

        let result = reg.create_outbound(DEFAULT_STREAM_PRIORITY);
        assert!(matches!(result, Err(Error::TooManyStreams)));
    }

    #[test]
    fn test_inbound_parity_and_monotonicity() {
        // Server accepting client streams: odd, strictly increasing
        let mut reg = registry(false);
        reg.create_inbound(1).unwrap();
        reg.create_inbound(5).unwrap();

        assert!(matches!(reg.create_inbound(4), Err(Error::Protocol(_))));
        assert!(matches!(reg.create_inbound(3), Err(Error::Protocol(_))));
        assert!(matches!(reg.create_inbound(5), Err(Error::Protocol(_))));
        assert_eq!(reg.last_peer_id(), 5);
    }

    #[test]
    fn test_reserved_stream_parity() {
        let mut reg = registry(true);
        let stream = reg.create_reserved(2).unwrap();
        assert_eq!(stream.state(), StreamState::ReservedRemote);

        assert!(matches!(reg.create_reserved(3), Err(Error::Protocol(_))));
        assert!(matches!(reg.create_reserved(2), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_lookup_synthesizes_closed_record() {
        let mut reg = registry(false);
        let stream = reg.lookup_or_synthesize(7);
        assert_eq!(stream.state(), StreamState::Closed);

        // Same record on the next lookup
        assert!(reg.lookup_or_synthesize(7).mark_rst_sent());
        assert!(!reg.lookup_or_synthesize(7).mark_rst_sent());
    }

    #[test]
    fn test_upgrade_stream_client() {
        let mut reg = registry(true);
        let stream = reg.install_upgrade_stream();
        assert_eq!(stream.id(), 1);
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);

        // First usable id after the upgrade is 3
        assert_eq!(reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(), 3);
    }

    #[test]
    fn test_upgrade_stream_server() {
        let mut reg = registry(false);
        let stream = reg.install_upgrade_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert_eq!(reg.last_peer_id(), 1);
    }

    #[test]
    fn test_prune_after_goaway() {
        let mut reg = registry(true);
        reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(); // 1
        reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(); // 3
        reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap(); // 5

        reg.prune_after_goaway(3);
        assert!(!reg.get(1).unwrap().state().is_closed());
        assert!(!reg.get(3).unwrap().state().is_closed());
        assert!(reg.get(5).unwrap().state().is_closed());
    }

    #[test]
    fn test_prune_closed() {
        let mut reg = registry(true);
        let id1 = reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap();
        let id2 = reg.create_outbound(DEFAULT_STREAM_PRIORITY).unwrap();

        reg.close_stream(id1);
        assert_eq!(reg.active_count(), 1);

        reg.prune_closed();
        assert!(reg.get(id1).is_none());
        assert!(reg.get(id2).is_some());
    }
}
