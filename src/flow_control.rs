//! HTTP/2 flow control
//!
//! Flow control is applied at both the connection and stream level
//! (RFC 7540 Section 5.2). The [`FlowControlManager`] owns the connection
//! windows and the per-stream window table; the session's write pump asks
//! it for send credit and the read pump debits receive windows and applies
//! WINDOW_UPDATE credits.

use crate::error::{Error, Result};
use crate::DEFAULT_INITIAL_WINDOW_SIZE;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Flow control window
///
/// Tracks the available window size for one direction of transfer.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (can be negative if over-committed)
    current_size: i64,
    /// Maximum window size allowed (2^31 - 1)
    max_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
            max_size: 0x7FFF_FFFF,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Check if window can send specified amount
    pub fn can_send(&self, amount: usize) -> bool {
        self.current_size >= amount as i64
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the actual amount that can be sent (may be less than requested)
    pub fn consume(&mut self, amount: usize) -> usize {
        if amount == 0 || self.current_size <= 0 {
            return 0;
        }

        let to_send = std::cmp::min(amount as i64, self.current_size) as usize;
        self.current_size -= to_send as i64;
        to_send
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1
        if new_size > self.max_size {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS
    ///
    /// The signed difference is applied to the current window size.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > self.max_size {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;

        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send/receive window pair for one stream
#[derive(Debug)]
struct StreamWindows {
    send: FlowControlWindow,
    recv: FlowControlWindow,
}

#[derive(Debug)]
struct Inner {
    /// Connection-level send window (outbound data)
    conn_send: FlowControlWindow,
    /// Connection-level receive window (inbound data)
    conn_recv: FlowControlWindow,
    /// Per-stream windows, registered alongside the stream registry
    streams: HashMap<u32, StreamWindows>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, used for new streams
    initial_send: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE, used for new streams
    initial_recv: u32,
}

/// Connection and per-stream flow-control state, shared between the pumps
/// and public callers. All mutations are serialized behind one lock.
#[derive(Debug)]
pub struct FlowControlManager {
    inner: Mutex<Inner>,
}

impl FlowControlManager {
    /// Create a manager with default initial window sizes
    pub fn new() -> Self {
        Self::with_initial_sizes(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a manager with specified initial window sizes
    pub fn with_initial_sizes(send_size: u32, recv_size: u32) -> Self {
        FlowControlManager {
            inner: Mutex::new(Inner {
                conn_send: FlowControlWindow::with_initial_size(send_size),
                conn_recv: FlowControlWindow::with_initial_size(recv_size),
                streams: HashMap::new(),
                initial_send: send_size,
                initial_recv: recv_size,
            }),
        }
    }

    /// Register windows for a newly opened stream
    pub fn register_stream(&self, stream_id: u32) {
        let mut inner = self.inner.lock();
        let send = FlowControlWindow::with_initial_size(inner.initial_send);
        let recv = FlowControlWindow::with_initial_size(inner.initial_recv);
        inner.streams.insert(stream_id, StreamWindows { send, recv });
    }

    /// Drop windows for a closed stream
    pub fn forget_stream(&self, stream_id: u32) {
        self.inner.lock().streams.remove(&stream_id);
    }

    /// Send credit currently available on a stream
    ///
    /// The answer to "may I send N bytes on stream S": the usable credit is
    /// the smaller of the connection window and the stream window.
    pub fn available_send(&self, stream_id: u32) -> usize {
        let inner = self.inner.lock();
        let conn = inner.conn_send.size().max(0);
        let stream = inner
            .streams
            .get(&stream_id)
            .map(|w| w.send.size().max(0))
            .unwrap_or(0);
        conn.min(stream) as usize
    }

    /// Reserve up to `amount` bytes of send credit on a stream
    ///
    /// Both the connection and the stream window are debited by the granted
    /// amount, which may be smaller than requested (including zero).
    pub fn reserve_send(&self, stream_id: u32, amount: usize) -> usize {
        let mut inner = self.inner.lock();
        let conn_avail = inner.conn_send.size().max(0) as usize;
        let stream_avail = match inner.streams.get(&stream_id) {
            Some(w) => w.send.size().max(0) as usize,
            None => return 0,
        };

        let granted = amount.min(conn_avail).min(stream_avail);
        if granted > 0 {
            inner.conn_send.consume(granted);
            if let Some(w) = inner.streams.get_mut(&stream_id) {
                w.send.consume(granted);
            }
        }
        granted
    }

    /// Debit receive windows for inbound DATA
    pub fn debit_recv(&self, stream_id: u32, amount: usize) {
        let mut inner = self.inner.lock();
        inner.conn_recv.decrease(amount);
        if let Some(w) = inner.streams.get_mut(&stream_id) {
            w.recv.decrease(amount);
        }
    }

    /// Apply a WINDOW_UPDATE credit to the connection send window
    pub fn credit_connection(&self, increment: u32) -> Result<()> {
        if increment == 0 {
            return Err(Error::Protocol(
                "WINDOW_UPDATE increment must be non-zero".to_string(),
            ));
        }
        self.inner.lock().conn_send.increase(increment)?;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE credit to a stream's send window
    ///
    /// Updates for unknown streams are ignored; the frame may have been in
    /// flight while the stream closed.
    pub fn credit_stream(&self, stream_id: u32, increment: u32) -> Result<()> {
        if increment == 0 {
            return Err(Error::StreamProtocol(
                stream_id,
                "WINDOW_UPDATE increment must be non-zero".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        if let Some(w) = inner.streams.get_mut(&stream_id) {
            w.send.increase(increment)?;
        }
        Ok(())
    }

    /// Replenish the connection receive window after the embedder sends a
    /// connection WINDOW_UPDATE
    pub fn replenish_connection_recv(&self, increment: u32) -> Result<()> {
        self.inner.lock().conn_recv.increase(increment)?;
        Ok(())
    }

    /// Replenish a stream's receive window after the embedder sends a
    /// stream WINDOW_UPDATE
    pub fn replenish_stream_recv(&self, stream_id: u32, increment: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(w) = inner.streams.get_mut(&stream_id) {
            w.recv.increase(increment)?;
        }
        Ok(())
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE change
    ///
    /// The signed delta is applied to every currently registered stream's
    /// send window; new streams start at the new value.
    pub fn set_initial_send_window(&self, new_size: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.initial_send = new_size;
        for w in inner.streams.values_mut() {
            w.send.update_initial_size(new_size)?;
        }
        Ok(())
    }

    /// Current connection send window size
    pub fn connection_send_window(&self) -> i64 {
        self.inner.lock().conn_send.size()
    }

    /// Current connection receive window size
    pub fn connection_recv_window(&self) -> i64 {
        self.inner.lock().conn_recv.size()
    }

    /// Current send window size for a stream
    pub fn stream_send_window(&self, stream_id: u32) -> Option<i64> {
        self.inner.lock().streams.get(&stream_id).map(|w| w.send.size())
    }

    /// Current receive window size for a stream
    pub fn stream_recv_window(&self, stream_id: u32) -> Option<i64> {
        self.inner.lock().streams.get(&stream_id).map(|w| w.recv.size())
    }
}

impl Default for FlowControlManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_basic() {
        let window = FlowControlWindow::new();
        assert_eq!(window.size(), DEFAULT_INITIAL_WINDOW_SIZE as i64);
        assert!(window.can_send(1000));
    }

    #[test]
    fn test_flow_control_window_consume() {
        let mut window = FlowControlWindow::with_initial_size(100);
        assert_eq!(window.size(), 100);

        assert_eq!(window.consume(50), 50);
        assert_eq!(window.size(), 50);

        assert_eq!(window.consume(60), 50); // Only 50 available
        assert_eq!(window.size(), 0);

        assert_eq!(window.consume(10), 0); // No capacity
    }

    #[test]
    fn test_flow_control_window_overflow() {
        let mut window = FlowControlWindow::with_initial_size(0x7FFF_FFFF);
        let result = window.increase(1);
        assert!(result.is_err());
    }

    #[test]
    fn test_flow_control_window_update_initial_size() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50);
        assert_eq!(window.size(), 50);

        // Increase initial size by 100
        window.update_initial_size(200).unwrap();
        assert_eq!(window.initial_size(), 200);
        assert_eq!(window.size(), 150);

        // Decrease initial size by 50
        window.update_initial_size(150).unwrap();
        assert_eq!(window.initial_size(), 150);
        assert_eq!(window.size(), 100);
    }

    #[test]
    fn test_reserve_send_is_min_of_both_windows() {
        let flow = FlowControlManager::with_initial_sizes(1000, 1000);
        flow.register_stream(1);

        // Stream window is the limiting factor after a partial grant
        assert_eq!(flow.reserve_send(1, 600), 600);
        assert_eq!(flow.stream_send_window(1), Some(400));
        assert_eq!(flow.connection_send_window(), 400);

        // Request above both windows is clipped
        assert_eq!(flow.reserve_send(1, 500), 400);
        assert_eq!(flow.reserve_send(1, 1), 0);
    }

    #[test]
    fn test_connection_window_shared_across_streams() {
        let flow = FlowControlManager::with_initial_sizes(1000, 1000);
        flow.register_stream(1);
        flow.register_stream(3);

        assert_eq!(flow.reserve_send(1, 800), 800);
        // Stream 3 has a full stream window but the connection only has 200
        assert_eq!(flow.reserve_send(3, 800), 200);
        assert_eq!(flow.connection_send_window(), 0);
    }

    #[test]
    fn test_credit_zero_increment() {
        let flow = FlowControlManager::new();
        flow.register_stream(1);

        assert!(matches!(
            flow.credit_connection(0),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            flow.credit_stream(1, 0),
            Err(Error::StreamProtocol(1, _))
        ));
    }

    #[test]
    fn test_credit_overflow() {
        let flow = FlowControlManager::new();
        flow.register_stream(1);

        assert!(matches!(
            flow.credit_connection(u32::MAX),
            Err(Error::FlowControl(_))
        ));
        assert!(matches!(
            flow.credit_stream(1, u32::MAX),
            Err(Error::FlowControl(_))
        ));
    }

    #[test]
    fn test_credit_unknown_stream_ignored() {
        let flow = FlowControlManager::new();
        assert!(flow.credit_stream(99, 100).is_ok());
    }

    #[test]
    fn test_initial_window_delta_applies_to_open_streams() {
        let flow = FlowControlManager::with_initial_sizes(100, 100);
        flow.register_stream(1);
        flow.reserve_send(1, 50);
        assert_eq!(flow.stream_send_window(1), Some(50));

        flow.set_initial_send_window(200).unwrap();
        assert_eq!(flow.stream_send_window(1), Some(150));

        flow.set_initial_send_window(100).unwrap();
        assert_eq!(flow.stream_send_window(1), Some(50));

        // New streams start at the new value
        flow.register_stream(3);
        assert_eq!(flow.stream_send_window(3), Some(100));
    }

    #[test]
    fn test_debit_recv() {
        let flow = FlowControlManager::with_initial_sizes(1000, 1000);
        flow.register_stream(1);

        flow.debit_recv(1, 300);
        assert_eq!(flow.connection_recv_window(), 700);
        assert_eq!(flow.stream_recv_window(1), Some(700));

        flow.replenish_connection_recv(300).unwrap();
        assert_eq!(flow.connection_recv_window(), 1000);
    }
}
