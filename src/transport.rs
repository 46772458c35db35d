//! Duplex transport abstraction
//!
//! The session engine never talks to a socket directly; it is constructed
//! around a [`Transport`], any bidirectional byte stream that can be split
//! into a read half (owned by the read pump) and a write half (owned by
//! the write pump). TLS, ALPN and connection establishment happen outside.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

/// Handle that tears a transport down from outside the pumps
///
/// Shutting down must unblock a reader stuck in `read`.
pub struct Shutdown(Box<dyn Fn() + Send + Sync>);

impl Shutdown {
    /// Wrap a teardown action
    pub fn new<F: Fn() + Send + Sync + 'static>(f: F) -> Self {
        Shutdown(Box::new(f))
    }

    /// Tear the transport down
    pub fn shutdown(&self) {
        (self.0)()
    }
}

/// A bidirectional byte stream the session can be built around
pub trait Transport: Send + 'static {
    /// Read half, owned by the read pump
    type Reader: Read + Send + 'static;
    /// Write half, owned by the write pump
    type Writer: Write + Send + 'static;

    /// Split into independently owned halves plus a teardown handle
    fn split(self) -> io::Result<(Self::Reader, Self::Writer, Shutdown)>;
}

impl Transport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, Shutdown)> {
        let writer = self.try_clone()?;
        let closer = self.try_clone()?;
        let shutdown = Shutdown::new(move || {
            let _ = closer.shutdown(std::net::Shutdown::Both);
        });
        Ok((self, writer, shutdown))
    }
}

/// One direction of an in-memory pipe
#[derive(Default)]
struct PipeBuf {
    state: Mutex<PipeState>,
    cond: Condvar,
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

impl PipeBuf {
    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        while state.buf.is_empty() && !state.closed {
            self.cond.wait(&mut state);
        }
        if state.buf.is_empty() {
            return Ok(0); // closed and drained
        }
        let n = out.len().min(state.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = state.buf.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(data);
        self.cond.notify_all();
        Ok(data.len())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// In-memory duplex stream, mainly for tests
///
/// [`pipe`] returns two connected ends; bytes written to one end are read
/// from the other.
pub struct Pipe {
    incoming: Arc<PipeBuf>,
    outgoing: Arc<PipeBuf>,
}

/// Create a connected pair of in-memory duplex streams
pub fn pipe() -> (Pipe, Pipe) {
    let a = Arc::new(PipeBuf::default());
    let b = Arc::new(PipeBuf::default());
    (
        Pipe {
            incoming: a.clone(),
            outgoing: b.clone(),
        },
        Pipe {
            incoming: b,
            outgoing: a,
        },
    )
}

impl Pipe {
    /// Close both directions, unblocking any reader
    pub fn close(&self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.read(buf)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half of a split [`Pipe`]
pub struct PipeReader(Arc<PipeBuf>);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Write half of a split [`Pipe`]
pub struct PipeWriter(Arc<PipeBuf>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Pipe {
    type Reader = PipeReader;
    type Writer = PipeWriter;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, Shutdown)> {
        let incoming = self.incoming;
        let outgoing = self.outgoing;
        let close_in = incoming.clone();
        let close_out = outgoing.clone();
        let shutdown = Shutdown::new(move || {
            close_in.close();
            close_out.close();
        });
        Ok((PipeReader(incoming), PipeWriter(outgoing), shutdown))
    }
}
