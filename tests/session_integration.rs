//! Session integration tests
//!
//! Each test drives a session over an in-memory pipe while the test acts
//! as the raw peer, writing and reading frames directly through the codec.

use bytes::Bytes;
use h2session::codec::FrameCodec;
use h2session::error::{Error, ErrorCode};
use h2session::events::SessionEvent;
use h2session::frames::*;
use h2session::headers::Header;
use h2session::session::{CancelToken, Role, Session};
use h2session::settings::{Settings, SettingsBuilder};
use h2session::stream::StreamState;
use h2session::transport::{pipe, Pipe};
use h2session::{CONNECTION_PREFACE, DEFAULT_STREAM_PRIORITY};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// The raw end of the pipe, driven frame-by-frame by the test
struct RawPeer {
    pipe: Pipe,
    encoder: hpack::Encoder<'static>,
}

impl RawPeer {
    fn new(pipe: Pipe) -> Self {
        RawPeer {
            pipe,
            encoder: hpack::Encoder::new(),
        }
    }

    fn read_preface(&mut self) {
        let mut preface = [0u8; 24];
        self.pipe.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
    }

    fn write_preface(&mut self) {
        self.pipe.write_all(CONNECTION_PREFACE).unwrap();
    }

    fn read_frame(&mut self) -> Frame {
        FrameCodec::read_frame(&mut self.pipe, 1 << 24).unwrap()
    }

    fn write_frame(&mut self, frame: Frame) {
        self.pipe.write_all(&FrameCodec::encode(&frame)).unwrap();
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.pipe.write_all(bytes).unwrap();
    }

    fn encode_headers(&mut self, headers: &[(&[u8], &[u8])]) -> Bytes {
        let mut block = Vec::new();
        self.encoder
            .encode_into(headers.iter().copied(), &mut block)
            .unwrap();
        Bytes::from(block)
    }

    /// Read frames until the pipe closes
    fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match FrameCodec::read_frame(&mut self.pipe, 1 << 24) {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        frames
    }
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn start_client(secure: bool) -> (Session<Pipe>, RawPeer) {
    let (near, far) = pipe();
    let session = Session::new(near, Role::Client, secure, CancelToken::new());
    session.start(None).unwrap();
    (session, RawPeer::new(far))
}

fn start_server(secure: bool) -> (Session<Pipe>, RawPeer) {
    let (near, far) = pipe();
    let session = Session::new(near, Role::Server, secure, CancelToken::new());
    session.start(None).unwrap();
    (session, RawPeer::new(far))
}

/// Consume the client's preface and initial SETTINGS; reply and ack
fn client_handshake(session: &Session<Pipe>, peer: &mut RawPeer, server_settings: Settings) {
    peer.read_preface();

    // Invariant: the client's first frame is its SETTINGS
    match peer.read_frame() {
        Frame::Settings(frame) => assert!(!frame.ack),
        other => panic!("first client frame was {:?}", other),
    }

    peer.write_frame(Frame::Settings(SettingsFrame::new(server_settings)));
    peer.write_frame(Frame::Settings(SettingsFrame::ack()));

    // The client acknowledges the server settings
    match peer.read_frame() {
        Frame::Settings(frame) => assert!(frame.ack),
        other => panic!("expected SETTINGS ACK, got {:?}", other),
    }

    assert!(wait_until(
        || session.settings_received(),
        Duration::from_secs(1)
    ));
}

#[test]
fn test_client_settings_handshake() {
    let (session, mut peer) = start_client(false);

    peer.read_preface();
    match peer.read_frame() {
        Frame::Settings(frame) => assert!(!frame.ack),
        other => panic!("first client frame was {:?}", other),
    }

    // Explicit SETTINGS from the embedder blocks until the peer acks
    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let settings = SettingsBuilder::new()
                .initial_window_size(16384)
                .build()
                .unwrap();
            session.write_settings(settings, false)
        });

        match peer.read_frame() {
            Frame::Settings(frame) => {
                assert!(!frame.ack);
                assert_eq!(frame.settings.initial_window_size, Some(16384));
            }
            other => panic!("expected SETTINGS, got {:?}", other),
        }

        peer.write_frame(Frame::Settings(SettingsFrame::new(Settings::new())));
        peer.write_frame(Frame::Settings(SettingsFrame::ack()));

        // The client acks the peer's SETTINGS
        match peer.read_frame() {
            Frame::Settings(frame) => assert!(frame.ack),
            other => panic!("expected SETTINGS ACK, got {:?}", other),
        }

        writer.join().unwrap().unwrap();
    });
    assert!(session.settings_received());
    assert!(!session.is_disposed());

    session.close(ErrorCode::NoError);
    let frames = peer.drain();
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Goaway(g) if g.error_code == ErrorCode::NoError)));
}

#[test]
fn test_server_preface_mismatch_no_goaway() {
    let (session, mut peer) = start_server(false);

    peer.write_raw(&[b'X'; 24]);

    session.join();
    assert!(session.is_disposed());

    // Nothing was emitted on the wire, in particular no GOAWAY
    let frames = peer.drain();
    assert!(frames.is_empty(), "unexpected frames: {:?}", frames);
}

#[test]
fn test_server_receives_request() {
    let (session, mut peer) = start_server(false);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    session.subscribe(move |event| {
        if let SessionEvent::FrameReceived { frame, .. } = event {
            sink.lock().unwrap().push(frame.clone());
        }
    });

    peer.write_preface();
    peer.write_frame(Frame::Settings(SettingsFrame::new(Settings::new())));

    // The server answers with its own SETTINGS, then the ack
    match peer.read_frame() {
        Frame::Settings(frame) => assert!(!frame.ack),
        other => panic!("expected server SETTINGS, got {:?}", other),
    }
    match peer.read_frame() {
        Frame::Settings(frame) => assert!(frame.ack),
        other => panic!("expected SETTINGS ACK, got {:?}", other),
    }

    let block = peer.encode_headers(&[
        (b":method", b"GET"),
        (b":path", b"/index.html"),
        (b":scheme", b"http"),
    ]);
    peer.write_frame(Frame::Headers(HeadersFrame::new(1, block, true, true)));

    assert!(wait_until(
        || session.stream_headers(1).map(|h| !h.is_empty()).unwrap_or(false),
        Duration::from_secs(1)
    ));

    let headers = session.stream_headers(1).unwrap();
    assert!(headers.contains(&(b":path".to_vec(), b"/index.html".to_vec())));
    assert_eq!(session.stream_state(1), Some(StreamState::HalfClosedRemote));
    assert!(received
        .lock()
        .unwrap()
        .iter()
        .any(|f| matches!(f, Frame::Headers(_))));

    session.close(ErrorCode::NoError);
    session.join();
}

#[test]
fn test_oversize_frame_closes_with_frame_size_error() {
    let (session, mut peer) = start_client(false);

    peer.read_preface();
    peer.read_frame(); // client SETTINGS

    // DATA one byte over the 16384 default limit
    let oversize = 16385usize;
    let header = FrameCodec::encode_header(FrameType::Data.as_u8(), 0, 1, oversize);
    peer.write_raw(&header);
    peer.write_raw(&vec![0u8; oversize]);

    session.join();
    assert!(session.is_disposed());

    let frames = peer.drain();
    let goaway = frames
        .iter()
        .find_map(|f| match f {
            Frame::Goaway(g) => Some(g),
            _ => None,
        })
        .expect("expected a GOAWAY");
    assert_eq!(goaway.error_code, ErrorCode::FrameSizeError);
    assert_eq!(goaway.last_stream_id, 0);
}

#[test]
fn test_header_block_reassembled_across_continuation() {
    let (session, mut peer) = start_server(false);

    peer.write_preface();
    peer.write_frame(Frame::Settings(SettingsFrame::new(Settings::new())));
    peer.read_frame(); // server SETTINGS
    peer.read_frame(); // SETTINGS ACK

    let headers: Vec<(&[u8], &[u8])> = vec![
        (b":method", b"GET"),
        (b":path", b"/split"),
        (b":scheme", b"http"),
        (b"accept", b"text/html"),
    ];
    let block = peer.encode_headers(&headers);
    let mid = block.len() / 2;

    peer.write_frame(Frame::Headers(HeadersFrame::new(
        3,
        block.slice(..mid),
        false,
        false,
    )));
    peer.write_frame(Frame::Continuation(ContinuationFrame {
        stream_id: 3,
        fragment: block.slice(mid..),
        end_headers: true,
    }));

    assert!(wait_until(
        || session.stream_headers(3).map(|h| !h.is_empty()).unwrap_or(false),
        Duration::from_secs(1)
    ));

    let decoded = session.stream_headers(3).unwrap();
    let expected: Vec<Header> = headers
        .iter()
        .map(|(n, v)| (n.to_vec(), v.to_vec()))
        .collect();
    assert_eq!(decoded, expected);
    assert!(!session.is_disposed());

    session.close(ErrorCode::NoError);
    session.join();
}

#[test]
fn test_frame_interleaved_into_header_block_is_protocol_error() {
    let (session, mut peer) = start_server(false);

    peer.write_preface();
    peer.write_frame(Frame::Settings(SettingsFrame::new(Settings::new())));
    peer.read_frame(); // server SETTINGS
    peer.read_frame(); // SETTINGS ACK

    let block = peer.encode_headers(&[(b":method", b"GET"), (b":path", b"/x")]);
    peer.write_frame(Frame::Headers(HeadersFrame::new(1, block, false, false)));
    // A PING in the middle of an open header block is illegal
    peer.write_frame(Frame::Ping(PingFrame::new([0; 8])));

    session.join();
    assert!(session.is_disposed());

    let frames = peer.drain();
    let goaway = frames
        .iter()
        .find_map(|f| match f {
            Frame::Goaway(g) => Some(g),
            _ => None,
        })
        .expect("expected a GOAWAY");
    assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
}

#[test]
fn test_secure_session_requires_settings_first() {
    let (session, mut peer) = start_client(true);

    peer.read_preface();
    peer.read_frame(); // client SETTINGS

    // A PING before the peer's SETTINGS violates the handshake on a
    // secure connection
    peer.write_frame(Frame::Ping(PingFrame::new([0; 8])));

    session.join();
    assert!(session.is_disposed());

    let frames = peer.drain();
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Goaway(g) if g.error_code == ErrorCode::ProtocolError)));
}

#[test]
fn test_data_gated_by_stream_window() {
    let (session, mut peer) = start_client(false);

    // Peer advertises a 100-byte stream window
    client_handshake(
        &session,
        &mut peer,
        SettingsBuilder::new()
            .initial_window_size(100)
            .build()
            .unwrap(),
    );

    let stream_id = session
        .send_request(
            vec![
                (b":method".to_vec(), b"POST".to_vec()),
                (b":path".to_vec(), b"/upload".to_vec()),
            ],
            DEFAULT_STREAM_PRIORITY,
            false,
        )
        .unwrap();
    assert_eq!(stream_id, 1);

    match peer.read_frame() {
        Frame::Headers(f) => assert_eq!(f.stream_id, 1),
        other => panic!("expected HEADERS, got {:?}", other),
    }

    // 150 bytes against a 100-byte window: 100 sent, 50 withheld
    session
        .send_data(stream_id, Bytes::from(vec![7u8; 150]), true)
        .unwrap();

    match peer.read_frame() {
        Frame::Data(f) => {
            assert_eq!(f.data.len(), 100);
            assert!(!f.end_stream);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    // Granting 50 bytes releases the remainder with END_STREAM
    peer.write_frame(Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, 50)));

    match peer.read_frame() {
        Frame::Data(f) => {
            assert_eq!(f.data.len(), 50);
            assert!(f.end_stream);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    session.close(ErrorCode::NoError);
    session.join();
}

#[test]
fn test_promised_resource_rejected() {
    let (session, mut peer) = start_client(false);
    client_handshake(&session, &mut peer, Settings::new());

    let stream_id = session
        .send_request(
            vec![
                (b":method".to_vec(), b"GET".to_vec()),
                (b":path".to_vec(), b"/".to_vec()),
            ],
            DEFAULT_STREAM_PRIORITY,
            true,
        )
        .unwrap();

    match peer.read_frame() {
        Frame::Headers(f) => assert_eq!(f.stream_id, stream_id),
        other => panic!("expected HEADERS, got {:?}", other),
    }

    // Server promises /a on stream 2
    let block = peer.encode_headers(&[(b":method", b"GET"), (b":path", b"/a")]);
    peer.write_frame(Frame::PushPromise(PushPromiseFrame {
        stream_id,
        promised_stream_id: 2,
        fragment: block,
        end_headers: true,
        padding: None,
    }));

    assert!(wait_until(
        || !session.promised_paths().is_empty(),
        Duration::from_secs(1)
    ));
    assert_eq!(session.promised_paths(), vec![(2, "/a".to_string())]);
    assert_eq!(session.stream_state(2), Some(StreamState::ReservedRemote));

    // Requesting the promised path is rejected without emitting a frame
    let result = session.send_request(
        vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), b"/a".to_vec()),
        ],
        DEFAULT_STREAM_PRIORITY,
        true,
    );
    match result {
        Err(Error::ResourcePromised(path)) => assert_eq!(path, "/a"),
        other => panic!("expected ResourcePromised, got {:?}", other),
    }

    session.close(ErrorCode::NoError);
    let frames = peer.drain();
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Headers(_))),
        "rejected request must not reach the wire"
    );
}

#[test]
fn test_rst_stream_not_answered_and_sent_once() {
    let (session, mut peer) = start_client(false);
    client_handshake(&session, &mut peer, Settings::new());

    let stream_id = session
        .send_request(
            vec![
                (b":method".to_vec(), b"GET".to_vec()),
                (b":path".to_vec(), b"/".to_vec()),
            ],
            DEFAULT_STREAM_PRIORITY,
            false,
        )
        .unwrap();
    peer.read_frame(); // HEADERS

    // Peer resets the stream; the session must not reply with RST_STREAM
    peer.write_frame(Frame::RstStream(RstStreamFrame {
        stream_id,
        error_code: ErrorCode::Cancel,
    }));

    assert!(wait_until(
        || session.stream_state(stream_id) == Some(StreamState::Closed),
        Duration::from_secs(1)
    ));

    // DATA on the closed stream draws exactly one RST_STREAM(STREAM_CLOSED)
    peer.write_frame(Frame::Data(DataFrame::new(
        stream_id,
        Bytes::from("late"),
        false,
    )));
    peer.write_frame(Frame::Data(DataFrame::new(
        stream_id,
        Bytes::from("later"),
        false,
    )));

    match peer.read_frame() {
        Frame::RstStream(f) => {
            assert_eq!(f.stream_id, stream_id);
            assert_eq!(f.error_code, ErrorCode::StreamClosed);
        }
        other => panic!("expected RST_STREAM, got {:?}", other),
    }

    session.close(ErrorCode::NoError);
    let frames = peer.drain();
    let rst_count = frames
        .iter()
        .filter(|f| matches!(f, Frame::RstStream(_)))
        .count();
    assert_eq!(rst_count, 0, "only one RST_STREAM may ever be sent");
}

#[test]
fn test_goaway_blocks_new_requests() {
    let (session, mut peer) = start_client(false);
    client_handshake(&session, &mut peer, Settings::new());

    peer.write_frame(Frame::Goaway(GoawayFrame::new(
        0,
        ErrorCode::NoError,
        Bytes::new(),
    )));

    assert!(wait_until(|| session.goaway_received(), Duration::from_secs(1)));

    let result = session.send_request(
        vec![(b":path".to_vec(), b"/".to_vec())],
        DEFAULT_STREAM_PRIORITY,
        true,
    );
    assert!(matches!(result, Err(Error::GoawayReceived)));

    // After a received GOAWAY, closing emits none of our own
    session.close(ErrorCode::NoError);
    let frames = peer.drain();
    assert!(!frames.iter().any(|f| matches!(f, Frame::Goaway(_))));
}

#[test]
fn test_ping_roundtrip() {
    let (session, mut peer) = start_client(false);
    client_handshake(&session, &mut peer, Settings::new());

    let echo = thread::spawn(move || loop {
        match FrameCodec::read_frame(&mut peer.pipe, 1 << 24) {
            Ok(Frame::Ping(f)) if !f.ack => {
                peer.pipe
                    .write_all(&FrameCodec::encode(&Frame::Ping(PingFrame::ack(f.data))))
                    .unwrap();
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    });

    let rtt = session.ping().unwrap();
    assert!(rtt < Duration::from_secs(3));

    session.close(ErrorCode::NoError);
    session.join();
    echo.join().unwrap();
}

#[test]
fn test_close_is_idempotent_and_disposes_once() {
    let (session, mut peer) = start_client(false);

    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = disposed.clone();
    session.subscribe(move |event| {
        if matches!(event, SessionEvent::SessionDisposed) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    peer.read_preface();
    peer.read_frame(); // client SETTINGS

    session.close(ErrorCode::NoError);
    session.close(ErrorCode::InternalError);
    session.join();

    assert!(session.is_disposed());
    assert_eq!(disposed.load(Ordering::SeqCst), 1);

    // Exactly one GOAWAY despite the double close
    let frames = peer.drain();
    let goaways = frames
        .iter()
        .filter(|f| matches!(f, Frame::Goaway(_)))
        .count();
    assert_eq!(goaways, 1);
}

#[test]
fn test_upgrade_handoff_installs_stream_one() {
    let (near, far) = pipe();
    let session = Session::new(near, Role::Client, false, CancelToken::new());

    session
        .start(Some(vec![(b":method".to_vec(), b"GET".to_vec())]))
        .unwrap();
    let mut peer = RawPeer::new(far);
    peer.read_preface();
    peer.read_frame(); // client SETTINGS

    assert_eq!(session.stream_state(1), Some(StreamState::HalfClosedLocal));
    let headers = session.stream_headers(1).unwrap();
    assert!(headers.contains(&(b":path".to_vec(), b"/".to_vec())));

    // The next usable client id is 3
    let stream_id = session
        .send_request(
            vec![(b":path".to_vec(), b"/next".to_vec())],
            DEFAULT_STREAM_PRIORITY,
            true,
        )
        .unwrap();
    assert_eq!(stream_id, 3);

    session.close(ErrorCode::NoError);
    session.join();
}

#[test]
fn test_local_argument_errors() {
    let (near, _far) = pipe();
    let session = Session::new(near, Role::Client, false, CancelToken::new());

    // Not started yet
    assert!(matches!(
        session.send_request(vec![(b":path".to_vec(), b"/".to_vec())], 0, true),
        Err(Error::NotReady)
    ));

    session.start(None).unwrap();

    assert!(matches!(
        session.send_request(Vec::new(), 0, true),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        session.send_request(vec![(b":path".to_vec(), b"/".to_vec())], 90_000, true),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        session.write_connection_window_update(0),
        Err(Error::InvalidArgument(_))
    ));

    session.close(ErrorCode::NoError);

    assert!(matches!(
        session.send_request(vec![(b":path".to_vec(), b"/".to_vec())], 0, true),
        Err(Error::SessionClosed)
    ));
}

#[test]
fn test_server_rejects_send_request() {
    let (session, mut peer) = start_server(false);
    peer.write_preface();
    peer.write_frame(Frame::Settings(SettingsFrame::new(Settings::new())));

    assert!(wait_until(|| session.settings_received(), Duration::from_secs(1)));

    assert!(matches!(
        session.send_request(vec![(b":path".to_vec(), b"/".to_vec())], 0, true),
        Err(Error::InvalidArgument(_))
    ));

    session.close(ErrorCode::NoError);
    session.join();
}
