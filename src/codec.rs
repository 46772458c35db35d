//! HTTP/2 frame encoding and decoding
//!
//! This module provides low-level frame encoding/decoding: the 9-octet
//! frame header, per-type payload layout, and a blocking `read_frame`
//! used by the session's read pump.

use crate::error::{Error, ErrorCode, Result};
use crate::frames::*;
use crate::settings::{Settings, SettingsParameter};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        // Type (8 bits)
        header[3] = frame_type;

        // Flags (8 bits)
        header[4] = flags;

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5] = ((stream_id >> 24) & 0xFF) as u8;
        header[6] = ((stream_id >> 16) & 0xFF) as u8;
        header[7] = ((stream_id >> 8) & 0xFF) as u8;
        header[8] = (stream_id & 0xFF) as u8;

        header
    }

    /// Decode a frame header from bytes
    ///
    /// Returns the raw type byte so unknown types survive to the
    /// dispatcher as [`Frame::Unknown`].
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, u8, u32, usize) {
        // Length (24 bits, big-endian)
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        let frame_type = bytes[3];
        let flags = bytes[4];

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        (frame_type, flags, stream_id, length)
    }

    /// Encode any frame to its wire representation
    pub fn encode(frame: &Frame) -> Bytes {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f),
            Frame::Headers(f) => Self::encode_headers_frame(f),
            Frame::Priority(f) => Self::encode_priority_frame(f),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(f),
            Frame::Settings(f) => Self::encode_settings_frame(f),
            Frame::PushPromise(f) => Self::encode_push_promise_frame(f),
            Frame::Ping(f) => Self::encode_ping_frame(f),
            Frame::Goaway(f) => Self::encode_goaway_frame(f),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(f),
            Frame::Continuation(f) => Self::encode_continuation_frame(f),
            Frame::Unknown(f) => Self::encode_unknown_frame(f),
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(
            FrameType::Data.as_u8(),
            flags.as_u8(),
            frame.stream_id,
            payload_len,
        );
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        buf.put_slice(&frame.data);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.fragment.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let has_priority = frame.priority.is_some();
        if has_priority {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(
            FrameType::Headers.as_u8(),
            flags.as_u8(),
            frame.stream_id,
            payload_len,
        );
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }

        buf.put_slice(&frame.fragment);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(FrameType::Priority.as_u8(), 0, frame.stream_id, 5);
        buf.put_slice(&header);

        let mut dep = frame.priority.stream_dependency;
        if frame.priority.exclusive {
            dep |= 0x8000_0000;
        }
        buf.put_u32(dep);
        buf.put_u8(frame.priority.weight);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(FrameType::RstStream.as_u8(), 0, frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack { FrameFlags::ACK } else { 0 };

        // Each setting is 6 bytes (2 byte ID + 4 byte value)
        let mut settings_data = BytesMut::new();

        if !frame.ack {
            let settings = &frame.settings;

            if let Some(val) = settings.header_table_size {
                settings_data.put_u16(SettingsParameter::HeaderTableSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.enable_push {
                settings_data.put_u16(SettingsParameter::EnablePush.as_u16());
                settings_data.put_u32(if val { 1 } else { 0 });
            }
            if let Some(val) = settings.max_concurrent_streams {
                settings_data.put_u16(SettingsParameter::MaxConcurrentStreams.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.initial_window_size {
                settings_data.put_u16(SettingsParameter::InitialWindowSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_frame_size {
                settings_data.put_u16(SettingsParameter::MaxFrameSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_header_list_size {
                settings_data.put_u16(SettingsParameter::MaxHeaderListSize.as_u16());
                settings_data.put_u32(val);
            }
        }

        // Stream ID must be 0 for SETTINGS
        let header =
            Self::encode_header(FrameType::Settings.as_u8(), flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = 4 + frame.fragment.len();
        let mut flags = FrameFlags::empty();

        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(
            FrameType::PushPromise.as_u8(),
            flags.as_u8(),
            frame.stream_id,
            payload_len,
        );
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        buf.put_u32(frame.promised_stream_id & 0x7FFF_FFFF);
        buf.put_slice(&frame.fragment);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack { FrameFlags::ACK } else { 0 };

        // Stream ID must be 0 for PING, payload is always 8 bytes
        let header = Self::encode_header(FrameType::Ping.as_u8(), flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let payload_len = 8 + frame.debug_data.len();

        // Stream ID must be 0 for GOAWAY
        let header = Self::encode_header(FrameType::Goaway.as_u8(), 0, 0, payload_len);
        buf.put_slice(&header);

        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(FrameType::WindowUpdate.as_u8(), 0, frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.end_headers {
            FrameFlags::END_HEADERS
        } else {
            0
        };

        let header = Self::encode_header(
            FrameType::Continuation.as_u8(),
            flags,
            frame.stream_id,
            frame.fragment.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.fragment);

        buf.freeze()
    }

    /// Encode a frame of unknown type verbatim
    pub fn encode_unknown_frame(frame: &UnknownFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(
            frame.frame_type,
            frame.flags,
            frame.stream_id,
            frame.payload.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.payload);

        buf.freeze()
    }

    /// Read one frame from a blocking reader
    ///
    /// Fails with `Error::Io` on transport failure (including a truncated
    /// frame, surfaced as `UnexpectedEof`), `Error::FrameSize` when the
    /// payload length exceeds `max_frame_size`, and `Error::Protocol` /
    /// `Error::FrameSize` on malformed payloads. Unknown frame types are
    /// returned as [`Frame::Unknown`].
    pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: u32) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let (frame_type, flags, stream_id, payload_len) = Self::decode_header(&header);

        if payload_len > max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "frame payload {} exceeds maximum {}",
                payload_len, max_frame_size
            )));
        }

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Self::parse_payload(frame_type, flags, stream_id, Bytes::from(payload))
    }

    /// Parse a raw payload into a typed frame
    pub fn parse_payload(
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<Frame> {
        let flags = FrameFlags::from_u8(flags);

        let frame = match FrameType::from_u8(frame_type) {
            Some(FrameType::Data) => {
                let data = Self::strip_padding(&flags, payload)?;
                let mut frame = DataFrame::new(stream_id, data.0, flags.is_end_stream());
                frame.padding = data.1;
                Frame::Data(frame)
            }
            Some(FrameType::Headers) => {
                let (body, padding) = Self::strip_padding(&flags, payload)?;
                let (priority, fragment) = if flags.is_priority() {
                    if body.len() < 5 {
                        return Err(Error::FrameSize(
                            "HEADERS priority fields truncated".to_string(),
                        ));
                    }
                    (Some(Self::parse_priority(&body[..5])), body.slice(5..))
                } else {
                    (None, body)
                };
                Frame::Headers(HeadersFrame {
                    stream_id,
                    fragment,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                })
            }
            Some(FrameType::Priority) => {
                if payload.len() != 5 {
                    return Err(Error::FrameSize("PRIORITY payload must be 5 bytes".to_string()));
                }
                Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: Self::parse_priority(&payload),
                })
            }
            Some(FrameType::RstStream) => {
                if payload.len() != 4 {
                    return Err(Error::FrameSize(
                        "RST_STREAM payload must be 4 bytes".to_string(),
                    ));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Frame::RstStream(RstStreamFrame {
                    stream_id,
                    // Unknown codes are treated as INTERNAL_ERROR
                    error_code: ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError),
                })
            }
            Some(FrameType::Settings) => {
                if flags.is_ack() && !payload.is_empty() {
                    return Err(Error::FrameSize(
                        "SETTINGS ACK must have an empty payload".to_string(),
                    ));
                }
                if payload.len() % 6 != 0 {
                    return Err(Error::FrameSize(
                        "SETTINGS payload must be a multiple of 6 bytes".to_string(),
                    ));
                }
                Frame::Settings(SettingsFrame {
                    ack: flags.is_ack(),
                    settings: Self::parse_settings_payload(&payload),
                })
            }
            Some(FrameType::PushPromise) => {
                let (body, padding) = Self::strip_padding(&flags, payload)?;
                if body.len() < 4 {
                    return Err(Error::FrameSize(
                        "PUSH_PROMISE payload truncated".to_string(),
                    ));
                }
                let promised =
                    u32::from_be_bytes([body[0] & 0x7F, body[1], body[2], body[3]]);
                Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id: promised,
                    fragment: body.slice(4..),
                    end_headers: flags.is_end_headers(),
                    padding,
                })
            }
            Some(FrameType::Ping) => {
                if payload.len() != 8 {
                    return Err(Error::FrameSize("PING payload must be 8 bytes".to_string()));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                })
            }
            Some(FrameType::Goaway) => {
                if payload.len() < 8 {
                    return Err(Error::FrameSize(
                        "GOAWAY payload must be at least 8 bytes".to_string(),
                    ));
                }
                let last = u32::from_be_bytes([
                    payload[0] & 0x7F,
                    payload[1],
                    payload[2],
                    payload[3],
                ]);
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Frame::Goaway(GoawayFrame {
                    last_stream_id: last,
                    error_code: ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError),
                    debug_data: payload.slice(8..),
                })
            }
            Some(FrameType::WindowUpdate) => {
                if payload.len() != 4 {
                    return Err(Error::FrameSize(
                        "WINDOW_UPDATE payload must be 4 bytes".to_string(),
                    ));
                }
                let increment =
                    u32::from_be_bytes([payload[0] & 0x7F, payload[1], payload[2], payload[3]]);
                Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    size_increment: increment,
                })
            }
            Some(FrameType::Continuation) => Frame::Continuation(ContinuationFrame {
                stream_id,
                fragment: payload,
                end_headers: flags.is_end_headers(),
            }),
            None => Frame::Unknown(UnknownFrame {
                frame_type,
                flags: flags.as_u8(),
                stream_id,
                payload,
            }),
        };

        Ok(frame)
    }

    fn parse_priority(bytes: &[u8]) -> PrioritySpec {
        let dep = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        PrioritySpec {
            stream_dependency: dep & 0x7FFF_FFFF,
            exclusive: dep & 0x8000_0000 != 0,
            weight: bytes[4],
        }
    }

    /// Strip the pad-length prefix and trailing padding from a PADDED payload
    fn strip_padding(flags: &FrameFlags, payload: Bytes) -> Result<(Bytes, Option<u8>)> {
        if !flags.is_padded() {
            return Ok((payload, None));
        }
        if payload.is_empty() {
            return Err(Error::Protocol("padded frame without pad length".to_string()));
        }
        let pad_len = payload[0] as usize;
        if pad_len + 1 > payload.len() {
            return Err(Error::Protocol(format!(
                "padding {} exceeds payload {}",
                pad_len,
                payload.len() - 1
            )));
        }
        let body = payload.slice(1..payload.len() - pad_len);
        Ok((body, Some(pad_len as u8)))
    }

    fn parse_settings_payload(payload: &[u8]) -> Settings {
        let mut settings = Settings::new();
        let mut pos = 0;
        while pos + 6 <= payload.len() {
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let value = u32::from_be_bytes([
                payload[pos + 2],
                payload[pos + 3],
                payload[pos + 4],
                payload[pos + 5],
            ]);

            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => {
                    settings.header_table_size = Some(value)
                }
                Some(SettingsParameter::EnablePush) => settings.enable_push = Some(value != 0),
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                // Unknown settings are ignored per RFC 7540
                None => {}
            }

            pos += 6;
        }
        settings
    }
}
