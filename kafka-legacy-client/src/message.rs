//! Message type and the 0.7 message frame codec
//!
//! Frame layout (big-endian):
//!
//! ```text
//! int32 boundsSize | byte magic | [byte attributes if magic == 1] | int32 crc32(payload) | payload
//! ```
//!
//! A compressed frame's payload is a gzip member whose inflated content is a
//! concatenation of ordinary uncompressed frames. A single compressed message
//! is simply a batch of one.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compression::{self, Compression};
use crate::error::KafkaClientError;
use crate::offset::Offset;
use crate::Result;

/// Wire format without the attribute byte
pub const MAGIC_0: u8 = 0;
/// Wire format with the attribute byte
pub const MAGIC_1: u8 = 1;
/// Size of the leading boundsSize field
pub const FRAME_SIZE_LEN: usize = 4;

const CRC_LEN: usize = 4;
const ATTRIBUTE_CODEC_MASK: u8 = 0x03;

/// A single logical message, produced or consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    partition: u32,
    payload: Bytes,
    compression: Compression,
    offset: Offset,
}

impl Message {
    pub fn new<T, P>(topic: T, partition: u32, payload: P, compression: Compression) -> Result<Self>
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(KafkaClientError::invalid_config(
                "Topic name cannot be an empty string.",
            ));
        }
        Ok(Self {
            topic,
            partition,
            payload: payload.into(),
            compression,
            offset: Offset::default(),
        })
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Final, uncompressed payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Position of the frame this message was read from
    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Append a magic-1 frame carrying `payload` verbatim.
///
/// `payload` must already be in the form announced by `compression`.
pub fn pack_frame(buf: &mut BytesMut, payload: &[u8], compression: Compression) {
    let bounds = 1 + 1 + CRC_LEN + payload.len();
    buf.reserve(FRAME_SIZE_LEN + bounds);
    buf.put_u32(bounds as u32);
    buf.put_u8(MAGIC_1);
    buf.put_u8(compression.into());
    buf.put_u32(crc32fast::hash(payload));
    buf.put_slice(payload);
}

/// Wrap already-framed uncompressed messages into one compressed frame.
pub fn pack_batch(buf: &mut BytesMut, inner_frames: &[u8], compression: Compression) -> Result<()> {
    match compression {
        Compression::None => {
            buf.put_slice(inner_frames);
            Ok(())
        }
        Compression::Gzip => {
            let compressed = compression::gzip(inner_frames)?;
            pack_frame(buf, &compressed, Compression::Gzip);
            Ok(())
        }
        Compression::Snappy => Err(KafkaClientError::UnsupportedCompression {
            codec: Compression::Snappy.into(),
        }),
    }
}

/// Encode one message to its wire frame.
///
/// Compressed messages are first framed uncompressed, and that inner frame
/// becomes the content of the gzip member.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match message.compression {
        Compression::None => pack_frame(&mut buf, &message.payload, Compression::None),
        compression => {
            let mut inner = BytesMut::new();
            pack_frame(&mut inner, &message.payload, Compression::None);
            pack_batch(&mut buf, &inner, compression)?;
        }
    }
    Ok(buf.freeze())
}

/// Parse the body of a frame (everything after boundsSize), validating CRC.
///
/// Returns the codec and the still-compressed payload.
pub fn parse_frame_body(mut body: Bytes) -> Result<(Compression, Bytes)> {
    if body.is_empty() {
        return Err(KafkaClientError::corrupt_message("Invalid Kafka Message"));
    }
    let magic = body.get_u8();
    let compression = match magic {
        MAGIC_0 => Compression::None,
        MAGIC_1 => {
            if body.is_empty() {
                return Err(KafkaClientError::corrupt_message("Missing attribute byte"));
            }
            Compression::try_from(body.get_u8() & ATTRIBUTE_CODEC_MASK)?
        }
        other => {
            return Err(KafkaClientError::corrupt_message(format!(
                "Unknown message format - MAGIC = {}",
                other
            )))
        }
    };
    if body.len() < CRC_LEN {
        return Err(KafkaClientError::corrupt_message("Missing message CRC32"));
    }
    let stored_crc = body.get_u32();
    let actual_crc = crc32fast::hash(&body);
    if stored_crc != actual_crc {
        return Err(KafkaClientError::corrupt_message(format!(
            "Invalid message CRC32 {:08x} <> {:08x}",
            stored_crc, actual_crc
        )));
    }
    if compression == Compression::Snappy {
        return Err(KafkaClientError::UnsupportedCompression {
            codec: Compression::Snappy.into(),
        });
    }
    Ok((compression, body))
}

/// Split the next complete frame body off the front of `buf`.
///
/// Returns `Ok(None)` once `buf` is empty.
pub fn split_frame(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < FRAME_SIZE_LEN {
        return Err(KafkaClientError::end_of_stream(format!(
            "Trying to read {} from {} remaining.",
            FRAME_SIZE_LEN,
            buf.len()
        )));
    }
    let bounds = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() - FRAME_SIZE_LEN < bounds {
        return Err(KafkaClientError::end_of_stream(format!(
            "Trying to read {} from {} remaining.",
            bounds,
            buf.len() - FRAME_SIZE_LEN
        )));
    }
    buf.advance(FRAME_SIZE_LEN);
    Ok(Some(buf.split_to(bounds)))
}

/// Outcome of decoding one outer frame.
#[derive(Debug)]
pub enum Decoded {
    Message(Message),
    Batch(InnerBatch),
}

/// Decode the body of an outer frame that started at `offset`.
pub fn decode_body(topic: &str, partition: u32, offset: Offset, body: Bytes) -> Result<Decoded> {
    let (compression, payload) = parse_frame_body(body)?;
    match compression {
        Compression::None => Ok(Decoded::Message(Message {
            topic: topic.to_string(),
            partition,
            payload,
            compression,
            offset,
        })),
        _ => {
            let frames = compression::gunzip(&payload)?;
            Ok(Decoded::Batch(InnerBatch {
                frames,
                base_offset: offset,
                compression,
            }))
        }
    }
}

/// Inflated content of a compressed frame, read one inner frame at a time.
///
/// Inner messages cannot be addressed individually by the broker, so every
/// one of them reports the offset of the enclosing outer frame.
#[derive(Debug)]
pub struct InnerBatch {
    frames: Bytes,
    base_offset: Offset,
    compression: Compression,
}

impl InnerBatch {
    pub fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    pub fn next_message(&mut self, topic: &str, partition: u32) -> Result<Option<Message>> {
        let body = match split_frame(&mut self.frames) {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(e) if e.is_end_of_stream() => {
                self.frames.clear();
                return Err(KafkaClientError::corrupt_message(format!(
                    "Truncated inner message: {}",
                    e
                )));
            }
            Err(e) => return Err(e),
        };
        let (inner_compression, payload) = parse_frame_body(body)?;
        if inner_compression.is_compressed() {
            self.frames.clear();
            return Err(KafkaClientError::corrupt_message(
                "Nested compressed message inside a compressed batch",
            ));
        }
        Ok(Some(Message {
            topic: topic.to_string(),
            partition,
            payload,
            compression: self.compression,
            offset: self.base_offset,
        }))
    }
}

/// Iterative decoder over an in-memory message set.
///
/// The watermark advances past an outer frame only once every message it
/// carries has been returned.
#[derive(Debug)]
pub struct MessageSetDecoder {
    topic: String,
    partition: u32,
    buffer: Bytes,
    watermark: Offset,
    inner: Option<(InnerBatch, u64)>,
}

impl MessageSetDecoder {
    pub fn new<T: Into<String>>(topic: T, partition: u32, buffer: Bytes, start: Offset) -> Self {
        Self {
            topic: topic.into(),
            partition,
            buffer,
            watermark: start,
            inner: None,
        }
    }

    pub fn watermark(&self) -> Offset {
        self.watermark
    }

    /// Next logical message, `Ok(None)` once only a partial frame (or nothing) is left.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some((batch, outer_size)) = self.inner.as_mut() {
                let outer_size = *outer_size;
                match batch.next_message(&self.topic, self.partition) {
                    Ok(Some(message)) => {
                        if batch.is_exhausted() {
                            self.inner = None;
                            self.watermark.add_int(outer_size);
                        }
                        return Ok(Some(message));
                    }
                    Ok(None) => {
                        self.inner = None;
                        self.watermark.add_int(outer_size);
                    }
                    Err(e) => {
                        self.inner = None;
                        self.watermark.add_int(outer_size);
                        return Err(e);
                    }
                }
            }

            let before = self.buffer.len();
            let body = match split_frame(&mut self.buffer) {
                Ok(Some(body)) => body,
                Ok(None) => return Ok(None),
                Err(e) if e.is_end_of_stream() => return Ok(None),
                Err(e) => return Err(e),
            };
            let frame_size = (before - self.buffer.len()) as u64;
            let start = self.watermark;
            match decode_body(&self.topic, self.partition, start, body) {
                Ok(Decoded::Message(message)) => {
                    self.watermark.add_int(frame_size);
                    return Ok(Some(message));
                }
                Ok(Decoded::Batch(batch)) => self.inner = Some((batch, frame_size)),
                Err(e) => {
                    self.watermark.add_int(frame_size);
                    return Err(e);
                }
            }
        }
    }
}

/// Decode a complete message set into its logical messages.
pub fn decode_message_set(topic: &str, partition: u32, buffer: Bytes, start: Offset) -> Result<Vec<Message>> {
    let mut decoder = MessageSetDecoder::new(topic, partition, buffer, start);
    let mut messages = Vec::new();
    while let Some(message) = decoder.next_message()? {
        messages.push(message);
    }
    Ok(messages)
}

/// Decode a single encoded message. Compressed frames yield their first inner message.
pub fn decode(topic: &str, partition: u32, frame: Bytes, offset: Offset) -> Result<Message> {
    let mut decoder = MessageSetDecoder::new(topic, partition, frame, offset);
    decoder
        .next_message()?
        .ok_or_else(|| KafkaClientError::corrupt_message("Truncated message frame"))
}
