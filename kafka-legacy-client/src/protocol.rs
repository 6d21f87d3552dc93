//! Request builders and response header handling per protocol generation
//!
//! Payloads built here exclude the 4-byte request size prefix, which the
//! channel writes when sending.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::KafkaClientError;
use crate::offset::Offset;
use crate::Result;

pub const REQUEST_KEY_PRODUCE: i16 = 0;
pub const REQUEST_KEY_FETCH: i16 = 1;
pub const REQUEST_KEY_OFFSETS: i16 = 4;

/// Acknowledgement settings of the transitional produce request
pub const V08_API_VERSION: i16 = 0;
pub const V08_CORRELATION_ID: i32 = 0;
pub const V08_CLIENT_ID: &str = "";
pub const V08_REQUIRED_ACKS: i16 = 1;
pub const V08_ACK_TIMEOUT_MS: i32 = 5000;

/// Protocol generation spoken by a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    V07,
    V08,
}

impl ProtocolVersion {
    pub fn codec(self) -> &'static dyn ProtocolCodec {
        match self {
            ProtocolVersion::V07 => &V07Codec,
            ProtocolVersion::V08 => &V08Codec,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V07 => write!(f, "0.7"),
            ProtocolVersion::V08 => write!(f, "0.8"),
        }
    }
}

/// Time argument of an Offsets request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetTime {
    Earliest,
    Latest,
    /// Unix timestamp in seconds
    Timestamp(u64),
}

impl OffsetTime {
    pub fn to_offset(self) -> Offset {
        match self {
            OffsetTime::Earliest => Offset::EARLIEST,
            OffsetTime::Latest => Offset::LATEST,
            OffsetTime::Timestamp(secs) => Offset::from_timestamp_secs(secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
    pub max_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetsRequest {
    pub topic: String,
    pub partition: u32,
    pub time: OffsetTime,
    pub max_num_offsets: u32,
}

/// An encoded message set bound for one topic-partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceSet {
    pub topic: String,
    pub partition: u32,
    pub message_set: Bytes,
}

/// Wire behaviour that differs between protocol generations.
pub trait ProtocolCodec: fmt::Debug + Send + Sync {
    fn version(&self) -> ProtocolVersion;

    fn encode_fetch(&self, request: &FetchRequest) -> Result<Bytes>;

    fn encode_offsets(&self, request: &OffsetsRequest) -> Result<Bytes>;

    /// One request payload per element of the returned vector.
    fn encode_produce(&self, sets: &[ProduceSet]) -> Result<Vec<Bytes>>;

    /// Bytes following the response size that every response carries.
    fn response_header_len(&self) -> usize;

    fn check_response_header(&self, header: &[u8]) -> Result<()>;

    /// Whether the broker answers produce requests.
    fn acknowledges_produce(&self) -> bool;

    fn check_produce_response(&self, body: Bytes) -> Result<()>;
}

/// Base protocol: one topic-partition per produce request, no acknowledgement.
#[derive(Debug, Clone, Copy, Default)]
pub struct V07Codec;

impl ProtocolCodec for V07Codec {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V07
    }

    fn encode_fetch(&self, request: &FetchRequest) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(22 + request.topic.len());
        buf.put_i16(REQUEST_KEY_FETCH);
        put_short_string(&mut buf, &request.topic)?;
        buf.put_u32(request.partition);
        buf.put_slice(&request.offset.to_bytes());
        buf.put_u32(request.max_size);
        Ok(buf.freeze())
    }

    fn encode_offsets(&self, request: &OffsetsRequest) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(22 + request.topic.len());
        buf.put_i16(REQUEST_KEY_OFFSETS);
        put_short_string(&mut buf, &request.topic)?;
        buf.put_u32(request.partition);
        buf.put_slice(&request.time.to_offset().to_bytes());
        buf.put_u32(request.max_num_offsets);
        Ok(buf.freeze())
    }

    fn encode_produce(&self, sets: &[ProduceSet]) -> Result<Vec<Bytes>> {
        sets.iter()
            .map(|set| {
                let mut buf = BytesMut::with_capacity(14 + set.topic.len() + set.message_set.len());
                buf.put_i16(REQUEST_KEY_PRODUCE);
                put_short_string(&mut buf, &set.topic)?;
                buf.put_u32(set.partition);
                buf.put_u32(set.message_set.len() as u32);
                buf.put_slice(&set.message_set);
                Ok(buf.freeze())
            })
            .collect()
    }

    fn response_header_len(&self) -> usize {
        2
    }

    fn check_response_header(&self, header: &[u8]) -> Result<()> {
        let code = i16::from_be_bytes(fixed(header)?);
        if code != 0 {
            return Err(KafkaClientError::broker(code));
        }
        Ok(())
    }

    fn acknowledges_produce(&self) -> bool {
        false
    }

    fn check_produce_response(&self, _body: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Transitional protocol: versioned produce with a single acknowledged request.
#[derive(Debug, Clone, Copy, Default)]
pub struct V08Codec;

impl ProtocolCodec for V08Codec {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V08
    }

    fn encode_fetch(&self, _request: &FetchRequest) -> Result<Bytes> {
        Err(KafkaClientError::unsupported("0.8 fetch request"))
    }

    fn encode_offsets(&self, _request: &OffsetsRequest) -> Result<Bytes> {
        Err(KafkaClientError::unsupported("0.8 offsets request"))
    }

    fn encode_produce(&self, sets: &[ProduceSet]) -> Result<Vec<Bytes>> {
        let mut buf = BytesMut::new();
        buf.put_i16(REQUEST_KEY_PRODUCE);
        buf.put_i16(V08_API_VERSION);
        buf.put_i32(V08_CORRELATION_ID);
        put_short_string(&mut buf, V08_CLIENT_ID)?;
        buf.put_i16(V08_REQUIRED_ACKS);
        buf.put_i32(V08_ACK_TIMEOUT_MS);

        // sets arrive grouped by topic, partitions in insertion order
        let mut topics: Vec<(&str, Vec<&ProduceSet>)> = Vec::new();
        for set in sets {
            match topics.iter_mut().find(|(topic, _)| *topic == set.topic) {
                Some((_, partitions)) => partitions.push(set),
                None => topics.push((set.topic.as_str(), vec![set])),
            }
        }

        buf.put_u32(topics.len() as u32);
        for (topic, partitions) in topics {
            put_short_string(&mut buf, topic)?;
            buf.put_u32(partitions.len() as u32);
            for set in partitions {
                buf.put_u32(set.partition);
                buf.put_u32(set.message_set.len() as u32);
                buf.put_slice(&set.message_set);
            }
        }
        Ok(vec![buf.freeze()])
    }

    fn response_header_len(&self) -> usize {
        4
    }

    fn check_response_header(&self, header: &[u8]) -> Result<()> {
        let correlation_id = i32::from_be_bytes(fixed(header)?);
        if correlation_id != V08_CORRELATION_ID {
            return Err(KafkaClientError::corrupt_response(format!(
                "Unexpected correlation id {}, expected {}",
                correlation_id, V08_CORRELATION_ID
            )));
        }
        Ok(())
    }

    fn acknowledges_produce(&self) -> bool {
        true
    }

    fn check_produce_response(&self, mut body: Bytes) -> Result<()> {
        let num_topics = get_u32(&mut body)?;
        if num_topics == 0 {
            return Err(KafkaClientError::corrupt_response(
                "Produce request was not acknowledged by the broker",
            ));
        }
        for _ in 0..num_topics {
            let topic = get_short_string(&mut body)?;
            let num_partitions = get_u32(&mut body)?;
            for _ in 0..num_partitions {
                let partition = get_u32(&mut body)?;
                if body.remaining() < 10 {
                    return Err(truncated());
                }
                let code = body.get_i16();
                let _offset = body.get_u64();
                if code != 0 {
                    tracing::warn!(
                        "Produce to {}-{} rejected with error code {}",
                        topic,
                        partition,
                        code
                    );
                    return Err(KafkaClientError::broker(code));
                }
            }
        }
        Ok(())
    }
}

/// Write a 16-bit length-prefixed string.
pub fn put_short_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = i16::try_from(value.len()).map_err(|_| {
        KafkaClientError::invalid_config(format!("String of {} bytes exceeds i16 length", value.len()))
    })?;
    buf.put_i16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub fn get_short_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_i16();
    if len < 0 || buf.remaining() < len as usize {
        return Err(truncated());
    }
    let raw = buf.split_to(len as usize);
    String::from_utf8(raw.to_vec())
        .map_err(|e| KafkaClientError::corrupt_response(format!("Invalid string: {}", e)))
}

/// Body of an Offsets response: `int32 count | count * int64 offset`
pub fn decode_offsets(mut body: Bytes) -> Result<Vec<Offset>> {
    let count = get_u32(&mut body)? as usize;
    if body.remaining() < count * Offset::SIZE {
        return Err(truncated());
    }
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(Offset::new(body.get_u64()));
    }
    Ok(offsets)
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn fixed<const N: usize>(header: &[u8]) -> Result<[u8; N]> {
    header.try_into().map_err(|_| {
        KafkaClientError::corrupt_response(format!(
            "Response header of {} bytes, expected {}",
            header.len(),
            N
        ))
    })
}

fn truncated() -> KafkaClientError {
    KafkaClientError::corrupt_response("Truncated response body")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::message::{encode, Message};

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_fetch_request_layout() {
        let payload = V07Codec
            .encode_fetch(&FetchRequest {
                topic: "topic1".to_string(),
                partition: 2,
                offset: Offset::new(0x1234),
                max_size: 1_000_000,
            })
            .unwrap();
        assert_eq!(
            hex(&payload),
            "00010006746f70696331 00000002 0000000000001234 000f4240".replace(' ', "")
        );
    }

    #[test]
    fn test_offsets_request_time_encoding() {
        let latest = V07Codec
            .encode_offsets(&OffsetsRequest {
                topic: "t".to_string(),
                partition: 0,
                time: OffsetTime::Latest,
                max_num_offsets: 2,
            })
            .unwrap();
        assert_eq!(hex(&latest), "00040001740000000000ffffffffffffffff00000002");

        let at = V07Codec
            .encode_offsets(&OffsetsRequest {
                topic: "t".to_string(),
                partition: 0,
                time: OffsetTime::Timestamp(1),
                max_num_offsets: 1,
            })
            .unwrap();
        assert_eq!(&at[9..17], &1000u64.to_be_bytes());
    }

    #[test]
    fn test_v07_produce_one_request_per_partition() {
        let sets: Vec<ProduceSet> = (0..3)
            .map(|partition| {
                let message = Message::new(
                    "topic1",
                    partition,
                    format!("Hello World {}!", partition + 1),
                    Compression::None,
                )
                .unwrap();
                ProduceSet {
                    topic: "topic1".to_string(),
                    partition,
                    message_set: encode(&message).unwrap(),
                }
            })
            .collect();

        let requests = V07Codec.encode_produce(&sets).unwrap();
        assert_eq!(requests.len(), 3);
        let expected = [
            "00000006746f706963310000000000000018000000140100 5b04c068 48656c6c6f20576f726c642031 21",
            "00000006746f706963310000000100000018000000140100 702993ab 48656c6c6f20576f726c642032 21",
            "00000006746f706963310000000200000018000000140100 6932a2ea 48656c6c6f20576f726c642033 21",
        ];
        for (request, expected) in requests.iter().zip(expected) {
            assert_eq!(request.len(), 42);
            assert_eq!(hex(request), expected.replace(' ', ""));
        }
    }

    #[test]
    fn test_v07_response_header() {
        assert!(V07Codec.check_response_header(&[0, 0]).is_ok());
        assert!(matches!(
            V07Codec.check_response_header(&[0, 3]),
            Err(KafkaClientError::Broker { .. })
        ));
        assert!(V07Codec.check_response_header(&[0]).is_err());
    }

    #[test]
    fn test_v08_produce_groups_topics() {
        let set = |topic: &str, partition| ProduceSet {
            topic: topic.to_string(),
            partition,
            message_set: Bytes::from_static(b"xy"),
        };
        let requests = V08Codec
            .encode_produce(&[set("a", 0), set("a", 1), set("b", 0)])
            .unwrap();
        assert_eq!(requests.len(), 1);
        let mut expected = BytesMut::new();
        expected.put_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0x13, 0x88]);
        expected.put_u32(2);
        expected.put_slice(b"\x00\x01a");
        expected.put_u32(2);
        expected.put_slice(b"\x00\x00\x00\x00\x00\x00\x00\x02xy");
        expected.put_slice(b"\x00\x00\x00\x01\x00\x00\x00\x02xy");
        expected.put_slice(b"\x00\x01b");
        expected.put_u32(1);
        expected.put_slice(b"\x00\x00\x00\x00\x00\x00\x00\x02xy");
        assert_eq!(requests[0], expected.freeze());
    }

    #[test]
    fn test_v08_fetch_unsupported() {
        let request = FetchRequest {
            topic: "t".to_string(),
            partition: 0,
            offset: Offset::default(),
            max_size: 1,
        };
        assert!(matches!(
            ProtocolVersion::V08.codec().encode_fetch(&request),
            Err(KafkaClientError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_v08_produce_response() {
        let mut ok = BytesMut::new();
        ok.put_u32(1);
        ok.put_slice(b"\x00\x01a");
        ok.put_u32(1);
        ok.put_u32(0);
        ok.put_i16(0);
        ok.put_u64(42);
        assert!(V08Codec.check_produce_response(ok.freeze()).is_ok());

        let mut failed = BytesMut::new();
        failed.put_u32(1);
        failed.put_slice(b"\x00\x01a");
        failed.put_u32(1);
        failed.put_u32(0);
        failed.put_i16(3);
        failed.put_u64(0);
        assert!(matches!(
            V08Codec.check_produce_response(failed.freeze()),
            Err(KafkaClientError::Broker { .. })
        ));

        assert!(V08Codec.check_produce_response(Bytes::from_static(&[0, 0])).is_err());
        assert!(V08Codec.check_response_header(&[0, 0, 0, 7]).is_err());
    }

    #[test]
    fn test_decode_offsets() {
        let mut body = BytesMut::new();
        body.put_u32(2);
        body.put_u64(300);
        body.put_u64(0);
        assert_eq!(
            decode_offsets(body.freeze()).unwrap(),
            vec![Offset::new(300), Offset::new(0)]
        );
        assert!(decode_offsets(Bytes::from_static(&[0, 0, 0, 1, 0])).is_err());
    }
}
