//! Scripted in-process broker for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_legacy_client::message::encode;
use kafka_legacy_client::{Compression, Message};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Handler = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Accepts any number of connections and answers each request frame with
/// whatever the handler returns for its payload. Every payload is recorded.
pub struct FakeBroker {
    port: u16,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeBroker {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, handler.clone(), recorded.clone()));
            }
        });
        Self { port, requests }
    }

    /// Broker that reads requests and never answers
    pub async fn silent() -> Self {
        Self::start(|_| None).await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }

    /// Wait until at least `count` requests arrived.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..200 {
            if self.requests.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests()
    }
}

async fn serve(mut socket: TcpStream, handler: Arc<Handler>, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    loop {
        let mut size = [0u8; 4];
        if socket.read_exact(&mut size).await.is_err() {
            return;
        }
        let mut payload = vec![0u8; u32::from_be_bytes(size) as usize];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }
        let reply = handler(&payload);
        requests.lock().push(payload);
        if let Some(reply) = reply {
            if socket.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn request_key(payload: &[u8]) -> i16 {
    i16::from_be_bytes([payload[0], payload[1]])
}

/// `(topic, partition, offset, max_size)` of a 0.7 Fetch or Offsets request
pub fn parse_request(payload: &[u8]) -> (String, u32, u64, u32) {
    let topic_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let topic = String::from_utf8(payload[4..4 + topic_len].to_vec()).unwrap();
    let rest = &payload[4 + topic_len..];
    let partition = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    let offset = u64::from_be_bytes(rest[4..12].try_into().unwrap());
    let max = u32::from_be_bytes(rest[12..16].try_into().unwrap());
    (topic, partition, offset, max)
}

/// `int32 size | int16 error code | body`
pub fn v07_response(error_code: i16, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(2 + body.len() as u32);
    buf.put_i16(error_code);
    buf.put_slice(body);
    buf.to_vec()
}

pub fn offsets_body(offsets: &[u64]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(offsets.len() as u32);
    for offset in offsets {
        buf.put_u64(*offset);
    }
    buf.to_vec()
}

/// Uncompressed frames of `payloads`, concatenated
pub fn message_set(payloads: &[&str]) -> Vec<u8> {
    payloads
        .iter()
        .flat_map(|payload| frame(payload, Compression::None).to_vec())
        .collect()
}

pub fn frame(payload: &str, compression: Compression) -> Bytes {
    encode(&Message::new("any", 0, payload.to_string(), compression).unwrap()).unwrap()
}

pub fn payloads(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
        .collect()
}
