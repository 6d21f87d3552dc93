//! Error types for the legacy Kafka client

use std::fmt;

/// Main error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum KafkaClientError {
    /// Socket creation, write or read failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A socket operation did not complete within the configured timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// No more bytes in the current declared response
    #[error("End of stream: {message}")]
    EndOfStream { message: String },

    /// Broker answered with a non-zero error code
    #[error("Kafka response channel error code: {code}")]
    Broker { code: ErrorCode },

    /// Message frame failed validation (CRC, magic, sizes)
    #[error("Corrupt message: {message}")]
    CorruptMessage { message: String },

    /// Response envelope could not be parsed
    #[error("Corrupt response: {message}")]
    CorruptResponse { message: String },

    /// Gzip wrapper of a compressed message is malformed
    #[error("Invalid gzip format: {message}")]
    InvalidGzipFormat { message: String },

    /// Compression codec the client cannot encode or decode
    #[error("Unsupported compression codec {codec}")]
    UnsupportedCompression { codec: u8 },

    /// Offset literal could not be parsed
    #[error("Invalid offset format: {value}")]
    InvalidOffsetFormat { value: String },

    /// Key type rejected by the partitioner
    #[error("{message}")]
    InvalidPartitionKey { message: String },

    /// Topic is not known to the cluster metadata
    #[error("Unknown Kafka topic `{topic}`")]
    UnknownTopic { topic: String },

    /// Broker id is not known to the cluster metadata
    #[error("Broker connection parameters not initialized for broker {broker_id}")]
    UnknownBroker { broker_id: u32 },

    /// Partitioner returned an index outside of the partition range
    #[error("Partitioner must return 0 <= integer < {num_partitions}, returned {returned}")]
    PartitionerContractViolation {
        num_partitions: usize,
        returned: usize,
    },

    /// Operation is not legal in the current channel state
    #[error("Illegal channel state: {message}")]
    IllegalState { message: String },

    /// Operation not implemented by the selected protocol variant
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Metadata collaborator failure
    #[error("Metadata error: {message}")]
    Metadata { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KafkaClientError {
    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new end-of-stream signal
    pub fn end_of_stream<S: Into<String>>(message: S) -> Self {
        Self::EndOfStream {
            message: message.into(),
        }
    }

    /// Create a broker error from a raw wire code
    pub fn broker(code: i16) -> Self {
        Self::Broker {
            code: ErrorCode::from(code),
        }
    }

    /// Create a new corrupt message error
    pub fn corrupt_message<S: Into<String>>(message: S) -> Self {
        Self::CorruptMessage {
            message: message.into(),
        }
    }

    /// Create a new corrupt response error
    pub fn corrupt_response<S: Into<String>>(message: S) -> Self {
        Self::CorruptResponse {
            message: message.into(),
        }
    }

    /// Create a new invalid gzip format error
    pub fn invalid_gzip<S: Into<String>>(message: S) -> Self {
        Self::InvalidGzipFormat {
            message: message.into(),
        }
    }

    /// Create a new illegal state error
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new metadata error
    pub fn metadata<S: Into<String>>(message: S) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is worth retrying against refreshed metadata
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::Broker { .. }
                | Self::Io(_)
                | Self::UnknownBroker { .. }
        )
    }

    /// Check if this is the recoverable "response exhausted" signal
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }
}

/// Error codes returned by 0.7 brokers in the response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    None,
    /// Unknown server error
    Unknown,
    /// Offset out of range
    OffsetOutOfRange,
    /// Invalid message
    InvalidMessage,
    /// Wrong partition
    WrongPartition,
    /// Invalid fetch size
    InvalidFetchSize,
    /// Any code this client does not know about
    Other(i16),
}

impl ErrorCode {
    /// Raw wire value
    pub fn code(self) -> i16 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::Unknown => -1,
            ErrorCode::OffsetOutOfRange => 1,
            ErrorCode::InvalidMessage => 2,
            ErrorCode::WrongPartition => 3,
            ErrorCode::InvalidFetchSize => 4,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            -1 => ErrorCode::Unknown,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::InvalidMessage,
            3 => ErrorCode::WrongPartition,
            4 => ErrorCode::InvalidFetchSize,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::Unknown => "unknown",
            ErrorCode::OffsetOutOfRange => "offset out of range",
            ErrorCode::InvalidMessage => "invalid message",
            ErrorCode::WrongPartition => "wrong partition",
            ErrorCode::InvalidFetchSize => "invalid fetch size",
            ErrorCode::Other(_) => "unrecognized",
        };
        write!(f, "{} ({})", self.code(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [-1i16, 0, 1, 2, 3, 4, 42] {
            assert_eq!(ErrorCode::from(code).code(), code);
        }
        assert_eq!(ErrorCode::from(42), ErrorCode::Other(42));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(KafkaClientError::transport("reset").is_retryable());
        assert!(KafkaClientError::broker(3).is_retryable());
        assert!(!KafkaClientError::corrupt_message("crc").is_retryable());
        assert!(!KafkaClientError::UnknownTopic {
            topic: "t".to_string()
        }
        .is_retryable());
        assert!(KafkaClientError::end_of_stream("done").is_end_of_stream());
    }

    #[test]
    fn test_stable_messages() {
        let err = KafkaClientError::UnknownTopic {
            topic: "topicX".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown Kafka topic `topicX`");

        let err = KafkaClientError::broker(1);
        assert_eq!(
            err.to_string(),
            "Kafka response channel error code: 1 (offset out of range)"
        );
    }
}
