//! Canonical on-bus message format.
//!
//! An envelope wraps one batch of records with producer metadata and a
//! `sha256:<hex>` checksum. The checksum is computed over the canonical JSON
//! form (sorted keys, checksum field nulled) so any consumer can verify
//! integrity without knowing the producer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{DataType, IndexData, StockData};

/// Wire format version. Minor bumps are additive; a major mismatch is a
/// decode-time rejection.
pub const ENVELOPE_VERSION: &str = "1.0";

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub message_id: String,
    /// Producer-assigned unix seconds.
    pub timestamp: i64,
    pub version: String,
    pub producer: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub provider: String,
    pub data_type: DataType,
    pub batch_size: usize,
    pub market: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Batch payload, discriminated by `Metadata::data_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Stocks(Vec<StockData>),
    Indices(Vec<IndexData>),
    Historical(Vec<serde_json::Value>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Stocks(v) => v.len(),
            Payload::Indices(v) => v.len(),
            Payload::Historical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Stocks(_) => DataType::StockRealtime,
            Payload::Indices(_) => DataType::IndexRealtime,
            Payload::Historical(_) => DataType::Historical,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("checksum mismatch (stored {stored}, computed {computed})")]
    BadChecksum { stored: String, computed: String },
    #[error("malformed envelope: {0}")]
    Format(String),
    #[error("incompatible envelope version '{found}' (supported major {major})")]
    Version { found: String, major: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub metadata: Metadata,
    pub payload: serde_json::Value,
    pub checksum: String,
}

impl Envelope {
    /// Build an envelope around one batch. Batch size is derived from the
    /// payload; the checksum is computed immediately.
    pub fn new(
        producer: &str,
        provider: &str,
        data_type: DataType,
        payload: Payload,
    ) -> Result<Self, EnvelopeError> {
        let batch_size = payload.len().max(1);
        let payload = serde_json::to_value(&payload)
            .map_err(|e| EnvelopeError::Format(e.to_string()))?;
        // A list payload counts its elements, anything else counts as one.
        let batch_size = match &payload {
            serde_json::Value::Array(items) => items.len(),
            _ => batch_size,
        };
        let mut envelope = Self {
            header: Header {
                message_id: Uuid::new_v4().to_string(),
                timestamp: Utc::now().timestamp(),
                version: ENVELOPE_VERSION.to_string(),
                producer: producer.to_string(),
                content_type: CONTENT_TYPE_JSON.to_string(),
            },
            metadata: Metadata {
                provider: provider.to_string(),
                data_type,
                batch_size,
                market: "cn".to_string(),
                session: None,
            },
            payload,
            checksum: String::new(),
        };
        envelope.checksum = envelope.compute_checksum()?;
        Ok(envelope)
    }

    /// Stamp market/session tags. The checksum covers metadata, so it is
    /// recomputed here.
    pub fn set_market_info(
        &mut self,
        market: &str,
        session: Option<&str>,
    ) -> Result<(), EnvelopeError> {
        self.metadata.market = market.to_string();
        self.metadata.session = session.map(|s| s.to_string());
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Canonical JSON with the checksum nulled, hashed with SHA-256.
    /// serde_json sorts object keys, which makes the output deterministic.
    fn compute_checksum(&self) -> Result<String, EnvelopeError> {
        let mut v = serde_json::to_value(self)
            .map_err(|e| EnvelopeError::Format(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut v {
            map.insert("checksum".to_string(), serde_json::Value::Null);
        }
        let canonical =
            serde_json::to_string(&v).map_err(|e| EnvelopeError::Format(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Recompute the checksum and compare, then check version compatibility.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        let computed = self.compute_checksum()?;
        if computed != self.checksum {
            return Err(EnvelopeError::BadChecksum {
                stored: self.checksum.clone(),
                computed,
            });
        }
        let supported = major_of(ENVELOPE_VERSION);
        if major_of(&self.header.version) != supported {
            return Err(EnvelopeError::Version {
                found: self.header.version.clone(),
                major: supported,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Format(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Format(e.to_string()))?;
        if let serde_json::Value::Array(items) = &envelope.payload {
            if envelope.metadata.batch_size != items.len() {
                return Err(EnvelopeError::Format(format!(
                    "batch_size {} does not match payload length {}",
                    envelope.metadata.batch_size,
                    items.len()
                )));
            }
        }
        Ok(envelope)
    }

    /// Decode the payload body using the metadata data-type tag as the
    /// discriminator. The tag is authoritative; the body is never sniffed.
    pub fn typed_payload(&self) -> Result<Payload, EnvelopeError> {
        let value = self.payload.clone();
        let payload = match self.metadata.data_type {
            DataType::StockRealtime => Payload::Stocks(
                serde_json::from_value(value).map_err(|e| EnvelopeError::Format(e.to_string()))?,
            ),
            DataType::IndexRealtime => Payload::Indices(
                serde_json::from_value(value).map_err(|e| EnvelopeError::Format(e.to_string()))?,
            ),
            DataType::Historical => Payload::Historical(
                serde_json::from_value(value).map_err(|e| EnvelopeError::Format(e.to_string()))?,
            ),
        };
        Ok(payload)
    }
}

fn major_of(version: &str) -> u32 {
    version
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StockData;
    use chrono::Utc;

    fn stock_batch() -> Payload {
        let mut a = StockData::empty("600000", Utc::now());
        a.name = "浦发银行".to_string();
        a.price = 10.5;
        a.volume = 123_400.0;
        let mut b = StockData::empty("000001", Utc::now());
        b.name = "平安银行".to_string();
        b.price = 11.2;
        b.volume = 98_700.0;
        Payload::Stocks(vec![a, b])
    }

    #[test]
    fn test_new_sets_batch_size_and_checksum() {
        let env = Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
            .unwrap();
        assert_eq!(env.metadata.batch_size, 2);
        assert!(env.checksum.starts_with("sha256:"));
        assert_eq!(env.checksum.len(), "sha256:".len() + 64);
        env.verify().unwrap();
    }

    #[test]
    fn test_roundtrip_preserves_and_verifies() {
        let env = Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
            .unwrap();
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
        decoded.verify().unwrap();

        match decoded.typed_payload().unwrap() {
            Payload::Stocks(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].symbol, "600000");
                assert_eq!(records[1].name, "平安银行");
            }
            other => panic!("wrong payload variant: {:?}", other.data_type()),
        }
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let env = Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
            .unwrap();
        let mut bytes = env.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let tampered = text.replace("10.5", "99.9");
        assert_ne!(text, tampered);
        bytes = tampered.into_bytes();

        let decoded = Envelope::decode(&bytes).unwrap();
        assert!(matches!(
            decoded.verify(),
            Err(EnvelopeError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_set_market_info_recomputes_checksum() {
        let mut env =
            Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
                .unwrap();
        let before = env.checksum.clone();
        env.set_market_info("cn_a", Some("morning")).unwrap();
        assert_ne!(env.checksum, before);
        assert_eq!(env.metadata.market, "cn_a");
        assert_eq!(env.metadata.session.as_deref(), Some("morning"));
        env.verify().unwrap();
    }

    #[test]
    fn test_major_version_mismatch_rejected() {
        let mut env =
            Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
                .unwrap();
        env.header.version = "2.0".to_string();
        env.checksum = env.compute_checksum().unwrap();
        assert!(matches!(env.verify(), Err(EnvelopeError::Version { .. })));

        // Minor bumps stay compatible.
        env.header.version = "1.3".to_string();
        env.checksum = env.compute_checksum().unwrap();
        env.verify().unwrap();
    }

    #[test]
    fn test_batch_size_mismatch_is_format_error() {
        let mut env =
            Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
                .unwrap();
        env.metadata.batch_size = 7;
        let bytes = env.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(EnvelopeError::Format(_))
        ));
    }

    #[test]
    fn test_garbage_bytes_are_format_error() {
        assert!(matches!(
            Envelope::decode(b"not json at all"),
            Err(EnvelopeError::Format(_))
        ));
    }

    #[test]
    fn test_discriminator_governs_payload_decoding() {
        let env = Envelope::new("fetcher-1", "tencent", DataType::StockRealtime, stock_batch())
            .unwrap();
        let bytes = env.encode().unwrap();
        let mut decoded = Envelope::decode(&bytes).unwrap();
        // Force the wrong discriminator: the stock body no longer decodes.
        decoded.metadata.data_type = DataType::IndexRealtime;
        assert!(decoded.typed_payload().is_err());
    }

    #[test]
    fn test_empty_batch() {
        let env = Envelope::new(
            "fetcher-1",
            "tencent",
            DataType::StockRealtime,
            Payload::Stocks(vec![]),
        )
        .unwrap();
        assert_eq!(env.metadata.batch_size, 0);
        env.verify().unwrap();
    }
}
