//! On-disk encoding of one cache entry.
//!
//! ```text
//! {"magic":"divelake-cache","version":1,"method":"get_data",...}\n
//! <payload bytes>
//! ```
//!
//! The JSON header line carries everything needed to expire or filter an
//! entry without decoding its payload.

use std::io::Cursor;

use arrow::{
    array::RecordBatch,
    compute::concat_batches,
    ipc::{reader::StreamReader, writer::StreamWriter},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use super::{ArrowSnafu, CacheError, CorruptEntrySnafu, JsonSnafu, TtlClass};

pub(crate) const MAGIC: &str = "divelake-cache";
pub(crate) const ENTRY_VERSION: u32 = 1;

/// How a payload is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Arrow IPC stream.
    ArrowIpc,
    /// JSON document.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryHeader {
    pub(crate) magic: String,
    pub(crate) version: u32,
    pub(crate) method: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) ttl_class: TtlClass,
    pub(crate) format: PayloadFormat,
}

impl EntryHeader {
    pub(crate) fn new(method: &str, ttl_class: TtlClass, format: PayloadFormat) -> Self {
        Self {
            magic: MAGIC.to_string(),
            version: ENTRY_VERSION,
            method: method.to_string(),
            created_at: Utc::now(),
            ttl_class,
            format,
        }
    }
}

pub(crate) fn encode(header: &EntryHeader, payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut out = serde_json::to_vec(header).context(JsonSnafu)?;
    out.push(b'\n');
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split an entry into its header and payload.
pub(crate) fn decode(bytes: &[u8]) -> Result<(EntryHeader, &[u8]), CacheError> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .context(CorruptEntrySnafu {
            reason: "missing header line",
        })?;
    let header: EntryHeader = serde_json::from_slice(&bytes[..newline]).context(JsonSnafu)?;
    ensure!(
        header.magic == MAGIC && header.version == ENTRY_VERSION,
        CorruptEntrySnafu {
            reason: format!("unsupported entry {} v{}", header.magic, header.version),
        }
    );
    Ok((header, &bytes[newline + 1..]))
}

/// A value that can be stored in the cache.
pub trait CachePayload: Sized {
    /// Serialization used for this type.
    const FORMAT: PayloadFormat;

    /// Serialize the value.
    fn encode(&self) -> Result<Vec<u8>, CacheError>;

    /// Deserialize a value written by [`CachePayload::encode`].
    fn decode(bytes: &[u8]) -> Result<Self, CacheError>;
}

impl CachePayload for RecordBatch {
    const FORMAT: PayloadFormat = PayloadFormat::ArrowIpc;

    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let mut buf = Vec::new();
        let mut writer = StreamWriter::try_new(&mut buf, &self.schema()).context(ArrowSnafu)?;
        writer.write(self).context(ArrowSnafu)?;
        writer.finish().context(ArrowSnafu)?;
        drop(writer);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let reader = StreamReader::try_new(Cursor::new(bytes), None).context(ArrowSnafu)?;
        let schema = reader.schema();
        let batches = reader.collect::<Result<Vec<_>, _>>().context(ArrowSnafu)?;
        concat_batches(&schema, &batches).context(ArrowSnafu)
    }
}

/// Implement [`CachePayload`] as JSON for serde types.
macro_rules! json_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CachePayload for $ty {
                const FORMAT: PayloadFormat = PayloadFormat::Json;

                fn encode(&self) -> Result<Vec<u8>, CacheError> {
                    serde_json::to_vec(self).context(JsonSnafu)
                }

                fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
                    serde_json::from_slice(bytes).context(JsonSnafu)
                }
            }
        )*
    };
}

json_payload!(
    f64,
    u64,
    Vec<String>,
    crate::channels::ChannelCatalog,
    Vec<crate::metadata::ChannelMetadata>,
    Vec<crate::pond::DeploymentSummary>,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::{
        array::{Float64Array, StringArray},
        datatypes::{DataType, Field, Schema},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn header_and_payload_split_at_the_first_newline() -> TestResult {
        let header = EntryHeader::new("get_events", TtlClass::Events, PayloadFormat::Json);
        let bytes = encode(&header, b"[1,\n2]")?;
        let (back, payload) = decode(&bytes)?;
        assert_eq!(back, header);
        assert_eq!(payload, b"[1,\n2]");
        Ok(())
    }

    #[test]
    fn foreign_files_are_rejected() {
        assert!(decode(b"no header here").is_err());
        assert!(decode(b"{\"magic\":\"other\"}\n").is_err());
    }

    #[test]
    fn record_batches_keep_schema_and_rows() -> TestResult {
        let schema = Arc::new(Schema::new(vec![
            Field::new("label", DataType::Utf8, false),
            Field::new("v", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Float64Array::from(vec![Some(1.0), None])),
            ],
        )?;
        let back = RecordBatch::decode(&batch.encode()?)?;
        assert_eq!(back, batch);

        let empty = batch.slice(0, 0);
        let back = RecordBatch::decode(&empty.encode()?)?;
        assert_eq!(back.num_rows(), 0);
        assert_eq!(back.schema(), batch.schema());
        Ok(())
    }
}
