//! Descriptive metadata supplied by an external collaborator.
//!
//! The lake itself stores readings only. Display names, units, colors and a
//! deployment's timezone live elsewhere (a metadata database, a spreadsheet
//! export) and reach the pond through a [`MetadataProvider`]. Everything a
//! provider returns is optional enrichment: lookups that fail are logged by
//! the caller and treated as "no metadata".

use std::{collections::HashMap, error::Error, fmt, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

/// Errors raised by metadata providers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetadataError {
    /// The metadata file could not be read.
    #[snafu(display("Cannot read metadata file {path}: {source}"))]
    ReadFile {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The metadata file is not valid JSON of the expected shape.
    #[snafu(display("Invalid metadata file {path}: {source}"))]
    ParseFile {
        /// File path.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The backing service failed.
    #[snafu(display("Metadata service error: {source}"))]
    Service {
        /// Error reported by the provider implementation.
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Descriptive record for one channel, keyed by a label or a group name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Label or group name the record describes.
    pub channel_id: String,
    /// Human-friendly name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Physical units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Preferred plot color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// For a group channel, the labels it is made of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// Source of channel metadata and deployment timezones.
#[async_trait]
pub trait MetadataProvider: Send + Sync + fmt::Debug {
    /// Metadata for `channel_id` in `dataset`, if known.
    async fn channel_metadata(
        &self,
        dataset: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelMetadata>, MetadataError>;

    /// Offset of the deployment's local time from UTC, in hours, if known.
    async fn deployment_timezone_offset(
        &self,
        deployment: &str,
    ) -> Result<Option<f64>, MetadataError>;
}

/// Provider that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataProvider for NoMetadata {
    async fn channel_metadata(
        &self,
        _dataset: &str,
        _channel_id: &str,
    ) -> Result<Option<ChannelMetadata>, MetadataError> {
        Ok(None)
    }

    async fn deployment_timezone_offset(
        &self,
        _deployment: &str,
    ) -> Result<Option<f64>, MetadataError> {
        Ok(None)
    }
}

/// In-memory provider, optionally loaded from a JSON file of the form
///
/// ```json
/// {
///   "channels": [{"channel_id": "depth", "units": "m"}],
///   "deployments": {"2019-11-08_apfo-001": 13.0}
/// }
/// ```
///
/// Channel records apply to every dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticMetadata {
    #[serde(default)]
    channels: Vec<ChannelMetadata>,
    #[serde(default)]
    deployments: HashMap<String, f64>,
}

impl StaticMetadata {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a channel record.
    pub fn with_channel(mut self, metadata: ChannelMetadata) -> Self {
        self.channels.retain(|c| c.channel_id != metadata.channel_id);
        self.channels.push(metadata);
        self
    }

    /// Set the timezone offset of a deployment.
    pub fn with_timezone_offset(mut self, deployment: impl Into<String>, hours: f64) -> Self {
        self.deployments.insert(deployment.into(), hours);
        self
    }

    /// Load records from a JSON file.
    pub async fn from_json_file(path: &Path) -> Result<Self, MetadataError> {
        let display = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .context(ReadFileSnafu {
                path: display.clone(),
            })?;
        serde_json::from_str(&text).context(ParseFileSnafu { path: display })
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn channel_metadata(
        &self,
        _dataset: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelMetadata>, MetadataError> {
        Ok(self
            .channels
            .iter()
            .find(|c| c.channel_id == channel_id)
            .cloned())
    }

    async fn deployment_timezone_offset(
        &self,
        deployment: &str,
    ) -> Result<Option<f64>, MetadataError> {
        Ok(self.deployments.get(deployment).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn static_provider_answers_from_its_records() -> TestResult {
        let provider = StaticMetadata::new()
            .with_channel(ChannelMetadata {
                channel_id: "depth".to_string(),
                units: Some("m".to_string()),
                ..ChannelMetadata::default()
            })
            .with_timezone_offset("d1", -8.0);

        let depth = provider.channel_metadata("any", "depth").await?;
        assert_eq!(depth.and_then(|m| m.units).as_deref(), Some("m"));
        assert!(provider.channel_metadata("any", "temp").await?.is_none());
        assert_eq!(provider.deployment_timezone_offset("d1").await?, Some(-8.0));
        assert_eq!(provider.deployment_timezone_offset("d2").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn loads_from_json() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("metadata.json");
        std::fs::write(
            &path,
            r#"{"channels":[{"channel_id":"imu","children":["ax","ay"]}],
                "deployments":{"d1":13.0}}"#,
        )?;

        let provider = StaticMetadata::from_json_file(&path).await?;
        let imu = provider.channel_metadata("ds", "imu").await?.ok_or("imu missing")?;
        assert_eq!(imu.children, vec!["ax", "ay"]);
        assert_eq!(provider.deployment_timezone_offset("d1").await?, Some(13.0));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_file_is_reported() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("metadata.json");
        std::fs::write(&path, "not json")?;
        assert!(matches!(
            StaticMetadata::from_json_file(&path).await,
            Err(MetadataError::ParseFile { .. })
        ));
        Ok(())
    }
}
