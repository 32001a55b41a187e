//! Building `data` rows from parallel time and value arrays.

use std::sync::Arc;

use arrow::{
    array::{
        ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
        TimestampMicrosecondArray,
    },
    error::ArrowError,
};
use chrono::{DateTime, Utc};
use divelake_core::lake_table::{SignalType, UTC, data_schema};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

/// Errors raised while turning a signal into rows.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SignalError {
    /// `times` and `values` differ in length.
    #[snafu(display("{times} timestamps but {values} values"))]
    LengthMismatch {
        /// Number of timestamps.
        times: usize,
        /// Number of values.
        values: usize,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Values of types that cannot share one value column.
    #[snafu(display("values mix incompatible types: {}", found.join(", ")))]
    MixedTypes {
        /// Type tags encountered.
        found: Vec<&'static str>,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Building the batch failed.
    #[snafu(display("Cannot build signal rows: {source}"))]
    Build {
        /// Underlying Arrow error.
        source: ArrowError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Identity of the deployment a signal was recorded in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Animal id.
    pub animal: String,
    /// Deployment id.
    pub deployment: String,
    /// Recording id, when the deployment holds several recordings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<String>,
}

impl SignalMetadata {
    /// Metadata without a recording id.
    pub fn new(animal: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            animal: animal.into(),
            deployment: deployment.into(),
            recording: None,
        }
    }

    /// Attach a recording id.
    pub fn with_recording(mut self, recording: impl Into<String>) -> Self {
        self.recording = Some(recording.into());
        self
    }
}

/// One reading of a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    /// Floating point reading.
    Double(f64),
    /// Integer reading.
    Int(i64),
    /// Boolean reading.
    Bool(bool),
    /// Text reading.
    Str(String),
}

impl SignalValue {
    fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Double(_) => SignalType::Double,
            SignalValue::Int(_) => SignalType::Int,
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::Str(_) => SignalType::Str,
        }
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Double(v)
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        SignalValue::Int(v)
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self {
        SignalValue::Bool(v)
    }
}

impl From<String> for SignalValue {
    fn from(v: String) -> Self {
        SignalValue::Str(v)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        SignalValue::Str(v.to_string())
    }
}

/// The single `data_type` tag for `values`.
///
/// Integers mixed with doubles widen to doubles. Empty input is tagged
/// `double`. Any other mix is rejected.
pub fn infer_signal_type(values: &[SignalValue]) -> Result<SignalType, SignalError> {
    let mut found: Vec<SignalType> = Vec::new();
    for ty in values.iter().map(SignalValue::signal_type) {
        if !found.contains(&ty) {
            found.push(ty);
        }
    }

    match found.as_slice() {
        [] => Ok(SignalType::Double),
        [single] => Ok(*single),
        [a, b] if is_numeric(*a) && is_numeric(*b) => Ok(SignalType::Double),
        _ => MixedTypesSnafu {
            found: found.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        }
        .fail(),
    }
}

fn is_numeric(ty: SignalType) -> bool {
    matches!(ty, SignalType::Double | SignalType::Int)
}

/// A channel's readings plus the columns shared by all of them.
pub(crate) struct SignalRows<'a> {
    pub dataset: &'a str,
    pub metadata: &'a SignalMetadata,
    pub group: Option<&'a str>,
    pub class: &'a str,
    pub label: &'a str,
}

impl SignalRows<'_> {
    /// Rows in the fixed `data` schema, one per reading.
    pub(crate) fn to_batch(
        &self,
        times: &[DateTime<Utc>],
        values: &[SignalValue],
    ) -> Result<RecordBatch, SignalError> {
        ensure!(
            times.len() == values.len(),
            LengthMismatchSnafu {
                times: times.len(),
                values: values.len(),
            }
        );
        let ty = infer_signal_type(values)?;
        let n = times.len();

        let text = |v: &str| Arc::new(StringArray::from(vec![v; n])) as ArrayRef;
        let optional = |v: Option<&str>| Arc::new(StringArray::from(vec![v; n])) as ArrayRef;
        let datetime = TimestampMicrosecondArray::from_iter_values(
            times.iter().map(DateTime::<Utc>::timestamp_micros),
        )
        .with_timezone(UTC);

        let mut val_dbl: Option<ArrayRef> = None;
        let mut val_int: Option<ArrayRef> = None;
        let mut val_bool: Option<ArrayRef> = None;
        let mut val_str: Option<ArrayRef> = None;
        match ty {
            SignalType::Double => {
                let array: Float64Array = values
                    .iter()
                    .map(|v| match v {
                        SignalValue::Double(d) => Some(*d),
                        SignalValue::Int(i) => Some(*i as f64),
                        _ => None,
                    })
                    .collect();
                val_dbl = Some(Arc::new(array));
            }
            SignalType::Int => {
                let array: Int64Array = values
                    .iter()
                    .map(|v| match v {
                        SignalValue::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                val_int = Some(Arc::new(array));
            }
            SignalType::Bool => {
                let array: BooleanArray = values
                    .iter()
                    .map(|v| match v {
                        SignalValue::Bool(b) => Some(*b),
                        _ => None,
                    })
                    .collect();
                val_bool = Some(Arc::new(array));
            }
            SignalType::Str => {
                let array: StringArray = values
                    .iter()
                    .map(|v| match v {
                        SignalValue::Str(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                val_str = Some(Arc::new(array));
            }
        }

        let nulls_f64 = || Arc::new(Float64Array::new_null(n)) as ArrayRef;
        let nulls_i64 = || Arc::new(Int64Array::new_null(n)) as ArrayRef;
        let nulls_bool = || Arc::new(BooleanArray::new_null(n)) as ArrayRef;
        let nulls_str = || Arc::new(StringArray::new_null(n)) as ArrayRef;

        RecordBatch::try_new(
            data_schema(),
            vec![
                text(self.dataset),
                text(&self.metadata.animal),
                text(&self.metadata.deployment),
                optional(self.metadata.recording.as_deref()),
                optional(self.group),
                text(self.class),
                text(self.label),
                Arc::new(datetime),
                val_dbl.unwrap_or_else(nulls_f64),
                val_int.unwrap_or_else(nulls_i64),
                val_bool.unwrap_or_else(nulls_bool),
                val_str.unwrap_or_else(nulls_str),
                text(ty.as_str()),
            ],
        )
        .context(BuildSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Float64Type;
    use chrono::TimeZone;

    #[test]
    fn ints_and_doubles_widen_to_double() -> Result<(), SignalError> {
        let values = vec![SignalValue::Int(1), SignalValue::Double(2.5)];
        assert_eq!(infer_signal_type(&values)?, SignalType::Double);
        assert_eq!(infer_signal_type(&[SignalValue::Int(3)])?, SignalType::Int);
        assert_eq!(infer_signal_type(&[])?, SignalType::Double);
        Ok(())
    }

    #[test]
    fn incompatible_types_are_rejected() {
        let values = vec![SignalValue::from(1.0), SignalValue::from("surface")];
        let err = infer_signal_type(&values).err();
        assert!(matches!(err, Some(SignalError::MixedTypes { .. })));
    }

    #[test]
    fn rows_populate_exactly_one_value_column() -> Result<(), Box<dyn std::error::Error>> {
        let metadata = SignalMetadata::new("seal-1", "d1").with_recording("r1");
        let rows = SignalRows {
            dataset: "ds",
            metadata: &metadata,
            group: Some("pressure"),
            class: "sensor",
            label: "depth",
        };
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().ok_or("bad date")?;
        let times = vec![t0, t0 + chrono::TimeDelta::seconds(1)];
        let batch = rows.to_batch(&times, &[SignalValue::Int(1), SignalValue::Double(2.0)])?;

        assert_eq!(batch.schema(), data_schema());
        assert_eq!(batch.num_rows(), 2);
        let dbl = batch
            .column_by_name("val_dbl")
            .ok_or("val_dbl")?
            .as_primitive::<Float64Type>();
        assert_eq!(dbl.values().to_vec(), vec![1.0, 2.0]);
        assert_eq!(batch.column_by_name("val_int").ok_or("val_int")?.null_count(), 2);
        let tags = batch.column_by_name("data_type").ok_or("data_type")?.as_string::<i32>();
        assert_eq!(tags.value(0), "double");
        Ok(())
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let metadata = SignalMetadata::new("seal-1", "d1");
        let rows = SignalRows {
            dataset: "ds",
            metadata: &metadata,
            group: None,
            class: "sensor",
            label: "depth",
        };
        let err = rows.to_batch(&[], &[SignalValue::Double(1.0)]).err();
        assert!(matches!(err, Some(SignalError::LengthMismatch { .. })));
    }
}
