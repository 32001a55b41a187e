//! Parameters of the read operations.
//!
//! Requests are plain structs with builder-style setters. Every filter is
//! optional; a missing or empty filter does not constrain the result.

use crate::{
    cache::CacheKey,
    predicate::{DateRange, FilterValues, Predicate},
};

/// Filters and shaping options of [`crate::DivePond::get_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    /// Channel labels.
    pub labels: Option<FilterValues>,
    /// Animal ids.
    pub animals: Option<FilterValues>,
    /// Deployment ids.
    pub deployments: Option<FilterValues>,
    /// Recording ids.
    pub recordings: Option<FilterValues>,
    /// Channel groups.
    pub groups: Option<FilterValues>,
    /// Sensor classes.
    pub classes: Option<FilterValues>,
    /// Inclusive time window on `datetime`.
    pub date_range: Option<DateRange>,
    /// Target rate in Hz, applied per label.
    pub frequency: Option<f64>,
    /// Maximum rows returned, counted after resampling.
    pub limit: Option<usize>,
    /// Return one column per label instead of the long form.
    pub pivoted: bool,
    /// Shift emitted datetimes by the deployment's timezone offset.
    pub apply_timezone_offset: bool,
    /// Append a `timestamp` column of epoch seconds.
    pub add_timestamp_column: bool,
    /// Read and write the query cache.
    pub use_cache: bool,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            labels: None,
            animals: None,
            deployments: None,
            recordings: None,
            groups: None,
            classes: None,
            date_range: None,
            frequency: None,
            limit: None,
            pivoted: false,
            apply_timezone_offset: false,
            add_timestamp_column: false,
            use_cache: true,
        }
    }
}

impl DataRequest {
    /// Request for every reading, long form, cached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on labels.
    pub fn labels(mut self, labels: impl Into<FilterValues>) -> Self {
        self.labels = Some(labels.into());
        self
    }

    /// Filter on animal ids.
    pub fn animals(mut self, animals: impl Into<FilterValues>) -> Self {
        self.animals = Some(animals.into());
        self
    }

    /// Filter on deployment ids.
    pub fn deployments(mut self, deployments: impl Into<FilterValues>) -> Self {
        self.deployments = Some(deployments.into());
        self
    }

    /// Filter on recording ids.
    pub fn recordings(mut self, recordings: impl Into<FilterValues>) -> Self {
        self.recordings = Some(recordings.into());
        self
    }

    /// Filter on channel groups.
    pub fn groups(mut self, groups: impl Into<FilterValues>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Filter on sensor classes.
    pub fn classes(mut self, classes: impl Into<FilterValues>) -> Self {
        self.classes = Some(classes.into());
        self
    }

    /// Restrict to an inclusive time window.
    pub fn date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Resample every label to `hz`.
    pub fn frequency(mut self, hz: f64) -> Self {
        self.frequency = Some(hz);
        self
    }

    /// Cap the number of returned rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return the wide form.
    pub fn pivoted(mut self, pivoted: bool) -> Self {
        self.pivoted = pivoted;
        self
    }

    /// Shift datetimes to the deployment's local time.
    pub fn apply_timezone_offset(mut self, apply: bool) -> Self {
        self.apply_timezone_offset = apply;
        self
    }

    /// Append the `timestamp` column.
    pub fn add_timestamp_column(mut self, add: bool) -> Self {
        self.add_timestamp_column = add;
        self
    }

    /// Enable or bypass the query cache.
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub(crate) fn predicate(&self) -> Predicate {
        Predicate::new()
            .with_values("label", self.labels.as_ref())
            .with_values("animal", self.animals.as_ref())
            .with_values("deployment", self.deployments.as_ref())
            .with_values("recording", self.recordings.as_ref())
            .with_values("group", self.groups.as_ref())
            .with_values("class", self.classes.as_ref())
            .with_time_range("datetime", self.date_range.as_ref())
    }

    fn filter_key(&self, method: &str, dataset: &str) -> CacheKey {
        CacheKey::new(method)
            .arg("dataset", dataset)
            .values("labels", self.labels.as_ref())
            .values("animal_ids", self.animals.as_ref())
            .values("deployment_ids", self.deployments.as_ref())
            .values("recording_ids", self.recordings.as_ref())
            .values("groups", self.groups.as_ref())
            .values("classes", self.classes.as_ref())
            .date_range("date_range", self.date_range.as_ref())
    }

    /// Key of the cached result. Presentation-only options applied after the
    /// cache (`add_timestamp_column`) are not part of it.
    pub(crate) fn cache_key(&self, dataset: &str) -> CacheKey {
        self.filter_key("get_data", dataset)
            .arg("frequency", self.frequency)
            .arg("limit", self.limit)
            .arg("pivoted", self.pivoted)
            .arg("apply_timezone_offset", self.apply_timezone_offset)
    }

    pub(crate) fn estimate_key(&self, dataset: &str) -> CacheKey {
        self.filter_key("estimate_data_size", dataset)
    }

    /// The deployment whose timezone applies, if any: the smallest id of the
    /// deployment filter, so requests sharing a cache key share the offset.
    pub(crate) fn timezone_deployment(&self) -> Option<String> {
        first_canonical(self.deployments.as_ref())
    }
}

/// Filters and shaping options of [`crate::DivePond::get_events`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventsRequest {
    /// Animal ids.
    pub animals: Option<FilterValues>,
    /// Deployment ids.
    pub deployments: Option<FilterValues>,
    /// Recording ids.
    pub recordings: Option<FilterValues>,
    /// Event keys.
    pub event_keys: Option<FilterValues>,
    /// Inclusive time window on `datetime_start`.
    pub date_range: Option<DateRange>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
    /// Shift emitted datetimes by the deployment's timezone offset.
    pub apply_timezone_offset: bool,
    /// Append `timestamp_start` and `timestamp_end` columns of epoch seconds.
    pub add_timestamp_columns: bool,
    /// Read and write the query cache.
    pub use_cache: bool,
}

impl Default for EventsRequest {
    fn default() -> Self {
        Self {
            animals: None,
            deployments: None,
            recordings: None,
            event_keys: None,
            date_range: None,
            limit: None,
            apply_timezone_offset: false,
            add_timestamp_columns: false,
            use_cache: true,
        }
    }
}

impl EventsRequest {
    /// Request for every event, cached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on animal ids.
    pub fn animals(mut self, animals: impl Into<FilterValues>) -> Self {
        self.animals = Some(animals.into());
        self
    }

    /// Filter on deployment ids.
    pub fn deployments(mut self, deployments: impl Into<FilterValues>) -> Self {
        self.deployments = Some(deployments.into());
        self
    }

    /// Filter on recording ids.
    pub fn recordings(mut self, recordings: impl Into<FilterValues>) -> Self {
        self.recordings = Some(recordings.into());
        self
    }

    /// Filter on event keys.
    pub fn event_keys(mut self, keys: impl Into<FilterValues>) -> Self {
        self.event_keys = Some(keys.into());
        self
    }

    /// Restrict to events starting inside an inclusive time window.
    pub fn date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Cap the number of returned rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Shift datetimes to the deployment's local time.
    pub fn apply_timezone_offset(mut self, apply: bool) -> Self {
        self.apply_timezone_offset = apply;
        self
    }

    /// Append the epoch-second columns.
    pub fn add_timestamp_columns(mut self, add: bool) -> Self {
        self.add_timestamp_columns = add;
        self
    }

    /// Enable or bypass the query cache.
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub(crate) fn predicate(&self) -> Predicate {
        Predicate::new()
            .with_values("animal", self.animals.as_ref())
            .with_values("deployment", self.deployments.as_ref())
            .with_values("recording", self.recordings.as_ref())
            .with_values("event_key", self.event_keys.as_ref())
            .with_time_range("datetime_start", self.date_range.as_ref())
    }

    pub(crate) fn cache_key(&self, dataset: &str) -> CacheKey {
        CacheKey::new("get_events")
            .arg("dataset", dataset)
            .values("animal_ids", self.animals.as_ref())
            .values("deployment_ids", self.deployments.as_ref())
            .values("recording_ids", self.recordings.as_ref())
            .values("event_keys", self.event_keys.as_ref())
            .date_range("date_range", self.date_range.as_ref())
            .arg("limit", self.limit)
            .arg("apply_timezone_offset", self.apply_timezone_offset)
    }

    pub(crate) fn timezone_deployment(&self) -> Option<String> {
        first_canonical(self.deployments.as_ref())
    }
}

fn first_canonical(values: Option<&FilterValues>) -> Option<String> {
    values.and_then(|v| v.canonical().into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_order_does_not_change_the_key() {
        let a = DataRequest::new().labels(["a", "b"]).animals("seal-1");
        let b = DataRequest::new().animals("seal-1").labels(["b", "a"]);
        assert_eq!(a.cache_key("ds").digest(), b.cache_key("ds").digest());
    }

    #[test]
    fn presentation_options_are_not_keyed() {
        let plain = DataRequest::new().labels("depth");
        let stamped = plain.clone().add_timestamp_column(true).use_cache(false);
        assert_eq!(plain.cache_key("ds"), stamped.cache_key("ds"));

        let resampled = plain.clone().frequency(5.0);
        assert_ne!(plain.cache_key("ds"), resampled.cache_key("ds"));
        assert_ne!(plain.cache_key("ds"), plain.estimate_key("ds"));
    }

    #[test]
    fn empty_filters_behave_like_missing_ones() {
        let none = DataRequest::new();
        let empty = DataRequest::new().labels(Vec::<String>::new());
        assert_eq!(none.cache_key("ds"), empty.cache_key("ds"));
        assert!(empty.predicate().is_empty());
    }

    #[test]
    fn timezone_deployment_ignores_filter_order() {
        let forward = DataRequest::new().deployments(["d2", "d1"]).apply_timezone_offset(true);
        let reverse = DataRequest::new().deployments(["d1", "d2"]).apply_timezone_offset(true);
        assert_eq!(forward.cache_key("ds"), reverse.cache_key("ds"));
        assert_eq!(forward.timezone_deployment().as_deref(), Some("d1"));
        assert_eq!(reverse.timezone_deployment(), forward.timezone_deployment());

        let events = EventsRequest::new().deployments(["d9", "d3"]);
        assert_eq!(events.timezone_deployment().as_deref(), Some("d3"));
        assert_eq!(DataRequest::new().timezone_deployment(), None);
    }

    #[test]
    fn events_predicate_targets_event_columns() {
        let request = EventsRequest::new().event_keys(["dive", "surface"]);
        assert_eq!(
            request.predicate().to_string(),
            r#"event_key IN ("dive", "surface")"#
        );
        assert!(request.use_cache);
    }
}
