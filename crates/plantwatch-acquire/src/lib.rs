//! Acquisition of plant readings by walking the API's sequential ids.
//!
//! The walk stops after a run of consecutive "plant not found" responses.
//! Probing is behind the [`Probe`] trait so the termination logic can be
//! driven without a network.

use std::num::NonZeroU32;
use std::pin::pin;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use plantwatch_core::RawRecord;
use plantwatch_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "plantwatch-acquire";

/// Error message the API uses for ids with no plant behind them.
pub const NOT_FOUND_MESSAGE: &str = "plant not found";

pub const DEFAULT_NOT_FOUND_LIMIT: u32 = 5;
pub const DEFAULT_SENSOR_ERROR_RESET_CEILING: u64 = 50;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe for plant {entity_id} timed out")]
    Timeout { entity_id: u64 },
    #[error("probe for plant {entity_id} failed: {source}")]
    Fetch {
        entity_id: u64,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("invalid acquisition config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("response for plant {entity_id} is a json {found}, expected an object")]
    MalformedResponse { entity_id: u64, found: &'static str },
}

/// One request per plant id.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, entity_id: u64) -> Result<JsonValue, ProbeError>;
}

/// Probes `GET {base_url}{id}`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    base_url: String,
    http: HttpFetcher,
}

impl HttpProbe {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, entity_id: u64) -> Result<JsonValue, ProbeError> {
        let url = format!("{}{}", self.base_url, entity_id);
        self.http.fetch_json(&url).await.map_err(|err| match err {
            FetchError::Timeout { .. } => ProbeError::Timeout { entity_id },
            source => ProbeError::Fetch { entity_id, source },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success(RawRecord),
    SensorError { record: RawRecord, message: String },
    NotFound,
}

impl ProbeOutcome {
    pub fn into_record(self) -> Option<RawRecord> {
        match self {
            ProbeOutcome::Success(record) | ProbeOutcome::SensorError { record, .. } => {
                Some(record)
            }
            ProbeOutcome::NotFound => None,
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// The message carried by a truthy `error` value. Empty strings, `false` and
/// `null` are not errors.
pub fn error_message(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null | JsonValue::Bool(false) => None,
        JsonValue::String(s) if s.is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Classify one API response. Sensor-error records that do not name their
/// plant are stamped with the probed id so they stay attributable.
pub fn classify_response(entity_id: u64, value: JsonValue) -> Result<ProbeOutcome, AcquireError> {
    let JsonValue::Object(map) = value else {
        return Err(AcquireError::MalformedResponse {
            entity_id,
            found: json_kind(&value),
        });
    };
    let mut record = RawRecord::from(map);

    match record.get("error").and_then(error_message) {
        None => Ok(ProbeOutcome::Success(record)),
        Some(message) if message == NOT_FOUND_MESSAGE => Ok(ProbeOutcome::NotFound),
        Some(message) => {
            if record.get("plant_id").map_or(true, JsonValue::is_null) {
                record.insert("plant_id", JsonValue::from(entity_id));
            }
            Ok(ProbeOutcome::SensorError { record, message })
        }
    }
}

/// When to stop walking ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub not_found_limit: NonZeroU32,
    /// Sensor errors reset the not-found run only for ids up to this value;
    /// `None` lets every sensor error reset it.
    pub sensor_error_reset_ceiling: Option<u64>,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            not_found_limit: NonZeroU32::new(DEFAULT_NOT_FOUND_LIMIT).unwrap_or(NonZeroU32::MIN),
            sensor_error_reset_ceiling: Some(DEFAULT_SENSOR_ERROR_RESET_CEILING),
        }
    }
}

/// Pure state of an id walk: which id comes next and how long the current
/// run of not-found responses is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeWalk {
    policy: TerminationPolicy,
    next_id: u64,
    consecutive_not_found: u32,
    finished: bool,
}

impl ProbeWalk {
    pub fn new(policy: TerminationPolicy) -> Self {
        Self::starting_at(policy, 1)
    }

    pub fn starting_at(policy: TerminationPolicy, first_id: u64) -> Self {
        Self {
            policy,
            next_id: first_id,
            consecutive_not_found: 0,
            finished: false,
        }
    }

    /// The id to probe next, or `None` once the walk has terminated.
    pub fn next_id(&self) -> Option<u64> {
        (!self.finished).then_some(self.next_id)
    }

    pub fn consecutive_not_found(&self) -> u32 {
        self.consecutive_not_found
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record the outcome for the current id and advance.
    pub fn observe(&mut self, outcome: &ProbeOutcome) {
        if self.finished {
            return;
        }
        let id = self.next_id;
        match outcome {
            ProbeOutcome::NotFound => self.consecutive_not_found += 1,
            ProbeOutcome::Success(_) => self.consecutive_not_found = 0,
            ProbeOutcome::SensorError { .. } => {
                let resets = self
                    .policy
                    .sensor_error_reset_ceiling
                    .map_or(true, |ceiling| id <= ceiling);
                if resets {
                    self.consecutive_not_found = 0;
                }
            }
        }
        if self.consecutive_not_found >= self.policy.not_found_limit.get() {
            self.finished = true;
        } else {
            self.next_id += 1;
        }
    }
}

/// Lazily probe ids as dictated by `walk`. The stream ends when the walk
/// terminates or right after the first error it yields.
pub fn probe_outcomes<'a, P>(
    probe: &'a P,
    walk: ProbeWalk,
) -> impl Stream<Item = Result<(u64, ProbeOutcome), AcquireError>> + 'a
where
    P: Probe + ?Sized,
{
    stream::unfold(Some(walk), move |state| async move {
        let mut walk = state?;
        let entity_id = walk.next_id()?;
        let outcome = match probe.probe(entity_id).await {
            Ok(value) => classify_response(entity_id, value),
            Err(err) => Err(AcquireError::from(err)),
        };
        match outcome {
            Ok(outcome) => {
                walk.observe(&outcome);
                Some((Ok((entity_id, outcome)), Some(walk)))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
}

#[derive(Debug, Clone)]
pub struct AcquirerConfig {
    base_url: String,
    policy: TerminationPolicy,
}

impl AcquirerConfig {
    /// Validates everything up front so a bad config fails before any request.
    pub fn new(
        base_url: impl Into<String>,
        not_found_limit: u32,
        sensor_error_reset_ceiling: Option<u64>,
    ) -> Result<Self, AcquireError> {
        let base_url = base_url.into();
        let parsed = reqwest::Url::parse(&base_url).map_err(|err| {
            AcquireError::InvalidConfig(format!("base url {base_url:?} is not a url: {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AcquireError::InvalidConfig(format!(
                "base url {base_url:?} must use http or https"
            )));
        }
        let not_found_limit = NonZeroU32::new(not_found_limit).ok_or_else(|| {
            AcquireError::InvalidConfig("not_found_limit must be at least 1".to_string())
        })?;
        Ok(Self {
            base_url,
            policy: TerminationPolicy {
                not_found_limit,
                sensor_error_reset_ceiling,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }
}

#[derive(Debug, Clone)]
pub struct Acquirer {
    config: AcquirerConfig,
}

impl Acquirer {
    pub fn new(config: AcquirerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcquirerConfig {
        &self.config
    }

    /// Walk ids from 1 and collect every success and sensor-error record in
    /// probing order. Any probe failure aborts the whole acquisition.
    pub async fn acquire<P: Probe + ?Sized>(&self, probe: &P) -> Result<Vec<RawRecord>, AcquireError> {
        let mut outcomes = pin!(probe_outcomes(probe, ProbeWalk::new(self.config.policy)));
        let mut records = Vec::new();
        let mut probed = 0u64;

        while let Some(item) = outcomes.next().await {
            let (entity_id, outcome) = item?;
            probed += 1;
            match &outcome {
                ProbeOutcome::Success(_) => info!(entity_id, "plant reading received"),
                ProbeOutcome::SensorError { message, .. } => {
                    warn!(entity_id, error = %message, "plant returned an error message")
                }
                ProbeOutcome::NotFound => warn!(entity_id, "plant not found"),
            }
            records.extend(outcome.into_record());
        }

        info!(probed, collected = records.len(), "acquisition finished");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses, then answers "not found" forever.
    struct ScriptedProbe {
        responses: Mutex<VecDeque<Result<JsonValue, ProbeError>>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedProbe {
        fn new(responses: Vec<Result<JsonValue, ProbeError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, entity_id: u64) -> Result<JsonValue, ProbeError> {
            self.calls.lock().unwrap().push(entity_id);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(not_found()))
        }
    }

    fn ok(id: u64) -> JsonValue {
        json!({"plant_id": id, "temperature": 12.5, "soil_moisture": 40.0})
    }

    fn sensor_error() -> JsonValue {
        json!({"error": "plant sensor fault"})
    }

    fn not_found() -> JsonValue {
        json!({"error": NOT_FOUND_MESSAGE})
    }

    fn acquirer(limit: u32, ceiling: Option<u64>) -> Acquirer {
        Acquirer::new(AcquirerConfig::new("http://plants.test/plants/", limit, ceiling).unwrap())
    }

    #[tokio::test]
    async fn stops_after_the_fifth_consecutive_not_found() {
        let probe = ScriptedProbe::new(vec![
            Ok(ok(1)),
            Ok(ok(2)),
            Ok(not_found()),
            Ok(not_found()),
            Ok(not_found()),
            Ok(not_found()),
            Ok(not_found()),
            Ok(ok(8)),
        ]);
        let records = acquirer(5, Some(50)).acquire(&probe).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("plant_id"), Some(&json!(1)));
        assert_eq!(records[1].get("plant_id"), Some(&json!(2)));
        assert_eq!(probe.calls(), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn sensor_errors_are_kept_and_stamped_with_their_id() {
        let probe = ScriptedProbe::new(vec![Ok(ok(1)), Ok(sensor_error())]);
        let records = acquirer(2, Some(50)).acquire(&probe).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("plant_id"), Some(&json!(2)));
        assert_eq!(records[1].get("error"), Some(&json!("plant sensor fault")));
    }

    #[tokio::test]
    async fn sensor_errors_past_the_ceiling_do_not_reset_the_run() {
        let script = || {
            vec![
                Ok(not_found()),
                Ok(not_found()),
                Ok(sensor_error()),
                Ok(not_found()),
                Ok(not_found()),
                Ok(not_found()),
            ]
        };

        // id 3 > ceiling 2: the run continues through the sensor error.
        let capped = ScriptedProbe::new(script());
        acquirer(5, Some(2)).acquire(&capped).await.unwrap();
        assert_eq!(capped.calls(), vec![1, 2, 3, 4, 5, 6]);

        // No ceiling: the sensor error at id 3 restarts the count.
        let uncapped = ScriptedProbe::new(script());
        acquirer(5, None).acquire(&uncapped).await.unwrap();
        assert_eq!(uncapped.calls(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn timeouts_abort_without_partial_results() {
        let probe = ScriptedProbe::new(vec![
            Ok(ok(1)),
            Ok(ok(2)),
            Err(ProbeError::Timeout { entity_id: 3 }),
            Ok(ok(4)),
        ]);
        let err = acquirer(5, Some(50)).acquire(&probe).await.unwrap_err();

        assert!(matches!(err, AcquireError::Probe(ProbeError::Timeout { entity_id: 3 })));
        assert_eq!(probe.calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn non_object_responses_are_fatal() {
        let probe = ScriptedProbe::new(vec![Ok(json!([1, 2, 3]))]);
        let err = acquirer(5, Some(50)).acquire(&probe).await.unwrap_err();
        assert!(matches!(
            err,
            AcquireError::MalformedResponse { entity_id: 1, found: "array" }
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_probing() {
        assert!(matches!(
            AcquirerConfig::new("http://plants.test/", 0, None),
            Err(AcquireError::InvalidConfig(_))
        ));
        assert!(matches!(
            AcquirerConfig::new("plants.test/", 5, None),
            Err(AcquireError::InvalidConfig(_))
        ));
        assert!(matches!(
            AcquirerConfig::new("ftp://plants.test/", 5, None),
            Err(AcquireError::InvalidConfig(_))
        ));
    }

    #[test]
    fn falsy_error_fields_count_as_success() {
        for value in [json!({"error": ""}), json!({"error": null}), json!({"error": false})] {
            assert!(matches!(
                classify_response(1, value).unwrap(),
                ProbeOutcome::Success(_)
            ));
        }
        let outcome = classify_response(4, json!({"error": 500, "plant_id": 9})).unwrap();
        match outcome {
            ProbeOutcome::SensorError { record, message } => {
                assert_eq!(message, "500");
                assert_eq!(record.get("plant_id"), Some(&json!(9)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn walks_can_restart_from_any_id() {
        let policy = TerminationPolicy {
            not_found_limit: NonZeroU32::new(2).unwrap(),
            sensor_error_reset_ceiling: None,
        };
        let mut walk = ProbeWalk::starting_at(policy, 40);
        assert_eq!(walk.next_id(), Some(40));
        walk.observe(&ProbeOutcome::NotFound);
        assert_eq!(walk.next_id(), Some(41));
        walk.observe(&ProbeOutcome::NotFound);
        assert!(walk.is_finished());
        assert_eq!(walk.next_id(), None);
        assert_eq!(walk.consecutive_not_found(), 2);
    }
}
