//! Domain model for the inference ledger read layer.
//!
//! The ledger records inferences grouped into episodes, plus asynchronous
//! feedback rows keyed by metric name. This crate owns everything that does
//! not need a database handle:
//! - [`LedgerId`], the time-sortable identifier used as primary key and cursor.
//! - [`PageRequest`] / [`PageCursor`] keyset pagination validation.
//! - [`MetricConfig`] predicates and [`latest_feedback_by_target`] resolution.
//! - [`curate`], the pure curation filter shared by every store backend.
//! - [`LedgerConfig`], the TOML file declaring functions and metrics.
//! - [`LedgerQueries`], the query surface store backends implement.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
}

/// Time-sortable 128-bit identifier shared by inferences, episodes and feedback.
///
/// Ordering follows the numeric ULID value. The canonical 26-character text
/// form sorts lexicographically in the same order, which is what the store
/// relies on when comparing identifiers in SQL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LedgerId(pub Ulid);

impl LedgerId {
    pub const MIN: Self = Self(Ulid(0));
    pub const MAX: Self = Self(Ulid(u128::MAX));

    /// Generates a fresh identifier stamped with the current time.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, random))
    }

    /// Parses a canonical (or lowercase) ULID string.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid identifier {raw:?}: {err}")))
    }

    #[must_use]
    pub fn timestamp_ms(self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Creation time encoded in the identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the encoded milliseconds fall
    /// outside the representable date range.
    pub fn timestamp(self) -> Result<OffsetDateTime, LedgerError> {
        let millis = i64::try_from(self.timestamp_ms()).map_err(|_| {
            LedgerError::Validation(format!("identifier timestamp out of range: {self}"))
        })?;
        from_unix_ms(millis)
    }
}

impl Display for LedgerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LedgerId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    Chat,
    Json,
}

impl FunctionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(Self::Chat),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    None,
    #[default]
    Auto,
    Required,
    Specific(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub strict: bool,
}

/// Output contract of a function: free-form chat with optional tools, or
/// structured JSON validated against a schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantShape {
    Chat {
        #[serde(default)]
        tools: Vec<ToolDefinition>,
        #[serde(default)]
        tool_choice: ToolChoice,
        #[serde(default)]
        parallel_tool_calls: bool,
    },
    Json {
        #[serde(default)]
        output_schema: Value,
    },
}

impl VariantShape {
    #[must_use]
    pub fn chat() -> Self {
        Self::Chat {
            tools: Vec::new(),
            tool_choice: ToolChoice::default(),
            parallel_tool_calls: false,
        }
    }

    #[must_use]
    pub fn json() -> Self {
        Self::Json {
            output_schema: Value::Null,
        }
    }

    #[must_use]
    pub fn function_type(&self) -> FunctionType {
        match self {
            Self::Chat { .. } => FunctionType::Chat,
            Self::Json { .. } => FunctionType::Json,
        }
    }

    /// Decodes a shape descriptor such as `{"type":"json"}`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for malformed JSON or an
    /// unrecognized `type` tag.
    pub fn parse_json(raw: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(raw)
            .map_err(|err| LedgerError::Configuration(format!("invalid variant shape: {err}")))
    }
}

/// One recorded request/response execution of a function variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inference {
    pub id: LedgerId,
    pub function_name: String,
    pub variant_name: String,
    pub episode_id: LedgerId,
    pub shape: VariantShape,
    pub input: Value,
    pub output: Value,
    #[serde(with = "rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceInput {
    pub id: Option<LedgerId>,
    pub function_name: String,
    pub variant_name: String,
    pub episode_id: LedgerId,
    pub shape: VariantShape,
    pub input: Value,
    pub output: Value,
}

impl InferenceInput {
    /// Validates an inference before append.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when names are blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.function_name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "function_name MUST be provided".to_string(),
            ));
        }

        if self.variant_name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "variant_name MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// Aggregate view over the inferences sharing an `episode_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Episode {
    pub episode_id: LedgerId,
    pub count: u64,
    #[serde(with = "rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub end_time: OffsetDateTime,
    pub last_inference_id: LedgerId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Boolean,
    Float,
    Demonstration,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::Demonstration => "demonstration",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "boolean" => Some(Self::Boolean),
            "float" => Some(Self::Float),
            "demonstration" => Some(Self::Demonstration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricOptimize {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricLevel {
    #[default]
    Inference,
    Episode,
}

impl MetricLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::Episode => "episode",
        }
    }
}

/// How feedback rows for a metric are interpreted during curation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricConfig {
    Boolean {
        optimize: MetricOptimize,
        level: MetricLevel,
    },
    Float {
        optimize: MetricOptimize,
        level: MetricLevel,
    },
    /// Selected by presence of a demonstration row under this metric's own
    /// name. Demonstrations recorded under any other metric name do not count.
    Demonstration {
        #[serde(default)]
        level: MetricLevel,
    },
}

impl MetricConfig {
    #[must_use]
    pub fn kind(self) -> MetricKind {
        match self {
            Self::Boolean { .. } => MetricKind::Boolean,
            Self::Float { .. } => MetricKind::Float,
            Self::Demonstration { .. } => MetricKind::Demonstration,
        }
    }

    #[must_use]
    pub fn level(self) -> MetricLevel {
        match self {
            Self::Boolean { level, .. }
            | Self::Float { level, .. }
            | Self::Demonstration { level } => level,
        }
    }

    /// Decodes a metric config such as
    /// `{"type":"boolean","optimize":"max","level":"inference"}`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for malformed JSON or an
    /// unrecognized metric `type`.
    pub fn parse_json(raw: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(raw)
            .map_err(|err| LedgerError::Configuration(format!("invalid metric config: {err}")))
    }

    /// Whether an effective feedback value satisfies this metric.
    ///
    /// Boolean metrics ignore `optimize` and `threshold`. Demonstrations only
    /// need to exist. Values of a different kind never qualify.
    #[must_use]
    pub fn admits(self, value: &FeedbackValue, threshold: f64) -> bool {
        match (self, value) {
            (Self::Boolean { .. }, FeedbackValue::Boolean(flag)) => *flag,
            (
                Self::Float {
                    optimize: MetricOptimize::Max,
                    ..
                },
                FeedbackValue::Float(score),
            ) => *score >= threshold,
            (
                Self::Float {
                    optimize: MetricOptimize::Min,
                    ..
                },
                FeedbackValue::Float(score),
            ) => *score <= threshold,
            (Self::Demonstration { .. }, FeedbackValue::Demonstration(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeedbackValue {
    Boolean(bool),
    Float(f64),
    Demonstration(Value),
}

impl FeedbackValue {
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Boolean(_) => MetricKind::Boolean,
            Self::Float(_) => MetricKind::Float,
            Self::Demonstration(_) => MetricKind::Demonstration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub feedback_seq: i64,
    pub feedback_id: LedgerId,
    pub metric_name: String,
    pub target_id: LedgerId,
    pub value: FeedbackValue,
    #[serde(with = "rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackInput {
    pub feedback_id: Option<LedgerId>,
    pub metric_name: String,
    pub target_id: LedgerId,
    pub value: FeedbackValue,
    #[serde(with = "rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl FeedbackInput {
    /// Validates a feedback row before append.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a blank metric name, a
    /// non-finite float or a non-UTC timestamp.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.metric_name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "metric_name MUST be provided".to_string(),
            ));
        }

        if let FeedbackValue::Float(score) = self.value {
            if !score.is_finite() {
                return Err(LedgerError::Validation(
                    "float feedback MUST be finite".to_string(),
                ));
            }
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(LedgerError::Validation(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }
        unix_ns(self.occurred_at)?;

        Ok(())
    }
}

/// Keyset pagination parameters. At most one of `before`/`after` may be set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub before: Option<LedgerId>,
    pub after: Option<LedgerId>,
    pub page_size: u32,
}

impl PageRequest {
    #[must_use]
    pub fn latest(page_size: u32) -> Self {
        Self {
            before: None,
            after: None,
            page_size,
        }
    }

    #[must_use]
    pub fn before(id: LedgerId, page_size: u32) -> Self {
        Self {
            before: Some(id),
            after: None,
            page_size,
        }
    }

    #[must_use]
    pub fn after(id: LedgerId, page_size: u32) -> Self {
        Self {
            before: None,
            after: Some(id),
            page_size,
        }
    }

    /// Resolves the request into a single cursor.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when both cursors are set or the
    /// page size is zero.
    pub fn cursor(&self) -> Result<PageCursor, LedgerError> {
        if self.page_size == 0 {
            return Err(LedgerError::Validation(
                "page_size MUST be >= 1".to_string(),
            ));
        }

        match (self.before, self.after) {
            (Some(_), Some(_)) => Err(LedgerError::Validation(
                "cannot specify both 'before' and 'after' cursors".to_string(),
            )),
            (Some(id), None) => Ok(PageCursor::Before(id)),
            (None, Some(id)) => Ok(PageCursor::After(id)),
            (None, None) => Ok(PageCursor::Latest),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    Latest,
    Before(LedgerId),
    After(LedgerId),
}

impl PageCursor {
    /// `After` pages are scanned upward from the cursor so that the rows
    /// closest to it are selected, then flipped back to newest-first.
    #[must_use]
    pub fn scans_upward(self) -> bool {
        matches!(self, Self::After(_))
    }
}

/// Restores newest-first order on a page scanned in the cursor's direction.
#[must_use]
pub fn finish_page<T>(mut rows: Vec<T>, cursor: PageCursor) -> Vec<T> {
    if cursor.scans_upward() {
        rows.reverse();
    }
    rows
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableBounds {
    pub first_id: Option<LedgerId>,
    pub last_id: Option<LedgerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantCount {
    pub variant_name: String,
    pub inference_count: u64,
    pub last_inference_id: LedgerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurationMetric {
    pub name: String,
    pub config: MetricConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurationRequest {
    pub function_name: String,
    pub shape: VariantShape,
    pub metric: Option<CurationMetric>,
    pub threshold: f64,
    pub limit: Option<usize>,
}

impl CurationRequest {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a blank function or metric
    /// name, or a non-finite threshold.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.function_name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "function_name MUST be provided".to_string(),
            ));
        }

        if let Some(metric) = &self.metric {
            if metric.name.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "metric name MUST be provided when a metric config is given".to_string(),
                ));
            }
        }

        if !self.threshold.is_finite() {
            return Err(LedgerError::Validation(
                "threshold MUST be finite".to_string(),
            ));
        }

        Ok(())
    }
}

/// Minimal projection of an inference needed to decide curation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceKey {
    pub id: LedgerId,
    pub episode_id: LedgerId,
}

pub trait CurationTarget {
    fn inference_id(&self) -> LedgerId;
    fn episode_id(&self) -> LedgerId;

    fn target_for(&self, level: MetricLevel) -> LedgerId {
        match level {
            MetricLevel::Inference => self.inference_id(),
            MetricLevel::Episode => self.episode_id(),
        }
    }
}

impl CurationTarget for Inference {
    fn inference_id(&self) -> LedgerId {
        self.id
    }

    fn episode_id(&self) -> LedgerId {
        self.episode_id
    }
}

impl CurationTarget for InferenceKey {
    fn inference_id(&self) -> LedgerId {
        self.id
    }

    fn episode_id(&self) -> LedgerId {
        self.episode_id
    }
}

/// Picks the effective feedback row per target: latest `occurred_at`, ties
/// broken by the highest `feedback_seq`.
#[must_use]
pub fn latest_feedback_by_target(rows: &[FeedbackRecord]) -> BTreeMap<LedgerId, &FeedbackRecord> {
    let mut latest: BTreeMap<LedgerId, &FeedbackRecord> = BTreeMap::new();
    for row in rows {
        let replace = latest.get(&row.target_id).map_or(true, |current| {
            (row.occurred_at, row.feedback_seq) > (current.occurred_at, current.feedback_seq)
        });
        if replace {
            latest.insert(row.target_id, row);
        }
    }
    latest
}

/// Filters `candidates` down to those whose effective feedback satisfies
/// `metric`, preserving candidate order and truncating to `limit`.
///
/// Without a metric every candidate qualifies. Feedback rows for other
/// metric names or kinds are ignored.
#[must_use]
pub fn curate<'a, T: CurationTarget>(
    candidates: &'a [T],
    metric: Option<&CurationMetric>,
    feedback: &[FeedbackRecord],
    threshold: f64,
    limit: Option<usize>,
) -> Vec<&'a T> {
    let cap = limit.unwrap_or(usize::MAX);

    let Some(metric) = metric else {
        return candidates.iter().take(cap).collect();
    };

    let relevant = feedback
        .iter()
        .filter(|row| row.metric_name == metric.name && row.value.kind() == metric.config.kind())
        .cloned()
        .collect::<Vec<_>>();
    let effective = latest_feedback_by_target(&relevant);
    let level = metric.config.level();

    candidates
        .iter()
        .filter(|candidate| {
            effective
                .get(&candidate.target_for(level))
                .is_some_and(|row| metric.config.admits(&row.value, threshold))
        })
        .take(cap)
        .collect()
}

/// Declared functions and metrics, loaded from `ledger.toml`.
///
/// ```toml
/// [functions.extract_entities]
/// type = "json"
///
/// [metrics.exact_match]
/// type = "boolean"
/// optimize = "max"
/// level = "inference"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub functions: BTreeMap<String, VariantShape>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
}

impl LedgerConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the TOML is malformed or
    /// declares an unrecognized function or metric type.
    pub fn from_toml_str(raw: &str) -> Result<Self, LedgerError> {
        toml::from_str(raw)
            .map_err(|err| LedgerError::Configuration(format!("invalid ledger config: {err}")))
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `name` is not declared.
    pub fn function(&self, name: &str) -> Result<&VariantShape, LedgerError> {
        self.functions
            .get(name)
            .ok_or_else(|| LedgerError::Configuration(format!("unknown function: {name}")))
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `name` is not declared.
    pub fn metric(&self, name: &str) -> Result<&MetricConfig, LedgerError> {
        self.metrics
            .get(name)
            .ok_or_else(|| LedgerError::Configuration(format!("unknown metric: {name}")))
    }
}

/// Read surface of an inference ledger backend.
pub trait LedgerQueries {
    #[allow(clippy::missing_errors_doc)]
    fn query_inference_table(&self, page: &PageRequest) -> anyhow::Result<Vec<Inference>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_episode_table(&self, page: &PageRequest) -> anyhow::Result<Vec<Episode>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_inference_table_bounds(&self) -> anyhow::Result<TableBounds>;

    #[allow(clippy::missing_errors_doc)]
    fn query_episode_table_bounds(&self) -> anyhow::Result<TableBounds>;

    #[allow(clippy::missing_errors_doc)]
    fn count_inferences_for_function(
        &self,
        function_name: &str,
        shape: &VariantShape,
    ) -> anyhow::Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn count_feedbacks_for_metric(
        &self,
        function_name: &str,
        shape: &VariantShape,
        metric_name: &str,
        config: &MetricConfig,
    ) -> anyhow::Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn count_curated_inferences(&self, request: &CurationRequest) -> anyhow::Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn get_curated_inferences(&self, request: &CurationRequest) -> anyhow::Result<Vec<Inference>>;

    fn check_connection(&self) -> bool;
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `value` is not RFC3339 or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `millis` is outside the supported range.
pub fn from_unix_ms(millis: i64) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| LedgerError::Validation(format!("timestamp out of range: {err}")))
}

/// Nanoseconds since the Unix epoch, the storage form of feedback times.
///
/// # Errors
/// Returns [`LedgerError::Validation`] outside roughly 1677..2262, the range
/// an `i64` nanosecond count can hold.
pub fn unix_ns(value: OffsetDateTime) -> Result<i64, LedgerError> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| {
        LedgerError::Validation(format!(
            "timestamp out of range for nanosecond storage: {value}"
        ))
    })
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `nanos` is not a valid datetime.
pub fn from_unix_ns(nanos: i64) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| LedgerError::Validation(format!("timestamp out of range: {err}")))
}

/// Serde adapter writing timestamps as RFC3339 UTC strings.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    #[allow(clippy::missing_errors_doc, clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn id_at(timestamp_ms: u64, random: u128) -> LedgerId {
        LedgerId::from_parts(timestamp_ms, random)
    }

    fn feedback(
        seq: i64,
        metric_name: &str,
        target_id: LedgerId,
        value: FeedbackValue,
        occurred_at: &str,
    ) -> FeedbackRecord {
        FeedbackRecord {
            feedback_seq: seq,
            feedback_id: id_at(1_700_000_000_000, u128::try_from(seq).unwrap_or_default()),
            metric_name: metric_name.to_string(),
            target_id,
            value,
            occurred_at: must_utc(occurred_at),
        }
    }

    fn boolean_metric(name: &str, level: MetricLevel) -> CurationMetric {
        CurationMetric {
            name: name.to_string(),
            config: MetricConfig::Boolean {
                optimize: MetricOptimize::Max,
                level,
            },
        }
    }

    #[test]
    fn canonical_text_order_matches_identifier_order() {
        let mut ids = (0..64_u64)
            .map(|step| id_at(1_700_000_000_000 + step * 37, u128::from(step * 7919)))
            .collect::<Vec<_>>();
        ids.push(LedgerId::MIN);
        ids.push(LedgerId::MAX);

        let mut by_value = ids.clone();
        by_value.sort();
        let mut by_text = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
        by_text.sort();

        assert_eq!(
            by_value.iter().map(ToString::to_string).collect::<Vec<_>>(),
            by_text
        );
    }

    #[test]
    fn newer_identifiers_compare_greater() {
        let older = id_at(1_700_000_000_000, u128::MAX >> 48);
        let newer = id_at(1_700_000_000_001, 0);
        assert!(newer > older);
        assert_eq!(must_ok(newer.timestamp()).unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn identifier_parse_round_trips_canonical_text() {
        let id = id_at(1_700_000_000_000, 42);
        let parsed = must_ok(LedgerId::parse(&id.to_string().to_lowercase()));
        assert_eq!(parsed, id);
        assert!(LedgerId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn page_request_rejects_both_cursors() {
        let id = LedgerId::new();
        let request = PageRequest {
            before: Some(id),
            after: Some(id),
            page_size: 10,
        };
        let err = request.cursor();
        assert_eq!(
            err,
            Err(LedgerError::Validation(
                "cannot specify both 'before' and 'after' cursors".to_string()
            ))
        );
    }

    #[test]
    fn page_request_rejects_zero_page_size() {
        assert!(matches!(
            PageRequest::latest(0).cursor(),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn after_pages_are_flipped_to_newest_first() {
        let cursor = must_ok(PageRequest::after(LedgerId::MIN, 3).cursor());
        assert_eq!(finish_page(vec![1, 2, 3], cursor), vec![3, 2, 1]);

        let cursor = must_ok(PageRequest::before(LedgerId::MAX, 3).cursor());
        assert_eq!(finish_page(vec![3, 2, 1], cursor), vec![3, 2, 1]);
    }

    #[test]
    fn metric_config_parses_tagged_json() {
        let config = must_ok(MetricConfig::parse_json(
            r#"{"type":"float","optimize":"min","level":"episode"}"#,
        ));
        assert_eq!(
            config,
            MetricConfig::Float {
                optimize: MetricOptimize::Min,
                level: MetricLevel::Episode,
            }
        );

        let demo = must_ok(MetricConfig::parse_json(r#"{"type":"demonstration"}"#));
        assert_eq!(demo.level(), MetricLevel::Inference);
    }

    #[test]
    fn metric_config_rejects_unknown_type() {
        let err = MetricConfig::parse_json(r#"{"type":"comment","level":"inference"}"#);
        match err {
            Err(LedgerError::Configuration(message)) => {
                assert!(message.contains("comment"), "message={message}");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn variant_shape_accepts_dashboard_descriptors() {
        let chat = must_ok(VariantShape::parse_json(
            r#"{"type":"chat","variants":{},"tools":[],"tool_choice":"none","parallel_tool_calls":false}"#,
        ));
        assert_eq!(chat.function_type(), FunctionType::Chat);

        let json_shape = must_ok(VariantShape::parse_json(r#"{"type":"json","variants":{}}"#));
        assert_eq!(json_shape, VariantShape::json());
    }

    #[test]
    fn boolean_predicate_ignores_optimize_and_threshold() {
        let min_config = MetricConfig::Boolean {
            optimize: MetricOptimize::Min,
            level: MetricLevel::Inference,
        };
        assert!(min_config.admits(&FeedbackValue::Boolean(true), 99.0));
        assert!(!min_config.admits(&FeedbackValue::Boolean(false), -99.0));
    }

    #[test]
    fn float_predicate_follows_optimize_direction() {
        let max = MetricConfig::Float {
            optimize: MetricOptimize::Max,
            level: MetricLevel::Inference,
        };
        let min = MetricConfig::Float {
            optimize: MetricOptimize::Min,
            level: MetricLevel::Inference,
        };

        assert!(max.admits(&FeedbackValue::Float(0.8), 0.8));
        assert!(!max.admits(&FeedbackValue::Float(0.79), 0.8));
        assert!(min.admits(&FeedbackValue::Float(0.8), 0.8));
        assert!(!min.admits(&FeedbackValue::Float(0.81), 0.8));
        assert!(!max.admits(&FeedbackValue::Boolean(true), 0.0));
    }

    #[test]
    fn demonstration_predicate_is_presence_only() {
        let config = MetricConfig::Demonstration {
            level: MetricLevel::Inference,
        };
        assert!(config.admits(&FeedbackValue::Demonstration(Value::Null), f64::MAX));
        assert!(!config.admits(&FeedbackValue::Float(1.0), 0.0));
    }

    #[test]
    fn latest_feedback_wins_by_timestamp_then_sequence() {
        let target = id_at(1_700_000_000_000, 1);
        let rows = vec![
            feedback(1, "m", target, FeedbackValue::Boolean(true), "2026-02-07T12:00:02Z"),
            feedback(2, "m", target, FeedbackValue::Boolean(false), "2026-02-07T12:00:01Z"),
        ];
        let latest = latest_feedback_by_target(&rows);
        assert_eq!(latest[&target].feedback_seq, 1);

        let tied = vec![
            feedback(3, "m", target, FeedbackValue::Boolean(false), "2026-02-07T12:00:00Z"),
            feedback(4, "m", target, FeedbackValue::Boolean(true), "2026-02-07T12:00:00Z"),
        ];
        let latest = latest_feedback_by_target(&tied);
        assert_eq!(latest[&target].feedback_seq, 4);
    }

    #[test]
    fn curate_uses_latest_value_not_any_value() {
        let first = InferenceKey {
            id: id_at(1_700_000_000_002, 0),
            episode_id: id_at(1_700_000_000_000, 0),
        };
        let second = InferenceKey {
            id: id_at(1_700_000_000_001, 0),
            episode_id: id_at(1_700_000_000_000, 1),
        };
        let rows = vec![
            feedback(1, "exact", first.id, FeedbackValue::Boolean(true), "2026-02-07T12:00:00Z"),
            feedback(2, "exact", first.id, FeedbackValue::Boolean(false), "2026-02-07T12:00:01Z"),
            feedback(3, "exact", second.id, FeedbackValue::Boolean(false), "2026-02-07T12:00:00Z"),
            feedback(4, "exact", second.id, FeedbackValue::Boolean(true), "2026-02-07T12:00:01Z"),
        ];

        let candidates = [first, second];
        let selected = curate(
            &candidates,
            Some(&boolean_metric("exact", MetricLevel::Inference)),
            &rows,
            0.0,
            None,
        );
        assert_eq!(selected, vec![&second]);
    }

    #[test]
    fn episode_level_feedback_selects_whole_episode() {
        let episode = id_at(1_700_000_000_000, 9);
        let members = [
            InferenceKey {
                id: id_at(1_700_000_000_003, 0),
                episode_id: episode,
            },
            InferenceKey {
                id: id_at(1_700_000_000_002, 0),
                episode_id: episode,
            },
            InferenceKey {
                id: id_at(1_700_000_000_001, 0),
                episode_id: id_at(1_700_000_000_000, 10),
            },
        ];
        let rows = vec![feedback(
            1,
            "solved",
            episode,
            FeedbackValue::Boolean(true),
            "2026-02-07T12:00:00Z",
        )];

        let selected = curate(
            &members,
            Some(&boolean_metric("solved", MetricLevel::Episode)),
            &rows,
            0.0,
            None,
        );
        assert_eq!(selected, vec![&members[0], &members[1]]);
    }

    #[test]
    fn curate_without_metric_keeps_all_and_honors_limit() {
        let keys = (0..5_u64)
            .map(|step| InferenceKey {
                id: id_at(1_700_000_000_000 + step, 0),
                episode_id: id_at(1_700_000_000_000, u128::from(step)),
            })
            .collect::<Vec<_>>();

        assert_eq!(curate(&keys, None, &[], 0.0, None).len(), 5);
        assert_eq!(curate(&keys, None, &[], 0.0, Some(2)).len(), 2);
    }

    #[test]
    fn curate_ignores_feedback_of_other_metrics_and_kinds() {
        let key = InferenceKey {
            id: id_at(1_700_000_000_001, 0),
            episode_id: id_at(1_700_000_000_000, 0),
        };
        let rows = vec![
            feedback(1, "other", key.id, FeedbackValue::Boolean(true), "2026-02-07T12:00:00Z"),
            feedback(2, "exact", key.id, FeedbackValue::Float(1.0), "2026-02-07T12:00:00Z"),
        ];

        let candidates = [key];
        let selected = curate(
            &candidates,
            Some(&boolean_metric("exact", MetricLevel::Inference)),
            &rows,
            0.0,
            None,
        );
        assert!(selected.is_empty());
    }

    #[test]
    fn ledger_config_resolves_functions_and_metrics() {
        let config = must_ok(LedgerConfig::from_toml_str(
            r#"
[functions.extract_entities]
type = "json"

[functions.write_haiku]
type = "chat"
tool_choice = "none"

[metrics.exact_match]
type = "boolean"
optimize = "max"
level = "inference"

[metrics.haiku_rating_episode]
type = "float"
optimize = "max"
level = "episode"
"#,
        ));

        assert_eq!(
            must_ok(config.function("extract_entities")).function_type(),
            FunctionType::Json
        );
        assert_eq!(
            must_ok(config.metric("haiku_rating_episode")).level(),
            MetricLevel::Episode
        );
        assert!(matches!(
            config.metric("missing"),
            Err(LedgerError::Configuration(_))
        ));
    }

    #[test]
    fn ledger_config_rejects_unknown_metric_type() {
        let result = LedgerConfig::from_toml_str(
            r#"
[metrics.vibes]
type = "sentiment"
level = "inference"
"#,
        );
        assert!(matches!(result, Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn episode_serializes_rfc3339_timestamps() {
        let episode = Episode {
            episode_id: id_at(1_700_000_000_000, 1),
            count: 2,
            start_time: must_utc("2026-02-07T12:00:00Z"),
            end_time: must_utc("2026-02-07T12:00:05Z"),
            last_inference_id: id_at(1_700_000_000_005, 2),
        };

        let value = must_ok(serde_json::to_value(&episode));
        assert_eq!(value["start_time"], json!("2026-02-07T12:00:00Z"));
        assert_eq!(value["count"], json!(2));
        assert_eq!(
            value["last_inference_id"],
            json!(episode.last_inference_id.to_string())
        );
    }

    #[test]
    fn feedback_input_rejects_non_finite_scores() {
        let input = FeedbackInput {
            feedback_id: None,
            metric_name: "rating".to_string(),
            target_id: LedgerId::new(),
            value: FeedbackValue::Float(f64::NAN),
            occurred_at: must_utc("2026-02-07T12:00:00Z"),
        };
        assert!(matches!(input.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn sample_config_declares_every_metric_kind() {
        let config = must_ok(LedgerConfig::from_toml_str(include_str!(
            "../../../demos/ledger.toml"
        )));

        assert_eq!(
            must_ok(config.function("extract_entities")).function_type(),
            FunctionType::Json
        );
        assert_eq!(
            must_ok(config.function("write_haiku")).function_type(),
            FunctionType::Chat
        );
        assert_eq!(
            must_ok(config.metric("haiku_rating_episode")).level(),
            MetricLevel::Episode
        );
        assert_eq!(
            must_ok(config.metric("demonstration")).kind(),
            MetricKind::Demonstration
        );
    }
}
