//! Trending ranking engine for the Stem video feed.
//!
//! The engine is stateless: every operation is a pure function of the item
//! snapshot, the query, and the `now` supplied by the caller. The only state a
//! [`RankingEngine`] carries is its immutable [`RankingWeights`] ruleset.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RankingError {
    #[error("invalid page: {0}")]
    InvalidPage(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid sort mode: {0}")]
    InvalidSortMode(String),
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),
    #[error("invalid metrics: {0}")]
    InvalidMetrics(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RankingError {
    /// Stable machine-readable code used in the `{code, message}` error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPage(_) => "feed.invalid_page",
            Self::InvalidLimit(_) => "feed.invalid_limit",
            Self::InvalidSortMode(_) => "feed.invalid_sort_mode",
            Self::InvalidTimeRange(_) => "feed.invalid_time_range",
            Self::InvalidMetrics(_) => "feed.invalid_metrics",
            Self::InvalidTimestamp(_) => "feed.invalid_timestamp",
            Self::Configuration(_) => "feed.configuration",
        }
    }

    /// True when the caller supplied bad input (HTTP 400 class).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }

    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Trending,
    #[default]
    Recent,
    Popular,
}

impl SortMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Recent => "recent",
            Self::Popular => "popular",
        }
    }
}

impl Display for SortMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMode {
    type Err = RankingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "trending" => Ok(Self::Trending),
            "recent" => Ok(Self::Recent),
            "popular" => Ok(Self::Popular),
            _ => Err(RankingError::InvalidSortMode(format!(
                "`{value}` is not one of trending, recent, popular"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Day,
    Week,
    Month,
    #[default]
    All,
}

impl TimeRange {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::All => "all",
        }
    }

    /// Fixed window length; months are always 30 days. `None` for [`TimeRange::All`].
    #[must_use]
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Day => Some(Duration::DAY),
            Self::Week => Some(Duration::WEEK),
            Self::Month => Some(Duration::days(30)),
            Self::All => None,
        }
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = RankingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            _ => Err(RankingError::InvalidTimeRange(format!(
                "`{value}` is not one of day, week, month, all"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub views: u64,
    #[serde(alias = "watchTime")]
    pub watch_time_seconds: f64,
    pub completion_rate: f64,
    pub engagement_score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl Metrics {
    /// Checks the counter invariants at an ingestion boundary.
    ///
    /// # Errors
    /// Returns [`RankingError::InvalidMetrics`] for non-finite values, negative
    /// aggregates, or a completion rate outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), RankingError> {
        for (name, value) in [
            ("watchTimeSeconds", self.watch_time_seconds),
            ("engagementScore", self.engagement_score),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RankingError::InvalidMetrics(format!(
                    "{name} MUST be a finite value >= 0, got {value}"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.completion_rate) {
            return Err(RankingError::InvalidMetrics(format!(
                "completionRate MUST be in [0.0, 1.0], got {}",
                self.completion_rate
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metrics: Metrics,
}

impl Item {
    /// Decodes and validates one snapshot item from JSON.
    ///
    /// A negative `views` counter is reported as a metrics violation rather
    /// than a decode failure.
    ///
    /// # Errors
    /// Returns [`RankingError::InvalidMetrics`] when JSON decoding fails or
    /// the decoded item violates the metrics invariants.
    pub fn from_json(value: &Value) -> Result<Self, RankingError> {
        let id = value.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
        if let Some(views) = value
            .pointer("/metrics/views")
            .and_then(Value::as_i64)
            .filter(|views| *views < 0)
        {
            return Err(RankingError::InvalidMetrics(format!(
                "item {id}: views MUST be >= 0, got {views}"
            )));
        }

        let item: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankingError::InvalidMetrics(format!("invalid item JSON payload for {id}: {err}"))
        })?;
        item.validate()?;
        Ok(item)
    }

    /// # Errors
    /// Returns [`RankingError::InvalidMetrics`] when the id is blank or the
    /// attached metrics are out of range.
    pub fn validate(&self) -> Result<(), RankingError> {
        if self.id.trim().is_empty() {
            return Err(RankingError::InvalidMetrics(
                "item id MUST be non-empty".to_string(),
            ));
        }

        self.metrics.validate().map_err(|err| match err {
            RankingError::InvalidMetrics(message) => {
                RankingError::InvalidMetrics(format!("item {}: {message}", self.id))
            }
            other => other,
        })
    }

    #[must_use]
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}

impl AsRef<Item> for Item {
    fn as_ref(&self) -> &Item {
        self
    }
}

/// An item together with the trending score computed for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
    #[serde(flatten)]
    pub item: Item,
    pub trending_score: f64,
}

/// Tunable weights for the trending score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingWeights {
    pub ruleset_version: u32,
    pub view_weight: f64,
    pub watch_time_weight: f64,
    pub completion_weight: f64,
    pub engagement_weight: f64,
    pub decay_hours: f64,
}

impl RankingWeights {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            view_weight: 1.0,
            watch_time_weight: 2.0,
            completion_weight: 3.0,
            engagement_weight: 4.0,
            decay_hours: 48.0,
        }
    }

    /// Validates weight bounds.
    ///
    /// # Errors
    /// Returns [`RankingError::Configuration`] when a weight is negative or
    /// non-finite, or `decay_hours` is not strictly positive.
    pub fn validate(&self) -> Result<(), RankingError> {
        if self.ruleset_version == 0 {
            return Err(RankingError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("view_weight", self.view_weight),
            ("watch_time_weight", self.watch_time_weight),
            ("completion_weight", self.completion_weight),
            ("engagement_weight", self.engagement_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RankingError::Configuration(format!(
                    "{name} MUST be a finite value >= 0.0"
                )));
            }
        }

        if !self.decay_hours.is_finite() || self.decay_hours <= 0.0 {
            return Err(RankingError::Configuration(
                "decay_hours MUST be a finite value > 0.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a weights ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`RankingError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, RankingError> {
        let weights: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankingError::Configuration(format!("invalid weights JSON payload: {err}"))
        })?;
        weights.validate()?;
        Ok(weights)
    }

    /// Hours of inactivity after which a score has halved (`decay_hours * ln 2`).
    #[must_use]
    pub fn half_life_hours(&self) -> f64 {
        self.decay_hours * std::f64::consts::LN_2
    }
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self::v1()
    }
}

/// A validated feed query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    pub sort: SortMode,
    pub time_range: TimeRange,
    #[serde(default)]
    pub tags: Vec<String>,
    pub page: u32,
    pub limit: u32,
}

impl FeedQuery {
    /// # Errors
    /// Returns [`RankingError::InvalidPage`] or [`RankingError::InvalidLimit`]
    /// when either is zero.
    pub fn validate(&self) -> Result<(), RankingError> {
        check_page(self.page)?;
        check_limit(self.limit)
    }
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            sort: SortMode::default(),
            time_range: TimeRange::default(),
            tags: Vec::new(),
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Unparsed query parameters as they arrive from a query string.
///
/// Absent parameters take the feed defaults. Present parameters are parsed
/// strictly and never fall back to a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub sort: Option<String>,
    pub time_range: Option<String>,
    pub tags: Option<String>,
}

impl RawFeedQuery {
    /// Parses every parameter into a [`FeedQuery`].
    ///
    /// # Errors
    /// Returns the first validation error, checking page, limit, sort, then
    /// time range.
    pub fn validate(&self) -> Result<FeedQuery, RankingError> {
        let page = match self.page.as_deref() {
            Some(raw) => parse_positive(raw, RankingError::InvalidPage)?,
            None => DEFAULT_PAGE,
        };
        let limit = match self.limit.as_deref() {
            Some(raw) => parse_positive(raw, RankingError::InvalidLimit)?,
            None => DEFAULT_LIMIT,
        };
        let sort = match self.sort.as_deref() {
            Some(raw) => raw.trim().parse::<SortMode>()?,
            None => SortMode::default(),
        };
        let time_range = match self.time_range.as_deref() {
            Some(raw) => raw.trim().parse::<TimeRange>()?,
            None => TimeRange::default(),
        };

        Ok(FeedQuery {
            sort,
            time_range,
            tags: self.tags.as_deref().map(split_tags).unwrap_or_default(),
            page,
            limit,
        })
    }
}

fn parse_positive(raw: &str, error: fn(String) -> RankingError) -> Result<u32, RankingError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| error(format!("`{raw}` is not an integer")))?;
    if value < 1 {
        return Err(error(format!("MUST be >= 1, got {value}")));
    }
    u32::try_from(value).map_err(|_| error(format!("MUST be <= {}, got {value}", u32::MAX)))
}

/// Splits a comma separated tag list, dropping blanks and duplicates.
#[must_use]
pub fn split_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|tag| !tag.is_empty()) {
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_count: usize,
    pub total_pages: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            data: self.data.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankingEngine {
    weights: RankingWeights,
}

impl RankingEngine {
    /// # Errors
    /// Returns [`RankingError::Configuration`] when the weights are invalid.
    pub fn new(weights: RankingWeights) -> Result<Self, RankingError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    #[must_use]
    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Decay-weighted trending score of `metrics` at `now`.
    ///
    /// Never fails: out-of-range metrics are clamped and a `lastUpdated` in
    /// the future counts as zero elapsed hours.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, metrics: &Metrics, now: OffsetDateTime) -> f64 {
        if let Err(err) = metrics.validate() {
            warn!(error = %err, "clamping out-of-range metrics before scoring");
        }

        let weights = &self.weights;
        let base = metrics.views as f64 * weights.view_weight
            + sanitize(metrics.watch_time_seconds, f64::MAX) * weights.watch_time_weight
            + sanitize(metrics.completion_rate, 1.0) * weights.completion_weight
            + sanitize(metrics.engagement_score, f64::MAX) * weights.engagement_weight;
        let decay = (-hours_since(metrics.last_updated, now) / weights.decay_hours).exp();

        (base * decay).max(0.0)
    }

    /// Stable sort by `mode` with explicit tiebreaks.
    #[must_use]
    pub fn sort<T: AsRef<Item>>(
        &self,
        items: Vec<T>,
        mode: SortMode,
        now: OffsetDateTime,
    ) -> Vec<T> {
        self.rank(items, mode, now)
            .into_iter()
            .map(|(item, _)| item)
            .collect()
    }

    /// Runs tags filter, time range filter, sort, and paginate in that order.
    ///
    /// # Errors
    /// Returns [`RankingError::InvalidPage`] or [`RankingError::InvalidLimit`]
    /// before any filtering work when the query is malformed.
    pub fn query(
        &self,
        items: &[Item],
        query: &FeedQuery,
        now: OffsetDateTime,
    ) -> Result<Page<RankedItem>, RankingError> {
        query.validate()?;

        let candidates: Vec<&Item> = items.iter().collect();
        let tagged = filter_by_tags(&candidates, &query.tags);
        let in_range = filter_by_time_range(&tagged, query.time_range, now);
        debug!(
            total = items.len(),
            after_tags = tagged.len(),
            after_time_range = in_range.len(),
            sort = %query.sort,
            time_range = %query.time_range,
            "feed query filtered"
        );

        let ranked = self.rank(in_range, query.sort, now);
        let page = paginate(ranked, query.page, query.limit)?;
        debug!(
            page = page.pagination.page,
            returned = page.data.len(),
            total_pages = page.pagination.total_pages,
            "feed query paginated"
        );

        Ok(page.map(|(item, trending_score)| RankedItem {
            item: item.clone(),
            trending_score,
        }))
    }

    fn rank<T: AsRef<Item>>(
        &self,
        items: Vec<T>,
        mode: SortMode,
        now: OffsetDateTime,
    ) -> Vec<(T, f64)> {
        let mut ranked: Vec<(T, f64)> = items
            .into_iter()
            .map(|item| {
                let score = self.score(&item.as_ref().metrics, now);
                (item, score)
            })
            .collect();
        ranked.sort_by(|(left, left_score), (right, right_score)| {
            compare_ranked(mode, left.as_ref(), *left_score, right.as_ref(), *right_score)
        });
        ranked
    }
}

fn compare_ranked(
    mode: SortMode,
    left: &Item,
    left_score: f64,
    right: &Item,
    right_score: f64,
) -> Ordering {
    match mode {
        SortMode::Trending => right_score
            .total_cmp(&left_score)
            .then_with(|| right.created_at.cmp(&left.created_at))
            .then_with(|| left.id.cmp(&right.id)),
        SortMode::Recent => right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| left.id.cmp(&right.id)),
        SortMode::Popular => right
            .metrics
            .views
            .cmp(&left.metrics.views)
            .then_with(|| right_score.total_cmp(&left_score))
            .then_with(|| left.id.cmp(&right.id)),
    }
}

/// Keeps items created within `range` of `now`, inclusive of the boundary.
#[must_use]
pub fn filter_by_time_range<T>(items: &[T], range: TimeRange, now: OffsetDateTime) -> Vec<T>
where
    T: AsRef<Item> + Clone,
{
    let Some(window) = range.duration() else {
        return items.to_vec();
    };

    items
        .iter()
        .filter(|item| now - item.as_ref().created_at <= window)
        .cloned()
        .collect()
}

/// Keeps items carrying at least one of `tags`. An empty tag list keeps everything.
#[must_use]
pub fn filter_by_tags<T>(items: &[T], tags: &[String]) -> Vec<T>
where
    T: AsRef<Item> + Clone,
{
    if tags.is_empty() {
        return items.to_vec();
    }

    items
        .iter()
        .filter(|item| item.as_ref().has_any_tag(tags))
        .cloned()
        .collect()
}

/// Slices one 1-indexed page out of `items`.
///
/// # Errors
/// Returns [`RankingError::InvalidPage`] when `page` is zero and
/// [`RankingError::InvalidLimit`] when `limit` is zero.
pub fn paginate<T>(items: Vec<T>, page: u32, limit: u32) -> Result<Page<T>, RankingError> {
    check_page(page)?;
    check_limit(limit)?;

    let total_count = items.len();
    let page_size = usize::try_from(limit).unwrap_or(usize::MAX);
    let total_pages = total_count.div_ceil(page_size);
    let offset = usize::try_from(page - 1)
        .unwrap_or(usize::MAX)
        .saturating_mul(page_size);
    let has_more = usize::try_from(page).is_ok_and(|page| page < total_pages);

    let data = items.into_iter().skip(offset).take(page_size).collect();

    Ok(Page {
        data,
        pagination: Pagination {
            page,
            limit,
            total_count,
            total_pages,
            has_more,
        },
    })
}

fn check_page(page: u32) -> Result<(), RankingError> {
    if page < 1 {
        return Err(RankingError::InvalidPage(format!(
            "MUST be >= 1, got {page}"
        )));
    }
    Ok(())
}

fn check_limit(limit: u32) -> Result<(), RankingError> {
    if limit < 1 {
        return Err(RankingError::InvalidLimit(format!(
            "MUST be >= 1, got {limit}"
        )));
    }
    Ok(())
}

fn sanitize(value: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, max)
    } else {
        0.0
    }
}

/// Elapsed hours from `earlier` to `later`; zero when `later` is not after `earlier`.
#[must_use]
pub fn hours_since(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }

    (later - earlier).as_seconds_f64() / Duration::HOUR.as_seconds_f64()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RankingError::InvalidTimestamp`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RankingError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            RankingError::InvalidTimestamp(format!("invalid RFC3339 timestamp: {err}"))
        })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RankingError::InvalidTimestamp(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
