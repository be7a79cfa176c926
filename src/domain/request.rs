//! Request descriptors: the validated, immutable description of one data request.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use time::{Date, format_description::BorrowedFormatItem, macros::format_description};

use super::{
    error::DomainError,
    metrics::{self, MetricKind},
};

const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const COMPACT_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year][month][day]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaType {
    Overview,
    Nation,
    Region,
    NhsRegion,
    Utla,
    Ltla,
    NhsTrust,
    Msoa,
}

impl AreaType {
    pub const ALL: [AreaType; 8] = [
        AreaType::Overview,
        AreaType::Nation,
        AreaType::Region,
        AreaType::NhsRegion,
        AreaType::Utla,
        AreaType::Ltla,
        AreaType::NhsTrust,
        AreaType::Msoa,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AreaType::Overview => "overview",
            AreaType::Nation => "nation",
            AreaType::Region => "region",
            AreaType::NhsRegion => "nhsRegion",
            AreaType::Utla => "utla",
            AreaType::Ltla => "ltla",
            AreaType::NhsTrust => "nhsTrust",
            AreaType::Msoa => "msoa",
        }
    }

    /// Area types stored in their own database partition.
    pub fn has_own_partition(self) -> bool {
        matches!(
            self,
            AreaType::Utla | AreaType::Ltla | AreaType::NhsTrust | AreaType::Msoa
        )
    }

    pub fn partition_suffix(self) -> String {
        if self.has_own_partition() {
            self.as_str().to_ascii_lowercase()
        } else {
            "other".to_string()
        }
    }
}

impl fmt::Display for AreaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AreaType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        AreaType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| DomainError::validation(format!("unknown area type `{trimmed}`")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Csv,
    #[default]
    Json,
    Jsonl,
    /// Legacy alias, rendered as JSON.
    Xml,
}

impl ResponseFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ResponseFormat::Csv => "csv",
            ResponseFormat::Json => "json",
            ResponseFormat::Jsonl => "jsonl",
            ResponseFormat::Xml => "xml",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ResponseFormat::Csv => "text/csv; charset=utf-8",
            ResponseFormat::Json => "application/vnd.PHE-COVID19.v2+json; charset=utf-8",
            ResponseFormat::Jsonl => "application/vnd.PHE-COVID19.v2+jsonl; charset=utf-8",
            ResponseFormat::Xml => "application/vnd.PHE-COVID19.v1+json; charset=utf-8",
        }
    }

    /// Whether batches are wrapped in the `{"body":[ ... ]}` envelope.
    pub fn is_enveloped(self) -> bool {
        matches!(self, ResponseFormat::Json | ResponseFormat::Xml)
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ResponseFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" => Ok(Self::Jsonl),
            "xml" => Ok(Self::Xml),
            other => Err(DomainError::validation(format!(
                "unsupported format `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// Release date of the dataset a request reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseDate(Date);

impl ReleaseDate {
    pub fn new(date: Date) -> Self {
        Self(date)
    }

    /// Parses `YYYY-MM-DD`; anything past the first ten characters (e.g. a time) is ignored.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let trimmed = value.trim();
        let head = trimmed.get(..10).unwrap_or(trimmed);
        Date::parse(head, ISO_DATE)
            .map(Self)
            .map_err(|err| DomainError::validation(format!("invalid release date `{value}`: {err}")))
    }

    pub fn date(self) -> Date {
        self.0
    }

    pub fn iso(self) -> String {
        self.0
            .format(ISO_DATE)
            .unwrap_or_else(|_| self.0.to_string())
    }

    pub fn compact(self) -> String {
        self.0
            .format(COMPACT_DATE)
            .unwrap_or_else(|_| self.iso().replace('-', ""))
    }

    /// `YYYY_M_D` without zero padding, as used in partition names.
    pub fn partition_stamp(self) -> String {
        format!(
            "{}_{}_{}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

impl fmt::Display for ReleaseDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.iso())
    }
}

/// Requested metric names in request order, deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSet(Vec<String>);

impl MetricSet {
    /// Accepts repeated parameters and comma-delimited lists alike.
    pub fn parse<I, S>(values: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = Vec::new();
        for value in values {
            for name in value.as_ref().split(',') {
                let name = name.trim();
                if !name.is_empty() && !names.iter().any(|existing| existing == name) {
                    names.push(name.to_string());
                }
            }
        }

        if names.is_empty() {
            return Err(DomainError::validation("at least one metric is required"));
        }

        Ok(Self(names))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Metrics that are read from the store, sorted by name.
    pub fn db_metrics(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .iter()
            .filter(|name| !metrics::is_base_metric(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn nested(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(String::as_str)
            .filter(|name| metrics::kind_of(name) == MetricKind::Nested)
            .collect()
    }

    /// Metric names joined by `:` for blob tags.
    pub fn tag_value(&self) -> String {
        self.0.join(":")
    }
}

/// Raw query parameters of a data request before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestParams {
    #[serde(rename = "areaType")]
    pub area_type: Option<String>,
    pub release: Option<String>,
    #[serde(default)]
    pub metric: Vec<String>,
    pub format: Option<String>,
    #[serde(rename = "areaCode")]
    pub area_code: Option<String>,
}

/// Which query template serves a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Long-format rows, one per (area, date, metric).
    Main,
    /// A single nested metric returned whole.
    NestedArray { metric: String },
    /// MSOA rows, whose object payloads expand to one metric per key.
    MsoaObject,
    /// As [`QueryKind::MsoaObject`], limited to MSOAs in or under the requested area.
    MsoaObjectWithAreaCode,
    /// Existence check for `HEAD`.
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub area_type: AreaType,
    pub release: ReleaseDate,
    pub format: ResponseFormat,
    pub metrics: MetricSet,
    pub area_code: Option<String>,
    pub method: RequestMethod,
}

impl RequestDescriptor {
    pub fn from_params(params: &RequestParams, method: RequestMethod) -> Result<Self, DomainError> {
        let area_type = params
            .area_type
            .as_deref()
            .ok_or_else(|| DomainError::validation("`areaType` is required"))?
            .parse()?;
        let release = params
            .release
            .as_deref()
            .ok_or_else(|| DomainError::validation("`release` is required"))
            .and_then(ReleaseDate::parse)?;
        let format = match params.format.as_deref() {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => ResponseFormat::default(),
        };
        let metrics = MetricSet::parse(&params.metric)?;
        let area_code = params
            .area_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string);

        let descriptor = Self {
            area_type,
            release,
            format,
            metrics,
            area_code,
            method,
        };
        descriptor.query_kind()?;
        Ok(descriptor)
    }

    /// `{YYYY}_{M}_{D}_{suffix}` naming the partition that holds this request's rows.
    pub fn partition_id(&self) -> String {
        format!(
            "{}_{}",
            self.release.partition_stamp(),
            self.area_type.partition_suffix()
        )
    }

    pub fn area_code_segment(&self) -> &str {
        self.area_code.as_deref().unwrap_or("complete")
    }

    pub fn db_metrics(&self) -> Vec<String> {
        self.metrics.db_metrics()
    }

    /// Picks the query template; a nested metric cannot be combined with other metrics.
    pub fn query_kind(&self) -> Result<QueryKind, DomainError> {
        let nested = self.metrics.nested();
        if !nested.is_empty() && self.metrics.len() > 1 {
            let others: Vec<&str> = self
                .metrics
                .as_slice()
                .iter()
                .map(String::as_str)
                .filter(|name| !nested.contains(name))
                .collect();
            return Err(DomainError::invalid_query(format!(
                "Nested metrics - e.g. {nested:?} - cannot be requested alongside other metrics. \
                 Remove {others:?} and try again."
            )));
        }

        if self.method == RequestMethod::Head {
            return Ok(QueryKind::Exists);
        }

        Ok(match nested.first() {
            Some(metric) => QueryKind::NestedArray {
                metric: (*metric).to_string(),
            },
            None if self.area_type != AreaType::Msoa => QueryKind::Main,
            None if self.area_code.is_none() => QueryKind::MsoaObject,
            None => QueryKind::MsoaObjectWithAreaCode,
        })
    }

    /// Attachment name offered to clients.
    pub fn download_filename(&self) -> String {
        format!(
            "{}_{}.{}",
            self.area_type,
            self.release,
            self.format.extension()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(metrics: &[&str]) -> RequestParams {
        RequestParams {
            area_type: Some("nation".to_string()),
            release: Some("2021-03-10".to_string()),
            metric: metrics.iter().map(|m| m.to_string()).collect(),
            format: Some("csv".to_string()),
            area_code: None,
        }
    }

    #[test]
    fn comma_and_repeated_metrics_merge_in_order() {
        let set = MetricSet::parse(["b,a", "c", "a"]).expect("metrics");
        assert_eq!(set.as_slice(), &["b", "a", "c"]);
        assert_eq!(set.tag_value(), "b:a:c");
    }

    #[test]
    fn empty_metric_list_is_rejected() {
        assert!(matches!(
            MetricSet::parse([",", " "]),
            Err(DomainError::Validation { .. })
        ));
    }

    #[test]
    fn partition_id_drops_zero_padding() {
        let descriptor =
            RequestDescriptor::from_params(&params(&["newCasesByPublishDate"]), RequestMethod::Get)
                .expect("descriptor");
        assert_eq!(descriptor.partition_id(), "2021_3_10_other");

        let mut ltla = params(&["newCasesByPublishDate"]);
        ltla.area_type = Some("ltla".to_string());
        let descriptor =
            RequestDescriptor::from_params(&ltla, RequestMethod::Get).expect("descriptor");
        assert_eq!(descriptor.partition_id(), "2021_3_10_ltla");

        let mut trust = params(&["newAdmissions"]);
        trust.area_type = Some("nhsTrust".to_string());
        let descriptor =
            RequestDescriptor::from_params(&trust, RequestMethod::Get).expect("descriptor");
        assert_eq!(descriptor.partition_id(), "2021_3_10_nhstrust");
    }

    #[test]
    fn base_columns_are_not_database_metrics() {
        let descriptor = RequestDescriptor::from_params(
            &params(&["date", "newCasesByPublishDate", "areaName", "cumCasesByPublishDate"]),
            RequestMethod::Get,
        )
        .expect("descriptor");
        assert_eq!(
            descriptor.db_metrics(),
            vec!["cumCasesByPublishDate", "newCasesByPublishDate"]
        );
    }

    #[test]
    fn nested_metric_alongside_others_is_invalid_query() {
        let err = RequestDescriptor::from_params(
            &params(&["maleCases", "newCasesByPublishDate"]),
            RequestMethod::Get,
        )
        .expect_err("should reject");
        assert!(matches!(err, DomainError::InvalidQuery { .. }));
    }

    #[test]
    fn single_nested_metric_uses_nested_template() {
        let descriptor = RequestDescriptor::from_params(&params(&["maleCases"]), RequestMethod::Get)
            .expect("descriptor");
        assert_eq!(
            descriptor.query_kind().expect("kind"),
            QueryKind::NestedArray {
                metric: "maleCases".to_string()
            }
        );
    }

    #[test]
    fn msoa_requests_use_object_templates() {
        let mut raw = params(&["newCasesBySpecimenDateRollingSum"]);
        raw.area_type = Some("msoa".to_string());
        let descriptor =
            RequestDescriptor::from_params(&raw, RequestMethod::Get).expect("descriptor");
        assert_eq!(descriptor.query_kind().expect("kind"), QueryKind::MsoaObject);

        raw.area_code = Some("E06000001".to_string());
        let descriptor =
            RequestDescriptor::from_params(&raw, RequestMethod::Get).expect("descriptor");
        assert_eq!(
            descriptor.query_kind().expect("kind"),
            QueryKind::MsoaObjectWithAreaCode
        );

        let head = RequestDescriptor::from_params(&raw, RequestMethod::Head).expect("descriptor");
        assert_eq!(head.query_kind().expect("kind"), QueryKind::Exists);
    }

    #[test]
    fn release_parsing_ignores_time_suffix() {
        let release = ReleaseDate::parse("2021-03-10T16:00:00Z").expect("release");
        assert_eq!(release.iso(), "2021-03-10");
        assert_eq!(release.compact(), "20210310");
        assert!(ReleaseDate::parse("10/03/2021").is_err());
    }

    #[test]
    fn format_defaults_to_json() {
        let mut raw = params(&["newCasesByPublishDate"]);
        raw.format = None;
        let descriptor =
            RequestDescriptor::from_params(&raw, RequestMethod::Get).expect("descriptor");
        assert_eq!(descriptor.format, ResponseFormat::Json);
        assert_eq!(descriptor.download_filename(), "nation_2021-03-10.json");
    }
}
