//! Cache key derivation.
//!
//! A `CacheKey` names the blob holding one fully materialised response:
//! `{release}/{areaType}/{areaCode|complete}/{hash}.{format}`.

use blake2::{
    Blake2bMac,
    digest::{Mac, consts::U5},
};
use serde::Deserialize;

use crate::domain::{
    error::DomainError,
    request::{RequestDescriptor, ResponseFormat},
};

/// Order in which metric names are fed to the key hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOrdering {
    /// Sorted names: the same metric set always maps to the same key.
    #[default]
    Sorted,
    /// Names in request order, matching keys written by earlier deployments.
    AsRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    format: ResponseFormat,
}

impl CacheKey {
    pub fn derive(
        descriptor: &RequestDescriptor,
        ordering: MetricOrdering,
    ) -> Result<Self, DomainError> {
        let mut metrics: Vec<&str> = descriptor
            .metrics
            .as_slice()
            .iter()
            .map(String::as_str)
            .collect();
        if ordering == MetricOrdering::Sorted {
            metrics.sort_unstable();
        }

        let digest = hash_metrics(&metrics.join("&"), &descriptor.release.compact())?;
        let path = format!(
            "{}/{}/{}/{}.{}",
            descriptor.release,
            descriptor.area_type,
            descriptor.area_code_segment(),
            digest,
            descriptor.format.extension()
        );

        Ok(Self {
            path,
            format: descriptor.format,
        })
    }

    /// Builds a key from an already known blob path.
    pub fn from_path(path: impl Into<String>, format: ResponseFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }
}

/// Keyed BLAKE2b with a 5-byte digest, hex encoded.
fn hash_metrics(joined: &str, key: &str) -> Result<String, DomainError> {
    let mut mac = Blake2bMac::<U5>::new_with_salt_and_personal(key.as_bytes(), &[], &[])
        .map_err(|err| DomainError::invariant(format!("cache key hasher rejected key: {err}")))?;
    mac.update(joined.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::{RequestMethod, RequestParams};

    fn descriptor(metrics: &[&str], area_code: Option<&str>) -> RequestDescriptor {
        let params = RequestParams {
            area_type: Some("nation".to_string()),
            release: Some("2021-03-10".to_string()),
            metric: metrics.iter().map(|m| m.to_string()).collect(),
            format: Some("csv".to_string()),
            area_code: area_code.map(str::to_string),
        };
        RequestDescriptor::from_params(&params, RequestMethod::Get).expect("descriptor")
    }

    #[test]
    fn path_layout_matches_blob_naming() {
        let key = CacheKey::derive(
            &descriptor(&["newCasesByPublishDate"], None),
            MetricOrdering::Sorted,
        )
        .expect("key");
        assert_eq!(key.path(), "2021-03-10/nation/complete/450517ad32.csv");

        let key = CacheKey::derive(
            &descriptor(&["newCasesByPublishDate"], Some("E92000001")),
            MetricOrdering::Sorted,
        )
        .expect("key");
        assert_eq!(key.path(), "2021-03-10/nation/E92000001/450517ad32.csv");
    }

    #[test]
    fn sorted_ordering_ignores_request_order() {
        let forward = descriptor(&["newCasesByPublishDate", "cumCasesByPublishDate"], None);
        let reverse = descriptor(&["cumCasesByPublishDate", "newCasesByPublishDate"], None);

        let a = CacheKey::derive(&forward, MetricOrdering::Sorted).expect("key");
        let b = CacheKey::derive(&reverse, MetricOrdering::Sorted).expect("key");
        assert_eq!(a, b);
        assert_eq!(a.path(), "2021-03-10/nation/complete/6000e47a88.csv");
    }

    #[test]
    fn as_requested_ordering_keeps_legacy_keys() {
        let forward = descriptor(&["newCasesByPublishDate", "cumCasesByPublishDate"], None);
        let reverse = descriptor(&["cumCasesByPublishDate", "newCasesByPublishDate"], None);

        let a = CacheKey::derive(&forward, MetricOrdering::AsRequested).expect("key");
        let b = CacheKey::derive(&reverse, MetricOrdering::AsRequested).expect("key");
        assert_ne!(a, b);
        assert_eq!(a.path(), "2021-03-10/nation/complete/3d37555153.csv");
        assert_eq!(b.path(), "2021-03-10/nation/complete/6000e47a88.csv");
    }
}
