//! Record contract. Fails closed per record; a batch never aborts on a bad record.

use std::collections::HashMap;
use std::sync::OnceLock;

use pricedragon_core::{Platform, ProductObservation};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::extract::TransformedRecord;

pub const MAX_NAME_CHARS: usize = 500;
pub const MIN_NAME_CHARS: usize = 3;
pub const PRICE_CEILING: f64 = 10_000_000.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("unsupported platform `{0}`")]
    InvalidPlatform(String),
    #[error("missing platform product id")]
    MissingIdentifier,
    #[error("name must be 1 to 500 characters, got {0}")]
    InvalidName(usize),
    #[error("name too short after cleaning ({0} characters)")]
    NameTooShort(usize),
    #[error("{field} {value} outside [0, 10000000]")]
    PriceOutOfRange { field: &'static str, value: f64 },
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("duplicate of batch record {first_index}")]
    DuplicateInBatch { first_index: usize },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidPlatform(_) => "InvalidPlatform",
            RejectReason::MissingIdentifier => "MissingIdentifier",
            RejectReason::InvalidName(_) => "InvalidName",
            RejectReason::NameTooShort(_) => "NameTooShort",
            RejectReason::PriceOutOfRange { .. } => "PriceOutOfRange",
            RejectReason::InvalidUrl(_) => "InvalidUrl",
            RejectReason::DuplicateInBatch { .. } => "DuplicateInBatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub index: usize,
    pub code: &'static str,
    pub reason: String,
}

impl Rejection {
    pub fn new(index: usize, reason: &RejectReason) -> Self {
        Self {
            index,
            code: reason.code(),
            reason: reason.to_string(),
        }
    }
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("static pattern compiles"))
}

fn check_price(field: &'static str, value: f64) -> Result<(), RejectReason> {
    if !value.is_finite() || value < 0.0 || value > PRICE_CEILING {
        return Err(RejectReason::PriceOutOfRange { field, value });
    }
    Ok(())
}

/// Every check except batch duplicates, in contract order.
pub fn validate_record(record: &TransformedRecord) -> Result<ProductObservation, RejectReason> {
    let platform: Platform = record
        .platform
        .parse()
        .map_err(|_| RejectReason::InvalidPlatform(record.platform.clone()))?;

    if record.product_id.is_empty() {
        return Err(RejectReason::MissingIdentifier);
    }

    let name_chars = record.name.chars().count();
    if !(1..=MAX_NAME_CHARS).contains(&name_chars) {
        return Err(RejectReason::InvalidName(name_chars));
    }
    if name_chars < MIN_NAME_CHARS {
        return Err(RejectReason::NameTooShort(name_chars));
    }

    check_price("price", record.current_price)?;
    check_price("original_price", record.original_price)?;

    let url = record.url.clone().unwrap_or_default();
    let scheme_ok = url.starts_with("http://") || url.starts_with("https://");
    if !scheme_ok || !url_pattern().is_match(&url) {
        return Err(RejectReason::InvalidUrl(url));
    }

    Ok(ProductObservation {
        platform,
        product_id: record.product_id.clone(),
        name: record.name.clone(),
        normalized_name: record.normalized_name.clone(),
        description: record.description.clone(),
        brand: record.brand.clone(),
        model: record.model.clone(),
        category: record.category.clone(),
        url,
        image_url: record.image_url.clone(),
        current_price: record.current_price,
        original_price: record.original_price,
        discount_percentage: record.discount_percentage.clamp(0.0, 100.0),
        availability: record.availability,
        stock_status: record.stock_status.clone(),
        promotional_tag: record.promotional_tag.clone(),
        price_category: record.price_category.clone(),
        storage_gb: record.storage_gb,
        quality_score: record.quality_score.clamp(0.0, 1.0),
    })
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// Accepted observations with their index in the raw batch.
    pub accepted: Vec<(usize, ProductObservation)>,
    pub rejections: Vec<(usize, RejectReason)>,
}

/// Validates a batch in order. The first accepted record of a `(platform, product id)`
/// key wins; later ones are rejected as duplicates.
pub fn validate_batch(
    records: impl IntoIterator<Item = (usize, TransformedRecord)>,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    let mut first_seen: HashMap<(Platform, String), usize> = HashMap::new();

    for (index, record) in records {
        let observation = match validate_record(&record) {
            Ok(observation) => observation,
            Err(reason) => {
                outcome.rejections.push((index, reason));
                continue;
            }
        };
        let key = (observation.platform, observation.product_id.clone());
        if let Some(&first_index) = first_seen.get(&key) {
            outcome
                .rejections
                .push((index, RejectReason::DuplicateInBatch { first_index }));
            continue;
        }
        first_seen.insert(key, index);
        outcome.accepted.push((index, observation));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::transform;
    use crate::rules::CatalogRules;
    use pricedragon_core::RawRecord;
    use serde_json::json;

    fn raw(platform: &str, id: &str, name: &str, price: serde_json::Value) -> RawRecord {
        RawRecord {
            platform: platform.into(),
            product_id: id.into(),
            name: name.into(),
            price: Some(price),
            url: Some(format!("https://shop.example.com/{id}")),
            ..RawRecord::default()
        }
    }

    fn check(record: RawRecord) -> Result<ProductObservation, RejectReason> {
        validate_record(&transform(&record, &CatalogRules::default()).expect("transform"))
    }

    #[test]
    fn contract_checks_in_order() {
        assert!(matches!(
            check(raw("amazon", "A1", "Kindle", json!(100))),
            Err(RejectReason::InvalidPlatform(p)) if p == "amazon"
        ));
        assert_eq!(check(raw("momo", " ", "Kindle", json!(100))), Err(RejectReason::MissingIdentifier));
        assert_eq!(check(raw("momo", "A1", "★★", json!(100))), Err(RejectReason::InvalidName(0)));
        assert_eq!(check(raw("momo", "A1", "AB", json!(100))), Err(RejectReason::NameTooShort(2)));
        assert_eq!(
            check(raw("momo", "A1", "iPhone 15", json!(-5))),
            Err(RejectReason::PriceOutOfRange {
                field: "price",
                value: -5.0
            })
        );
        assert!(matches!(
            check(raw("momo", "A1", "iPhone 15", json!(10_000_001))),
            Err(RejectReason::PriceOutOfRange { .. })
        ));

        let mut ftp = raw("momo", "A1", "iPhone 15", json!(100));
        ftp.url = Some("ftp://shop.example.com/A1".into());
        assert!(matches!(check(ftp), Err(RejectReason::InvalidUrl(_))));
        let mut missing = raw("momo", "A1", "iPhone 15", json!(100));
        missing.url = None;
        assert!(matches!(check(missing), Err(RejectReason::InvalidUrl(_))));
        let mut spaced = raw("momo", "A1", "iPhone 15", json!(100));
        spaced.url = Some("https://shop.example.com/a b".into());
        assert!(matches!(check(spaced), Err(RejectReason::InvalidUrl(_))));
    }

    #[test]
    fn platform_is_normalized_to_lowercase() {
        let obs = check(raw("MoMo", "A1", "iPhone 15", json!(100))).expect("valid");
        assert_eq!(obs.platform, Platform::Momo);
    }

    #[test]
    fn negative_original_price_is_rejected() {
        let mut record = raw("pchome", "A1", "iPhone 15", json!(100));
        record.original_price = Some(json!(-1));
        assert!(matches!(
            check(record),
            Err(RejectReason::PriceOutOfRange {
                field: "original_price",
                ..
            })
        ));
    }

    #[test]
    fn first_seen_wins_within_a_batch() {
        let rules = CatalogRules::default();
        let records = [
            raw("pchome", "A1", "iPhone 15 128GB", json!(22299)),
            raw("pchome", "A2", "AB", json!(10)),
            raw("pchome", "A1", "iPhone 15 128GB", json!(21990)),
            raw("momo", "A1", "iPhone 15 128GB", json!(22990)),
            raw("pchome", "A2", "AirPods Pro", json!(7490)),
        ];
        let outcome = validate_batch(
            records
                .iter()
                .enumerate()
                .map(|(i, r)| (i, transform(r, &rules).expect("transform"))),
        );

        let accepted: Vec<usize> = outcome.accepted.iter().map(|(i, _)| *i).collect();
        assert_eq!(accepted, vec![0, 3, 4]);
        assert_eq!(outcome.accepted[0].1.current_price, 22299.0);
        assert_eq!(
            outcome.rejections,
            vec![
                (1, RejectReason::NameTooShort(2)),
                (2, RejectReason::DuplicateInBatch { first_index: 0 }),
            ]
        );
    }
}
