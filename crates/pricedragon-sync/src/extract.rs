//! Field extraction: brand, model, category, storage and pricing derived from a raw record.

use std::sync::OnceLock;

use pricedragon_core::{discount_percentage, RawRecord};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::clean::{clean_text, normalize_name, MAX_TEXT_CHARS};
use crate::quality::quality_score;
use crate::rules::CatalogRules;

pub const LOW_PRICE_WARNING: f64 = 1.0;
pub const HIGH_PRICE_WARNING: f64 = 5_000_000.0;
pub const HIGH_DISCOUNT_WARNING: f64 = 90.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("unexpected {found} in `{field}`")]
    UnexpectedStructure { field: &'static str, found: &'static str },
}

/// A cleaned and enriched record that has not been validated yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedRecord {
    pub platform: String,
    pub product_id: String,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub brand: String,
    pub model: String,
    pub category: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub current_price: f64,
    pub original_price: f64,
    pub discount_percentage: f64,
    pub availability: bool,
    pub stock_status: Option<String>,
    pub promotional_tag: Option<String>,
    pub price_category: String,
    pub storage_gb: Option<u32>,
    pub quality_score: f64,
}

fn first_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static pattern compiles"))
}

fn repeated_bangs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!{2,}").expect("static pattern compiles"))
}

fn repeated_questions() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\?{2,}").expect("static pattern compiles"))
}

fn glued_model_numbers() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(iPhone)(\d+)").expect("static pattern compiles"),
            Regex::new(r"(Galaxy)([A-Z]\d+)").expect("static pattern compiles"),
            Regex::new(r"(Pixel)(\d+)").expect("static pattern compiles"),
        ]
    })
}

fn glued_storage_unit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(GB|TB)").expect("static pattern compiles"))
}

fn short_storage_unit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)([gt])(\s|$)").expect("static pattern compiles"))
}

fn storage_size() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*(GB|TB)").expect("static pattern compiles"))
}

/// Display-name tidying: repeated `!`/`?` collapse, model numbers and storage units are
/// split from the preceding token (`iPhone15` to `iPhone 15`, `128GB` to `128 GB`), `256g`
/// becomes `256 GB`, and whitespace is collapsed. A single-digit `g` is left alone so
/// `5G` keeps meaning the network.
pub fn enhance_name(name: &str) -> String {
    let mut name = repeated_bangs().replace_all(name, "!").into_owned();
    name = repeated_questions().replace_all(&name, "?").into_owned();
    for pattern in glued_model_numbers() {
        name = pattern.replace_all(&name, "${1} ${2}").into_owned();
    }
    name = glued_storage_unit().replace_all(&name, "${1} ${2}").into_owned();
    name = short_storage_unit()
        .replace_all(&name, |caps: &regex::Captures<'_>| {
            let unit = caps[2].to_uppercase();
            if unit == "G" && caps[1].len() < 2 {
                caps[0].to_string()
            } else {
                format!("{} {}B{}", &caps[1], unit, &caps[3])
            }
        })
        .into_owned();
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `<n> GB` or `<n> TB` in the name, in gigabytes.
pub fn extract_storage_gb(name: &str) -> Option<u32> {
    let caps = storage_size().captures(name)?;
    let size: u32 = caps[1].parse().ok()?;
    let size = if caps[2].eq_ignore_ascii_case("TB") {
        size.checked_mul(1024)?
    } else {
        size
    };
    (size > 0).then_some(size)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Numbers pass through; text yields its first number once thousands separators are
/// removed. `None` means absent or unreadable, which callers treat as a quality concern.
pub fn parse_price(
    value: Option<&JsonValue>,
    field: &'static str,
) -> Result<Option<f64>, TransformError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => Ok(n.as_f64().filter(|v| v.is_finite())),
        Some(JsonValue::String(text)) => {
            let plain = text.replace(',', "");
            Ok(first_number()
                .find(&plain)
                .and_then(|m| m.as_str().parse::<f64>().ok()))
        }
        Some(other) => Err(TransformError::UnexpectedStructure {
            field,
            found: json_kind(other),
        }),
    }
}

/// First known brand contained in the name, in its mapped display form or title-cased;
/// empty when none matches.
pub fn extract_brand(name: &str, rules: &CatalogRules) -> String {
    let upper = name.to_uppercase();
    rules
        .tables
        .known_brands
        .iter()
        .find(|brand| !brand.is_empty() && upper.contains(&brand.to_uppercase()))
        .map(|brand| {
            rules
                .tables
                .canonical_brand(brand)
                .map(ToString::to_string)
                .unwrap_or_else(|| title_case(brand))
        })
        .unwrap_or_default()
}

/// Display form of a scraped `brand` field. Unmapped brands are title-cased word by word.
pub fn normalize_brand(raw: &str, rules: &CatalogRules) -> String {
    match rules.tables.canonical_brand(raw) {
        Some(brand) => brand.to_string(),
        None => raw.split_whitespace().map(title_case).collect::<Vec<_>>().join(" "),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// `<family> <number>[ <suffix>...]` for the first family found in the name, e.g.
/// `iPhone15 pro` becomes `iPhone 15 Pro`. Empty when no family matches.
pub fn extract_model(name: &str, rules: &CatalogRules) -> String {
    for pattern in &rules.model_patterns {
        let Some(captures) = pattern.regex.captures(name) else {
            continue;
        };
        let Some(detail) = captures.get(1) else {
            continue;
        };
        let mut parts = detail.as_str().split_whitespace();
        let Some(number) = parts.next() else {
            continue;
        };
        let mut model = format!("{} {}", pattern.family, number.to_uppercase());
        for suffix in parts {
            model.push(' ');
            model.push_str(&title_case(suffix));
        }
        return model;
    }
    String::new()
}

pub fn categorize(name: &str, rules: &CatalogRules) -> Option<String> {
    let lower = name.to_lowercase();
    rules
        .tables
        .categories
        .iter()
        .find(|rule| {
            rule.keywords
                .iter()
                .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
        })
        .map(|rule| rule.category.clone())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(ToString::to_string)
}

/// Cleans and enriches one raw record. Only a structurally unexpected price fails;
/// missing values degrade to defaults and are logged.
pub fn transform(raw: &RawRecord, rules: &CatalogRules) -> Result<TransformedRecord, TransformError> {
    let platform = raw.platform.trim().to_string();
    let product_id = raw.product_id.trim().to_string();

    let parsed_price = parse_price(raw.price.as_ref(), "price")?;
    let parsed_original = parse_price(raw.original_price.as_ref(), "original_price")?;
    let current_price = parsed_price.unwrap_or_else(|| {
        warn!(%platform, %product_id, "missing or unreadable price, using 0");
        0.0
    });
    let original_price = parsed_original.unwrap_or(current_price);
    let discount = discount_percentage(current_price, original_price);

    if current_price < LOW_PRICE_WARNING {
        warn!(%platform, %product_id, current_price, "suspiciously low price");
    }
    if current_price > HIGH_PRICE_WARNING {
        warn!(%platform, %product_id, current_price, "suspiciously high price");
    }
    if discount > HIGH_DISCOUNT_WARNING {
        warn!(%platform, %product_id, discount, "unusually deep discount");
    }

    // spacing can push a cleaned name back over the length limit
    let name: String = enhance_name(&clean_text(&raw.name))
        .chars()
        .take(MAX_TEXT_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();
    let mut brand = extract_brand(&name, rules);
    if brand.is_empty() {
        brand = raw
            .brand
            .as_deref()
            .map(|b| normalize_brand(&clean_text(b), rules))
            .unwrap_or_default();
    }
    let normalized_name = normalize_name(&name, &rules.tables.noise_tokens);
    let description = raw
        .description
        .as_deref()
        .map(clean_text)
        .filter(|d| !d.is_empty());

    Ok(TransformedRecord {
        brand,
        model: extract_model(&name, rules),
        category: categorize(&name, rules),
        price_category: rules.tables.price_tier(current_price).to_string(),
        storage_gb: extract_storage_gb(&name),
        quality_score: quality_score(raw, current_price),
        platform,
        product_id,
        normalized_name,
        name,
        description,
        url: non_empty(raw.url.as_deref()),
        image_url: non_empty(raw.image_url.as_deref()),
        current_price,
        original_price,
        discount_percentage: discount,
        availability: raw.availability.unwrap_or(true),
        stock_status: non_empty(raw.stock_status.as_deref()),
        promotional_tag: non_empty(raw.promotional_tag.as_deref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> CatalogRules {
        CatalogRules::default()
    }

    #[test]
    fn prices_accept_numbers_and_text() {
        assert_eq!(parse_price(Some(&json!(22299)), "price"), Ok(Some(22299.0)));
        assert_eq!(parse_price(Some(&json!("$22,299")), "price"), Ok(Some(22299.0)));
        assert_eq!(parse_price(Some(&json!("NT$ 1,234.50 起")), "price"), Ok(Some(1234.5)));
        assert_eq!(parse_price(Some(&json!("-5")), "price"), Ok(Some(-5.0)));
        assert_eq!(parse_price(Some(&json!("售完")), "price"), Ok(None));
        assert_eq!(parse_price(Some(&JsonValue::Null), "price"), Ok(None));
        assert_eq!(parse_price(None, "price"), Ok(None));
        assert_eq!(
            parse_price(Some(&json!([1, 2])), "price"),
            Err(TransformError::UnexpectedStructure {
                field: "price",
                found: "array"
            })
        );
    }

    #[test]
    fn brand_is_first_list_match_title_cased() {
        assert_eq!(extract_brand("SAMSUNG Galaxy S24", &rules()), "Samsung");
        assert_eq!(extract_brand("apple iphone 15", &rules()), "Apple");
        assert_eq!(extract_brand("Apple Sony 轉接頭", &rules()), "Apple");
        assert_eq!(extract_brand("任天堂 Switch", &rules()), "");
    }

    #[test]
    fn raw_brand_is_mapped_and_used_when_the_name_has_none() {
        assert_eq!(normalize_brand("asus", &rules()), "ASUS");
        assert_eq!(normalize_brand("Apple Inc.", &rules()), "Apple");
        assert_eq!(normalize_brand("dyson  technology", &rules()), "Dyson Technology");
        assert_eq!(extract_brand("ASUS ROG Keris 無線滑鼠", &rules()), "ASUS");

        let raw = RawRecord {
            platform: "momo".into(),
            product_id: "10023456".into(),
            name: "【限時特價】iPhone15 128GB 午夜色".into(),
            brand: Some(" apple ".into()),
            price: Some(json!("$22,990")),
            ..RawRecord::default()
        };
        let t = transform(&raw, &rules()).expect("transform");
        assert_eq!(t.brand, "Apple");
        assert_eq!(t.name, "限時特價iPhone 15 128 GB 午夜色");
        assert_eq!(t.normalized_name, "iphone 15 128 gb 午夜色");

        let named = RawRecord {
            name: "Samsung Galaxy S24".into(),
            brand: Some("三星".into()),
            ..raw.clone()
        };
        assert_eq!(transform(&named, &rules()).expect("transform").brand, "Samsung");

        let unbranded = RawRecord { brand: None, ..raw };
        assert_eq!(transform(&unbranded, &rules()).expect("transform").brand, "");
    }

    #[test]
    fn names_get_model_and_storage_spacing() {
        assert_eq!(enhance_name("iPhone15 Pro 256GB"), "iPhone 15 Pro 256 GB");
        assert_eq!(enhance_name("GalaxyS24 Ultra 1TB"), "Galaxy S24 Ultra 1 TB");
        assert_eq!(enhance_name("Pixel8 128g"), "Pixel 8 128 GB");
        assert_eq!(enhance_name("隨身碟 2t"), "隨身碟 2 TB");
        assert_eq!(enhance_name("iPhone 15 5G 手機"), "iPhone 15 5G 手機");
        assert_eq!(enhance_name("超值!!!  必買??"), "超值! 必買?");
        assert_eq!(enhance_name("Galaxys24"), "Galaxys24");
    }

    #[test]
    fn enhanced_names_stay_within_the_length_limit() {
        let raw = RawRecord {
            platform: "momo".into(),
            product_id: "B1".into(),
            name: "iPhone15".repeat(70),
            ..RawRecord::default()
        };
        let t = transform(&raw, &rules()).expect("transform");
        assert!(t.name.chars().count() <= MAX_TEXT_CHARS);
        assert!(t.name.starts_with("iPhone 15iPhone 15"));
    }

    #[test]
    fn storage_is_reported_in_gigabytes() {
        assert_eq!(extract_storage_gb("iPhone 15 128 GB"), Some(128));
        assert_eq!(extract_storage_gb("iPhone 15 Pro 256gb 1TB"), Some(256));
        assert_eq!(extract_storage_gb("外接硬碟 2 TB"), Some(2048));
        assert_eq!(extract_storage_gb("ASUS Zenbook 14 OLED"), None);
        assert_eq!(extract_storage_gb("0GB 測試"), None);
    }

    #[test]
    fn model_follows_family_token() {
        assert_eq!(extract_model("iPhone15 128GB 午夜色", &rules()), "iPhone 15");
        assert_eq!(extract_model("Apple iPhone 15 Pro Max 256GB", &rules()), "iPhone 15 Pro Max");
        assert_eq!(extract_model("Samsung Galaxy s24 ultra 手機", &rules()), "Galaxy S24 Ultra");
        assert_eq!(extract_model("ASUS Zenbook 14 OLED 筆電", &rules()), "Zenbook 14");
        assert_eq!(extract_model("Dyson V15 無線吸塵器", &rules()), "");
    }

    #[test]
    fn category_first_keyword_match_wins() {
        assert_eq!(categorize("Apple iPhone 15", &rules()).as_deref(), Some("Electronics"));
        assert_eq!(categorize("Nintendo Switch OLED 主機", &rules()).as_deref(), Some("Gaming"));
        assert_eq!(categorize("烏龍茶葉 禮盒", &rules()).as_deref(), Some("Food"));
        assert_eq!(categorize("神秘盲盒", &rules()), None);
    }

    #[test]
    fn transform_fills_defaults_and_discount() {
        let raw = RawRecord {
            platform: " PChome ".into(),
            product_id: " A1 ".into(),
            name: "iPhone 15 128GB".into(),
            price: Some(json!(22299)),
            original_price: Some(json!(24900)),
            url: Some("https://24h.pchome.com.tw/prod/A1".into()),
            ..RawRecord::default()
        };
        let t = transform(&raw, &rules()).expect("transform");
        assert_eq!(t.platform, "PChome");
        assert_eq!(t.product_id, "A1");
        assert_eq!(t.name, "iPhone 15 128 GB");
        assert_eq!(t.normalized_name, "iphone 15 128 gb");
        assert_eq!(t.price_category, "premium");
        assert_eq!(t.storage_gb, Some(128));
        assert_eq!(t.model, "iPhone 15");
        assert_eq!(t.category.as_deref(), Some("Electronics"));
        assert!((t.discount_percentage - 10.4458).abs() < 1e-3);
        assert!(t.availability);

        let no_original = RawRecord {
            price: Some(json!("$990")),
            original_price: None,
            ..raw.clone()
        };
        let t = transform(&no_original, &rules()).expect("transform");
        assert_eq!(t.original_price, 990.0);
        assert_eq!(t.discount_percentage, 0.0);
        assert_eq!(t.price_category, "budget");

        let missing = RawRecord { price: None, ..raw.clone() };
        assert_eq!(transform(&missing, &rules()).expect("transform").current_price, 0.0);

        let bad = RawRecord { price: Some(json!({"amount": 1})), ..raw };
        assert!(matches!(
            transform(&bad, &rules()),
            Err(TransformError::UnexpectedStructure { found: "object", .. })
        ));
    }
}
