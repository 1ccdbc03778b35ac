//! Lookup tables for the cleaner and the field extractor. Built once per run and passed
//! into the components; `rules/catalog.yaml` may override any table.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const RULES_FILE: &str = "rules/catalog.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

fn category(name: &str, keywords: &[&str]) -> CategoryRule {
    CategoryRule {
        category: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Maps a lower-cased brand spelling to its display form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandAlias {
    pub alias: String,
    pub brand: String,
}

fn aliases(pairs: &[(&str, &str)]) -> Vec<BrandAlias> {
    pairs
        .iter()
        .map(|(alias, brand)| BrandAlias {
            alias: alias.to_string(),
            brand: brand.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub label: String,
    /// Exclusive upper bound; the tier without one catches everything above.
    #[serde(default)]
    pub below: Option<f64>,
}

fn tier(label: &str, below: Option<f64>) -> PriceTier {
    PriceTier {
        label: label.to_string(),
        below,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupTables {
    /// Matched as substrings of the upper-cased name, in order.
    pub known_brands: Vec<String>,
    /// Product-line tokens that precede a model number, e.g. `iPhone` in `iPhone 15 Pro`.
    pub model_families: Vec<String>,
    /// Words that may follow a model number and belong to the model.
    pub model_suffixes: Vec<String>,
    /// First matching category wins.
    pub categories: Vec<CategoryRule>,
    /// Bracket glyphs and promotional words dropped from the matching key.
    pub noise_tokens: Vec<String>,
    /// Exact alias first, then the first alias contained in the raw brand.
    pub brand_mappings: Vec<BrandAlias>,
    /// Checked in order; the first tier whose bound exceeds the price wins.
    pub price_tiers: Vec<PriceTier>,
}

impl Default for LookupTables {
    fn default() -> Self {
        Self {
            known_brands: strings(&[
                "APPLE", "SAMSUNG", "ASUS", "ACER", "MSI", "LENOVO", "HP", "DELL", "SONY", "LG",
                "NIKE", "ADIDAS",
            ]),
            model_families: strings(&[
                "iPhone", "iPad", "Galaxy", "Pixel", "Zenbook", "Vivobook", "ThinkPad", "Xperia",
            ]),
            model_suffixes: strings(&["pro", "max", "plus", "ultra", "mini", "air", "lite", "fe"]),
            categories: vec![
                category(
                    "Electronics",
                    &["筆電", "電腦", "手機", "iphone", "ipad", "平板", "耳機", "相機", "螢幕"],
                ),
                category(
                    "Fashion",
                    &["運動鞋", "鞋", "包包", "手錶", "衣服", "褲子", "牛仔褲", "外套"],
                ),
                category(
                    "Home",
                    &["咖啡機", "吸塵器", "床墊", "餐具", "廚具", "家具", "燈具"],
                ),
                category(
                    "Gaming",
                    &["switch", "ps5", "xbox", "遊戲", "手把", "鍵盤", "滑鼠"],
                ),
                category(
                    "Beauty",
                    &["面膜", "防曬", "口紅", "香水", "化妝", "保養", "護膚"],
                ),
                category("Sports", &["瑜珈", "啞鈴", "跑鞋", "籃球", "運動", "健身"]),
                category("Books", &["小說", "食譜", "書", "漫畫", "雜誌"]),
                category("Food", &["零食", "茶葉", "蜂蜜", "堅果", "咖啡", "茶"]),
            ],
            noise_tokens: strings(&[
                "的", "【", "】", "(", ")", "[", "]", "限時", "特價", "優惠",
            ]),
            brand_mappings: aliases(&[
                ("apple", "Apple"),
                ("samsung", "Samsung"),
                ("sony", "Sony"),
                ("lg", "LG"),
                ("htc", "HTC"),
                ("asus", "ASUS"),
                ("acer", "Acer"),
                ("msi", "MSI"),
                ("gigabyte", "Gigabyte"),
                ("xiaomi", "Xiaomi"),
                ("oppo", "OPPO"),
                ("vivo", "Vivo"),
            ]),
            price_tiers: vec![
                tier("budget", Some(1_000.0)),
                tier("mid-range", Some(10_000.0)),
                tier("premium", Some(50_000.0)),
                tier("luxury", None),
            ],
        }
    }
}

impl LookupTables {
    /// Display form of a brand spelling, if any alias covers it.
    pub fn canonical_brand(&self, brand: &str) -> Option<&str> {
        let lower = brand.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        self.brand_mappings
            .iter()
            .find(|m| m.alias.to_lowercase() == lower)
            .or_else(|| {
                self.brand_mappings
                    .iter()
                    .find(|m| !m.alias.is_empty() && lower.contains(&m.alias.to_lowercase()))
            })
            .map(|m| m.brand.as_str())
    }

    /// Label of the first tier the price falls under; empty without tiers.
    pub fn price_tier(&self, price: f64) -> &str {
        self.price_tiers
            .iter()
            .find(|t| t.below.map_or(true, |bound| price < bound))
            .or_else(|| self.price_tiers.last())
            .map(|t| t.label.as_str())
            .unwrap_or_default()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog lookup tables")
    }

    /// Defaults, overridden by `rules/catalog.yaml` under `root` when that file exists.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(RULES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// A model family with its compiled pattern.
#[derive(Debug, Clone)]
pub struct ModelPattern {
    pub family: String,
    pub regex: Regex,
}

/// Lookup tables plus the patterns derived from them.
#[derive(Debug, Clone)]
pub struct CatalogRules {
    pub tables: LookupTables,
    pub model_patterns: Vec<ModelPattern>,
}

impl CatalogRules {
    pub fn new(tables: LookupTables) -> Result<Self> {
        let suffixes = tables
            .model_suffixes
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        let model_patterns = tables
            .model_families
            .iter()
            .map(|family| {
                let pattern = if suffixes.is_empty() {
                    format!(r"(?i){}\s*([a-z]?\d+[a-z]?)", regex::escape(family))
                } else {
                    format!(
                        r"(?i){}\s*([a-z]?\d+[a-z]?(?:\s+(?:{suffixes})\b)*)",
                        regex::escape(family)
                    )
                };
                Regex::new(&pattern)
                    .with_context(|| format!("compiling model pattern for {family}"))
                    .map(|regex| ModelPattern {
                        family: family.clone(),
                        regex,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tables,
            model_patterns,
        })
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::new(LookupTables::from_workspace_root(root)?)
    }
}

impl Default for CatalogRules {
    fn default() -> Self {
        let tables = LookupTables::default();
        // the default families are plain words, so their patterns always compile
        Self::new(tables.clone()).unwrap_or(Self {
            tables,
            model_patterns: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn overrides_keep_omitted_tables() {
        let tables = LookupTables::from_yaml_str("known_brands: [DYSON, APPLE]\n").expect("yaml");
        assert_eq!(tables.known_brands, vec!["DYSON".to_string(), "APPLE".to_string()]);
        assert_eq!(tables.noise_tokens, LookupTables::default().noise_tokens);
        assert_eq!(tables.categories.len(), 8);
    }

    #[test]
    fn brand_aliases_match_exactly_then_by_containment() {
        let tables = LookupTables::default();
        assert_eq!(tables.canonical_brand(" LG "), Some("LG"));
        assert_eq!(tables.canonical_brand("asus"), Some("ASUS"));
        assert_eq!(tables.canonical_brand("Apple Inc."), Some("Apple"));
        assert_eq!(tables.canonical_brand("小米 xiaomi 官方"), Some("Xiaomi"));
        assert_eq!(tables.canonical_brand("Dyson"), None);
        assert_eq!(tables.canonical_brand("  "), None);
    }

    #[test]
    fn price_tiers_use_exclusive_bounds() {
        let tables = LookupTables::default();
        assert_eq!(tables.price_tier(0.0), "budget");
        assert_eq!(tables.price_tier(999.0), "budget");
        assert_eq!(tables.price_tier(1_000.0), "mid-range");
        assert_eq!(tables.price_tier(9_990.0), "mid-range");
        assert_eq!(tables.price_tier(22_299.0), "premium");
        assert_eq!(tables.price_tier(50_000.0), "luxury");

        let bounded = LookupTables::from_yaml_str(
            "price_tiers:\n  - {label: cheap, below: 100}\n  - {label: dear, below: 200}\n",
        )
        .expect("yaml");
        assert_eq!(bounded.price_tier(150.0), "dear");
        assert_eq!(bounded.price_tier(500.0), "dear");
        assert_eq!(bounded.brand_mappings, LookupTables::default().brand_mappings);
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let rules = CatalogRules::from_workspace_root(dir.path()).expect("rules");
        assert_eq!(rules.tables, LookupTables::default());
        assert_eq!(rules.model_patterns.len(), rules.tables.model_families.len());
    }

    #[test]
    fn workspace_rules_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let rules = CatalogRules::from_workspace_root(&root).expect("rules");
        assert!(rules.tables.known_brands.iter().any(|b| b == "DYSON"));
    }
}
