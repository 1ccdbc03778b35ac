use pricedragon_core::RawRecord;

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Share of six completeness checks passed, rounded to two decimals.
///
/// `price` is the coerced current price; every other check reads the raw record.
pub fn quality_score(raw: &RawRecord, price: f64) -> f64 {
    let checks = [
        raw.name.trim().chars().count() > 5,
        price > 0.0,
        present(&raw.url),
        present(&raw.image_url),
        present(&raw.brand),
        present(&raw.description),
    ];
    let passed = checks.iter().filter(|c| **c).count() as f64;
    (passed / checks.len() as f64 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_counts_checks_and_rounds() {
        let empty = RawRecord::default();
        assert_eq!(quality_score(&empty, 0.0), 0.0);

        let full = RawRecord {
            name: "Apple iPhone 15".into(),
            url: Some("https://example.com/p".into()),
            image_url: Some("https://example.com/p.jpg".into()),
            brand: Some("Apple".into()),
            description: Some("6.1 吋".into()),
            ..RawRecord::default()
        };
        assert_eq!(quality_score(&full, 22299.0), 1.0);

        let partial = RawRecord {
            name: "iPhone15 128GB".into(),
            url: Some("https://example.com/p".into()),
            brand: Some("   ".into()),
            ..RawRecord::default()
        };
        assert_eq!(quality_score(&partial, 22990.0), 0.5);
        assert_eq!(quality_score(&partial, 0.0), 0.33);
    }

    #[test]
    fn score_is_deterministic_and_bounded() {
        let raw = RawRecord {
            name: "短名".into(),
            image_url: Some("x".into()),
            ..RawRecord::default()
        };
        let first = quality_score(&raw, -1.0);
        for _ in 0..10 {
            assert_eq!(quality_score(&raw, -1.0), first);
        }
        assert!((0.0..=1.0).contains(&first));
        assert_eq!(first, 0.17);
    }
}
