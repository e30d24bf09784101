//! Dynamic records-per-file policy.

use harvest_types::StoreConfig;

/// Records per output file for a snapshot of `estimated_records`.
///
/// Each band's lower bound is inclusive. Falls back to the configured static
/// value when the size is unknown or dynamic sizing is disabled.
pub fn records_per_file(config: &StoreConfig, estimated_records: Option<u64>) -> u64 {
    match estimated_records {
        Some(size) if config.dynamic_sizing => match size {
            0..=99_999 => 50_000,
            100_000..=999_999 => 500_000,
            1_000_000..=9_999_999 => 1_000_000,
            _ => 2_000_000,
        },
        _ => config.records_per_file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        let config = StoreConfig::new("/data");
        assert_eq!(records_per_file(&config, Some(99_999)), 50_000);
        assert_eq!(records_per_file(&config, Some(100_000)), 500_000);
        assert_eq!(records_per_file(&config, Some(999_999)), 500_000);
        assert_eq!(records_per_file(&config, Some(1_000_000)), 1_000_000);
        assert_eq!(records_per_file(&config, Some(10_000_000)), 2_000_000);
    }

    #[test]
    fn test_static_fallback() {
        let config = StoreConfig::new("/data").with_records_per_file(1234);
        assert_eq!(records_per_file(&config, None), 1234);
        let fixed = config.with_dynamic_sizing(false);
        assert_eq!(records_per_file(&fixed, Some(5_000_000)), 1234);
    }
}
