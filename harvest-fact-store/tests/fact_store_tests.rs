//! End-to-end tests for writing, reading and summarizing fact tables.

use harvest_fact_store::{
    FactReader, FilterSet, LifecycleManager, SnapshotState, SummaryCache,
};
use harvest_result::{Error, Result};
use harvest_test_utils::{init_tracing_for_tests, record, rule_fact, sample_metadata};
use harvest_types::layout::validation_records_path;
use harvest_types::{RecordValidation, SnapshotMetadata, StoreConfig};
use std::fs;
use tempfile::TempDir;

fn store() -> (TempDir, StoreConfig) {
    init_tracing_for_tests();
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path());
    (dir, config)
}

fn write_snapshot(config: &StoreConfig, metadata: &SnapshotMetadata, records: &[RecordValidation]) {
    let lifecycle = LifecycleManager::new(config.clone());
    lifecycle.initialize(metadata).unwrap();
    for r in records {
        lifecycle.append(metadata.snapshot_id, r).unwrap();
    }
    lifecycle.finalize(metadata.snapshot_id).unwrap();
}

/// 60 records over 3 institutions; every third record is invalid on rule 2.
fn mixed_records() -> Vec<RecordValidation> {
    (0..60)
        .map(|i| {
            let valid = i % 3 != 0;
            record(&format!("oai:repo:{i:03}"), valid, i % 5 == 0)
                .with_institution(["Universidad A", "Universidad B", "Instituto C"][i % 3])
                .with_repository(format!("Repo {}", i % 4))
                .with_rule(rule_fact(1, true))
                .with_rule(rule_fact(2, valid))
        })
        .collect()
}

#[test]
fn test_la_referencia_scenario() {
    let (dir, config) = store();
    let metadata = sample_metadata(8, "LA Referencia");
    let records = vec![
        record("oai:lare:1", true, false)
            .with_rule(rule_fact(1, true))
            .with_rule(rule_fact(2, true)),
        record("oai:lare:2", true, true)
            .with_rule(rule_fact(1, true))
            .with_rule(rule_fact(2, true)),
        record("oai:lare:3", false, false)
            .with_rule(rule_fact(1, false))
            .with_rule(rule_fact(2, true)),
    ];
    write_snapshot(&config, &metadata, &records);

    assert!(dir
        .path()
        .join("LA_REFERENCIA/snapshots/snapshot_8/validation_records")
        .is_dir());

    let reader = FactReader::new(config);
    let summary = SummaryCache::new(reader.clone())
        .get(&metadata.key())
        .unwrap()
        .expect("summary written at finalize");
    assert_eq!(summary.total_records, 3);
    assert_eq!(summary.valid_records, 2);

    let filters = FilterSet::parse(&["record_is_valid:false"]).unwrap();
    let page = reader
        .query_with_filters(&metadata.key(), &filters, 0, 100)
        .unwrap();
    assert_eq!(page.total_filtered, 2);
    assert!(page.rows.iter().all(|r| r.identifier == "oai:lare:3"));
}

#[test]
fn test_filtered_pagination_is_consistent() {
    let (_dir, config) = store();
    let config = config.with_records_per_file(7).with_flush_threshold(3);
    let metadata = sample_metadata(20, "BR");
    write_snapshot(&config, &metadata, &mixed_records());

    let reader = FactReader::new(config);
    let filters = FilterSet::parse(&["institution_name:Universidad B"]).unwrap();
    let key = metadata.key();

    let all = reader.query_observations(&key, &filters, 0, 1000).unwrap();
    assert_eq!(all.total, Some(20));

    let mut paged = Vec::new();
    let mut offset = 0;
    loop {
        let page = reader.query_observations(&key, &filters, offset, 6).unwrap();
        assert_eq!(page.total, Some(20));
        paged.extend(page.items.into_iter().map(|r| r.identifier));
        if !page.has_next {
            break;
        }
        offset += 6;
    }
    let expected: Vec<_> = all.items.into_iter().map(|r| r.identifier).collect();
    assert_eq!(paged, expected);
}

#[test]
fn test_summary_agrees_with_raw_aggregation() {
    let (_dir, config) = store();
    let config = config.with_records_per_file(11);
    let metadata = sample_metadata(21, "MX");
    write_snapshot(&config, &metadata, &mixed_records());

    let reader = FactReader::new(config);
    let cache = SummaryCache::new(reader.clone());
    let cached = cache.get(&metadata.key()).unwrap().unwrap();
    let mut raw = reader.aggregate(&metadata, &FilterSet::default()).unwrap();
    raw.created_at = cached.created_at;
    assert_eq!(cached, raw);

    assert_eq!(cached.total_records, 60);
    assert_eq!(cached.valid_records, 40);
    assert_eq!(cached.transformed_records, 12);
    assert_eq!(cached.rules[&2].invalid_count, 20);
    assert_eq!(cached.rules[&3].valid_count, 0);
    assert_eq!(cached.total_fact_rows, 120);
    assert!(cached.partition_count >= 2);
}

#[test]
fn test_partition_isolation() {
    let (_dir, config) = store();
    let br = sample_metadata(30, "BR");
    let cl = sample_metadata(30, "CL");
    write_snapshot(&config, &br, &mixed_records()[..10]);
    write_snapshot(
        &config,
        &cl,
        &[record("oai:cl:1", true, false).with_rule(rule_fact(1, true))],
    );

    let reader = FactReader::new(config);
    let rows: Vec<_> = reader
        .iterate(&cl.key())
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows.iter().all(|r| r.network == "CL"));

    let br_rows = reader.iterate(&br.key()).unwrap().count();
    assert_eq!(br_rows, 20);
}

#[test]
fn test_initialize_twice_is_a_noop() {
    let (_dir, config) = store();
    let lifecycle = LifecycleManager::new(config.clone());
    let metadata = sample_metadata(40, "AR");

    lifecycle.initialize(&metadata).unwrap();
    lifecycle
        .append(metadata.snapshot_id, &record("oai:ar:1", true, false).with_rule(rule_fact(1, true)))
        .unwrap();
    lifecycle.initialize(&metadata).unwrap();
    lifecycle.finalize(metadata.snapshot_id).unwrap();
    lifecycle.initialize(&metadata).unwrap();
    assert_eq!(lifecycle.state(metadata.snapshot_id).unwrap(), SnapshotState::Closed);

    let rows = FactReader::new(config).iterate(&metadata.key()).unwrap().count();
    assert_eq!(rows, 1);
}

#[test]
fn test_append_after_finalize_is_rejected() {
    let (_dir, config) = store();
    let lifecycle = LifecycleManager::new(config);
    let metadata = sample_metadata(41, "AR");
    lifecycle.initialize(&metadata).unwrap();
    lifecycle.finalize(metadata.snapshot_id).unwrap();

    let err = lifecycle
        .append(metadata.snapshot_id, &record("oai:late", true, false))
        .unwrap_err();
    match err {
        Error::InvalidState { snapshot_id, state, operation } => {
            assert_eq!(snapshot_id, 41);
            assert_eq!(state, "CLOSED");
            assert_eq!(operation, "append");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_reading_during_write_sees_only_closed_files() {
    let (_dir, config) = store();
    let config = config.with_records_per_file(5).with_flush_threshold(2);
    let lifecycle = LifecycleManager::new(config.clone());
    let metadata = sample_metadata(42, "PE");
    lifecycle.initialize(&metadata).unwrap();
    for r in mixed_records().into_iter().filter(|r| r.record_is_valid).take(7) {
        lifecycle.append(metadata.snapshot_id, &r).unwrap();
    }

    let dir = validation_records_path(&config.base_path, "PE", metadata.snapshot_id);
    let in_progress = fs::read_dir(&dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".inprogress")
        })
        .count();
    assert_eq!(in_progress, 1);

    let reader = FactReader::new(config);
    let visible = reader
        .iterate_records(&metadata.key(), &FilterSet::default())
        .unwrap()
        .count();
    assert_eq!(visible, 5);
}

#[test]
fn test_rule_filters_and_occurrence_counts() {
    let (_dir, config) = store();
    let config = config.with_detailed_diagnostics(true);
    let metadata = sample_metadata(50, "CO");
    let records = vec![
        record("oai:co:1", true, false).with_rule(
            rule_fact(3, true).with_valid_occurrences(["article", "article", "thesis"]),
        ),
        record("oai:co:2", false, false)
            .with_rule(rule_fact(3, false).with_invalid_occurrences(["banana"]))
            .with_rule(rule_fact(1, false)),
        record("oai:co:3", true, false)
            .with_rule(rule_fact(3, true).with_valid_occurrences(["thesis", " "])),
    ];
    write_snapshot(&config, &metadata, &records);

    let reader = FactReader::new(config);
    let key = metadata.key();

    let counts = reader
        .count_rule_occurrences(&key, 3, &FilterSet::default())
        .unwrap();
    let valid: Vec<_> = counts.valid.iter().map(|e| (e.value.as_str(), e.count)).collect();
    assert_eq!(valid, vec![("thesis", 2), ("article", 1)]);
    assert_eq!(counts.invalid.len(), 1);
    assert_eq!(counts.invalid[0].value, "banana");

    let invalid_title = FilterSet::parse(&["invalid_rules:1"]).unwrap();
    let page = reader.query_observations(&key, &invalid_title, 0, 10).unwrap();
    assert_eq!(page.total, Some(1));
    assert_eq!(page.items[0].identifier, "oai:co:2");

    let valid_only = FilterSet::parse(&["isValid:true"]).unwrap();
    let counts = reader.count_rule_occurrences(&key, 3, &valid_only).unwrap();
    assert!(counts.invalid.is_empty());

    let contains = FilterSet::parse(&["identifier:*co:3*"]).unwrap();
    let page = reader.query_observations(&key, &contains, 0, 10).unwrap();
    assert_eq!(page.total, Some(1));
}

#[test]
fn test_missing_snapshot_is_not_found() {
    let (_dir, config) = store();
    let reader = FactReader::new(config);
    let metadata = sample_metadata(99, "BR");
    let err = reader
        .query_observations(&metadata.key(), &FilterSet::default(), 0, 10)
        .unwrap_err();
    assert!(err.is_not_found());
}
