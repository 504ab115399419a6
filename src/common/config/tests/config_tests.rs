//! Unit tests for common-config crate

use common_config::{
    DEFAULT_CANCELLATION_CHECK_INTERVAL, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CHUNK_SIZE,
    DEFAULT_PRODUCER_BUFFER_LIMIT, ExecutionMode, MAX_SUPPORTED_DOP, MergeOptions, QueryOptions,
    TuningConfig, default_degree_of_parallelism,
};

#[test]
fn test_query_options_default() {
    let options = QueryOptions::default();

    assert_eq!(options.degree_of_parallelism, None);
    assert_eq!(options.execution_mode, ExecutionMode::Default);
    assert_eq!(options.merge_options, MergeOptions::AutoBuffered);
    assert_eq!(options.tuning, TuningConfig::default());
}

#[test]
fn test_tuning_defaults() {
    let tuning = TuningConfig::default();

    assert_eq!(tuning.cancellation_check_interval, 64);
    assert_eq!(tuning.cancellation_check_mask(), 0x3F);
    assert_eq!(tuning.chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(tuning.producer_buffer_limit, 8192);
    assert_eq!(tuning.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    assert_eq!(
        tuning.cancellation_check_interval,
        DEFAULT_CANCELLATION_CHECK_INTERVAL
    );
    assert_eq!(tuning.producer_buffer_limit, DEFAULT_PRODUCER_BUFFER_LIMIT);
    assert_eq!(TuningConfig::global(), &tuning);
}

#[test]
fn test_default_dop_is_capped() {
    let dop = default_degree_of_parallelism();
    assert!(dop >= 1);
    assert!(dop <= MAX_SUPPORTED_DOP);
    assert_eq!(QueryOptions::default().effective_degree_of_parallelism(), dop);
}

#[test]
fn test_validate_degree_of_parallelism() {
    assert!(QueryOptions::default().validate().is_ok());
    assert!(
        QueryOptions::default()
            .with_degree_of_parallelism(4)
            .validate()
            .is_ok()
    );
    assert!(
        QueryOptions::default()
            .with_degree_of_parallelism(0)
            .validate()
            .is_err()
    );
    assert!(
        QueryOptions::default()
            .with_degree_of_parallelism(MAX_SUPPORTED_DOP + 1)
            .validate()
            .is_err()
    );
}

#[test]
fn test_validate_tuning() {
    let bad_interval = TuningConfig::default().with_cancellation_check_interval(48);
    assert!(bad_interval.validate().is_err());

    let bad_chunk = TuningConfig::default().with_chunk_size(0);
    assert!(bad_chunk.validate().is_err());

    let ok = TuningConfig::default()
        .with_cancellation_check_interval(16)
        .with_producer_buffer_limit(16)
        .with_channel_capacity(2);
    assert!(ok.validate().is_ok());
    assert_eq!(ok.cancellation_check_mask(), 15);
}

#[test]
fn test_query_options_serialization() {
    let options = QueryOptions::default()
        .with_degree_of_parallelism(8)
        .with_execution_mode(ExecutionMode::ForceParallelism)
        .with_merge_options(MergeOptions::FullyBuffered);

    let json = serde_json::to_string(&options).unwrap();
    assert!(json.contains("ForceParallelism"));
    assert!(json.contains("FullyBuffered"));

    let deserialized: QueryOptions = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, options);
}

#[test]
fn test_query_options_partial_json() {
    let json = r#"{
        "merge_options": "NotBuffered",
        "tuning": { "chunk_size": 32 }
    }"#;

    let options: QueryOptions = serde_json::from_str(json).unwrap();
    assert_eq!(options.merge_options, MergeOptions::NotBuffered);
    assert_eq!(options.degree_of_parallelism, None);
    assert_eq!(options.tuning.chunk_size, 32);
    // Missing fields should use defaults
    assert_eq!(options.tuning.producer_buffer_limit, 8192);
}

#[test]
fn test_invalid_merge_option_deserialization() {
    let json = r#"{ "merge_options": "Sometimes" }"#;

    let result: Result<QueryOptions, _> = serde_json::from_str(json);
    assert!(result.is_err());
}

#[test]
fn test_options_clone_is_independent() {
    let base = QueryOptions::default();
    let mut changed = base.clone();
    changed.degree_of_parallelism = Some(2);

    assert_eq!(base.degree_of_parallelism, None);
    assert_eq!(changed.effective_degree_of_parallelism(), 2);
}
