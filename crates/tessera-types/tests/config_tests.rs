use tessera_types::*;

#[test]
fn defaults_are_valid() {
    let config = EngineCoreConfig::default();
    assert!(config.validate().is_ok());
    assert!(!config.use_eagle());
    assert_eq!(config.num_lookahead_tokens(), 0);
}

#[test]
fn block_size_must_be_aligned() {
    let mut cache = CacheConfig::default();
    cache.block_size = 24;
    assert!(matches!(cache.validate(), Err(TesseraError::Config { .. })));

    cache.block_size = 32;
    assert!(cache.validate().is_ok());
}

#[test]
fn scheduler_budget_must_cover_max_seqs() {
    let config = SchedulerConfig {
        max_num_seqs: 64,
        max_num_batched_tokens: 32,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn eagle_reports_lookahead() {
    let config = EngineCoreConfig {
        speculative: Some(SpeculativeConfig {
            method: SpeculativeMethod::Eagle,
            num_speculative_tokens: 3,
        }),
        ..Default::default()
    };
    assert!(config.use_eagle());
    assert_eq!(config.num_lookahead_tokens(), 3);
}

#[test]
fn logging_config_validation() {
    let mut logging = LoggingConfig::default();
    assert!(logging.validate().is_ok());
    logging.format = "xml".to_string();
    assert!(logging.validate().is_err());
}
