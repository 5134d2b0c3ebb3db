use uavfed_core::settings::EvaluationSettings;

use super::{RoundSettings, Settings};

fn round_settings() -> RoundSettings {
    RoundSettings {
        start_time_ms: 0,
        aggregation_interval_ms: 10_000,
        round_interval_ms: 30_000,
        early_aggregation_delay_ms: 100,
        min_updates: 2,
        total_clients: 3,
    }
}

#[test]
fn test_settings_new() {
    assert!(Settings::new("../configs/coordinator.toml").is_ok());
    assert!(Settings::new("../configs/coordinator-local.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
fn test_settings_from_file() {
    let settings = Settings::new("../configs/coordinator-local.toml").unwrap();
    assert_eq!(settings.api.bind_address, "127.0.0.1:5000".parse().unwrap());
    assert_eq!(settings.api.broadcast_address, None);
    assert_eq!(settings.round.early_aggregation_delay_ms, 100);
    assert_eq!(settings.round.start_time_ms, 0);
    assert_eq!(settings.model.seed, Some(42));
    assert_eq!(
        settings.evaluation,
        EvaluationSettings::Fixed { accuracy: 0.9 }
    );
}

#[test]
fn test_validate_round() {
    assert!(round_settings().validate_round().is_ok());

    // counts
    assert!(RoundSettings {
        min_updates: 0,
        ..round_settings()
    }
    .validate_round()
    .is_err());
    assert!(RoundSettings {
        min_updates: 4,
        ..round_settings()
    }
    .validate_round()
    .is_err());
    assert!(RoundSettings {
        min_updates: 3,
        ..round_settings()
    }
    .validate_round()
    .is_ok());

    // intervals
    assert!(RoundSettings {
        aggregation_interval_ms: 1,
        ..round_settings()
    }
    .validate_round()
    .is_err());
    assert!(RoundSettings {
        round_interval_ms: 0,
        ..round_settings()
    }
    .validate_round()
    .is_err());
}

#[test]
fn test_round_params() {
    let params = round_settings().params();
    assert_eq!(params.aggregation_interval.as_millis(), 10_000);
    assert_eq!(params.round_interval.as_secs(), 30);
    assert_eq!(params.early_aggregation_delay.as_millis(), 100);
    assert_eq!(params.min_updates, 2);
    assert_eq!(params.total_clients, 3);
}
