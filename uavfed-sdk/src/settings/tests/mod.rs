use std::time::Duration;

use uavfed_core::settings::EvaluationSettings;

use super::{SensorSettings, Settings, TrainingSettings};

fn sensor_settings() -> SensorSettings {
    SensorSettings {
        start_time_ms: 0,
        interval_ms: 1000,
        data_collection_size: 5,
        feature_count: 10,
        report: true,
        seed: None,
    }
}

#[test]
fn test_settings_new() {
    assert!(Settings::new("../configs/worker.toml").is_ok());
    assert!(Settings::new("../configs/worker-local.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
fn test_settings_from_file() {
    let settings = Settings::new("../configs/worker-local.toml").unwrap();
    assert_eq!(settings.client.id, 1);
    assert_eq!(
        settings.client.destination_addresses,
        vec!["127.0.0.1:5000".to_string()]
    );
    assert_eq!(settings.sensor.feature_count, 10);
    assert!(!settings.sensor.report);
    assert_eq!(settings.sensor.seed, Some(3));
    assert_eq!(settings.training.dispatch_delay_ms, 10);
    assert_eq!(settings.model.seed, Some(7));
    assert_eq!(
        settings.evaluation,
        EvaluationSettings::Fixed { accuracy: 0.9 }
    );

    let params = settings.params();
    assert_eq!(params.client_id, 1);
    assert_eq!(params.start_time, Duration::from_millis(0));
    assert_eq!(params.sensor_interval, Duration::from_millis(200));
    assert_eq!(params.training_interval, Duration::from_secs(1));
    assert_eq!(params.dispatch_delay, Duration::from_millis(10));
    assert_eq!(params.data_collection_size, 3);
    assert!(!params.report_sensor_data);
}

#[test]
fn test_settings_defaults() {
    let settings = Settings::new("../configs/worker.toml").unwrap();
    assert_eq!(settings.client.destination_addresses.len(), 2);
    assert_eq!(settings.sensor.seed, None);
    assert_eq!(settings.model.seed, None);
    assert_eq!(settings.evaluation, EvaluationSettings::default());
}

#[test]
fn test_validate_sensor() {
    assert!(sensor_settings().validate_sensor().is_ok());
    assert!(SensorSettings {
        interval_ms: 0,
        ..sensor_settings()
    }
    .validate_sensor()
    .is_err());
    assert!(SensorSettings {
        data_collection_size: 0,
        ..sensor_settings()
    }
    .validate_sensor()
    .is_err());
    assert!(SensorSettings {
        feature_count: 0,
        ..sensor_settings()
    }
    .validate_sensor()
    .is_err());
}

#[test]
fn test_validate_training() {
    assert!(TrainingSettings {
        interval_ms: 1,
        dispatch_delay_ms: 0,
    }
    .validate_training()
    .is_ok());
    assert!(TrainingSettings {
        interval_ms: 0,
        dispatch_delay_ms: 10,
    }
    .validate_training()
    .is_err());
}

#[test]
fn test_sampler() {
    let mut sampler = SensorSettings {
        feature_count: 4,
        ..sensor_settings()
    }
    .sampler();
    assert_eq!(sampler.sample().len(), 4);
}
