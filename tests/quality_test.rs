use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use streamtrack_rs::streaming::{MetricsSample, QualityConfig, QualityController};

fn at(s: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(s)
}

fn controller(sensitivity: f64) -> QualityController {
    QualityController::new(QualityConfig {
        sensitivity,
        min_stability_period: Duration::from_secs(5),
        ..QualityConfig::default()
    })
    .unwrap()
}

#[test]
fn test_adaptation_steps_up_then_down() {
    let c = controller(1.0);
    c.register_client_at("viewer", at(0));

    c.update_network_metrics_at("viewer", &MetricsSample::bandwidth(2_000_000), at(0));
    assert!(c.adapt_client_at("viewer", at(0)).is_none());
    assert_eq!(c.current_level("viewer"), Some(2));

    c.update_network_metrics_at(
        "viewer",
        &MetricsSample::bandwidth(8_000_000)
            .with_latency(Duration::from_millis(40))
            .with_packet_loss(0.0),
        at(6),
    );
    let up = c.adapt_client_at("viewer", at(6)).unwrap();
    assert_eq!((up.from_level, up.to_level), (2, 4));
    assert_eq!(c.optimal_quality("viewer").name, "Ultra");

    c.update_network_metrics_at(
        "viewer",
        &MetricsSample::latency(Duration::from_millis(250)),
        at(11),
    );
    let down = c.adapt_client_at("viewer", at(11)).unwrap();
    assert_eq!((down.from_level, down.to_level), (4, 3));

    let profile = c.client_profile("viewer").unwrap();
    assert_eq!(profile.adaptation_count, 2);
    assert_eq!(profile.history.len(), 2);

    let stats = c.stats();
    assert_eq!((stats.upgrades, stats.downgrades), (1, 1));
}

#[test]
fn test_level_stays_within_bounds() {
    let c = controller(1.0);
    c.register_client_at("viewer", at(0));

    let bandwidths = [50_000, 10, 90_000_000, 0, 500_000_000, 1_000, 7_500_000];
    let mut t = 0;
    for bw in bandwidths {
        t += 6;
        c.update_network_metrics_at("viewer", &MetricsSample::bandwidth(bw), at(t));
        c.update_network_metrics_at("viewer", &MetricsSample::bandwidth(bw), at(t));
        c.adapt_client_at("viewer", at(t));
        let level = c.current_level("viewer").unwrap();
        assert!(level <= 4, "level {level} after {bw} bps");
    }
}

#[test]
fn test_poor_link_bottoms_out_at_low() {
    let c = controller(1.0);
    c.register_client_at("viewer", at(0));
    let sample = MetricsSample::bandwidth(100_000)
        .with_latency(Duration::from_millis(400))
        .with_packet_loss(12.0);
    c.update_network_metrics_at("viewer", &sample, at(1));
    c.update_network_metrics_at("viewer", &sample, at(2));

    let change = c.adapt_client_at("viewer", at(10)).unwrap();
    assert_eq!(change.to_level, 0);
    assert!(c.adapt_client_at("viewer", at(20)).is_none());
    assert_eq!(c.optimal_quality("viewer").max_frame_rate, 5);
}

#[test]
fn test_unregistered_client_is_forgotten() {
    let c = controller(0.7);
    c.register_client_at("viewer", at(0));
    assert_eq!(c.client_count(), 1);
    c.unregister_client("viewer");
    assert_eq!(c.client_count(), 0);
    assert!(c.current_level("viewer").is_none());
    assert!(c.adapt_all_at(at(100)).is_empty());
}
