use std::time::Duration;

use flagpipe::{
    DeliverySettings, DeliveryTaskConfig, FeatureEvent, LogExporter, Manager, ManagerConfig,
    TrackingEvent,
};

pub fn main() {
    // Configure env_logger to see pipeline logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("flagpipe=info"))
        .init();

    let settings: DeliverySettings =
        serde_json::from_str(r#"{"name": "stdout-log", "flushInterval": 1000}"#)
            .expect("settings should be valid JSON");

    let manager: Manager<FeatureEvent> = Manager::new(
        vec![DeliveryTaskConfig::from_settings(LogExporter::new(), settings)],
        ManagerConfig::default(),
    )
    .expect("failed to create the export pipeline");
    manager
        .start_daemon()
        .expect("failed to start delivery threads");

    for user in ["alice", "bob", "carol"] {
        manager.add_event(FeatureEvent::new(user, false, "new-checkout", true, "enabled"));
    }

    // Tracking events go through their own pipeline.
    let tracking: Manager<TrackingEvent> = Manager::new(
        vec![DeliveryTaskConfig::new(
            LogExporter::with_format("{{ .UserKey}} tracked {{ .Key}} at {{ .FormattedDate}}")
                .expect("format should be valid"),
        )],
        ManagerConfig::default(),
    )
    .expect("failed to create the tracking pipeline");
    tracking.add_event(TrackingEvent::new("alice", false, "checkout-completed"));

    std::thread::sleep(Duration::from_millis(1500));

    manager.close().expect("failed to close the export pipeline");
    tracking.close().expect("failed to close the tracking pipeline");
}
