//! Runs the shipped demo application for a few timer periods

use std::path::Path;
use std::time::Duration;

use sight::modules::register_builtin_modules;
use sight_data::{Integer, Matrix4};
use sight_service::{AppConfigManager, AppState, ApplicationContext, Parameters};

#[test]
fn test_matrix_demo_runs() {
    let app = ApplicationContext::new().unwrap();
    register_builtin_modules(&app);

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("apps/matrix_demo.toml");
    let params = Parameters::from([
        ("period_ms".to_string(), "10".to_string()),
        ("step".to_string(), "7.0".to_string()),
    ]);
    let manager = AppConfigManager::load(&app, &path, &params).unwrap();

    manager.launch().unwrap();
    manager.flush().unwrap();
    assert_eq!(manager.state(), AppState::Started);

    // The level printer waits for the producer's output
    let level_printer = manager.service("level_printer").expect("level published at start");
    assert!(level_printer.is_started());

    std::thread::sleep(Duration::from_millis(200));

    let count = manager.object("count").unwrap();
    assert!(count.read::<Integer>().unwrap().0 > 0);
    let matrix = manager.object("matrix").unwrap();
    assert!(!matrix.read::<Matrix4>().unwrap().approx_eq(&Matrix4::identity(), 1e-12));

    manager.stop_and_destroy().unwrap();
    assert!(app.registry().is_empty());
    app.shutdown();
}
