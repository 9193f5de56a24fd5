//! 集成测试 - 会话状态机与请求/响应
//!
//! 使用进程内的假无线层验证连接、分片、重组和关联的组合行为。

mod common;

use common::{DEVICE, FakeRadio, fast_config, fragments};
use futures_util::StreamExt;
use lubrisense_core::ble::{BleScanner, ConnectionManager, ConnectionState, ScanFilter};
use lubrisense_core::protocol::{ConfigType, DeviceConfig, IntervalType};
use lubrisense_core::store::DeviceStore;
use lubrisense_core::workflow::{DeviceWorkflow, LogCallback, WorkflowOptions};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

fn manager(radio: &FakeRadio) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(Arc::new(radio.clone()), fast_config()))
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);

    assert!(manager.connect(DEVICE).await);
    assert_eq!(manager.state(), ConnectionState::Ready);
    assert_eq!(manager.current_device().as_deref(), Some(DEVICE));

    // 标识大小写不同也视为同一设备
    assert!(manager.connect(&DEVICE.to_uppercase()).await);
    assert_eq!(radio.connects(), 1);
    assert_eq!(radio.state.subscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_then_succeeds() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.connect_failures.store(2, Ordering::SeqCst);
    let manager = manager(&radio);

    assert!(manager.connect(DEVICE).await);
    assert_eq!(radio.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_budget() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.connect_failures.store(10, Ordering::SeqCst);
    let manager = manager(&radio);

    assert!(!manager.connect(DEVICE).await);
    assert_eq!(radio.connects(), 3);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_device().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_is_retried() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.connect_hangs.store(true, Ordering::SeqCst);
    let manager = manager(&radio);

    let start = Instant::now();
    assert!(!manager.connect(DEVICE).await);
    assert_eq!(radio.connects(), 3);
    // 三次 1s 超时
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_characteristic_resolution_lag() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.resolve_misses.store(2, Ordering::SeqCst);
    let manager = manager(&radio);

    assert!(manager.connect(DEVICE).await);
    assert_eq!(radio.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_characteristic_releases_link() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.resolve_misses.store(100, Ordering::SeqCst);
    let manager = manager(&radio);

    assert!(!manager.connect(DEVICE).await);
    // 每次整体重试都释放了上一次打开的链路
    assert_eq!(radio.connects(), 3);
    assert_eq!(radio.state.disconnects.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_is_not_found() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);

    assert!(!manager.connect("00000000-0000-0000-0000-000000000000").await);
    assert_eq!(radio.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_chunks_in_order() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    let payload = r#"{"comando":"set_config","payload":{"Volume":7}}"#;
    assert!(manager.send(payload.as_bytes()).await);

    let writes = radio.writes();
    assert_eq!(writes.len(), payload.len().div_ceil(20));
    assert!(writes.iter().all(|w| w.len() <= 20));
    assert_eq!(writes.concat(), payload.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_ready() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);

    assert!(!manager.send(b"1").await);
    assert!(manager.request_response("{}", Duration::from_secs(1)).await.is_none());
    assert!(radio.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_aborts_on_write_failure() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.fail_write_at.store(2, Ordering::SeqCst);
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    assert!(!manager.send(&[b'x'; 100]).await);
    assert_eq!(radio.writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_at_deadline() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    let start = Instant::now();
    let reply = manager
        .request_response(r#"{"comando":"get_log"}"#, Duration::from_millis(100))
        .await;
    let elapsed = start.elapsed();

    assert!(reply.is_none());
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(150), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_request_ack_with_fragmented_reply() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.respond_with(|_| {
        let mut out = fragments(r#"{"status":"OK"}"#, 4);
        // 迟到的重复回复
        out.extend(fragments(r#"{"status":"OK"}"#, 20));
        out
    });
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);
    let mut messages = manager.messages();

    assert!(
        manager
            .request_ack(r#"{"comando":"set_config"}"#, "OK", Duration::from_secs(10))
            .await
    );

    // 两份都出现在广播流上，但只有第一份被请求认领
    let first = messages.next().await.unwrap().unwrap();
    let second = messages.next().await.unwrap().unwrap();
    assert_eq!(first.as_str(), r#"{"status":"OK"}"#);
    assert_eq!(second.as_str(), r#"{"status":"OK"}"#);

    // 之后的请求不会拿到上一次的重复回复
    radio.respond_with(|_| Vec::new());
    assert!(
        manager
            .request_response(r#"{"comando":"get_config"}"#, Duration::from_millis(50))
            .await
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_connect_drops_old_session_messages() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    let stale = radio.notifier().unwrap();
    let mut messages = manager.messages();

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(radio.state.unsubscribes.load(Ordering::SeqCst), 1);

    let _ = stale.send(br#"{"old":1}"#.to_vec());
    assert!(manager.connect(DEVICE).await);
    assert!(radio.notify(br#"{"new":1}"#));

    let next = tokio::time::timeout(Duration::from_secs(1), messages.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next.as_str(), r#"{"new":1}"#);
    assert_eq!(radio.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);

    manager.disconnect().await;
    assert!(manager.connect(DEVICE).await);
    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(radio.state.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_in_flight_request() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .request_response(r#"{"comando":"get_log"}"#, Duration::from_secs(15))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    manager.disconnect().await;

    assert!(pending.await.unwrap().is_none());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_forces_reconnect() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let manager = manager(&radio);
    assert!(manager.connect(DEVICE).await);

    let mut state = manager.watch_state();
    radio.drop_link();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();

    assert!(manager.connect(DEVICE).await);
    assert_eq!(radio.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_notify_characteristic_still_sends() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.state.no_notify.store(true, Ordering::SeqCst);
    let manager = manager(&radio);

    assert!(manager.connect(DEVICE).await);
    assert!(manager.send(b"1").await);
    assert!(manager.request_response("{}", Duration::from_secs(1)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_scanner_deduplicates_and_filters() {
    let radio = FakeRadio::default();
    radio.advertise("dev-1", Some("LUBRICENSE_Device_01"), vec![]);
    radio.advertise("DEV-1", Some("LUBRICENSE_Device_01"), vec![]);
    radio.advertise("dev-2", Some("Headphones"), vec![]);
    radio.advertise("dev-3", None, vec![lubrisense_core::ble::SERVICE_UUID]);
    radio.advertise("dev-1", Some("LUBRICENSE_Device_01"), vec![]);

    let scanner = BleScanner::new(Arc::new(radio.clone()));
    let filter = ScanFilter::by_name("lubricense_device").with_service(lubrisense_core::ble::SERVICE_UUID);
    let mut rx = scanner.start(filter).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(Some(device)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        seen.push(device.identity);
    }
    seen.sort();
    assert_eq!(seen, vec!["dev-1".to_string(), "dev-3".to_string()]);

    scanner.stop().await;
    scanner.stop().await;
    assert_eq!(radio.state.scan_stops.load(Ordering::SeqCst), 1);
    // 停止后结果仍可用于连接
    assert!(scanner.lookup("DEV-1").is_some());

    // 重新开始会清空上一轮结果
    let _rx = scanner.start(ScanFilter::by_name("nothing-matches")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scanner.discovered().is_empty());
    scanner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_uses_scan_results() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let radio_arc = Arc::new(radio.clone());
    let scanner = Arc::new(BleScanner::new(radio_arc.clone()));
    let manager = ConnectionManager::with_scanner(radio_arc, scanner.clone(), fast_config());

    let devices = scanner
        .scan(ScanFilter::by_name("LUBRICENSE"), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    let starts = radio.state.scan_starts.load(Ordering::SeqCst);

    assert!(manager.connect(DEVICE).await);
    // 设备已在结果集中，不需要再扫描
    assert_eq!(radio.state.scan_starts.load(Ordering::SeqCst), starts);
}

fn workflow(radio: &FakeRadio, dir: &tempfile::TempDir) -> DeviceWorkflow {
    DeviceWorkflow::new(
        manager(radio),
        DeviceStore::new(dir.path().join("devices.json")),
        WorkflowOptions {
            query_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            legacy_envelope: false,
        },
    )
}

fn valid_config() -> DeviceConfig {
    DeviceConfig {
        tag: "tag_10010111".into(),
        equipment: "Motor caldeira 1".into(),
        sector: "Planta 1".into(),
        lubricant: "Ecolub Food Grade".into(),
        volume: 10.0,
        interval: 5,
        config_type: ConfigType::Advanced,
        interval_type: IntervalType::Hour,
    }
}

#[tokio::test(start_paused = true)]
async fn test_workflow_fetch_logs_newest_first() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.respond_with(|command| {
        assert_eq!(command, br#"{"comando":"get_log"}"#);
        fragments(
            r#"{"logs":[{"Hora":"2025-12-01T08:00:00","Sucesso":true,"Modo":"Auto","Temperatura":21.0,"Bateria":90,"e":true},{"Hora":"2025-12-02T08:00:00","Sucesso":false,"Modo":"Manual","Temperatura":22.5,"Bateria":89,"e":false}]}"#,
            20,
        )
    });
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    let logs = workflow.fetch_logs(DEVICE, &LogCallback).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].time, "2025-12-02T08:00:00");
    assert!(!logs[0].success);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_push_config_persists_on_ack() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.respond_with(|_| fragments(r#"{"status":"OK"}"#, 5));
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    let saved = workflow
        .push_config(DEVICE, valid_config(), &LogCallback)
        .await
        .unwrap();
    assert_eq!(saved.config, valid_config());

    let sent: serde_json::Value = serde_json::from_str(&radio.commands()[0]).unwrap();
    assert_eq!(sent["comando"], "set_config");
    assert_eq!(sent["payload"]["TipoIntervalo"], 1);

    let stored = workflow.store().get(DEVICE).unwrap().unwrap();
    assert_eq!(stored.config.equipment, "Motor caldeira 1");
}

#[tokio::test(start_paused = true)]
async fn test_workflow_push_config_without_ack_is_not_saved() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.respond_with(|_| fragments(r#"{"status":"ERR"}"#, 5));
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    assert!(workflow.push_config(DEVICE, valid_config(), &LogCallback).await.is_err());
    assert!(workflow.store().get(DEVICE).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_workflow_rejects_invalid_config_before_connecting() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    let config = DeviceConfig {
        interval_type: IntervalType::None,
        ..valid_config()
    };
    let err = workflow
        .push_config(DEVICE, config, &LogCallback)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("interval type"));
    assert_eq!(radio.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_fetch_config_and_led() {
    let radio = FakeRadio::with_device(DEVICE, "LUBRICENSE_Device_01");
    radio.respond_with(|command| {
        if command.starts_with(b"{") {
            fragments(
                r#"{"comando":"get_config","payload":{"Equipamento":"Motor","Setor":"S","Volume":3,"Intervalo":2,"TipoConfig":0}}"#,
                20,
            )
        } else {
            Vec::new()
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    let config = workflow.fetch_config(DEVICE, &LogCallback).await.unwrap();
    assert_eq!(config.equipment, "Motor");
    assert_eq!(config.interval, 2);

    workflow.set_led(DEVICE, true, &LogCallback).await.unwrap();
    workflow.set_led(DEVICE, false, &LogCallback).await.unwrap();
    let commands = radio.commands();
    assert_eq!(&commands[1..], &["1".to_string(), "0".to_string()]);
    assert_eq!(radio.connects(), 1);
}

#[tokio::test]
async fn test_workflow_save_details_keeps_parameters() {
    let radio = FakeRadio::default();
    let dir = tempfile::tempdir().unwrap();
    let workflow = workflow(&radio, &dir);

    workflow
        .store()
        .upsert(lubrisense_core::SavedDevice::new(DEVICE, valid_config()))
        .unwrap();

    let details = DeviceConfig {
        equipment: "Bomba 2".into(),
        sector: "Planta 2".into(),
        ..Default::default()
    };
    let saved = workflow.save_details(DEVICE, details).unwrap();
    assert_eq!(saved.config.equipment, "Bomba 2");
    assert_eq!(saved.config.volume, 10.0);

    assert!(workflow.save_details(DEVICE, DeviceConfig::default()).is_err());
    assert!(workflow.forget(DEVICE).unwrap());
}
