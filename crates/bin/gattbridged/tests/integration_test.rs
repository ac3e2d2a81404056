//! End-to-end tests for the full gattbridged stack.
//!
//! Each test spins up the complete application (scripted central, real
//! bridge loop, real in-process data model, real axum router) and drives it
//! through injected central events plus `tower::ServiceExt::oneshot` — no
//! TCP port is bound and no radio is touched. Time is paused, so the scan
//! and recovery windows elapse only when a test advances the clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeDelta, Utc};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use gattbridge_adapter_http_axum::router;
use gattbridge_adapter_http_axum::state::AppState;
use gattbridge_app::bridge::{Bridge, BridgeConfig, BridgeHandle};
use gattbridge_app::data_model::InProcessDataModel;
use gattbridge_app::devices::DeviceSpec;
use gattbridge_app::ports::central::{Central, CentralError, CentralEvent, ConnId, GattAttribute};
use gattbridge_domain::addr::{AddrKind, PeerAddr};
use gattbridge_domain::cluster::{ATTR_CURRENT_LEVEL, AttributeId, CLUSTER_LEVEL_CONTROL};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::mapping::{AccessMode, AttributeMap};
use gattbridge_domain::oob::{OOB_KEY_LEN, OobSecret};

const POSTURE_SERVICE: Uuid = Uuid::from_u128(0xe513_0001_784f_44f3_9e27_ab09_a415_3139);
const SCORE_MIN: Uuid = Uuid::from_u128(0xe513_0003_784f_44f3_9e27_ab09_a415_3139);
const SCORE_MEA: Uuid = Uuid::from_u128(0xe513_0004_784f_44f3_9e27_ab09_a415_3139);
const CCC: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

fn sensor_addr() -> PeerAddr {
    PeerAddr::new([0xA4, 0xC1, 0x38, 0x5B, 0x0E, 0xDF])
}

fn local_secret() -> OobSecret {
    OobSecret {
        addr: PeerAddr::new([0xC0, 0x07, 0x15, 0x22, 0x46, 0x01]),
        kind: AddrKind::Random,
        random: [0x5A; OOB_KEY_LEN],
        confirm: [0xA5; OOB_KEY_LEN],
    }
}

// ---------------------------------------------------------------------------
// Scripted central
// ---------------------------------------------------------------------------

/// Stand-in for the BLE stack: requests answer from a fixed script, and
/// tests inject unsolicited events through the channel the harness keeps.
struct ScriptedCentral {
    script: Mutex<Script>,
}

struct Script {
    scanning: Option<DeviceFilter>,
    scans_started: u32,
    next_conn: u32,
    attrs: Vec<GattAttribute>,
    reads: BTreeMap<u16, Vec<u8>>,
    subscribed: Vec<(ConnId, u16)>,
}

impl ScriptedCentral {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                scanning: None,
                scans_started: 0,
                next_conn: 1,
                attrs: Vec::new(),
                reads: BTreeMap::new(),
                subscribed: Vec::new(),
            }),
        })
    }

    fn set_attrs(&self, attrs: Vec<GattAttribute>) {
        self.script.lock().unwrap().attrs = attrs;
    }

    fn set_read(&self, handle: u16, value: Vec<u8>) {
        self.script.lock().unwrap().reads.insert(handle, value);
    }

    fn scanning(&self) -> Option<DeviceFilter> {
        self.script.lock().unwrap().scanning
    }

    fn scans_started(&self) -> u32 {
        self.script.lock().unwrap().scans_started
    }

    fn subscribed(&self) -> Vec<(ConnId, u16)> {
        self.script.lock().unwrap().subscribed.clone()
    }
}

impl Central for ScriptedCentral {
    async fn start_scan(&self, filter: DeviceFilter) -> Result<(), CentralError> {
        let mut script = self.script.lock().unwrap();
        script.scanning = Some(filter);
        script.scans_started += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), CentralError> {
        self.script.lock().unwrap().scanning = None;
        Ok(())
    }

    async fn connect(&self, _addr: PeerAddr) -> Result<ConnId, CentralError> {
        let mut script = self.script.lock().unwrap();
        let conn = ConnId::new(script.next_conn);
        script.next_conn += 1;
        Ok(conn)
    }

    async fn disconnect(&self, _conn: ConnId) -> Result<(), CentralError> {
        Ok(())
    }

    async fn bonded_peers(&self) -> Result<Vec<PeerAddr>, CentralError> {
        Ok(Vec::new())
    }

    async fn discover(
        &self,
        _conn: ConnId,
        _service: Uuid,
    ) -> Result<Vec<GattAttribute>, CentralError> {
        Ok(self.script.lock().unwrap().attrs.clone())
    }

    async fn subscribe(
        &self,
        conn: ConnId,
        value_handle: u16,
        _ccc_handle: u16,
    ) -> Result<(), CentralError> {
        self.script.lock().unwrap().subscribed.push((conn, value_handle));
        Ok(())
    }

    async fn unsubscribe(&self, conn: ConnId, value_handle: u16) -> Result<(), CentralError> {
        self.script
            .lock()
            .unwrap()
            .subscribed
            .retain(|entry| *entry != (conn, value_handle));
        Ok(())
    }

    async fn read(&self, _conn: ConnId, handle: u16) -> Result<Vec<u8>, CentralError> {
        self.script
            .lock()
            .unwrap()
            .reads
            .get(&handle)
            .cloned()
            .ok_or_else(|| CentralError::Backend(format!("no scripted value at handle {handle}")))
    }

    async fn local_oob(&self) -> Result<OobSecret, CentralError> {
        Ok(local_secret())
    }

    async fn set_oob_pair(
        &self,
        _local: Option<OobSecret>,
        _remote: Option<OobSecret>,
    ) -> Result<(), CentralError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    router: Router,
    handle: BridgeHandle,
    central: Arc<ScriptedCentral>,
    events: mpsc::UnboundedSender<CentralEvent>,
    server: Arc<InProcessDataModel>,
}

/// Build the fully-wired application around a scripted central.
fn harness() -> Harness {
    let central = ScriptedCentral::new();
    let (events, central_rx) = mpsc::unbounded_channel();
    let server = Arc::new(InProcessDataModel::new(8));
    let config = BridgeConfig {
        max_connections: 4,
        max_dynamic_endpoints: 8,
        scan_timeout: Duration::from_secs(10),
        recovery_delay: Duration::from_secs(15),
        recovery_scan_timeout: Duration::from_secs(30),
    };
    let (bridge, handle) = Bridge::new(
        Arc::clone(&central),
        Arc::clone(&server),
        central_rx,
        config,
    );
    tokio::spawn(bridge.run());
    let router = router::build(AppState::new(handle.clone(), Arc::clone(&server)));
    Harness {
        router,
        handle,
        central,
        events,
        server,
    }
}

/// Let the loop and its spawned tasks drain without advancing the clock.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn posture_spec() -> DeviceSpec {
    DeviceSpec::Peripheral {
        name: "posture".to_string(),
        service: POSTURE_SERVICE,
        filter: None,
        mapping: vec![
            AttributeMap {
                characteristic: SCORE_MEA,
                cluster: CLUSTER_LEVEL_CONTROL,
                attribute: ATTR_CURRENT_LEVEL,
                access: AccessMode::Subscribe,
            },
            AttributeMap {
                characteristic: SCORE_MIN,
                cluster: CLUSTER_LEVEL_CONTROL,
                attribute: AttributeId::new(0x0002),
                access: AccessMode::ReadOnce,
            },
        ],
    }
}

/// Handle layout of the scripted posture service: the score value, its CCC
/// descriptor, then the read-once minimum.
fn posture_attrs() -> Vec<GattAttribute> {
    vec![
        GattAttribute {
            handle: 1,
            uuid: SCORE_MEA,
        },
        GattAttribute {
            handle: 2,
            uuid: CCC,
        },
        GattAttribute {
            handle: 3,
            uuid: SCORE_MIN,
        },
    ]
}

/// Script the peripheral, advertise it, and wait for setup to finish.
async fn bring_online(h: &Harness) {
    h.central.set_attrs(posture_attrs());
    h.central.set_read(3, vec![0x0A, 0x00]);
    h.events
        .send(CentralEvent::ScanMatch {
            addr: sensor_addr(),
        })
        .unwrap();
    settle().await;
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_return_ok_when_health_check_called() {
    let h = harness();
    let resp = h
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Bringing a peripheral online
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_bring_a_posture_sensor_online_end_to_end() {
    let h = harness();
    let endpoint = h.handle.add_device(posture_spec()).await.unwrap();
    settle().await;
    assert!(h.central.scanning().is_some());

    bring_online(&h).await;

    // The admission scan is released and the score subscription installed.
    assert!(h.central.scanning().is_none());
    assert_eq!(h.central.subscribed(), vec![(ConnId::new(1), 1)]);

    let (status, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], "posture");
    assert_eq!(body[0]["kind"], "peripheral");
    assert_eq!(body[0]["endpoint"], endpoint.raw());
    assert_eq!(body[0]["reachable"], true);

    // The read-once minimum landed in the cache during setup.
    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0008/attributes/0x0002");
    let (status, body) = get(&h.router, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "0a00");
    assert_eq!(body["decoded"], 10);
}

#[tokio::test(start_paused = true)]
async fn should_serve_notifications_back_through_the_http_api() {
    let h = harness();
    let endpoint = h.handle.add_device(posture_spec()).await.unwrap();
    let mut changes = h.server.subscribe_changes();
    bring_online(&h).await;

    h.events
        .send(CentralEvent::Notified {
            conn: ConnId::new(1),
            handle: 1,
            value: vec![0x32, 0x00],
        })
        .unwrap();
    settle().await;

    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0008/attributes/0x0000");
    let (status, body) = get(&h.router, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "3200");
    assert_eq!(body["decoded"], 50);

    // Exactly one change report for the level path.
    let mut level_changes = 0;
    while let Ok(path) = changes.try_recv() {
        if path.endpoint == endpoint
            && path.cluster == CLUSTER_LEVEL_CONTROL
            && path.attribute == ATTR_CURRENT_LEVEL
        {
            level_changes += 1;
        }
    }
    assert_eq!(level_changes, 1);
}

// ---------------------------------------------------------------------------
// Generic clusters and unreachable devices
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_expose_generic_clusters_while_the_peripheral_is_away() {
    let h = harness();
    let endpoint = h.handle.add_device(posture_spec()).await.unwrap();
    settle().await;

    // Node label: length byte then the text.
    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0039/attributes/0x0005");
    let (status, body) = get(&h.router, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "07706f7374757265");
    assert!(body.get("decoded").is_none());

    // Reachable: false until the first successful setup.
    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0039/attributes/0x0011");
    let (_, body) = get(&h.router, &uri).await;
    assert_eq!(body["value"], "00");

    // The mirrored cluster is refused while the link is down.
    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0008/attributes/0x0000");
    let (status, _) = get(&h.router, &uri).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn should_keep_serving_after_a_bad_request() {
    let h = harness();
    h.handle.add_device(posture_spec()).await.unwrap();

    let (status, _) = get(&h.router, "/api/endpoints/99/clusters/0x0008/attributes/0x0000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Link loss and recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_recover_after_a_link_loss() {
    let h = harness();
    h.handle.add_device(posture_spec()).await.unwrap();
    bring_online(&h).await;
    assert_eq!(h.central.scans_started(), 1);

    h.events
        .send(CentralEvent::Disconnected {
            conn: ConnId::new(1),
            reason: 0x08,
        })
        .unwrap();
    settle().await;

    let (_, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(body[0]["reachable"], false);

    // The recovery delay passes and the bridge scans again.
    tokio::time::sleep(Duration::from_secs(16)).await;
    settle().await;
    assert!(h.central.scanning().is_some());
    assert_eq!(h.central.scans_started(), 2);

    // A second advertisement brings the endpoint back.
    h.events
        .send(CentralEvent::ScanMatch {
            addr: sensor_addr(),
        })
        .unwrap();
    settle().await;
    let (_, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(body[0]["reachable"], true);
}

#[tokio::test(start_paused = true)]
async fn should_give_up_the_scan_after_the_window_and_retry_later() {
    let h = harness();
    h.handle.add_device(posture_spec()).await.unwrap();
    settle().await;
    assert_eq!(h.central.scans_started(), 1);

    // Nothing advertises within the window.
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert!(h.central.scanning().is_none());

    let (_, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(body[0]["reachable"], false);

    // The retry starts once the recovery delay has passed.
    tokio::time::sleep(Duration::from_secs(16)).await;
    settle().await;
    assert_eq!(h.central.scans_started(), 2);
}

// ---------------------------------------------------------------------------
// Registration and computed endpoints
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_reject_a_duplicate_device_name_through_the_live_loop() {
    let h = harness();
    h.handle.add_device(posture_spec()).await.unwrap();
    let err = h.handle.add_device(posture_spec()).await.unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateDevice(name) if name == "posture"));
}

#[tokio::test(start_paused = true)]
async fn should_drive_a_computed_endpoint_without_a_radio() {
    let h = harness();
    // A deadline beyond the level window pins the level at zero, keeping
    // the assertion independent of when the test runs.
    let endpoint = h
        .handle
        .add_device(DeviceSpec::Computed {
            name: "reminder".to_string(),
            cluster: CLUSTER_LEVEL_CONTROL,
            attribute: ATTR_CURRENT_LEVEL,
            refresh_secs: 60,
            deadlines: vec![Utc::now() + TimeDelta::hours(4)],
        })
        .await
        .unwrap();
    settle().await;

    let (_, body) = get(&h.router, "/api/endpoints").await;
    assert_eq!(body[0]["kind"], "computed");
    assert_eq!(body[0]["reachable"], true);

    let uri = format!("/api/endpoints/{endpoint}/clusters/0x0008/attributes/0x0000");
    let (status, body) = get(&h.router, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decoded"], 0);
}

// ---------------------------------------------------------------------------
// Out-of-band exchange
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_exchange_oob_secrets_through_the_live_loop() {
    let h = harness();
    let remote = OobSecret {
        addr: sensor_addr(),
        kind: AddrKind::Random,
        random: [0x11; OOB_KEY_LEN],
        confirm: [0x22; OOB_KEY_LEN],
    };

    let reply = h.handle.exchange_oob(remote.to_line()).await.unwrap();
    assert_eq!(reply, Some(local_secret().to_line()));

    // Malformed lines are dropped without a reply.
    let reply = h
        .handle
        .exchange_oob("one two three".to_string())
        .await
        .unwrap();
    assert_eq!(reply, None);

    // A key token of the right byte length but with a multibyte character
    // is dropped the same way, and the loop keeps serving afterwards.
    let evil_key = format!("€{}", "a".repeat(OOB_KEY_LEN * 2 - '€'.len_utf8()));
    let line = format!(
        "{} (random) {evil_key} {}",
        sensor_addr(),
        "11".repeat(OOB_KEY_LEN)
    );
    let reply = h.handle.exchange_oob(line).await.unwrap();
    assert_eq!(reply, None);

    let reply = h.handle.exchange_oob(remote.to_line()).await.unwrap();
    assert_eq!(reply, Some(local_secret().to_line()));
}
