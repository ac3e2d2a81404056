//! Shared test doubles for the app crate's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::oob::OobSecret;

use crate::ports::{Central, CentralError, ConnId, GattAttribute};

/// Every interaction a test can assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(DeviceFilter),
    StopScan,
    Connect(PeerAddr),
    Disconnect(ConnId),
    Discover(ConnId, Uuid),
    Subscribe { conn: ConnId, value: u16, ccc: u16 },
    Unsubscribe { conn: ConnId, value: u16 },
    Read(ConnId, u16),
    SetOobPair { local: bool, remote: bool },
}

#[derive(Default)]
struct Inner {
    connect_results: VecDeque<Result<ConnId, CentralError>>,
    bonded: Vec<PeerAddr>,
    discover_results: VecDeque<Result<Vec<GattAttribute>, CentralError>>,
    read_results: HashMap<u16, Result<Vec<u8>, CentralError>>,
    subscribe_errors: HashMap<u16, CentralError>,
    local_oob: Option<OobSecret>,
    calls: Vec<Call>,
}

/// A [`Central`] whose responses are scripted up front and whose calls are
/// recorded. Unscripted request/response operations fail loudly so a test
/// cannot silently drift past the behavior it meant to pin down.
#[derive(Default)]
pub struct ScriptedCentral {
    inner: Mutex<Inner>,
}

impl ScriptedCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_connect(&self, result: Result<ConnId, CentralError>) {
        self.lock().connect_results.push_back(result);
    }

    pub fn script_bonded(&self, peers: &[PeerAddr]) {
        self.lock().bonded = peers.to_vec();
    }

    pub fn script_discovery(&self, result: Result<Vec<GattAttribute>, CentralError>) {
        self.lock().discover_results.push_back(result);
    }

    pub fn script_read(&self, handle: u16, result: Result<Vec<u8>, CentralError>) {
        self.lock().read_results.insert(handle, result);
    }

    pub fn script_subscribe_error(&self, value_handle: u16, err: CentralError) {
        self.lock().subscribe_errors.insert(value_handle, err);
    }

    pub fn script_local_oob(&self, secret: OobSecret) {
        self.lock().local_oob = Some(secret);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("scripted central lock")
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }
}

impl Central for ScriptedCentral {
    async fn start_scan(&self, filter: DeviceFilter) -> Result<(), CentralError> {
        self.record(Call::StartScan(filter));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), CentralError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, addr: PeerAddr) -> Result<ConnId, CentralError> {
        self.record(Call::Connect(addr));
        self.lock()
            .connect_results
            .pop_front()
            .unwrap_or_else(|| Err(CentralError::Backend("unscripted connect".into())))
    }

    async fn disconnect(&self, conn: ConnId) -> Result<(), CentralError> {
        self.record(Call::Disconnect(conn));
        Ok(())
    }

    async fn bonded_peers(&self) -> Result<Vec<PeerAddr>, CentralError> {
        Ok(self.lock().bonded.clone())
    }

    async fn discover(
        &self,
        conn: ConnId,
        service: Uuid,
    ) -> Result<Vec<GattAttribute>, CentralError> {
        self.record(Call::Discover(conn, service));
        self.lock()
            .discover_results
            .pop_front()
            .unwrap_or_else(|| Err(CentralError::Backend("unscripted discover".into())))
    }

    async fn subscribe(
        &self,
        conn: ConnId,
        value_handle: u16,
        ccc_handle: u16,
    ) -> Result<(), CentralError> {
        self.record(Call::Subscribe {
            conn,
            value: value_handle,
            ccc: ccc_handle,
        });
        match self.lock().subscribe_errors.get(&value_handle) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&self, conn: ConnId, value_handle: u16) -> Result<(), CentralError> {
        self.record(Call::Unsubscribe {
            conn,
            value: value_handle,
        });
        Ok(())
    }

    async fn read(&self, conn: ConnId, handle: u16) -> Result<Vec<u8>, CentralError> {
        self.record(Call::Read(conn, handle));
        self.lock()
            .read_results
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| Err(CentralError::Backend("unscripted read".into())))
    }

    async fn local_oob(&self) -> Result<OobSecret, CentralError> {
        self.lock()
            .local_oob
            .ok_or(CentralError::Unsupported("LE OOB"))
    }

    async fn set_oob_pair(
        &self,
        local: Option<OobSecret>,
        remote: Option<OobSecret>,
    ) -> Result<(), CentralError> {
        self.record(Call::SetOobPair {
            local: local.is_some(),
            remote: remote.is_some(),
        });
        Ok(())
    }
}
