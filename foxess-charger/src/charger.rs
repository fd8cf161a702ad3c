//! Consumer-facing handle for one charger.

use std::collections::BTreeMap;
use std::sync::Arc;

use foxess_charger_common::{HealthReport, Snapshot, Value};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, DeviceConfig};
use crate::gate::{WriteError, WriteGate};
use crate::poller::{CycleReport, PollState, Poller, PollerSettings, RefreshTrigger};
use crate::registers::RegisterMap;
use crate::transport::{ModbusTcpTransport, SharedTransport, Transport, TransportError, probe};
use crate::view;

/// Polling and control core for one charger.
///
/// Cheap to clone; all clones share the connection, the poller state and
/// the published snapshot.
pub struct Charger<T: Transport> {
    transport: SharedTransport<T>,
    map: RegisterMap,
    poller: Poller<T>,
    gate: WriteGate<T>,
}

impl<T: Transport> Clone for Charger<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            map: self.map,
            poller: self.poller.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl Charger<ModbusTcpTransport> {
    /// Charger reached over Modbus TCP with the Fox ESS register map.
    pub fn from_config(device: &DeviceConfig) -> Result<Self, ConfigError> {
        let map = RegisterMap::foxess();
        Ok(Self::new(
            ModbusTcpTransport::new(device.tcp_settings()?),
            map,
            device.poller_settings(&map),
        ))
    }
}

impl<T: Transport> Charger<T> {
    pub fn new(transport: T, map: RegisterMap, settings: PollerSettings) -> Self {
        let transport = Arc::new(Mutex::new(transport));
        let refresh = RefreshTrigger::new();
        let poller = Poller::new(transport.clone(), map, settings, refresh.clone());
        let gate = WriteGate::new(transport.clone(), map, refresh);

        Self {
            transport,
            map,
            poller,
            gate,
        }
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Spawn the background poll loop.
    pub fn spawn(&self) -> JoinHandle<()> {
        tokio::spawn(self.poller.clone().run())
    }

    /// Run one poll cycle now.
    pub async fn poll_now(&self) -> CycleReport {
        self.poller.poll_once().await
    }

    /// Ask the background loop for an extra cycle.
    pub fn request_refresh(&self) {
        self.poller.refresh_trigger().request();
    }

    /// Check that the charger answers. See [`probe`].
    pub async fn probe(&self) -> Result<u16, TransportError> {
        let mut transport = self.transport.lock().await;
        probe(&mut *transport).await
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.poller.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.poller.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.poller.is_healthy()
    }

    pub fn health(&self) -> HealthReport {
        self.poller.health()
    }

    pub fn poll_state(&self) -> PollState {
        self.poller.state()
    }

    /// Derived sensor values for the current snapshot.
    pub fn sensors(&self) -> BTreeMap<&'static str, Value> {
        view::render(&self.snapshot())
    }

    /// Derived on/off indicators for the current snapshot.
    pub fn indicators(&self) -> BTreeMap<&'static str, bool> {
        view::render_binary(&self.snapshot())
    }

    /// Current state of each control that has one.
    pub fn controls(&self) -> BTreeMap<&'static str, Value> {
        view::render_controls(self.map.writable_registers(), &self.snapshot())
    }

    pub async fn write_value(&self, name: &str, value: f64) -> Result<u16, WriteError> {
        self.gate.write_value(name, value).await
    }

    pub async fn write_raw(&self, address: u16, raw: u16) -> Result<(), WriteError> {
        self.gate.write_raw(address, raw).await
    }

    pub async fn select_option(&self, name: &str, option: &str) -> Result<u16, WriteError> {
        self.gate.select_option(name, option).await
    }

    pub async fn set_switch(&self, name: &str, on: bool) -> Result<u16, WriteError> {
        self.gate.set_switch(name, on).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::REG_CONFIG_BLOCK;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    fn charger() -> Charger<MockTransport> {
        let mut transport = MockTransport::new();
        transport.set_block(REG_CONFIG_BLOCK, &[1, 160, 220, 0, 0, 30, 100, 0, 0, 0, 1, 10]);
        let map = RegisterMap::foxess();
        let settings = PollerSettings::new(
            "test",
            Duration::from_secs(3600),
            Duration::from_secs(1),
            &map,
        );
        Charger::new(transport, map, settings)
    }

    #[tokio::test]
    async fn test_controls_follow_snapshot() {
        let charger = charger();
        assert!(charger.controls().is_empty());

        charger.poll_now().await;
        let controls = charger.controls();
        assert_eq!(controls["work_mode"], Value::from("plug_and_charge"));
        assert_eq!(controls["max_charging_current"], Value::Float(16.0));
        assert_eq!(controls["auto_phase_switch"], Value::from("enabled"));
        assert!(!controls.contains_key("restart"));
        assert!(!controls.contains_key("phase_switching"));
    }

    #[tokio::test]
    async fn test_written_value_visible_after_next_cycle() {
        let charger = charger();
        charger.poll_now().await;

        charger.write_value("max_charging_current", 20.5).await.unwrap();
        assert_eq!(charger.controls()["max_charging_current"], Value::Float(16.0));

        charger.poll_now().await;
        assert_eq!(charger.controls()["max_charging_current"], Value::Float(20.5));
    }

    #[tokio::test]
    async fn test_probe_shares_connection() {
        let charger = charger();
        assert_eq!(charger.probe().await, Ok(0));
        assert_eq!(charger.transport.lock().await.reads(), 1);
    }

    #[test]
    fn test_from_config_rejects_out_of_range_device() {
        let device = DeviceConfig {
            name: "garage".to_string(),
            host: "192.168.1.50".to_string(),
            port: 1502,
            unit_id: 256,
            poll_interval_secs: 5,
            timeout_ms: 5000,
        };
        assert!(matches!(
            Charger::from_config(&device),
            Err(ConfigError::Validation(_))
        ));

        let device = DeviceConfig {
            unit_id: 1,
            ..device
        };
        let charger = Charger::from_config(&device).unwrap();
        assert_eq!(charger.transport.try_lock().unwrap().settings().unit_id, 1);
    }
}
