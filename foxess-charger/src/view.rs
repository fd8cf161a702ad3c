//! Derived, display-ready values computed from a raw snapshot.
//!
//! Every exposed quantity is one row of a static table: the snapshot keys
//! it reads and a tagged [`Transform`]. Rows can be evaluated one by one,
//! so each transform is testable in isolation.

use std::collections::BTreeMap;

use foxess_charger_common::{Snapshot, Value};

use crate::decoder::{firmware_version, port_temperature, round_to};
use crate::registers::{
    CP_STATUS_LABELS, Control, EnumTable, PHASE_SEQUENCE_LABELS, STATUS_LABELS,
    STOP_REASON_LABELS, UNKNOWN, WORK_MODE_LABELS, WritableRegister, lookup,
};

/// How a derived value is computed from its source fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// The raw integer unchanged.
    Passthrough,
    /// `sum(sources) × factor + offset`, rounded.
    Scaled {
        factor: f64,
        offset: f64,
        decimals: u32,
    },
    /// Port temperature; the absent-sensor sentinel becomes null.
    PortTemperature,
    /// Enum label, `"unknown"` for unmapped codes.
    Label(EnumTable),
    /// `on_label` when the code equals `on`, `off_label` otherwise.
    TwoState {
        on: u16,
        on_label: &'static str,
        off_label: &'static str,
    },
    /// "major.minor" from one word.
    FirmwareVersion,
    /// Card number as 8 hex digits, `"None"` when no card is present.
    CardId,
}

/// One derived value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensor {
    pub key: &'static str,
    pub sources: &'static [&'static str],
    pub transform: Transform,
}

impl Sensor {
    /// Evaluate against a snapshot. `None` when any source field is absent.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Option<Value> {
        let raws = self
            .sources
            .iter()
            .map(|source| snapshot.integer(source))
            .collect::<Option<Vec<i64>>>()?;
        let first = *raws.first()?;

        let value = match self.transform {
            Transform::Passthrough => Value::Integer(first),
            Transform::Scaled {
                factor,
                offset,
                decimals,
            } => {
                let sum: i64 = raws.iter().sum();
                Value::Float(round_to(sum as f64 * factor + offset, decimals))
            }
            Transform::PortTemperature => {
                Value::from(word(first).and_then(port_temperature).map(|t| round_to(t, 1)))
            }
            Transform::Label(table) => {
                Value::from(word(first).map_or(UNKNOWN, |code| lookup(table, code)))
            }
            Transform::TwoState {
                on,
                on_label,
                off_label,
            } => Value::from(if first == i64::from(on) {
                on_label
            } else {
                off_label
            }),
            Transform::FirmwareVersion => Value::from(word(first).map(firmware_version)),
            Transform::CardId => Value::from(if first > 0 {
                format!("{:08X}", first)
            } else {
                "None".to_string()
            }),
        };

        Some(value)
    }
}

fn word(raw: i64) -> Option<u16> {
    u16::try_from(raw).ok()
}

const fn sensor(key: &'static str, source: &'static [&'static str], transform: Transform) -> Sensor {
    Sensor {
        key,
        sources: source,
        transform,
    }
}

const TENTH: Transform = Transform::Scaled {
    factor: 0.1,
    offset: 0.0,
    decimals: 1,
};

const TENTH_2DP: Transform = Transform::Scaled {
    factor: 0.1,
    offset: 0.0,
    decimals: 2,
};

/// All derived values, in display order.
pub const SENSORS: &[Sensor] = &[
    sensor(
        "software_version",
        &["software_version"],
        Transform::FirmwareVersion,
    ),
    sensor("device_address", &["device_address"], Transform::Passthrough),
    sensor("status", &["status"], Transform::Label(STATUS_LABELS)),
    sensor("cp_status", &["cp_status"], Transform::Label(CP_STATUS_LABELS)),
    sensor(
        "cc_status",
        &["cc_status"],
        Transform::TwoState {
            on: 1,
            on_label: "connected",
            off_label: "disconnected",
        },
    ),
    sensor(
        "lock_status",
        &["lock_status"],
        Transform::TwoState {
            on: 1,
            on_label: "locked",
            off_label: "unlocked",
        },
    ),
    sensor("work_mode", &["work_mode"], Transform::Label(WORK_MODE_LABELS)),
    sensor(
        "phase_sequence",
        &["phase_sequence"],
        Transform::Label(PHASE_SEQUENCE_LABELS),
    ),
    sensor(
        "stop_reason",
        &["stop_reason"],
        Transform::Label(STOP_REASON_LABELS),
    ),
    sensor(
        "port_temperature",
        &["port_temp_raw"],
        Transform::PortTemperature,
    ),
    sensor(
        "ambient_temperature",
        &["ambient_temp_raw"],
        Transform::Scaled {
            factor: 0.1,
            offset: -50.0,
            decimals: 1,
        },
    ),
    sensor("l1_voltage", &["l1_voltage_raw"], TENTH),
    sensor("l2_voltage", &["l2_voltage_raw"], TENTH),
    sensor("l3_voltage", &["l3_voltage_raw"], TENTH),
    sensor("l1_current", &["l1_current_raw"], TENTH),
    sensor("l2_current", &["l2_current_raw"], TENTH),
    sensor("l3_current", &["l3_current_raw"], TENTH),
    sensor(
        "total_current",
        &["l1_current_raw", "l2_current_raw", "l3_current_raw"],
        TENTH,
    ),
    sensor("charging_power", &["power_raw"], TENTH_2DP),
    sensor("max_power", &["max_power_raw"], TENTH),
    sensor("min_power", &["min_power_raw"], TENTH),
    sensor("max_current", &["max_current_raw"], TENTH),
    sensor("min_current", &["min_current_raw"], TENTH),
    sensor("default_current", &["default_current_raw"], TENTH),
    sensor("current_energy", &["current_energy_raw"], TENTH_2DP),
    sensor("total_energy", &["total_energy_raw"], TENTH_2DP),
    sensor(
        "allowed_charge_time",
        &["allowed_charge_time"],
        Transform::Passthrough,
    ),
    sensor(
        "allowed_charge_energy",
        &["allowed_charge_energy"],
        Transform::Passthrough,
    ),
    sensor("time_validity", &["time_validity"], Transform::Passthrough),
    sensor(
        "min_switch_interval",
        &["min_switch_interval"],
        Transform::Passthrough,
    ),
    sensor("alarm_code", &["alarm_code"], Transform::Passthrough),
    sensor("fault_code", &["fault_code"], Transform::Passthrough),
    sensor("rfid_card", &["rfid_card"], Transform::CardId),
];

/// Condition tested by a binary indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Equals(u16),
    NonZero,
}

/// On/off indicator derived from one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinarySensor {
    pub key: &'static str,
    pub source: &'static str,
    pub predicate: Predicate,
}

impl BinarySensor {
    pub fn evaluate(&self, snapshot: &Snapshot) -> Option<bool> {
        let raw = snapshot.integer(self.source)?;
        Some(match self.predicate {
            Predicate::Equals(code) => raw == i64::from(code),
            Predicate::NonZero => raw > 0,
        })
    }
}

pub const BINARY_SENSORS: &[BinarySensor] = &[
    BinarySensor {
        key: "is_charging",
        source: "status",
        predicate: Predicate::Equals(3),
    },
    BinarySensor {
        key: "vehicle_connected",
        source: "cc_status",
        predicate: Predicate::Equals(1),
    },
    BinarySensor {
        key: "has_fault",
        source: "fault_code",
        predicate: Predicate::NonZero,
    },
    BinarySensor {
        key: "has_alarm",
        source: "alarm_code",
        predicate: Predicate::NonZero,
    },
    BinarySensor {
        key: "is_locked",
        source: "lock_status",
        predicate: Predicate::Equals(1),
    },
];

/// Look up a derived value definition by key.
pub fn sensor_by_key(key: &str) -> Option<&'static Sensor> {
    SENSORS.iter().find(|s| s.key == key)
}

/// Evaluate every derived value present in the snapshot.
pub fn render(snapshot: &Snapshot) -> BTreeMap<&'static str, Value> {
    SENSORS
        .iter()
        .filter_map(|s| s.evaluate(snapshot).map(|v| (s.key, v)))
        .collect()
}

/// Evaluate every binary indicator present in the snapshot.
pub fn render_binary(snapshot: &Snapshot) -> BTreeMap<&'static str, bool> {
    BINARY_SENSORS
        .iter()
        .filter_map(|b| b.evaluate(snapshot).map(|v| (b.key, v)))
        .collect()
}

/// Current state of a writable register as seen in the snapshot.
///
/// Numbers report their logical value, selects the active option label
/// and switches `"on"`/`"off"`. Write-only registers without read-back
/// report `None`.
pub fn control_state(register: &WritableRegister, snapshot: &Snapshot) -> Option<Value> {
    match register.control {
        Control::Number { source } => {
            let raw = word(snapshot.integer(source)?)?;
            Some(Value::Float(round_to(register.to_logical(raw), 1)))
        }
        Control::Select { options, source } => {
            let code = word(snapshot.integer(source?)?)?;
            // A code outside the options has no selectable state.
            options
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, label)| Value::from(*label))
        }
        Control::Switch {
            state_key,
            state_on,
            ..
        } => {
            let raw = snapshot.integer(state_key)?;
            Some(Value::from(if raw == i64::from(state_on) { "on" } else { "off" }))
        }
        Control::Command => None,
    }
}

/// Evaluate the state of every writable register with read-back.
pub fn render_controls(
    registers: &[WritableRegister],
    snapshot: &Snapshot,
) -> BTreeMap<&'static str, Value> {
    registers
        .iter()
        .filter_map(|r| control_state(r, snapshot).map(|v| (r.name, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterMap;

    fn snapshot(fields: &[(&str, i64)]) -> Snapshot {
        Snapshot::new(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Integer(*v)))
                .collect(),
        )
    }

    fn eval(key: &str, fields: &[(&str, i64)]) -> Option<Value> {
        sensor_by_key(key).unwrap().evaluate(&snapshot(fields))
    }

    #[test]
    fn test_sensor_keys_unique() {
        let mut keys: Vec<_> = SENSORS.iter().map(|s| s.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), SENSORS.len());
    }

    #[test]
    fn test_every_source_is_a_register_field() {
        let map = RegisterMap::foxess();
        let fields: Vec<&str> = map
            .blocks_to_read()
            .iter()
            .flat_map(|b| b.field_names())
            .collect();
        for sensor in SENSORS {
            for source in sensor.sources {
                assert!(fields.contains(source), "{} reads {}", sensor.key, source);
            }
        }
        for binary in BINARY_SENSORS {
            assert!(fields.contains(&binary.source));
        }
    }

    #[test]
    fn test_scaled_voltage_and_current() {
        assert_eq!(eval("l1_voltage", &[("l1_voltage_raw", 2310)]), Some(Value::Float(231.0)));
        assert_eq!(eval("l2_current", &[("l2_current_raw", 118)]), Some(Value::Float(11.8)));
        assert_eq!(eval("max_current", &[("max_current_raw", 320)]), Some(Value::Float(32.0)));
    }

    #[test]
    fn test_charging_power_two_decimals() {
        assert_eq!(eval("charging_power", &[("power_raw", 2550)]), Some(Value::Float(255.0)));
        assert_eq!(eval("charging_power", &[("power_raw", 73)]), Some(Value::Float(7.3)));
    }

    #[test]
    fn test_energy() {
        assert_eq!(
            eval("total_energy", &[("total_energy_raw", 123_456)]),
            Some(Value::Float(12345.6))
        );
        assert_eq!(
            eval("current_energy", &[("current_energy_raw", 0)]),
            Some(Value::Float(0.0))
        );
    }

    #[test]
    fn test_total_current_sums_phases() {
        let fields = [
            ("l1_current_raw", 120),
            ("l2_current_raw", 118),
            ("l3_current_raw", 122),
        ];
        assert_eq!(eval("total_current", &fields), Some(Value::Float(36.0)));
        // One phase missing means no total.
        assert_eq!(eval("total_current", &fields[..2]), None);
    }

    #[test]
    fn test_temperatures() {
        assert_eq!(
            eval("port_temperature", &[("port_temp_raw", 650)]),
            Some(Value::Float(15.0))
        );
        assert_eq!(
            eval("port_temperature", &[("port_temp_raw", 65535)]),
            Some(Value::Null)
        );
        assert_eq!(
            eval("ambient_temperature", &[("ambient_temp_raw", 0)]),
            Some(Value::Float(-50.0))
        );
        assert_eq!(
            eval("ambient_temperature", &[("ambient_temp_raw", 65535)]),
            Some(Value::Float(6503.5))
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(eval("status", &[("status", 3)]), Some(Value::from("charging")));
        assert_eq!(eval("status", &[("status", 42)]), Some(Value::from("unknown")));
        assert_eq!(
            eval("cp_status", &[("cp_status", 2)]),
            Some(Value::from("9v_connected"))
        );
        assert_eq!(
            eval("stop_reason", &[("stop_reason", 14)]),
            Some(Value::from("port_overtemp"))
        );
        assert_eq!(
            eval("phase_sequence", &[("phase_sequence", 7)]),
            Some(Value::from("unknown"))
        );
        assert_eq!(
            eval("work_mode", &[("work_mode", 0)]),
            Some(Value::from("controlled"))
        );
    }

    #[test]
    fn test_two_state_labels() {
        assert_eq!(eval("cc_status", &[("cc_status", 1)]), Some(Value::from("connected")));
        assert_eq!(
            eval("cc_status", &[("cc_status", 0)]),
            Some(Value::from("disconnected"))
        );
        assert_eq!(eval("lock_status", &[("lock_status", 1)]), Some(Value::from("locked")));
        assert_eq!(
            eval("lock_status", &[("lock_status", 5)]),
            Some(Value::from("unlocked"))
        );
    }

    #[test]
    fn test_firmware_and_card() {
        assert_eq!(
            eval("software_version", &[("software_version", 0x0105)]),
            Some(Value::from("1.5"))
        );
        assert_eq!(
            eval("rfid_card", &[("rfid_card", 0x00AB_CDEF)]),
            Some(Value::from("00ABCDEF"))
        );
        assert_eq!(eval("rfid_card", &[("rfid_card", 0)]), Some(Value::from("None")));
    }

    #[test]
    fn test_missing_source_is_absent() {
        assert_eq!(eval("l1_voltage", &[]), None);
        let rendered = render(&snapshot(&[("status", 1)]));
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered["status"], Value::from("connected"));
    }

    #[test]
    fn test_binary_sensors() {
        let snap = snapshot(&[
            ("status", 3),
            ("cc_status", 1),
            ("fault_code", 0),
            ("alarm_code", 4),
            ("lock_status", 2),
        ]);
        let binary = render_binary(&snap);
        assert!(binary["is_charging"]);
        assert!(binary["vehicle_connected"]);
        assert!(!binary["has_fault"]);
        assert!(binary["has_alarm"]);
        assert!(!binary["is_locked"]);
        assert!(render_binary(&Snapshot::empty()).is_empty());
    }

    #[test]
    fn test_control_state() {
        let map = RegisterMap::foxess();
        let snap = snapshot(&[
            ("max_charging_current_raw", 160),
            ("work_mode", 1),
            ("auto_phase_switch", 0),
            ("status", 3),
            ("lock_status", 0),
        ]);
        let controls = render_controls(map.writable_registers(), &snap);

        assert_eq!(controls["max_charging_current"], Value::Float(16.0));
        assert_eq!(controls["work_mode"], Value::from("plug_and_charge"));
        assert_eq!(controls["auto_phase_switch"], Value::from("disabled"));
        assert_eq!(controls["charging_control"], Value::from("on"));
        assert_eq!(controls["lock_control"], Value::from("off"));
        assert!(!controls.contains_key("phase_switching"));
        assert!(!controls.contains_key("restart"));
        assert!(!controls.contains_key("default_current"));
    }

    #[test]
    fn test_control_state_unmapped_option() {
        let map = RegisterMap::foxess();
        let work_mode = map.writable_by_name("work_mode").unwrap();
        assert_eq!(control_state(work_mode, &snapshot(&[("work_mode", 9)])), None);
    }
}
