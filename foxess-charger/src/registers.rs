//! Static register map of the Fox ESS charger.
//!
//! Addresses, widths and value tables here are a compatibility contract
//! with the device firmware and must match it exactly.

/// Code-to-label table for an enumerated register.
pub type EnumTable = &'static [(u16, &'static str)];

/// Label returned for codes missing from an [`EnumTable`].
pub const UNKNOWN: &str = "unknown";

/// Look up the label for `code`, falling back to [`UNKNOWN`].
pub fn lookup(table: EnumTable, code: u16) -> &'static str {
    table
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, label)| *label)
        .unwrap_or(UNKNOWN)
}

/// Reverse lookup: the code for a label, if the table has it.
pub fn code_for(table: EnumTable, label: &str) -> Option<u16> {
    table.iter().find(|(_, l)| *l == label).map(|(c, _)| *c)
}

pub const STATUS_LABELS: EnumTable = &[
    (0, "idle"),
    (1, "connected"),
    (2, "ready"),
    (3, "charging"),
    (4, "paused"),
    (5, "finished"),
    (6, "fault"),
    (7, "reserved"),
    (8, "locked"),
];

pub const CP_STATUS_LABELS: EnumTable = &[
    (0, "fault"),
    (1, "12v_disconnected"),
    (2, "9v_connected"),
    (3, "6v_ready"),
];

pub const WORK_MODE_LABELS: EnumTable = &[(0, "controlled"), (1, "plug_and_charge"), (2, "locked")];

pub const PHASE_SEQUENCE_LABELS: EnumTable = &[
    (0, "three_phase"),
    (1, "l2_single_phase"),
    (2, "l3_single_phase"),
    (3, "reserved"),
];

/// Targets accepted by the phase switching command register.
pub const PHASE_SWITCHING_LABELS: EnumTable = &[
    (0, "three_phase"),
    (1, "l2_single_phase"),
    (2, "l3_single_phase"),
];

pub const AUTO_PHASE_SWITCH_LABELS: EnumTable = &[(0, "disabled"), (1, "enabled")];

pub const STOP_REASON_LABELS: EnumTable = &[
    (0, "none"),
    (1, "command"),
    (2, "time_completed"),
    (3, "s2_timeout"),
    (4, "pause_timeout"),
    (5, "emergency_stop"),
    (6, "cp_voltage_abnormal"),
    (7, "connector_pulled"),
    (8, "ac_contactor_abnormal"),
    (9, "lock_abnormal"),
    (10, "card_reader_abnormal"),
    (11, "overcurrent"),
    (12, "overvoltage"),
    (13, "undervoltage"),
    (14, "port_overtemp"),
    (15, "leakage_current"),
    (16, "n_line_reversed"),
    (17, "frequency_abnormal"),
    (18, "stop_button_pressed"),
    (19, "breaker_abnormal"),
    (20, "phase_loss"),
    (21, "pe_abnormal"),
    (22, "external_meter_abnormal"),
    (23, "ambient_overtemp"),
    (24, "metering_chip_fault"),
    (25, "access_control_fault"),
    (26, "pbox_phase_switch_abnormal"),
    (27, "energy_limit_reached"),
];

// Read blocks
pub const REG_STATUS_BLOCK: u16 = 0x1000;
pub const REG_CURRENT_ENERGY: u16 = 0x1016;
pub const REG_TOTAL_ENERGY: u16 = 0x1018;
pub const REG_FAULT_CODE: u16 = 0x101A;
pub const REG_RFID_CARD: u16 = 0x101C;
pub const REG_CONFIG_BLOCK: u16 = 0x3000;

// Read/write configuration registers
pub const REG_WORK_MODE: u16 = 0x3000;
pub const REG_MAX_CHARGING_CURRENT: u16 = 0x3001;
pub const REG_MAX_CHARGING_POWER: u16 = 0x3002;
pub const REG_ALLOWED_CHARGE_TIME: u16 = 0x3003;
pub const REG_ALLOWED_CHARGE_ENERGY: u16 = 0x3004;
pub const REG_TIME_VALIDITY: u16 = 0x3005;
pub const REG_DEFAULT_CURRENT: u16 = 0x3006;
pub const REG_AUTO_PHASE_SWITCH: u16 = 0x300A;
pub const REG_MIN_SWITCH_INTERVAL: u16 = 0x300B;

// Write-only command registers
pub const REG_LOCK_CONTROL: u16 = 0x4000;
pub const REG_CHARGING_CONTROL: u16 = 0x4001;
pub const REG_PHASE_SWITCHING: u16 = 0x4002;
pub const REG_RESTART: u16 = 0x4003;

/// How the words of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One word, passed through as an integer.
    RawU16,
    /// Two words, `(high << 16) | low`.
    ComposedU32Be,
    /// One word holding a code from the table.
    Enum(EnumTable),
    /// One word that is "on" when equal to the given code.
    BoolEq(u16),
    /// Reserved word inside a block; never decoded.
    Skip,
}

impl FieldKind {
    /// Width in 16-bit words.
    pub fn width(&self) -> u8 {
        match self {
            FieldKind::ComposedU32Be => 2,
            _ => 1,
        }
    }
}

/// One field inside a [`RegisterBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Snapshot key.
    pub name: &'static str,
    /// Offset from the block start, in words.
    pub offset: u8,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: u8, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }

    pub fn width(&self) -> u8 {
        self.kind.width()
    }

    /// Absolute register address of the first word.
    pub fn address(&self, block: &RegisterBlock) -> u16 {
        block.start + u16::from(self.offset)
    }
}

/// A contiguous range of holding registers read in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u8,
    pub fields: &'static [FieldSpec],
}

impl RegisterBlock {
    /// Human-readable label, e.g. `0x1000`.
    pub fn label(&self) -> String {
        format!("0x{:04X}", self.start)
    }

    /// Check that the fields cover `[0, count)` exactly, without overlap.
    pub fn validate(&self) -> Result<(), String> {
        let mut covered = vec![false; usize::from(self.count)];
        for field in self.fields {
            for word in field.offset..field.offset + field.width() {
                match covered.get_mut(usize::from(word)) {
                    Some(slot) if *slot => {
                        return Err(format!(
                            "block {}: field '{}' overlaps offset {}",
                            self.label(),
                            field.name,
                            word
                        ));
                    }
                    Some(slot) => *slot = true,
                    None => {
                        return Err(format!(
                            "block {}: field '{}' extends past {} words",
                            self.label(),
                            field.name,
                            self.count
                        ));
                    }
                }
            }
        }
        match covered.iter().position(|c| !c) {
            Some(gap) => Err(format!(
                "block {}: offset {} is not covered by any field",
                self.label(),
                gap
            )),
            None => Ok(()),
        }
    }

    /// Names of the fields this block contributes to a snapshot.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.kind != FieldKind::Skip)
            .map(|f| f.name)
    }
}

use FieldKind::{BoolEq, ComposedU32Be, Enum, RawU16, Skip};

const STATUS_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("device_address", 0, RawU16),
    FieldSpec::new("software_version", 1, RawU16),
    FieldSpec::new("stop_reason", 2, Enum(STOP_REASON_LABELS)),
    FieldSpec::new("status", 3, Enum(STATUS_LABELS)),
    FieldSpec::new("cp_status", 4, Enum(CP_STATUS_LABELS)),
    FieldSpec::new("cc_status", 5, BoolEq(1)),
    FieldSpec::new("port_temp_raw", 6, RawU16),
    FieldSpec::new("ambient_temp_raw", 7, RawU16),
    FieldSpec::new("l1_voltage_raw", 8, RawU16),
    FieldSpec::new("l2_voltage_raw", 9, RawU16),
    FieldSpec::new("l3_voltage_raw", 10, RawU16),
    FieldSpec::new("l1_current_raw", 11, RawU16),
    FieldSpec::new("l2_current_raw", 12, RawU16),
    FieldSpec::new("l3_current_raw", 13, RawU16),
    FieldSpec::new("power_raw", 14, RawU16),
    FieldSpec::new("lock_status", 15, BoolEq(1)),
    FieldSpec::new("phase_sequence", 16, Enum(PHASE_SEQUENCE_LABELS)),
    FieldSpec::new("max_power_raw", 17, RawU16),
    FieldSpec::new("min_power_raw", 18, RawU16),
    FieldSpec::new("max_current_raw", 19, RawU16),
    FieldSpec::new("min_current_raw", 20, RawU16),
    FieldSpec::new("alarm_code", 21, RawU16),
];

const CONFIG_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("work_mode", 0, Enum(WORK_MODE_LABELS)),
    FieldSpec::new("max_charging_current_raw", 1, RawU16),
    FieldSpec::new("max_charging_power_raw", 2, RawU16),
    FieldSpec::new("allowed_charge_time", 3, RawU16),
    FieldSpec::new("allowed_charge_energy", 4, RawU16),
    FieldSpec::new("time_validity", 5, RawU16),
    FieldSpec::new("default_current_raw", 6, RawU16),
    FieldSpec::new("reserved_3007", 7, Skip),
    FieldSpec::new("reserved_3008", 8, Skip),
    FieldSpec::new("reserved_3009", 9, Skip),
    FieldSpec::new("auto_phase_switch", 10, Enum(AUTO_PHASE_SWITCH_LABELS)),
    FieldSpec::new("min_switch_interval", 11, RawU16),
];

/// Blocks read by every poll cycle, in order.
pub const READ_BLOCKS: &[RegisterBlock] = &[
    RegisterBlock {
        start: REG_STATUS_BLOCK,
        count: 22,
        fields: STATUS_FIELDS,
    },
    RegisterBlock {
        start: REG_CURRENT_ENERGY,
        count: 2,
        fields: &[FieldSpec::new("current_energy_raw", 0, ComposedU32Be)],
    },
    RegisterBlock {
        start: REG_TOTAL_ENERGY,
        count: 2,
        fields: &[FieldSpec::new("total_energy_raw", 0, ComposedU32Be)],
    },
    RegisterBlock {
        start: REG_FAULT_CODE,
        count: 2,
        fields: &[FieldSpec::new("fault_code", 0, ComposedU32Be)],
    },
    RegisterBlock {
        start: REG_RFID_CARD,
        count: 2,
        fields: &[FieldSpec::new("rfid_card", 0, ComposedU32Be)],
    },
    RegisterBlock {
        start: REG_CONFIG_BLOCK,
        count: 12,
        fields: CONFIG_FIELDS,
    },
];

/// How a writable register is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Numeric setpoint; the current value is read back from `source`.
    Number { source: &'static str },
    /// One of a fixed set of options; the current option is read back from
    /// `source` when the register is also readable.
    Select {
        options: EnumTable,
        source: Option<&'static str>,
    },
    /// On/off command; "on" is reported while `state_key == state_on`.
    Switch {
        on: u16,
        off: u16,
        state_key: &'static str,
        state_on: u16,
    },
    /// Fire-and-forget command.
    Command,
}

/// A register accepted by the write path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WritableRegister {
    pub name: &'static str,
    pub address: u16,
    /// Raw value = logical value × scale.
    pub scale: f64,
    /// Lowest accepted logical value.
    pub min: f64,
    /// Highest accepted logical value.
    pub max: f64,
    pub step: f64,
    pub control: Control,
}

impl WritableRegister {
    /// Raw bounds derived from the logical bounds and the scale.
    pub fn raw_bounds(&self) -> (u16, u16) {
        (
            (self.min * self.scale).round() as u16,
            (self.max * self.scale).round() as u16,
        )
    }

    /// Logical value for a raw register value.
    pub fn to_logical(&self, raw: u16) -> f64 {
        f64::from(raw) / self.scale
    }

    /// Options of a select, if this register is one.
    pub fn options(&self) -> Option<EnumTable> {
        match self.control {
            Control::Select { options, .. } => Some(options),
            _ => None,
        }
    }
}

const fn number(
    name: &'static str,
    address: u16,
    scale: f64,
    min: f64,
    max: f64,
    step: f64,
    source: &'static str,
) -> WritableRegister {
    WritableRegister {
        name,
        address,
        scale,
        min,
        max,
        step,
        control: Control::Number { source },
    }
}

const fn select(
    name: &'static str,
    address: u16,
    options: EnumTable,
    max: f64,
    source: Option<&'static str>,
) -> WritableRegister {
    WritableRegister {
        name,
        address,
        scale: 1.0,
        min: 0.0,
        max,
        step: 1.0,
        control: Control::Select { options, source },
    }
}

/// Registers accepted by the write path.
pub const WRITABLE_REGISTERS: &[WritableRegister] = &[
    select(
        "work_mode",
        REG_WORK_MODE,
        WORK_MODE_LABELS,
        2.0,
        Some("work_mode"),
    ),
    number(
        "max_charging_current",
        REG_MAX_CHARGING_CURRENT,
        10.0,
        6.0,
        32.0,
        0.1,
        "max_charging_current_raw",
    ),
    number(
        "max_charging_power",
        REG_MAX_CHARGING_POWER,
        10.0,
        1.4,
        22.0,
        0.1,
        "max_charging_power_raw",
    ),
    number(
        "allowed_charge_time",
        REG_ALLOWED_CHARGE_TIME,
        1.0,
        0.0,
        1440.0,
        1.0,
        "allowed_charge_time",
    ),
    number(
        "allowed_charge_energy",
        REG_ALLOWED_CHARGE_ENERGY,
        1.0,
        0.0,
        100.0,
        1.0,
        "allowed_charge_energy",
    ),
    number(
        "time_validity",
        REG_TIME_VALIDITY,
        1.0,
        10.0,
        60.0,
        1.0,
        "time_validity",
    ),
    number(
        "default_current",
        REG_DEFAULT_CURRENT,
        10.0,
        6.0,
        32.0,
        0.1,
        "default_current_raw",
    ),
    select(
        "auto_phase_switch",
        REG_AUTO_PHASE_SWITCH,
        AUTO_PHASE_SWITCH_LABELS,
        1.0,
        Some("auto_phase_switch"),
    ),
    number(
        "min_switch_interval",
        REG_MIN_SWITCH_INTERVAL,
        1.0,
        5.0,
        30.0,
        1.0,
        "min_switch_interval",
    ),
    WritableRegister {
        name: "lock_control",
        address: REG_LOCK_CONTROL,
        scale: 1.0,
        min: 1.0,
        max: 2.0,
        step: 1.0,
        control: Control::Switch {
            on: 2,
            off: 1,
            state_key: "lock_status",
            state_on: 1,
        },
    },
    WritableRegister {
        name: "charging_control",
        address: REG_CHARGING_CONTROL,
        scale: 1.0,
        min: 1.0,
        max: 2.0,
        step: 1.0,
        control: Control::Switch {
            on: 1,
            off: 2,
            state_key: "status",
            state_on: 3,
        },
    },
    select(
        "phase_switching",
        REG_PHASE_SWITCHING,
        PHASE_SWITCHING_LABELS,
        2.0,
        None,
    ),
    WritableRegister {
        name: "restart",
        address: REG_RESTART,
        scale: 1.0,
        min: 1.0,
        max: 1.0,
        step: 1.0,
        control: Control::Command,
    },
];

/// The complete read and write register description of one device model.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    blocks: &'static [RegisterBlock],
    writable: &'static [WritableRegister],
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::foxess()
    }
}

impl RegisterMap {
    /// Register map of the Fox ESS AC charger.
    pub const fn foxess() -> Self {
        Self {
            blocks: READ_BLOCKS,
            writable: WRITABLE_REGISTERS,
        }
    }

    /// Build a map from custom tables.
    pub const fn new(
        blocks: &'static [RegisterBlock],
        writable: &'static [WritableRegister],
    ) -> Self {
        Self { blocks, writable }
    }

    /// Blocks to read each cycle, in order.
    pub fn blocks_to_read(&self) -> &'static [RegisterBlock] {
        self.blocks
    }

    pub fn writable_registers(&self) -> &'static [WritableRegister] {
        self.writable
    }

    pub fn writable_by_name(&self, name: &str) -> Option<&'static WritableRegister> {
        self.writable.iter().find(|r| r.name == name)
    }

    pub fn writable_at(&self, address: u16) -> Option<&'static WritableRegister> {
        self.writable.iter().find(|r| r.address == address)
    }

    /// Check every block layout.
    pub fn validate(&self) -> Result<(), String> {
        self.blocks.iter().try_for_each(RegisterBlock::validate)
    }
}
