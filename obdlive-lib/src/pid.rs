use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Mode-01 live-data parameters supported by the poller.
///
/// The discriminant is the OBD-II PID code sent on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum Pid {
    #[strum(to_string = "Engine load")]
    EngineLoad = 0x04,
    #[strum(to_string = "Coolant temperature")]
    CoolantTemp = 0x05,
    #[strum(to_string = "Engine RPM")]
    EngineRpm = 0x0C,
    #[strum(to_string = "Vehicle speed")]
    VehicleSpeed = 0x0D,
    #[strum(to_string = "Throttle position")]
    ThrottlePosition = 0x11,
    #[strum(to_string = "Fuel level")]
    FuelLevel = 0x2F,
}

/// Static definition of one parameter: wire format and display rules.
#[derive(Debug, Clone, Copy)]
pub struct PidDefinition {
    pub pid: Pid,
    pub unit: &'static str,
    /// Lower bound of the display range. Decoded values may legitimately
    /// fall outside; only `percentage` clamps.
    pub min: f64,
    pub max: f64,
    pub expected_bytes: usize,
    /// Decode formula over exactly `expected_bytes` payload bytes.
    pub decode: fn(&[u8]) -> f64,
    precision: usize,
}

impl PidDefinition {
    /// Render a decoded value with the parameter's unit.
    pub fn format(&self, value: f64) -> String {
        format!("{:.*} {}", self.precision, value, self.unit)
    }

    /// Position of `value` within the display range, clamped to 0..100.
    pub fn percentage(&self, value: f64) -> f64 {
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0) * 100.0
    }
}

static ENGINE_LOAD: PidDefinition = PidDefinition {
    pid: Pid::EngineLoad,
    unit: "%",
    min: 0.0,
    max: 100.0,
    expected_bytes: 1,
    decode: |b| b[0] as f64 * 100.0 / 255.0,
    precision: 1,
};

static COOLANT_TEMP: PidDefinition = PidDefinition {
    pid: Pid::CoolantTemp,
    unit: "°C",
    min: -40.0,
    max: 140.0,
    expected_bytes: 1,
    decode: |b| b[0] as f64 - 40.0,
    precision: 0,
};

static ENGINE_RPM: PidDefinition = PidDefinition {
    pid: Pid::EngineRpm,
    unit: "rpm",
    min: 0.0,
    max: 8000.0,
    expected_bytes: 2,
    decode: |b| (b[0] as f64 * 256.0 + b[1] as f64) / 4.0,
    precision: 0,
};

static VEHICLE_SPEED: PidDefinition = PidDefinition {
    pid: Pid::VehicleSpeed,
    unit: "km/h",
    min: 0.0,
    max: 220.0,
    expected_bytes: 1,
    decode: |b| b[0] as f64,
    precision: 0,
};

static THROTTLE_POSITION: PidDefinition = PidDefinition {
    pid: Pid::ThrottlePosition,
    unit: "%",
    min: 0.0,
    max: 100.0,
    expected_bytes: 1,
    decode: |b| b[0] as f64 * 100.0 / 255.0,
    precision: 1,
};

static FUEL_LEVEL: PidDefinition = PidDefinition {
    pid: Pid::FuelLevel,
    unit: "%",
    min: 0.0,
    max: 100.0,
    expected_bytes: 1,
    decode: |b| b[0] as f64 * 100.0 / 255.0,
    precision: 1,
};

impl Pid {
    /// The 5-parameter vehicle overview set.
    pub const OVERVIEW: [Pid; 5] = [
        Pid::EngineRpm,
        Pid::VehicleSpeed,
        Pid::CoolantTemp,
        Pid::FuelLevel,
        Pid::ThrottlePosition,
    ];

    /// The 6-parameter full live-data set.
    pub const FULL: [Pid; 6] = [
        Pid::EngineRpm,
        Pid::VehicleSpeed,
        Pid::CoolantTemp,
        Pid::FuelLevel,
        Pid::ThrottlePosition,
        Pid::EngineLoad,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Mode-01 read command for this parameter, without the CR terminator.
    pub fn command(self) -> String {
        format!("01{:02X}", self as u8)
    }

    /// Prefix a well-formed response must carry ("41" + code).
    pub fn response_prefix(self) -> String {
        format!("41{:02X}", self as u8)
    }

    pub fn definition(self) -> &'static PidDefinition {
        match self {
            Pid::EngineLoad => &ENGINE_LOAD,
            Pid::CoolantTemp => &COOLANT_TEMP,
            Pid::EngineRpm => &ENGINE_RPM,
            Pid::VehicleSpeed => &VEHICLE_SPEED,
            Pid::ThrottlePosition => &THROTTLE_POSITION,
            Pid::FuelLevel => &FUEL_LEVEL,
        }
    }

    /// Threshold classification. Total over all f64 input, including values
    /// outside the display range.
    pub fn classify(self, value: f64) -> Severity {
        match self {
            Pid::CoolantTemp => {
                if value >= 110.0 {
                    Severity::Critical
                } else if value >= 100.0 {
                    Severity::Warning
                } else if value < 50.0 {
                    Severity::Info
                } else {
                    Severity::Normal
                }
            }
            Pid::EngineRpm => {
                if value >= 6500.0 {
                    Severity::Critical
                } else if value >= 5500.0 {
                    Severity::Warning
                } else {
                    Severity::Normal
                }
            }
            Pid::FuelLevel => {
                if value <= 5.0 {
                    Severity::Critical
                } else if value <= 15.0 {
                    Severity::Warning
                } else {
                    Severity::Normal
                }
            }
            Pid::ThrottlePosition | Pid::EngineLoad => {
                if value >= 95.0 {
                    Severity::Warning
                } else {
                    Severity::Normal
                }
            }
            Pid::VehicleSpeed => Severity::Normal,
        }
    }
}

impl FromStr for Pid {
    type Err = String;

    /// Accepts short parameter names ("rpm", "coolant") or a 2-digit hex code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rpm" => Ok(Pid::EngineRpm),
            "speed" => Ok(Pid::VehicleSpeed),
            "coolant" => Ok(Pid::CoolantTemp),
            "fuel" => Ok(Pid::FuelLevel),
            "throttle" => Ok(Pid::ThrottlePosition),
            "load" => Ok(Pid::EngineLoad),
            other => u8::from_str_radix(other, 16)
                .ok()
                .and_then(|code| Pid::try_from(code).ok())
                .ok_or_else(|| format!("unknown parameter '{s}'")),
        }
    }
}

/// Display severity bucket for a decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const fn color(self) -> &'static str {
        match self {
            Severity::Normal => "green",
            Severity::Info => "blue",
            Severity::Warning => "orange",
            Severity::Critical => "red",
        }
    }
}
