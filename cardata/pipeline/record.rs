use serde::{Deserialize, Serialize};

use crate::normalizer::FEATURE_DIM;

/// Feature field names in schema (and feature vector) order.
pub const FEATURE_FIELDS: [&str; FEATURE_DIM] = [
    "coolant_temp",
    "intake_air_temp",
    "intake_air_flow_speed",
    "battery_percentage",
    "battery_voltage",
    "current_draw",
    "speed",
    "engine_vibration_amplitude",
    "throttle_pos",
    "tire_pressure_11",
    "tire_pressure_12",
    "tire_pressure_21",
    "tire_pressure_22",
    "accelerometer_11_value",
    "accelerometer_12_value",
    "accelerometer_21_value",
    "accelerometer_22_value",
    "control_unit_firmware",
];

/// Name of the string-typed failure flag, the 19th field.
pub const FAILURE_FIELD: &str = "failure_occurred";

/// Flag value marking a record as healthy operation.
pub const HEALTHY_FLAG: &str = "false";

/// Opaque queue payload plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Framed Avro payload.
    pub payload: Vec<u8>,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Optional message key.
    pub key: Option<Vec<u8>>,
}

impl RawMessage {
    /// Creates an unkeyed message.
    #[must_use]
    pub const fn new(payload: Vec<u8>, partition: i32, offset: i64) -> Self {
        Self {
            payload,
            partition,
            offset,
            key: None,
        }
    }
}

/// One decoded telemetry record; all 19 fields are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Engine coolant temperature.
    pub coolant_temp: f64,
    /// Intake air temperature.
    pub intake_air_temp: f64,
    /// Intake air flow speed.
    pub intake_air_flow_speed: f64,
    /// Battery state of charge, percent.
    pub battery_percentage: f64,
    /// Battery voltage.
    pub battery_voltage: f64,
    /// Current draw.
    pub current_draw: f64,
    /// Vehicle speed.
    pub speed: f64,
    /// Engine vibration amplitude.
    pub engine_vibration_amplitude: f64,
    /// Throttle position in [0, 1].
    pub throttle_pos: f64,
    /// Tire pressure, front left (int on the wire).
    pub tire_pressure_11: f64,
    /// Tire pressure, front right (int on the wire).
    pub tire_pressure_12: f64,
    /// Tire pressure, rear left (int on the wire).
    pub tire_pressure_21: f64,
    /// Tire pressure, rear right (int on the wire).
    pub tire_pressure_22: f64,
    /// Accelerometer channel 11.
    pub accelerometer_11_value: f64,
    /// Accelerometer channel 12.
    pub accelerometer_12_value: f64,
    /// Accelerometer channel 21.
    pub accelerometer_21_value: f64,
    /// Accelerometer channel 22.
    pub accelerometer_22_value: f64,
    /// Control unit firmware version code (int on the wire).
    pub control_unit_firmware: f64,
    /// `"true"` when a failure occurred, `"false"` otherwise.
    pub failure_occurred: String,
}

impl Record {
    /// Numeric fields in [`FEATURE_FIELDS`] order.
    #[must_use]
    pub const fn features(&self) -> [f64; FEATURE_DIM] {
        [
            self.coolant_temp,
            self.intake_air_temp,
            self.intake_air_flow_speed,
            self.battery_percentage,
            self.battery_voltage,
            self.current_draw,
            self.speed,
            self.engine_vibration_amplitude,
            self.throttle_pos,
            self.tire_pressure_11,
            self.tire_pressure_12,
            self.tire_pressure_21,
            self.tire_pressure_22,
            self.accelerometer_11_value,
            self.accelerometer_12_value,
            self.accelerometer_21_value,
            self.accelerometer_22_value,
            self.control_unit_firmware,
        ]
    }

    /// Builds a record from numeric fields in [`FEATURE_FIELDS`] order.
    #[must_use]
    pub fn from_features(values: [f64; FEATURE_DIM], failure_occurred: impl Into<String>) -> Self {
        let [coolant_temp, intake_air_temp, intake_air_flow_speed, battery_percentage, battery_voltage, current_draw, speed, engine_vibration_amplitude, throttle_pos, tire_pressure_11, tire_pressure_12, tire_pressure_21, tire_pressure_22, accelerometer_11_value, accelerometer_12_value, accelerometer_21_value, accelerometer_22_value, control_unit_firmware] =
            values;
        Self {
            coolant_temp,
            intake_air_temp,
            intake_air_flow_speed,
            battery_percentage,
            battery_voltage,
            current_draw,
            speed,
            engine_vibration_amplitude,
            throttle_pos,
            tire_pressure_11,
            tire_pressure_12,
            tire_pressure_21,
            tire_pressure_22,
            accelerometer_11_value,
            accelerometer_12_value,
            accelerometer_21_value,
            accelerometer_22_value,
            control_unit_firmware,
            failure_occurred: failure_occurred.into(),
        }
    }

    /// Whether the failure flag marks healthy operation.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failure_occurred == HEALTHY_FLAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_order_round_trips() {
        let values: [f64; FEATURE_DIM] = std::array::from_fn(|i| i as f64);
        let record = Record::from_features(values, "false");
        assert_eq!(record.features(), values);
        assert_eq!(record.control_unit_firmware, 17.0);
        assert!(record.is_healthy());
        assert!(!Record::from_features(values, "true").is_healthy());
    }
}
