//! Measurement codecs for the standardized health characteristics.
//!
//! Both payloads open with a bit-flags byte; every following field's
//! presence and offset depends on specific flag bits, so offsets are
//! computed cumulatively. Unit flags only change the divisor applied to the
//! raw integers, never the wire layout.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors produced while decoding a measurement payload.
///
/// A payload shorter than its own flags imply is rejected as malformed
/// rather than read partially; decoding never panics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("invalid device timestamp in payload")]
    InvalidTimestamp,
}

fn is_flag_set(flags: u8, pos: u8) -> bool {
    flags & (1 << pos) != 0
}

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// Decodes the 7-byte date-time block used by the health profiles:
/// year (u16 LE), month, day, hour, minute, second. Month is 1-based on the
/// wire.
fn read_date_time(payload: &[u8], offset: usize) -> Result<NaiveDateTime, DecodeError> {
    let year = i32::from(read_u16(payload, offset));
    let month = u32::from(payload[offset + 2]);
    let day = u32::from(payload[offset + 3]);
    let hour = u32::from(payload[offset + 4]);
    let minute = u32::from(payload[offset + 5]);
    let second = u32::from(payload[offset + 6]);

    chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or(DecodeError::InvalidTimestamp)
}

/// Decodes an IEEE-11073 16-bit SFLOAT. The reserved mantissa values
/// (NaN, NRes, +INF, -INF) yield `None`.
fn decode_sfloat(raw: u16) -> Option<f64> {
    let mantissa_bits = raw & 0x0fff;
    if matches!(mantissa_bits, 0x07ff | 0x0800 | 0x07fe | 0x0802) {
        return None;
    }
    let mantissa = if mantissa_bits >= 0x0800 {
        i32::from(mantissa_bits) - 0x1000
    } else {
        i32::from(mantissa_bits)
    };
    let exponent_bits = (raw >> 12) as i32;
    let exponent = if exponent_bits >= 0x08 {
        exponent_bits - 0x10
    } else {
        exponent_bits
    };
    Some(f64::from(mantissa) * 10f64.powi(exponent))
}

// Weight Scale profile units and divisors.
const KG_DIVISOR: f64 = 200.0;
const LB_DIVISOR: f64 = 100.0;
const METER_DIVISOR: f64 = 1000.0;
const INCH_DIVISOR: f64 = 10.0;
const BMI_DIVISOR: f64 = 10.0;

/// Raw weight value the profile reserves for a failed measurement.
const WEIGHT_FAILED: u16 = 0xffff;

/// User id value the profile reserves for "unknown user".
pub const USER_ID_UNKNOWN: u8 = 0xff;

// Weight Measurement flag bits.
const FLAG_WEIGHT_UNIT: u8 = 0;
const FLAG_WEIGHT_TIMESTAMP: u8 = 1;
const FLAG_WEIGHT_USER_ID: u8 = 2;
const FLAG_WEIGHT_BMI_HEIGHT: u8 = 3;

/// A decoded Weight Measurement (0x2A9D) record.
///
/// # Payload layout
///
/// ```text
/// [0]     : Flags
///           bit 0: unit (0 = SI, 1 = imperial)
///           bit 1: timestamp field present
///           bit 2: user id field present
///           bit 3: BMI and height fields present
/// [1-2]   : Weight (u16 LE, divisor 200 for kg, 100 for lb)
/// [3-9]   : Timestamp (7-byte date-time, if bit 1)
/// [..]    : User id (u8, if bit 2)
/// [..]    : BMI (u16 LE, divisor 10, if bit 3)
/// [..]    : Height (u16 LE, divisor 1000 for m, 10 for in, if bit 3)
/// ```
///
/// Each optional field, when present, shifts every later offset by its
/// width. A raw weight of 0xFFFF marks a failed measurement.
#[derive(Debug, Clone, Serialize)]
pub struct WeightMeasurement {
    /// Host-pipeline arrival time.
    pub receive_time: DateTime<Utc>,
    imperial: bool,
    raw_weight: u16,
    pub device_time: Option<NaiveDateTime>,
    pub user_id: Option<u8>,
    raw_bmi: Option<u16>,
    raw_height: Option<u16>,
}

impl WeightMeasurement {
    /// Decodes a characteristic payload, stamping the current time as the
    /// receive time.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_at(payload, Utc::now())
    }

    /// Decodes a characteristic payload with an explicit receive time.
    pub fn decode_at(payload: &[u8], receive_time: DateTime<Utc>) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Truncated {
                needed: 3,
                actual: 0,
            });
        }
        let flags = payload[0];
        let has_timestamp = is_flag_set(flags, FLAG_WEIGHT_TIMESTAMP);
        let has_user_id = is_flag_set(flags, FLAG_WEIGHT_USER_ID);
        let has_bmi_height = is_flag_set(flags, FLAG_WEIGHT_BMI_HEIGHT);

        let mut needed = 3;
        if has_timestamp {
            needed += 7;
        }
        if has_user_id {
            needed += 1;
        }
        if has_bmi_height {
            needed += 4;
        }
        if payload.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                actual: payload.len(),
            });
        }

        // cumulative offsets, shifted by each optional field that is present
        let weight_offset = 1;
        let timestamp_offset = weight_offset + 2;
        let user_id_offset = timestamp_offset + if has_timestamp { 7 } else { 0 };
        let bmi_offset = user_id_offset + if has_user_id { 1 } else { 0 };
        let height_offset = bmi_offset + 2;

        let device_time = if has_timestamp {
            Some(read_date_time(payload, timestamp_offset)?)
        } else {
            None
        };

        Ok(Self {
            receive_time,
            imperial: is_flag_set(flags, FLAG_WEIGHT_UNIT),
            raw_weight: read_u16(payload, weight_offset),
            device_time,
            user_id: has_user_id.then(|| payload[user_id_offset]),
            raw_bmi: has_bmi_height.then(|| read_u16(payload, bmi_offset)),
            raw_height: has_bmi_height.then(|| read_u16(payload, height_offset)),
        })
    }

    /// Whether the scale reported a failed measurement instead of a value.
    pub fn failed(&self) -> bool {
        self.raw_weight == WEIGHT_FAILED
    }

    /// Weight in the unit selected by the flags.
    pub fn weight(&self) -> f64 {
        let divisor = if self.imperial { LB_DIVISOR } else { KG_DIVISOR };
        f64::from(self.raw_weight) / divisor
    }

    pub fn weight_unit(&self) -> &'static str {
        if self.imperial {
            "lb"
        } else {
            "kg"
        }
    }

    pub fn bmi(&self) -> Option<f64> {
        self.raw_bmi.map(|raw| f64::from(raw) / BMI_DIVISOR)
    }

    /// Height in the unit selected by the flags.
    pub fn height(&self) -> Option<f64> {
        let divisor = if self.imperial {
            INCH_DIVISOR
        } else {
            METER_DIVISOR
        };
        self.raw_height.map(|raw| f64::from(raw) / divisor)
    }

    pub fn height_unit(&self) -> &'static str {
        if self.imperial {
            "in"
        } else {
            "m"
        }
    }

    /// Serializes the record to the InfluxDB line protocol.
    pub fn to_influx_line(&self) -> String {
        let mut line = String::from("Weight");
        if self.raw_bmi.is_some() {
            line.push_str(&format!(",height_unit={}", self.height_unit()));
        }
        if let Some(user_id) = self.user_id {
            line.push_str(&format!(",user_id={user_id}"));
        }
        line.push_str(&format!(",weight_unit={}", self.weight_unit()));
        line.push_str(&format!(" weight={}", self.weight()));
        if let (Some(height), Some(bmi)) = (self.height(), self.bmi()) {
            line.push_str(&format!(",height={height},bmi={bmi}"));
        }
        if self.device_time.is_some() {
            // influx wants nanoseconds
            line.push_str(&format!(" {}000000", self.receive_time.timestamp_millis()));
        }
        line
    }
}

impl fmt::Display for WeightMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weight: ")?;
        if self.failed() {
            write!(f, "Measurement failed")?;
        } else {
            write!(f, "{} {}", self.weight(), self.weight_unit())?;
        }
        if let Some(device_time) = self.device_time {
            write!(f, "\nTime: {device_time}")?;
        }
        if let Some(user_id) = self.user_id {
            if user_id == USER_ID_UNKNOWN {
                write!(f, "\nUser ID: unknown")?;
            } else {
                write!(f, "\nUser ID: {user_id}")?;
            }
        }
        if let (Some(bmi), Some(height)) = (self.bmi(), self.height()) {
            write!(f, "\nBMI: {bmi}")?;
            write!(f, "\nHeight: {height} {}", self.height_unit())?;
        }
        Ok(())
    }
}

// Glucose Measurement flag bits.
const FLAG_GLUCOSE_TIME_OFFSET: u8 = 0;
const FLAG_GLUCOSE_CONCENTRATION: u8 = 1;
const FLAG_GLUCOSE_UNIT_MOL: u8 = 2;
const FLAG_GLUCOSE_SENSOR_STATUS: u8 = 3;
const FLAG_GLUCOSE_CONTEXT: u8 = 4;

/// A decoded Glucose Measurement (0x2A18) record.
///
/// # Payload layout
///
/// ```text
/// [0]     : Flags
///           bit 0: time offset field present
///           bit 1: concentration and type/sample-location present
///           bit 2: unit (0 = kg/L, 1 = mol/L)
///           bit 3: sensor status annunciation present
///           bit 4: a context record follows on 0x2A34
/// [1-2]   : Sequence number (u16 LE)
/// [3-9]   : Base time (7-byte date-time, always present)
/// [..]    : Time offset in minutes (i16 LE, if bit 0)
/// [..]    : Concentration (SFLOAT, if bit 1)
/// [..]    : Type / sample location nibbles (u8, if bit 1)
/// [..]    : Sensor status annunciation (u16 LE, if bit 3)
/// ```
///
/// The reserved SFLOAT mantissas (NaN, NRes, infinities) mark a failed
/// measurement.
#[derive(Debug, Clone, Serialize)]
pub struct GlucoseMeasurement {
    /// Host-pipeline arrival time.
    pub receive_time: DateTime<Utc>,
    mol_per_liter: bool,
    context_follows: bool,
    pub sequence_number: u16,
    pub base_time: NaiveDateTime,
    pub time_offset_minutes: Option<i16>,
    raw_concentration: Option<u16>,
    pub type_sample_location: Option<u8>,
    pub sensor_status: Option<u16>,
}

impl GlucoseMeasurement {
    /// Decodes a characteristic payload, stamping the current time as the
    /// receive time.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_at(payload, Utc::now())
    }

    /// Decodes a characteristic payload with an explicit receive time.
    pub fn decode_at(payload: &[u8], receive_time: DateTime<Utc>) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Truncated {
                needed: 10,
                actual: 0,
            });
        }
        let flags = payload[0];
        let has_time_offset = is_flag_set(flags, FLAG_GLUCOSE_TIME_OFFSET);
        let has_concentration = is_flag_set(flags, FLAG_GLUCOSE_CONCENTRATION);
        let has_sensor_status = is_flag_set(flags, FLAG_GLUCOSE_SENSOR_STATUS);

        let mut needed = 10;
        if has_time_offset {
            needed += 2;
        }
        if has_concentration {
            needed += 3;
        }
        if has_sensor_status {
            needed += 2;
        }
        if payload.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                actual: payload.len(),
            });
        }

        let sequence_offset = 1;
        let base_time_offset = sequence_offset + 2;
        let time_offset_offset = base_time_offset + 7;
        let concentration_offset = time_offset_offset + if has_time_offset { 2 } else { 0 };
        let type_location_offset = concentration_offset + 2;
        let sensor_status_offset = concentration_offset + if has_concentration { 3 } else { 0 };

        Ok(Self {
            receive_time,
            mol_per_liter: is_flag_set(flags, FLAG_GLUCOSE_UNIT_MOL),
            context_follows: is_flag_set(flags, FLAG_GLUCOSE_CONTEXT),
            sequence_number: read_u16(payload, sequence_offset),
            base_time: read_date_time(payload, base_time_offset)?,
            time_offset_minutes: has_time_offset
                .then(|| read_u16(payload, time_offset_offset) as i16),
            raw_concentration: has_concentration.then(|| read_u16(payload, concentration_offset)),
            type_sample_location: has_concentration.then(|| payload[type_location_offset]),
            sensor_status: has_sensor_status.then(|| read_u16(payload, sensor_status_offset)),
        })
    }

    /// Concentration in the unit selected by the flags, `None` when the
    /// field is absent or carries a reserved failure value.
    pub fn concentration(&self) -> Option<f64> {
        self.raw_concentration.and_then(decode_sfloat)
    }

    /// Whether the meter reported a failed measurement instead of a value.
    pub fn failed(&self) -> bool {
        match self.raw_concentration {
            Some(raw) => decode_sfloat(raw).is_none(),
            None => false,
        }
    }

    pub fn unit(&self) -> &'static str {
        if self.mol_per_liter {
            "mol/L"
        } else {
            "kg/L"
        }
    }

    /// Whether a measurement-context record follows on the context
    /// characteristic.
    pub fn context_follows(&self) -> bool {
        self.context_follows
    }

    /// Serializes the record to the InfluxDB line protocol.
    pub fn to_influx_line(&self) -> String {
        let mut line = String::from("Glucose");
        line.push_str(&format!(",unit={}", self.unit()));
        line.push_str(&format!(" sequence={}", self.sequence_number));
        if let Some(concentration) = self.concentration() {
            line.push_str(&format!(",concentration={concentration}"));
        }
        if let Some(offset) = self.time_offset_minutes {
            line.push_str(&format!(",time_offset={offset}"));
        }
        line.push_str(&format!(" {}000000", self.receive_time.timestamp_millis()));
        line
    }
}

impl fmt::Display for GlucoseMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Glucose: ")?;
        match self.concentration() {
            Some(concentration) => write!(f, "{concentration} {}", self.unit())?,
            None if self.failed() => write!(f, "Measurement failed")?,
            None => write!(f, "no concentration")?,
        }
        write!(f, "\nSequence: {}", self.sequence_number)?;
        write!(f, "\nTime: {}", self.base_time)?;
        if let Some(offset) = self.time_offset_minutes {
            write!(f, " ({offset:+} min)")?;
        }
        Ok(())
    }
}

/// A decoded measurement record held by the collection store. Immutable
/// once constructed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurement {
    Weight(WeightMeasurement),
    Glucose(GlucoseMeasurement),
}

impl Measurement {
    pub fn receive_time(&self) -> DateTime<Utc> {
        match self {
            Measurement::Weight(m) => m.receive_time,
            Measurement::Glucose(m) => m.receive_time,
        }
    }

    pub fn to_influx_line(&self) -> String {
        match self {
            Measurement::Weight(m) => m.to_influx_line(),
            Measurement::Glucose(m) => m.to_influx_line(),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Weight(m) => m.fmt(f),
            Measurement::Glucose(m) => m.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date_time_bytes(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> [u8; 7] {
        let y = year.to_le_bytes();
        [y[0], y[1], month, day, hour, minute, second]
    }

    #[test]
    fn weight_minimal_si_payload() {
        let m = WeightMeasurement::decode(&[0x00, 0x90, 0x01]).unwrap();
        assert!(!m.failed());
        assert_eq!(m.weight(), 2.0);
        assert_eq!(m.weight_unit(), "kg");
        assert!(m.device_time.is_none());
        assert!(m.user_id.is_none());
        assert!(m.bmi().is_none());
        assert!(m.height().is_none());
    }

    #[test]
    fn weight_imperial_unit_changes_divisor_only() {
        let m = WeightMeasurement::decode(&[0x01, 0x90, 0x01]).unwrap();
        assert_eq!(m.weight(), 4.0);
        assert_eq!(m.weight_unit(), "lb");
    }

    #[test]
    fn weight_full_layout_offsets_are_cumulative() {
        let mut payload = vec![0x0e, 0x90, 0x01];
        payload.extend_from_slice(&date_time_bytes(2016, 6, 27, 12, 30, 45));
        payload.push(0x05); // user id
        payload.extend_from_slice(&215u16.to_le_bytes()); // bmi 21.5
        payload.extend_from_slice(&1800u16.to_le_bytes()); // height 1.8 m

        let m = WeightMeasurement::decode(&payload).unwrap();
        assert_eq!(
            m.device_time,
            NaiveDate::from_ymd_opt(2016, 6, 27)
                .unwrap()
                .and_hms_opt(12, 30, 45)
        );
        assert_eq!(m.user_id, Some(5));
        assert_eq!(m.bmi(), Some(21.5));
        assert_eq!(m.height(), Some(1.8));
        assert_eq!(m.height_unit(), "m");
    }

    #[test]
    fn weight_optional_fields_shift_later_offsets() {
        // same trailing fields, but without the timestamp in between
        let mut payload = vec![0x0c, 0x90, 0x01];
        payload.push(0x07);
        payload.extend_from_slice(&230u16.to_le_bytes());
        payload.extend_from_slice(&60u16.to_le_bytes());

        let m = WeightMeasurement::decode(&payload).unwrap();
        assert!(m.device_time.is_none());
        assert_eq!(m.user_id, Some(7));
        assert_eq!(m.bmi(), Some(23.0));
        assert_eq!(m.height(), Some(0.06));
    }

    #[test]
    fn weight_imperial_height_uses_inch_divisor() {
        let mut payload = vec![0x09, 0x90, 0x01];
        payload.extend_from_slice(&230u16.to_le_bytes());
        payload.extend_from_slice(&708u16.to_le_bytes());

        let m = WeightMeasurement::decode(&payload).unwrap();
        assert_eq!(m.height(), Some(70.8));
        assert_eq!(m.height_unit(), "in");
    }

    #[test]
    fn weight_sentinel_reports_failure_regardless_of_flags() {
        for flags in [0x00u8, 0x01, 0x05] {
            let mut payload = vec![flags, 0xff, 0xff];
            if is_flag_set(flags, FLAG_WEIGHT_TIMESTAMP) {
                payload.extend_from_slice(&date_time_bytes(2020, 1, 1, 0, 0, 0));
            }
            if is_flag_set(flags, FLAG_WEIGHT_USER_ID) {
                payload.push(0x01);
            }
            let m = WeightMeasurement::decode(&payload).unwrap();
            assert!(m.failed(), "flags {flags:#04x} should report failure");
        }
    }

    #[test]
    fn weight_short_payload_is_rejected() {
        let err = WeightMeasurement::decode(&[0x02, 0x90, 0x01, 0xe0]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 10,
                actual: 4
            }
        );
    }

    #[test]
    fn weight_invalid_timestamp_is_rejected() {
        let mut payload = vec![0x02, 0x90, 0x01];
        payload.extend_from_slice(&date_time_bytes(2016, 13, 1, 0, 0, 0));
        let err = WeightMeasurement::decode(&payload).unwrap_err();
        assert_eq!(err, DecodeError::InvalidTimestamp);
    }

    #[test]
    fn weight_influx_line_contains_tags_and_fields() {
        let mut payload = vec![0x0c, 0x90, 0x01];
        payload.push(0x05);
        payload.extend_from_slice(&215u16.to_le_bytes());
        payload.extend_from_slice(&1800u16.to_le_bytes());
        let m = WeightMeasurement::decode(&payload).unwrap();

        let line = m.to_influx_line();
        assert!(line.starts_with("Weight,height_unit=m,user_id=5,weight_unit=kg "));
        assert!(line.contains("weight=2"));
        assert!(line.contains("bmi=21.5"));
    }

    fn glucose_base(flags: u8) -> Vec<u8> {
        let mut payload = vec![flags];
        payload.extend_from_slice(&7u16.to_le_bytes());
        payload.extend_from_slice(&date_time_bytes(2016, 7, 4, 8, 15, 0));
        payload
    }

    #[test]
    fn glucose_minimal_payload() {
        let m = GlucoseMeasurement::decode(&glucose_base(0x00)).unwrap();
        assert_eq!(m.sequence_number, 7);
        assert!(m.time_offset_minutes.is_none());
        assert!(m.concentration().is_none());
        assert!(!m.failed());
        assert!(!m.context_follows());
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn glucose_concentration_and_offsets() {
        let mut payload = glucose_base(0x03);
        payload.extend_from_slice(&(-120i16 as u16).to_le_bytes());
        // SFLOAT: mantissa 82, exponent -5 -> 0.00082 kg/L
        payload.extend_from_slice(&0xb052u16.to_le_bytes());
        payload.push(0x11);

        let m = GlucoseMeasurement::decode(&payload).unwrap();
        assert_eq!(m.time_offset_minutes, Some(-120));
        assert!(close(m.concentration().unwrap(), 82.0e-5));
        assert_eq!(m.type_sample_location, Some(0x11));
        assert_eq!(m.unit(), "kg/L");
    }

    #[test]
    fn glucose_unit_flag_selects_mol_per_liter() {
        let mut payload = glucose_base(0x06);
        payload.extend_from_slice(&0xd042u16.to_le_bytes());
        payload.push(0x12);

        let m = GlucoseMeasurement::decode(&payload).unwrap();
        assert_eq!(m.unit(), "mol/L");
        assert!(close(m.concentration().unwrap(), 66.0e-3));
    }

    #[test]
    fn glucose_sensor_status_offset_without_concentration() {
        let mut payload = glucose_base(0x08);
        payload.extend_from_slice(&0x0200u16.to_le_bytes());

        let m = GlucoseMeasurement::decode(&payload).unwrap();
        assert_eq!(m.sensor_status, Some(0x0200));
        assert!(m.raw_concentration.is_none());
    }

    #[test]
    fn glucose_reserved_sfloat_reports_failure() {
        for raw in [0x07ffu16, 0x0800, 0x07fe, 0x0802] {
            let mut payload = glucose_base(0x02);
            payload.extend_from_slice(&raw.to_le_bytes());
            payload.push(0x00);
            let m = GlucoseMeasurement::decode(&payload).unwrap();
            assert!(m.failed(), "raw {raw:#06x} should report failure");
            assert!(m.concentration().is_none());
        }
    }

    #[test]
    fn glucose_short_payload_is_rejected() {
        let err = GlucoseMeasurement::decode(&glucose_base(0x02)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 13,
                actual: 10
            }
        );
    }

    #[test]
    fn sfloat_decodes_signed_mantissa_and_exponent() {
        assert_eq!(decode_sfloat(0x0048), Some(72.0));
        assert!(close(decode_sfloat(0xf050).unwrap(), 8.0));
        assert_eq!(decode_sfloat(0x0fff), Some(-1.0));
        assert_eq!(decode_sfloat(0x07ff), None);
    }
}
