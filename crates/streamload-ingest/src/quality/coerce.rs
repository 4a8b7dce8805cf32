//! Per-field value coercion

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;

use crate::catalog::{Casing, FieldKind};
use crate::config::{CoercionConfig, DetectionMarker};
use crate::types::{format_number, DetectionFlag, RawValue, Value};

/// Spreadsheet day zero. Serial 1 is 1899-12-31 on this epoch, which
/// absorbs the 1900 leap-year bug for every date after February 1900.
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Largest serial spreadsheets accept (9999-12-31)
const EXCEL_MAX_SERIAL: f64 = 2_958_465.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// A successfully coerced value
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: Value,
    pub flag: Option<DetectionFlag>,
}

impl Coerced {
    fn plain(value: Value) -> Self {
        Self { value, flag: None }
    }

    fn null() -> Self {
        Self::plain(Value::Null)
    }
}

/// Raw text that could not be read as the declared kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionFailure {
    pub raw: String,
}

/// Coercion rules compiled from configuration
#[derive(Debug, Clone)]
pub struct Coercer {
    date_formats: Vec<String>,
    datetime_formats: Vec<String>,
    truthy: HashSet<String>,
    falsy: HashSet<String>,
    /// Longest marker first so ">=" wins over ">"
    markers: Vec<DetectionMarker>,
    excel_serial_dates: bool,
}

impl Coercer {
    pub fn new(config: &CoercionConfig) -> Self {
        let tokens = |items: &[String]| items.iter().map(|t| t.trim().to_lowercase()).collect();
        let mut markers = config.detection_markers.clone();
        markers.sort_by(|a, b| b.marker.len().cmp(&a.marker.len()));

        Self {
            date_formats: config.date_formats.clone(),
            datetime_formats: config.datetime_formats.clone(),
            truthy: tokens(&config.truthy),
            falsy: tokens(&config.falsy),
            markers,
            excel_serial_dates: config.excel_serial_dates,
        }
    }

    /// Coerce one raw value. Empty input always yields `Null`.
    pub fn coerce(
        &self,
        raw: &RawValue,
        kind: FieldKind,
        casing: Casing,
    ) -> Result<Coerced, CoercionFailure> {
        if raw.is_empty() {
            return Ok(Coerced::null());
        }
        let failure = || CoercionFailure {
            raw: raw.as_text().unwrap_or_default(),
        };

        match kind {
            FieldKind::Text => Ok(Coerced::plain(self.text(raw, casing))),
            FieldKind::Integer | FieldKind::Float => self.numeric(raw, kind).ok_or_else(failure),
            FieldKind::Date => self.date(raw).map(|d| Coerced::plain(Value::Date(d))).ok_or_else(failure),
            FieldKind::DateTime => self
                .datetime(raw)
                .map(|dt| Coerced::plain(Value::DateTime(dt)))
                .ok_or_else(failure),
            FieldKind::Boolean => self
                .boolean(raw)
                .map(|b| Coerced::plain(Value::Boolean(b)))
                .ok_or_else(failure),
        }
    }

    /// Values of columns the schema does not declare keep their raw shape.
    pub fn passthrough(&self, raw: &RawValue) -> Value {
        match raw {
            RawValue::Number(n) => Value::Float(*n),
            other if other.is_empty() => Value::Null,
            other => self.text(other, Casing::Preserve),
        }
    }

    fn text(&self, raw: &RawValue, casing: Casing) -> Value {
        let Some(text) = raw.as_text() else {
            return Value::Null;
        };
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return Value::Null;
        }
        Value::Text(match casing {
            Casing::Preserve => collapsed,
            Casing::Upper => collapsed.to_uppercase(),
            Casing::Lower => collapsed.to_lowercase(),
        })
    }

    fn numeric(&self, raw: &RawValue, kind: FieldKind) -> Option<Coerced> {
        let (number, flag) = match raw {
            RawValue::Number(n) => (*n, None),
            RawValue::Text(text) => {
                let (flag, rest) = self.strip_marker(text.trim());
                (rest.trim().parse::<f64>().ok()?, flag)
            },
            RawValue::Empty => return Some(Coerced::null()),
        };

        if !number.is_finite() {
            return None;
        }

        let value = match kind {
            FieldKind::Integer => {
                if number.fract() != 0.0 || number.abs() > i64::MAX as f64 {
                    return None;
                }
                Value::Integer(number as i64)
            },
            _ => Value::Float(number),
        };
        Some(Coerced { value, flag })
    }

    fn strip_marker<'t>(&self, text: &'t str) -> (Option<DetectionFlag>, &'t str) {
        for marker in &self.markers {
            if let Some(rest) = text.strip_prefix(marker.marker.as_str()) {
                return (Some(marker.flag), rest);
            }
        }
        (None, text)
    }

    fn date(&self, raw: &RawValue) -> Option<NaiveDate> {
        match raw {
            RawValue::Number(n) => self.serial(*n).map(|dt| dt.date()),
            RawValue::Text(text) => {
                let text = text.trim();
                self.date_formats
                    .iter()
                    .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
                    .or_else(|| self.parse_datetime_text(text).map(|dt| dt.date()))
                    .or_else(|| text.parse::<f64>().ok().and_then(|n| self.serial(n)).map(|dt| dt.date()))
            },
            RawValue::Empty => None,
        }
    }

    fn datetime(&self, raw: &RawValue) -> Option<NaiveDateTime> {
        match raw {
            RawValue::Number(n) => self.serial(*n),
            RawValue::Text(text) => {
                let text = text.trim();
                self.parse_datetime_text(text)
                    .or_else(|| {
                        self.date_formats
                            .iter()
                            .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
                            .map(|d| d.and_time(NaiveTime::MIN))
                    })
                    .or_else(|| text.parse::<f64>().ok().and_then(|n| self.serial(n)))
            },
            RawValue::Empty => None,
        }
    }

    fn parse_datetime_text(&self, text: &str) -> Option<NaiveDateTime> {
        self.datetime_formats
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
    }

    fn serial(&self, serial: f64) -> Option<NaiveDateTime> {
        if !self.excel_serial_dates || !serial.is_finite() || !(1.0..=EXCEL_MAX_SERIAL).contains(&serial) {
            return None;
        }
        let (y, m, d) = EXCEL_EPOCH;
        let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
        let date = epoch.checked_add_days(Days::new(serial.trunc() as u64))?;
        let seconds = ((serial.fract() * SECONDS_PER_DAY).round() as u32).min(86_399);
        let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)?;
        Some(date.and_time(time))
    }

    fn boolean(&self, raw: &RawValue) -> Option<bool> {
        let token = match raw {
            RawValue::Number(n) => format_number(*n),
            RawValue::Text(t) => t.trim().to_lowercase(),
            RawValue::Empty => return None,
        };
        if self.truthy.contains(&token) {
            Some(true)
        } else if self.falsy.contains(&token) {
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn coercer() -> Coercer {
        Coercer::new(&CoercionConfig::default())
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    #[test]
    fn test_detection_limit_markers() {
        let c = coercer();
        let above = c.coerce(&text(">100"), FieldKind::Float, Casing::Preserve).unwrap();
        assert_eq!(above.value, Value::Float(100.0));
        assert_eq!(above.flag, Some(DetectionFlag::AboveLimit));

        let below = c.coerce(&text("< 1"), FieldKind::Integer, Casing::Preserve).unwrap();
        assert_eq!(below.value, Value::Integer(1));
        assert_eq!(below.flag, Some(DetectionFlag::BelowLimit));
    }

    #[test]
    fn test_longer_marker_wins() {
        let mut config = CoercionConfig::default();
        config
            .detection_markers
            .push(DetectionMarker::new("gl", DetectionFlag::AboveLimit));
        config
            .detection_markers
            .push(DetectionMarker::new(">=", DetectionFlag::AboveLimit));
        let c = Coercer::new(&config);

        let v = c.coerce(&text(">=2419.6"), FieldKind::Float, Casing::Preserve).unwrap();
        assert_eq!(v.value, Value::Float(2419.6));
        let v = c.coerce(&text("gl2419.6"), FieldKind::Float, Casing::Preserve).unwrap();
        assert_eq!(v.flag, Some(DetectionFlag::AboveLimit));
    }

    #[test]
    fn test_unparseable_numbers_fail() {
        let c = coercer();
        assert!(c.coerce(&text("TNTC"), FieldKind::Float, Casing::Preserve).is_err());
        assert!(c.coerce(&text("NaN"), FieldKind::Float, Casing::Preserve).is_err());
        assert!(c.coerce(&text("2.5"), FieldKind::Integer, Casing::Preserve).is_err());
        assert_eq!(
            c.coerce(&RawValue::Number(7.0), FieldKind::Integer, Casing::Preserve).unwrap().value,
            Value::Integer(7)
        );
    }

    #[test]
    fn test_empty_is_null_not_failure() {
        let c = coercer();
        for kind in [FieldKind::Text, FieldKind::Float, FieldKind::Date, FieldKind::Boolean] {
            let v = c.coerce(&text("   "), kind, Casing::Preserve).unwrap();
            assert_eq!(v.value, Value::Null);
        }
    }

    #[test]
    fn test_dates_first_matching_format_wins() {
        let c = coercer();
        let expected = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        for raw in ["2023-06-01", "6/1/2023", "06/01/23", "2023-06-01 00:00:00"] {
            let v = c.coerce(&text(raw), FieldKind::Date, Casing::Preserve).unwrap();
            assert_eq!(v.value, Value::Date(expected), "{raw}");
        }
        assert!(c.coerce(&text("sometime in June"), FieldKind::Date, Casing::Preserve).is_err());
    }

    #[test]
    fn test_excel_serial_dates() {
        let c = coercer();
        let v = c.coerce(&RawValue::Number(45078.0), FieldKind::Date, Casing::Preserve).unwrap();
        assert_eq!(v.value, Value::Date(NaiveDate::from_ymd_opt(2023, 6, 1).unwrap()));

        let v = c.coerce(&RawValue::Number(45078.5), FieldKind::DateTime, Casing::Preserve).unwrap();
        assert_eq!(
            v.value,
            Value::DateTime(
                NaiveDate::from_ymd_opt(2023, 6, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
            )
        );

        let mut config = CoercionConfig::default();
        config.excel_serial_dates = false;
        let strict = Coercer::new(&config);
        assert!(strict.coerce(&RawValue::Number(45078.0), FieldKind::Date, Casing::Preserve).is_err());
    }

    #[test]
    fn test_boolean_tokens() {
        let c = coercer();
        for raw in ["Yes", "y", "TRUE", "active", "1"] {
            assert_eq!(
                c.coerce(&text(raw), FieldKind::Boolean, Casing::Preserve).unwrap().value,
                Value::Boolean(true)
            );
        }
        for raw in ["no", "Inactive", "0"] {
            assert_eq!(
                c.coerce(&text(raw), FieldKind::Boolean, Casing::Preserve).unwrap().value,
                Value::Boolean(false)
            );
        }
        assert_eq!(
            c.coerce(&RawValue::Number(1.0), FieldKind::Boolean, Casing::Preserve).unwrap().value,
            Value::Boolean(true)
        );
        assert!(c.coerce(&text("maybe"), FieldKind::Boolean, Casing::Preserve).is_err());
    }

    #[test]
    fn test_text_cleanup_and_casing() {
        let c = coercer();
        let v = c.coerce(&text("  pine   run\tcreek "), FieldKind::Text, Casing::Preserve).unwrap();
        assert_eq!(v.value, Value::Text("pine run creek".into()));
        let v = c.coerce(&text(" pr2a "), FieldKind::Text, Casing::Upper).unwrap();
        assert_eq!(v.value, Value::Text("PR2A".into()));
        let v = c.coerce(&RawValue::Number(12.0), FieldKind::Text, Casing::Preserve).unwrap();
        assert_eq!(v.value, Value::Text("12".into()));
    }
}
