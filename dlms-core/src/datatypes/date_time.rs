//! COSEM date, time and date-time values
//!
//! These are carried on the wire as fixed-size octet groups (5, 4 and 12
//! bytes). Every field has a "not specified" wildcard value.

use crate::error::{DlmsError, DlmsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const WILDCARD: u8 = 0xFF;
const YEAR_WILDCARD: u16 = 0xFFFF;
const DAYLIGHT_SAVINGS_END: u8 = 0xFD;
const DAYLIGHT_SAVINGS_BEGIN: u8 = 0xFE;
const DEVIATION_WILDCARD: i16 = i16::MIN; // 0x8000

/// Clock status bits of a COSEM date-time
pub mod clock_status {
    pub const INVALID: u8 = 0x01;
    pub const DOUBTFUL: u8 = 0x02;
    pub const DIFFERENT_CLOCK_BASE: u8 = 0x04;
    pub const DAYLIGHT_SAVING_ACTIVE: u8 = 0x80;
}

/// COSEM date (5 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CosemDate {
    pub year: u16,
    pub month: u8,
    pub day_of_month: u8,
    pub day_of_week: u8,
}

impl CosemDate {
    pub const LENGTH: usize = 5;

    pub fn new(year: u16, month: u8, day_of_month: u8, day_of_week: u8) -> Self {
        Self {
            year,
            month,
            day_of_month,
            day_of_week,
        }
    }

    pub fn decode(b: &[u8]) -> DlmsResult<Self> {
        check_len(b, Self::LENGTH, "date")?;
        Ok(Self {
            year: u16::from_be_bytes([b[0], b[1]]),
            month: b[2],
            day_of_month: b[3],
            day_of_week: b[4],
        })
    }

    pub fn encode(&self) -> [u8; 5] {
        let y = self.year.to_be_bytes();
        [y[0], y[1], self.month, self.day_of_month, self.day_of_week]
    }

    pub fn set_year_wildcard(&mut self) {
        self.year = YEAR_WILDCARD;
    }

    pub fn is_year_wildcard(&self) -> bool {
        self.year == YEAR_WILDCARD
    }

    pub fn set_month_wildcard(&mut self) {
        self.month = WILDCARD;
    }

    pub fn is_month_wildcard(&self) -> bool {
        self.month == WILDCARD
    }

    pub fn set_daylight_savings_end(&mut self) {
        self.month = DAYLIGHT_SAVINGS_END;
    }

    pub fn is_daylight_savings_end(&self) -> bool {
        self.month == DAYLIGHT_SAVINGS_END
    }

    pub fn set_daylight_savings_begin(&mut self) {
        self.month = DAYLIGHT_SAVINGS_BEGIN;
    }

    pub fn is_daylight_savings_begin(&self) -> bool {
        self.month == DAYLIGHT_SAVINGS_BEGIN
    }

    pub fn set_day_of_week_wildcard(&mut self) {
        self.day_of_week = WILDCARD;
    }

    pub fn is_day_of_week_wildcard(&self) -> bool {
        self.day_of_week == WILDCARD
    }
}

/// COSEM time (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CosemTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl CosemTime {
    pub const LENGTH: usize = 4;

    pub fn new(hour: u8, minute: u8, second: u8, hundredths: u8) -> Self {
        Self {
            hour,
            minute,
            second,
            hundredths,
        }
    }

    pub fn decode(b: &[u8]) -> DlmsResult<Self> {
        check_len(b, Self::LENGTH, "time")?;
        Ok(Self::new(b[0], b[1], b[2], b[3]))
    }

    pub fn encode(&self) -> [u8; 4] {
        [self.hour, self.minute, self.second, self.hundredths]
    }

    pub fn set_hour_wildcard(&mut self) {
        self.hour = WILDCARD;
    }

    pub fn is_hour_wildcard(&self) -> bool {
        self.hour == WILDCARD
    }

    pub fn set_minute_wildcard(&mut self) {
        self.minute = WILDCARD;
    }

    pub fn is_minute_wildcard(&self) -> bool {
        self.minute == WILDCARD
    }

    pub fn set_second_wildcard(&mut self) {
        self.second = WILDCARD;
    }

    pub fn is_second_wildcard(&self) -> bool {
        self.second == WILDCARD
    }

    pub fn set_hundredths_wildcard(&mut self) {
        self.hundredths = WILDCARD;
    }

    pub fn is_hundredths_wildcard(&self) -> bool {
        self.hundredths == WILDCARD
    }
}

/// COSEM date-time (12 bytes): date, time, deviation in minutes, clock status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CosemDateTime {
    pub date: CosemDate,
    pub time: CosemTime,
    pub deviation: i16,
    pub clock_status: u8,
}

impl CosemDateTime {
    pub const LENGTH: usize = 12;

    pub fn new(date: CosemDate, time: CosemTime, deviation: i16, clock_status: u8) -> Self {
        Self {
            date,
            time,
            deviation,
            clock_status,
        }
    }

    pub fn decode(b: &[u8]) -> DlmsResult<Self> {
        check_len(b, Self::LENGTH, "date-time")?;
        Ok(Self {
            date: CosemDate::decode(&b[0..5])?,
            time: CosemTime::decode(&b[5..9])?,
            deviation: i16::from_be_bytes([b[9], b[10]]),
            clock_status: b[11],
        })
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..5].copy_from_slice(&self.date.encode());
        out[5..9].copy_from_slice(&self.time.encode());
        out[9..11].copy_from_slice(&self.deviation.to_be_bytes());
        out[11] = self.clock_status;
        out
    }

    pub fn set_deviation_wildcard(&mut self) {
        self.deviation = DEVIATION_WILDCARD;
    }

    pub fn is_deviation_wildcard(&self) -> bool {
        self.deviation == DEVIATION_WILDCARD
    }

    pub fn set_clock_status_invalid(&mut self) {
        self.clock_status |= clock_status::INVALID;
    }

    pub fn is_clock_status_invalid(&self) -> bool {
        self.clock_status & clock_status::INVALID != 0
    }

    pub fn set_clock_status_doubtful(&mut self) {
        self.clock_status |= clock_status::DOUBTFUL;
    }

    pub fn is_clock_status_doubtful(&self) -> bool {
        self.clock_status & clock_status::DOUBTFUL != 0
    }

    pub fn set_clock_status_different_clock_base(&mut self) {
        self.clock_status |= clock_status::DIFFERENT_CLOCK_BASE;
    }

    pub fn is_clock_status_different_clock_base(&self) -> bool {
        self.clock_status & clock_status::DIFFERENT_CLOCK_BASE != 0
    }

    pub fn set_clock_status_daylight_saving_active(&mut self) {
        self.clock_status |= clock_status::DAYLIGHT_SAVING_ACTIVE;
    }

    pub fn is_clock_status_daylight_saving_active(&self) -> bool {
        self.clock_status & clock_status::DAYLIGHT_SAVING_ACTIVE != 0
    }
}

impl fmt::Display for CosemDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:02}",
            self.date.year,
            self.date.month,
            self.date.day_of_month,
            self.time.hour,
            self.time.minute,
            self.time.second,
            self.time.hundredths
        )?;
        if !self.is_deviation_wildcard() {
            write!(f, " dev {}", self.deviation)?;
        }
        Ok(())
    }
}

fn check_len(b: &[u8], expected: usize, what: &str) -> DlmsResult<()> {
    if b.len() < expected {
        return Err(DlmsError::InvalidData(format!(
            "short {}: {} bytes, expected {}",
            what,
            b.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_time_bytes() {
        let bytes = [
            0x07, 0xE9, 0x03, 0x1C, 0x05, 0x0A, 0x1E, 0x00, 0x00, 0xFF, 0x88, 0x80,
        ];
        let dt = CosemDateTime::decode(&bytes).unwrap();
        assert_eq!(dt.date.year, 2025);
        assert_eq!(dt.date.month, 3);
        assert_eq!(dt.time.hour, 10);
        assert_eq!(dt.deviation, -120);
        assert!(dt.is_clock_status_daylight_saving_active());
        assert!(!dt.is_clock_status_invalid());
        assert_eq!(dt.encode(), bytes);
    }

    #[test]
    fn test_wildcards() {
        let mut date = CosemDate::new(2024, 1, 1, 1);
        date.set_year_wildcard();
        date.set_day_of_week_wildcard();
        assert!(date.is_year_wildcard());
        assert!(date.is_day_of_week_wildcard());
        assert_eq!(date.encode(), [0xFF, 0xFF, 0x01, 0x01, 0xFF]);

        date.set_daylight_savings_begin();
        assert!(date.is_daylight_savings_begin());
        assert!(!date.is_month_wildcard());

        let mut dt = CosemDateTime::new(date, CosemTime::new(0, 0, 0, 0), 0, 0);
        dt.set_deviation_wildcard();
        assert!(dt.is_deviation_wildcard());
        assert_eq!(&dt.encode()[9..11], &[0x80, 0x00]);
    }

    #[test]
    fn test_short_input() {
        assert!(CosemTime::decode(&[1, 2, 3]).is_err());
        assert!(CosemDateTime::decode(&[0; 11]).is_err());
    }
}
