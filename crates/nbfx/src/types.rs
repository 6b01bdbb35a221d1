//! Scalar value types with a fixed wire layout.
//!
//! These carry their field-for-field binary representation and produce the
//! canonical text image used when a typed value materializes as chars.

use std::fmt;
use std::str::FromStr;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const TICKS_PER_MINUTE: i64 = 60 * TICKS_PER_SECOND;
pub const TICKS_PER_HOUR: i64 = 60 * TICKS_PER_MINUTE;
pub const TICKS_PER_DAY: i64 = 24 * TICKS_PER_HOUR;

/// Days between 0001-01-01 and 1970-01-01 in the proleptic Gregorian
/// calendar.
const UNIX_EPOCH_DAYS: i64 = 719_162;

// ---------------------------------------------------------------- Guid

/// A 16-byte GUID in its mixed-endian wire layout: the first three fields
/// are little-endian, the final eight bytes are taken as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guid([u8; 16]);

impl Guid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        let data1 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let data2 = u16::from_le_bytes([b[4], b[5]]);
        let data3 = u16::from_le_bytes([b[6], b[7]]);
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            data1, data2, data3, b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl FromStr for Guid {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5
            || parts[0].len() != 8
            || parts[1].len() != 4
            || parts[2].len() != 4
            || parts[3].len() != 4
            || parts[4].len() != 12
        {
            return Err(());
        }
        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| ())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| ())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| ())?;
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&data3.to_le_bytes());
        let tail: String = format!("{}{}", parts[3], parts[4]);
        for (i, chunk) in tail.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ())?;
            bytes[8 + i] = u8::from_str_radix(hex, 16).map_err(|_| ())?;
        }
        Ok(Self(bytes))
    }
}

// ---------------------------------------------------------------- UniqueId

/// An opaque identifier transmitted as 16 GUID bytes and presented as a
/// `urn:uuid:` URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UniqueId(pub Guid);

impl UniqueId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Guid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

impl FromStr for UniqueId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let rest = s.trim().strip_prefix("urn:uuid:").ok_or(())?;
        Ok(Self(rest.parse()?))
    }
}

// ---------------------------------------------------------------- Decimal

/// A 128-bit decimal in the OLE Automation layout used on the wire:
/// reserved u16, scale, sign, then a 96-bit magnitude split as hi32 + lo64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decimal {
    pub scale: u8,
    pub negative: bool,
    pub hi32: u32,
    pub lo64: u64,
}

/// Maximum decimal scale (digits after the point).
pub const DECIMAL_MAX_SCALE: u8 = 28;

impl Decimal {
    pub fn from_le_bytes(b: [u8; 16]) -> Self {
        Self {
            scale: b[2],
            negative: b[3] & 0x80 != 0,
            hi32: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            lo64: u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]),
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[2] = self.scale;
        b[3] = if self.negative { 0x80 } else { 0 };
        b[4..8].copy_from_slice(&self.hi32.to_le_bytes());
        b[8..16].copy_from_slice(&self.lo64.to_le_bytes());
        b
    }

    pub fn from_i64(v: i64) -> Self {
        let negative = v < 0;
        let magnitude = v.unsigned_abs();
        Self {
            scale: 0,
            negative,
            hi32: 0,
            lo64: magnitude,
        }
    }

    /// The unsigned 96-bit magnitude before scaling.
    pub fn magnitude(&self) -> u128 {
        ((self.hi32 as u128) << 64) | self.lo64 as u128
    }

    /// The exact signed integer value, or `None` when the fractional part is
    /// nonzero. Scale 28 magnitudes always fit an `i128`.
    pub fn integral_value(&self) -> Option<i128> {
        let magnitude = self.magnitude();
        let scaled = if self.scale == 0 {
            magnitude
        } else {
            let divisor = 10u128.pow(self.scale as u32);
            if magnitude % divisor != 0 {
                return None;
            }
            magnitude / divisor
        };
        let signed = scaled as i128;
        Some(if self.negative { -signed } else { signed })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.magnitude();
        if self.negative && magnitude != 0 {
            write!(f, "-")?;
        }
        let digits = magnitude.to_string();
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{digits}");
        }
        if digits.len() <= scale {
            write!(f, "0.")?;
            for _ in 0..scale - digits.len() {
                write!(f, "0")?;
            }
            write!(f, "{digits}")
        } else {
            let split = digits.len() - scale;
            write!(f, "{}.{}", &digits[..split], &digits[split..])
        }
    }
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        let (negative, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(());
        }
        if frac_part.len() > DECIMAL_MAX_SCALE as usize {
            return Err(());
        }
        let mut magnitude: u128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let digit = c.to_digit(10).ok_or(())? as u128;
            magnitude = magnitude.checked_mul(10).ok_or(())?;
            magnitude = magnitude.checked_add(digit).ok_or(())?;
        }
        if magnitude >> 96 != 0 {
            return Err(());
        }
        Ok(Self {
            scale: frac_part.len() as u8,
            negative,
            hi32: (magnitude >> 64) as u32,
            lo64: magnitude as u64,
        })
    }
}

// ---------------------------------------------------------------- DateTime

/// Time zone designator carried in the top two bits of a date-time field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    Unspecified,
    Utc,
    Local,
}

/// A point in time measured in 100 ns ticks since 0001-01-01T00:00:00,
/// with the kind packed into the top two bits as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    raw: i64,
}

const TICKS_MASK: i64 = 0x3fff_ffff_ffff_ffff;

impl DateTime {
    pub fn from_raw(raw: i64) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> i64 {
        self.raw
    }

    pub fn from_ticks(ticks: i64, kind: DateTimeKind) -> Self {
        let kind_bits = match kind {
            DateTimeKind::Unspecified => 0i64,
            DateTimeKind::Utc => 1,
            DateTimeKind::Local => 2,
        };
        Self {
            raw: (ticks & TICKS_MASK) | (kind_bits << 62),
        }
    }

    pub fn from_ymd_hms(year: i64, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Self {
        let days = day_number_from_civil(year, month, day);
        let ticks = days * TICKS_PER_DAY
            + hour as i64 * TICKS_PER_HOUR
            + minute as i64 * TICKS_PER_MINUTE
            + second as i64 * TICKS_PER_SECOND;
        Self::from_ticks(ticks, DateTimeKind::Unspecified)
    }

    pub fn ticks(&self) -> i64 {
        self.raw & TICKS_MASK
    }

    pub fn kind(&self) -> DateTimeKind {
        match (self.raw >> 62) & 0x3 {
            1 => DateTimeKind::Utc,
            2 => DateTimeKind::Local,
            _ => DateTimeKind::Unspecified,
        }
    }
}

/// Proleptic Gregorian civil date for a day count since 0001-01-01.
fn civil_from_day_number(day_number: i64) -> (i64, u32, u32) {
    let z = day_number - UNIX_EPOCH_DAYS + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u32, d as u32)
}

/// Inverse of [`civil_from_day_number`].
fn day_number_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468 + UNIX_EPOCH_DAYS
}

fn write_seven_digit_fraction(f: &mut fmt::Formatter<'_>, frac_ticks: i64) -> fmt::Result {
    let digits = format!("{frac_ticks:07}");
    write!(f, ".{}", digits.trim_end_matches('0'))
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ticks = self.ticks();
        let days = ticks.div_euclid(TICKS_PER_DAY);
        let time = ticks.rem_euclid(TICKS_PER_DAY);
        let (year, month, day) = civil_from_day_number(days);
        let hour = time / TICKS_PER_HOUR;
        let minute = time % TICKS_PER_HOUR / TICKS_PER_MINUTE;
        let second = time % TICKS_PER_MINUTE / TICKS_PER_SECOND;
        let frac = time % TICKS_PER_SECOND;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}"
        )?;
        if frac != 0 {
            write_seven_digit_fraction(f, frac)?;
        }
        if self.kind() == DateTimeKind::Utc {
            write!(f, "Z")?;
        }
        Ok(())
    }
}

impl FromStr for DateTime {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        let (s, kind) = match s.strip_suffix('Z') {
            Some(rest) => (rest, DateTimeKind::Utc),
            None => (s, DateTimeKind::Unspecified),
        };
        let (date, time) = s.split_once('T').ok_or(())?;
        let mut date_parts = date.splitn(3, '-');
        let year: i64 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let month: u32 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let day: u32 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(());
        }
        let (hms, frac) = match time.split_once('.') {
            Some((hms, frac)) => (hms, frac),
            None => (time, ""),
        };
        let mut time_parts = hms.splitn(3, ':');
        let hour: u32 = time_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let minute: u32 = time_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let second: u32 = time_parts.next().ok_or(())?.parse().map_err(|_| ())?;
        if hour > 23 || minute > 59 || second > 59 || frac.len() > 7 {
            return Err(());
        }
        let mut frac_ticks = 0i64;
        if !frac.is_empty() {
            let padded = format!("{frac:0<7}");
            frac_ticks = padded.parse().map_err(|_| ())?;
        }
        let base = Self::from_ymd_hms(year, month, day, hour, minute, second);
        Ok(Self::from_ticks(base.ticks() + frac_ticks, kind))
    }
}

// ---------------------------------------------------------------- TimeSpan

/// A signed duration in 100 ns ticks, presented as an ISO 8601 duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpan {
    pub ticks: i64,
}

impl TimeSpan {
    pub fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    pub fn from_seconds(seconds: i64) -> Self {
        Self {
            ticks: seconds * TICKS_PER_SECOND,
        }
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = self.ticks as i128;
        if t < 0 {
            write!(f, "-")?;
            t = -t;
        }
        write!(f, "P")?;
        let days = t / TICKS_PER_DAY as i128;
        let time = t % TICKS_PER_DAY as i128;
        if days != 0 {
            write!(f, "{days}D")?;
        }
        if time != 0 || days == 0 {
            write!(f, "T")?;
            let hours = time / TICKS_PER_HOUR as i128;
            let minutes = time % TICKS_PER_HOUR as i128 / TICKS_PER_MINUTE as i128;
            let seconds = time % TICKS_PER_MINUTE as i128 / TICKS_PER_SECOND as i128;
            let frac = (time % TICKS_PER_SECOND as i128) as i64;
            if hours != 0 {
                write!(f, "{hours}H")?;
            }
            if minutes != 0 {
                write!(f, "{minutes}M")?;
            }
            if seconds != 0 || frac != 0 || (hours == 0 && minutes == 0) {
                write!(f, "{seconds}")?;
                if frac != 0 {
                    write_seven_digit_fraction(f, frac)?;
                }
                write!(f, "S")?;
            }
        }
        Ok(())
    }
}

impl FromStr for TimeSpan {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        let (negative, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let rest = rest.strip_prefix('P').ok_or(())?;
        let (date_part, time_part) = match rest.split_once('T') {
            Some((d, t)) => (d, t),
            None => (rest, ""),
        };
        let mut ticks: i128 = 0;
        let mut consume = |part: &str, markers: &[(char, i128)]| -> Result<(), ()> {
            let mut number = String::new();
            let mut marker_idx = 0;
            for c in part.chars() {
                if c.is_ascii_digit() || c == '.' {
                    number.push(c);
                    continue;
                }
                let pos = markers[marker_idx..]
                    .iter()
                    .position(|(m, _)| *m == c)
                    .ok_or(())?;
                let (_, unit) = markers[marker_idx + pos];
                marker_idx += pos + 1;
                if number.is_empty() {
                    return Err(());
                }
                if let Some((int, frac)) = number.split_once('.') {
                    // Fractions are only valid on seconds.
                    if c != 'S' || frac.len() > 7 {
                        return Err(());
                    }
                    let int: i128 = int.parse().map_err(|_| ())?;
                    let padded = format!("{frac:0<7}");
                    let frac_ticks: i128 = padded.parse().map_err(|_| ())?;
                    ticks += int * unit + frac_ticks;
                } else {
                    let value: i128 = number.parse().map_err(|_| ())?;
                    ticks += value * unit;
                }
                number.clear();
            }
            if !number.is_empty() {
                return Err(());
            }
            Ok(())
        };
        consume(date_part, &[('D', TICKS_PER_DAY as i128)])?;
        consume(
            time_part,
            &[
                ('H', TICKS_PER_HOUR as i128),
                ('M', TICKS_PER_MINUTE as i128),
                ('S', TICKS_PER_SECOND as i128),
            ],
        )?;
        if negative {
            ticks = -ticks;
        }
        i64::try_from(ticks).map(TimeSpan::from_ticks).map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_display_is_mixed_endian() {
        let guid = Guid::from_bytes([
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        assert_eq!(guid.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }

    #[test]
    fn guid_parse_roundtrip() {
        let text = "00112233-4455-6677-8899-aabbccddeeff";
        let guid: Guid = text.parse().unwrap();
        assert_eq!(guid.to_string(), text);
        assert!("not-a-guid".parse::<Guid>().is_err());
    }

    #[test]
    fn unique_id_urn_form() {
        let id = UniqueId::from_bytes([0; 16]);
        assert_eq!(
            id.to_string(),
            "urn:uuid:00000000-0000-0000-0000-000000000000"
        );
        let parsed: UniqueId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn decimal_display_with_scale() {
        let d = Decimal {
            scale: 2,
            negative: false,
            hi32: 0,
            lo64: 12345,
        };
        assert_eq!(d.to_string(), "123.45");
        let d = Decimal {
            scale: 4,
            negative: true,
            hi32: 0,
            lo64: 5,
        };
        assert_eq!(d.to_string(), "-0.0005");
    }

    #[test]
    fn decimal_wire_roundtrip() {
        let d: Decimal = "-12.500".parse().unwrap();
        assert_eq!(d.scale, 3);
        assert!(d.negative);
        assert_eq!(d.magnitude(), 12_500);
        let bytes = d.to_le_bytes();
        assert_eq!(Decimal::from_le_bytes(bytes), d);
    }

    #[test]
    fn decimal_integral_value() {
        assert_eq!(Decimal::from_i64(-42).integral_value(), Some(-42));
        let with_zero_fraction: Decimal = "7.000".parse().unwrap();
        assert_eq!(with_zero_fraction.integral_value(), Some(7));
        let fractional: Decimal = "7.5".parse().unwrap();
        assert_eq!(fractional.integral_value(), None);
    }

    #[test]
    fn datetime_epoch_formats() {
        let dt = DateTime::from_ticks(0, DateTimeKind::Unspecified);
        assert_eq!(dt.to_string(), "0001-01-01T00:00:00");
    }

    #[test]
    fn datetime_known_date() {
        let dt = DateTime::from_ymd_hms(2024, 2, 29, 13, 30, 5);
        assert_eq!(dt.to_string(), "2024-02-29T13:30:05");
        let parsed: DateTime = "2024-02-29T13:30:05".parse().unwrap();
        assert_eq!(parsed.ticks(), dt.ticks());
    }

    #[test]
    fn datetime_utc_suffix_and_fraction() {
        let base = DateTime::from_ymd_hms(2001, 7, 4, 0, 0, 1);
        let dt = DateTime::from_ticks(base.ticks() + 5, DateTimeKind::Utc);
        assert_eq!(dt.to_string(), "2001-07-04T00:00:01.0000005Z");
        let parsed: DateTime = dt.to_string().parse().unwrap();
        assert_eq!(parsed.ticks(), dt.ticks());
        assert_eq!(parsed.kind(), DateTimeKind::Utc);
    }

    #[test]
    fn timespan_zero_is_pt0s() {
        assert_eq!(TimeSpan::from_ticks(0).to_string(), "PT0S");
    }

    #[test]
    fn timespan_components() {
        let ts = TimeSpan::from_ticks(
            TICKS_PER_DAY + 2 * TICKS_PER_HOUR + 3 * TICKS_PER_MINUTE + 4 * TICKS_PER_SECOND + 5,
        );
        assert_eq!(ts.to_string(), "P1DT2H3M4.0000005S");
        let parsed: TimeSpan = ts.to_string().parse().unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn timespan_negative() {
        let ts = TimeSpan::from_seconds(-90);
        assert_eq!(ts.to_string(), "-PT1M30S");
        let parsed: TimeSpan = "-PT1M30S".parse().unwrap();
        assert_eq!(parsed, ts);
    }
}
