use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KIBI: u64 = 1024;
const MEBI: u64 = KIBI * KIBI;
const GIBI: u64 = MEBI * KIBI;

/// A byte count parsed from the lenient human form accepted for memory and
/// disk sizes: `\d+(\.\d+)?[KMG]i?B?`, case-insensitive, with a decimal part
/// only allowed in front of a K/M/G scale. `"3M"`, `"2.5GiB"`, `"1024"` and
/// `"512K"` are all valid; `"abc"`, `"3Q"` and `""` are not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySize {
    bytes: u64,
}

impl MemorySize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn in_bytes(self) -> u64 {
        self.bytes
    }

    // integer division to floor
    pub fn in_kilobytes(self) -> u64 {
        self.bytes / KIBI
    }

    pub fn in_megabytes(self) -> u64 {
        self.bytes / MEBI
    }

    pub fn in_gigabytes(self) -> u64 {
        self.bytes / GIBI
    }

    pub fn human_readable(self) -> String {
        for (unit, suffix) in [(GIBI, "GiB"), (MEBI, "MiB"), (KIBI, "KiB")] {
            if self.bytes >= unit {
                return format!("{:.1}{}", self.bytes as f64 / unit as f64, suffix);
            }
        }
        format!("{}B", self.bytes)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human_readable())
    }
}

impl FromStr for MemorySize {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        in_bytes(value)
            .map(MemorySize::from_bytes)
            .ok_or_else(|| Error::InvalidMemorySize {
                value: value.to_string(),
            })
    }
}

fn in_bytes(value: &str) -> Option<u64> {
    let s = value.trim().as_bytes();
    if s.is_empty() {
        return None;
    }

    let mut i = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        i += 1;
    }
    if i == 0 {
        return None;
    }
    let whole: u128 = std::str::from_utf8(&s[..i]).ok()?.parse().ok()?;

    let mut frac_digits: &[u8] = &[];
    if i < s.len() && s[i] == b'.' {
        let start = i + 1;
        let mut j = start;
        while j < s.len() && s[j].is_ascii_digit() {
            j += 1;
        }
        if j == start {
            return None;
        }
        frac_digits = &s[start..j];
        i = j;
    }

    let mut scale: u128 = 1;
    let mut scaled = false;
    if i < s.len() {
        match s[i].to_ascii_lowercase() {
            b'k' => (scale, scaled) = (KIBI as u128, true),
            b'm' => (scale, scaled) = (MEBI as u128, true),
            b'g' => (scale, scaled) = (GIBI as u128, true),
            b'b' => {}
            _ => return None,
        }
        i += 1;
        if scaled && i < s.len() {
            if s[i].to_ascii_lowercase() == b'i' {
                // "Ki" must be completed by a B
                i += 1;
                if i >= s.len() || s[i].to_ascii_lowercase() != b'b' {
                    return None;
                }
                i += 1;
            } else if s[i].to_ascii_lowercase() == b'b' {
                i += 1;
            }
        }
    }

    // a decimal part is only meaningful in front of a K/M/G scale
    if !frac_digits.is_empty() && !scaled {
        return None;
    }
    if i != s.len() {
        return None;
    }

    let mantissa: u128 = if frac_digits.is_empty() {
        0
    } else {
        std::str::from_utf8(frac_digits).ok()?.parse().ok()?
    };
    let denom = 10u128.checked_pow(frac_digits.len() as u32)?;

    let total = whole
        .checked_mul(scale)?
        .checked_add(mantissa.checked_mul(scale)? / denom)?;
    u64::try_from(total).ok()
}
