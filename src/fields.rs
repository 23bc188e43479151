//! Conversions from raw response bytes to typed values.
//!
//! All multi-byte values on the wire are big-endian. Bit sets are read
//! MSB first: index 0 of a 16-bit field is bit 15 of the big-endian word.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

const KELVIN_OFFSET: f64 = 273.15;

pub fn to_u8(byte: u8) -> u8 {
    byte
}

pub fn to_u16(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low])
}

pub fn to_s16(high: u8, low: u8) -> i16 {
    i16::from_be_bytes([high, low])
}

/// Rounds `value` to `decimals` places.
///
/// The rounded hundredths (or thousandths) are exact integers, so dividing
/// them in `f32` yields the same value as the decimal literal.
pub fn round_to(value: f64, decimals: u32) -> f32 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() as f32 / factor as f32
}

/// `raw * multiplier` rounded to two decimal places.
pub fn scaled(raw: impl Into<f64>, multiplier: f64) -> f32 {
    scaled_with_precision(raw, multiplier, 2)
}

pub fn scaled_with_precision(raw: impl Into<f64>, multiplier: f64, decimals: u32) -> f32 {
    round_to(raw.into() * multiplier, decimals)
}

/// Temperature sensors report 0.1 K units.
pub fn kelvin_to_celsius(raw: u16) -> f32 {
    round_to(f64::from(raw) * 0.1 - KELVIN_OFFSET, 2)
}

pub fn to_bits16(high: u8, low: u8) -> [bool; 16] {
    let word = to_u16(high, low);
    std::array::from_fn(|i| read_bit!(word, 15 - i))
}

/// The first `cell_count` bits of a balance word. A word carries at most 16
/// cells, larger counts are truncated.
pub fn balance_flags(high: u8, low: u8, cell_count: u8) -> Vec<bool> {
    to_bits16(high, low)
        .into_iter()
        .take(usize::from(cell_count))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtectionFlags {
    pub single_cell_overvolt: bool,
    pub single_cell_undervolt: bool,
    pub pack_overvolt: bool,
    pub pack_undervolt: bool,
    pub charge_overtemp: bool,
    pub charge_undertemp: bool,
    pub discharge_overtemp: bool,
    pub discharge_undertemp: bool,
    pub charge_overcurrent: bool,
    pub discharge_overcurrent: bool,
    pub short_circuit: bool,
    pub front_end_ic_error: bool,
    pub software_mos_lock: bool,
}

impl ProtectionFlags {
    fn entries(&self) -> [(&'static str, bool); 13] {
        [
            ("single_cell_overvolt", self.single_cell_overvolt),
            ("single_cell_undervolt", self.single_cell_undervolt),
            ("pack_overvolt", self.pack_overvolt),
            ("pack_undervolt", self.pack_undervolt),
            ("charge_overtemp", self.charge_overtemp),
            ("charge_undertemp", self.charge_undertemp),
            ("discharge_overtemp", self.discharge_overtemp),
            ("discharge_undertemp", self.discharge_undertemp),
            ("charge_overcurrent", self.charge_overcurrent),
            ("discharge_overcurrent", self.discharge_overcurrent),
            ("short_circuit", self.short_circuit),
            ("front_end_ic_error", self.front_end_ic_error),
            ("software_mos_lock", self.software_mos_lock),
        ]
    }

    /// Names of the protections currently tripped.
    pub fn active(&self) -> Vec<&'static str> {
        self.entries()
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }

    pub fn any(&self) -> bool {
        self.entries().iter().any(|(_, set)| *set)
    }
}

/// Decodes the protection word. Bits 13-15 are reserved and ignored.
pub fn protection_flags(high: u8, low: u8) -> ProtectionFlags {
    let bits = to_bits16(high, low);
    ProtectionFlags {
        single_cell_overvolt: bits[0],
        single_cell_undervolt: bits[1],
        pack_overvolt: bits[2],
        pack_undervolt: bits[3],
        charge_overtemp: bits[4],
        charge_undertemp: bits[5],
        discharge_overtemp: bits[6],
        discharge_undertemp: bits[7],
        charge_overcurrent: bits[8],
        discharge_overcurrent: bits[9],
        short_circuit: bits[10],
        front_end_ic_error: bits[11],
        software_mos_lock: bits[12],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProductionDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// Packed as `(year - 2000) << 9 | month << 5 | day`.
pub fn production_date(high: u8, low: u8) -> ProductionDate {
    let word = to_u16(high, low);
    ProductionDate {
        year: 2000 + (word >> 9),
        month: ((word >> 5) & 0x0F) as u8,
        day: (word & 0x1F) as u8,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MosfetStatus {
    pub charge: bool,
    pub discharge: bool,
}

pub fn mosfet_status(byte: u8) -> MosfetStatus {
    MosfetStatus {
        charge: read_bit!(byte, 0),
        discharge: read_bit!(byte, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        assert_eq!(to_u8(0xFE), 254);
        assert_eq!(to_u16(0x05, 0x45), 1349);
        assert_eq!(to_s16(0x01, 0x79), 377);
        assert_eq!(to_s16(0xFE, 0x87), -377);
        assert_eq!(to_u16(0xFE, 0x87), 65159);
    }

    #[test]
    fn scaling_rounds_to_two_decimals() {
        assert_eq!(scaled(1349u16, 0.01), 13.49);
        assert_eq!(scaled(-377i16, 0.01), -3.77);
        assert_eq!(scaled(10000u16, 0.01), 100.0);
        assert_eq!(scaled_with_precision(3305u16, 0.001, 3), 3.305);
    }

    #[test]
    fn temperatures_from_decikelvin() {
        assert_eq!(kelvin_to_celsius(2845), 11.35);
        assert_eq!(kelvin_to_celsius(2731), -0.05);
        assert_eq!(kelvin_to_celsius(2532), -19.95);
    }

    #[test]
    fn bits_are_msb_first() {
        let bits = to_bits16(0x80, 0x01);
        assert!(bits[0]);
        assert!(bits[15]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 2);
    }

    #[test]
    fn balance_flags_ignore_bits_past_cell_count() {
        // only bits at index >= 4 are set
        let flags = balance_flags(0x0F, 0xFF, 4);
        assert_eq!(flags, vec![false; 4]);

        let flags = balance_flags(0xA0, 0x00, 4);
        assert_eq!(flags, vec![true, false, true, false]);

        assert!(balance_flags(0xFF, 0xFF, 0).is_empty());
        assert_eq!(balance_flags(0xFF, 0xFF, 24).len(), 16);
    }

    #[test]
    fn protection_flags_ignore_reserved_bits() {
        let flags = protection_flags(0x00, 0x07);
        assert!(!flags.any());
        assert!(flags.active().is_empty());

        let flags = protection_flags(0x80, 0x20);
        assert!(flags.single_cell_overvolt);
        assert!(flags.short_circuit);
        assert_eq!(flags.active(), vec!["single_cell_overvolt", "short_circuit"]);

        let flags = protection_flags(0x00, 0x08);
        assert_eq!(flags.active(), vec!["software_mos_lock"]);
    }

    #[test]
    fn production_date_unpacks() {
        assert_eq!(
            production_date(0x2B, 0x1C),
            ProductionDate {
                year: 2021,
                month: 8,
                day: 28
            }
        );
    }

    #[test]
    fn mosfet_bits() {
        assert_eq!(
            mosfet_status(0x03),
            MosfetStatus {
                charge: true,
                discharge: true
            }
        );
        assert_eq!(
            mosfet_status(0x02),
            MosfetStatus {
                charge: false,
                discharge: true
            }
        );
    }
}
