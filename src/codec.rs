//! Binary codec for device values
//!
//! Turns raw device memory into typed [`Value`]s and back. Dispatch is a
//! `match` over [`VariableType`]; variants without a rule land in a single
//! arm returning [`WatchError::NotImplemented`], so adding a type never
//! disturbs the existing ones.
//!
//! Bitfield extraction is a second pass ([`extract_bitfield`]) applied by
//! [`Variable`](crate::types::Variable), so the same decoder serves whole
//! values and bitfields. Decoding never clamps; clamping only happens on the
//! write path.

use crate::error::{Result, WatchError};
use crate::types::{Bitfield, Endianness, Value, VariableType};

const fn build_bitmasks() -> [u64; 64] {
    let mut table = [0u64; 64];
    let mut width = 1;
    while width < 64 {
        table[width] = (1u64 << width) - 1;
        width += 1;
    }
    table
}

/// All-ones masks indexed by bit width (0..=63)
pub static BITMASKS: [u64; 64] = build_bitmasks();

/// All-ones mask of `width` bits. Widths of 64 and above give `u64::MAX`.
#[inline]
pub fn bitmask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        BITMASKS[width as usize]
    }
}

/// Size of a type in bits, `None` for types without a fixed size
pub fn get_size_bits(vartype: VariableType) -> Option<u32> {
    use VariableType::*;
    match vartype {
        Sint8 | Uint8 | Float8 | Cfloat8 | Boolean => Some(8),
        Sint16 | Uint16 | Float16 | Cfloat16 => Some(16),
        Sint32 | Uint32 | Float32 | Cfloat32 => Some(32),
        Sint64 | Uint64 | Float64 | Cfloat64 => Some(64),
        Sint128 | Uint128 | Float128 | Cfloat128 => Some(128),
        Sint256 | Uint256 | Float256 | Cfloat256 => Some(256),
        Struct => None,
    }
}

fn not_implemented(vartype: VariableType) -> WatchError {
    WatchError::NotImplemented {
        type_name: vartype.to_string(),
    }
}

fn take<const N: usize>(vartype: VariableType, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| WatchError::BufferTooSmall {
            type_name: vartype.to_string(),
            needed: N,
            got: bytes.len(),
        })
}

macro_rules! read_num {
    ($ty:ty, $n:expr, $vartype:expr, $bytes:expr, $endian:expr) => {{
        let raw = take::<$n>($vartype, $bytes)?;
        match $endian {
            Endianness::Little => <$ty>::from_le_bytes(raw),
            Endianness::Big => <$ty>::from_be_bytes(raw),
        }
    }};
}

macro_rules! write_num {
    ($v:expr, $endian:expr) => {{
        match $endian {
            Endianness::Little => $v.to_le_bytes().to_vec(),
            Endianness::Big => $v.to_be_bytes().to_vec(),
        }
    }};
}

/// Decode a typed value from raw memory
pub fn decode(vartype: VariableType, bytes: &[u8], endianness: Endianness) -> Result<Value> {
    use VariableType::*;
    let e = endianness;
    Ok(match vartype {
        Sint8 => Value::Signed(read_num!(i8, 1, vartype, bytes, e) as i64),
        Sint16 => Value::Signed(read_num!(i16, 2, vartype, bytes, e) as i64),
        Sint32 => Value::Signed(read_num!(i32, 4, vartype, bytes, e) as i64),
        Sint64 => Value::Signed(read_num!(i64, 8, vartype, bytes, e)),
        Uint8 => Value::Unsigned(read_num!(u8, 1, vartype, bytes, e) as u64),
        Uint16 => Value::Unsigned(read_num!(u16, 2, vartype, bytes, e) as u64),
        Uint32 => Value::Unsigned(read_num!(u32, 4, vartype, bytes, e) as u64),
        Uint64 => Value::Unsigned(read_num!(u64, 8, vartype, bytes, e)),
        Float32 => Value::Float(read_num!(f32, 4, vartype, bytes, e) as f64),
        Float64 => Value::Float(read_num!(f64, 8, vartype, bytes, e)),
        Boolean => Value::Bool(take::<1>(vartype, bytes)?[0] != 0),
        Sint128 | Sint256 | Uint128 | Uint256 | Float8 | Float16 | Float128 | Float256
        | Cfloat8 | Cfloat16 | Cfloat32 | Cfloat64 | Cfloat128 | Cfloat256 | Struct => {
            return Err(not_implemented(vartype))
        }
    })
}

/// Encode a value for a write
///
/// Integers are rounded and saturated to the type range, booleans encode any
/// nonzero value as `1`.
pub fn encode(vartype: VariableType, value: f64, endianness: Endianness) -> Result<Vec<u8>> {
    use VariableType::*;
    let e = endianness;
    let rounded = value.round();
    Ok(match vartype {
        Sint8 => write_num!(rounded as i8, e),
        Sint16 => write_num!(rounded as i16, e),
        Sint32 => write_num!(rounded as i32, e),
        Sint64 => write_num!(rounded as i64, e),
        Uint8 => write_num!(rounded as u8, e),
        Uint16 => write_num!(rounded as u16, e),
        Uint32 => write_num!(rounded as u32, e),
        Uint64 => write_num!(rounded as u64, e),
        Float32 => write_num!(value as f32, e),
        Float64 => write_num!(value, e),
        Boolean => vec![u8::from(value != 0.0 && !value.is_nan())],
        _ => return Err(not_implemented(vartype)),
    })
}

/// Raw two's complement bits of an integer or boolean value
pub fn decode_bits(vartype: VariableType, bytes: &[u8], endianness: Endianness) -> Result<u64> {
    match decode(vartype, bytes, endianness)? {
        Value::Signed(v) => Ok(v as u64 & bitmask(get_size_bits(vartype).unwrap_or(64))),
        Value::Unsigned(v) => Ok(v),
        Value::Bool(b) => Ok(u64::from(b)),
        Value::Float(_) => Err(not_implemented(vartype)),
    }
}

/// Encode raw bits back into memory for an integer or boolean type
pub fn encode_bits(vartype: VariableType, bits: u64, endianness: Endianness) -> Result<Vec<u8>> {
    use VariableType::*;
    let e = endianness;
    Ok(match vartype {
        Sint8 | Uint8 | Boolean => vec![bits as u8],
        Sint16 | Uint16 => write_num!(bits as u16, e),
        Sint32 | Uint32 => write_num!(bits as u32, e),
        Sint64 | Uint64 => write_num!(bits, e),
        _ => return Err(not_implemented(vartype)),
    })
}

/// Isolate a bitfield from a decoded whole value
///
/// Shifts right by the bit offset and masks to the bit size. The field is
/// read as a plain bit pattern, so fields of signed types are never negative.
pub fn extract_bitfield(value: Value, vartype: VariableType, bitfield: Bitfield) -> Value {
    let bits = match value {
        Value::Signed(v) => v as u64,
        Value::Unsigned(v) => v,
        Value::Bool(b) => u64::from(b),
        Value::Float(_) => return value,
    };
    let field = (bits >> bitfield.offset) & bitmask(bitfield.size);
    if vartype == VariableType::Boolean {
        Value::Bool(field != 0)
    } else if vartype.is_signed() {
        Value::Signed(field as i64)
    } else {
        Value::Unsigned(field)
    }
}

/// Saturate a value to what a bitfield can hold and return its raw bits
///
/// The range is `0..=mask` for every integer type, matching what
/// [`extract_bitfield`] reads back.
pub fn clamp_to_bitfield(value: f64, vartype: VariableType, bitfield: Bitfield) -> u64 {
    let value = if value.is_nan() { 0.0 } else { value.round() };
    let mask = bitmask(bitfield.size);
    if vartype == VariableType::Boolean {
        u64::from(value != 0.0)
    } else {
        value.clamp(0.0, mask as f64) as u64 & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENDIANS: [Endianness; 2] = [Endianness::Little, Endianness::Big];

    #[test]
    fn test_bitmask_table() {
        for width in 0..64u32 {
            let expected = if width == 0 { 0 } else { (1u64 << width) - 1 };
            assert_eq!(BITMASKS[width as usize], expected, "width {}", width);
            assert_eq!(bitmask(width), expected);
        }
        assert_eq!(bitmask(64), u64::MAX);
    }

    #[test]
    fn test_size_bits() {
        assert_eq!(get_size_bits(VariableType::Boolean), Some(8));
        assert_eq!(get_size_bits(VariableType::Cfloat256), Some(256));
        assert_eq!(get_size_bits(VariableType::Struct), None);
    }

    #[test]
    fn test_decode_integers_both_endians() {
        assert_eq!(
            decode(VariableType::Sint16, &[0xFE, 0xFF], Endianness::Little).unwrap(),
            Value::Signed(-2)
        );
        assert_eq!(
            decode(VariableType::Sint16, &[0xFF, 0xFE], Endianness::Big).unwrap(),
            Value::Signed(-2)
        );
        assert_eq!(
            decode(VariableType::Uint32, &[0x12, 0x34, 0x56, 0x78], Endianness::Big).unwrap(),
            Value::Unsigned(0x1234_5678)
        );
    }

    #[test]
    fn test_decode_u64_is_exact() {
        let v = u64::MAX - 1;
        assert_eq!(
            decode(VariableType::Uint64, &v.to_le_bytes(), Endianness::Little).unwrap(),
            Value::Unsigned(v)
        );
    }

    #[test]
    fn test_decode_boolean_is_nonzero_first_byte() {
        assert_eq!(
            decode(VariableType::Boolean, &[0x00, 0xFF], Endianness::Little).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            decode(VariableType::Boolean, &[0x80], Endianness::Big).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_unimplemented_types_fail() {
        for t in [
            VariableType::Sint128,
            VariableType::Uint256,
            VariableType::Float16,
            VariableType::Cfloat32,
            VariableType::Struct,
        ] {
            let err = decode(t, &[0u8; 32], Endianness::Little).unwrap_err();
            match err {
                WatchError::NotImplemented { type_name } => assert_eq!(type_name, t.name()),
                other => panic!("unexpected error {:?}", other),
            }
            assert!(encode(t, 1.0, Endianness::Little).is_err());
        }
    }

    #[test]
    fn test_short_buffer() {
        let err = decode(VariableType::Uint32, &[1, 2], Endianness::Little).unwrap_err();
        assert!(matches!(err, WatchError::BufferTooSmall { needed: 4, got: 2, .. }));
    }

    #[test]
    fn test_encode_saturates_integers() {
        assert_eq!(encode(VariableType::Uint8, 300.0, Endianness::Little).unwrap(), vec![255]);
        assert_eq!(encode(VariableType::Sint8, -300.0, Endianness::Little).unwrap(), vec![0x80]);
        assert_eq!(encode(VariableType::Uint16, 1.6, Endianness::Big).unwrap(), vec![0, 2]);
        assert_eq!(encode(VariableType::Boolean, -3.0, Endianness::Little).unwrap(), vec![1]);
    }

    #[test]
    fn test_bitfield_isolates_bits() {
        let field = Bitfield { offset: 15, size: 21 };
        let all_set = extract_bitfield(Value::Unsigned(u64::MAX), VariableType::Uint64, field);
        assert_eq!(all_set, Value::Unsigned((1 << 21) - 1));

        let only_field = ((1u64 << 21) - 1) << 15;
        let value = 0x1_5A5A & ((1 << 21) - 1);
        let surrounded = extract_bitfield(
            Value::Unsigned(!only_field | (value << 15)),
            VariableType::Uint64,
            field,
        );
        assert_eq!(surrounded, Value::Unsigned(value));

        let clear = extract_bitfield(Value::Unsigned(value << 15), VariableType::Uint64, field);
        assert_eq!(clear, Value::Unsigned(value));
    }

    #[test]
    fn test_signed_bitfield_is_shift_then_mask() {
        let field = Bitfield { offset: 4, size: 3 };
        let v = extract_bitfield(Value::Signed(0b0111_0000), VariableType::Sint8, field);
        assert_eq!(v, Value::Signed(7));
        let v = extract_bitfield(Value::Signed(0b0011_0000), VariableType::Sint8, field);
        assert_eq!(v, Value::Signed(3));
        // 0xF0 decoded as sint8 is -16, its top nibble still reads as 15
        let field = Bitfield { offset: 4, size: 4 };
        let v = extract_bitfield(Value::Signed(-16), VariableType::Sint8, field);
        assert_eq!(v, Value::Signed(15));
    }

    #[test]
    fn test_clamp_to_bitfield() {
        let field = Bitfield { offset: 0, size: 4 };
        assert_eq!(clamp_to_bitfield(100.0, VariableType::Uint8, field), 15);
        assert_eq!(clamp_to_bitfield(-100.0, VariableType::Sint8, field), 0);
        assert_eq!(clamp_to_bitfield(100.0, VariableType::Sint8, field), 15);
        assert_eq!(clamp_to_bitfield(7.0, VariableType::Sint8, field), 7);
        assert_eq!(clamp_to_bitfield(f64::NAN, VariableType::Uint8, field), 0);
    }

    proptest! {
        #[test]
        fn prop_i32_round_trip(v in any::<i32>()) {
            for e in ENDIANS {
                let bytes = encode(VariableType::Sint32, v as f64, e).unwrap();
                prop_assert_eq!(decode(VariableType::Sint32, &bytes, e).unwrap(), Value::Signed(v as i64));
            }
        }

        #[test]
        fn prop_u16_round_trip(v in any::<u16>()) {
            for e in ENDIANS {
                let bytes = encode(VariableType::Uint16, v as f64, e).unwrap();
                prop_assert_eq!(decode(VariableType::Uint16, &bytes, e).unwrap(), Value::Unsigned(v as u64));
            }
        }

        #[test]
        fn prop_u64_reference_bytes(v in any::<u64>()) {
            prop_assert_eq!(decode(VariableType::Uint64, &v.to_le_bytes(), Endianness::Little).unwrap(), Value::Unsigned(v));
            prop_assert_eq!(decode(VariableType::Uint64, &v.to_be_bytes(), Endianness::Big).unwrap(), Value::Unsigned(v));
        }

        #[test]
        fn prop_i64_reference_bytes(v in any::<i64>()) {
            prop_assert_eq!(decode(VariableType::Sint64, &v.to_le_bytes(), Endianness::Little).unwrap(), Value::Signed(v));
            prop_assert_eq!(decode(VariableType::Sint64, &v.to_be_bytes(), Endianness::Big).unwrap(), Value::Signed(v));
        }

        #[test]
        fn prop_f32_round_trip(v in -1.0e30f32..1.0e30f32) {
            for e in ENDIANS {
                let bytes = encode(VariableType::Float32, v as f64, e).unwrap();
                prop_assert_eq!(decode(VariableType::Float32, &bytes, e).unwrap(), Value::Float(v as f64));
            }
        }

        #[test]
        fn prop_f64_round_trip(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
            for e in ENDIANS {
                let bytes = encode(VariableType::Float64, v, e).unwrap();
                prop_assert_eq!(decode(VariableType::Float64, &bytes, e).unwrap(), Value::Float(v));
            }
        }

        #[test]
        fn prop_bitfield_ignores_surrounding_bits(field_value in 0u64..(1 << 21), noise in any::<u64>()) {
            let field = Bitfield { offset: 15, size: 21 };
            let mask = ((1u64 << 21) - 1) << 15;
            let raw = (noise & !mask) | (field_value << 15);
            prop_assert_eq!(
                extract_bitfield(Value::Unsigned(raw), VariableType::Uint64, field),
                Value::Unsigned(field_value)
            );
        }
    }
}
