//! Number/ASM codec (spec.md §4.3).
//!
//! Encodes a signed integer as the minimal little-endian Bitcoin Script push,
//! sign bit in the high bit of the final byte. `0` is special-cased to the
//! symbolic `OP_0` mnemonic rather than an empty byte string, so that it
//! round-trips correctly through ASM text.

use crate::error::{DescriptorLibError, Result};

/// Bitcoin Script numbers are bounded to what fits safely in an `i64` and,
/// by consensus, to 4-byte pushes in most contexts; this codec only refuses
/// values that don't fit a JS-style "safe integer" range, matching spec.md's
/// `NumberError` ("non-safe-integer inputs").
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Encodes `n` as a minimal little-endian push. `0` encodes to the token
/// `"OP_0"` rather than an empty byte vector.
pub fn encode_asm_token(n: i64) -> Result<String> {
    if n.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
        return Err(DescriptorLibError::number(format!(
            "{n} is not a safe integer"
        )));
    }
    if n == 0 {
        return Ok("OP_0".to_string());
    }
    Ok(hex::encode(encode_minimal(n)))
}

/// Encodes `n` as the minimal little-endian byte push (without the `OP_0`
/// special case — `0` encodes to an empty vector here, matching Script
/// semantics for an actual push of the number zero as data).
pub fn encode_minimal(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let neg = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = *out.last().unwrap();
    if last & 0x80 != 0 {
        out.push(if neg { 0x80 } else { 0x00 });
    } else if neg {
        *out.last_mut().unwrap() |= 0x80;
    }
    out
}

/// Decodes a minimal little-endian Script number push.
pub fn decode_minimal(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(DescriptorLibError::number("push too large for a Script number"));
    }
    let mut result: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        result |= (b as i64) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (bytes.len() - 1)));
        result = -result;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_op_0() {
        assert_eq!(encode_asm_token(0).unwrap(), "OP_0");
        assert!(encode_minimal(0).is_empty());
    }

    #[test]
    fn round_trips_positive_and_negative() {
        for n in [1i64, 127, 128, 255, 256, 32767, 32768, -1, -127, -128, -32768] {
            let encoded = encode_minimal(n);
            let decoded = decode_minimal(&encoded).unwrap();
            assert_eq!(decoded, n, "round trip failed for {n}");
        }
    }

    #[test]
    fn rejects_unsafe_integer() {
        assert!(encode_asm_token(i64::MAX).is_err());
    }

    #[test]
    fn minimal_push_has_no_redundant_bytes() {
        // 5 fits in a single byte
        assert_eq!(encode_minimal(5), vec![5]);
        // 5 as CSV sequence still a single push
        assert_eq!(encode_minimal(255), vec![0xff, 0x00]);
    }
}
