//! Descriptor checksum codec (spec.md §4.1).
//!
//! Bitcoin Core's descriptor checksum: a 40-bit polynomial state fed 5 bits
//! at a time from an input alphabet of 94 symbols, with the high 2 bits of
//! each character batched base-3 into a separate feed. The checksum itself
//! is the low 8 groups of 5 bits of the final state, mapped through the
//! 32-symbol bech32 output alphabet.

use crate::error::{DescriptorLibError, Result};

const INPUT_CHARSET: &str =
    "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\";
const CHECKSUM_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

fn polymod(c: u64, val: u64) -> u64 {
    let c0 = c >> 35;
    let mut c = (c & 0x7ffffffff) << 5 ^ val;
    if c0 & 1 != 0 {
        c ^= 0xf5dee51989;
    }
    if c0 & 2 != 0 {
        c ^= 0xa9fdca3312;
    }
    if c0 & 4 != 0 {
        c ^= 0x1bab10e32d;
    }
    if c0 & 8 != 0 {
        c ^= 0x3706b1677a;
    }
    if c0 & 16 != 0 {
        c ^= 0x644d626ffd;
    }
    c
}

fn char_value(ch: char) -> Result<u64> {
    INPUT_CHARSET
        .find(ch)
        .map(|pos| pos as u64)
        .ok_or_else(|| DescriptorLibError::checksum(format!("character '{ch}' out of alphabet")))
}

/// Computes the 8-character checksum for a descriptor body (no `#...` suffix).
pub fn checksum(descriptor: &str) -> Result<String> {
    let mut c = 1u64;
    let mut cls = 0u64;
    let mut clscount = 0u64;

    for ch in descriptor.chars() {
        let pos = char_value(ch)?;
        c = polymod(c, pos & 31);
        cls = cls * 3 + (pos >> 5);
        clscount += 1;
        if clscount == 3 {
            c = polymod(c, cls);
            cls = 0;
            clscount = 0;
        }
    }
    if clscount > 0 {
        c = polymod(c, cls);
    }
    for _ in 0..8 {
        c = polymod(c, 0);
    }
    c ^= 1;

    let mut out = String::with_capacity(8);
    for j in 0..8 {
        let idx = (c >> (5 * (7 - j))) & 31;
        out.push(CHECKSUM_CHARSET.as_bytes()[idx as usize] as char);
    }
    Ok(out)
}

/// Verifies a descriptor's checksum. `descriptor_with_checksum` is the full
/// `SCRIPT#CHECKSUM` text.
pub fn verify(descriptor_with_checksum: &str) -> Result<()> {
    let (body, supplied) = split(descriptor_with_checksum)?;
    let expected = checksum(body)?;
    if expected != supplied {
        return Err(DescriptorLibError::checksum(format!(
            "checksum mismatch: expected {expected}, got {supplied}"
        )));
    }
    Ok(())
}

/// Splits `SCRIPT#CHECKSUM` into its body and checksum. Fails if there is no
/// `#`, if the checksum isn't exactly 8 characters from the output alphabet,
/// or if the body is empty.
pub fn split(descriptor_with_checksum: &str) -> Result<(&str, &str)> {
    let (body, cs) = descriptor_with_checksum
        .rsplit_once('#')
        .ok_or_else(|| DescriptorLibError::checksum("missing '#CHECKSUM' suffix"))?;
    if body.is_empty() {
        return Err(DescriptorLibError::checksum("empty descriptor body"));
    }
    if cs.len() != 8 || !cs.chars().all(|c| CHECKSUM_CHARSET.contains(c)) {
        return Err(DescriptorLibError::checksum(format!(
            "malformed checksum '{cs}'"
        )));
    }
    Ok((body, cs))
}

/// Appends `#` and the computed checksum to `descriptor`.
pub fn append(descriptor: &str) -> Result<String> {
    let cs = checksum(descriptor)?;
    Ok(format!("{descriptor}#{cs}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pk(0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798)")]
    #[case("pkh(0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798)")]
    #[case("wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd)")]
    #[case("sh(wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd))")]
    fn checksum_round_trips_across_forms(#[case] body: &str) {
        let with_checksum = append(body).unwrap();
        assert!(verify(&with_checksum).is_ok());
    }

    #[test]
    fn known_checksum_round_trips() {
        let body = "wpkh([d34db33f/49'/0'/0']tpubDCdxmvzJ5QBjTN8oCjjyT2V58AyZvA1fkmCeZRC75QMoaHcVP2m4jJcfN4SuAxqdZhufBVXDPvdfaJ0CqehzZL3c4EjPGyZcDRCoq4kaxq7/1/2/3/4/5)";
        let with_checksum = append(body).unwrap();
        assert!(verify(&with_checksum).is_ok());
    }

    #[test]
    fn flipping_checksum_char_fails() {
        let body = "wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd)";
        let mut with_checksum = append(body).unwrap();
        let last = with_checksum.pop().unwrap();
        let replacement = CHECKSUM_CHARSET
            .chars()
            .find(|&c| c != last)
            .unwrap();
        with_checksum.push(replacement);
        assert!(verify(&with_checksum).is_err());
    }

    #[test]
    fn flipping_body_char_fails() {
        let body = "wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd)";
        let with_checksum = append(body).unwrap();
        let mut chars: Vec<char> = with_checksum.chars().collect();
        // flip a digit inside the body, well before the '#'
        chars[5] = if chars[5] == '0' { '1' } else { '0' };
        let corrupted: String = chars.into_iter().collect();
        assert!(verify(&corrupted).is_err());
    }

    #[test]
    fn rejects_out_of_alphabet_character() {
        assert!(checksum("wpkh(€)").is_err());
    }

    #[test]
    fn rejects_missing_checksum_suffix() {
        assert!(verify("wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd)").is_err());
    }

    #[test]
    fn input_charset_has_94_unique_symbols() {
        assert_eq!(INPUT_CHARSET.chars().count(), 94);
        let mut sorted: Vec<char> = INPUT_CHARSET.chars().collect();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 94);
    }

    #[test]
    fn accepts_every_input_charset_character_including_quote_and_backslash() {
        for ch in INPUT_CHARSET.chars() {
            let body = format!("pk({ch})");
            assert!(checksum(&body).is_ok(), "char {ch:?} should be in the input alphabet");
        }
    }
}
