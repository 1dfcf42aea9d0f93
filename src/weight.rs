//! Weight-unit formulas for fee estimation (spec.md §6 "Weight formulas").

/// Size in bytes of a Bitcoin `CompactSize` (VarInt) encoding of `n`.
pub fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn var_slice_size(len: usize) -> u64 {
    compact_size_len(len as u64) + len as u64
}

fn vector_size(items: &[Vec<u8>]) -> u64 {
    compact_size_len(items.len() as u64) + items.iter().map(|i| var_slice_size(i.len())).sum::<u64>()
}

/// `sigSize` is the caller's assumed DER ECDSA signature length (typically
/// 72 for estimation, per spec.md §6's "zero-padded 72-byte sigs").
pub fn pkh_input_weight(sig_size: u32, segwit_tx: bool) -> u32 {
    (32 + 4 + 4 + 1 + sig_size + 34) * 4 + if segwit_tx { 1 } else { 0 }
}

pub fn wpkh_input_weight(sig_size: u32) -> u32 {
    41 * 4 + (1 + sig_size + 34)
}

pub fn sh_wpkh_input_weight(sig_size: u32) -> u32 {
    64 * 4 + (1 + sig_size + 34)
}

/// `wsh`/`sh(wsh)`: the non-witness portion scales the varint-prefixed
/// scriptSig length by 4, the witness portion counts once.
pub fn wsh_input_weight(script_sig: &[u8], witness: &[Vec<u8>]) -> u32 {
    let non_witness = 4 * (40 + var_slice_size(script_sig.len()));
    let witness_weight = vector_size(witness);
    (non_witness + witness_weight) as u32
}

pub fn tr_key_path_input_weight() -> u32 {
    41 * 4 + (1 + 65)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wpkh_weight_matches_formula() {
        assert_eq!(wpkh_input_weight(72), 41 * 4 + 1 + 72 + 34);
    }

    #[test]
    fn tr_key_path_weight_is_constant() {
        assert_eq!(tr_key_path_input_weight(), 41 * 4 + 1 + 65);
    }

    #[test]
    fn compact_size_thresholds() {
        assert_eq!(compact_size_len(0), 1);
        assert_eq!(compact_size_len(252), 1);
        assert_eq!(compact_size_len(253), 3);
        assert_eq!(compact_size_len(0x10000), 5);
    }

    #[test]
    fn wsh_weight_grows_with_witness_size() {
        let small = wsh_input_weight(&[], &[vec![0u8; 10]]);
        let large = wsh_input_weight(&[], &[vec![0u8; 200]]);
        assert!(large > small);
    }
}
