//! PSBT updater (spec.md §4.10): populates one input's metadata from an
//! `Output` and the previous transaction evidence the caller supplies.

use crate::descriptor::Resolved;
use crate::error::{DescriptorLibError, Result, Warning};
use crate::output::Output;
use miniscript::bitcoin::absolute::LockTime;
use miniscript::bitcoin::consensus::encode::deserialize;
use miniscript::bitcoin::psbt::{Input as PsbtInput, Psbt};
use miniscript::bitcoin::taproot::TapLeafHash;
use miniscript::bitcoin::{OutPoint, Sequence, Transaction, TxOut, Txid};
use std::collections::BTreeMap;

pub const NO_RBF_SEQUENCE: u32 = 0xFFFF_FFFE;
pub const RBF_SEQUENCE: u32 = 0xFFFF_FFFD;
pub const FINAL_SEQUENCE: u32 = 0xFFFF_FFFF;

/// Evidence for the previous output being spent (spec.md §4.10 step 1-2).
pub enum PrevOutputSource {
    /// The full previous transaction, required for non-segwit inputs.
    TxHex(Vec<u8>),
    /// `(txId, value)` shortcut, segwit-only.
    TxIdValue { txid: Txid, value: u64 },
}

pub struct InsertInputRequest {
    pub vout: u32,
    pub source: PrevOutputSource,
    /// RBF sequence policy when no locktime-driven sequence applies.
    pub rbf: bool,
}

fn is_segwit(output: &Output) -> bool {
    let guess = output.guess_output();
    guess.is_wpkh || guess.is_wsh || guess.is_tr || matches!(&output.resolved, Resolved::ShWpkh { .. } | Resolved::ShWsh { .. })
}

/// Inserts one input's PSBT metadata for `output`, returning any non-fatal
/// warnings collected along the way (spec.md §7's out-of-band warning
/// channel) — the caller is expected to have already called
/// `psbt.unsigned_tx.input.push(...)`/`Psbt::from_unsigned_tx` bookkeeping,
/// mirroring the real `addInput` contract named in spec.md §6.
pub fn update_input(psbt: &mut Psbt, output: &Output, index: usize, request: InsertInputRequest) -> Result<Vec<Warning>> {
    let segwit = is_segwit(output);
    log::debug!("updating PSBT input {index} (segwit={segwit}, vout={})", request.vout);
    let mut warnings = Vec::new();

    let (resolved_value, prev_script, txid) = match &request.source {
        PrevOutputSource::TxHex(bytes) => {
            let tx: Transaction = deserialize(bytes)
                .map_err(|e| DescriptorLibError::psbt_shape(format!("invalid previous transaction bytes: {e}")))?;
            let txout = tx
                .output
                .get(request.vout as usize)
                .ok_or_else(|| DescriptorLibError::psbt_shape("vout out of range for previous transaction"))?;
            if &txout.script_pubkey != output.get_script_pubkey() {
                return Err(DescriptorLibError::psbt_shape(
                    "previous transaction's scriptPubKey does not match this output",
                ));
            }
            let txid = tx.compute_txid();
            let value = txout.value.to_sat();
            let script_pubkey = txout.script_pubkey.clone();
            psbt.inputs[index].non_witness_utxo = Some(tx);
            (value, script_pubkey, txid)
        }
        PrevOutputSource::TxIdValue { txid, value } => {
            if !segwit {
                return Err(DescriptorLibError::psbt_shape(
                    "non-segwit inputs require the full previous transaction (txHex)",
                ));
            }
            warnings.push(Warning(
                "missing txHex for a segwit input: the spent amount is taken on faith and cannot be \
                 verified against the blockchain, which may allow a fee-theft attack"
                    .to_string(),
            ));
            (*value, output.get_script_pubkey().clone(), *txid)
        }
    };

    if segwit {
        psbt.inputs[index].witness_utxo = Some(TxOut {
            value: miniscript::bitcoin::Amount::from_sat(resolved_value),
            script_pubkey: prev_script,
        });
    }

    let outpoint = OutPoint { txid, vout: request.vout };
    if let Some(tx_input) = psbt.unsigned_tx.input.get(index) {
        if tx_input.previous_output != outpoint {
            return Err(DescriptorLibError::psbt_shape(
                "unsigned_tx input's previous_output does not match the supplied vout/txid",
            ));
        }
    }

    let locktime = output.get_locktime()?;
    if let Some(lt) = locktime {
        let desired = LockTime::from_consensus(lt);
        if psbt.unsigned_tx.lock_time != LockTime::ZERO && psbt.unsigned_tx.lock_time != desired {
            return Err(DescriptorLibError::psbt_shape(
                "this output requires a locktime that conflicts with the PSBT's existing locktime",
            ));
        }
        psbt.unsigned_tx.lock_time = desired;
    }

    let sequence_value = match output.get_sequence()? {
        Some(seq) => seq,
        None if locktime.is_some() => {
            if request.rbf {
                RBF_SEQUENCE
            } else {
                NO_RBF_SEQUENCE
            }
        }
        None => FINAL_SEQUENCE,
    };
    if locktime.is_some() && sequence_value > NO_RBF_SEQUENCE {
        return Err(DescriptorLibError::psbt_shape(
            "a final (0xFFFFFFFF) sequence is incompatible with an active locktime",
        ));
    }
    if let Some(tx_input) = psbt.unsigned_tx.input.get_mut(index) {
        tx_input.sequence = Sequence(sequence_value);
    }

    populate_key_metadata(&mut psbt.inputs[index], output)?;
    Ok(warnings)
}

fn populate_key_metadata(input: &mut PsbtInput, output: &Output) -> Result<()> {
    use miniscript::bitcoin::bip32::{Fingerprint, KeySource};
    use miniscript::bitcoin::secp256k1::XOnlyPublicKey;

    match &output.resolved {
        Resolved::Pkh { key, .. } | Resolved::Wpkh { key, .. } | Resolved::ShWpkh { key, .. } => {
            if let (Some(fp), true) = (key.master_fingerprint, key.xpub.is_some()) {
                let pk = miniscript::bitcoin::key::PublicKey::from_slice(key.pubkey.as_bytes())
                    .map_err(|e| DescriptorLibError::key_expression(e.to_string()))?;
                let source: KeySource = (
                    Fingerprint::from(fp),
                    key.full_path.parse().map_err(|_| {
                        DescriptorLibError::key_expression("could not parse derivation path for PSBT metadata")
                    })?,
                );
                input.bip32_derivation.insert(pk.inner, source);
            }
        }
        Resolved::Wsh { expansion, .. } | Resolved::ShWsh { expansion, .. } | Resolved::Sh { expansion, .. } => {
            for key in expansion.keys.iter() {
                if let (Some(fp), true) = (key.master_fingerprint, key.xpub.is_some()) {
                    let pk = miniscript::bitcoin::key::PublicKey::from_slice(key.pubkey.as_bytes())
                        .map_err(|e| DescriptorLibError::key_expression(e.to_string()))?;
                    let source: KeySource = (
                        Fingerprint::from(fp),
                        key.full_path.parse().map_err(|_| {
                            DescriptorLibError::key_expression("could not parse derivation path for PSBT metadata")
                        })?,
                    );
                    input.bip32_derivation.insert(pk.inner, source);
                }
            }
        }
        Resolved::Tr { internal_key, internal_key_info, tree, .. } => {
            input.tap_internal_key = Some(*internal_key);
            let mut derivations: BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)> = BTreeMap::new();
            if let (Some(fp), true) = (internal_key_info.master_fingerprint, internal_key_info.xpub.is_some()) {
                let source: KeySource = (
                    Fingerprint::from(fp),
                    internal_key_info.full_path.parse().map_err(|_| {
                        DescriptorLibError::key_expression("could not parse derivation path for PSBT metadata")
                    })?,
                );
                derivations.insert(*internal_key, (Vec::new(), source));
            }
            if let (Some(tree), true) = (tree, output.wants_tap_leaf_script()) {
                for (key, leaf_hashes) in tree.tap_bip32_derivations() {
                    if let (Some(fp), true) = (key.master_fingerprint, key.xpub.is_some()) {
                        if let crate::key_expression::PubkeyForm::XOnly(bytes) = &key.pubkey {
                            let xonly = XOnlyPublicKey::from_slice(bytes)
                                .map_err(|e| DescriptorLibError::key_expression(e.to_string()))?;
                            let source: KeySource = (
                                Fingerprint::from(fp),
                                key.full_path.parse().map_err(|_| {
                                    DescriptorLibError::key_expression(
                                        "could not parse derivation path for PSBT metadata",
                                    )
                                })?,
                            );
                            derivations
                                .entry(xonly)
                                .and_modify(|(hashes, _)| hashes.extend(leaf_hashes.clone()))
                                .or_insert((leaf_hashes, source));
                        }
                    }
                }
                for leaf in &tree.leaves {
                    let control_block = tree.control_block(leaf)?;
                    input.tap_scripts.insert(
                        control_block,
                        (leaf.leaf_script.clone(), miniscript::bitcoin::taproot::LeafVersion::TapScript),
                    );
                }
            }
            input.tap_key_origins = derivations;
        }
        Resolved::Addr { .. } | Resolved::Pk { .. } => {}
    }

    if let Some(witness_script) = output.get_witness_script() {
        input.witness_script = Some(witness_script.clone());
    }
    if let Some(redeem_script) = output.get_redeem_script() {
        input.redeem_script = Some(redeem_script.clone());
    }
    Ok(())
}

/// Populates a PSBT output's script type metadata (spec.md §4.9
/// `updatePsbtAsOutput`) — far lighter than the input case, as only the
/// scriptPubKey and amount are consensus-relevant.
pub fn update_output(psbt: &mut Psbt, output: &Output, index: usize, value_sat: u64) -> Result<()> {
    if let Some(tx_output) = psbt.unsigned_tx.output.get_mut(index) {
        tx_output.script_pubkey = output.get_script_pubkey().clone();
        tx_output.value = miniscript::bitcoin::Amount::from_sat(value_sat);
    } else {
        return Err(DescriptorLibError::psbt_shape("output index out of range"));
    }
    if let Resolved::Tr { internal_key, .. } = &output.resolved {
        psbt.outputs[index].tap_internal_key = Some(*internal_key);
    }
    if let Some(witness_script) = output.get_witness_script() {
        psbt.outputs[index].witness_script = Some(witness_script.clone());
    }
    if let Some(redeem_script) = output.get_redeem_script() {
        psbt.outputs[index].redeem_script = Some(redeem_script.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::descriptor::ConstructionOptions;
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Amount, TxIn, Witness};

    const KEY_A: &str = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";

    fn wpkh_output() -> Output {
        let body = format!("wpkh({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        Output::new(&with_checksum, ConstructionOptions::default()).unwrap()
    }

    fn empty_psbt_with_one_input() -> Psbt {
        let unsigned_tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: miniscript::bitcoin::ScriptBuf::new(),
                sequence: Sequence(FINAL_SEQUENCE),
                witness: Witness::default(),
            }],
            output: vec![],
        };
        Psbt::from_unsigned_tx(unsigned_tx).unwrap()
    }

    #[test]
    fn segwit_shortcut_sets_witness_utxo_and_warns() {
        let output = wpkh_output();
        let mut psbt = empty_psbt_with_one_input();
        let outpoint_txid = psbt.unsigned_tx.input[0].previous_output.txid;
        let warnings = update_input(
            &mut psbt,
            &output,
            0,
            InsertInputRequest {
                vout: 0,
                source: PrevOutputSource::TxIdValue { txid: outpoint_txid, value: 50_000 },
                rbf: false,
            },
        )
        .unwrap();
        assert_eq!(warnings.len(), 1);
        let witness_utxo = psbt.inputs[0].witness_utxo.as_ref().unwrap();
        assert_eq!(witness_utxo.value, Amount::from_sat(50_000));
        assert_eq!(&witness_utxo.script_pubkey, output.get_script_pubkey());
    }

    #[test]
    fn nonsegwit_output_rejects_txid_value_shortcut() {
        let body = format!("pkh({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        let output = Output::new(&with_checksum, ConstructionOptions::default()).unwrap();
        let mut psbt = empty_psbt_with_one_input();
        let outpoint_txid = psbt.unsigned_tx.input[0].previous_output.txid;
        let result = update_input(
            &mut psbt,
            &output,
            0,
            InsertInputRequest {
                vout: 0,
                source: PrevOutputSource::TxIdValue { txid: outpoint_txid, value: 50_000 },
                rbf: false,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn mismatched_outpoint_is_rejected() {
        let output = wpkh_output();
        let mut psbt = empty_psbt_with_one_input();
        let wrong_txid = psbt.unsigned_tx.input[0].previous_output.txid;
        psbt.unsigned_tx.input[0].previous_output.vout = 7;
        let result = update_input(
            &mut psbt,
            &output,
            0,
            InsertInputRequest {
                vout: 0,
                source: PrevOutputSource::TxIdValue { txid: wrong_txid, value: 1_000 },
                rbf: false,
            },
        );
        assert!(result.is_err());
    }
}
