//! PSBT finalizer (spec.md §4.11): assertion phase plus per-form witness/
//! scriptSig assembly.

use crate::descriptor::Resolved;
use crate::error::{DescriptorLibError, Result};
use crate::output::Output;
use crate::psbt::updater::{NO_RBF_SEQUENCE, RBF_SEQUENCE};
use crate::satisfier::{PartialSignature, Preimages, SchnorrPartialSignature};
use crate::taproot::LeafHint;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::script::Builder;
use miniscript::bitcoin::Witness;

fn witness_stack_to_witness(stack: Vec<Vec<u8>>) -> Witness {
    Witness::from_slice(&stack)
}

/// Re-derives the input's committed scriptPubKey and checks it against
/// `output`, per spec.md §4.11's assertion phase.
fn assert_scriptpubkey_matches(psbt: &Psbt, index: usize, output: &Output) -> Result<()> {
    let input = &psbt.inputs[index];
    let committed = if let Some(witness_utxo) = &input.witness_utxo {
        &witness_utxo.script_pubkey
    } else if let Some(non_witness_utxo) = &input.non_witness_utxo {
        let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
        &non_witness_utxo
            .output
            .get(vout)
            .ok_or_else(|| DescriptorLibError::psbt_shape("nonWitnessUtxo missing the spent vout"))?
            .script_pubkey
    } else {
        return Err(DescriptorLibError::psbt_shape(
            "input has neither witnessUtxo nor nonWitnessUtxo",
        ));
    };
    if committed != output.get_script_pubkey() {
        return Err(DescriptorLibError::psbt_shape(
            "committed scriptPubKey does not match this output",
        ));
    }
    Ok(())
}

fn assert_sequence_and_locktime(psbt: &Psbt, index: usize, output: &Output) -> Result<()> {
    let expected_locktime = output.get_locktime()?.unwrap_or(0);
    if psbt.unsigned_tx.lock_time.to_consensus_u32() != expected_locktime {
        return Err(DescriptorLibError::psbt_shape("PSBT locktime does not match the expected value"));
    }
    let sequence = psbt.unsigned_tx.input[index].sequence.0;
    let expected_sequence = output.get_sequence()?;
    let allowed = match expected_sequence {
        Some(seq) => vec![seq],
        None => vec![NO_RBF_SEQUENCE, RBF_SEQUENCE, 0xFFFF_FFFF],
    };
    if !allowed.contains(&sequence) {
        return Err(DescriptorLibError::psbt_shape("input nSequence is not one of the allowed values"));
    }
    if let Some(witness_script) = output.get_witness_script() {
        if psbt.inputs[index].witness_script.as_ref() != Some(witness_script) {
            return Err(DescriptorLibError::psbt_shape("stored witnessScript does not match this output"));
        }
    }
    if let Some(redeem_script) = output.get_redeem_script() {
        if psbt.inputs[index].redeem_script.as_ref() != Some(redeem_script) {
            return Err(DescriptorLibError::psbt_shape("stored redeemScript does not match this output"));
        }
    }
    Ok(())
}

pub struct FinalizeRequest<'a> {
    pub sigs: &'a [PartialSignature],
    pub preimages: &'a Preimages,
    pub tap_key_sig: Option<Vec<u8>>,
    pub tap_script_sigs: &'a [SchnorrPartialSignature],
    pub tap_leaf_hint: LeafHint<'a>,
}

/// Finalizes one PSBT input for `output` (spec.md §4.11).
pub fn finalize_input(psbt: &mut Psbt, index: usize, output: &Output, request: FinalizeRequest<'_>) -> Result<()> {
    log::debug!("finalizing PSBT input {index}");
    assert_scriptpubkey_matches(psbt, index, output)?;
    assert_sequence_and_locktime(psbt, index, output)?;

    match &output.resolved {
        Resolved::Pkh { key, .. } => {
            let sig = request
                .sigs
                .iter()
                .find(|s| s.pubkey.inner.serialize() == *key.pubkey.as_bytes())
                .ok_or_else(|| DescriptorLibError::satisfaction("no signature supplied for pkh input"))?;
            let script_sig = Builder::new()
                .push_slice(
                    miniscript::bitcoin::script::PushBytesBuf::try_from(sig.signature_der.clone())
                        .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
                )
                .push_slice(
                    miniscript::bitcoin::script::PushBytesBuf::try_from(key.pubkey.as_bytes().to_vec())
                        .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
                )
                .into_script();
            psbt.inputs[index].final_script_sig = Some(script_sig);
        }
        Resolved::Wpkh { key, .. } => {
            let sig = request
                .sigs
                .iter()
                .find(|s| s.pubkey.inner.serialize() == *key.pubkey.as_bytes())
                .ok_or_else(|| DescriptorLibError::satisfaction("no signature supplied for wpkh input"))?;
            let witness = Witness::from_slice(&[sig.signature_der.clone(), key.pubkey.as_bytes().to_vec()]);
            psbt.inputs[index].final_script_witness = Some(witness);
        }
        Resolved::ShWpkh { key, redeem_script, .. } => {
            let sig = request
                .sigs
                .iter()
                .find(|s| s.pubkey.inner.serialize() == *key.pubkey.as_bytes())
                .ok_or_else(|| DescriptorLibError::satisfaction("no signature supplied for sh(wpkh) input"))?;
            let witness = Witness::from_slice(&[sig.signature_der.clone(), key.pubkey.as_bytes().to_vec()]);
            psbt.inputs[index].final_script_witness = Some(witness);
            psbt.inputs[index].final_script_sig = Some(
                Builder::new()
                    .push_slice(
                        miniscript::bitcoin::script::PushBytesBuf::try_from(redeem_script.to_bytes())
                            .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
                    )
                    .into_script(),
            );
        }
        Resolved::Wsh { witness_script, .. } => {
            let outcome = output.get_script_satisfaction(request.sigs, request.preimages)?;
            let mut stack = outcome.script_satisfaction;
            stack.push(witness_script.to_bytes());
            psbt.inputs[index].final_script_witness = Some(witness_stack_to_witness(stack));
        }
        Resolved::ShWsh { witness_script, redeem_script, .. } => {
            let outcome = output.get_script_satisfaction(request.sigs, request.preimages)?;
            let mut stack = outcome.script_satisfaction;
            stack.push(witness_script.to_bytes());
            psbt.inputs[index].final_script_witness = Some(witness_stack_to_witness(stack));
            psbt.inputs[index].final_script_sig = Some(
                Builder::new()
                    .push_slice(
                        miniscript::bitcoin::script::PushBytesBuf::try_from(redeem_script.to_bytes())
                            .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
                    )
                    .into_script(),
            );
        }
        Resolved::Sh { redeem_script, .. } => {
            let outcome = output.get_script_satisfaction(request.sigs, request.preimages)?;
            let mut builder = Builder::new();
            for item in &outcome.script_satisfaction {
                builder = builder.push_slice(
                    miniscript::bitcoin::script::PushBytesBuf::try_from(item.clone())
                        .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
                );
            }
            builder = builder.push_slice(
                miniscript::bitcoin::script::PushBytesBuf::try_from(redeem_script.to_bytes())
                    .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?,
            );
            psbt.inputs[index].final_script_sig = Some(builder.into_script());
        }
        Resolved::Tr { tree: None, .. } => {
            let sig = request
                .tap_key_sig
                .ok_or_else(|| DescriptorLibError::satisfaction("no key-path Schnorr signature supplied"))?;
            psbt.inputs[index].final_script_witness = Some(Witness::from_slice(&[sig]));
        }
        Resolved::Tr { tree: Some(_), .. } => {
            if request.tap_script_sigs.is_empty() {
                return Err(DescriptorLibError::satisfaction("NoTapScriptSig: no script-path signatures supplied"));
            }
            let satisfaction =
                output.get_tap_script_satisfaction(request.tap_leaf_hint, request.tap_script_sigs, request.preimages)?;
            let Resolved::Tr { tree: Some(tree), .. } = &output.resolved else {
                unreachable!()
            };
            let leaf = &tree.leaves[satisfaction.leaf_index];
            let mut stack = satisfaction.stack_items;
            stack.push(leaf.leaf_script.to_bytes());
            stack.push(satisfaction.control_block.serialize());
            psbt.inputs[index].final_script_witness = Some(witness_stack_to_witness(stack));
        }
        Resolved::Addr { .. } | Resolved::Pk { .. } => {
            return Err(DescriptorLibError::psbt_shape(
                "this output form has no defined finalizer",
            ))
        }
    }

    psbt.inputs[index].partial_sigs.clear();
    psbt.inputs[index].sighash_type = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::descriptor::ConstructionOptions;
    use crate::psbt::updater::{update_input, InsertInputRequest, PrevOutputSource};
    use crate::satisfier::Preimages;
    use miniscript::bitcoin::key::PublicKey as BtcPublicKey;
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{Amount, OutPoint, TxIn};
    use std::str::FromStr;

    const KEY_A: &str = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";

    fn wpkh_output() -> Output {
        let body = format!("wpkh({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        Output::new(&with_checksum, ConstructionOptions::default()).unwrap()
    }

    fn psbt_with_one_funded_input(output: &Output) -> Psbt {
        let unsigned_tx = miniscript::bitcoin::Transaction {
            version: Version(2),
            lock_time: miniscript::bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: miniscript::bitcoin::ScriptBuf::new(),
                sequence: miniscript::bitcoin::Sequence(0xFFFF_FFFF),
                witness: Witness::default(),
            }],
            output: vec![],
        };
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).unwrap();
        let txid = psbt.unsigned_tx.input[0].previous_output.txid;
        update_input(
            &mut psbt,
            output,
            0,
            InsertInputRequest {
                vout: 0,
                source: PrevOutputSource::TxIdValue { txid, value: 10_000 },
                rbf: false,
            },
        )
        .unwrap();
        psbt
    }

    #[test]
    fn finalizes_wpkh_into_a_two_item_witness() {
        let output = wpkh_output();
        let mut psbt = psbt_with_one_funded_input(&output);
        let pubkey = BtcPublicKey::from_str(KEY_A).unwrap();
        let sigs = vec![PartialSignature { pubkey, signature_der: vec![0u8; 72] }];
        let preimages = Preimages::default();
        finalize_input(
            &mut psbt,
            0,
            &output,
            FinalizeRequest {
                sigs: &sigs,
                preimages: &preimages,
                tap_key_sig: None,
                tap_script_sigs: &[],
                tap_leaf_hint: LeafHint::None,
            },
        )
        .unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 2);
    }

    #[test]
    fn finalizing_without_a_signature_fails() {
        let output = wpkh_output();
        let mut psbt = psbt_with_one_funded_input(&output);
        let preimages = Preimages::default();
        let result = finalize_input(
            &mut psbt,
            0,
            &output,
            FinalizeRequest {
                sigs: &[],
                preimages: &preimages,
                tap_key_sig: None,
                tap_script_sigs: &[],
                tap_leaf_hint: LeafHint::None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn pk_output_has_no_finalizer() {
        let body = format!("pk({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        let output = Output::new(&with_checksum, ConstructionOptions::default()).unwrap();
        let unsigned_tx = miniscript::bitcoin::Transaction {
            version: Version(2),
            lock_time: miniscript::bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: miniscript::bitcoin::ScriptBuf::new(),
                sequence: miniscript::bitcoin::Sequence(0xFFFF_FFFF),
                witness: Witness::default(),
            }],
            output: vec![],
        };
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(miniscript::bitcoin::TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: output.get_script_pubkey().clone(),
        });
        let preimages = Preimages::default();
        let result = finalize_input(
            &mut psbt,
            0,
            &output,
            FinalizeRequest {
                sigs: &[],
                preimages: &preimages,
                tap_key_sig: None,
                tap_script_sigs: &[],
                tap_leaf_hint: LeafHint::None,
            },
        );
        assert!(result.is_err());
    }
}
