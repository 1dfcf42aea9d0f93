//! PSBT plumbing (spec.md §4.10/§4.11), built directly on
//! `miniscript::bitcoin::psbt::Psbt` — the "external PSBT type" collaborator
//! named in spec.md §6.

pub mod finalizer;
pub mod updater;

pub use finalizer::{finalize_input, FinalizeRequest};
pub use updater::{update_input, update_output, InsertInputRequest, PrevOutputSource};

#[cfg(test)]
mod tests {
    use crate::checksum;
    use crate::descriptor::ConstructionOptions;
    use crate::output::Output;
    use crate::psbt::{update_input, InsertInputRequest, PrevOutputSource};
    use base64::prelude::*;
    use miniscript::bitcoin::transaction::Version;
    use miniscript::bitcoin::{OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, Witness};

    #[test]
    fn psbt_survives_a_base64_round_trip() {
        let body = "wpkh(03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd)";
        let with_checksum = checksum::append(body).unwrap();
        let output = Output::new(&with_checksum, ConstructionOptions::default()).unwrap();

        let unsigned_tx = Transaction {
            version: Version(2),
            lock_time: miniscript::bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0xFFFF_FFFF),
                witness: Witness::default(),
            }],
            output: vec![],
        };
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).unwrap();
        let txid = psbt.unsigned_tx.input[0].previous_output.txid;
        update_input(
            &mut psbt,
            &output,
            0,
            InsertInputRequest {
                vout: 0,
                source: PrevOutputSource::TxIdValue { txid, value: 10_000 },
                rbf: false,
            },
        )
        .unwrap();

        let encoded = BASE64_STANDARD.encode(psbt.serialize());
        let decoded_bytes = BASE64_STANDARD.decode(encoded.as_bytes()).unwrap();
        let round_tripped = Psbt::deserialize(&decoded_bytes).unwrap();
        assert_eq!(round_tripped.inputs[0].witness_utxo, psbt.inputs[0].witness_utxo);
    }
}
