//! Output object (spec.md §4.9): the public, immutable-after-construction
//! facade over a resolved descriptor.

use crate::descriptor::{self, ConstructionOptions, Resolved, SpendPathHint};
use crate::error::{DescriptorLibError, Result};
use crate::satisfier::{self, Outcome, PartialSignature, Preimages, SchnorrPartialSignature, TimeConstraints};
use crate::taproot::{LeafHint, LeafSatisfaction};
use crate::weight;
use miniscript::bitcoin::address::Address;
use miniscript::bitcoin::ScriptBuf;
use std::cell::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputKindGuess {
    pub is_pkh: bool,
    pub is_wpkh: bool,
    pub is_sh: bool,
    pub is_wsh: bool,
    pub is_tr: bool,
}

/// A fully resolved descriptor output. Pure queries are memoized behind
/// `OnceCell`, per spec.md §4.9 ("results of pure queries must be
/// memoized... two repeated calls with equal inputs must return identical
/// outputs") — construction inputs are fixed, so a single cache slot per
/// query suffices.
pub struct Output {
    pub(crate) resolved: Resolved,
    pub(crate) network: crate::network::Network,
    pub(crate) taproot_spend_path: Option<SpendPathHint>,
    sh_address_assumes_segwit: bool,
    time_constraints: OnceCell<(Option<u32>, Option<u32>)>,
}

impl Output {
    pub fn new(descriptor_with_checksum: &str, options: ConstructionOptions) -> Result<Output> {
        let resolved = descriptor::resolve(descriptor_with_checksum, &options)?;
        Ok(Output {
            resolved,
            network: options.network,
            taproot_spend_path: options.taproot_spend_path,
            sh_address_assumes_segwit: options.sh_address_assumes_segwit,
            time_constraints: OnceCell::new(),
        })
    }

    pub fn get_script_pubkey(&self) -> &ScriptBuf {
        match &self.resolved {
            Resolved::Addr { script_pubkey }
            | Resolved::Pk { script_pubkey, .. }
            | Resolved::Pkh { script_pubkey, .. }
            | Resolved::Wpkh { script_pubkey, .. }
            | Resolved::ShWpkh { script_pubkey, .. }
            | Resolved::Wsh { script_pubkey, .. }
            | Resolved::ShWsh { script_pubkey, .. }
            | Resolved::Sh { script_pubkey, .. }
            | Resolved::Tr { script_pubkey, .. } => script_pubkey,
        }
    }

    pub fn get_address(&self) -> Result<Address> {
        if matches!(self.resolved, Resolved::Pk { .. }) {
            return Err(DescriptorLibError::descriptor_parse("pk(...) outputs have no address"));
        }
        Address::from_script(self.get_script_pubkey(), self.network.bitcoin_network())
            .map_err(|e| DescriptorLibError::descriptor_parse(format!("cannot derive address: {e}")))
    }

    pub fn get_witness_script(&self) -> Option<&ScriptBuf> {
        match &self.resolved {
            Resolved::Wsh { witness_script, .. } => Some(witness_script),
            Resolved::ShWsh { witness_script, .. } => Some(witness_script),
            _ => None,
        }
    }

    pub fn get_redeem_script(&self) -> Option<&ScriptBuf> {
        match &self.resolved {
            Resolved::ShWpkh { redeem_script, .. } => Some(redeem_script),
            Resolved::ShWsh { redeem_script, .. } => Some(redeem_script),
            Resolved::Sh { redeem_script, .. } => Some(redeem_script),
            _ => None,
        }
    }

    fn is_segwit_context(&self) -> bool {
        match &self.resolved {
            Resolved::Wpkh { .. } | Resolved::ShWpkh { .. } | Resolved::Wsh { .. } | Resolved::ShWsh { .. } => true,
            Resolved::Addr { script_pubkey } => {
                script_pubkey.is_p2wpkh()
                    || script_pubkey.is_p2wsh()
                    || (script_pubkey.is_p2sh() && self.sh_address_assumes_segwit)
            }
            _ => false,
        }
    }

    fn miniscript_expansion(&self) -> Option<&crate::expansion::Expansion> {
        match &self.resolved {
            Resolved::Wsh { expansion, .. } => Some(expansion),
            Resolved::ShWsh { expansion, .. } => Some(expansion),
            Resolved::Sh { expansion, .. } => Some(expansion),
            _ => None,
        }
    }

    fn time_constraints(&self) -> Result<(Option<u32>, Option<u32>)> {
        if let Some(cached) = self.time_constraints.get() {
            return Ok(*cached);
        }
        let computed = match self.miniscript_expansion() {
            Some(expansion) => satisfier::probe_time_constraints(expansion, self.is_segwit_context())?,
            None => (None, None),
        };
        let _ = self.time_constraints.set(computed);
        Ok(computed)
    }

    pub fn get_locktime(&self) -> Result<Option<u32>> {
        Ok(self.time_constraints()?.0)
    }

    pub fn get_sequence(&self) -> Result<Option<u32>> {
        Ok(self.time_constraints()?.1)
    }

    /// Builds the legacy/segwit miniscript satisfaction (spec.md §4.6,
    /// reached through the §4.9 `getScriptSatisfaction` contract).
    pub fn get_script_satisfaction(
        &self,
        sigs: &[PartialSignature],
        preimages: &Preimages,
    ) -> Result<Outcome> {
        let expansion = self
            .miniscript_expansion()
            .ok_or_else(|| DescriptorLibError::satisfaction("this output has no miniscript to satisfy"))?;
        let (locktime, sequence) = self.time_constraints()?;
        satisfier::satisfy(
            expansion,
            sigs,
            preimages,
            TimeConstraints { locktime, sequence },
            self.is_segwit_context(),
        )
    }

    /// Taproot script-path satisfaction via §4.7 leaf selection.
    pub fn get_tap_script_satisfaction(
        &self,
        hint: LeafHint<'_>,
        sigs: &[SchnorrPartialSignature],
        preimages: &Preimages,
    ) -> Result<LeafSatisfaction> {
        match &self.resolved {
            Resolved::Tr { tree: Some(tree), .. } => crate::taproot::select_and_satisfy(tree, hint, sigs, preimages),
            Resolved::Tr { tree: None, .. } => Err(DescriptorLibError::taproot(
                "this taproot output is key-path only; there is no script tree to satisfy",
            )),
            _ => Err(DescriptorLibError::taproot("this output is not a taproot output")),
        }
    }

    pub fn guess_output(&self) -> OutputKindGuess {
        let mut guess = OutputKindGuess {
            is_pkh: false,
            is_wpkh: false,
            is_sh: false,
            is_wsh: false,
            is_tr: false,
        };
        match &self.resolved {
            Resolved::Pkh { .. } => guess.is_pkh = true,
            Resolved::Wpkh { .. } => guess.is_wpkh = true,
            Resolved::ShWpkh { .. } | Resolved::Sh { .. } => guess.is_sh = true,
            Resolved::Wsh { .. } => guess.is_wsh = true,
            Resolved::ShWsh { .. } => {
                guess.is_sh = true;
                guess.is_wsh = true;
            }
            Resolved::Tr { .. } => guess.is_tr = true,
            Resolved::Addr { script_pubkey } => {
                guess.is_pkh = script_pubkey.is_p2pkh();
                guess.is_sh = script_pubkey.is_p2sh();
                guess.is_wpkh = script_pubkey.is_p2wpkh();
                guess.is_wsh = script_pubkey.is_p2wsh();
                guess.is_tr = script_pubkey.is_p2tr();
            }
            Resolved::Pk { .. } => {}
        }
        guess
    }

    /// Spend-path permission for PSBT metadata (spec.md §4.8 `taprootSpendPath`).
    pub fn wants_tap_leaf_script(&self) -> bool {
        !matches!(self.taproot_spend_path, Some(SpendPathHint::Key))
    }

    pub fn wants_key_path_sig(&self) -> bool {
        !matches!(self.taproot_spend_path, Some(SpendPathHint::Script))
    }

    /// Input-side weight contribution (spec.md §6), using a zero-padded
    /// 72-byte signature for estimation.
    pub fn input_weight(&self, segwit_tx: bool) -> Result<u32> {
        const ESTIMATION_SIG_SIZE: u32 = 72;
        Ok(match &self.resolved {
            Resolved::Pkh { .. } => weight::pkh_input_weight(ESTIMATION_SIG_SIZE, segwit_tx),
            Resolved::Wpkh { .. } => weight::wpkh_input_weight(ESTIMATION_SIG_SIZE),
            Resolved::ShWpkh { .. } => weight::sh_wpkh_input_weight(ESTIMATION_SIG_SIZE),
            Resolved::Wsh { .. } | Resolved::ShWsh { .. } | Resolved::Sh { .. } => {
                let preimages = Preimages::default();
                let fake_sigs = self.fake_signatures_for_estimation();
                let outcome = self.get_script_satisfaction(&fake_sigs, &preimages)?;
                let script_sig = self.get_redeem_script().map(|s| s.as_bytes()).unwrap_or(&[]);
                weight::wsh_input_weight(script_sig, &outcome.script_satisfaction)
            }
            Resolved::Tr { tree: None, .. } => weight::tr_key_path_input_weight(),
            Resolved::Tr { tree: Some(_), .. } => {
                return Err(DescriptorLibError::satisfaction(
                    "input weight for a taproot script-path spend depends on the chosen leaf",
                ))
            }
            Resolved::Addr { script_pubkey } if script_pubkey.is_p2pkh() => {
                weight::pkh_input_weight(ESTIMATION_SIG_SIZE, segwit_tx)
            }
            Resolved::Addr { script_pubkey } if script_pubkey.is_p2wpkh() => {
                weight::wpkh_input_weight(ESTIMATION_SIG_SIZE)
            }
            Resolved::Addr { script_pubkey } if script_pubkey.is_p2tr() => weight::tr_key_path_input_weight(),
            Resolved::Addr { script_pubkey } if script_pubkey.is_p2sh() && self.sh_address_assumes_segwit => {
                weight::sh_wpkh_input_weight(ESTIMATION_SIG_SIZE)
            }
            Resolved::Addr { .. } | Resolved::Pk { .. } => {
                return Err(DescriptorLibError::satisfaction(
                    "this output form has no defined input-weight formula (no redeem/witness script is known)",
                ))
            }
        })
    }

    fn fake_signatures_for_estimation(&self) -> Vec<PartialSignature> {
        self.miniscript_expansion()
            .map(|expansion| {
                expansion
                    .keys
                    .iter()
                    .filter_map(|k| {
                        miniscript::bitcoin::key::PublicKey::from_slice(k.pubkey.as_bytes())
                            .ok()
                            .map(|pubkey| PartialSignature {
                                pubkey,
                                signature_der: satisfier::fake_signature(),
                            })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn output_weight(&self) -> u32 {
        let script_len = self.get_script_pubkey().len();
        (8 + weight::compact_size_len(script_len as u64) + script_len as u64) as u32 * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;

    const KEY_A: &str = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";

    fn make_wpkh_output() -> Output {
        let body = format!("wpkh({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        Output::new(&with_checksum, ConstructionOptions::default()).unwrap()
    }

    #[test]
    fn wpkh_guess_is_exclusive() {
        let output = make_wpkh_output();
        let guess = output.guess_output();
        assert!(guess.is_wpkh);
        assert!(!guess.is_pkh && !guess.is_sh && !guess.is_wsh && !guess.is_tr);
    }

    #[test]
    fn wpkh_has_no_witness_or_redeem_script() {
        let output = make_wpkh_output();
        assert!(output.get_witness_script().is_none());
        assert!(output.get_redeem_script().is_none());
    }

    #[test]
    fn wpkh_input_weight_is_constant_formula() {
        let output = make_wpkh_output();
        assert_eq!(output.input_weight(true).unwrap(), weight::wpkh_input_weight(72));
    }

    #[test]
    fn pk_output_has_no_address() {
        let body = format!("pk({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        let output = Output::new(&with_checksum, ConstructionOptions::default()).unwrap();
        assert!(output.get_address().is_err());
    }

    #[test]
    fn memoized_locktime_is_stable_across_calls() {
        let output = make_wpkh_output();
        let first = output.get_locktime().unwrap();
        let second = output.get_locktime().unwrap();
        assert_eq!(first, second);
    }

    fn make_sh_addr_output(sh_address_assumes_segwit: bool) -> Output {
        let body = "addr(3P14159f73E4gFr7JterCCQh9QjiTjiZrG)";
        let with_checksum = checksum::append(body).unwrap();
        let options = ConstructionOptions {
            sh_address_assumes_segwit,
            ..ConstructionOptions::default()
        };
        Output::new(&with_checksum, options).unwrap()
    }

    #[test]
    fn sh_address_defaults_to_legacy_input_weight() {
        let output = make_sh_addr_output(false);
        assert!(output.guess_output().is_sh);
        assert!(output.input_weight(true).is_err());
    }

    #[test]
    fn sh_address_assumes_segwit_flag_enables_weight_estimation() {
        let output = make_sh_addr_output(true);
        assert!(output.guess_output().is_sh);
        assert_eq!(output.input_weight(true).unwrap(), weight::sh_wpkh_input_weight(72));
    }
}
