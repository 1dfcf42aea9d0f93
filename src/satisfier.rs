//! Miniscript satisfier adapter (spec.md §4.6).
//!
//! Wraps caller-supplied ECDSA signatures and hash preimages behind
//! `miniscript::Satisfier`, so the real crate's non-malleable satisfaction
//! search does the witness-assembly work; this module only adapts inputs in
//! and stack items out.

use crate::error::{DescriptorLibError, Result};
use crate::expansion::Expansion;
use miniscript::bitcoin::hashes::{hash160, ripemd160, sha256, sha256d};
use miniscript::bitcoin::key::PublicKey;
use miniscript::bitcoin::secp256k1::XOnlyPublicKey;
use miniscript::bitcoin::taproot::TapLeafHash;
use miniscript::miniscript::satisfy::Satisfier;
use miniscript::{Legacy, Miniscript, Segwitv0, Tap};
use std::collections::HashMap;
use std::str::FromStr;

/// One partial signature supplied by the caller, keyed by the signing
/// public key (spec.md §4.6's `{pubkey, signature}` pairs).
#[derive(Debug, Clone)]
pub struct PartialSignature {
    pub pubkey: PublicKey,
    /// DER-encoded ECDSA signature, sighash byte included.
    pub signature_der: Vec<u8>,
}

/// Hash preimages the caller has collected, by digest algorithm.
#[derive(Debug, Clone, Default)]
pub struct Preimages {
    pub sha256: HashMap<sha256::Hash, [u8; 32]>,
    pub hash256: HashMap<sha256d::Hash, [u8; 32]>,
    pub ripemd160: HashMap<ripemd160::Hash, [u8; 20]>,
    pub hash160: HashMap<hash160::Hash, [u8; 20]>,
}

/// The locktime/sequence the caller wants the satisfaction to be consistent
/// with (spec.md §3 `TimeConstraints`). `None` means "pick the smallest
/// satisfaction regardless of which branch's timelock it implies".
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeConstraints {
    pub locktime: Option<u32>,
    pub sequence: Option<u32>,
}

pub struct Outcome {
    pub script_satisfaction: Vec<Vec<u8>>,
    pub locktime: Option<u32>,
    pub sequence: Option<u32>,
}

/// A syntactically valid (but not cryptographically meaningful) DER-encoded
/// ECDSA signature, used to probe which branch a miniscript would take
/// before real signatures exist (spec.md §4.6 "computing locktime/sequence
/// before signatures exist"). `lookup_ecdsa_sig` only needs a signature that
/// parses as DER; the satisfier never verifies it against a sighash.
pub(crate) fn fake_signature() -> Vec<u8> {
    let mut der = vec![0x30, 0x44, 0x02, 0x20];
    der.extend_from_slice(&[0x11; 32]);
    der.push(0x02);
    der.push(0x20);
    der.extend_from_slice(&[0x11; 32]);
    der.push(0x01); // SIGHASH_ALL
    der
}

struct AdapterSatisfier<'a> {
    sigs: &'a HashMap<[u8; 33], ecdsa_sig::Wrapped>,
    preimages: &'a Preimages,
    assume_locktime: Option<u32>,
    assume_sequence: Option<u32>,
}

/// Thin wrapper module so we can store a parsed `ecdsa::Signature` alongside
/// its original DER bytes without re-parsing on every lookup.
mod ecdsa_sig {
    use miniscript::bitcoin::ecdsa;
    #[derive(Clone)]
    pub struct Wrapped(pub ecdsa::Signature);
}

impl<'a> Satisfier<PublicKey> for AdapterSatisfier<'a> {
    fn lookup_ecdsa_sig(&self, pk: &PublicKey) -> Option<miniscript::bitcoin::ecdsa::Signature> {
        self.sigs.get(&pk.inner.serialize()).map(|w| w.0)
    }

    fn lookup_sha256(&self, h: &sha256::Hash) -> Option<[u8; 32]> {
        self.preimages.sha256.get(h).copied()
    }

    fn lookup_hash256(&self, h: &sha256d::Hash) -> Option<[u8; 32]> {
        self.preimages.hash256.get(h).copied()
    }

    fn lookup_ripemd160(&self, h: &ripemd160::Hash) -> Option<[u8; 20]> {
        self.preimages.ripemd160.get(h).copied()
    }

    fn lookup_hash160(&self, h: &hash160::Hash) -> Option<[u8; 20]> {
        self.preimages.hash160.get(h).copied()
    }

    fn check_older(&self, n: miniscript::Sequence) -> bool {
        match self.assume_sequence {
            Some(seq) => seq >= n.to_consensus_u32(),
            None => true,
        }
    }

    fn check_after(&self, n: miniscript::AbsLockTime) -> bool {
        match self.assume_locktime {
            Some(lt) => lt >= n.to_consensus_u32(),
            None => true,
        }
    }
}

fn build_sig_table(sigs: &[PartialSignature]) -> Result<HashMap<[u8; 33], ecdsa_sig::Wrapped>> {
    let mut table = HashMap::new();
    for sig in sigs {
        let parsed = miniscript::bitcoin::ecdsa::Signature::from_slice(&sig.signature_der)
            .map_err(|e| DescriptorLibError::signature(format!("invalid ECDSA signature: {e}")))?;
        table.insert(sig.pubkey.inner.serialize(), ecdsa_sig::Wrapped(parsed));
    }
    Ok(table)
}

fn run_satisfy(expansion: &Expansion, satisfier: &AdapterSatisfier, segwit: bool) -> Result<Vec<Vec<u8>>> {
    if segwit {
        let ms = Miniscript::<PublicKey, Segwitv0>::from_str(&expansion.substituted_expression)
            .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?;
        ms.satisfy(satisfier).map_err(|e| DescriptorLibError::satisfaction(e.to_string()))
    } else {
        let ms = Miniscript::<PublicKey, Legacy>::from_str(&expansion.substituted_expression)
            .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?;
        ms.satisfy(satisfier).map_err(|e| DescriptorLibError::satisfaction(e.to_string()))
    }
}

/// Collects every literal integer argument of `keyword` (e.g. `"older("`)
/// appearing in an already key-substituted miniscript body, ascending and
/// deduplicated.
fn extract_literal_thresholds(text: &str, keyword: &str) -> Vec<u32> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(keyword) {
        let after_kw = &rest[pos + keyword.len()..];
        let digits: String = after_kw.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<u32>() {
            out.push(n);
        }
        rest = &after_kw[digits.len()..];
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Finds the minimal relative (`older`) and absolute (`after`) timelock a
/// miniscript's chosen non-malleable satisfaction actually requires, given
/// a probe closure that reports whether satisfaction succeeds under an
/// assumed `(locktime, sequence)` pair. `check_older`/`check_after` are
/// monotonic in the assumed value, so the smallest candidate (from the
/// literal `older(n)`/`after(n)` thresholds present in the script) that
/// lets satisfaction succeed is the one the chosen branch requires
/// (spec.md §4.6 final paragraph, §8 property 6).
fn derive_required_timelocks(
    text: &str,
    mut try_with: impl FnMut(Option<u32>, Option<u32>) -> bool,
) -> Result<(Option<u32>, Option<u32>)> {
    if !try_with(None, None) {
        return Err(DescriptorLibError::satisfaction(
            "no satisfying witness exists for the given signatures/preimages",
        ));
    }

    let sequence = if text.contains("older(") {
        extract_literal_thresholds(text, "older(")
            .into_iter()
            .find(|&n| try_with(None, Some(n)))
    } else {
        None
    };

    let locktime = if text.contains("after(") {
        extract_literal_thresholds(text, "after(")
            .into_iter()
            .find(|&n| try_with(Some(n), None))
    } else {
        None
    };

    Ok((locktime, sequence))
}

/// Computes the `(nLockTime, nSequence)` a miniscript's satisfaction would
/// require, using fake zero signatures for every key in the expansion
/// (spec.md §4.6 final paragraph). Signatures never affect which timelock
/// branch is taken, only which keys must sign.
pub fn probe_time_constraints(
    expansion: &Expansion,
    segwit: bool,
) -> Result<(Option<u32>, Option<u32>)> {
    let fake_sigs: Vec<PartialSignature> = expansion
        .keys
        .iter()
        .filter_map(|k| match &k.pubkey {
            crate::key_expression::PubkeyForm::Compressed(b) => Some(PublicKey::from_slice(b).ok()?),
            crate::key_expression::PubkeyForm::Uncompressed(b) => {
                Some(PublicKey::from_slice(b).ok()?)
            }
            crate::key_expression::PubkeyForm::XOnly(_) => None,
        })
        .map(|pubkey| PartialSignature {
            pubkey,
            signature_der: fake_signature(),
        })
        .collect();

    match satisfy(expansion, &fake_sigs, &Preimages::default(), TimeConstraints::default(), segwit) {
        Ok(o) => Ok((o.locktime, o.sequence)),
        Err(_) => Ok((None, None)),
    }
}

/// Produces the witness/scriptSig stack items for `expansion`'s compiled
/// miniscript given the caller's signatures, preimages and optional time
/// constraints (spec.md §4.6).
pub fn satisfy(
    expansion: &Expansion,
    sigs: &[PartialSignature],
    preimages: &Preimages,
    constraints: TimeConstraints,
    segwit: bool,
) -> Result<Outcome> {
    let sig_table = build_sig_table(sigs)?;
    let satisfier = AdapterSatisfier {
        sigs: &sig_table,
        preimages,
        assume_locktime: constraints.locktime,
        assume_sequence: constraints.sequence,
    };
    let stack = run_satisfy(expansion, &satisfier, segwit)?;

    let (locktime, sequence) = derive_required_timelocks(&expansion.substituted_expression, |lt, seq| {
        let probe = AdapterSatisfier {
            sigs: &sig_table,
            preimages,
            assume_locktime: lt,
            assume_sequence: seq,
        };
        run_satisfy(expansion, &probe, segwit).is_ok()
    })?;

    Ok(Outcome {
        script_satisfaction: stack,
        locktime,
        sequence,
    })
}

/// A Schnorr (BIP340) partial signature over a specific tapscript leaf.
#[derive(Debug, Clone)]
pub struct SchnorrPartialSignature {
    pub pubkey: XOnlyPublicKey,
    /// 64-byte signature, optionally with a trailing sighash-type byte.
    pub signature: Vec<u8>,
}

struct TapSatisfier<'a> {
    sigs: &'a HashMap<[u8; 32], miniscript::bitcoin::taproot::Signature>,
    preimages: &'a Preimages,
    leaf_hash: TapLeafHash,
    assume_locktime: Option<u32>,
    assume_sequence: Option<u32>,
}

impl<'a> Satisfier<XOnlyPublicKey> for TapSatisfier<'a> {
    fn lookup_tap_leaf_script_sig(
        &self,
        pk: &XOnlyPublicKey,
        leaf_hash: &TapLeafHash,
    ) -> Option<miniscript::bitcoin::taproot::Signature> {
        if *leaf_hash != self.leaf_hash {
            return None;
        }
        self.sigs.get(&pk.serialize()).cloned()
    }

    fn lookup_sha256(&self, h: &sha256::Hash) -> Option<[u8; 32]> {
        self.preimages.sha256.get(h).copied()
    }

    fn lookup_hash256(&self, h: &sha256d::Hash) -> Option<[u8; 32]> {
        self.preimages.hash256.get(h).copied()
    }

    fn lookup_ripemd160(&self, h: &ripemd160::Hash) -> Option<[u8; 20]> {
        self.preimages.ripemd160.get(h).copied()
    }

    fn lookup_hash160(&self, h: &hash160::Hash) -> Option<[u8; 20]> {
        self.preimages.hash160.get(h).copied()
    }

    fn check_older(&self, n: miniscript::Sequence) -> bool {
        match self.assume_sequence {
            Some(seq) => seq >= n.to_consensus_u32(),
            None => true,
        }
    }

    fn check_after(&self, n: miniscript::AbsLockTime) -> bool {
        match self.assume_locktime {
            Some(lt) => lt >= n.to_consensus_u32(),
            None => true,
        }
    }
}

fn run_satisfy_tap(expansion: &Expansion, satisfier: &TapSatisfier) -> Result<Vec<Vec<u8>>> {
    let ms = Miniscript::<XOnlyPublicKey, Tap>::from_str(&expansion.substituted_expression)
        .map_err(|e| DescriptorLibError::satisfaction(e.to_string()))?;
    ms.satisfy(satisfier).map_err(|e| DescriptorLibError::satisfaction(e.to_string()))
}

/// Satisfies a single tapscript leaf's miniscript with Schnorr signatures
/// (spec.md §4.6, taproot variant used by §4.7's leaf selection).
pub fn satisfy_tap(
    expansion: &Expansion,
    leaf_hash: TapLeafHash,
    sigs: &[SchnorrPartialSignature],
    preimages: &Preimages,
    constraints: TimeConstraints,
) -> Result<Outcome> {
    let mut table = HashMap::new();
    for sig in sigs {
        let parsed = miniscript::bitcoin::taproot::Signature::from_slice(&sig.signature)
            .map_err(|e| DescriptorLibError::signature(format!("invalid Schnorr signature: {e}")))?;
        table.insert(sig.pubkey.serialize(), parsed);
    }
    let satisfier = TapSatisfier {
        sigs: &table,
        preimages,
        leaf_hash,
        assume_locktime: constraints.locktime,
        assume_sequence: constraints.sequence,
    };
    let stack = run_satisfy_tap(expansion, &satisfier)?;

    let (locktime, sequence) = derive_required_timelocks(&expansion.substituted_expression, |lt, seq| {
        let probe = TapSatisfier {
            sigs: &table,
            preimages,
            leaf_hash,
            assume_locktime: lt,
            assume_sequence: seq,
        };
        run_satisfy_tap(expansion, &probe).is_ok()
    })?;

    Ok(Outcome {
        script_satisfaction: stack,
        locktime,
        sequence,
    })
}
