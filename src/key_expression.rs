//! Key-expression parsing and `KeyInfo` (spec.md §3 "KeyInfo", §4.4).
//!
//! By the time a key expression reaches this module it is fully concrete:
//! range wildcards and multipath tuples have already been substituted by the
//! descriptor expander (spec.md §4.8), in lockstep, for the chosen
//! `(index, change)`. This module never sees `*` or `<a;b;...>`.

use crate::error::{DescriptorLibError, Result};
use crate::grammar::{self, Origin};
use crate::network::Network;
use miniscript::bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use miniscript::bitcoin::key::PublicKey;
use miniscript::bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use miniscript::bitcoin::PrivateKey;
use std::str::FromStr;

/// The resolved public key, in whichever form the script family requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubkeyForm {
    Compressed([u8; 33]),
    Uncompressed([u8; 65]),
    XOnly([u8; 32]),
}

impl PubkeyForm {
    /// Serialized bytes for hashing (HASH160/HASH256 of the pubkey).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PubkeyForm::Compressed(b) => b.as_slice(),
            PubkeyForm::Uncompressed(b) => b.as_slice(),
            PubkeyForm::XOnly(b) => b.as_slice(),
        }
    }

    pub fn to_compressed_or_xonly_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

/// A fully (or partially, pre-derivation) resolved key expression
/// (spec.md §3 "KeyInfo").
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// The original key-expression text, origin and path included.
    pub expression: String,
    /// Resolved public key. Always present for a concrete key (this module
    /// never produces an unresolved `KeyInfo`, see module docs).
    pub pubkey: PubkeyForm,
    /// Chain-code-bearing extended public key handle, if the expression was
    /// an xpub/xprv (even after normal, non-hardened derivation).
    pub xpub: Option<Xpub>,
    /// Private scalar, if the expression was a WIF or an xprv.
    pub private_key: Option<PrivateKey>,
    pub master_fingerprint: Option<[u8; 4]>,
    pub origin_path: Vec<u32>,
    pub key_path: Vec<u32>,
    /// `m/origin_path/key_path`, composed.
    pub full_path: String,
}

impl KeyInfo {
    fn compose_full_path(origin_path: &[u32], key_path: &[u32]) -> String {
        let mut s = String::from("m");
        for &step in origin_path.iter().chain(key_path.iter()) {
            s.push('/');
            if step & 0x8000_0000 != 0 {
                s.push_str(&(step & 0x7fff_ffff).to_string());
                s.push('\'');
            } else {
                s.push_str(&step.to_string());
            }
        }
        s
    }
}

/// Parses one fully-concrete key expression.
///
/// `is_segwit` enforces compressed-only raw pubkeys; `is_taproot` exposes
/// the key as a 32-byte x-only key (spec.md §3 invariants).
pub fn parse(
    expression: &str,
    is_segwit: bool,
    is_taproot: bool,
    network: &Network,
) -> Result<KeyInfo> {
    let secp = Secp256k1::new();
    let (origin, rest) = grammar::parse_origin(expression)?
        .map(|(o, rest)| (Some(o), rest))
        .unwrap_or((None, expression));

    let (key_text, path_text) = split_key_and_path(rest);
    let key_path_steps = grammar::parse_path(path_text)?;
    let key_path: Vec<u32> = key_path_steps
        .into_iter()
        .map(|step| match step {
            grammar::PathStep::Fixed(v) => Ok(v),
            other => Err(DescriptorLibError::range(format!(
                "unexpected unresolved path step {other:?} in concrete key expression"
            ))),
        })
        .collect::<Result<_>>()?;

    let Origin { fingerprint, path: origin_path } = origin.clone().unwrap_or(Origin {
        fingerprint: [0; 4],
        path: Vec::new(),
    });
    let master_fingerprint = origin.as_ref().map(|_| fingerprint);

    // Dispatch on the key form.
    if let Ok(privkey) = PrivateKey::from_wif(key_text) {
        let pubkey = privkey.public_key(&secp);
        let form = pubkey_form(&pubkey, is_segwit, is_taproot)?;
        return Ok(KeyInfo {
            expression: expression.to_string(),
            pubkey: form,
            xpub: None,
            private_key: Some(privkey),
            master_fingerprint,
            origin_path: origin_path.clone(),
            key_path: key_path.clone(),
            full_path: KeyInfo::compose_full_path(&origin_path, &key_path),
        });
    }

    if let Ok(xpriv) = Xpriv::from_str(key_text) {
        let derived = derive_priv(&secp, &xpriv, &key_path)?;
        let xpub = Xpub::from_priv(&secp, &derived);
        let pubkey = PublicKey::new(xpub.public_key);
        let form = pubkey_form(&pubkey, is_segwit, is_taproot)?;
        let full_path = KeyInfo::compose_full_path(&origin_path, &key_path);
        return Ok(KeyInfo {
            expression: expression.to_string(),
            pubkey: form,
            xpub: Some(xpub),
            private_key: Some(PrivateKey::new(derived.private_key, derived.network)),
            master_fingerprint,
            origin_path,
            key_path,
            full_path,
        });
    }

    if let Ok(xpub_root) = Xpub::from_str(key_text) {
        let derived = derive_pub(&secp, &xpub_root, &key_path)?;
        let pubkey = PublicKey::new(derived.public_key);
        let form = pubkey_form(&pubkey, is_segwit, is_taproot)?;
        let full_path = KeyInfo::compose_full_path(&origin_path, &key_path);
        return Ok(KeyInfo {
            expression: expression.to_string(),
            pubkey: form,
            xpub: Some(derived),
            private_key: None,
            master_fingerprint,
            origin_path,
            key_path,
            full_path,
        });
    }

    if !key_path.is_empty() {
        return Err(DescriptorLibError::key_expression(
            "a derivation path is only valid after an extended key",
        ));
    }

    // Raw key forms: compressed/uncompressed pubkey, or x-only for taproot.
    if let Ok(bytes) = hex::decode(key_text) {
        match bytes.len() {
            32 => {
                let xonly = XOnlyPublicKey::from_slice(&bytes).map_err(|e| {
                    DescriptorLibError::key_expression(format!("invalid x-only point: {e}"))
                })?;
                // Promote to even-parity 33-byte form internally for uniform
                // handling, per spec.md §4.4 step 3.
                let (full, _parity) = xonly.public_key(miniscript::bitcoin::secp256k1::Parity::Even);
                let form = if is_taproot {
                    PubkeyForm::XOnly(bytes.try_into().unwrap())
                } else {
                    pubkey_form(&PublicKey::new(full), is_segwit, is_taproot)?
                };
                let full_path = KeyInfo::compose_full_path(&origin_path, &key_path);
                return Ok(KeyInfo {
                    expression: expression.to_string(),
                    pubkey: form,
                    xpub: None,
                    private_key: None,
                    master_fingerprint,
                    origin_path,
                    key_path,
                    full_path,
                });
            }
            33 | 65 => {
                let pk = PublicKey::from_slice(&bytes).map_err(|e| {
                    DescriptorLibError::key_expression(format!("invalid public key: {e}"))
                })?;
                let form = pubkey_form(&pk, is_segwit, is_taproot)?;
                let full_path = KeyInfo::compose_full_path(&origin_path, &key_path);
                return Ok(KeyInfo {
                    expression: expression.to_string(),
                    pubkey: form,
                    xpub: None,
                    private_key: None,
                    master_fingerprint,
                    origin_path,
                    key_path,
                    full_path,
                });
            }
            _ => {
                return Err(DescriptorLibError::key_expression(format!(
                    "wrong-length pubkey ({} bytes) for key expression '{key_text}'",
                    bytes.len()
                )))
            }
        }
    }

    Err(DescriptorLibError::key_expression(format!(
        "unparseable key expression '{expression}'"
    )))
}

fn pubkey_form(pk: &PublicKey, is_segwit: bool, is_taproot: bool) -> Result<PubkeyForm> {
    if is_taproot {
        let (xonly, _parity) = pk.inner.x_only_public_key();
        return Ok(PubkeyForm::XOnly(xonly.serialize()));
    }
    if is_segwit && !pk.compressed {
        return Err(DescriptorLibError::key_expression(
            "segwit key expressions require a compressed public key",
        ));
    }
    if pk.compressed {
        Ok(PubkeyForm::Compressed(pk.inner.serialize()))
    } else {
        Ok(PubkeyForm::Uncompressed(pk.inner.serialize_uncompressed()))
    }
}

fn derive_pub<C: miniscript::bitcoin::secp256k1::Verification>(
    secp: &Secp256k1<C>,
    xpub: &Xpub,
    path: &[u32],
) -> Result<Xpub> {
    let children: Vec<ChildNumber> = path
        .iter()
        .map(|&v| ChildNumber::from(v))
        .collect();
    xpub.derive_pub(secp, &DerivationPath::from(children))
        .map_err(|e| DescriptorLibError::key_expression(format!("xpub derivation failed: {e}")))
}

fn derive_priv<C: miniscript::bitcoin::secp256k1::Signing>(
    secp: &Secp256k1<C>,
    xpriv: &Xpriv,
    path: &[u32],
) -> Result<Xpriv> {
    let children: Vec<ChildNumber> = path
        .iter()
        .map(|&v| ChildNumber::from(v))
        .collect();
    xpriv
        .derive_priv(secp, &DerivationPath::from(children))
        .map_err(|e| DescriptorLibError::key_expression(format!("xpriv derivation failed: {e}")))
}

/// Splits `KEY` from a trailing `/PATH`, being careful not to split inside a
/// WIF/xpub/raw-hex key (none of which contain `/`).
fn split_key_and_path(s: &str) -> (&str, &str) {
    match s.find('/') {
        Some(idx) => (&s[..idx], &s[idx + 1..]),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XPUB: &str = "tpubDCdxmvzJ5QBjTN8oCjjyT2V58AyZvA1fkmCeZRC75QMoaHcVP2m4jJcfN4SuAxqdZhufBVXDPvdfaJ0CqehzZL3c4EjPGyZcDRCoq4kaxq7";

    #[test]
    fn parses_origin_and_xpub_path() {
        let expr = format!("[d34db33f/49'/0'/0']{XPUB}/1/2/3/4/5");
        let info = parse(&expr, true, false, &Network::BITCOIN).unwrap();
        assert_eq!(info.master_fingerprint, Some([0xd3, 0x4d, 0xb3, 0x3f]));
        assert_eq!(info.origin_path, vec![0x8000_0031, 0x8000_0000, 0x8000_0000]);
        assert_eq!(info.key_path, vec![1, 2, 3, 4, 5]);
        match info.pubkey {
            PubkeyForm::Compressed(_) => {}
            _ => panic!("expected compressed pubkey for segwit"),
        }
        assert_eq!(info.full_path, "m/49'/0'/0'/1/2/3/4/5");
    }

    #[test]
    fn raw_compressed_pubkey() {
        let key = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";
        let info = parse(key, false, false, &Network::BITCOIN).unwrap();
        assert!(matches!(info.pubkey, PubkeyForm::Compressed(_)));
    }

    #[test]
    fn raw_pubkey_rejected_uncompressed_in_segwit() {
        let key = "04a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd3295da0bdf72d7bb40a18f0d0f6fcc";
        assert!(parse(key, true, false, &Network::BITCOIN).is_err());
    }

    #[test]
    fn xonly_key_for_taproot() {
        let key = "f9f94018d1e1f3c06b3f38de68d9c7e62d7cd6f4d1c2f2a0a4fba67a72a3f2e2";
        let info = parse(key, false, true, &Network::BITCOIN).unwrap();
        assert!(matches!(info.pubkey, PubkeyForm::XOnly(_)));
    }

    #[test]
    fn wif_key_resolves_pubkey() {
        let wif = "KzEGYtKcbhYwUWcZygbsqmF31f3iV7HC3iUQug7MBecwCz9hm1Tv";
        let info = parse(wif, false, false, &Network::BITCOIN).unwrap();
        assert!(info.private_key.is_some());
    }

    #[test]
    fn path_on_raw_key_is_rejected() {
        let key = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd/0";
        assert!(parse(key, false, false, &Network::BITCOIN).is_err());
    }
}
