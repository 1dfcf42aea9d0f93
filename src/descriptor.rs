//! Descriptor expander (spec.md §4.8): checksum verification, multipath and
//! range substitution, and top-level form dispatch.

use crate::checksum;
use crate::error::{DescriptorLibError, Result};
use crate::expansion::{self, Expansion, ScriptFamily};
use crate::grammar;
use crate::key_expression::{self, KeyInfo, PubkeyForm};
use crate::network::Network;
use crate::taproot::{self, CompiledTapTree};
use miniscript::bitcoin::address::Address;
use miniscript::bitcoin::key::PublicKey;
use miniscript::bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use miniscript::bitcoin::ScriptBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPathHint {
    Key,
    Script,
}

#[derive(Debug, Clone)]
pub struct ConstructionOptions {
    pub network: Network,
    pub index: Option<u32>,
    pub change: Option<u32>,
    /// spec.md §4.8: bare `sh(MS)` only allows a fixed list of top-level
    /// fragments by default. Setting this relaxes that allow-list to any
    /// miniscript fragment the legacy context can sanity-check.
    pub allow_nonstandard_bare_sh: bool,
    /// spec.md §9 "Open question": a bare `addr(SH_ADDRESS)` gives no redeem
    /// script, so whether it should be treated as wrapping a witness program
    /// (`sh(wpkh(...))`-shaped, for `is_segwit_context`/`input_weight`
    /// purposes) or a legacy script is genuinely ambiguous from the address
    /// alone. Defaults to `false` (legacy), matching the older behavior the
    /// spec describes; callers who know better should set this explicitly.
    pub sh_address_assumes_segwit: bool,
    pub taproot_spend_path: Option<SpendPathHint>,
}

impl Default for ConstructionOptions {
    fn default() -> Self {
        ConstructionOptions {
            network: Network::BITCOIN,
            index: None,
            change: None,
            allow_nonstandard_bare_sh: false,
            sh_address_assumes_segwit: false,
            taproot_spend_path: None,
        }
    }
}

/// The concrete, fully-resolved form of a descriptor (spec.md §4.9's
/// backing data, before the `Output` API is layered on top).
pub enum Resolved {
    Addr {
        script_pubkey: ScriptBuf,
    },
    Pk {
        script_pubkey: ScriptBuf,
        key: KeyInfo,
    },
    Pkh {
        script_pubkey: ScriptBuf,
        key: KeyInfo,
    },
    Wpkh {
        script_pubkey: ScriptBuf,
        key: KeyInfo,
    },
    ShWpkh {
        script_pubkey: ScriptBuf,
        redeem_script: ScriptBuf,
        key: KeyInfo,
    },
    Wsh {
        script_pubkey: ScriptBuf,
        witness_script: ScriptBuf,
        expansion: Expansion,
    },
    ShWsh {
        script_pubkey: ScriptBuf,
        redeem_script: ScriptBuf,
        witness_script: ScriptBuf,
        expansion: Expansion,
    },
    Sh {
        script_pubkey: ScriptBuf,
        redeem_script: ScriptBuf,
        expansion: Expansion,
    },
    Tr {
        script_pubkey: ScriptBuf,
        internal_key: XOnlyPublicKey,
        internal_key_info: KeyInfo,
        tree: Option<CompiledTapTree>,
    },
}

/// Substitutes `<a;b;...>` multipath tuples (requires `change`) and `*`
/// range wildcards (requires `index`) in lockstep, per spec.md §4.8.
fn substitute_range_and_multipath(body: &str, options: &ConstructionOptions) -> Result<String> {
    let is_ranged = body.contains('*');
    let is_multipath = body.contains('<');

    let mut out = String::with_capacity(body.len());
    let mut expected_tuple_len: Option<usize> = None;
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '<' {
            let close = body[i..]
                .find('>')
                .map(|p| p + i)
                .ok_or_else(|| DescriptorLibError::range("unterminated multipath tuple '<'"))?;
            let inner = &body[i + 1..close];
            let values = grammar::parse_tuple_inner(inner)?;
            match expected_tuple_len {
                Some(len) if len != values.len() => {
                    return Err(DescriptorLibError::range(
                        "multipath tuples must all share the same length",
                    ))
                }
                _ => expected_tuple_len = Some(values.len()),
            }
            let change = options
                .change
                .ok_or_else(|| DescriptorLibError::range("multipath descriptor requires a change value"))?;
            if !values.contains(&change) {
                return Err(DescriptorLibError::range(format!(
                    "change value {change} is not one of the tuple's branches {values:?}"
                )));
            }
            out.push_str(&change.to_string());
            while let Some(&(j, _)) = chars.peek() {
                if j > close {
                    break;
                }
                chars.next();
            }
        } else if c == '*' {
            if body[i..].starts_with("**") {
                let index = options
                    .index
                    .ok_or_else(|| DescriptorLibError::range("ranged descriptor requires an index"))?;
                let change = options.change.ok_or_else(|| {
                    DescriptorLibError::range("/** shorthand requires a change value (it desugars to <0;1>/*)")
                })?;
                if change != 0 && change != 1 {
                    return Err(DescriptorLibError::range(format!(
                        "/** desugars to <0;1>/*; change value {change} is not 0 or 1"
                    )));
                }
                match expected_tuple_len {
                    Some(len) if len != 2 => {
                        return Err(DescriptorLibError::range(
                            "multipath tuples must all share the same length",
                        ))
                    }
                    _ => expected_tuple_len = Some(2),
                }
                out.push_str(&format!("{change}/{index}"));
                chars.next(); // consume the second '*'
            } else {
                let index = options
                    .index
                    .ok_or_else(|| DescriptorLibError::range("ranged descriptor requires an index"))?;
                out.push_str(&index.to_string());
            }
        } else {
            out.push(c);
        }
    }

    if is_ranged && options.index.is_none() {
        return Err(DescriptorLibError::range("ranged descriptor requires an index"));
    }
    if is_multipath && options.change.is_none() {
        return Err(DescriptorLibError::range("multipath descriptor requires a change value"));
    }
    Ok(out)
}

fn to_bitcoin_pubkey(key: &KeyInfo) -> Result<PublicKey> {
    PublicKey::from_slice(key.pubkey.as_bytes())
        .map_err(|e| DescriptorLibError::key_expression(format!("invalid public key: {e}")))
}

fn build_pkh_script(key: &KeyInfo) -> Result<ScriptBuf> {
    let pk = to_bitcoin_pubkey(key)?;
    Ok(ScriptBuf::new_p2pkh(&pk.pubkey_hash()))
}

fn build_wpkh_script(key: &KeyInfo) -> Result<ScriptBuf> {
    let pk = to_bitcoin_pubkey(key)?;
    let hash = pk
        .wpubkey_hash()
        .ok_or_else(|| DescriptorLibError::key_expression("wpkh requires a compressed public key"))?;
    Ok(ScriptBuf::new_p2wpkh(&hash))
}

/// Parses, checksum-verifies, range/multipath-substitutes and dispatches a
/// descriptor string to its concrete resolved form.
pub fn resolve(descriptor_with_checksum: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let (body, _checksum) = checksum::split(descriptor_with_checksum)?;
    checksum::verify(descriptor_with_checksum)?;
    let body = substitute_range_and_multipath(body, options)?;

    if let Ok((name, args)) = grammar::split_function(&body) {
        log::debug!("resolving descriptor form '{name}'");
        return match name {
            "addr" => resolve_addr(args, options),
            "pk" => resolve_pk(args, options),
            "pkh" => resolve_pkh(args, options),
            "wpkh" => resolve_wpkh(args, options),
            "sh" => resolve_sh(args, options),
            "wsh" => resolve_wsh(args, options),
            "tr" => resolve_tr(args, options),
            other => Err(DescriptorLibError::descriptor_parse(format!(
                "unrecognized top-level descriptor form '{other}'"
            ))),
        };
    }
    Err(DescriptorLibError::descriptor_parse(format!(
        "unparseable descriptor '{body}'"
    )))
}

fn resolve_addr(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let address = Address::from_str(args.trim())
        .map_err(|e| DescriptorLibError::descriptor_parse(format!("invalid address: {e}")))?
        .require_network(options.network.bitcoin_network())
        .map_err(|e| DescriptorLibError::descriptor_parse(format!("address/network mismatch: {e}")))?;
    if options.taproot_spend_path == Some(SpendPathHint::Script) {
        return Err(DescriptorLibError::spend_path(
            "an addr(...) descriptor has no script tree; 'script' spend path is unavailable",
        ));
    }
    Ok(Resolved::Addr {
        script_pubkey: address.script_pubkey(),
    })
}

fn resolve_pk(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let key = key_expression::parse(args.trim(), false, false, &options.network)?;
    let mut builder = miniscript::bitcoin::script::Builder::new();
    builder = builder.push_slice(
        miniscript::bitcoin::script::PushBytesBuf::try_from(key.pubkey.as_bytes().to_vec())
            .map_err(|e| DescriptorLibError::descriptor_parse(e.to_string()))?,
    );
    builder = builder.push_opcode(miniscript::bitcoin::blockdata::opcodes::all::OP_CHECKSIG);
    Ok(Resolved::Pk {
        script_pubkey: builder.into_script(),
        key,
    })
}

fn resolve_pkh(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let key = key_expression::parse(args.trim(), false, false, &options.network)?;
    let script_pubkey = build_pkh_script(&key)?;
    Ok(Resolved::Pkh { script_pubkey, key })
}

fn resolve_wpkh(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let key = key_expression::parse(args.trim(), true, false, &options.network)?;
    Ok(Resolved::Wpkh {
        script_pubkey: build_wpkh_script(&key)?,
        key,
    })
}

fn resolve_sh(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    if let Ok((inner_name, inner_args)) = grammar::split_function(args) {
        if inner_name == "wpkh" {
            let key = key_expression::parse(inner_args.trim(), true, false, &options.network)?;
            let redeem_script = build_wpkh_script(&key)?;
            let script_pubkey = ScriptBuf::new_p2sh(&redeem_script.script_hash());
            return Ok(Resolved::ShWpkh {
                script_pubkey,
                redeem_script,
                key,
            });
        }
        if inner_name == "wsh" {
            let expansion = expansion::expand_and_compile(inner_args, ScriptFamily::Segwitv0, &options.network)?;
            expansion::check_script_policy(&expansion.compiled_script, true)?;
            let witness_script = expansion.compiled_script.clone();
            let redeem_script = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
            let script_pubkey = ScriptBuf::new_p2sh(&redeem_script.script_hash());
            return Ok(Resolved::ShWsh {
                script_pubkey,
                redeem_script,
                witness_script,
                expansion,
            });
        }
        const ALLOWED_BARE_SH: &[&str] =
            &["pk", "pkh", "wpkh", "combo", "multi", "sortedmulti", "multi_a", "sortedmulti_a"];
        if !options.allow_nonstandard_bare_sh && !ALLOWED_BARE_SH.contains(&inner_name) {
            return Err(DescriptorLibError::descriptor_parse(format!(
                "'{inner_name}' is not allowed as a bare sh(...) top-level fragment"
            )));
        }
    }
    let expansion = expansion::expand_and_compile(args, ScriptFamily::Legacy, &options.network)?;
    expansion::check_script_policy(&expansion.compiled_script, false)?;
    let redeem_script = expansion.compiled_script.clone();
    let script_pubkey = ScriptBuf::new_p2sh(&redeem_script.script_hash());
    Ok(Resolved::Sh {
        script_pubkey,
        redeem_script,
        expansion,
    })
}

fn resolve_wsh(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let expansion = expansion::expand_and_compile(args, ScriptFamily::Segwitv0, &options.network)?;
    expansion::check_script_policy(&expansion.compiled_script, true)?;
    let witness_script = expansion.compiled_script.clone();
    let script_pubkey = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
    Ok(Resolved::Wsh {
        script_pubkey,
        witness_script,
        expansion,
    })
}

fn resolve_tr(args: &str, options: &ConstructionOptions) -> Result<Resolved> {
    let parts = grammar::split_top_level_args(args);
    let internal_key_text = parts[0].trim();
    let internal_key_info = key_expression::parse(internal_key_text, false, true, &options.network)?;
    let internal_key = match &internal_key_info.pubkey {
        PubkeyForm::XOnly(b) => XOnlyPublicKey::from_slice(b)
            .map_err(|e| DescriptorLibError::key_expression(format!("invalid internal key: {e}")))?,
        _ => {
            return Err(DescriptorLibError::key_expression(
                "taproot internal key must resolve to an x-only point",
            ))
        }
    };
    let secp = Secp256k1::new();

    if parts.len() == 1 {
        if options.taproot_spend_path == Some(SpendPathHint::Script) {
            return Err(DescriptorLibError::spend_path(
                "'script' spend path requires a tr(KEY,TREE) descriptor",
            ));
        }
        let spend_info = taproot::key_path_only(&secp, internal_key);
        let script_pubkey = {
            use miniscript::bitcoin::script::Builder;
            Builder::new()
                .push_opcode(miniscript::bitcoin::blockdata::opcodes::all::OP_PUSHNUM_1)
                .push_slice(spend_info.output_key().serialize())
                .into_script()
        };
        return Ok(Resolved::Tr {
            script_pubkey,
            internal_key,
            internal_key_info,
            tree: None,
        });
    }

    let tree_text = parts[1..].join(",");
    let tree = taproot::compile_tree(&secp, internal_key, &tree_text, &options.network)?;
    let script_pubkey = tree.output_key_script();
    Ok(Resolved::Tr {
        script_pubkey,
        internal_key,
        internal_key_info,
        tree: Some(tree),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";

    #[test]
    fn resolves_wpkh() {
        let _ = env_logger::try_init();
        let body = format!("wpkh({KEY_A})");
        let with_checksum = checksum::append(&body).unwrap();
        let resolved = resolve(&with_checksum, &ConstructionOptions::default()).unwrap();
        assert!(matches!(resolved, Resolved::Wpkh { .. }));
    }

    #[test]
    fn rejects_bad_checksum() {
        let body = format!("wpkh({KEY_A})#aaaaaaaa");
        assert!(resolve(&body, &ConstructionOptions::default()).is_err());
    }

    #[test]
    fn ranged_descriptor_requires_index() {
        let body = format!("wpkh([d34db33f/0']xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8/*)");
        let with_checksum = checksum::append(&body).unwrap();
        assert!(resolve(&with_checksum, &ConstructionOptions::default()).is_err());
    }

    const RANGED_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    #[test]
    fn double_star_accepts_change_zero_or_one() {
        let body = format!("wpkh([d34db33f/0']{RANGED_XPUB}/**)");
        let with_checksum = checksum::append(&body).unwrap();
        for change in [0u32, 1u32] {
            let options = ConstructionOptions {
                index: Some(3),
                change: Some(change),
                ..ConstructionOptions::default()
            };
            assert!(resolve(&with_checksum, &options).is_ok());
        }
    }

    #[test]
    fn double_star_rejects_change_outside_zero_or_one() {
        let body = format!("wpkh([d34db33f/0']{RANGED_XPUB}/**)");
        let with_checksum = checksum::append(&body).unwrap();
        let options = ConstructionOptions {
            index: Some(3),
            change: Some(5),
            ..ConstructionOptions::default()
        };
        assert!(resolve(&with_checksum, &options).is_err());
    }
}
