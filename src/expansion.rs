//! Miniscript expansion and compilation (spec.md §4.5).
//!
//! Key expressions inside a miniscript body are resolved to concrete public
//! keys by our own recursive-descent walk over the supported fragment
//! grammar (mirroring `grammar::split_function`/`split_top_level_args`), and
//! the resulting hex-keyed text is handed to the real `miniscript` crate for
//! parsing, sanity-checking and encoding — rather than hand-rolling a second
//! script compiler. The `@i` bookkeeping from spec.md is realized as the
//! `ExpansionMap`, populated in the same left-to-right order the walk visits
//! key leaves.

use crate::error::{DescriptorLibError, Result};
use crate::grammar;
use crate::key_expression::{self, KeyInfo};
use crate::network::Network;
use miniscript::bitcoin::key::PublicKey;
use miniscript::bitcoin::secp256k1::XOnlyPublicKey;
use miniscript::bitcoin::ScriptBuf;
use miniscript::{Legacy, Miniscript, Segwitv0, Tap};
use std::str::FromStr;

/// Ordered `@0, @1, ...` -> `KeyInfo` table, in textual left-to-right order.
#[derive(Debug, Clone, Default)]
pub struct ExpansionMap(pub Vec<KeyInfo>);

impl ExpansionMap {
    pub fn get(&self, i: usize) -> Option<&KeyInfo> {
        self.0.get(i)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyInfo> {
        self.0.iter()
    }
}

/// Which script context a miniscript body is being expanded for; determines
/// both the key form (segwit/legacy compressed-or-uncompressed, or taproot
/// x-only) and which `miniscript::ScriptContext` to compile against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFamily {
    Legacy,
    Segwitv0,
    Tap,
}

impl ScriptFamily {
    fn is_segwit(self) -> bool {
        matches!(self, ScriptFamily::Segwitv0)
    }

    fn is_taproot(self) -> bool {
        matches!(self, ScriptFamily::Tap)
    }
}

/// The destructured form of a miniscript body (spec.md §3 "Expansion").
#[derive(Debug, Clone)]
pub struct Expansion {
    pub script_family: ScriptFamily,
    pub keys: ExpansionMap,
    /// The original miniscript text (keys given as written, not substituted).
    pub canonical_expression: String,
    /// The same miniscript with every key expression replaced by its
    /// resolved hex pubkey — what actually gets handed to the real
    /// `miniscript` crate, and what the satisfier re-parses from.
    pub substituted_expression: String,
    pub compiled_script: ScriptBuf,
}

const WRAPPER_LETTERS: &str = "asdjnvlut";
const KEY_FRAGMENTS: &[&str] = &["pk_k", "pk_h", "pk", "pkh"];
const MULTI_FRAGMENTS: &[&str] = &["multi", "multi_a", "sortedmulti", "sortedmulti_a"];
const HASH_FRAGMENTS: &[&str] = &["sha256", "hash256", "ripemd160", "hash160"];
const UNARY_NUMERIC_FRAGMENTS: &[&str] = &["older", "after"];
const BINARY_FRAGMENTS: &[&str] = &["and_v", "and_b", "and_n", "or_b", "or_c", "or_d", "or_i"];

struct Walker<'n> {
    family: ScriptFamily,
    network: &'n Network,
    map: ExpansionMap,
}

impl<'n> Walker<'n> {
    fn resolve_key(&mut self, key_text: &str) -> Result<String> {
        let info = key_expression::parse(
            key_text.trim(),
            self.family.is_segwit(),
            self.family.is_taproot(),
            self.network,
        )?;
        let hex = info.pubkey.to_compressed_or_xonly_hex();
        self.map.0.push(info);
        Ok(hex)
    }

    fn walk(&mut self, expr: &str) -> Result<String> {
        let expr = expr.trim();

        if let Some(colon) = expr.find(':') {
            let paren = expr.find('(').unwrap_or(expr.len());
            if colon < paren
                && !expr[..colon].is_empty()
                && expr[..colon].bytes().all(|b| WRAPPER_LETTERS.contains(b as char))
            {
                let inner = self.walk(&expr[colon + 1..])?;
                return Ok(format!("{}:{}", &expr[..colon], inner));
            }
        }

        if expr == "0" || expr == "1" {
            return Ok(expr.to_string());
        }

        let (name, args) = grammar::split_function(expr)?;

        if KEY_FRAGMENTS.contains(&name) {
            let hex = self.resolve_key(args)?;
            return Ok(format!("{name}({hex})"));
        }

        if HASH_FRAGMENTS.contains(&name) || UNARY_NUMERIC_FRAGMENTS.contains(&name) {
            return Ok(format!("{name}({args})"));
        }

        if MULTI_FRAGMENTS.contains(&name) {
            let parts = grammar::split_top_level_args(args);
            let (k, key_texts) = parts
                .split_first()
                .ok_or_else(|| DescriptorLibError::descriptor_parse(format!("empty {name}(...)")))?;
            let mut resolved: Vec<(String, Vec<u8>)> = Vec::new();
            for key_text in key_texts {
                let info = key_expression::parse(
                    key_text.trim(),
                    self.family.is_segwit(),
                    self.family.is_taproot(),
                    self.network,
                )?;
                let hex = info.pubkey.to_compressed_or_xonly_hex();
                let bytes = info.pubkey.as_bytes().to_vec();
                self.map.0.push(info);
                resolved.push((hex, bytes));
            }
            let canonical_name = if name.starts_with("sortedmulti") {
                resolved.sort_by(|a, b| a.1.cmp(&b.1));
                if name.ends_with("_a") {
                    "multi_a"
                } else {
                    "multi"
                }
            } else {
                name
            };
            let hex_list: Vec<&str> = resolved.iter().map(|(hex, _)| hex.as_str()).collect();
            return Ok(format!("{canonical_name}({},{})", k.trim(), hex_list.join(",")));
        }

        if name == "andor" {
            let parts = grammar::split_top_level_args(args);
            if parts.len() != 3 {
                return Err(DescriptorLibError::descriptor_parse("andor requires 3 arguments"));
            }
            let x = self.walk(parts[0])?;
            let y = self.walk(parts[1])?;
            let z = self.walk(parts[2])?;
            return Ok(format!("andor({x},{y},{z})"));
        }

        if BINARY_FRAGMENTS.contains(&name) {
            let parts = grammar::split_top_level_args(args);
            if parts.len() != 2 {
                return Err(DescriptorLibError::descriptor_parse(format!(
                    "{name} requires 2 arguments"
                )));
            }
            let x = self.walk(parts[0])?;
            let y = self.walk(parts[1])?;
            return Ok(format!("{name}({x},{y})"));
        }

        if name == "thresh" {
            let parts = grammar::split_top_level_args(args);
            let (k, rest) = parts
                .split_first()
                .ok_or_else(|| DescriptorLibError::descriptor_parse("empty thresh(...)"))?;
            let mut walked = Vec::with_capacity(rest.len());
            for sub in rest {
                walked.push(self.walk(sub)?);
            }
            return Ok(format!("thresh({},{})", k.trim(), walked.join(",")));
        }

        Err(DescriptorLibError::descriptor_parse(format!(
            "unsupported miniscript fragment '{name}'"
        )))
    }
}

fn duplicate_check(map: &ExpansionMap) -> Result<()> {
    let mut seen: Vec<&[u8]> = Vec::with_capacity(map.len());
    for info in map.iter() {
        let bytes = info.pubkey.as_bytes();
        if seen.contains(&bytes) {
            return Err(DescriptorLibError::miniscript_sanity(
                "duplicate resolved public key inside a single miniscript",
            ));
        }
        seen.push(bytes);
    }
    Ok(())
}

/// Expands and compiles `miniscript_text` for the given script family,
/// returning the populated `ExpansionMap` and compiled script bytes.
pub fn expand_and_compile(
    miniscript_text: &str,
    family: ScriptFamily,
    network: &Network,
) -> Result<Expansion> {
    let mut walker = Walker {
        family,
        network,
        map: ExpansionMap::default(),
    };
    let substituted = walker.walk(miniscript_text)?;
    duplicate_check(&walker.map)?;

    let compiled = match family {
        ScriptFamily::Legacy => {
            let ms = Miniscript::<PublicKey, Legacy>::from_str(&substituted)
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.sanity_check()
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.encode()
        }
        ScriptFamily::Segwitv0 => {
            let ms = Miniscript::<PublicKey, Segwitv0>::from_str(&substituted)
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.sanity_check()
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.encode()
        }
        ScriptFamily::Tap => {
            let ms = Miniscript::<XOnlyPublicKey, Tap>::from_str(&substituted)
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.sanity_check()
                .map_err(|e| DescriptorLibError::miniscript_sanity(e.to_string()))?;
            ms.encode()
        }
    };

    Ok(Expansion {
        script_family: family,
        keys: walker.map,
        canonical_expression: miniscript_text.to_string(),
        substituted_expression: substituted,
        compiled_script: compiled,
    })
}

/// Applies the §4.5 script-size and opcode-count policy for the redeem
/// script (P2SH, ≤520 bytes) or witness script (P2WSH, ≤3600 bytes).
pub fn check_script_policy(script: &ScriptBuf, is_witness: bool) -> Result<()> {
    let limit = if is_witness { 3600 } else { 520 };
    if script.len() > limit {
        return Err(DescriptorLibError::script_policy(format!(
            "script is {} bytes, exceeds the {limit}-byte limit",
            script.len()
        )));
    }
    let non_push_count = script
        .instructions()
        .filter_map(|i| i.ok())
        .filter(|i| !matches!(i, miniscript::bitcoin::script::Instruction::PushBytes(_)))
        .count();
    if non_push_count > 201 {
        return Err(DescriptorLibError::script_policy(format!(
            "script has {non_push_count} non-push opcodes, exceeds the 201 limit"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";
    const KEY_B: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    #[test]
    fn expands_pk() {
        let expansion =
            expand_and_compile(&format!("pk({KEY_A})"), ScriptFamily::Segwitv0, &Network::BITCOIN)
                .unwrap();
        assert_eq!(expansion.keys.len(), 1);
        assert!(!expansion.compiled_script.is_empty());
    }

    #[test]
    fn sortedmulti_orders_by_pubkey_bytes() {
        let a = expand_and_compile(
            &format!("sortedmulti(1,{KEY_A},{KEY_B})"),
            ScriptFamily::Segwitv0,
            &Network::BITCOIN,
        )
        .unwrap();
        let b = expand_and_compile(
            &format!("sortedmulti(1,{KEY_B},{KEY_A})"),
            ScriptFamily::Segwitv0,
            &Network::BITCOIN,
        )
        .unwrap();
        assert_eq!(a.compiled_script, b.compiled_script);
    }

    #[test]
    fn duplicate_keys_in_multi_are_rejected() {
        let result = expand_and_compile(
            &format!("multi(1,{KEY_A},{KEY_A})"),
            ScriptFamily::Segwitv0,
            &Network::BITCOIN,
        );
        assert!(result.is_err());
    }

    #[test]
    fn andor_recurses_into_both_branches() {
        let text = format!("andor(pk({KEY_A}),older(144),pk({KEY_B}))");
        let expansion =
            expand_and_compile(&text, ScriptFamily::Segwitv0, &Network::BITCOIN).unwrap();
        assert_eq!(expansion.keys.len(), 2);
    }

    #[test]
    fn script_policy_rejects_oversized_witness_script() {
        let oversized = ScriptBuf::from(vec![0u8; 4000]);
        assert!(check_script_policy(&oversized, true).is_err());
    }
}
