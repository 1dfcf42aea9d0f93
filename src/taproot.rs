//! Taproot tree engine (spec.md §4.7).
//!
//! Tree parsing and per-leaf miniscript compilation are ours; merkle root,
//! control blocks and the output-key tweak are delegated to
//! `bitcoin::taproot::TaprootBuilder`/`TaprootSpendInfo` rather than
//! hand-rolled tagged hashes, the same collaborator the teacher's
//! `recursive_tap_tree.rs` builds on top of.

use crate::error::{DescriptorLibError, Result};
use crate::expansion::{self, Expansion, ScriptFamily};
use crate::key_expression::KeyInfo;
use crate::network::Network;
use crate::satisfier::{self, Preimages, SchnorrPartialSignature, TimeConstraints};
use miniscript::bitcoin::secp256k1::{Secp256k1, Verification, XOnlyPublicKey};
use miniscript::bitcoin::taproot::{
    ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo,
};
use miniscript::bitcoin::ScriptBuf;

/// One compiled leaf: its source text, expansion (for per-leaf BIP32
/// metadata) and the resulting tapscript.
#[derive(Debug, Clone)]
pub struct TapLeafInfo {
    pub miniscript_text: String,
    pub expansion: Expansion,
    pub leaf_script: ScriptBuf,
    pub depth: u8,
    pub leaf_hash: TapLeafHash,
}

/// The `LEAF | {TREE,TREE}` grammar (spec.md §4.7), parsed but not yet
/// compiled.
#[derive(Debug, Clone)]
pub enum RawTapTree {
    Leaf(String),
    Branch(Box<RawTapTree>, Box<RawTapTree>),
}

/// A brace-aware tokenizer: splits a `{A,B}` pair at top level, where `A`/`B`
/// may themselves contain parentheses (miniscript) or nested braces.
pub fn parse_tree(text: &str) -> Result<RawTapTree> {
    let text = text.trim();
    if !text.starts_with('{') {
        return Ok(RawTapTree::Leaf(text.to_string()));
    }
    if !text.ends_with('}') {
        return Err(DescriptorLibError::descriptor_parse(format!(
            "unterminated taproot tree '{text}'"
        )));
    }
    let inner = &text[1..text.len() - 1];
    let mut depth = 0i32;
    let mut split_at = None;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            ',' if depth == 0 => {
                split_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    let split_at = split_at.ok_or_else(|| {
        DescriptorLibError::descriptor_parse(format!("taproot tree '{text}' needs exactly 2 branches"))
    })?;
    let left = parse_tree(&inner[..split_at])?;
    let right = parse_tree(&inner[split_at + 1..])?;
    Ok(RawTapTree::Branch(Box::new(left), Box::new(right)))
}

fn collect_leaves<'a>(
    tree: &'a RawTapTree,
    depth: u8,
    out: &mut Vec<(&'a str, u8)>,
) -> Result<()> {
    match tree {
        RawTapTree::Leaf(text) => {
            out.push((text.as_str(), depth));
            Ok(())
        }
        RawTapTree::Branch(l, r) => {
            collect_leaves(l, depth + 1, out)?;
            collect_leaves(r, depth + 1, out)
        }
    }
}

/// A fully compiled taproot script tree: the internal key, the
/// `TaprootSpendInfo` (merkle root, control blocks) and every leaf's
/// compiled tapscript.
pub struct CompiledTapTree {
    pub internal_key: XOnlyPublicKey,
    pub spend_info: TaprootSpendInfo,
    pub leaves: Vec<TapLeafInfo>,
}

impl CompiledTapTree {
    pub fn output_key_script(&self) -> ScriptBuf {
        use miniscript::bitcoin::script::Builder;
        Builder::new()
            .push_opcode(miniscript::bitcoin::blockdata::opcodes::all::OP_PUSHNUM_1)
            .push_slice(self.spend_info.output_key().serialize())
            .into_script()
    }

    pub fn control_block(&self, leaf: &TapLeafInfo) -> Result<ControlBlock> {
        self.spend_info
            .control_block(&(leaf.leaf_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| DescriptorLibError::taproot("no control block for leaf (not in tree)"))
    }

    /// Per-leaf BIP32 derivation entries (spec.md §4.7), merged across
    /// leaves that share the same resolved public key.
    pub fn tap_bip32_derivations(&self) -> Vec<(KeyInfo, Vec<TapLeafHash>)> {
        let mut merged: Vec<(Vec<u8>, KeyInfo, Vec<TapLeafHash>)> = Vec::new();
        for leaf in &self.leaves {
            for key in leaf.expansion.keys.iter() {
                let bytes = key.pubkey.as_bytes().to_vec();
                if let Some(entry) = merged.iter_mut().find(|(b, _, _)| b == &bytes) {
                    entry.2.push(leaf.leaf_hash);
                } else {
                    merged.push((bytes, key.clone(), vec![leaf.leaf_hash]));
                }
            }
        }
        merged.into_iter().map(|(_, k, h)| (k, h)).collect()
    }
}

/// Parses and compiles a taproot tree text against the given internal key.
pub fn compile_tree<C: Verification>(
    secp: &Secp256k1<C>,
    internal_key: XOnlyPublicKey,
    tree_text: &str,
    network: &Network,
) -> Result<CompiledTapTree> {
    let raw = parse_tree(tree_text)?;
    let mut leaf_texts = Vec::new();
    collect_leaves(&raw, 0, &mut leaf_texts)?;

    let mut builder = TaprootBuilder::new();
    let mut leaves = Vec::with_capacity(leaf_texts.len());
    for (text, depth) in leaf_texts {
        let expansion = expansion::expand_and_compile(text, ScriptFamily::Tap, network)?;
        let leaf_script = expansion.compiled_script.clone();
        builder = builder
            .add_leaf(depth, leaf_script.clone())
            .map_err(|e| DescriptorLibError::taproot(format!("failed to add leaf at depth {depth}: {e:?}")))?;
        let leaf_hash = TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);
        leaves.push(TapLeafInfo {
            miniscript_text: text.to_string(),
            expansion,
            leaf_script,
            depth,
            leaf_hash,
        });
    }

    let spend_info = builder
        .finalize(secp, internal_key)
        .map_err(|e| DescriptorLibError::taproot(format!("failed to finalize taproot tree: {e:?}")))?;

    Ok(CompiledTapTree {
        internal_key,
        spend_info,
        leaves,
    })
}

/// A key-path-only taproot output: no script tree, `merkleRoot` is the
/// internal key's untweaked hash (i.e. none).
pub fn key_path_only<C: Verification>(
    secp: &Secp256k1<C>,
    internal_key: XOnlyPublicKey,
) -> TaprootSpendInfo {
    TaprootSpendInfo::new_key_spend(secp, internal_key, None)
}

/// Leaf selection during finalization (spec.md §4.7 final paragraph):
/// either a `tapLeafHash` hint, a leaf miniscript text hint, or the smallest
/// satisfiable witness among all leaves.
pub enum LeafHint<'a> {
    Hash(TapLeafHash),
    MiniscriptText(&'a str),
    None,
}

pub struct LeafSatisfaction {
    pub leaf_index: usize,
    pub stack_items: Vec<Vec<u8>>,
    pub control_block: ControlBlock,
}

pub fn select_and_satisfy(
    tree: &CompiledTapTree,
    hint: LeafHint<'_>,
    sigs: &[SchnorrPartialSignature],
    preimages: &Preimages,
) -> Result<LeafSatisfaction> {
    let candidate_indices: Vec<usize> = match hint {
        LeafHint::Hash(h) => {
            let idx = tree
                .leaves
                .iter()
                .position(|l| l.leaf_hash == h)
                .ok_or_else(|| DescriptorLibError::taproot("no leaf matches the given tapLeafHash"))?;
            vec![idx]
        }
        LeafHint::MiniscriptText(text) => {
            let matches: Vec<usize> = tree
                .leaves
                .iter()
                .enumerate()
                .filter(|(_, l)| l.miniscript_text == text)
                .map(|(i, _)| i)
                .collect();
            if matches.len() > 1 {
                return Err(DescriptorLibError::taproot(
                    "multiple leaves share this miniscript text; disambiguate with a tapLeafHash",
                ));
            }
            if matches.is_empty() {
                return Err(DescriptorLibError::taproot("no leaf matches the given miniscript text"));
            }
            matches
        }
        LeafHint::None => (0..tree.leaves.len()).collect(),
    };

    let mut best: Option<LeafSatisfaction> = None;
    for idx in candidate_indices {
        let leaf = &tree.leaves[idx];
        let outcome = satisfier::satisfy_tap(
            &leaf.expansion,
            leaf.leaf_hash,
            sigs,
            preimages,
            TimeConstraints::default(),
        );
        let Ok(outcome) = outcome else { continue };
        let control_block = tree.control_block(leaf)?;
        let witness_len: usize = outcome.script_satisfaction.iter().map(|i| i.len()).sum();
        let candidate = LeafSatisfaction {
            leaf_index: idx,
            stack_items: outcome.script_satisfaction,
            control_block,
        };
        let better = match &best {
            None => true,
            Some(current) => {
                witness_len
                    < current
                        .stack_items
                        .iter()
                        .map(|i| i.len())
                        .sum::<usize>()
            }
        };
        if better {
            best = Some(candidate);
        }
    }

    best.ok_or_else(|| DescriptorLibError::taproot("no candidate leaf could be satisfied"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "f9f94018d1e1f3c06b3f38de68d9c7e62d7cd6f4d1c2f2a0a4fba67a72a3f2e2";
    const KEY_B: &str = "a44f7d8c6d0c9c9b5e9e13e5bb77cb6c3d2f60b1df3ac91a8d5eaeb82f5f6a13";

    fn xonly(hex_str: &str) -> XOnlyPublicKey {
        XOnlyPublicKey::from_slice(&hex::decode(hex_str).unwrap()).unwrap()
    }

    #[test]
    fn parses_single_leaf() {
        let tree = parse_tree(&format!("pk({KEY_A})")).unwrap();
        assert!(matches!(tree, RawTapTree::Leaf(_)));
    }

    #[test]
    fn parses_two_leaf_branch() {
        let text = format!("{{pk({KEY_A}),pk({KEY_B})}}");
        let tree = parse_tree(&text).unwrap();
        match tree {
            RawTapTree::Branch(l, r) => {
                assert!(matches!(*l, RawTapTree::Leaf(_)));
                assert!(matches!(*r, RawTapTree::Leaf(_)));
            }
            _ => panic!("expected a branch"),
        }
    }

    #[test]
    fn compiles_two_leaf_tree_and_builds_control_blocks() {
        let secp = Secp256k1::new();
        let internal = xonly(KEY_A);
        let text = format!("{{pk({KEY_A}),pk({KEY_B})}}");
        let tree = compile_tree(&secp, internal, &text, &Network::BITCOIN).unwrap();
        assert_eq!(tree.leaves.len(), 2);
        for leaf in &tree.leaves {
            let cb = tree.control_block(leaf).unwrap();
            assert_eq!(cb.serialize().len(), 33 + 32 * (leaf.depth as usize));
        }
    }
}
