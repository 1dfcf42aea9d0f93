//! Minimal ASM text assembler used for the non-miniscript script forms of
//! spec.md §4.8 (`pk`, `pkh`, `wpkh`, P2SH wrapping) — the bare-metal
//! counterpart to letting the `miniscript` crate compile a miniscript body.
//!
//! Tokens are whitespace separated: `OP_*` mnemonics, hex-encoded pushes, and
//! bare decimal numbers (rewritten through `number::encode_minimal`, §4.3).

use crate::error::{DescriptorLibError, Result};
use miniscript::bitcoin::blockdata::opcodes::{all as opcodes, Opcode};
use miniscript::bitcoin::ScriptBuf;

fn opcode_by_name(name: &str) -> Option<Opcode> {
    Some(match name {
        "OP_0" | "OP_FALSE" => opcodes::OP_PUSHBYTES_0,
        "OP_1" | "OP_TRUE" => opcodes::OP_PUSHNUM_1,
        "OP_DUP" => opcodes::OP_DUP,
        "OP_HASH160" => opcodes::OP_HASH160,
        "OP_HASH256" => opcodes::OP_HASH256,
        "OP_SHA256" => opcodes::OP_SHA256,
        "OP_RIPEMD160" => opcodes::OP_RIPEMD160,
        "OP_EQUAL" => opcodes::OP_EQUAL,
        "OP_EQUALVERIFY" => opcodes::OP_EQUALVERIFY,
        "OP_VERIFY" => opcodes::OP_VERIFY,
        "OP_CHECKSIG" => opcodes::OP_CHECKSIG,
        "OP_CHECKSIGVERIFY" => opcodes::OP_CHECKSIGVERIFY,
        "OP_CHECKMULTISIG" => opcodes::OP_CHECKMULTISIG,
        "OP_CHECKLOCKTIMEVERIFY" | "OP_CLTV" => opcodes::OP_CLTV,
        "OP_CHECKSEQUENCEVERIFY" | "OP_CSV" => opcodes::OP_CSV,
        "OP_DROP" => opcodes::OP_DROP,
        _ => return None,
    })
}

/// Assembles whitespace-separated ASM text into a `ScriptBuf`.
///
/// Supported tokens: known `OP_*` mnemonics (see `opcode_by_name`), even-length
/// hex strings (pushed as data), and bare decimal integers (pushed through
/// the minimal-number encoding of §4.3, with `0` becoming `OP_0`).
pub fn assemble(asm: &str) -> Result<ScriptBuf> {
    use miniscript::bitcoin::script::Builder;
    let mut builder = Builder::new();
    for token in asm.split_whitespace() {
        if let Some(op) = opcode_by_name(token) {
            builder = builder.push_opcode(op);
        } else if token.starts_with("0x") || token.chars().all(|c| c.is_ascii_hexdigit()) {
            let data = hex::decode(token.trim_start_matches("0x"))
                .map_err(|e| DescriptorLibError::descriptor_parse(format!("bad hex token '{token}': {e}")))?;
            builder = builder.push_slice(
                miniscript::bitcoin::script::PushBytesBuf::try_from(data)
                    .map_err(|e| DescriptorLibError::descriptor_parse(format!("push too large: {e}")))?,
            );
        } else if let Ok(n) = token.parse::<i64>() {
            builder = builder.push_int(n);
        } else {
            return Err(DescriptorLibError::descriptor_parse(format!(
                "unrecognized ASM token '{token}'"
            )));
        }
    }
    Ok(builder.into_script())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_pk_script() {
        let pk = "03a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";
        let asm = format!("{pk} OP_CHECKSIG");
        let script = assemble(&asm).unwrap();
        assert_eq!(script.len(), 1 + 33 + 1);
        assert!(script.as_bytes().ends_with(&[0xac]));
    }

    #[test]
    fn assembles_p2pkh_script() {
        let hash = "89abcdefabbaabbaabbaabbaabbaabbaabbaabba";
        let asm = format!("OP_DUP OP_HASH160 {hash} OP_EQUALVERIFY OP_CHECKSIG");
        let script = assemble(&asm).unwrap();
        assert_eq!(script.len(), 25);
    }

    #[test]
    fn rejects_unknown_token() {
        assert!(assemble("OP_NOT_A_REAL_OP").is_err());
    }
}
