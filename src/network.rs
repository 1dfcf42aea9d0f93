//! Network parameters (spec.md §6 "Networks").
//!
//! Identified abstractly by bech32 HRP, BIP32 version bytes, P2PKH/P2SH
//! version bytes and WIF prefix, rather than by a single enum discriminant —
//! callers constructing a `Network` for an alternative chain profile only
//! need to supply these fields, they never fall out of a match statement
//! buried in this crate.

use miniscript::bitcoin::Network as BitcoinNetwork;

/// A network profile. Two presets are provided (`BITCOIN`, `TESTNET`); both
/// carry `coin_type` per BIP44 (0 on mainnet, 1 otherwise, per spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub bip32_pub: [u8; 4],
    pub bip32_priv: [u8; 4],
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub wif_prefix: u8,
    pub bech32_hrp: &'static str,
    pub coin_type: u32,
    pub(crate) bitcoin_network: BitcoinNetwork,
}

impl Network {
    pub const BITCOIN: Network = Network {
        bip32_pub: [0x04, 0x88, 0xB2, 0x1E],
        bip32_priv: [0x04, 0x88, 0xAD, 0xE4],
        p2pkh_version: 0x00,
        p2sh_version: 0x05,
        wif_prefix: 0x80,
        bech32_hrp: "bc",
        coin_type: 0,
        bitcoin_network: BitcoinNetwork::Bitcoin,
    };

    pub const TESTNET: Network = Network {
        bip32_pub: [0x04, 0x35, 0x87, 0xCF],
        bip32_priv: [0x04, 0x35, 0x83, 0x94],
        p2pkh_version: 0x6F,
        p2sh_version: 0xC4,
        wif_prefix: 0xEF,
        bech32_hrp: "tb",
        coin_type: 1,
        bitcoin_network: BitcoinNetwork::Testnet,
    };

    pub fn is_mainnet(&self) -> bool {
        self.coin_type == 0
    }

    pub fn bitcoin_network(&self) -> BitcoinNetwork {
        self.bitcoin_network
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::BITCOIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_type_matches_mainnet_flag() {
        assert_eq!(Network::BITCOIN.coin_type, 0);
        assert!(Network::BITCOIN.is_mainnet());
        assert_eq!(Network::TESTNET.coin_type, 1);
        assert!(!Network::TESTNET.is_mainnet());
    }

    #[test]
    fn hrp_matches_known_values() {
        assert_eq!(Network::BITCOIN.bech32_hrp, "bc");
        assert_eq!(Network::TESTNET.bech32_hrp, "tb");
    }
}
