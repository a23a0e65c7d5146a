use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tranche_types::{ContractAddress, EscrowError};

/// One configured stablecoin deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub symbol: String,
    pub network: String,
    pub address: ContractAddress,
}

/// Static per-(currency symbol, network) contract-address table.
///
/// Multi-chain abstraction stops here: lookups against networks or
/// symbols that are not configured fail, they are never guessed.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    entries: HashMap<(String, String), ContractAddress>,
}

impl ContractRegistry {
    pub fn new(entries: Vec<TokenEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| ((e.symbol.to_uppercase(), e.network.to_lowercase()), e.address))
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, symbol: &str, network: &str) -> Result<ContractAddress, EscrowError> {
        self.entries
            .get(&(symbol.to_uppercase(), network.to_lowercase()))
            .copied()
            .ok_or_else(|| {
                EscrowError::InvalidArgument(format!(
                    "no contract configured for {} on {}",
                    symbol, network
                ))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ContractRegistry::new(vec![TokenEntry {
            symbol: "USDC".to_string(),
            network: "base".to_string(),
            address: ContractAddress::from_bytes([3; 20]),
        }]);
        assert!(registry.lookup("usdc", "Base").is_ok());
        assert!(registry.lookup("USDC", "base").is_ok());
    }

    #[test]
    fn test_unknown_pair_is_rejected() {
        let registry = ContractRegistry::new(vec![]);
        assert!(matches!(
            registry.lookup("USDC", "base"),
            Err(EscrowError::InvalidArgument(_))
        ));
    }
}
