// =============================================================================
// Execution Policy — per-canonical-market instrument sizing
// =============================================================================
//
// Loaded once at startup, immutable afterwards. The policy may restrict
// (disable) the execution instrument the process is anchored to but can never
// override the anchor itself; quantity always comes from base_size here and
// never from any UI.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

/// Sizing entry for one execution instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentPolicy {
    pub enabled: bool,
    pub base_size: u32,
    pub max_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPolicy {
    pub execution_instruments: HashMap<String, InstrumentPolicy>,
}

/// Full execution policy: canonical market → execution instrument → sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub canonical_markets: HashMap<String, MarketPolicy>,
}

impl ExecutionPolicy {
    /// Load and validate the policy, returning it with its content hash.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, String)> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read execution policy from {}", path.display()))?;
        let hash = hex::encode(Sha256::digest(&bytes));

        let policy: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse execution policy from {}", path.display()))?;
        policy.validate()?;

        info!(
            path = %path.display(),
            markets = policy.canonical_markets.len(),
            hash = %&hash[..12],
            "execution policy loaded"
        );
        Ok((policy, hash))
    }

    /// Structural validation: sizes must be sane for every entry, enabled or
    /// not. Any defect fails the load.
    pub fn validate(&self) -> Result<()> {
        if self.canonical_markets.is_empty() {
            bail!("execution policy has no canonical markets");
        }
        for (market, mp) in &self.canonical_markets {
            if mp.execution_instruments.is_empty() {
                bail!("canonical market {market} has no execution instruments");
            }
            for (exec, entry) in &mp.execution_instruments {
                if entry.base_size == 0 {
                    bail!("policy {market}/{exec} has base_size 0");
                }
                if entry.base_size > entry.max_size {
                    bail!(
                        "policy {market}/{exec} base_size {} exceeds max_size {}",
                        entry.base_size,
                        entry.max_size
                    );
                }
            }
        }
        Ok(())
    }

    pub fn entry(&self, canonical: &str, execution: &str) -> Option<&InstrumentPolicy> {
        self.canonical_markets
            .get(canonical)
            .and_then(|m| m.execution_instruments.get(execution))
    }

    /// Whether the (canonical, execution) pair is explicitly enabled.
    pub fn is_enabled(&self, canonical: &str, execution: &str) -> bool {
        self.entry(canonical, execution).map(|e| e.enabled).unwrap_or(false)
    }

    /// Resolve the order quantity for a pair. `None` when the pair is
    /// missing or disabled.
    pub fn order_quantity(&self, canonical: &str, execution: &str) -> Option<u32> {
        self.entry(canonical, execution)
            .filter(|e| e.enabled)
            .map(|e| e.base_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_policy() -> ExecutionPolicy {
        let json = r#"{
            "canonical_markets": {
                "ES": {
                    "execution_instruments": {
                        "MES": { "enabled": true,  "base_size": 2, "max_size": 5 },
                        "ES":  { "enabled": false, "base_size": 1, "max_size": 1 }
                    }
                }
            }
        }"#;
        let policy: ExecutionPolicy = serde_json::from_str(json).unwrap();
        policy.validate().unwrap();
        policy
    }

    #[test]
    fn quantity_comes_from_base_size() {
        let policy = sample_policy();
        assert_eq!(policy.order_quantity("ES", "MES"), Some(2));
        assert!(policy.is_enabled("ES", "MES"));
    }

    #[test]
    fn disabled_instrument_yields_no_quantity() {
        let policy = sample_policy();
        assert!(!policy.is_enabled("ES", "ES"));
        assert_eq!(policy.order_quantity("ES", "ES"), None);
    }

    #[test]
    fn unknown_pair_yields_none() {
        let policy = sample_policy();
        assert_eq!(policy.order_quantity("NQ", "MNQ"), None);
        assert!(policy.entry("ES", "MNQ").is_none());
    }

    #[test]
    fn zero_base_size_fails_validation() {
        let json = r#"{
            "canonical_markets": {
                "ES": { "execution_instruments": { "MES": { "enabled": true, "base_size": 0, "max_size": 5 } } }
            }
        }"#;
        let policy: ExecutionPolicy = serde_json::from_str(json).unwrap();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn base_size_above_max_fails_validation() {
        let json = r#"{
            "canonical_markets": {
                "ES": { "execution_instruments": { "MES": { "enabled": true, "base_size": 6, "max_size": 5 } } }
            }
        }"#;
        let policy: ExecutionPolicy = serde_json::from_str(json).unwrap();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn load_computes_stable_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let json = r#"{
            "canonical_markets": {
                "ES": { "execution_instruments": { "MES": { "enabled": true, "base_size": 1, "max_size": 3 } } }
            }
        }"#;
        std::fs::write(&path, json).unwrap();

        let (_, h1) = ExecutionPolicy::load(&path).unwrap();
        let (_, h2) = ExecutionPolicy::load(&path).unwrap();
        assert_eq!(h1, h2);
    }
}
