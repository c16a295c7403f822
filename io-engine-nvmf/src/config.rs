//! Target-wide configuration: a `once_cell::sync::Lazy` global,
//! populated from a TOML file at startup and consulted by value
//! everywhere else in the crate.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::auth::{DhGroupId, HashId};

/// Process-wide target configuration.
static CONFIG: Lazy<RwLock<TargetConfig>> =
    Lazy::new(|| RwLock::new(TargetConfig::default()));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Maximum registrants per namespace (Invariant 1 in spec §3/§8).
    pub max_registrants_per_ns: usize,
    /// Maximum pending AER requests per controller (§4.4).
    pub max_aer_per_ctrlr: usize,
    /// Maximum entries in a controller's changed-namespace list before
    /// coalescing into "all namespaces changed" (§4.4).
    pub max_changed_ns_per_ctrlr: usize,
    /// `CC_TIMEOUT_TSC` equivalent: time allowed for `CC.EN=1 -> CSTS.RDY=1`.
    pub cc_timeout_ms: u64,
    /// Floor applied to `max(KATO, floor)` when arming the auth timeout
    /// poller (§4.5).
    pub auth_timeout_floor_secs: u64,
    /// Hash algorithms the target is willing to negotiate, strongest
    /// first (§4.5 negotiation order).
    pub allowed_hashes: Vec<HashId>,
    /// DH groups the target is willing to negotiate, strongest first.
    pub allowed_dhgroups: Vec<DhGroupId>,
    /// `SCC_DISABLED` secure-channel-concatenation policy advertised by
    /// the target (§4.5).
    pub scc_disabled: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            max_registrants_per_ns: 16,
            max_aer_per_ctrlr: 4,
            max_changed_ns_per_ctrlr: 1024,
            cc_timeout_ms: 5_000,
            auth_timeout_floor_secs: 120,
            allowed_hashes: vec![HashId::Sha512, HashId::Sha384, HashId::Sha256],
            allowed_dhgroups: vec![
                DhGroupId::Ffdhe8192,
                DhGroupId::Ffdhe6144,
                DhGroupId::Ffdhe4096,
                DhGroupId::Ffdhe3072,
                DhGroupId::Ffdhe2048,
                DhGroupId::Null,
            ],
            scc_disabled: true,
        }
    }
}

impl TargetConfig {
    pub fn get() -> TargetConfig {
        CONFIG.read().expect("config lock poisoned").clone()
    }

    pub fn load_toml(text: &str) -> Result<(), toml::de::Error> {
        let parsed: TargetConfig = toml::from_str(text)?;
        *CONFIG.write().expect("config lock poisoned") = parsed;
        Ok(())
    }

    pub fn set(cfg: TargetConfig) {
        *CONFIG.write().expect("config lock poisoned") = cfg;
    }
}
