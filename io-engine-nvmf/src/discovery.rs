//! C7: discovery log page assembly — host/subtype/state/transport
//! filtering and the `genctr` change counter handed back in the log
//! page header.
//!
//! Grounded on `examples/original_source/lib/nvmf/ctrlr_discovery.c`'s
//! discovery log page assembly (filters a subsystem out unless the
//! host is allowed and the subsystem is in a state where it accepts new
//! connections) and teacher's discovery-NQN handling in
//! `examples/other_examples/e70c4f1e_*-target-nvmf.rs`.

use bitflags::bitflags;

use crate::subsystem::{Subsystem, SubsystemState, SubType, TransportId};

bitflags! {
    /// `tgt.discovery_filter` (§4.7): which fields of the request's trid
    /// a listener must match to appear in that host's discovery log.
    /// Unset bits mean "don't filter on this field".
    pub struct DiscoveryFilter: u8 {
        const MATCH_TRANSPORT_TYPE = 1 << 0;
        const MATCH_TRANSPORT_ADDRESS = 1 << 1;
        const MATCH_TRANSPORT_SVCID = 1 << 2;
    }
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        DiscoveryFilter::empty()
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryLogEntry {
    pub trtype: String,
    pub subtype: SubType,
    pub subnqn: String,
    pub trid: TransportId,
}

#[derive(Debug, Clone)]
pub struct DiscoveryLogPage {
    pub genctr: u64,
    pub entries: Vec<DiscoveryLogEntry>,
}

/// Per-host-connection discovery log assembler. `genctr` only ever
/// increases and is shared across the whole target (§4.7): any listener
/// or host-allow-list change on any subsystem invalidates every
/// in-flight discovery log.
pub struct DiscoveryLogBuilder {
    genctr: u64,
}

impl DiscoveryLogBuilder {
    pub fn new() -> Self {
        DiscoveryLogBuilder { genctr: 0 }
    }

    pub fn genctr(&self) -> u64 {
        self.genctr
    }

    pub fn bump(&mut self) {
        self.genctr = self.genctr.wrapping_add(1);
    }

    /// A subsystem is discoverable by `host_nqn` unless it is `Inactive`
    /// or `Deactivating`: `Activating`, `Active`, `Pausing`, `Paused` and
    /// `Resuming` all still appear (§4.7). The host must also be on its
    /// allow-list; the discovery subsystem itself never appears in its
    /// own log. `filter` gates which fields of `request_trid` (the
    /// transport the Get-Log-Page arrived on) a listener must match to
    /// be included.
    pub fn build(
        &self,
        subsystems: &[&Subsystem],
        host_nqn: &str,
        filter: DiscoveryFilter,
        request_trid: &TransportId,
    ) -> DiscoveryLogPage {
        let mut entries = Vec::new();
        for sub in subsystems {
            if sub.subtype == SubType::Discovery {
                continue;
            }
            if matches!(
                sub.state(),
                SubsystemState::Inactive | SubsystemState::Deactivating
            ) {
                continue;
            }
            if !sub.host_allowed(host_nqn) {
                continue;
            }
            for listener in &sub.listeners {
                if filter.contains(DiscoveryFilter::MATCH_TRANSPORT_TYPE)
                    && !listener.trid.trtype.eq_ignore_ascii_case(&request_trid.trtype)
                {
                    continue;
                }
                if filter.contains(DiscoveryFilter::MATCH_TRANSPORT_ADDRESS)
                    && listener.trid.traddr != request_trid.traddr
                {
                    continue;
                }
                if filter.contains(DiscoveryFilter::MATCH_TRANSPORT_SVCID)
                    && listener.trid.trsvcid != request_trid.trsvcid
                {
                    continue;
                }
                entries.push(DiscoveryLogEntry {
                    trtype: listener.trid.trtype.clone(),
                    subtype: sub.subtype,
                    subnqn: sub.nqn.clone(),
                    trid: TransportId {
                        trtype: listener.trid.trtype.clone(),
                        traddr: listener.trid.traddr.clone(),
                        trsvcid: listener.trid.trsvcid.clone(),
                    },
                });
            }
        }
        DiscoveryLogPage {
            genctr: self.genctr,
            entries,
        }
    }
}

impl Default for DiscoveryLogBuilder {
    fn default() -> Self {
        Self::new()
    }
}
