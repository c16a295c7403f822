//! C3: subsystem registry — NQN-keyed subsystem set, host allow-list,
//! namespace array, controller set, listener set and state machine.
//!
//! Grounded on `examples/other_examples/bf20da01_*-subsystem.rs`
//! (`NvmfSubsystem`: `allow_host`/`disallow_host`/`set_allowed_hosts`,
//! `change_state` retry-on-EBUSY loop, `set_ana_state`) with the FFI
//! calls replaced by the in-memory model this crate owns. `disconnect_host`
//! tracks cntlid ownership the same way `ctrlrs` already tracks cntlid
//! allocation, and hands the affected cntlids back rather than reaching
//! into the poll group itself, matching `destroy`/`poll_destroy`'s
//! signal-then-let-the-caller-act pattern.

use std::collections::{HashMap, HashSet};

use snafu::Snafu;

use crate::error::{ErrorKind, ToErrorKind};
use crate::nqn::{self, DISCOVERY_NQN};
use crate::reservation::Namespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubType {
    Discovery,
    Nvme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemState {
    Inactive,
    Activating,
    Active,
    Pausing,
    Paused,
    Resuming,
    Deactivating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnaState {
    Optimized,
    NonOptimized,
    Inaccessible,
}

#[derive(Debug, Clone)]
pub struct TransportId {
    pub trtype: String,
    pub traddr: String,
    pub trsvcid: String,
}

pub struct Listener {
    pub listener_id: u8,
    pub trid: TransportId,
    pub ana_states: Vec<AnaState>,
    pub ana_state_change_count: u32,
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("invalid NQN: {source}"))]
    Nqn { source: nqn::Error },
    #[snafu(display("subsystem not found: {nqn}"))]
    NotFound { nqn: String },
    #[snafu(display("subsystem {nqn} already exists"))]
    AlreadyExists { nqn: String },
    #[snafu(display("host {host} not allowed on subsystem {nqn}"))]
    HostNotAllowed { nqn: String, host: String },
    #[snafu(display("illegal state transition from {from:?}"))]
    IllegalTransition { from: SubsystemState },
    #[snafu(display("operation requires subsystem to be inactive or paused"))]
    NotQuiescent,
    #[snafu(display("discovery subsystems cannot hold namespaces"))]
    DiscoverySubsystemNamespace,
    #[snafu(display("no free controller id in [{min}, {max}]"))]
    ControllerIdExhausted { min: u16, max: u16 },
    #[snafu(display("controller id {cntlid} already in use"))]
    ControllerIdInUse { cntlid: u16 },
    #[snafu(display("cntlid_max {max} is less than cntlid_min {min}"))]
    InvalidCntlidRange { min: u16, max: u16 },
    #[snafu(display("ana reporting is not enabled on subsystem {nqn}"))]
    AnaReportingDisabled { nqn: String },
    #[snafu(display("namespace {nsid} not found"))]
    NamespaceNotFound { nsid: u32 },
    #[snafu(display("destroy requires the subsystem to be Inactive"))]
    DestroyNotInactive,
    #[snafu(display("listener not found"))]
    ListenerNotFound,
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Nqn { .. } => ErrorKind::InvalidParam,
            Error::NotFound { .. } | Error::NamespaceNotFound { .. } | Error::ListenerNotFound => {
                ErrorKind::NotFound
            }
            Error::AlreadyExists { .. } | Error::ControllerIdInUse { .. } => {
                ErrorKind::AlreadyExists
            }
            Error::HostNotAllowed { .. } => ErrorKind::PermissionDenied,
            Error::IllegalTransition { .. }
            | Error::NotQuiescent
            | Error::DiscoverySubsystemNamespace
            | Error::InvalidCntlidRange { .. }
            | Error::AnaReportingDisabled { .. }
            | Error::DestroyNotInactive => ErrorKind::InvalidParam,
            Error::ControllerIdExhausted { .. } => ErrorKind::NoMemory,
        }
    }
}

pub struct Subsystem {
    pub id: u32,
    pub nqn: String,
    pub subtype: SubType,
    state: SubsystemState,
    /// Last stable state, used to revert a failed Activating/Resuming
    /// transition (§4.3).
    last_stable: SubsystemState,
    hosts: HashSet<String>,
    pub allow_any_host: bool,
    pub allow_any_listener: bool,
    pub ana_reporting: bool,
    pub listeners: Vec<Listener>,
    pub namespaces: HashMap<u32, Namespace>,
    pub max_nsid: u32,
    ctrlrs: HashSet<u16>,
    /// cntlid -> owning host NQN, so a host can be disconnected by name
    /// without the caller tracking the mapping itself (§4.3 `disconnect_host`).
    ctrlr_hosts: HashMap<u16, String>,
    min_cntlid: u16,
    max_cntlid: u16,
    next_cntlid: u16,
    pub sn: String,
    pub mn: String,
    pub auth_seqnum: u32,
    pub discovery_genctr: u32,
    async_destroy: bool,
}

impl Subsystem {
    pub fn new(id: u32, nqn_str: &str, subtype: SubType, max_nsid: u32) -> Result<Self, Error> {
        if nqn_str != DISCOVERY_NQN {
            nqn::validate(nqn_str).map_err(|source| Error::Nqn { source })?;
        }
        Ok(Subsystem {
            id,
            nqn: nqn_str.to_string(),
            subtype,
            state: SubsystemState::Inactive,
            last_stable: SubsystemState::Inactive,
            hosts: HashSet::new(),
            allow_any_host: false,
            allow_any_listener: false,
            ana_reporting: false,
            listeners: Vec::new(),
            namespaces: HashMap::new(),
            max_nsid,
            ctrlrs: HashSet::new(),
            ctrlr_hosts: HashMap::new(),
            min_cntlid: 1,
            max_cntlid: 0xFFEF,
            next_cntlid: 1,
            sn: String::new(),
            mn: String::new(),
            auth_seqnum: 0,
            discovery_genctr: 0,
            async_destroy: false,
        })
    }

    pub fn state(&self) -> SubsystemState {
        self.state
    }

    fn editable(&self) -> Result<(), Error> {
        match self.state {
            SubsystemState::Inactive | SubsystemState::Paused => Ok(()),
            _ => Err(Error::NotQuiescent),
        }
    }

    // ---- host allow-list (§4.3) ----

    pub fn host_allowed(&self, host_nqn: &str) -> bool {
        self.allow_any_host || self.hosts.contains(host_nqn)
    }

    pub fn add_host(&mut self, host_nqn: &str) -> Result<(), Error> {
        nqn::validate(host_nqn).map_err(|source| Error::Nqn { source })?;
        self.hosts.insert(host_nqn.to_string());
        self.discovery_genctr = self.discovery_genctr.wrapping_add(1);
        Ok(())
    }

    pub fn remove_host(&mut self, host_nqn: &str) -> Result<(), Error> {
        if self.hosts.remove(host_nqn) {
            self.discovery_genctr = self.discovery_genctr.wrapping_add(1);
        }
        Ok(())
    }

    pub fn set_allow_any_host(&mut self, allow: bool) {
        if self.allow_any_host != allow {
            self.allow_any_host = allow;
            self.discovery_genctr = self.discovery_genctr.wrapping_add(1);
        }
    }

    // ---- listeners (§4.3) ----

    pub fn add_listener(&mut self, trid: TransportId) -> Result<u8, Error> {
        self.editable()?;
        let used: HashSet<u8> = self.listeners.iter().map(|l| l.listener_id).collect();
        let listener_id = (0..16u8)
            .find(|id| !used.contains(id))
            .ok_or(Error::ControllerIdExhausted { min: 0, max: 16 })?;
        self.listeners.push(Listener {
            listener_id,
            trid,
            ana_states: vec![AnaState::Optimized; (self.max_nsid + 1) as usize],
            ana_state_change_count: 0,
        });
        self.discovery_genctr = self.discovery_genctr.wrapping_add(1);
        Ok(listener_id)
    }

    pub fn remove_listener(&mut self, listener_id: u8) -> Result<(), Error> {
        self.editable()?;
        let before = self.listeners.len();
        self.listeners.retain(|l| l.listener_id != listener_id);
        if self.listeners.len() == before {
            return Err(Error::ListenerNotFound);
        }
        self.discovery_genctr = self.discovery_genctr.wrapping_add(1);
        Ok(())
    }

    // ---- namespaces (§4.3) ----

    pub fn add_ns(&mut self, ns: Namespace) -> Result<(), Error> {
        self.editable()?;
        if self.subtype == SubType::Discovery {
            return Err(Error::DiscoverySubsystemNamespace);
        }
        if ns.nsid == 0 || ns.nsid > self.max_nsid {
            return Err(Error::NamespaceNotFound { nsid: ns.nsid });
        }
        self.namespaces.insert(ns.nsid, ns);
        Ok(())
    }

    pub fn remove_ns(&mut self, nsid: u32) -> Result<Namespace, Error> {
        self.editable()?;
        self.namespaces
            .remove(&nsid)
            .ok_or(Error::NamespaceNotFound { nsid })
    }

    // ---- cntlid allocation (§4.4) ----

    pub fn set_cntlid_range(&mut self, min: u16, max: u16) -> Result<(), Error> {
        if max < min {
            return Err(Error::InvalidCntlidRange { min, max });
        }
        self.min_cntlid = min;
        self.max_cntlid = max;
        self.next_cntlid = min;
        Ok(())
    }

    /// Round-robin allocation from `next_cntlid`, scanning at most the
    /// full range (§4.4).
    pub fn allocate_cntlid(&mut self, host_nqn: &str) -> Result<u16, Error> {
        let span = (self.max_cntlid - self.min_cntlid) as u32 + 1;
        for i in 0..span {
            let offset = (((self.next_cntlid - self.min_cntlid) as u32) + i) % span;
            let candidate = self.min_cntlid + offset as u16;
            if !self.ctrlrs.contains(&candidate) {
                self.ctrlrs.insert(candidate);
                self.ctrlr_hosts.insert(candidate, host_nqn.to_string());
                self.next_cntlid = if candidate == self.max_cntlid {
                    self.min_cntlid
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
        }
        Err(Error::ControllerIdExhausted {
            min: self.min_cntlid,
            max: self.max_cntlid,
        })
    }

    /// Register a statically assigned controller id; collision is an
    /// error (§4.4).
    pub fn reserve_static_cntlid(&mut self, cntlid: u16, host_nqn: &str) -> Result<(), Error> {
        if self.ctrlrs.contains(&cntlid) {
            return Err(Error::ControllerIdInUse { cntlid });
        }
        self.ctrlrs.insert(cntlid);
        self.ctrlr_hosts.insert(cntlid, host_nqn.to_string());
        Ok(())
    }

    pub fn release_cntlid(&mut self, cntlid: u16) {
        self.ctrlrs.remove(&cntlid);
        self.ctrlr_hosts.remove(&cntlid);
    }

    pub fn ctrlr_count(&self) -> usize {
        self.ctrlrs.len()
    }

    /// Tear down every controller belonging to `host_nqn` (§4.3 C3
    /// `disconnect_host`, distinct from `remove_host` which only edits the
    /// allow-list). `Subsystem` only tracks cntlid bookkeeping; the actual
    /// `Controller` objects live in the owning `PollGroup` (runtime.rs), so
    /// this returns the cntlids to disconnect for the caller to remove
    /// there, mirroring how `destroy`/`poll_destroy` hand teardown back to
    /// the poll loop instead of doing fabric-level work themselves.
    pub fn disconnect_host(&mut self, host_nqn: &str) -> Vec<u16> {
        let cntlids: Vec<u16> = self
            .ctrlr_hosts
            .iter()
            .filter(|(_, h)| h.as_str() == host_nqn)
            .map(|(cntlid, _)| *cntlid)
            .collect();
        for cntlid in &cntlids {
            self.ctrlrs.remove(cntlid);
            self.ctrlr_hosts.remove(cntlid);
        }
        cntlids
    }

    // ---- state machine (§4.3) ----

    fn transition(&mut self, target_intermediate: SubsystemState) -> Result<(), Error> {
        let allowed = matches!(
            (self.state, target_intermediate),
            (SubsystemState::Inactive, SubsystemState::Activating)
                | (SubsystemState::Active, SubsystemState::Pausing)
                | (SubsystemState::Paused, SubsystemState::Resuming)
                | (SubsystemState::Active, SubsystemState::Deactivating)
                | (SubsystemState::Paused, SubsystemState::Deactivating)
        );
        if !allowed {
            return Err(Error::IllegalTransition { from: self.state });
        }
        self.last_stable = self.state;
        self.state = target_intermediate;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.transition(SubsystemState::Activating)?;
        self.state = SubsystemState::Active;
        tracing::info!(nqn = %self.nqn, "subsystem started");
        Ok(())
    }

    pub fn start_failed(&mut self) {
        self.state = self.last_stable;
    }

    pub fn stop(&mut self) -> Result<(), Error> {
        self.transition(SubsystemState::Deactivating)?;
        self.state = SubsystemState::Inactive;
        tracing::info!(nqn = %self.nqn, "subsystem stopped");
        Ok(())
    }

    pub fn stop_failed(&mut self) {
        // §4.3: a failure in Deactivating from Active reverts to Active.
        self.state = SubsystemState::Active;
    }

    /// `nsid == 0` pauses every namespace and the subsystem as a whole;
    /// a specific `nsid` pauses only that namespace and leaves the
    /// subsystem's own state machine at `Active` (§4.3: "pausing may
    /// target a single nsid"). Returns whether the pause is already fully
    /// drained; if not, retry via [`Subsystem::poll_pause`] each tick.
    pub fn pause(&mut self, nsid: u32) -> Result<bool, Error> {
        if nsid == 0 {
            self.transition(SubsystemState::Pausing)?;
            for ns in self.namespaces.values_mut() {
                ns.request_pause();
            }
            tracing::info!(nqn = %self.nqn, "subsystem pausing");
            Ok(self.poll_pause())
        } else {
            let ns = self
                .namespaces
                .get_mut(&nsid)
                .ok_or(Error::NamespaceNotFound { nsid })?;
            ns.request_pause();
            Ok(ns.poll_pause())
        }
    }

    /// Retry a pending whole-subsystem pause; only meaningful after
    /// `pause(0)` returned `false`. Finalizes the subsystem's own
    /// `Pausing -> Paused` transition once every namespace has drained.
    pub fn poll_pause(&mut self) -> bool {
        let all_drained = self.namespaces.values_mut().all(|ns| ns.poll_pause());
        if all_drained && self.state == SubsystemState::Pausing {
            self.state = SubsystemState::Paused;
        }
        all_drained
    }

    /// `nsid == 0` resumes every namespace and the subsystem; a specific
    /// `nsid` resumes only that namespace.
    pub fn resume(&mut self, nsid: u32) -> Result<(), Error> {
        if nsid == 0 {
            self.transition(SubsystemState::Resuming)?;
            for ns in self.namespaces.values_mut() {
                ns.resume();
            }
            self.state = SubsystemState::Active;
            tracing::info!(nqn = %self.nqn, "subsystem resumed");
            Ok(())
        } else {
            self.namespaces
                .get_mut(&nsid)
                .ok_or(Error::NamespaceNotFound { nsid })?
                .resume();
            Ok(())
        }
    }

    pub fn resume_failed(&mut self) {
        self.state = self.last_stable;
    }

    /// Allowed only from Inactive; if controllers remain, `async_destroy`
    /// is set and retried on every poll tick until empty (§4.3).
    pub fn destroy(&mut self) -> Result<bool, Error> {
        if self.state != SubsystemState::Inactive {
            return Err(Error::DestroyNotInactive);
        }
        if !self.ctrlrs.is_empty() {
            self.async_destroy = true;
            return Ok(false);
        }
        self.namespaces.clear();
        self.listeners.clear();
        Ok(true)
    }

    pub fn poll_destroy(&mut self) -> bool {
        if self.async_destroy && self.ctrlrs.is_empty() {
            self.namespaces.clear();
            self.listeners.clear();
            self.async_destroy = false;
            true
        } else {
            false
        }
    }

    // ---- ANA (§4.3) ----

    pub fn set_ana_reporting(&mut self, enable: bool) {
        self.ana_reporting = enable;
    }

    pub fn set_ana_state(
        &mut self,
        listener_id: u8,
        anagrpid: u32,
        state: AnaState,
    ) -> Result<(), Error> {
        if !self.ana_reporting {
            return Err(Error::AnaReportingDisabled {
                nqn: self.nqn.clone(),
            });
        }
        let listener = self
            .listeners
            .iter_mut()
            .find(|l| l.listener_id == listener_id)
            .ok_or(Error::ListenerNotFound)?;

        if anagrpid == 0 {
            for s in listener.ana_states.iter_mut() {
                *s = state;
            }
        } else {
            if let Some(s) = listener.ana_states.get_mut(anagrpid as usize) {
                *s = state;
            }
        }
        listener.ana_state_change_count = listener.ana_state_change_count.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subsys() -> Subsystem {
        Subsystem::new(
            1,
            "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc",
            SubType::Nvme,
            32,
        )
        .unwrap()
    }

    #[test]
    fn allowed_state_transitions_happy_path() {
        let mut s = subsys();
        assert_eq!(s.state(), SubsystemState::Inactive);
        s.start().unwrap();
        assert_eq!(s.state(), SubsystemState::Active);
        s.pause(0).unwrap();
        assert_eq!(s.state(), SubsystemState::Paused);
        s.resume(0).unwrap();
        assert_eq!(s.state(), SubsystemState::Active);
        s.stop().unwrap();
        assert_eq!(s.state(), SubsystemState::Inactive);
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut s = subsys();
        assert!(matches!(s.resume(0), Err(Error::IllegalTransition { .. })));
    }

    #[test]
    fn destroy_requires_inactive() {
        let mut s = subsys();
        s.start().unwrap();
        assert!(matches!(s.destroy(), Err(Error::DestroyNotInactive)));
    }

    #[test]
    fn destroy_defers_while_controllers_remain() {
        let mut s = subsys();
        s.reserve_static_cntlid(5, "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000001").unwrap();
        assert_eq!(s.destroy().unwrap(), false);
        s.release_cntlid(5);
        assert!(s.poll_destroy());
    }

    #[test]
    fn cntlid_allocation_is_unique_and_round_robins() {
        let mut s = subsys();
        s.set_cntlid_range(1, 3).unwrap();
        let host = "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000001";
        let a = s.allocate_cntlid(host).unwrap();
        let b = s.allocate_cntlid(host).unwrap();
        let c = s.allocate_cntlid(host).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(matches!(
            s.allocate_cntlid(host),
            Err(Error::ControllerIdExhausted { .. })
        ));
    }

    #[test]
    fn disconnect_host_returns_its_cntlids_and_frees_them() {
        let mut s = subsys();
        s.set_cntlid_range(1, 8).unwrap();
        let host_a = "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-0000000000aa";
        let host_b = "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-0000000000bb";
        let a1 = s.allocate_cntlid(host_a).unwrap();
        let _a2 = s.allocate_cntlid(host_a).unwrap();
        let b1 = s.allocate_cntlid(host_b).unwrap();

        let mut disconnected = s.disconnect_host(host_a);
        disconnected.sort();
        let mut expected = vec![a1, _a2];
        expected.sort();
        assert_eq!(disconnected, expected);
        assert_eq!(s.ctrlr_count(), 1);

        assert!(s.disconnect_host(host_a).is_empty());
        assert_eq!(s.disconnect_host(host_b), vec![b1]);
        assert_eq!(s.ctrlr_count(), 0);
    }

    #[test]
    fn host_allowed_respects_allow_any() {
        let mut s = subsys();
        assert!(!s.host_allowed("nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000000"));
        s.set_allow_any_host(true);
        assert!(s.host_allowed("anything"));
    }

    #[test]
    fn listener_add_then_remove_restores_genctr() {
        let mut s = subsys();
        let before = s.discovery_genctr;
        let id = s
            .add_listener(TransportId {
                trtype: "TCP".into(),
                traddr: "10.0.0.1".into(),
                trsvcid: "4420".into(),
            })
            .unwrap();
        s.remove_listener(id).unwrap();
        assert_eq!(s.discovery_genctr, before + 2);
    }

    #[test]
    fn ns_add_requires_quiescent_state() {
        let mut s = subsys();
        s.start().unwrap();
        let ns = Namespace::new(1, Uuid::new_v4(), 1024, 512);
        assert!(matches!(s.add_ns(ns), Err(Error::NotQuiescent)));
    }
}
