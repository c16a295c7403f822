//! C2: per-namespace registrants, reservation type/holder, persistence
//! hooks and notification log.
//!
//! Grounded on `examples/other_examples/ee498252_*-nexus_child.rs`
//! (`NvmeReservation`, `resv_register`/`resv_acquire`/`resv_release`/
//! `resv_holder`) and the preempt-table semantics in
//! `examples/original_source/lib/nvmf/subsystem_rbd_resrv.c`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use uuid::Uuid;

use crate::bdev::PtplSink;
use crate::config::TargetConfig;
use crate::error::{ErrorKind, ToErrorKind};

/// Reservation type, numbered to match the NVMe RTYPE field (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReservationType {
    None = 0,
    WriteExclusive = 1,
    ExclusiveAccess = 2,
    WriteExclusiveRegOnly = 3,
    ExclusiveAccessRegOnly = 4,
    WriteExclusiveAllRegs = 5,
    ExclusiveAccessAllRegs = 6,
}

impl ReservationType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ReservationType::*;
        Some(match v {
            0 => None,
            1 => WriteExclusive,
            2 => ExclusiveAccess,
            3 => WriteExclusiveRegOnly,
            4 => ExclusiveAccessRegOnly,
            5 => WriteExclusiveAllRegs,
            6 => ExclusiveAccessAllRegs,
            _ => return Option::None,
        })
    }

    fn is_all_regs(self) -> bool {
        matches!(
            self,
            ReservationType::WriteExclusiveAllRegs | ReservationType::ExclusiveAccessAllRegs
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAction {
    RegisterKey,
    UnregisterKey,
    ReplaceKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAction {
    Acquire,
    Preempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    Release,
    Clear,
}

/// NVMe RREGA `CPTPL` field (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cptpl {
    NoChange,
    Clear,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

/// Per-namespace quiesce state (§4.2, §4.3: "pausing may target a single
/// nsid ... per-namespace io_outstanding and state allow pausing a
/// namespace without pausing the whole subsystem").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsState {
    Active,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registrant {
    pub host_uuid: Uuid,
    pub rkey: u64,
}

/// Events fanned out to controllers as AERs (§4.2, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationNotice {
    ReservationReleased,
    RegistrationPreempted,
    ReservationPreempted,
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("namespace already has {max} registrants"))]
    RegistrantTableFull { max: usize },
    #[snafu(display("reservation conflict"))]
    ReservationConflict,
    #[snafu(display("nrkey must be non-zero for REGISTER_KEY"))]
    InvalidRegisterKey,
    #[snafu(display("no registrant matches crkey"))]
    NoMatchingRegistrant,
    #[snafu(display("EDS bit must be set for reservation report"))]
    EdsNotSet,
    #[snafu(display("persistence sink failed: {reason}"))]
    PersistenceFailed { reason: String },
    #[snafu(display("invalid reservation type byte {value}"))]
    InvalidReservationType { value: u8 },
    #[snafu(display("namespace is paused"))]
    NamespacePaused,
    #[snafu(display("namespace has no PTPL sink configured"))]
    PtplUnsupported,
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::ReservationConflict => ErrorKind::ReservationConflict,
            Error::PersistenceFailed { .. } => ErrorKind::InternalDeviceError,
            Error::NamespacePaused => ErrorKind::Busy,
            Error::PtplUnsupported => ErrorKind::InternalDeviceError,
            _ => ErrorKind::InvalidParam,
        }
    }
}

/// On-disk shape, §6.4. Missing optional fields default per the
/// documented backward-compat rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtplInfo {
    #[serde(default)]
    pub ptpl: bool,
    #[serde(default)]
    pub rtype: u32,
    #[serde(default)]
    pub crkey: u64,
    pub bdev_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_uuid: Option<String>,
    pub registrants: Vec<PtplRegistrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PtplRegistrant {
    pub rkey: u64,
    pub host_uuid: String,
}

pub struct Namespace {
    pub nsid: u32,
    pub anagrpid: u32,
    pub uuid: Uuid,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub num_blocks: u64,
    pub block_size: u32,
    registrants: Vec<Registrant>,
    pub crkey: u64,
    pub rtype: ReservationType,
    pub holder: Option<Registrant>,
    pub ptpl_activated: bool,
    ptpl_sink: Option<Box<dyn PtplSink>>,
    pub gen: u32,
    io_outstanding: u64,
    state: NsState,
    /// Set by [`Namespace::request_pause`]; cleared once
    /// [`Namespace::poll_pause`] observes `io_outstanding == 0`.
    pausing: bool,
    max_registrants: usize,
}

impl Namespace {
    pub fn new(nsid: u32, uuid: Uuid, num_blocks: u64, block_size: u32) -> Self {
        Namespace {
            nsid,
            anagrpid: nsid,
            uuid,
            nguid: *uuid.as_bytes(),
            eui64: [0; 8],
            num_blocks,
            block_size,
            registrants: Vec::new(),
            crkey: 0,
            rtype: ReservationType::None,
            holder: None,
            ptpl_activated: false,
            ptpl_sink: None,
            gen: 0,
            io_outstanding: 0,
            state: NsState::Active,
            pausing: false,
            max_registrants: TargetConfig::get().max_registrants_per_ns,
        }
    }

    pub fn with_ptpl_sink(mut self, sink: Box<dyn PtplSink>) -> Self {
        self.ptpl_sink = Some(sink);
        self
    }

    pub fn registrants(&self) -> &[Registrant] {
        &self.registrants
    }

    fn find_registrant(&self, host_uuid: Uuid) -> Option<usize> {
        self.registrants.iter().position(|r| r.host_uuid == host_uuid)
    }

    fn is_holder(&self, host_uuid: Uuid) -> bool {
        self.holder.map(|h| h.host_uuid == host_uuid).unwrap_or(false)
    }

    fn bump_gen(&mut self) {
        self.gen = self.gen.wrapping_add(1);
    }

    fn persist(&self) -> Result<(), Error> {
        if !self.ptpl_activated {
            return Ok(());
        }
        let sink = match &self.ptpl_sink {
            Some(s) => s,
            None => return Ok(()),
        };
        let info = PtplInfo {
            ptpl: self.ptpl_activated,
            rtype: self.rtype as u32,
            crkey: self.crkey,
            bdev_uuid: self.uuid.to_string(),
            holder_uuid: self.holder.map(|h| h.host_uuid.to_string()),
            registrants: self
                .registrants
                .iter()
                .map(|r| PtplRegistrant {
                    rkey: r.rkey,
                    host_uuid: r.host_uuid.to_string(),
                })
                .collect(),
        };
        sink.update(&info)
            .map_err(|reason| Error::PersistenceFailed { reason })
    }

    /// Restore in-memory state from a previously persisted [`PtplInfo`]
    /// (§6.4, §8 S6). Validates `crkey` corresponds to a registrant.
    pub fn restore_ptpl(&mut self, info: PtplInfo) -> Result<(), Error> {
        if info.crkey != 0 && !info.registrants.iter().any(|r| r.rkey == info.crkey) {
            return Err(Error::InvalidReservationType { value: 0 });
        }
        self.ptpl_activated = info.ptpl;
        self.rtype =
            ReservationType::from_u8(info.rtype as u8).ok_or(Error::InvalidReservationType {
                value: info.rtype as u8,
            })?;
        self.crkey = info.crkey;
        self.registrants = info
            .registrants
            .iter()
            .filter_map(|r| {
                Uuid::parse_str(&r.host_uuid).ok().map(|host_uuid| Registrant {
                    host_uuid,
                    rkey: r.rkey,
                })
            })
            .collect();
        self.holder = info.holder_uuid.and_then(|h| {
            let host_uuid = Uuid::parse_str(&h).ok()?;
            self.registrants.iter().find(|r| r.host_uuid == host_uuid).copied()
        });
        Ok(())
    }

    pub fn get_registrant(&self, host_uuid: Uuid) -> Option<Registrant> {
        self.registrants.iter().find(|r| r.host_uuid == host_uuid).copied()
    }

    pub fn state(&self) -> NsState {
        self.state
    }

    pub fn io_outstanding(&self) -> u64 {
        self.io_outstanding
    }

    /// Begin quiescing: new I/O is refused from here on (§4.3, §5
    /// "refusing new submissions and waiting for io_outstanding == 0").
    /// Namespaces with no in-flight I/O pause immediately.
    pub fn request_pause(&mut self) {
        self.pausing = true;
        self.try_finish_pause();
    }

    fn try_finish_pause(&mut self) -> bool {
        if self.pausing && self.io_outstanding == 0 {
            self.state = NsState::Paused;
            self.pausing = false;
        }
        self.state == NsState::Paused
    }

    /// Retried once per reactor tick while a pause is outstanding (mirrors
    /// [`crate::subsystem::Subsystem::poll_destroy`]'s retry-until-drained
    /// shape). Returns `true` once the namespace has actually paused.
    pub fn poll_pause(&mut self) -> bool {
        self.try_finish_pause()
    }

    pub fn resume(&mut self) {
        self.pausing = false;
        self.state = NsState::Active;
    }

    /// Admit one I/O: rejected while paused or while a pause is pending.
    /// Called after the reservation access check and right before
    /// dispatching to the `BlockDevice` (§4.2 access-check sequence, step
    /// 5). Every successful call must be matched by [`Namespace::end_io`].
    pub fn begin_io(&mut self) -> Result<(), Error> {
        if self.state == NsState::Paused || self.pausing {
            return Err(Error::NamespacePaused);
        }
        self.io_outstanding += 1;
        Ok(())
    }

    pub fn end_io(&mut self) {
        self.io_outstanding = self.io_outstanding.saturating_sub(1);
        self.try_finish_pause();
    }

    /// NVMe Reservation Register (§4.2).
    pub fn register(
        &mut self,
        host_uuid: Uuid,
        action: RegisterAction,
        iekey: bool,
        crkey: u64,
        nrkey: u64,
        cptpl: Cptpl,
    ) -> Result<Vec<(Uuid, ReservationNotice)>, Error> {
        if matches!(cptpl, Cptpl::Set) && self.ptpl_sink.is_none() {
            return Err(Error::PtplUnsupported);
        }

        let mut notices = Vec::new();
        let existing = self.find_registrant(host_uuid);

        match action {
            RegisterAction::RegisterKey => match existing {
                None => {
                    if nrkey == 0 {
                        return Err(Error::InvalidRegisterKey);
                    }
                    if self.registrants.len() >= self.max_registrants {
                        return Err(Error::RegistrantTableFull {
                            max: self.max_registrants,
                        });
                    }
                    self.registrants.push(Registrant { host_uuid, rkey: nrkey });
                    self.bump_gen();
                }
                Some(idx) => {
                    if self.registrants[idx].rkey != nrkey {
                        return Err(Error::ReservationConflict);
                    }
                    // Idempotent no-op (§8 round-trip property): no gen bump.
                }
            },
            RegisterAction::UnregisterKey => {
                let idx = existing.ok_or(Error::NoMatchingRegistrant)?;
                if !iekey && crkey != self.registrants[idx].rkey {
                    return Err(Error::NoMatchingRegistrant);
                }
                let was_holder = self.is_holder(host_uuid);
                self.registrants.remove(idx);
                self.bump_gen();

                if was_holder {
                    notices.extend(self.release_or_reassign_holder(host_uuid));
                }
            }
            RegisterAction::ReplaceKey => match existing {
                Some(idx) => {
                    if !iekey && crkey != self.registrants[idx].rkey {
                        return Err(Error::NoMatchingRegistrant);
                    }
                    self.registrants[idx].rkey = nrkey;
                    if self.is_holder(host_uuid) {
                        self.holder = Some(self.registrants[idx]);
                    }
                    if self.crkey == crkey {
                        self.crkey = nrkey;
                    }
                    self.bump_gen();
                }
                None => {
                    if !iekey {
                        return Err(Error::NoMatchingRegistrant);
                    }
                    if self.registrants.len() >= self.max_registrants {
                        return Err(Error::RegistrantTableFull {
                            max: self.max_registrants,
                        });
                    }
                    self.registrants.push(Registrant { host_uuid, rkey: nrkey });
                    self.bump_gen();
                }
            },
        }

        match cptpl {
            Cptpl::NoChange => {}
            Cptpl::Clear => self.ptpl_activated = false,
            Cptpl::Set => self.ptpl_activated = true,
        }

        self.persist()?;
        Ok(notices)
    }

    /// When the holder is removed by unregister: under `AllRegs` types the
    /// first remaining registrant becomes holder, otherwise the
    /// reservation releases (§4.2).
    fn release_or_reassign_holder(&mut self, issuer: Uuid) -> Vec<(Uuid, ReservationNotice)> {
        let mut notices = Vec::new();
        let gates_notify = matches!(
            self.rtype,
            ReservationType::WriteExclusiveRegOnly
                | ReservationType::WriteExclusiveAllRegs
                | ReservationType::ExclusiveAccessRegOnly
                | ReservationType::ExclusiveAccessAllRegs
        );

        if self.rtype.is_all_regs() && !self.registrants.is_empty() {
            self.holder = self.registrants.first().copied();
        } else {
            self.holder = None;
            self.rtype = ReservationType::None;
            self.crkey = 0;
        }

        if gates_notify {
            for r in &self.registrants {
                if r.host_uuid != issuer {
                    notices.push((r.host_uuid, ReservationNotice::ReservationReleased));
                }
            }
        }
        notices
    }

    /// NVMe Reservation Acquire (§4.2).
    pub fn acquire(
        &mut self,
        host_uuid: Uuid,
        action: AcquireAction,
        rtype: ReservationType,
        crkey: u64,
        prkey: u64,
    ) -> Result<Vec<(Uuid, ReservationNotice)>, Error> {
        let idx = self.find_registrant(host_uuid).ok_or(Error::NoMatchingRegistrant)?;
        if self.registrants[idx].rkey != crkey {
            return Err(Error::NoMatchingRegistrant);
        }

        match action {
            AcquireAction::Acquire => {
                match self.holder {
                    None => {
                        self.holder = Some(self.registrants[idx]);
                        self.rtype = rtype;
                        self.crkey = crkey;
                        self.bump_gen();
                        self.persist()?;
                        Ok(Vec::new())
                    }
                    Some(h) if h.host_uuid == host_uuid && self.rtype == rtype => Ok(Vec::new()),
                    _ => Err(Error::ReservationConflict),
                }
            }
            AcquireAction::Preempt => self.preempt(host_uuid, rtype, crkey, prkey),
        }
    }

    fn preempt(
        &mut self,
        issuer: Uuid,
        rtype: ReservationType,
        crkey: u64,
        prkey: u64,
    ) -> Result<Vec<(Uuid, ReservationNotice)>, Error> {
        let pre_hosts: Vec<Uuid> = self.registrants.iter().map(|r| r.host_uuid).collect();
        let mut reservation_released = false;

        match self.holder {
            None => {
                // PRKEY matches unregister-by-key against every registrant
                // carrying that key.
                self.registrants.retain(|r| r.rkey != prkey || r.host_uuid == issuer);
            }
            Some(holder) if !self.rtype.is_all_regs() => {
                if prkey == crkey && holder.host_uuid == issuer {
                    // Preempt self: only rtype changes.
                    self.rtype = rtype;
                    reservation_released = true;
                } else if prkey == self.crkey {
                    // Preempt the current holder: it loses its registrant
                    // entry entirely, not just the reservation (§4.2).
                    self.registrants.retain(|r| r.host_uuid != holder.host_uuid);
                    self.holder = Some(self.registrants[self
                        .find_registrant(issuer)
                        .ok_or(Error::NoMatchingRegistrant)?]);
                    self.rtype = rtype;
                    self.crkey = crkey;
                    reservation_released = true;
                } else if prkey != 0 {
                    self.registrants.retain(|r| r.rkey != prkey || r.host_uuid == issuer);
                }
            }
            Some(_) => {
                if prkey == 0 {
                    self.registrants.retain(|r| r.host_uuid == issuer);
                    self.holder = self.find_registrant(issuer).map(|i| self.registrants[i]);
                    self.rtype = rtype;
                    self.crkey = crkey;
                    reservation_released = true;
                } else if prkey != 0 && prkey != self.crkey {
                    self.registrants.retain(|r| r.rkey != prkey || r.host_uuid == issuer);
                } else {
                    self.holder = self.find_registrant(issuer).map(|i| self.registrants[i]);
                    self.rtype = rtype;
                    self.crkey = crkey;
                    reservation_released = true;
                }
            }
        }

        self.bump_gen();
        self.persist()?;

        let post_hosts: Vec<Uuid> = self.registrants.iter().map(|r| r.host_uuid).collect();
        let mut notices = Vec::new();
        for h in pre_hosts {
            if h != issuer && !post_hosts.contains(&h) {
                notices.push((h, ReservationNotice::RegistrationPreempted));
            }
        }
        if reservation_released && self.registrants.iter().any(|r| r.host_uuid != issuer) {
            for r in &self.registrants {
                if r.host_uuid != issuer {
                    notices.push((r.host_uuid, ReservationNotice::ReservationReleased));
                }
            }
        }
        Ok(notices)
    }

    /// NVMe Reservation Release (§4.2).
    pub fn release(
        &mut self,
        host_uuid: Uuid,
        action: ReleaseAction,
        rtype: ReservationType,
        crkey: u64,
    ) -> Result<Vec<(Uuid, ReservationNotice)>, Error> {
        let idx = self.find_registrant(host_uuid).ok_or(Error::NoMatchingRegistrant)?;
        if self.registrants[idx].rkey != crkey {
            return Err(Error::NoMatchingRegistrant);
        }

        match action {
            ReleaseAction::Release => {
                let holder = match self.holder {
                    None => return Ok(Vec::new()),
                    Some(h) => h,
                };
                if self.rtype != rtype {
                    return Err(Error::InvalidReservationType { value: rtype as u8 });
                }
                if holder.host_uuid != host_uuid {
                    return Ok(Vec::new());
                }
                self.holder = None;
                self.rtype = ReservationType::None;
                self.crkey = 0;
                self.bump_gen();
                self.persist()?;

                let mut notices = Vec::new();
                if !matches!(rtype, ReservationType::WriteExclusive | ReservationType::ExclusiveAccess) {
                    for r in &self.registrants {
                        if r.host_uuid != host_uuid {
                            notices.push((r.host_uuid, ReservationNotice::ReservationReleased));
                        }
                    }
                }
                Ok(notices)
            }
            ReleaseAction::Clear => {
                let previous: Vec<Uuid> = self.registrants.iter().map(|r| r.host_uuid).collect();
                self.registrants.clear();
                self.holder = None;
                self.rtype = ReservationType::None;
                self.crkey = 0;
                self.bump_gen();
                self.persist()?;

                Ok(previous
                    .into_iter()
                    .filter(|h| *h != host_uuid)
                    .map(|h| (h, ReservationNotice::RegistrationPreempted))
                    .collect())
            }
        }
    }

    /// Access check for read/write/unmap (§4.2 truth table).
    pub fn check_access(&self, host_uuid: Uuid, op: IoOp) -> Result<(), Error> {
        use IoOp::*;
        use ReservationType::*;

        if self.rtype == None {
            return Ok(());
        }

        let issuer_is_holder = self.is_holder(host_uuid);
        let issuer_is_registrant = self.find_registrant(host_uuid).is_some();

        let allowed = match (self.rtype, op) {
            (WriteExclusive | WriteExclusiveRegOnly | WriteExclusiveAllRegs, Read) => true,
            (ExclusiveAccess | ExclusiveAccessRegOnly | ExclusiveAccessAllRegs, _) => {
                issuer_is_holder
            }
            (WriteExclusive, Write) => issuer_is_holder,
            (WriteExclusiveRegOnly | WriteExclusiveAllRegs, Write) => issuer_is_registrant,
            (None, _) => true,
        };

        if allowed {
            Ok(())
        } else {
            tracing::debug!(
                nsid = self.nsid,
                ?host_uuid,
                rtype = ?self.rtype,
                "reservation conflict"
            );
            Err(Error::ReservationConflict)
        }
    }

    /// Reservation Report (§4.2): 64-byte header fields plus one record per
    /// registrant, in insertion order. `eds` is CDW11's EDS bit; the
    /// command must set it since this crate only ever emits the extended
    /// data form.
    pub fn report(&self, eds: bool) -> Result<ReservationReport, Error> {
        if !eds {
            return Err(Error::EdsNotSet);
        }
        Ok(ReservationReport {
            generation: self.gen,
            rtype: self.rtype,
            ptpl_activated: self.ptpl_activated,
            registrants: self
                .registrants
                .iter()
                .map(|r| ReservationReportRecord {
                    cntlid: 0xFFFF,
                    rkey: r.rkey,
                    host_uuid: r.host_uuid,
                    is_holder: self.holder.map(|h| h.host_uuid) == Some(r.host_uuid),
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReservationReportRecord {
    pub cntlid: u16,
    pub rkey: u64,
    pub host_uuid: Uuid,
    pub is_holder: bool,
}

#[derive(Debug, Clone)]
pub struct ReservationReport {
    pub generation: u32,
    pub rtype: ReservationType,
    pub ptpl_activated: bool,
    pub registrants: Vec<ReservationReportRecord>,
}

impl ReservationReport {
    /// Encode into the `ReservationStatusExtendedData` wire layout (§6.3):
    /// a fixed 64-byte header (`ReservationStatusExtendedDataHeader`)
    /// followed by one 64-byte `RegisteredControllerExtendedData` record
    /// per registrant, in insertion order, for the executor to copy into
    /// the command's data buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 64 + self.registrants.len() * 64];
        buf[0..4].copy_from_slice(&self.generation.to_le_bytes());
        buf[4] = self.rtype as u8;
        buf[5..7].copy_from_slice(&(self.registrants.len() as u16).to_le_bytes());
        buf[9] = self.ptpl_activated as u8;

        for (i, r) in self.registrants.iter().enumerate() {
            let off = 64 + i * 64;
            buf[off..off + 2].copy_from_slice(&r.cntlid.to_le_bytes());
            buf[off + 2] = r.is_holder as u8;
            buf[off + 8..off + 16].copy_from_slice(&r.rkey.to_le_bytes());
            buf[off + 16..off + 32].copy_from_slice(r.host_uuid.as_bytes());
        }
        buf
    }
}

/// A controller's backlog of nsids changed since the last AEN, coalescing
/// into "all namespaces changed" once the cap is exceeded (§4.4, §8 S4).
pub struct ChangedNsLog {
    entries: VecDeque<u32>,
    max: usize,
    coalesced: bool,
}

impl ChangedNsLog {
    pub fn new(max: usize) -> Self {
        ChangedNsLog {
            entries: VecDeque::new(),
            max,
            coalesced: false,
        }
    }

    pub fn record(&mut self, nsid: u32) {
        if self.coalesced {
            return;
        }
        if !self.entries.contains(&nsid) {
            self.entries.push_back(nsid);
        }
        if self.entries.len() > self.max {
            self.coalesced = true;
            self.entries.clear();
        }
    }

    pub fn snapshot(&self) -> Vec<u32> {
        if self.coalesced {
            vec![0xFFFF_FFFF]
        } else {
            self.entries.iter().copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new(1, Uuid::new_v4(), 1024, 512)
    }

    fn host(b: u8) -> Uuid {
        Uuid::from_bytes([b; 16])
    }

    #[test]
    fn s1_register_acquire_read_denied_for_non_registrant() {
        let mut n = ns();
        let a = host(0xAA);
        let b = host(0xBB);

        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        n.acquire(a, AcquireAction::Acquire, ReservationType::ExclusiveAccess, 0x1, 0)
            .unwrap();

        assert_eq!(n.holder.unwrap().host_uuid, a);
        assert_eq!(n.rtype, ReservationType::ExclusiveAccess);

        assert!(matches!(
            n.check_access(b, IoOp::Read),
            Err(Error::ReservationConflict)
        ));
        assert!(n.check_access(a, IoOp::Read).is_ok());
    }

    #[test]
    fn s2_preempt_self_changes_rtype_releases_reservation() {
        let mut n = ns();
        let a = host(0xAA);
        let other = host(0xCC);

        n.register(a, RegisterAction::RegisterKey, false, 0, 0x5, Cptpl::NoChange)
            .unwrap();
        n.register(other, RegisterAction::RegisterKey, false, 0, 0x7, Cptpl::NoChange)
            .unwrap();
        n.acquire(a, AcquireAction::Acquire, ReservationType::WriteExclusive, 0x5, 0)
            .unwrap();

        let notices = n
            .acquire(a, AcquireAction::Preempt, ReservationType::ExclusiveAccess, 0x5, 0x5)
            .unwrap();

        assert_eq!(n.rtype, ReservationType::ExclusiveAccess);
        assert_eq!(n.holder.unwrap().host_uuid, a);
        assert!(notices
            .iter()
            .any(|(h, notice)| *h == other && *notice == ReservationNotice::ReservationReleased));
    }

    #[test]
    fn preempt_by_another_registrant_removes_old_holder() {
        let mut n = ns();
        let holder = host(0xAA);
        let issuer = host(0xBB);

        n.register(holder, RegisterAction::RegisterKey, false, 0, 0x5, Cptpl::NoChange)
            .unwrap();
        n.register(issuer, RegisterAction::RegisterKey, false, 0, 0x7, Cptpl::NoChange)
            .unwrap();
        n.acquire(holder, AcquireAction::Acquire, ReservationType::WriteExclusive, 0x5, 0)
            .unwrap();

        let notices = n
            .acquire(issuer, AcquireAction::Preempt, ReservationType::ExclusiveAccess, 0x7, 0x5)
            .unwrap();

        assert_eq!(n.holder.unwrap().host_uuid, issuer);
        assert_eq!(n.rtype, ReservationType::ExclusiveAccess);
        assert!(n.get_registrant(holder).is_none());
        assert!(notices
            .iter()
            .any(|(h, notice)| *h == holder && *notice == ReservationNotice::RegistrationPreempted));
        assert!(matches!(
            n.check_access(holder, IoOp::Read),
            Err(Error::ReservationConflict)
        ));
    }

    #[test]
    fn register_idempotent_same_key_no_gen_bump() {
        let mut n = ns();
        let a = host(0xAA);
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        let gen = n.gen;
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        assert_eq!(n.gen, gen);
    }

    #[test]
    fn register_conflict_on_mismatched_key() {
        let mut n = ns();
        let a = host(0xAA);
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        assert!(matches!(
            n.register(a, RegisterAction::RegisterKey, false, 0, 0x2, Cptpl::NoChange),
            Err(Error::ReservationConflict)
        ));
    }

    #[test]
    fn registrant_table_full_rejects_17th() {
        let mut n = ns();
        for i in 0..16u8 {
            n.register(host(i), RegisterAction::RegisterKey, false, 0, i as u64 + 1, Cptpl::NoChange)
                .unwrap();
        }
        assert!(matches!(
            n.register(host(200), RegisterAction::RegisterKey, false, 0, 99, Cptpl::NoChange),
            Err(Error::RegistrantTableFull { max: 16 })
        ));
    }

    #[test]
    fn report_rejects_missing_eds_bit() {
        let n = ns();
        assert!(matches!(n.report(false), Err(Error::EdsNotSet)));
    }

    #[test]
    fn report_encodes_holder_record_with_status_bit_set() {
        let mut n = ns();
        let a = host(0xAA);
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        n.acquire(a, AcquireAction::Acquire, ReservationType::ExclusiveAccess, 0x1, 0)
            .unwrap();

        let report = n.report(true).unwrap();
        assert_eq!(report.registrants.len(), 1);
        assert!(report.registrants[0].is_holder);

        let encoded = report.encode();
        assert_eq!(encoded.len(), 64 + 64);
        assert_eq!(&encoded[0..4], &n.gen.to_le_bytes());
        assert_eq!(encoded[4], ReservationType::ExclusiveAccess as u8);
        assert_eq!(&encoded[5..7], &1u16.to_le_bytes());
        // Controller record: rcsts (status bit) at offset 2, rkey at 8..16,
        // host_uuid at 16..32 (§6.3 `RegisteredControllerExtendedData`).
        assert_eq!(encoded[64 + 2], 1);
        assert_eq!(&encoded[64 + 8..64 + 16], &1u64.to_le_bytes());
        assert_eq!(&encoded[64 + 16..64 + 32], &a.as_bytes()[..]);
    }

    #[test]
    fn gen_strictly_increases_after_mutation() {
        let mut n = ns();
        let a = host(0xAA);
        let before = n.gen;
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        assert!(n.gen > before);
    }

    #[test]
    fn last_registrant_unregister_under_all_regs_fully_releases() {
        let mut n = ns();
        let a = host(0xAA);
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        n.acquire(a, AcquireAction::Acquire, ReservationType::ExclusiveAccessAllRegs, 0x1, 0)
            .unwrap();
        assert_eq!(n.holder, Some(Registrant { host_uuid: a, rkey: 0x1 }));

        n.register(a, RegisterAction::UnregisterKey, false, 0x1, 0, Cptpl::NoChange)
            .unwrap();

        assert!(n.holder.is_none());
        assert_eq!(n.rtype, ReservationType::None);
        assert!(n.registrants().is_empty());
    }

    #[test]
    fn pause_with_no_outstanding_io_completes_immediately() {
        let mut n = ns();
        n.request_pause();
        assert_eq!(n.state(), NsState::Paused);
        assert!(n.begin_io().is_err());
    }

    #[test]
    fn pause_with_outstanding_io_defers_until_drained() {
        let mut n = ns();
        n.begin_io().unwrap();
        n.request_pause();
        assert_eq!(n.state(), NsState::Active);
        assert!(!n.poll_pause());
        n.end_io();
        assert!(n.poll_pause());
        assert_eq!(n.state(), NsState::Paused);
    }

    #[test]
    fn resume_clears_pause_and_admits_io_again() {
        let mut n = ns();
        n.request_pause();
        assert_eq!(n.state(), NsState::Paused);
        n.resume();
        assert_eq!(n.state(), NsState::Active);
        assert!(n.begin_io().is_ok());
    }

    #[test]
    fn changed_ns_log_coalesces_on_overflow() {
        let mut log = ChangedNsLog::new(1024);
        for nsid in 1..=1025 {
            log.record(nsid);
        }
        assert_eq!(log.snapshot(), vec![0xFFFF_FFFFu32]);
    }

    #[test]
    fn clear_notifies_previous_registrants_with_preempted() {
        let mut n = ns();
        let a = host(0xAA);
        let b = host(0xBB);
        n.register(a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
            .unwrap();
        n.register(b, RegisterAction::RegisterKey, false, 0, 0x2, Cptpl::NoChange)
            .unwrap();
        n.acquire(a, AcquireAction::Acquire, ReservationType::WriteExclusiveAllRegs, 0x1, 0)
            .unwrap();
        let notices = n.release(a, ReleaseAction::Clear, ReservationType::None, 0x1).unwrap();
        assert_eq!(notices, vec![(b, ReservationNotice::RegistrationPreempted)]);
        assert!(n.registrants().is_empty());
    }

    proptest::proptest! {
        /// The holder can always read and write regardless of rtype; a
        /// non-holder, non-registrant host is only ever let through when
        /// rtype is `None` (§4.2 truth table, both edges of Invariant 2).
        #[test]
        fn holder_always_has_access(rtype_byte in 1u8..=6u8) {
            let rtype = ReservationType::from_u8(rtype_byte).unwrap();
            let mut n = ns();
            let holder = host(0x01);
            n.register(holder, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange).unwrap();
            n.acquire(holder, AcquireAction::Acquire, rtype, 0x1, 0).unwrap();

            prop_assert!(n.check_access(holder, IoOp::Read).is_ok());
            prop_assert!(n.check_access(holder, IoOp::Write).is_ok());

            let stranger = host(0xFE);
            let stranger_ok = n.check_access(stranger, IoOp::Write).is_ok();
            prop_assert!(!stranger_ok);
        }

        /// Every mutating call on a namespace strictly increases `gen`,
        /// regardless of which registrants or keys are involved (§3/§8
        /// Invariant: generation is a monotonic change counter).
        #[test]
        fn gen_monotonic_across_register_sequence(keys in proptest::collection::vec(1u64..=1000, 1..8)) {
            let mut n = ns();
            let mut last_gen = n.gen;
            for (i, key) in keys.into_iter().enumerate() {
                let h = host(i as u8);
                let _ = n.register(h, RegisterAction::RegisterKey, false, 0, key, Cptpl::NoChange);
                prop_assert!(n.gen >= last_gen);
                last_gen = n.gen;
            }
        }
    }
}
