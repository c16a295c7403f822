//! C4: per-host-connection controller — cntlid identity, CC/CSTS
//! register emulation, AER queue, keep-alive and the per-controller
//! DH-CHAP session table.
//!
//! Grounded on `examples/other_examples/bf20da01_*-subsystem.rs` for the
//! controller bookkeeping shape and `examples/original_source/lib/nvmf/nvmf_internal.h`'s
//! `struct spdk_nvmf_ctrlr` (`vcprop` for the CC/CSTS register pair) and
//! `nvmf_ctrlr_save_aers`/`nvmf_ctrlr_abort_aer` declarations for the AER
//! coalescing rules (§4.4).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use crossbeam::atomic::AtomicCell;
use snafu::Snafu;

use crate::auth::AuthSession;
use crate::error::{ErrorKind, ToErrorKind};
use crate::reservation::ChangedNsLog;
use crate::wire::prop;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("unknown property register offset {offset:#x}"))]
    UnknownRegister { offset: u32 },
    #[snafu(display("register {name} is read-only"))]
    ReadOnlyRegister { name: &'static str },
    #[snafu(display("CC.EN transition timed out after {millis}ms"))]
    EnableTimedOut { millis: u64 },
    #[snafu(display("AER queue is full ({max} outstanding)"))]
    AerQueueFull { max: usize },
    #[snafu(display("no auth session for queue {qid}"))]
    NoAuthSession { qid: u16 },
    #[snafu(display("keep-alive timer expired"))]
    KeepAliveExpired,
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownRegister { .. } | Error::ReadOnlyRegister { .. } => {
                ErrorKind::InvalidParam
            }
            Error::EnableTimedOut { .. } | Error::KeepAliveExpired => {
                ErrorKind::InternalDeviceError
            }
            Error::AerQueueFull { .. } => ErrorKind::Busy,
            Error::NoAuthSession { .. } => ErrorKind::CommandSequenceError,
        }
    }
}

bitflags! {
    struct Cc: u32 {
        const EN = 1 << 0;
        const SHN_MASK = 0b11 << 14;
    }
}

bitflags! {
    struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const SHST_MASK = 0b11 << 2;
        const SHST_OCCURRING = 0b01 << 2;
        const SHST_COMPLETE = 0b10 << 2;
    }
}

/// One changed-namespace AER completion, or a generic async event.
#[derive(Debug, Clone)]
pub enum AerCompletion {
    NamespaceAttributeChanged { changed_nsids: Vec<u32> },
    ReservationLogPageAvailable { nsid: u32 },
}

pub struct Controller {
    pub cntlid: u16,
    pub hostnqn: String,
    pub subnqn: String,
    /// Wall-clock Connect time, surfaced in logs and admin tooling; all
    /// deadline arithmetic elsewhere uses `Instant`, not this (§4.4).
    pub connected_at: chrono::DateTime<chrono::Utc>,
    cc: AtomicCell<u32>,
    csts: AtomicCell<u32>,
    cc_timeout: Duration,
    enable_deadline: Option<Instant>,
    kato: Duration,
    last_keep_alive: Instant,
    /// FIFO of submitted AER command ids, bounded by config (§4.4).
    aer_pending_cids: VecDeque<u16>,
    max_aer: usize,
    changed_ns: ChangedNsLog,
    reservation_log_pending: VecDeque<u32>,
    auth_sessions: HashMap<u16, AuthSession>,
}

impl Controller {
    pub fn new(
        cntlid: u16,
        hostnqn: String,
        subnqn: String,
        max_aer: usize,
        max_changed_ns: usize,
        cc_timeout_ms: u64,
    ) -> Self {
        tracing::info!(cntlid, %subnqn, "controller connected");
        Controller {
            cntlid,
            hostnqn,
            subnqn,
            connected_at: chrono::Utc::now(),
            cc: AtomicCell::new(0),
            csts: AtomicCell::new(0),
            cc_timeout: Duration::from_millis(cc_timeout_ms),
            enable_deadline: None,
            kato: Duration::from_secs(600),
            last_keep_alive: Instant::now(),
            aer_pending_cids: VecDeque::new(),
            max_aer,
            changed_ns: ChangedNsLog::new(max_changed_ns),
            reservation_log_pending: VecDeque::new(),
            auth_sessions: HashMap::new(),
        }
    }

    pub fn cc(&self) -> u32 {
        self.cc.load()
    }

    pub fn csts(&self) -> u32 {
        self.csts.load()
    }

    pub fn is_ready(&self) -> bool {
        Csts::from_bits_truncate(self.csts.load()).contains(Csts::RDY)
    }

    pub fn set_kato(&mut self, kato: Duration) {
        self.kato = kato;
    }

    // ---- Property Get/Set (§6.3, fixed byte offsets) ----

    pub fn property_get(&self, offset: u32) -> Result<u64, Error> {
        let (name, _len) = prop::lookup(offset).ok_or(Error::UnknownRegister { offset })?;
        Ok(match name {
            "CAP" => 0x0002_0002_00FF_003F, // CQR=1, MQES=0xFF, TO=0x02
            "VS" => 0x0001_0003,            // NVMe 1.3
            "CC" => self.cc.load() as u64,
            "CSTS" => self.csts.load() as u64,
            _ => 0,
        })
    }

    /// Only CC is writable; writing CC.EN triggers the Inactive-to-Ready
    /// or Ready-to-Inactive transition, armed with a deadline checked by
    /// [`Controller::poll`] (§4.4).
    pub fn property_set(&mut self, offset: u32, value: u64) -> Result<(), Error> {
        let (name, _len) = prop::lookup(offset).ok_or(Error::UnknownRegister { offset })?;
        if name != "CC" {
            return Err(Error::ReadOnlyRegister { name });
        }
        let new_cc = Cc::from_bits_truncate(value as u32);
        let was_enabled = Cc::from_bits_truncate(self.cc.load()).contains(Cc::EN);
        let will_enable = new_cc.contains(Cc::EN);
        let shn = new_cc & Cc::SHN_MASK;

        self.cc.store(new_cc.bits());

        if !was_enabled && will_enable {
            self.enable_deadline = Some(Instant::now() + self.cc_timeout);
        } else if was_enabled && !will_enable {
            self.csts.store(0);
            self.enable_deadline = None;
        }

        if !shn.is_empty() {
            let csts = (Csts::from_bits_truncate(self.csts.load()) - Csts::SHST_MASK)
                | Csts::SHST_OCCURRING;
            self.csts.store(csts.bits());
        }
        Ok(())
    }

    /// Drive the CC.EN -> CSTS.RDY deadline and complete a pending
    /// shutdown; called once per reactor tick (§4.4, §5).
    pub fn poll(&mut self, now: Instant) -> Result<(), Error> {
        if let Some(deadline) = self.enable_deadline {
            let cc = Cc::from_bits_truncate(self.cc.load());
            let csts = Csts::from_bits_truncate(self.csts.load());
            if cc.contains(Cc::EN) && !csts.contains(Csts::RDY) {
                if now >= deadline {
                    self.csts.store((csts | Csts::CFS).bits());
                    self.enable_deadline = None;
                    return Err(Error::EnableTimedOut {
                        millis: self.cc_timeout.as_millis() as u64,
                    });
                }
                self.csts.store((csts | Csts::RDY).bits());
                self.enable_deadline = None;
            }
        }
        let csts = Csts::from_bits_truncate(self.csts.load());
        if (csts & Csts::SHST_MASK) == Csts::SHST_OCCURRING {
            let csts = (csts - Csts::SHST_MASK) | Csts::SHST_COMPLETE;
            self.csts.store(csts.bits());
        }
        Ok(())
    }

    // ---- keep-alive (§4.4) ----

    pub fn record_keep_alive(&mut self, now: Instant) {
        self.last_keep_alive = now;
    }

    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        self.kato > Duration::ZERO && now.duration_since(self.last_keep_alive) > self.kato
    }

    // ---- AER (§4.4) ----

    pub fn submit_aer(&mut self, cid: u16) -> Result<(), Error> {
        if self.aer_pending_cids.len() >= self.max_aer {
            return Err(Error::AerQueueFull { max: self.max_aer });
        }
        self.aer_pending_cids.push_back(cid);
        Ok(())
    }

    pub fn aer_outstanding(&self) -> usize {
        self.aer_pending_cids.len()
    }

    pub fn notify_ns_changed(&mut self, nsid: u32) {
        self.changed_ns.record(nsid);
    }

    pub fn notify_reservation_log_available(&mut self, nsid: u32) {
        self.reservation_log_pending.push_back(nsid);
    }

    /// Pop one pending AER and its completion, if both an outstanding
    /// request and an event exist (§4.4 coalescing: all namespace events
    /// since the last completion are delivered together).
    pub fn poll_aer(&mut self) -> Option<(u16, AerCompletion)> {
        if let Some(nsid) = self.reservation_log_pending.pop_front() {
            let cid = self.aer_pending_cids.pop_front()?;
            return Some((cid, AerCompletion::ReservationLogPageAvailable { nsid }));
        }
        let changed = self.changed_ns.snapshot();
        if changed.is_empty() {
            return None;
        }
        let cid = self.aer_pending_cids.pop_front()?;
        self.changed_ns = ChangedNsLog::new(self.max_aer.max(1024));
        Some((
            cid,
            AerCompletion::NamespaceAttributeChanged { changed_nsids: changed },
        ))
    }

    // ---- auth sessions (§4.5) ----

    pub fn auth_session_mut(&mut self, qid: u16) -> Option<&mut AuthSession> {
        self.auth_sessions.get_mut(&qid)
    }

    pub fn start_auth_session(&mut self, qid: u16, session: AuthSession) {
        self.auth_sessions.insert(qid, session);
    }

    pub fn end_auth_session(&mut self, qid: u16) {
        self.auth_sessions.remove(&qid);
    }

    pub fn expire_auth_sessions(&mut self, now: Instant) -> Vec<u16> {
        let expired: Vec<u16> = self
            .auth_sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(qid, _)| *qid)
            .collect();
        for qid in &expired {
            self.auth_sessions.remove(qid);
        }
        expired
    }
}
