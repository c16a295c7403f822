//! Process-wide target singleton and the cooperative poll-group that
//! drives every controller's timers (CC.EN deadline, keep-alive,
//! pending AER, auth-session expiry) one tick at a time.
//!
//! Grounded on teacher's `thread_local! { static NVMF_TGT: RefCell<...> }`
//! singleton (`examples/other_examples/e70c4f1e_*-target-nvmf.rs`) and its
//! `Reactors::current().send_future(...)` poll-driven model: this crate
//! has no I/O reactor of its own, so [`PollGroup::tick`] stands in for
//! one pass of that reactor loop and is meant to be called by whatever
//! event loop the embedding binary runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::controller::{AerCompletion, Controller};
use crate::keyring::Keyring;
use crate::subsystem::Subsystem;

thread_local! {
    static TARGET: RefCell<Option<Target>> = RefCell::new(None);
}

/// Top-level target state: the subsystem registry and the shared
/// keyring. Namespaces and their block devices live inside each
/// [`Subsystem`]; controllers are owned by the [`PollGroup`] that
/// services their queue pairs.
pub struct Target {
    pub keyring: Arc<Keyring>,
    subsystems: HashMap<String, Subsystem>,
    next_subsystem_id: u32,
}

impl Target {
    pub fn new() -> Self {
        Target {
            keyring: Arc::new(Keyring::new()),
            subsystems: HashMap::new(),
            next_subsystem_id: 1,
        }
    }

    pub fn create_subsystem(
        &mut self,
        nqn: &str,
        subtype: crate::subsystem::SubType,
        max_nsid: u32,
    ) -> Result<&mut Subsystem, crate::subsystem::Error> {
        if self.subsystems.contains_key(nqn) {
            return Err(crate::subsystem::Error::AlreadyExists { nqn: nqn.to_string() });
        }
        let id = self.next_subsystem_id;
        self.next_subsystem_id += 1;
        let sub = Subsystem::new(id, nqn, subtype, max_nsid)?;
        Ok(self.subsystems.entry(nqn.to_string()).or_insert(sub))
    }

    pub fn destroy_subsystem(&mut self, nqn: &str) -> Option<Subsystem> {
        self.subsystems.remove(nqn)
    }

    pub fn get(&self, nqn: &str) -> Option<&Subsystem> {
        self.subsystems.get(nqn)
    }

    pub fn get_mut(&mut self, nqn: &str) -> Option<&mut Subsystem> {
        self.subsystems.get_mut(nqn)
    }

    pub fn subsystems(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.values()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide target for the current thread. Panics if
/// already initialized, matching teacher's single-init contract for
/// `NVMF_TGT`.
pub fn init() {
    TARGET.with(|t| {
        let mut slot = t.borrow_mut();
        assert!(slot.is_none(), "target already initialized on this thread");
        *slot = Some(Target::new());
        tracing::info!("nvmf target initialized");
    });
}

pub fn with_target<R>(f: impl FnOnce(&Target) -> R) -> R {
    TARGET.with(|t| {
        let slot = t.borrow();
        f(slot.as_ref().expect("target not initialized"))
    })
}

pub fn with_target_mut<R>(f: impl FnOnce(&mut Target) -> R) -> R {
    TARGET.with(|t| {
        let mut slot = t.borrow_mut();
        f(slot.as_mut().expect("target not initialized"))
    })
}

/// One tick's worth of controller-timer output, handed back to whatever
/// caller drives [`PollGroup::tick`] so it can turn these into actual
/// fabric completions (AEN capsules, forced disconnects, ...).
#[derive(Debug)]
pub enum PollEvent {
    Aer { cntlid: u16, cid: u16, completion: AerCompletion },
    KeepAliveExpired { cntlid: u16 },
    AuthSessionExpired { cntlid: u16, qid: u16 },
}

/// A set of controllers serviced cooperatively by a single poll loop,
/// mirroring one SPDK poll group's controller list.
#[derive(Default)]
pub struct PollGroup {
    controllers: HashMap<u16, Controller>,
}

impl PollGroup {
    pub fn new() -> Self {
        PollGroup {
            controllers: HashMap::new(),
        }
    }

    pub fn add(&mut self, controller: Controller) {
        self.controllers.insert(controller.cntlid, controller);
    }

    pub fn remove(&mut self, cntlid: u16) -> Option<Controller> {
        self.controllers.remove(&cntlid)
    }

    pub fn get_mut(&mut self, cntlid: u16) -> Option<&mut Controller> {
        self.controllers.get_mut(&cntlid)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Drive every controller's CC/CSTS deadline and keep-alive/auth
    /// timers once, collecting whatever needs fabric-level action.
    pub fn tick(&mut self, now: Instant) -> Vec<PollEvent> {
        let mut events = Vec::new();
        for (cntlid, ctrlr) in self.controllers.iter_mut() {
            let _ = ctrlr.poll(now);

            if ctrlr.keep_alive_expired(now) {
                events.push(PollEvent::KeepAliveExpired { cntlid: *cntlid });
            }

            for qid in ctrlr.expire_auth_sessions(now) {
                events.push(PollEvent::AuthSessionExpired { cntlid: *cntlid, qid });
            }

            while let Some((cid, completion)) = ctrlr.poll_aer() {
                events.push(PollEvent::Aer {
                    cntlid: *cntlid,
                    cid,
                    completion,
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn poll_group_reports_keep_alive_expiry() {
        let mut pg = PollGroup::new();
        let mut c = Controller::new(1, "h".into(), "s".into(), 4, 1024, 1000);
        c.set_kato(Duration::from_millis(1));
        c.record_keep_alive(Instant::now());
        pg.add(c);

        std::thread::sleep(Duration::from_millis(5));
        let events = pg.tick(Instant::now());
        assert!(events
            .iter()
            .any(|e| matches!(e, PollEvent::KeepAliveExpired { cntlid: 1 })));
    }

    #[test]
    fn poll_group_delivers_aer_after_ns_change() {
        let mut pg = PollGroup::new();
        let mut c = Controller::new(7, "h".into(), "s".into(), 4, 1024, 1000);
        c.notify_ns_changed(5);
        c.submit_aer(42).unwrap();
        pg.add(c);

        let events = pg.tick(Instant::now());
        assert!(events.iter().any(|e| matches!(
            e,
            PollEvent::Aer { cntlid: 7, cid: 42, .. }
        )));
    }

    #[test]
    fn target_rejects_duplicate_subsystem_nqn() {
        let mut target = Target::new();
        let nqn = "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc";
        target
            .create_subsystem(nqn, crate::subsystem::SubType::Nvme, 32)
            .unwrap();
        assert!(matches!(
            target.create_subsystem(nqn, crate::subsystem::SubType::Nvme, 32),
            Err(crate::subsystem::Error::AlreadyExists { .. })
        ));
    }
}
