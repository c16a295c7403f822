//! C5: DH-CHAP in-band authentication state machine, grounded on
//! `examples/original_source/lib/nvmf/auth.c`.
//!
//! Only the hash/HMAC construction and state machine are modeled; the
//! Diffie-Hellman exponentiation itself is delegated to a pluggable
//! [`DhExchange`] trait (no FFBE/finite-field DH implementation is pulled
//! in, matching §1's scope: wire transports and crypto backends beyond
//! hashing are external).

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use snafu::Snafu;
use subtle::ConstantTimeEq;

use crate::error::{ErrorKind, ToErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashId {
    Sha256,
    Sha384,
    Sha512,
}

impl HashId {
    pub fn output_len(self) -> usize {
        match self {
            HashId::Sha256 => 32,
            HashId::Sha384 => 48,
            HashId::Sha512 => 64,
        }
    }

    /// Strength ranking used by negotiation; higher is stronger (§4.5:
    /// "preference SHA512, SHA384, SHA256").
    fn rank(self) -> u8 {
        match self {
            HashId::Sha512 => 2,
            HashId::Sha384 => 1,
            HashId::Sha256 => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhGroupId {
    Null,
    Ffdhe2048,
    Ffdhe3072,
    Ffdhe4096,
    Ffdhe6144,
    Ffdhe8192,
}

impl DhGroupId {
    fn rank(self) -> u8 {
        match self {
            DhGroupId::Ffdhe8192 => 5,
            DhGroupId::Ffdhe6144 => 4,
            DhGroupId::Ffdhe4096 => 3,
            DhGroupId::Ffdhe3072 => 2,
            DhGroupId::Ffdhe2048 => 1,
            DhGroupId::Null => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Negotiate,
    Challenge,
    Reply,
    Success1,
    Success2,
    Failure1,
    Completed,
    Error,
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("wrong fabric auth message for current state"))]
    IncorrectProtocolMessage,
    #[snafu(display("malformed auth payload: {reason}"))]
    IncorrectPayload { reason: &'static str },
    #[snafu(display("SCC mode mismatch"))]
    SccMismatch,
    #[snafu(display("no usable hash algorithm in common"))]
    HashUnusable,
    #[snafu(display("no usable DH group in common"))]
    DhgroupUnusable,
    #[snafu(display("auth protocol not usable"))]
    ProtocolUnusable,
    #[snafu(display("response verification failed"))]
    Failed,
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::IncorrectProtocolMessage => ErrorKind::AuthIncorrectProtocolMessage,
            Error::IncorrectPayload { .. } => ErrorKind::AuthIncorrectPayload,
            Error::SccMismatch => ErrorKind::AuthSccMismatch,
            Error::HashUnusable => ErrorKind::AuthHashUnusable,
            Error::DhgroupUnusable => ErrorKind::AuthDhgroupUnusable,
            Error::ProtocolUnusable => ErrorKind::AuthProtocolUnusable,
            Error::Failed => ErrorKind::AuthFailed,
        }
    }
}

/// Host-advertised negotiation descriptor (one per auth protocol entry in
/// the Negotiate message).
pub struct NegotiateDescriptor {
    pub hash_ids: Vec<HashId>,
    pub dhgroup_ids: Vec<DhGroupId>,
}

pub struct NegotiateMsg {
    pub t_id: u16,
    pub scc_disabled: bool,
    pub descriptors: Vec<NegotiateDescriptor>,
}

/// Delegated Diffie-Hellman exchange; a real implementation lives outside
/// this crate's scope (no finite-field DH library is pulled in here).
pub trait DhExchange: Send + Sync {
    fn generate_keypair(&self, group: DhGroupId) -> (Vec<u8>, Box<dyn DhPrivateKey>);
}

pub trait DhPrivateKey: Send + Sync {
    fn shared_secret(&self, peer_public: &[u8]) -> Vec<u8>;
}

/// Per-queue-pair auth session (§3 QPair/Auth, §4.5).
pub struct AuthSession {
    pub qid: u16,
    pub state: AuthState,
    pub tid: u16,
    pub digest: HashId,
    pub dhgroup: DhGroupId,
    cval: Vec<u8>,
    pub seqnum: u32,
    dhkey: Option<Box<dyn DhPrivateKey>>,
    our_public: Vec<u8>,
    shared_secret: Option<Vec<u8>>,
    controller_response: Option<Vec<u8>>,
    pub ctrlr_verified: bool,
    pub timeout_deadline: Instant,
}

fn hmac_digest(digest: HashId, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    macro_rules! run {
        ($hash:ty) => {{
            let mut mac = <Hmac<$hash> as Mac>::new_from_slice(key)
                .expect("hmac accepts any key length");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }};
    }

    match digest {
        HashId::Sha256 => run!(Sha256),
        HashId::Sha384 => run!(Sha384),
        HashId::Sha512 => run!(Sha512),
    }
}

fn pad_nqn(nqn: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let bytes = nqn.as_bytes();
    buf[..bytes.len().min(256)].copy_from_slice(&bytes[..bytes.len().min(256)]);
    buf
}

impl AuthSession {
    pub fn new(qid: u16, auth_timeout_floor: Duration) -> Self {
        AuthSession {
            qid,
            state: AuthState::Negotiate,
            tid: 0,
            digest: HashId::Sha256,
            dhgroup: DhGroupId::Null,
            cval: Vec::new(),
            seqnum: 0,
            dhkey: None,
            our_public: Vec::new(),
            shared_secret: None,
            controller_response: None,
            ctrlr_verified: false,
            timeout_deadline: Instant::now() + auth_timeout_floor,
        }
    }

    fn to_failure1(&mut self, reason: &str) {
        tracing::warn!(qid = self.qid, reason, "auth failed");
        self.state = AuthState::Failure1;
    }

    fn expect_state(&mut self, expected: AuthState) -> Result<(), Error> {
        if self.state != expected {
            self.to_failure1("unexpected message for current state");
            return Err(Error::IncorrectProtocolMessage);
        }
        Ok(())
    }

    /// Negotiate -> Challenge (§4.5).
    pub fn negotiate(
        &mut self,
        msg: &NegotiateMsg,
        allowed_hashes: &[HashId],
        allowed_dhgroups: &[DhGroupId],
        target_scc_disabled: bool,
        seqnum_source: &mut dyn FnMut() -> u32,
        dh: &dyn DhExchange,
        rng: &mut dyn RngCore,
    ) -> Result<(), Error> {
        self.expect_state(AuthState::Negotiate)?;

        if msg.scc_disabled != target_scc_disabled {
            self.to_failure1("scc mismatch");
            return Err(Error::SccMismatch);
        }

        let desc = msg.descriptors.first().ok_or(Error::IncorrectPayload {
            reason: "no auth descriptors",
        })?;

        let digest = allowed_hashes
            .iter()
            .filter(|h| desc.hash_ids.contains(h))
            .max_by_key(|h| h.rank())
            .copied()
            .ok_or_else(|| {
                self.to_failure1("no usable hash");
                Error::HashUnusable
            })?;

        let dhgroup = allowed_dhgroups
            .iter()
            .filter(|g| desc.dhgroup_ids.contains(g))
            .max_by_key(|g| g.rank())
            .copied()
            .ok_or_else(|| {
                self.to_failure1("no usable dhgroup");
                Error::DhgroupUnusable
            })?;

        self.tid = msg.t_id;
        self.digest = digest;
        self.dhgroup = dhgroup;

        self.cval = vec![0u8; digest.output_len()];
        rng.fill_bytes(&mut self.cval);
        self.seqnum = seqnum_source();

        if dhgroup != DhGroupId::Null {
            let (public, private) = dh.generate_keypair(dhgroup);
            self.our_public = public;
            self.dhkey = Some(private);
        }

        self.state = AuthState::Challenge;
        Ok(())
    }

    /// Challenge -> Reply: verify the host's computed response and, if
    /// `cvalid`, pre-compute the controller's own response for Success1.
    #[allow(clippy::too_many_arguments)]
    pub fn reply(
        &mut self,
        host_response: &[u8],
        dhvlen: usize,
        host_public: Option<&[u8]>,
        cvalid: bool,
        seqnum: u32,
        host_challenge_for_ctrlr: Option<&[u8]>,
        tid: u16,
        host_key: &[u8],
        ctrlr_key: Option<&[u8]>,
        hostnqn: &str,
        subnqn: &str,
    ) -> Result<(), Error> {
        self.expect_state(AuthState::Challenge)?;

        let hl = self.digest.output_len();
        if host_response.len() != hl {
            self.to_failure1("response length mismatch");
            return Err(Error::IncorrectPayload { reason: "response length mismatch" });
        }
        if dhvlen % 4 != 0 {
            self.to_failure1("dhvlen not a multiple of 4");
            return Err(Error::IncorrectPayload { reason: "dhvlen not a multiple of 4" });
        }
        if tid != self.tid {
            self.to_failure1("tid mismatch");
            return Err(Error::IncorrectProtocolMessage);
        }
        if cvalid && seqnum == 0 {
            self.to_failure1("cvalid=1 with seqnum=0");
            return Err(Error::IncorrectPayload { reason: "cvalid=1 with seqnum=0" });
        }

        if self.dhgroup != DhGroupId::Null {
            let public = host_public.ok_or(Error::IncorrectPayload {
                reason: "missing DH public value",
            })?;
            let dhkey = self.dhkey.as_ref().ok_or(Error::IncorrectPayload {
                reason: "no local DH keypair",
            })?;
            self.shared_secret = Some(dhkey.shared_secret(public));
        }

        let expected = self.compute_response(host_key, "HostHost", self.seqnum, hostnqn, subnqn);
        if !bool::from(expected.ct_eq(host_response)) {
            self.to_failure1("response mismatch");
            return Err(Error::Failed);
        }

        if cvalid {
            let challenge = host_challenge_for_ctrlr.ok_or(Error::IncorrectPayload {
                reason: "cvalid=1 without host challenge",
            })?;
            let key = ctrlr_key.ok_or(Error::IncorrectPayload {
                reason: "no controller key configured",
            })?;
            let scratch = self.clone_for_ctrlr_response(challenge);
            self.controller_response =
                Some(scratch.compute(key, "Controller", seqnum, hostnqn, subnqn));
        }

        self.state = AuthState::Success1;
        Ok(())
    }

    fn clone_for_ctrlr_response(&self, challenge: &[u8]) -> AuthResponseScratch {
        AuthResponseScratch {
            cval: challenge.to_vec(),
            shared_secret: self.shared_secret.clone(),
            tid: self.tid,
            digest: self.digest,
        }
    }

    fn compute_response(
        &self,
        key: &[u8],
        role: &str,
        seqnum: u32,
        hostnqn: &str,
        subnqn: &str,
    ) -> Vec<u8> {
        AuthResponseScratch {
            cval: self.cval.clone(),
            shared_secret: self.shared_secret.clone(),
            tid: self.tid,
            digest: self.digest,
        }
        .compute(key, role, seqnum, hostnqn, subnqn)
    }

    /// Success1 -> {Completed | Success2}: `rvalid` indicates the host
    /// requested controller authentication.
    pub fn success1(&mut self, rvalid: bool) -> (Option<Vec<u8>>, bool) {
        if rvalid {
            self.state = AuthState::Success2;
            (self.controller_response.clone(), false)
        } else {
            self.state = AuthState::Completed;
            (None, true)
        }
    }

    pub fn success2(&mut self) {
        self.state = AuthState::Completed;
        self.ctrlr_verified = true;
    }

    pub fn fail2(&mut self) {
        tracing::warn!(qid = self.qid, "auth failed in final verification");
        self.state = AuthState::Error;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.timeout_deadline
    }
}

struct AuthResponseScratch {
    cval: Vec<u8>,
    shared_secret: Option<Vec<u8>>,
    tid: u16,
    digest: HashId,
}

impl AuthResponseScratch {
    fn compute(&self, key: &[u8], role: &str, seqnum: u32, hostnqn: &str, subnqn: &str) -> Vec<u8> {
        let mut parts: Vec<&[u8]> = vec![&self.cval];
        let secret_owned;
        if let Some(secret) = &self.shared_secret {
            secret_owned = secret.clone();
            parts.push(&secret_owned);
        }
        let role_bytes = role.as_bytes();
        let seqnum_be = seqnum.to_be_bytes();
        let tid_be = self.tid.to_be_bytes();
        let zero_be = 0u32.to_be_bytes();
        let hostnqn_buf = pad_nqn(hostnqn);
        let subnqn_buf = pad_nqn(subnqn);

        parts.push(role_bytes);
        parts.push(&seqnum_be);
        parts.push(&tid_be);
        parts.push(&zero_be);
        parts.push(&hostnqn_buf);
        parts.push(&subnqn_buf);

        hmac_digest(self.digest, key, &parts)
    }
}

/// Bootstraps the per-subsystem auth sequence counter (§3: "never zero
/// after first use, wraps through 1"), grounded on `nvmf_auth_get_seqnum`
/// in `auth.c`.
pub fn next_seqnum(current: &mut u32, rng: &mut dyn RngCore) -> u32 {
    if *current == 0 {
        loop {
            let v = rng.next_u32();
            if v != 0 {
                *current = v;
                break;
            }
        }
    }
    *current = current.wrapping_add(1);
    if *current == 0 {
        *current = 1;
    }
    *current
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct NullDh;
    impl DhExchange for NullDh {
        fn generate_keypair(&self, _group: DhGroupId) -> (Vec<u8>, Box<dyn DhPrivateKey>) {
            unreachable!("NULL dhgroup never generates a keypair")
        }
    }

    #[test]
    fn s3_sha256_null_host_only_success() {
        let mut session = AuthSession::new(1, Duration::from_secs(120));
        let msg = NegotiateMsg {
            t_id: 7,
            scc_disabled: true,
            descriptors: vec![NegotiateDescriptor {
                hash_ids: vec![HashId::Sha256],
                dhgroup_ids: vec![DhGroupId::Null],
            }],
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut seq = 0u32;
        session
            .negotiate(
                &msg,
                &[HashId::Sha256],
                &[DhGroupId::Null],
                true,
                &mut || next_seqnum(&mut seq, &mut rng),
                &NullDh,
                &mut rng,
            )
            .unwrap();

        assert_eq!(session.state, AuthState::Challenge);
        assert_eq!(session.tid, 7);
        assert!(session.seqnum != 0);

        let host_key = b"host-secret-key";
        let response = AuthResponseScratch {
            cval: session.cval.clone(),
            shared_secret: None,
            tid: session.tid,
            digest: session.digest,
        }
        .compute(host_key, "HostHost", session.seqnum, "hostnqn", "subnqn");

        session
            .reply(
                &response,
                0,
                None,
                false,
                session.seqnum,
                None,
                7,
                host_key,
                None,
                "hostnqn",
                "subnqn",
            )
            .unwrap();

        assert_eq!(session.state, AuthState::Success1);
        let (ctrlr_response, completed) = session.success1(false);
        assert!(ctrlr_response.is_none());
        assert!(completed);
        assert_eq!(session.state, AuthState::Completed);
    }

    #[test]
    fn wrong_message_in_state_moves_to_failure1() {
        let mut session = AuthSession::new(1, Duration::from_secs(120));
        let result = session.reply(&[], 0, None, false, 1, None, 0, b"k", None, "h", "s");
        assert!(matches!(result, Err(Error::IncorrectProtocolMessage)));
        assert_eq!(session.state, AuthState::Failure1);
    }

    #[test]
    fn seqnum_never_zero_and_wraps_through_one() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut current = u32::MAX;
        // wrapping_add(1) would land on 0, but next_seqnum skips straight to 1.
        let n1 = next_seqnum(&mut current, &mut rng);
        assert_eq!(n1, 1);
        let n2 = next_seqnum(&mut current, &mut rng);
        assert_eq!(n2, 2);

        let mut bootstrapped = 0u32;
        let n3 = next_seqnum(&mut bootstrapped, &mut rng);
        assert_ne!(n3, 0);
    }
}
