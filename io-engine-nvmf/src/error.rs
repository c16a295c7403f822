//! Crate-wide error kind shared by every module's `snafu` error enum.
//!
//! Individual modules (`keyring`, `reservation`, `subsystem`, `controller`,
//! `auth`, `executor`) define their own `Error` with rich `source`/context
//! fields, one `Snafu` enum per module (`ChildError`-style). This module
//! only carries the abstract NVMe status classification so the wire
//! layer can translate any module's error into a single `(sct, sc, dnr)`
//! triple without matching on every concrete enum.

use snafu::Snafu;

/// Abstract error classification, independent of which module raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParam,
    NotFound,
    AlreadyExists,
    Busy,
    NoMemory,
    PermissionDenied,
    ReservationConflict,
    LbaOutOfRange,
    DataSglLengthInvalid,
    InternalDeviceError,
    AuthFailed,
    AuthIncorrectProtocolMessage,
    AuthIncorrectPayload,
    AuthSccMismatch,
    AuthHashUnusable,
    AuthDhgroupUnusable,
    AuthProtocolUnusable,
    InvalidOpcode,
    CommandSequenceError,
    Intr,
}

/// Trait implemented by every module's error enum so the executor/wire
/// layer can translate to an NVMe completion without downcasting.
pub trait ToErrorKind {
    fn kind(&self) -> ErrorKind;
}

/// Generic top-level error, used where a caller spans more than one
/// module (e.g. the executor invoking both reservation and bdev errors).
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("keyring error: {source}"))]
    Keyring { source: crate::keyring::Error },
    #[snafu(display("reservation error: {source}"))]
    Reservation { source: crate::reservation::Error },
    #[snafu(display("subsystem error: {source}"))]
    Subsystem { source: crate::subsystem::Error },
    #[snafu(display("controller error: {source}"))]
    Controller { source: crate::controller::Error },
    #[snafu(display("auth error: {source}"))]
    Auth { source: crate::auth::Error },
    #[snafu(display("executor error: {source}"))]
    Executor { source: crate::executor::Error },
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Keyring { source } => source.kind(),
            Error::Reservation { source } => source.kind(),
            Error::Subsystem { source } => source.kind(),
            Error::Controller { source } => source.kind(),
            Error::Auth { source } => source.kind(),
            Error::Executor { source } => source.kind(),
        }
    }
}

/// NVMe completion status fields (§6.3 / §7): status code type, status
/// code and "do not retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus { sct: 0, sc: 0, dnr: false };

    /// Translate an abstract [`ErrorKind`] into the generic-command-status
    /// (sct=0) or command-specific-status (sct=1) space (e.g. a denied
    /// reservation access check maps to `sct=0, sc=ReservationConflict`).
    pub fn from_kind(kind: ErrorKind) -> Self {
        use ErrorKind::*;
        let (sct, sc, dnr) = match kind {
            InvalidParam => (0, 0x02, true),
            InvalidOpcode => (0, 0x01, true),
            CommandSequenceError => (0, 0x0c, true),
            LbaOutOfRange => (0, 0x80, true),
            DataSglLengthInvalid => (0, 0x0d, true),
            ReservationConflict => (0, 0x83, true),
            NotFound => (0, 0x02, true),
            AlreadyExists => (1, 0x02, true),
            Busy => (0, 0x05, false),
            NoMemory => (0, 0x07, false),
            PermissionDenied => (0, 0x86, true),
            InternalDeviceError => (0, 0x06, true),
            Intr => (0, 0x04, false),
            AuthFailed
            | AuthIncorrectProtocolMessage
            | AuthIncorrectPayload
            | AuthSccMismatch
            | AuthHashUnusable
            | AuthDhgroupUnusable
            | AuthProtocolUnusable => (0, 0x00, false),
        };
        NvmeStatus { sct, sc, dnr }
    }
}
