//! C6: per-I/O validation and dispatch — LBA range and SGL length
//! checks, the reservation access check, fused compare-and-write, the
//! zero-copy two-phase path and DSM-Unmap.
//!
//! Grounded on `examples/other_examples/ee498252_*-nexus_child.rs`'s
//! `readv`/`writev`/`reset` submission sequence (validate, then hand off
//! to the `BlockDevice`), generalized to the full NVMe I/O command set.

use snafu::Snafu;
use uuid::Uuid;

use crate::bdev::{BlockDevice, IoCompletion, ZcopyBuffer};
use crate::controller::Controller;
use crate::error::{ErrorKind, ToErrorKind};
use crate::reservation::{self, IoOp, Namespace};
use crate::subsystem::{self, Subsystem};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("LBA range [{lba}, {lba}+{nlb}) exceeds namespace size {num_blocks}"))]
    LbaOutOfRange { lba: u64, nlb: u64, num_blocks: u64 },
    #[snafu(display("SGL length {actual} does not match expected transfer length {expected}"))]
    SglLengthInvalid { expected: u64, actual: u64 },
    #[snafu(display("reservation check failed: {source}"))]
    Reservation { source: reservation::Error },
    #[snafu(display("device reported an error completion"))]
    DeviceError,
    #[snafu(display("device has no memory for this request"))]
    DeviceNoMemory,
    #[snafu(display("too many DSM ranges in one command ({count}, max {max})"))]
    TooManyDsmRanges { count: usize, max: usize },
    #[snafu(display("namespace does not support zero-copy"))]
    ZcopyUnsupported,
    #[snafu(display("fabric connect rejected: {source}"))]
    Connect { source: subsystem::Error },
    #[snafu(display("controller register access failed: {source}"))]
    Register { source: crate::controller::Error },
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::LbaOutOfRange { .. } => ErrorKind::LbaOutOfRange,
            Error::SglLengthInvalid { .. } => ErrorKind::DataSglLengthInvalid,
            Error::Reservation { source } => source.kind(),
            Error::DeviceError => ErrorKind::InternalDeviceError,
            Error::DeviceNoMemory => ErrorKind::NoMemory,
            Error::TooManyDsmRanges { .. } => ErrorKind::InvalidParam,
            Error::ZcopyUnsupported => ErrorKind::InvalidParam,
            Error::Connect { source } => source.kind(),
            Error::Register { source } => source.kind(),
        }
    }
}

/// Outcome of a fabric `Connect`, already shaped for `ConnectRspSuccess`/
/// `ConnectRspInvalid` (§6.3) without committing to either wire layout here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Success { cntlid: u16, authreq: bool },
    HostNotAllowed,
}

/// Fabric `Connect` dispatch (§4.4, part of C6's fctype routing): checks
/// the host allow-list, allocates a dynamic `cntlid` (or reserves the
/// caller-supplied static one), and hands back what the transport needs
/// to build a controller and its response capsule. Does not construct the
/// [`Controller`] itself — that also needs the admin queue's `sqsize`/
/// `kato`, which the transport decodes from `ConnectCmd`.
pub fn connect(
    sub: &mut Subsystem,
    host_nqn: &str,
    requested_cntlid: Option<u16>,
    treq_requires_auth: bool,
) -> Result<ConnectOutcome, Error> {
    if !sub.host_allowed(host_nqn) {
        return Ok(ConnectOutcome::HostNotAllowed);
    }
    let cntlid = match requested_cntlid {
        Some(static_cntlid) => {
            sub.reserve_static_cntlid(static_cntlid, host_nqn)
                .map_err(|source| Error::Connect { source })?;
            static_cntlid
        }
        None => sub
            .allocate_cntlid(host_nqn)
            .map_err(|source| Error::Connect { source })?,
    };
    Ok(ConnectOutcome::Success {
        cntlid,
        authreq: treq_requires_auth,
    })
}

/// Fabric `PropertyGet` dispatch: a thin, fallible pass-through to the
/// controller's register file (§4.4, §6.3).
pub fn property_get(ctrlr: &Controller, offset: u32) -> Result<u64, Error> {
    ctrlr.property_get(offset).map_err(|source| Error::Register { source })
}

/// Fabric `PropertySet` dispatch, same shape as [`property_get`].
pub fn property_set(ctrlr: &mut Controller, offset: u32, value: u64) -> Result<(), Error> {
    ctrlr
        .property_set(offset, value)
        .map_err(|source| Error::Register { source })
}

/// Maximum DSM ranges accepted in a single Dataset Management command,
/// matching the NVMe base spec's NR field width assumption used
/// throughout this target (§4.6).
pub const MAX_DSM_RANGES: usize = 256;

fn validate_lba_range(ns: &Namespace, lba: u64, nlb: u64) -> Result<(), Error> {
    if nlb == 0 || lba.checked_add(nlb).map_or(true, |end| end > ns.num_blocks) {
        return Err(Error::LbaOutOfRange {
            lba,
            nlb,
            num_blocks: ns.num_blocks,
        });
    }
    Ok(())
}

fn validate_sgl_length(ns: &Namespace, nlb: u64, sgl_len: u64) -> Result<(), Error> {
    let expected = nlb * ns.block_size as u64;
    if expected != sgl_len {
        return Err(Error::SglLengthInvalid {
            expected,
            actual: sgl_len,
        });
    }
    Ok(())
}

fn to_completion(c: IoCompletion) -> Result<(), Error> {
    match c {
        IoCompletion::Ok => Ok(()),
        IoCompletion::NoMemory => Err(Error::DeviceNoMemory),
        IoCompletion::Failed => Err(Error::DeviceError),
    }
}

/// Validate then submit a read (§4.6). Takes the namespace's
/// `io_outstanding` counter for the duration of the device call so a
/// concurrent pause (§4.2, §4.3) can drain before quiescing.
pub fn read(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    lba: u64,
    nlb: u64,
    sgl_len: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    validate_lba_range(ns, lba, nlb)?;
    validate_sgl_length(ns, nlb, sgl_len)?;
    ns.check_access(host_uuid, IoOp::Read)
        .map_err(|source| Error::Reservation { source })?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    let result = to_completion(dev.read_blocks(lba, nlb, buf));
    ns.end_io();
    result
}

/// Validate then submit a write (§4.6).
pub fn write(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    lba: u64,
    nlb: u64,
    sgl_len: u64,
    buf: &[u8],
) -> Result<(), Error> {
    validate_lba_range(ns, lba, nlb)?;
    validate_sgl_length(ns, nlb, sgl_len)?;
    ns.check_access(host_uuid, IoOp::Write)
        .map_err(|source| Error::Reservation { source })?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    let result = to_completion(dev.write_blocks(lba, nlb, buf));
    ns.end_io();
    result
}

/// Fused Compare-and-Write: the two phases share one validation pass and
/// one reservation check, and the write only happens if the compare
/// matches (§4.6, the compare itself never needs write access).
pub fn compare_and_write(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    lba: u64,
    nlb: u64,
    compare_sgl_len: u64,
    write_sgl_len: u64,
    compare_buf: &[u8],
    write_buf: &[u8],
) -> Result<(), Error> {
    validate_lba_range(ns, lba, nlb)?;
    validate_sgl_length(ns, nlb, compare_sgl_len)?;
    validate_sgl_length(ns, nlb, write_sgl_len)?;
    ns.check_access(host_uuid, IoOp::Write)
        .map_err(|source| Error::Reservation { source })?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    let result = to_completion(dev.compare_and_write(lba, nlb, compare_buf, write_buf));
    ns.end_io();
    result
}

pub fn write_zeroes(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    lba: u64,
    nlb: u64,
) -> Result<(), Error> {
    validate_lba_range(ns, lba, nlb)?;
    ns.check_access(host_uuid, IoOp::Write)
        .map_err(|source| Error::Reservation { source })?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    let result = to_completion(dev.write_zeroes(lba, nlb));
    ns.end_io();
    result
}

/// Dataset Management - Deallocate (Unmap): one reservation check up
/// front, then every range is started independently; the request
/// completes once all ranges finish, and if any range fails the final
/// status is that of the first failure seen (§4.6) — a bad range does not
/// stop the rest of the list from being submitted.
pub fn dsm_unmap(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    ranges: &[(u64, u32)],
) -> Result<(), Error> {
    if ranges.len() > MAX_DSM_RANGES {
        return Err(Error::TooManyDsmRanges {
            count: ranges.len(),
            max: MAX_DSM_RANGES,
        });
    }
    ns.check_access(host_uuid, IoOp::Write)
        .map_err(|source| Error::Reservation { source })?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    let mut first_error = None;
    for &(lba, nlb) in ranges {
        let outcome = validate_lba_range(ns, lba, nlb as u64)
            .and_then(|()| to_completion(dev.unmap(lba, nlb as u64)));
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    ns.end_io();
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub fn flush(dev: &dyn BlockDevice) -> Result<(), Error> {
    to_completion(dev.flush())
}

/// Reservation Report (§4.2): encodes the namespace's reservation state
/// into the wire's `ReservationStatusExtendedData` layout (§6.3) ready to
/// copy into the command's data buffer.
pub fn reservation_report(ns: &Namespace, eds: bool) -> Result<Vec<u8>, Error> {
    Ok(ns.report(eds).map_err(|source| Error::Reservation { source })?.encode())
}

/// Phase 1 of a zero-copy I/O: validate and obtain a buffer handle
/// (§4.6, §6.1). The caller (transport layer) reads/writes the handle's
/// memory directly and then calls [`zcopy_commit`] or [`zcopy_abort`].
pub fn zcopy_start(
    ns: &mut Namespace,
    dev: &dyn BlockDevice,
    host_uuid: Uuid,
    lba: u64,
    nlb: u64,
    op: IoOp,
    populate: bool,
) -> Result<ZcopyBuffer, Error> {
    validate_lba_range(ns, lba, nlb)?;
    ns.check_access(host_uuid, op)
        .map_err(|source| Error::Reservation { source })?;
    let zbuf = dev.zcopy_start(lba, nlb, populate).ok_or(Error::ZcopyUnsupported)?;
    ns.begin_io().map_err(|source| Error::Reservation { source })?;
    Ok(zbuf)
}

/// Phase 2a: the transport's writes landed, commit them (§4.6).
pub fn zcopy_commit(ns: &mut Namespace, dev: &dyn BlockDevice, zbuf: ZcopyBuffer) {
    dev.zcopy_end(zbuf, true);
    ns.end_io();
}

/// Phase 2b: the transport is abandoning the I/O, discard it (§4.6).
pub fn zcopy_abort(ns: &mut Namespace, dev: &dyn BlockDevice, zbuf: ZcopyBuffer) {
    dev.zcopy_end(zbuf, false);
    ns.end_io();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::MallocBlockDevice;

    fn ns() -> Namespace {
        Namespace::new(1, Uuid::new_v4(), 16, 512)
    }

    #[test]
    fn read_validates_lba_range() {
        let mut n = ns();
        let dev = MallocBlockDevice::new(16, 512);
        let mut buf = vec![0u8; 512];
        let err = read(&mut n, &dev, Uuid::new_v4(), 20, 1, 512, &mut buf);
        assert!(matches!(err, Err(Error::LbaOutOfRange { .. })));
    }

    #[test]
    fn write_validates_sgl_length() {
        let mut n = ns();
        let dev = MallocBlockDevice::new(16, 512);
        let buf = vec![0u8; 256];
        let err = write(&mut n, &dev, Uuid::new_v4(), 0, 1, 256, &buf);
        assert!(matches!(err, Err(Error::SglLengthInvalid { .. })));
    }

    #[test]
    fn write_denied_without_reservation_access() {
        use crate::reservation::{AcquireAction, Cptpl, RegisterAction, ReservationType};
        let mut n = ns();
        let holder = Uuid::new_v4();
        let other = Uuid::new_v4();
        n.register(holder, RegisterAction::RegisterKey, false, 0, 1, Cptpl::NoChange)
            .unwrap();
        n.acquire(holder, AcquireAction::Acquire, ReservationType::ExclusiveAccess, 1, 0)
            .unwrap();

        let dev = MallocBlockDevice::new(16, 512);
        let buf = vec![0u8; 512];
        let err = write(&mut n, &dev, other, 0, 1, 512, &buf);
        assert!(matches!(
            err,
            Err(Error::Reservation {
                source: reservation::Error::ReservationConflict
            })
        ));
    }

    #[test]
    fn compare_and_write_only_writes_on_match() {
        let mut n = ns();
        let dev = MallocBlockDevice::new(16, 512);
        dev.write_blocks(0, 1, &vec![0xAA; 512]);
        let bad_compare = vec![0x00; 512];
        let write_buf = vec![0xBB; 512];
        let err = compare_and_write(&mut n, &dev, Uuid::new_v4(), 0, 1, 512, 512, &bad_compare, &write_buf);
        assert!(matches!(err, Err(Error::DeviceError)));
        let mut readback = vec![0u8; 512];
        dev.read_blocks(0, 1, &mut readback);
        assert_eq!(readback, vec![0xAA; 512]);
    }

    #[test]
    fn reservation_report_requires_eds_bit() {
        let n = ns();
        assert!(matches!(
            reservation_report(&n, false),
            Err(Error::Reservation {
                source: reservation::Error::EdsNotSet
            })
        ));
    }

    #[test]
    fn reservation_report_encodes_registrants() {
        use crate::reservation::{RegisterAction, Cptpl};
        let mut n = ns();
        n.register(Uuid::new_v4(), RegisterAction::RegisterKey, false, 0, 7, Cptpl::NoChange)
            .unwrap();
        let bytes = reservation_report(&n, true).unwrap();
        assert_eq!(bytes.len(), 128);
    }

    #[test]
    fn dsm_unmap_rejects_too_many_ranges() {
        let mut n = ns();
        let dev = MallocBlockDevice::new(16, 512);
        let ranges = vec![(0u64, 1u32); MAX_DSM_RANGES + 1];
        let err = dsm_unmap(&mut n, &dev, Uuid::new_v4(), &ranges);
        assert!(matches!(err, Err(Error::TooManyDsmRanges { .. })));
    }

    #[test]
    fn dsm_unmap_zeroes_each_range() {
        let mut n = ns();
        let dev = MallocBlockDevice::new(16, 512);
        dev.write_blocks(0, 2, &vec![0xFF; 1024]);
        dsm_unmap(&mut n, &dev, Uuid::new_v4(), &[(0, 2)]).unwrap();
        let mut readback = vec![0u8; 1024];
        dev.read_blocks(0, 2, &mut readback);
        assert_eq!(readback, vec![0u8; 1024]);
    }

    #[test]
    fn connect_denies_host_not_on_allow_list() {
        use crate::subsystem::SubType;
        let mut sub = Subsystem::new(1, "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc", SubType::Nvme, 8).unwrap();
        let outcome = connect(&mut sub, "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000001", None, false).unwrap();
        assert_eq!(outcome, ConnectOutcome::HostNotAllowed);
    }

    #[test]
    fn connect_allocates_dynamic_cntlid_for_allowed_host() {
        use crate::subsystem::SubType;
        let mut sub = Subsystem::new(1, "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc", SubType::Nvme, 8).unwrap();
        sub.set_allow_any_host(true);
        let outcome = connect(&mut sub, "anyone", None, true).unwrap();
        assert_eq!(outcome, ConnectOutcome::Success { cntlid: 1, authreq: true });
    }

    #[test]
    fn connect_rejects_colliding_static_cntlid() {
        use crate::subsystem::SubType;
        let mut sub = Subsystem::new(1, "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc", SubType::Nvme, 8).unwrap();
        sub.set_allow_any_host(true);
        connect(&mut sub, "anyone", Some(5), false).unwrap();
        let err = connect(&mut sub, "anyone", Some(5), false);
        assert!(matches!(
            err,
            Err(Error::Connect {
                source: crate::subsystem::Error::ControllerIdInUse { cntlid: 5 }
            })
        ));
    }

    #[test]
    fn property_get_set_round_trip_through_dispatch() {
        use crate::wire::prop;
        let mut ctrlr = Controller::new(1, "h".into(), "s".into(), 4, 1024, 1000);
        property_set(&mut ctrlr, prop::CC.0, 1).unwrap();
        assert_eq!(property_get(&ctrlr, prop::CC.0).unwrap(), 1);
    }
}
