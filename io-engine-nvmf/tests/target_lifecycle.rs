//! End-to-end exercises of the target's public API across module
//! boundaries (subsystem + namespace + reservation + executor), the way
//! teacher's `tests/nexus_thin.rs` drives a nexus through its public gRPC
//! surface rather than poking internals directly.

use std::time::Duration;

use io_engine_nvmf::bdev::{MallocBlockDevice, PtplSink};
use io_engine_nvmf::executor;
use io_engine_nvmf::reservation::{
    AcquireAction, Cptpl, Namespace, RegisterAction, ReservationType,
};
use io_engine_nvmf::subsystem::{SubType, Subsystem, TransportId};
use uuid::Uuid;

const TEST_NQN: &str = "nqn.2014-08.org.nvmexpress:uuid:12345678-1234-1234-1234-123456789abc";

/// §8 S1: register + acquire + read denied for a non-registrant host,
/// driven through the subsystem, namespace and executor together.
#[tokio::test]
async fn s1_register_acquire_denies_non_registrant_read() {
    io_engine_nvmf::init_tracing();
    let mut sub = Subsystem::new(1, TEST_NQN, SubType::Nvme, 8).unwrap();
    sub.add_listener(TransportId {
        trtype: "TCP".into(),
        traddr: "10.0.0.1".into(),
        trsvcid: "4420".into(),
    })
    .unwrap();
    sub.start().unwrap();

    let mut ns = Namespace::new(1, Uuid::new_v4(), 64, 512);
    let host_a = Uuid::from_bytes([0xAA; 16]);
    let host_b = Uuid::from_bytes([0xBB; 16]);

    ns.register(host_a, RegisterAction::RegisterKey, false, 0, 0x1, Cptpl::NoChange)
        .unwrap();
    ns.acquire(host_a, AcquireAction::Acquire, ReservationType::ExclusiveAccess, 0x1, 0)
        .unwrap();

    let dev = MallocBlockDevice::new(64, 512);
    let mut buf = vec![0u8; 512];

    let denied = executor::read(&mut ns, &dev, host_b, 0, 1, 512, &mut buf);
    assert!(matches!(
        denied,
        Err(executor::Error::Reservation {
            source: io_engine_nvmf::reservation::Error::ReservationConflict
        })
    ));

    executor::read(&mut ns, &dev, host_a, 0, 1, 512, &mut buf).expect("holder can read");
}

/// §8 S6: a PTPL-persisted namespace restores its registrant/holder state
/// after a simulated "process restart" (a fresh `Namespace` loading the
/// same sink's JSON back in).
#[tokio::test]
async fn s6_ptpl_round_trips_across_simulated_restart() {
    let dir = std::env::temp_dir().join(format!("nvmf-ptpl-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ns1.json");
    let sink = io_engine_nvmf::bdev::FilePtplSink::new(&path);

    let uuid = Uuid::new_v4();
    let host_a = Uuid::from_bytes([0xAA; 16]);

    {
        let mut ns = Namespace::new(1, uuid, 64, 512).with_ptpl_sink(Box::new(sink));
        ns.register(host_a, RegisterAction::RegisterKey, false, 0, 0x9, Cptpl::Set)
            .unwrap();
        assert!(ns.ptpl_activated);
    }

    let sink = io_engine_nvmf::bdev::FilePtplSink::new(&path);
    let persisted = sink.restore().unwrap().expect("ptpl file written");
    assert_eq!(persisted.registrants.len(), 1);
    assert_eq!(persisted.registrants[0].rkey, 0x9);

    let mut restored = Namespace::new(1, uuid, 64, 512);
    restored.restore_ptpl(persisted).unwrap();
    assert_eq!(restored.get_registrant(host_a).unwrap().rkey, 0x9);

    std::fs::remove_dir_all(&dir).ok();
}

/// Subsystem pause/resume cycle, enough out-of-band latency to be worth a
/// `tokio::time::sleep` rather than a pure unit test (mirrors how the
/// async poll-group would actually schedule a retry of a pause that's
/// waiting on `io_outstanding == 0`).
#[tokio::test]
async fn subsystem_pause_then_resume_returns_to_active() {
    let mut sub = Subsystem::new(2, TEST_NQN, SubType::Nvme, 4).unwrap();
    sub.start().unwrap();
    sub.pause(0).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    sub.resume(0).unwrap();
    assert_eq!(sub.state(), io_engine_nvmf::subsystem::SubsystemState::Active);
}
