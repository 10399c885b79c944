//! Integration tests for the sync worker
//!
//! These tests validate the complete device round trip over the dummy link:
//! - device values reaching a listener, with alias values derived
//! - subscription frames following the first and last watcher
//! - write batches completing in order per entry
//! - device-side write rejection and link loss

mod common;

use common::builders::motor_pipeline;
use common::protocol::{ack_frame, parse_write, value_frame, LineProtocol};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use watchlink_rs::config::{CoreConfig, ListenerConfig};
use watchlink_rs::link::{DummyLink, DummyLinkHandle};
use watchlink_rs::listener::{BaseListener, BufferedReaderListener};
use watchlink_rs::registry::WatchableRegistry;
use watchlink_rs::sync::{SyncHandle, SyncWorker};
use watchlink_rs::types::Value;
use watchlink_rs::{OutOfRangePolicy, WatchError, WriteStatus};

struct Harness {
    registry: Arc<WatchableRegistry>,
    device: DummyLinkHandle,
    sync: SyncHandle,
    thread: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(config: CoreConfig) -> Self {
        common::init_tracing();
        let registry = Arc::new(WatchableRegistry::new());
        let pipeline = motor_pipeline();
        pipeline.populate_registry(&registry).unwrap();

        let link = DummyLink::new(false);
        let device = link.handle();
        let (worker, sync) = SyncWorker::new(
            &config,
            Box::new(link),
            Box::new(LineProtocol::new()),
            pipeline,
            Arc::clone(&registry),
        );
        let thread = worker.spawn().unwrap();
        Self {
            registry,
            device,
            sync,
            thread: Some(thread),
        }
    }

    /// Collect host frames until `count` writes were seen
    fn wait_for_writes(&self, count: usize) -> Vec<(String, Vec<u8>)> {
        let mut writes = Vec::new();
        common::wait_until(common::test_timeout(), || {
            writes.extend(
                self.device
                    .take_written()
                    .iter()
                    .filter_map(|frame| parse_write(frame)),
            );
            writes.len() >= count
        });
        writes
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.sync.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn test_values_reach_listener_with_alias() {
    let harness = Harness::start(CoreConfig::default());
    let (reader, rx) = BufferedReaderListener::new();
    let mut listener = BaseListener::new(
        "reader",
        reader,
        Arc::clone(&harness.registry),
        ListenerConfig::default(),
    );
    listener
        .subscribe(["alias:/alias/speed_rpm", "rpv:/rpv/x0010"])
        .unwrap();
    listener.start().unwrap();

    // Alias watch maps to a device subscription on its target
    let subscribed = common::wait_until(common::test_timeout(), || {
        harness
            .device
            .take_written()
            .iter()
            .any(|frame| frame.as_slice() == b"S speed 1\n")
    });
    assert!(subscribed);

    let mut frame = value_frame("speed", &300u16.to_le_bytes());
    frame.extend(value_frame("temp", &21.5f32.to_be_bytes()));
    harness.device.inject(frame);

    let first = rx.recv_timeout(common::test_timeout()).unwrap();
    let second = rx.recv_timeout(common::test_timeout()).unwrap();
    assert_eq!(first.fqn.to_string(), "alias:/alias/speed_rpm");
    common::assert_float_eq(first.value.as_f64(), 150.0, 1e-9);
    assert_eq!(second.fqn.to_string(), "rpv:/rpv/x0010");
    assert_eq!(second.value, Value::Float(21.5));

    listener.stop().unwrap();
    let unsubscribed = common::wait_until(common::test_timeout(), || {
        harness
            .device
            .take_written()
            .iter()
            .any(|frame| frame.as_slice() == b"S speed 0\n")
    });
    assert!(unsubscribed);
}

#[test]
fn test_batch_writes_complete_in_order() {
    let harness = Harness::start(CoreConfig::default());
    let requests = harness
        .sync
        .batch_write([("speed", 1.0), ("temp", 20.0), ("speed", 2.0), ("speed_rpm", 5.0)])
        .unwrap();

    // One in flight per device entry: speed and temp
    let first = harness.wait_for_writes(2);
    let mut ids: Vec<&str> = first.iter().map(|(id, _)| id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["speed", "temp"]);
    assert!(first.contains(&("speed".to_string(), 1u16.to_le_bytes().to_vec())));
    assert!(first.contains(&("temp".to_string(), 20.0f32.to_be_bytes().to_vec())));

    harness.device.inject(ack_frame("temp", true));
    requests[1]
        .wait_for_completion(common::test_timeout())
        .unwrap();
    assert_eq!(requests[0].status(), WriteStatus::Pending);

    harness.device.inject(ack_frame("speed", true));
    requests[0]
        .wait_for_completion(common::test_timeout())
        .unwrap();
    let second = harness.wait_for_writes(1);
    assert_eq!(second, vec![("speed".to_string(), 2u16.to_le_bytes().to_vec())]);

    harness.device.inject(ack_frame("speed", true));
    requests[2]
        .wait_for_completion(common::test_timeout())
        .unwrap();

    // Alias write lands on its target: 5 / 0.5 = 10
    let third = harness.wait_for_writes(1);
    assert_eq!(third, vec![("speed".to_string(), 10u16.to_le_bytes().to_vec())]);
    harness.device.inject(ack_frame("speed", false));
    let err = requests[3]
        .wait_for_completion(common::test_timeout())
        .unwrap_err();
    assert!(matches!(err, WatchError::OperationFailure(_)));
    assert_eq!(requests[3].failure_reason().as_deref(), Some("rejected"));

    let completions: Vec<_> = requests[..3]
        .iter()
        .map(|r| r.completion_time().unwrap())
        .collect();
    assert!(completions[0] <= completions[2]);
}

#[test]
fn test_out_of_range_alias_write_rejected() {
    let mut config = CoreConfig::default();
    config.write.out_of_range = OutOfRangePolicy::Reject;
    let harness = Harness::start(config);

    let request = harness.sync.write("speed_rpm", 5000.0).unwrap();
    let err = request
        .wait_for_completion(common::test_timeout())
        .unwrap_err();
    assert!(matches!(err, WatchError::OperationFailure(_)));
    assert_eq!(request.status(), WriteStatus::Failed);
    assert!(harness.wait_for_writes(1).is_empty());
}

#[test]
fn test_unacknowledged_write_times_out_on_device_side() {
    let mut config = CoreConfig::default();
    config.write.timeout_ms = 50;
    let harness = Harness::start(config);

    let request = harness.sync.write("speed", 7.0).unwrap();
    assert_eq!(harness.wait_for_writes(1).len(), 1);

    // Caller gives up first, the request is still pending
    let err = request
        .wait_for_completion(Duration::from_millis(1))
        .unwrap_err();
    assert!(err.is_timeout());

    request
        .wait_for_completion(common::test_timeout())
        .unwrap_err();
    assert_eq!(request.status(), WriteStatus::Failed);
}

#[test]
fn test_link_loss_recovers() {
    let harness = Harness::start(CoreConfig::default());
    let (reader, rx) = BufferedReaderListener::new();
    let mut listener = BaseListener::new(
        "reader",
        reader,
        Arc::clone(&harness.registry),
        ListenerConfig::default(),
    );
    listener.subscribe(["var:/motor/speed"]).unwrap();
    listener.start().unwrap();

    harness.device.inject(value_frame("speed", &1u16.to_le_bytes()));
    assert_eq!(
        rx.recv_timeout(common::test_timeout()).unwrap().value,
        Value::Unsigned(1)
    );

    harness.device.set_broken(true);
    // Reconnect happens at most once per second
    harness.device.inject(value_frame("speed", &2u16.to_le_bytes()));
    let update = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(update.value, Value::Unsigned(2));

    // Subscriptions are replayed after the reconnect
    assert!(common::wait_until(common::test_timeout(), || {
        harness
            .device
            .take_written()
            .iter()
            .any(|frame| frame.as_slice() == b"S speed 1\n")
    }));
    listener.stop().unwrap();
}

#[test]
fn test_write_after_shutdown_fails() {
    let harness = Harness::start(CoreConfig::default());
    harness.sync.shutdown();
    assert!(!harness.sync.is_running());
    assert!(matches!(
        harness.sync.write("speed", 1.0),
        Err(WatchError::OperationFailure(_))
    ));
}
