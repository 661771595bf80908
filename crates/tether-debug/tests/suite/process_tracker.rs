use std::time::Duration;

use tokio::sync::watch;

use tether_adb::AdbError;
use tether_debug::{DebugError, JdwpProcess, JdwpProcessTracker};

use crate::support::{yield_until, TestRig};

async fn wait_pids(processes: &watch::Receiver<Vec<JdwpProcess>>, expected: &[u32]) {
    let mut rx = processes.clone();
    yield_until(move || {
        let pids: Vec<u32> = rx.borrow_and_update().iter().map(JdwpProcess::pid).collect();
        pids == expected
    })
    .await;
}

#[tokio::test]
async fn tracker_reports_appearing_and_vanishing_pids() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", 10, "com.example.app");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let processes = tracker.processes();
    wait_pids(&processes, &[10]).await;

    rig.fake.stop_client("d1", 10);
    wait_pids(&processes, &[]).await;

    tracker.close();
    assert!(matches!(tracker.join().await, Err(DebugError::Cancelled)));
    rig.shutdown();
}

#[tokio::test]
async fn tracker_keeps_surviving_processes_across_updates() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", 10, "com.example.a");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let mut processes = tracker.processes();
    wait_pids(&processes, &[10]).await;
    let first = processes.borrow_and_update()[0].clone();

    rig.fake.start_client("d1", 11, "com.example.b");
    wait_pids(&processes, &[10, 11]).await;

    // Pid 10 was not re-created by the second frame.
    let still_first = processes
        .borrow_and_update()
        .iter()
        .find(|p| p.pid() == 10)
        .cloned()
        .unwrap();
    assert_eq!(first.pid(), still_first.pid());
    assert!(
        first.proxy_status().borrow().socket_address
            == still_first.proxy_status().borrow().socket_address
    );

    tracker.close();
    rig.shutdown();
}

#[tokio::test]
async fn clean_stream_end_retries_and_resyncs() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", 10, "com.example.app");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let processes = tracker.processes();
    wait_pids(&processes, &[10]).await;

    // The daemon closes the stream while the device stays connected: the
    // tracker reports an empty list for the duration of the outage...
    rig.fake.end_track_jdwp_streams("d1");
    wait_pids(&processes, &[]).await;

    // ...then reopens the stream after its backoff and resyncs to the real
    // pid set, which still contains the live process.
    wait_pids(&processes, &[10]).await;

    tracker.close();
    rig.shutdown();
}

#[tokio::test]
async fn daemon_fault_is_fatal_and_propagates() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.fail_next_track_jdwp("d1");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let result = tokio::time::timeout(Duration::from_secs(10), tracker.join())
        .await
        .expect("tracker did not terminate");
    match result {
        Err(DebugError::Adb(AdbError::Failure(message))) => {
            assert!(message.contains("track-jdwp"));
        }
        other => panic!("expected fatal ADB failure, got {other:?}"),
    }
    assert!(tracker.processes().borrow().is_empty());
    rig.shutdown();
}

#[tokio::test]
async fn device_disconnect_empties_list_and_stops_cleanly() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", 10, "com.example.app");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let mut processes = tracker.processes();
    wait_pids(&processes, &[10]).await;
    let process = processes.borrow_and_update()[0].clone();

    rig.fake.disconnect_device("d1");

    let result = tokio::time::timeout(Duration::from_secs(10), tracker.join())
        .await
        .expect("tracker did not terminate");
    assert!(result.is_ok(), "expected clean stop, got {result:?}");
    assert!(tracker.processes().borrow().is_empty());

    // Released processes report their proxies as detached.
    let mut status = process.proxy_status();
    yield_until(move || !status.borrow_and_update().is_external_debugger_attached).await;

    rig.shutdown();
}

#[tokio::test]
async fn cancellation_always_clears_the_process_list() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", 10, "com.example.app");

    let tracker = JdwpProcessTracker::start(rig.services.clone(), device);
    let processes = tracker.processes();
    wait_pids(&processes, &[10]).await;

    tracker.close();
    assert!(matches!(tracker.join().await, Err(DebugError::Cancelled)));
    assert!(processes.borrow().is_empty());
    rig.shutdown();
}
