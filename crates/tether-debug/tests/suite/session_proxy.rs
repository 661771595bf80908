use std::time::Duration;

use tether_debug::{JdwpProcess, INTERNAL_PACKET_ID_BASE};
use tether_jdwp::ddms::{DdmsChunk, DdmsChunkType};
use tether_jdwp::JdwpPacket;

use crate::support::{attach_debugger, proxy_socket_addr, receive_reply, yield_until, TestRig};

const PID: u32 = 10;

async fn monitored_process(rig: &TestRig, device: &tether_adb::DeviceHandle) -> JdwpProcess {
    let process = JdwpProcess::new(rig.services.clone(), device.clone(), PID);
    process.start_monitoring();
    process
}

fn helo_packet(id: u32) -> JdwpPacket {
    DdmsChunk::new(DdmsChunkType::HELO, 1u32.to_be_bytes().to_vec()).into_command_packet(id)
}

#[tokio::test]
async fn socket_address_is_assigned_automatically() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let addr = proxy_socket_addr(&process).await;
    assert!(addr.ip().is_loopback());
    assert!(!process.proxy_status().borrow().is_external_debugger_attached);

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn process_metadata_is_collected_over_ddms() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let mut properties = process.properties();
    yield_until({
        let mut properties = properties.clone();
        move || properties.borrow_and_update().completed
    })
    .await;

    let props = properties.borrow_and_update().clone();
    assert_eq!(props.pid, PID);
    assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
    assert!(props.vm_identifier.is_some());

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn relay_round_trips_packets_with_matching_ids() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;
    let packet = JdwpPacket::command(7, 1, 1, Vec::new());
    debugger.send_packet(&packet).await.unwrap();

    let reply = receive_reply(&debugger, 7).await;
    assert!(reply.is_reply());
    assert_eq!(reply.id, 7);

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn external_debugger_can_detach_and_reattach() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let first_addr = proxy_socket_addr(&process).await;
    let debugger = attach_debugger(&process).await;
    {
        let mut status = process.proxy_status();
        yield_until(move || status.borrow_and_update().is_external_debugger_attached).await;
    }
    debugger.send_packet(&JdwpPacket::command(1, 1, 1, Vec::new())).await.unwrap();
    receive_reply(&debugger, 1).await;

    drop(debugger);
    {
        let mut status = process.proxy_status();
        yield_until(move || !status.borrow_and_update().is_external_debugger_attached).await;
    }

    // Reattachment sees the same endpoint and a working relay.
    assert_eq!(proxy_socket_addr(&process).await, first_addr);
    let debugger = attach_debugger(&process).await;
    {
        let mut status = process.proxy_status();
        yield_until(move || status.borrow_and_update().is_external_debugger_attached).await;
    }
    debugger.send_packet(&JdwpPacket::command(2, 1, 1, Vec::new())).await.unwrap();
    let reply = receive_reply(&debugger, 2).await;
    assert!(reply.is_reply());

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn ddms_traffic_is_filtered_from_the_external_stream() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;
    debugger.send_packet(&helo_packet(5)).await.unwrap();
    debugger
        .send_packet(&JdwpPacket::command(6, 1, 1, Vec::new()))
        .await
        .unwrap();

    // The reply to the DDMS HELO never reaches the external client; the first
    // delivered packet is the reply to the ordinary command.
    let first = tokio::time::timeout(Duration::from_secs(10), debugger.receive_packet())
        .await
        .expect("no packet in time")
        .unwrap();
    assert_eq!(first.id, 6);
    assert!(first.is_reply());

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn internal_subscribers_observe_filtered_ddms_traffic() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;
    let mut packets = process.proxy().subscribe_packets();

    debugger.send_packet(&helo_packet(5)).await.unwrap();
    debugger
        .send_packet(&JdwpPacket::command(6, 1, 1, Vec::new()))
        .await
        .unwrap();

    // Internal subscribers see both replies, including the DDMS one withheld
    // from the external client.
    let mut seen = Vec::new();
    while !(seen.contains(&5) && seen.contains(&6)) {
        let packet = tokio::time::timeout(Duration::from_secs(10), packets.recv())
            .await
            .expect("no packet in time")
            .expect("packet channel closed");
        seen.push(packet.id);
    }

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn device_initiated_ddms_commands_stay_internal() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;
    {
        let mut status = process.proxy_status();
        yield_until(move || status.borrow_and_update().is_external_debugger_attached).await;
    }
    let mut packets = process.proxy().subscribe_packets();

    // The VM renames the process: an unsolicited DDMS APNM command.
    rig.fake.send_client_ddms_chunk(
        "d1",
        PID,
        DdmsChunk::new(DdmsChunkType::APNM, b"renamed".to_vec()),
    );

    // The internal stream carries the APNM command.
    let apnm = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let packet = packets.recv().await.expect("packet channel closed");
            if tether_jdwp::ddms::is_ddms_command(&packet) {
                return packet;
            }
        }
    })
    .await
    .expect("no DDMS command in time");
    assert!(!apnm.is_reply());

    // The external client never sees it: the first packet it receives is the
    // reply to its own later command.
    debugger
        .send_packet(&JdwpPacket::command(9, 1, 1, Vec::new()))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), debugger.receive_packet())
        .await
        .expect("no packet in time")
        .unwrap();
    assert_eq!(first.id, 9);

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn internal_command_ids_never_collide_with_external_ids() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;

    let internal_reply = process
        .proxy()
        .send_internal_command(1, 1, Vec::new())
        .await
        .unwrap();
    assert!(internal_reply.id >= INTERNAL_PACKET_ID_BASE);

    // The external client's own traffic is unaffected and never observes the
    // internal reply.
    debugger
        .send_packet(&JdwpPacket::command(3, 1, 1, Vec::new()))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), debugger.receive_packet())
        .await
        .expect("no packet in time")
        .unwrap();
    assert_eq!(first.id, 3);

    process.close();
    rig.shutdown();
}

#[tokio::test]
async fn device_disconnect_fails_in_flight_external_receive() {
    let (rig, device) = TestRig::with_device("d1").await;
    rig.fake.start_client("d1", PID, "com.example.app");
    let process = monitored_process(&rig, &device).await;

    let debugger = attach_debugger(&process).await;
    debugger.send_packet(&JdwpPacket::command(1, 1, 1, Vec::new())).await.unwrap();
    receive_reply(&debugger, 1).await;

    rig.fake.disconnect_device("d1");

    let result = tokio::time::timeout(Duration::from_secs(10), debugger.receive_packet())
        .await
        .expect("receive did not fail");
    assert!(result.is_err(), "expected I/O failure, got {result:?}");

    let mut status = process.proxy_status();
    yield_until(move || !status.borrow_and_update().is_external_debugger_attached).await;

    process.close();
    rig.shutdown();
}
