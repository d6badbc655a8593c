//! End-to-end loopback sessions against a running root-complex server.
//!
//! Each test binds an ephemeral port, wires the standard packet handlers onto
//! a `NetHandler`, and drives it with real client sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use vlinkd::ErrorKind;
use vlinkd::app::{ServerState, register_packet_handlers};
use vlinkd::config::CrewStation;
use vlinkd::error::Error;
use vlinkd::net::{Connection, NetHandler, Packet, PacketType, StopHandle};

const FIXTURE_JSON: &str = r#"{
    "crewStations": [{"nodeId": 1, "groups": [3, 4]}],
    "concentrators": [{"nodeId": 2, "cameras": [
        {"id": 3, "width": 1280, "height": 720, "fps": 30, "depth": 8,
         "bufferCount": 4, "comprFmt": "raw", "videoFmt": "UYVY", "videoDev": 0}
    ]}]
}"#;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: std::net::SocketAddr,
    stop: StopHandle,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let mut handler = NetHandler::new(listener).expect("net handler");
        register_packet_handlers(&mut handler);
        let stop = handler.stop_handle();
        handler.begin_packet_dispatch(state).expect("dispatcher");

        let accept_thread = thread::spawn(move || {
            let _ = handler.begin_accept();
            // NetHandler drops here, joining the dispatcher and receivers.
        });

        Self {
            addr,
            stop,
            accept_thread: Some(accept_thread),
        }
    }

    fn connect(&self) -> Connection {
        let conn = Connection::connect(self.addr).expect("connect");
        conn.set_read_timeout(Some(CLIENT_TIMEOUT)).expect("timeout");
        conn
    }

    /// Connect and register with the given node id.
    fn session(&self, node_id: u8) -> Connection {
        let conn = self.connect();
        let mut ready = Packet::new(PacketType::Ready);
        ready.push_u8(node_id);
        conn.send(&ready).expect("send Ready");
        let reply = conn.receive().expect("handshake reply");
        assert_eq!(reply.packet_type(), PacketType::Ok);
        conn
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn fixture_state() -> (ServerState, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    std::fs::write(file.path(), FIXTURE_JSON).expect("write fixture");
    let state = ServerState {
        camconf_path: Some(file.path().display().to_string()),
        ..ServerState::default()
    };
    (state, file)
}

fn expect_error_reply(conn: &Connection) -> Error {
    let reply = conn.receive().expect("reply");
    assert_eq!(reply.packet_type(), PacketType::Err);
    Error::from_packet(reply)
}

#[test]
fn handshake_raw_bytes() {
    let server = TestServer::start(ServerState::default());

    let mut stream = TcpStream::connect(server.addr).expect("connect");
    stream
        .set_read_timeout(Some(CLIENT_TIMEOUT))
        .expect("timeout");

    // Ready, dataLen=1, node id 42.
    stream
        .write_all(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x2A])
        .expect("write");

    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).expect("read");
    assert_eq!(reply, [0x02, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn non_ready_first_packet_closes_socket() {
    let server = TestServer::start(ServerState::default());

    let conn = server.connect();
    let mut join = Packet::new(PacketType::Join);
    join.push_u8(5);
    conn.send(&join).expect("send");

    // No data comes back; the server closes the socket instead.
    let err = conn.receive().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetBadPacket);
    assert!(!conn.is_connected());
}

#[test]
fn string_packet_is_acknowledged() {
    let server = TestServer::start(ServerState::default());

    let conn = server.session(7);
    conn.send(&Packet::string("hi")).expect("send");
    let reply = conn.receive().expect("reply");
    assert_eq!(reply.packet_type(), PacketType::Ok);
}

#[test]
fn join_then_duplicate_join() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(42);

    let mut join = Packet::new(PacketType::Join);
    join.push_u8(5);
    conn.send(&join).expect("send join");
    assert_eq!(conn.receive().expect("reply").packet_type(), PacketType::Ok);

    let mut join = Packet::new(PacketType::Join);
    join.push_u8(5);
    conn.send(&join).expect("send dup join");
    let err = expect_error_reply(&conn);
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(err.message(), Some("Already in group 5"));
}

#[test]
fn leave_without_join_fails() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(42);

    let mut leave = Packet::new(PacketType::Leave);
    leave.push_u8(6);
    conn.send(&leave).expect("send leave");
    let err = expect_error_reply(&conn);
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(err.message(), Some("Not in group 6. Join first"));
}

#[test]
fn join_leave_rejoin_cycle() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(9);

    for ty in [PacketType::Join, PacketType::Leave, PacketType::Join] {
        let mut packet = Packet::new(ty);
        packet.push_u8(12);
        conn.send(&packet).expect("send");
        assert_eq!(conn.receive().expect("reply").packet_type(), PacketType::Ok);
    }
}

#[test]
fn out_of_range_group_is_rejected() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(9);

    let mut join = Packet::new(PacketType::Join);
    join.push_u8(63);
    conn.send(&join).expect("send");
    let err = expect_error_reply(&conn);
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn crew_config_reply_carries_group_list() {
    let (state, _fixture) = fixture_state();
    let server = TestServer::start(state);

    let conn = server.session(1);
    conn.send(&Packet::new(PacketType::GetCrewConfig)).expect("send");
    let mut reply = conn.receive().expect("reply");
    assert_eq!(reply.packet_type(), PacketType::String);
    let groups: Vec<u8> = serde_json::from_str(&reply.pop_string()).expect("group json");
    assert_eq!(groups, vec![3, 4]);
}

#[test]
fn crew_config_for_unknown_node_is_not_found() {
    let (state, _fixture) = fixture_state();
    let server = TestServer::start(state);

    let conn = server.session(99);
    conn.send(&Packet::new(PacketType::GetCrewConfig)).expect("send");
    let err = expect_error_reply(&conn);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn concentrator_config_matches_groups_to_cameras() {
    let (state, _fixture) = fixture_state();
    let server = TestServer::start(state);

    let conn = server.session(1);
    conn.send(&Packet::new(PacketType::GetCtrConfig)).expect("send");
    let mut reply = conn.receive().expect("reply");
    assert_eq!(reply.packet_type(), PacketType::String);

    let json: serde_json::Value = serde_json::from_str(&reply.pop_string()).expect("json");
    assert_eq!(json["nodeId"], 1);
    let cameras = json["cameras"].as_array().expect("cameras array");
    // Groups are [3, 4]; only camera id 3 exists.
    assert_eq!(cameras.len(), 1);
    assert_eq!(cameras[0]["id"], 3);
    assert_eq!(cameras[0]["videoFmt"], "UYVY");
}

#[test]
fn config_requests_without_camconf_report_errors() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(1);

    conn.send(&Packet::new(PacketType::GetCrewConfig)).expect("send");
    let err = expect_error_reply(&conn);
    assert_eq!(err.kind(), ErrorKind::InvalidCameraConfiguration);
}

fn slow_reboot_stub() {
    thread::sleep(Duration::from_millis(750));
}

#[test]
fn reboot_ack_arrives_before_reboot_side_effects() {
    let state = ServerState {
        reboot: slow_reboot_stub,
        ..ServerState::default()
    };
    let server = TestServer::start(state);
    let conn = server.session(3);

    let started = Instant::now();
    conn.send(&Packet::new(PacketType::Reboot)).expect("send");
    let reply = conn.receive().expect("reply");
    assert_eq!(reply.packet_type(), PacketType::Ok);
    // The acknowledgement must not wait for the reboot hook.
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[test]
fn unhandled_packet_types_get_no_reply() {
    let server = TestServer::start(ServerState::default());
    let conn = server.session(4);

    conn.send(&Packet::new(PacketType::NoOp)).expect("send");
    // The server drops the packet; the read times out with no data.
    assert!(conn.receive().is_err());
}

#[test]
fn distinct_endpoints_have_independent_membership() {
    let server = TestServer::start(ServerState::default());
    let first = server.session(10);
    let second = server.session(11);

    for conn in [&first, &second] {
        let mut join = Packet::new(PacketType::Join);
        join.push_u8(2);
        conn.send(&join).expect("send");
        assert_eq!(conn.receive().expect("reply").packet_type(), PacketType::Ok);
    }

    // Node 10 leaving does not affect node 11.
    let mut leave = Packet::new(PacketType::Leave);
    leave.push_u8(2);
    first.send(&leave).expect("send");
    assert_eq!(first.receive().expect("reply").packet_type(), PacketType::Ok);

    let mut leave = Packet::new(PacketType::Leave);
    leave.push_u8(2);
    second.send(&leave).expect("send");
    assert_eq!(second.receive().expect("reply").packet_type(), PacketType::Ok);
}

#[test]
fn crew_station_record_round_trips_as_json() {
    let crew = CrewStation {
        node_id: 1,
        groups: vec![3, 4],
    };
    let json = serde_json::to_string(&crew).expect("serialize");
    let back: CrewStation = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, crew);
}
