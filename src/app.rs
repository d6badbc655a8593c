//! Application core: role resolution, CLI delegates, the server-side packet
//! handlers and the connect-to-RC client sequence.
//!
//! One binary serves every role. The root complex (`--rootcomplex`) binds the
//! server port and blocks in the accept loop; the other roles run as
//! short-lived CLI clients that dial the RC, perform one exchange and exit.

use std::fs::File;
use std::net::{SocketAddr, TcpListener};
use std::process::{Child, Command};
use std::thread;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::cli::{ArgKind, Cli, value_of};
use crate::config::{Camera, CameraConfig, CrewStation};
use crate::error::{Error, ErrorKind, Result};
use crate::logger;
use crate::net::conn::Connection;
use crate::net::endpoint::Endpoint;
use crate::net::handler::{NetHandler, StopHandle};
use crate::net::packet::{Packet, PacketType};
use crate::util;

/// TCP port the root complex serves on.
pub const ROOT_SERVER_PORT: u16 = 7777;
/// Address clients dial to reach the root complex.
pub const ROOT_SERVER_ADDR: &str = "127.0.0.1:7777";
/// Size of the multicast group id space.
pub const GROUP_COUNT: usize = 63;

const LOG_FILE_PATH: &str = "/var/log/pciepciemgr.log";
const NODE_ID_FILE: &str = "/etc/vlink.conf";

/// Wire shape of the concentrator-configuration reply.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConcentratorConfig {
    node_id: u8,
    cameras: Vec<Camera>,
}

/// State owned by the packet-dispatcher thread once the server starts.
///
/// Handlers run serially on that one thread, which is why none of these
/// fields need locking.
pub struct ServerState {
    /// Group id -> member node ids, duplicate-free per group.
    pub groups: [Vec<u8>; GROUP_COUNT],
    pub cameras: Vec<Camera>,
    pub crew_stations: Vec<CrewStation>,
    pub camconf_path: Option<String>,
    /// Invoked by the reboot handler after the acknowledgement is on the wire.
    pub reboot: fn(),
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            groups: std::array::from_fn(|_| Vec::new()),
            cameras: Vec::new(),
            crew_stations: Vec::new(),
            camconf_path: None,
            reboot: system_reboot,
        }
    }
}

impl ServerState {
    /// Re-read the camera-configuration document from disk.
    fn reload_config(&mut self) -> Result<()> {
        let Some(path) = self.camconf_path.clone() else {
            return Err(Error::with_message(
                ErrorKind::InvalidCameraConfiguration,
                "No camera configuration file specified.",
            ));
        };
        let config = CameraConfig::load(&path)?;
        self.cameras = config.cameras;
        self.crew_stations = config.crew_stations;
        Ok(())
    }
}

/// Default reboot hook. The real syscall is opt-in so that a stray packet can
/// never take down a development host.
fn system_reboot() {
    #[cfg(feature = "system-reboot")]
    {
        if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            error!("reboot(2) failed: {e}");
        }
    }
    #[cfg(not(feature = "system-reboot"))]
    warn!("Reboot requested, but this build was made without the system-reboot feature.");
}

pub struct Application {
    args: Vec<String>,
    bin_name: String,
    daemon_mode: bool,
    root_complex: bool,
    crew_station: bool,
    concentrator: bool,
    started: bool,
    node_id: u8,
    log_file_path: String,
    listener: Option<TcpListener>,
    conn: Option<Connection>,
    /// Client-side camera list, fetched from the RC by `connect_to_rc`.
    cameras: Vec<Camera>,
    state: ServerState,
}

impl Application {
    pub fn new(args: Vec<String>) -> Self {
        let bin_name = args
            .first()
            .map(|path| path.rsplit('/').next().unwrap_or(path.as_str()).to_string())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self {
            args,
            bin_name,
            daemon_mode: false,
            root_complex: false,
            crew_station: false,
            concentrator: false,
            started: false,
            node_id: 0,
            log_file_path: LOG_FILE_PATH.to_string(),
            listener: None,
            conn: None,
            cameras: Vec::new(),
            state: ServerState::default(),
        }
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Parse the command line and prepare the selected role. Returns `false`
    /// when the invocation did nothing but print usage.
    pub fn init(&mut self) -> Result<bool> {
        let mut cli = Cli::new(self.bin_name.clone());

        // Dispatch order is registration order: the daemon option must fire
        // first so that everything after it logs to the right place.
        cli.add(&["--daemon", "-d"], "Execute as a daemon.", ArgKind::Option, Self::arg_daemon);
        cli.add(
            &["--rootcomplex", "-r"],
            "Execute as the Root Complex.",
            ArgKind::Option,
            Self::arg_root_complex,
        );
        cli.add(
            &["--crewstation", "-cs"],
            "Connect as a Crew Station.",
            ArgKind::Option,
            Self::arg_crew_station,
        );
        cli.add(
            &["--concentrator", "-ct"],
            "Connect as a Concentrator.",
            ArgKind::Option,
            Self::arg_concentrator,
        );
        cli.add(
            &["--camconf", "-cf"],
            "Load the specified camera configuration file.",
            ArgKind::Option,
            Self::arg_camconf,
        );
        cli.add(
            &["--leave", "-l"],
            "Leave a multicast group.",
            ArgKind::SubCommand,
            Self::arg_leave,
        );
        cli.add(&["--join", "-j"], "Join a multicast group.", ArgKind::SubCommand, Self::arg_join);
        cli.add(
            &["--sendstr", "-s"],
            "Send a string to the RC.",
            ArgKind::SubCommand,
            Self::arg_sendstr,
        );
        cli.add(&["root", "rc"], "Communicate with the RC.", ArgKind::SubCommand, Self::arg_rc_command);
        cli.add(
            &["gst"],
            "Invoke GStreamer based on configuration sent by the RC.",
            ArgKind::SubCommand,
            Self::arg_gst,
        );

        let argv = self.args.clone();
        if !cli.dispatch(self, &argv)? {
            return Ok(false);
        }

        info!("Application init");
        self.started = true;
        info!("Daemon mode: {}", self.daemon_mode);
        info!("Root Complex: {}", self.root_complex);
        if self.root_complex && self.state.camconf_path.is_none() {
            warn!("Camera configuration file not specified.");
        }
        Ok(true)
    }

    /// Serve endpoints. Blocks in the accept loop until stopped. Does nothing
    /// unless the root-complex role was selected.
    pub fn run(&mut self) -> Result<()> {
        if !self.root_complex {
            return Ok(());
        }
        let listener = self.listener.take().ok_or_else(|| {
            Error::with_message(
                ErrorKind::InvalidState,
                "Root Complex selected but no listening socket was bound.",
            )
        })?;

        let mut handler = NetHandler::new(listener)?;
        register_packet_handlers(&mut handler);
        install_signal_stop(handler.stop_handle())?;

        handler.begin_packet_dispatch(std::mem::take(&mut self.state))?;
        handler.begin_accept()
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Dial the root complex, register as an endpoint and fetch the
    /// configuration slice for the selected role.
    pub fn connect_to_rc(&mut self) -> Result<()> {
        let addr: SocketAddr = ROOT_SERVER_ADDR
            .parse()
            .map_err(|_| Error::new(ErrorKind::NetSocketError))?;
        let conn = Connection::connect(addr)?;

        let node_file = util::read_to_string(NODE_ID_FILE)?;
        self.node_id = util::parse_node_id(&node_file)?;

        info!("Node ID: {}", self.node_id);
        info!("Connected to Root Complex.");
        info!("Sending Ready packet...");

        let mut ready = Packet::new(PacketType::Ready);
        ready.push_u8(self.node_id);
        conn.send(&ready)?;

        let reply = conn.receive()?;
        if reply.packet_type() != PacketType::Ok {
            return Err(Error::new(ErrorKind::NetReadyFailure));
        }

        if self.crew_station {
            conn.send(&Packet::new(PacketType::GetCrewConfig))?;
            let mut reply = conn.receive()?;
            if reply.packet_type() == PacketType::Err {
                return Err(Error::from_packet(reply));
            }
            info!("Crew config: {}", reply.pop_string());
        } else if self.concentrator {
            conn.send(&Packet::new(PacketType::GetCtrConfig))?;
            let mut reply = conn.receive()?;
            if reply.packet_type() == PacketType::Err {
                return Err(Error::from_packet(reply));
            }
            let json = reply.pop_string();
            let config: ConcentratorConfig = serde_json::from_str(&json)
                .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;
            for cam in &config.cameras {
                cam.validate()?;
            }
            info!("Concentrator config: {json}");
            self.cameras = config.cameras;
        }

        self.conn = Some(conn);
        Ok(())
    }

    fn require_conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState))
    }

    // ------------------------------------------------------------------
    // CLI delegates (fire in registration order)
    // ------------------------------------------------------------------

    fn arg_daemon(&mut self, _args: &[String]) -> Result<()> {
        self.daemon_mode = true;
        let file = File::create(&self.log_file_path).map_err(|_| {
            Error::with_message(
                ErrorKind::IOError,
                format!("Failed to open {} for writing.", self.log_file_path),
            )
        })?;
        logger::log_to_file(file);
        let prefix = format!("{}d", logger::prefix());
        logger::set_prefix(&prefix);
        Ok(())
    }

    fn arg_root_complex(&mut self, _args: &[String]) -> Result<()> {
        self.root_complex = true;

        if !nix::unistd::Uid::effective().is_root() {
            return Err(Error::invalid_op(
                "Root privileges are required in order to operate as the Root Complex.",
            ));
        }

        logger::set_prefix(if logger::prefix().ends_with('d') { "RPd" } else { "RP" });

        info!("Binding to (0.0.0.0:{ROOT_SERVER_PORT})...");
        let listener = TcpListener::bind(("0.0.0.0", ROOT_SERVER_PORT)).map_err(|e| {
            Error::with_message(
                ErrorKind::NetSocketError,
                format!("Failed to bind to endpoint (0.0.0.0:{ROOT_SERVER_PORT}): {e}"),
            )
        })?;
        self.listener = Some(listener);
        Ok(())
    }

    fn arg_crew_station(&mut self, _args: &[String]) -> Result<()> {
        self.crew_station = true;
        Ok(())
    }

    fn arg_concentrator(&mut self, _args: &[String]) -> Result<()> {
        if self.crew_station {
            return Err(Error::invalid_op(
                "A node cannot be a crew station and a concentrator at the same time.",
            ));
        }
        self.concentrator = true;
        Ok(())
    }

    fn arg_camconf(&mut self, args: &[String]) -> Result<()> {
        let path = args
            .first()
            .and_then(|token| value_of(token))
            .ok_or_else(|| {
                Error::with_message(ErrorKind::UnknownArgument, "Expected --camconf=<path>.")
            })?;
        self.state.camconf_path = Some(path.to_string());
        self.state.reload_config()
    }

    fn arg_join(&mut self, args: &[String]) -> Result<()> {
        let group_id = parse_group_arg(args)?;
        self.connect_to_rc()?;
        let conn = self.require_conn()?;

        let mut packet = Packet::new(PacketType::Join);
        packet.push_u8(group_id);
        conn.send(&packet)?;

        let reply = conn.receive()?;
        if reply.packet_type() == PacketType::Err {
            return Err(Error::from_packet(reply));
        }
        info!("Successfully joined.");
        Ok(())
    }

    fn arg_leave(&mut self, args: &[String]) -> Result<()> {
        let group_id = parse_group_arg(args)?;
        self.connect_to_rc()?;
        let conn = self.require_conn()?;

        let mut packet = Packet::new(PacketType::Leave);
        packet.push_u8(group_id);
        conn.send(&packet)?;

        let reply = conn.receive()?;
        if reply.packet_type() == PacketType::Err {
            return Err(Error::from_packet(reply));
        }
        info!("Successfully left.");
        Ok(())
    }

    fn arg_sendstr(&mut self, args: &[String]) -> Result<()> {
        let msg = args
            .first()
            .and_then(|token| value_of(token))
            .ok_or_else(|| {
                Error::with_message(ErrorKind::UnknownArgument, "Expected --sendstr=<message>.")
            })?
            .to_string();
        self.connect_to_rc()?;
        let conn = self.require_conn()?;

        conn.send(&Packet::string(&msg))?;
        let reply = conn
            .receive()
            .map_err(|_| Error::new(ErrorKind::NetBadPacket))?;
        match reply.packet_type() {
            PacketType::Ok => {
                info!("Operation succeeded.");
                Ok(())
            }
            _ => Err(Error::from_packet(reply)),
        }
    }

    fn arg_rc_command(&mut self, args: &[String]) -> Result<()> {
        self.connect_to_rc()?;

        let Some(word) = args.get(1) else {
            info!(
                "Usage: {} rc | root <command>\nList of available commands:\n\treboot\tReboots the Root Complex.",
                self.bin_name
            );
            return Ok(());
        };

        match word.to_lowercase().as_str() {
            "reboot" => {
                let conn = self.require_conn()?;
                conn.send(&Packet::new(PacketType::Reboot))?;
                match conn.receive() {
                    Ok(reply) => {
                        if reply.packet_type() == PacketType::Err {
                            return Err(Error::from_packet(reply));
                        }
                        info!("RC rebooting...");
                        Ok(())
                    }
                    Err(_) => {
                        error!("RC failed to acknowledge the command.");
                        Err(Error::new(ErrorKind::Timeout))
                    }
                }
            }
            _ => Err(Error::new(ErrorKind::UnknownSubCommand)),
        }
    }

    fn arg_gst(&mut self, _args: &[String]) -> Result<()> {
        self.connect_to_rc()?;

        let mut children: Vec<Child> = Vec::with_capacity(self.cameras.len());
        for cam in &self.cameras {
            let args = gst_pipeline_args(cam);
            let child = Command::new("gst-launch-1.0").args(&args).spawn().map_err(|e| {
                Error::with_message(
                    ErrorKind::ForkFailed,
                    format!("Failed to launch gst-launch-1.0: {e}"),
                )
            })?;
            info!("GST ({}) Arguments: {}", child.id(), args.join(" "));
            children.push(child);
        }

        for mut child in children {
            let pid = child.id();
            match child.wait() {
                Ok(status) => info!("PID {pid} exited with status code: {status}."),
                Err(e) => error!("PID {pid} could not be awaited: {e}"),
            }
        }
        Ok(())
    }
}

fn parse_group_arg(args: &[String]) -> Result<u8> {
    let token = args
        .get(1)
        .ok_or_else(|| Error::with_message(ErrorKind::UnknownArgument, "Expected a group id."))?;
    token.parse::<u8>().map_err(|_| {
        Error::with_message(ErrorKind::UnknownArgument, format!("'{token}' is not a valid group id."))
    })
}

/// Arguments for one `gst-launch-1.0` pipeline, derived from a camera record.
fn gst_pipeline_args(cam: &Camera) -> Vec<String> {
    let device = format!("device=/dev/video{}", cam.video_dev);
    let nvmm_caps = format!(
        "video/x-raw(memory:NVMM), width={}, height={}, framerate={}/1, format=(string){}",
        cam.width, cam.height, cam.fps, cam.video_fmt
    );
    let raw_caps = format!(
        "video/x-raw, width={}, height={}, framerate={}/1, format=(string){}",
        cam.width, cam.height, cam.fps, cam.video_fmt
    );
    vec![
        "nvv4l2camerasrc".to_string(),
        device.clone(),
        "!".to_string(),
        nvmm_caps,
        "!".to_string(),
        "nvvidconv".to_string(),
        "flip-method=0".to_string(),
        "!".to_string(),
        "videoconvert".to_string(),
        "!".to_string(),
        raw_caps,
        "!".to_string(),
        "ttmcastsink".to_string(),
        "camera-id=1".to_string(),
        device,
    ]
}

fn install_signal_stop(stop: StopHandle) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| Error::with_message(ErrorKind::IOError, e.to_string()))?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {signal}, shutting down...");
                stop.stop();
            }
        })
        .map_err(|e| Error::with_message(ErrorKind::IOError, e.to_string()))?;
    Ok(())
}

// ----------------------------------------------------------------------
// Server-side packet handlers (run serially on the dispatcher thread)
// ----------------------------------------------------------------------

/// Wire the standard packet handlers onto a net handler.
pub fn register_packet_handlers(handler: &mut NetHandler<ServerState>) {
    handler.add_packet(PacketType::String, net_string);
    handler.add_packet(PacketType::Reboot, net_reboot);
    handler.add_packet(PacketType::Join, net_join);
    handler.add_packet(PacketType::Leave, net_leave);
    handler.add_packet(PacketType::GetCtrConfig, net_get_ctr_config);
    handler.add_packet(PacketType::GetCrewConfig, net_get_crew_config);
}

fn net_string(_state: &mut ServerState, ep: &Endpoint, mut packet: Packet) -> Result<()> {
    let msg = packet.pop_string();
    info!("EP#{} sent a string: {msg}", ep.id());
    ep.send(Packet::ok())
}

fn net_reboot(state: &mut ServerState, ep: &Endpoint, _packet: Packet) -> Result<()> {
    info!("Rebooting...");
    // The acknowledgement must be on the wire before the reboot call, which
    // does not return on success.
    ep.send(Packet::ok())?;
    nix::unistd::sync();
    (state.reboot)();
    Ok(())
}

fn group_members_mut(state: &mut ServerState, group_id: u8) -> Result<&mut Vec<u8>> {
    state
        .groups
        .get_mut(group_id as usize)
        .ok_or_else(|| Error::invalid_op(format!("No such group {group_id}")))
}

fn net_join(state: &mut ServerState, ep: &Endpoint, mut packet: Packet) -> Result<()> {
    info!("Node#{} requested to join.", ep.id());
    let group_id = packet.pop_u8()?;
    let members = group_members_mut(state, group_id)?;
    if members.contains(&ep.id()) {
        return Err(Error::invalid_op(format!("Already in group {group_id}")));
    }
    members.push(ep.id());
    ep.send(Packet::ok())
}

fn net_leave(state: &mut ServerState, ep: &Endpoint, mut packet: Packet) -> Result<()> {
    info!("Node#{} requested to leave.", ep.id());
    let group_id = packet.pop_u8()?;
    let members = group_members_mut(state, group_id)?;
    let Some(at) = members.iter().position(|id| *id == ep.id()) else {
        return Err(Error::invalid_op(format!("Not in group {group_id}. Join first")));
    };
    members.remove(at);
    ep.send(Packet::ok())
}

fn net_get_crew_config(state: &mut ServerState, ep: &Endpoint, _packet: Packet) -> Result<()> {
    let ep_id = ep.id();
    info!("EP#{ep_id} requested for crew configuration.");
    state.reload_config()?;

    let Some(crew) = state.crew_stations.iter().find(|crew| crew.node_id == ep_id) else {
        return Err(Error::with_message(
            ErrorKind::NotFound,
            format!("Node#{ep_id} is not a crew station."),
        ));
    };
    let json = serde_json::to_string_pretty(&crew.groups)
        .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;
    ep.send(Packet::with_str(PacketType::String, &json))
}

fn net_get_ctr_config(state: &mut ServerState, ep: &Endpoint, _packet: Packet) -> Result<()> {
    let ep_id = ep.id();
    info!("EP#{ep_id} requested for concentrator configuration.");
    state.reload_config()?;

    let Some(crew) = state.crew_stations.iter().find(|crew| crew.node_id == ep_id) else {
        return Err(Error::invalid_op(format!("EP#{ep_id} did not match any crew stations.")));
    };
    let cameras: Vec<Camera> = crew
        .groups
        .iter()
        .filter_map(|group_id| state.cameras.iter().find(|cam| cam.id == *group_id).cloned())
        .collect();
    let config = ConcentratorConfig {
        node_id: crew.node_id,
        cameras,
    };
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;
    ep.send(Packet::string(&json))
}
