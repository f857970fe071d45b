//! Event-driven firmware update engine.
//!
//! The engine drives a coprocessor from running application firmware into
//! its bootloader, negotiates one of two bootloader dialects and uploads a
//! GCF image:
//!
//! - **V1**: ASCII, page-pull style; the bootloader announces itself with a
//!   banner (or answers an `ID` probe), expects a 4-byte sync magic and a
//!   10-byte image header, then pulls 256-byte pages with `GET<lo><hi>;`
//!   requests and finishes with `#VALID CRC`.
//! - **V3**: framed binary request/response; the bootloader answers an ID
//!   request, accepts a firmware update request and pulls data chunks with
//!   FW_DATA_REQUEST packets.
//!
//! All transitions are synchronous reactions to [`Event`]s delivered by the
//! platform. Transient failures funnel through the retry controller, which
//! re-enters [`State::Init`] until the wall-clock deadline expires.

#[cfg(test)]
mod tests;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::image::GcfFile;
use crate::platform::Platform;
use crate::protocol::{commands, frame};

/// Bootloader V3 packet magic.
const BTL_MAGIC: u8 = 0x81;
/// V3 ID response command.
const BTL_ID_RESPONSE: u8 = 0x82;
/// V3 firmware update request command.
const BTL_FW_UPDATE_REQUEST: u8 = 0x03;
/// V3 firmware update response command.
const BTL_FW_UPDATE_RESPONSE: u8 = 0x83;
/// V3 firmware data request command.
const BTL_FW_DATA_REQUEST: u8 = 0x04;
/// V3 firmware data response command.
const BTL_FW_DATA_RESPONSE: u8 = 0x84;

/// V1 bootloader page size.
const V1_PAGE_SIZE: usize = 256;

/// V1 bootloader sync magic.
const V1_SYNC_MAGIC: [u8; 4] = [0x1A, 0x1C, 0xA9, 0xAE];

/// Receive buffer size; ASCII accumulation stops two bytes short.
const RX_BUFFER_SIZE: usize = 512;

/// ASCII write pointer ceiling.
const RX_ASCII_LIMIT: usize = RX_BUFFER_SIZE - 2;

/// Capacity of the outbound V3 data response scratch; bounds the chunk
/// size a bootloader may request in one FW_DATA_REQUEST.
const V3_RESPONSE_CAPACITY: usize = 2048;

/// Timeout waiting for the watchdog write to take effect.
const RESET_UART_TIMEOUT_MS: u64 = 3000;

/// Delay before (re)connecting to the bootloader after a reset.
const BOOTLOADER_CONNECT_DELAY_MS: u64 = 500;

/// Timeout between bootloader ID probes.
const QUERY_TIMEOUT_MS: u64 = 200;

/// ID probe timeouts before the retry controller takes over.
const QUERY_MAX_PROBES: u32 = 3;

/// Timeout for the V1 sync magic to be answered with READY.
const V1_SYNC_TIMEOUT_MS: u64 = 500;

/// Timeout for the first page request after the V1 header.
const V1_HEADER_TIMEOUT_MS: u64 = 1000;

/// Timeout between V1 page requests.
const V1_PAGE_TIMEOUT_MS: u64 = 2000;

/// Timeout for the V1 bootloader to verify the written image.
const V1_VALIDATE_TIMEOUT_MS: u64 = 25_600;

/// Timeout for the V3 firmware update response.
const V3_SYNC_TIMEOUT_MS: u64 = 1000;

/// Timeout between V3 data requests.
const V3_DATA_TIMEOUT_MS: u64 = 5000;

/// Delay before re-entering `Init` on retry.
const RETRY_DELAY_MS: u64 = 250;

/// Default programming deadline when no `-t` was given.
const DEFAULT_DEADLINE_MS: u64 = 10_000;

/// Upper bound for the user supplied deadline in seconds.
pub const MAX_DEADLINE_SECS: u64 = 3600;

/// Events delivered to the engine by the platform, plus the engine's own
/// synthetic transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Event loop is up; parse the job and go.
    PlStarted,
    /// The single timer fired.
    Timeout,
    /// Self-event driving state entry actions.
    Action,
    /// The serial transport vanished or was closed.
    Disconnected,
    /// ASCII bytes were appended to the receive buffer.
    RxAscii,
    /// A bootloader packet was copied into the receive buffer.
    RxBtlPkgData,
    /// Running firmware acknowledged the watchdog parameter write.
    PkgUartReset,
    /// Watchdog reset took effect (the device rebooted away).
    UartResetSuccess,
    /// Watchdog reset did not happen in time.
    UartResetFailed,
    /// FTDI bitbang reset done.
    FtdiResetSuccess,
    /// FTDI bitbang reset unavailable or failed.
    FtdiResetFailed,
    /// RaspBee GPIO reset done.
    RaspBeeResetSuccess,
    /// RaspBee GPIO reset unavailable or failed.
    RaspBeeResetFailed,
    /// The reset phase as a whole succeeded.
    ResetSuccess,
    /// The reset phase as a whole failed.
    ResetFailed,
}

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Task {
    /// Nothing selected yet.
    #[default]
    None,
    /// `-r`: reset the device and exit.
    Reset,
    /// `-f`: flash a firmware image.
    Program,
    /// `-l`: list devices.
    List,
    /// `-c`: connect and keep the link alive for protocol debugging.
    Connect,
}

/// Top-level engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Inert placeholder.
    Void,
    /// Job preparation and task dispatch.
    Init,
    /// Compound reset state; see [`ResetPhase`].
    Reset,
    /// Programming entry point.
    Program,
    /// Reconnect loop towards the bootloader.
    BootloaderConnect,
    /// Waiting for a bootloader banner or ID response.
    BootloaderQuery,
    /// V1: sync magic sent, waiting for READY.
    V1Sync,
    /// V1: image header write.
    V1Header,
    /// V1: serving page pulls.
    V1Upload,
    /// V1: waiting for the CRC verdict.
    V1Validate,
    /// V3: firmware update request sent.
    V3Sync,
    /// V3: serving data requests.
    V3Upload,
    /// Diagnostic connect.
    Connect,
    /// Diagnostic connection established.
    Connected,
    /// Device listing.
    ListDevices,
}

impl State {
    /// States whose inbound bytes accumulate in the ASCII buffer.
    fn consumes_ascii(self) -> bool {
        matches!(
            self,
            State::BootloaderQuery
                | State::V1Sync
                | State::V1Header
                | State::V1Upload
                | State::V1Validate
        )
    }
}

/// Orthogonal substate of [`State::Reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPhase {
    /// No reset in progress.
    Void,
    /// Watchdog reset through the application protocol.
    Uart,
    /// FTDI bitbang reset (ConBee).
    Ftdi,
    /// GPIO reset (RaspBee).
    RaspBee,
}

/// Mode tag of the shared receive buffer. Exactly one mode is active at a
/// time, switched on state entry and on bootloader packet arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxMode {
    /// Byte-wise ASCII accumulation (V1 bootloader, banner detection).
    Ascii,
    /// Holds the most recent decoded bootloader packet.
    Frame,
}

/// The 512-byte receive buffer shared by the ASCII path and the framed
/// path.
#[derive(Debug)]
struct RxBuffer {
    data: [u8; RX_BUFFER_SIZE],
    wp: usize,
    mode: RxMode,
}

impl RxBuffer {
    fn new() -> Self {
        Self {
            data: [0; RX_BUFFER_SIZE],
            wp: 0,
            mode: RxMode::Frame,
        }
    }

    /// Reset the buffer and switch its mode.
    fn clear(&mut self, mode: RxMode) {
        self.wp = 0;
        self.mode = mode;
    }

    /// Append one ASCII byte. The write pointer never exceeds
    /// [`RX_ASCII_LIMIT`]; on overflow it rolls back to zero and the byte
    /// is dropped.
    fn push_ascii(&mut self, byte: u8) {
        debug_assert_eq!(self.mode, RxMode::Ascii);

        if self.wp < RX_ASCII_LIMIT {
            self.data[self.wp] = byte;
            self.wp += 1;
        } else {
            self.wp = 0;
            debug!("rx buffer full");
        }
    }

    /// Copy a decoded bootloader packet into the buffer, switching to
    /// frame mode. Oversize packets are refused.
    fn load_packet(&mut self, payload: &[u8]) -> bool {
        if payload.len() >= RX_BUFFER_SIZE {
            return false;
        }
        self.mode = RxMode::Frame;
        self.data[..payload.len()].copy_from_slice(payload);
        self.wp = payload.len();
        true
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.wp]
    }

    fn len(&self) -> usize {
        self.wp
    }

    /// Substring search over the accumulated bytes.
    fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        self.bytes()
            .windows(needle.len())
            .any(|window| window == needle)
    }

    /// Lossy text view for log output.
    fn as_text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }
}

/// The job handed to the engine, as parsed from the command line.
///
/// Preparation in [`State::Init`] is idempotent: the retry controller
/// re-enters `Init`, which re-reads the firmware file and re-derives the
/// device type from this description.
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// `-r`: reset without programming.
    pub reset: bool,
    /// `-c`: connect and debug.
    pub connect: bool,
    /// `-l`: list devices.
    pub list: bool,
    /// `-f`: firmware file path.
    pub firmware: Option<String>,
    /// `-d`: device path.
    pub device: Option<String>,
    /// `-t`: overall deadline in seconds.
    pub timeout_secs: Option<u64>,
}

/// The engine. One instance per process run.
pub struct Engine {
    job: Job,
    task: Task,
    state: State,
    substate: ResetPhase,
    retry: u32,
    start_time: u64,
    max_time: u64,
    device_type: DeviceType,
    device_path: String,
    rx: RxBuffer,
    decoder: frame::Decoder,
    file: Option<GcfFile>,
}

impl Engine {
    /// Create an engine for `job`. Nothing happens until the platform
    /// delivers [`Event::PlStarted`].
    pub fn new(job: Job) -> Self {
        Self {
            job,
            task: Task::None,
            state: State::Init,
            substate: ResetPhase::Void,
            retry: 0,
            start_time: 0,
            max_time: 0,
            device_type: DeviceType::Unknown,
            device_path: String::new(),
            rx: RxBuffer::new(),
            decoder: frame::Decoder::new(),
            file: None,
        }
    }

    /// Current top-level state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Current task.
    pub fn task(&self) -> Task {
        self.task
    }

    /// Selected device type.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Feed one event through the state machine.
    pub fn handle_event<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::PlStarted {
            self.start_time = pl.time_ms();
        }

        match self.state {
            State::Void => {},
            State::Init => self.st_init(pl, event),
            State::Reset => self.st_reset(pl, event),
            State::Program => self.st_program(pl, event),
            State::BootloaderConnect => self.st_bootloader_connect(pl, event),
            State::BootloaderQuery => self.st_bootloader_query(pl, event),
            State::V1Sync => self.st_v1_sync(pl, event),
            State::V1Header => self.st_v1_header(pl, event),
            State::V1Upload => self.st_v1_upload(pl, event),
            State::V1Validate => self.st_v1_validate(pl, event),
            State::V3Sync => self.st_v3_sync(pl, event),
            State::V3Upload => self.st_v3_upload(pl, event),
            State::Connect => self.st_connect(pl, event),
            State::Connected => self.st_connected(pl, event),
            State::ListDevices => self.st_list_devices(pl, event),
        }
    }

    /// Receive dispatcher: transport bytes arrive here.
    ///
    /// In ASCII-consuming states the bytes accumulate in the receive buffer
    /// and one [`Event::RxAscii`] is dispatched per arrival. All bytes feed
    /// the frame decoder regardless of state, so framed packets are picked
    /// up even while the engine is scanning for a banner.
    pub fn receive<P: Platform>(&mut self, pl: &mut P, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.state.consumes_ascii() {
            if self.rx.mode != RxMode::Ascii {
                self.rx.clear(RxMode::Ascii);
            }
            for &byte in data {
                self.rx.push_ascii(byte);
            }
            self.handle_event(pl, Event::RxAscii);
        }

        let mut packets: Vec<Vec<u8>> = Vec::new();
        self.decoder.feed(data, |payload| packets.push(payload.to_vec()));

        for packet in packets {
            self.on_packet(pl, &packet);
        }
    }

    /// Classify a decoded frame into a typed event.
    fn on_packet<P: Platform>(&mut self, pl: &mut P, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }

        if payload[0] != BTL_MAGIC {
            debug!(
                "packet: {} bytes, {}",
                payload.len(),
                hex_string(payload)
            );
        }

        if payload[0] == commands::CMD_WRITE_PARAMETER && payload.len() >= 8 {
            if payload[7] == commands::PARAM_WATCHDOG_TTL {
                self.handle_event(pl, Event::PkgUartReset);
            }
        } else if payload[0] == BTL_MAGIC {
            if self.rx.load_packet(payload) {
                self.handle_event(pl, Event::RxBtlPkgData);
            }
        }
    }

    /// Job preparation; idempotent, runs on every `Init` entry.
    fn prepare<P: Platform>(&mut self, pl: &mut P) -> Result<()> {
        self.state = State::Void;
        self.substate = ResetPhase::Void;
        self.task = Task::None;
        self.file = None;
        self.device_path.clear();
        self.device_type = DeviceType::Unknown;

        if let Some(device) = &self.job.device {
            self.device_path = device.clone();
            self.device_type = DeviceType::from_path(device);
        }

        self.max_time = match self.job.timeout_secs {
            Some(secs) if secs > MAX_DEADLINE_SECS => {
                return Err(Error::Job(format!(
                    "timeout {secs} exceeds {MAX_DEADLINE_SECS} seconds"
                )));
            },
            Some(secs) => self.start_time + secs * 1000,
            None => 0,
        };

        if self.job.list {
            self.task = Task::List;
            self.state = State::ListDevices;
        } else if let Some(path) = self.job.firmware.clone() {
            self.task = Task::Program;

            if self.device_path.is_empty() {
                return Err(Error::Job("missing -d <device> argument".into()));
            }

            let content = pl.read_file(&path)?;
            info!("read file success: {} ({} bytes)", path, content.len());

            let file = GcfFile::parse(&path, &content)?;

            if self.job.timeout_secs.is_none() {
                self.max_time = self.start_time + DEFAULT_DEADLINE_MS;
            }

            // The device path does not tell a RaspBee from a RaspBee II;
            // the firmware version in the file name is more specific.
            let promoted = self.device_type.promote(file.is_r21());
            if promoted != self.device_type {
                debug!("assume RaspBee II");
                self.device_type = promoted;
            }

            self.file = Some(file);
            self.state = State::Program;
        } else if self.job.connect {
            self.task = Task::Connect;

            if self.device_path.is_empty() {
                return Err(Error::Job("missing -d <device> argument".into()));
            }

            self.state = State::Connect;
        } else if self.job.reset {
            self.task = Task::Reset;

            if self.device_path.is_empty() {
                return Err(Error::Job("missing -d <device> argument".into()));
            }

            self.state = State::Reset;
        } else {
            return Err(Error::Job("nothing to do".into()));
        }

        Ok(())
    }

    /// Retry controller: the single place that evaluates the deadline.
    fn retry_or_give_up<P: Platform>(&mut self, pl: &mut P) {
        let now = pl.time_ms();

        if self.max_time > now {
            debug!("retry: {} seconds left", (self.max_time - now) / 1000);

            self.state = State::Init;
            self.substate = ResetPhase::Void;
            pl.set_timeout(RETRY_DELAY_MS);
        } else {
            warn!("deadline reached, giving up");
            pl.shut_down(1);
        }
    }

    fn st_init<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if matches!(event, Event::PlStarted | Event::Timeout) {
            match self.prepare(pl) {
                Ok(()) => self.handle_event(pl, Event::Action),
                Err(err) => {
                    error!("{err}");
                    pl.shut_down(2);
                },
            }
        }
    }

    fn st_reset<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                self.substate = ResetPhase::Uart;
                self.dispatch_substate(pl, Event::Action);
            },
            Event::UartResetSuccess
            | Event::FtdiResetSuccess
            | Event::RaspBeeResetSuccess => {
                self.substate = ResetPhase::Void;

                match self.task {
                    Task::Reset => {
                        info!("device reset done");
                        pl.shut_down(0);
                    },
                    Task::Program => {
                        self.state = State::Program;
                        self.handle_event(pl, Event::ResetSuccess);
                    },
                    _ => {},
                }
            },
            Event::UartResetFailed => match self.device_type {
                DeviceType::ConBee1 => {
                    self.substate = ResetPhase::Ftdi;
                    self.dispatch_substate(pl, Event::Action);
                },
                DeviceType::RaspBee1 | DeviceType::RaspBee2 => {
                    self.substate = ResetPhase::RaspBee;
                    self.dispatch_substate(pl, Event::Action);
                },
                _ => {
                    // No further reset line available; assume the device is
                    // already in its bootloader and move on.
                    pl.set_timeout(BOOTLOADER_CONNECT_DELAY_MS);
                    self.handle_event(pl, Event::UartResetSuccess);
                },
            },
            Event::FtdiResetFailed => {
                pl.set_timeout(1);
                self.handle_event(pl, Event::FtdiResetSuccess);
            },
            Event::RaspBeeResetFailed => {
                pl.set_timeout(1);
                self.handle_event(pl, Event::RaspBeeResetSuccess);
            },
            other => self.dispatch_substate(pl, other),
        }
    }

    fn dispatch_substate<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match self.substate {
            ResetPhase::Void => {},
            ResetPhase::Uart => self.st_reset_uart(pl, event),
            ResetPhase::Ftdi => self.st_reset_ftdi(pl, event),
            ResetPhase::RaspBee => self.st_reset_raspbee(pl, event),
        }
    }

    fn st_reset_uart<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                pl.set_timeout(RESET_UART_TIMEOUT_MS);

                if pl.connect(&self.device_path).is_ok() {
                    debug!("send uart reset");
                    pl.write(&frame::encode(&commands::read_firmware_version()));
                    pl.write(&frame::encode(&commands::write_watchdog_ttl()));
                }
            },
            Event::Disconnected => {
                // The radio rebooted into its bootloader.
                pl.clear_timeout();
                pl.set_timeout(BOOTLOADER_CONNECT_DELAY_MS);
                self.handle_event(pl, Event::UartResetSuccess);
            },
            Event::PkgUartReset => {
                info!("command reset done");
            },
            Event::Timeout => {
                info!("command reset timeout");
                self.substate = ResetPhase::Void;
                pl.disconnect();
                self.handle_event(pl, Event::UartResetFailed);
            },
            _ => {},
        }
    }

    /// FTDI reset applies only to ConBee.
    fn st_reset_ftdi<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Action {
            match pl.reset_ftdi() {
                Ok(()) => {
                    debug!("FTDI reset done");
                    pl.set_timeout(1);
                    self.handle_event(pl, Event::FtdiResetSuccess);
                },
                Err(err) => {
                    info!("FTDI reset failed: {err}");
                    self.handle_event(pl, Event::FtdiResetFailed);
                },
            }
        }
    }

    /// GPIO reset applies only to RaspBee and RaspBee II.
    fn st_reset_raspbee<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Action {
            match pl.reset_raspbee() {
                Ok(()) => {
                    debug!("RaspBee reset done");
                    pl.set_timeout(1);
                    self.handle_event(pl, Event::RaspBeeResetSuccess);
                },
                Err(err) => {
                    info!("RaspBee reset failed: {err}");
                    self.handle_event(pl, Event::RaspBeeResetFailed);
                },
            }
        }
    }

    fn st_program<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                debug!("flash firmware");
                self.state = State::Reset;
                self.handle_event(pl, Event::Action);
            },
            Event::ResetSuccess => {
                self.state = State::BootloaderConnect;
            },
            Event::ResetFailed => {
                pl.shut_down(1);
            },
            _ => {},
        }
    }

    fn st_bootloader_connect<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Timeout {
            if pl.connect(&self.device_path).is_ok() {
                self.state = State::BootloaderQuery;
                self.handle_event(pl, Event::Action);
            } else {
                // Bounded by the overall deadline, no inner retry limit.
                pl.set_timeout(BOOTLOADER_CONNECT_DELAY_MS);
                debug!("retry connect bootloader {}", self.device_path);
            }
        }
    }

    fn st_bootloader_query<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                self.retry = 0;
                self.rx.clear(RxMode::Ascii);

                // ConBee and RaspBee V1 bootloaders announce themselves;
                // give them a moment before probing.
                pl.set_timeout(QUERY_TIMEOUT_MS);
            },
            Event::Timeout => {
                self.retry += 1;
                if self.retry == QUERY_MAX_PROBES {
                    debug!("query bootloader failed");
                    self.retry_or_give_up(pl);
                } else {
                    // Probe the V1 bootloader; this also catches devices
                    // without any application firmware installed.
                    debug!("query bootloader id");
                    pl.write(b"ID");
                    pl.set_timeout(QUERY_TIMEOUT_MS);
                }
            },
            Event::RxAscii => {
                if self.rx.len() > 52
                    && self.rx.bytes().last() == Some(&b'\n')
                    && self.rx.contains("Bootloader")
                {
                    pl.clear_timeout();
                    debug!("bootloader detected ({})", self.rx.len());

                    self.state = State::V1Sync;
                    self.handle_event(pl, Event::Action);
                }
            },
            Event::RxBtlPkgData => {
                let packet = self.rx.bytes();
                if packet.len() >= 10 && packet[1] == BTL_ID_RESPONSE {
                    let btl_version = LittleEndian::read_u32(&packet[2..6]);
                    let app_crc = LittleEndian::read_u32(&packet[6..10]);

                    debug!(
                        "bootloader version 0x{btl_version:08X}, app crc 0x{app_crc:08X}"
                    );

                    self.state = State::V3Sync;
                    self.handle_event(pl, Event::Action);
                }
            },
            Event::Disconnected => {
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_v1_sync<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                self.rx.clear(RxMode::Ascii);
                pl.write(&V1_SYNC_MAGIC);
                pl.set_timeout(V1_SYNC_TIMEOUT_MS);
            },
            Event::RxAscii => {
                if self.rx.len() > 4 && self.rx.contains("READY") {
                    pl.clear_timeout();
                    debug!("bootloader synced: {}", self.rx.as_text());

                    self.state = State::V1Header;
                    self.handle_event(pl, Event::Action);
                } else {
                    pl.set_timeout(10);
                }
            },
            Event::Timeout => {
                debug!(
                    "failed to sync bootloader ({}) {}",
                    self.rx.len(),
                    self.rx.as_text()
                );
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_v1_header<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Action {
            self.rx.clear(RxMode::Ascii);

            let Some(file) = &self.file else {
                self.retry_or_give_up(pl);
                return;
            };

            let mut header = [0u8; 10];
            LittleEndian::write_u32(&mut header[0..4], file.payload_size);
            LittleEndian::write_u32(&mut header[4..8], file.target_address);
            header[8] = file.file_type;
            header[9] = file.crc8;

            self.state = State::V1Upload;

            pl.write(&header);
            pl.set_timeout(V1_HEADER_TIMEOUT_MS);
        }
    }

    fn st_v1_upload<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::RxAscii => {
                // Page requests are 6 bytes: "GET" U16 page ";".
                // Anything shorter may still be in flight; keep waiting.
                let request = self.rx.bytes();
                if request.len() < 6 || request[0] != b'G' || request[5] != b';' {
                    return;
                }

                let page_number = (u32::from(request[4]) << 8) | u32::from(request[3]);

                let Some(file) = &self.file else {
                    self.retry_or_give_up(pl);
                    return;
                };

                let Some(page) = file.v1_page(page_number) else {
                    warn!("page request 0x{page_number:04X} beyond image end");
                    self.retry_or_give_up(pl);
                    return;
                };

                let remaining = file.payload.len() - page_number as usize * V1_PAGE_SIZE;
                if page_number % 20 == 0 || remaining < V1_PAGE_SIZE {
                    debug!("GET 0x{page_number:04X} (page {page_number})");
                }

                let mut out = [0u8; V1_PAGE_SIZE];
                let size = page.len();
                out[..size].copy_from_slice(page);
                let last = remaining == size;

                self.rx.clear(RxMode::Ascii);
                pl.write(&out[..size]);

                if last {
                    self.state = State::V1Validate;
                    debug!("done, wait validation...");
                    pl.set_timeout(V1_VALIDATE_TIMEOUT_MS);
                } else {
                    pl.set_timeout(V1_PAGE_TIMEOUT_MS);
                }
            },
            Event::Timeout => {
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_v1_validate<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::RxAscii => {
                debug!("validate: {} ({})", self.rx.as_text(), self.rx.len());

                if self.rx.len() > 6 && self.rx.contains("#VALID CRC") {
                    info!("firmware successfully written");
                    pl.shut_down(0);
                } else {
                    pl.set_timeout(1000);
                }
            },
            Event::Timeout => {
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_v3_sync<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Action => {
                pl.msleep(50);
                pl.set_timeout(V3_SYNC_TIMEOUT_MS);

                let Some(file) = &self.file else {
                    self.retry_or_give_up(pl);
                    return;
                };

                let mut cmd = [0u8; 15];
                cmd[0] = BTL_MAGIC;
                cmd[1] = BTL_FW_UPDATE_REQUEST;
                LittleEndian::write_u32(&mut cmd[2..6], file.payload_size);
                LittleEndian::write_u32(&mut cmd[6..10], file.target_address);
                cmd[10] = file.file_type;
                // CRC32 placeholder, the bootloader ignores it.
                cmd[11..15].copy_from_slice(&[0xAA; 4]);

                pl.write(&frame::encode(&cmd));
            },
            Event::RxBtlPkgData => {
                let packet = self.rx.bytes();
                if packet.len() >= 3
                    && packet[1] == BTL_FW_UPDATE_RESPONSE
                    && packet[2] == 0x00
                {
                    pl.set_timeout(V3_SYNC_TIMEOUT_MS);
                    self.state = State::V3Upload;
                }
            },
            Event::Timeout => {
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_v3_upload<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::RxBtlPkgData => {
                let packet = self.rx.bytes();
                if packet.len() != 8 || packet[1] != BTL_FW_DATA_REQUEST {
                    return;
                }

                pl.set_timeout(V3_DATA_TIMEOUT_MS);

                let offset = LittleEndian::read_u32(&packet[2..6]);
                let mut length = LittleEndian::read_u16(&packet[6..8]);

                debug!("bootloader data request, offset 0x{offset:08X}, length {length}");

                let Some(file) = &self.file else {
                    self.retry_or_give_up(pl);
                    return;
                };

                let mut status: u8 = 0;

                if u64::from(offset) + u64::from(length) > u64::from(file.payload_size) {
                    status = 1;
                } else if usize::from(length) > V3_RESPONSE_CAPACITY - 32 {
                    status = 2;
                } else if length == 0 {
                    status = 3;
                } else {
                    let remaining = file.payload_size - offset;
                    if u32::from(length) > remaining {
                        length = remaining as u16;
                    }
                }

                let mut response = [0u8; V3_RESPONSE_CAPACITY];
                response[0] = BTL_MAGIC;
                response[1] = BTL_FW_DATA_RESPONSE;
                response[2] = status;
                LittleEndian::write_u32(&mut response[3..7], offset);
                LittleEndian::write_u16(&mut response[7..9], length);

                let mut len = 9;
                if status == 0 {
                    let start = offset as usize;
                    let end = start + usize::from(length);
                    response[len..len + usize::from(length)]
                        .copy_from_slice(&file.payload[start..end]);
                    len += usize::from(length);
                } else {
                    debug!("failed to handle data request, status: {status}");
                }

                pl.write(&frame::encode(&response[..len]));
            },
            Event::Timeout => {
                self.retry_or_give_up(pl);
            },
            _ => {},
        }
    }

    fn st_connect<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Action {
            if pl.connect(&self.device_path).is_ok() {
                self.state = State::Connected;
                pl.set_timeout(1000);
            } else {
                self.state = State::Init;
                debug!("failed to connect");
                pl.set_timeout(10_000);
            }
        }
    }

    fn st_connected<P: Platform>(&mut self, pl: &mut P, event: Event) {
        match event {
            Event::Timeout => {
                pl.write(&frame::encode(&commands::device_state()));
                pl.set_timeout(10_000);
            },
            Event::Disconnected => {
                pl.clear_timeout();
                self.state = State::Init;
                debug!("disconnected");
                pl.set_timeout(1000);
            },
            _ => {},
        }
    }

    fn st_list_devices<P: Platform>(&mut self, pl: &mut P, event: Event) {
        if event == Event::Action {
            let devices = pl.list_devices();

            println!("{} devices found", devices.len());

            for (i, dev) in devices.iter().enumerate() {
                println!(
                    "DEV [{i}]: name: {} ({}), path: {} --> {}",
                    dev.name, dev.serial, dev.path, dev.stable_path
                );
            }

            pl.shut_down(0);
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}
