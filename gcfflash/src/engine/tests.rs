use std::collections::HashMap;

use super::*;
use crate::device::Device;
use crate::platform::Platform;
use crate::protocol::commands;

/// Recorded platform side effects.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Connect(String),
    Disconnect,
    Write(Vec<u8>),
    SetTimeout(u64),
    ClearTimeout,
    Sleep(u64),
    ResetFtdi,
    ResetRaspBee,
    ShutDown(i32),
}

/// Scripted platform with a controllable monotonic clock.
struct MockPlatform {
    now: u64,
    calls: Vec<Call>,
    connect_ok: bool,
    ftdi_ok: bool,
    raspbee_ok: bool,
    files: HashMap<String, Vec<u8>>,
    devices: Vec<Device>,
    pending_timeout: Option<u64>,
    exit_code: Option<i32>,
}

impl MockPlatform {
    fn new() -> Self {
        Self {
            now: 0,
            calls: Vec::new(),
            connect_ok: true,
            ftdi_ok: true,
            raspbee_ok: true,
            files: HashMap::new(),
            devices: Vec::new(),
            pending_timeout: None,
            exit_code: None,
        }
    }

    fn with_file(mut self, name: &str, content: Vec<u8>) -> Self {
        self.files.insert(name.to_string(), content);
        self
    }

    /// All payloads written to the transport so far.
    fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn last_write(&self) -> Vec<u8> {
        self.writes().last().cloned().expect("no write recorded")
    }

    fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl Platform for MockPlatform {
    fn connect(&mut self, path: &str) -> Result<()> {
        self.calls.push(Call::Connect(path.to_string()));
        if self.connect_ok {
            Ok(())
        } else {
            Err(Error::DeviceNotFound(path.to_string()))
        }
    }

    fn disconnect(&mut self) {
        self.calls.push(Call::Disconnect);
    }

    fn write(&mut self, data: &[u8]) {
        self.calls.push(Call::Write(data.to_vec()));
    }

    fn set_timeout(&mut self, ms: u64) {
        self.calls.push(Call::SetTimeout(ms));
        self.pending_timeout = Some(ms);
    }

    fn clear_timeout(&mut self) {
        self.calls.push(Call::ClearTimeout);
        self.pending_timeout = None;
    }

    fn msleep(&mut self, ms: u64) {
        self.calls.push(Call::Sleep(ms));
        self.now += ms;
    }

    fn time_ms(&self) -> u64 {
        self.now
    }

    fn list_devices(&mut self) -> Vec<Device> {
        self.devices.clone()
    }

    fn reset_ftdi(&mut self) -> Result<()> {
        self.calls.push(Call::ResetFtdi);
        if self.ftdi_ok {
            Ok(())
        } else {
            Err(Error::Unsupported("ftdi".into()))
        }
    }

    fn reset_raspbee(&mut self) -> Result<()> {
        self.calls.push(Call::ResetRaspBee);
        if self.raspbee_ok {
            Ok(())
        } else {
            Err(Error::Unsupported("gpio".into()))
        }
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
    }

    fn shut_down(&mut self, code: i32) {
        self.calls.push(Call::ShutDown(code));
        self.exit_code = Some(code);
    }
}

/// Fire the pending timer: advance the clock by the armed duration and
/// deliver `Timeout`.
fn fire_timeout(engine: &mut Engine, pl: &mut MockPlatform) {
    let ms = pl.pending_timeout.take().expect("no timeout armed");
    pl.now += ms;
    engine.handle_event(pl, Event::Timeout);
}

/// Build a well-formed GCF file around `payload`.
fn make_gcf(file_type: u8, target: u32, payload: &[u8]) -> Vec<u8> {
    use crate::protocol::crc::crc8_dallas;

    let mut content = Vec::with_capacity(crate::image::gcf::GCF_HEADER_SIZE + payload.len());
    content.extend_from_slice(&crate::image::gcf::GCF_MAGIC.to_le_bytes());
    content.push(file_type);
    content.extend_from_slice(&target.to_le_bytes());
    content.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    content.push(crc8_dallas(&content[..13]));
    content.extend_from_slice(payload);
    content
}

fn program_job(firmware: &str, device: &str) -> Job {
    Job {
        firmware: Some(firmware.to_string()),
        device: Some(device.to_string()),
        ..Job::default()
    }
}

/// Deliver a framed packet as transport bytes.
fn receive_packet(engine: &mut Engine, pl: &mut MockPlatform, payload: &[u8]) {
    let bytes = frame::encode(payload);
    engine.receive(pl, &bytes);
}

/// Watchdog write-parameter response from running firmware.
fn watchdog_ack() -> Vec<u8> {
    vec![0x0B, 0x03, 0x00, 0x0C, 0x00, 0x05, 0x00, 0x26, 0x02, 0x00, 0x00, 0x00]
}

/// Drive a freshly started Program engine through the UART watchdog reset
/// into `BootloaderQuery`.
fn enter_bootloader_query(engine: &mut Engine, pl: &mut MockPlatform) {
    engine.handle_event(pl, Event::PlStarted);
    assert_eq!(engine.state(), State::Reset);

    // Watchdog acknowledged, then the radio reboots away.
    receive_packet(engine, pl, &watchdog_ack());
    engine.handle_event(pl, Event::Disconnected);
    assert_eq!(engine.state(), State::BootloaderConnect);
    assert_eq!(pl.pending_timeout, Some(BOOTLOADER_CONNECT_DELAY_MS));

    fire_timeout(engine, pl);
    assert_eq!(engine.state(), State::BootloaderQuery);
    assert_eq!(pl.pending_timeout, Some(QUERY_TIMEOUT_MS));
}

// --- Scenario S1: V3 happy path ------------------------------------------

#[test]
fn test_s1_v3_happy_path() {
    let payload: Vec<u8> = (0..38912u32).map(|i| (i % 251) as u8).collect();
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);
    assert_eq!(engine.device_type(), DeviceType::ConBee2);

    // Watchdog reset happened over the application protocol.
    let writes = pl.writes();
    assert!(writes.contains(&frame::encode(&commands::read_firmware_version())));
    assert!(writes.contains(&frame::encode(&commands::write_watchdog_ttl())));

    // Bootloader answers the query with its ID.
    let mut id = vec![0x81, 0x82];
    id.extend_from_slice(&0x0001_0001u32.to_le_bytes());
    id.extend_from_slice(&0x1234_5678u32.to_le_bytes());
    receive_packet(&mut engine, &mut pl, &id);
    assert_eq!(engine.state(), State::V3Sync);

    // FW_UPDATE_REQUEST with the CRC32 placeholder.
    let mut expected = vec![0x81, 0x03];
    expected.extend_from_slice(&38912u32.to_le_bytes());
    expected.extend_from_slice(&0u32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&[0xAA; 4]);
    assert_eq!(pl.last_write(), frame::encode(&expected));

    receive_packet(&mut engine, &mut pl, &[0x81, 0x83, 0x00]);
    assert_eq!(engine.state(), State::V3Upload);

    // The bootloader pulls the whole image in 1024-byte chunks.
    let mut offset = 0u32;
    while offset < 38912 {
        let mut request = vec![0x81, 0x04];
        request.extend_from_slice(&offset.to_le_bytes());
        request.extend_from_slice(&1024u16.to_le_bytes());
        receive_packet(&mut engine, &mut pl, &request);

        let mut response = vec![0x81, 0x84, 0x00];
        response.extend_from_slice(&offset.to_le_bytes());
        response.extend_from_slice(&1024u16.to_le_bytes());
        response.extend_from_slice(&payload[offset as usize..offset as usize + 1024]);
        assert_eq!(pl.last_write(), frame::encode(&response));
        assert_eq!(pl.pending_timeout, Some(V3_DATA_TIMEOUT_MS));

        offset += 1024;
    }

    // Completion is implicit; the engine keeps running until the device
    // cycles or the deadline expires.
    assert_eq!(engine.state(), State::V3Upload);
    assert_eq!(pl.exit_code, None);
}

// --- Scenario S2: V1 happy path -------------------------------------------

#[test]
fn test_s2_v1_happy_path() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    let firmware = "fw_0x26390500.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(2, 0x100, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyUSB0"));

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(engine.device_type(), DeviceType::ConBee1);
    assert_eq!(engine.state(), State::Reset);

    // No watchdog response; the UART reset times out and the engine falls
    // back to the FTDI bitbang reset.
    fire_timeout(&mut engine, &mut pl);
    assert!(pl.calls.contains(&Call::ResetFtdi));
    assert_eq!(engine.state(), State::BootloaderConnect);
    assert_eq!(pl.pending_timeout, Some(1));

    fire_timeout(&mut engine, &mut pl);
    assert_eq!(engine.state(), State::BootloaderQuery);

    // The V1 bootloader announces itself with a banner line.
    let banner = format!("{:<59}\n", "deCONZ Bootloader 1.2");
    assert_eq!(banner.len(), 60);
    engine.receive(&mut pl, banner.as_bytes());
    assert_eq!(engine.state(), State::V1Sync);
    assert_eq!(pl.last_write(), V1_SYNC_MAGIC.to_vec());

    engine.receive(&mut pl, b"READY\n");
    assert_eq!(engine.state(), State::V1Upload);

    // The 10-byte header went out when READY arrived.
    let mut header = Vec::new();
    header.extend_from_slice(&200_000u32.to_le_bytes());
    header.extend_from_slice(&0x100u32.to_le_bytes());
    header.push(2); // file type
    header.push(make_gcf(2, 0x100, &payload)[13]); // crc8
    assert_eq!(pl.last_write(), header);

    // 781 full pages plus one short page of 64 bytes.
    let pages = 200_000usize.div_ceil(256);
    assert_eq!(pages, 782);

    for page in 0..pages {
        let request = [b'G', b'E', b'T', (page & 0xFF) as u8, (page >> 8) as u8, b';'];
        engine.receive(&mut pl, &request);

        let start = page * 256;
        let end = (start + 256).min(payload.len());
        assert_eq!(pl.last_write(), payload[start..end].to_vec());
    }

    assert_eq!(engine.state(), State::V1Validate);
    assert_eq!(pl.pending_timeout, Some(V1_VALIDATE_TIMEOUT_MS));

    engine.receive(&mut pl, b"#VALID CRC\n");
    assert_eq!(pl.exit_code, Some(0));
}

// --- Scenario S3: RaspBee II promotion ------------------------------------

#[test]
fn test_s3_raspbee2_promotion_selects_gpio_reset() {
    let payload = vec![0u8; 1024];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyAMA0"));

    engine.handle_event(&mut pl, Event::PlStarted);

    // Path says RaspBee, the R21 firmware version refines it.
    assert_eq!(engine.device_type(), DeviceType::RaspBee2);

    // UART reset timeout falls back to the GPIO reset, not FTDI.
    fire_timeout(&mut engine, &mut pl);
    assert!(pl.calls.contains(&Call::ResetRaspBee));
    assert!(!pl.calls.contains(&Call::ResetFtdi));
    assert_eq!(engine.state(), State::BootloaderConnect);
}

// --- Scenario S4: silent bootloader, ID probes ----------------------------

#[test]
fn test_s4_bootloader_silent_probe_then_retry() {
    let payload = vec![0u8; 1024];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);
    pl.clear_calls();

    // First and second timeout: probe with "ID".
    fire_timeout(&mut engine, &mut pl);
    assert_eq!(pl.writes(), vec![b"ID".to_vec()]);
    assert_eq!(pl.pending_timeout, Some(QUERY_TIMEOUT_MS));

    fire_timeout(&mut engine, &mut pl);
    assert_eq!(pl.writes().len(), 2);

    // Third timeout: the retry controller takes over; the deadline
    // (default 10 s) is not reached yet, so the engine restarts from Init.
    fire_timeout(&mut engine, &mut pl);
    assert_eq!(engine.state(), State::Init);
    assert_eq!(pl.pending_timeout, Some(RETRY_DELAY_MS));
    assert_eq!(pl.exit_code, None);
}

// --- Scenario S5: deadline exhaustion -------------------------------------

#[test]
fn test_s5_deadline_exhaustion_shuts_down() {
    let payload = vec![0u8; 1024];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));

    let mut job = program_job(firmware, "/dev/ttyACM0");
    job.timeout_secs = Some(2);
    let mut engine = Engine::new(job);

    // Device never responds to anything.
    engine.handle_event(&mut pl, Event::PlStarted);
    fire_timeout(&mut engine, &mut pl); // UART reset timeout (3 s)
    assert_eq!(engine.state(), State::BootloaderConnect);

    fire_timeout(&mut engine, &mut pl); // connect
    assert_eq!(engine.state(), State::BootloaderQuery);

    fire_timeout(&mut engine, &mut pl); // probe
    fire_timeout(&mut engine, &mut pl); // probe
    fire_timeout(&mut engine, &mut pl); // third timeout -> retry controller

    // The clock is past the 2 second deadline; the engine gives up.
    assert!(pl.now > 2000);
    assert_eq!(pl.exit_code, Some(1));
}

#[test]
fn test_retry_restarts_from_init_within_deadline() {
    let payload = vec![0u8; 1024];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));

    let mut job = program_job(firmware, "/dev/ttyACM0");
    job.timeout_secs = Some(60);
    let mut engine = Engine::new(job);

    enter_bootloader_query(&mut engine, &mut pl);
    fire_timeout(&mut engine, &mut pl);
    fire_timeout(&mut engine, &mut pl);
    fire_timeout(&mut engine, &mut pl); // retry controller
    assert_eq!(engine.state(), State::Init);
    assert_eq!(pl.exit_code, None);

    // The retry timer re-enters Init, which re-reads the file and starts
    // the whole cycle again.
    fire_timeout(&mut engine, &mut pl);
    assert_eq!(engine.state(), State::Reset);
    assert_eq!(engine.task(), Task::Program);
}

// --- Scenario S6: oversize data request -----------------------------------

#[test]
fn test_s6_oversize_data_request_status_2() {
    let payload = vec![0x33u8; 70_000];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);

    let mut id = vec![0x81, 0x82];
    id.extend_from_slice(&[0; 8]);
    receive_packet(&mut engine, &mut pl, &id);
    receive_packet(&mut engine, &mut pl, &[0x81, 0x83, 0x00]);
    assert_eq!(engine.state(), State::V3Upload);

    let mut request = vec![0x81, 0x04];
    request.extend_from_slice(&0u32.to_le_bytes());
    request.extend_from_slice(&0xFFFFu16.to_le_bytes());
    receive_packet(&mut engine, &mut pl, &request);

    // Status 2, header echoes the request, no payload bytes appended.
    let mut response = vec![0x81, 0x84, 0x02];
    response.extend_from_slice(&0u32.to_le_bytes());
    response.extend_from_slice(&0xFFFFu16.to_le_bytes());
    assert_eq!(pl.last_write(), frame::encode(&response));
    assert_eq!(engine.state(), State::V3Upload);
}

#[test]
fn test_v3_data_request_status_codes() {
    let payload = vec![0x44u8; 2048];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);
    let mut id = vec![0x81, 0x82];
    id.extend_from_slice(&[0; 8]);
    receive_packet(&mut engine, &mut pl, &id);
    receive_packet(&mut engine, &mut pl, &[0x81, 0x83, 0x00]);

    // Past the image end: status 1.
    let mut request = vec![0x81, 0x04];
    request.extend_from_slice(&2000u32.to_le_bytes());
    request.extend_from_slice(&100u16.to_le_bytes());
    receive_packet(&mut engine, &mut pl, &request);
    let mut expected = vec![0x81, 0x84, 0x01];
    expected.extend_from_slice(&2000u32.to_le_bytes());
    expected.extend_from_slice(&100u16.to_le_bytes());
    assert_eq!(pl.last_write(), frame::encode(&expected));

    // Zero length: status 3.
    let mut request = vec![0x81, 0x04];
    request.extend_from_slice(&0u32.to_le_bytes());
    request.extend_from_slice(&0u16.to_le_bytes());
    receive_packet(&mut engine, &mut pl, &request);
    let response = pl.last_write();
    let mut expected = vec![0x81, 0x84, 0x03];
    expected.extend_from_slice(&0u32.to_le_bytes());
    expected.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(response, frame::encode(&expected));

    // In-range request: status 0 with data, never past the payload end.
    let mut request = vec![0x81, 0x04];
    request.extend_from_slice(&1800u32.to_le_bytes());
    request.extend_from_slice(&248u16.to_le_bytes());
    receive_packet(&mut engine, &mut pl, &request);
    let mut expected = vec![0x81, 0x84, 0x00];
    expected.extend_from_slice(&1800u32.to_le_bytes());
    expected.extend_from_slice(&248u16.to_le_bytes());
    expected.extend_from_slice(&payload[1800..2048]);
    assert_eq!(pl.last_write(), frame::encode(&expected));
}

// --- Reset task -----------------------------------------------------------

#[test]
fn test_reset_task_shuts_down_after_watchdog() {
    let mut pl = MockPlatform::new();
    let job = Job {
        reset: true,
        device: Some("/dev/ttyACM0".to_string()),
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(engine.task(), Task::Reset);
    assert_eq!(pl.pending_timeout, Some(RESET_UART_TIMEOUT_MS));

    receive_packet(&mut engine, &mut pl, &watchdog_ack());
    assert_eq!(pl.exit_code, None);

    engine.handle_event(&mut pl, Event::Disconnected);
    assert_eq!(pl.exit_code, Some(0));
}

#[test]
fn test_reset_unknown_device_pretends_success() {
    let mut pl = MockPlatform::new();
    let job = Job {
        reset: true,
        device: Some("/dev/something-odd".to_string()),
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    fire_timeout(&mut engine, &mut pl);

    // No FTDI or GPIO fallback available; the engine assumes the reset
    // worked, which for a bare reset task means shutdown.
    assert!(!pl.calls.contains(&Call::ResetFtdi));
    assert!(!pl.calls.contains(&Call::ResetRaspBee));
    assert_eq!(pl.exit_code, Some(0));
}

// --- Connect task ---------------------------------------------------------

#[test]
fn test_connect_task_keepalive_and_reconnect() {
    let mut pl = MockPlatform::new();
    let job = Job {
        connect: true,
        device: Some("/dev/ttyACM0".to_string()),
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(engine.state(), State::Connected);
    assert_eq!(pl.pending_timeout, Some(1000));

    fire_timeout(&mut engine, &mut pl);
    assert_eq!(pl.last_write(), frame::encode(&commands::device_state()));
    assert_eq!(pl.pending_timeout, Some(10_000));

    engine.handle_event(&mut pl, Event::Disconnected);
    assert_eq!(engine.state(), State::Init);
    assert_eq!(pl.pending_timeout, Some(1000));
}

// --- List task ------------------------------------------------------------

#[test]
fn test_list_task_prints_and_exits() {
    let mut pl = MockPlatform::new();
    pl.devices.push(Device {
        name: "ConBee II".to_string(),
        serial: "DE1245".to_string(),
        path: "/dev/ttyACM0".to_string(),
        stable_path: String::new(),
    });

    let job = Job {
        list: true,
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(pl.exit_code, Some(0));
}

// --- Job validation -------------------------------------------------------

#[test]
fn test_program_without_device_fails() {
    let payload = vec![0u8; 64];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));

    let job = Job {
        firmware: Some(firmware.to_string()),
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(pl.exit_code, Some(2));
}

#[test]
fn test_invalid_firmware_file_fails() {
    let mut pl = MockPlatform::new().with_file("bad_0x1.GCF", vec![0u8; 4]);
    let mut engine = Engine::new(program_job("bad_0x1.GCF", "/dev/ttyACM0"));

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(pl.exit_code, Some(2));
}

#[test]
fn test_excessive_deadline_fails() {
    let mut pl = MockPlatform::new();
    let job = Job {
        reset: true,
        device: Some("/dev/ttyACM0".to_string()),
        timeout_secs: Some(MAX_DEADLINE_SECS + 1),
        ..Job::default()
    };
    let mut engine = Engine::new(job);

    engine.handle_event(&mut pl, Event::PlStarted);
    assert_eq!(pl.exit_code, Some(2));
}

// --- Receive buffer invariants --------------------------------------------

#[test]
fn test_rx_buffer_overflow_recovers() {
    let payload = vec![0u8; 1024];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);

    // Flood well past the 510-byte ceiling; the write pointer rolls back
    // instead of overrunning.
    engine.receive(&mut pl, &[b'A'; 600]);
    assert!(engine.rx.len() <= RX_ASCII_LIMIT);
    assert_eq!(engine.state(), State::BootloaderQuery);

    // A banner arriving afterwards is still recognized.
    let banner = format!("{:<59}\n", "deCONZ Bootloader 1.2");
    engine.receive(&mut pl, banner.as_bytes());
    assert_eq!(engine.state(), State::V1Sync);
}

#[test]
fn test_fragmented_get_request_waits_for_completion() {
    let payload = vec![0x77u8; 512];
    let firmware = "fw_0x26390500.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyUSB0"));

    engine.handle_event(&mut pl, Event::PlStarted);
    fire_timeout(&mut engine, &mut pl); // UART reset timeout -> FTDI
    fire_timeout(&mut engine, &mut pl); // bootloader connect
    let banner = format!("{:<59}\n", "deCONZ Bootloader 1.2");
    engine.receive(&mut pl, banner.as_bytes());
    engine.receive(&mut pl, b"READY\n");
    assert_eq!(engine.state(), State::V1Upload);
    pl.clear_calls();

    // The GET request dribbles in byte by byte; nothing is served until
    // the terminating ';' arrives.
    engine.receive(&mut pl, b"GET");
    assert!(pl.writes().is_empty());
    engine.receive(&mut pl, &[0x00, 0x00]);
    assert!(pl.writes().is_empty());
    engine.receive(&mut pl, b";");
    assert_eq!(pl.last_write(), payload[..256].to_vec());
}

#[test]
fn test_v1_page_request_beyond_end_retries() {
    let payload = vec![0x77u8; 512];
    let firmware = "fw_0x26390500.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyUSB0"));

    engine.handle_event(&mut pl, Event::PlStarted);
    fire_timeout(&mut engine, &mut pl);
    fire_timeout(&mut engine, &mut pl);
    let banner = format!("{:<59}\n", "deCONZ Bootloader 1.2");
    engine.receive(&mut pl, banner.as_bytes());
    engine.receive(&mut pl, b"READY\n");
    assert_eq!(engine.state(), State::V1Upload);

    // Page 9 starts beyond the 512-byte payload: the engine retries from
    // Init instead of serving garbage (and instead of aborting).
    engine.receive(&mut pl, &[b'G', b'E', b'T', 9, 0, b';']);
    assert_eq!(engine.state(), State::Init);
    assert_eq!(pl.pending_timeout, Some(RETRY_DELAY_MS));
}

// --- Frame/ASCII dispatch -------------------------------------------------

#[test]
fn test_btl_packet_detected_while_scanning_ascii() {
    // While BootloaderQuery accumulates ASCII, a framed ID response must
    // still be decoded and win over the banner scan.
    let payload = vec![0u8; 256];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);

    let mut id = vec![0x81, 0x82];
    id.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0x78, 0x56, 0x34, 0x12]);
    let framed = frame::encode(&id);

    // Garbage around the frame exercises decoder resync.
    let mut stream = vec![0x00, 0x55];
    stream.extend_from_slice(&framed);
    engine.receive(&mut pl, &stream);

    assert_eq!(engine.state(), State::V3Sync);
}

#[test]
fn test_short_banner_without_newline_ignored() {
    let payload = vec![0u8; 256];
    let firmware = "fw_0x26720700.bin.GCF";
    let mut pl = MockPlatform::new().with_file(firmware, make_gcf(1, 0, &payload));
    let mut engine = Engine::new(program_job(firmware, "/dev/ttyACM0"));

    enter_bootloader_query(&mut engine, &mut pl);

    engine.receive(&mut pl, b"Bootloader");
    assert_eq!(engine.state(), State::BootloaderQuery);
}
