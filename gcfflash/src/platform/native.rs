//! Native platform implementation backed by the `serialport` crate.
//!
//! Owns the serial port, the single timer and the event queue, and runs the
//! blocking event loop that drives the engine. The loop polls the port with
//! a short read timeout; a fired timer becomes [`Event::Timeout`], received
//! bytes go through [`Engine::receive`], and a vanished port is reported as
//! [`Event::Disconnected`].

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::device::{Device, DeviceType};
use crate::engine::{Engine, Event};
use crate::error::{Error, Result};
use crate::platform::Platform;

/// Poll granularity of the serial read loop.
const READ_TIMEOUT: Duration = Duration::from_millis(15);

/// Idle sleep while no port is open.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Baud rate of ConBee and serial-attached RaspBee modules.
const BAUD_AVR: u32 = 38_400;

/// Baud rate of ConBee II and RaspBee II modules.
const BAUD_DEFAULT: u32 = 115_200;

/// BCM GPIO line wired to the RaspBee reset pin.
#[cfg(target_os = "linux")]
const RASPBEE_RESET_GPIO: u32 = 24;

/// Serial platform for the engine.
pub struct NativePlatform {
    port: Option<Box<dyn serialport::SerialPort>>,
    deadline: Option<Instant>,
    pending: VecDeque<Event>,
    running: bool,
    exit_code: i32,
    epoch: Instant,
}

impl NativePlatform {
    /// Create an idle platform; no port is opened yet.
    pub fn new() -> Self {
        Self {
            port: None,
            deadline: None,
            pending: VecDeque::new(),
            running: true,
            exit_code: 0,
            epoch: Instant::now(),
        }
    }

    /// Close the port and schedule a `Disconnected` event.
    fn drop_port(&mut self) {
        if self.port.take().is_some() {
            self.pending.push_back(Event::Disconnected);
        }
    }

    fn baud_for(path: &str) -> u32 {
        match DeviceType::from_path(path) {
            DeviceType::ConBee1 | DeviceType::RaspBee1 => BAUD_AVR,
            _ => BAUD_DEFAULT,
        }
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for NativePlatform {
    fn connect(&mut self, path: &str) -> Result<()> {
        // Replace a dangling handle from a previous try silently; only a
        // port lost outside the engine's control reports Disconnected.
        self.port = None;

        let baud = Self::baud_for(path);
        let port = serialport::new(path, baud)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        debug!("connected {path} ({baud} baud)");
        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.drop_port();
    }

    fn write(&mut self, data: &[u8]) {
        let Some(port) = self.port.as_mut() else {
            trace!("write of {} bytes with no open port", data.len());
            return;
        };

        if let Err(err) = port.write_all(data).and_then(|()| port.flush()) {
            warn!("write failed: {err}");
            self.drop_port();
        }
    }

    fn set_timeout(&mut self, ms: u64) {
        self.deadline = Some(Instant::now() + Duration::from_millis(ms));
    }

    fn clear_timeout(&mut self) {
        self.deadline = None;
    }

    fn msleep(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn time_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn list_devices(&mut self) -> Vec<Device> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(err) => {
                debug!("failed to enumerate serial ports: {err}");
                return Vec::new();
            },
        };

        let mut devices = Vec::new();

        for info in ports {
            let mut dev = Device {
                path: info.port_name.clone(),
                ..Device::default()
            };

            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                dev.name = usb.product.clone().unwrap_or_default();
                dev.serial = usb.serial_number.clone().unwrap_or_default();

                if let (Some(manufacturer), Some(product), Some(serial)) =
                    (usb.manufacturer, usb.product, usb.serial_number)
                {
                    dev.stable_path = format!(
                        "/dev/serial/by-id/usb-{}_{}_{}-if00",
                        manufacturer.replace(' ', "_"),
                        product.replace(' ', "_"),
                        serial
                    );
                }
            }

            if dev.name.is_empty() {
                dev.name = DeviceType::from_path(&dev.path).name().to_string();
            }

            devices.push(dev);
        }

        devices
    }

    fn reset_ftdi(&mut self) -> Result<()> {
        // The bitbang reset needs a raw FTDI channel which the serial
        // stack does not expose; the engine falls back to assuming the
        // device rebooted.
        Err(Error::Unsupported(
            "FTDI bitbang reset not available in this build".into(),
        ))
    }

    #[cfg(target_os = "linux")]
    fn reset_raspbee(&mut self) -> Result<()> {
        let gpio = RASPBEE_RESET_GPIO;
        let base = format!("/sys/class/gpio/gpio{gpio}");

        if !std::path::Path::new(&base).exists() {
            fs::write("/sys/class/gpio/export", gpio.to_string())?;
        }

        fs::write(format!("{base}/direction"), "out")?;
        fs::write(format!("{base}/value"), "0")?;
        thread::sleep(Duration::from_millis(100));
        fs::write(format!("{base}/value"), "1")?;

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn reset_raspbee(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "RaspBee GPIO reset requires Linux".into(),
        ))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn shut_down(&mut self, code: i32) {
        self.running = false;
        self.exit_code = code;
    }
}

enum PortRead {
    Data(usize),
    Idle,
    Lost,
}

/// Run the event loop until the engine shuts down; returns the exit code.
pub fn run(engine: &mut Engine, pl: &mut NativePlatform) -> i32 {
    engine.handle_event(pl, Event::PlStarted);

    let mut buf = [0u8; 512];

    while pl.running {
        // Queued events (disconnects) come first, in arrival order.
        if let Some(event) = pl.pending.pop_front() {
            engine.handle_event(pl, event);
            continue;
        }

        // The single timer.
        if let Some(deadline) = pl.deadline {
            if Instant::now() >= deadline {
                pl.deadline = None;
                engine.handle_event(pl, Event::Timeout);
                continue;
            }
        }

        let outcome = match pl.port.as_mut() {
            Some(port) => match port.read(&mut buf) {
                Ok(0) => PortRead::Lost,
                Ok(n) => PortRead::Data(n),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => PortRead::Idle,
                Err(err) => {
                    debug!("read error: {err}");
                    PortRead::Lost
                },
            },
            None => {
                thread::sleep(IDLE_SLEEP);
                PortRead::Idle
            },
        };

        match outcome {
            PortRead::Data(n) => engine.receive(pl, &buf[..n]),
            PortRead::Lost => pl.drop_port(),
            PortRead::Idle => {},
        }
    }

    pl.exit_code
}
