//! Opening the physical link to a device.
//!
//! Both link kinds are exposed as a blocking reader/writer pair so the
//! handshake and the reader thread do not care which one is in use. Reads use a
//! short timeout so the reader can notice a stop request.

use log::{debug, info};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::mesh::MeshError;

/// Where the device lives. Exactly one kind is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Serial device path; empty means auto-detect the first USB serial port.
    Serial { path: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
}

impl LinkTarget {
    pub fn describe(&self) -> String {
        match self {
            LinkTarget::Serial { path, baud_rate } if path.is_empty() => {
                format!("serial:auto@{baud_rate}")
            }
            LinkTarget::Serial { path, baud_rate } => format!("serial:{path}@{baud_rate}"),
            LinkTarget::Tcp { host, port } => format!("tcp:{host}:{port}"),
        }
    }

    /// Open the link. Blocking; call from a blocking context.
    pub fn open(&self, io_timeout: Duration) -> Result<LinkStreams, MeshError> {
        match self {
            LinkTarget::Serial { path, baud_rate } => open_serial(path, *baud_rate, io_timeout),
            LinkTarget::Tcp { host, port } => open_tcp(host, *port, io_timeout),
        }
    }
}

/// Independent read and write halves of one open link.
pub struct LinkStreams {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub description: String,
}

/// A read that ended because the timeout elapsed rather than because the link failed.
pub fn is_idle_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn open_tcp(host: &str, port: u16, io_timeout: Duration) -> Result<LinkStreams, MeshError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| MeshError::Resolve(format!("{host}:{port}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(MeshError::Resolve(format!("{host}:{port}")));
    }

    let mut last_err = None;
    for addr in &addrs {
        debug!("Connecting to Meshtastic TCP API at {}", addr);
        match TcpStream::connect_timeout(addr, Duration::from_secs(10)) {
            Ok(stream) => {
                stream.set_read_timeout(Some(io_timeout))?;
                stream.set_nodelay(true)?;
                let writer = stream.try_clone()?;
                info!("Opened TCP link to {}", addr);
                return Ok(LinkStreams {
                    reader: Box::new(stream),
                    writer: Box::new(writer),
                    description: format!("tcp:{host}:{port}"),
                });
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(MeshError::Io)
        .unwrap_or_else(|| MeshError::Resolve(format!("{host}:{port}"))))
}

#[cfg(feature = "serial")]
struct SerialIo(Box<dyn serialport::SerialPort>);

#[cfg(feature = "serial")]
impl Read for SerialIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(feature = "serial")]
impl Write for SerialIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

#[cfg(feature = "serial")]
fn detect_serial_port() -> Result<String, MeshError> {
    let ports = serialport::available_ports().map_err(|e| MeshError::Serial(e.to_string()))?;
    // Without libudev the port type is often Unknown, so fall back on names.
    let usb = ports
        .iter()
        .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
        .or_else(|| {
            ports.iter().find(|p| {
                p.port_name.contains("ttyUSB")
                    || p.port_name.contains("ttyACM")
                    || p.port_name.contains("usbserial")
                    || p.port_name.contains("usbmodem")
            })
        });
    usb.map(|p| p.port_name.clone()).ok_or(MeshError::NoSerialPort)
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud_rate: u32, io_timeout: Duration) -> Result<LinkStreams, MeshError> {
    let path = if path.is_empty() {
        let found = detect_serial_port()?;
        info!("Auto-detected serial device {}", found);
        found
    } else {
        path.to_string()
    };
    debug!("Opening serial port {} at {} baud", path, baud_rate);

    let mut builder = serialport::new(&path, baud_rate).timeout(io_timeout);
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| MeshError::Serial(format!("failed to open {path}: {e}")))?;

    // Toggle DTR/RTS so ESP32 boards wake, then let them settle.
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    std::thread::sleep(Duration::from_millis(150));
    let _ = port.clear(serialport::ClearBuffer::Input);

    let writer = port
        .try_clone()
        .map_err(|e| MeshError::Serial(format!("failed to clone {path}: {e}")))?;
    info!("Opened serial link {} at {} baud", path, baud_rate);
    Ok(LinkStreams {
        reader: Box::new(SerialIo(port)),
        writer: Box::new(SerialIo(writer)),
        description: format!("serial:{path}@{baud_rate}"),
    })
}

#[cfg(not(feature = "serial"))]
fn open_serial(_path: &str, _baud_rate: u32, _io_timeout: Duration) -> Result<LinkStreams, MeshError> {
    Err(MeshError::Unsupported("serial links (built without the `serial` feature)"))
}
