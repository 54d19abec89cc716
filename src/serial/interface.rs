use std::time::Duration;
use serialport::SerialPortType;
use serde::{Deserialize, Serialize};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Result, SerialError};

// Teensy boards (PJRC) enumerate with this vendor id in USB serial mode
pub const TEENSY_VID: u16 = 0x16C0;
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Path value that asks for auto-discovery instead of a fixed device file
pub const AUTO_PORT: &str = "auto";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Discover USB serial ports that belong to a Teensy test controller
pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices = Vec::new();

    for port in ports {
        if let SerialPortType::UsbPort(usb_info) = port.port_type {
            if usb_info.vid == TEENSY_VID {
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }
    }

    Ok(devices)
}

/// Resolve the configured path, running discovery when it is `auto`
pub fn resolve_port(path: &str) -> Result<String> {
    if !path.eq_ignore_ascii_case(AUTO_PORT) {
        return Ok(path.to_string());
    }

    let devices = discover_devices()?;
    let device = devices
        .into_iter()
        .next()
        .ok_or_else(|| SerialError::PortNotFound("no Teensy serial port detected".to_string()))?;

    log::info!(
        "Auto-selected test controller on {} ({:04X}:{:04X})",
        device.port_name,
        device.vid,
        device.pid
    );
    Ok(device.port_name)
}

/// Open the device file as an async serial stream
pub fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
    let port_name = resolve_port(path)?;

    let stream = tokio_serial::new(&port_name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(Duration::from_millis(1000))
        .open_native_async()
        .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

    log::info!("Opened serial port {} at {} baud", port_name, baud_rate);
    Ok(stream)
}
