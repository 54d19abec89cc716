pub mod interface;
pub mod link;
pub mod protocol;

pub use interface::{SerialDeviceInfo, TEENSY_VID};
pub use link::{ConnectionState, LinkOptions, ReconnectPolicy, SerialLink};
pub use protocol::{DeviceEvent, DeviceProtocol, EventStream};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Serial link closed")]
    LinkClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
