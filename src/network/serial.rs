//! Serial transport
//!
//! Opens a serial port through `tokio-serial`. Serial links have no message
//! boundaries of their own, so they default to COBS framing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortBuilderExt;

use super::transport::{Transport, TransportError, TransportResult, TransportStream};
use crate::protocol::Framing;

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Line settings of a serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOptions {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Software flow control
    #[serde(default)]
    pub xonxoff: bool,
    /// Hardware flow control
    #[serde(default)]
    pub rtscts: bool,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            xonxoff: false,
            rtscts: false,
        }
    }
}

impl SerialOptions {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.baud_rate == 0 {
            return Err(TransportError::InvalidConfig("baud rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidConfig(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(TransportError::InvalidConfig(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.xonxoff && self.rtscts {
            return Err(TransportError::InvalidConfig(
                "xonxoff and rtscts are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        if self.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        }
    }

    fn flow_control(&self) -> tokio_serial::FlowControl {
        if self.rtscts {
            tokio_serial::FlowControl::Hardware
        } else if self.xonxoff {
            tokio_serial::FlowControl::Software
        } else {
            tokio_serial::FlowControl::None
        }
    }

    /// Port builder carrying these line settings
    pub fn builder(&self, device: &str) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(device, self.baud_rate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .flow_control(self.flow_control())
    }
}

/// Serial port transport
#[derive(Debug, Clone)]
pub struct SerialTransport {
    device: String,
    options: SerialOptions,
}

impl SerialTransport {
    pub fn new(device: impl Into<String>, options: SerialOptions) -> Self {
        Self {
            device: device.into(),
            options,
        }
    }

    pub fn options(&self) -> &SerialOptions {
        &self.options
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> TransportResult<TransportStream> {
        self.options.validate()?;

        let port = self.options.builder(&self.device).open_native_async()?;
        tracing::debug!(
            "Opened serial port {} at {} baud",
            self.device,
            self.options.baud_rate
        );
        Ok(TransportStream::from_io(port))
    }

    fn endpoint(&self) -> String {
        self.device.clone()
    }

    fn default_framing(&self) -> Framing {
        Framing::Cobs
    }
}
