//! Byte views and convenience I/O
//!
//! Formatting helpers for logging and scripting against a port, plus
//! [`SerialTransportExt`] for reading and writing in those forms.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Write as _;
use std::time::Duration;

use crate::error::Result;
use crate::transport::SerialTransport;

/// Format bytes as upper-case two-digit hex joined by `separator`
///
/// `to_hex_string(&[0x0a, 0xff], " ")` gives `"0A FF"`.
pub fn to_hex_string(bytes: &[u8], separator: &str) -> String {
    let mut out = String::with_capacity(bytes.len() * (2 + separator.len()));
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Each byte as an upper-case two-digit hex string
pub fn to_hex_array(bytes: &[u8]) -> Vec<String> {
    bytes.iter().map(|byte| format!("{:02X}", byte)).collect()
}

/// Each byte as an unsigned integer
pub fn to_int_array(bytes: &[u8]) -> Vec<u32> {
    bytes.iter().map(|&byte| u32::from(byte)).collect()
}

/// Read and write helpers over any transport
#[async_trait]
pub trait SerialTransportExt: SerialTransport {
    /// Read whatever the input buffer holds right now
    ///
    /// Returns an empty buffer when nothing is waiting.
    async fn read_available(&self) -> Result<Bytes> {
        let count = self.input_buffer_count().await?;
        if count == 0 {
            return Ok(Bytes::new());
        }
        self.read_bytes(count).await
    }

    /// Buffered input as text, replacing invalid UTF-8
    async fn read_available_string(&self) -> Result<String> {
        let data = self.read_available().await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Buffered input as a hex string
    async fn read_available_hex_string(&self, separator: &str) -> Result<String> {
        let data = self.read_available().await?;
        Ok(to_hex_string(&data, separator))
    }

    /// Buffered input as unsigned integers
    async fn read_available_int_array(&self) -> Result<Vec<u32>> {
        let data = self.read_available().await?;
        Ok(to_int_array(&data))
    }

    /// Read `count` bytes as a hex string
    async fn read_hex_string(&self, count: usize, separator: &str) -> Result<String> {
        let data = self.read_bytes(count).await?;
        Ok(to_hex_string(&data, separator))
    }

    /// Read `count` bytes as a hex string, giving up after `timeout`
    async fn read_hex_string_timeout(
        &self,
        count: usize,
        separator: &str,
        timeout: Duration,
    ) -> Result<String> {
        let data = self.read_bytes_timeout(count, timeout).await?;
        Ok(to_hex_string(&data, separator))
    }

    /// Read `count` bytes as unsigned integers
    async fn read_int_array(&self, count: usize) -> Result<Vec<u32>> {
        let data = self.read_bytes(count).await?;
        Ok(to_int_array(&data))
    }

    /// Read `count` bytes as text, replacing invalid UTF-8
    async fn read_string(&self, count: usize) -> Result<String> {
        let data = self.read_bytes(count).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Write a string's UTF-8 bytes
    async fn write_string(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes()).await
    }

    /// Write integers, keeping the low byte of each
    async fn write_int_array(&self, values: &[u32]) -> Result<()> {
        let data: Vec<u8> = values.iter().map(|&value| value as u8).collect();
        self.write_bytes(&data).await
    }
}

impl<T: SerialTransport + ?Sized> SerialTransportExt for T {}
