// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides low-level communication with TPM devices via /dev/tpmrm0 or
//! /dev/tpm0, with TCP-attached modules, or with the in-process simulator.

use anyhow::{bail, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use super::constants::*;
use super::error::TpmError;
use super::marshal::*;
use super::simulator::{Simulator, SimulatorConfig};
use super::types::NamedHandle;

/// Maximum TPM command/response size
pub const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Size of the command/response header: tag (2) + size (4) + code (4)
pub const TPM_HEADER_SIZE: usize = 10;

/// Character devices probed by [`TpmDevice::detect`], in order of preference
pub const LOCAL_DEVICES: &[&str] = &["/dev/tpmrm0", "/dev/tpm0"];

/// Path token that selects the in-process simulator
pub const SIMULATOR_PATH: &str = "simulator";

/// A byte pipe to a TPM
pub trait Transport: Send {
    /// Send one command and return the complete response
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Kernel character device; the driver returns a whole response per read
pub struct DeviceTransport {
    file: File,
}

impl DeviceTransport {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TpmError::transport(format!("failed to open TPM device: {path}"), e))?;
        Ok(Self { file })
    }
}

impl Transport for DeviceTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .map_err(|e| TpmError::transport("failed to write TPM command", e))?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .map_err(|e| TpmError::transport("failed to read TPM response", e))?;

        response.truncate(n);
        Ok(response)
    }
}

/// Raw TPM command stream over TCP; responses are framed by their header
pub struct SocketTransport {
    stream: TcpStream,
}

impl SocketTransport {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| TpmError::transport(format!("failed to connect to TPM at {addr}"), e))?;
        Ok(Self { stream })
    }
}

impl Transport for SocketTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.stream
            .write_all(command)
            .map_err(|e| TpmError::transport("failed to send TPM command", e))?;

        let mut header = [0u8; TPM_HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| TpmError::transport("failed to read TPM response header", e))?;
        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if !(TPM_HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            return Err(invalid_response(format!("TPM response size out of range: {size}")));
        }

        let mut response = header.to_vec();
        response.resize(size, 0);
        self.stream
            .read_exact(&mut response[TPM_HEADER_SIZE..])
            .map_err(|e| TpmError::transport("failed to read TPM response body", e))?;
        Ok(response)
    }
}

fn invalid_response(msg: String) -> anyhow::Error {
    TpmError::transport(msg.clone(), io::Error::new(io::ErrorKind::InvalidData, msg)).into()
}

/// TPM device handle
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    path: String,
}

impl TpmDevice {
    /// Open a TPM by path.
    ///
    /// `simulator` selects the in-process simulator, known device nodes and
    /// `device:`-prefixed paths open a character device, and anything else
    /// is dialed as a TCP address.
    pub fn open(path: &str) -> Result<Self> {
        if path == SIMULATOR_PATH {
            return Ok(Self::simulator(SimulatorConfig::default()));
        }
        if let Some(device_path) = path.strip_prefix("device:") {
            return Self::open_device(device_path);
        }
        if LOCAL_DEVICES.contains(&path) || path.starts_with("/dev/") {
            return Self::open_device(path);
        }
        Ok(Self {
            transport: Box::new(SocketTransport::connect(path)?),
            path: path.to_string(),
        })
    }

    fn open_device(path: &str) -> Result<Self> {
        Ok(Self {
            transport: Box::new(DeviceTransport::open(path)?),
            path: path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        for path in LOCAL_DEVICES {
            if Path::new(path).exists() {
                return Self::open_device(path);
            }
        }
        bail!(TpmError::transport(
            "TPM device not found",
            io::Error::new(io::ErrorKind::NotFound, "no /dev/tpmrm0 or /dev/tpm0"),
        ))
    }

    /// An in-process simulator
    pub fn simulator(config: SimulatorConfig) -> Self {
        Self::from_transport(SIMULATOR_PATH, Box::new(Simulator::new(config)))
    }

    pub fn from_transport(path: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            path: path.to_string(),
        }
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Send a command to the TPM and receive the response
    pub fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.transport.transmit(command)
    }

    /// Execute a TPM command and parse the response
    pub fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self.transmit(command)?;
        TpmResponse::parse(&response_bytes)
    }
}

/// TPM command builder
///
/// Handles and parameters are kept apart until the command is encoded, so
/// that the session layer can hash handle names and encrypt the first
/// parameter before the authorization area is attached.
pub struct TpmCommand {
    code: TpmCc,
    handles: Vec<NamedHandle>,
    params: CommandBuffer,
}

impl TpmCommand {
    pub fn new(command_code: TpmCc) -> Self {
        Self {
            code: command_code,
            handles: Vec::new(),
            params: CommandBuffer::with_capacity(256),
        }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    /// Add a handle named by its own value (permanent handles, sessions)
    pub fn add_handle(&mut self, handle: u32) {
        self.handles.push(NamedHandle::permanent(handle));
    }

    /// Add an object handle along with its name
    pub fn add_named_handle(&mut self, handle: &NamedHandle) {
        self.handles.push(handle.clone());
    }

    /// Add raw bytes to the parameters
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.params.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.params.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.params.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.params.put_u32(v);
    }

    pub fn add_i32(&mut self, v: i32) {
        self.params.put_i32(v);
    }

    /// Add a TPM2B structure
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.params.put_tpm2b(data);
    }

    /// Add an empty TPM2B structure
    pub fn add_tpm2b_empty(&mut self) {
        self.params.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.params);
    }

    pub fn handles(&self) -> &[NamedHandle] {
        &self.handles
    }

    pub fn params(&self) -> &[u8] {
        self.params.as_bytes()
    }

    /// Encode a command without an authorization area
    pub fn finalize(self) -> Result<Vec<u8>> {
        self.params.check()?;
        Ok(encode_command(
            TpmSt::NoSessions,
            self.code,
            &self.handles,
            self.params.as_bytes(),
            &[],
        ))
    }

    /// Encode a command with the given (possibly encrypted) parameters and
    /// marshalled authorization area
    pub fn finalize_with_auth(self, params: &[u8], auth_area: &CommandBuffer) -> Result<Vec<u8>> {
        self.params.check()?;
        auth_area.check()?;
        Ok(encode_command(
            TpmSt::Sessions,
            self.code,
            &self.handles,
            params,
            auth_area.as_bytes(),
        ))
    }
}

fn encode_command(
    tag: TpmSt,
    code: TpmCc,
    handles: &[NamedHandle],
    params: &[u8],
    auth_area: &[u8],
) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(TPM_HEADER_SIZE + params.len() + auth_area.len());

    // Header: tag (2) + size (4) + command code (4)
    buf.put_u16(tag.to_u16());
    buf.put_u32(0); // Size placeholder
    buf.put_u32(code.to_u32());

    for h in handles {
        buf.put_u32(h.handle);
    }
    if tag == TpmSt::Sessions {
        buf.put_u32(auth_area.len() as u32);
        buf.put_bytes(auth_area);
    }
    buf.put_bytes(params);

    let size = buf.len() as u32;
    buf.update_u32(2, size);
    buf.into_vec()
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

/// A successful response split into its areas
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub handles: Vec<u32>,
    pub parameters: Vec<u8>,
    pub auth_area: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < TPM_HEADER_SIZE {
            return Err(invalid_response(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| invalid_response(format!("invalid response tag: 0x{:04x}", tag_raw)))?;

        let size = buf.get_u32()? as usize;
        if size < TPM_HEADER_SIZE || response.len() < size {
            return Err(invalid_response(format!(
                "TPM response size mismatch: expected {}, got {}",
                size,
                response.len()
            )));
        }

        let response_code = buf.get_u32()?;

        // Remaining data after header
        let data = response[TPM_HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    /// Ensure the response is successful, attributing failures to `command`
    pub fn ensure_success(&self, command: TpmCc) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TpmError::Response {
                command,
                code: self.response_code,
            }
            .into())
        }
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Split a successful response to `command` into handles, parameters
    /// and authorization area
    pub fn split(&self, command: TpmCc) -> Result<ResponseParts> {
        self.ensure_success(command)?;
        let mut buf = self.data_buffer();
        let mut handles = Vec::new();
        for _ in 0..command.response_handles() {
            handles.push(buf.get_u32()?);
        }
        if self.tag == TpmSt::Sessions {
            let param_size = buf.get_u32()? as usize;
            let parameters = buf.get_bytes(param_size)?;
            let auth_area = buf.get_remaining();
            Ok(ResponseParts {
                handles,
                parameters,
                auth_area,
            })
        } else {
            Ok(ResponseParts {
                handles,
                parameters: buf.get_remaining(),
                auth_area: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_command_builder() {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(0x80000001);

        let bytes = cmd.finalize().unwrap();

        // Check header
        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x65]); // TPM_CC_FlushContext
        assert_eq!(&bytes[10..14], &[0x80, 0x00, 0x00, 0x01]);

        // Check size
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_auth_area_follows_handles() {
        let mut cmd = TpmCommand::new(TpmCc::Unseal);
        cmd.add_handle(0x80000000);
        let mut auth_area = CommandBuffer::new();
        auth_area.put_bytes(&[0xAA; 9]);
        let bytes = cmd.finalize_with_auth(&[0xEE], &auth_area).unwrap();
        assert_eq!(&bytes[0..2], &[0x80, 0x02]);
        assert_eq!(&bytes[10..14], &[0x80, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[14..18], &[0x00, 0x00, 0x00, 0x09]);
        assert_eq!(bytes.last(), Some(&0xEE));
        assert_eq!(bytes.len(), 10 + 4 + 4 + 9 + 1);
    }

    #[test]
    fn test_oversized_parameter_is_not_encoded() {
        let mut cmd = TpmCommand::new(TpmCc::Unseal);
        cmd.add_handle(0x80000000);
        cmd.add_tpm2b(&vec![0x42; TPM2B_MAX + 1]);
        let err = cmd.finalize().unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);

        let mut auth_area = CommandBuffer::new();
        auth_area.put_tpm2b(&vec![0; TPM2B_MAX + 1]);
        let err = TpmCommand::new(TpmCc::Unseal)
            .finalize_with_auth(&[], &auth_area)
            .unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);
    }

    #[test]
    fn test_response_parse() {
        // Minimal success response
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_split_sessions_response() {
        let response = vec![
            0x80, 0x02, // TPM_ST_SESSIONS
            0x00, 0x00, 0x00, 0x15, // Size = 21
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
            0x80, 0x00, 0x00, 0x01, // object handle
            0x00, 0x00, 0x00, 0x02, // parameterSize
            0xBE, 0xEF, // parameters
            0x01, // auth area
        ];
        let parts = TpmResponse::parse(&response)
            .unwrap()
            .split(TpmCc::Load)
            .unwrap();
        assert_eq!(parts.handles, vec![0x80000001]);
        assert_eq!(parts.parameters, vec![0xBE, 0xEF]);
        assert_eq!(parts.auth_area, vec![0x01]);
    }

    #[test]
    fn test_short_response_is_transport_failure() {
        let err = TpmResponse::parse(&[0x80, 0x01]).unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Transport);
    }

    #[test]
    fn test_open_simulator_path() {
        let dev = TpmDevice::open(SIMULATOR_PATH).unwrap();
        assert_eq!(dev.path(), SIMULATOR_PATH);
    }
}
