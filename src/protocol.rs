//! Line-oriented JSON protocol for the symbol transport.
//!
//! Each request line names one ADS-style service. Every request gets exactly
//! one response line carrying the request id and an `error` field that is `0`
//! on success or an ADS error code.

use crate::bridge::{
    BridgeError, BridgeStatus, SymbolBridge, ADS_ERR_DEVICE_ERROR, ADS_ERR_INVALID_SIZE,
    ADS_ERR_SERVICE_NOT_SUPPORTED, SYMBOL_SIZE,
};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_REQUEST_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024;

pub const DEVICE_VERSION_MAJOR: u8 = 1;
pub const DEVICE_VERSION_MINOR: u8 = 0;
pub const DEVICE_VERSION_BUILD: u16 = 0;

pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRequest {
    pub id: u32,
    pub request: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    Read {
        index_group: u32,
        index_offset: u32,
        length: u32,
    },
    Write {
        index_group: u32,
        index_offset: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    ReadDeviceInfo,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub major_version: u8,
    pub minor_version: u8,
    pub version_build: u16,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Data {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Written {
        value: f32,
    },
    DeviceInfo(DeviceInfo),
    Status(BridgeStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolResponse {
    pub id: u32,
    pub error: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

impl SymbolResponse {
    pub fn ok(id: u32, payload: ResponsePayload) -> Self {
        Self {
            id,
            error: 0,
            payload: Some(payload),
        }
    }

    pub fn error(id: u32, code: u32) -> Self {
        Self {
            id,
            error: code,
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
}

impl ProtocolError {
    /// ADS code reported to the client for a line that could not be served.
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::InvalidJson => ADS_ERR_SERVICE_NOT_SUPPORTED,
            ProtocolError::MessageTooLarge => ADS_ERR_INVALID_SIZE,
            ProtocolError::SerializationError => ADS_ERR_DEVICE_ERROR,
        }
    }
}

/// Serves symbol requests for one client connection.
#[derive(Debug)]
pub struct ProtocolHandler {
    bridge: Arc<SymbolBridge>,
    device_name: String,
    requests_served: u64,
    response_buffer: ResponseBuffer,
}

impl ProtocolHandler {
    pub fn new(bridge: Arc<SymbolBridge>, device_name: impl Into<String>) -> Self {
        Self {
            bridge,
            device_name: device_name.into(),
            requests_served: 0,
            response_buffer: ArrayString::new(),
        }
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn parse_request(&self, line: &str) -> Result<SymbolRequest, ProtocolError> {
        if line.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str::<SymbolRequest>(line).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn handle(&mut self, request: &SymbolRequest) -> SymbolResponse {
        self.requests_served = self.requests_served.wrapping_add(1);

        let result = match &request.request {
            RequestKind::Read {
                index_group,
                index_offset,
                length,
            } => self.read(*index_group, *index_offset, *length),
            RequestKind::Write {
                index_group,
                index_offset,
                data,
            } => self.write(*index_group, *index_offset, data),
            RequestKind::ReadDeviceInfo => Ok(ResponsePayload::DeviceInfo(self.device_info())),
            RequestKind::Status => Ok(ResponsePayload::Status(self.bridge.status())),
        };

        match result {
            Ok(payload) => SymbolResponse::ok(request.id, payload),
            Err(e) => {
                debug!(id = request.id, error = %e, code = e.code(), "symbol request rejected");
                SymbolResponse::error(request.id, e.code())
            }
        }
    }

    pub fn serialize_response(&mut self, response: &SymbolResponse) -> Result<&str, ProtocolError> {
        self.response_buffer.clear();

        let json_str =
            serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;

        self.response_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        Ok(&self.response_buffer)
    }

    /// Parse, serve and encode one request line. Unparseable lines get an id-0 error response.
    pub fn process_line(&mut self, line: &str) -> Result<&str, ProtocolError> {
        let response = match self.parse_request(line) {
            Ok(request) => self.handle(&request),
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                SymbolResponse::error(0, e.code())
            }
        };

        if let Err(e) = self.serialize_response(&response).map(|_| ()) {
            // A status reply for a very large table may not fit.
            warn!(id = response.id, error = %e, "response could not be encoded");
            let fallback = SymbolResponse::error(response.id, e.code());
            self.serialize_response(&fallback)?;
        }
        Ok(&self.response_buffer)
    }

    fn read(&self, group: u32, offset: u32, length: u32) -> Result<ResponsePayload, BridgeError> {
        if (length as usize) < SYMBOL_SIZE {
            return Err(BridgeError::InvalidSize {
                expected: SYMBOL_SIZE,
                actual: length as usize,
            });
        }
        let group = narrow_group(group, offset)?;
        let bytes = self.bridge.read_by_address(group, offset)?;
        Ok(ResponsePayload::Data {
            data: bytes.to_vec(),
        })
    }

    fn write(&self, group: u32, offset: u32, data: &[u8]) -> Result<ResponsePayload, BridgeError> {
        let group = narrow_group(group, offset)?;
        let value = self.bridge.write_by_address(group, offset, data)?;
        Ok(ResponsePayload::Written { value })
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            major_version: DEVICE_VERSION_MAJOR,
            minor_version: DEVICE_VERSION_MINOR,
            version_build: DEVICE_VERSION_BUILD,
            device_name: self.device_name.clone(),
        }
    }
}

/// Symbol groups are 16-bit; anything wider cannot name a symbol.
fn narrow_group(group: u32, offset: u32) -> Result<u16, BridgeError> {
    u16::try_from(group).map_err(|_| BridgeError::SymbolNotFound { group, offset })
}
