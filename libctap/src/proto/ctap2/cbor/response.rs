use crate::proto::error::CtapError;
use crate::transport::error::ProtocolError;

use std::convert::{TryFrom, TryInto};
use tracing::error;

#[derive(Debug, Clone, PartialEq)]
pub struct CborResponse {
    pub status_code: CtapError,
    pub data: Option<Vec<u8>>,
}

impl CborResponse {
    pub fn new_success_from_slice(slice: &[u8]) -> Self {
        Self {
            status_code: CtapError::Ok,
            data: match slice.len() {
                0 => None,
                _ => Some(Vec::from(slice)),
            },
        }
    }

    pub fn body(&self) -> Result<&[u8], ProtocolError> {
        match &self.data {
            Some(data) => Ok(data),
            None => {
                error!("Expected a CBOR body in the response");
                Err(ProtocolError::EmptyResponse)
            }
        }
    }
}

impl TryFrom<&[u8]> for CborResponse {
    type Error = ProtocolError;
    fn try_from(packet: &[u8]) -> Result<Self, Self::Error> {
        let Some((&status, body)) = packet.split_first() else {
            error!("CBOR response packets must contain at least 1 byte");
            return Err(ProtocolError::EmptyResponse);
        };

        let Ok(status_code) = status.try_into() else {
            error!({ code = ?status }, "Invalid CTAP error code");
            return Err(ProtocolError::UnknownStatus(status));
        };

        let data = if body.is_empty() {
            None
        } else {
            Some(Vec::from(body))
        };
        Ok(CborResponse { status_code, data })
    }
}
