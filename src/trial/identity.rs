// 试用请求身份识别
//
// Turns a request into the opaque identifier string the grant service keys on.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::TrialError;

/// Identifier used when no client address can be determined.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Recognised request body fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrialRequestBody {
    #[serde(default, alias = "userId")]
    pub client_id: Option<String>,
}

impl TrialRequestBody {
    fn declared_id(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Where a request came from, as far as the connection tells us.
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub peer: Option<SocketAddr>,
}

impl RequestOrigin {
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        Self {
            forwarded_for: header("x-forwarded-for"),
            real_ip: header("x-real-ip"),
            peer,
        }
    }

    /// First `x-forwarded-for` hop, then `x-real-ip`, then the socket peer.
    pub fn client_address(&self) -> Option<String> {
        self.forwarded_for
            .as_deref()
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.real_ip
                    .as_deref()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| self.peer.map(|addr| addr.ip().to_string()))
    }
}

/// How the identifier is derived from a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierSource {
    /// `client_id` must be present in the body.
    ClientId,
    /// Connection-derived address only; body fields are ignored.
    ClientAddress,
    /// `client_id` when supplied, otherwise the connection address.
    #[default]
    Hybrid,
}

impl IdentifierSource {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "client_id" => Some(Self::ClientId),
            "client_address" | "ip" => Some(Self::ClientAddress),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn derive(
        &self,
        body: &TrialRequestBody,
        origin: &RequestOrigin,
    ) -> Result<String, TrialError> {
        match self {
            Self::ClientId => body
                .declared_id()
                .map(str::to_string)
                .ok_or_else(|| TrialError::InvalidInput("client_id is required.".to_string())),
            Self::ClientAddress => Ok(address_or_unknown(origin)),
            Self::Hybrid => Ok(body
                .declared_id()
                .map(str::to_string)
                .unwrap_or_else(|| address_or_unknown(origin))),
        }
    }
}

fn address_or_unknown(origin: &RequestOrigin) -> String {
    origin
        .client_address()
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}
