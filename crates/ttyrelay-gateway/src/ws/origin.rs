use axum::{
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use ttyrelay_core::config::BridgeConfig;

/// Which `Origin` headers may open a WebSocket on a session port.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    allow_missing: bool,
}

/// Why a handshake was refused before the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Origin header absent (when required), unreadable, or not on the list.
    Origin(Option<String>),
    /// Another client already owns the byte stream.
    Capacity,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I, allow_missing: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|o| normalize(&Into::<String>::into(o)))
                .collect(),
            allow_missing,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.allowed_origins.iter().cloned(), config.allow_missing_origin)
    }

    /// Decide on a parsed header value. `None` means no header was sent.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => self.allow_missing,
            Some(origin) => {
                let origin = normalize(origin);
                self.allowed.iter().any(|a| *a == origin)
            }
        }
    }

    /// Check the handshake request headers.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), RejectReason> {
        let Some(raw) = headers.get(ORIGIN) else {
            return if self.allow_missing {
                Ok(())
            } else {
                Err(RejectReason::Origin(None))
            };
        };
        let origin = raw.to_str().map_err(|_| {
            RejectReason::Origin(Some(String::from_utf8_lossy(raw.as_bytes()).into_owned()))
        })?;
        if self.allows(Some(origin)) {
            Ok(())
        } else {
            Err(RejectReason::Origin(Some(origin.to_string())))
        }
    }
}

/// `file:///` and `file://` name the same origin.
fn normalize(origin: &str) -> String {
    let stripped = origin.trim().trim_end_matches('/');
    if stripped.ends_with(':') {
        format!("{stripped}//")
    } else {
        stripped.to_string()
    }
}

impl IntoResponse for RejectReason {
    fn into_response(self) -> Response {
        match self {
            RejectReason::Origin(_) => (StatusCode::FORBIDDEN, "origin not allowed").into_response(),
            RejectReason::Capacity => {
                (StatusCode::CONFLICT, "a client is already attached to this session").into_response()
            }
        }
    }
}
