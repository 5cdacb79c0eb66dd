// Network seams: the WiFi link and a minimal HTTP transport

use base64::Engine as _;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection to '{0}' timed out")]
    Timeout(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("transport failure: {0}")]
    Other(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// `None` when no username is configured
    pub fn from_settings(username: &str, password: &str) -> Option<Self> {
        (!username.is_empty()).then(|| Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostRequest<'a> {
    pub url: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
    pub auth: Option<&'a BasicAuth>,
    pub timeout: Duration,
}

/// Body of a GET that answered 200
pub struct Download<'a> {
    /// Content-Length, when the server sent one
    pub length: Option<usize>,
    pub body: Box<dyn Read + 'a>,
}

pub trait Transport {
    /// Send one request and return the HTTP status
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError>;

    /// Start a GET and hand back the body as a stream. Non-200 answers are
    /// errors.
    fn open<'a>(
        &'a mut self,
        url: &str,
        auth: Option<&BasicAuth>,
        timeout: Duration,
    ) -> Result<Download<'a>, TransportError>;
}

pub trait Connectivity {
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<(), TransportError>;
    fn disconnect(&mut self);
}

/// Link for a board whose radio could not be brought up. Every connect
/// fails, so uploads stay queued and the cycle carries on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

impl Connectivity for Offline {
    fn connect(&mut self, _ssid: &str, _password: &str, _timeout: Duration) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn disconnect(&mut self) {}
}

/// Upload endpoints answer 200 or 204 when they stored the batch
pub fn is_ack(status: u16) -> bool {
    status == 200 || status == 204
}
