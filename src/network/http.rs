use embedded_svc::http::client::Client;
use embedded_svc::http::Method;
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use std::time::Duration;

use station_core::network::{BasicAuth, Download, PostRequest, Transport, TransportError};

const BUFFER_SIZE: usize = 4096;

/// Lets the core's `std::io::Read` consumers pull from an ESP-IDF HTTP body
pub struct BodyReader<R>(pub R);

impl<R: embedded_svc::io::Read> std::io::Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))
    }
}

fn other(context: &str, e: impl core::fmt::Debug) -> TransportError {
    TransportError::Other(format!("{}: {:?}", context, e))
}

/// HTTP client. A new connection is made per request because the timeout
/// comes from the request; the last one is kept so a streamed body can
/// borrow it.
#[derive(Default)]
pub struct EspTransport {
    client: Option<Client<EspHttpConnection>>,
}

impl EspTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&mut self, timeout: Duration) -> Result<&mut Client<EspHttpConnection>, TransportError> {
        let config = HttpConfig {
            buffer_size: Some(BUFFER_SIZE),
            timeout: Some(timeout),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(|e| other("HTTP client", e))?;
        Ok(self.client.insert(Client::wrap(connection)))
    }
}

impl Transport for EspTransport {
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError> {
        let auth = request.auth.map(BasicAuth::header_value);
        let length = request.body.len().to_string();
        let mut headers = vec![
            ("Content-Type", request.content_type),
            ("Content-Length", length.as_str()),
        ];
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }

        let client = self.connect(request.timeout)?;
        let mut req = client
            .request(Method::Post, request.url, &headers)
            .map_err(|e| other(request.url, e))?;
        req.write_all(request.body).map_err(|e| other("request body", e))?;
        req.flush().map_err(|e| other("request body", e))?;
        let mut response = req.submit().map_err(|e| other(request.url, e))?;
        let status = response.status();

        // Drain so the connection closes cleanly
        let mut scratch = [0u8; 128];
        while matches!(response.read(&mut scratch), Ok(n) if n > 0) {}
        Ok(status)
    }

    fn open<'a>(
        &'a mut self,
        url: &str,
        auth: Option<&BasicAuth>,
        timeout: Duration,
    ) -> Result<Download<'a>, TransportError> {
        let auth = auth.map(BasicAuth::header_value);
        let mut headers = Vec::new();
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }

        let client = self.connect(timeout)?;
        let response = client
            .request(Method::Get, url, &headers)
            .map_err(|e| other(url, e))?
            .submit()
            .map_err(|e| other(url, e))?;
        match response.status() {
            200 => Ok(Download {
                length: response
                    .header("Content-Length")
                    .and_then(|v| v.parse::<usize>().ok()),
                body: Box::new(BodyReader(response)),
            }),
            status => Err(TransportError::Status(status)),
        }
    }
}
