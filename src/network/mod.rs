// Network bindings: the WiFi link and the HTTP client behind the core's
// Connectivity and Transport traits

pub mod http;
pub mod wifi;

pub use http::{BodyReader, EspTransport};
pub use wifi::EspConnectivity;
