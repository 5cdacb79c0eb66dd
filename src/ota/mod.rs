// Firmware update plumbing for the board: the ESP-IDF flash backend used by
// the updater and the operator web server

pub mod flash;
pub mod web_server;

pub use flash::EspFlash;
