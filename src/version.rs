// Centralized version information

use station_core::scheduler::FirmwareIdentity;

// Cargo package version from Cargo.toml, reported as `version` in telemetry
pub const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Build stamp injected by build.rs from STATION_BUILD
pub const BUILD: &str = env!("STATION_BUILD");

pub fn identity() -> FirmwareIdentity {
    FirmwareIdentity {
        version: PROJECT_VERSION.to_string(),
        build: BUILD.to_string(),
    }
}

// Version info string for logging
pub fn version_info() -> String {
    format!("solar-station {} (build {})", PROJECT_VERSION, BUILD)
}
