use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds run the simulator and skip it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Compiled-in WiFi defaults, used until the operator stores real ones
    let wifi_config_path = "wifi_config.h";
    let mut ssid = String::new();
    let mut password = String::new();
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        if let Some(line) = contents.lines().find(|l| l.contains("#define WIFI_SSID")) {
            if let Some(value) = line.split('"').nth(1) {
                ssid = value.to_string();
            }
        }

        if let Some(line) = contents.lines().find(|l| l.contains("#define WIFI_PASSWORD")) {
            if let Some(value) = line.split('"').nth(1) {
                password = value.to_string();
            }
        }
    } else {
        println!("cargo:warning=wifi_config.h not found, station will boot without WiFi defaults");
    }
    println!("cargo:rustc-env=WIFI_SSID={}", ssid);
    println!("cargo:rustc-env=WIFI_PASSWORD={}", password);

    // Build stamp reported in telemetry as `build`
    let stamp = std::env::var("STATION_BUILD").unwrap_or_else(|_| "dev".to_string());
    println!("cargo:rerun-if-env-changed=STATION_BUILD");
    println!("cargo:rustc-env=STATION_BUILD={}", stamp);

    Ok(())
}
