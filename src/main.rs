mod logging;
mod version;

#[cfg(not(target_os = "espidf"))]
mod simulator;

#[cfg(target_os = "espidf")]
mod board;
#[cfg(target_os = "espidf")]
mod config;
#[cfg(target_os = "espidf")]
mod display;
#[cfg(target_os = "espidf")]
mod network;
#[cfg(target_os = "espidf")]
mod ota;
#[cfg(target_os = "espidf")]
mod retention;
#[cfg(target_os = "espidf")]
mod sensors;
#[cfg(target_os = "espidf")]
mod system;

// Generate ESP-IDF app descriptor
// Note: This macro generates warnings about cfg conditions but they're harmless
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger("info").map_err(|e| anyhow::anyhow!("logger: {}", e))?;
    log::info!("{}", version::version_info());

    if let Err(e) = board::run() {
        // Never stay awake on an error; the next wake starts over
        log::error!("Wake cycle aborted: {:#}", e);
        system::power::deep_sleep(60_000, 0);
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    let level = std::env::var("STATION_LOG").unwrap_or_else(|_| "info".to_string());
    logging::init_logger(&level).map_err(|e| anyhow::anyhow!("logger: {}", e))?;
    log::info!("{} (host simulator)", version::version_info());
    simulator::run(&simulator::SimOptions::from_env()?)
}
