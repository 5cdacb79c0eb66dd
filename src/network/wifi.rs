use anyhow::{anyhow, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi},
};
use std::time::{Duration, Instant};

use station_core::network::{Connectivity, TransportError};

const POLL_MS: u32 = 100;

/// Station-mode WiFi for the upload session, plus the open access point the
/// configuration server falls back to
pub struct EspConnectivity {
    wifi: EspWifi<'static>,
}

impl EspConnectivity {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;
        Ok(Self { wifi })
    }

    fn configure_client(&mut self, ssid: &str, password: &str) -> Result<()> {
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("SSID '{}' is too long", ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("WiFi password is too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        self.wifi.set_configuration(&cfg)?;
        Ok(())
    }

    /// Open access point named after the station
    pub fn start_access_point(&mut self, name: &str) -> Result<()> {
        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: name
                    .try_into()
                    .map_err(|_| anyhow!("access point name '{}' is too long", name))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        log::info!("Access point '{}' started", name);
        Ok(())
    }

    pub fn ip(&self) -> Option<String> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }
}

impl Connectivity for EspConnectivity {
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<(), TransportError> {
        self.configure_client(ssid, password)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.wifi
            .start()
            .map_err(|e| TransportError::Other(format!("WiFi start failed: {}", e)))?;
        self.wifi
            .connect()
            .map_err(|e| TransportError::Other(format!("WiFi connect failed: {}", e)))?;

        // Connected and DHCP done, or give up
        let deadline = Instant::now() + timeout;
        while !self.wifi.is_up().unwrap_or(false) {
            if Instant::now() >= deadline {
                self.disconnect();
                return Err(TransportError::Timeout(ssid.to_string()));
            }
            FreeRtos::delay_ms(POLL_MS);
        }
        log::info!("WiFi '{}' up, IP {}", ssid, self.ip().unwrap_or_default());
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.wifi.disconnect() {
            log::debug!("WiFi disconnect: {}", e);
        }
        if let Err(e) = self.wifi.stop() {
            log::debug!("WiFi stop: {}", e);
        }
    }
}
