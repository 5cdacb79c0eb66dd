/// Typed view of the configuration document
///
/// Every key is read with its default, which backfills the document, so after
/// the first boot the exported file lists every setting the station uses.
use crate::config::ConfigStore;
use crate::power::PowerSave;
use crate::telemetry::UploadFormat;

pub mod keys {
    pub const STATION_NAME: &str = "station.name";
    pub const STATION_GROUP: &str = "station.group";
    pub const POLL_INTERVAL: &str = "station.poll_interval";
    pub const MIN_SLEEP_MS: &str = "station.min_sleep_ms";
    pub const DISPLAY_TIMEOUT: &str = "station.display_timeout";
    pub const WIFI_SSID: &str = "wifi.ssid";
    pub const WIFI_PASSWORD: &str = "wifi.password";
    pub const WIFI_TIMEOUT: &str = "wifi.timeout";
    pub const UPLOAD_URL: &str = "http.update.url";
    pub const UPLOAD_TYPE: &str = "http.update.type";
    pub const UPLOAD_USERNAME: &str = "http.update.username";
    pub const UPLOAD_PASSWORD: &str = "http.update.password";
    pub const UPLOAD_DATABASE: &str = "http.update.database";
    pub const UPLOAD_INTERVAL: &str = "http.update.interval";
    pub const HTTP_TIMEOUT: &str = "http.timeout";
    pub const OTA_ENABLED: &str = "http.ota.enabled";
    pub const OTA_URL: &str = "http.ota.url";
    pub const NTP_SERVER: &str = "ntp.server";
    pub const POWERSAVE_THRESHOLD: &str = "powersave.threshold";
    pub const POWERSAVE_SCALE: &str = "powersave.scale";
    pub const ANEMOMETER_RADIUS: &str = "sensors.anemometer.radius";
    pub const ANEMOMETER_CALIBRATION: &str = "sensors.anemometer.calibration";
}

pub const DEFAULT_STATION_NAME: &str = "SolarStation";
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 60;
pub const DEFAULT_UPLOAD_INTERVAL_SECS: u32 = 300;
pub const DEFAULT_MIN_SLEEP_MS: u64 = 100;
pub const ADC_CHANNELS: usize = 4;

/// WiFi credentials compiled into the firmware, used until the operator
/// stores real ones
#[derive(Debug, Clone, Default)]
pub struct WifiDefaults {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub station_name: String,
    pub station_group: String,
    pub poll_interval_secs: u32,
    pub min_sleep_ms: u64,
    pub display_timeout_secs: u32,

    pub wifi_ssid: String,
    pub wifi_password: String,
    pub wifi_timeout_secs: u32,

    pub upload_url: String,
    pub upload_format: UploadFormat,
    pub upload_username: String,
    pub upload_password: String,
    pub upload_database: String,
    pub upload_interval_secs: u32,
    pub http_timeout_secs: u32,

    pub ota_enabled: bool,
    pub ota_url: String,
    pub ntp_server: String,

    pub power: PowerSave,
    pub adc_multipliers: [f32; ADC_CHANNELS],
    pub anemometer_radius_cm: f32,
    pub anemometer_calibration: f32,
}

fn clamp_u32(value: i64, min: u32) -> u32 {
    value.clamp(i64::from(min), i64::from(u32::MAX)) as u32
}

impl Settings {
    pub fn load(store: &mut ConfigStore, wifi: &WifiDefaults) -> Self {
        let upload_type = store.get_str(keys::UPLOAD_TYPE, UploadFormat::Json.as_str());
        let upload_format = upload_type.parse().unwrap_or_else(|_| {
            log::warn!("Unknown upload type '{}', sending JSON", upload_type);
            UploadFormat::Json
        });

        let mut adc_multipliers = [2.0f32; ADC_CHANNELS];
        for (i, multiplier) in adc_multipliers.iter_mut().enumerate() {
            let key = format!("sensors.adc.adc{}_multiplier", i);
            *multiplier = store.get_double(&key, 2.0) as f32;
        }

        Self {
            station_name: store.get_str(keys::STATION_NAME, DEFAULT_STATION_NAME),
            station_group: store.get_str(keys::STATION_GROUP, "weather"),
            poll_interval_secs: clamp_u32(
                store.get_int(keys::POLL_INTERVAL, i64::from(DEFAULT_POLL_INTERVAL_SECS)),
                1,
            ),
            min_sleep_ms: store
                .get_int(keys::MIN_SLEEP_MS, DEFAULT_MIN_SLEEP_MS as i64)
                .max(0) as u64,
            display_timeout_secs: clamp_u32(store.get_int(keys::DISPLAY_TIMEOUT, 10), 0),

            wifi_ssid: store.get_str(keys::WIFI_SSID, &wifi.ssid),
            wifi_password: store.get_str(keys::WIFI_PASSWORD, &wifi.password),
            wifi_timeout_secs: clamp_u32(store.get_int(keys::WIFI_TIMEOUT, 30), 1),

            upload_url: store.get_str(keys::UPLOAD_URL, ""),
            upload_format,
            upload_username: store.get_str(keys::UPLOAD_USERNAME, ""),
            upload_password: store.get_str(keys::UPLOAD_PASSWORD, ""),
            upload_database: store.get_str(keys::UPLOAD_DATABASE, ""),
            upload_interval_secs: clamp_u32(
                store.get_int(keys::UPLOAD_INTERVAL, i64::from(DEFAULT_UPLOAD_INTERVAL_SECS)),
                1,
            ),
            http_timeout_secs: clamp_u32(store.get_int(keys::HTTP_TIMEOUT, 30), 1),

            ota_enabled: store.get_int(keys::OTA_ENABLED, 1) != 0,
            ota_url: store.get_str(keys::OTA_URL, ""),
            ntp_server: store.get_str(keys::NTP_SERVER, "pool.ntp.org"),

            power: PowerSave {
                threshold: store.get_double(keys::POWERSAVE_THRESHOLD, 3.6) as f32,
                scale: store.get_double(keys::POWERSAVE_SCALE, 10.0) as f32,
            },
            adc_multipliers,
            anemometer_radius_cm: store.get_double(keys::ANEMOMETER_RADIUS, 15.0) as f32,
            anemometer_calibration: store.get_double(keys::ANEMOMETER_CALIBRATION, 1.0) as f32,
        }
    }

    pub fn wifi_configured(&self) -> bool {
        !self.wifi_ssid.is_empty()
    }

    pub fn upload_configured(&self) -> bool {
        !self.upload_url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;

    #[test]
    fn test_first_boot_writes_every_default() {
        let kv = MemoryStore::new();
        let mut store = ConfigStore::open(None, Box::new(kv.clone()));
        let settings = Settings::load(&mut store, &WifiDefaults::default());

        assert_eq!(settings.station_name, DEFAULT_STATION_NAME);
        assert_eq!(settings.poll_interval_secs, 60);
        assert_eq!(settings.upload_format, UploadFormat::Json);
        assert_eq!(settings.adc_multipliers, [2.0; 4]);
        assert!(settings.ota_enabled);
        assert!(!settings.wifi_configured());

        store.save().unwrap();
        let saved = kv.contents().unwrap();
        for key in [keys::UPLOAD_INTERVAL, keys::POWERSAVE_SCALE, "sensors.adc.adc3_multiplier"] {
            assert!(saved.contains(key), "missing {}", key);
        }
    }

    #[test]
    fn test_stored_values_override_defaults() {
        let kv = MemoryStore::with_contents(
            r#"{"station.poll_interval": 120, "http.update.type": "influxdb", "wifi.ssid": "barn", "station.min_sleep_ms": -5}"#,
        );
        let mut store = ConfigStore::open(None, Box::new(kv));
        let settings = Settings::load(&mut store, &WifiDefaults::default());

        assert_eq!(settings.poll_interval_secs, 120);
        assert_eq!(settings.upload_format, UploadFormat::Influx);
        assert_eq!(settings.wifi_ssid, "barn");
        assert_eq!(settings.min_sleep_ms, 0);
    }

    #[test]
    fn test_compiled_wifi_defaults_are_used() {
        let mut store = ConfigStore::open(None, Box::new(MemoryStore::new()));
        let wifi = WifiDefaults {
            ssid: "field".to_string(),
            password: "secret".to_string(),
        };
        let settings = Settings::load(&mut store, &wifi);
        assert_eq!(settings.wifi_ssid, "field");
        assert_eq!(settings.wifi_password, "secret");
    }
}
