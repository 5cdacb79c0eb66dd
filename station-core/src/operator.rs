// Operator surface: the action button gesture, the configuration web pages
// and the firmware upload handler behind them

use std::io::Read;
use std::time::Duration;

use crate::config::{ConfigError, ConfigStore};
use crate::ota::{FirmwareFlash, FwUpdater, OtaError};

/// Holding the button this long at wake-up starts the configuration server
pub const LONG_PRESS_MS: u64 = 2_500;
/// Shortest press that counts while the server is running
pub const TOGGLE_PRESS_MS: u64 = 250;
pub const CONFIG_SERVER_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Largest config form body accepted
pub const MAX_FORM_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonGesture {
    /// Bounce or a tap too short to mean anything
    None,
    Short,
    Long,
}

pub fn classify_press(held_ms: u64) -> ButtonGesture {
    if held_ms >= LONG_PRESS_MS {
        ButtonGesture::Long
    } else if held_ms >= TOGGLE_PRESS_MS {
        ButtonGesture::Short
    } else {
        ButtonGesture::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Joined to the configured WiFi network
    Station,
    /// Own access point named after the station
    AccessPoint,
}

/// One run of the configuration server, from the long press until the
/// timeout expires and the station restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSession {
    started_ms: u64,
    mode: ServerMode,
}

impl ConfigSession {
    /// Starts on the local network when one is configured
    pub fn start(now_ms: u64, wifi_configured: bool) -> Self {
        Self {
            started_ms: now_ms,
            mode: if wifi_configured {
                ServerMode::Station
            } else {
                ServerMode::AccessPoint
            },
        }
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// A short press swaps between the local network and the access point.
    /// Returns the new mode when the server has to be restarted.
    pub fn on_press(&mut self, held_ms: u64) -> Option<ServerMode> {
        if classify_press(held_ms) == ButtonGesture::None {
            return None;
        }
        self.mode = match self.mode {
            ServerMode::Station => ServerMode::AccessPoint,
            ServerMode::AccessPoint => ServerMode::Station,
        };
        Some(self.mode)
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) >= CONFIG_SERVER_TIMEOUT.as_millis() as u64
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `application/x-www-form-urlencoded` text. Broken escapes are kept
/// verbatim.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn form_value(body: &str, name: &str) -> Option<String> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| url_decode(key) == name)
        .map(|(_, value)| url_decode(value))
}

#[derive(Debug)]
pub enum ConfigPost {
    Saved,
    MissingField,
    Invalid(ConfigError),
}

/// Handle the config form: replace the document with the posted JSON and
/// save it. The store is left untouched when the JSON does not parse.
pub fn apply_config_form(store: &mut ConfigStore, body: &str) -> ConfigPost {
    let Some(json) = form_value(body, "config") else {
        return ConfigPost::MissingField;
    };
    if let Err(e) = store.import_json(&json) {
        log::warn!("Rejected configuration upload: {}", e);
        return ConfigPost::Invalid(e);
    }
    match store.save() {
        Ok(writes) => {
            log::info!("Configuration updated from web form ({} backends written)", writes);
            ConfigPost::Saved
        }
        Err(e) => ConfigPost::Invalid(e),
    }
}

/// Stream an uploaded image into a fresh OTA session and select it for boot
pub fn receive_firmware<F: FirmwareFlash>(
    updater: &mut FwUpdater<F>,
    body: &mut dyn Read,
    content_len: usize,
) -> Result<usize, OtaError> {
    updater.cancel();
    updater.begin(content_len)?;
    let written = updater.write_from_reader(body)?;
    updater.end()?;
    Ok(written)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_page(station_name: &str, body: &str) -> String {
    format!(
        "<html><head><meta name=viewport content='width=device-width,initial-scale=1'><style>\
         body{{font-family:sans-serif}}label,input,a{{font-size:1.5em;margin:0 5px}}\
         textarea{{tab-size:2;width:100%;height:70vh}}</style></head><body><h1>{}</h1>{}</body></html>",
        escape_html(station_name),
        body
    )
}

pub fn render_home(station_name: &str, config_json: &str, notice: Option<&str>) -> String {
    let mut body = String::new();
    if let Some(notice) = notice {
        body.push_str(&format!("<h2>{}</h2>", escape_html(notice)));
    }
    body.push_str(&format!(
        "<form method='post'><textarea name='config'>{}</textarea>\
         <p><input type='submit' value='Save'> <a href='/restart'>Restart</a></p></form><hr>\
         <label>Update firmware:</label><input type='file' id='fw' accept='.bin'>\
         <button onclick=\"fetch('/upgrade',{{method:'POST',body:document.getElementById('fw').files[0]}})\
         .then(r=>r.text()).then(t=>document.body.innerHTML=t)\">Update</button>",
        escape_html(config_json)
    ));
    render_page(station_name, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::sim::{build_image, station_descriptor, SimFlash};
    use crate::ota::UpdateState;

    #[test]
    fn test_press_classification() {
        assert_eq!(classify_press(40), ButtonGesture::None);
        assert_eq!(classify_press(300), ButtonGesture::Short);
        assert_eq!(classify_press(2_499), ButtonGesture::Short);
        assert_eq!(classify_press(2_500), ButtonGesture::Long);
    }

    #[test]
    fn test_session_toggles_and_expires() {
        let mut session = ConfigSession::start(1_000, true);
        assert_eq!(session.mode(), ServerMode::Station);
        assert_eq!(session.on_press(10), None);
        assert_eq!(session.on_press(400), Some(ServerMode::AccessPoint));
        assert_eq!(session.on_press(400), Some(ServerMode::Station));

        assert!(!session.expired(1_000 + 14 * 60_000));
        assert!(session.expired(1_000 + 15 * 60_000));

        let session = ConfigSession::start(0, false);
        assert_eq!(session.mode(), ServerMode::AccessPoint);
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a+b%20c"), "a b c");
        assert_eq!(url_decode("%7B%22k%22%3A1%7D"), "{\"k\":1}");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_form_value_lookup() {
        let body = "other=1&config=%7B%7D";
        assert_eq!(form_value(body, "config").as_deref(), Some("{}"));
        assert_eq!(form_value(body, "missing"), None);
    }

    #[test]
    fn test_config_form_saves_valid_json() {
        let kv = MemoryStore::new();
        let mut store = ConfigStore::open(None, Box::new(kv.clone()));
        let body = "config=%7B%22station.name%22%3A%22Hilltop%22%7D";
        assert!(matches!(apply_config_form(&mut store, body), ConfigPost::Saved));
        assert_eq!(store.get_str("station.name", "x"), "Hilltop");
        assert!(kv.contents().unwrap().contains("Hilltop"));
    }

    #[test]
    fn test_config_form_rejects_bad_json() {
        let mut store = ConfigStore::open(None, Box::new(MemoryStore::new()));
        store.set_str("station.name", "Keep");
        assert!(matches!(
            apply_config_form(&mut store, "config=%5B1%2C2%5D"),
            ConfigPost::Invalid(ConfigError::NotAnObject)
        ));
        assert!(matches!(
            apply_config_form(&mut store, "config=%7Bnope"),
            ConfigPost::Invalid(ConfigError::Parse(_))
        ));
        assert!(matches!(apply_config_form(&mut store, "x=1"), ConfigPost::MissingField));
        assert_eq!(store.get_str("station.name", "x"), "Keep");
    }

    #[test]
    fn test_receive_firmware_commits() {
        let flash = SimFlash::dual_slot();
        let mut updater = FwUpdater::new(flash.clone());
        let image = build_image(&station_descriptor("0.4.0"), 40_000);
        let written = receive_firmware(&mut updater, &mut image.as_slice(), image.len()).unwrap();
        assert_eq!(written, image.len());
        assert_eq!(updater.state(), UpdateState::Committed);
        assert_eq!(flash.boot_label().as_deref(), Some("ota_1"));
    }

    #[test]
    fn test_home_page_escapes_config() {
        let page = render_home("Ridge <1>", "{\"a\":\"</textarea>\"}", Some("Configuration saved!"));
        assert!(page.contains("<h1>Ridge &lt;1&gt;</h1>"));
        assert!(page.contains("&lt;/textarea&gt;"));
        assert!(page.contains("<h2>Configuration saved!</h2>"));
        assert!(page.contains("fetch('/upgrade'"));
    }
}
