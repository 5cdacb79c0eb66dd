// Operator web server: config editor on `/`, firmware upload on `/upgrade`
// and `/restart`

use anyhow::Result;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use station_core::operator::{apply_config_form, receive_firmware, render_home, render_page, ConfigPost, MAX_FORM_LEN};
use station_core::{ConfigStore, FwUpdater};

use super::EspFlash;
use crate::network::BodyReader;

const RESTART_DELAY: Duration = Duration::from_secs(2);

fn schedule_restart() {
    std::thread::spawn(|| {
        std::thread::sleep(RESTART_DELAY);
        log::info!("Restarting system...");
        unsafe { esp_idf_sys::esp_restart() };
    });
}

fn home_page(config: &Mutex<ConfigStore>, name: &str, notice: Option<&str>) -> String {
    let json = match config.lock() {
        Ok(store) => store.export_json().unwrap_or_else(|e| {
            log::error!("Cannot export configuration: {}", e);
            "{}".to_string()
        }),
        Err(_) => "{}".to_string(),
    };
    render_home(name, &json, notice)
}

pub struct OperatorServer {
    _server: EspHttpServer<'static>,
}

impl OperatorServer {
    pub fn start(
        config: Arc<Mutex<ConfigStore>>,
        updater: Arc<Mutex<FwUpdater<EspFlash>>>,
        station_name: String,
    ) -> Result<Self> {
        let mut server = EspHttpServer::new(&Configuration {
            stack_size: 10 * 1024,
            ..Default::default()
        })?;

        let home_config = config.clone();
        let name = station_name.clone();
        server.fn_handler("/", Method::Get, move |req| {
            let html = home_page(&home_config, &name, None);
            let mut response = req.into_response(200, None, &[("Content-Type", "text/html")])?;
            response.write_all(html.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        let form_config = config.clone();
        let name = station_name.clone();
        server.fn_handler("/", Method::Post, move |mut req| {
            let mut body = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let n = req.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                if body.len() + n > MAX_FORM_LEN {
                    let mut response = req.into_status_response(413)?;
                    response.write_all(b"Configuration too large")?;
                    return Ok(());
                }
                body.extend_from_slice(&buf[..n]);
            }
            let body = String::from_utf8_lossy(&body);

            let outcome = match form_config.lock() {
                Ok(mut store) => apply_config_form(&mut store, &body),
                Err(_) => {
                    let mut response = req.into_status_response(503)?;
                    response.write_all(b"Configuration lock failed")?;
                    return Ok(());
                }
            };
            let (status, notice) = match outcome {
                ConfigPost::Saved => (200, "Configuration saved".to_string()),
                ConfigPost::MissingField => (400, "No configuration in form".to_string()),
                ConfigPost::Invalid(e) => (400, format!("Invalid configuration: {}", e)),
            };
            let html = home_page(&form_config, &name, Some(&notice));
            let mut response = req.into_response(status, None, &[("Content-Type", "text/html")])?;
            response.write_all(html.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        let name = station_name.clone();
        server.fn_handler("/upgrade", Method::Post, move |mut req| {
            // A missing length streams until the body ends
            let content_len = req
                .header("Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            log::info!("Firmware upload started, {} bytes", content_len);

            let result = match updater.lock() {
                Ok(mut updater) => receive_firmware(&mut updater, &mut BodyReader(&mut req), content_len),
                Err(_) => {
                    let mut response = req.into_status_response(503)?;
                    response.write_all(b"Updater busy")?;
                    return Ok(());
                }
            };
            match result {
                Ok(written) => {
                    log::info!("Firmware upload complete ({} bytes), restarting", written);
                    let html = render_page(&name, "<h2>Update successful, restarting</h2>");
                    let mut response = req.into_ok_response()?;
                    response.write_all(html.as_bytes())?;
                    schedule_restart();
                }
                Err(e) => {
                    log::error!("Firmware upload failed: {}", e);
                    let html = render_page(&name, &format!("<h2>Update failed: {}</h2>", e.code()));
                    let mut response = req.into_status_response(500)?;
                    response.write_all(html.as_bytes())?;
                }
            }
            Ok::<(), anyhow::Error>(())
        })?;

        server.fn_handler("/restart", Method::Get, move |req| {
            log::warn!("Restart requested via web interface");
            let html = render_page(&station_name, "<h2>Restarting</h2>");
            let mut response = req.into_ok_response()?;
            response.write_all(html.as_bytes())?;
            schedule_restart();
            Ok::<(), anyhow::Error>(())
        })?;

        log::info!("Operator server listening on port 80");
        Ok(Self { _server: server })
    }
}
