// NVS backend for the config store: the whole JSON document as one blob

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;

use station_core::config::{BlobStore, ConfigError};

const CONFIG_NAMESPACE: &str = "configuration";
const CONFIG_KEY: &str = "json";
const LABEL: &str = "nvs";

fn backend_error(e: EspError) -> ConfigError {
    ConfigError::Backend {
        backend: LABEL.to_string(),
        reason: e.to_string(),
    }
}

pub struct NvsBlobStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsBlobStore {
    pub fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl BlobStore for NvsBlobStore {
    fn label(&self) -> &str {
        LABEL
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(len) = self.nvs.blob_len(CONFIG_KEY).map_err(backend_error)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        let data = self.nvs.get_blob(CONFIG_KEY, &mut buf).map_err(backend_error)?;
        Ok(data.map(<[u8]>::to_vec))
    }

    fn store(&mut self, data: &[u8]) -> Result<(), ConfigError> {
        self.nvs.set_blob(CONFIG_KEY, data).map_err(backend_error)?;
        log::debug!("Configuration written to NVS ({} bytes)", data.len());
        Ok(())
    }
}
