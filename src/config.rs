use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::preprocess::VggNormalization;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub manifest_path: PathBuf,
    pub vocabulary_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub vgg_normalization: VggNormalization,
    pub eval_samples_path: Option<PathBuf>,
    pub max_upload_bytes: usize,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            manifest_path: PathBuf::from("models/manifest.json"),
            vocabulary_path: None,
            catalog_path: None,
            vgg_normalization: VggNormalization::Unit,
            eval_samples_path: None,
            max_upload_bytes: 10 * 1024 * 1024,
            #[cfg(feature = "tch-backend")]
            device: Device::Cpu,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let manifest_path = env::var("MODEL_MANIFEST_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.manifest_path);
        let vocabulary_path = env::var("VOCABULARY_PATH").ok().map(PathBuf::from);
        let catalog_path = env::var("VARIETY_CATALOG_PATH").ok().map(PathBuf::from);

        let vgg_normalization = match env::var("VGG_NORMALIZATION") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.vgg_normalization,
        };

        let eval_samples_path = env::var("EVAL_SAMPLES_PATH").ok().map(PathBuf::from);
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_upload_bytes);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            manifest_path,
            vocabulary_path,
            catalog_path,
            vgg_normalization,
            eval_samples_path,
            max_upload_bytes,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            return Device::Cuda(idx);
        }
        tracing::warn!(requested = %raw, "CUDA not available, falling back to CPU");
    }
    Device::Cpu
}
