use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Represents the contents of PyWire's global configuration.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Directory scanned for page sources.
    pub pages_dir: PathBuf,
    /// Extension (without the dot) identifying page sources.
    pub source_extension: String,
    pub serve: Serve,
    pub uploads: Uploads,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pages_dir: PathBuf::from("pages"),
            source_extension: "pw".into(),
            serve: Serve::default(),
            uploads: Uploads::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Serve {
    pub address: String,
    pub port: u16,
    /// Enables detailed error surfaces. Implied by the `dev` command.
    pub debug: bool,
    /// Directory of user static assets, mounted at `static_prefix`.
    pub static_dir: Option<PathBuf>,
    pub static_prefix: String,
}

impl Default for Serve {
    fn default() -> Self {
        Serve {
            address: "127.0.0.1".into(),
            port: 8000,
            debug: false,
            static_dir: None,
            static_prefix: "/static".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Uploads {
    /// Safety ceiling on `Content-Length` for the upload endpoint, in bytes.
    pub max_body_bytes: u64,
}

impl Default for Uploads {
    fn default() -> Self {
        Uploads {
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let toml_raw = match path.exists() {
            true => {
                std::fs::read_to_string(path)
                    .wrap_err("Could not read in configuration file.")
                    .suggestion("The configuration file was found, but couldn't be read - try checking your file permissions.")?
            },
            false => bail!("Configuration file not found.")
        };

        Ok(toml::from_str(&toml_raw)?)
    }
}
