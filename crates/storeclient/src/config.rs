//! Client option loading

use crate::error::Result;
use std::path::Path;
use storeconfig::{ClientOptions, StoreConfig};

/// Read `[client]` (falling back to `[global]`) from `path`, or use the
/// defaults when no file is given
pub fn load_client_options(path: Option<&Path>) -> Result<ClientOptions> {
    match path {
        Some(path) => {
            let config = StoreConfig::from_file(path)?;
            Ok(ClientOptions::try_from_store_config(
                &config,
                ClientOptions::SECTIONS,
            )?)
        }
        None => Ok(ClientOptions::default()),
    }
}
