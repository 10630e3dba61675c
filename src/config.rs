/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Settings loading, in the teacher's `load_yaml`/`Config` style (see the
//! original `build_cluster`/`load_config` pair this file replaces) but
//! carrying the local-site's own knobs instead of cluster/upstream ones.

use std::fs::File;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_missed_heartbeat_threshold() -> u32 {
    3
}

fn default_periodic_function_interval_secs() -> u64 {
    180
}

fn default_announce_ttl_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:3024".to_string()
}

/// Loaded from a YAML file; every field with a default may be omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub domain_name: String,
    pub auth_servers: Vec<String>,
    pub offline_threshold_secs: u64,

    #[serde(default = "default_missed_heartbeat_threshold")]
    pub missed_heartbeat_threshold: u32,

    #[serde(default = "default_periodic_function_interval_secs")]
    pub periodic_function_interval_secs: u64,

    /// Defaults computed at load time to ⅔ of `announce_ttl`, matching
    /// the original's `proxySyncInterval = apidefaults.ServerAnnounceTTL * 2 / 3`.
    pub proxy_sync_interval_secs: Option<u64>,

    #[serde(default = "default_announce_ttl_secs")]
    pub announce_ttl_secs: u64,

    #[serde(default)]
    pub recording_at_proxy: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Settings {
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    pub fn periodic_function_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_function_interval_secs)
    }

    pub fn announce_ttl(&self) -> Duration {
        Duration::from_secs(self.announce_ttl_secs)
    }

    pub fn proxy_sync_interval(&self) -> Duration {
        match self.proxy_sync_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.announce_ttl_secs * 2 / 3),
        }
    }
}

pub fn load_yaml(file_path: &str) -> Result<Settings> {
    let file = File::open(file_path)
        .map_err(|err| Error::bad_parameter(format!("unable to open {file_path}: {err}")))?;
    serde_yaml::from_reader(file)
        .map_err(|err| Error::bad_parameter(format!("unable to parse {file_path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let yaml = r#"
domain_name: example.teleport.sh
auth_servers:
  - 127.0.0.1:3025
offline_threshold_secs: 600
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.missed_heartbeat_threshold, 3);
        assert_eq!(settings.periodic_function_interval_secs, 180);
        assert_eq!(settings.announce_ttl_secs, 600);
        assert!(!settings.recording_at_proxy);
        assert_eq!(settings.listen_addr, "0.0.0.0:3024");
    }

    #[test]
    fn proxy_sync_interval_defaults_to_two_thirds_of_announce_ttl() {
        let yaml = r#"
domain_name: example.teleport.sh
auth_servers: []
offline_threshold_secs: 600
announce_ttl_secs: 600
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.proxy_sync_interval(), Duration::from_secs(400));
    }

    #[test]
    fn explicit_proxy_sync_interval_overrides_default() {
        let yaml = r#"
domain_name: example.teleport.sh
auth_servers: []
offline_threshold_secs: 600
proxy_sync_interval_secs: 42
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.proxy_sync_interval(), Duration::from_secs(42));
    }
}
