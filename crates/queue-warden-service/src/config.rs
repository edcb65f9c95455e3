//! Broker bindings discovered from numbered environment variable slots.
//!
//! Each binding occupies one `BROKER{i}_` slot, `i` in 1..=100. A slot
//! without a non-empty `BROKER{i}_NAME` is skipped. Beyond the well-known
//! keys (`NAME`, `TYPE`, `URL`, `USER`, `PASS`) every variable under the
//! prefix lands in `extras`, which is where backend-specific settings
//! like `CONSOLE_URL` or `REGION` live.

use std::collections::HashMap;
use tracing::info;

const MAX_BROKER_SLOTS: u32 = 100;

/// One configured broker binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub name: String,
    pub kind: String,
    pub url: String,
    pub user: String,
    pub pass: String,
    /// Every variable under the slot's prefix, well-known keys included.
    pub extras: HashMap<String, String>,
}

impl BrokerConfig {
    /// Backend-specific setting, empty string when absent.
    pub fn extra(&self, key: &str) -> &str {
        self.extras.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Scan the environment for configured broker slots.
pub fn discover_broker_configs() -> Vec<BrokerConfig> {
    let environment: Vec<(String, String)> = std::env::vars().collect();
    let configs = configs_from(&environment);

    info!(count = configs.len(), "Brokers to build");
    for config in &configs {
        info!(
            name = %config.name,
            kind = %config.kind,
            url = %config.url,
            user = %config.user,
            "Discovered broker configuration"
        );
    }
    configs
}

fn configs_from(environment: &[(String, String)]) -> Vec<BrokerConfig> {
    (1..=MAX_BROKER_SLOTS)
        .filter_map(|slot| {
            let prefix = format!("BROKER{slot}_");
            let extras = values_with_prefix(environment, &prefix);
            let name = extras.get("NAME")?;
            if name.is_empty() {
                return None;
            }
            Some(BrokerConfig {
                name: name.clone(),
                kind: extras.get("TYPE").cloned().unwrap_or_default(),
                url: extras.get("URL").cloned().unwrap_or_default(),
                user: extras.get("USER").cloned().unwrap_or_default(),
                pass: extras.get("PASS").cloned().unwrap_or_default(),
                extras,
            })
        })
        .collect()
}

fn values_with_prefix(
    environment: &[(String, String)],
    prefix: &str,
) -> HashMap<String, String> {
    environment
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
