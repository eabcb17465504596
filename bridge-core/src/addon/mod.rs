//! Wrapped addon registry and upstream response rewriting.

mod store;
mod wrapper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{AddonStore, StoreError};
pub use wrapper::{WrapError, Wrapper};

/// How an addon's upstream JSON is obtained.
///
/// `Global` means "use the system default" and is only valid as a per-addon
/// setting, never as the global default itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Global,
    SwFallback,
    TabRelay,
    SwOnly,
    Direct,
    Proxy,
}

impl FetchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchMethod::Global => "global",
            FetchMethod::SwFallback => "sw_fallback",
            FetchMethod::TabRelay => "tab_relay",
            FetchMethod::SwOnly => "sw_only",
            FetchMethod::Direct => "direct",
            FetchMethod::Proxy => "proxy",
        }
    }

    /// Resolves `Global` to the provided default.
    pub fn resolve(self, default: FetchMethod) -> FetchMethod {
        if self == FetchMethod::Global {
            default
        } else {
            self
        }
    }
}

impl Default for FetchMethod {
    fn default() -> Self {
        FetchMethod::Global
    }
}

impl std::str::FromStr for FetchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(FetchMethod::Global),
            "sw_fallback" => Ok(FetchMethod::SwFallback),
            "tab_relay" => Ok(FetchMethod::TabRelay),
            "sw_only" => Ok(FetchMethod::SwOnly),
            "direct" => Ok(FetchMethod::Direct),
            "proxy" => Ok(FetchMethod::Proxy),
            other => Err(format!("unknown fetch method: {other}")),
        }
    }
}

impl std::fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the bridge has been able to reach the addon upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Blocked,
    #[default]
    Unknown,
}

/// A registered upstream addon.
///
/// The pair (`id`, `original_url`) is immutable once created; `name` starts
/// empty and is backfilled after the first successful manifest fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedAddon {
    pub id: String,
    pub original_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fetch_method: FetchMethod,
    #[serde(default)]
    pub fetch_status: FetchStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_method_serde_names() {
        assert_eq!(
            serde_json::to_string(&FetchMethod::SwFallback).unwrap(),
            "\"sw_fallback\""
        );
        assert_eq!(
            serde_json::from_str::<FetchMethod>("\"tab_relay\"").unwrap(),
            FetchMethod::TabRelay
        );
    }

    #[test]
    fn test_fetch_method_resolve_global() {
        assert_eq!(
            FetchMethod::Global.resolve(FetchMethod::Direct),
            FetchMethod::Direct
        );
        assert_eq!(
            FetchMethod::Proxy.resolve(FetchMethod::Direct),
            FetchMethod::Proxy
        );
    }

    #[test]
    fn test_wrapped_addon_uses_camel_case() {
        let addon = WrappedAddon {
            id: "abcd1234".to_string(),
            original_url: "http://addon.example/manifest.json".to_string(),
            name: String::new(),
            fetch_method: FetchMethod::Global,
            fetch_status: FetchStatus::Unknown,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&addon).unwrap();
        assert!(json.get("originalUrl").is_some());
        assert!(json.get("fetchMethod").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
