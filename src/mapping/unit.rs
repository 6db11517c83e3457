use crate::auth::AuthType;
use crate::config::types::deserialize_null_default;
use crate::plugin::PluginRef;
use crate::upstream::Destination;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One mapping file. Several units may contribute to the same version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingUnit {
    pub version: String,

    /// Default destination for endpoints that do not set their own.
    #[serde(default)]
    pub backend: Option<Destination>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub endpoints: Vec<EndpointConfig>,

    /// Action name → class identifier.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub actions: BTreeMap<String, String>,

    /// Filter name → class identifier.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: BTreeMap<String, String>,

    /// Status code → literal response body, for this version only.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub external: String,
    pub internal: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Space-separated placeholder names, aligned with `var_expression`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,

    /// Space-separated regex fragments, aligned with `var_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_expression: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub actions: Vec<PluginRef>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<PluginRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Destination>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl EndpointConfig {
    pub fn method_upper(&self) -> String {
        self.method.trim().to_ascii_uppercase()
    }
}

/// Parse one unit file; the format follows the extension.
pub fn parse_unit(path: &Path) -> Result<MappingUnit> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading mapping unit {}", path.display()))?;
    let unit: MappingUnit = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("parsing mapping unit {}", path.display()))?,
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("parsing mapping unit {}", path.display()))?,
        Some(ext) => anyhow::bail!("unsupported mapping format: .{ext} ({})", path.display()),
        None => anyhow::bail!("mapping unit {} has no extension", path.display()),
    };
    if unit.version.trim().is_empty() {
        anyhow::bail!("mapping unit {} has an empty version", path.display());
    }
    Ok(unit)
}

/// Whether a directory entry is a unit file the loader should pick up.
pub fn is_unit_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("toml") | Some("json")
        )
}
