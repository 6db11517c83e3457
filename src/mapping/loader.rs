use super::table::RuleKey;
use super::unit::{is_unit_file, parse_unit, EndpointConfig, MappingUnit};
use crate::config::types::deserialize_null_default;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// All units of one version merged together. This is the value published
/// to the replicated store, keyed by version. Every endpoint carries its
/// resolved backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDefinition {
    pub version: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub actions: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub errors: BTreeMap<u16, String>,
}

impl VersionDefinition {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            endpoints: Vec::new(),
            actions: BTreeMap::new(),
            filters: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }
}

/// Parse every unit file in `dir` (sorted by file name) and merge them per
/// version. Returns definitions ordered by version name.
pub fn load_directory(dir: &Path) -> Result<Vec<VersionDefinition>> {
    if !dir.is_dir() {
        anyhow::bail!("mapping directory {} does not exist", dir.display());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if is_unit_file(&path) {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut units = Vec::with_capacity(paths.len());
    for path in &paths {
        let unit = parse_unit(path)?;
        tracing::debug!(
            file = %path.display(),
            version = %unit.version,
            endpoints = unit.endpoints.len(),
            "mapping: parsed unit"
        );
        units.push((path.display().to_string(), unit));
    }

    merge_units(units)
}

/// Merge units in the given order. Two endpoints of one version with the
/// same method and external template abort the merge.
pub fn merge_units(units: Vec<(String, MappingUnit)>) -> Result<Vec<VersionDefinition>> {
    let mut merged: BTreeMap<String, VersionDefinition> = BTreeMap::new();
    let mut keys: BTreeMap<String, HashSet<RuleKey>> = BTreeMap::new();

    for (origin, unit) in units {
        let version = unit.version.trim().to_string();
        // The version is a path segment and a replicated key of its own.
        if version.is_empty() || version.contains('/') {
            anyhow::bail!("{}: invalid version name '{}'", origin, unit.version);
        }
        let def = merged
            .entry(version.clone())
            .or_insert_with(|| VersionDefinition::new(&version));
        let seen = keys.entry(version.clone()).or_default();

        for mut ep in unit.endpoints {
            let key = RuleKey {
                method: ep.method_upper(),
                external: ep.external.clone(),
            };
            if !seen.insert(key.clone()) {
                anyhow::bail!(
                    "{}: duplicate endpoint {} in version '{}'",
                    origin,
                    key,
                    version
                );
            }
            if ep.backend.is_none() {
                ep.backend = unit.backend.clone();
            }
            if ep.backend.is_none() {
                anyhow::bail!("{}: endpoint {} has no backend", origin, key);
            }
            ep.method = key.method;
            def.endpoints.push(ep);
        }

        merge_table(&mut def.actions, unit.actions, &origin, "action")?;
        merge_table(&mut def.filters, unit.filters, &origin, "filter")?;

        for (code, body) in unit.errors {
            let status = parse_status(&code).with_context(|| format!("{}: errors", origin))?;
            if let Some(prev) = def.errors.insert(status, body.clone()) {
                if prev != body {
                    anyhow::bail!(
                        "{}: conflicting error override for {} in version '{}'",
                        origin,
                        status,
                        version
                    );
                }
            }
        }
    }

    Ok(merged.into_values().collect())
}

fn merge_table(
    into: &mut BTreeMap<String, String>,
    from: BTreeMap<String, String>,
    origin: &str,
    what: &str,
) -> Result<()> {
    for (name, class) in from {
        match into.get(&name) {
            Some(existing) if *existing != class => anyhow::bail!(
                "{}: {} '{}' bound to both '{}' and '{}'",
                origin,
                what,
                name,
                existing,
                class
            ),
            Some(_) => {}
            None => {
                into.insert(name, class);
            }
        }
    }
    Ok(())
}

fn parse_status(code: &str) -> Result<u16> {
    let status: u16 = code
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a status code", code))?;
    if !(100..=999).contains(&status) {
        anyhow::bail!("'{}' is not a status code", code);
    }
    Ok(status)
}

#[derive(Debug, Default, Deserialize)]
struct ErrorFile {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    errors: BTreeMap<String, String>,
}

/// Read the global error override file (`errors` table of status → body).
pub fn load_error_file(path: &Path) -> Result<BTreeMap<u16, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading error overrides {}", path.display()))?;
    let file: ErrorFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        Some(ext) => anyhow::bail!("unsupported error override format: .{ext}"),
        None => anyhow::bail!("error override file {} has no extension", path.display()),
    };
    file.errors
        .into_iter()
        .map(|(code, body)| parse_status(&code).map(|status| (status, body)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const UNIT_A: &str = r#"
version = "v1"
backend = { host = "127.0.0.1", port = 8080 }

[[endpoints]]
external = "/me"
internal = "/customer/{customerId}"
"#;

    const UNIT_B: &str = r#"
version = "v1"
backend = { host = "127.0.0.1", port = 9090 }

[[endpoints]]
external = "/orders"
internal = "/orders"
method = "post"
"#;

    const UNIT_B_DUP: &str = r#"
version = "v1"
backend = { host = "127.0.0.1", port = 9090 }

[[endpoints]]
external = "/me"
internal = "/other"
"#;

    #[test]
    fn test_units_of_one_version_are_merged_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20-orders.toml"), UNIT_B).unwrap();
        fs::write(dir.path().join("10-me.toml"), UNIT_A).unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let defs = load_directory(dir.path()).unwrap();
        assert_eq!(defs.len(), 1);
        let v1 = &defs[0];
        assert_eq!(v1.endpoints.len(), 2);
        assert_eq!(v1.endpoints[0].external, "/me");
        assert_eq!(v1.endpoints[0].backend.as_ref().unwrap().port, 8080);
        assert_eq!(v1.endpoints[1].method, "POST");
        assert_eq!(v1.endpoints[1].backend.as_ref().unwrap().port, 9090);
    }

    #[test]
    fn test_duplicate_across_units_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), UNIT_A).unwrap();
        fs::write(dir.path().join("b.toml"), UNIT_B_DUP).unwrap();

        let err = load_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate endpoint GET /me"), "{err}");
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_directory(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_endpoint_without_backend_is_rejected() {
        let unit: MappingUnit = toml::from_str(
            r#"
version = "v1"
[[endpoints]]
external = "/x"
internal = "/x"
"#,
        )
        .unwrap();
        assert!(merge_units(vec![("u".into(), unit)]).is_err());
    }

    #[test]
    fn test_version_name_must_be_one_segment() {
        for bad in ["", "  ", "v1/beta", "meta/commit"] {
            let unit: MappingUnit = toml::from_str(&format!("version = \"{}\"\n", bad)).unwrap();
            assert!(merge_units(vec![("u".into(), unit)]).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_conflicting_plugin_names_are_rejected() {
        let a: MappingUnit = toml::from_str("version = \"v1\"\n[actions]\nX = \"a.One\"\n").unwrap();
        let b: MappingUnit = toml::from_str("version = \"v1\"\n[actions]\nX = \"a.Two\"\n").unwrap();
        let same: MappingUnit = toml::from_str("version = \"v1\"\n[actions]\nX = \"a.One\"\n").unwrap();

        assert!(merge_units(vec![("a".into(), a.clone()), ("b".into(), b)]).is_err());
        assert!(merge_units(vec![("a".into(), a), ("c".into(), same)]).is_ok());
    }

    #[test]
    fn test_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.toml");
        fs::write(&path, "[errors]\n404 = 'gone'\n500 = 'oops'\n").unwrap();
        let errors = load_error_file(&path).unwrap();
        assert_eq!(errors.get(&404).map(String::as_str), Some("gone"));
        assert_eq!(errors.len(), 2);

        fs::write(&path, "[errors]\nabc = 'x'\n").unwrap();
        assert!(load_error_file(&path).is_err());
    }

    #[test]
    fn test_definition_round_trips_through_json() {
        let unit: MappingUnit = toml::from_str(UNIT_A).unwrap();
        let mut unit = unit;
        unit.errors.insert("404".into(), "nope".into());
        let defs = merge_units(vec![("a".into(), unit)]).unwrap();

        let json = serde_json::to_string(&defs[0]).unwrap();
        let back: VersionDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, defs[0]);
    }
}
