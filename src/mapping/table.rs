use super::loader::VersionDefinition;
use super::pattern::{compile_pattern, CompiledPattern};
use crate::auth::AuthType;
use crate::plugin::{PluginRegistry, ResolvedAction, ResolvedFilter};
use crate::upstream::Destination;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Rule identity within a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub method: String,
    pub external: String,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.external)
    }
}

/// A compiled endpoint mapping. Immutable once built.
#[derive(Debug)]
pub struct EndpointRule {
    pub key: RuleKey,
    pub pattern: CompiledPattern,
    pub internal: String,
    pub destination: Destination,
    pub auth_type: Option<AuthType>,
    pub scope: Option<String>,
    pub actions: Vec<ResolvedAction>,
    pub filters: Vec<ResolvedFilter>,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub rule: Arc<EndpointRule>,
    /// Internal path with captures substituted and the query appended.
    pub internal_uri: String,
    pub variables: Vec<(String, String)>,
}

/// All rules of one version, in load order.
#[derive(Debug)]
pub struct VersionTable {
    pub version: String,
    pub rules: Vec<Arc<EndpointRule>>,
    pub errors: HashMap<u16, String>,
}

impl VersionTable {
    pub fn compile(def: &VersionDefinition, plugins: &PluginRegistry) -> Result<Self> {
        let mut seen = HashSet::with_capacity(def.endpoints.len());
        let mut rules = Vec::with_capacity(def.endpoints.len());

        for ep in &def.endpoints {
            let key = RuleKey {
                method: ep.method_upper(),
                external: ep.external.clone(),
            };
            if !seen.insert(key.clone()) {
                anyhow::bail!("version '{}': duplicate endpoint {}", def.version, key);
            }

            let ctx = |e: anyhow::Error| anyhow::anyhow!("version '{}', {}: {}", def.version, key, e);

            let pattern = compile_pattern(
                &ep.external,
                ep.var_name.as_deref(),
                ep.var_expression.as_deref(),
            )
            .map_err(ctx)?;

            let destination = ep
                .backend
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no backend"))
                .and_then(validate_destination)
                .map_err(ctx)?;

            let actions = ep
                .actions
                .iter()
                .map(|r| plugins.resolve_action(r, &def.actions))
                .collect::<Result<Vec<_>>>()
                .map_err(ctx)?;
            let filters = ep
                .filters
                .iter()
                .map(|r| plugins.resolve_filter(r, &def.filters))
                .collect::<Result<Vec<_>>>()
                .map_err(ctx)?;

            rules.push(Arc::new(EndpointRule {
                key,
                pattern,
                internal: ep.internal.clone(),
                destination,
                auth_type: ep.auth_type,
                scope: ep.scope.clone().filter(|s| !s.trim().is_empty()),
                actions,
                filters,
            }));
        }

        Ok(Self {
            version: def.version.clone(),
            rules,
            errors: def.errors.iter().map(|(k, v)| (*k, v.clone())).collect(),
        })
    }

    /// First rule, in load order, whose method is equal and whose pattern
    /// matches `path`. `path` must already be percent-decoded and query-free.
    pub fn lookup(&self, method: &str, path: &str, query: Option<&str>) -> Option<ResolvedEndpoint> {
        for rule in &self.rules {
            if !rule.key.method.eq_ignore_ascii_case(method) {
                continue;
            }
            let Some(captures) = rule.pattern.captures(path) else {
                continue;
            };

            let variables: Vec<(String, String)> = captures
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            let internal_uri = expand_internal(&rule.internal, &variables, query);

            return Some(ResolvedEndpoint {
                rule: rule.clone(),
                internal_uri,
                variables,
            });
        }
        None
    }
}

fn validate_destination(mut d: Destination) -> Result<Destination> {
    d.scheme = d.scheme.to_ascii_lowercase();
    if d.scheme != "http" && d.scheme != "https" {
        anyhow::bail!("unsupported backend scheme '{}'", d.scheme);
    }
    if d.host.trim().is_empty() {
        anyhow::bail!("backend host is empty");
    }
    if d.port == 0 {
        anyhow::bail!("backend port is 0");
    }
    Ok(d)
}

/// Substitute `{name}` placeholders and append the original query string.
/// Captured values are decoded, so they are percent-encoded again on the
/// way in. Placeholders without a captured value are left for actions to fill.
pub fn expand_internal(template: &str, variables: &[(String, String)], query: Option<&str>) -> String {
    let mut uri = template.to_string();
    for (name, value) in variables {
        let placeholder = format!("{{{}}}", name);
        if uri.contains(&placeholder) {
            uri = uri.replace(&placeholder, &urlencoding::encode(value));
        }
    }
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        uri.push(if uri.contains('?') { '&' } else { '?' });
        uri.push_str(q);
    }
    uri
}

/// One generation of the compiled mapping configuration. Requests load it
/// once and keep the `Arc` for their whole lifetime.
#[derive(Debug)]
pub struct MappingSnapshot {
    pub generation: u64,
    pub versions: BTreeMap<String, Arc<VersionTable>>,
    pub global_errors: HashMap<u16, String>,
    pub default_version: Option<String>,
    pub created_at: SystemTime,
}

impl MappingSnapshot {
    pub fn empty(default_version: Option<String>) -> Self {
        Self {
            generation: 0,
            versions: BTreeMap::new(),
            global_errors: HashMap::new(),
            default_version,
            created_at: SystemTime::now(),
        }
    }

    /// Compile every definition. Any failure rejects the whole snapshot.
    pub fn compile(
        defs: &[VersionDefinition],
        global_errors: &BTreeMap<u16, String>,
        plugins: &PluginRegistry,
        default_version: Option<String>,
        generation: u64,
    ) -> Result<Self> {
        let mut versions = BTreeMap::new();
        for def in defs {
            let table = VersionTable::compile(def, plugins)?;
            if versions.insert(def.version.clone(), Arc::new(table)).is_some() {
                anyhow::bail!("version '{}' defined twice", def.version);
            }
        }
        Ok(Self {
            generation,
            versions,
            global_errors: global_errors.iter().map(|(k, v)| (*k, v.clone())).collect(),
            default_version,
            created_at: SystemTime::now(),
        })
    }

    /// Pick the version for `path`: a leading segment naming a loaded
    /// version is selected and stripped; otherwise the default version.
    pub fn select_version<'p>(&self, path: &'p str) -> Option<(Arc<VersionTable>, &'p str)> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (first, rest) = match trimmed.find('/') {
            Some(i) => (&trimmed[..i], &trimmed[i..]),
            None => (trimmed, "/"),
        };
        if let Some(table) = self.versions.get(first) {
            return Some((table.clone(), rest));
        }
        let default = self.default_version.as_deref()?;
        self.versions.get(default).map(|t| (t.clone(), path))
    }

    /// Version-level override first, then global.
    pub fn error_override<'a>(&'a self, version: Option<&'a VersionTable>, status: u16) -> Option<&'a str> {
        version
            .and_then(|v| v.errors.get(&status))
            .or_else(|| self.global_errors.get(&status))
            .map(String::as_str)
    }

    pub fn endpoint_count(&self) -> usize {
        self.versions.values().map(|v| v.rules.len()).sum()
    }
}
