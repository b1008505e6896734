/**
 * Header template resolution.
 *
 * Headers sent to the remote server come from a JSON template (flag, file or
 * environment variable), get `${VAR}` placeholders filled from the
 * environment, and finally take `--header k=v` overrides on top.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{debug, warn};
use regex::{Captures, Regex};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::config::{
    BridgeOptions, ConfigError, EnvSnapshot, Result, MCP_HEADER_FILE, MCP_HEADER_TEMPLATE,
};
use crate::utils::redact_header_value;

pub type HeaderTemplate = BTreeMap<String, String>;
pub type ResolvedHeaders = BTreeMap<String, String>;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex pattern"));

/// Where a header template was read from, used in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Cli(String),
    File(PathBuf),
    Env(String),
}

impl fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSource::Cli(_) => f.write_str("--header-template"),
            TemplateSource::File(path) => write!(f, "file {}", path.display()),
            TemplateSource::Env(_) => f.write_str(MCP_HEADER_TEMPLATE),
        }
    }
}

impl TemplateSource {
    /// Highest precedence source present: flag, then file, then inline env.
    pub fn select(
        cli_value: Option<&str>,
        header_file: Option<&Path>,
        env: &EnvSnapshot,
    ) -> Option<Self> {
        if let Some(raw) = cli_value.filter(|v| !v.trim().is_empty()) {
            return Some(TemplateSource::Cli(raw.to_string()));
        }

        let file = header_file
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| env.get_non_empty(MCP_HEADER_FILE).map(PathBuf::from));
        if let Some(path) = file {
            return Some(TemplateSource::File(path));
        }

        env.get_non_empty(MCP_HEADER_TEMPLATE)
            .map(|raw| TemplateSource::Env(raw.to_string()))
    }

    fn read(&self) -> Result<String> {
        match self {
            TemplateSource::Cli(raw) | TemplateSource::Env(raw) => Ok(raw.clone()),
            TemplateSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| ConfigError::TemplateRead {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

/// Load the header template from the highest precedence source.
///
/// Only the selected source is parsed. A broken source is an error, never a
/// reason to fall back to a lower one. No source at all yields an empty map.
pub fn load_template(
    cli_value: Option<&str>,
    header_file: Option<&Path>,
    env: &EnvSnapshot,
) -> Result<HeaderTemplate> {
    let Some(source) = TemplateSource::select(cli_value, header_file, env) else {
        debug!("No header template configured");
        return Ok(HeaderTemplate::new());
    };

    debug!("Loading header template from {}", source);
    let raw = source.read()?;
    parse_template(&raw, source)
}

/// Parse a JSON object into a template. Numbers and booleans are coerced to
/// their JSON text; null, arrays and objects are rejected.
pub fn parse_template(raw: &str, origin: TemplateSource) -> Result<HeaderTemplate> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(source) => return Err(ConfigError::TemplateParse { origin, source }),
    };

    let Value::Object(map) = value else {
        return Err(ConfigError::TemplateShape {
            origin,
            reason: "header template must be a JSON object".to_string(),
        });
    };

    let mut template = HeaderTemplate::new();
    for (key, value) in map {
        let text = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(ConfigError::TemplateShape {
                    origin,
                    reason: format!(
                        "value for {:?} must be a string, number or boolean, got {}",
                        key,
                        json_kind(&other)
                    ),
                })
            }
        };
        template.insert(key, text);
    }
    Ok(template)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Replace `${NAME}` placeholders with values from `env`.
///
/// Single pass per value: substituted text is not scanned again. Placeholders
/// naming unset variables are left as written.
pub fn apply_env(template: &HeaderTemplate, env: &EnvSnapshot) -> HeaderTemplate {
    let mut unresolved = BTreeSet::new();

    let resolved = template
        .iter()
        .map(|(key, value)| {
            let substituted = PLACEHOLDER.replace_all(value, |caps: &Captures| {
                let name = &caps[1];
                match env.get(name) {
                    Some(v) => v.to_string(),
                    None => {
                        unresolved.insert(name.to_string());
                        caps[0].to_string()
                    }
                }
            });
            (key.clone(), substituted.into_owned())
        })
        .collect();

    for name in unresolved {
        warn!("Header template references unset variable ${{{}}}, left as is", name);
    }
    resolved
}

/// Apply `--header` overrides in order; later entries for a key win.
pub fn merge_overrides(
    template: HeaderTemplate,
    overrides: &[(String, String)],
) -> ResolvedHeaders {
    let mut merged = template;
    for (key, value) in overrides {
        // Header names are case-insensitive on the wire
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Full pipeline: load, substitute, merge.
pub fn resolve_headers(options: &BridgeOptions, env: &EnvSnapshot) -> Result<ResolvedHeaders> {
    let template = load_template(
        options.header_template.as_deref(),
        options.header_file.as_deref(),
        env,
    )?;
    let headers = merge_overrides(apply_env(&template, env), &options.headers);

    for (key, value) in &headers {
        debug!("Header {}: {}", key, redact_header_value(key, value));
    }
    Ok(headers)
}

/// Parse a `key=value` header override. Splits on the first `=`.
pub fn parse_header_override(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("header name is empty in {:?}", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Convert resolved headers into a map the HTTP client accepts.
pub fn to_header_map(headers: &ResolvedHeaders) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
            name: key.clone(),
            reason: e.to_string(),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
            name: key.clone(),
            reason: e.to_string(),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}
