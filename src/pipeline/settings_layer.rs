use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use super::model_client::{DEFAULT_MODEL_BINARY, DEFAULT_MODEL_NAME, DEFAULT_MODEL_TIMEOUT_SECS};
use super::tool_adapters::{DEFAULT_REMBG_MODEL, DEFAULT_REMBG_PYTHON};

pub const DEFAULT_BACKGROUNDS_DIR: &str = "backgrounds";
pub const DEFAULT_BIND: &str = "127.0.0.1:8790";
pub const MAX_MODEL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_SESSIONS: usize = 256;

pub const ENV_BACKGROUNDS_DIR: &str = "BACKDROP_BACKGROUNDS_DIR";
pub const ENV_MODEL: &str = "BACKDROP_MODEL";
pub const ENV_MODEL_BINARY: &str = "BACKDROP_MODEL_BINARY";
pub const ENV_MODEL_TIMEOUT_SECS: &str = "BACKDROP_MODEL_TIMEOUT_SECS";
pub const ENV_REMBG_PYTHON: &str = "BACKDROP_REMBG_PYTHON";
pub const ENV_BIND: &str = "BACKDROP_BIND";
pub const ENV_MAX_SESSIONS: &str = "BACKDROP_MAX_SESSIONS";

/// Partially specified settings from one source (file, environment, CLI).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentSettingsOverlay {
    pub backgrounds_dir: Option<String>,
    pub model_binary: Option<String>,
    pub model_name: Option<String>,
    pub model_timeout_secs: Option<u64>,
    pub rembg_python: Option<String>,
    pub rembg_model: Option<String>,
    pub bind: Option<String>,
    pub max_sessions: Option<usize>,
}

/// Fully resolved settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub backgrounds_dir: PathBuf,
    pub model_binary: String,
    pub model_name: String,
    pub model_timeout_secs: u64,
    pub rembg_python: String,
    pub rembg_model: String,
    pub bind: String,
    pub max_sessions: usize,
}

impl AgentSettings {
    /// Relative `backgrounds_dir` values resolve against `app_root`.
    pub fn resolve(app_root: &Path, overlay: &AgentSettingsOverlay) -> Self {
        let backgrounds_dir = PathBuf::from(
            overlay
                .backgrounds_dir
                .as_deref()
                .unwrap_or(DEFAULT_BACKGROUNDS_DIR),
        );
        Self {
            backgrounds_dir: if backgrounds_dir.is_absolute() {
                backgrounds_dir
            } else {
                app_root.join(backgrounds_dir)
            },
            model_binary: overlay
                .model_binary
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_MODEL_BINARY)),
            model_name: overlay
                .model_name
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_MODEL_NAME)),
            model_timeout_secs: overlay
                .model_timeout_secs
                .unwrap_or(DEFAULT_MODEL_TIMEOUT_SECS),
            rembg_python: overlay
                .rembg_python
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_REMBG_PYTHON)),
            rembg_model: overlay
                .rembg_model
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_REMBG_MODEL)),
            bind: overlay
                .bind
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_BIND)),
            max_sessions: overlay.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentSettingsError {
    #[error("failed to read agent settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse agent settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse agent settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("agent settings root must be an object")]
    RootMustBeObject,
    #[error("agent settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("agent settings field '{field}' is out of range: {message}")]
    OutOfRange { field: String, message: String },
}

/// Loads and resolves settings: defaults, then the settings file, then the
/// environment, then `overrides` (usually CLI flags).
pub fn load_agent_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
    overrides: &AgentSettingsOverlay,
) -> Result<AgentSettings, AgentSettingsError> {
    let file = load_agent_settings_file(app_root, explicit_path)?;
    let env = overlay_from_env(|key| std::env::var(key).ok())?;
    let merged = merge_agent_settings_overlays(&file, &env, overrides);
    Ok(AgentSettings::resolve(app_root, &merged))
}

pub fn load_agent_settings_file(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<AgentSettingsOverlay, AgentSettingsError> {
    if let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
    {
        return load_optional_overlay_by_extension(path.as_path());
    }

    let toml_path = app_root.join("config/agent.settings.toml");
    if toml_path.exists() {
        return load_optional_overlay_from_toml_path(toml_path.as_path());
    }
    load_optional_overlay_from_json_path(app_root.join("config/agent.settings.json").as_path())
}

/// Reads overrides through `lookup` so tests need not touch process env.
pub fn overlay_from_env<F>(lookup: F) -> Result<AgentSettingsOverlay, AgentSettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let model_timeout_secs = match get(ENV_MODEL_TIMEOUT_SECS) {
        Some(raw) => {
            let secs = raw
                .parse::<u64>()
                .map_err(|_| AgentSettingsError::InvalidFieldType {
                    field: String::from(ENV_MODEL_TIMEOUT_SECS),
                })?;
            Some(check_timeout(secs, ENV_MODEL_TIMEOUT_SECS)?)
        }
        None => None,
    };
    let max_sessions = match get(ENV_MAX_SESSIONS) {
        Some(raw) => {
            let max = raw
                .parse::<usize>()
                .map_err(|_| AgentSettingsError::InvalidFieldType {
                    field: String::from(ENV_MAX_SESSIONS),
                })?;
            Some(check_max_sessions(max, ENV_MAX_SESSIONS)?)
        }
        None => None,
    };
    Ok(AgentSettingsOverlay {
        backgrounds_dir: get(ENV_BACKGROUNDS_DIR),
        model_binary: get(ENV_MODEL_BINARY),
        model_name: get(ENV_MODEL),
        model_timeout_secs,
        rembg_python: get(ENV_REMBG_PYTHON),
        rembg_model: None,
        bind: get(ENV_BIND),
        max_sessions,
    })
}

/// Later layers win: `overrides` over `env` over `file`.
pub fn merge_agent_settings_overlays(
    file: &AgentSettingsOverlay,
    env: &AgentSettingsOverlay,
    overrides: &AgentSettingsOverlay,
) -> AgentSettingsOverlay {
    AgentSettingsOverlay {
        backgrounds_dir: choose_string(
            overrides.backgrounds_dir.as_deref(),
            env.backgrounds_dir.as_deref(),
            file.backgrounds_dir.as_deref(),
        ),
        model_binary: choose_string(
            overrides.model_binary.as_deref(),
            env.model_binary.as_deref(),
            file.model_binary.as_deref(),
        ),
        model_name: choose_string(
            overrides.model_name.as_deref(),
            env.model_name.as_deref(),
            file.model_name.as_deref(),
        ),
        model_timeout_secs: overrides
            .model_timeout_secs
            .or(env.model_timeout_secs)
            .or(file.model_timeout_secs),
        rembg_python: choose_string(
            overrides.rembg_python.as_deref(),
            env.rembg_python.as_deref(),
            file.rembg_python.as_deref(),
        ),
        rembg_model: choose_string(
            overrides.rembg_model.as_deref(),
            env.rembg_model.as_deref(),
            file.rembg_model.as_deref(),
        ),
        bind: choose_string(
            overrides.bind.as_deref(),
            env.bind.as_deref(),
            file.bind.as_deref(),
        ),
        max_sessions: overrides
            .max_sessions
            .or(env.max_sessions)
            .or(file.max_sessions),
    }
}

pub fn parse_agent_settings_overlay_json(
    value: &Value,
) -> Result<AgentSettingsOverlay, AgentSettingsError> {
    let root = value
        .as_object()
        .ok_or(AgentSettingsError::RootMustBeObject)?;

    let mut out = AgentSettingsOverlay::default();
    if let Some(v) = root.get("backgrounds_dir") {
        out.backgrounds_dir = Some(parse_string(v, "backgrounds_dir")?);
    }
    if let Some(model) = root.get("model") {
        let model = section(model, "model")?;
        if let Some(v) = model.get("binary") {
            out.model_binary = Some(parse_string(v, "model.binary")?);
        }
        if let Some(v) = model.get("name") {
            out.model_name = Some(parse_string(v, "model.name")?);
        }
        if let Some(v) = model.get("timeout_secs") {
            let secs = v
                .as_u64()
                .ok_or_else(|| AgentSettingsError::InvalidFieldType {
                    field: String::from("model.timeout_secs"),
                })?;
            out.model_timeout_secs = Some(check_timeout(secs, "model.timeout_secs")?);
        }
    }
    if let Some(bg_remove) = root.get("bg_remove") {
        let bg_remove = section(bg_remove, "bg_remove")?;
        if let Some(v) = bg_remove.get("python_bin") {
            out.rembg_python = Some(parse_string(v, "bg_remove.python_bin")?);
        }
        if let Some(v) = bg_remove.get("model") {
            out.rembg_model = Some(parse_string(v, "bg_remove.model")?);
        }
    }
    if let Some(server) = root.get("server") {
        let server = section(server, "server")?;
        if let Some(v) = server.get("bind") {
            out.bind = Some(parse_string(v, "server.bind")?);
        }
        if let Some(v) = server.get("max_sessions") {
            let max = v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| AgentSettingsError::InvalidFieldType {
                    field: String::from("server.max_sessions"),
                })?;
            out.max_sessions = Some(check_max_sessions(max, "server.max_sessions")?);
        }
    }
    Ok(out)
}

fn load_optional_overlay_by_extension(
    path: &Path,
) -> Result<AgentSettingsOverlay, AgentSettingsError> {
    match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "toml" => load_optional_overlay_from_toml_path(path),
        _ => load_optional_overlay_from_json_path(path),
    }
}

fn load_optional_overlay_from_json_path(
    path: &Path,
) -> Result<AgentSettingsOverlay, AgentSettingsError> {
    if !path.exists() {
        return Ok(AgentSettingsOverlay::default());
    }
    let raw = read_settings_file(path)?;
    let parsed = serde_json::from_str::<Value>(raw.as_str()).map_err(|error| {
        AgentSettingsError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    parse_agent_settings_overlay_json(&parsed)
}

fn load_optional_overlay_from_toml_path(
    path: &Path,
) -> Result<AgentSettingsOverlay, AgentSettingsError> {
    if !path.exists() {
        return Ok(AgentSettingsOverlay::default());
    }
    let raw = read_settings_file(path)?;
    let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
        AgentSettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    let json_value =
        serde_json::to_value(parsed).map_err(|error| AgentSettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_agent_settings_overlay_json(&json_value)
}

fn read_settings_file(path: &Path) -> Result<String, AgentSettingsError> {
    fs::read_to_string(path).map_err(|error| AgentSettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn section<'a>(
    value: &'a Value,
    field: &str,
) -> Result<&'a serde_json::Map<String, Value>, AgentSettingsError> {
    value
        .as_object()
        .ok_or_else(|| AgentSettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn check_timeout(secs: u64, field: &str) -> Result<u64, AgentSettingsError> {
    if (1..=MAX_MODEL_TIMEOUT_SECS).contains(&secs) {
        Ok(secs)
    } else {
        Err(AgentSettingsError::OutOfRange {
            field: field.to_string(),
            message: format!("expected 1..={MAX_MODEL_TIMEOUT_SECS}, got {secs}"),
        })
    }
}

fn check_max_sessions(max: usize, field: &str) -> Result<usize, AgentSettingsError> {
    if max == 0 {
        return Err(AgentSettingsError::OutOfRange {
            field: field.to_string(),
            message: String::from("expected at least 1 session"),
        });
    }
    Ok(max)
}

fn choose_string(a: Option<&str>, b: Option<&str>, c: Option<&str>) -> Option<String> {
    a.or(b).or(c).map(str::to_string)
}

fn parse_string(value: &Value, field: &str) -> Result<String, AgentSettingsError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| AgentSettingsError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(AgentSettingsError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}
