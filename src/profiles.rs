//! Model profiles.
//!
//! Named LLM runtime bundles loaded from a TOML file:
//!
//! ```toml
//! [profiles.deepseek]
//! model = "deepseek-reasoner"
//! provider = "deepseek"
//! api_url = "https://api.deepseek.com"
//! api_key_env = "DEEPSEEK_API_KEY"
//! ```
//!
//! The agent hot-swaps its MCP child with a profile's settings. Loading
//! errors are returned as human-readable strings (never raised) so the
//! agent can surface them in a reply text instead of failing the prompt.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROFILES_FILE: &str = "model-profiles.toml";

/// A named LLM runtime bundle with the key already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub name: String,
    pub model: String,
    pub provider: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: HashMap<String, ProfileEntry>,
}

#[derive(Debug, Deserialize)]
struct ProfileEntry {
    model: Option<String>,
    provider: Option<String>,
    api_url: Option<String>,
    api_key: Option<String>,
    api_key_env: Option<String>,
}

/// Resolve the profiles file location: `ACP_MODEL_PROFILES_FILE` (absolute
/// or repo-root-relative), else `<repo-root>/model-profiles.toml`.
pub fn profiles_path<E>(repo_root: &Path, env: E) -> PathBuf
where
    E: Fn(&str) -> Option<String>,
{
    match env("ACP_MODEL_PROFILES_FILE").filter(|v| !v.trim().is_empty()) {
        Some(raw) => {
            let candidate = PathBuf::from(raw.trim());
            if candidate.is_absolute() {
                candidate
            } else {
                repo_root.join(candidate)
            }
        }
        None => repo_root.join(DEFAULT_PROFILES_FILE),
    }
}

/// Load and validate the profiles file.
///
/// Returns the map keyed by lower-cased profile name, or a human-readable
/// error string. `api_key_env` indirection is resolved through `env` at
/// load time; a missing variable leaves the key unset.
pub fn load_profiles<E>(path: &Path, env: E) -> Result<HashMap<String, ModelProfile>, String>
where
    E: Fn(&str) -> Option<String>,
{
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read profiles file {}: {err}", path.display()))?;

    let parsed: ProfilesFile = toml::from_str(&content)
        .map_err(|err| format!("could not parse profiles file {}: {err}", path.display()))?;

    if parsed.profiles.is_empty() {
        return Err(format!(
            "profiles file {} defines no [profiles.<name>] sections",
            path.display()
        ));
    }

    let mut profiles = HashMap::new();
    for (name, entry) in parsed.profiles {
        let model = entry
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| format!("profile '{name}' is missing the required key 'model'"))?
            .to_string();

        let api_key = entry.api_key.filter(|k| !k.trim().is_empty()).or_else(|| {
            entry
                .api_key_env
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .and_then(|var| env(var))
        });

        let key = name.trim().to_lowercase();
        profiles.insert(
            key.clone(),
            ModelProfile {
                name: key,
                model,
                provider: entry.provider.filter(|p| !p.trim().is_empty()),
                api_url: entry.api_url.filter(|u| !u.trim().is_empty()),
                api_key,
            },
        );
    }

    Ok(profiles)
}

/// Select a profile by name (exact, case-insensitive) or, failing that, by
/// an unambiguous model string. Multiple profiles sharing the model reject
/// with the candidate list.
pub fn select_profile<'a>(
    profiles: &'a HashMap<String, ModelProfile>,
    selector: &str,
) -> Result<&'a ModelProfile, String> {
    let wanted = selector.trim().to_lowercase();

    if let Some(profile) = profiles.get(&wanted) {
        return Ok(profile);
    }

    let mut candidates: Vec<&ModelProfile> = profiles
        .values()
        .filter(|profile| profile.model == selector.trim())
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    match candidates.len() {
        1 => Ok(candidates[0]),
        0 => Err(format!("no profile named '{selector}'")),
        _ => {
            let names: Vec<&str> = candidates.iter().map(|p| p.name.as_str()).collect();
            Err(format!(
                "model '{selector}' matches multiple profiles: {}",
                names.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_profiles(content: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model-profiles.toml");
        fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn loads_profiles_with_key_indirection() {
        let (_tmp, path) = write_profiles(
            r#"
[profiles.DeepSeek]
model = "deepseek-reasoner"
provider = "deepseek"
api_url = "https://api.deepseek.com"
api_key_env = "DEEPSEEK_API_KEY"

[profiles.fast]
model = "gpt-5-mini"
api_key = "inline-key"
"#,
        );

        let env = |key: &str| (key == "DEEPSEEK_API_KEY").then(|| "token-123".to_string());
        let profiles = load_profiles(&path, env).unwrap();

        let deepseek = &profiles["deepseek"];
        assert_eq!(deepseek.name, "deepseek");
        assert_eq!(deepseek.model, "deepseek-reasoner");
        assert_eq!(deepseek.provider.as_deref(), Some("deepseek"));
        assert_eq!(deepseek.api_key.as_deref(), Some("token-123"));

        assert_eq!(profiles["fast"].api_key.as_deref(), Some("inline-key"));
    }

    #[test]
    fn missing_model_is_a_readable_error() {
        let (_tmp, path) = write_profiles("[profiles.broken]\nprovider = \"x\"\n");
        let err = load_profiles(&path, |_| None).unwrap_err();
        assert!(err.contains("broken"));
        assert!(err.contains("model"));
    }

    #[test]
    fn unparseable_file_is_a_readable_error() {
        let (_tmp, path) = write_profiles("[profiles.broken]\nmodel = \n");
        let err = load_profiles(&path, |_| None).unwrap_err();
        assert!(err.contains("parse"));
    }

    #[test]
    fn missing_file_is_a_readable_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_profiles(&tmp.path().join("nope.toml"), |_| None).unwrap_err();
        assert!(err.contains("could not read"));
    }

    #[test]
    fn selects_by_name_then_by_model() {
        let (_tmp, path) = write_profiles(
            r#"
[profiles.one]
model = "model-a"

[profiles.two]
model = "model-b"

[profiles.three]
model = "model-b"
"#,
        );
        let profiles = load_profiles(&path, |_| None).unwrap();

        assert_eq!(select_profile(&profiles, "ONE").unwrap().model, "model-a");
        assert_eq!(select_profile(&profiles, "model-a").unwrap().name, "one");

        let err = select_profile(&profiles, "model-b").unwrap_err();
        assert!(err.contains("three"));
        assert!(err.contains("two"));

        assert!(select_profile(&profiles, "missing").is_err());
    }

    #[test]
    fn profiles_path_resolution() {
        let root = Path::new("/repo");

        let default = profiles_path(root, |_| None);
        assert_eq!(default, PathBuf::from("/repo/model-profiles.toml"));

        let absolute = profiles_path(root, |key: &str| {
            (key == "ACP_MODEL_PROFILES_FILE").then(|| "/etc/profiles.toml".to_string())
        });
        assert_eq!(absolute, PathBuf::from("/etc/profiles.toml"));

        let relative = profiles_path(root, |key: &str| {
            (key == "ACP_MODEL_PROFILES_FILE").then(|| "conf/p.toml".to_string())
        });
        assert_eq!(relative, PathBuf::from("/repo/conf/p.toml"));
    }
}
