//! Carbon Black credential profiles.
//!
//! Profiles live in `./.carbonblack/credentials.response` or
//! `~/.carbonblack/credentials.response`, INI format, one section per
//! profile. The reserved `cbbackend` section holds defaults and is not a
//! profile. The file format is fixed by the cbapi ecosystem, so it is parsed
//! here instead of going through a config crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use leet_backend::cb::CbProfile;
use tracing::debug;

const CREDENTIALS_DIR: &str = ".carbonblack";
const CREDENTIALS_FILE: &str = "credentials.response";
const RESERVED_SECTION: &str = "cbbackend";

/// One parsed profile section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialProfile {
    pub name: String,
    pub url: String,
    pub token: String,
    pub ssl_verify: bool,
}

impl CredentialProfile {
    pub fn into_cb_profile(self, max_sessions: usize) -> CbProfile {
        CbProfile {
            name: self.name,
            url: self.url,
            token: self.token,
            ssl_verify: self.ssl_verify,
            max_sessions,
        }
    }
}

fn credential_files() -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from(CREDENTIALS_DIR).join(CREDENTIALS_FILE)];
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(CREDENTIALS_DIR).join(CREDENTIALS_FILE));
    }
    files
}

/// All profiles found across the credential file locations. Earlier
/// locations win on duplicate names.
pub fn load_profiles() -> Result<Vec<CredentialProfile>> {
    let mut profiles: Vec<CredentialProfile> = Vec::new();
    for path in credential_files() {
        debug!("searching CB profiles on '{}'", path.display());
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        for profile in parse_profiles(&content)? {
            if !profiles.iter().any(|known| known.name == profile.name) {
                profiles.push(profile);
            }
        }
    }
    Ok(profiles)
}

/// Resolve the requested profile names; `all` expands to every profile on
/// disk.
pub fn expand(requested: &[String]) -> Result<Vec<CredentialProfile>> {
    let known = load_profiles()?;

    if requested.iter().any(|name| name == "all") {
        debug!(
            "requested to read 'all' profiles, found: {}",
            known
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
        return Ok(known);
    }

    let mut selected = Vec::new();
    for name in requested {
        match known.iter().find(|profile| &profile.name == name) {
            Some(profile) => selected.push(profile.clone()),
            None => bail!("profile '{name}' is not present in any credentials file"),
        }
    }
    Ok(selected)
}

/// Parse an INI credentials file into profiles.
fn parse_profiles(content: &str) -> Result<Vec<CredentialProfile>> {
    let mut profiles = Vec::new();
    for (section, values) in parse_ini(content)? {
        if section.eq_ignore_ascii_case(RESERVED_SECTION) {
            continue;
        }
        let url = match values.get("url") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => bail!("profile '{section}' has no url"),
        };
        let token = match values.get("token") {
            Some(token) => token.clone(),
            None => bail!("profile '{section}' has no token"),
        };
        let ssl_verify = values
            .get("ssl_verify")
            .map(|raw| parse_bool(raw))
            .unwrap_or(true);
        profiles.push(CredentialProfile {
            name: section,
            url,
            token,
            ssl_verify,
        });
    }
    Ok(profiles)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

fn parse_ini(content: &str) -> Result<Vec<(String, BTreeMap<String, String>)>> {
    let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();
    for (number, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            sections.push((name.trim().to_string(), BTreeMap::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("credentials line {} is not `key=value`: {raw_line:?}", number + 1);
        };
        let Some((_, values)) = sections.last_mut() else {
            bail!("credentials line {} appears before any [section]", number + 1);
        };
        values.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# main instance
[cbbackend]
ssl_verify=True

[default]
url=https://cb.example.com/
token=abcdef
ssl_verify=False

[dmz]
url=https://dmz.example.com
token=123456
"#;

    #[test]
    fn profiles_skip_the_reserved_section() {
        let profiles = parse_profiles(SAMPLE).unwrap();
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["default", "dmz"]);
    }

    #[test]
    fn profile_fields_are_parsed() {
        let profiles = parse_profiles(SAMPLE).unwrap();
        let default = &profiles[0];
        assert_eq!(default.url, "https://cb.example.com");
        assert_eq!(default.token, "abcdef");
        assert!(!default.ssl_verify);
        // ssl_verify defaults to on
        assert!(profiles[1].ssl_verify);
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = parse_profiles("[broken]\ntoken=x\n").unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_ini("[a]\nnot a pair\n").is_err());
        assert!(parse_ini("orphan=1\n").is_err());
    }
}
