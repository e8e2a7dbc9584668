//! Per-target options supplied as a JSON document with each request.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Environment variable consulted when the options carry no auth token.
pub const AUTH_TOKEN_ENV: &str = "FLY_ACCESS_TOKEN";

/// Machine size used when the options leave it unset.
pub const DEFAULT_MACHINE_SIZE: &str = "shared-cpu-4x";

/// Disk size in GB used when the options leave it unset.
pub const DEFAULT_DISK_SIZE_GB: u32 = 10;

/// Regions offered as suggestions in the target config manifest.
pub const REGIONS: &[&str] = &[
    "ams", "arn", "atl", "bog", "bom", "bos", "cdg", "den", "dfw", "ewr", "eze", "fra", "gdl",
    "gig", "gru", "hkg", "iad", "jnb", "lax", "lhr", "mad", "mia", "nrt", "ord", "otp", "phx",
    "qro", "scl", "sea", "sin", "sjc", "syd", "waw", "yul", "yyz",
];

#[derive(Deserialize)]
struct RawTargetOptions {
    #[serde(rename = "Region", default)]
    region: String,
    #[serde(rename = "Size", default)]
    size: String,
    #[serde(rename = "Disk Size", default)]
    disk_size: Option<u32>,
    #[serde(rename = "Org Slug", default)]
    org_slug: String,
    #[serde(rename = "Auth Token", default)]
    auth_token: Option<String>,
}

/// Resolved target configuration. Both the auth token and the organisation
/// slug are guaranteed non-empty.
#[derive(Clone, Eq, PartialEq, Serialize)]
pub struct TargetOptions {
    /// Region for the machine; empty lets the provider pick the nearest.
    #[serde(rename = "Region")]
    pub region: String,
    /// Machine size preset.
    #[serde(rename = "Size")]
    pub size: String,
    /// Volume size in GB.
    #[serde(rename = "Disk Size")]
    pub disk_size: u32,
    /// Organisation that owns the app.
    #[serde(rename = "Org Slug")]
    pub org_slug: String,
    #[serde(rename = "Auth Token")]
    auth_token: String,
}

impl TargetOptions {
    /// Parses options, falling back to [`AUTH_TOKEN_ENV`] for the token.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or a document that is
    /// not an object, and [`ConfigError::MissingField`] when the token or org
    /// slug is empty after resolution.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(json, |key| std::env::var(key).ok())
    }

    /// Parses options using `lookup` in place of the process environment.
    ///
    /// # Errors
    ///
    /// See [`TargetOptions::parse`].
    pub fn parse_with_env<F>(json: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ConfigError::Parse(String::from(
                "target options must be a JSON object",
            )));
        }
        let raw: RawTargetOptions = serde_json::from_value(value)?;

        let auth_token = raw
            .auth_token
            .filter(|token| !token.trim().is_empty())
            .or_else(|| lookup(AUTH_TOKEN_ENV))
            .map(|token| token.trim().to_owned())
            .unwrap_or_default();
        if auth_token.is_empty() {
            return Err(ConfigError::MissingField(format!(
                "auth token not set in target options or {AUTH_TOKEN_ENV}"
            )));
        }

        let org_slug = raw.org_slug.trim().to_owned();
        if org_slug.is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "org slug not set in target options",
            )));
        }

        let size = if raw.size.trim().is_empty() {
            DEFAULT_MACHINE_SIZE.to_owned()
        } else {
            raw.size.trim().to_owned()
        };

        Ok(Self {
            region: raw.region.trim().to_owned(),
            size,
            disk_size: raw
                .disk_size
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_DISK_SIZE_GB),
            org_slug,
            auth_token,
        })
    }

    /// Returns the resolved API token.
    #[must_use]
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Serialises the options back to the JSON shape they were parsed from.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialisation fails.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Debug for TargetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetOptions")
            .field("region", &self.region)
            .field("size", &self.size)
            .field("disk_size", &self.disk_size)
            .field("org_slug", &self.org_slug)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// Value type of a target option.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum OptionKind {
    /// Free-form string.
    String,
    /// Integer value.
    Int,
}

/// Describes one target option for the host orchestrator's UI.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TargetConfigProperty {
    /// Value type.
    #[serde(rename = "Type")]
    pub kind: OptionKind,
    /// Default rendered as a string, when one exists.
    #[serde(rename = "DefaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Human-readable description.
    #[serde(rename = "Description")]
    pub description: String,
    /// Whether input should be masked.
    #[serde(rename = "InputMasked")]
    pub input_masked: bool,
    /// Suggested values.
    #[serde(rename = "Suggestions", skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// Returns the manifest describing every accepted target option.
#[must_use]
pub fn target_config_manifest() -> BTreeMap<String, TargetConfigProperty> {
    let mut manifest = BTreeMap::new();
    manifest.insert(
        String::from("Region"),
        TargetConfigProperty {
            kind: OptionKind::String,
            default_value: None,
            description: String::from(
                "The region where the machine resides. If not specified, the nearest region is used.",
            ),
            input_masked: false,
            suggestions: REGIONS.iter().map(|region| (*region).to_owned()).collect(),
        },
    );
    manifest.insert(
        String::from("Size"),
        TargetConfigProperty {
            kind: OptionKind::String,
            default_value: Some(DEFAULT_MACHINE_SIZE.to_owned()),
            description: format!("The size of the machine. Default is {DEFAULT_MACHINE_SIZE}."),
            input_masked: false,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        String::from("Disk Size"),
        TargetConfigProperty {
            kind: OptionKind::Int,
            default_value: Some(DEFAULT_DISK_SIZE_GB.to_string()),
            description: String::from("The size of the disk in GB."),
            input_masked: false,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        String::from("Org Slug"),
        TargetConfigProperty {
            kind: OptionKind::String,
            default_value: None,
            description: String::from("The organization to create the machine in."),
            input_masked: false,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        String::from("Auth Token"),
        TargetConfigProperty {
            kind: OptionKind::String,
            default_value: None,
            description: format!(
                "If empty, the token is read from the {AUTH_TOKEN_ENV} environment variable."
            ),
            input_masked: true,
            suggestions: Vec::new(),
        },
    );
    manifest
}
