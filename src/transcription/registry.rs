//! # Model Registry
//!
//! Static mapping from region key to the fine-tuned model serving that region.
//! Built once at startup from the embedded `regions.toml` (or a replacement
//! file named in configuration) and read-only afterwards.
//!
//! ## Lookup rules:
//! - exact key match first
//! - then ASCII case-insensitive match ("malaysia" finds "Malaysia")
//! - unknown keys are simply absent; routing treats that as "no region model"

use crate::config::ModelsConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const BUILTIN_TABLE: &str = include_str!("regions.toml");

/// How a model must be driven to produce text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityVariant {
    /// Long-form: the whole clip in batched 30 s windows, language detected.
    GenericPipeline,
    /// First 30 s window with a fixed language and the transcribe task.
    ExplicitGeneration,
    /// First 30 s window, fixed language, bounded token budget.
    RawFeatureExtraction,
}

impl CapabilityVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityVariant::GenericPipeline => "generic_pipeline",
            CapabilityVariant::ExplicitGeneration => "explicit_generation",
            CapabilityVariant::RawFeatureExtraction => "raw_feature_extraction",
        }
    }
}

/// One model the service can load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub region_key: String,
    pub display_name: String,
    /// Hub repository holding the weights.
    pub model_id: String,
    /// Language code passed to generation; `None` means detect.
    pub language: Option<String>,
    pub variant: CapabilityVariant,
    /// Repository to take `tokenizer.json` from when `model_id` ships none.
    pub tokenizer_id: Option<String>,
}

impl ModelDescriptor {
    /// Descriptor of the general-purpose model every request is sent to.
    pub fn base(model_id: &str, display_name: &str) -> Self {
        Self {
            region_key: "base".to_string(),
            display_name: display_name.to_string(),
            model_id: model_id.to_string(),
            language: None,
            variant: CapabilityVariant::GenericPipeline,
            tokenizer_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read region table {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed region table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("region '{0}' is listed more than once")]
    Duplicate(String),

    #[error("invalid region entry: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RegionTable {
    #[serde(default)]
    region: Vec<RegionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionEntry {
    key: String,
    name: String,
    model_id: String,
    language: Option<String>,
    variant: CapabilityVariant,
    tokenizer_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_toml_str(BUILTIN_TABLE)
    }

    /// Load the configured table, falling back to the built-in one.
    pub fn load(config: &ModelsConfig) -> Result<Self, RegistryError> {
        match &config.region_table {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        let table: RegionTable = toml::from_str(text)?;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(table.region.len());

        for entry in table.region {
            let key = entry.key.trim().to_string();
            if key.is_empty() {
                return Err(RegistryError::Invalid("region key cannot be empty".into()));
            }
            if entry.model_id.trim().is_empty() {
                return Err(RegistryError::Invalid(format!("region '{}' has no model_id", key)));
            }
            if entry.variant != CapabilityVariant::GenericPipeline && entry.language.is_none() {
                return Err(RegistryError::Invalid(format!(
                    "region '{}' uses {} and must name a language",
                    key,
                    entry.variant.as_str()
                )));
            }
            if !seen.insert(key.to_ascii_lowercase()) {
                return Err(RegistryError::Duplicate(key));
            }

            entries.push(ModelDescriptor {
                region_key: key,
                display_name: entry.name,
                model_id: entry.model_id.trim().to_string(),
                language: entry.language,
                variant: entry.variant,
                tokenizer_id: entry.tokenizer_id,
            });
        }

        Ok(Self { entries })
    }

    /// Descriptor for a region key, if the region is known.
    pub fn describe(&self, region_key: &str) -> Option<&ModelDescriptor> {
        let key = region_key.trim();
        self.entries
            .iter()
            .find(|d| d.region_key == key)
            .or_else(|| self.entries.iter().find(|d| d.region_key.eq_ignore_ascii_case(key)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let registry = ModelRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 3);

        let malaysia = registry.describe("Malaysia").unwrap();
        assert_eq!(malaysia.model_id, "mesolitica/malaysian-whisper-small-v3");
        assert_eq!(malaysia.language.as_deref(), Some("ms"));
        assert_eq!(malaysia.variant, CapabilityVariant::ExplicitGeneration);

        let singapore = registry.describe("Singapore").unwrap();
        assert_eq!(singapore.variant, CapabilityVariant::GenericPipeline);
        assert_eq!(singapore.display_name, "Singlish Whisper Model");

        let thailand = registry.describe("Thailand").unwrap();
        assert_eq!(thailand.variant, CapabilityVariant::RawFeatureExtraction);
        assert_eq!(thailand.language.as_deref(), Some("th"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ModelRegistry::builtin().unwrap();
        assert_eq!(
            registry.describe("thailand").map(|d| d.region_key.as_str()),
            Some("Thailand")
        );
        assert!(registry.describe("  SINGAPORE ").is_some());
        assert!(registry.describe("Atlantis").is_none());
        assert!(registry.describe("").is_none());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let table = r#"
            [[region]]
            key = "Malaysia"
            name = "A"
            model_id = "a/b"
            variant = "generic_pipeline"

            [[region]]
            key = "malaysia"
            name = "B"
            model_id = "c/d"
            variant = "generic_pipeline"
        "#;
        assert!(matches!(
            ModelRegistry::from_toml_str(table),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let no_model = r#"
            [[region]]
            key = "X"
            name = "X"
            model_id = " "
            variant = "generic_pipeline"
        "#;
        assert!(matches!(
            ModelRegistry::from_toml_str(no_model),
            Err(RegistryError::Invalid(_))
        ));

        let no_language = r#"
            [[region]]
            key = "X"
            name = "X"
            model_id = "x/y"
            variant = "explicit_generation"
        "#;
        assert!(matches!(
            ModelRegistry::from_toml_str(no_language),
            Err(RegistryError::Invalid(_))
        ));

        let bad_variant = r#"
            [[region]]
            key = "X"
            name = "X"
            model_id = "x/y"
            variant = "magic"
        "#;
        assert!(matches!(
            ModelRegistry::from_toml_str(bad_variant),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_table_is_allowed() {
        let registry = ModelRegistry::from_toml_str("").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.toml");
        std::fs::write(
            &path,
            r#"
            [[region]]
            key = "Philippines"
            name = "Tagalog Whisper"
            model_id = "example/whisper-tagalog"
            language = "tl"
            variant = "explicit_generation"
            "#,
        )
        .unwrap();

        let registry = ModelRegistry::from_file(&path).unwrap();
        assert_eq!(registry.describe("philippines").unwrap().language.as_deref(), Some("tl"));

        assert!(matches!(
            ModelRegistry::from_file(&dir.path().join("missing.toml")),
            Err(RegistryError::Read { .. })
        ));
    }
}
