//! Runbook document model.
//!
//! A loaded runbook keeps its raw text and answers structural questions by
//! delegating to the parser, so the validator can report every problem
//! rather than failing on the first malformed section.

use std::path::{Path, PathBuf};

use super::parser::{self, EnvRequirement, FileRequirements};

/// A loaded runbook document.
#[derive(Debug, Clone)]
pub struct Runbook {
    /// Path to the runbook file
    path: PathBuf,

    /// Raw document text
    content: String,

    /// Logical name from the first H1 heading
    name: Option<String>,

    /// Warnings raised while loading
    warnings: Vec<String>,
}

impl Runbook {
    /// Load a runbook from a file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_content(path, content))
    }

    /// Build a runbook from raw text.
    pub fn from_content(path: &Path, content: String) -> Self {
        let name = parser::document_name(&content);
        let mut warnings = Vec::new();

        if let Some(ref name) = name {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if name != stem {
                warnings.push(format!(
                    "Runbook name '{name}' does not match filename '{stem}'"
                ));
            }
        }

        Self { path: path.to_path_buf(), content, name, warnings }
    }

    /// Path to the runbook file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The runbook's basename, as used on the wire.
    pub fn filename(&self) -> String {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string()
    }

    /// Directory containing the runbook; input paths resolve against it.
    pub fn parent_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Raw document text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Logical name from the first H1 heading.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Warnings raised while loading.
    pub fn load_warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Body of a named section.
    pub fn section(&self, name: &str) -> Option<String> {
        parser::section(&self.content, name)
    }

    /// All H1 headings, in order.
    pub fn headings(&self) -> Vec<String> {
        parser::sections(&self.content).into_iter().map(|(name, _)| name).collect()
    }

    /// The embedded shell script.
    pub fn script(&self) -> Option<String> {
        parser::script_of(&self.content)
    }

    /// Declared environment requirements.
    pub fn env_requirements(&self) -> anyhow::Result<Option<Vec<EnvRequirement>>> {
        parser::env_requirements_of(&self.content)
    }

    /// Declared required claims.
    pub fn required_claims(&self) -> anyhow::Result<Option<Vec<(String, Vec<String>)>>> {
        parser::required_claims_of(&self.content)
    }

    /// Declared filesystem requirements.
    pub fn file_requirements(&self) -> anyhow::Result<FileRequirements> {
        parser::file_requirements_of(&self.content)
    }
}
