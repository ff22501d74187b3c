//! Runbook document parser.
//!
//! Lossless extraction of H1 sections, fenced code blocks, and the
//! restricted YAML payloads used by the runbook dialect. Purely functional:
//! nothing in this module reads the filesystem or mutates a document.

use anyhow::bail;

/// Shell language tags recognized on the Script fence.
pub const SHELL_TAGS: &[&str] = &["sh", "zsh", "bash"];

/// One declared environment variable requirement.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnvRequirement {
    /// Variable name
    pub name: String,
    /// Human description from the runbook
    pub description: String,
}

/// Declared filesystem requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRequirements {
    /// Paths copied into the workspace before execution
    pub input: Vec<String>,
    /// Paths the script intends to produce
    pub output: Vec<String>,
}

/// Split a document into its H1 sections, in order.
///
/// Each body runs from the line after the heading to the next H1 heading,
/// or to end of file for the final section. Bodies are trimmed; CRLF line
/// endings are accepted.
pub fn sections(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(heading) = h1_heading(line) {
            if let Some((name, body)) = current.take() {
                out.push((name, body.join("\n").trim().to_string()));
            }
            current = Some((heading.to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        out.push((name, body.join("\n").trim().to_string()));
    }
    out
}

/// Extract the body of a named H1 section, if present.
pub fn section(text: &str, name: &str) -> Option<String> {
    sections(text).into_iter().find(|(heading, _)| heading == name).map(|(_, body)| body)
}

/// The logical runbook name: the text of the first H1 heading.
pub fn document_name(text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .find_map(|line| h1_heading(line).map(ToString::to_string))
}

/// Match a top-level `# heading` line and return the heading text.
fn h1_heading(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("# ")?;
    let heading = rest.trim();
    if heading.is_empty() {
        None
    } else {
        Some(heading)
    }
}

/// Content of the first fenced code block whose language tag is in `tags`.
///
/// Fences open with three backticks followed by the tag on the same line
/// and close at the next line of three backticks.
pub fn fenced_block(body: &str, tags: &[&str]) -> Option<String> {
    let mut in_block = false;
    let mut collected: Vec<&str> = Vec::new();

    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if in_block {
            if line.trim_end() == "```" {
                return Some(collected.join("\n"));
            }
            collected.push(line);
        } else if let Some(tag) = line.trim().strip_prefix("```") {
            if tags.contains(&tag.trim()) {
                in_block = true;
            }
        }
    }
    // Unterminated fence is treated as absent
    None
}

/// Parse a restricted YAML mapping of string keys to string values.
///
/// Only safe scalar values are accepted: strings, numbers, booleans, and
/// null (which becomes an empty string). Tags, anchors, and nested
/// collections are rejected. An empty block yields an empty mapping.
pub fn yaml_mapping(block: &str) -> anyhow::Result<Vec<(String, String)>> {
    let trimmed = block.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
    match value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Mapping(mapping) => {
            let mut out = Vec::with_capacity(mapping.len());
            for (key, value) in mapping {
                let key = scalar_string(&key)
                    .ok_or_else(|| anyhow::anyhow!("mapping key is not a scalar"))?;
                let Some(value) = scalar_string(&value) else {
                    bail!("value for '{key}' is not a scalar");
                };
                out.push((key, value.trim().to_string()));
            }
            Ok(out)
        }
        other => bail!("expected a YAML mapping, got {}", yaml_kind(&other)),
    }
}

/// Render a scalar YAML value as a string; `None` for collections.
fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
        serde_yaml::Value::Tagged(_) => None,
    }
}

/// Human name of a YAML value kind, for error messages.
fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a list",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

/// The declared environment requirements, in declaration order.
pub fn env_requirements_of(text: &str) -> anyhow::Result<Option<Vec<EnvRequirement>>> {
    let Some(body) = section(text, "Environment Requirements") else {
        return Ok(None);
    };
    let Some(block) = fenced_block(&body, &["yaml"]) else {
        return Ok(None);
    };
    let mapping = yaml_mapping(&block)?;
    Ok(Some(
        mapping
            .into_iter()
            .map(|(name, description)| EnvRequirement { name, description })
            .collect(),
    ))
}

/// The embedded shell script, if a non-empty fence is present.
///
/// A fence whose content is only whitespace counts as missing.
pub fn script_of(text: &str) -> Option<String> {
    let body = section(text, "Script")?;
    let script = fenced_block(&body, SHELL_TAGS)?;
    let script = script.trim();
    if script.is_empty() {
        None
    } else {
        Some(script.to_string())
    }
}

/// The required-claims mapping, in declaration order.
///
/// A missing section or missing fence is absence (`None`), not an error.
/// Values are comma-split, trimmed, with empties dropped. An empty block
/// yields an empty mapping, which grants open access just like absence.
pub fn required_claims_of(text: &str) -> anyhow::Result<Option<Vec<(String, Vec<String>)>>> {
    let Some(body) = section(text, "Required Claims") else {
        return Ok(None);
    };
    let Some(block) = fenced_block(&body, &["yaml"]) else {
        return Ok(None);
    };
    let mapping = yaml_mapping(&block)?;

    let claims = mapping
        .into_iter()
        .map(|(name, value)| {
            let values: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
                .collect();
            (name, values)
        })
        .collect();
    Ok(Some(claims))
}

/// The declared filesystem requirements.
///
/// Missing keys default to empty lists; a scalar value promotes to a
/// one-element list.
pub fn file_requirements_of(text: &str) -> anyhow::Result<FileRequirements> {
    let mut requirements = FileRequirements::default();

    let Some(body) = section(text, "File System Requirements") else {
        return Ok(requirements);
    };
    let Some(block) = fenced_block(&body, &["yaml"]) else {
        return Ok(requirements);
    };
    let trimmed = block.trim();
    if trimmed.is_empty() {
        return Ok(requirements);
    }

    let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
    let serde_yaml::Value::Mapping(mapping) = value else {
        bail!("File System Requirements must be a YAML mapping");
    };

    for (key, value) in &mapping {
        let Some(key) = scalar_string(key) else { continue };
        let paths = path_list(value);
        match key.as_str() {
            "Input" => requirements.input = paths,
            "Output" => requirements.output = paths,
            other => tracing::debug!(key = other, "Ignoring unrecognized file requirement key"),
        }
    }
    Ok(requirements)
}

/// Decode a YAML value as a list of path strings.
fn path_list(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::Sequence(items) => {
            items.iter().filter_map(scalar_string).filter(|s| !s.is_empty()).collect()
        }
        other => scalar_string(other)
            .filter(|s| !s.is_empty())
            .map(|s| vec![s])
            .unwrap_or_default(),
    }
}

/// The most recent history entry appended to a document.
///
/// History entries are self-delimiting `### <timestamp> | Exit Code: <n>`
/// blocks, so the latest entry is recoverable by scanning headings from the
/// end without parsing the whole file.
pub fn last_history_entry(text: &str) -> Option<HistoryEntry> {
    let history_start = text.find("# History")?;
    let history = &text[history_start..];

    let entry_start = history.rfind("\n### ")?;
    let entry = &history[entry_start + 1..];

    let mut lines = entry.lines();
    let heading = lines.next()?;
    let (timestamp, code) = heading.strip_prefix("### ")?.split_once(" | Exit Code: ")?;
    let return_code: i32 = code.trim().parse().ok()?;

    let rest: String = lines.collect::<Vec<_>>().join("\n");
    Some(HistoryEntry {
        finished: timestamp.trim().to_string(),
        return_code,
        stdout: labeled_block(&rest, "**Stdout:**").unwrap_or_default(),
        stderr: labeled_block(&rest, "**Stderr:**").unwrap_or_default(),
        error: labeled_block(&rest, "**Error:**").unwrap_or_default(),
    })
}

/// A history entry parsed back from the append zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Finish timestamp from the entry heading
    pub finished: String,
    /// Recorded return code
    pub return_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Recorded error message, for denial entries
    pub error: String,
}

/// Extract the fenced block following a `**Label:**` line.
fn labeled_block(body: &str, label: &str) -> Option<String> {
    let start = body.find(label)? + label.len();
    fenced_block(&body[start..], &[""])
}
