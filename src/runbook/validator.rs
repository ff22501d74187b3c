//! Runbook structural validation.
//!
//! Non-fail-fast: every check runs even after earlier failures so a single
//! validation pass reports everything wrong with a runbook. Validation
//! never executes the script and never modifies the document.

use std::collections::HashMap;
use std::path::Path;

use super::Runbook;

/// Sections every runbook must carry. Required Claims is optional.
const REQUIRED_SECTIONS: &[&str] =
    &["Environment Requirements", "File System Requirements", "Script", "History"];

/// Outcome of validating a runbook.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Problems that make the runbook non-executable
    pub errors: Vec<String>,

    /// Non-blocking observations
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Create an empty (passing) report.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Whether the runbook passed validation.
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Add a warning.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Validate a runbook against its declared contract.
///
/// `resolved_env` is the environment the script would actually observe: the
/// sanitized caller variables plus the system-managed names. Declared
/// environment requirements are checked against it, not against the host
/// process environment, because the executor composes a fresh child
/// environment per spawn.
pub fn validate(runbook: &Runbook, resolved_env: &HashMap<String, String>) -> ValidationReport {
    let mut report = ValidationReport::ok();

    for warning in runbook.load_warnings() {
        report.add_warning(warning.clone());
    }

    if runbook.name().is_none() {
        report.add_error("Runbook must start with an H1 header containing the runbook name");
    }

    check_required_sections(runbook, &mut report);
    check_env_requirements(runbook, resolved_env, &mut report);
    check_file_requirements(runbook, &mut report);

    if runbook.script().is_none() {
        report.add_error("Script section must contain a sh code block");
    }

    check_history_placement(runbook, &mut report);

    report
}

/// Every required section must be present; only History may be empty.
fn check_required_sections(runbook: &Runbook, report: &mut ValidationReport) {
    let headings = runbook.headings();
    for section in REQUIRED_SECTIONS {
        match runbook.section(section) {
            None => report.add_error(format!("Missing required section: {section}")),
            Some(body) if body.is_empty() && *section != "History" => {
                report.add_error(format!("Section '{section}' is empty"));
            }
            Some(_) => {}
        }
        if headings.iter().filter(|h| h == section).count() > 1 {
            report.add_warning(format!("Section '{section}' appears more than once"));
        }
    }
}

/// Declared environment variables must be present in the resolved environment.
fn check_env_requirements(
    runbook: &Runbook,
    resolved_env: &HashMap<String, String>,
    report: &mut ValidationReport,
) {
    if runbook.section("Environment Requirements").is_none() {
        // Missing-section error already raised
        return;
    }
    match runbook.env_requirements() {
        Ok(Some(requirements)) => {
            for requirement in requirements {
                if !resolved_env.contains_key(&requirement.name) {
                    report.add_error(format!(
                        "Required environment variable not set: {}",
                        requirement.name
                    ));
                }
            }
        }
        Ok(None) => {
            report.add_error("Environment Requirements section must contain a YAML code block");
        }
        Err(e) => {
            report.add_error(format!("Environment Requirements YAML is invalid: {e}"));
        }
    }
}

/// Declared input paths must resolve inside the runbook directory and exist.
fn check_file_requirements(runbook: &Runbook, report: &mut ValidationReport) {
    if runbook.section("File System Requirements").is_none() {
        return;
    }
    match runbook.file_requirements() {
        Ok(requirements) => {
            for path in &requirements.input {
                if let Some(error) = input_path_error(runbook.parent_dir(), path) {
                    report.add_error(error);
                }
            }
        }
        Err(e) => {
            report.add_error(format!("File System Requirements YAML is invalid: {e}"));
        }
    }
}

/// Check one declared input path; `None` means it is acceptable.
///
/// The path must exist after resolution against the runbook's directory and
/// its canonical form must remain inside that directory (symlinks that point
/// outside are rejected).
pub fn input_path_error(runbook_dir: &Path, declared: &str) -> Option<String> {
    let joined = runbook_dir.join(declared);

    let Ok(canonical) = joined.canonicalize() else {
        return Some(format!("Required input file does not exist: {declared}"));
    };
    let Ok(canonical_dir) = runbook_dir.canonicalize() else {
        return Some(format!("Runbook directory is not accessible: {}", runbook_dir.display()));
    };
    if !canonical.starts_with(&canonical_dir) {
        return Some(format!("Input path escapes the runbook directory: {declared}"));
    }
    None
}

/// The History heading should be the final H1 in the document.
fn check_history_placement(runbook: &Runbook, report: &mut ValidationReport) {
    let headings = runbook.headings();
    if let Some(last) = headings.last() {
        if headings.iter().any(|h| h == "History") && last != "History" {
            report.add_warning("History section is not the last heading in the runbook");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn runbook(content: &str) -> Runbook {
        Runbook::from_content(Path::new("/books/Test.md"), content.to_string())
    }

    fn complete_runbook() -> String {
        "# Test\nprose\n\n# Environment Requirements\n```yaml\nGREETING: the greeting\n```\n\n# File System Requirements\n```yaml\n```\n\n# Script\n```sh\necho ok\n```\n\n# History\n".to_string()
    }

    fn env_with(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_complete_runbook_passes() {
        let report = validate(&runbook(&complete_runbook()), &env_with(&[("GREETING", "hi")]));
        assert!(report.passed(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_missing_sections_reported() {
        let report = validate(&runbook("# Test\nprose\n"), &HashMap::new());
        assert!(!report.passed());
        assert!(report.errors.iter().any(|e| e.contains("Environment Requirements")));
        assert!(report.errors.iter().any(|e| e.contains("File System Requirements")));
        assert!(report.errors.iter().any(|e| e == "Missing required section: Script"));
        assert!(report.errors.iter().any(|e| e == "Missing required section: History"));
    }

    #[test]
    fn test_all_checks_run_after_failures() {
        // No name, no sections at all: every check still contributes
        let report = validate(&runbook("plain text, no headings"), &HashMap::new());
        assert!(report.errors.len() >= 5);
    }

    #[test]
    fn test_missing_env_var_named_in_error() {
        let report = validate(&runbook(&complete_runbook()), &HashMap::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e == "Required environment variable not set: GREETING"));
    }

    #[test]
    fn test_env_section_without_yaml_block() {
        let content = complete_runbook()
            .replace("```yaml\nGREETING: the greeting\n```", "no fence here");
        let report = validate(&runbook(&content), &HashMap::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e == "Environment Requirements section must contain a YAML code block"));
    }

    #[test]
    fn test_empty_script_is_error_but_empty_history_is_not() {
        let content = complete_runbook().replace("echo ok\n", "   \n");
        let report = validate(&runbook(&content), &env_with(&[("GREETING", "hi")]));
        assert!(report.errors.iter().any(|e| e.contains("sh code block")));
        assert!(!report.errors.iter().any(|e| e.contains("History")));
    }

    #[test]
    fn test_missing_input_file_named_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = complete_runbook().replace(
            "# File System Requirements\n```yaml\n```",
            "# File System Requirements\n```yaml\nInput:\n  - absent.txt\n```",
        );
        let book = Runbook::from_content(&dir.path().join("Test.md"), content);
        let report = validate(&book, &env_with(&[("GREETING", "hi")]));
        assert!(report
            .errors
            .iter()
            .any(|e| e == "Required input file does not exist: absent.txt"));
    }

    #[test]
    fn test_present_input_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("seed.txt")).unwrap();
        writeln!(f, "data").unwrap();

        let content = complete_runbook().replace(
            "# File System Requirements\n```yaml\n```",
            "# File System Requirements\n```yaml\nInput:\n  - seed.txt\n```",
        );
        let book = Runbook::from_content(&dir.path().join("Test.md"), content);
        let report = validate(&book, &env_with(&[("GREETING", "hi")]));
        assert!(report.passed(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_input_path_escape_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let books = outer.path().join("books");
        std::fs::create_dir(&books).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "s").unwrap();

        let error = input_path_error(&books, "../secret.txt").unwrap();
        assert!(error.contains("escapes the runbook directory"));
    }

    #[test]
    fn test_history_not_last_warns() {
        let content = "# Test\nprose\n\n# Environment Requirements\n```yaml\n```\n\n# File System Requirements\n```yaml\n```\n\n# History\n\n# Script\n```sh\necho ok\n```\n";
        let report = validate(&runbook(content), &HashMap::new());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("not the last heading")));
    }

    #[test]
    fn test_duplicate_section_warns() {
        let content = format!("{}\n# Script\n```sh\necho again\n```\n", complete_runbook());
        let report = validate(&runbook(&content), &env_with(&[("GREETING", "hi")]));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("'Script' appears more than once")));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let book = runbook(&complete_runbook());
        let env = env_with(&[("GREETING", "hi")]);
        let first = validate(&book, &env);
        let second = validate(&book, &env);
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.warnings, second.warnings);
    }
}
