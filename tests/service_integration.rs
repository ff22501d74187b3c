//! End-to-end tests for the runbook service.
//!
//! These exercise the full operation flows over scratch runbook
//! directories: authorization, validation, execution under resource
//! limits, recursion control, and history recording.

use std::collections::HashMap;

use runbookd::core::{
    Breadcrumb, RunbookConfig, ServiceError, TokenContext, TIMEOUT_RETURN_CODE, WORKSPACE_PREFIX,
};
use runbookd::runbook::parser::last_history_entry;
use runbookd::service::{RunbookService, AUTH_DENIED_RETURN_CODE};

fn simple_runbook(script: &str) -> String {
    format!(
        "# SimpleRunbook\nEchoes a greeting.\n\n# Environment Requirements\n```yaml\n```\n\n# File System Requirements\n```yaml\n```\n\n# Required Claims\n```yaml\nroles: developer, admin\n```\n\n# Script\n```sh\n{script}\n```\n\n# History\n"
    )
}

/// A service over a scratch runbooks directory, with a private workspace
/// root so disposal can be asserted without interference from parallel
/// tests.
struct Harness {
    runbooks: tempfile::TempDir,
    workspaces: tempfile::TempDir,
    service: RunbookService,
}

fn harness(configure: impl FnOnce(RunbookConfig) -> RunbookConfig) -> Harness {
    let runbooks = tempfile::tempdir().unwrap();
    let workspaces = tempfile::tempdir().unwrap();
    let config = configure(
        RunbookConfig::default()
            .with_runbooks_dir(runbooks.path())
            .with_workspace_root(workspaces.path())
            .with_shell("/bin/sh")
            .with_timeout_seconds(10),
    );
    let service = RunbookService::new(config);
    Harness { runbooks, workspaces, service }
}

impl Harness {
    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.runbooks.path().join(name), content).unwrap();
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.runbooks.path().join(name)).unwrap()
    }

    /// Workspace directories still present under the private root.
    fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspaces.path())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn developer() -> TokenContext {
    TokenContext::new("alice").with_claim("roles", &["developer"]).with_bearer("bearer-dev")
}

mod execution {
    use super::*;

    #[test]
    fn developer_token_executes_simple_runbook() {
        let h = harness(|c| c);
        h.write("SimpleRunbook.md", &simple_runbook("echo ok"));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let record = h
            .service
            .execute("SimpleRunbook.md", &token, &breadcrumb, &HashMap::new(), None)
            .unwrap();

        assert_eq!(record.return_code, 0);
        assert_eq!(record.stdout, "ok\n");
        assert_eq!(record.stderr, "");
        assert!(record.errors.is_empty());
        assert!(record.success());

        // One history entry was appended and is reverse-parseable
        let entry = last_history_entry(&h.read("SimpleRunbook.md")).unwrap();
        assert_eq!(entry.return_code, 0);
        assert_eq!(entry.stdout.trim(), "ok");
    }

    #[test]
    fn viewer_token_is_denied_without_creating_a_workspace() {
        let h = harness(|c| c);
        h.write("SimpleRunbook.md", &simple_runbook("echo ok"));

        let token = TokenContext::new("victor").with_claim("roles", &["viewer"]);
        let breadcrumb = Breadcrumb::for_token(&token);
        let record = h
            .service
            .execute("SimpleRunbook.md", &token, &breadcrumb, &HashMap::new(), None)
            .unwrap();

        assert_eq!(record.return_code, AUTH_DENIED_RETURN_CODE);
        assert!(record.stderr.contains("RBAC check failed for execute"));
        assert!(record.stderr.contains("victor"));
        assert_eq!(h.leftover_workspaces(), 0);

        let entry = last_history_entry(&h.read("SimpleRunbook.md")).unwrap();
        assert_eq!(entry.return_code, 403);
        assert!(entry.error.contains("RBAC"));
    }

    #[test]
    fn workspaces_are_disposed_after_success_and_failure() {
        let h = harness(|c| c);
        h.write("Ok.md", &simple_runbook("echo fine"));
        h.write("Bad.md", &simple_runbook("exit 9"));
        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);

        h.service.execute("Ok.md", &token, &breadcrumb, &HashMap::new(), None).unwrap();
        h.service.execute("Bad.md", &token, &breadcrumb, &HashMap::new(), None).unwrap();
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[test]
    fn spoofed_system_variable_is_ignored_with_warning() {
        let h = harness(|c| c);
        let script = "printf '%s/%s' \"$PATH_STYLE\" \"$RUNBOOK_API_TOKEN\"";
        h.write("A.md", &simple_runbook(script));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let env: HashMap<String, String> = [
            ("PATH_STYLE".to_string(), "x".to_string()),
            ("RUNBOOK_API_TOKEN".to_string(), "spoof".to_string()),
        ]
        .into_iter()
        .collect();

        let record = h.service.execute("A.md", &token, &breadcrumb, &env, None).unwrap();
        assert_eq!(record.stdout, "x/bearer-dev");
        assert!(record.warnings.iter().any(|w| w.contains("RUNBOOK_API_TOKEN")));
    }

    #[test]
    fn script_environment_contains_exactly_the_composed_names() {
        let h = harness(|c| c);
        // `env` prints NAME=VALUE lines of the actual child environment
        h.write("A.md", &simple_runbook("env | sort"));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let env: HashMap<String, String> =
            [("CALLER_VAR".to_string(), "1".to_string())].into_iter().collect();
        let record = h.service.execute("A.md", &token, &breadcrumb, &env, None).unwrap();

        let names: Vec<&str> = record
            .stdout
            .lines()
            .filter_map(|line| line.split_once('=').map(|(name, _)| name))
            .collect();
        for expected in [
            "CALLER_VAR",
            "RUNBOOK_API_TOKEN",
            "RUNBOOK_CORRELATION_ID",
            "RUNBOOK_URL",
            "RUNBOOK_API_BASE_URL",
            "RUNBOOK_RECURSION_STACK",
        ] {
            assert!(names.contains(&expected), "missing {expected} in {names:?}");
        }
        // Host environment does not leak (PATH is the documented exception,
        // PWD/SHLVL come from the shell itself)
        assert!(!names.contains(&"HOME"));
    }

    #[test]
    fn base_url_reflects_configuration() {
        let h = harness(|c| c);
        h.write("A.md", &simple_runbook("printf '%s' \"$RUNBOOK_URL\""));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let record =
            h.service.execute("A.md", &token, &breadcrumb, &HashMap::new(), None).unwrap();
        assert_eq!(record.stdout, "http://localhost:8083");
    }
}

mod limits {
    use super::*;

    #[test]
    fn timeout_terminates_script_and_is_recorded() {
        let h = harness(|c| c.with_timeout_seconds(1));
        h.write("Slow.md", &simple_runbook("sleep 9999"));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let started = std::time::Instant::now();
        let record = h
            .service
            .execute("Slow.md", &token, &breadcrumb, &HashMap::new(), None)
            .unwrap();

        assert_eq!(record.return_code, TIMEOUT_RETURN_CODE);
        assert!(record.stderr.contains("script timed out after 1 seconds"));
        assert!(started.elapsed() < std::time::Duration::from_secs(30));
        assert_eq!(h.leftover_workspaces(), 0);

        assert!(h.read("Slow.md").contains(&format!("| Exit Code: {TIMEOUT_RETURN_CODE}")));
    }

    #[test]
    fn oversized_output_is_truncated_with_marker_and_warning() {
        let h = harness(|c| c.with_max_output_bytes(64 * 1024));
        // 128 KiB of output against a 64 KiB cap
        let script = "i=0; while [ $i -lt 2048 ]; do printf '0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef'; i=$((i+1)); done";
        h.write("Big.md", &simple_runbook(script));

        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let record =
            h.service.execute("Big.md", &token, &breadcrumb, &HashMap::new(), None).unwrap();

        // The child's own exit code is preserved
        assert_eq!(record.return_code, 0);
        let (body, rest) = record.stdout.split_once('\n').unwrap();
        assert_eq!(body.len(), 64 * 1024);
        assert!(rest.contains("…output truncated at 65536 bytes…"));
        assert!(record.warnings.iter().any(|w| w.contains("stdout truncated")));
    }
}

mod recursion {
    use super::*;

    #[test]
    fn self_invocation_is_rejected_and_recorded() {
        let h = harness(|c| c);
        h.write("A.md", &simple_runbook("echo ok"));

        let token = developer();
        let breadcrumb =
            Breadcrumb::for_token(&token).with_recursion_stack(vec!["A.md".to_string()]);
        let record =
            h.service.execute("A.md", &token, &breadcrumb, &HashMap::new(), None).unwrap();

        assert_ne!(record.return_code, 0);
        assert_eq!(
            record.stderr,
            "Recursion detected: Runbook A.md already in execution chain: [\"A.md\"]"
        );

        let entry = last_history_entry(&h.read("A.md")).unwrap();
        assert!(entry.error.contains("Recursion detected"));
    }

    #[test]
    fn absent_and_empty_inbound_stacks_behave_identically() {
        let h = harness(|c| c);
        let script = "printf '%s' \"$RUNBOOK_RECURSION_STACK\"";
        h.write("A.md", &simple_runbook(script));
        let token = developer();

        let absent = Breadcrumb::for_token(&token)
            .with_recursion_stack(Breadcrumb::parse_recursion_stack(None));
        let empty = Breadcrumb::for_token(&token)
            .with_recursion_stack(Breadcrumb::parse_recursion_stack(Some("[]")));

        let first =
            h.service.execute("A.md", &token, &absent, &HashMap::new(), None).unwrap();
        let second =
            h.service.execute("A.md", &token, &empty, &HashMap::new(), None).unwrap();
        assert_eq!(first.stdout, "[\"A.md\"]");
        assert_eq!(second.stdout, first.stdout);
    }
}

mod validation {
    use super::*;

    #[test]
    fn validate_is_pure_and_repeatable() {
        let h = harness(|c| c);
        h.write("A.md", &simple_runbook("echo ok"));
        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);

        let first =
            h.service.validate("A.md", &token, &breadcrumb, &HashMap::new()).unwrap();
        let second =
            h.service.validate("A.md", &token, &breadcrumb, &HashMap::new()).unwrap();
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.warnings, second.warnings);
        assert!(first.success());

        // Validation never executes the script
        assert!(first.stdout.is_empty());
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[test]
    fn validation_failure_reports_every_problem_at_once() {
        let h = harness(|c| c);
        h.write("Broken.md", "# Broken\nprose only, no other sections\n");
        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);

        let record =
            h.service.validate("Broken.md", &token, &breadcrumb, &HashMap::new()).unwrap();
        assert!(!record.success());
        assert!(record.errors.len() >= 4, "expected many errors, got {:?}", record.errors);
    }

    #[test]
    fn validate_records_history_with_correlation_id() {
        let h = harness(|c| c);
        h.write("A.md", &simple_runbook("echo ok"));
        let token = developer().with_correlation_id("corr-validate-1");
        let breadcrumb = Breadcrumb::for_token(&token);

        let record =
            h.service.validate("A.md", &token, &breadcrumb, &HashMap::new()).unwrap();
        assert_eq!(record.breadcrumb.correlation_id, "corr-validate-1");
        assert!(h.read("A.md").contains("| Exit Code: 0"));
    }
}

mod filenames {
    use super::*;

    #[test]
    fn traversal_attempts_do_not_touch_history() {
        let h = harness(|c| c);
        h.write("A.md", &simple_runbook("echo ok"));
        let token = developer();
        let breadcrumb = Breadcrumb::for_token(&token);
        let before = h.read("A.md");

        for bad in ["../A.md", "x/../A.md", ".A.md"] {
            let err = h
                .service
                .execute(bad, &token, &breadcrumb, &HashMap::new(), None)
                .unwrap_err();
            assert!(matches!(err, ServiceError::BadFilename(_)), "{bad}: {err:?}");
        }

        assert_eq!(before, h.read("A.md"));
    }

    #[test]
    fn list_and_get_round_trip() {
        let h = harness(|c| c);
        let content = simple_runbook("echo ok");
        h.write("A.md", &content);
        h.write("B.md", &content);
        let token = developer();

        assert_eq!(h.service.list(&token).unwrap(), vec!["A.md", "B.md"]);
        assert_eq!(h.service.get("A.md", &token).unwrap(), content);
    }
}
