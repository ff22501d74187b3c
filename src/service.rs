//! The runbook service orchestrator.
//!
//! Binds the parser, validator, authorizer, recursion guard, workspace,
//! executor, and history recorder into the operations the transport layer
//! exposes: `list`, `get`, `required_env`, `validate`, `execute`.
//!
//! Operations that complete with a failure result (validation errors,
//! authorization denials, recursion failures, script failures) return an
//! execution record describing the outcome; `Err` is reserved for request
//! rejections and pre-record failures (`BadFilename`, `NotFound`,
//! `InvalidEnvVarName`, `Internal`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::{
    compose_environment, Breadcrumb, CancelToken, ExecutionRecord, HistoryRecorder, Operation,
    RecursionGuard, RunbookConfig, ScriptExecutor, ServiceError, ServiceResult, SystemEnv,
    TokenContext,
};
use crate::runbook::{validator, EnvRequirement, Runbook};
use crate::security::{sanitize_env_vars, ClaimsAuthorizer, SanitizedEnv, SYSTEM_ENV_VARS};

/// Return code recorded for authorization denials.
pub const AUTH_DENIED_RETURN_CODE: i32 = 403;

/// Return code recorded for validation, recursion, and internal failures.
pub const FAILURE_RETURN_CODE: i32 = 1;

/// Declared environment variables for a runbook, partitioned against a
/// caller-supplied environment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequiredEnvReport {
    /// Runbook filename
    pub runbook: String,
    /// Every declared variable
    pub required: Vec<EnvRequirement>,
    /// Declared variables the resolved environment would provide
    pub available: Vec<EnvRequirement>,
    /// Declared variables the resolved environment would not provide
    pub missing: Vec<EnvRequirement>,
}

/// Orchestrator for runbook operations.
#[derive(Debug)]
pub struct RunbookService {
    config: RunbookConfig,
    authorizer: ClaimsAuthorizer,
    recursion: RecursionGuard,
    recorder: HistoryRecorder,
}

impl RunbookService {
    /// Create a service over a configuration.
    ///
    /// The configuration is constructed once at startup and is immutable
    /// for the life of the service.
    pub fn new(config: RunbookConfig) -> Self {
        let recursion = RecursionGuard::new(config.max_recursion_depth);
        Self {
            config,
            authorizer: ClaimsAuthorizer::new(),
            recursion,
            recorder: HistoryRecorder::new(),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &RunbookConfig {
        &self.config
    }

    /// List runbook filenames: regular `.md` files in the runbooks
    /// directory, sorted. Authorization for listing is transport-level.
    pub fn list(&self, _token: &TokenContext) -> ServiceResult<Vec<String>> {
        let dir = &self.config.runbooks_dir;
        if !dir.is_dir() {
            return Err(ServiceError::NotFound(format!(
                "Runbooks directory not found: {}",
                dir.display()
            )));
        }

        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".md"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Return the raw text of a runbook.
    pub fn get(&self, filename: &str, _token: &TokenContext) -> ServiceResult<String> {
        let path = self.resolve(filename)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Report the declared environment variables of a runbook, partitioned
    /// against what the caller would supply.
    pub fn required_env(
        &self,
        filename: &str,
        _token: &TokenContext,
        env_vars: Option<&HashMap<String, String>>,
    ) -> ServiceResult<RequiredEnvReport> {
        let path = self.resolve(filename)?;
        let runbook = Runbook::load(&path)
            .map_err(|e| ServiceError::Internal(format!("failed to load runbook: {e}")))?;

        let required = runbook
            .env_requirements()
            .map_err(|e| ServiceError::Internal(format!("invalid environment requirements: {e}")))?
            .unwrap_or_default();

        let provided: Vec<String> = env_vars
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default();

        let mut available = Vec::new();
        let mut missing = Vec::new();
        for requirement in &required {
            let supplied = provided.contains(&requirement.name)
                || SYSTEM_ENV_VARS.contains(&requirement.name.as_str());
            if supplied {
                available.push(requirement.clone());
            } else {
                missing.push(requirement.clone());
            }
        }

        Ok(RequiredEnvReport { runbook: filename.to_string(), required, available, missing })
    }

    /// Validate a runbook without executing it.
    ///
    /// `env_vars` is the environment the caller would pass to `execute`;
    /// declared environment requirements are checked against it plus the
    /// system-managed names.
    pub fn validate(
        &self,
        filename: &str,
        token: &TokenContext,
        breadcrumb: &Breadcrumb,
        env_vars: &HashMap<String, String>,
    ) -> ServiceResult<ExecutionRecord> {
        let path = self.resolve(filename)?;
        let sanitized = sanitize_env_vars(env_vars)?;
        let runbook = Runbook::load(&path)
            .map_err(|e| ServiceError::Internal(format!("failed to load runbook: {e}")))?;

        let mut record = self.begin_record(Operation::Validate, filename, breadcrumb);
        record.warnings.extend(sanitized.warnings.clone());

        if let Some(denied) =
            self.authorize(&runbook, token, Operation::Validate, &path, &mut record)
        {
            return Ok(denied);
        }

        let resolved = self.resolved_env(token, breadcrumb, &sanitized, &breadcrumb.recursion_stack);
        let report = validator::validate(&runbook, &resolved);

        record.warnings.extend(report.warnings);
        record.errors.extend(report.errors);
        let code = if record.errors.is_empty() { 0 } else { FAILURE_RETURN_CODE };
        record.finish(code);
        self.recorder.record(&path, &mut record);
        Ok(record)
    }

    /// Execute a runbook.
    ///
    /// Fails fast on validation errors; otherwise copies declared inputs
    /// into a fresh workspace, runs the script under the configured limits,
    /// disposes the workspace, and records the outcome.
    pub fn execute(
        &self,
        filename: &str,
        token: &TokenContext,
        breadcrumb: &Breadcrumb,
        env_vars: &HashMap<String, String>,
        cancel: Option<&CancelToken>,
    ) -> ServiceResult<ExecutionRecord> {
        let path = self.resolve(filename)?;
        let sanitized = sanitize_env_vars(env_vars)?;
        let runbook = Runbook::load(&path)
            .map_err(|e| ServiceError::Internal(format!("failed to load runbook: {e}")))?;

        let mut record = self.begin_record(Operation::Execute, filename, breadcrumb);
        record.warnings.extend(sanitized.warnings.clone());

        if let Some(denied) =
            self.authorize(&runbook, token, Operation::Execute, &path, &mut record)
        {
            return Ok(denied);
        }

        // Cycle and depth checks on the inbound stack; on success the
        // extended stack travels on the record and to the child script.
        let extended_stack = match self.recursion.check(&breadcrumb.recursion_stack, filename) {
            Ok(stack) => stack,
            Err(e) => return Ok(self.record_failure(&path, &mut record, &e)),
        };
        record.breadcrumb.recursion_stack.clone_from(&extended_stack);

        let resolved = self.resolved_env(token, breadcrumb, &sanitized, &extended_stack);
        let report = validator::validate(&runbook, &resolved);
        record.warnings.extend(report.warnings);
        if !report.errors.is_empty() {
            let failure = ServiceError::ValidationFailed(report.errors.join("\n"));
            record.stderr = failure.to_string();
            record.errors.extend(report.errors);
            record.finish(FAILURE_RETURN_CODE);
            self.recorder.record(&path, &mut record);
            return Ok(record);
        }

        // The validator guarantees a script is present
        let Some(script) = runbook.script() else {
            record.errors.push("Could not extract script from runbook".to_string());
            record.finish(FAILURE_RETURN_CODE);
            self.recorder.record(&path, &mut record);
            return Ok(record);
        };

        let outcome = self.run_script(&runbook, &script, &resolved, cancel);
        match outcome {
            Ok(output) => {
                record.stdout = output.stdout;
                record.stderr = output.stderr;
                record.warnings.extend(output.warnings);
                record.finish(output.return_code);
            }
            Err(errors) => {
                record.stderr = errors.join("\n");
                record.errors.extend(errors);
                record.finish(FAILURE_RETURN_CODE);
            }
        }

        self.recorder.record(&path, &mut record);
        Ok(record)
    }

    /// Prepare the workspace and run the script inside it.
    ///
    /// The workspace guard disposes the directory on every exit path.
    fn run_script(
        &self,
        runbook: &Runbook,
        script: &str,
        env: &HashMap<String, String>,
        cancel: Option<&CancelToken>,
    ) -> Result<crate::core::ExecutionOutput, Vec<String>> {
        let mut workspace = match &self.config.workspace_root {
            Some(root) => crate::core::Workspace::create_in(root),
            None => crate::core::Workspace::create(),
        }
        .map_err(|e| vec![e.to_string()])?;

        let inputs = runbook
            .file_requirements()
            .map_err(|e| vec![format!("File System Requirements YAML is invalid: {e}")])?
            .input;
        let copy_errors = workspace.populate(runbook.parent_dir(), &inputs);
        if !copy_errors.is_empty() {
            return Err(copy_errors);
        }

        let script_path = workspace.write_script(script).map_err(|e| vec![e.to_string()])?;

        let executor = ScriptExecutor::new(
            self.config.shell_path.clone(),
            std::time::Duration::from_secs(self.config.script_timeout_seconds),
            self.config.max_output_bytes,
        );
        let result = executor
            .execute(&script_path, workspace.path(), env, cancel)
            .map_err(|e| vec![format!("ERROR: Failed to execute script: {e}")]);

        workspace.dispose();
        result
    }

    /// Evaluate the runbook's required claims; on denial, finish and record
    /// a denial record and hand it back.
    fn authorize(
        &self,
        runbook: &Runbook,
        token: &TokenContext,
        operation: Operation,
        path: &Path,
        record: &mut ExecutionRecord,
    ) -> Option<ExecutionRecord> {
        let required = match runbook.required_claims() {
            Ok(claims) => claims,
            Err(e) => {
                // An unparseable claims block denies rather than opens
                let failure = ServiceError::ValidationFailed(format!(
                    "Required Claims YAML is invalid: {e}"
                ));
                return Some(self.record_failure(path, record, &failure));
            }
        };

        match self.authorizer.check(token, required.as_deref(), operation.as_str()) {
            Ok(()) => None,
            Err(e) => Some(self.record_failure(path, record, &e)),
        }
    }

    /// Finish and record a failure that completes the operation with a
    /// result rather than rejecting the request.
    fn record_failure(
        &self,
        path: &Path,
        record: &mut ExecutionRecord,
        error: &ServiceError,
    ) -> ExecutionRecord {
        debug_assert!(error.is_recorded(), "rejection kinds must be raised, not recorded");
        let message = error.to_string();
        record.errors.push(message.clone());
        record.stderr = message;
        let code = match error {
            ServiceError::AuthorizationDenied(_) => AUTH_DENIED_RETURN_CODE,
            _ => FAILURE_RETURN_CODE,
        };
        record.finish(code);
        self.recorder.record(path, record);
        record.clone()
    }

    /// Start a record carrying the breadcrumb and config snapshot.
    fn begin_record(
        &self,
        operation: Operation,
        filename: &str,
        breadcrumb: &Breadcrumb,
    ) -> ExecutionRecord {
        ExecutionRecord::begin(
            operation,
            filename,
            breadcrumb.clone(),
            self.config.config_items().to_vec(),
        )
    }

    /// The total environment the script would observe.
    fn resolved_env(
        &self,
        token: &TokenContext,
        breadcrumb: &Breadcrumb,
        sanitized: &SanitizedEnv,
        stack: &[String],
    ) -> HashMap<String, String> {
        let system = SystemEnv {
            api_token: token.raw_bearer.clone(),
            correlation_id: breadcrumb.correlation_id.clone(),
            base_url: self.config.api_base_url(),
            recursion_stack_json: serde_json::to_string(stack)
                .unwrap_or_else(|_| "[]".to_string()),
        };
        compose_environment(sanitized, &system)
    }

    /// Resolve an inbound filename against the runbooks directory.
    ///
    /// The filename must equal its own basename, carry no separators or
    /// leading dot-segments, and canonicalize to a regular file inside the
    /// runbooks directory.
    fn resolve(&self, filename: &str) -> ServiceResult<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.starts_with('.')
        {
            return Err(ServiceError::BadFilename(filename.to_string()));
        }
        let is_basename = Path::new(filename)
            .file_name()
            .is_some_and(|name| name == filename);
        if !is_basename {
            return Err(ServiceError::BadFilename(filename.to_string()));
        }

        let candidate = self.config.runbooks_dir.join(filename);
        let Ok(canonical) = candidate.canonicalize() else {
            return Err(ServiceError::NotFound(filename.to_string()));
        };
        let canonical_dir = self
            .config
            .runbooks_dir
            .canonicalize()
            .map_err(|e| ServiceError::Internal(format!("runbooks directory: {e}")))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(ServiceError::BadFilename(filename.to_string()));
        }
        if !canonical.is_file() {
            return Err(ServiceError::NotFound(filename.to_string()));
        }
        Ok(canonical)
    }
}
