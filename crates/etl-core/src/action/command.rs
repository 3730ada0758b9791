use super::{Action, ActionBase};
use crate::dates::{format_date, DateChunk};
use crate::error::{EtlError, Result};
use crate::etl_config::EtlConfiguration;
use crate::options::ActionOptions;
use crate::overseer_options::OverseerOptions;
use crate::paths::BASE_DIR_KEY;
use crate::query::Query;
use serde_json::{Map, Value};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

const COMMANDS_KEY: &str = "commands";
const RESTRICTIONS_KEY: &str = "overseer_restrictions";

/// Variable holding the restriction clause for the current chunk.
pub const RESTRICTIONS_VARIABLE: &str = "OVERSEER_RESTRICTIONS";

/// Maintenance action running shell commands. Commands come from the
/// `commands` option or the definition file's `commands` key and may use
/// `${VARIABLE}` references, all of which must resolve. With `chunked` set the
/// commands run once per date chunk.
///
/// When `overseer_restrictions` templates are declared, the clauses filled in
/// for the current chunk are joined into `${OVERSEER_RESTRICTIONS}`.
pub struct ExecuteCommand {
    base: ActionBase,
    commands: Vec<String>,
    chunked: bool,
    working_dir: PathBuf,
    query: Query,
}

impl ExecuteCommand {
    pub fn create(options: ActionOptions, config: &EtlConfiguration) -> Result<Box<dyn Action>> {
        let working_dir = options
            .extra_str("working_dir")
            .map(PathBuf::from)
            .or_else(|| options.path(BASE_DIR_KEY).map(PathBuf::from))
            .unwrap_or_else(|| config.base_dir().to_path_buf());
        Ok(Box::new(ExecuteCommand {
            base: ActionBase::new(options, config)?,
            commands: Vec::new(),
            chunked: false,
            working_dir,
            query: Query::new(),
        }))
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl Action for ExecuteCommand {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn verify(&mut self, run: &OverseerOptions) -> Result<()> {
        if self.base.is_verified() {
            return Ok(());
        }
        let mut commands = self.base.options().extra_strings(COMMANDS_KEY)?;
        let mut restrictions = self.base.options().extra(RESTRICTIONS_KEY).cloned();
        if let Some(doc) = self.base.load_definition()? {
            if commands.is_none() {
                commands = doc.section(COMMANDS_KEY).map(command_list).transpose()?;
            }
            if restrictions.is_none() {
                restrictions = doc.section(RESTRICTIONS_KEY).cloned();
            }
        }
        if let Some(restrictions) = restrictions {
            let mut definition = Map::new();
            definition.insert(RESTRICTIONS_KEY.to_string(), restrictions);
            self.query = Query::from_definition(&Value::Object(definition))?;
            if self.base.resource_endpoint().is_none() {
                return Err(EtlError::ConfigInvalid(format!(
                    "action '{}' declares {RESTRICTIONS_KEY} but has no utility endpoint to quote values",
                    self.base.name()
                )));
            }
        }
        self.commands = commands.ok_or_else(|| EtlError::MissingOptions {
            name: self.base.name().to_string(),
            missing: vec![COMMANDS_KEY.to_string()],
        })?;
        self.chunked = self.base.options().extra_bool("chunked", false)?;

        which::which("sh").map_err(|e| EtlError::CommandFailed {
            command: "sh".into(),
            message: e.to_string(),
        })?;
        if !self.working_dir.is_dir() {
            return Err(EtlError::invalid_option(
                "working_dir",
                format!("{} is not a directory", self.working_dir.display()),
            ));
        }
        self.base.verify_resources(run)?;
        self.base.mark_verified();
        Ok(())
    }

    fn execute(&mut self, run: &OverseerOptions, chunk: &DateChunk) -> Result<()> {
        if !self.query.restriction_templates().is_empty() {
            let overrides = self.restriction_overrides();
            if let Some(endpoint) = self.base.resource_endpoint() {
                run.apply_overseer_restrictions(
                    &mut self.query,
                    endpoint.as_ref(),
                    chunk,
                    &overrides,
                )?;
            }
            let clause = self.query.where_clause().unwrap_or_else(|| "1 = 1".into());
            self.base.variables_mut().overwrite(RESTRICTIONS_VARIABLE, clause);
        }

        let prefix = format!("{}: command", self.base.name());
        for template in &self.commands {
            let command = self.base.variables().substitute(template, Some(&prefix))?;
            if run.is_dryrun() {
                info!(action = %self.base.name(), command = %command, "dryrun, not executing");
                continue;
            }
            info!(
                action = %self.base.name(),
                chunk_start = %format_date(&chunk.start),
                chunk_end = %format_date(&chunk.end),
                command = %command,
                "executing command"
            );
            let output = run_shell(&command, &self.working_dir)?;
            if !output.is_empty() {
                debug!(action = %self.base.name(), output = %output, "command output");
            }
        }
        Ok(())
    }

    fn supports_date_range_chunking(&self) -> bool {
        self.chunked
    }
}

impl fmt::Display for ExecuteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base.describe(f)
    }
}

fn command_list(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str().map(str::to_string).ok_or_else(|| {
                    EtlError::invalid_option(COMMANDS_KEY, format!("'{i}' is not a string"))
                })
            })
            .collect(),
        other => Err(EtlError::invalid_option(
            COMMANDS_KEY,
            format!("expected a string or a list of strings, got {other}"),
        )),
    }
}

/// Run `command` through `sh -c` and return its combined output. Stdout and
/// stderr are drained on their own threads so a chatty command cannot fill a
/// pipe and stall.
fn run_shell(command: &str, cwd: &Path) -> Result<String> {
    let failed = |message: String| EtlError::CommandFailed {
        command: command.to_string(),
        message,
    };
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failed(format!("failed to spawn: {e}")))?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || drain(stdout_handle));
    let stderr_thread = std::thread::spawn(move || drain(stderr_handle));

    let status = child
        .wait()
        .map_err(|e| failed(format!("wait failed: {e}")))?;
    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    let output = combine_output(&stdout, &stderr);

    if status.success() {
        Ok(output)
    } else {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        Err(failed(if output.is_empty() {
            format!("exit status {code}")
        } else {
            format!("exit status {code}: {output}")
        }))
    }
}

/// Everything the pipe produced, with invalid UTF-8 replaced. A read error
/// keeps whatever arrived before it.
fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut r) = pipe {
        if let Err(e) = r.read_to_end(&mut buf) {
            debug!("stopped reading command output: {e}");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Join stdout and stderr, keeping at most the last 10KB.
fn combine_output(stdout: &str, stderr: &str) -> String {
    const MAX_OUTPUT: usize = 10 * 1024;
    let output = match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{out}\n{err}"),
    };
    if output.len() <= MAX_OUTPUT {
        return output;
    }
    let mut start = output.len() - MAX_OUTPUT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::endpoint::EndpointRegistry;
    use crate::etl_config::ConfigSettings;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn action(dir: &Path, extra: Value) -> Box<dyn Action> {
        let mut obj = json!({"name": "cmd", "class": "ExecuteCommand", "factory": "MaintenanceFactory"});
        for (k, v) in extra.as_object().unwrap() {
            obj[k] = v.clone();
        }
        let doc = json!({"paths": {"action_definition_dir": "defs"}, "jobs": [obj]});
        fs::write(dir.join("etl.json"), doc.to_string()).unwrap();
        let config = EtlConfiguration::load(
            dir.join("etl.json"),
            &EndpointRegistry::with_builtin(),
            &ConfigSettings::default(),
        )
        .unwrap();
        let options = config.sections()[0].actions()[0].clone();
        ActionRegistry::with_builtin().create(options, &config).unwrap()
    }

    fn run(map: Value) -> OverseerOptions {
        OverseerOptions::from_map(map.as_object().unwrap()).unwrap()
    }

    fn execute(action: &mut Box<dyn Action>, run: &OverseerOptions) -> Result<()> {
        action.verify(run)?;
        action.initialize(run)?;
        action.execute(run, &run.full_range())
    }

    #[test]
    fn commands_run_in_order_with_variables() {
        let dir = TempDir::new().unwrap();
        let mut a = action(
            dir.path(),
            json!({
                "commands": ["echo ${GREETING} > out.txt", "echo ${START_DATE} >> out.txt"],
                "variables": {"GREETING": "hello"}
            }),
        );
        let r = run(json!({"start-date": "2020-01-01 00:00:00", "end-date": "2020-01-02"}));
        execute(&mut a, &r).unwrap();
        let out = fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, "hello\n2020-01-01 00:00:00\n");
    }

    #[test]
    fn dryrun_does_not_execute() {
        let dir = TempDir::new().unwrap();
        let mut a = action(dir.path(), json!({"commands": "touch marker"}));
        execute(&mut a, &run(json!({"dryrun": true}))).unwrap();
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn failing_command_reports_status_and_output() {
        let dir = TempDir::new().unwrap();
        let mut a = action(dir.path(), json!({"commands": "echo broken >&2; exit 3"}));
        match execute(&mut a, &run(json!({}))) {
            Err(EtlError::CommandFailed { message, .. }) => {
                assert_eq!(message, "exit status 3: broken");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_utf8_output_is_kept() {
        let dir = TempDir::new().unwrap();
        let mut a = action(
            dir.path(),
            json!({"commands": r"printf 'partial\377output' >&2; exit 5"}),
        );
        match execute(&mut a, &run(json!({}))) {
            Err(EtlError::CommandFailed { message, .. }) => {
                assert_eq!(message, "exit status 5: partial\u{FFFD}output");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unresolved_variable_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut a = action(dir.path(), json!({"commands": "echo ${MISSING}"}));
        assert!(matches!(
            execute(&mut a, &run(json!({}))),
            Err(EtlError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn commands_from_definition_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("defs")).unwrap();
        fs::write(
            dir.path().join("defs/cleanup.json"),
            r##"{"#": "cleanup", "commands": ["touch from-definition"]}"##,
        )
        .unwrap();
        let mut a = action(dir.path(), json!({"definition_file": "cleanup.json", "chunked": "yes"}));
        execute(&mut a, &run(json!({}))).unwrap();
        assert!(dir.path().join("from-definition").exists());
        assert!(a.supports_date_range_chunking());
    }

    #[test]
    fn missing_commands_fail_verification() {
        let dir = TempDir::new().unwrap();
        let mut a = action(dir.path(), json!({}));
        match a.verify(&run(json!({}))) {
            Err(EtlError::MissingOptions { name, missing }) => {
                assert_eq!(name, "etl.jobs.cmd");
                assert_eq!(missing, ["commands"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!a.is_verified());
    }

    #[test]
    fn repeated_verification_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut a = action(dir.path(), json!({"commands": "true"}));
        let r = run(json!({}));
        a.verify(&r).unwrap();
        assert!(a.is_verified());
        a.verify(&r).unwrap();
        assert!(a.is_verified());
    }

    #[test]
    fn restrictions_are_exposed_per_chunk() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("codes.json"), r#"{"frearson": 1, "mortorq": 2}"#).unwrap();
        let mut a = action(
            dir.path(),
            json!({
                "commands": "echo \"${OVERSEER_RESTRICTIONS}\" >> where.txt",
                "chunked": true,
                "exclude_resource_codes": ["mortorq"],
                "endpoints": {"utility": {"type": "jsonfile", "path": "codes.json"}},
                "overseer_restrictions": {
                    "start_date": "end >= ${VALUE}",
                    "exclude_resource_codes": "resource_id NOT IN ${VALUE}"
                }
            }),
        );
        let r = run(json!({
            "start-date": "2020-01-01 00:00:00",
            "end-date": "2020-01-10 00:00:00",
            "chunk-size-days": 5
        }));
        a.verify(&r).unwrap();
        a.initialize(&r).unwrap();
        for chunk in r.chunks() {
            a.execute(&r, chunk).unwrap();
        }
        let out = fs::read_to_string(dir.path().join("where.txt")).unwrap();
        assert_eq!(
            out,
            "end >= '2020-01-05 00:00:01' AND resource_id NOT IN (2)\n\
             end >= '2020-01-01 00:00:00' AND resource_id NOT IN (2)\n"
        );
    }

    #[test]
    fn restrictions_need_an_endpoint() {
        let dir = TempDir::new().unwrap();
        let mut a = action(
            dir.path(),
            json!({"commands": "true", "overseer_restrictions": {"start_date": "x >= ${VALUE}"}}),
        );
        assert!(matches!(a.verify(&run(json!({}))), Err(EtlError::ConfigInvalid(_))));
    }

    #[test]
    fn output_is_combined_and_capped() {
        assert_eq!(combine_output("out\n", ""), "out");
        assert_eq!(combine_output("", "err"), "err");
        assert_eq!(combine_output("a", "b"), "a\nb");
        let long = "x".repeat(20 * 1024);
        assert_eq!(combine_output(&long, "").len(), 10 * 1024);
    }
}
