//! The overseer: turns a set of requested sections and actions into one
//! verified, locked, ordered run.
//!
//! Everything that can be checked without side effects is checked first and
//! reported as a whole: missing sections, unreachable endpoints and action
//! misconfiguration. Only then is the run lock taken and the actions executed,
//! standalone actions first, then each section in the order requested. The
//! lock is released on every path out of [`Overseer::run`].

use crate::action::{Action, ActionRegistry};
use crate::dates::{format_date, DateChunk};
use crate::error::{EtlError, Result};
use crate::etl_config::{EtlConfiguration, UTILITY_ENDPOINT};
use crate::lock::LockFile;
use crate::options::ActionOptions;
use crate::overseer_options::OverseerOptions;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    EndpointsVerified,
    ActionsVerified,
    Locked,
    Executing,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::EndpointsVerified => "endpoints_verified",
            RunState::ActionsVerified => "actions_verified",
            RunState::Locked => "locked",
            RunState::Executing => "executing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// What a run did, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dryrun: bool,
    pub chunks: Vec<DateChunk>,
    /// Actions that completed, in execution order.
    pub executed: Vec<String>,
    /// Actions that failed with `stop_on_exception` off; the run went on.
    pub failed: Vec<String>,
    /// Disabled actions left out of the run.
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// Overseer
// ---------------------------------------------------------------------------

/// A planned run: the actions to execute, grouped as requested.
struct Plan {
    standalone: Vec<ActionOptions>,
    sections: Vec<(String, Vec<ActionOptions>)>,
    skipped: Vec<String>,
    /// Requested actions that could not be resolved, reported with the
    /// action verification failures.
    rejected: Vec<(String, String)>,
}

pub struct Overseer<'a> {
    options: OverseerOptions,
    config: &'a EtlConfiguration,
    registry: &'a ActionRegistry,
    state: RunState,
    run_id: Uuid,
}

impl<'a> Overseer<'a> {
    pub fn new(
        options: OverseerOptions,
        config: &'a EtlConfiguration,
        registry: &'a ActionRegistry,
    ) -> Self {
        Overseer {
            options,
            config,
            registry,
            state: RunState::Idle,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn options(&self) -> &OverseerOptions {
        &self.options
    }

    /// Directory holding the run locks: the configured one or the system
    /// temporary directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.options
            .lock_dir()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let span = info_span!("run", run_id = %self.run_id);
        let _guard = span.enter();

        let mut summary = RunSummary {
            run_id: self.run_id,
            dryrun: self.options.is_dryrun(),
            chunks: self.options.chunks().to_vec(),
            executed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };
        if self.options.actions().is_empty() && self.options.sections().is_empty() {
            info!("No actions or sections requested, exiting.");
            self.state = RunState::Done;
            return Ok(summary);
        }

        match self.prepare_and_execute(&mut summary) {
            Ok(()) => {
                self.state = RunState::Done;
                info!(
                    executed = summary.executed.len(),
                    failed = summary.failed.len(),
                    "run complete"
                );
                Ok(summary)
            }
            Err(e) => {
                self.state = RunState::Failed;
                error!(error = %e, "run failed");
                Err(e)
            }
        }
    }

    fn prepare_and_execute(&mut self, summary: &mut RunSummary) -> Result<()> {
        self.load_resource_codes()?;
        let plan = self.plan()?;
        summary.skipped = plan.skipped.clone();

        self.verify_endpoints(&plan)?;
        self.state = RunState::EndpointsVerified;

        let (mut standalone, mut sections) = self.verify_actions(&plan)?;
        self.state = RunState::ActionsVerified;

        let mut names: Vec<String> = Vec::new();
        for action in standalone
            .iter()
            .chain(sections.iter().flat_map(|(_, actions)| actions.iter()))
        {
            if !names.iter().any(|n| n == action.name()) {
                names.push(action.name().to_string());
            }
        }

        let mut lock = LockFile::new(self.lock_dir(), self.options.lock_file_prefix());
        lock.lock(&names)?;
        self.state = RunState::Locked;

        let result = self.execute_all(&mut standalone, &mut sections, summary);
        let released = lock.unlock();
        for endpoint in self.config.data_endpoints() {
            endpoint.disconnect();
        }
        result?;
        released
    }

    /// Resource filters need the code map before anything else is checked.
    fn load_resource_codes(&self) -> Result<()> {
        if !self.options.has_resource_filters() {
            return Ok(());
        }
        if self.options.resource_code_map().is_none() {
            let endpoint = self.config.global_endpoint(UTILITY_ENDPOINT).ok_or_else(|| {
                EtlError::ConfigInvalid(
                    "resource filters require a global utility endpoint".into(),
                )
            })?;
            self.options.load_resource_code_map(endpoint.as_ref())?;
        }
        let mut codes = self.options.include_only_resource_codes().to_vec();
        codes.extend_from_slice(self.options.exclude_resource_codes());
        self.options.resource_ids(&codes).map(|_| ())
    }

    fn plan(&self) -> Result<Plan> {
        let mut missing = Vec::new();
        let mut skipped = Vec::new();
        let include = |options: &ActionOptions, skipped: &mut Vec<String>| {
            if options.enabled || self.options.is_force() {
                true
            } else {
                info!(action = %options.name, "action disabled, skipping");
                skipped.push(options.name.clone());
                false
            }
        };

        let mut standalone = Vec::new();
        let mut rejected = Vec::new();
        for requested in self.options.actions() {
            let (section, action) = match self.config.parse_action_name(requested) {
                Ok(parsed) => parsed,
                Err(e) => {
                    rejected.push((requested.clone(), e.to_string()));
                    continue;
                }
            };
            if !self.config.section_exists(&section) {
                if !missing.contains(&section) {
                    missing.push(section);
                }
                continue;
            }
            match self.config.action_options(&action, &section) {
                Ok(options) => {
                    if include(options, &mut skipped) {
                        standalone.push(options.clone());
                    }
                }
                Err(e) => rejected.push((action, e.to_string())),
            }
        }

        let mut sections = Vec::new();
        for requested in self.options.sections() {
            let qualified = self.config.qualify_section_name(requested);
            let Some(section) = self.config.section(&qualified) else {
                if !missing.contains(&qualified) {
                    missing.push(qualified);
                }
                continue;
            };
            let actions = section
                .actions()
                .iter()
                .filter(|a| include(*a, &mut skipped))
                .cloned()
                .collect();
            sections.push((qualified, actions));
        }

        if !missing.is_empty() {
            return Err(EtlError::UnknownSections(missing));
        }
        Ok(Plan {
            standalone,
            sections,
            skipped,
            rejected,
        })
    }

    fn planned<'p>(plan: &'p Plan) -> impl Iterator<Item = &'p ActionOptions> {
        plan.standalone
            .iter()
            .chain(plan.sections.iter().flat_map(|(_, actions)| actions.iter()))
    }

    fn verify_endpoints(&self, plan: &Plan) -> Result<()> {
        let mut keys = BTreeSet::new();
        for options in Self::planned(plan) {
            for (_, key) in options.endpoints.iter() {
                keys.insert(key.to_string());
            }
        }
        let mut failures = Vec::new();
        for key in &keys {
            let Some(endpoint) = self.config.data_endpoint(key) else {
                failures.push(format!("{key}: not defined"));
                continue;
            };
            debug!(endpoint = %key, "verifying data endpoint");
            if let Err(e) = endpoint.verify(self.options.is_dryrun(), true) {
                failures.push(format!("{key}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EtlError::EndpointVerification(failures))
        }
    }

    #[allow(clippy::type_complexity)]
    fn verify_actions(
        &self,
        plan: &Plan,
    ) -> Result<(Vec<Box<dyn Action>>, Vec<(String, Vec<Box<dyn Action>>)>)> {
        let mut failures = plan.rejected.clone();
        let mut build = |options: &ActionOptions| -> Option<Box<dyn Action>> {
            match self.prepare_action(options) {
                Ok(action) => Some(action),
                Err(e) => {
                    failures.push((options.name.clone(), e.to_string()));
                    None
                }
            }
        };
        let standalone: Vec<Box<dyn Action>> =
            plan.standalone.iter().filter_map(&mut build).collect();
        let sections: Vec<(String, Vec<Box<dyn Action>>)> = plan
            .sections
            .iter()
            .map(|(name, actions)| (name.clone(), actions.iter().filter_map(&mut build).collect()))
            .collect();

        if failures.is_empty() {
            Ok((standalone, sections))
        } else {
            Err(EtlError::ActionVerification(failures))
        }
    }

    fn prepare_action(&self, options: &ActionOptions) -> Result<Box<dyn Action>> {
        let mut action = self.registry.create(options.clone(), self.config)?;
        action.verify(&self.options)?;
        action.initialize(&self.options)?;
        debug!(action = %action, "verified and initialized");
        Ok(action)
    }

    fn execute_all(
        &mut self,
        standalone: &mut [Box<dyn Action>],
        sections: &mut [(String, Vec<Box<dyn Action>>)],
        summary: &mut RunSummary,
    ) -> Result<()> {
        self.state = RunState::Executing;
        for action in standalone.iter_mut() {
            self.execute_action(action.as_mut(), summary)?;
        }
        for (name, actions) in sections.iter_mut() {
            info!(section = %name, "start processing section");
            for action in actions.iter_mut() {
                self.execute_action(action.as_mut(), summary)?;
            }
            info!(section = %name, "end processing section");
        }
        Ok(())
    }

    fn execute_action(&self, action: &mut dyn Action, summary: &mut RunSummary) -> Result<()> {
        let chunks: Vec<DateChunk> = if action.supports_date_range_chunking() {
            self.options.chunks().to_vec()
        } else {
            vec![self.options.full_range()]
        };
        for chunk in &chunks {
            action.base_mut().set_current_chunk(chunk);
            debug!(
                action = %action.name(),
                chunk_start = %format_date(&chunk.start),
                chunk_end = %format_date(&chunk.end),
                "executing action"
            );
            if let Err(e) = action.execute(&self.options, chunk) {
                let e = EtlError::in_action(action.name(), e);
                if action.options().stop_on_exception {
                    return Err(e);
                }
                warn!(action = %action.name(), error = %e, "action failed, continuing");
                summary.failed.push(action.name().to_string());
                return Ok(());
            }
        }
        summary.executed.push(action.name().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRegistry;
    use crate::etl_config::ConfigSettings;
    use crate::lock::list_records;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: EtlConfiguration,
        registry: ActionRegistry,
    }

    impl Fixture {
        fn new(doc: Value) -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("locks")).unwrap();
            fs::write(dir.path().join("etl.json"), doc.to_string()).unwrap();
            let config = EtlConfiguration::load(
                dir.path().join("etl.json"),
                &EndpointRegistry::with_builtin(),
                &ConfigSettings::default(),
            )
            .unwrap();
            Fixture {
                dir,
                config,
                registry: ActionRegistry::with_builtin(),
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn options(&self, extra: Value) -> OverseerOptions {
            let mut map = json!({
                "lock-dir": self.path().join("locks").display().to_string(),
                "start-date": "2020-01-01 00:00:00",
                "end-date": "2020-01-22 00:00:00"
            });
            for (k, v) in extra.as_object().unwrap() {
                map[k] = v.clone();
            }
            OverseerOptions::from_map(map.as_object().unwrap()).unwrap()
        }

        fn run(&self, extra: Value) -> (Result<RunSummary>, RunState) {
            let mut overseer = Overseer::new(self.options(extra), &self.config, &self.registry);
            let result = overseer.run();
            (result, overseer.state())
        }

        fn lines(&self, file: &str) -> Vec<String> {
            fs::read_to_string(self.path().join(file))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn command(name: &str, cmd: &str) -> Value {
        json!({"name": name, "commands": cmd})
    }

    fn doc(sections: Value) -> Value {
        let mut doc = json!({
            "paths": {},
            "defaults": {"global": {
                "class": "ExecuteCommand",
                "factory": "MaintenanceFactory",
                "enabled": true
            }}
        });
        for (k, v) in sections.as_object().unwrap() {
            doc[k] = v.clone();
        }
        doc
    }

    #[test]
    fn standalone_actions_run_before_sections_in_request_order() {
        let fx = Fixture::new(doc(json!({
            "first": [command("a", "echo first.a >> log"), command("b", "echo first.b >> log")],
            "second": [command("c", "echo second.c >> log")]
        })));
        let (result, state) = fx.run(json!({
            "process-sections": ["second", "etl.first"],
            "actions": ["first.b"]
        }));
        let summary = result.unwrap();
        assert_eq!(state, RunState::Done);
        assert_eq!(fx.lines("log"), ["first.b", "second.c", "first.a", "first.b"]);
        assert_eq!(
            summary.executed,
            ["etl.first.b", "etl.second.c", "etl.first.a", "etl.first.b"]
        );
        assert!(list_records(&fx.path().join("locks"), "etl-overseer-").unwrap().is_empty());
    }

    #[test]
    fn failure_with_stop_on_exception_off_continues() {
        let fx = Fixture::new(doc(json!({
            "jobs": [
                {"name": "bad", "commands": "exit 1", "stop_on_exception": false},
                command("good", "touch good")
            ]
        })));
        let (result, state) = fx.run(json!({"process-sections": "jobs"}));
        let summary = result.unwrap();
        assert_eq!(state, RunState::Done);
        assert_eq!(summary.failed, ["etl.jobs.bad"]);
        assert_eq!(summary.executed, ["etl.jobs.good"]);
        assert!(fx.path().join("good").exists());
    }

    #[test]
    fn failure_stops_run_and_releases_lock() {
        let fx = Fixture::new(doc(json!({
            "jobs": [command("bad", "exit 1"), command("never", "touch never")]
        })));
        let (result, state) = fx.run(json!({"process-sections": "jobs"}));
        match result {
            Err(EtlError::ActionExecution { action, source }) => {
                assert_eq!(action, "etl.jobs.bad");
                assert!(matches!(*source, EtlError::CommandFailed { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state, RunState::Failed);
        assert!(!fx.path().join("never").exists());
        assert!(fs::read_dir(fx.path().join("locks")).unwrap().next().is_none());
    }

    #[test]
    fn missing_sections_are_reported_together() {
        let fx = Fixture::new(doc(json!({"jobs": [command("a", "true")]})));
        match fx.run(json!({"process-sections": ["nope", "jobs", "gone"], "actions": ["other.x"]})).0 {
            Err(EtlError::UnknownSections(names)) => {
                assert_eq!(names, ["etl.other", "etl.nope", "etl.gone"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn endpoint_failures_are_aggregated() {
        let fx = Fixture::new(doc(json!({"jobs": [
            {"name": "a", "commands": "true",
             "endpoints": {"source": {"type": "jsonfile", "path": "missing/a.json"}}},
            {"name": "b", "commands": "true",
             "endpoints": {"source": {"type": "directory", "path": "missing"}}}
        ]})));
        let (result, state) = fx.run(json!({"process-sections": "jobs"}));
        match result {
            Err(EtlError::EndpointVerification(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state, RunState::Failed);
    }

    #[test]
    fn action_failures_are_aggregated_and_nothing_runs() {
        let fx = Fixture::new(doc(json!({"jobs": [
            {"name": "a"},
            command("b", "touch b"),
            {"name": "c", "class": "Missing"}
        ]})));
        match fx.run(json!({"process-sections": "jobs"})).0 {
            Err(EtlError::ActionVerification(failures)) => {
                let names: Vec<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, ["etl.jobs.a", "etl.jobs.c"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.path().join("b").exists());
    }

    #[test]
    fn unresolved_requested_actions_are_reported_together() {
        let fx = Fixture::new(doc(json!({"jobs": [command("a", "touch a")]})));
        let (result, state) = fx.run(json!({"actions": ["jobs.x", "jobs.a", "jobs.y", "bad"]}));
        match result {
            Err(EtlError::ActionVerification(failures)) => {
                let names: Vec<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, ["etl.jobs.x", "etl.jobs.y", "bad"]);
                assert!(failures[0].1.contains("not found in section"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state, RunState::Failed);
        assert!(!fx.path().join("a").exists());
    }

    #[test]
    fn section_actions_see_files_written_earlier_in_the_run() {
        let fx = Fixture::new(doc(json!({"pipeline": [
            command("refresh", r#"echo '{"rows": [2]}' > in.json"#),
            {
                "name": "ingest",
                "class": "StructuredFileIngestor",
                "factory": "IngestorFactory",
                "record_pointer": "/rows",
                "truncate_destination": true,
                "endpoints": {
                    "source": {"type": "jsonfile", "path": "in.json"},
                    "destination": {"type": "jsonfile", "path": "out.json"}
                }
            }
        ]})));
        fs::write(fx.path().join("in.json"), r#"{"rows": [1]}"#).unwrap();

        let summary = fx.run(json!({"process-sections": "pipeline"})).0.unwrap();
        assert_eq!(summary.executed, ["etl.pipeline.refresh", "etl.pipeline.ingest"]);
        let out: Value =
            serde_json::from_str(&fs::read_to_string(fx.path().join("out.json")).unwrap())
                .unwrap();
        assert_eq!(out, json!([2]));
    }

    #[test]
    fn disabled_actions_are_skipped_unless_forced() {
        let fx = Fixture::new(doc(json!({"jobs": [
            {"name": "off", "commands": "touch off", "enabled": false},
            command("on", "touch on")
        ]})));
        let summary = fx.run(json!({"process-sections": "jobs"})).0.unwrap();
        assert_eq!(summary.skipped, ["etl.jobs.off"]);
        assert!(!fx.path().join("off").exists());

        let summary = fx.run(json!({"process-sections": "jobs", "force": true})).0.unwrap();
        assert!(summary.skipped.is_empty());
        assert!(fx.path().join("off").exists());
    }

    #[test]
    fn chunked_actions_run_most_recent_first() {
        let fx = Fixture::new(doc(json!({"jobs": [
            {"name": "c", "chunked": true, "commands": "echo ${CURRENT_START_DATE} >> chunks"},
            command("once", "echo ${CURRENT_START_DATE} >> once")
        ]})));
        let summary = fx
            .run(json!({"process-sections": "jobs", "chunk-size-days": 7}))
            .0
            .unwrap();
        assert_eq!(summary.chunks.len(), 3);
        assert_eq!(
            fx.lines("chunks"),
            ["2020-01-15 00:00:01", "2020-01-08 00:00:01", "2020-01-01 00:00:00"]
        );
        assert_eq!(fx.lines("once"), ["2020-01-01 00:00:00"]);
    }

    #[test]
    fn overlapping_run_is_refused_before_executing() {
        let fx = Fixture::new(doc(json!({"jobs": [command("a", "touch ran")]})));
        let mut held = LockFile::with_pid(fx.path().join("locks"), "etl-overseer-", 1);
        held.lock(&["etl.jobs.a".to_string()]).unwrap();

        match fx.run(json!({"process-sections": "jobs"})).0 {
            Err(EtlError::LockConflict { pid, actions }) => {
                assert_eq!(pid, 1);
                assert_eq!(actions, ["etl.jobs.a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.path().join("ran").exists());

        held.unlock().unwrap();
        fx.run(json!({"process-sections": "jobs"})).0.unwrap();
        assert!(fx.path().join("ran").exists());
    }

    #[test]
    fn resource_filters_need_known_codes() {
        let mut d = doc(json!({"jobs": [command("a", "echo ${RESOURCE_ID} > id")]}));
        d["defaults"]["global"]["endpoints"] =
            json!({"utility": {"type": "jsonfile", "path": "codes.json"}});
        let fx = Fixture::new(d);
        fs::write(fx.path().join("codes.json"), r#"{"frearson": 7}"#).unwrap();

        match fx.run(json!({"process-sections": "jobs", "include-only-resource-codes": "nope"})).0 {
            Err(EtlError::UnknownResourceCode(codes)) => assert_eq!(codes, ["nope"]),
            other => panic!("unexpected {other:?}"),
        }
        fx.run(json!({"process-sections": "jobs", "include-only-resource-codes": "frearson"}))
            .0
            .unwrap();
        assert_eq!(fx.lines("id"), ["7"]);
    }

    #[test]
    fn nothing_requested_is_a_clean_exit() {
        let fx = Fixture::new(doc(json!({"jobs": []})));
        let (result, state) = fx.run(json!({}));
        assert!(result.unwrap().executed.is_empty());
        assert_eq!(state, RunState::Done);
    }
}
