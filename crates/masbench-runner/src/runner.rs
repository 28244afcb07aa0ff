// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Episode runner: drives exactly one episode end-to-end on a device handle
//! and produces a sealed evidence pack plus the audit verdict.
//!
//! Lifecycle (fixed order): reset, health probe, oracle pre-checks, step
//! loop, oracle post-checks, classification, seal, detectors, assertions.
//! The episode deadline is authoritative; expiry cancels the in-flight
//! collaborator call, writes a timeout marker, and still runs post-checks
//! and the audit on whatever evidence exists.

use crate::normalizer::{normalize_action, WARN_REF_MISMATCH};
use masbench_audit::{run_audit, CaseContext};
use masbench_core::device::{
    AgentControl, AgentReply, AgentStatus, Deadline, DeviceControl, Observation,
};
use masbench_core::digest::{sha256_bytes, stable_sha256};
use masbench_core::error::{HarnessError, HarnessResult};
use masbench_core::evidence::manifest::{
    write_json_atomic, ActionTraceLevel, AuditBlock, Availability, EvalMode, EvidenceTrustLevel,
    ExecutionMode, FailureClass, GuardUnenforcedReason, OracleDecision, RunManifest, Summary,
    TaskSuccess,
};
use masbench_core::evidence::observation::{compute_obs_digests, OBS_DIGEST_VERSION};
use masbench_core::evidence::pack::{PackPaths, SealedPack, CRASH_JSON, ENV_CAPABILITIES_JSON, RUN_MANIFEST_JSON};
use masbench_core::evidence::records::*;
use masbench_core::evidence::writer::{BlobStore, EvidenceWriter};
use masbench_core::facts::{AssertionRecord, Fact, OracleSource};
use masbench_core::policy::compile_baseline;
use masbench_core::profile::EnvProfile;
use masbench_core::spec::CaseBundle;
use masbench_core::timewin::{host_utc_ms, probe_device_epoch_time_ms, EpisodeTime};
use masbench_oracles::capabilities::probe_env_capabilities;
use masbench_oracles::{Oracle, OracleContext, OracleRegistry};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_SLACK_MS: u64 = 120_000;
const RETRY_BASE_DELAY_MS: u64 = 200;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub env_profile: EnvProfile,
    pub guard_enforced: bool,
    pub artifacts_root: Option<PathBuf>,
    pub generator: String,
    pub episode_idx: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            env_profile: EnvProfile::MasCore,
            guard_enforced: true,
            artifacts_root: None,
            generator: "masbench-runner".to_string(),
            episode_idx: 1,
        }
    }
}

#[derive(Debug)]
pub struct EpisodeResult {
    pub episode_dir: PathBuf,
    pub summary: Summary,
    pub facts: Vec<Fact>,
    pub assertions: Vec<AssertionRecord>,
}

impl EpisodeResult {
    pub fn failure_class(&self) -> Option<FailureClass> {
        self.summary.failure_class
    }
}

#[derive(Debug, Default)]
struct EpisodeState {
    steps_executed: u32,
    agent_status: Option<AgentStatus>,
    agent_failed_reason: Option<String>,
    infra_failed_reason: Option<String>,
    timed_out: bool,
}

pub struct EpisodeRunner {
    config: RunnerConfig,
}

impl EpisodeRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Drive one episode. The evidence pack is sealed and audited on every
    /// terminal path, including internal errors (which leave a
    /// `crash.json` beside the traces).
    pub fn run(
        &self,
        bundle: &CaseBundle,
        device: &mut dyn DeviceControl,
        agent: &mut dyn AgentControl,
        out_dir: &Path,
        seed: u64,
    ) -> HarnessResult<EpisodeResult> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let run_id = format!("run-{:08x}", rng.gen::<u32>());
        let episode_id = format!("ep-{:016x}", rng.gen::<u64>());
        let episode_token = format!("EP-{:016x}", rng.gen::<u64>());

        let paths = PackPaths::create(out_dir, self.config.episode_idx)?;
        let episode_deadline = Deadline::after(Duration::from_secs(bundle.task.max_seconds));

        let fingerprint = device
            .run_shell("getprop ro.build.fingerprint", episode_deadline.sub_deadline(3_000))
            .ok()
            .map(|out| format!("{}/{}", device.serial(), out.stdout.trim()))
            .filter(|s| !s.ends_with('/'));

        let manifest = RunManifest {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            run_id: run_id.clone(),
            case_id: bundle.task.case_id.clone(),
            env_profile: self.config.env_profile,
            availability: Availability::Runnable,
            execution_mode: ExecutionMode::AgentDriven,
            eval_mode: if bundle.attack.is_some() {
                EvalMode::Adversarial
            } else {
                EvalMode::Benign
            },
            guard_enforced: self.config.guard_enforced,
            guard_unenforced_reason: if self.config.guard_enforced {
                None
            } else {
                Some(GuardUnenforcedReason::GuardDisabled)
            },
            action_trace_level: ActionTraceLevel::L0,
            action_trace_source: "engine_executor".to_string(),
            evidence_trust_level: EvidenceTrustLevel::TcbCaptured,
            oracle_source: OracleSource::DeviceQuery,
            emulator_fingerprint: fingerprint,
            seed,
            generator: self.config.generator.clone(),
            obs_digest_version: OBS_DIGEST_VERSION.to_string(),
            system_internal_allowlist: self
                .config
                .env_profile
                .system_internal_allowlist()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let manifest_errors = manifest.contract_errors();
        if !manifest_errors.is_empty() {
            return Err(HarnessError::SchemaViolation(manifest_errors.join("; ")));
        }
        write_json_atomic(&paths.run_root.join(RUN_MANIFEST_JSON), &manifest)?;

        let capabilities = probe_env_capabilities(
            device,
            self.config.artifacts_root.as_deref(),
            episode_deadline,
        )?;
        write_json_atomic(&paths.run_root.join(ENV_CAPABILITIES_JSON), &capabilities)?;

        let mut writer = EvidenceWriter::create(paths.clone(), OBS_DIGEST_VERSION)?;

        let outcome = self.run_episode(
            bundle,
            device,
            agent,
            &mut writer,
            &capabilities,
            &run_id,
            &episode_token,
            episode_deadline,
        );
        writer.seal()?;

        let (state, oracle_decision, duration_ms) = match outcome {
            Ok(parts) => parts,
            Err(err) => {
                tracing::error!(target: "masbench.episode", error = %err, "episode crashed");
                write_json_atomic(
                    &paths.episode_dir.join(CRASH_JSON),
                    &json!({
                        "error": err.to_string(),
                        "stack_digest": sha256_bytes(err.to_string().as_bytes()),
                    }),
                )?;
                let state = EpisodeState {
                    infra_failed_reason: Some(err.to_string()),
                    ..EpisodeState::default()
                };
                (state, OracleDecision::Inconclusive, 0)
            }
        };

        let task_success = TaskSuccess::from_decision(oracle_decision);
        let failure_class = classify(&state, oracle_decision);
        let reason = terminal_reason(&state, oracle_decision);

        let mut summary = Summary {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            case_id: bundle.task.case_id.clone(),
            episode_id,
            oracle_decision,
            task_success,
            failure_class,
            reason,
            steps_executed: state.steps_executed,
            duration_ms,
            audit: None,
            ambiguities: bundle.ambiguities.clone(),
        };

        // Preliminary summary so the detectors can read the step stats.
        let sealed = SealedPack::open(&paths.episode_dir)?;
        sealed.write_summary(&summary)?;

        let ctx = CaseContext::from_bundle(bundle, self.config.env_profile);
        let baseline = compile_baseline(bundle, self.config.env_profile)?;
        let (facts, assertions, audit) = match run_audit(&sealed, &ctx, &baseline) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::error!(target: "masbench.audit", error = %err, "audit failed");
                (Vec::new(), Vec::new(), AuditBlock::default())
            }
        };
        summary.audit = Some(audit);
        sealed.write_summary(&summary)?;

        tracing::info!(
            target: "masbench.episode",
            case_id = %bundle.task.case_id,
            steps = state.steps_executed,
            decision = ?oracle_decision,
            failure_class = ?failure_class,
            "episode complete"
        );

        Ok(EpisodeResult {
            episode_dir: paths.episode_dir,
            summary,
            facts,
            assertions,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_episode(
        &self,
        bundle: &CaseBundle,
        device: &mut dyn DeviceControl,
        agent: &mut dyn AgentControl,
        writer: &mut EvidenceWriter,
        capabilities: &masbench_core::evidence::manifest::EnvCapabilities,
        run_id: &str,
        episode_token: &str,
        episode_deadline: Deadline,
    ) -> HarnessResult<(EpisodeState, OracleDecision, u64)> {
        let started = Instant::now();
        let mut state = EpisodeState::default();

        // Reset.
        if let Err(err) = device.reset(
            bundle.task.snapshot.as_deref(),
            episode_deadline.sub_deadline(120_000),
        ) {
            record_device_event(writer, "reset_failed", json!({ "error": err.to_string() }))?;
            state.infra_failed_reason = Some(format!("snapshot load failed: {err}"));
            return Ok((state, OracleDecision::Inconclusive, elapsed_ms(started)));
        }
        record_device_event(
            writer,
            "reset",
            json!({ "snapshot": &bundle.task.snapshot, "serial": device.serial() }),
        )?;
        self.pre_case_cleanup(bundle, device, writer, episode_deadline)?;

        // Health probe.
        if let Some(reason) = health_probe(device, writer, episode_deadline)? {
            state.infra_failed_reason = Some(reason);
            return Ok((state, OracleDecision::Inconclusive, elapsed_ms(started)));
        }

        // Episode time anchor, from the device clock.
        let t0_device = probe_device_epoch_time_ms(device, episode_deadline.sub_deadline(3_000))?;
        let episode_time = EpisodeTime {
            t0_host_utc_ms: host_utc_ms(),
            t0_device_epoch_ms: t0_device,
            slack_ms: bundle.task.time_window_slack_ms.unwrap_or(DEFAULT_SLACK_MS),
        };
        record_device_event(
            writer,
            "episode_time_anchor",
            serde_json::to_value(episode_time)?,
        )?;

        // Build the oracle set: the success oracle plus the implicit diff
        // snapshots the policy baseline depends on.
        let mut oracles = self.build_oracles(bundle)?;
        let oracle_raw = BlobStore::new(
            writer.paths().evidence_dir.join("oracle/raw"),
            "oracle/raw",
        );
        let evidence_dir = writer.paths().evidence_dir.clone();
        let episode_dir = writer.paths().episode_dir.clone();

        // Pre-checks, sorted by oracle name.
        let mut pollution: Option<String> = None;
        for (name, oracle) in oracles.iter_mut() {
            let mut ctx = OracleContext {
                device: &mut *device,
                episode_time,
                episode_dir: &episode_dir,
                evidence_dir: &evidence_dir,
                oracle_raw: &oracle_raw,
                artifacts_root: self.config.artifacts_root.as_deref(),
                run_id,
                episode_token,
                capabilities,
                deadline: episode_deadline,
            };
            let events = oracle.pre_check(&mut ctx)?;
            for event in &events {
                if event.phase == OraclePhase::Pre
                    && event.decision.conclusive
                    && !event.decision.success
                {
                    pollution = Some(format!("{name}: {}", event.decision.reason));
                }
            }
            for event in events {
                writer.append_oracle_event(event)?;
            }
        }
        if let Some(reason) = pollution {
            record_device_event(writer, "pre_check_pollution", json!({ "reason": reason }))?;
            state.infra_failed_reason = Some(format!("pre_check pollution not cleared: {reason}"));
            // Pre-check failures are not recoverable; skip the step loop.
            let decision = self.post_checks(
                device, writer, &mut oracles, &oracle_raw, &episode_dir, &evidence_dir,
                episode_time, run_id, episode_token, capabilities, episode_deadline, bundle,
            )?;
            return Ok((state, decision, elapsed_ms(started)));
        }

        // Step loop.
        self.step_loop(
            bundle,
            device,
            agent,
            writer,
            &mut state,
            episode_deadline,
        )?;

        if state.timed_out {
            record_device_event(writer, "timeout", json!({ "budget_s": bundle.task.max_seconds }))?;
        }

        // Post-checks, deterministic order, best-effort residual deadline.
        let decision = self.post_checks(
            device, writer, &mut oracles, &oracle_raw, &episode_dir, &evidence_dir,
            episode_time, run_id, episode_token, capabilities, episode_deadline, bundle,
        )?;

        Ok((state, decision, elapsed_ms(started)))
    }

    fn build_oracles(
        &self,
        bundle: &CaseBundle,
    ) -> HarnessResult<BTreeMap<String, Box<dyn Oracle>>> {
        let registry = OracleRegistry::builtin();
        let mut oracles: BTreeMap<String, Box<dyn Oracle>> = BTreeMap::new();
        let success_id = bundle.task.success_oracle.oracle.clone();
        oracles.insert(
            success_id.clone(),
            registry.make(&success_id, &bundle.task.success_oracle.params)?,
        );
        if bundle.forbid_install_effective() && success_id != "package_snapshot" {
            oracles.insert(
                "package_snapshot".to_string(),
                registry.make("package_snapshot", &json!({}))?,
            );
        }
        if !bundle.forbid_settings_fields_effective().is_empty()
            && success_id != "settings_snapshot"
        {
            oracles.insert(
                "settings_snapshot".to_string(),
                registry.make("settings_snapshot", &json!({}))?,
            );
        }
        Ok(oracles)
    }

    #[allow(clippy::too_many_arguments)]
    fn post_checks(
        &self,
        device: &mut dyn DeviceControl,
        writer: &mut EvidenceWriter,
        oracles: &mut BTreeMap<String, Box<dyn Oracle>>,
        oracle_raw: &BlobStore,
        episode_dir: &Path,
        evidence_dir: &Path,
        episode_time: EpisodeTime,
        run_id: &str,
        episode_token: &str,
        capabilities: &masbench_core::evidence::manifest::EnvCapabilities,
        episode_deadline: Deadline,
        bundle: &CaseBundle,
    ) -> HarnessResult<OracleDecision> {
        let success_id = &bundle.task.success_oracle.oracle;
        let mut success_decision: Option<Decision> = None;

        for (name, oracle) in oracles.iter_mut() {
            // Residual budget even after episode expiry: post-checks run
            // best-effort so absence of evidence stays measurable.
            let deadline = if episode_deadline.expired() {
                Deadline::after_ms(30_000)
            } else {
                episode_deadline
            };
            let mut ctx = OracleContext {
                device: &mut *device,
                episode_time,
                episode_dir,
                evidence_dir,
                oracle_raw,
                artifacts_root: self.config.artifacts_root.as_deref(),
                run_id,
                episode_token,
                capabilities,
                deadline,
            };
            match oracle.post_check(&mut ctx) {
                Ok(events) => {
                    if name == success_id {
                        success_decision =
                            Some(masbench_oracles::decision_from_events(&events, OraclePhase::Post));
                    }
                    for event in events {
                        writer.append_oracle_event(event)?;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "masbench.oracle",
                        oracle = %name,
                        error = %err,
                        "post_check failed"
                    );
                    if name == success_id {
                        success_decision = Some(Decision::inconclusive(format!(
                            "post_check error: {err}"
                        )));
                    }
                }
            }
        }

        Ok(match success_decision {
            None => OracleDecision::Inconclusive,
            Some(decision) if !decision.conclusive => OracleDecision::Inconclusive,
            Some(decision) if decision.success => OracleDecision::Pass,
            Some(_) => OracleDecision::Fail,
        })
    }

    fn step_loop(
        &self,
        bundle: &CaseBundle,
        device: &mut dyn DeviceControl,
        agent: &mut dyn AgentControl,
        writer: &mut EvidenceWriter,
        state: &mut EpisodeState,
        episode_deadline: Deadline,
    ) -> HarnessResult<()> {
        for step_idx in 0..bundle.task.max_steps {
            if episode_deadline.expired() {
                state.timed_out = true;
                break;
            }

            // Observe.
            let observation = match with_retry(episode_deadline, || {
                device.observe(episode_deadline.sub_deadline(15_000))
            }) {
                Ok(observation) => observation,
                Err(HarnessError::DeadlineExpired(_)) => {
                    state.timed_out = true;
                    break;
                }
                Err(err) => {
                    state.infra_failed_reason = Some(format!("observe failed: {err}"));
                    break;
                }
            };
            let obs_digest = self.record_observation(writer, step_idx, &observation, bundle)?;

            // Ask the agent.
            let reply = match agent.next_action(
                &observation,
                obs_digest.as_deref(),
                episode_deadline,
            ) {
                Ok(reply) => reply,
                Err(HarnessError::DeadlineExpired(_)) => {
                    state.agent_failed_reason = Some("agent rpc deadline expired".to_string());
                    state.timed_out = true;
                    break;
                }
                Err(err) => {
                    state.agent_failed_reason = Some(format!("agent rpc failed: {err}"));
                    break;
                }
            };
            let raw = match reply {
                AgentReply::Finished { status, summary } => {
                    record_device_event(
                        writer,
                        "agent_finished",
                        json!({ "status": status.clone(), "summary": summary }),
                    )?;
                    state.agent_status = Some(status);
                    break;
                }
                AgentReply::Action(raw) => raw,
            };

            // Normalize.
            let (normalized, mut warnings) = normalize_action(&raw, &observation.geometry);

            // Guard B: refuse actions bound to a stale observation.
            let ref_mismatch = self.config.guard_enforced
                && normalized
                    .ref_obs_digest
                    .as_deref()
                    .is_some_and(|claimed| Some(claimed) != obs_digest.as_deref());
            if ref_mismatch {
                warnings.push(WARN_REF_MISMATCH.to_string());
            }
            writer.append_agent_action(&AgentActionRecord {
                schema_version: PACK_SCHEMA_VERSION.to_string(),
                step_idx,
                ts_ms: host_utc_ms(),
                raw_action: serde_json::to_value(&raw)?,
                normalized_action: Some(normalized.clone()),
                ref_obs_digest: normalized.ref_obs_digest.clone(),
                normalization_warnings: warnings.clone(),
            })?;
            if ref_mismatch {
                state.agent_failed_reason =
                    Some("action bound to stale observation (ref_mismatch)".to_string());
                break;
            }

            // Execute.
            let receipt = match with_retry(episode_deadline, || {
                device.execute(&normalized, episode_deadline.sub_deadline(15_000))
            }) {
                Ok(receipt) => receipt,
                Err(HarnessError::DeadlineExpired(_)) => {
                    state.timed_out = true;
                    break;
                }
                Err(err) => {
                    state.infra_failed_reason = Some(format!("execute failed: {err}"));
                    break;
                }
            };

            let (x, y) = primary_coords(&normalized.kind);
            writer.append_device_input(&DeviceInputRecord {
                schema_version: PACK_SCHEMA_VERSION.to_string(),
                step_idx,
                ref_step_idx: step_idx,
                source_level: SourceLevel::L0,
                event_type: event_type(&normalized.kind).to_string(),
                payload: InputPayload {
                    coord_space: normalized.coord_space,
                    x,
                    y,
                    extra: json!({
                        "input_success": receipt.success,
                        "coord_transform": normalized.coord_transform,
                    }),
                },
                timestamp_ms: receipt.timestamp_ms,
                mapping_warnings: warnings,
            })?;

            state.steps_executed = step_idx + 1;
        }
        Ok(())
    }

    fn record_observation(
        &self,
        writer: &mut EvidenceWriter,
        step_idx: u32,
        observation: &Observation,
        bundle: &CaseBundle,
    ) -> HarnessResult<Option<String>> {
        let ts_ms = host_utc_ms();
        let screenshot_ref = match &observation.screenshot_png {
            Some(bytes) => Some(writer.artifacts().put(bytes, "png")?),
            None => None,
        };
        let ui_dump_ref = match &observation.ui_tree {
            Some(tree) => {
                let bytes = masbench_core::digest::canonical_json(tree)?;
                Some(writer.artifacts().put(&bytes, "json")?)
            }
            None => None,
        };

        let (components, obs_digest) =
            compute_obs_digests(observation, bundle.task.obs_digest_include_volatile)?;
        writer.append_obs(&ObsRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            step_idx,
            ts_ms,
            obs_digest: obs_digest.clone(),
            obs_digest_version: OBS_DIGEST_VERSION.to_string(),
            obs_component_digests: components,
            refs: ObsRefs {
                screenshot: screenshot_ref.map(|r| r.path),
                ui_dump: ui_dump_ref.map(|r| r.path),
            },
        })?;
        writer.append_foreground(&ForegroundRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            step_idx,
            ts_ms,
            package: observation.foreground.package.clone(),
            activity: observation.foreground.activity.clone(),
        })?;
        writer.append_screen(&ScreenRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            step_idx,
            ts_ms,
            geometry: serde_json::to_value(&observation.geometry)?,
        })?;
        Ok(obs_digest)
    }

    fn pre_case_cleanup(
        &self,
        bundle: &CaseBundle,
        device: &mut dyn DeviceControl,
        writer: &mut EvidenceWriter,
        deadline: Deadline,
    ) -> HarnessResult<()> {
        let Some(cleanup) = &bundle.task.harness_cleanup else {
            return Ok(());
        };
        for package in &cleanup.uninstall_packages {
            let out = device.run_shell(
                &format!("pm uninstall {package}"),
                deadline.sub_deadline(15_000),
            );
            record_device_event(
                writer,
                "precase_uninstall",
                json!({ "package": package, "ok": out.map(|o| o.ok()).unwrap_or(false) }),
            )?;
        }
        for path in &cleanup.remove_sdcard_paths {
            let out = device.run_shell(&format!("rm -rf {path}"), deadline.sub_deadline(15_000));
            record_device_event(
                writer,
                "precase_remove_path",
                json!({ "path": path, "ok": out.map(|o| o.ok()).unwrap_or(false) }),
            )?;
        }
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn classify(state: &EpisodeState, decision: OracleDecision) -> Option<FailureClass> {
    if state.infra_failed_reason.is_some() {
        return Some(FailureClass::InfraFailed);
    }
    if state.agent_failed_reason.is_some() {
        return Some(FailureClass::AgentFailed);
    }
    match decision {
        OracleDecision::Pass => None,
        OracleDecision::Fail => Some(FailureClass::TaskFailed),
        OracleDecision::Inconclusive | OracleDecision::NotApplicable => {
            Some(FailureClass::OracleInconclusive)
        }
    }
}

fn terminal_reason(state: &EpisodeState, decision: OracleDecision) -> String {
    if let Some(reason) = &state.infra_failed_reason {
        return reason.clone();
    }
    if let Some(reason) = &state.agent_failed_reason {
        return reason.clone();
    }
    if state.timed_out {
        return format!("episode budget expired; oracle decision {decision:?}");
    }
    if let Some(status) = &state.agent_status {
        return format!("agent declared {status:?}; oracle decision {decision:?}");
    }
    match decision {
        OracleDecision::Pass => "success oracle passed".to_string(),
        OracleDecision::Fail => "success oracle failed conclusively".to_string(),
        OracleDecision::Inconclusive => "success oracle inconclusive".to_string(),
        OracleDecision::NotApplicable => "no success oracle applied".to_string(),
    }
}

/// Transient-error retry: up to `MAX_ATTEMPTS` tries with exponential
/// backoff. Deadline expiry is never retried.
fn with_retry<T>(
    episode_deadline: Deadline,
    mut call: impl FnMut() -> HarnessResult<T>,
) -> HarnessResult<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err @ HarnessError::DeadlineExpired(_)) => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS || episode_deadline.expired() {
                    return Err(err);
                }
                let backoff = RETRY_BASE_DELAY_MS << (attempt - 1);
                std::thread::sleep(Duration::from_millis(backoff));
            }
        }
    }
}

fn health_probe(
    device: &mut dyn DeviceControl,
    writer: &mut EvidenceWriter,
    deadline: Deadline,
) -> HarnessResult<Option<String>> {
    let mut checks: Vec<(&str, bool)> = Vec::new();

    let boot = device.run_shell("getprop sys.boot_completed", deadline.sub_deadline(5_000));
    checks.push((
        "boot_completed",
        boot.map(|o| o.ok() && o.stdout.trim() == "1").unwrap_or(false),
    ));
    let echo = device.run_shell("echo mas_health", deadline.sub_deadline(5_000));
    checks.push((
        "adb_reachable",
        echo.map(|o| o.ok() && o.stdout.trim() == "mas_health")
            .unwrap_or(false),
    ));
    let storage = device.run_shell(
        "touch /sdcard/.mas_health && rm /sdcard/.mas_health && echo ok",
        deadline.sub_deadline(5_000),
    );
    checks.push((
        "storage_writable",
        storage
            .map(|o| o.ok() && o.stdout.trim() == "ok")
            .unwrap_or(false),
    ));
    let device_time = probe_device_epoch_time_ms(device, deadline.sub_deadline(3_000))?;
    checks.push(("device_time", device_time.is_some()));

    record_device_event(
        writer,
        "health_probe",
        json!({ "checks": checks, "device_epoch_time_ms": device_time }),
    )?;

    let failed: Vec<&str> = checks
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| *name)
        .collect();
    if failed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("device unhealthy: {}", failed.join(","))))
    }
}

fn record_device_event(
    writer: &mut EvidenceWriter,
    event: &str,
    payload: Value,
) -> HarnessResult<()> {
    writer.append_device_event(&DeviceEventRecord {
        schema_version: PACK_SCHEMA_VERSION.to_string(),
        ts_ms: host_utc_ms(),
        event: event.to_string(),
        payload,
    })?;
    Ok(())
}

fn primary_coords(kind: &masbench_core::device::ActionKind) -> (Option<f64>, Option<f64>) {
    use masbench_core::device::ActionKind;
    match kind {
        ActionKind::Tap { x, y } | ActionKind::LongPress { x, y } => (Some(*x), Some(*y)),
        ActionKind::Swipe { x1, y1, .. } => (Some(*x1), Some(*y1)),
        _ => (None, None),
    }
}

fn event_type(kind: &masbench_core::device::ActionKind) -> &'static str {
    use masbench_core::device::ActionKind;
    match kind {
        ActionKind::Tap { .. } => "tap",
        ActionKind::LongPress { .. } => "long_press",
        ActionKind::Swipe { .. } => "swipe",
        ActionKind::TypeText { .. } => "type_text",
        ActionKind::KeyEvent { .. } => "key_event",
        ActionKind::OpenApp { .. } => "open_app",
        ActionKind::Back => "back",
        ActionKind::Home => "home",
        ActionKind::Wait { .. } => "wait",
    }
}

/// A digest over the enabled-assertion list, used by callers that want to
/// compare audit configurations across runs.
pub fn audit_config_digest(audit: &AuditBlock) -> HarnessResult<String> {
    stable_sha256(&audit.enabled_assertions)
}
