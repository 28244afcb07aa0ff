// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::{Parser, Subcommand};
use masbench_audit::{run_audit, CaseContext};
use masbench_core::config::HostEnv;
use masbench_core::evidence::manifest::FailureClass;
use masbench_core::evidence::pack::SealedPack;
use masbench_core::facts::AssertionOutcome;
use masbench_core::policy::compile_baseline;
use masbench_core::profile::EnvProfile;
use masbench_core::spec::CaseBundle;
use masbench_runner::{AdbDevice, EpisodeRunner, RunnerConfig, ScriptedAgent};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_TASK_FAILED: u8 = 2;
const EXIT_AGENT_FAILED: u8 = 3;
const EXIT_ORACLE_INCONCLUSIVE: u8 = 4;
const EXIT_INFRA_FAILED: u8 = 5;

#[derive(Parser)]
#[command(name = "masbenchctl", about = "masbench evaluation engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one episode against a device and an agent script.
    RunEpisode {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        agent_script: PathBuf,
        #[arg(long, value_parser = parse_env_profile, default_value = "mas_core")]
        env_profile: EnvProfile,
        /// Disable the ref-binding guard (recorded in the run manifest).
        #[arg(long)]
        no_guard: bool,
        /// Exit non-zero when any safety assertion FAILs.
        #[arg(long)]
        fail_on_assertions: bool,
    },
    /// Validate a case bundle without running it.
    ValidateCase {
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Re-run detectors and assertions over a sealed episode.
    Audit {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        episode: PathBuf,
        #[arg(long, value_parser = parse_env_profile, default_value = "mas_core")]
        env_profile: EnvProfile,
    },
}

fn parse_env_profile(raw: &str) -> Result<EnvProfile, String> {
    match raw {
        "mas_core" => Ok(EnvProfile::MasCore),
        "android_world_compat" => Ok(EnvProfile::AndroidWorldCompat),
        other => Err(format!("unknown env profile: {other}")),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = ?err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_INFRA_FAILED)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.cmd {
        Command::RunEpisode {
            bundle,
            device,
            out,
            seed,
            agent_script,
            env_profile,
            no_guard,
            fail_on_assertions,
        } => {
            let env = HostEnv::capture();
            let bundle = CaseBundle::load(&bundle).context("loading case bundle")?;
            let serial = device
                .or(env.android_serial.clone())
                .context("no device serial (pass --device or set ANDROID_SERIAL)")?;
            let mut device = AdbDevice::new(&serial, env.adb_server_socket.as_deref());
            let mut agent = ScriptedAgent::load(&agent_script).context("loading agent script")?;

            let runner = EpisodeRunner::new(RunnerConfig {
                env_profile,
                guard_enforced: !no_guard,
                artifacts_root: env.artifacts_root.clone(),
                generator: format!("masbenchctl/{}", env!("CARGO_PKG_VERSION")),
                episode_idx: 1,
            });
            let result = runner
                .run(&bundle, &mut device, &mut agent, &out, seed)
                .context("running episode")?;

            println!(
                "{}",
                serde_json::to_string_pretty(&result.summary).context("rendering summary")?
            );

            let has_fail = result
                .assertions
                .iter()
                .any(|r| r.result == AssertionOutcome::Fail);
            Ok(exit_code(
                result.summary.failure_class,
                fail_on_assertions && has_fail,
            ))
        }
        Command::ValidateCase { bundle } => {
            let bundle = CaseBundle::load(&bundle).context("loading case bundle")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "case_id": bundle.task.case_id,
                    "eval_mode": if bundle.attack.is_some() { "adversarial" } else { "benign" },
                    "ambiguities": bundle.ambiguities,
                }))
                .context("rendering validation")?
            );
            Ok(EXIT_OK)
        }
        Command::Audit {
            bundle,
            episode,
            env_profile,
        } => {
            let bundle = CaseBundle::load(&bundle).context("loading case bundle")?;
            let sealed = SealedPack::open(&episode).context("opening sealed pack")?;
            let ctx = CaseContext::from_bundle(&bundle, env_profile);
            let baseline =
                compile_baseline(&bundle, env_profile).context("compiling baseline")?;
            let (facts, assertions, audit) =
                run_audit(&sealed, &ctx, &baseline).context("running audit")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "facts": facts.len(),
                    "assertions": assertions.len(),
                    "pass": audit.pass_count,
                    "fail": audit.fail_count,
                    "inconclusive": audit.inconclusive_count,
                }))
                .context("rendering audit")?
            );
            Ok(if audit.fail_count > 0 {
                EXIT_TASK_FAILED
            } else {
                EXIT_OK
            })
        }
    }
}

fn exit_code(failure_class: Option<FailureClass>, assertion_gate: bool) -> u8 {
    if assertion_gate {
        return EXIT_TASK_FAILED;
    }
    match failure_class {
        None => EXIT_OK,
        Some(FailureClass::TaskFailed) => EXIT_TASK_FAILED,
        Some(FailureClass::AgentFailed) => EXIT_AGENT_FAILED,
        Some(FailureClass::OracleInconclusive) => EXIT_ORACLE_INCONCLUSIVE,
        Some(FailureClass::InfraFailed) => EXIT_INFRA_FAILED,
    }
}
