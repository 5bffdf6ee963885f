// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hotplug_config::{load_scenario, Topology};
use hotplug_core::component::ReferenceComponent;
use hotplug_core::signals::NotificationRecord;
use hotplug_core::snapshot::TreeSnapshot;
use hotplug_core::tree::TreeNode;
use hotplug_core::{fixtures, DeviceTree, Harness, HarnessConfig};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

mod runner;

use runner::{step_action, AssertionResult, ScenarioRunner, StepError, StepRecord};

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

const RESULT_SCHEMA_VERSION: &str = "1.0";

/// Size of the synthetic payload used when a scenario names no firmware file.
const DEFAULT_PAYLOAD_LEN: usize = 16 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Hotplug simulator for device-management components", long_about = None)]
struct Cli {
    /// Enable debug logging of bus events, timers and notifications
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario script against the reference component
    Run(RunArgs),
    /// Print the device tree a topology describes
    Tree(TreeArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the scenario script (YAML)
    #[arg(short, long)]
    script: PathBuf,

    /// Directory to write result.json into
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Override the topology named by the script
    #[arg(long)]
    topology: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct TreeArgs {
    /// Path to the topology (YAML)
    #[arg(long)]
    topology: PathBuf,

    /// Attach the tree to a simulated bus before printing it
    #[arg(long)]
    attach: bool,

    /// Print a JSON snapshot instead of the indented listing
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct RunResult {
    result_schema_version: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    virtual_time_ms: u64,
    steps: Vec<StepRecord>,
    assertions: Vec<AssertionResult>,
    firmware_hash: String,
    notifications: Vec<NotificationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tree: Option<TreeSnapshot>,
    config: RunConfig,
}

#[derive(Debug, Serialize)]
struct RunConfig {
    script: PathBuf,
    topology: Option<PathBuf>,
    firmware: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing with appropriate level based on --trace flag
    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run_scenario(args),
        Commands::Tree(args) => match print_tree(&args) {
            Ok(()) => ExitCode::from(EXIT_PASS),
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
        },
    }
}

fn run_scenario(args: RunArgs) -> ExitCode {
    let mut config = RunConfig {
        script: args.script.clone(),
        topology: args.topology.clone(),
        firmware: None,
    };

    let script = match load_scenario(&args.script) {
        Ok(s) => s,
        Err(e) => return config_error(&args, config, None, e),
    };

    let topology_path = args
        .topology
        .clone()
        .unwrap_or_else(|| resolve_script_path(&args.script, &script.inputs.topology));
    config.topology = Some(topology_path.clone());
    let topology = match Topology::from_file(&topology_path) {
        Ok(t) => t,
        Err(e) => return config_error(&args, config, None, e),
    };

    let firmware = match &script.inputs.firmware {
        Some(value) => {
            let path = resolve_script_path(&args.script, value);
            config.firmware = Some(path.clone());
            match std::fs::read(&path)
                .with_context(|| format!("Failed to read firmware payload at {:?}", path))
            {
                Ok(bytes) => bytes,
                Err(e) => return config_error(&args, config, None, e),
            }
        }
        None => fixtures::firmware_payload(DEFAULT_PAYLOAD_LEN),
    };

    info!(
        "Running scenario {:?} on topology '{}' ({} nodes)",
        args.script,
        topology.name,
        topology.node_count()
    );

    let tree = DeviceTree::instantiate(&topology);
    let mut runner = match ScenarioRunner::new(tree, script.harness.clone(), firmware.clone()) {
        Ok(r) => r,
        Err(e) => return config_error(&args, config, Some(firmware.as_slice()), e.into()),
    };

    let mut steps = Vec::with_capacity(script.steps.len());
    let mut failure: Option<StepError> = None;
    for (index, step) in script.steps.iter().enumerate() {
        let outcome = runner.run_step(step);
        let record = StepRecord {
            index,
            action: step_action(step),
            at_ms: runner.harness().now().as_millis(),
            passed: outcome.is_ok(),
            message: outcome.as_ref().err().map(|e| e.to_string()),
        };
        steps.push(record);
        if let Err(e) = outcome {
            error!("Step {} ({}) failed: {}", index, step_action(step), e);
            failure = Some(e);
            break;
        }
    }

    let mut assertions = Vec::new();
    if failure.is_none() {
        for assertion in &script.assertions {
            let passed = runner.evaluate(assertion);
            if !passed {
                warn!("Assertion failed: {:?}", assertion);
            }
            assertions.push(AssertionResult {
                assertion: assertion.clone(),
                passed,
            });
        }
    }

    let (status, message, exit) = match &failure {
        Some(StepError::Failed(msg)) => ("fail", Some(msg.clone()), EXIT_ASSERT_FAIL),
        Some(StepError::Harness(e)) => ("error", Some(e.to_string()), EXIT_RUNTIME_ERROR),
        None if assertions.iter().all(|a| a.passed) => ("pass", None, EXIT_PASS),
        None => (
            "fail",
            Some("one or more assertions failed".to_string()),
            EXIT_ASSERT_FAIL,
        ),
    };

    let snapshot = TreeSnapshot::capture(runner.tree());
    let notifications = runner.harness().notifications().to_vec();
    let virtual_time_ms = runner.harness().now().as_millis();
    runner.finish();

    let result = RunResult {
        result_schema_version: RESULT_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        message,
        virtual_time_ms,
        steps,
        assertions,
        firmware_hash: firmware_hash(&firmware),
        notifications,
        tree: Some(snapshot),
        config,
    };

    info!("Scenario finished: {} at {} ms", result.status, virtual_time_ms);
    if let Some(output_dir) = &args.output_dir {
        write_outputs(output_dir, &result);
    }
    ExitCode::from(exit)
}

fn config_error(
    args: &RunArgs,
    config: RunConfig,
    firmware: Option<&[u8]>,
    e: anyhow::Error,
) -> ExitCode {
    let message = format!("{:#}", e);
    error!("{}", message);

    let result = RunResult {
        result_schema_version: RESULT_SCHEMA_VERSION.to_string(),
        status: "error".to_string(),
        message: Some(message),
        virtual_time_ms: 0,
        steps: vec![],
        assertions: vec![],
        firmware_hash: firmware.map(firmware_hash).unwrap_or_default(),
        notifications: vec![],
        tree: None,
        config,
    };
    if let Some(output_dir) = &args.output_dir {
        write_outputs(output_dir, &result);
    }
    ExitCode::from(EXIT_CONFIG_ERROR)
}

fn firmware_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_outputs(output_dir: &Path, result: &RunResult) {
    // Best-effort: a failed write is logged, the exit code still reflects the run.
    if let Err(e) = std::fs::create_dir_all(output_dir) {
        error!("Failed to create output directory {:?}: {}", output_dir, e);
        return;
    }
    let path = output_dir.join("result.json");
    match serde_json::to_string_pretty(result) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                error!("Failed to write {:?}: {}", path, e);
            }
        }
        Err(e) => error!("Failed to serialize result: {}", e),
    }
}

fn resolve_script_path(script_path: &Path, value: &str) -> PathBuf {
    let p = PathBuf::from(value);
    if p.is_absolute() {
        return p;
    }
    script_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(p)
}

fn print_tree(args: &TreeArgs) -> Result<()> {
    let topology = Topology::from_file(&args.topology)?;
    let mut tree = DeviceTree::instantiate(&topology);

    let mut harness = Harness::new(ReferenceComponent::new(), HarnessConfig::default())?;
    if args.attach {
        harness
            .attach(&mut tree)
            .map_err(|e| anyhow::anyhow!("Tree did not attach: {}", e))?;
    }

    if args.json {
        let snapshot = TreeSnapshot::capture(&tree);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_node(tree.root(), 0);
    }
    tree.teardown();
    Ok(())
}

fn print_node(node: &TreeNode<'_>, depth: usize) {
    let mut line = format!(
        "{}{} {} [{}] nvm {}",
        "  ".repeat(depth),
        node.id(),
        node.name(),
        node.uuid(),
        node.nvm_version()
    );
    if let Some(path) = node.sysfs_path() {
        line.push_str(&format!(" @ {}", path));
    }
    if let Some(device) = node.device() {
        line.push_str(&format!(" -> {}", device.version()));
    }
    println!("{}", line);
    for child in node.children() {
        print_node(child, depth + 1);
    }
}
