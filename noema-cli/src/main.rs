//! Operator CLI (§6): `train` runs the VastAI training monitor in the foreground, `sweep`
//! reaps orphaned VastAI instances once, and `export` drives the gateway's admin routes to
//! pause/resume/inspect the collection-export worker.
//!
//! Exit codes: 0 success, 1 usage error, 2 auth failure, 3 backend error.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use noema_lifecycle::{LifecycleEngine, RuntimeTable};
use noema_model::Service;
use noema_notify::NotificationBus;
use noema_pricing::PricingTable;
use noema_registry::ToolRegistry;
use noema_runtimes::{Runtime, VastAiRuntime};
use noema_scheduler::TrainingMonitor;
use noema_store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "noema-cli", about = "Operator CLI for the noema gateway (§6)")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the VastAI training monitor's discovery loop in the foreground.
    Train,
    /// Terminate VastAI instances with no matching non-terminal training generation.
    Sweep,
    /// Control the collection-export worker through the gateway's admin routes.
    Export(ExportArgs),
}

#[derive(clap::Args)]
struct ExportArgs {
    #[command(subcommand)]
    sub: ExportCommand,
}

#[derive(Subcommand)]
enum ExportCommand {
    /// Pause the export worker; new `/export` requests are rejected until resumed.
    Pause {
        /// Shown back to callers that hit a paused export endpoint.
        reason: String,
    },
    /// Resume the export worker.
    Resume,
    /// Print whether the export worker is paused.
    Status,
}

fn required(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        eprintln!("noema-cli: missing required environment variable {key}");
        std::process::exit(1);
    })
}

fn gateway_url() -> String {
    env::var("NOEMA_GATEWAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    noema_config::load_and_apply("noema", None).ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    match args.command {
        Command::Train => run_train().await,
        Command::Sweep => run_sweep().await,
        Command::Export(export_args) => run_export(export_args.sub).await,
    }
}

fn open_store() -> Arc<dyn Store> {
    let db_path = env::var("NOEMA_DB_PATH").unwrap_or_else(|_| "noema.sqlite3".to_string());
    Arc::new(SqliteStore::new(&db_path).unwrap_or_else(|e| {
        eprintln!("noema-cli: failed to open sqlite store: {e}");
        std::process::exit(3);
    }))
}

fn build_vastai_runtime() -> VastAiRuntime {
    let api_key = required("VASTAI_API_KEY");
    let ssh_key_path = required("VASTAI_SSH_KEY_PATH");
    let hf_token = env::var("HUGGINGFACE_TOKEN").unwrap_or_default();
    let r2_endpoint = env::var("R2_ENDPOINT").unwrap_or_default();
    let gpu_types = env::var("VASTAI_GPU_TYPES").unwrap_or_default().split(',').map(str::to_string).filter(|s| !s.is_empty()).collect();
    VastAiRuntime::new(api_key, ssh_key_path, gpu_types, hf_token, r2_endpoint)
}

/// Standalone worker: wires up the same store/registry/lifecycle stack the gateway does,
/// then runs the training monitor's discovery loop until killed (§5 scheduling model).
async fn run_train() -> ExitCode {
    let store = open_store();
    let registry = match ToolRegistry::load(&*store).await {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("noema-cli: failed to load tool registry: {e}");
            return ExitCode::from(3);
        }
    };

    let runtime = Arc::new(build_vastai_runtime());
    let mut runtimes = RuntimeTable::new();
    runtimes = runtimes.register(Service::VastAiTraining, runtime.clone() as Arc<dyn Runtime>);

    let bus = Arc::new(NotificationBus::new());
    let ms2_token_address = env::var("MS2_TOKEN_ADDRESS").unwrap_or_default();
    let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), registry, runtimes, bus, PricingTable::new(), ms2_token_address));

    let monitor = TrainingMonitor::new(store, lifecycle, runtime);
    tracing::info!("training monitor starting");
    monitor.spawn_discovery_loop();

    if tokio::signal::ctrl_c().await.is_err() {
        eprintln!("noema-cli: failed to install ctrl-c handler");
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}

/// One-shot: terminates VastAI instances that have no matching non-terminal training
/// generation in the store (§9 REDESIGN FLAGS: orphans reaped by a periodic sweeper).
async fn run_sweep() -> ExitCode {
    let store = open_store();
    let runtime = build_vastai_runtime();

    let running = match runtime.list_running_instances().await {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("noema-cli: failed to list vastai instances: {e}");
            return ExitCode::from(3);
        }
    };

    let generations = match store.find_generations(noema_store::GenerationFilter::default()).await {
        Ok(g) => g,
        Err(e) => {
            eprintln!("noema-cli: failed to list generations: {e}");
            return ExitCode::from(3);
        }
    };
    let claimed: std::collections::HashSet<String> = generations
        .iter()
        .filter(|g| !g.status.is_terminal())
        .filter_map(|g| g.metadata.run_id.as_ref().map(|r| r.as_str().to_string()))
        .collect();

    let mut terminated = 0;
    for instance_id in running {
        if claimed.contains(&instance_id) {
            continue;
        }
        match runtime.terminate_instance(&instance_id).await {
            Ok(()) => {
                tracing::info!(instance_id, "terminated orphaned vastai instance");
                terminated += 1;
            }
            Err(e) => {
                eprintln!("noema-cli: failed to terminate instance {instance_id}: {e}");
                return ExitCode::from(3);
            }
        }
    }
    println!("terminated {terminated} orphaned instance(s)");
    ExitCode::SUCCESS
}

/// HTTP client against the gateway's `/api/v1/admin/export/*` routes (§6: "export-worker
/// control"), authenticated with the same admin key the gateway checks.
async fn run_export(command: ExportCommand) -> ExitCode {
    let admin_key = required("INTERNAL_API_KEY_ADMIN");
    let client = reqwest::Client::new();
    let base = gateway_url();

    let result = match command {
        ExportCommand::Pause { reason } => {
            client
                .post(format!("{base}/api/v1/admin/export/pause"))
                .header("X-Admin-Key", &admin_key)
                .json(&serde_json::json!({ "reason": reason }))
                .send()
                .await
        }
        ExportCommand::Resume => {
            client.post(format!("{base}/api/v1/admin/export/resume")).header("X-Admin-Key", &admin_key).send().await
        }
        ExportCommand::Status => {
            client.get(format!("{base}/api/v1/admin/export/status")).header("X-Admin-Key", &admin_key).send().await
        }
    };

    let response = match result {
        Ok(r) => r,
        Err(e) => {
            eprintln!("noema-cli: request to gateway failed: {e}");
            return ExitCode::from(3);
        }
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        eprintln!("noema-cli: admin key rejected by gateway");
        return ExitCode::from(2);
    }
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        eprintln!("noema-cli: gateway returned {status}: {body}");
        return ExitCode::from(3);
    }
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_defaults_to_localhost() {
        env::remove_var("NOEMA_GATEWAY_URL");
        assert_eq!(gateway_url(), "http://127.0.0.1:8080");
    }
}
