//! Sandscope CLI - inspect access manifests
//!
//! Usage:
//!   sandscope resolve <manifest> <path>...          Effective policy per path
//!   sandscope check <manifest> --op <op> <path>     Arbitrate one access
//!   sandscope dump <manifest>                       Print the scope tree

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sandscope::policy::PathScopeTree;
use sandscope::{
    AccessArbiter, AccessRequest, ArbiterConfig, EnforcementMode, ManifestConfig, MemorySink,
    Operation, ProcessId,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Sandscope - path-scoped access policy inspector
#[derive(Parser, Debug)]
#[command(name = "sandscope")]
#[command(about = "Inspect and exercise sandbox access manifests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective policy of each path
    Resolve {
        /// Manifest JSON file
        manifest: PathBuf,
        /// Absolute paths to resolve
        #[arg(required = true)]
        paths: Vec<String>,
        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Arbitrate a single access and print the decision
    Check {
        /// Manifest JSON file
        manifest: PathBuf,
        /// Operation (read, write, probe, enumerate, delete, rename, mkdir)
        #[arg(long)]
        op: Operation,
        /// Requesting process id
        #[arg(long, default_value_t = 1)]
        pid: ProcessId,
        /// Treat the target as nonexistent
        #[arg(long)]
        missing: bool,
        /// Override the manifest's enforcement mode
        #[arg(long)]
        permissive: bool,
        /// Absolute path being accessed
        path: String,
    },
    /// Print the scope tree
    Dump {
        /// Manifest JSON file
        manifest: PathBuf,
    },
}

fn load(manifest: &Path) -> anyhow::Result<(PathScopeTree, ArbiterConfig)> {
    let config = ManifestConfig::from_path(manifest)
        .with_context(|| format!("loading {}", manifest.display()))?;
    let parts = config
        .into_parts()
        .with_context(|| format!("building {}", manifest.display()))?;
    Ok(parts)
}

/// Run a command, writing results to `out`. Returns false if a checked
/// access was denied.
fn run(command: Command, out: &mut dyn Write) -> anyhow::Result<bool> {
    match command {
        Command::Resolve {
            manifest,
            paths,
            json,
        } => {
            let (tree, _) = load(&manifest)?;
            for path in &paths {
                let resolution = tree
                    .resolve(path)
                    .with_context(|| format!("resolving {}", path))?;
                if json {
                    let line = serde_json::json!({
                        "path": path,
                        "policy": resolution.policy,
                        "cone": resolution.cone,
                        "matched_depth": resolution.matched_depth,
                        "truncated": resolution.truncated,
                    });
                    writeln!(out, "{}", line)?;
                } else {
                    writeln!(
                        out,
                        "{}\t{:?}\tdepth={}",
                        path, resolution.policy, resolution.matched_depth
                    )?;
                }
            }
            Ok(true)
        }
        Command::Check {
            manifest,
            op,
            pid,
            missing,
            permissive,
            path,
        } => {
            let (tree, mut config) = load(&manifest)?;
            if permissive {
                config.mode = EnforcementMode::Permissive;
            }
            let sink = Arc::new(MemorySink::new());
            let arbiter = AccessArbiter::new(tree, config).with_sink(sink.clone());

            let mut request = AccessRequest::new(&path, op, pid);
            if missing {
                request = request.nonexistent();
            }
            let decision = arbiter.arbitrate(&request);
            let line = serde_json::json!({
                "path": path,
                "operation": op,
                "action": decision.action(),
                "decision": decision,
                "reports": sink.take(),
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&line)?)?;
            Ok(decision.allowed)
        }
        Command::Dump { manifest } => {
            let (tree, config) = load(&manifest)?;
            writeln!(
                out,
                "pip {} ({:?}): {} nodes, {} rules",
                config.pip_id,
                config.mode,
                tree.node_count(),
                tree.explicit_count()
            )?;
            write!(out, "{}", tree.dump())?;
            Ok(true)
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    // Output to stderr so logs don't mix with results on stdout
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let allowed = run(cli.command, &mut io::stdout().lock())?;
    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
