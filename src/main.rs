#![deny(unused)]
//! opencoordex — thin CLI front door onto the scoped sandbox execution
//! layer.
//!
//! This binary is deliberately small: the agent loop, LLM providers, tool
//! policy, and session/memory storage are external collaborators (named by
//! interface only in `multi_agent_core::traits`) that an embedding host
//! would wire in. What lives here is just enough to exercise the sandbox
//! subsystem on its own — run one command through a scope's sandbox, force
//! a pruning pass, or sit as a long-lived daemon running the background
//! pruning loop against the same on-disk registry a short-lived CLI
//! invocation would also touch — the registry's cross-process locking
//! exists precisely so a CLI and a daemon can share it safely.

use std::sync::Arc;

use multi_agent_core::RequestContext;
use multi_agent_sandbox::engine::mock::MockEngine;
use multi_agent_sandbox::{
    BollardEngine, ContainerEngine, ExecRequest, Registry, Sandbox, SandboxConfig, SandboxMode,
    ScopeManager,
};

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .json()
        .init();
}

fn usage() -> ! {
    eprintln!(
        "usage:\n  \
         opencoordex exec <agent-id> [--session <key>] -- <command> [args...]\n  \
         opencoordex prune\n  \
         opencoordex serve\n\n\
         env:\n  \
         SANDBOX_MODE=off|all  (default: off; non_main currently behaves like off)\n  \
         PICOCLAW_HOME         state directory root for the container registry"
    );
    std::process::exit(2);
}

fn config_from_env() -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.mode = match std::env::var("SANDBOX_MODE").as_deref() {
        Ok("all") => SandboxMode::All,
        Ok("non_main") => SandboxMode::NonMain,
        _ => SandboxMode::Off,
    };
    // The CLI has no tool-policy layer of its own; every command it runs is
    // effectively pre-approved, so no `sandboxed_tools` allow-list applies
    // here (that gate lives at the `Tool` seam, see `multi_agent_sandbox::tools`).
    config
}

async fn connect_engine() -> Arc<dyn ContainerEngine> {
    match BollardEngine::connect() {
        Ok(engine) => {
            if engine.ping().await.is_ok() {
                return Arc::new(engine);
            }
            tracing::warn!("container engine connected but did not respond to ping");
        }
        Err(e) => {
            tracing::warn!(error = %e, "container engine unavailable");
        }
    }
    tracing::warn!("falling back to an in-memory mock engine; container-routed requests will not reach a real container");
    Arc::new(MockEngine::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting opencoordex sandbox CLI");

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else { usage() };

    let registry = Arc::new(Registry::new());
    let engine = connect_engine().await;
    let manager = Arc::new(ScopeManager::new(config_from_env(), engine, registry));
    manager.start().await;

    let exit_code = match command.as_str() {
        "serve" => {
            tracing::info!("sandbox daemon running; pruning loop active per retention policy");
            tokio::signal::ctrl_c().await?;
            manager.prune().await?;
            0
        }
        "prune" => {
            let evicted = manager.prune_once().await?;
            println!("pruned {} container(s)", evicted);
            manager.prune().await?;
            0
        }
        "exec" => {
            let Some(agent_id) = args.next() else { usage() };
            let mut rest: Vec<String> = args.collect();

            let session_key = if rest.first().map(String::as_str) == Some("--session") {
                rest.remove(0);
                if rest.is_empty() {
                    usage();
                }
                Some(rest.remove(0))
            } else {
                None
            };
            if rest.first().map(String::as_str) == Some("--") {
                rest.remove(0);
            }
            if rest.is_empty() {
                usage();
            }

            let mut ctx = RequestContext::new(agent_id);
            if let Some(session) = session_key {
                ctx = ctx.with_session(session);
            }

            // Deliberately no `manager.prune()` here: the point of a scoped
            // sandbox is a container that outlives a single invocation and
            // is reused by the next `exec` against the same scope.
            let sandbox = manager.get_or_create(&ctx).await?;
            let result = sandbox.exec(ExecRequest::shell(rest.join(" "))).await?;

            print!("{}", result.stdout_string());
            eprint!("{}", result.stderr_string());
            result.exit_code as i32
        }
        _ => usage(),
    };

    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(exit_code);
}
