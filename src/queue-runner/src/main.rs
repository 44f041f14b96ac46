#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]
#![recursion_limit = "256"]

pub mod config;
pub mod io;
pub mod remote;
pub mod server;
pub mod state;
pub mod utils;

use anyhow::Context as _;

use state::State;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn start_task_loops(state: &std::sync::Arc<State>) -> Vec<tokio::task::AbortHandle> {
    tracing::info!("QueueRunner starting task loops");

    vec![
        spawn_config_reloader(state.clone(), state.config.clone(), &state.cli.config_path),
        state.clone().start_machines_file_monitor(),
        state.clone().start_queue_monitor_loop(),
        state.clone().start_dispatch_loop(),
        state.clone().start_dump_status_loop(),
        state.clone().start_log_compressor_queue(),
        state.clone().start_notification_sender_queue(),
    ]
}

fn spawn_config_reloader(
    state: std::sync::Arc<State>,
    current_config: config::App,
    filepath: &str,
) -> tokio::task::AbortHandle {
    let filepath = filepath.to_owned();
    let task = tokio::spawn(async move {
        loop {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(mut s) => {
                    let _ = s.recv().await;
                    tracing::info!("Reloading...");
                    config::reload(&current_config, &filepath, &state);
                }
                Err(e) => {
                    tracing::error!("Failed to create signal listener for SIGHUP: {e}");
                    break;
                }
            }
        }
    });
    task.abort_handle()
}

async fn shutdown(
    state: &std::sync::Arc<State>,
    task_abort_handles: Vec<tokio::task::AbortHandle>,
    server_abort_handle: tokio::task::AbortHandle,
    lock: db::GlobalLock,
) {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    server_abort_handle.abort();
    for h in task_abort_handles {
        h.abort();
    }
    // any build step still busy belongs to a dead worker now
    let _ = state.clear_busy().await;
    if let Err(e) = lock.release().await {
        tracing::warn!("Failed to release the global queue-runner lock: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let tracing_guard = forge_tracing::init()?;

    #[cfg(debug_assertions)]
    {
        // Crash on panics in debug builds so the debug_asserts in the
        // graph code actually stop the process.
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            std::process::exit(1);
        }));
    }

    let state = State::new(&tracing_guard).await?;
    if state.cli.status {
        state.get_status_from_main_process().await?;
        return Ok(());
    }

    let lock = state
        .db
        .acquire_global_lock()
        .await?
        .context("Another queue-runner instance is already running.")?;
    state.clear_busy().await?;
    // queued builds are judged against the machine registry during
    // expansion, so it must be populated before the monitor starts
    state.load_machines_file().await;

    let task_abort_handles = start_task_loops(&state);
    tracing::info!("QueueRunner listening on rest: {}", state.cli.rest_bind);
    let srv = server::http::Server::run(state.cli.rest_bind, state.clone());

    let task = tokio::spawn(async move {
        srv.await
            .map_err(|e| anyhow::anyhow!("hyper error while awaiting handle: {e}"))
    });
    let server_abort_handle = task.abort_handle();

    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Running"),
            sd_notify::NotifyState::Ready,
        ],
    );

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("Received sigint - shutting down gracefully");
            shutdown(&state, task_abort_handles, server_abort_handle, lock).await;
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!("Received sigterm - shutting down gracefully");
            shutdown(&state, task_abort_handles, server_abort_handle, lock).await;
            Ok(())
        }
        () = state.build_one_done.notified(), if state.cli.build_one.is_some() => {
            tracing::info!("build {} finished, exiting", state.cli.build_one.unwrap_or_default());
            shutdown(&state, task_abort_handles, server_abort_handle, lock).await;
            Ok(())
        }
        r = task => {
            r??;
            Ok(())
        }
    }
}
