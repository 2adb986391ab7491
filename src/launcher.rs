//! Worker process launching and teardown
//!
//! The registry talks to the outside world through the [`WorkerLauncher`]
//! trait: given a class, a port, and the class launch configuration, a
//! launcher produces an opaque handle once the worker is confirmed ready, and
//! releases that handle exactly once at eviction. [`ProcessLauncher`] is the
//! production implementation, spawning local processes.

use crate::config::{ClassConfig, ClassDefaults};
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Creates and destroys the external worker resource behind a pool record.
///
/// `launch` must only return once the worker is ready to accept connections,
/// or fail; callers never receive a handle to a worker that is still starting.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Opaque ownership of the launched resource
    type Handle: Send + 'static;

    /// Start a worker of `class` listening on `port`; resolves when ready.
    fn launch(
        &self,
        class: &str,
        config: &ClassConfig,
        port: u16,
        address_path: &str,
    ) -> impl Future<Output = anyhow::Result<Self::Handle>> + Send;

    /// Tear down a previously launched worker.
    fn release(&self, handle: Self::Handle) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Handle to a running worker process
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    grace_period: Duration,
}

/// Launches worker classes as local processes.
///
/// The worker is handed its port and address path through the `PORT` and
/// `WORKER_PATH` environment variables. Readiness is confirmed by polling a
/// TCP connect against the assigned port until the worker accepts, bounded by
/// the class startup timeout.
pub struct ProcessLauncher {
    defaults: ClassDefaults,
}

impl ProcessLauncher {
    pub fn new(defaults: ClassDefaults) -> Self {
        Self { defaults }
    }

    /// Poll until the worker accepts a TCP connection on its port
    async fn wait_until_listening(
        &self,
        class: &str,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(poll_interval).await;
        }
        debug!(class, port, "Worker never started listening");
        false
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = WorkerProcess;

    async fn launch(
        &self,
        class: &str,
        config: &ClassConfig,
        port: u16,
        address_path: &str,
    ) -> anyhow::Result<WorkerProcess> {
        info!(class, port, command = %config.command, "Starting worker process");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", port.to_string());
        cmd.env("WORKER_PATH", address_path);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(class, port, pid, "Worker process spawned");

        let timeout = config.startup_timeout(&self.defaults);
        let poll_interval = config.startup_poll_interval(&self.defaults);

        if !self
            .wait_until_listening(class, port, timeout, poll_interval)
            .await
        {
            let _ = child.kill().await;
            anyhow::bail!(
                "worker '{}' did not start listening on port {} within {}s",
                class,
                port,
                timeout.as_secs()
            );
        }

        info!(class, port, pid, "Worker process ready");

        Ok(WorkerProcess {
            child,
            pid,
            grace_period: config.shutdown_grace_period(&self.defaults),
        })
    }

    async fn release(&self, mut handle: WorkerProcess) -> anyhow::Result<()> {
        if let Some(pid) = handle.pid {
            info!(pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = handle.child.start_kill();
            }
        }

        // Wait for the process to exit, SIGKILL after the grace period
        match tokio::time::timeout(handle.grace_period, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = handle.pid, ?status, "Worker process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    pid = handle.pid,
                    grace_period_secs = handle.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                handle.child.kill().await?;
                Ok(())
            }
        }
    }
}
