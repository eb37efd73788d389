//! Starting child services.
//!
//! [`ServiceLauncher`] is the seam between the supervisor and the operating
//! system: [`ProcessLauncher`] spawns real processes from the configured
//! commands, tests plug in in-process fakes.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nsgrid_core::config::{ServiceCommand, ServicesConfig};
use nsgrid_core::{PortBlock, ServiceRole};
use nsgrid_health::{BoxFuture, tcp_probe};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to start one service of one namespace.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub namespace: String,
    pub role: ServiceRole,
    pub block: PortBlock,
    pub host: String,
    pub data_dir: PathBuf,
}

impl LaunchContext {
    /// Address the service must listen on before it counts as started.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.role.http_port(&self.block))
    }

    fn template_vars(&self) -> HashMap<&'static str, String> {
        let b = &self.block;
        HashMap::from([
            ("namespace", self.namespace.clone()),
            ("data_dir", self.data_dir.display().to_string()),
            ("host", self.host.clone()),
            ("sql_http_port", b.sql_http().to_string()),
            ("sql_raft_port", b.sql_raft().to_string()),
            ("cache_http_port", b.cache_http().to_string()),
            ("cache_memberlist_port", b.cache_memberlist().to_string()),
            ("gateway_port", b.gateway().to_string()),
            ("sql_url", format!("http://{}:{}", self.host, b.sql_http())),
            ("cache_url", format!("http://{}:{}", self.host, b.cache_http())),
        ])
    }

    /// Substitute `{name}` placeholders in `template`.
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (name, value) in self.template_vars() {
            out = out.replace(&format!("{{{name}}}"), &value);
        }
        out
    }
}

/// A running (or exited) child service.
pub trait ServiceHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Whether the service has exited; an exited service never listens.
    fn has_exited(&mut self) -> bool;

    /// Whether the service accepts connections on its HTTP port.
    fn is_listening(&self) -> BoxFuture<'_, bool>;

    /// Stop the service and wait for it to go away.
    fn stop(&mut self) -> BoxFuture<'_, ()>;
}

/// Starts the service described by a [`LaunchContext`].
pub trait ServiceLauncher: Send + Sync {
    fn spawn(&self, ctx: &LaunchContext) -> std::io::Result<Box<dyn ServiceHandle>>;
}

/// Spawns the commands configured under `[services.*]`.
pub struct ProcessLauncher {
    services: ServicesConfig,
    probe_timeout: Duration,
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(services: ServicesConfig, probe_timeout: Duration) -> Self {
        Self {
            services,
            probe_timeout,
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command_for(&self, role: ServiceRole) -> &ServiceCommand {
        match role {
            ServiceRole::Sql => &self.services.sql,
            ServiceRole::Cache => &self.services.cache,
            ServiceRole::Gateway => &self.services.gateway,
        }
    }

    /// Build the command line for `ctx` without starting it.
    pub fn build_command(&self, ctx: &LaunchContext) -> std::io::Result<Command> {
        let service = self.command_for(ctx.role);
        let mut cmd = Command::new(ctx.render(&service.command));
        cmd.args(service.args.iter().map(|a| ctx.render(a)))
            .envs(service.env.iter().map(|(k, v)| (k, ctx.render(v))))
            .env("NSGRID_NAMESPACE", &ctx.namespace)
            .current_dir(&ctx.data_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let log_path = ctx.data_dir.join(format!("{}.log", ctx.role));
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        cmd.stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        Ok(cmd)
    }
}

impl ServiceLauncher for ProcessLauncher {
    fn spawn(&self, ctx: &LaunchContext) -> std::io::Result<Box<dyn ServiceHandle>> {
        let child = self.build_command(ctx)?.spawn()?;
        info!(
            namespace = %ctx.namespace,
            role = %ctx.role,
            pid = child.id(),
            listen = %ctx.listen_address(),
            "service process spawned"
        );
        Ok(Box::new(ProcessHandle {
            child,
            role: ctx.role,
            listen_address: ctx.listen_address(),
            probe_timeout: self.probe_timeout,
            stop_grace: self.stop_grace,
        }))
    }
}

/// Handle to a spawned OS process.
pub struct ProcessHandle {
    child: Child,
    role: ServiceRole,
    listen_address: String,
    probe_timeout: Duration,
    stop_grace: Duration,
}

impl ServiceHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(role = %self.role, %status, "service process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(role = %self.role, error = %e, "failed to poll service process");
                true
            }
        }
    }

    fn is_listening(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            tcp_probe(&self.listen_address, self.probe_timeout)
                .await
                .is_healthy()
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pid) = self.child.id() {
                terminate(pid);
                if tokio::time::timeout(self.stop_grace, self.child.wait())
                    .await
                    .is_ok()
                {
                    debug!(role = %self.role, pid, "service process terminated");
                    return;
                }
                warn!(role = %self.role, pid, "service ignored SIGTERM, killing");
            }
            if let Err(e) = self.child.kill().await {
                debug!(role = %self.role, error = %e, "kill after exit");
            }
        })
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: sending a signal to a pid we spawned and have not reaped.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
