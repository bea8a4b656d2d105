//! Named network namespaces.
//!
//! A [`NetNs`] is created with `ip netns add`, so it is pinned by a bind mount
//! under `/run/netns` and survives without any process inside it. Child
//! processes join it through `ip netns exec`. Code that must open sockets
//! inside it runs on a dedicated blocking thread that temporarily switches
//! namespaces with [`NetNs::enter`].

use std::fs::File;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sched::{CloneFlags, setns};
use tokio::process::Command;
use tracing::{error, info};

use crate::command::{self, CommandError, format_command_display};
use crate::network::{NetworkError, Result};

const NETNS_DIR: &str = "/run/netns";

#[derive(Debug)]
pub struct NetNs {
    name: String,
    file: File,
    deleted: AtomicBool,
}

impl NetNs {
    /// Create a new, empty namespace without leaving the current one.
    ///
    /// Nothing is left behind on failure.
    pub async fn create(name: &str) -> Result<Self> {
        command::exec("ip", &["netns", "add", name]).await?;
        match Self::open(name) {
            Ok(ns) => {
                info!(name, "network namespace created");
                Ok(ns)
            }
            Err(e) => {
                command::exec_ignore_errors("ip", &["netns", "del", name]).await;
                Err(e)
            }
        }
    }

    /// Open an existing named namespace.
    pub fn open(name: &str) -> Result<Self> {
        let path = PathBuf::from(NETNS_DIR).join(name);
        let file = File::open(&path).map_err(|e| NetworkError::Namespace {
            name: name.to_string(),
            detail: format!("open {}: {e}", path.display()),
        })?;
        Ok(Self {
            name: name.to_string(),
            file,
            deleted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switch the calling OS thread into this namespace.
    ///
    /// The guard restores the previous namespace when dropped. It is `!Send`,
    /// so it cannot be held across an `.await` on a multi-threaded runtime;
    /// use [`NetNs::run`] from async code.
    pub fn enter(&self) -> Result<NsGuard<'_>> {
        let original =
            File::open("/proc/thread-self/ns/net").map_err(|e| NetworkError::Namespace {
                name: self.name.clone(),
                detail: format!("open current namespace: {e}"),
            })?;
        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|e| NetworkError::Namespace {
            name: self.name.clone(),
            detail: format!("setns: {e}"),
        })?;
        Ok(NsGuard {
            original,
            _ns: PhantomData,
            _not_send: PhantomData,
        })
    }

    /// Run `f` on a blocking thread switched into this namespace.
    ///
    /// Sockets created by `f` stay bound to this namespace after it returns.
    pub async fn run<F, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ns = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = ns.enter()?;
            f().map_err(NetworkError::Io)
        })
        .await
        .map_err(|e| NetworkError::Namespace {
            name: self.name.clone(),
            detail: format!("namespace task failed: {e}"),
        })?
    }

    /// A command whose process runs inside this namespace.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", self.name.as_str()]).arg(program);
        cmd
    }

    /// [`command::exec`] inside this namespace.
    pub async fn exec(
        &self,
        program: &str,
        args: &[&str],
    ) -> std::result::Result<String, CommandError> {
        let mut cmd = self.command(program);
        cmd.args(args);
        command::run(cmd, self.display(program, args)).await
    }

    pub async fn exec_ignore_errors(&self, program: &str, args: &[&str]) {
        let mut cmd = self.command(program);
        cmd.args(args);
        command::run_ignore_errors(cmd, self.display(program, args)).await;
    }

    fn display(&self, program: &str, args: &[&str]) -> String {
        format!("[{}] {}", self.name, format_command_display(program, args))
    }

    /// Delete the namespace. Only the first call has any effect.
    pub async fn destroy(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        command::exec_ignore_errors("ip", &["netns", "del", &self.name]).await;
        info!(name = %self.name, "network namespace deleted");
    }
}

/// Restores the thread's original namespace on drop.
#[must_use]
pub struct NsGuard<'a> {
    original: File,
    _ns: PhantomData<&'a NetNs>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NsGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            // The thread would keep running in the wrong namespace and be
            // handed to unrelated work.
            error!(error = %e, "failed to restore network namespace, aborting");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_namespace_fails() {
        let err = NetNs::open("fleet-does-not-exist").unwrap_err();
        assert!(
            err.to_string().contains("fleet-does-not-exist"),
            "error was: {err}"
        );
    }

    #[tokio::test]
    #[ignore = "requires root"]
    async fn sockets_bound_inside_stay_inside() {
        let ns = Arc::new(NetNs::create("fleet-test-run").await.unwrap());
        ns.exec("ip", &["link", "set", "lo", "up"]).await.unwrap();
        let (_listener, addr) = ns
            .run(|| {
                let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
                let addr = listener.local_addr()?;
                Ok((listener, addr))
            })
            .await
            .unwrap();
        // Same port in the root namespace is unrelated to the one inside.
        assert!(std::net::TcpStream::connect(addr).is_err());
        ns.destroy().await;
        ns.destroy().await;
    }
}
