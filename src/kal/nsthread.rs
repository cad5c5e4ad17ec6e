//! Namespace-thread pinning (§4.1 "Concurrency", Design Notes
//! "Namespace-thread pinning").
//!
//! `setns(2)` changes the network namespace of the *calling thread only*.
//! Every KAL operation that must run inside a sandbox's namespace is
//! dispatched onto a freshly spawned OS thread: the thread enters the
//! namespace via `setns`, runs the closure, and is then discarded. Unlike a
//! pooled worker, this thread is never returned to any pool — on the way
//! out it simply exits, so nothing ever reuses a thread that might still be
//! sitting in the wrong namespace if `setns` half-failed. A one-shot
//! "enter namespace, run, exit" unit of work, following `qmonnet-dataplane`'s
//! `interface-manager` crate's `in_netns`/`swap_thread_to_netns` for the raw
//! `setns` call itself (`nix::sched::setns` against an open fd for the
//! namespace file).

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;

/// Enter the namespace at `ns_path` and run `f` on a dedicated OS thread.
/// Blocks the calling thread until `f` completes. The worker thread is
/// joined on the happy path; if `setns` fails the thread exits immediately
/// without running `f`, and the failure is surfaced as an error — callers
/// should treat it as fatal per §7 and roll back whatever they were
/// attempting.
pub fn run_in_namespace<F, T>(ns_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let ns_path: PathBuf = ns_path.to_path_buf();
    let handle = thread::Builder::new()
        .name("overlay-ns-worker".into())
        .spawn(move || -> Result<T> {
            enter_namespace(&ns_path)
                .with_context(|| format!("entering namespace {}", ns_path.display()))?;
            f()
        })
        .context("failed to spawn namespace worker thread")?;

    match handle.join() {
        Ok(result) => result,
        Err(panic) => {
            // The thread panicked while potentially still in the target
            // namespace. Do not attempt to recover it onto any pool: let it
            // be gone, and let the runtime replace capacity elsewhere.
            anyhow::bail!("namespace worker thread panicked: {:?}", panic_message(&panic))
        }
    }
}

fn enter_namespace(ns_path: &Path) -> Result<()> {
    let fd = open(ns_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("opening namespace file {}", ns_path.display()))?;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
    setns(borrowed, CloneFlags::CLONE_NEWNET).context("setns(CLONE_NEWNET) failed")?;
    Ok(())
}

/// Like `run_in_namespace`, but additionally `unshare(CLONE_NEWNS)`s and
/// makes the mount tree private before running `f` (§4.4 "Clear the bridge
/// default PVID to 0 via sysfs (requires remounting `/sys` in a cloned
/// mount namespace inside the sandbox, to avoid affecting the host)").
/// Without the private mount namespace, writing to the bridge's sysfs
/// `default_pvid` file on a shared `/sys` mount would leak the change back
/// to the host.
pub fn run_in_namespace_with_private_mount<F, T>(ns_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let ns_path: PathBuf = ns_path.to_path_buf();
    let handle = thread::Builder::new()
        .name("overlay-ns-mount-worker".into())
        .spawn(move || -> Result<T> {
            enter_namespace(&ns_path)
                .with_context(|| format!("entering namespace {}", ns_path.display()))?;
            make_mount_tree_private()?;
            f()
        })
        .context("failed to spawn namespace worker thread")?;

    match handle.join() {
        Ok(result) => result,
        Err(panic) => {
            anyhow::bail!("namespace worker thread panicked: {:?}", panic_message(&panic))
        }
    }
}

fn make_mount_tree_private() -> Result<()> {
    use nix::mount::{mount, MsFlags};
    nix::sched::unshare(CloneFlags::CLONE_NEWNS).context("unshare(CLONE_NEWNS) failed")?;
    // Prevent this thread's sysfs remounts/writes from propagating back to
    // the host's mount namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("marking mount tree private failed")?;
    Ok(())
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_extracts_str_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");
    }
}
