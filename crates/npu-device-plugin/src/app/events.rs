use std::ffi::OsStr;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

/// Everything the supervisor reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// kubelet recreated its registration socket
    SocketRecreated,
    RestartSignal,
    Terminate(&'static str),
    WatchError(String),
}

/// Whether `event` is the creation of the socket named `socket_name`.
pub fn is_socket_creation(event: &Event, socket_name: &OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(socket_name))
}

/// Hand `event` to the supervisor; returns `false` once it stopped listening.
fn forward_blocking(tx: &mpsc::Sender<SupervisorEvent>, event: SupervisorEvent) -> bool {
    match tx.blocking_send(event) {
        Ok(()) => true,
        Err(e) => {
            debug!("supervisor gone, dropping {:?}", e.0);
            false
        }
    }
}

/// Watch the device plugin directory for kubelet restarts.
///
/// The returned watcher stops reporting once dropped.
pub fn watch_plugin_dir(
    plugin_dir: &Path,
    kubelet_socket: &Path,
    tx: mpsc::Sender<SupervisorEvent>,
) -> Result<RecommendedWatcher> {
    let socket_name = kubelet_socket
        .file_name()
        .context("kubelet socket path has no file name")?
        .to_os_string();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) if is_socket_creation(&event, &socket_name) => {
                    SupervisorEvent::SocketRecreated
                }
                Ok(event) => {
                    debug!("Filesystem event: {:?}", event);
                    return;
                }
                Err(e) => SupervisorEvent::WatchError(e.to_string()),
            };
            // runs on the watcher thread, outside the runtime
            forward_blocking(&tx, event);
        },
        Config::default(),
    )
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", plugin_dir.display()))?;
    info!("watching {} for kubelet restarts", plugin_dir.display());
    Ok(watcher)
}

/// Forward SIGHUP as a restart and SIGINT, SIGTERM or SIGQUIT as termination.
pub fn spawn_signal_listener(tx: mpsc::Sender<SupervisorEvent>) -> Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => SupervisorEvent::RestartSignal,
                _ = sigint.recv() => SupervisorEvent::Terminate("SIGINT"),
                _ = sigterm.recv() => SupervisorEvent::Terminate("SIGTERM"),
                _ = sigquit.recv() => SupervisorEvent::Terminate("SIGQUIT"),
            };
            info!("received signal event {event:?}");
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use notify::event::CreateKind;
    use notify::event::ModifyKind;

    use super::*;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_creation_of_the_kubelet_socket_matches() {
        let name = OsStr::new("kubelet.sock");
        assert!(is_socket_creation(
            &event(
                EventKind::Create(CreateKind::File),
                "/var/lib/kubelet/device-plugins/kubelet.sock"
            ),
            name
        ));
        assert!(is_socket_creation(
            &event(
                EventKind::Create(CreateKind::Other),
                "/var/lib/kubelet/device-plugins/kubelet.sock"
            ),
            name
        ));
        assert!(!is_socket_creation(
            &event(
                EventKind::Create(CreateKind::File),
                "/var/lib/kubelet/device-plugins/Ascend910B3.sock"
            ),
            name
        ));
        assert!(!is_socket_creation(
            &event(
                EventKind::Modify(ModifyKind::Any),
                "/var/lib/kubelet/device-plugins/kubelet.sock"
            ),
            name
        ));
    }

    #[test_log::test]
    fn events_after_supervisor_exit_are_dropped() {
        let (tx, rx) = mpsc::channel(1);
        assert!(forward_blocking(&tx, SupervisorEvent::RestartSignal));

        drop(rx);
        assert!(!forward_blocking(&tx, SupervisorEvent::SocketRecreated));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn creating_the_socket_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = watch_plugin_dir(dir.path(), &socket, tx).unwrap();

        std::fs::write(dir.path().join("other.sock"), b"").unwrap();
        std::fs::write(&socket, b"").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the socket")
            .unwrap();
        assert_eq!(event, SupervisorEvent::SocketRecreated);
    }
}
