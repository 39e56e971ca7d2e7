//! Cluster event watcher
//!
//! Opens a filtered watch over cluster events and hands matching events to
//! the caller through a channel. Watches are best-effort telemetry: nothing
//! that decides success or failure depends on an event arriving.
//!
//! Every [`EventWatch`] must be stopped with [`EventWatch::stop`] once the
//! caller is done; that signals the pump task, drains what is left in the
//! channel and waits for the task so the underlying connection is released.
//! Events the stream had already delivered are forwarded before the pump
//! honours the stop signal.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::api::WatchEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cluster::{ClusterApi, ClusterResult, EventStream};
use crate::progress::Progress;

pub const POD_KIND: &str = "Pod";

const EVENT_BUFFER: usize = 100;

/// Field selector for events about objects of `kind`, optionally one name.
pub fn event_field_selector(kind: &str, name: Option<&str>) -> String {
    let mut selector = format!("involvedObject.kind={kind}");
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        selector.push_str(&format!(",involvedObject.name={name}"));
    }
    selector
}

/// Start watching events about `kind` objects (optionally only `name`),
/// resuming from `resume_token` or from now when it is empty.
pub async fn watch_events<C>(
    cluster: &C,
    kind: &str,
    name: Option<&str>,
    resume_token: &str,
) -> ClusterResult<EventWatch>
where
    C: ClusterApi + ?Sized,
{
    let selector = event_field_selector(kind, name);
    let stream = cluster.watch_events(&selector, resume_token).await?;
    debug!(selector = %selector, resume_token, "Event watch started");
    Ok(EventWatch::spawn(stream))
}

/// Handle to a running event watch.
pub struct EventWatch {
    rx: mpsc::Receiver<Event>,
    stop_tx: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl EventWatch {
    fn spawn(mut stream: EventStream) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    item = stream.next() => {
                        let event = match item {
                            Some(Ok(WatchEvent::Added(ev)))
                            | Some(Ok(WatchEvent::Modified(ev)))
                            | Some(Ok(WatchEvent::Deleted(ev))) => ev,
                            Some(Ok(WatchEvent::Bookmark(_))) => continue,
                            Some(Ok(WatchEvent::Error(e))) => {
                                warn!(code = e.code, message = %e.message, "Event watch returned an error");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Event watch stream failed");
                                break;
                            }
                            None => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Self {
            rx,
            stop_tx: Some(stop_tx),
            pump: Some(pump),
        }
    }

    /// Next event, or `None` once the underlying stream has closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Stop the watch and wait for the pump task, returning the events
    /// still buffered.
    pub async fn stop(mut self) -> Vec<Event> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let mut rest = Vec::new();
        while let Some(event) = self.rx.recv().await {
            rest.push(event);
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        rest
    }

    /// Print every event to `progress` from a background task until the
    /// returned printer is stopped. Events still buffered at that point are
    /// printed too.
    pub fn print_to(self, progress: Progress, show_sub: bool) -> EventPrinter {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut watch = self;
        let print = move |event: &Event| {
            progress.line(format!(" ---> {}", format_event(event, show_sub)));
        };
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = watch.recv() => match event {
                        Some(event) => print(&event),
                        None => break,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            for event in watch.stop().await {
                print(&event);
            }
        });
        EventPrinter {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for EventWatch {
    fn drop(&mut self) {
        // Safety net for paths that never reached stop().
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Background task relaying watched events to a progress sink.
pub struct EventPrinter {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EventPrinter {
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for EventPrinter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Render an event as `<object>[ - <field path>] - <message> [<component>[, <host>]]`.
pub fn format_event(event: &Event, show_sub: bool) -> String {
    let involved = &event.involved_object;
    let sub = match involved.field_path.as_deref() {
        Some(path) if show_sub && !path.is_empty() => format!(" - {path}"),
        _ => String::new(),
    };
    let source = event.source.as_ref();
    let mut component = vec![source
        .and_then(|s| s.component.clone())
        .unwrap_or_default()];
    if let Some(host) = source.and_then(|s| s.host.clone()).filter(|h| !h.is_empty()) {
        component.push(host);
    }
    format!(
        "{}{} - {} [{}]",
        involved.name.as_deref().unwrap_or_default(),
        sub,
        event.message.as_deref().unwrap_or_default(),
        component.join(", "),
    )
}

/// Whether `event` belongs to the units of `deployment_name`.
///
/// Matches by name prefix of the involved object, so objects whose names
/// merely start with the deployment name also match.
pub fn is_deployment_event(event: &Event, deployment_name: &str) -> bool {
    event
        .involved_object
        .name
        .as_deref()
        .is_some_and(|name| name.starts_with(deployment_name))
}
