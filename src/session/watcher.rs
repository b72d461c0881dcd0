//! Template and authorization file watching
//!
//! Modify events from `notify` are bridged into a tokio channel; the
//! drain task reparses whichever file changed. Reload failures are
//! logged and the previous state kept.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::station::Station;
use crate::support::errors::SimulatorError;

pub(crate) fn spawn_watchers(station: &Arc<Station>) -> Result<(), SimulatorError> {
    let Some(template_path) = station.template_path() else {
        // In-memory templates (tests, embedded supervisors) have nothing
        // to watch.
        return Ok(());
    };
    {
        let session = station.lock_session();
        if session.watcher.is_some() || session.watch.is_some() {
            return Ok(());
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher =
        notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                if matches!(event.kind, EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        })?;
    watcher.watch(&template_path, RecursiveMode::NonRecursive)?;

    if let Some(authorization_path) = station.authorization_file_path() {
        if let Err(err) = watcher.watch(&authorization_path, RecursiveMode::NonRecursive) {
            warn!(
                station_id = station.id(),
                path = %authorization_path.display(),
                error = %err,
                "Cannot watch authorization file"
            );
        }
    }

    let task_station = station.clone();
    let task = tokio::spawn(async move {
        while let Some(changed) = rx.recv().await {
            let is_authorization = task_station
                .authorization_file_path()
                .map(|path| path == changed)
                .unwrap_or(false);
            if is_authorization {
                info!(
                    station_id = task_station.id(),
                    path = %changed.display(),
                    "Authorization file changed, reloading tags"
                );
                task_station.reload_authorized_tags();
            } else {
                info!(
                    station_id = task_station.id(),
                    path = %changed.display(),
                    "Station template changed, reinitialising"
                );
                if let Err(err) = task_station.reload_template() {
                    error!(
                        station_id = task_station.id(),
                        error = %err,
                        "Template reload failed, keeping previous template"
                    );
                }
            }
        }
    });

    let mut session = station.lock_session();
    session.watcher = Some(watcher);
    session.watch = Some(task);
    Ok(())
}
