use std::path::PathBuf;
use std::time::Duration;

use notify_debouncer_full::{
    notify::{EventKind, RecursiveMode, Watcher},
    new_debouncer, DebounceEventResult, Debouncer, FileIdCache,
};

use tokio::sync::broadcast::*;

use crate::prelude::*;

/// Watch the pages root; changed paths are debounced and broadcast to the
/// hot-reload task.
pub fn init_watcher(
    ctx: &Context,
) -> Result<(Debouncer<impl Watcher, impl FileIdCache>, Receiver<Vec<PathBuf>>)> {
    let pages_dir = ctx.config.pages_dir.clone();

    let (tx, rx) = channel(16);

    let mut debouncer = new_debouncer(
        Duration::from_secs(1),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let mut changed: Vec<PathBuf> = Vec::new();

                for event in &events {
                    use EventKind::*;
                    if !matches!(event.kind, Any | Create(_) | Modify(_) | Remove(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if !changed.contains(path) {
                            changed.push(path.clone());
                        }
                    }
                }

                debug!("Watcher received events - {events:?}");

                if changed.is_empty() {
                    return;
                }

                let _ = tx.send(changed);
            }
            Err(errors) => {
                for error in errors {
                    error!("Debouncer error: {error:?}")
                }
            }
        },
    )?;

    debouncer
        .watcher()
        .watch(&pages_dir, RecursiveMode::Recursive)?;

    debouncer.cache().add_root(&pages_dir, RecursiveMode::Recursive);

    Ok((debouncer, rx))
}
