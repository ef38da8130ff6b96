//! Watcher: OS-event and polling producers that push file events into the
//! [`crate::event_queue::EventQueue`].
//!
//! Unlike `vault-watch` (its closest precedent in the retrieved examples),
//! this watcher does no in-process coalescing or rename-pairing of its own:
//! every observed change is pushed straight to the Event Queue, which
//! already coalesces and debounces at lease time (§4.D). The Watcher's only
//! job is translating OS/poll observations into `(path, EventKind, new_path)`
//! triples.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::warn;

use markdownkeeper_core::error::CoreResult;
use markdownkeeper_core::models::EventKind;

use crate::config::WatchConfig;
use crate::event_queue::EventQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Auto,
    Notify,
    Polling,
}

impl WatchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(WatchMode::Auto),
            "notify" => Some(WatchMode::Notify),
            "polling" => Some(WatchMode::Polling),
            _ => None,
        }
    }
}

/// Stop condition for a watch run: a wall-clock duration, an iteration
/// count (polling only, or derived for notify as `iterations * interval`),
/// or run-forever.
#[derive(Debug, Clone, Copy)]
pub struct WatchBudget {
    pub interval: Duration,
    pub iterations: Option<u64>,
    pub duration: Option<Duration>,
}

impl WatchBudget {
    /// §4.E: "if only iterations are specified in Notify mode, duration is
    /// derived as `iterations × interval`."
    fn notify_duration(&self) -> Option<Duration> {
        self.duration.or_else(|| self.iterations.map(|n| self.interval * n as u32))
    }
}

fn has_watched_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else { return false };
    extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// Runs the watcher until its [`WatchBudget`] is exhausted, enqueuing
/// translated events on `queue`. `auto` tries Notify first and falls back
/// to Polling if OS subscription fails for any root.
pub async fn run(
    mode: WatchMode,
    watch: &WatchConfig,
    budget: WatchBudget,
    queue: &EventQueue,
) -> CoreResult<()> {
    match mode {
        WatchMode::Notify => run_notify(watch, budget, queue).await,
        WatchMode::Polling => run_polling(watch, budget, queue).await,
        WatchMode::Auto => match try_run_notify(watch, budget, queue).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("notify backend unavailable ({e}), falling back to polling");
                run_polling(watch, budget, queue).await
            }
        },
    }
}

async fn run_notify(watch: &WatchConfig, budget: WatchBudget, queue: &EventQueue) -> CoreResult<()> {
    try_run_notify(watch, budget, queue).await.map_err(markdownkeeper_core::error::CoreError::Backend)
}

enum RawEvent {
    Path { kind: EventKind, path: PathBuf },
    Move { from: PathBuf, to: PathBuf },
}

async fn try_run_notify(watch: &WatchConfig, budget: WatchBudget, queue: &EventQueue) -> Result<(), String> {
    let (tx, mut rx) = unbounded_channel::<RawEvent>();
    let extensions = watch.extensions.clone();

    let mut watcher = make_notify_watcher(tx, extensions.clone()).map_err(|e| e.to_string())?;
    for root in &watch.roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| format!("failed to watch {}: {e}", root.display()))?;
    }

    let deadline = budget.notify_duration().map(|d| tokio::time::Instant::now() + d);

    loop {
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        let recv = if let Some(deadline) = deadline {
            tokio::time::timeout_at(deadline, rx.recv()).await
        } else {
            Ok(rx.recv().await)
        };

        let Ok(Some(event)) = recv else {
            if deadline.is_some() {
                break;
            }
            continue;
        };

        enqueue_raw_event(queue, event).await;
    }

    Ok(())
}

fn make_notify_watcher(
    tx: UnboundedSender<RawEvent>,
    extensions: Vec<String>,
) -> notify::Result<RecommendedWatcher> {
    RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            let Ok(event) = result else { return };
            for raw in translate_notify_event(&event, &extensions) {
                let _ = tx.send(raw);
            }
        },
        NotifyConfig::default(),
    )
}

fn translate_notify_event(event: &notify::Event, extensions: &[String]) -> Vec<RawEvent> {
    let watched = |p: &Path| has_watched_extension(p, extensions);

    match event.kind {
        NotifyEventKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| watched(p))
            .map(|p| RawEvent::Path { kind: EventKind::Create, path: p.clone() })
            .collect(),
        NotifyEventKind::Modify(ModifyKind::Data(_)) | NotifyEventKind::Modify(ModifyKind::Metadata(_)) => {
            event
                .paths
                .iter()
                .filter(|p| watched(p))
                .map(|p| RawEvent::Path { kind: EventKind::Modify, path: p.clone() })
                .collect()
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = event.paths[0].clone();
            let to = event.paths[1].clone();
            if watched(&to) {
                vec![RawEvent::Move { from, to }]
            } else if watched(&from) {
                vec![RawEvent::Path { kind: EventKind::Delete, path: from }]
            } else {
                Vec::new()
            }
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter(|p| watched(p))
            .map(|p| RawEvent::Path { kind: EventKind::Delete, path: p.clone() })
            .collect(),
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter(|p| watched(p))
            .map(|p| RawEvent::Path { kind: EventKind::Create, path: p.clone() })
            .collect(),
        NotifyEventKind::Modify(_) | NotifyEventKind::Any | NotifyEventKind::Other => event
            .paths
            .iter()
            .filter(|p| watched(p))
            .map(|p| RawEvent::Path { kind: EventKind::Modify, path: p.clone() })
            .collect(),
        NotifyEventKind::Remove(_) => event
            .paths
            .iter()
            .filter(|p| watched(p))
            .map(|p| RawEvent::Path { kind: EventKind::Delete, path: p.clone() })
            .collect(),
        NotifyEventKind::Access(_) => Vec::new(),
    }
}

async fn enqueue_raw_event(queue: &EventQueue, event: RawEvent) {
    let result = match event {
        RawEvent::Path { kind, path } => queue.enqueue(&path_str(&path), kind, None).await,
        RawEvent::Move { from, to } => {
            queue.enqueue(&path_str(&from), EventKind::Move, Some(&path_str(&to))).await
        }
    };
    if let Err(e) = result {
        warn!("failed to enqueue watcher event: {e}");
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Snapshots the watched trees every `interval`, diffing against an
/// in-memory `path -> mtime` map. A path absent from the new snapshot is a
/// delete; a path whose mtime advanced (or is new) is a create/modify.
async fn run_polling(watch: &WatchConfig, budget: WatchBudget, queue: &EventQueue) -> CoreResult<()> {
    let mut known: HashMap<PathBuf, SystemTime> = HashMap::new();
    let mut iteration = 0u64;
    let deadline = budget.duration.map(|d| tokio::time::Instant::now() + d);

    loop {
        if let Some(limit) = budget.iterations {
            if iteration >= limit {
                break;
            }
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        let snapshot = snapshot_tree(&watch.roots, &watch.extensions);

        for (path, mtime) in &snapshot {
            match known.get(path) {
                Some(prev) if prev == mtime => {}
                Some(_) => {
                    let _ = queue.enqueue(&path_str(path), EventKind::Modify, None).await;
                }
                None => {
                    let _ = queue.enqueue(&path_str(path), EventKind::Create, None).await;
                }
            }
        }
        for path in known.keys() {
            if !snapshot.contains_key(path) {
                let _ = queue.enqueue(&path_str(path), EventKind::Delete, None).await;
            }
        }

        known = snapshot;
        iteration += 1;
        tokio::time::sleep(budget.interval).await;
    }

    Ok(())
}

fn snapshot_tree(roots: &[PathBuf], extensions: &[String]) -> HashMap<PathBuf, SystemTime> {
    let mut out = HashMap::new();
    for root in roots {
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !has_watched_extension(path, extensions) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    out.insert(path.to_path_buf(), mtime);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_mode_parses_known_values() {
        assert_eq!(WatchMode::parse("auto"), Some(WatchMode::Auto));
        assert_eq!(WatchMode::parse("notify"), Some(WatchMode::Notify));
        assert_eq!(WatchMode::parse("polling"), Some(WatchMode::Polling));
        assert_eq!(WatchMode::parse("bogus"), None);
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        let extensions = vec!["md".to_string(), "markdown".to_string()];
        assert!(has_watched_extension(Path::new("a/b.MD"), &extensions));
        assert!(has_watched_extension(Path::new("a/b.markdown"), &extensions));
        assert!(!has_watched_extension(Path::new("a/b.txt"), &extensions));
    }

    #[test]
    fn notify_duration_derives_from_iterations_when_duration_absent() {
        let budget = WatchBudget { interval: Duration::from_secs(2), iterations: Some(5), duration: None };
        assert_eq!(budget.notify_duration(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn notify_duration_prefers_explicit_duration() {
        let budget =
            WatchBudget { interval: Duration::from_secs(2), iterations: Some(5), duration: Some(Duration::from_secs(3)) };
        assert_eq!(budget.notify_duration(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn snapshot_tree_finds_watched_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.md"), "# hi").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), "nope").unwrap();

        let extensions = vec!["md".to_string()];
        let snapshot = snapshot_tree(&[dir.path().to_path_buf()], &extensions);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.keys().next().unwrap().ends_with("note.md"));
    }
}
