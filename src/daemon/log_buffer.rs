use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

const DEFAULT_MAX_LINES: usize = 10_000;
const FEED_CAPACITY: usize = 1024;

/// A captured line of plugin host output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub plugin: String,
    pub line: String,
}

/// Per-plugin ring buffer for captured host stderr, plus a live feed for
/// followers.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, Vec<String>>>,
    feed: broadcast::Sender<LogLine>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// Append a line for the given plugin, trimming oldest if over capacity.
    pub fn push(&self, plugin: &str, line: String) {
        {
            let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
            let entries = logs.entry(plugin.to_string()).or_default();
            entries.push(line.clone());
            if entries.len() > self.max_lines {
                let excess = entries.len() - self.max_lines;
                entries.drain(..excess);
            }
        }
        // No followers is fine.
        let _ = self.feed.send(LogLine {
            plugin: plugin.to_string(),
            line,
        });
    }

    /// Return the last `n` lines for a plugin (or all if `n` exceeds stored count).
    pub fn tail(&self, plugin: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = logs.get(plugin) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }

    /// Last `n` lines of every plugin, grouped by plugin name.
    pub fn tail_all(&self, n: usize) -> Vec<LogLine> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&String> = logs.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| {
                let entries = &logs[name];
                let start = entries.len().saturating_sub(n);
                entries[start..].iter().map(move |line| LogLine {
                    plugin: name.clone(),
                    line: line.clone(),
                })
            })
            .collect()
    }

    /// Receive every line pushed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.feed.subscribe()
    }

    /// Remove all logs for a plugin.
    pub fn clear(&self, plugin: &str) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.remove(plugin);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
