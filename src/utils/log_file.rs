//! Append-only log file for peer mode.
//!
//! Line format: `[2026-01-02T03:04:05.678+00:00] INFO target: message {k = v, ..}`

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Default)]
struct LineBuilder {
    message: String,
    fields: Vec<String>,
}

impl Visit for LineBuilder {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{} = {value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{} = {value:?}", field.name()));
        }
    }
}

fn format_line(event: &Event<'_>) -> String {
    let meta = event.metadata();
    let mut builder = LineBuilder::default();
    event.record(&mut builder);

    let mut line = format!(
        "[{}] {} {}:",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        meta.level(),
        meta.target()
    );
    if !builder.message.is_empty() {
        let _ = write!(line, " {}", builder.message);
    }
    if !builder.fields.is_empty() {
        let _ = write!(line, " {{{}}}", builder.fields.join(", "));
    }
    line.push('\n');
    line
}

/// Tracing layer appending one line per event to a file.
pub struct FileLogLayer {
    file: Mutex<File>,
}

impl FileLogLayer {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let line = format_line(event);
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn writes_structured_fields() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("log_file");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("logs").join("roomdrop.log");

        let layer = FileLogLayer::new(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(event = "peer_joined", device = "abc", count = 3, "Peer joined room");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains(" INFO "));
        assert!(text.contains("Peer joined room {event = peer_joined, device = abc, count = 3}"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
