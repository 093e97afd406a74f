use crate::error::Result;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Pipeline stage reported in the progress feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    Normalize,
    Embed,
    Index,
    Summarize,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Discover => write!(f, "discover"),
            Stage::Normalize => write!(f, "normalize"),
            Stage::Embed => write!(f, "embed"),
            Stage::Index => write!(f, "index"),
            Stage::Summarize => write!(f, "summarize"),
            Stage::Finalize => write!(f, "finalize"),
        }
    }
}

/// Counters for one run, shared across progress events. `done` counts
/// restaurants that reached a terminal state regardless of outcome.
#[derive(Clone)]
pub struct RunProgress {
    pub run_id: String,
    pub stage: Stage,
    pub total: usize,
    pub done: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started: Instant,
}

impl RunProgress {
    pub fn new(run_id: &str, total: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: Stage::Discover,
            total,
            done: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            started: Instant::now(),
        }
    }

    pub fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 && self.done > 0 {
            self.done as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn eta_seconds(&self) -> u64 {
        let rate = self.rate();
        if rate > 0.0 {
            let remaining = self.total.saturating_sub(self.done);
            (remaining as f64 / rate) as u64
        } else {
            0
        }
    }

    pub fn percent(&self) -> usize {
        if self.total > 0 {
            (self.done * 100) / self.total
        } else {
            0
        }
    }
}

/// Append-only key=value feed for dashboards to tail. One line per
/// event, flushed immediately; free-text fields are URL-encoded so the
/// line stays whitespace-splittable.
#[derive(Clone)]
pub struct ProgressFeed {
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl ProgressFeed {
    pub fn new(log_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = format!("{log_dir}/progress_feed.log");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Event types: progress | stage | done | error
    pub async fn emit(
        &self,
        progress: &RunProgress,
        event: &str,
        subject: Option<&str>,
        note: Option<&str>,
    ) -> Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let subject_encoded = urlencoding::encode(subject.unwrap_or(""));
        let note_encoded = urlencoding::encode(note.unwrap_or(""));

        let line = format!(
            "ts={} run={} event={} stage={} done={} total={} succeeded={} failed={} skipped={} pct={} rate={:.2} eta_s={} subject={} note={}\n",
            ts,
            progress.run_id,
            event,
            progress.stage,
            progress.done,
            progress.total,
            progress.succeeded,
            progress.failed,
            progress.skipped,
            progress.percent(),
            progress.rate(),
            progress.eta_seconds(),
            subject_encoded,
            note_encoded,
        );

        let mut guard = self.writer.lock().await;
        guard.write_all(line.as_bytes())?;
        guard.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_render_lowercase() {
        assert_eq!(Stage::Discover.to_string(), "discover");
        assert_eq!(Stage::Embed.to_string(), "embed");
        assert_eq!(Stage::Finalize.to_string(), "finalize");
    }

    #[test]
    fn percent_and_eta_handle_zero_totals() {
        let progress = RunProgress::new("run-a", 0);
        assert_eq!(progress.percent(), 0);
        assert_eq!(progress.eta_seconds(), 0);
        assert_eq!(progress.rate(), 0.0);
    }

    #[test]
    fn percent_tracks_done_over_total() {
        let mut progress = RunProgress::new("run-a", 8);
        progress.done = 2;
        assert_eq!(progress.percent(), 25);
        progress.done = 8;
        assert_eq!(progress.percent(), 100);
    }

    #[tokio::test]
    async fn events_land_as_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let feed = ProgressFeed::new(dir.path().to_str().unwrap()).unwrap();

        let mut progress = RunProgress::new("run-a", 4);
        feed.emit(&progress, "stage", None, None).await.unwrap();

        progress.stage = Stage::Embed;
        progress.done = 1;
        progress.succeeded = 1;
        feed.emit(&progress, "progress", Some("Cafe Luna"), Some("32 chunks"))
            .await
            .unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("progress_feed.log")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        assert!(lines[0].contains("run=run-a"));
        assert!(lines[0].contains("event=stage"));
        assert!(lines[0].contains("stage=discover"));
        assert!(lines[0].contains("subject= "));

        assert!(lines[1].contains("stage=embed"));
        assert!(lines[1].contains("done=1 total=4"));
        assert!(lines[1].contains("pct=25"));
        assert!(lines[1].contains("subject=Cafe%20Luna"));
        assert!(lines[1].contains("note=32%20chunks"));

        // every field stays single-token
        for line in lines {
            assert!(line.split_whitespace().all(|kv| kv.contains('=')));
        }
    }
}
