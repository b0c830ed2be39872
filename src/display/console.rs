//! Headless progress display
//! Consumes session events and reports them through tracing.
//! Preview status is rate limited so a 200 fps live view does not flood the log.

use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, info};

use crate::export::ExportReport;
use crate::pipeline::{PreviewStatus, SessionEvent, SessionState};

/// What the display saw, handed back when the event channel closes
#[derive(Debug, Clone, Default)]
pub struct DisplaySummary {
    pub events: usize,
    pub last_state: Option<SessionState>,
    pub last_progress: Option<(usize, usize)>,
    pub export: Option<ExportReport>,
}

pub struct ConsoleDisplay {
    interval: Duration,
    last_line: Option<Instant>,
    summary: DisplaySummary,
}

impl ConsoleDisplay {
    /// `interval` bounds how often preview and progress lines are printed
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_line: None,
            summary: DisplaySummary::default(),
        }
    }

    pub fn handle(&mut self, event: SessionEvent) {
        self.summary.events += 1;
        match event {
            SessionEvent::StateChanged(state) => {
                info!("Session {:?}", state);
                self.summary.last_state = Some(state);
                self.last_line = None;
            }
            SessionEvent::Preview(status) => {
                if self.due() {
                    self.render_preview(&status);
                }
            }
            SessionEvent::Progress { available, target } => {
                self.summary.last_progress = Some((available, target));
                if available == target || self.due() {
                    info!(
                        "Acquiring {}/{} frames ({:.0}%)",
                        available,
                        target,
                        percent(available, target)
                    );
                }
            }
            SessionEvent::Drained { frames, sidecar } => {
                info!("Drained {} frames, metadata in {}", frames, sidecar.display());
            }
            SessionEvent::ExportFinished(report) => {
                info!(
                    "{} export wrote {} ({} frames, {} bytes) in {:.2?}",
                    report.exporter,
                    report.path.display(),
                    report.frames,
                    report.bytes,
                    report.elapsed
                );
                self.summary.export = Some(report);
            }
        }
    }

    fn render_preview(&self, status: &PreviewStatus) {
        info!(
            "t={:.3}s {:?} {}x{} @ {:.1} fps",
            status.timestamp, status.state, status.width, status.height, status.measured_frame_rate
        );
    }

    fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_line {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_line = Some(now);
                true
            }
        }
    }

    /// Drain events until every sender is gone
    pub async fn run(mut self, rx: Receiver<SessionEvent>) -> DisplaySummary {
        while let Ok(event) = rx.recv_async().await {
            self.handle(event);
        }
        debug!("Display channel closed after {} events", self.summary.events);
        self.summary
    }
}

fn percent(available: usize, target: usize) -> f64 {
    if target == 0 {
        0.0
    } else {
        available as f64 * 100.0 / target as f64
    }
}
