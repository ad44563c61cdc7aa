//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OSI PI driver: WebId resolution, windowed batch reads and the time cursor."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use m2c_common::time::{format_millis, secs_f64};
use m2c_model::{OsiPiConfig, Protocol};
use m2c_persistence::TimeCursorFile;
use m2c_protocols::osipi::{PiWebClient, ReadWindow, ResolvedPoint};
use m2c_protocols::ProtocolError;
use serde_json::{json, Value};
use tracing::debug;

use crate::driver::{DeviceDriver, PollOutcome};
use crate::Result;

/// Historian-style reader. Each poll covers `[cursor, end]`, and the cursor is
/// moved to `end + 1 ms` once the window has been read.
#[derive(Debug)]
pub struct OsiPiDriver {
    config: OsiPiConfig,
    client: PiWebClient,
    cursor: TimeCursorFile,
    points: Vec<ResolvedPoint>,
}

/// Cursor to persist after reading `window`, or `None` to keep the old one.
///
/// An empty answer for a window that reached the query horizon leaves the
/// cursor where it was so late-arriving values are picked up next time. An
/// empty capped window still advances: holding the cursor there would re-read
/// the same empty catch-up window forever and the backlog would never drain.
pub fn cursor_after(window: &ReadWindow, samples_read: usize) -> Option<DateTime<Utc>> {
    (samples_read > 0 || window.is_offset).then(|| window.next_cursor())
}

impl OsiPiDriver {
    pub fn new(config: OsiPiConfig, client: PiWebClient, cursor: TimeCursorFile) -> Self {
        Self {
            config,
            client,
            cursor,
            points: Vec::new(),
        }
    }

    pub fn points(&self) -> &[ResolvedPoint] {
        &self.points
    }

    /// Poll against an explicit clock.
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Result<PollOutcome> {
        if self.points.is_empty() && !self.config.tags.is_empty() {
            return Err(ProtocolError::NotConnected.into());
        }
        let last = self.cursor.load()?;
        let Some(window) = ReadWindow::plan(last, now, &self.config) else {
            return Ok(PollOutcome {
                samples: Vec::new(),
                next_delay: Some(secs_f64(self.config.request_frequency)),
            });
        };
        let samples = self.client.recorded(&self.points, &window).await?;
        if let Some(next) = cursor_after(&window, samples.len()) {
            self.cursor.store(next)?;
        }
        debug!(
            start = %format_millis(window.start),
            end = %format_millis(window.end),
            is_offset = window.is_offset,
            values = samples.len(),
            "pi window read"
        );
        Ok(PollOutcome {
            samples,
            next_delay: Some(window.next_delay(&self.config)),
        })
    }
}

#[async_trait]
impl DeviceDriver for OsiPiDriver {
    fn protocol(&self) -> Protocol {
        Protocol::OsiPi
    }

    fn interval(&self) -> Duration {
        secs_f64(self.config.request_frequency)
    }

    async fn open(&mut self) -> Result<()> {
        self.points = self.client.resolve_all(&self.config.tags).await?;
        Ok(())
    }

    async fn poll(&mut self) -> Result<PollOutcome> {
        self.poll_at(Utc::now()).await
    }

    async fn diagnose(&mut self) -> Result<Value> {
        let points = self.client.resolve_all(&self.config.tags).await?;
        Ok(json!({
            "server": self.client.server(),
            "points": points
                .iter()
                .map(|point| json!({"tag": point.tag, "webId": point.web_id}))
                .collect::<Vec<_>>(),
            "cursor": self.cursor.load()?.map(format_millis),
        }))
    }

    async fn close(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn window(is_offset: bool) -> ReadWindow {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        ReadWindow {
            start,
            end: start + TimeDelta::seconds(60),
            is_offset,
        }
    }

    #[test]
    fn empty_window_at_the_horizon_keeps_the_cursor() {
        assert_eq!(cursor_after(&window(false), 0), None);
    }

    #[test]
    fn read_windows_advance_one_millisecond_past_the_end() {
        let window = window(false);
        assert_eq!(
            cursor_after(&window, 3),
            Some(window.end + TimeDelta::milliseconds(1))
        );
    }

    #[test]
    fn empty_backlog_windows_still_advance() {
        let window = window(true);
        assert_eq!(cursor_after(&window, 0), Some(window.next_cursor()));
    }
}
