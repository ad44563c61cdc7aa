//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OSI PI read-window planning."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use m2c_common::time::secs_f64;
use m2c_model::OsiPiConfig;

/// One recorded-values query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// The window was capped by `maxRequestDuration`; more backlog remains.
    pub is_offset: bool,
}

const MAX_SPAN_DAYS: i64 = 36_500;

fn delta(seconds: f64) -> TimeDelta {
    let cap = TimeDelta::days(MAX_SPAN_DAYS);
    TimeDelta::from_std(secs_f64(seconds)).map_or(cap, |span| span.min(cap))
}

impl ReadWindow {
    /// Window starting at the persisted cursor, or `requestFrequency` before
    /// the query horizon when there is none. The horizon is `now - queryOffset`.
    /// `None` when the cursor has already reached the horizon.
    pub fn plan(cursor: Option<DateTime<Utc>>, now: DateTime<Utc>, config: &OsiPiConfig) -> Option<Self> {
        let horizon = now - delta(config.query_offset);
        let start = cursor.unwrap_or_else(|| horizon - delta(config.request_frequency));
        if start >= horizon {
            return None;
        }
        let capped = start + delta(config.max_request_duration);
        Some(if capped < horizon {
            Self {
                start,
                end: capped,
                is_offset: true,
            }
        } else {
            Self {
                start,
                end: horizon,
                is_offset: false,
            }
        })
    }

    /// Cursor to persist after this window was read successfully.
    pub fn next_cursor(&self) -> DateTime<Utc> {
        self.end + TimeDelta::milliseconds(1)
    }

    /// Delay before the next query.
    pub fn next_delay(&self, config: &OsiPiConfig) -> Duration {
        if self.is_offset {
            secs_f64(config.catchup_frequency)
        } else {
            secs_f64(config.request_frequency)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use m2c_model::AuthMode;

    fn config() -> OsiPiConfig {
        OsiPiConfig {
            api_url: "https://pi.local/piwebapi".into(),
            server_name: "PISRV".into(),
            verify_ssl: true,
            auth_mode: AuthMode::Kerberos,
            credential_secret_arn: None,
            tags: vec!["Sinusoid".into()],
            request_frequency: 5.0,
            catchup_frequency: 0.1,
            max_request_duration: 60.0,
            query_offset: 2.0,
        }
    }

    #[test]
    fn fresh_start_reads_one_request_period_before_the_horizon() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let window = ReadWindow::plan(None, now, &config()).unwrap();
        assert_eq!(window.end, now - TimeDelta::seconds(2));
        assert_eq!(window.start, now - TimeDelta::seconds(7));
        assert!(!window.is_offset);
        assert_eq!(window.next_delay(&config()), Duration::from_secs(5));
    }

    #[test]
    fn backlog_is_capped_and_uses_catchup_frequency() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let cursor = now - TimeDelta::minutes(10);
        let window = ReadWindow::plan(Some(cursor), now, &config()).unwrap();
        assert_eq!(window.start, cursor);
        assert_eq!(window.end, cursor + TimeDelta::seconds(60));
        assert!(window.is_offset);
        assert_eq!(window.next_delay(&config()), Duration::from_millis(100));
        assert_eq!(window.next_cursor(), window.end + TimeDelta::milliseconds(1));
    }

    #[test]
    fn consecutive_windows_neither_gap_nor_overlap() {
        let config = config();
        let mut now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut cursor = Some(now - TimeDelta::minutes(5));
        let mut previous: Option<ReadWindow> = None;
        for _ in 0..20 {
            now += TimeDelta::seconds(1);
            let Some(window) = ReadWindow::plan(cursor, now, &config) else {
                continue;
            };
            if let Some(previous) = previous {
                assert_eq!(window.start - previous.end, TimeDelta::milliseconds(1));
            }
            cursor = Some(window.next_cursor());
            previous = Some(window);
        }
    }

    #[test]
    fn cursor_at_horizon_plans_nothing() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert!(ReadWindow::plan(Some(now), now, &config()).is_none());
    }
}
