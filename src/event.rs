//! Event data model, schedule-string grammar, and next-trigger arithmetic.
//!
//! An [`Event`] is either `PARSED` (came from the user's schedule string,
//! re-derived wholesale on every successful reload) or `INTERNAL` (created
//! by the supervisor itself — staging flush timeouts, auto power-on
//! companions — and left untouched by a reload).

use std::fmt;

use crate::clock::Clock;
use crate::time::{Today, SECONDS_PER_DAY, SECONDS_PER_HOUR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Daily,
    Interval,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Suspend,
    Resume,
    PowerOff,
    PowerOn,
    ImportStaging,
    ImportStagingTimeout,
    Watchdog,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUSPEND" => Some(Action::Suspend),
            "RESUME" => Some(Action::Resume),
            "POWEROFF" => Some(Action::PowerOff),
            "POWERON" => Some(Action::PowerOn),
            "IMPORTTMPFS" => Some(Action::ImportStaging),
            "IMPORTTMPFSTIMEOUT" => Some(Action::ImportStagingTimeout),
            "WATCHDOG" => Some(Action::Watchdog),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Suspend => "SUSPEND",
            Action::Resume => "RESUME",
            Action::PowerOff => "POWEROFF",
            Action::PowerOn => "POWERON",
            Action::ImportStaging => "IMPORTTMPFS",
            Action::ImportStagingTimeout => "IMPORTTMPFSTIMEOUT",
            Action::Watchdog => "WATCHDOG",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Came from the user-supplied schedule string.
    Parsed,
    /// Created by the supervisor itself.
    Internal,
}

/// A single scheduled occurrence in the event heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Absolute UTC instant, epoch seconds, at which this event next fires.
    pub next_trigger: i64,
    /// For DAILY: seconds since local midnight (0..26h to tolerate DST).
    /// For INTERVAL: the repeat period in seconds (>=1).
    /// For ONCE: the one-shot delay in seconds from creation (>=1).
    pub local_offset: i64,
    pub r#type: EventType,
    pub action: Action,
    pub source: EventSource,
}

impl Event {
    /// Validate the invariants that must hold for any event admitted to the
    /// heap.
    pub fn validate(&self) -> Result<(), String> {
        match self.r#type {
            EventType::Daily => {
                if !(0..26 * 3600).contains(&self.local_offset) {
                    return Err(format!(
                        "DAILY offset {} out of range 0..26h",
                        self.local_offset
                    ));
                }
            }
            EventType::Interval | EventType::Once => {
                if self.local_offset < 1 {
                    return Err(format!(
                        "{:?} offset must be >= 1 second, got {}",
                        self.r#type, self.local_offset
                    ));
                }
            }
        }
        Ok(())
    }

    /// Recompute `next_trigger` for a DAILY/INTERVAL event that just fired,
    /// or compute the first trigger for a freshly parsed event.
    pub fn schedule_next(&mut self, clock: &dyn Clock, apply_dst: bool) {
        self.next_trigger = self.compute_next_trigger(clock, apply_dst);
    }

    fn compute_next_trigger(&self, clock: &dyn Clock, apply_dst: bool) -> i64 {
        match self.r#type {
            EventType::Interval | EventType::Once => clock.now_epoch() + self.local_offset,
            EventType::Daily => {
                let now = clock.now_epoch();
                let today = Today::new(clock, apply_dst);
                let mut candidate = today.local_midnight_utc() + self.local_offset;

                // If today's slot has already passed, move to tomorrow and
                // re-derive the local offset in case a DST transition falls
                // between now and then.
                for _ in 0..3 {
                    if candidate > now {
                        break;
                    }
                    candidate += SECONDS_PER_DAY;
                    let probe = FixedInstantClock(candidate);
                    let reanchored = Today::new(&probe, apply_dst);
                    candidate = reanchored.local_midnight_utc() + self.local_offset;
                }
                candidate
            }
        }
    }
}

/// A throwaway `Clock` pinned to a single instant, used internally to
/// re-derive local-time offsets at a specific future instant when resolving
/// DST transitions across a day boundary.
struct FixedInstantClock(i64);

#[async_trait::async_trait]
impl Clock for FixedInstantClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.0, 0).unwrap_or_else(|| chrono::Utc::now())
    }

    async fn sleep(&self, _duration: std::time::Duration) {}
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.r#type {
            EventType::Daily => "",
            EventType::Interval => "@",
            EventType::Once => "!",
        };
        // HH can exceed 24 for INTERVAL/ONCE, so this deliberately doesn't
        // go through time::hours()/minutes(), which wrap at a day.
        let hh = self.local_offset / SECONDS_PER_HOUR;
        let mm = (self.local_offset % SECONDS_PER_HOUR) / 60;
        write!(f, "{prefix}{hh:02}:{mm:02} {}", self.action)
    }
}

/// One malformed entry from the schedule string, recorded rather than
/// aborting the parse of the remaining entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    pub entry_index: usize,
    pub raw: String,
    pub message: String,
}

impl fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry #{} (\"{}\"): {}",
            self.entry_index, self.raw, self.message
        )
    }
}

/// Result of parsing a schedule string: events that parsed cleanly, plus
/// diagnostics for entries that didn't.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub events: Vec<Event>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

/// Parse the schedule grammar:
///
/// ```text
/// entry    := [prefix] HH ":" MM ws* action
/// prefix   := "" (DAILY) | "@" (INTERVAL) | "!" (ONCE)
/// HH       := decimal; DAILY: 0..23; INTERVAL, ONCE: 0..
/// MM       := decimal 0..59
/// action   := SUSPEND | RESUME | POWEROFF | POWERON
///           | IMPORTTMPFS | IMPORTTMPFSTIMEOUT | WATCHDOG  (case-insensitive)
/// ```
///
/// Entries are separated by `,` or `;`. Blank entries are skipped. Each
/// entry is parsed and validated independently; a malformed entry is
/// recorded in [`ParseOutcome::diagnostics`] without discarding the rest.
pub fn parse_schedule(input: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    for (index, raw_entry) in input.split([',', ';']).enumerate() {
        let trimmed = raw_entry.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_entry(trimmed) {
            Ok(event) => outcome.events.push(event),
            Err(message) => outcome.diagnostics.push(ParseDiagnostic {
                entry_index: index,
                raw: trimmed.to_string(),
                message,
            }),
        }
    }

    outcome
}

fn parse_entry(entry: &str) -> Result<Event, String> {
    let (r#type, rest) = match entry.strip_prefix('@') {
        Some(rest) => (EventType::Interval, rest),
        None => match entry.strip_prefix('!') {
            Some(rest) => (EventType::Once, rest),
            None => (EventType::Daily, entry),
        },
    };

    let colon = rest.find(':').ok_or("missing \":\" between hours and minutes")?;
    let hh_tok = &rest[..colon];
    let after_colon = &rest[colon + 1..];

    if hh_tok.is_empty() || !hh_tok.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("\"{hh_tok}\" is not a valid hour"));
    }
    let hh: i64 = hh_tok
        .parse()
        .map_err(|_| format!("\"{hh_tok}\" is not a valid hour"))?;

    let mm_end = after_colon
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after_colon.len());
    let mm_tok = &after_colon[..mm_end];
    if mm_tok.is_empty() {
        return Err("missing minutes field".to_string());
    }
    let mm: i64 = mm_tok
        .parse()
        .map_err(|_| format!("\"{mm_tok}\" is not a valid minute"))?;

    let action_tok = after_colon[mm_end..].trim_start();
    if action_tok.is_empty() {
        return Err("missing action keyword".to_string());
    }
    let action =
        Action::parse(action_tok).ok_or_else(|| format!("unrecognized action \"{action_tok}\""))?;

    let max_hh = match r#type {
        EventType::Daily => 23,
        EventType::Interval | EventType::Once => i64::MAX,
    };
    if !(0..=max_hh).contains(&hh) {
        return Err(format!("hour {hh} out of range"));
    }
    if !(0..60).contains(&mm) {
        return Err(format!("minute {mm} out of range"));
    }

    let event = Event {
        next_trigger: 0,
        local_offset: hh * 3600 + mm * 60,
        r#type,
        action,
        source: EventSource::Parsed,
    };
    event.validate()?;
    Ok(event)
}

/// Given a freshly parsed list of `RESUME` events and the configured
/// power-control up delay, synthesize the companion `POWERON` events that
/// must fire `up_delay` seconds before each resume so the modem has power
/// by the time the daemon expects it awake.
///
/// Returns the synthesized events plus a list of human-readable warnings for
/// any synthesized `POWERON` that lands on or after a configured
/// `SUSPEND`/`POWEROFF` slot at the same offset (a likely misconfiguration,
/// but not an error).
pub fn synthesize_power_on(events: &[Event], up_delay: i64) -> (Vec<Event>, Vec<String>) {
    let mut synthesized = Vec::new();
    let mut warnings = Vec::new();

    for resume in events.iter().filter(|e| e.action == Action::Resume) {
        let offset = match resume.r#type {
            EventType::Daily => (resume.local_offset - up_delay).rem_euclid(SECONDS_PER_DAY),
            EventType::Interval | EventType::Once => (resume.local_offset - up_delay).max(1),
        };

        let collides = events
            .iter()
            .any(|e| matches!(e.action, Action::Suspend | Action::PowerOff) && e.local_offset == offset);
        if collides {
            warnings.push(format!(
                "synthesized POWERON at offset {offset}s collides with a configured SUSPEND/POWEROFF"
            ));
        }

        synthesized.push(Event {
            next_trigger: 0,
            local_offset: offset,
            r#type: resume.r#type,
            action: Action::PowerOn,
            source: EventSource::Parsed,
        });
    }

    (synthesized, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn parses_daily_entry() {
        let outcome = parse_schedule("23:30 SUSPEND");
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].local_offset, 23 * 3600 + 30 * 60);
        assert_eq!(outcome.events[0].action, Action::Suspend);
    }

    #[test]
    fn parses_interval_prefix() {
        let outcome = parse_schedule("@00:05 WATCHDOG");
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].r#type, EventType::Interval);
        assert_eq!(outcome.events[0].local_offset, 300);
    }

    #[test]
    fn bad_entries_do_not_abort_remaining_parse() {
        let outcome = parse_schedule("23:30 SUSPEND, BOGUS, 99:99 RESUME, @00:01 WATCHDOG");
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.diagnostics.len(), 2);
    }

    #[test]
    fn rejects_out_of_range_daily_hour() {
        let outcome = parse_schedule("24:00 WATCHDOG");
        assert_eq!(outcome.events.len(), 0);
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn synthesizes_power_on_before_resume() {
        let outcome = parse_schedule("07:00 RESUME, 23:00 SUSPEND");
        let (synth, warnings) = synthesize_power_on(&outcome.events, 600);
        assert_eq!(synth.len(), 1);
        assert_eq!(synth[0].action, Action::PowerOn);
        assert_eq!(synth[0].local_offset, 7 * 3600 - 600);
        // Synthesized companions are PARSED, not INTERNAL, so a reload's
        // drain_source(Parsed) sweeps stale companions before resynthesizing.
        assert_eq!(synth[0].source, EventSource::Parsed);
        assert!(warnings.is_empty());
    }

    // S1: parse rejection set.
    #[test]
    fn seed_s1_parse_rejection_set() {
        let input = [
            "", "a:59 RESUME", "-3:00 RESUME", "20€ off now!", "1:on", "2:99 PWRON",
            "12: pwroff", "23:59 ", "04:00 off", "2:2:0", "+12:+10+",
            "16:10 PwrOn16:25 PwrOff",
        ]
        .join(", ");
        let outcome = parse_schedule(&input);
        assert_eq!(outcome.diagnostics.len(), 11);
        assert_eq!(outcome.events.len(), 0);
    }

    // S2: parse acceptance set.
    #[test]
    fn seed_s2_parse_acceptance_set() {
        let input = [
            "03:20 SUSPEND",
            "3:30              poweron",
            "4:5RESUME",
            "@09:30ImportTMPFS",
            "!00:01 ImportTMPFStimeout",
            "!49:59 POWEROFF",
        ]
        .join(", ");
        let outcome = parse_schedule(&input);
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.events.len(), 6);
        let types: Vec<EventType> = outcome.events.iter().map(|e| e.r#type).collect();
        assert_eq!(
            types,
            vec![
                EventType::Daily,
                EventType::Daily,
                EventType::Daily,
                EventType::Interval,
                EventType::Once,
                EventType::Once,
            ]
        );
        let actions: Vec<Action> = outcome.events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                Action::Suspend,
                Action::PowerOn,
                Action::Resume,
                Action::ImportStaging,
                Action::ImportStagingTimeout,
                Action::PowerOff,
            ]
        );
    }

    struct FakeClock(std::sync::atomic::AtomicI64);

    #[async_trait::async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::DateTime::from_timestamp(self.0.load(std::sync::atomic::Ordering::SeqCst), 0)
                .unwrap()
        }

        async fn sleep(&self, _duration: std::time::Duration) {}
    }

    // S3: suspend schedule fires at the same two times on each of two
    // consecutive days as the simulated clock advances minute by minute.
    #[test]
    fn seed_s3_suspend_schedule_fires_each_day() {
        let outcome = parse_schedule("04:10 SUSPEND, 04:55 RESUME");
        assert!(outcome.diagnostics.is_empty());

        let start = 3 * 3600; // commit at local 03:00 on an epoch-aligned day
        let clock = FakeClock(std::sync::atomic::AtomicI64::new(start));

        let mut heap = crate::heap::EventHeap::new();
        for mut event in outcome.events {
            event.schedule_next(&clock, true);
            heap.insert(event);
        }

        let mut firings = 0;
        for minute in 0..(48 * 60) {
            let now = start + minute * 60;
            clock.0.store(now, std::sync::atomic::Ordering::SeqCst);
            while let Some(mut fired) = heap.fetch_if_triggered(now) {
                firings += 1;
                fired.schedule_next(&clock, true);
                heap.insert(fired);
            }
            assert!(!heap.is_empty());
        }
        assert_eq!(firings, 4);
    }

    // S4: auto POWER_ON insertion.
    #[test]
    fn seed_s4_auto_poweron_insertion() {
        let outcome = parse_schedule("05:00 RESUME");
        let (synth, warnings) = synthesize_power_on(&outcome.events, 300);
        assert!(warnings.is_empty());
        assert_eq!(synth.len(), 1);
        assert_eq!(synth[0].action, Action::PowerOn);
        assert_eq!(synth[0].local_offset, 4 * 3600 + 55 * 60);
    }

    #[test]
    fn daily_next_trigger_is_in_the_future() {
        let clock = SystemClock;
        let mut event = Event {
            next_trigger: 0,
            local_offset: 0,
            r#type: EventType::Daily,
            action: Action::Watchdog,
            source: EventSource::Parsed,
        };
        event.schedule_next(&clock, true);
        assert!(event.next_trigger > clock.now_epoch() - 1);
    }
}
