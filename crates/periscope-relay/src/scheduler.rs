//! One-shot schedule store.
//!
//! Entries are armed with either a wall-clock time (`HH:MM`, next
//! occurrence) or a relative offset (`30s`, `5m`, `2h`). Due entries fire
//! in `(fire_at, insertion)` order so two entries armed for the same
//! instant fire in the order they were created.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use periscope_proto::Command;
use periscope_types::{RelayError, UserId};

/// Lifecycle of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Armed,
    Fired,
    Cancelled,
}

/// A command armed to fire once at a fixed instant.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub user: UserId,
    pub fire_at: DateTime<Utc>,
    pub command: Command,
    pub status: ScheduleStatus,
    #[serde(skip)]
    seq: u64,
}

/// Parse a fire time: absolute `HH:MM` (next occurrence, UTC) or a
/// relative offset with an `s`/`m`/`h` suffix.
pub fn parse_fire_time(spec: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, RelayError> {
    let spec = spec.trim();
    if let Ok(time) = NaiveTime::parse_from_str(spec, "%H:%M") {
        let today = now.date_naive().and_time(time).and_utc();
        return Ok(if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        });
    }
    let bad = || RelayError::Validation(format!("bad schedule time: {spec:?} (want HH:MM or <n>s/m/h)"));
    let unit = spec.chars().last().ok_or_else(bad)?;
    let digits = &spec[..spec.len() - unit.len_utf8()];
    let amount: i64 = digits.parse().map_err(|_| bad())?;
    if amount <= 0 {
        return Err(RelayError::Validation(
            "schedule offset must be positive".into(),
        ));
    }
    let offset = match unit {
        's' => ChronoDuration::seconds(amount),
        'm' => ChronoDuration::minutes(amount),
        'h' => ChronoDuration::hours(amount),
        _ => return Err(bad()),
    };
    Ok(now + offset)
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<Uuid, ScheduleEntry>,
    // Min-heap on (fire_at, seq); seq breaks ties in insertion order.
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, Uuid)>>,
    next_seq: u64,
}

/// In-memory schedule store shared by the router and the firing loop.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Arm a command to fire at `fire_at`. Returns the new entry.
    pub fn add(&self, user: UserId, fire_at: DateTime<Utc>, command: Command) -> ScheduleEntry {
        let mut state = self.state.lock().expect("scheduler lock");
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            user,
            fire_at,
            command,
            status: ScheduleStatus::Armed,
            seq,
        };
        state.queue.push(Reverse((fire_at, seq, entry.id)));
        state.entries.insert(entry.id, entry.clone());
        debug!(id = %entry.id, fire_at = %fire_at, command = entry.command.name(), "schedule armed");
        entry
    }

    /// Cancel an armed entry belonging to `user`.
    ///
    /// Fails if the id is unknown, owned by another user, or already past
    /// the armed state.
    pub fn cancel(&self, user: &UserId, id: Uuid) -> Result<(), RelayError> {
        let mut state = self.state.lock().expect("scheduler lock");
        let entry = state
            .entries
            .get_mut(&id)
            .filter(|e| &e.user == user)
            .ok_or_else(|| RelayError::Validation(format!("no schedule entry {id}")))?;
        if entry.status != ScheduleStatus::Armed {
            return Err(RelayError::Validation(format!(
                "schedule entry {id} is not armed"
            )));
        }
        entry.status = ScheduleStatus::Cancelled;
        Ok(())
    }

    /// Armed entries for `user`, soonest first.
    pub fn list(&self, user: &UserId) -> Vec<ScheduleEntry> {
        let state = self.state.lock().expect("scheduler lock");
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| &e.user == user && e.status == ScheduleStatus::Armed)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.fire_at, e.seq));
        entries
    }

    /// Armed entry count for `user`.
    pub fn armed_count(&self, user: &UserId) -> usize {
        let state = self.state.lock().expect("scheduler lock");
        state
            .entries
            .values()
            .filter(|e| &e.user == user && e.status == ScheduleStatus::Armed)
            .count()
    }

    /// Drain every entry due at `now`, marking each fired. Fired and
    /// cancelled entries leave the store; only armed entries remain.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let mut state = self.state.lock().expect("scheduler lock");
        let mut fired = Vec::new();
        while let Some(Reverse((fire_at, _, id))) = state.queue.peek().copied() {
            if fire_at > now {
                break;
            }
            state.queue.pop();
            let Some(mut entry) = state.entries.remove(&id) else {
                continue;
            };
            if entry.status == ScheduleStatus::Armed {
                entry.status = ScheduleStatus::Fired;
                fired.push(entry);
            }
        }
        fired
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn relative_offsets_parse() {
        let base = now();
        assert_eq!(
            parse_fire_time("30s", base).unwrap(),
            base + ChronoDuration::seconds(30)
        );
        assert_eq!(
            parse_fire_time("5m", base).unwrap(),
            base + ChronoDuration::minutes(5)
        );
        assert_eq!(
            parse_fire_time("2h", base).unwrap(),
            base + ChronoDuration::hours(2)
        );
    }

    #[test]
    fn wall_clock_rolls_to_tomorrow_when_past() {
        let base = now();
        let later = parse_fire_time("14:30", base).unwrap();
        assert_eq!(later, Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 0).unwrap());

        let earlier = parse_fire_time("09:00", base).unwrap();
        assert_eq!(earlier, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn garbage_times_are_rejected() {
        let base = now();
        for bad in ["", "later", "12:99", "5x", "-5m", "0s", "m"] {
            assert!(parse_fire_time(bad, base).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn due_fires_in_time_then_insertion_order() {
        let scheduler = Scheduler::new();
        let user = UserId::new("u1");
        let base = now();

        let b = scheduler.add(user.clone(), base + ChronoDuration::seconds(10), Command::Diff);
        let a = scheduler.add(user.clone(), base + ChronoDuration::seconds(5), Command::Screenshot);
        let c = scheduler.add(user.clone(), base + ChronoDuration::seconds(10), Command::Status);

        assert!(scheduler.due(base).is_empty());
        let fired = scheduler.due(base + ChronoDuration::seconds(10));
        let ids: Vec<_> = fired.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(scheduler.armed_count(&user), 0);
    }

    #[test]
    fn cancelled_entries_do_not_fire() {
        let scheduler = Scheduler::new();
        let user = UserId::new("u1");
        let base = now();

        let entry = scheduler.add(user.clone(), base + ChronoDuration::seconds(1), Command::Diff);
        scheduler.cancel(&user, entry.id).unwrap();
        assert!(scheduler.due(base + ChronoDuration::seconds(5)).is_empty());

        // Cancelling twice, or a foreign entry, fails.
        assert!(scheduler.cancel(&user, entry.id).is_err());
        let other = scheduler.add(UserId::new("u2"), base, Command::Diff);
        assert!(scheduler.cancel(&user, other.id).is_err());
    }

    #[test]
    fn fired_entries_leave_the_store() {
        let scheduler = Scheduler::new();
        let user = UserId::new("u1");
        let base = now();

        let entry = scheduler.add(user.clone(), base + ChronoDuration::seconds(1), Command::Diff);
        let fired = scheduler.due(base + ChronoDuration::seconds(1));
        assert_eq!(fired.len(), 1);

        // The entry is gone: cancelling reports it unknown, not "not armed".
        let err = scheduler.cancel(&user, entry.id).unwrap_err();
        assert!(err.to_string().contains("no schedule entry"));
        assert!(scheduler.list(&user).is_empty());
        assert_eq!(scheduler.armed_count(&user), 0);
    }

    #[test]
    fn list_shows_only_armed_entries_soonest_first() {
        let scheduler = Scheduler::new();
        let user = UserId::new("u1");
        let base = now();

        let far = scheduler.add(user.clone(), base + ChronoDuration::hours(1), Command::Diff);
        let near = scheduler.add(user.clone(), base + ChronoDuration::minutes(1), Command::Status);
        let gone = scheduler.add(user.clone(), base + ChronoDuration::minutes(2), Command::Diff);
        scheduler.cancel(&user, gone.id).unwrap();

        let ids: Vec<_> = scheduler.list(&user).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
    }
}
