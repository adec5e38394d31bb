//! 优先级老化评分
//!
//! `score = rank × priority_gap - age`，分数越低越先被调度。
//! 等待时间超过 `max_wait` 的任务被强制提升到最高档，按入队时间先后排在所有未提升任务之前。
//!
//! 由于所有任务的年龄随时间同速增长，未提升任务之间的相对顺序与时间无关，
//! 可以用 `rank × gap + created_at` 作为静态排序键，无需周期性重算分数。

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};

use crate::config::QueueConfig;
use crate::models::{QueueEntry, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreFunction {
    priority_gap_ms: i64,
    max_wait_ms: i64,
}

impl ScoreFunction {
    pub fn new(priority_gap: Duration, max_wait: Duration) -> Self {
        Self {
            priority_gap_ms: priority_gap.num_milliseconds().max(1),
            max_wait_ms: max_wait.num_milliseconds().max(0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            Duration::seconds(config.priority_gap_seconds),
            Duration::seconds(config.max_wait_seconds),
        )
    }

    pub fn priority_gap(&self) -> Duration {
        Duration::milliseconds(self.priority_gap_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::milliseconds(self.max_wait_ms)
    }

    /// 当前时刻的分数（秒），年龄不为负
    pub fn score(&self, priority: TaskPriority, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - created_at).num_milliseconds().max(0);
        (priority.rank() * self.priority_gap_ms - age_ms) as f64 / 1000.0
    }

    /// 时间无关的排序键（毫秒），与 `score` 给出相同的相对顺序
    pub fn ordering_key(&self, priority: TaskPriority, created_at: DateTime<Utc>) -> i64 {
        priority.rank() * self.priority_gap_ms + created_at.timestamp_millis()
    }

    /// 入队时间不晚于该时刻的任务已被强制提升
    pub fn promotion_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::milliseconds(self.max_wait_ms)
    }

    pub fn is_promoted(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        created_at <= self.promotion_cutoff(now)
    }

    /// 考虑强制提升后的生效优先级
    pub fn effective_priority(
        &self,
        priority: TaskPriority,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TaskPriority {
        if self.is_promoted(created_at, now) {
            TaskPriority::High
        } else {
            priority
        }
    }

    /// `now` 时刻的生效排序键
    ///
    /// 已提升任务的键为入队时间，必然小于任何未提升任务的键，因此总排在前面。
    pub fn effective_key(
        &self,
        priority: TaskPriority,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> i64 {
        if self.is_promoted(created_at, now) {
            created_at.timestamp_millis()
        } else {
            self.ordering_key(priority, created_at)
        }
    }

    /// 调度顺序：生效排序键，其次入队时间，最后任务ID
    pub fn compare(&self, a: &QueueEntry, b: &QueueEntry, now: DateTime<Utc>) -> Ordering {
        self.effective_key(a.priority, a.created_at, now)
            .cmp(&self.effective_key(b.priority, b.created_at, now))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.task_id.cmp(&b.task_id))
    }

    pub fn sort_entries(&self, entries: &mut [QueueEntry], now: DateTime<Utc>) {
        entries.sort_by(|a, b| self.compare(a, b, now));
    }
}

impl Default for ScoreFunction {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::models::{TaskId, TaskStatus};

    fn scorer() -> ScoreFunction {
        ScoreFunction::new(Duration::seconds(60), Duration::seconds(300))
    }

    fn entry(priority: TaskPriority, created_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            task_id: TaskId::new(),
            priority,
            created_at,
            visible_until: None,
            status: TaskStatus::Queued,
        }
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_fresh_high_beats_fresh_low() {
        let now = epoch();
        let s = scorer();
        assert_eq!(s.score(TaskPriority::High, now, now), 0.0);
        assert_eq!(s.score(TaskPriority::Low, now, now), 120.0);
        assert_eq!(
            s.compare(&entry(TaskPriority::High, now), &entry(TaskPriority::Low, now), now),
            Ordering::Less
        );
    }

    #[test]
    fn test_aged_low_overtakes_fresh_medium() {
        let s = scorer();
        let start = epoch();
        let low = entry(TaskPriority::Low, start);
        let now = start + Duration::seconds(90);
        let medium = entry(TaskPriority::Medium, now);

        // low: 120 - 90 = 30，medium: 60 - 0 = 60
        assert_eq!(s.compare(&low, &medium, now), Ordering::Less);
    }

    #[test]
    fn test_future_created_at_has_zero_age() {
        let s = scorer();
        let now = epoch();
        assert_eq!(
            s.score(TaskPriority::Medium, now + Duration::seconds(5), now),
            60.0
        );
    }

    #[test]
    fn test_promotion_at_max_wait() {
        let s = scorer();
        let start = epoch();
        let low = entry(TaskPriority::Low, start);
        let at_limit = start + Duration::seconds(300);
        let fresh_high = entry(TaskPriority::High, at_limit);

        assert!(!s.is_promoted(start, at_limit - Duration::milliseconds(1)));
        assert!(s.is_promoted(start, at_limit));
        assert_eq!(
            s.effective_priority(TaskPriority::Low, start, at_limit),
            TaskPriority::High
        );
        assert_eq!(s.compare(&low, &fresh_high, at_limit), Ordering::Less);
    }

    #[test]
    fn test_promoted_entries_keep_fifo_order() {
        let s = scorer();
        let start = epoch();
        let older_low = entry(TaskPriority::Low, start);
        let newer_high = entry(TaskPriority::High, start + Duration::seconds(10));
        let now = start + Duration::seconds(1000);
        assert_eq!(s.compare(&older_low, &newer_high, now), Ordering::Less);
    }

    #[test]
    fn test_equal_scores_tie_break_on_created_at() {
        let s = scorer();
        let start = epoch();
        // medium 比 high 早 60 秒入队，两者分数相同
        let medium = entry(TaskPriority::Medium, start);
        let high = entry(TaskPriority::High, start + Duration::seconds(60));
        let now = start + Duration::seconds(61);
        assert_eq!(
            s.score(TaskPriority::Medium, medium.created_at, now),
            s.score(TaskPriority::High, high.created_at, now)
        );
        assert_eq!(s.compare(&medium, &high, now), Ordering::Less);
    }

    proptest! {
        #[test]
        fn prop_ordering_key_matches_score(
            rank_a in 0i64..3,
            rank_b in 0i64..3,
            offset_a in 0i64..200_000,
            offset_b in 0i64..200_000,
            elapsed in 200_000i64..250_000,
        ) {
            let s = ScoreFunction::new(Duration::seconds(60), Duration::seconds(10_000));
            let start = epoch();
            let pa = TaskPriority::from_rank(rank_a).unwrap();
            let pb = TaskPriority::from_rank(rank_b).unwrap();
            let ca = start + Duration::milliseconds(offset_a);
            let cb = start + Duration::milliseconds(offset_b);
            let now = start + Duration::milliseconds(elapsed);

            let by_score = s.score(pa, ca, now).partial_cmp(&s.score(pb, cb, now)).unwrap();
            let by_key = s.ordering_key(pa, ca).cmp(&s.ordering_key(pb, cb));
            prop_assert_eq!(by_score, by_key);
        }

        #[test]
        fn prop_promoted_entries_precede_unpromoted(
            rank_a in 0i64..3,
            rank_b in 0i64..3,
            age_a in 300_000i64..900_000,
            age_b in 0i64..300_000,
        ) {
            let s = scorer();
            let now = epoch();
            let a = entry(TaskPriority::from_rank(rank_a).unwrap(), now - Duration::milliseconds(age_a));
            let b = entry(TaskPriority::from_rank(rank_b).unwrap(), now - Duration::milliseconds(age_b));
            prop_assert_eq!(s.compare(&a, &b, now), Ordering::Less);
        }
    }
}
