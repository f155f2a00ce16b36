//! Build context: categorized log messages and per-stage timers.
//!
//! Every pipeline stage takes a `&mut BuildContext` to record how long it ran
//! and to leave categorized diagnostics behind. The context never influences
//! the build output.

use std::collections::HashMap;
use std::time::Duration;
use web_time::Instant;

/// Severity of a context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

/// One pipeline stage, used as the timer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageTimer {
    Total,
    Rasterize,
    Filter,
    Compact,
    Erode,
    MarkAreas,
    DistanceField,
    Regions,
    Contours,
    PolyMesh,
    DetailMesh,
}

/// A recorded diagnostic message.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Stage or subsystem that emitted the message.
    pub category: &'static str,
}

#[derive(Debug, Clone, Copy, Default)]
struct TimerSlot {
    accumulated: Duration,
    count: usize,
}

/// Collects timing samples and categorized log messages for one build.
#[derive(Debug, Default)]
pub struct BuildContext {
    logs: Vec<LogEntry>,
    running: HashMap<StageTimer, Instant>,
    timers: HashMap<StageTimer, TimerSlot>,
    min_level: LogLevel,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops messages below `level` from this point on.
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    pub fn log(&mut self, level: LogLevel, category: &'static str, message: impl Into<String>) {
        if level >= self.min_level {
            self.logs.push(LogEntry {
                level,
                message: message.into(),
                category,
            });
        }
    }

    pub fn info(&mut self, category: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Info, category, message);
    }

    pub fn warn(&mut self, category: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Warning, category, message);
    }

    pub fn error(&mut self, category: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn logs_for<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.logs.iter().filter(move |e| e.category == category)
    }

    pub fn start_timer(&mut self, stage: StageTimer) {
        self.running.insert(stage, Instant::now());
    }

    pub fn stop_timer(&mut self, stage: StageTimer) {
        if let Some(start) = self.running.remove(&stage) {
            let slot = self.timers.entry(stage).or_default();
            slot.accumulated += start.elapsed();
            slot.count += 1;
        }
    }

    /// Accumulated duration for a stage, if it ran.
    pub fn timer(&self, stage: StageTimer) -> Option<Duration> {
        self.timers.get(&stage).map(|s| s.accumulated)
    }

    /// How many times a stage timer was closed.
    pub fn timer_count(&self, stage: StageTimer) -> usize {
        self.timers.get(&stage).map(|s| s.count).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.logs.clear();
        self.running.clear();
        self.timers.clear();
    }

    /// Sorted `(stage, duration)` pairs for reporting, longest first.
    pub fn timer_summary(&self) -> Vec<(StageTimer, Duration)> {
        let mut out: Vec<_> = self
            .timers
            .iter()
            .map(|(stage, slot)| (*stage, slot.accumulated))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }
}

/// Scoped timer: starts a stage timer on creation, stops it on `finish`.
pub struct ScopedTimer {
    stage: StageTimer,
}

impl ScopedTimer {
    pub fn start(ctx: &mut BuildContext, stage: StageTimer) -> Self {
        ctx.start_timer(stage);
        Self { stage }
    }

    pub fn finish(self, ctx: &mut BuildContext) {
        ctx.stop_timer(self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn messages_are_filtered_by_level() {
        let mut ctx = BuildContext::new();
        ctx.set_min_level(LogLevel::Warning);
        ctx.info("rasterize", "dropped");
        ctx.warn("rasterize", "kept");
        ctx.error("compact", "kept too");
        assert_eq!(ctx.logs().len(), 2);
        assert_eq!(ctx.logs_for("rasterize").count(), 1);
    }

    #[test]
    fn timers_accumulate_across_runs() {
        let mut ctx = BuildContext::new();
        for _ in 0..2 {
            ctx.start_timer(StageTimer::Regions);
            thread::sleep(Duration::from_millis(2));
            ctx.stop_timer(StageTimer::Regions);
        }
        assert_eq!(ctx.timer_count(StageTimer::Regions), 2);
        assert!(ctx.timer(StageTimer::Regions).unwrap() >= Duration::from_millis(4));
    }

    #[test]
    fn stopping_an_unstarted_timer_is_harmless() {
        let mut ctx = BuildContext::new();
        ctx.stop_timer(StageTimer::Total);
        assert_eq!(ctx.timer_count(StageTimer::Total), 0);
    }
}
