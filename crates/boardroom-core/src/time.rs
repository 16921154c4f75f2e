/// Milliseconds since the Unix epoch. All session timestamps use this unit.
pub type Millis = u64;

pub const SECOND: Millis = 1_000;
pub const MINUTE: Millis = 60 * SECOND;
pub const HOUR: Millis = 60 * MINUTE;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Millis {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as Millis
}

/// Elapsed milliseconds between `earlier` and `now`, saturating at zero when
/// the clock went backwards.
pub fn elapsed_since(earlier: Millis, now: Millis) -> Millis {
    now.saturating_sub(earlier)
}
