use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static SCHEDULE_TIME_NS: Cell<u64> = const { Cell::new(0) };
}

pub fn reset_schedule_time() {
    SCHEDULE_TIME_NS.with(|cell| cell.set(0));
}

/// Accumulates time spent building (or looking up) batch plans on this thread.
pub fn add_schedule_time(duration: Duration) {
    let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
    SCHEDULE_TIME_NS.with(|cell| cell.set(cell.get().saturating_add(nanos)));
}

pub fn take_schedule_time() -> Duration {
    SCHEDULE_TIME_NS.with(|cell| Duration::from_nanos(cell.replace(0)))
}
