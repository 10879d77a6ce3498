//! Time source shared by every component that stamps records or waits.
//!
//! Backed by `es_entity::clock`. An artificial clock only moves when its
//! [`ClockController`] advances it, which makes backoff windows testable
//! without waiting them out.

pub use es_entity::clock::{ArtificialClockConfig, Clock, ClockController, ClockHandle};

use std::time::Duration;

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artificial_clock_only_moves_when_advanced() {
        let (clock, ctrl) = ClockHandle::artificial(ArtificialClockConfig::manual());
        let start = clock.now();
        ctrl.advance(Duration::from_secs(60)).await;
        assert_eq!(clock.now() - start, chrono::Duration::seconds(60));
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(chrono_duration(Duration::MAX), chrono::Duration::weeks(52 * 100));
    }
}
