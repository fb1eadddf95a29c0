//! Wait-time estimation from queue depth and counter throughput.
//!
//! Estimates are a lower bound, not a promise: displays must present them
//! as "at least". Every value is a function of the snapshot passed in.

/// Estimated wait in minutes for the ticket at `position`.
///
/// With `open_counters` counters draining the queue in parallel, the ticket
/// waits roughly `ceil(position / counters)` service slots. A branch with no
/// open counter is treated as a single serial counter so the estimate stays
/// finite.
pub fn estimated_wait_mins(position: usize, open_counters: usize, avg_service_mins: u32) -> u32 {
    let counters = open_counters.max(1);
    let slots = position.div_ceil(counters);
    slots as u32 * avg_service_mins
}

/// Minutes until the head of the queue is expected to be called
pub fn next_call_estimate_mins(open_counters: usize, avg_service_mins: u32) -> u32 {
    let counters = open_counters.max(1) as u32;
    avg_service_mins.div_ceil(counters)
}

/// Measured average service time over recent completions.
///
/// Falls back to `manual_avg_mins` with fewer than `min_samples` data points;
/// otherwise the mean of `sample_mins`, clamped to `[clamp_min, clamp_max]`.
pub fn dynamic_service_time_mins(
    sample_mins: &[i64],
    manual_avg_mins: u32,
    min_samples: usize,
    clamp_min: u32,
    clamp_max: u32,
) -> u32 {
    if sample_mins.len() < min_samples {
        return manual_avg_mins;
    }

    let total: i64 = sample_mins.iter().sum();
    let avg = (total as f64 / sample_mins.len() as f64).round() as i64;
    (avg.max(0) as u32).clamp(clamp_min, clamp_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_counters_halve_the_queue() {
        // 5 tickets, 2 counters, 10 min each: position 5 waits ceil(5/2)*10 = 30
        assert_eq!(estimated_wait_mins(5, 2, 10), 30);
    }

    #[test]
    fn single_counter_is_serial() {
        assert_eq!(estimated_wait_mins(4, 1, 10), 40);
    }

    #[test]
    fn zero_counters_fall_back_to_serial() {
        assert_eq!(estimated_wait_mins(3, 0, 10), 30);
    }

    #[test]
    fn head_of_queue_pays_one_slot() {
        assert_eq!(estimated_wait_mins(1, 4, 12), 12);
    }

    #[test]
    fn next_call_divides_by_parallel_capacity() {
        assert_eq!(next_call_estimate_mins(2, 10), 5);
        assert_eq!(next_call_estimate_mins(0, 10), 10);
        assert_eq!(next_call_estimate_mins(3, 10), 4);
    }

    #[test]
    fn dynamic_average_needs_enough_samples() {
        assert_eq!(dynamic_service_time_mins(&[5, 7], 10, 3, 1, 60), 10);
        assert_eq!(dynamic_service_time_mins(&[5, 7, 9], 10, 3, 1, 60), 7);
    }

    #[test]
    fn dynamic_average_is_clamped() {
        assert_eq!(dynamic_service_time_mins(&[90, 95, 100], 10, 3, 1, 60), 60);
        assert_eq!(dynamic_service_time_mins(&[0, 0, 0], 10, 3, 1, 60), 1);
    }
}
