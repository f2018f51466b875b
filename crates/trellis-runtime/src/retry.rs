use std::time::Duration;

use rand::Rng;
use trellis_config::RetryPolicy;

/// Delay before retry number `retry` (1-based).
///
/// `min_timeout * factor^(retry - 1)`, multiplied by a random factor in
/// `[1, 2)` when the policy randomizes, capped at `max_timeout`.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32, rng: &mut impl Rng) -> Duration {
  let exp = retry.max(1).saturating_sub(1) as i32;
  let mut delay = policy.min_timeout_ms as f64 * policy.factor.powi(exp);

  if policy.randomize {
    delay *= rng.gen_range(1.0..2.0);
  }

  let capped = if delay.is_finite() {
    delay.min(policy.max_timeout_ms as f64)
  } else {
    policy.max_timeout_ms as f64
  };
  Duration::from_millis(capped.max(0.0).round() as u64)
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  fn policy() -> RetryPolicy {
    RetryPolicy::standard()
      .with_timeouts(1_000, 10_000)
      .with_randomize(false)
  }

  #[test]
  fn test_exponential_growth() {
    let mut rng = StdRng::seed_from_u64(7);
    let policy = RetryPolicy {
      factor: 2.0,
      ..policy()
    };
    assert_eq!(backoff_delay(&policy, 1, &mut rng), Duration::from_millis(1_000));
    assert_eq!(backoff_delay(&policy, 2, &mut rng), Duration::from_millis(2_000));
    assert_eq!(backoff_delay(&policy, 3, &mut rng), Duration::from_millis(4_000));
  }

  #[test]
  fn test_capped_at_max() {
    let mut rng = StdRng::seed_from_u64(7);
    assert_eq!(backoff_delay(&policy(), 50, &mut rng), Duration::from_millis(10_000));
    assert_eq!(backoff_delay(&policy(), u32::MAX, &mut rng), Duration::from_millis(10_000));
  }

  #[test]
  fn test_randomized_within_bounds() {
    let mut rng = StdRng::seed_from_u64(42);
    let policy = policy().with_randomize(true);
    for _ in 0..100 {
      let delay = backoff_delay(&policy, 1, &mut rng);
      assert!(delay >= Duration::from_millis(1_000));
      assert!(delay <= Duration::from_millis(2_000));
    }
  }
}
