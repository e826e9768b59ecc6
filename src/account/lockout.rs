/// Lockout decision for a failed verification: lock once the consecutive
/// failure count has reached the threshold. Callers must pass the
/// post-increment count; the Postgres store evaluates the same predicate
/// inside its atomic UPDATE.
pub fn should_lock(invalid_attempts: i32, threshold: i32) -> bool {
    invalid_attempts >= threshold
}
