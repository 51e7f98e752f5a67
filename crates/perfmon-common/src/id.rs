use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, MutexGuard};

static ID_GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

fn lock_generator() -> MutexGuard<'static, Option<SnowflakeIdBucket>> {
    ID_GENERATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initialise the process-wide snowflake generator used for stored row ids.
///
/// `machine_id` and `node_id` must each be in `0..=31`.
pub fn init(machine_id: i32, node_id: i32) {
    *lock_generator() = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Next unique id, as a decimal string.
pub fn next_id() -> String {
    let mut gen = lock_generator();
    let bucket = gen.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1));
    bucket.get_id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn next_id_returns_unique_numeric_ids() {
        init(1, 1);
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = next_id();
            assert!(id.parse::<i64>().is_ok(), "id should be numeric: {id}");
            assert!(ids.insert(id), "Duplicate ID generated");
        }
    }
}
