//! Time-sortable unique ids.

use std::sync::Mutex;

use uuid::Uuid;

/// Last id handed out by this process, as a raw 128-bit value.
static LAST_ID: Mutex<u128> = Mutex::new(0);

/// Generate a new unique, time-sortable identifier.
///
/// Ids are UUIDv7 values: a 48-bit millisecond timestamp followed by random
/// bits, rendered as lowercase hyphenated hex so string order matches
/// creation order. Within one process ids are strictly increasing even when
/// the clock stalls or steps back.
pub fn new_unique_id() -> String {
    next_uuid().to_string()
}

fn next_uuid() -> Uuid {
    let candidate = Uuid::now_v7().as_u128();
    let mut last = LAST_ID.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let next = if candidate > *last {
        candidate
    } else {
        // Same millisecond (or clock went backwards): bump the random tail.
        *last + 1
    };
    *last = next;

    Uuid::from_u128(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let ids: Vec<String> = (0..1000).map(|_| new_unique_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_ids_are_uuid_v7() {
        let id = new_unique_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| new_unique_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
