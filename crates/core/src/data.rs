//! Opaque key-value payloads carried by sagas and dead-letter entries.
//!
//! The coordination core never looks inside these maps; it only stores,
//! snapshots and merges them.

use serde_json::{Map, Value};

/// Caller-defined structured context (saga data, entry metadata).
pub type DataMap = Map<String, Value>;

/// Merge `update` into `target`, last write wins per top-level key.
///
/// Nested objects are replaced, not deep-merged.
pub fn merge_data(target: &mut DataMap, update: DataMap) {
    for (key, value) in update {
        target.insert(key, value);
    }
}

/// Convert an arbitrary JSON value into a `DataMap`.
///
/// Objects are taken as-is, `null` becomes an empty map, anything else is
/// stored under a single `"value"` key.
pub fn into_data_map(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        Value::Null => DataMap::new(),
        other => {
            let mut map = DataMap::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn merge_is_last_write_wins_per_key() {
        let mut data = into_data_map(json!({"symbol": "AAPL", "qty": 100}));
        merge_data(&mut data, into_data_map(json!({"qty": 50, "order_id": "o-1"})));

        assert_eq!(data["symbol"], json!("AAPL"));
        assert_eq!(data["qty"], json!(50));
        assert_eq!(data["order_id"], json!("o-1"));
    }

    #[test]
    fn non_objects_are_wrapped() {
        assert!(into_data_map(Value::Null).is_empty());
        assert_eq!(into_data_map(json!(42))["value"], json!(42));
    }

    proptest! {
        /// Re-applying the same update never changes the result further.
        #[test]
        fn merging_twice_is_idempotent(
            base in prop::collection::btree_map("[a-d]", 0i64..10, 0..4),
            update in prop::collection::btree_map("[a-d]", 0i64..10, 0..4),
        ) {
            let to_map = |m: &std::collections::BTreeMap<String, i64>| {
                m.iter().map(|(k, v)| (k.clone(), json!(v))).collect::<DataMap>()
            };

            let mut once = to_map(&base);
            merge_data(&mut once, to_map(&update));
            let mut twice = once.clone();
            merge_data(&mut twice, to_map(&update));

            prop_assert_eq!(once, twice);
        }
    }
}
