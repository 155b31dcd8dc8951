use chrono::NaiveDateTime;
use serde_json::{Map, Value};

use crate::utils::parse_timestamp;

/// A fetched block split the way it is handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPayload {
    /// Everything but `transactions` and `transaction_ids`.
    pub header: Value,
    pub transactions: Vec<Value>,
    pub transaction_ids: Vec<String>,
    pub timestamp: NaiveDateTime,
}

impl BlockPayload {
    /// Splits `block`, or returns `None` when it lacks either transaction array.
    pub fn parse(block: Value) -> Option<Self> {
        let Value::Object(mut header) = block else {
            return None;
        };
        let transactions = take_array(&mut header, "transactions")?;
        let transaction_ids = take_array(&mut header, "transaction_ids")?
            .into_iter()
            .map(|id| match id {
                Value::String(id) => id,
                other => other.to_string(),
            })
            .collect();
        let timestamp = header
            .get("timestamp")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .unwrap_or_default();

        Some(Self {
            header: Value::Object(header),
            transactions,
            transaction_ids,
            timestamp,
        })
    }
}

/// Removes `operations` from a transaction, an absent or non-array field counting as empty.
pub fn take_operations(transaction: &mut Value) -> Vec<Value> {
    match transaction
        .as_object_mut()
        .and_then(|transaction| transaction.remove("operations"))
    {
        Some(Value::Array(operations)) => operations,
        _ => Vec::new(),
    }
}

fn take_array(object: &mut Map<String, Value>, key: &str) -> Option<Vec<Value>> {
    match object.remove(key)? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::mock::MockChain;

    #[test]
    fn test_parse_splits_block() {
        let payload = BlockPayload::parse(MockChain::block(12)).unwrap();

        assert_eq!(payload.transactions.len(), 1);
        assert_eq!(payload.transaction_ids, vec![format!("{:040x}", 12)]);
        assert_eq!(payload.timestamp, parse_timestamp(&MockChain::timestamp(12)));
        assert!(payload.header.get("transactions").is_none());
        assert!(payload.header.get("transaction_ids").is_none());
        assert_eq!(payload.header["witness"], json!("mock-witness"));
    }

    #[test]
    fn test_missing_arrays_are_malformed() {
        assert!(BlockPayload::parse(json!({"timestamp": "2024-01-01T00:00:00"})).is_none());
        assert!(BlockPayload::parse(json!({"transactions": [], "transaction_ids": 3})).is_none());
        assert!(BlockPayload::parse(json!("block")).is_none());
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_epoch() {
        let payload = BlockPayload::parse(json!({
            "timestamp": "soon",
            "transactions": [],
            "transaction_ids": [],
        }))
        .unwrap();
        assert_eq!(payload.timestamp, NaiveDateTime::default());
    }

    #[test]
    fn test_take_operations() {
        let mut transaction = json!({"ref_block_num": 1, "operations": [{"type": "vote_operation"}]});
        assert_eq!(take_operations(&mut transaction).len(), 1);
        assert_eq!(transaction, json!({"ref_block_num": 1}));
        assert!(take_operations(&mut json!({})).is_empty());
    }
}
