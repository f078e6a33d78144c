//! Append-only operation log
//!
//! Operations are keyed `user_id || operation_id`. Ids are allocated while the
//! user's lock is held, so for one user id order matches creation order and a
//! reverse prefix scan yields newest-first pages.

use crate::{
    error::{Error, Result},
    storage::{keys, Sequence, Store, CF_OPERATIONS},
    types::{Amount, NewOperation, Operation, OperationId, OperationPage, OperationType, UserId},
};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, WriteBatch};
use serde::{Deserialize, Serialize};

/// Largest page `list_operations` serves
pub const MAX_PAGE_SIZE: u32 = 100;

/// Stored form of an [`Operation`]; metadata kept as JSON text
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OperationRow {
    id: OperationId,
    user_id: UserId,
    op_type: OperationType,
    amount: Amount,
    description: String,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl OperationRow {
    pub(crate) fn encode(operation: &Operation) -> Result<Vec<u8>> {
        let row = OperationRow {
            id: operation.id,
            user_id: operation.user_id,
            op_type: operation.op_type,
            amount: operation.amount,
            description: operation.description.clone(),
            metadata: serde_json::to_string(&operation.metadata)?,
            created_at: operation.created_at,
        };
        Ok(bincode::serialize(&row)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Operation> {
        let row: OperationRow = bincode::deserialize(bytes)?;
        Ok(Operation {
            id: row.id,
            user_id: row.user_id,
            op_type: row.op_type,
            amount: row.amount,
            description: row.description,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
        })
    }
}

impl Store {
    /// Append an operation outside of a unit of work
    ///
    /// Used when the money movement it describes has already committed.
    pub fn record_operation(&self, operation: NewOperation) -> Result<Operation> {
        let lock = self.user_lock(operation.user_id);
        let _guard = lock.lock();

        let operation = Operation {
            id: self.next_id(Sequence::Operation)?,
            user_id: operation.user_id,
            op_type: operation.op_type,
            amount: operation.amount,
            description: operation.description,
            metadata: operation.metadata,
            created_at: Utc::now(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_OPERATIONS)?,
            keys::compound(operation.user_id, operation.id),
            OperationRow::encode(&operation)?,
        );
        self.write(batch)?;

        tracing::debug!(
            user_id = operation.user_id,
            operation_id = operation.id,
            op_type = %operation.op_type,
            "Operation recorded"
        );

        Ok(operation)
    }

    /// One page of a user's operations, newest first
    ///
    /// `page` is 1-based and `page_size` must be within `1..=100`.
    pub fn list_operations(&self, user_id: UserId, page: u32, page_size: u32) -> Result<OperationPage> {
        if page < 1 {
            return Err(Error::InvalidInput(format!("page must be >= 1, got {}", page)));
        }
        if page_size < 1 || page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "page_size must be within 1..={}, got {}",
                MAX_PAGE_SIZE, page_size
            )));
        }

        let skip = (page as u64 - 1) * page_size as u64;
        let end = skip + page_size as u64;
        let mut total = 0u64;
        let mut operations = Vec::with_capacity(page_size as usize);

        self.scan_prefix(
            CF_OPERATIONS,
            &user_id.to_be_bytes(),
            Direction::Reverse,
            |_, value| {
                if total >= skip && total < end {
                    operations.push(OperationRow::decode(value)?);
                }
                total += 1;
                Ok(true)
            },
        )?;

        Ok(OperationPage {
            operations,
            total,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, NewUser};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Store::open(&config).unwrap(), temp_dir)
    }

    fn deposit_op(user_id: UserId, n: i64) -> NewOperation {
        NewOperation {
            user_id,
            op_type: OperationType::Deposit,
            amount: Amount::from_units(n),
            description: format!("deposit #{}", n),
            metadata: json!({ "n": n }),
        }
    }

    #[test]
    fn test_metadata_survives_storage() {
        let (store, _temp) = test_store();

        let op = store
            .record_operation(NewOperation {
                metadata: json!({ "tx_hash": "abc", "nested": { "level": 2 } }),
                ..deposit_op(1, 5)
            })
            .unwrap();

        let page = store.list_operations(1, 1, 10).unwrap();
        assert_eq!(page.operations, vec![op]);
        assert_eq!(page.operations[0].metadata["nested"]["level"], 2);
    }

    #[test]
    fn test_pagination_newest_first() {
        let (store, _temp) = test_store();
        let user = store
            .create_user(NewUser {
                pub_key: "pager".to_string(),
                ..NewUser::default()
            })
            .unwrap();

        for n in 1..=25 {
            store.record_operation(deposit_op(user.id, n)).unwrap();
        }

        let page = store.list_operations(user.id, 2, 10).unwrap();
        assert_eq!(page.total, 25);
        let amounts: Vec<i64> = page
            .operations
            .iter()
            .map(|op| op.amount.nanos() / 1_000_000_000)
            .collect();
        assert_eq!(amounts, (6..=15).rev().collect::<Vec<_>>());

        let last = store.list_operations(user.id, 3, 10).unwrap();
        assert_eq!(last.operations.len(), 5);

        let beyond = store.list_operations(user.id, 4, 10).unwrap();
        assert!(beyond.operations.is_empty());
        assert_eq!(beyond.total, 25);
    }

    #[test]
    fn test_users_do_not_share_history() {
        let (store, _temp) = test_store();

        store.record_operation(deposit_op(1, 1)).unwrap();
        store.record_operation(deposit_op(2, 2)).unwrap();
        store.record_operation(deposit_op(1, 3)).unwrap();

        assert_eq!(store.list_operations(1, 1, 10).unwrap().total, 2);
        assert_eq!(store.list_operations(2, 1, 10).unwrap().total, 1);
        assert_eq!(store.list_operations(3, 1, 10).unwrap().total, 0);
    }

    #[test]
    fn test_page_bounds() {
        let (store, _temp) = test_store();

        assert!(matches!(
            store.list_operations(1, 0, 10),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.list_operations(1, 1, 0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.list_operations(1, 1, 101),
            Err(Error::InvalidInput(_))
        ));
        assert!(store.list_operations(1, 1, 100).is_ok());
    }
}
