//! Atomic units of work
//!
//! A [`Unit`] is handed out by [`Store::transact`] while the user's lock is
//! held. Balance changes are applied to an in-memory copy of the user row and
//! every other write is staged into a RocksDB `WriteBatch`; the row and the
//! batch are committed together.

use crate::{
    error::{Error, Result},
    operation_log::OperationRow,
    storage::{
        keys, Sequence, Store, CF_DEPOSITS, CF_EARNINGS, CF_INDICES, CF_INVESTMENTS,
        CF_OPERATIONS, CF_USERS, CF_WITHDRAWALS, IDX_REFERRER_EARNING, IDX_USER_DEPOSIT,
        IDX_USER_WITHDRAWAL,
    },
    types::{
        Amount, DepositId, DepositRequest, Investment, InvestmentId, NewOperation, Operation,
        ReferralEarning, User, WithdrawalId, WithdrawalRequest,
    },
};
use chrono::Utc;
use rocksdb::WriteBatch;
use std::fmt;

/// Staged mutations against one user
pub struct Unit<'a> {
    store: &'a Store,
    user: User,
    batch: WriteBatch,
}

impl fmt::Debug for Unit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("user_id", &self.user.id)
            .field("staged_writes", &self.batch.len())
            .finish()
    }
}

impl<'a> Unit<'a> {
    pub(crate) fn new(store: &'a Store, user: User) -> Self {
        Self {
            store,
            user,
            batch: WriteBatch::default(),
        }
    }

    /// User row as modified so far
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Underlying store, for reads
    pub fn store(&self) -> &'a Store {
        self.store
    }

    /// Allocate an id
    pub fn next_id(&self, sequence: Sequence) -> Result<u64> {
        self.store.next_id(sequence)
    }

    // Balance

    /// Add to balance, returning the new balance
    pub fn credit(&mut self, amount: Amount) -> Result<Amount> {
        if amount.is_negative() {
            return Err(Error::InvalidInput(format!(
                "credit amount must not be negative: {}",
                amount
            )));
        }
        self.user.balance = self
            .user
            .balance
            .checked_add(amount)
            .ok_or_else(|| Error::InvalidInput("balance overflow".to_string()))?;
        Ok(self.user.balance)
    }

    /// Subtract from balance if the available balance covers it
    pub fn debit(&mut self, amount: Amount) -> Result<Amount> {
        if amount.is_negative() {
            return Err(Error::InvalidInput(format!(
                "debit amount must not be negative: {}",
                amount
            )));
        }
        let available = self.user.available();
        if amount > available {
            return Err(Error::InsufficientFunds {
                required: amount,
                available,
            });
        }
        self.user.balance = self.user.balance - amount;
        Ok(self.user.balance)
    }

    /// Hold part of the available balance for a withdrawal
    pub fn reserve(&mut self, amount: Amount) -> Result<()> {
        let available = self.user.available();
        if amount.is_negative() || amount > available {
            return Err(Error::InsufficientFunds {
                required: amount,
                available,
            });
        }
        self.user.reserved = self.user.reserved + amount;
        Ok(())
    }

    /// Return a held amount to the available balance
    pub fn release(&mut self, amount: Amount) -> Result<()> {
        if amount.is_negative() || amount > self.user.reserved {
            return Err(Error::Conflict(format!(
                "cannot release {} with {} reserved",
                amount, self.user.reserved
            )));
        }
        self.user.reserved = self.user.reserved - amount;
        Ok(())
    }

    /// Debit a held amount: balance and reservation shrink together
    pub fn settle_reserved(&mut self, amount: Amount) -> Result<Amount> {
        self.release(amount)?;
        self.user.balance = self.user.balance - amount;
        Ok(self.user.balance)
    }

    /// Overwrite the balance
    pub fn set_balance(&mut self, value: Amount) -> Result<()> {
        if value.is_negative() {
            return Err(Error::InvalidInput(format!(
                "balance must not be negative: {}",
                value
            )));
        }
        if value < self.user.reserved {
            return Err(Error::Conflict(format!(
                "balance {} below reserved amount {}",
                value, self.user.reserved
            )));
        }
        self.user.balance = value;
        Ok(())
    }

    // Records

    fn ensure_owned(&self, entity: &'static str, owner: u64) -> Result<()> {
        if owner != self.user.id {
            return Err(Error::InvalidInput(format!(
                "{} belongs to user {}, not {}",
                entity, owner, self.user.id
            )));
        }
        Ok(())
    }

    /// Open investment of this user
    pub fn investment(&self, investment_id: InvestmentId) -> Result<Option<Investment>> {
        self.store.get_investment(self.user.id, investment_id)
    }

    /// Insert or replace an investment row
    pub fn put_investment(&mut self, investment: &Investment) -> Result<()> {
        self.ensure_owned("investment", investment.user_id)?;
        self.batch.put_cf(
            self.store.cf_handle(CF_INVESTMENTS)?,
            keys::compound(self.user.id, investment.id),
            bincode::serialize(investment)?,
        );
        Ok(())
    }

    /// Remove an investment row
    pub fn delete_investment(&mut self, investment_id: InvestmentId) -> Result<()> {
        self.batch.delete_cf(
            self.store.cf_handle(CF_INVESTMENTS)?,
            keys::compound(self.user.id, investment_id),
        );
        Ok(())
    }

    /// Deposit request of this user
    pub fn deposit(&self, deposit_id: DepositId) -> Result<DepositRequest> {
        let deposit = self.store.get_deposit(deposit_id)?;
        self.ensure_owned("deposit", deposit.user_id)?;
        Ok(deposit)
    }

    /// Insert or replace a deposit request
    pub fn put_deposit(&mut self, deposit: &DepositRequest) -> Result<()> {
        self.ensure_owned("deposit", deposit.user_id)?;
        self.batch.put_cf(
            self.store.cf_handle(CF_DEPOSITS)?,
            deposit.id.to_be_bytes(),
            bincode::serialize(deposit)?,
        );
        self.batch.put_cf(
            self.store.cf_handle(CF_INDICES)?,
            keys::index(IDX_USER_DEPOSIT, self.user.id, deposit.id),
            b"",
        );
        Ok(())
    }

    /// Withdrawal of this user
    pub fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<WithdrawalRequest> {
        let withdrawal = self.store.get_withdrawal(withdrawal_id)?;
        self.ensure_owned("withdrawal", withdrawal.user_id)?;
        Ok(withdrawal)
    }

    /// Insert or replace a withdrawal record
    pub fn put_withdrawal(&mut self, withdrawal: &WithdrawalRequest) -> Result<()> {
        self.ensure_owned("withdrawal", withdrawal.user_id)?;
        self.batch.put_cf(
            self.store.cf_handle(CF_WITHDRAWALS)?,
            withdrawal.id.to_be_bytes(),
            bincode::serialize(withdrawal)?,
        );
        self.batch.put_cf(
            self.store.cf_handle(CF_INDICES)?,
            keys::index(IDX_USER_WITHDRAWAL, self.user.id, withdrawal.id),
            b"",
        );
        Ok(())
    }

    /// Insert a referral earning credited to this user
    pub fn put_earning(&mut self, earning: &ReferralEarning) -> Result<()> {
        self.ensure_owned("referral earning", earning.referrer_id)?;
        self.batch.put_cf(
            self.store.cf_handle(CF_EARNINGS)?,
            earning.id.to_be_bytes(),
            bincode::serialize(earning)?,
        );
        self.batch.put_cf(
            self.store.cf_handle(CF_INDICES)?,
            keys::index(IDX_REFERRER_EARNING, self.user.id, earning.id),
            b"",
        );
        Ok(())
    }

    /// Stage an audit entry for this user
    pub fn record(&mut self, operation: NewOperation) -> Result<Operation> {
        self.ensure_owned("operation", operation.user_id)?;

        let operation = Operation {
            id: self.next_id(Sequence::Operation)?,
            user_id: operation.user_id,
            op_type: operation.op_type,
            amount: operation.amount,
            description: operation.description,
            metadata: operation.metadata,
            created_at: Utc::now(),
        };

        self.batch.put_cf(
            self.store.cf_handle(CF_OPERATIONS)?,
            keys::compound(self.user.id, operation.id),
            OperationRow::encode(&operation)?,
        );

        Ok(operation)
    }

    /// Write the user row and every staged mutation in one batch
    pub(crate) fn commit(self) -> Result<()> {
        let Unit {
            store,
            user,
            mut batch,
        } = self;

        batch.put_cf(
            store.cf_handle(CF_USERS)?,
            user.id.to_be_bytes(),
            bincode::serialize(&user)?,
        );
        let writes = batch.len();
        store.write(batch)?;

        tracing::trace!(user_id = user.id, writes, "Unit committed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{NewUser, OperationType};
    use crate::{Amount, Config, Error, Sequence, Store};
    use chrono::Utc;
    use tempfile::TempDir;

    fn store_with_user(balance: i64) -> (Store, u64, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Store::open(&config).unwrap();
        let user = store
            .create_user(NewUser {
                pub_key: "unit-test".to_string(),
                ..NewUser::default()
            })
            .unwrap();
        store.set_balance(user.id, Amount::from_units(balance)).unwrap();
        (store, user.id, temp_dir)
    }

    #[test]
    fn test_failed_unit_writes_nothing() {
        let (store, user_id, _temp) = store_with_user(100);

        let result: Result<(), Error> = store.transact(user_id, |unit| {
            unit.debit(Amount::from_units(40))?;
            unit.record(crate::NewOperation {
                user_id,
                op_type: OperationType::Withdrawal,
                amount: Amount::from_units(40),
                description: "staged".to_string(),
                metadata: serde_json::json!({}),
            })?;
            Err(Error::Conflict("abort".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(store.get_user(user_id).unwrap().balance, Amount::from_units(100));
        assert_eq!(store.list_operations(user_id, 1, 10).unwrap().total, 0);
    }

    #[test]
    fn test_reserved_funds_cannot_be_debited() {
        let (store, user_id, _temp) = store_with_user(100);

        store
            .transact::<_, Error, _>(user_id, |unit| unit.reserve(Amount::from_units(70)))
            .unwrap();

        let err = store
            .transact::<_, Error, _>(user_id, |unit| unit.debit(Amount::from_units(31)))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let user = store
            .transact::<_, Error, _>(user_id, |unit| {
                unit.settle_reserved(Amount::from_units(70))?;
                Ok(unit.user().clone())
            })
            .unwrap();
        assert_eq!(user.balance, Amount::from_units(30));
        assert_eq!(user.reserved, Amount::ZERO);
    }

    #[test]
    fn test_set_balance_below_reserved_conflicts() {
        let (store, user_id, _temp) = store_with_user(100);
        store
            .transact::<_, Error, _>(user_id, |unit| unit.reserve(Amount::from_units(50)))
            .unwrap();

        let err = store.set_balance(user_id, Amount::from_units(49)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_foreign_records_rejected() {
        let (store, user_id, _temp) = store_with_user(0);

        let err = store
            .transact::<_, Error, _>(user_id, |unit| {
                unit.put_investment(&crate::Investment {
                    id: unit.next_id(Sequence::Investment)?,
                    user_id: user_id + 1,
                    kind: "low".to_string(),
                    principal: Amount::from_units(1),
                    created_at: Utc::now(),
                    yield_settled_at: Utc::now(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
