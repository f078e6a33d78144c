//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `users` - User rows (key: user_id)
//! - `pubkeys` - Public key index (key: pub_key, value: user_id)
//! - `investments` - Open positions (key: user_id || investment_id)
//! - `deposits` - Deposit requests (key: deposit_id)
//! - `withdrawals` - Withdrawal records (key: withdrawal_id)
//! - `earnings` - Referral earnings (key: earning_id)
//! - `operations` - Audit log (key: user_id || operation_id)
//! - `indices` - Secondary indices (key: tag || owner_id || id)
//! - `meta` - Id sequences
//!
//! All integer key parts are big-endian so lexicographic order is numeric order.

use crate::{
    error::{Error, Result},
    types::{
        Amount, DepositId, DepositRequest, Investment, InvestmentId, NewUser, ReferralEarning,
        User, UserId, WithdrawalId, WithdrawalRequest,
    },
    unit::Unit,
    Config,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Column family names
pub(crate) const CF_USERS: &str = "users";
pub(crate) const CF_PUBKEYS: &str = "pubkeys";
pub(crate) const CF_INVESTMENTS: &str = "investments";
pub(crate) const CF_DEPOSITS: &str = "deposits";
pub(crate) const CF_WITHDRAWALS: &str = "withdrawals";
pub(crate) const CF_EARNINGS: &str = "earnings";
pub(crate) const CF_OPERATIONS: &str = "operations";
pub(crate) const CF_INDICES: &str = "indices";
pub(crate) const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_USERS,
    CF_PUBKEYS,
    CF_INVESTMENTS,
    CF_DEPOSITS,
    CF_WITHDRAWALS,
    CF_EARNINGS,
    CF_OPERATIONS,
    CF_INDICES,
    CF_META,
];

/// Index tags in the `indices` column family
pub(crate) const IDX_USER_DEPOSIT: u8 = b'd';
pub(crate) const IDX_USER_WITHDRAWAL: u8 = b'w';
pub(crate) const IDX_REFERRER_EARNING: u8 = b'e';
pub(crate) const IDX_REFERRER_CHILD: u8 = b'r';

/// Random user ids are drawn from this range
const USER_ID_RANGE: std::ops::Range<u64> = 1_000_000_000..1_000_000_000_000;

/// Ids reserved per persisted high-water mark write
pub(crate) const SEQUENCE_BLOCK: u64 = 1_000;

/// Monotonic id sequences kept in the `meta` column family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// Investment ids
    Investment,
    /// Deposit request ids
    Deposit,
    /// Withdrawal ids
    Withdrawal,
    /// Referral earning ids
    Earning,
    /// Operation ids
    Operation,
}

impl Sequence {
    const ALL: [Sequence; 5] = [
        Sequence::Investment,
        Sequence::Deposit,
        Sequence::Withdrawal,
        Sequence::Earning,
        Sequence::Operation,
    ];

    fn index(&self) -> usize {
        *self as usize
    }

    fn key(&self) -> &'static [u8] {
        match self {
            Sequence::Investment => b"seq:investment",
            Sequence::Deposit => b"seq:deposit",
            Sequence::Withdrawal => b"seq:withdrawal",
            Sequence::Earning => b"seq:earning",
            Sequence::Operation => b"seq:operation",
        }
    }
}

/// Key encoding helpers
pub(crate) mod keys {
    pub(crate) fn compound(owner: u64, id: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&owner.to_be_bytes());
        key[8..].copy_from_slice(&id.to_be_bytes());
        key
    }

    pub(crate) fn index(tag: u8, owner: u64, id: u64) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0] = tag;
        key[1..9].copy_from_slice(&owner.to_be_bytes());
        key[9..].copy_from_slice(&id.to_be_bytes());
        key
    }

    pub(crate) fn index_prefix(tag: u8, owner: u64) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = tag;
        key[1..].copy_from_slice(&owner.to_be_bytes());
        key
    }

    /// Trailing 8 bytes of a key as a big-endian id
    pub(crate) fn trailing_id(key: &[u8]) -> Option<u64> {
        let start = key.len().checked_sub(8)?;
        let bytes: [u8; 8] = key[start..].try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

/// In-memory slice of a sequence: `next..=limit` is free to hand out
#[derive(Debug)]
struct SequenceBlock {
    next: u64,
    limit: u64,
}

/// Durable, transactional ledger store
pub struct Store {
    db: DB,
    config: Config,
    /// Per-user serialization; one mutex per user id
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    /// Id blocks, one per sequence
    sequences: [Mutex<SequenceBlock>; 5],
    /// Serializes registration so public keys stay unique
    registration: Mutex<()>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.config.data_dir)
            .field("locked_users", &self.locks.len())
            .finish()
    }
}

impl Store {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        // Resume above the persisted high-water marks; ids of a block that was
        // never used up before shutdown are skipped
        let mut marks = [0u64; 5];
        {
            let cf_meta = db
                .cf_handle(CF_META)
                .ok_or_else(|| Error::Storage(format!("Column family {} not found", CF_META)))?;
            for sequence in Sequence::ALL {
                if let Some(bytes) = db.get_cf(cf_meta, sequence.key())? {
                    marks[sequence.index()] = keys::trailing_id(&bytes).ok_or_else(|| {
                        Error::Storage(format!("corrupt sequence {:?}", sequence))
                    })?;
                }
            }
        }
        let sequences = marks.map(|mark| {
            Mutex::new(SequenceBlock {
                next: mark + 1,
                limit: mark,
            })
        });

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened ledger store"
        );

        Ok(Self {
            db,
            config: config.clone(),
            locks: DashMap::new(),
            sequences,
            registration: Mutex::new(()),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Point lookups dominate, bloom filters help
            CF_USERS | CF_PUBKEYS | CF_INDICES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            CF_OPERATIONS | CF_EARNINGS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    /// Store configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Low-level helpers

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.rocksdb.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    pub(crate) fn get_row<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Visit every key/value under `prefix`, in ascending or descending key order
    pub(crate) fn scan_prefix<F>(
        &self,
        cf: &str,
        prefix: &[u8],
        direction: Direction,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let cf = self.cf_handle(cf)?;

        // Reverse scans seek to the largest key sharing the prefix
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xFF; 8]);
        let start = match direction {
            Direction::Forward => prefix,
            Direction::Reverse => upper.as_slice(),
        };

        for item in self.db.iterator_cf(cf, IteratorMode::From(start, direction)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }

        Ok(())
    }

    pub(crate) fn scan_rows<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        self.scan_prefix(cf, prefix, Direction::Forward, |_, value| {
            rows.push(bincode::deserialize(value)?);
            Ok(true)
        })?;
        Ok(rows)
    }

    pub(crate) fn index_ids(&self, tag: u8, owner: u64) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        self.scan_prefix(
            CF_INDICES,
            &keys::index_prefix(tag, owner),
            Direction::Forward,
            |key, _| {
                if let Some(id) = keys::trailing_id(key) {
                    ids.push(id);
                }
                Ok(true)
            },
        )?;
        Ok(ids)
    }

    /// Allocate the next id of a sequence
    ///
    /// Ids come from an in-memory block; only reserving a new block of
    /// [`SEQUENCE_BLOCK`] ids writes the high-water mark. Ids abandoned by a
    /// failed unit or a restart leave gaps but are never reused.
    pub fn next_id(&self, sequence: Sequence) -> Result<u64> {
        let mut block = self.sequences[sequence.index()].lock();

        if block.next > block.limit {
            let limit = block.limit + SEQUENCE_BLOCK;
            let mut batch = WriteBatch::default();
            batch.put_cf(self.cf_handle(CF_META)?, sequence.key(), limit.to_be_bytes());
            self.write(batch)?;
            block.limit = limit;
            tracing::debug!(?sequence, limit, "Reserved id block");
        }

        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    pub(crate) fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    // Units of work

    /// Run `work` as one atomic unit against `user_id`
    ///
    /// The user's lock is held for the duration of `work` and the commit. All
    /// writes staged on the unit land in a single batch, or none do if `work`
    /// returns an error. Never call this from inside another unit for the same
    /// user.
    pub fn transact<T, E, F>(&self, user_id: UserId, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Unit<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let user = self.get_user(user_id)?;
        let mut unit = Unit::new(self, user);
        let value = work(&mut unit)?;
        unit.commit()?;

        Ok(value)
    }

    // Users

    /// Create a user, or return the existing one registered under the same key
    pub fn create_user(&self, new_user: NewUser) -> Result<User> {
        let pub_key = new_user.pub_key.trim();
        if pub_key.is_empty() {
            return Err(Error::InvalidInput("public key must not be empty".to_string()));
        }

        let _guard = self.registration.lock();

        if let Some(existing) = self.find_user_by_key(pub_key)? {
            tracing::debug!(user_id = existing.id, "Public key already registered");
            return Ok(existing);
        }

        let id = match new_user.id {
            Some(id) => {
                if self.find_user(id)?.is_some() {
                    return Err(Error::AlreadyExists(format!("user {}", id)));
                }
                id
            }
            None => self.allocate_user_id()?,
        };

        if let Some(referrer_id) = new_user.referrer_id {
            self.check_referrer(id, referrer_id)?;
        }

        let user = User {
            id,
            pub_key: pub_key.to_string(),
            balance: Amount::ZERO,
            reserved: Amount::ZERO,
            referrer_id: new_user.referrer_id,
            created_at: Utc::now(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_USERS)?,
            id.to_be_bytes(),
            bincode::serialize(&user)?,
        );
        batch.put_cf(self.cf_handle(CF_PUBKEYS)?, pub_key.as_bytes(), id.to_be_bytes());
        if let Some(referrer_id) = user.referrer_id {
            batch.put_cf(
                self.cf_handle(CF_INDICES)?,
                keys::index(IDX_REFERRER_CHILD, referrer_id, id),
                b"",
            );
        }
        self.write(batch)?;

        tracing::info!(user_id = id, referrer_id = ?user.referrer_id, "User created");

        Ok(user)
    }

    fn allocate_user_id(&self) -> Result<UserId> {
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let candidate = rng.gen_range(USER_ID_RANGE);
            if self.find_user(candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(Error::Conflict("could not allocate a free user id".to_string()))
    }

    /// Reject a referrer whose upward chain already contains `user_id`
    fn check_referrer(&self, user_id: UserId, referrer_id: UserId) -> Result<()> {
        let cycle = || Error::ReferralCycle {
            user_id,
            referrer_id,
        };

        if referrer_id == user_id {
            return Err(cycle());
        }

        let referrer = self
            .find_user(referrer_id)?
            .ok_or_else(|| Error::not_found("referrer", referrer_id))?;

        let mut seen = HashSet::from([referrer.id]);
        let mut next = referrer.referrer_id;
        while let Some(ancestor_id) = next {
            if ancestor_id == user_id {
                return Err(cycle());
            }
            if !seen.insert(ancestor_id) {
                break;
            }
            next = match self.find_user(ancestor_id)? {
                Some(ancestor) => ancestor.referrer_id,
                None => None,
            };
        }

        Ok(())
    }

    /// Get user by id
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.find_user(user_id)?
            .ok_or_else(|| Error::not_found("user", user_id))
    }

    /// Get user by id, `None` if absent
    pub fn find_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.get_row(CF_USERS, &user_id.to_be_bytes())
    }

    /// Get user by public key
    pub fn get_user_by_key(&self, pub_key: &str) -> Result<User> {
        self.find_user_by_key(pub_key)?
            .ok_or_else(|| Error::not_found("user", pub_key))
    }

    fn find_user_by_key(&self, pub_key: &str) -> Result<Option<User>> {
        let cf = self.cf_handle(CF_PUBKEYS)?;
        match self.db.get_cf(cf, pub_key.trim().as_bytes())? {
            Some(bytes) => {
                let id = keys::trailing_id(&bytes)
                    .ok_or_else(|| Error::Storage("corrupt public key index".to_string()))?;
                self.find_user(id)
            }
            None => Ok(None),
        }
    }

    /// Delete a user with its open investments and index entries
    ///
    /// Deposits, withdrawals, earnings and operations stay as history.
    pub fn delete_user(&self, user_id: UserId) -> Result<User> {
        let _registration = self.registration.lock();
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let user = self.get_user(user_id)?;
        if user.reserved.is_positive() {
            return Err(Error::Conflict(format!(
                "user {} has {} reserved for withdrawals in flight",
                user_id, user.reserved
            )));
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf_handle(CF_USERS)?, user_id.to_be_bytes());
        batch.delete_cf(self.cf_handle(CF_PUBKEYS)?, user.pub_key.as_bytes());

        let cf_investments = self.cf_handle(CF_INVESTMENTS)?;
        let investments: Vec<Investment> =
            self.scan_rows(CF_INVESTMENTS, &user_id.to_be_bytes())?;
        for investment in &investments {
            batch.delete_cf(cf_investments, keys::compound(user_id, investment.id));
        }

        let cf_indices = self.cf_handle(CF_INDICES)?;
        if let Some(referrer_id) = user.referrer_id {
            batch.delete_cf(cf_indices, keys::index(IDX_REFERRER_CHILD, referrer_id, user_id));
        }
        for child_id in self.index_ids(IDX_REFERRER_CHILD, user_id)? {
            batch.delete_cf(cf_indices, keys::index(IDX_REFERRER_CHILD, user_id, child_id));
        }

        // The lock entry stays: waiters still hold this mutex and a re-created
        // user with the same id must serialize on it too
        self.write(batch)?;

        tracing::info!(
            user_id,
            investments_removed = investments.len(),
            "User deleted"
        );

        Ok(user)
    }

    /// Apply a signed delta to a user's balance
    ///
    /// Negative deltas are checked against the available balance.
    pub fn adjust_balance(&self, user_id: UserId, delta: Amount) -> Result<User> {
        self.transact(user_id, |unit| {
            if delta.is_negative() {
                unit.debit(Amount::ZERO - delta)?;
            } else {
                unit.credit(delta)?;
            }
            Ok(unit.user().clone())
        })
    }

    /// Overwrite a user's balance (admin path)
    pub fn set_balance(&self, user_id: UserId, value: Amount) -> Result<User> {
        self.transact(user_id, |unit| {
            unit.set_balance(value)?;
            Ok(unit.user().clone())
        })
    }

    // Investments

    /// Open investment owned by `user_id`
    pub fn get_investment(
        &self,
        user_id: UserId,
        investment_id: InvestmentId,
    ) -> Result<Option<Investment>> {
        self.get_row(CF_INVESTMENTS, &keys::compound(user_id, investment_id))
    }

    /// All open investments of a user, ordered by id
    pub fn list_investments(&self, user_id: UserId) -> Result<Vec<Investment>> {
        self.scan_rows(CF_INVESTMENTS, &user_id.to_be_bytes())
    }

    // Deposits

    /// Get deposit request by id
    pub fn get_deposit(&self, deposit_id: DepositId) -> Result<DepositRequest> {
        self.get_row(CF_DEPOSITS, &deposit_id.to_be_bytes())?
            .ok_or_else(|| Error::not_found("deposit", deposit_id))
    }

    /// All deposit requests of a user, ordered by id
    pub fn list_deposits(&self, user_id: UserId) -> Result<Vec<DepositRequest>> {
        self.index_ids(IDX_USER_DEPOSIT, user_id)?
            .into_iter()
            .map(|id| self.get_deposit(id))
            .collect()
    }

    // Withdrawals

    /// Get withdrawal by id
    pub fn get_withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<WithdrawalRequest> {
        self.get_row(CF_WITHDRAWALS, &withdrawal_id.to_be_bytes())?
            .ok_or_else(|| Error::not_found("withdrawal", withdrawal_id))
    }

    /// All withdrawals of a user, ordered by id
    pub fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<WithdrawalRequest>> {
        self.index_ids(IDX_USER_WITHDRAWAL, user_id)?
            .into_iter()
            .map(|id| self.get_withdrawal(id))
            .collect()
    }

    // Referral earnings

    /// Earnings credited to `referrer_id`, ordered by id
    pub fn list_earnings(&self, referrer_id: UserId) -> Result<Vec<ReferralEarning>> {
        self.index_ids(IDX_REFERRER_EARNING, referrer_id)?
            .into_iter()
            .map(|id| {
                self.get_row(CF_EARNINGS, &id.to_be_bytes())?
                    .ok_or_else(|| Error::not_found("referral earning", id))
            })
            .collect()
    }
}
