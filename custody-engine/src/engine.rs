//! Custody engine
//!
//! Wires the ledger store, chain transport and metrics into the four services
//! and exposes the user administration surface.

use crate::{
    chain::ChainTransport,
    config::EngineConfig,
    deposit::DepositService,
    investment::InvestmentService,
    metrics::Metrics,
    referral::ReferralEngine,
    withdrawal::WithdrawalService,
    Error, Result,
};
use ledger_core::{Amount, NewUser, OperationPage, Store, User, UserId};
use std::sync::Arc;

/// Custody engine
#[derive(Debug)]
pub struct CustodyEngine {
    /// Ledger store
    store: Arc<Store>,

    /// Investment lifecycle
    investments: InvestmentService,

    /// Referral cascade
    referrals: Arc<ReferralEngine>,

    /// Deposit reconciliation
    deposits: DepositService,

    /// Withdrawal settlement
    withdrawals: WithdrawalService,

    metrics: Arc<Metrics>,
    config: Arc<EngineConfig>,
}

impl CustodyEngine {
    /// Open the ledger at `config.ledger.data_dir` and build the engine
    pub fn open(config: EngineConfig, chain: Arc<dyn ChainTransport>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(Store::open(&config.ledger)?);
        Self::with_store(store, config, chain)
    }

    /// Build the engine on an already opened store
    pub fn with_store(
        store: Arc<Store>,
        config: EngineConfig,
        chain: Arc<dyn ChainTransport>,
    ) -> Result<Self> {
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("metrics registry: {}", e)))?,
        );
        let config = Arc::new(config);

        let referrals = Arc::new(ReferralEngine::new(
            store.clone(),
            config.referral.clone(),
            metrics.clone(),
        ));
        let investments = InvestmentService::new(
            store.clone(),
            config.clone(),
            referrals.clone(),
            metrics.clone(),
        );
        let deposits =
            DepositService::new(store.clone(), chain.clone(), config.clone(), metrics.clone());
        let withdrawals = WithdrawalService::new(store.clone(), chain, config.clone(), metrics.clone());

        tracing::info!(
            data_dir = %config.data_dir().display(),
            investment_types = config.investment_types.len(),
            "Custody engine ready"
        );

        Ok(Self {
            store,
            investments,
            referrals,
            deposits,
            withdrawals,
            metrics,
            config,
        })
    }

    /// Ledger store
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Investment lifecycle
    pub fn investments(&self) -> &InvestmentService {
        &self.investments
    }

    /// Referral cascade
    pub fn referrals(&self) -> &ReferralEngine {
        &self.referrals
    }

    /// Deposit reconciliation
    pub fn deposits(&self) -> &DepositService {
        &self.deposits
    }

    /// Withdrawal settlement
    pub fn withdrawals(&self) -> &WithdrawalService {
        &self.withdrawals
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // User administration

    /// Register a user, or return the one already holding `pub_key`
    pub fn create_user(&self, new_user: NewUser) -> Result<User> {
        let user = self.store.create_user(new_user)?;
        tracing::info!(user_id = user.id, referrer_id = ?user.referrer_id, "User registered");
        Ok(user)
    }

    /// Get user by id
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        Ok(self.store.get_user(user_id)?)
    }

    /// Get user by public key
    pub fn get_user_by_key(&self, pub_key: &str) -> Result<User> {
        Ok(self.store.get_user_by_key(pub_key)?)
    }

    /// Delete a user and their open investments
    pub fn delete_user(&self, user_id: UserId) -> Result<User> {
        let user = self.store.delete_user(user_id)?;
        tracing::warn!(user_id, balance = %user.balance, "User deleted");
        Ok(user)
    }

    /// Overwrite a user's balance (admin)
    pub fn set_balance(&self, user_id: UserId, value: Amount) -> Result<User> {
        let user = self.store.set_balance(user_id, value)?;
        tracing::warn!(user_id, balance = %value, "Balance overwritten");
        Ok(user)
    }

    /// Add `delta` to a user's balance (admin)
    pub fn adjust_balance(&self, user_id: UserId, delta: Amount) -> Result<User> {
        let user = self.store.adjust_balance(user_id, delta)?;
        tracing::warn!(user_id, delta = %delta, balance = %user.balance, "Balance adjusted");
        Ok(user)
    }

    /// Page through a user's operations, newest first
    pub fn list_operations(
        &self,
        user_id: UserId,
        page: u32,
        page_size: u32,
    ) -> Result<OperationPage> {
        self.store.get_user(user_id)?;
        Ok(self.store.list_operations(user_id, page, page_size)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainTransport;
    use tempfile::TempDir;

    fn test_engine() -> (CustodyEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.ledger.data_dir = temp_dir.path().to_path_buf();
        config.ledger.rocksdb.sync_writes = false;
        let chain = Arc::new(MockChainTransport::new("platform-wallet"));
        (CustodyEngine::open(config, chain).unwrap(), temp_dir)
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.ledger.data_dir = temp_dir.path().to_path_buf();
        config.ledger.max_referral_depth = 0;
        let chain = Arc::new(MockChainTransport::new("platform-wallet"));
        assert!(CustodyEngine::open(config, chain).is_err());
    }

    #[test]
    fn test_user_administration() {
        let (engine, _temp) = test_engine();
        let user = engine
            .create_user(NewUser {
                pub_key: "alice".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(engine.get_user_by_key("alice").unwrap().id, user.id);

        engine.set_balance(user.id, Amount::from_units(50)).unwrap();
        let user = engine.adjust_balance(user.id, Amount::from_units(-20)).unwrap();
        assert_eq!(user.balance, Amount::from_units(30));

        engine.delete_user(user.id).unwrap();
        assert!(matches!(
            engine.get_user(user.id),
            Err(Error::NotFound { entity: "user", .. })
        ));
    }

    #[test]
    fn test_list_operations_unknown_user() {
        let (engine, _temp) = test_engine();
        assert!(matches!(
            engine.list_operations(42, 1, 10),
            Err(Error::NotFound { .. })
        ));
    }
}
