//! Referral graph queries
//!
//! The referral forest is stored as the `referrer_id` field on each user (the
//! upward edge) plus a `referrer || child` index for downward walks.

use crate::{
    error::Result,
    storage::{Store, IDX_REFERRER_CHILD},
    types::{Downline, User, UserId},
};

impl Store {
    /// Referrers above `user_id`, nearest first, at most `max_depth` of them
    ///
    /// The walk ends early at a user without referrer or at a referrer that no
    /// longer exists.
    pub fn referrer_chain(&self, user_id: UserId, max_depth: u8) -> Result<Vec<User>> {
        let user = self.get_user(user_id)?;
        let mut chain = Vec::with_capacity(max_depth as usize);
        let mut next = user.referrer_id;

        while let Some(referrer_id) = next {
            if chain.len() >= max_depth as usize {
                break;
            }
            match self.find_user(referrer_id)? {
                Some(referrer) => {
                    next = referrer.referrer_id;
                    chain.push(referrer);
                }
                None => {
                    tracing::debug!(user_id, referrer_id, "Referral chain ends at missing user");
                    break;
                }
            }
        }

        Ok(chain)
    }

    /// Users directly referred by `referrer_id`
    pub fn referred_users(&self, referrer_id: UserId) -> Result<Vec<UserId>> {
        self.index_ids(IDX_REFERRER_CHILD, referrer_id)
    }

    /// Users below `referrer_id` down to the configured referral depth
    pub fn downline(&self, referrer_id: UserId) -> Result<Vec<Downline>> {
        let max_depth = self.config().max_referral_depth;
        let mut result = Vec::new();
        let mut frontier = vec![referrer_id];

        for level in 1..=max_depth {
            let mut next = Vec::new();
            for parent in frontier {
                for child in self.referred_users(parent)? {
                    result.push(Downline {
                        user_id: child,
                        level,
                    });
                    next.push(child);
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(result)
    }
}
