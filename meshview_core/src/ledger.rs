//! Balance operations over the entity store.
//!
//! Every operation validates first and mutates second, so a failed call
//! leaves the store untouched. Deductions move value into the deducted
//! account's `held` entry; refunds move it back and `settle` moves the rest
//! into `consumed`. Neither may draw on another account's entry.

use meshview_env::{AccountId, RandomSource};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::model::{Account, AccountRole, Amount};
use crate::store::EntityStore;

/// A completed faucet transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
}

/// Where a refund ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refunded {
    Account(AccountId),
    /// The account was deleted in the meantime; the faucet took the refund.
    Faucet,
}

/// Mutable view of the store restricted to balance-safe operations.
pub struct Ledger<'a> {
    store: &'a mut EntityStore,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a mut EntityStore) -> Self {
        Self { store }
    }

    /// Opens a user account with a zero balance.
    pub fn create_user<R: RandomSource + ?Sized>(
        &mut self,
        role: AccountRole,
        rng: &mut R,
    ) -> CoreResult<Account> {
        if role.is_system() {
            return Err(CoreError::validation(format!(
                "cannot create a {role:?} account"
            )));
        }
        let account = Account::generate(role, rng);
        info!(account = %account.id, address = %account.address, ?role, "user created");
        self.store.push_user(account.clone());
        Ok(account)
    }

    /// Removes a user account and returns its balance to the faucet.
    ///
    /// The returned account carries the balance it had before removal.
    pub fn delete_user(&mut self, id: AccountId) -> CoreResult<Account> {
        let role = self.store.account(id)?.role;
        if role.is_system() {
            return Err(CoreError::validation("system accounts cannot be deleted"));
        }
        let reclaimed = self.store.account(id)?.balance;
        let faucet_after = self
            .store
            .faucet_source()
            .balance
            .checked_add(reclaimed)
            .ok_or(CoreError::Overflow)?;

        let account = self
            .store
            .remove_user(id)
            .ok_or(CoreError::AccountNotFound(id))?;
        self.store.faucet_mut().balance = faucet_after;
        info!(account = %id, reclaimed = %reclaimed, "user deleted");
        Ok(account)
    }

    /// Moves `amount` from the faucet source to `target`.
    pub fn faucet(&mut self, target: AccountId, amount: Amount) -> CoreResult<Transfer> {
        if amount.is_zero() {
            return Err(CoreError::validation("faucet amount must be positive"));
        }
        let source = self.store.faucet_source().id;
        if target == source {
            return Err(CoreError::validation("faucet source cannot fund itself"));
        }
        let target_balance = self.store.account(target)?.balance;
        let available = self.store.faucet_source().balance;
        let source_after = available.checked_sub(amount).ok_or(CoreError::PoolExhausted {
            requested: amount,
            available,
        })?;
        let target_after = target_balance
            .checked_add(amount)
            .ok_or(CoreError::Overflow)?;

        self.store.faucet_mut().balance = source_after;
        self.store.account_mut(target)?.balance = target_after;
        debug!(to = %target, amount = %amount, "faucet transfer");
        Ok(Transfer {
            from: source,
            to: target,
            amount,
        })
    }

    /// Takes `amount` from an account and holds it. Returns the new balance.
    pub fn deduct(&mut self, id: AccountId, amount: Amount) -> CoreResult<Amount> {
        let available = self.store.account(id)?.balance;
        let after = available
            .checked_sub(amount)
            .ok_or(CoreError::InsufficientFunds {
                account: id,
                required: amount,
                available,
            })?;
        let held = self
            .store
            .held_by(id)
            .checked_add(amount)
            .ok_or(CoreError::Overflow)?;

        self.store.account_mut(id)?.balance = after;
        self.store.set_held(id, held);
        debug!(account = %id, amount = %amount, "deducted");
        Ok(after)
    }

    /// Returns value held from `id`'s deductions to that account.
    ///
    /// If the account no longer exists the faucet source is credited
    /// instead, so value is never stranded.
    pub fn refund(&mut self, id: AccountId, amount: Amount) -> CoreResult<Refunded> {
        let held = self.release(id, amount)?;
        let (target, current) = match self.store.account(id) {
            Ok(account) => (Refunded::Account(id), account.balance),
            Err(_) => (Refunded::Faucet, self.store.faucet_source().balance),
        };
        let after = current.checked_add(amount).ok_or(CoreError::Overflow)?;

        match target {
            Refunded::Account(id) => self.store.account_mut(id)?.balance = after,
            Refunded::Faucet => self.store.faucet_mut().balance = after,
        }
        self.store.set_held(id, held);
        debug!(account = %id, amount = %amount, ?target, "refunded");
        Ok(target)
    }

    /// Books value held from `id`'s deductions as consumed by the network.
    pub fn settle(&mut self, id: AccountId, amount: Amount) -> CoreResult<()> {
        let held = self.release(id, amount)?;
        let consumed = self
            .store
            .consumed
            .checked_add(amount)
            .ok_or(CoreError::Overflow)?;
        self.store.set_held(id, held);
        self.store.consumed = consumed;
        Ok(())
    }

    /// What `id` would still have held after releasing `amount`.
    fn release(&self, id: AccountId, amount: Amount) -> CoreResult<Amount> {
        let outstanding = self.store.held_by(id);
        outstanding.checked_sub(amount).ok_or_else(|| {
            CoreError::validation(format!(
                "release of {amount} exceeds {outstanding} outstanding for {id}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use meshview_env::SeededRandom;
    use proptest::prelude::*;

    fn setup(genesis: u64) -> (EntityStore, SeededRandom) {
        let mut rng = SeededRandom::new(3);
        let store = EntityStore::new(
            Amount::from_tokens(genesis),
            2,
            &TelemetryConfig::default(),
            &mut rng,
        );
        (store, rng)
    }

    #[test]
    fn test_create_user_starts_empty() {
        let (mut store, mut rng) = setup(100);
        let account = Ledger::new(&mut store)
            .create_user(AccountRole::Client, &mut rng)
            .unwrap();
        assert_eq!(account.balance, Amount::ZERO);
        assert_eq!(store.users().len(), 1);

        let err = Ledger::new(&mut store)
            .create_user(AccountRole::Relayer, &mut rng)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_faucet_moves_value_atomically() {
        let (mut store, mut rng) = setup(100);
        let mut ledger = Ledger::new(&mut store);
        let user = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        ledger.faucet(user.id, Amount::from_tokens(30)).unwrap();

        assert_eq!(store.faucet_source().balance, Amount::from_tokens(70));
        assert_eq!(store.account(user.id).unwrap().balance, Amount::from_tokens(30));
        assert_eq!(store.total_supply(), Amount::from_tokens(100));
    }

    #[test]
    fn test_faucet_pool_exhausted_changes_nothing() {
        let (mut store, mut rng) = setup(10);
        let mut ledger = Ledger::new(&mut store);
        let user = ledger.create_user(AccountRole::Admin, &mut rng).unwrap();
        let err = ledger.faucet(user.id, Amount::from_tokens(11)).unwrap_err();

        assert_eq!(
            err,
            CoreError::PoolExhausted {
                requested: Amount::from_tokens(11),
                available: Amount::from_tokens(10),
            }
        );
        assert_eq!(store.faucet_source().balance, Amount::from_tokens(10));
        assert_eq!(store.account(user.id).unwrap().balance, Amount::ZERO);
    }

    #[test]
    fn test_faucet_rejects_zero_and_self() {
        let (mut store, _) = setup(10);
        let source = store.faucet_source().id;
        let relayer = store.relayers()[0].id;
        let mut ledger = Ledger::new(&mut store);
        assert!(matches!(
            ledger.faucet(relayer, Amount::ZERO),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            ledger.faucet(source, Amount::from_tokens(1)),
            Err(CoreError::Validation(_))
        ));
        // Relayers are valid targets.
        ledger.faucet(relayer, Amount::from_tokens(1)).unwrap();
    }

    #[test]
    fn test_delete_user_returns_balance_to_faucet() {
        let (mut store, mut rng) = setup(100);
        let mut ledger = Ledger::new(&mut store);
        let user = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        ledger.faucet(user.id, Amount::from_tokens(40)).unwrap();
        let removed = ledger.delete_user(user.id).unwrap();

        assert_eq!(removed.balance, Amount::from_tokens(40));
        assert_eq!(store.faucet_source().balance, Amount::from_tokens(100));
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_delete_system_account_rejected() {
        let (mut store, _) = setup(100);
        let source = store.faucet_source().id;
        let relayer = store.relayers()[1].id;
        let mut ledger = Ledger::new(&mut store);
        assert!(matches!(ledger.delete_user(source), Err(CoreError::Validation(_))));
        assert!(matches!(ledger.delete_user(relayer), Err(CoreError::Validation(_))));
        let missing = AccountId::from_seed(1);
        assert_eq!(ledger.delete_user(missing), Err(CoreError::AccountNotFound(missing)));
    }

    #[test]
    fn test_deduct_refund_settle_cycle() {
        let (mut store, mut rng) = setup(100);
        let mut ledger = Ledger::new(&mut store);
        let user = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        ledger.faucet(user.id, Amount::from_tokens(20)).unwrap();

        assert!(matches!(
            ledger.deduct(user.id, Amount::from_tokens(21)),
            Err(CoreError::InsufficientFunds { .. })
        ));
        ledger.deduct(user.id, Amount::from_tokens(10)).unwrap();
        ledger.refund(user.id, Amount::from_tokens(9)).unwrap();
        ledger.settle(user.id, Amount::from_tokens(1)).unwrap();
        assert!(matches!(
            ledger.refund(user.id, Amount::from_micros(1)),
            Err(CoreError::Validation(_))
        ));

        assert_eq!(store.account(user.id).unwrap().balance, Amount::from_tokens(19));
        assert_eq!(store.consumed(), Amount::from_tokens(1));
        assert_eq!(store.held(), Amount::ZERO);
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_refund_to_deleted_account_goes_to_faucet() {
        let (mut store, mut rng) = setup(100);
        let mut ledger = Ledger::new(&mut store);
        let user = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        ledger.faucet(user.id, Amount::from_tokens(10)).unwrap();
        ledger.deduct(user.id, Amount::from_tokens(10)).unwrap();
        ledger.delete_user(user.id).unwrap();

        let target = ledger.refund(user.id, Amount::from_tokens(4)).unwrap();
        assert_eq!(target, Refunded::Faucet);
        ledger.settle(user.id, Amount::from_tokens(6)).unwrap();
        assert_eq!(store.faucet_source().balance, Amount::from_tokens(94));
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_refund_cannot_draw_on_another_account() {
        let (mut store, mut rng) = setup(100);
        let mut ledger = Ledger::new(&mut store);
        let a = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        let b = ledger.create_user(AccountRole::Client, &mut rng).unwrap();
        ledger.faucet(a.id, Amount::from_tokens(10)).unwrap();
        ledger.deduct(a.id, Amount::from_tokens(10)).unwrap();

        assert!(matches!(
            ledger.refund(b.id, Amount::from_tokens(10)),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            ledger.settle(b.id, Amount::from_tokens(1)),
            Err(CoreError::Validation(_))
        ));

        assert_eq!(store.account(a.id).unwrap().balance, Amount::ZERO);
        assert_eq!(store.account(b.id).unwrap().balance, Amount::ZERO);
        assert_eq!(store.held_by(a.id), Amount::from_tokens(10));
        assert_eq!(store.held_by(b.id), Amount::ZERO);

        let mut ledger = Ledger::new(&mut store);
        ledger.refund(a.id, Amount::from_tokens(10)).unwrap();
        assert_eq!(store.holders().count(), 0);
        assert!(store.audit().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Faucet(usize, u64),
        Deduct(usize, u64),
        Refund(usize, u64),
        Settle(usize, u64),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 0..50_000_000u64).prop_map(|(i, a)| Op::Faucet(i, a)),
            (0..3usize, 0..50_000_000u64).prop_map(|(i, a)| Op::Deduct(i, a)),
            (0..3usize, 0..50_000_000u64).prop_map(|(i, a)| Op::Refund(i, a)),
            (0..3usize, 0..50_000_000u64).prop_map(|(i, a)| Op::Settle(i, a)),
            (0..3usize).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_supply_conserved_under_any_sequence(ops in proptest::collection::vec(op(), 1..60)) {
            let (mut store, mut rng) = setup(100);
            let users: Vec<AccountId> = (0..3)
                .map(|_| Ledger::new(&mut store).create_user(AccountRole::Client, &mut rng).unwrap().id)
                .collect();

            // Expected held amount per user, tracked outside the ledger.
            let mut owed = [0u64; 3];
            for op in ops {
                let mut ledger = Ledger::new(&mut store);
                // Errors are expected; they just must not corrupt anything.
                match op {
                    Op::Faucet(i, a) => {
                        let _ = ledger.faucet(users[i], Amount::from_micros(a));
                    }
                    Op::Deduct(i, a) => {
                        if ledger.deduct(users[i], Amount::from_micros(a)).is_ok() {
                            owed[i] += a;
                        }
                    }
                    Op::Refund(i, a) => {
                        let outcome = ledger.refund(users[i], Amount::from_micros(a));
                        prop_assert_eq!(outcome.is_ok(), a <= owed[i]);
                        if outcome.is_ok() {
                            owed[i] -= a;
                        }
                    }
                    Op::Settle(i, a) => {
                        let outcome = ledger.settle(users[i], Amount::from_micros(a));
                        prop_assert_eq!(outcome.is_ok(), a <= owed[i]);
                        if outcome.is_ok() {
                            owed[i] -= a;
                        }
                    }
                    Op::Delete(i) => {
                        let _ = ledger.delete_user(users[i]);
                    }
                }
                prop_assert!(store.audit().is_empty(), "{:?}", store.audit());
                for (i, user) in users.iter().enumerate() {
                    prop_assert_eq!(store.held_by(*user), Amount::from_micros(owed[i]));
                }
            }
        }
    }
}
