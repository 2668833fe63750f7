use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oracle::{
    OracleError, OracleRef, PriceFeed, PriceOracleAdapter, UsdAmount, Wei, PRECISION,
};

pub type Address = String;

/// Smallest accepted contribution, in 18-decimal reference units (50 USD).
pub const MINIMUM_USD: UsdAmount = 50 * PRECISION;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("contribution worth {provided} is below the minimum {required} (18-decimal USD)")]
    InsufficientContribution {
        required: UsdAmount,
        provided: UsdAmount,
    },
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(#[from] OracleError),
    #[error("{caller} is not the owner")]
    NotOwner { caller: Address },
    #[error("funder index {index} out of range (funders: {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("transfer failed: {0}")]
    TransferFailed(#[from] TransferError),
    #[error("balance overflow")]
    Overflow,
    #[error("snapshot bound to feed {expected}, got {actual}")]
    FeedMismatch { expected: OracleRef, actual: OracleRef },
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("recipient {to} rejected the transfer")]
    Rejected { to: Address },
    #[error("{0}")]
    Unavailable(String),
}

/// Outbound native-value transfer supplied by the execution environment.
pub trait ValueTransfer {
    fn transfer(&mut self, to: &Address, amount: Wei) -> Result<(), TransferError>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStrategy {
    /// Re-reads the persistent funder list on every iteration.
    #[default]
    Indexed,
    /// Moves the funder list into a local copy and walks it once.
    Cached,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerState {
    pub balance: Wei,
    pub address_to_amount: BTreeMap<Address, Wei>,
    pub funders: Vec<Address>,
}

impl LedgerState {
    pub fn is_drained(&self) -> bool {
        self.balance == 0 && self.funders.is_empty() && self.address_to_amount.is_empty()
    }

    /// Checks I1 (records sum to balance) and I2 (funder list matches positive records).
    fn check(&self) -> Result<(), LedgerError> {
        let sum = self
            .address_to_amount
            .values()
            .try_fold(0u128, |acc, amount| acc.checked_add(*amount))
            .ok_or(LedgerError::Overflow)?;
        if sum != self.balance {
            return Err(LedgerError::CorruptSnapshot("records do not sum to balance"));
        }
        if self.funders.len() != self.address_to_amount.len() {
            return Err(LedgerError::CorruptSnapshot("funder list does not match records"));
        }
        let mut seen = BTreeMap::new();
        for funder in &self.funders {
            match self.address_to_amount.get(funder) {
                Some(amount) if *amount > 0 => {}
                _ => return Err(LedgerError::CorruptSnapshot("funder without positive record")),
            }
            if seen.insert(funder, ()).is_some() {
                return Err(LedgerError::CorruptSnapshot("duplicate funder"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Funded {
        funder: Address,
        amount: Wei,
        usd_value: UsdAmount,
    },
    Withdrawn {
        owner: Address,
        amount: Wei,
        funders: usize,
        strategy: WithdrawStrategy,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub owner: Address,
    pub price_feed: OracleRef,
    pub state: LedgerState,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
    #[serde(with = "hex_root")]
    pub events_root: [u8; 32],
}

/// Everything cleared by a withdrawal, held until the transfer settles.
struct StagedWithdrawal {
    funders: Vec<Address>,
    records: Vec<(Address, Wei)>,
    balance: Wei,
}

pub struct FundingLedger<F> {
    owner: Address,
    oracle: PriceOracleAdapter<F>,
    state: LedgerState,
    events: Vec<LedgerEvent>,
}

impl<F: PriceFeed> FundingLedger<F> {
    /// Deploys a drained ledger owned by `owner` and priced by `feed`.
    pub fn new(owner: impl Into<Address>, feed: F) -> Self {
        let owner = owner.into();
        let oracle = PriceOracleAdapter::new(feed);
        tracing::info!(%owner, feed = %oracle.oracle_ref(), "ledger deployed");
        Self {
            owner,
            oracle,
            state: LedgerState::default(),
            events: Vec::new(),
        }
    }

    pub fn restore(snapshot: LedgerSnapshot, feed: F) -> Result<Self, LedgerError> {
        if feed.address() != &snapshot.price_feed {
            return Err(LedgerError::FeedMismatch {
                expected: snapshot.price_feed,
                actual: feed.address().clone(),
            });
        }
        snapshot.state.check()?;
        let ledger = Self {
            owner: snapshot.owner,
            oracle: PriceOracleAdapter::new(feed),
            state: snapshot.state,
            events: snapshot.events,
        };
        if ledger.state_root() != snapshot.state_root {
            return Err(LedgerError::CorruptSnapshot("state root mismatch"));
        }
        if ledger.events_root() != snapshot.events_root {
            return Err(LedgerError::CorruptSnapshot("events root mismatch"));
        }
        Ok(ledger)
    }

    pub fn fund(&mut self, caller: &Address, amount: Wei) -> Result<(), LedgerError> {
        let usd_value = self.oracle.convert(amount)?;
        if usd_value < MINIMUM_USD {
            return Err(LedgerError::InsufficientContribution {
                required: MINIMUM_USD,
                provided: usd_value,
            });
        }

        let previous = self.address_to_amount(caller);
        let record = previous.checked_add(amount).ok_or(LedgerError::Overflow)?;
        let balance = self
            .state
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        if previous == 0 {
            self.state.funders.push(caller.clone());
        }
        self.state.address_to_amount.insert(caller.clone(), record);
        self.state.balance = balance;
        self.events.push(LedgerEvent::Funded {
            funder: caller.clone(),
            amount,
            usd_value,
        });
        tracing::info!(funder = %caller, amount, usd_value, balance, "contribution accepted");
        Ok(())
    }

    /// Plain value sent to the ledger; admitted exactly like [`Self::fund`].
    pub fn receive(&mut self, caller: &Address, amount: Wei) -> Result<(), LedgerError> {
        self.fund(caller, amount)
    }

    pub fn withdraw<T: ValueTransfer + ?Sized>(
        &mut self,
        caller: &Address,
        transfer: &mut T,
    ) -> Result<Wei, LedgerError> {
        self.withdraw_with(caller, WithdrawStrategy::Indexed, transfer)
    }

    pub fn cheaper_withdraw<T: ValueTransfer + ?Sized>(
        &mut self,
        caller: &Address,
        transfer: &mut T,
    ) -> Result<Wei, LedgerError> {
        self.withdraw_with(caller, WithdrawStrategy::Cached, transfer)
    }

    /// Sends the whole balance to the owner and resets all bookkeeping.
    /// State is cleared before the transfer and restored if it fails.
    pub fn withdraw_with<T: ValueTransfer + ?Sized>(
        &mut self,
        caller: &Address,
        strategy: WithdrawStrategy,
        transfer: &mut T,
    ) -> Result<Wei, LedgerError> {
        if caller != &self.owner {
            tracing::warn!(%caller, "withdrawal rejected: not owner");
            return Err(LedgerError::NotOwner {
                caller: caller.clone(),
            });
        }

        let staged = match strategy {
            WithdrawStrategy::Indexed => self.stage_indexed(),
            WithdrawStrategy::Cached => self.stage_cached(),
        };
        let amount = staged.balance;

        if let Err(err) = transfer.transfer(&self.owner, amount) {
            tracing::warn!(owner = %self.owner, amount, error = %err, "transfer failed, rolling back");
            self.rollback(staged);
            return Err(err.into());
        }

        self.events.push(LedgerEvent::Withdrawn {
            owner: self.owner.clone(),
            amount,
            funders: staged.funders.len(),
            strategy,
        });
        tracing::info!(owner = %self.owner, amount, funders = staged.funders.len(), ?strategy, "withdrawal complete");
        Ok(amount)
    }

    fn stage_indexed(&mut self) -> StagedWithdrawal {
        let mut records = Vec::with_capacity(self.state.funders.len());
        for index in 0..self.state.funders.len() {
            let funder = &self.state.funders[index];
            if let Some(amount) = self.state.address_to_amount.remove(funder) {
                records.push((funder.clone(), amount));
            }
        }
        StagedWithdrawal {
            funders: std::mem::take(&mut self.state.funders),
            records,
            balance: std::mem::take(&mut self.state.balance),
        }
    }

    fn stage_cached(&mut self) -> StagedWithdrawal {
        let funders = std::mem::take(&mut self.state.funders);
        let records = funders
            .iter()
            .filter_map(|funder| {
                self.state
                    .address_to_amount
                    .remove(funder)
                    .map(|amount| (funder.clone(), amount))
            })
            .collect();
        StagedWithdrawal {
            funders,
            records,
            balance: std::mem::take(&mut self.state.balance),
        }
    }

    fn rollback(&mut self, staged: StagedWithdrawal) {
        self.state.address_to_amount.extend(staged.records);
        self.state.funders = staged.funders;
        self.state.balance = staged.balance;
    }

    pub fn price_feed(&self) -> &OracleRef {
        self.oracle.oracle_ref()
    }

    pub fn oracle(&self) -> &PriceOracleAdapter<F> {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut PriceOracleAdapter<F> {
        &mut self.oracle
    }

    pub fn funder(&self, index: usize) -> Result<&Address, LedgerError> {
        self.state
            .funders
            .get(index)
            .ok_or(LedgerError::IndexOutOfRange {
                index,
                len: self.state.funders.len(),
            })
    }

    pub fn address_to_amount(&self, address: &Address) -> Wei {
        self.state
            .address_to_amount
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    pub fn balance(&self) -> Wei {
        self.state.balance
    }

    pub fn funders(&self) -> &[Address] {
        &self.state.funders
    }

    pub fn minimum_usd(&self) -> UsdAmount {
        MINIMUM_USD
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            owner: self.owner.clone(),
            price_feed: self.price_feed().clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            state_root: self.state_root(),
            events_root: self.events_root(),
        }
    }

    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(self.state.funders.len() + 1);
        let mut hasher = Sha256::new();
        hasher.update(b"ledger");
        hasher.update(self.owner.as_bytes());
        hasher.update(self.price_feed().as_bytes());
        hasher.update(self.state.balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
        for funder in &self.state.funders {
            let mut hasher = Sha256::new();
            hasher.update(b"funder");
            hasher.update(funder.as_bytes());
            hasher.update(self.address_to_amount(funder).to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }

    /// Hash chain over the event log, kept apart from [`Self::state_root`] so
    /// that both withdrawal strategies commit to the same state.
    pub fn events_root(&self) -> [u8; 32] {
        self.events
            .iter()
            .fold(Sha256::digest(b"fundme-events").into(), |acc, event| {
                let mut hasher = Sha256::new();
                hasher.update(b"event");
                hasher.update(acc);
                hasher.update(event_leaf(event));
                hasher.finalize().into()
            })
    }
}

fn event_leaf(event: &LedgerEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match event {
        LedgerEvent::Funded {
            funder,
            amount,
            usd_value,
        } => {
            hasher.update(b"funded");
            hasher.update((funder.len() as u64).to_le_bytes());
            hasher.update(funder.as_bytes());
            hasher.update(amount.to_le_bytes());
            hasher.update(usd_value.to_le_bytes());
        }
        LedgerEvent::Withdrawn {
            owner,
            amount,
            funders,
            strategy,
        } => {
            hasher.update(b"withdrawn");
            hasher.update((owner.len() as u64).to_le_bytes());
            hasher.update(owner.as_bytes());
            hasher.update(amount.to_le_bytes());
            hasher.update((*funders as u64).to_le_bytes());
            hasher.update(match strategy {
                WithdrawStrategy::Indexed => [0u8],
                WithdrawStrategy::Cached => [1u8],
            });
        }
    }
    hasher.finalize().into()
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"fundme-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::oracle::{MockPriceFeed, MOCK_DECIMALS, MOCK_INITIAL_ANSWER};

    const ETH: Wei = PRECISION;
    const STRATEGIES: [WithdrawStrategy; 2] = [WithdrawStrategy::Indexed, WithdrawStrategy::Cached];

    #[derive(Default)]
    struct Payouts {
        received: BTreeMap<Address, Wei>,
        reject: bool,
    }

    impl ValueTransfer for Payouts {
        fn transfer(&mut self, to: &Address, amount: Wei) -> Result<(), TransferError> {
            if self.reject {
                return Err(TransferError::Rejected { to: to.clone() });
            }
            *self.received.entry(to.clone()).or_default() += amount;
            Ok(())
        }
    }

    fn addr(name: &str) -> Address {
        name.to_string()
    }

    fn deploy() -> FundingLedger<MockPriceFeed> {
        FundingLedger::new(
            "deployer",
            MockPriceFeed::new("0xfeed", MOCK_DECIMALS, MOCK_INITIAL_ANSWER),
        )
    }

    /// Wei worth `usd_cents` hundredths of a dollar at 2000 USD/ETH.
    fn worth_cents(usd_cents: u128) -> Wei {
        usd_cents * ETH / 200_000
    }

    fn assert_consistent(ledger: &FundingLedger<MockPriceFeed>) {
        ledger.state().check().unwrap();
    }

    #[test]
    fn construction_sets_owner_and_feed() {
        let ledger = deploy();
        assert_eq!(ledger.owner(), "deployer");
        assert_eq!(ledger.price_feed(), "0xfeed");
        assert_eq!(ledger.balance(), 0);
        assert!(ledger.state().is_drained());
        assert!(matches!(
            ledger.funder(0),
            Err(LedgerError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }

    #[test]
    fn threshold_boundary() {
        let mut ledger = deploy();
        let funder = addr("alice");

        let err = ledger.fund(&funder, worth_cents(4_999)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientContribution { required, provided }
                if required == MINIMUM_USD && provided == 49_990_000_000_000_000_000
        ));
        assert!(ledger.state().is_drained());

        ledger.fund(&funder, worth_cents(5_000)).unwrap();
        assert_eq!(ledger.funders(), [funder.clone()]);

        ledger.fund(&funder, worth_cents(10_000)).unwrap();
        assert_eq!(ledger.funders(), [funder.clone()]);
        assert_eq!(
            ledger.address_to_amount(&funder),
            worth_cents(5_000) + worth_cents(10_000)
        );
    }

    #[test]
    fn zero_and_dust_are_rejected() {
        let mut ledger = deploy();
        for amount in [0, 1, ETH / 1_000] {
            assert!(matches!(
                ledger.fund(&addr("dust"), amount),
                Err(LedgerError::InsufficientContribution { .. })
            ));
        }
        assert!(ledger.state().is_drained());
        assert!(ledger.events().is_empty());
    }

    #[test]
    fn oracle_failure_leaves_state_untouched() {
        let mut ledger = deploy();
        ledger.fund(&addr("alice"), ETH).unwrap();
        let before = ledger.state().clone();

        ledger.oracle_mut().feed_mut().set_offline(true);
        assert!(matches!(
            ledger.fund(&addr("bob"), ETH),
            Err(LedgerError::OracleUnavailable(OracleError::Unreachable { .. }))
        ));

        ledger.oracle_mut().feed_mut().set_offline(false);
        ledger.oracle_mut().feed_mut().update_answer(-1, 1);
        assert!(matches!(
            ledger.fund(&addr("bob"), ETH),
            Err(LedgerError::OracleUnavailable(OracleError::InvalidPrice { .. }))
        ));
        assert_eq!(ledger.state(), &before);
    }

    #[test]
    fn threshold_follows_live_price() {
        let mut ledger = deploy();
        let amount = worth_cents(6_000); // 60 USD at 2000
        ledger.oracle_mut().feed_mut().update_answer(1_000 * 100_000_000, 1);
        assert!(matches!(
            ledger.fund(&addr("alice"), amount),
            Err(LedgerError::InsufficientContribution { .. })
        ));
        ledger.oracle_mut().feed_mut().update_answer(2_000 * 100_000_000, 2);
        ledger.fund(&addr("alice"), amount).unwrap();
    }

    #[test]
    fn owner_may_fund() {
        let mut ledger = deploy();
        ledger.fund(&addr("deployer"), ETH).unwrap();
        assert_eq!(ledger.funder(0).unwrap(), "deployer");
        assert_eq!(ledger.address_to_amount(&addr("deployer")), ETH);
    }

    #[test]
    fn receive_is_admitted_like_fund() {
        let mut ledger = deploy();
        ledger.receive(&addr("alice"), ETH).unwrap();
        assert_eq!(ledger.funder(0).unwrap(), "alice");
        assert!(matches!(
            ledger.receive(&addr("bob"), 1),
            Err(LedgerError::InsufficientContribution { .. })
        ));
    }

    #[test]
    fn random_funding_keeps_books_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ledger = deploy();
        let names: Vec<Address> = (0..8).map(|i| format!("funder-{i}")).collect();
        let mut accepted = 0u128;
        let mut first_seen: Vec<Address> = Vec::new();

        for _ in 0..200 {
            let funder = &names[rng.gen_range(0..names.len())];
            let amount = rng.gen_range(0..ETH / 10);
            match ledger.fund(funder, amount) {
                Ok(()) => {
                    accepted += amount;
                    if !first_seen.contains(funder) {
                        first_seen.push(funder.clone());
                    }
                }
                Err(LedgerError::InsufficientContribution { .. }) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
            assert_consistent(&ledger);
        }

        assert_eq!(ledger.balance(), accepted);
        assert_eq!(ledger.funders(), first_seen.as_slice());
        let sum: Wei = ledger.funders().iter().map(|f| ledger.address_to_amount(f)).sum();
        assert_eq!(sum, accepted);
    }

    #[test]
    fn non_owner_cannot_withdraw() {
        for strategy in STRATEGIES {
            let mut ledger = deploy();
            ledger.fund(&addr("alice"), ETH).unwrap();
            let before = ledger.snapshot();
            let mut payouts = Payouts::default();

            let err = ledger
                .withdraw_with(&addr("alice"), strategy, &mut payouts)
                .unwrap_err();
            assert!(matches!(err, LedgerError::NotOwner { ref caller } if caller == "alice"));
            assert_eq!(ledger.snapshot(), before);
            assert!(payouts.received.is_empty());
            assert_eq!(ledger.address_to_amount(&addr("alice")), ETH);
        }
    }

    #[test]
    fn withdraw_drains_five_funders() {
        for strategy in STRATEGIES {
            let mut ledger = deploy();
            let names: Vec<Address> = (1..=5).map(|i| format!("account-{i}")).collect();
            for name in &names {
                ledger.fund(name, ETH).unwrap();
            }
            assert_eq!(ledger.funders(), names.as_slice());

            let mut payouts = Payouts::default();
            let amount = ledger
                .withdraw_with(&addr("deployer"), strategy, &mut payouts)
                .unwrap();

            assert_eq!(amount, 5 * ETH);
            assert_eq!(payouts.received[&addr("deployer")], 5 * ETH);
            assert!(ledger.state().is_drained());
            assert!(matches!(
                ledger.funder(0),
                Err(LedgerError::IndexOutOfRange { .. })
            ));
            for name in &names {
                assert_eq!(ledger.address_to_amount(name), 0);
            }
            assert!(matches!(
                ledger.events().last(),
                Some(LedgerEvent::Withdrawn { funders: 5, strategy: s, .. }) if *s == strategy
            ));
        }
    }

    #[test]
    fn strategies_reach_identical_state() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..20 {
            let mut indexed = deploy();
            let mut cached = deploy();
            for _ in 0..rng.gen_range(0..30) {
                let funder = format!("f{}", rng.gen_range(0..6));
                let amount = rng.gen_range(0..ETH);
                let a = indexed.fund(&funder, amount).is_ok();
                let b = cached.fund(&funder, amount).is_ok();
                assert_eq!(a, b);
            }

            let reject = rng.gen_bool(0.3);
            let mut left = Payouts { reject, ..Default::default() };
            let mut right = Payouts { reject, ..Default::default() };
            let a = indexed.withdraw(&addr("deployer"), &mut left);
            let b = cached.cheaper_withdraw(&addr("deployer"), &mut right);

            assert_eq!(a.is_ok(), b.is_ok());
            assert_eq!(indexed.state(), cached.state());
            assert_eq!(indexed.state_root(), cached.state_root());
            assert_eq!(left.received, right.received);
        }
    }

    #[test]
    fn failed_transfer_rolls_back() {
        for strategy in STRATEGIES {
            let mut ledger = deploy();
            ledger.fund(&addr("alice"), ETH).unwrap();
            ledger.fund(&addr("bob"), 2 * ETH).unwrap();
            ledger.fund(&addr("alice"), ETH).unwrap();
            let before = ledger.snapshot();

            let mut payouts = Payouts {
                reject: true,
                ..Default::default()
            };
            let err = ledger
                .withdraw_with(&addr("deployer"), strategy, &mut payouts)
                .unwrap_err();
            assert!(matches!(err, LedgerError::TransferFailed(TransferError::Rejected { .. })));
            assert_eq!(ledger.snapshot(), before);
            assert_eq!(ledger.funders(), [addr("alice"), addr("bob")]);

            // still usable afterwards
            payouts.reject = false;
            assert_eq!(
                ledger
                    .withdraw_with(&addr("deployer"), strategy, &mut payouts)
                    .unwrap(),
                4 * ETH
            );
        }
    }

    #[test]
    fn second_withdrawal_transfers_nothing() {
        struct Recorder<'a> {
            seen: &'a mut Vec<Wei>,
        }
        impl ValueTransfer for Recorder<'_> {
            fn transfer(&mut self, _to: &Address, amount: Wei) -> Result<(), TransferError> {
                self.seen.push(amount);
                Ok(())
            }
        }

        let mut ledger = deploy();
        ledger.fund(&addr("alice"), ETH).unwrap();
        let mut seen = Vec::new();
        ledger
            .withdraw(&addr("deployer"), &mut Recorder { seen: &mut seen })
            .unwrap();
        ledger
            .cheaper_withdraw(&addr("deployer"), &mut Recorder { seen: &mut seen })
            .unwrap();
        assert_eq!(seen, vec![ETH, 0]);
    }

    #[test]
    fn ledger_cycles_between_open_and_drained() {
        let mut ledger = deploy();
        let mut payouts = Payouts::default();
        for round in 0..3 {
            ledger.fund(&addr("alice"), ETH).unwrap();
            ledger.fund(&addr("bob"), ETH).unwrap();
            assert_eq!(ledger.funders().len(), 2);
            if round % 2 == 0 {
                ledger.withdraw(&addr("deployer"), &mut payouts).unwrap();
            } else {
                ledger.cheaper_withdraw(&addr("deployer"), &mut payouts).unwrap();
            }
            assert!(ledger.state().is_drained());
        }
        assert_eq!(payouts.received[&addr("deployer")], 6 * ETH);
    }

    #[test]
    fn snapshot_restores_and_detects_tampering() {
        let mut ledger = deploy();
        ledger.fund(&addr("alice"), ETH).unwrap();
        ledger
            .withdraw(&addr("deployer"), &mut Payouts::default())
            .unwrap();
        ledger.fund(&addr("carol"), ETH).unwrap();
        ledger.fund(&addr("bob"), ETH).unwrap();
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.events.len(), 4);
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let feed = MockPriceFeed::new("0xfeed", MOCK_DECIMALS, MOCK_INITIAL_ANSWER);
        let restored = FundingLedger::restore(decoded.clone(), feed).unwrap();
        assert_eq!(restored.state_root(), ledger.state_root());
        assert_eq!(restored.events(), ledger.events());
        assert_eq!(restored.funder(1).unwrap(), "bob");

        let other = MockPriceFeed::new("0xother", MOCK_DECIMALS, MOCK_INITIAL_ANSWER);
        assert!(matches!(
            FundingLedger::restore(decoded.clone(), other),
            Err(LedgerError::FeedMismatch { .. })
        ));

        let mut forged = decoded.clone();
        forged.events.remove(1);
        let feed = MockPriceFeed::new("0xfeed", MOCK_DECIMALS, MOCK_INITIAL_ANSWER);
        assert!(matches!(
            FundingLedger::restore(forged, feed),
            Err(LedgerError::CorruptSnapshot("events root mismatch"))
        ));

        let mut tampered = decoded;
        tampered.state.balance += 1;
        let feed = MockPriceFeed::new("0xfeed", MOCK_DECIMALS, MOCK_INITIAL_ANSWER);
        assert!(matches!(
            FundingLedger::restore(tampered, feed),
            Err(LedgerError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn state_root_tracks_contents() {
        let mut ledger = deploy();
        let empty = ledger.state_root();
        ledger.fund(&addr("alice"), ETH).unwrap();
        let funded = ledger.state_root();
        assert_ne!(empty, funded);
        assert_eq!(funded, ledger.state_root());
        ledger
            .withdraw(&addr("deployer"), &mut Payouts::default())
            .unwrap();
        assert_eq!(ledger.state_root(), empty);
        assert_ne!(ledger.events_root(), deploy().events_root());
    }

    #[test]
    fn price_updates_keep_the_feed_reference() {
        let mut ledger = deploy();
        ledger.oracle_mut().feed_mut().update_answer(3_000 * 100_000_000, 1);
        ledger.oracle_mut().feed_mut().set_offline(true);
        ledger.oracle_mut().feed_mut().set_offline(false);
        assert_eq!(ledger.price_feed(), "0xfeed");
        assert_eq!(ledger.snapshot().price_feed, "0xfeed");
        ledger.fund(&addr("alice"), ETH).unwrap();
    }
}
