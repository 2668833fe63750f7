use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DevnetConfig};
use crate::ledger::{
    Address, FundingLedger, LedgerError, LedgerSnapshot, TransferError, ValueTransfer,
    WithdrawStrategy,
};
use crate::oracle::{MockPriceFeed, Wei};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("account {account} holds {available} wei, needs {required}")]
    InsufficientFunds {
        account: Address,
        available: Wei,
        required: Wei,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("state file encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u8),
}

/// Native wallet balances of every externally owned account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LocalChain {
    pub balances: BTreeMap<Address, Wei>,
    /// Accounts that refuse incoming value.
    #[serde(default)]
    pub rejecting: BTreeSet<Address>,
}

impl LocalChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &Address) -> Wei {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, account: &Address, amount: Wei) {
        let balance = self.balances.entry(account.clone()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn debit(&mut self, account: &Address, amount: Wei) -> Result<(), ChainError> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(ChainError::InsufficientFunds {
                account: account.clone(),
                available,
                required: amount,
            });
        }
        self.balances.insert(account.clone(), available - amount);
        Ok(())
    }

    pub fn set_rejecting(&mut self, account: &Address, rejecting: bool) {
        if rejecting {
            self.rejecting.insert(account.clone());
        } else {
            self.rejecting.remove(account);
        }
    }
}

impl ValueTransfer for LocalChain {
    fn transfer(&mut self, to: &Address, amount: Wei) -> Result<(), TransferError> {
        if self.rejecting.contains(to) {
            return Err(TransferError::Rejected { to: to.clone() });
        }
        let balance = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or_else(|| TransferError::Unavailable(format!("wallet {to} would overflow")))?;
        self.balances.insert(to.clone(), balance);
        Ok(())
    }
}

const STATE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct DevnetFile {
    version: u8,
    clock: u64,
    accounts: Vec<Address>,
    chain: LocalChain,
    feed: MockPriceFeed,
    ledger: LedgerSnapshot,
}

/// A local chain with one deployed ledger, priced by a mock aggregator.
pub struct Devnet {
    clock: u64,
    accounts: Vec<Address>,
    chain: LocalChain,
    ledger: FundingLedger<MockPriceFeed>,
}

impl Devnet {
    pub fn deploy(config: &DevnetConfig) -> Result<Self, ChainError> {
        config.validate()?;
        let accounts = config.account_addresses();
        let mut chain = LocalChain::new();
        for account in &accounts {
            chain.credit(account, config.account_balance);
        }
        let feed = MockPriceFeed::new(
            config.feed_address.clone(),
            config.feed_decimals,
            config.initial_answer,
        );
        let ledger = FundingLedger::new(accounts[config.deployer].clone(), feed);
        Ok(Self {
            clock: 0,
            accounts,
            chain,
            ledger,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let bytes = fs::read(path).map_err(|source| ChainError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: DevnetFile = serde_json::from_slice(&bytes)?;
        if file.version != STATE_VERSION {
            return Err(ChainError::UnsupportedVersion(file.version));
        }
        let ledger = FundingLedger::restore(file.ledger, file.feed)?;
        Ok(Self {
            clock: file.clock,
            accounts: file.accounts,
            chain: file.chain,
            ledger,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ChainError> {
        let file = DevnetFile {
            version: STATE_VERSION,
            clock: self.clock,
            accounts: self.accounts.clone(),
            chain: self.chain.clone(),
            feed: self.ledger.oracle().feed().clone(),
            ledger: self.ledger.snapshot(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ChainError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| ChainError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Sends `value` from `caller`'s wallet into the ledger via `fund`.
    pub fn fund(&mut self, caller: &Address, value: Wei) -> Result<(), ChainError> {
        self.tick();
        self.chain.debit(caller, value)?;
        if let Err(err) = self.ledger.fund(caller, value) {
            self.chain.credit(caller, value);
            return Err(err.into());
        }
        Ok(())
    }

    /// Sends plain value without calling `fund`.
    pub fn receive(&mut self, caller: &Address, value: Wei) -> Result<(), ChainError> {
        self.tick();
        self.chain.debit(caller, value)?;
        if let Err(err) = self.ledger.receive(caller, value) {
            self.chain.credit(caller, value);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn withdraw(
        &mut self,
        caller: &Address,
        strategy: WithdrawStrategy,
    ) -> Result<Wei, ChainError> {
        self.tick();
        Ok(self
            .ledger
            .withdraw_with(caller, strategy, &mut self.chain)?)
    }

    pub fn set_price(&mut self, answer: i128) {
        let now = self.tick();
        self.ledger.oracle_mut().feed_mut().update_answer(answer, now);
    }

    pub fn set_feed_offline(&mut self, offline: bool) {
        self.ledger.oracle_mut().feed_mut().set_offline(offline);
    }

    pub fn set_rejecting(&mut self, account: &Address, rejecting: bool) {
        self.chain.set_rejecting(account, rejecting);
    }

    pub fn accounts(&self) -> &[Address] {
        &self.accounts
    }

    /// Resolves an account index (`"3"`) or passes an address through.
    pub fn resolve(&self, who: &str) -> Address {
        who.parse::<usize>()
            .ok()
            .and_then(|index| self.accounts.get(index).cloned())
            .unwrap_or_else(|| who.to_string())
    }

    pub fn wallet(&self, account: &Address) -> Wei {
        self.chain.balance_of(account)
    }

    pub fn ledger(&self) -> &FundingLedger<MockPriceFeed> {
        &self.ledger
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
