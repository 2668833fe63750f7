//! Crowdfunding ledger priced by an external oracle.
//!
//! * [`oracle`]: price feed trait, adapter converting native amounts into
//!   18-decimal USD, and a mock aggregator for local use.
//! * [`ledger`]: the contribution/withdrawal state machine with owner-gated,
//!   all-or-nothing withdrawals.
//! * [`chain`]: a local execution environment: wallets, value transfer and
//!   persisted devnet state.
//! * [`config`]: devnet parameters.
//! * [`units`]: amount parsing and rendering.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod oracle;
pub mod units;

pub use chain::{ChainError, Devnet, LocalChain};
pub use ledger::{
    Address, FundingLedger, LedgerError, LedgerEvent, TransferError, ValueTransfer,
    WithdrawStrategy, MINIMUM_USD,
};
pub use oracle::{MockPriceFeed, OracleError, PriceFeed, PriceOracleAdapter};
