use serde::{Deserialize, Serialize};

pub type OracleRef = String;
pub type Wei = u128;
pub type UsdAmount = u128;

/// Common fixed-point scale for prices and reference amounts (18 decimals).
pub const PRECISION_DECIMALS: u32 = 18;
pub const PRECISION: u128 = 1_000_000_000_000_000_000;
/// Decimal scale of the native unit (1 ETH = 1e18 wei).
pub const NATIVE_DECIMALS: u32 = 18;

pub const MAX_FEED_DECIMALS: u8 = 36;

pub const MOCK_DECIMALS: u8 = 8;
pub const MOCK_INITIAL_ANSWER: i128 = 2_000 * 100_000_000; // 2000.00000000 USD/ETH

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("price feed {feed} unreachable: {reason}")]
    Unreachable { feed: OracleRef, reason: String },
    #[error("price feed {feed} returned invalid price {answer}")]
    InvalidPrice { feed: OracleRef, answer: i128 },
    #[error("price feed {feed} reports unsupported decimals {decimals}")]
    UnsupportedDecimals { feed: OracleRef, decimals: u8 },
    #[error("price feed moved from {expected} to {actual}")]
    FeedRebound { expected: OracleRef, actual: OracleRef },
    #[error("price conversion overflow")]
    Overflow,
}

/// One `latestPrice()` read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceData {
    pub round_id: u64,
    pub answer: i128,
    pub decimals: u8,
    pub updated_at: u64,
}

/// Read-only external price source: reference units per whole native unit.
pub trait PriceFeed {
    fn address(&self) -> &OracleRef;

    fn latest_price(&self) -> Result<PriceData, OracleError>;
}

impl<T: PriceFeed + ?Sized> PriceFeed for Box<T> {
    fn address(&self) -> &OracleRef {
        (**self).address()
    }

    fn latest_price(&self) -> Result<PriceData, OracleError> {
        (**self).latest_price()
    }
}

/// Converts native amounts into 18-decimal reference amounts using a live feed.
///
/// The feed reference is pinned at construction; a feed that later reports a
/// different address is refused.
#[derive(Clone, Debug)]
pub struct PriceOracleAdapter<F> {
    oracle_ref: OracleRef,
    feed: F,
}

impl<F: PriceFeed> PriceOracleAdapter<F> {
    pub fn new(feed: F) -> Self {
        Self {
            oracle_ref: feed.address().clone(),
            feed,
        }
    }

    pub fn oracle_ref(&self) -> &OracleRef {
        &self.oracle_ref
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut F {
        &mut self.feed
    }

    /// Current price normalised to [`PRECISION_DECIMALS`].
    pub fn price(&self) -> Result<UsdAmount, OracleError> {
        if self.feed.address() != &self.oracle_ref {
            return Err(OracleError::FeedRebound {
                expected: self.oracle_ref.clone(),
                actual: self.feed.address().clone(),
            });
        }
        let data = self.feed.latest_price()?;
        tracing::debug!(
            feed = %self.oracle_ref,
            round = data.round_id,
            answer = data.answer,
            decimals = data.decimals,
            "price feed read"
        );
        normalise_price(&self.oracle_ref, &data)
    }

    pub fn convert(&self, amount: Wei) -> Result<UsdAmount, OracleError> {
        let price = self.price()?;
        mul_div(price, amount, 10u128.pow(NATIVE_DECIMALS))
    }
}

fn normalise_price(feed: &OracleRef, data: &PriceData) -> Result<UsdAmount, OracleError> {
    if data.answer <= 0 {
        return Err(OracleError::InvalidPrice {
            feed: feed.clone(),
            answer: data.answer,
        });
    }
    if data.decimals > MAX_FEED_DECIMALS {
        return Err(OracleError::UnsupportedDecimals {
            feed: feed.clone(),
            decimals: data.decimals,
        });
    }
    let answer = data.answer as u128;
    let decimals = u32::from(data.decimals);
    if decimals <= PRECISION_DECIMALS {
        answer
            .checked_mul(10u128.pow(PRECISION_DECIMALS - decimals))
            .ok_or(OracleError::Overflow)
    } else {
        Ok(answer / 10u128.pow(decimals - PRECISION_DECIMALS))
    }
}

/// In-process aggregator used on the local devnet and in tests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockPriceFeed {
    address: OracleRef,
    pub decimals: u8,
    pub answer: i128,
    pub round_id: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub offline: bool,
}

impl MockPriceFeed {
    pub fn new(address: impl Into<OracleRef>, decimals: u8, initial_answer: i128) -> Self {
        Self {
            address: address.into(),
            decimals,
            answer: initial_answer,
            round_id: 1,
            updated_at: 0,
            offline: false,
        }
    }

    pub fn update_answer(&mut self, answer: i128, timestamp: u64) {
        self.answer = answer;
        self.round_id += 1;
        self.updated_at = timestamp;
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }
}

impl PriceFeed for MockPriceFeed {
    fn address(&self) -> &OracleRef {
        &self.address
    }

    fn latest_price(&self) -> Result<PriceData, OracleError> {
        if self.offline {
            return Err(OracleError::Unreachable {
                feed: self.address.clone(),
                reason: "feed offline".into(),
            });
        }
        Ok(PriceData {
            round_id: self.round_id,
            answer: self.answer,
            decimals: self.decimals,
            updated_at: self.updated_at,
        })
    }
}

/// `(a * b) / c` with a 256-bit intermediate product.
fn mul_div(a: u128, b: u128, c: u128) -> Result<u128, OracleError> {
    if c == 0 {
        return Err(OracleError::Overflow);
    }
    let (hi, lo) = widening_mul(a, b);
    div_wide(hi, lo, c)
}

fn widening_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = 0xFFFF_FFFF_FFFF_FFFF;
    let (a_lo, a_hi) = (a & MASK, a >> 64);
    let (b_lo, b_hi) = (b & MASK, b >> 64);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let (mid, mid_carry) = lh.overflowing_add(hl);
    let (lo, lo_carry) = ll.overflowing_add(mid << 64);

    let hi = hh
        .wrapping_add(mid >> 64)
        .wrapping_add(if mid_carry { 1u128 << 64 } else { 0 })
        .wrapping_add(u128::from(lo_carry));
    (hi, lo)
}

fn div_wide(hi: u128, lo: u128, divisor: u128) -> Result<u128, OracleError> {
    if hi == 0 {
        return Ok(lo / divisor);
    }
    if hi >= divisor {
        return Err(OracleError::Overflow);
    }

    // rem < divisor holds at the top of every iteration
    let mut rem = hi;
    let mut quotient = 0u128;
    for i in (0u32..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> i) & 1);
        quotient <<= 1;
        if carry > 0 || rem >= divisor {
            rem = rem.wrapping_sub(divisor);
            quotient |= 1;
        }
    }
    Ok(quotient)
}
