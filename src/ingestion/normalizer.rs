use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::{FillRecord, OrderUpdate};
use crate::models::{PositionEffect, Side, SignalSource, TradeSignal};

use super::connector::RawMessage;

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedSignal {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("unrecognized side `{0}`")]
    UnknownSide(String),

    #[error("non-positive size {0}")]
    NonPositiveSize(Decimal),

    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),
}

// ---------------------------------------------------------------------------
// Bounded dedup set
// ---------------------------------------------------------------------------

/// Insertion-ordered set that forgets its oldest entries past `capacity`.
#[derive(Debug, Clone)]
pub struct DedupSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::with_capacity(capacity.min(1024)),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.members.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.members.insert(key.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// How much of one exchange order has already been turned into signals.
#[derive(Debug, Clone, Copy, Default)]
struct OrderProgress {
    total: Option<Decimal>,
    accounted: Decimal,
}

/// Turns raw leader fills and order updates into canonical [`TradeSignal`]s.
///
/// The same execution can arrive as a fill record, as an order update, or
/// both. Signals are keyed by exchange identifiers and each order keeps a
/// ledger of the size already signalled, so every filled unit is emitted
/// exactly once.
#[derive(Debug)]
pub struct SignalNormalizer {
    account_id: String,
    seen: DedupSet,
    orders: HashMap<String, OrderProgress>,
    order_log: VecDeque<String>,
    order_capacity: usize,
}

impl SignalNormalizer {
    pub fn new(account_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            account_id: account_id.into(),
            seen: DedupSet::new(capacity),
            orders: HashMap::new(),
            order_log: VecDeque::new(),
            order_capacity: capacity.max(1),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn processed_count(&self) -> usize {
        self.seen.len()
    }

    /// Forget every processed signal id and order ledger.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.orders.clear();
        self.order_log.clear();
    }

    /// Normalize, logging and dropping malformed records.
    pub fn normalize(&mut self, raw: &RawMessage) -> Option<TradeSignal> {
        match self.try_normalize(raw) {
            Ok(signal) => signal,
            Err(e) => {
                counter!("signals_malformed_total").increment(1);
                tracing::warn!(account = %self.account_id, error = %e, raw = ?raw, "Dropping malformed leader record");
                None
            }
        }
    }

    /// `Ok(None)` means the record carries no new trade: a duplicate, a
    /// non-fill order update, a position record, or a fill already covered.
    pub fn try_normalize(&mut self, raw: &RawMessage) -> Result<Option<TradeSignal>, MalformedSignal> {
        match raw {
            RawMessage::Fill(fill) => self.from_fill(fill),
            RawMessage::Order(update) => self.from_order(update),
            RawMessage::Position(_) | RawMessage::PositionSnapshot(_) => Ok(None),
        }
    }

    fn from_fill(&mut self, fill: &FillRecord) -> Result<Option<TradeSignal>, MalformedSignal> {
        let symbol = fill.symbol().ok_or(MalformedSignal::MissingField("product_symbol"))?;
        let side = parse_side(fill.side.as_deref())?;
        let size = positive_size(fill.size)?;
        let price = positive_price(fill.price)?;

        let signal_id = match (&fill.id, &fill.order_id) {
            (Some(id), _) => format!("fill:{id}"),
            (None, Some(order_id)) => {
                format!("fill:{order_id}:{}:{size}", fill.time().unwrap_or("-"))
            }
            (None, None) => return Err(MalformedSignal::MissingField("id")),
        };

        if self.is_duplicate(&signal_id) {
            return Ok(None);
        }

        if let Some(order_id) = fill.order_id.as_deref() {
            let progress = self.orders.get(order_id).copied().unwrap_or_default();
            if progress.total.is_some_and(|total| progress.accounted + size > total) {
                tracing::debug!(signal_id = %signal_id, order_id, "Fill already covered by order update");
                self.seen.insert(&signal_id);
                return Ok(None);
            }
            self.record_progress(
                order_id,
                OrderProgress {
                    total: progress.total,
                    accounted: progress.accounted + size,
                },
            );
        }

        self.seen.insert(&signal_id);
        Ok(Some(self.signal(signal_id, symbol, side, size, price, fill.reduce_only, SignalSource::Fill)))
    }

    fn from_order(&mut self, update: &OrderUpdate) -> Result<Option<TradeSignal>, MalformedSignal> {
        if !is_fill_update(update) {
            return Ok(None);
        }

        let order_id = update.order_ref().ok_or(MalformedSignal::MissingField("order_id"))?;
        let symbol = update.symbol().ok_or(MalformedSignal::MissingField("symbol"))?;
        let side = parse_side(update.side.as_deref())?;
        let total = positive_size(update.size)?;
        let price = positive_price(update.fill_price())?;

        let unfilled = update.unfilled_size.unwrap_or(Decimal::ZERO).max(Decimal::ZERO);
        let cumulative = (total - unfilled).max(Decimal::ZERO);
        if cumulative.is_zero() {
            return Ok(None);
        }

        let signal_id = format!("order:{order_id}:{cumulative}");
        if self.is_duplicate(&signal_id) {
            return Ok(None);
        }

        let progress = self.orders.get(order_id).copied().unwrap_or_default();
        let delta = cumulative - progress.accounted;
        self.record_progress(
            order_id,
            OrderProgress {
                total: Some(total),
                accounted: progress.accounted.max(cumulative),
            },
        );
        self.seen.insert(&signal_id);

        if delta <= Decimal::ZERO {
            tracing::debug!(signal_id = %signal_id, "Order fill already covered by fill records");
            return Ok(None);
        }

        Ok(Some(self.signal(
            signal_id,
            symbol,
            side,
            delta,
            price,
            update.reduce_only,
            SignalSource::OrderUpdate,
        )))
    }

    fn is_duplicate(&self, signal_id: &str) -> bool {
        if self.seen.contains(signal_id) {
            counter!("signals_duplicate_total").increment(1);
            tracing::debug!(account = %self.account_id, signal_id, "Duplicate signal suppressed");
            true
        } else {
            false
        }
    }

    fn record_progress(&mut self, order_id: &str, progress: OrderProgress) {
        if self.orders.insert(order_id.to_string(), progress).is_none() {
            self.order_log.push_back(order_id.to_string());
            if self.order_log.len() > self.order_capacity {
                if let Some(oldest) = self.order_log.pop_front() {
                    self.orders.remove(&oldest);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn signal(
        &self,
        signal_id: String,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        reduce_only: bool,
        source: SignalSource,
    ) -> TradeSignal {
        TradeSignal {
            signal_id,
            account_id: self.account_id.clone(),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            reduce_only,
            effect: PositionEffect::Open,
            source,
            observed_at: Utc::now(),
        }
    }
}

/// Order updates only matter once they report filled quantity.
fn is_fill_update(update: &OrderUpdate) -> bool {
    let action_ok = update
        .action
        .as_deref()
        .map_or(true, |a| matches!(a, "create" | "update" | "fill"));
    let filled = update.reason.as_deref() == Some("fill")
        || matches!(
            update.status.as_deref(),
            Some("filled") | Some("partially_filled")
        );
    action_ok && filled
}

fn parse_side(side: Option<&str>) -> Result<Side, MalformedSignal> {
    let raw = side.ok_or(MalformedSignal::MissingField("side"))?;
    Side::from_api_str(raw).ok_or_else(|| MalformedSignal::UnknownSide(raw.to_string()))
}

fn positive_size(size: Option<Decimal>) -> Result<Decimal, MalformedSignal> {
    let size = size.ok_or(MalformedSignal::MissingField("size"))?;
    if size <= Decimal::ZERO {
        return Err(MalformedSignal::NonPositiveSize(size));
    }
    Ok(size)
}

fn positive_price(price: Option<Decimal>) -> Result<Decimal, MalformedSignal> {
    let price = price.ok_or(MalformedSignal::MissingField("price"))?;
    if price <= Decimal::ZERO {
        return Err(MalformedSignal::NonPositivePrice(price));
    }
    Ok(price)
}
