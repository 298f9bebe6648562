//! Fee estimation for every ledger family
//!
//! One base estimate is cached per ledger for a short validity window.
//! Priority tiers are derived from the cached base instead of re-querying.

use crate::chain::{to_u128, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::Ledger;
use crate::tx::builder::fee_units;
use crate::types::{FeeEstimate, Priority, TargetRate, UnsignedTransaction};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Confirmation targets queried on the UTXO ledger
pub const UTXO_TARGETS: [u16; 3] = [1, 3, 6];
/// Target whose answer is the base rate
const UTXO_BASE_TARGET: u16 = 3;
/// Largest block window a fee history may span
pub const MAX_HISTORY_WINDOW: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct FeeOracleConfig {
    pub ttl: Duration,
    /// Lamports per signature on the blockhash ledger
    pub fixed_fee: u128,
    /// Ceiling for account-ledger tiers, wei per gas
    pub max_fee_per_gas: Option<u128>,
    pub history_concurrency: usize,
    pub max_history_window: u64,
}

impl Default for FeeOracleConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            fixed_fee: 5_000,
            max_fee_per_gas: None,
            history_concurrency: 4,
            max_history_window: MAX_HISTORY_WINDOW,
        }
    }
}

/// Raw network answer, before priority scaling
#[derive(Debug, Clone, PartialEq)]
enum BaseFee {
    Account { base_fee: u128, priority_fee: u128 },
    Utxo { targets: Vec<TargetRate> },
    Fixed(u128),
}

#[derive(Debug, Clone)]
struct CachedFee {
    base: BaseFee,
    fetched_at: Instant,
    timestamp: DateTime<Utc>,
}

/// Absolute fee for a concrete transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimalFee {
    pub ledger: Ledger,
    pub priority: Priority,
    /// Per-unit rate of the chosen tier
    pub rate: u128,
    /// Rate times the transaction's fee units
    pub amount: u128,
}

/// Summary of a fee-rate sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeStatistics {
    pub sample_count: usize,
    pub mean: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    /// Median, rounded up to a whole unit
    pub recommended: u128,
}

/// Map a confirmation-time budget to a priority tier
pub fn priority_for_target(ledger: Ledger, target: Duration) -> Priority {
    let secs = target.as_secs();
    match ledger {
        Ledger::Account if secs <= 15 => Priority::High,
        Ledger::Account if secs <= 60 => Priority::Medium,
        Ledger::Utxo if secs <= 10 * 60 => Priority::High,
        Ledger::Utxo if secs <= 30 * 60 => Priority::Medium,
        Ledger::Blockhash => Priority::Medium,
        _ => Priority::Low,
    }
}

fn quartile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Mean, median and interquartile range of a fee-rate sample.
///
/// Fee distributions are right-skewed, so the recommendation is the median.
pub fn analyze_historical_fees(samples: &[u128]) -> PipelineResult<FeeStatistics> {
    if samples.is_empty() {
        return Err(PipelineError::EmptyFeeSample);
    }

    let mut sorted: Vec<f64> = samples.iter().map(|s| *s as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let median = quartile(&sorted, 0.5);
    let q1 = quartile(&sorted, 0.25);
    let q3 = quartile(&sorted, 0.75);

    Ok(FeeStatistics {
        sample_count: sorted.len(),
        mean,
        median,
        q1,
        q3,
        iqr: q3 - q1,
        recommended: median.ceil() as u128,
    })
}

type Slot = Arc<RwLock<Option<CachedFee>>>;

/// Fee oracle with one short-lived cache entry per ledger
pub struct FeeOracle {
    config: FeeOracleConfig,
    rpcs: HashMap<Ledger, Arc<dyn RpcService>>,
    cache: DashMap<Ledger, Slot>,
}

impl FeeOracle {
    pub fn new(config: FeeOracleConfig, rpcs: HashMap<Ledger, Arc<dyn RpcService>>) -> Self {
        Self {
            config,
            rpcs,
            cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &FeeOracleConfig {
        &self.config
    }

    fn rpc(&self, ledger: Ledger) -> PipelineResult<&Arc<dyn RpcService>> {
        self.rpcs
            .get(&ledger)
            .ok_or(PipelineError::LedgerNotConfigured { ledger })
    }

    fn slot(&self, ledger: Ledger) -> Slot {
        self.cache
            .entry(ledger)
            .or_insert_with(Default::default)
            .clone()
    }

    fn is_fresh(&self, cached: &CachedFee) -> bool {
        cached.fetched_at.elapsed() < self.config.ttl
    }

    async fn fetch_base(&self, ledger: Ledger) -> PipelineResult<BaseFee> {
        let query_error = |e: crate::chain::RpcError| PipelineError::FeeQuery {
            ledger,
            message: e.to_string(),
        };

        match ledger {
            Ledger::Account => {
                let data = self
                    .rpc(ledger)?
                    .account_fee_data()
                    .await
                    .map_err(query_error)?;
                Ok(BaseFee::Account {
                    base_fee: to_u128(data.base_fee).map_err(query_error)?,
                    priority_fee: to_u128(data.priority_fee).map_err(query_error)?,
                })
            }
            Ledger::Utxo => {
                let rpc = self.rpc(ledger)?;
                let rates = futures::future::try_join_all(
                    UTXO_TARGETS.iter().map(|target| rpc.fee_rate(*target)),
                )
                .await
                .map_err(query_error)?;

                let targets = UTXO_TARGETS
                    .iter()
                    .zip(rates)
                    .map(|(target_blocks, rate)| TargetRate {
                        target_blocks: *target_blocks,
                        rate: u128::from(rate),
                    })
                    .collect();
                Ok(BaseFee::Utxo { targets })
            }
            Ledger::Blockhash => Ok(BaseFee::Fixed(self.config.fixed_fee)),
        }
    }

    async fn base(&self, ledger: Ledger) -> PipelineResult<CachedFee> {
        let slot = self.slot(ledger);
        {
            let cached = slot.read().await;
            if let Some(cached) = cached.as_ref().filter(|c| self.is_fresh(c)) {
                crate::metrics::record_fee_cache(ledger, true);
                return Ok(cached.clone());
            }
        }

        let mut cached = slot.write().await;
        // Another caller may have refreshed while we waited
        if let Some(fresh) = cached.as_ref().filter(|c| self.is_fresh(c)) {
            crate::metrics::record_fee_cache(ledger, true);
            return Ok(fresh.clone());
        }

        crate::metrics::record_fee_cache(ledger, false);
        let base = self.fetch_base(ledger).await?;
        debug!("Fetched {} fee base: {:?}", ledger, base);

        let entry = CachedFee {
            base,
            fetched_at: Instant::now(),
            timestamp: Utc::now(),
        };
        *cached = Some(entry.clone());
        Ok(entry)
    }

    fn cap(&self, rate: u128) -> u128 {
        match self.config.max_fee_per_gas {
            Some(max) => rate.min(max),
            None => rate,
        }
    }

    /// Priority-adjusted tiers for a ledger
    pub async fn estimate(&self, ledger: Ledger, priority: Priority) -> PipelineResult<FeeEstimate> {
        let cached = self.base(ledger).await?;

        let estimate = match &cached.base {
            BaseFee::Account {
                base_fee,
                priority_fee,
            } => {
                let tier = |p: Priority| {
                    self.cap(base_fee.saturating_mul(2).saturating_add(p.scale(*priority_fee)))
                };
                FeeEstimate {
                    ledger,
                    priority,
                    low: tier(Priority::Low),
                    medium: tier(Priority::Medium),
                    high: tier(Priority::High),
                    base_fee: Some(*base_fee),
                    priority_fee: Some(self.cap(priority.scale(*priority_fee))),
                    targets: Vec::new(),
                    timestamp: cached.timestamp,
                }
            }
            BaseFee::Utxo { targets } => {
                let base = targets
                    .iter()
                    .find(|t| t.target_blocks == UTXO_BASE_TARGET)
                    .map(|t| t.rate)
                    .unwrap_or(1);
                let tier = |p: Priority| p.scale(base).max(1);
                FeeEstimate {
                    ledger,
                    priority,
                    low: tier(Priority::Low),
                    medium: tier(Priority::Medium),
                    high: tier(Priority::High),
                    base_fee: None,
                    priority_fee: None,
                    targets: targets.clone(),
                    timestamp: cached.timestamp,
                }
            }
            BaseFee::Fixed(fee) => FeeEstimate {
                ledger,
                priority,
                low: *fee,
                medium: *fee,
                high: *fee,
                base_fee: None,
                priority_fee: None,
                targets: Vec::new(),
                timestamp: cached.timestamp,
            },
        };

        Ok(estimate)
    }

    /// Drop the cached base so the next estimate queries the network
    pub async fn invalidate(&self, ledger: Ledger) {
        if let Some(slot) = self.cache.get(&ledger).map(|s| s.clone()) {
            *slot.write().await = None;
            info!("Fee cache invalidated for {}", ledger);
        }
    }

    /// Absolute fee for a transaction given a confirmation-time budget
    pub async fn calculate_optimal_fee(
        &self,
        transaction: &UnsignedTransaction,
        target: Duration,
    ) -> PipelineResult<OptimalFee> {
        let ledger = transaction.ledger();
        let priority = priority_for_target(ledger, target);
        let rate = self.estimate(ledger, priority).await?.rate();

        Ok(OptimalFee {
            ledger,
            priority,
            rate,
            amount: rate.saturating_mul(fee_units(transaction)),
        })
    }

    /// One fee-rate sample per block over the last `window` blocks, newest
    /// first. The tip is read once so every sample comes from the same range.
    pub async fn sample_fee_history(&self, ledger: Ledger, window: u64) -> PipelineResult<Vec<u128>> {
        if window == 0 || window > self.config.max_history_window {
            return Err(PipelineError::InvalidAmount {
                ledger,
                amount: u128::from(window),
                reason: format!(
                    "fee history window must be between 1 and {} blocks",
                    self.config.max_history_window
                ),
            });
        }

        if ledger == Ledger::Blockhash {
            return Ok(vec![self.config.fixed_fee; window as usize]);
        }

        let query_error = |e: crate::chain::RpcError| PipelineError::FeeQuery {
            ledger,
            message: e.to_string(),
        };

        let rpc = self.rpc(ledger)?.clone();
        let tip = rpc.latest_block().await.map_err(query_error)?;
        let heights: Vec<u64> = (0..window).map_while(|back| tip.checked_sub(back)).collect();

        let samples: Vec<u128> = stream::iter(heights)
            .map(|height| {
                let rpc = rpc.clone();
                async move { rpc.block_fee_rate(height).await }
            })
            .buffered(self.config.history_concurrency.max(1))
            .try_collect()
            .await
            .map_err(query_error)?;

        debug!("Sampled {} historical fee rates on {}", samples.len(), ledger);
        Ok(samples)
    }

    /// Sample recent blocks and summarise
    pub async fn historical_statistics(
        &self,
        ledger: Ledger,
        window: u64,
    ) -> PipelineResult<FeeStatistics> {
        let samples = self.sample_fee_history(ledger, window).await?;
        analyze_historical_fees(&samples)
    }
}
