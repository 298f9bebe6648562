//! Transaction construction, fee estimation, submission and confirmation tracking

pub mod broadcaster;
pub mod builder;
pub mod fees;
pub mod monitor;
pub mod nonce;
pub mod utxo;

pub use broadcaster::{BroadcasterConfig, TransactionBroadcaster};
pub use builder::{BuildOverrides, TransferRequest};
pub use fees::{analyze_historical_fees, FeeOracle, FeeOracleConfig, FeeStatistics, OptimalFee};
pub use monitor::{MonitoringTask, StatusSource, TransactionMonitor};
pub use nonce::{NonceAllocator, NonceReservation};
pub use utxo::{FeePolicy, Selection, UtxoSelector};
