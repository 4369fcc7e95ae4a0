pub mod dispatcher;
pub mod order_executor;
pub mod position_sizer;
pub mod risk_manager;

pub use dispatcher::{CloseRequest, Dispatcher, DispatcherConfig, ExecutionJob, ExecutionQueueEntry};
pub use order_executor::{ExecutionError, OrderExecutor, RetryPolicy};
pub use position_sizer::{CopyMode, SizingRejection};
pub use risk_manager::{OrderRejection, RiskLimits, RiskViolation};
