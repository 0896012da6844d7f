//! Batch execution results

/// An item whose operation succeeded, with its result
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSuccess<I, R> {
    pub item: I,
    pub result: R,
}

/// An item whose operation failed.
///
/// Always captured inside [`BatchResult`]; never propagated past the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemError<I, E> {
    pub item: I,
    pub error: E,
}

/// Aggregated outcome of a batch run.
///
/// `successful.len() + failed.len() == total` always holds. Entries follow
/// chunk processing order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<I, R, E> {
    pub successful: Vec<BatchSuccess<I, R>>,
    pub failed: Vec<BatchItemError<I, E>>,
    pub total: usize,
}

impl<I, R, E> BatchResult<I, R, E> {
    /// Empty result sized for `total` items
    pub fn with_total(total: usize) -> Self {
        Self {
            successful: Vec::with_capacity(total),
            failed: Vec::new(),
            total,
        }
    }

    pub fn record_success(&mut self, item: I, result: R) {
        self.successful.push(BatchSuccess { item, result });
    }

    pub fn record_failure(&mut self, item: I, error: E) {
        self.failed.push(BatchItemError { item, error });
    }

    /// Number of items settled so far
    pub fn processed(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.processed() == self.total
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Fraction of successful items (1.0 for an empty batch)
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successful.len() as f64 / self.total as f64
        }
    }
}
