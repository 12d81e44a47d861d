use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};

use crate::catalog::Catalog;
use crate::config::DEFAULT_MAX_RETRIES;
use crate::domain::Analysis;
use crate::unit::AnnotationUnit;

/// FIFO of pending annotation work. `put` may be called from any thread;
/// the orchestrator is the single consumer.
#[derive(Debug, Clone)]
pub struct AnnotationQueue {
    sender: Sender<AnnotationUnit>,
    receiver: Receiver<AnnotationUnit>,
}

impl Default for AnnotationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn put(&self, unit: AnnotationUnit) {
        // The queue holds its own receiver, so the channel is never disconnected.
        let _ = self.sender.send(unit);
    }

    /// Blocks until a unit is available.
    pub fn get(&self) -> Option<AnnotationUnit> {
        self.receiver.recv().ok()
    }

    pub fn try_get(&self) -> Option<AnnotationUnit> {
        match self.receiver.try_recv() {
            Ok(unit) => Some(unit),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn receiver(&self) -> &Receiver<AnnotationUnit> {
        &self.receiver
    }
}

/// Queues one unit per distinct genomic unit of the analysis and catalog
/// dataset of the matching type.
pub fn seed(analysis: &Analysis, catalog: &Catalog) -> AnnotationQueue {
    seed_with_retry_limit(analysis, catalog, DEFAULT_MAX_RETRIES)
}

pub fn seed_with_retry_limit(
    analysis: &Analysis,
    catalog: &Catalog,
    retry_limit: u32,
) -> AnnotationQueue {
    let queue = AnnotationQueue::new();
    for genomic_unit in analysis.distinct_units() {
        for dataset in catalog.for_unit_type(genomic_unit.unit_type) {
            let unit = AnnotationUnit::new(
                genomic_unit.clone(),
                dataset.clone(),
                analysis.name.clone(),
            )
            .with_retry_limit(retry_limit);
            queue.put(unit);
        }
    }
    tracing::info!(
        analysis = %analysis.name,
        units = queue.len(),
        "seeded annotation queue"
    );
    queue
}
