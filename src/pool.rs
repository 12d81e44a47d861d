use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::Value;

use crate::client::{CommandRunner, HttpFetcher};
use crate::error::AnnotatorError;
use crate::task::{AnnotationTask, TaskContext};

/// A finished `annotate` call, handed back to the control thread.
#[derive(Debug)]
pub struct Completion {
    pub task: AnnotationTask,
    pub result: Result<Value, AnnotatorError>,
}

/// Fixed set of threads running blocking `annotate` calls. Workers only
/// report results; they never touch scheduler state.
pub struct WorkerPool {
    jobs: Option<Sender<AnnotationTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<H, C>(
        size: usize,
        ctx: Arc<TaskContext<H, C>>,
    ) -> Result<(Self, Receiver<Completion>), AnnotatorError>
    where
        H: HttpFetcher + 'static,
        C: CommandRunner + 'static,
    {
        if size == 0 {
            return Err(AnnotatorError::WorkerPool(
                "at least one worker is required".to_string(),
            ));
        }
        let (job_tx, job_rx) = unbounded::<AnnotationTask>();
        let (done_tx, done_rx) = unbounded::<Completion>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("annotation-worker-{index}"))
                .spawn(move || run_worker(&jobs, &done, &ctx))
                .map_err(|err| AnnotatorError::WorkerPool(err.to_string()))?;
            workers.push(handle);
        }

        Ok((
            Self {
                jobs: Some(job_tx),
                workers,
            },
            done_rx,
        ))
    }

    pub fn submit(&self, task: AnnotationTask) -> Result<(), AnnotationTask> {
        match &self.jobs {
            Some(jobs) => jobs.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    /// Stops accepting work and waits for the workers to finish their
    /// current task.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("annotation worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker<H: HttpFetcher, C: CommandRunner>(
    jobs: &Receiver<AnnotationTask>,
    done: &Sender<Completion>,
    ctx: &TaskContext<H, C>,
) {
    for task in jobs.iter() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.annotate(ctx)))
            .unwrap_or_else(|_| Err(AnnotatorError::TaskPanicked(task.to_string())));
        if done.send(Completion { task, result }).is_err() {
            break;
        }
    }
}
