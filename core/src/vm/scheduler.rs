use std::collections::VecDeque;

use anyhow::Result;
use tracing::debug;

use super::Vm;
use super::engine::{Job, Outcome};

/// Result of one job run under a [`Scheduler`].
#[derive(Debug)]
pub struct JobReport {
    pub id: usize,
    pub outcome: Result<Outcome>,
    /// Bounded slices the job took.
    pub slices: usize,
}

/// Round-robins jobs over one VM in bounded slices. Each job keeps its own
/// frame stack; the heap and globals are shared.
pub struct Scheduler {
    queue: VecDeque<(usize, Job, usize)>,
    slice: u64,
    next_id: usize,
}

impl Scheduler {
    pub fn new(slice: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            slice: slice.max(1),
            next_id: 0,
        }
    }

    /// Queue a job that has been given its entry call. Returns its id.
    pub fn spawn(&mut self, job: Job) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back((id, job, 0));
        id
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run until every job finished. An uncaught error ends only the job that
    /// raised it.
    pub fn run(&mut self, vm: &mut Vm) -> Vec<JobReport> {
        let mut reports = Vec::new();
        while let Some((id, mut job, slices)) = self.queue.pop_front() {
            let outcome = job.run_bounded(vm, self.slice);
            let slices = slices + 1;
            match outcome {
                Ok(Outcome::Halted) => self.queue.push_back((id, job, slices)),
                outcome => {
                    debug!(target: "ember::vm::engine", job = id, slices, ok = outcome.is_ok(), "job finished");
                    reports.push(JobReport { id, outcome, slices });
                }
            }
        }
        reports
    }
}
