//! Loading a whole manifest on a bounded worker pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::unbounded;

use super::{LoadError, LoadResult, Loader};
use crate::descriptor::Descriptor;

/// Upper bound for the default worker count.
const MAX_DEFAULT_JOBS: usize = 16;

/// Worker count used when none is configured.
pub fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_JOBS)
}

/// Shared flag that stops a batch from starting more work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Results of a batch, in manifest order; unknown filter names come last.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<LoadResult>,
}

impl BatchReport {
    pub fn get(&self, name: &str) -> Option<&LoadResult> {
        self.results.iter().find(|r| r.package_name == name)
    }

    pub fn successes(&self) -> impl Iterator<Item = &LoadResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &LoadResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True when every entry loaded.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(LoadResult::is_success)
    }

    pub fn into_map(self) -> BTreeMap<String, LoadResult> {
        self.results
            .into_iter()
            .map(|r| (r.package_name.clone(), r))
            .collect()
    }
}

/// Runs a [`Loader`] over many descriptors.
pub struct BatchLoader {
    loader: Loader,
    jobs: usize,
    cancel: CancelToken,
}

impl BatchLoader {
    pub fn new(loader: Loader) -> Self {
        Self {
            loader,
            jobs: default_jobs(),
            cancel: CancelToken::new(),
        }
    }

    /// Number of worker threads (at least one).
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn run_one(&self, descriptor: &Descriptor, clean: bool) -> LoadResult {
        let package_name = descriptor.package_name.clone();
        if self.cancel.is_cancelled() {
            return LoadResult {
                outcome: Err(LoadError::Cancelled {
                    package: package_name.clone(),
                }),
                package_name,
            };
        }
        if clean {
            if let Err(err) = self.loader.clean_target(descriptor) {
                return LoadResult {
                    package_name,
                    outcome: Err(err),
                };
            }
        }
        self.loader.load_result(descriptor)
    }

    /// Load `descriptors`, or only those named in `filter`.
    ///
    /// Failures do not stop the batch. With `clean`, each target is deleted
    /// just before its descriptor loads.
    pub fn load_all(
        &self,
        descriptors: &[Descriptor],
        filter: Option<&[String]>,
        clean: bool,
    ) -> BatchReport {
        let (selected, unknown): (Vec<usize>, Vec<String>) = match filter {
            Some(names) => {
                let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
                let known: HashSet<&str> = descriptors
                    .iter()
                    .map(|d| d.package_name.as_str())
                    .collect();
                let selected = descriptors
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| wanted.contains(d.package_name.as_str()))
                    .map(|(i, _)| i)
                    .collect();
                let mut seen = HashSet::new();
                let unknown = names
                    .iter()
                    .filter(|n| !known.contains(n.as_str()) && seen.insert(n.as_str()))
                    .cloned()
                    .collect();
                (selected, unknown)
            }
            None => ((0..descriptors.len()).collect(), Vec::new()),
        };

        let workers = self.jobs.min(selected.len()).max(1);
        log::info!(
            "Loading {} packages with {} workers",
            selected.len(),
            workers
        );

        let (job_tx, job_rx) = unbounded::<usize>();
        let (result_tx, result_rx) = unbounded::<(usize, LoadResult)>();
        for &index in &selected {
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        let result = self.run_one(&descriptors[index], clean);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<LoadResult>> = (0..descriptors.len()).map(|_| None).collect();
        for (index, result) in result_rx.try_iter() {
            slots[index] = Some(result);
        }

        let mut results: Vec<LoadResult> = selected
            .iter()
            .filter_map(|&index| slots[index].take())
            .collect();
        results.extend(unknown.into_iter().map(|name| LoadResult {
            package_name: name.clone(),
            outcome: Err(LoadError::UnknownPackage(name)),
        }));

        BatchReport { results }
    }
}
