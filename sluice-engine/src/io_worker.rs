use crate::context::StreamContext;
use crate::file_request::{FileRequest, ReadOutcome, RequestState};
use crossbeam_channel::{Receiver, Sender};
use sluice_base::{MediaType, StreamError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Default)]
struct WorkerQueues {
    // Requests added since the last scheduling pass
    staging: Vec<Arc<FileRequest>>,
    // Sorted by sort key descending, the next request to service is at the back
    pending: Vec<Arc<FileRequest>>,
    start_requested: bool,
    need_sort: bool,
}

/// The part of an IO worker other threads talk to: its queues, wake signal and pause state
pub(crate) struct IoWorkerShared {
    media_type: MediaType,
    queues: Mutex<WorkerQueues>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    paused: AtomicBool,
    current_key: AtomicU64,
    in_flight: Mutex<Option<Arc<FileRequest>>>,
    fallbacks: RwLock<Vec<Weak<IoWorkerShared>>>,
}

impl IoWorkerShared {
    pub fn new(media_type: MediaType) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Arc::new(IoWorkerShared {
            media_type,
            queues: Mutex::new(WorkerQueues::default()),
            wake_tx,
            wake_rx,
            paused: AtomicBool::new(false),
            current_key: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            fallbacks: RwLock::new(Vec::default()),
        })
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn wake(&self) {
        // A full channel means a wake is already pending
        let _ = self.wake_tx.try_send(());
    }

    /// Stages a request. Staged requests are merged into the pending queue on the next scheduling
    /// pass after work was signalled, either right away or by `signal_start_work`.
    pub fn add_request(
        &self,
        request: Arc<FileRequest>,
        start_immediately: bool,
    ) {
        request.set_state(RequestState::InQueue);
        {
            let mut queues = self.queues.lock().unwrap();
            queues.staging.push(request);
            if start_immediately {
                queues.start_requested = true;
            }
        }

        if start_immediately {
            self.wake();
        }
    }

    pub fn signal_start_work(
        &self,
        force: bool,
    ) {
        {
            let mut queues = self.queues.lock().unwrap();
            if !force && queues.staging.is_empty() {
                return;
            }
            queues.start_requested = true;
        }
        self.wake();
    }

    /// Priorities changed, re-sort before the next pick
    pub fn need_sorting(&self) {
        self.queues.lock().unwrap().need_sort = true;
        self.wake();
    }

    pub fn pause(
        &self,
        paused: bool,
    ) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            self.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Fails every queued request and the one being read. Queued requests are completed right
    /// away, the in-flight one stops at its next page.
    pub fn abort_all(
        &self,
        error: StreamError,
    ) {
        let aborted: Vec<_> = {
            let mut queues = self.queues.lock().unwrap();
            let mut aborted = std::mem::take(&mut queues.staging);
            aborted.append(&mut queues.pending);
            queues.start_requested = false;
            aborted
        };

        if !aborted.is_empty() {
            log::debug!(
                "Aborting {} queued requests on the {} IO thread: {}",
                aborted.len(),
                self.media_type.name(),
                error
            );
        }

        if let Some(in_flight) = &*self.in_flight.lock().unwrap() {
            in_flight.fail(error);
        }

        for request in &aborted {
            request.fail(error);
        }

        // Completing needs the context, hand them back to the thread
        if !aborted.is_empty() {
            let mut queues = self.queues.lock().unwrap();
            queues.pending.extend(aborted);
            queues.need_sort = true;
        }
        self.wake();
    }

    pub fn register_fallback(
        &self,
        fallback: &Arc<IoWorkerShared>,
    ) {
        self.fallbacks
            .write()
            .unwrap()
            .push(Arc::downgrade(fallback));
    }

    pub fn fallback_for(
        &self,
        media_type: MediaType,
    ) -> Option<Arc<IoWorkerShared>> {
        self.fallbacks
            .read()
            .unwrap()
            .iter()
            .filter_map(|fallback| fallback.upgrade())
            .find(|fallback| fallback.media_type == media_type)
    }

    /// True if an urgent request is waiting behind the one being read
    pub fn has_pending_urgent(&self) -> bool {
        let queues = self.queues.lock().unwrap();
        let pending_urgent = queues
            .pending
            .iter()
            .any(|request| request.priority().is_urgent() && !request.is_failed());
        let staged_urgent = queues.start_requested
            && queues
                .staging
                .iter()
                .any(|request| request.priority().is_urgent() && !request.is_failed());
        pending_urgent || staged_urgent
    }

    /// Removes and returns a queued request that may allocate past the temporary memory budget
    pub fn take_ignore_budget_request(&self) -> Option<Arc<FileRequest>> {
        let mut queues = self.queues.lock().unwrap();
        let index = queues
            .pending
            .iter()
            .rposition(|request| request.ignores_budget())?;
        Some(queues.pending.remove(index))
    }

    pub fn take_failed_request(&self) -> Option<Arc<FileRequest>> {
        let mut queues = self.queues.lock().unwrap();
        let index = queues
            .pending
            .iter()
            .position(|request| request.is_failed())?;
        Some(queues.pending.remove(index))
    }

    pub fn requeue(
        &self,
        request: Arc<FileRequest>,
    ) {
        request.set_state(RequestState::InQueue);
        let mut queues = self.queues.lock().unwrap();
        queues.pending.push(request);
        queues.need_sort = true;
    }

    /// Merges staged requests if work was signalled, re-sorts if needed and pops the request with
    /// the smallest sort key
    pub fn next_request(
        &self,
        grouping_period: Duration,
    ) -> Option<Arc<FileRequest>> {
        let mut queues = self.queues.lock().unwrap();
        let queues = &mut *queues;
        if queues.start_requested {
            queues.start_requested = false;
            if !queues.staging.is_empty() {
                queues.pending.append(&mut queues.staging);
                queues.need_sort = true;
            }
        }

        if queues.need_sort {
            profiling::scope!("IoWorker sort pending");
            // Relaxed view of the key in progress, a stale value only costs one extra sweep
            let current_key = self.current_key.load(Ordering::Relaxed);
            for request in &queues.pending {
                request.compute_sort_key(current_key, grouping_period);
            }
            queues.pending.sort_by(|a, b| {
                b.sort_key()
                    .cmp(&a.sort_key())
                    .then_with(|| b.id().cmp(&a.id()))
            });
            queues.need_sort = false;
        }

        queues.pending.pop()
    }

    pub fn pending_count(&self) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.pending.len() + queues.staging.len()
    }

    fn take_all(&self) -> Vec<Arc<FileRequest>> {
        let mut queues = self.queues.lock().unwrap();
        let mut requests = std::mem::take(&mut queues.staging);
        requests.append(&mut queues.pending);
        requests
    }
}

// State owned by the IO thread itself
struct IoWorkerThreadState {
    shared: Arc<IoWorkerShared>,
    ctx: StreamContext,
    temp_wake_rx: Receiver<()>,
}

impl IoWorkerThreadState {
    fn run(
        &self,
        finish_rx: Receiver<()>,
    ) {
        let grouping_period = self.ctx.config.request_grouping_time_period;
        loop {
            if finish_rx.try_recv().is_ok() {
                self.drain_on_exit();
                return;
            }

            // Failed requests only need completing, that is no IO and allowed while paused
            let request = if self.shared.is_paused() {
                self.shared.take_failed_request()
            } else {
                self.shared.next_request(grouping_period)
            };

            match request {
                Some(request) => self.process_request(request),
                None => {
                    crossbeam_channel::select! {
                        recv(self.shared.wake_rx) -> _msg => {},
                        recv(finish_rx) -> _msg => {
                            self.drain_on_exit();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn set_in_flight(
        &self,
        request: Option<Arc<FileRequest>>,
    ) {
        *self.shared.in_flight.lock().unwrap() = request;
    }

    fn process_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        profiling::scope!("IoWorker::process_request");
        self.shared
            .current_key
            .store(request.sort_key(), Ordering::Relaxed);
        self.set_in_flight(Some(request.clone()));
        self.read_request(request);
        self.set_in_flight(None);
    }

    fn read_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        if request.is_failed() {
            log::trace!(
                "{} failed while queued ({:?}), completing without reading",
                request.path(),
                request.state()
            );
            request.finish_read(&self.ctx);
            return;
        }

        request.set_state(RequestState::Reading);
        log::trace!(
            "{} IO thread reading {} (key {:016x})",
            self.shared.media_type.name(),
            request.path(),
            request.sort_key()
        );

        let mut file = match self.ctx.source.open_file(request.path()) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Could not open {}: {}", request.path(), e);
                request.fail(StreamError::CannotOpenFile);
                request.finish_read(&self.ctx);
                return;
            }
        };

        // The entry may live somewhere else than its path suggested
        let resident_media = file.media_type();
        if resident_media != self.shared.media_type && resident_media != MediaType::Unknown {
            if let Some(fallback) = self.shared.fallback_for(resident_media) {
                log::debug!(
                    "{} ({}): moving from the {} to the {} IO thread",
                    request.path(),
                    StreamError::Misscheduled,
                    self.shared.media_type.name(),
                    resident_media.name()
                );
                self.ctx.stats.rescheduled();
                request.set_media_type(resident_media);
                fallback.add_request(request, true);
                return;
            }
        }

        if let Err(error) = request.configure_read(file.metadata(), self.ctx.config.page_size) {
            request.fail(error);
            request.finish_read(&self.ctx);
            return;
        }

        match request.allocate_output(&self.ctx.temp_memory, self.ctx.codec.as_ref()) {
            Ok(()) => request.set_out_of_budget(false),
            Err(StreamError::OutOfMemory) => {
                self.handle_out_of_memory(request);
                return;
            }
            Err(error) => {
                request.fail(error);
                request.finish_read(&self.ctx);
                return;
            }
        }

        let shared = &self.shared;
        let outcome = request.read_file_in_pages(&mut *file, &self.ctx, &|| {
            shared.has_pending_urgent()
        });

        match outcome {
            ReadOutcome::Finished => request.finish_read(&self.ctx),
            ReadOutcome::Failed(error) => {
                request.fail(error);
                request.finish_read(&self.ctx);
            }
            ReadOutcome::Preempted => {
                log::debug!(
                    "{} ({}) yields to an urgent request",
                    request.path(),
                    StreamError::Preempted
                );
                self.ctx.stats.preempted();
                request.preempt();
                self.shared.requeue(request);
            }
        }
    }

    fn handle_out_of_memory(
        &self,
        request: Arc<FileRequest>,
    ) {
        if !request.is_out_of_budget() {
            log::debug!(
                "{} ({}): {} of {} bytes of temporary memory in use, waiting",
                request.path(),
                StreamError::OutOfMemory,
                self.ctx.temp_memory.allocated(),
                self.ctx.temp_memory.budget()
            );
            request.set_out_of_budget(true);
            self.ctx.stats.out_of_budget();
        }
        self.shared.requeue(request);

        if let Some(ignore_budget) = self.shared.take_ignore_budget_request() {
            self.process_request(ignore_budget);
            return;
        }

        crossbeam_channel::select! {
            recv(self.temp_wake_rx) -> _msg => {},
            // New work is picked up by the next scheduling pass
            recv(self.shared.wake_rx) -> _msg => {},
            default(self.ctx.config.out_of_budget_retry) => {},
        }
    }

    fn drain_on_exit(&self) {
        let requests = self.shared.take_all();
        if !requests.is_empty() {
            log::debug!(
                "{} IO thread shutting down with {} requests queued",
                self.shared.media_type.name(),
                requests.len()
            );
        }

        for request in requests {
            request.fail(StreamError::AbortedOnShutdown);
            request.finish_read(&self.ctx);
        }
    }
}

/// Thread servicing every request for one storage medium, one request at a time in sort key order
pub(crate) struct IoWorker {
    shared: Arc<IoWorkerShared>,
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl IoWorker {
    pub fn new(
        shared: Arc<IoWorkerShared>,
        ctx: StreamContext,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let state = IoWorkerThreadState {
            shared: shared.clone(),
            temp_wake_rx: ctx.temp_memory.register_wake_event(),
            ctx,
        };

        let media_type = shared.media_type;
        let join_handle = std::thread::Builder::new()
            .name(format!("IO Thread ({})", media_type.name()))
            .spawn(move || {
                profiling::register_thread!(&format!("IoWorker {}", media_type.name()));
                state.run(finish_rx);
            })?;

        Ok(IoWorker {
            shared,
            finish_tx,
            join_handle,
        })
    }

    pub fn finish(self) {
        let _ = self.finish_tx.send(());
        if self.join_handle.join().is_err() {
            log::error!("{} IO thread panicked", self.shared.media_type.name());
        }
    }
}
