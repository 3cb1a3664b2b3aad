use crate::file_request::{FileRequest, RequestStatePool};
use crate::listener::ListenerSlot;
use crate::read_stream::ReadStream;
use crossbeam_channel::{Receiver, Sender};
use sluice_base::StreamTaskType;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Task types are spread over the completion queues so a flood of one type doesn't hold up the
/// callbacks of the others. Queue 0 doubles as the overflow queue.
pub(crate) fn completion_queue_index(
    task_type: StreamTaskType,
    queue_count: usize,
) -> usize {
    let index = task_type.index() + 1;
    if index < queue_count {
        index
    } else {
        0
    }
}

/// Handle the pipeline stages use to report finished requests
#[derive(Clone)]
pub(crate) struct CompletionSender {
    queues: Vec<Sender<Arc<FileRequest>>>,
}

impl CompletionSender {
    pub fn new(queue_count: usize) -> (Self, Vec<Receiver<Arc<FileRequest>>>) {
        let mut queues = Vec::with_capacity(queue_count);
        let mut receivers = Vec::with_capacity(queue_count);
        for _ in 0..queue_count.max(1) {
            let (tx, rx) = crossbeam_channel::unbounded();
            queues.push(tx);
            receivers.push(rx);
        }

        (CompletionSender { queues }, receivers)
    }

    pub fn report(
        &self,
        request: Arc<FileRequest>,
    ) {
        let index = completion_queue_index(request.task_type(), self.queues.len());
        if let Err(e) = self.queues[index].send(request) {
            log::warn!(
                "Completion queue {} is shut down, dropping request {}",
                index,
                e.0.path()
            );
        }
    }
}

/// Streams whose async phase ran and that wait for the main thread phase
#[derive(Default)]
pub(crate) struct FinishedQueue {
    streams: Mutex<VecDeque<ReadStream>>,
}

impl FinishedQueue {
    pub fn push(
        &self,
        stream: ReadStream,
    ) {
        self.streams.lock().unwrap().push_back(stream);
    }

    pub fn take_all(&self) -> VecDeque<ReadStream> {
        std::mem::take(&mut *self.streams.lock().unwrap())
    }

    /// Puts streams that weren't processed this frame back in front, keeping their order
    pub fn requeue_front(
        &self,
        deferred: VecDeque<ReadStream>,
    ) {
        if deferred.is_empty() {
            return;
        }

        let mut streams = self.streams.lock().unwrap();
        let mut merged = deferred;
        merged.append(&mut *streams);
        *streams = merged;
    }

    pub fn remove(
        &self,
        stream_id: u64,
    ) {
        self.streams
            .lock()
            .unwrap()
            .retain(|stream| stream.id() != stream_id);
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().unwrap().is_empty()
    }
}

struct CompletionState {
    finished: Arc<FinishedQueue>,
    request_pool: Arc<RequestStatePool>,
    listener: ListenerSlot,
}

impl CompletionState {
    fn deliver(
        &self,
        request: Arc<FileRequest>,
    ) {
        profiling::scope!("CompletionDispatcher::deliver");
        if let Some(stream) = request.stream() {
            let listener = self.listener.read().unwrap().clone();
            if let Some(listener) = &listener {
                listener.on_stream_begin_async_callback(stream);
            }

            stream.on_request_complete(request.take_result());

            if let Some(listener) = &listener {
                listener.on_stream_end_async_callback(stream);
            }

            if !stream.is_sync_executed() {
                self.finished.push(stream.clone());
            }
        }

        request.finalize(&self.request_pool);
    }
}

struct CompletionWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl CompletionWorkerThread {
    fn new(
        queue_rx: Receiver<Arc<FileRequest>>,
        state: Arc<CompletionState>,
        thread_index: usize,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("Completion Thread {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("CompletionWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(queue_rx) -> msg => {
                            match msg {
                                Ok(request) => state.deliver(request),
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            while let Ok(request) = queue_rx.try_recv() {
                                state.deliver(request);
                            }
                            return;
                        }
                    }
                }
            })?;

        Ok(CompletionWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

/// One thread per completion queue. Runs the async phase of finished streams and queues them for
/// the main thread phase.
pub(crate) struct CompletionDispatcher {
    worker_threads: Vec<CompletionWorkerThread>,
}

impl CompletionDispatcher {
    pub fn new(
        receivers: Vec<Receiver<Arc<FileRequest>>>,
        finished: Arc<FinishedQueue>,
        request_pool: Arc<RequestStatePool>,
        listener: ListenerSlot,
    ) -> std::io::Result<Self> {
        let state = Arc::new(CompletionState {
            finished,
            request_pool,
            listener,
        });

        let mut worker_threads = Vec::with_capacity(receivers.len());
        for (thread_index, queue_rx) in receivers.into_iter().enumerate() {
            worker_threads.push(CompletionWorkerThread::new(
                queue_rx,
                state.clone(),
                thread_index,
            )?);
        }

        Ok(CompletionDispatcher { worker_threads })
    }

    pub fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Completion thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_index_wraps_to_overflow_queue() {
        assert_eq!(completion_queue_index(StreamTaskType::Texture, 1), 0);
        assert_eq!(completion_queue_index(StreamTaskType::ALL[0], 2), 1);
        assert_eq!(completion_queue_index(StreamTaskType::ALL[1], 2), 0);
        for task_type in StreamTaskType::ALL.iter() {
            let index = completion_queue_index(*task_type, StreamTaskType::COUNT + 1);
            assert_eq!(index, task_type.index() + 1);
        }
    }
}
