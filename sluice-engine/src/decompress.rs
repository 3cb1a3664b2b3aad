use crate::context::StreamContext;
use crate::file_request::{FileRequest, ScratchBuffer};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Reservation of one slot in the decompression job ring. The slot is returned when the permit is
/// dropped, i.e. once the block it belongs to has been decompressed (or discarded).
pub(crate) struct RingPermit {
    slot_rx: Receiver<()>,
}

impl Drop for RingPermit {
    fn drop(&mut self) {
        let _ = self.slot_rx.try_recv();
    }
}

/// A range of compressed bytes waiting to be inflated. A block without scratch only carries the
/// `last` marker, it ends the decompress stage of a request whose read stopped early.
pub(crate) struct DecompressBlock {
    pub scratch: Option<Arc<ScratchBuffer>>,
    pub begin: usize,
    pub end: usize,
    pub last: bool,
    pub permit: Option<RingPermit>,
}

impl DecompressBlock {
    pub fn terminator() -> Self {
        DecompressBlock {
            scratch: None,
            begin: 0,
            end: 0,
            last: true,
            permit: None,
        }
    }
}

/// Handle IO threads use to feed blocks into the pipeline. Pushing is bounded by the job ring: once
/// every slot is taken, `acquire_permit` blocks until a block finishes.
#[derive(Clone)]
pub(crate) struct DecompressSender {
    job_tx: Sender<Arc<FileRequest>>,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
}

impl DecompressSender {
    pub fn new(ring_size: usize) -> (Self, Receiver<Arc<FileRequest>>) {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (slot_tx, slot_rx) = crossbeam_channel::bounded(ring_size.max(1));
        (
            DecompressSender {
                job_tx,
                slot_tx,
                slot_rx,
            },
            job_rx,
        )
    }

    pub fn acquire_permit(&self) -> RingPermit {
        if self.slot_tx.is_full() {
            profiling::scope!("Wait for decompression ring slot");
            log::trace!("Decompression ring is full, waiting for a slot");
        }

        // Can't disconnect, we hold a receiver
        let _ = self.slot_tx.send(());
        RingPermit {
            slot_rx: self.slot_rx.clone(),
        }
    }

    /// Queues the block on its request. A job is only scheduled if none is running for the
    /// request; the running one picks up the new block when it gets to it.
    pub fn push(
        &self,
        request: &Arc<FileRequest>,
        block: DecompressBlock,
    ) {
        if request.enqueue_decompress_block(block) {
            if self.job_tx.send(request.clone()).is_err() {
                log::warn!(
                    "Decompression pipeline is shut down, dropping job for {}",
                    request.path()
                );
            }
        }
    }

    pub fn in_flight_blocks(&self) -> usize {
        self.slot_tx.len()
    }
}

struct DecompressionWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DecompressionWorkerThread {
    fn new(
        job_rx: Receiver<Arc<FileRequest>>,
        ctx: StreamContext,
        thread_index: usize,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("Decompression Thread {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!(
                    "DecompressionWorkerThread {}",
                    thread_index
                ));
                loop {
                    crossbeam_channel::select! {
                        recv(job_rx) -> msg => {
                            match msg {
                                Ok(request) => request.run_decompress_chain(&ctx),
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            // IO threads are already stopped, finish whatever they queued so every
                            // request still completes
                            while let Ok(request) = job_rx.try_recv() {
                                request.run_decompress_chain(&ctx);
                            }
                            return;
                        }
                    }
                }
            })?;

        Ok(DecompressionWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

/// Worker threads running decompression jobs. Each job processes one request's queued blocks in
/// order, so at most one thread touches a given request's codec state at a time.
pub(crate) struct DecompressionPipeline {
    worker_threads: Vec<DecompressionWorkerThread>,
}

impl DecompressionPipeline {
    pub fn new(
        job_rx: Receiver<Arc<FileRequest>>,
        ctx: &StreamContext,
        thread_count: usize,
    ) -> std::io::Result<Self> {
        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count.max(1) {
            worker_threads.push(DecompressionWorkerThread::new(
                job_rx.clone(),
                ctx.clone(),
                thread_index,
            )?);
        }

        Ok(DecompressionPipeline { worker_threads })
    }

    pub fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Decompression thread panicked");
            }
        }
    }
}
