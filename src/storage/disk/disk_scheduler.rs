use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::common::{GraniteError, PageId, Result, PAGE_SIZE};

use super::DiskManager;

/// A disk request with its own page image. Reads hand a fresh image back
/// through the reply channel; writes own theirs outright, so a write can
/// be queued without waiting for it to land.
enum DiskCommand {
    Read {
        page_id: PageId,
        reply: mpsc::Sender<Result<Box<[u8; PAGE_SIZE]>>>,
    },
    Write {
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
        reply: Option<mpsc::Sender<Result<()>>>,
    },
}

/// DiskScheduler funnels all page I/O through one background worker.
///
/// Commands are processed strictly in queue order, which is what makes the
/// fire-and-forget write path safe: a read of a page queued after its
/// write always observes the written image. Dropping the scheduler closes
/// the queue; the worker drains whatever is still pending and exits.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Command queue feeding the worker; closed on drop
    command_sender: Option<Sender<DiskCommand>>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler over the given DiskManager and spawns
    /// its worker thread.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskCommand>(128);

        let dm = Arc::clone(&disk_manager);
        let worker_handle = thread::spawn(move || Self::run_worker(dm, receiver));

        Self {
            disk_manager,
            command_sender: Some(sender),
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a page write without waiting for it to land. The eviction
    /// path uses this: ordering against later reads of the same page is
    /// guaranteed by the queue.
    pub fn schedule_write(&self, page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<()> {
        self.send(DiskCommand::Write {
            page_id,
            data,
            reply: None,
        })
    }

    /// Writes a page and waits until it is on disk.
    pub fn write_page_sync(&self, page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskCommand::Write {
            page_id,
            data,
            reply: Some(tx),
        })?;
        rx.recv()
            .map_err(|e| GraniteError::Channel(format!("write completion lost: {}", e)))?
    }

    /// Reads a page, waiting for its image.
    pub fn read_page_sync(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskCommand::Read { page_id, reply: tx })?;
        rx.recv()
            .map_err(|e| GraniteError::Channel(format!("read completion lost: {}", e)))?
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn send(&self, command: DiskCommand) -> Result<()> {
        let sender = self
            .command_sender
            .as_ref()
            .ok_or_else(|| GraniteError::DiskScheduler("scheduler is shut down".to_string()))?;
        sender
            .send(command)
            .map_err(|e| GraniteError::DiskScheduler(format!("failed to queue request: {}", e)))
    }

    /// Worker loop: runs until every sender is gone. Commands still queued
    /// when the channel closes are processed before the thread exits.
    fn run_worker(disk_manager: Arc<DiskManager>, receiver: Receiver<DiskCommand>) {
        while let Ok(command) = receiver.recv() {
            match command {
                DiskCommand::Read { page_id, reply } => {
                    let mut data = Box::new([0u8; PAGE_SIZE]);
                    let result = disk_manager
                        .read_page(page_id, &mut data[..])
                        .map(|()| data);
                    let _ = reply.send(result);
                }
                DiskCommand::Write {
                    page_id,
                    data,
                    reply,
                } => {
                    let result = disk_manager.write_page(page_id, &data[..]);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                tracing::warn!(page = %page_id, %err, "background page write failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        self.command_sender.take();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
