//! Background thread that mirrors the in-memory records to durable storage.
//!
//! The writer exclusively owns the [`DurableStorage`] handle. Callers never touch the disk: they
//! mutate [`Memory`] and then send a message. When the writer wakes up it drains every queued
//! message and writes a single snapshot of memory *as of now*, so the last mutation by call time
//! always wins and bursts of saves collapse into one write.
//!
//! Whether a write is owed is tracked by a shared `dirty` flag rather than by the messages, so a
//! message dropped on a full queue never loses a write: callers raise the flag before sending and
//! the writer clears it right before taking its snapshot.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc,
    },
    thread::JoinHandle,
};

use super::{memory::Memory, schema, storage::DurableStorage, StickyKey};
use crate::{Error, Result};

pub(crate) enum WriterMessage {
    /// Wake up and write. `restore` lists removed records to put back if the write fails.
    Persist { restore: Vec<(StickyKey, String)> },
    /// Reply once everything sent before has been written.
    Flush(SyncSender<Result<()>>),
}

pub(crate) struct Writer {
    sender: Option<SyncSender<WriterMessage>>,
    /// Memory changed since the writer last took a snapshot.
    dirty: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Writer {
    pub fn start(
        storage: Box<dyn DurableStorage>,
        storage_key: String,
        memory: Arc<Memory>,
        queue_capacity: usize,
    ) -> std::io::Result<Writer> {
        // A rendezvous channel would drop coalesced writes: `Full` must mean a message is queued.
        let (sender, receiver) = mpsc::sync_channel(queue_capacity.max(1));
        let dirty = Arc::new(AtomicBool::new(false));

        let join_handle = std::thread::Builder::new()
            .name("sticky-bucketing-writer".to_owned())
            .spawn({
                let dirty = dirty.clone();
                move || {
                    let mut worker = Worker {
                        storage,
                        storage_key,
                        memory,
                        dirty,
                        restore: Vec::new(),
                        last_result: Ok(()),
                    };
                    worker.run(receiver);
                    log::debug!(target: "sticky_bucketing", "writer thread stopped");
                }
            })?;

        Ok(Writer {
            sender: Some(sender),
            dirty,
            join_handle: Some(join_handle),
        })
    }

    /// Schedule a write of the current memory. Never blocks.
    ///
    /// A full queue is fine: the writer still has a queued message to process, and it checks
    /// `dirty` after every batch.
    pub fn schedule(&self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::WriterStopped)?;
        self.dirty.store(true, Ordering::SeqCst);
        match sender.try_send(WriterMessage::Persist {
            restore: Vec::new(),
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::trace!(target: "sticky_bucketing", "writer queue is full, coalescing write");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::WriterStopped),
        }
    }

    /// Schedule a write after a removal. Blocks while the queue is full, as the restore
    /// information must reach the writer.
    pub fn schedule_removal(&self, restore: Vec<(StickyKey, String)>) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::WriterStopped)?;
        self.dirty.store(true, Ordering::SeqCst);
        sender
            .send(WriterMessage::Persist { restore })
            .map_err(|_| Error::WriterStopped)
    }

    /// Block until every mutation scheduled so far is written.
    pub fn flush(&self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::WriterStopped)?;
        let (ack_sender, ack_receiver) = mpsc::sync_channel(1);
        sender
            .send(WriterMessage::Flush(ack_sender))
            .map_err(|_| Error::WriterStopped)?;
        ack_receiver.recv().map_err(|_| Error::WriterStopped)?
    }

    /// Stop accepting messages, let the writer drain its queue, and wait for it to exit.
    pub fn shutdown(&mut self) -> Result<()> {
        // Dropping the only sender disconnects the channel. The writer sees that after it has
        // received every queued message.
        self.sender.take();

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.join().map_err(|_| Error::WriterPanicked)?;
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!(target: "sticky_bucketing", "failed to stop writer thread: {err}");
        }
    }
}

struct Worker {
    storage: Box<dyn DurableStorage>,
    storage_key: String,
    memory: Arc<Memory>,
    dirty: Arc<AtomicBool>,
    /// Removed records whose removal hasn't been written yet.
    restore: Vec<(StickyKey, String)>,
    last_result: Result<()>,
}

impl Worker {
    fn run(&mut self, receiver: Receiver<WriterMessage>) {
        // `recv()` fails once all senders are gone and the queue is empty.
        while let Ok(first) = receiver.recv() {
            self.handle(first);
            for message in receiver.try_iter() {
                self.handle(message);
            }
            self.persist_if_dirty();
        }
        self.persist_if_dirty();
    }

    fn handle(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::Persist { restore } => self.restore.extend(restore),
            WriterMessage::Flush(ack) => {
                self.persist_if_dirty();
                // The caller may have given up waiting; nothing to do then.
                let _ = ack.send(self.last_result.clone());
            }
        }
    }

    fn persist_if_dirty(&mut self) {
        // Pending restore entries force a write: only a snapshot taken after their message
        // arrived is known to contain the removal.
        let dirty = self.dirty.swap(false, Ordering::SeqCst);
        if !dirty && self.restore.is_empty() {
            return;
        }
        let restore = std::mem::take(&mut self.restore);

        let records = self.memory.snapshot();
        let result = schema::encode(&records).and_then(|json| {
            self.storage
                .save(&self.storage_key, &json)
                .map_err(Error::from)
        });

        match &result {
            Ok(()) => {
                log::debug!(target: "sticky_bucketing",
                            users = records.len();
                            "persisted sticky records");
            }
            Err(err) => {
                log::error!(target: "sticky_bucketing",
                            storage_key:display = self.storage_key;
                            "failed to persist sticky records: {err}");
                self.restore_removed(restore);
            }
        }

        self.last_result = result;
    }

    /// A failed write leaves the removed records on disk. Put them back in memory so that memory
    /// doesn't permanently disagree with what a restart would load. Keys re-saved in the meantime
    /// keep their newer value.
    fn restore_removed(&self, restore: Vec<(StickyKey, String)>) {
        for (key, variation_id) in restore {
            if self.memory.insert_if_absent(key.clone(), variation_id) {
                log::warn!(target: "sticky_bucketing",
                           user_id:display = key.user_id,
                           experiment_id:display = key.experiment_id;
                           "restored sticky record after failed removal");
            }
        }
    }
}
