use tokio::sync::mpsc;

/// Sending half of a stage queue, bounded or unbounded
pub enum StageSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        match self {
            StageSender::Bounded(tx) => StageSender::Bounded(tx.clone()),
            StageSender::Unbounded(tx) => StageSender::Unbounded(tx.clone()),
        }
    }
}

impl<T> StageSender<T> {
    /// Waits while a bounded queue is full. Returns false once the
    /// receiving stage has gone away.
    pub async fn send(&self, item: T) -> bool {
        match self {
            StageSender::Bounded(tx) => tx.send(item).await.is_ok(),
            StageSender::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }
}

/// Receiving half of a stage queue
pub enum StageReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> StageReceiver<T> {
    /// Next item; `None` once every sender is dropped and the queue is drained
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            StageReceiver::Bounded(rx) => rx.recv().await,
            StageReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match self {
            StageReceiver::Bounded(rx) => rx.try_recv().ok(),
            StageReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Queue between two stages; `None` capacity means unbounded
pub fn stage_channel<T>(capacity: Option<usize>) -> (StageSender<T>, StageReceiver<T>) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (StageSender::Bounded(tx), StageReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (StageSender::Unbounded(tx), StageReceiver::Unbounded(rx))
        }
    }
}
