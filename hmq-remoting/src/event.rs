//! Connection lifecycle events delivered off the I/O path.

use crate::channel::Channel;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Maximum number of undelivered events before new ones are dropped.
pub const MAX_EVENT_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventType {
    Connect,
    Close,
    Idle,
    Exception,
}

#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub event_type: ChannelEventType,
    pub remote_addr: String,
    pub channel: Arc<Channel>,
}

impl ChannelEvent {
    pub fn new(event_type: ChannelEventType, channel: &Arc<Channel>) -> Self {
        Self {
            event_type,
            remote_addr: channel.remote_addr().to_string(),
            channel: channel.clone(),
        }
    }
}

/// Observer for connection lifecycle events.
pub trait ChannelEventListener: Send + Sync + 'static {
    fn on_channel_connect(&self, _remote_addr: &str, _channel: &Arc<Channel>) {}

    fn on_channel_close(&self, _remote_addr: &str, _channel: &Arc<Channel>) {}

    fn on_channel_exception(&self, _remote_addr: &str, _channel: &Arc<Channel>) {}

    fn on_channel_idle(&self, _remote_addr: &str, _channel: &Arc<Channel>) {}
}

/// Queues events and hands them to a listener on a dedicated task.
pub struct ChannelEventExecutor {
    listener: Arc<dyn ChannelEventListener>,
    sender: mpsc::Sender<ChannelEvent>,
    receiver: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
}

impl ChannelEventExecutor {
    pub fn new(listener: Arc<dyn ChannelEventListener>) -> Self {
        let (sender, receiver) = mpsc::channel(MAX_EVENT_QUEUE_SIZE);
        Self {
            listener,
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Queues an event, dropping it if the queue is full.
    pub fn put_event(&self, event: ChannelEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::warn!(
                "Event queue full ({} events), dropping {:?} event",
                MAX_EVENT_QUEUE_SIZE,
                e.into_inner().event_type
            );
        }
    }

    /// Starts delivering events until `shutdown` fires. Later calls are no-ops.
    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let listener = self.listener.clone();
        tokio::spawn(async move {
            tracing::debug!("Channel event executor started");
            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        let Some(event) = event else { break };
                        dispatch(listener.as_ref(), &event);
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("Channel event executor stopped");
        });
    }
}

fn dispatch(listener: &dyn ChannelEventListener, event: &ChannelEvent) {
    let addr = event.remote_addr.as_str();
    match event.event_type {
        ChannelEventType::Connect => listener.on_channel_connect(addr, &event.channel),
        ChannelEventType::Close => listener.on_channel_close(addr, &event.channel),
        ChannelEventType::Idle => listener.on_channel_idle(addr, &event.channel),
        ChannelEventType::Exception => listener.on_channel_exception(addr, &event.channel),
    }
}
