use async_trait::async_trait;
use tokio::sync::mpsc;
use trellis_runtime::{EventSink, TaskError};
use trellis_trigger::{Occurrence, SentEvent};

/// Routes events sent from inside runs back into the client's channel.
pub(crate) struct ChannelSink {
  sender: mpsc::Sender<Occurrence>,
}

impl ChannelSink {
  pub(crate) fn new(sender: mpsc::Sender<Occurrence>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl EventSink for ChannelSink {
  async fn send(&self, event: SentEvent) -> Result<(), TaskError> {
    self
      .sender
      .send(Occurrence::Event(event))
      .await
      .map_err(|_| TaskError::new("client event channel closed"))
  }
}
