//! Engine events and notifiers for observability.
//!
//! The durable record of an instance is its event history in the store.
//! These events are a live feed of the same progress for consumers that
//! want to react to it (metrics, UIs, tests) without polling the store.

use marigold_store::Failure;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted as instances advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
  InstanceStarted {
    instance_id: String,
    definition_name: String,
    definition_version: u32,
  },

  /// An activity task was enqueued for a step.
  StepDispatched {
    instance_id: String,
    step_index: u32,
    activity_name: String,
    attempt: u32,
  },

  /// The instance suspended on a signal.
  WaitingSignal {
    instance_id: String,
    signal_name: String,
  },

  SignalAccepted {
    instance_id: String,
    signal_name: String,
  },

  InstanceCompleted {
    instance_id: String,
    output: serde_json::Value,
  },

  InstanceFailed {
    instance_id: String,
    failure: Failure,
  },

  InstanceCancelled { instance_id: String },
}

/// Trait for receiving engine events.
///
/// `notify` is called after the corresponding state is committed, from the
/// task that committed it, so implementations must not block.
pub trait EngineNotifier: Send + Sync {
  fn notify(&self, event: EngineEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl EngineNotifier for NoopNotifier {
  fn notify(&self, _event: EngineEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl EngineNotifier for ChannelNotifier {
  fn notify(&self, event: EngineEvent) {
    // The receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
