use std::sync::{Arc, Mutex, PoisonError};

use svctunnel_core::{
    ConnectionState, EventSink, StateInfo, TunnelController, error::Result,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    task::JoinHandle,
};
use tracing::{error, info};

/// The tunnel the daemon currently drives: its controller, the task running
/// the control loop, and the latest state reported by that loop.
pub struct TunnelSession {
    pub controller: Arc<TunnelController>,
    task: JoinHandle<Result<()>>,
    forwarder: JoinHandle<()>,
    last_event: Arc<Mutex<Option<StateInfo>>>,
}

impl TunnelSession {
    /// Spawns the control loop. The returned receiver resolves with the first
    /// `Connected` or `Disconnected` event.
    pub fn start(controller: Arc<TunnelController>) -> (Self, oneshot::Receiver<StateInfo>) {
        let (events, receiver) = EventSink::channel();
        let last_event = Arc::new(Mutex::new(None));
        let (settled_sender, settled_receiver) = oneshot::channel();

        let forwarder = tokio::spawn(forward_events(
            receiver,
            Arc::clone(&last_event),
            settled_sender,
        ));

        let loop_controller = Arc::clone(&controller);
        let task = tokio::spawn(async move {
            let result = loop_controller.connect(events).await;
            if let Err(error) = &result {
                error!("Tunnel exited: {}", error);
            }
            result
        });

        (
            Self {
                controller,
                task,
                forwarder,
                last_event,
            },
            settled_receiver,
        )
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn last_event(&self) -> Option<StateInfo> {
        self.last_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Disconnects and waits for the control loop to wind down.
    pub async fn stop(self) -> Result<()> {
        let result = self.controller.disconnect().await;
        match self.task.await {
            Ok(Ok(())) => info!("Tunnel task completed"),
            Ok(Err(error)) => info!("Tunnel task ended with error: {}", error),
            Err(error) => error!("Tunnel task failed: {:?}", error),
        }
        if let Err(error) = self.forwarder.await {
            error!("Event forwarder failed: {:?}", error);
        }
        result
    }
}

async fn forward_events(
    mut receiver: UnboundedReceiver<StateInfo>,
    last_event: Arc<Mutex<Option<StateInfo>>>,
    settled: oneshot::Sender<StateInfo>,
) {
    let mut settled = Some(settled);
    while let Some(info) = receiver.recv().await {
        match &info.reason {
            Some(reason) => info!("Tunnel {:?}: {}", info.state, reason),
            None => info!("Tunnel {:?}", info.state),
        }

        if matches!(
            info.state,
            ConnectionState::Connected | ConnectionState::Disconnected
        ) {
            if let Some(sender) = settled.take() {
                let _ = sender.send(info.clone());
            }
        }
        *last_event.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }
}
