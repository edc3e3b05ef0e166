//! Drives one call from the command line
//!
//! Prints every [`CallEvent`], optionally admits waiting participants and
//! leaves the call on shutdown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vcme_core::{CallEvent, CallHandle, CallPhase, NoticeLevel};

/// The parts of a [`CallHandle`] the driver needs
pub trait CallControl {
    fn accept(&self, client_id: &str) -> vcme_core::Result<()>;
    fn leave(&self) -> vcme_core::Result<()>;
    fn participant_count(&self) -> usize;
}

impl CallControl for CallHandle {
    fn accept(&self, client_id: &str) -> vcme_core::Result<()> {
        CallHandle::accept(self, client_id)
    }

    fn leave(&self) -> vcme_core::Result<()> {
        CallHandle::leave(self)
    }

    fn participant_count(&self) -> usize {
        self.snapshot().participant_ids.len()
    }
}

/// Driver options
#[derive(Debug, Clone, Copy)]
pub struct DriveOptions {
    /// Accept every join request as it arrives
    pub auto_admit: bool,
    /// Print events as JSON lines
    pub json: bool,
    /// How long to wait for the server to confirm a leave
    pub leave_grace: Duration,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            auto_admit: false,
            json: false,
            leave_grace: Duration::from_secs(3),
        }
    }
}

/// Why the driver stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The server ended the session
    Ended(Option<String>),
    /// Shutdown was requested locally
    Interrupted,
    /// The orchestrator went away
    Stopped,
}

/// What happened during the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReport {
    pub outcome: Outcome,
    /// Largest participant count seen while active
    pub peak_participants: usize,
}

/// Process events until the session ends or `shutdown` resolves
pub async fn drive<C, S>(
    call: &C,
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    options: DriveOptions,
    shutdown: S,
) -> CallReport
where
    C: CallControl,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut peak_participants = 0;

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, leaving call");
                if let Err(e) = call.leave() {
                    warn!("Failed to leave call: {}", e);
                    break Outcome::Interrupted;
                }
                let confirmed = tokio::time::timeout(options.leave_grace, async {
                    while let Some(event) = events.recv().await {
                        print_event(&event, options.json);
                        if matches!(event, CallEvent::ReturnToLanding { .. }) {
                            return;
                        }
                    }
                })
                .await;
                if confirmed.is_err() {
                    warn!("Server did not confirm leaving within {:?}", options.leave_grace);
                }
                break Outcome::Interrupted;
            }

            event = events.recv() => {
                let Some(event) = event else { break Outcome::Stopped };
                print_event(&event, options.json);
                peak_participants = peak_participants.max(call.participant_count());

                match event {
                    CallEvent::JoinRequested { client_id, .. } if options.auto_admit => {
                        info!(client_id = %client_id, "Admitting participant");
                        if let Err(e) = call.accept(&client_id) {
                            warn!("Failed to admit {}: {}", client_id, e);
                        }
                    }
                    CallEvent::ReturnToLanding { reason } => break Outcome::Ended(reason),
                    _ => {}
                }
            }
        }
    };

    CallReport {
        outcome,
        peak_participants,
    }
}

fn print_event(event: &CallEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to encode {}: {}", event.name(), e),
        }
    } else {
        println!("{}", describe(event));
    }
}

/// One-line human description of an event
pub fn describe(event: &CallEvent) -> String {
    match event {
        CallEvent::Notice { level, message } => {
            let tag = match level {
                NoticeLevel::Info => "info",
                NoticeLevel::Success => "ok",
                NoticeLevel::Warning => "warn",
                NoticeLevel::Error => "error",
            };
            format!("[{}] {}", tag, message)
        }
        CallEvent::PhaseChanged { phase, call_id } => {
            let phase = match phase {
                CallPhase::Idle => "idle",
                CallPhase::WaitingRoom => "waiting room",
                CallPhase::Active => "active",
                CallPhase::Ended => "ended",
            };
            match call_id {
                Some(id) => format!("phase: {} ({})", phase, id),
                None => format!("phase: {}", phase),
            }
        }
        CallEvent::JoinRequested {
            client_id,
            client_name,
        } => format!(
            "join request from {} ({})",
            client_name.as_deref().unwrap_or("Participant"),
            client_id
        ),
        CallEvent::RemoteStream {
            stream_id: Some(id),
        } => format!("remote stream {}", id),
        CallEvent::RemoteStream { stream_id: None } => "remote stream gone".to_string(),
        CallEvent::PeerConnected { participant_id } => format!(
            "connected to {}",
            participant_id.as_deref().unwrap_or("peer")
        ),
        CallEvent::ReturnToLanding { reason: Some(reason) } => {
            format!("session over: {}", reason)
        }
        CallEvent::ReturnToLanding { reason: None } => "session over".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCall {
        accepted: Mutex<Vec<String>>,
        left: Mutex<bool>,
        participants: usize,
    }

    impl CallControl for RecordingCall {
        fn accept(&self, client_id: &str) -> vcme_core::Result<()> {
            self.accepted.lock().unwrap().push(client_id.to_string());
            Ok(())
        }

        fn leave(&self) -> vcme_core::Result<()> {
            *self.left.lock().unwrap() = true;
            Ok(())
        }

        fn participant_count(&self) -> usize {
            self.participants
        }
    }

    fn join_request(id: &str) -> CallEvent {
        CallEvent::JoinRequested {
            client_id: id.to_string(),
            client_name: None,
        }
    }

    #[tokio::test]
    async fn test_auto_admit_accepts_requests() {
        let call = RecordingCall {
            participants: 3,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(join_request("c1")).unwrap();
        tx.send(join_request("c2")).unwrap();
        tx.send(CallEvent::ReturnToLanding {
            reason: Some("Host ended the call".to_string()),
        })
        .unwrap();

        let options = DriveOptions {
            auto_admit: true,
            ..Default::default()
        };
        let report = drive(&call, &mut rx, options, std::future::pending()).await;

        assert_eq!(
            report.outcome,
            Outcome::Ended(Some("Host ended the call".to_string()))
        );
        assert_eq!(report.peak_participants, 3);
        assert_eq!(*call.accepted.lock().unwrap(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_requests_wait_without_auto_admit() {
        let call = RecordingCall::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(join_request("c1")).unwrap();
        drop(tx);

        let report = drive(&call, &mut rx, DriveOptions::default(), std::future::pending()).await;
        assert_eq!(report.outcome, Outcome::Stopped);
        assert!(call.accepted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_call_and_waits_for_confirmation() {
        let call = RecordingCall::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(CallEvent::ReturnToLanding { reason: None });
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let started = std::time::Instant::now();
        let report = drive(&call, &mut rx, DriveOptions::default(), async {}).await;

        assert_eq!(report.outcome, Outcome::Interrupted);
        assert!(*call.left.lock().unwrap());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_shutdown_without_confirmation_gives_up() {
        let call = RecordingCall::default();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let options = DriveOptions {
            leave_grace: Duration::from_millis(50),
            ..Default::default()
        };

        let report = drive(&call, &mut rx, options, async {}).await;
        assert_eq!(report.outcome, Outcome::Interrupted);
        assert!(*call.left.lock().unwrap());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&CallEvent::notice(NoticeLevel::Warning, "Careful")),
            "[warn] Careful"
        );
        assert_eq!(
            describe(&CallEvent::PhaseChanged {
                phase: CallPhase::WaitingRoom,
                call_id: Some("c1".to_string()),
            }),
            "phase: waiting room (c1)"
        );
        assert_eq!(
            describe(&join_request("c9")),
            "join request from Participant (c9)"
        );
    }
}
