//! Notification intake.
//!
//! External hooks only know the directory a session runs in. A notification
//! is matched to the most recently created session in that directory, drives
//! its status machine, is recorded in history and then fanned out to every
//! connection. Unmatched notifications change nothing.

use termhub_protocol::{NotificationRequest, ServerEvent, SessionId, SessionInfo};

use super::Multiplexer;
use crate::session::Transition;

/// What a notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// No session runs in the given directory.
    Unmatched,
    /// The matching session is already completed.
    Ignored { session_id: SessionId },
    /// The session's status was set and observers were told.
    Applied { session: SessionInfo },
}

impl Multiplexer {
    /// Applies a hook notification.
    pub async fn notify(&self, request: NotificationRequest) -> NotifyOutcome {
        let target = request.notify_type.target_status();

        let (session, output_size) = {
            let mut state = self.state.lock().await;
            let Some(matched) = state.registry.find_by_directory(&request.working_directory)
            else {
                tracing::debug!(
                    working_directory = %request.working_directory,
                    notify_type = ?request.notify_type,
                    "Notification matched no session"
                );
                return NotifyOutcome::Unmatched;
            };

            match state.registry.transition(&matched.id, target) {
                Some(Transition::Applied { from, to }) => {
                    tracing::info!(
                        session_id = %matched.id,
                        from = %from,
                        to = %to,
                        "Session status updated by notification"
                    );
                }
                _ => {
                    tracing::debug!(session_id = %matched.id, "Notification for completed session ignored");
                    return NotifyOutcome::Ignored {
                        session_id: matched.id,
                    };
                }
            }

            let output_size = state.registry.output_size(&matched.id).unwrap_or(0);
            let session = state.registry.get(&matched.id).unwrap_or(matched);
            (session, output_size)
        };

        self.history
            .update_status(&session.id, session.status, output_size)
            .await;

        let mut state = self.state.lock().await;
        // A delete that ran meanwhile has already told everyone.
        if state.registry.contains(&session.id) {
            state.broadcast(ServerEvent::Notification {
                session_id: session.id.clone(),
                notify_type: request.notify_type,
                status: session.status,
            });
        }

        NotifyOutcome::Applied { session }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::tests::{assert_silent, harness, recv};
    use std::sync::Arc;
    use std::time::Duration;
    use termhub_protocol::{NotifyType, SessionStatus};
    use tokio::time::timeout;

    fn request(notify_type: NotifyType, dir: &str) -> NotificationRequest {
        NotificationRequest {
            notify_type,
            working_directory: dir.to_string(),
        }
    }

    #[tokio::test]
    async fn test_notification_updates_status_and_broadcasts() {
        let h = harness();
        let session = h.mux.create_session("/work/App").await.unwrap();
        let (_client, mut rx) = h.mux.connect().await;

        let outcome = h.mux.notify(request(NotifyType::Waiting, "/WORK/app/")).await;

        match outcome {
            NotifyOutcome::Applied { session: s } => assert_eq!(s.status, SessionStatus::Waiting),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::Notification {
                session_id: session.id.clone(),
                notify_type: NotifyType::Waiting,
                status: SessionStatus::Waiting,
            }
        );
        assert_eq!(
            h.mux.history().get(&session.id).unwrap().status,
            SessionStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_unmatched_notification_changes_nothing() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (_client, mut rx) = h.mux.connect().await;
        let before = h.mux.history().get_history();

        let outcome = h.mux.notify(request(NotifyType::Completed, "/nowhere")).await;

        assert_eq!(outcome, NotifyOutcome::Unmatched);
        assert_eq!(
            h.mux.get_session(&session.id).await.unwrap().status,
            SessionStatus::Running
        );
        assert_eq!(h.mux.history().get_history(), before);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completed_session_ignores_notifications() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        h.mux.notify(request(NotifyType::Completed, "/x")).await;
        let (_client, mut rx) = h.mux.connect().await;

        for notify_type in [NotifyType::Running, NotifyType::Waiting, NotifyType::Completed] {
            assert_eq!(
                h.mux.notify(request(notify_type, "/x")).await,
                NotifyOutcome::Ignored {
                    session_id: session.id.clone()
                }
            );
        }

        assert_eq!(
            h.mux.get_session(&session.id).await.unwrap().status,
            SessionStatus::Completed
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_racing_delete_is_not_announced() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (_client, mut rx) = h.mux.connect().await;

        let gate = h.mux.history().hold_writes().await;
        let mux = Arc::clone(&h.mux);
        let notifying =
            tokio::spawn(async move { mux.notify(request(NotifyType::Waiting, "/x")).await });
        for _ in 0..100 {
            if h.mux.history().get(&session.id).unwrap().status == SessionStatus::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mux = Arc::clone(&h.mux);
        let id = session.id.clone();
        let deleting = tokio::spawn(async move { mux.delete_session(&id).await });
        for _ in 0..100 {
            if h.mux.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(gate);
        assert!(matches!(
            notifying.await.unwrap(),
            NotifyOutcome::Applied { .. }
        ));
        assert!(deleting.await.unwrap());

        assert_eq!(
            recv(&mut rx).await,
            ServerEvent::SessionDeleted {
                session_id: session.id.clone()
            }
        );
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_notification_targets_most_recent_session() {
        let h = harness();
        let older = h.mux.create_session("C:\\Proj").await.unwrap();
        let newer = h.mux.create_session("c:/proj").await.unwrap();

        h.mux.notify(request(NotifyType::Waiting, "C:/PROJ")).await;

        assert_eq!(
            h.mux.get_session(&newer.id).await.unwrap().status,
            SessionStatus::Waiting
        );
        assert_eq!(
            h.mux.get_session(&older.id).await.unwrap().status,
            SessionStatus::Running
        );
    }
}
