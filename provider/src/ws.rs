//! Sesión websocket de un bidder: un envío por conexión y, a partir de ahí,
//! las notificaciones de esa tarea hasta su estado terminal.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use common::{ErrorBody, SessionCommand, SessionReply, SubmitTaskRequest, TaskId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::handlers::{admit_request, ApiError};
use crate::state::AppState;

pub async fn bid_session(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| {
        let (sender, receiver) = socket.split();
        run_session(sender, receiver, state)
    })
}

async fn send_json<W, T>(sender: &mut W, value: &T) -> bool
where
    W: Sink<Message> + Unpin,
    T: Serialize,
{
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

fn error_reply(status: &str, error_message: impl ToString) -> SessionReply {
    SessionReply::from(ErrorBody {
        status: status.to_string(),
        error_message: error_message.to_string(),
    })
}

/// Espera el primer frame de texto. `None` si el cliente se fue antes.
async fn first_request<R, E>(receiver: &mut R) -> Option<Result<SubmitTaskRequest, SessionReply>>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => {
                return Some(
                    serde_json::from_str(&text).map_err(|e| error_reply("invalid_request", e)),
                )
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

pub(crate) async fn run_session<W, R, E>(mut sender: W, mut receiver: R, state: AppState)
where
    W: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let req = match first_request(&mut receiver).await {
        Some(Ok(req)) => req,
        Some(Err(reply)) => {
            send_json(&mut sender, &reply).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        None => return,
    };

    // suscribirse antes de enviar: Admitted/Queued salen dentro del submit
    let mut notices = state.hub.subscribe(&req.bidder_id);

    let resp = match admit_request(&state, req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!("envío por websocket rechazado: {}", e);
            send_json(&mut sender, &SessionReply::from(e.body())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let task_id: TaskId = resp.task.id.clone();
    if !send_json(&mut sender, &SessionReply::Submitted(resp)).await {
        return;
    }

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(n) if n.task_id() == task_id => {
                    let terminal = n.is_terminal();
                    if !send_json(&mut sender, &n).await || terminal {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SessionCommand>(&text) {
                        Ok(SessionCommand::Cancel) => {
                            if let Err(e) = state.scheduler.cancel(&task_id) {
                                send_json(&mut sender, &SessionReply::from(ApiError::from(e).body())).await;
                            }
                        }
                        Err(e) => {
                            send_json(&mut sender, &error_reply("invalid_command", e)).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("bidder desconectado; la tarea {} sigue su curso", task_id);
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use common::TaskState;
    use futures::channel::mpsc;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::time::Duration;

    struct Client {
        tx: mpsc::UnboundedSender<Result<Message, Infallible>>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn send(&self, value: Value) {
            self.tx
                .unbounded_send(Ok(Message::Text(value.to_string())))
                .unwrap();
        }

        /// Siguiente frame de texto como JSON; `None` al cerrar.
        async fn recv(&mut self) -> Option<Value> {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.next())
                .await
                .expect("la sesión no contestó");
            match frame {
                Some(Message::Text(text)) => Some(serde_json::from_str(&text).unwrap()),
                _ => None,
            }
        }
    }

    fn connect(state: AppState) -> (Client, tokio::task::JoinHandle<()>) {
        let (client_tx, server_rx) = mpsc::unbounded();
        let (server_tx, client_rx) = mpsc::unbounded();
        let session = tokio::spawn(run_session(server_tx, server_rx, state));
        (
            Client {
                tx: client_tx,
                rx: client_rx,
            },
            session,
        )
    }

    fn submission(bid: f64) -> Value {
        json!({
            "bidder_id": "alice",
            "user_account": 1,
            "bid_price": bid,
            "spec": { "command": "sleep 1" }
        })
    }

    #[tokio::test]
    async fn submit_then_follow_until_cancelled() {
        let state = test_state(0);
        let (mut client, session) = connect(state.clone());

        client.send(submission(1.9));
        let submitted = client.recv().await.unwrap();
        assert_eq!(submitted["status"], "submitted");
        let id = submitted["task"]["id"].as_str().unwrap().to_string();

        let queued = client.recv().await.unwrap();
        assert_eq!(queued["status"], "queued");
        assert_eq!(queued["task_id"], id.as_str());

        client.send(json!({ "action": "cancel" }));
        let cancelled = client.recv().await.unwrap();
        assert_eq!(cancelled["status"], "cancelled");
        assert_eq!(cancelled["summary"]["killed_by"], "user");

        assert!(client.recv().await.is_none());
        session.await.unwrap();
        assert_eq!(state.scheduler.get(&id).unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn below_reserve_is_reported_and_closed() {
        let state = test_state(1);
        let (mut client, session) = connect(state.clone());

        client.send(submission(1.0));
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["kind"], "below_reserve");

        assert!(client.recv().await.is_none());
        session.await.unwrap();
        assert!(state.scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn garbage_first_frame_is_rejected() {
        let (mut client, _session) = connect(test_state(1));
        client.send(json!({ "hola": true }));
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn disconnect_leaves_the_task_running() {
        let state = test_state(1);
        let (mut client, session) = connect(state.clone());

        client.send(submission(1.7));
        let submitted = client.recv().await.unwrap();
        let id = submitted["task"]["id"].as_str().unwrap().to_string();
        assert_eq!(client.recv().await.unwrap()["status"], "admitted");
        assert_eq!(client.recv().await.unwrap()["status"], "started");

        drop(client);
        session.await.unwrap();
        assert_eq!(state.scheduler.get(&id).unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn other_tasks_of_the_same_bidder_are_not_forwarded() {
        let state = test_state(0);
        let (mut client, _session) = connect(state.clone());

        client.send(submission(1.9));
        let submitted = client.recv().await.unwrap();
        let id = submitted["task"]["id"].as_str().unwrap().to_string();
        assert_eq!(client.recv().await.unwrap()["status"], "queued");

        // otra tarea de alice enviada por HTTP
        let other = state.scheduler.submit(
            "alice".into(),
            1,
            common::Bid::new(1.8).unwrap(),
            common::TaskSpec {
                command: "true".into(),
                outputs: Vec::new(),
            },
        );
        state.scheduler.cancel(&other.id).unwrap();
        state.scheduler.cancel(&id).unwrap();

        let next = client.recv().await.unwrap();
        assert_eq!(next["task_id"], id.as_str());
        assert_eq!(next["status"], "cancelled");
    }
}
