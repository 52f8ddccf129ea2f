use std::io;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_ipc::framing::{self, FramedStream};
use warden_proto::PROTOCOL_VERSION;
use warden_proto::proto::*;

use crate::controller::OrchestrationController;

/// Accept connections until `shutdown` fires. Each connection is served on its own task.
pub async fn serve(
    listener: UnixListener,
    controller: Arc<OrchestrationController>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let controller = Arc::clone(&controller);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, controller, shutdown).await {
                        debug!("connection closed with error: {err}");
                    }
                });
            }
        }
    }
}

async fn handle_conn(
    stream: UnixStream,
    controller: Arc<OrchestrationController>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut framed = framing::framed(stream);
    let mut subscription = Subscription::default();

    loop {
        tokio::select! {
            request = framing::read_request(&mut framed) => {
                let Some(Envelope { id, payload }) = request? else {
                    return Ok(());
                };
                match payload {
                    Request::Shutdown {} => {
                        respond(&mut framed, id, Response::ShutdownAck {}).await?;
                        info!("shutdown requested over the socket");
                        shutdown.cancel();
                        return Ok(());
                    }
                    Request::Subscribe { topics } => {
                        subscription = Subscription::new(&controller, &topics);
                        respond(&mut framed, id, Response::Subscribed { topics }).await?;
                    }
                    other => {
                        let response = dispatch(&controller, other).await;
                        respond(&mut framed, id, response).await?;
                    }
                }
            }
            event = subscription.next() => {
                framing::send_outbound(&mut framed, &Outbound::Event(event)).await?;
            }
        }
    }
}

async fn dispatch(controller: &OrchestrationController, request: Request) -> Response {
    match request {
        Request::Ping { protocol_version, .. } if protocol_version != PROTOCOL_VERSION => {
            Response::Error(
                RpcError::new(
                    ErrorCode::UnsupportedProtocol,
                    format!("daemon speaks protocol {PROTOCOL_VERSION}, client sent {protocol_version}"),
                )
                .with_detail("daemon_protocol", PROTOCOL_VERSION.to_string()),
            )
        }
        Request::Ping { .. } => Response::Pong {
            daemon_version: warden_proto::pkg_version().to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
        Request::Command(command) => match controller.command(command).await {
            Ok(outcome) => Response::Outcome(outcome),
            Err(err) => {
                warn!("command failed: {err}");
                Response::Error(RpcError::from(&err))
            }
        },
        Request::Query(query) => match controller.query(query).await {
            Ok(snapshot) => Response::Snapshot(snapshot),
            Err(err) => Response::Error(RpcError::from(&err)),
        },
        Request::Subscribe { .. } | Request::Shutdown {} => Response::Error(RpcError::new(
            ErrorCode::BadRequest,
            "request handled by the connection loop",
        )),
    }
}

async fn respond(framed: &mut FramedStream, id: RequestId, payload: Response) -> io::Result<()> {
    framing::send_outbound(framed, &Outbound::Response(Envelope { id, payload })).await
}

/// Event feeds a connection asked for. Feeds that close are dropped.
#[derive(Default)]
struct Subscription {
    events: Option<broadcast::Receiver<Event>>,
    server_logs: Option<broadcast::Receiver<LogLine>>,
    manager_logs: Option<broadcast::Receiver<LogLine>>,
    state: bool,
    backups: bool,
}

impl Subscription {
    fn new(controller: &OrchestrationController, topics: &[Topic]) -> Self {
        let state = topics.contains(&Topic::State);
        let backups = topics.contains(&Topic::Backups);
        let logs = topics.contains(&Topic::Logs);
        Self {
            events: (state || backups).then(|| controller.subscribe()),
            server_logs: logs.then(|| controller.logs().server_subscribe()),
            manager_logs: logs.then(|| controller.logs().manager_subscribe()),
            state,
            backups,
        }
    }

    fn wants(&self, event: &Event) -> bool {
        match event {
            Event::State(_) => self.state,
            Event::Backup(_) => self.backups,
            Event::Log(_) => true,
        }
    }

    /// Next event for this connection; pending forever when nothing is subscribed.
    async fn next(&mut self) -> Event {
        loop {
            tokio::select! {
                Some(event) = recv(&mut self.events) => {
                    if self.wants(&event) {
                        return event;
                    }
                }
                Some(line) = recv(&mut self.server_logs) => return Event::Log(line),
                Some(line) = recv(&mut self.manager_logs) => return Event::Log(line),
                else => std::future::pending::<()>().await,
            }
        }
    }
}

/// Receive from an optional feed. A closed feed is cleared; a lagging one skips ahead.
async fn recv<T: Clone>(feed: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let rx = feed.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(item) => return Some(item),
            Err(RecvError::Lagged(skipped)) => debug!("subscriber lagged, skipped {skipped} events"),
            Err(RecvError::Closed) => {
                *feed = None;
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::supervisor::LogStore;
    use tokio::time::{Duration, timeout};
    use warden_ipc::socket;

    struct Fixture {
        _dir: tempfile::TempDir,
        client: FramedStream,
        shutdown: CancellationToken,
        server: tokio::task::JoinHandle<io::Result<()>>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("Saves")).expect("mkdir");
        std::fs::write(data.join("Saves/world.vcdbs"), b"v1").expect("write");
        let config = ManagerConfig::new("/bin/sh", &data, dir.path().join("backups"));
        let controller = Arc::new(
            OrchestrationController::from_config(&config, LogStore::new(100)).expect("controller"),
        );

        let path = dir.path().join("wardend.sock");
        let listener = socket::listen(&path).await.expect("listen");
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, controller, shutdown.clone()));
        let client = framing::framed(socket::connect(&path).await.expect("connect"));
        Fixture {
            _dir: dir,
            client,
            shutdown,
            server,
        }
    }

    async fn call(client: &mut FramedStream, id: RequestId, payload: Request) -> Response {
        framing::send_request(client, &Envelope { id, payload })
            .await
            .expect("send");
        loop {
            match next_frame(client).await {
                Outbound::Response(env) => {
                    assert_eq!(env.id, id);
                    return env.payload;
                }
                Outbound::Event(_) => continue,
            }
        }
    }

    async fn next_frame(client: &mut FramedStream) -> Outbound {
        timeout(Duration::from_secs(5), framing::read_outbound(client))
            .await
            .expect("frame in time")
            .expect("read")
            .expect("open")
    }

    fn ping(protocol_version: u32) -> Request {
        Request::Ping {
            client_version: "test".into(),
            protocol_version,
        }
    }

    #[tokio::test]
    async fn ping_checks_the_protocol_version() {
        let mut fx = fixture().await;
        match call(&mut fx.client, 1, ping(PROTOCOL_VERSION + 1)).await {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::UnsupportedProtocol),
            other => panic!("unexpected response {other:?}"),
        }
        match call(&mut fx.client, 2, ping(PROTOCOL_VERSION)).await {
            Response::Pong { protocol_version, .. } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("unexpected response {other:?}"),
        }
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn queries_and_typed_errors() {
        let mut fx = fixture().await;
        match call(&mut fx.client, 1, Request::Query(Query::Health {})).await {
            Response::Snapshot(Snapshot::Health(health)) => {
                assert_eq!(health.state, ServerProcessState::Stopped);
                assert!(health.pid.is_none());
            }
            other => panic!("unexpected response {other:?}"),
        }

        let kick = Request::Command(Command::Kick {
            player: "Tyron".into(),
            reason: None,
        });
        match call(&mut fx.client, 2, kick).await {
            Response::Error(err) => {
                assert_eq!(err.code, ErrorCode::ServerNotRunning);
                assert!(!err.is_retryable());
            }
            other => panic!("unexpected response {other:?}"),
        }
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn subscribers_receive_backup_events() {
        let mut fx = fixture().await;
        let subscribe = Request::Subscribe {
            topics: vec![Topic::Backups],
        };
        assert!(matches!(
            call(&mut fx.client, 1, subscribe).await,
            Response::Subscribed { .. }
        ));

        framing::send_request(
            &mut fx.client,
            &Envelope {
                id: 2,
                payload: Request::Command(Command::Backup {}),
            },
        )
        .await
        .expect("send");

        let mut created = None;
        let mut event_id = None;
        while created.is_none() || event_id.is_none() {
            match next_frame(&mut fx.client).await {
                Outbound::Response(env) => match env.payload {
                    Response::Outcome(Outcome::BackupCreated(record)) => created = Some(record.id),
                    other => panic!("unexpected response {other:?}"),
                },
                Outbound::Event(Event::Backup(BackupEvent::Created(record))) => {
                    event_id = Some(record.id)
                }
                Outbound::Event(other) => panic!("unsubscribed event {other:?}"),
            }
        }
        assert_eq!(created, event_id);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_server_loop() {
        let mut fx = fixture().await;
        assert!(matches!(
            call(&mut fx.client, 9, Request::Shutdown {}).await,
            Response::ShutdownAck {}
        ));
        timeout(Duration::from_secs(5), fx.server)
            .await
            .expect("serve returns")
            .expect("join")
            .expect("clean exit");
        assert!(fx.shutdown.is_cancelled());
    }
}
