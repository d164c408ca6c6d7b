//! Core server: accepts WebSocket connections and runs one session per connection.
//!
//! Every request runs as its own task so that terminal streams, autopilot
//! playback and `pause` can overlap. Replies from all tasks funnel through a
//! single channel into the connection's writer, which keeps frames for one
//! terminal stream in read order.

use crate::config::ServerConfig;
use crate::course::CourseSource;
use crate::session::{generate_id, SandboxEngine, SessionController};
use crate::transport::websocket::{self, WebSocketConnection};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tutor_core::{
    decode_request, encode, Method, Response, Role, Status, TutorError, TutorResult,
};

/// Replies queued per connection before calls start waiting on the socket.
const OUTBOUND_QUEUE: usize = 256;

/// Terminal chunks buffered per stream; a full queue stalls the pty reader.
const TERMINAL_QUEUE: usize = 64;

/// How long sessions get to tear down after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Sends the replies of one call.
struct Reply {
    marker: u64,
    tx: mpsc::Sender<Response>,
}

impl Reply {
    fn new(marker: u64, tx: mpsc::Sender<Response>) -> Self {
        Self { marker, tx }
    }

    /// Final reply.
    async fn ret(&self, value: Value) {
        let _ = self.tx.send(Response::result(self.marker, value)).await;
    }

    /// Intermediate reply of a stream. Fails once the connection is gone.
    async fn ret_and_continue(&self, value: Value) -> TutorResult<()> {
        self.tx
            .send(Response::partial(self.marker, value))
            .await
            .map_err(|_| TutorError::Transport("reply channel closed".into()))
    }

    async fn fail(&self, e: &TutorError) {
        let _ = self
            .tx
            .send(Response::error(self.marker, e.code(), e.to_string()))
            .await;
    }
}

/// The tutoring server instance.
pub struct TutorServer {
    config: ServerConfig,
    engine: Arc<dyn SandboxEngine>,
    courses: Arc<dyn CourseSource>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TutorServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn SandboxEngine>,
        courses: Arc<dyn CourseSource>,
    ) -> Self {
        Self {
            config,
            engine,
            courses,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Listen on the configured port until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> TutorResult<()> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let (addr, incoming) = websocket::start_listener(bind_addr).await?;
        info!(
            addr = %addr,
            max_sessions = self.config.max_sessions,
            "tutor-server ready"
        );
        self.serve(incoming, shutdown).await
    }

    /// Run sessions for accepted connections until `shutdown` resolves, then
    /// tear every session down.
    pub async fn serve(
        self,
        mut incoming: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) -> TutorResult<()> {
        let server = Arc::new(self);
        let mut sessions: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }

                Some(mut conn) = incoming.recv() => {
                    if sessions.len() >= server.config.max_sessions {
                        warn!(
                            remote = %conn.remote_addr,
                            max = server.config.max_sessions,
                            "session limit reached, refusing connection"
                        );
                        tokio::spawn(async move {
                            websocket::ws_close(&mut conn.ws_stream).await;
                        });
                        continue;
                    }
                    let srv = server.clone();
                    sessions.spawn(async move {
                        if let Err(e) = srv.handle_connection(conn).await {
                            warn!(error = %e, "session ended with error");
                        }
                    });
                }

                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "session task failed");
                    }
                }

                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        info!(active = sessions.len(), "closing active sessions");
        let _ = server.shutdown_tx.send(());
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "sessions did not drain in time, aborting");
            sessions.abort_all();
        }

        info!("tutor-server stopped");
        Ok(())
    }

    async fn handle_connection(&self, conn: WebSocketConnection) -> TutorResult<()> {
        let session_id = generate_id();
        info!(
            session_id = %session_id,
            remote = %conn.remote_addr,
            token = %conn.token,
            "session opened"
        );

        let session = Arc::new(SessionController::new(
            session_id,
            self.config.session.clone(),
            self.engine.clone(),
            self.courses.clone(),
        ));
        self.run_session(conn, session).await
    }

    /// Serve `conn` with `session`, then tear both down.
    async fn run_session(
        &self,
        mut conn: WebSocketConnection,
        session: Arc<SessionController>,
    ) -> TutorResult<()> {
        let result = self.session_loop(&mut conn, &session).await;

        session.destroy().await;
        websocket::ws_close(&mut conn.ws_stream).await;
        info!(session_id = %session.id(), "session closed");
        result
    }

    /// Message loop for one connection.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        session: &Arc<SessionController>,
    ) -> TutorResult<()> {
        let (out_tx, mut out_rx) = mpsc::channel::<Response>(OUTBOUND_QUEUE);
        let mut calls: JoinSet<TutorResult<()>> = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session_id = %session.id(), "shutdown signal received, closing session");
                    break Ok(());
                }

                Some(response) = out_rx.recv() => {
                    if let Err(e) = send_response(conn, &response).await {
                        break Err(e);
                    }
                }

                Some(joined) = calls.join_next() => {
                    match joined {
                        Ok(Err(e)) if e.is_session_fatal() => {
                            warn!(session_id = %session.id(), error = %e, "fatal call error, closing session");
                            break Err(e);
                        }
                        Err(e) if e.is_panic() => {
                            error!(session_id = %session.id(), error = %e, "call panicked");
                        }
                        _ => {}
                    }
                }

                incoming = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match incoming {
                        Ok(Some(text)) => dispatch(&text, session, &out_tx, &mut calls),
                        Ok(None) => {
                            debug!(session_id = %session.id(), "WebSocket session ended (peer closed)");
                            break Ok(());
                        }
                        Err(e @ TutorError::InvalidMessage(_)) => {
                            warn!(session_id = %session.id(), error = %e, "rejected frame");
                            let reply = Reply::new(0, out_tx.clone());
                            calls.spawn(async move {
                                reply.fail(&e).await;
                                Ok(())
                            });
                        }
                        Err(e) => {
                            debug!(session_id = %session.id(), error = %e, "WebSocket session ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        // In-flight calls hold session locks; stop them before teardown, but
        // deliver what they already replied (a fatal error, typically).
        calls.abort_all();
        drop(out_tx);
        while let Ok(response) = out_rx.try_recv() {
            if send_response(conn, &response).await.is_err() {
                break;
            }
        }
        result
    }
}

async fn send_response(conn: &mut WebSocketConnection, response: &Response) -> TutorResult<()> {
    let text = match encode(response) {
        Ok(text) => text,
        Err(e) => {
            warn!(marker = response.marker, error = %e, "reply could not be encoded");
            encode(&Response::error(response.marker, e.code(), e.to_string()))?
        }
    };
    websocket::ws_send_text(&mut conn.ws_stream, text).await
}

/// Decode a request and spawn its handler.
fn dispatch(
    text: &str,
    session: &Arc<SessionController>,
    out_tx: &mpsc::Sender<Response>,
    calls: &mut JoinSet<TutorResult<()>>,
) {
    let request = match decode_request(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(session_id = %session.id(), error = %e, "invalid request");
            let reply = Reply::new(0, out_tx.clone());
            calls.spawn(async move {
                reply.fail(&e).await;
                Ok(())
            });
            return;
        }
    };

    let reply = Reply::new(request.marker, out_tx.clone());
    let Some(method) = Method::from_name(&request.function_name) else {
        let e = TutorError::UnknownMethod(request.function_name);
        calls.spawn(async move {
            reply.fail(&e).await;
            Ok(())
        });
        return;
    };

    debug!(
        session_id = %session.id(),
        marker = request.marker,
        method = method.name(),
        "dispatching call"
    );
    calls.spawn(handle_call(
        session.clone(),
        method,
        request.parameters_list,
        reply,
    ));
}

/// Run one call to completion and send its reply. Returns the error only
/// when it is fatal for the session.
async fn handle_call(
    session: Arc<SessionController>,
    method: Method,
    params: Vec<Value>,
    reply: Reply,
) -> TutorResult<()> {
    let outcome = match method {
        Method::ReadStudentTerminal => stream_terminal(&session, Role::Student, &reply).await,
        Method::ReadTutorTerminal => stream_terminal(&session, Role::Tutor, &reply).await,
        _ => match call(&session, method, &params).await {
            Ok(value) => {
                reply.ret(value).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(session_id = %session.id(), method = method.name(), error = %e, "call failed");
            reply.fail(&e).await;
            if e.is_session_fatal() {
                Err(e)
            } else {
                Ok(())
            }
        }
    }
}

async fn call(session: &SessionController, method: Method, params: &[Value]) -> TutorResult<Value> {
    Ok(match method {
        Method::GetCourse => {
            let course_id = course_id_param(method, params)?;
            match session.get_course(&course_id).await {
                Ok(course) => course,
                Err(TutorError::CourseNotFound(_)) => serde_json::to_value(Status::CourseDoesNotExist)?,
                Err(e) => return Err(e),
            }
        }
        Method::Start => serde_json::to_value(session.start().await?)?,
        Method::Next => serde_json::to_value(session.next().await?)?,
        Method::Back => serde_json::to_value(session.back().await?)?,
        Method::Seek => {
            let n = param(method, params, 0)?
                .as_i64()
                .ok_or_else(|| bad_param(method, "an integer"))?;
            serde_json::to_value(session.seek(n).await?)?
        }
        Method::Position => serde_json::to_value(session.position().await?)?,
        Method::Enter => {
            let data = param(method, params, 0)?
                .as_str()
                .ok_or_else(|| bad_param(method, "a string"))?;
            session.enter(data.to_string()).await?;
            Value::Null
        }
        Method::ShowMeHow => serde_json::to_value(session.show_me_how().await?)?,
        Method::Pause => {
            session.pause()?;
            Value::Null
        }
        Method::ReadStudentTerminal | Method::ReadTutorTerminal => {
            return Err(TutorError::InvalidMessage(format!(
                "{} is a streaming call",
                method.name()
            )));
        }
    })
}

/// Open the role's terminal and forward its output until it ends.
async fn stream_terminal(session: &SessionController, role: Role, reply: &Reply) -> TutorResult<()> {
    let (tx, mut rx) = mpsc::channel::<String>(TERMINAL_QUEUE);
    session.open_terminal(role, tx).await?;

    while let Some(chunk) = rx.recv().await {
        if reply.ret_and_continue(Value::String(chunk)).await.is_err() {
            debug!(session_id = %session.id(), role = %role, "reply channel closed, dropping terminal stream");
            return Ok(());
        }
    }

    debug!(session_id = %session.id(), role = %role, "terminal stream ended");
    reply.ret(Value::Null).await;
    Ok(())
}

fn param<'a>(method: Method, params: &'a [Value], index: usize) -> TutorResult<&'a Value> {
    params.get(index).ok_or_else(|| {
        TutorError::InvalidMessage(format!("{} expects parameter {index}", method.name()))
    })
}

fn bad_param(method: Method, expected: &str) -> TutorError {
    TutorError::InvalidMessage(format!("{} expects {expected}", method.name()))
}

/// Course ids arrive as strings or bare numbers.
fn course_id_param(method: Method, params: &[Value]) -> TutorResult<String> {
    match param(method, params, 0)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(bad_param(method, "a course id")),
    }
}
