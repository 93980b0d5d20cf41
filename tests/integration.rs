//! Integration tests for packwire.
//!
//! Every test runs a real server on loopback and talks to it with blocking
//! std sockets (or a packwire client), recording observer events.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use packwire::{
    ErrorKind, Frame, LengthPrefixed, Observer, PackwireError, ParseOutcome, PrefixWidth,
    Server, Session, SessionConfig, SessionId, State,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Listen,
    Accept(SessionId),
    Recv(SessionId, Vec<u8>),
    Send(SessionId, Vec<u8>, Option<ErrorKind>),
    Close(SessionId, Option<ErrorKind>),
    Shutdown,
}

#[derive(Default)]
struct Behavior {
    echo: bool,
    veto_accept: bool,
    stop_on_listen: bool,
    retain_frames: bool,
    /// Queue these payloads and stop from inside `on_recv`.
    send_then_stop: Option<Vec<&'static [u8]>>,
}

#[derive(Default)]
struct Recorder {
    behavior: Behavior,
    events: Mutex<Vec<Event>>,
    changed: Condvar,
    sessions: Mutex<Vec<Session>>,
    retained: Mutex<Vec<Frame>>,
    server: Mutex<Option<Arc<Server>>>,
}

impl Recorder {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ..Self::default()
        })
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        let mut events = self.events.lock();
        while !pred(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return pred(&events);
            }
        }
        true
    }

    fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }
}

impl Observer for Recorder {
    fn on_listen(&self) {
        self.push(Event::Listen);
        if self.behavior.stop_on_listen {
            if let Some(server) = self.server.lock().as_ref() {
                server.stop();
            }
        }
    }

    fn on_accept(&self, session: &Session) {
        self.sessions.lock().push(session.clone());
        self.push(Event::Accept(session.id()));
        if self.behavior.veto_accept {
            session.stop();
        }
    }

    fn on_recv(&self, session: &Session, frame: &Frame) {
        self.push(Event::Recv(session.id(), frame.to_vec()));
        if self.behavior.retain_frames {
            self.retained.lock().push(frame.clone());
        }
        if self.behavior.echo {
            session.send(frame.to_bytes()).unwrap();
        }
        if let Some(payloads) = &self.behavior.send_then_stop {
            for payload in payloads {
                session.send(Bytes::from_static(payload)).unwrap();
            }
            session.stop();
        }
    }

    fn on_send(&self, session: &Session, data: &Bytes, error: Option<&PackwireError>) {
        self.push(Event::Send(
            session.id(),
            data.to_vec(),
            error.map(PackwireError::kind),
        ));
    }

    fn on_close(&self, session: &Session, error: Option<&PackwireError>) {
        self.push(Event::Close(session.id(), error.map(PackwireError::kind)));
    }

    fn on_shutdown(&self, _error: Option<&PackwireError>) {
        self.push(Event::Shutdown);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SessionConfig {
    SessionConfig::new("127.0.0.1", 0)
        .with_io_pool_size(2)
        .with_handshake_timeout(2)
        .with_protocol_fault_assert(false)
}

fn start_server(
    config: SessionConfig,
    recorder: &Arc<Recorder>,
    parser: impl packwire::FrameParser,
) -> (Arc<Server>, SocketAddr) {
    init_tracing();
    let server = Arc::new(
        Server::builder(config)
            .shared_observer(Arc::clone(recorder) as Arc<dyn Observer>)
            .parser(parser)
            .build()
            .unwrap(),
    );
    let addr = server.start().unwrap();
    (server, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Poll `pred` until it holds or the wait expires.
fn eventually(pred: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

fn is_close(event: &Event) -> bool {
    matches!(event, Event::Close(..))
}

#[test]
fn test_echo_roundtrip() {
    let recorder = Recorder::new(Behavior {
        echo: true,
        ..Behavior::default()
    });
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let mut client = connect(addr);
    client.write_all(b"hello").unwrap();
    assert_eq!(read_exact(&mut client, 5), b"hello");

    assert!(recorder.wait_until(|events| events
        .iter()
        .any(|e| matches!(e, Event::Send(_, data, None) if data == b"hello"))));

    let events = recorder.events();
    assert_eq!(events[0], Event::Listen);
    assert!(matches!(events[1], Event::Accept(_)));
    assert_eq!(server.session_count(), 1);

    assert!(server.stop_and_wait());
}

#[test]
fn test_length_prefixed_frames_across_reads() {
    let recorder = Recorder::new(Behavior::default());
    let parser = LengthPrefixed::new(PrefixWidth::U16);
    let (server, addr) = start_server(config(), &recorder, parser);

    let mut wire = Vec::new();
    for payload in [&b"alpha"[..], b"beta", b"gamma-delta"] {
        wire.extend_from_slice(&parser.encode(payload).unwrap());
    }

    let mut client = connect(addr);
    for chunk in wire.chunks(3) {
        client.write_all(chunk).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(recorder.wait_until(|events| {
        Recorder::count(events, |e| matches!(e, Event::Recv(..))) == 3
    }));
    let frames: Vec<Vec<u8>> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Recv(_, data) => Some(data),
            _ => None,
        })
        .collect();
    let payloads: Vec<&[u8]> = frames.iter().filter_map(|f| parser.payload(f)).collect();
    assert_eq!(payloads, vec![&b"alpha"[..], b"beta", b"gamma-delta"]);

    assert!(server.stop_and_wait());
}

#[test]
fn test_session_closes_precede_shutdown() {
    const CLIENTS: usize = 5;
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let clients: Vec<TcpStream> = (0..CLIENTS).map(|_| connect(addr)).collect();
    assert!(recorder.wait_until(|events| {
        Recorder::count(events, |e| matches!(e, Event::Accept(_))) == CLIENTS
    }));
    assert!(eventually(|| server.session_count() == CLIENTS));

    assert!(server.stop_and_wait());
    assert_eq!(server.state(), State::Stopped);

    let events = recorder.events();
    let shutdown_at = events
        .iter()
        .position(|e| *e == Event::Shutdown)
        .expect("shutdown notification");
    let closes: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| is_close(e))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(closes.len(), CLIENTS);
    assert!(closes.iter().all(|&i| i < shutdown_at));
    assert_eq!(Recorder::count(&events, |e| *e == Event::Shutdown), 1);
    // local stop is not an error
    assert!(events
        .iter()
        .all(|e| !matches!(e, Event::Close(_, Some(_)))));
    drop(clients);
}

#[test]
fn test_veto_in_on_accept() {
    let recorder = Recorder::new(Behavior {
        veto_accept: true,
        ..Behavior::default()
    });
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let mut client = connect(addr);
    assert!(recorder.wait_until(|events| events.iter().any(is_close)));

    // the socket is closed without ever reading
    let _ = client.write_all(b"ignored");
    let mut buf = [0u8; 8];
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

    let events = recorder.events();
    assert_eq!(Recorder::count(&events, is_close), 1);
    assert!(!events.iter().any(|e| matches!(e, Event::Recv(..))));
    assert!(matches!(events.last(), Some(Event::Close(_, None))));
    assert_eq!(server.session_count(), 0);

    let session = recorder.sessions.lock()[0].clone();
    assert!(session.wait_stopped_blocking(WAIT));
    assert!(server.stop_and_wait());
}

#[test]
fn test_silence_timeout_closes_idle_session() {
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(config().with_silence_timeout(1), &recorder, packwire::Passthrough);

    let _client = connect(addr);
    assert!(recorder.wait_until(|events| events.iter().any(is_close)));
    assert!(matches!(
        recorder.events().last(),
        Some(Event::Close(_, Some(ErrorKind::Timeout)))
    ));
    assert!(server.stop_and_wait());
}

#[test]
fn test_recv_buffer_too_small() {
    let recorder = Recorder::new(Behavior::default());
    let never_complete = |_: &[u8]| ParseOutcome::NeedMore;
    let (server, addr) = start_server(
        config().with_recv_buffer_size(10),
        &recorder,
        never_complete,
    );

    let mut client = connect(addr);
    client.write_all(&[1u8; 10]).unwrap();

    assert!(recorder.wait_until(|events| events.iter().any(is_close)));
    assert!(matches!(
        recorder.events().last(),
        Some(Event::Close(_, Some(ErrorKind::RecvBufferTooSmall)))
    ));
    assert!(!recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::Recv(..))));
    assert!(server.stop_and_wait());
}

#[test]
fn test_invalid_data_closes_session() {
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(config(), &recorder, |_: &[u8]| ParseOutcome::Invalid);

    let mut client = connect(addr);
    client.write_all(b"garbage").unwrap();

    assert!(recorder.wait_until(|events| events.iter().any(is_close)));
    assert!(matches!(
        recorder.events().last(),
        Some(Event::Close(_, Some(ErrorKind::RecvDataInvalid)))
    ));
    assert!(server.stop_and_wait());
}

#[test]
fn test_protocol_fault_assert_still_drains_shutdown() {
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(
        config().with_protocol_fault_assert(true),
        &recorder,
        |_: &[u8]| ParseOutcome::Invalid,
    );

    let mut client = connect(addr);
    client.write_all(b"garbage").unwrap();

    assert!(recorder.wait_until(|events| events.iter().any(is_close)));
    assert!(eventually(|| server.session_count() == 0));

    assert!(server.stop_and_wait());
    assert_eq!(server.state(), State::Stopped);
    let events = recorder.events();
    assert_eq!(Recorder::count(&events, is_close), 1);
    assert_eq!(events.last(), Some(&Event::Shutdown));
}

#[test]
fn test_retained_frame_is_never_overwritten() {
    let recorder = Recorder::new(Behavior {
        retain_frames: true,
        ..Behavior::default()
    });
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let mut client = connect(addr);
    client.write_all(b"first").unwrap();
    assert!(recorder.wait_until(|events| {
        Recorder::count(events, |e| matches!(e, Event::Recv(..))) == 1
    }));

    client.write_all(b"XXXXXXXX").unwrap();
    assert!(recorder.wait_until(|events| {
        Recorder::count(events, |e| matches!(e, Event::Recv(..))) == 2
    }));

    let retained = recorder.retained.lock();
    assert_eq!(retained[0].as_bytes(), b"first");
    assert_eq!(retained[1].as_bytes(), b"XXXXXXXX");
    drop(retained);

    assert!(server.stop_and_wait());
}

#[test]
fn test_send_after_close_and_repeated_stop() {
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let client = connect(addr);
    assert!(recorder.wait_until(|events| events.iter().any(|e| matches!(e, Event::Accept(_)))));
    let session = recorder.sessions.lock()[0].clone();
    assert!(session.is_running());
    assert!(matches!(
        session.send(Bytes::new()),
        Err(PackwireError::InvalidParameter(_))
    ));

    drop(client);
    assert!(recorder.wait_until(|events| events.iter().any(is_close)));
    assert!(session.wait_stopped_blocking(WAIT));
    // peer EOF is a transport error
    assert!(matches!(
        recorder.events().last(),
        Some(Event::Close(_, Some(ErrorKind::Transport)))
    ));

    assert!(matches!(session.send("late"), Err(PackwireError::NotReady)));
    session.stop();
    session.stop();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(Recorder::count(&recorder.events(), is_close), 1);
    assert_eq!(server.session_count(), 0);

    assert!(server.stop_and_wait());
}

#[test]
fn test_pending_sends_reported_not_ready_on_close() {
    let recorder = Recorder::new(Behavior {
        send_then_stop: Some(vec![&b"one"[..], &b"two"[..]]),
        ..Behavior::default()
    });
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let mut client = connect(addr);
    client.write_all(b"go").unwrap();
    assert!(recorder.wait_until(|events| events.iter().any(is_close)));

    let sends: Vec<Event> = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Send(..)))
        .collect();
    assert_eq!(sends.len(), 2);
    assert!(sends
        .iter()
        .all(|e| matches!(e, Event::Send(_, _, Some(ErrorKind::NotReady)))));
    assert!(server.stop_and_wait());
}

#[test]
fn test_stop_during_on_listen_aborts_start() {
    let recorder = Recorder::new(Behavior {
        stop_on_listen: true,
        ..Behavior::default()
    });
    init_tracing();
    let server = Arc::new(
        Server::builder(config())
            .shared_observer(Arc::clone(&recorder) as Arc<dyn Observer>)
            .build()
            .unwrap(),
    );
    *recorder.server.lock() = Some(Arc::clone(&server));

    assert!(matches!(server.start(), Err(PackwireError::Cancelled)));
    assert!(server.stop_and_wait());
    assert_eq!(server.state(), State::Stopped);
    assert_eq!(recorder.events(), vec![Event::Listen]);

    recorder.server.lock().take();
}

#[test]
fn test_broadcast_reaches_every_session() {
    let recorder = Recorder::new(Behavior::default());
    let (server, addr) = start_server(config(), &recorder, packwire::Passthrough);

    let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(addr)).collect();
    assert!(eventually(|| server.session_count() == 3));

    assert_eq!(server.sessions().broadcast("hey"), 3);
    for client in &mut clients {
        assert_eq!(read_exact(client, 3), b"hey");
    }
    assert!(server.stop_and_wait());
}

#[test]
fn test_url_configured_server() {
    let config: SessionConfig = "tcp://127.0.0.1:0/?io_pool_size=3&recv_buffer_size=64"
        .parse()
        .unwrap();
    let server = Server::builder(config).build().unwrap();
    assert_eq!(server.worker_count(), 3);
    assert!(server.start().is_ok());
    assert!(server.local_addr().is_some());
    assert!(server.stop_and_wait());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_roundtrip() {
    let server_recorder = Recorder::new(Behavior {
        echo: true,
        ..Behavior::default()
    });
    let (server, addr) = start_server(config(), &server_recorder, packwire::Passthrough);

    let client_recorder = Recorder::new(Behavior::default());
    let client = packwire::Client::builder(
        SessionConfig::new("127.0.0.1", addr.port())
            .with_io_pool_size(1)
            .with_protocol_fault_assert(false),
    )
    .shared_observer(Arc::clone(&client_recorder) as Arc<dyn Observer>)
    .start()
    .await
    .unwrap();
    assert_eq!(client.peer_addr(), addr);

    let accepted = Arc::clone(&client_recorder);
    tokio::task::spawn_blocking(move || {
        accepted.wait_until(|events| events.iter().any(|e| matches!(e, Event::Accept(_))))
    })
    .await
    .unwrap();

    client.send("ping").unwrap();
    let received = Arc::clone(&client_recorder);
    let got_echo = tokio::task::spawn_blocking(move || {
        received.wait_until(|events| {
            events
                .iter()
                .any(|e| matches!(e, Event::Recv(_, data) if data == b"ping"))
        })
    })
    .await
    .unwrap();
    assert!(got_echo);

    client.stop();
    client.stopped().await;
    assert_eq!(client.state(), State::Stopped);
    assert!(matches!(
        client_recorder.events().last(),
        Some(Event::Close(_, None))
    ));

    tokio::task::spawn_blocking(move || assert!(server.stop_and_wait()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_client_connect_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = packwire::Client::builder(SessionConfig::new("127.0.0.1", port).with_io_pool_size(1))
        .start()
        .await;
    assert!(matches!(result, Err(PackwireError::Transport(_))));
}
