//! In-process RESP servers for the integration tests
//!
//! Each [`MockServer`] listens on `127.0.0.1:0`, decodes requests with the
//! crate's own decoder and answers through a handler. MULTI/EXEC, ASKING and
//! QUIT are handled per connection; everything else goes to the handler.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use resp_oxide::protocol::{RespDecoder, RespEncoder};
use resp_oxide::{key_slot, Cmd, ProtocolVersion, RespValue, Script};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Request<'a> {
    pub args: &'a [String],
    pub port: u16,
    pub asking: bool,
}

pub type Handler = Arc<dyn Fn(&Request<'_>) -> RespValue + Send + Sync>;

pub struct MockServer {
    pub port: u16,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (task_log, task_accepted) = (Arc::clone(&log), Arc::clone(&accepted));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                task_accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    stream,
                    Arc::clone(&handler),
                    port,
                    Arc::clone(&task_log),
                ));
            }
        });

        Self { port, log, accepted }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Every request received so far, across connections
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    /// How many requests named `name` were received
    pub fn count(&self, name: &str) -> usize {
        self.commands()
            .iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name))
            .count()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut stream: TcpStream,
    handler: Handler,
    port: u16,
    log: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let mut decoder = RespDecoder::new(ProtocolVersion::Resp2);
    let mut buf = BytesMut::with_capacity(4096);
    let mut asking = false;
    let mut multi: Option<Vec<RespValue>> = None;
    let mut dirty = false;

    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut out = BytesMut::new();
        let mut quit = false;
        while let Ok(Some(frame)) = decoder.decode(&mut buf) {
            let args = to_args(&frame);
            log.lock().unwrap().push(args.clone());
            let name = args[0].to_ascii_uppercase();

            let reply = match name.as_str() {
                "QUIT" => {
                    quit = true;
                    ok()
                }
                "ASKING" => {
                    asking = true;
                    ok()
                }
                "MULTI" => {
                    multi = Some(Vec::new());
                    dirty = false;
                    ok()
                }
                "EXEC" => match multi.take() {
                    Some(_) if dirty => {
                        error("EXECABORT Transaction discarded because of previous errors.")
                    }
                    Some(results) => RespValue::Array(results),
                    None => error("ERR EXEC without MULTI"),
                },
                _ => {
                    let reply = handler(&Request {
                        args: &args,
                        port,
                        asking,
                    });
                    asking = false;
                    match multi.as_mut() {
                        Some(_) if is_queue_error(&reply) => {
                            dirty = true;
                            reply
                        }
                        Some(queued) => {
                            queued.push(reply);
                            RespValue::SimpleString("QUEUED".into())
                        }
                        None => reply,
                    }
                }
            };
            RespEncoder::encode(&reply, &mut out);
            if quit {
                break;
            }
        }

        if stream.write_all(&out).await.is_err() || quit {
            return;
        }
    }
}

fn is_queue_error(reply: &RespValue) -> bool {
    matches!(reply, RespValue::Error(msg)
        if msg.starts_with("ERR unknown command") || msg.starts_with("MOVED"))
}

fn to_args(frame: &RespValue) -> Vec<String> {
    frame
        .as_array()
        .unwrap_or_default()
        .iter()
        .map(|arg| arg.as_string().unwrap_or_default())
        .collect()
}

pub fn ok() -> RespValue {
    RespValue::SimpleString("OK".into())
}

pub fn error(msg: impl Into<String>) -> RespValue {
    RespValue::Error(msg.into())
}

pub fn bulk(value: impl Into<String>) -> RespValue {
    RespValue::BulkString(Bytes::from(value.into()))
}

/// A keyspace plus the scripts loaded into it
#[derive(Default)]
pub struct Keyspace {
    values: Mutex<HashMap<String, String>>,
    scripts: Mutex<HashSet<String>>,
}

impl Keyspace {
    pub fn execute(&self, args: &[String], port: u16) -> RespValue {
        let name = args[0].to_ascii_uppercase();
        let mut values = self.values.lock().unwrap();
        match name.as_str() {
            "PING" => RespValue::SimpleString("PONG".into()),
            "HELLO" => error("ERR unknown command 'HELLO'"),
            "INFO" => bulk(format!("# Server\r\ntcp_port:{port}\r\n")),
            "GET" => values.get(&args[1]).map_or(RespValue::Null, |v| bulk(v.clone())),
            "SET" => {
                values.insert(args[1].clone(), args[2].clone());
                ok()
            }
            "DEL" => {
                let removed = args[1..].iter().filter(|k| values.remove(*k).is_some()).count();
                RespValue::Integer(removed as i64)
            }
            "INCR" | "INCRBY" => {
                let by = args.get(2).and_then(|v| v.parse::<i64>().ok()).unwrap_or(1);
                let current = values.get(&args[1]).cloned().unwrap_or_else(|| "0".into());
                match current.parse::<i64>() {
                    Ok(n) => {
                        values.insert(args[1].clone(), (n + by).to_string());
                        RespValue::Integer(n + by)
                    }
                    Err(_) => error("ERR value is not an integer or out of range"),
                }
            }
            "PUBLISH" => RespValue::Integer(0),
            "SCRIPT" => {
                let sha = Script::new(args[2].clone()).sha().to_string();
                self.scripts.lock().unwrap().insert(sha.clone());
                bulk(sha)
            }
            "EVALSHA" => {
                if self.scripts.lock().unwrap().contains(&args[1]) {
                    script_result(args)
                } else {
                    error("NOSCRIPT No matching script. Please use EVAL.")
                }
            }
            "EVAL" => {
                let sha = Script::new(args[1].clone()).sha().to_string();
                self.scripts.lock().unwrap().insert(sha);
                script_result(args)
            }
            _ => error(format!("ERR unknown command '{}'", args[0])),
        }
    }
}

/// Scripts in these tests return their first ARGV, or 1
fn script_result(args: &[String]) -> RespValue {
    let numkeys = args[2].parse::<usize>().unwrap_or(0);
    args.get(3 + numkeys).map_or(RespValue::Integer(1), |v| bulk(v.clone()))
}

/// A standalone server
pub fn standalone() -> Handler {
    let keyspace = Arc::new(Keyspace::default());
    Arc::new(move |req: &Request<'_>| match req.args[0].to_ascii_uppercase().as_str() {
        "CLUSTER" => error("ERR This instance has cluster support disabled"),
        _ => keyspace.execute(req.args, req.port),
    })
}

/// Slot layout and keyspace shared by the nodes of a mock cluster
#[derive(Default)]
pub struct ClusterState {
    layout: Mutex<Vec<(u16, u16, u16)>>,
    migrating: Mutex<HashMap<u16, u16>>,
    /// Primary port to replica port
    replicas: Mutex<HashMap<u16, u16>>,
    /// When set, every keyed command is answered with MOVED to this port
    bounce_to: Mutex<Option<u16>>,
    /// Errors to answer keyed commands with before serving them
    transient: Mutex<Vec<String>>,
    keyspace: Keyspace,
}

impl ClusterState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the layout with `(first slot, last slot, port)` ranges
    pub fn assign(&self, layout: Vec<(u16, u16, u16)>) {
        *self.layout.lock().unwrap() = layout;
    }

    /// Answer ASK for `slot`, pointing at `port`
    pub fn migrate(&self, slot: u16, port: u16) {
        self.migrating.lock().unwrap().insert(slot, port);
    }

    /// Announce `replica` as a replica of `primary` in CLUSTER SLOTS
    pub fn add_replica(&self, primary: u16, replica: u16) {
        self.replicas.lock().unwrap().insert(primary, replica);
    }

    /// Answer every keyed command with MOVED to `port`
    pub fn bounce(&self, port: u16) {
        *self.bounce_to.lock().unwrap() = Some(port);
    }

    /// Answer the next keyed commands with `errors`, in order
    pub fn fail_next(&self, errors: &[&str]) {
        let mut transient = self.transient.lock().unwrap();
        transient.extend(errors.iter().rev().map(|e| e.to_string()));
    }

    pub fn owner(&self, slot: u16) -> Option<u16> {
        self.layout
            .lock()
            .unwrap()
            .iter()
            .find(|(first, last, _)| (*first..=*last).contains(&slot))
            .map(|(_, _, port)| *port)
    }

    fn is_replica_of(&self, port: u16, primary: u16) -> bool {
        self.replicas.lock().unwrap().get(&primary) == Some(&port)
    }

    fn cluster_slots(&self) -> RespValue {
        let replicas = self.replicas.lock().unwrap();
        let node = |port: u16| {
            RespValue::Array(vec![
                bulk("127.0.0.1"),
                RespValue::Integer(i64::from(port)),
                bulk(format!("node-{port}")),
            ])
        };
        RespValue::Array(
            self.layout
                .lock()
                .unwrap()
                .iter()
                .map(|(first, last, port)| {
                    let mut entry = vec![
                        RespValue::Integer(i64::from(*first)),
                        RespValue::Integer(i64::from(*last)),
                        node(*port),
                    ];
                    entry.extend(replicas.get(port).map(|replica| node(*replica)));
                    RespValue::Array(entry)
                })
                .collect(),
        )
    }
}

/// One node of a mock cluster
pub fn cluster_node(state: Arc<ClusterState>) -> Handler {
    Arc::new(move |req: &Request<'_>| {
        let name = req.args[0].to_ascii_uppercase();
        if name == "CLUSTER" {
            return match req.args.get(1).map(|s| s.to_ascii_uppercase()).as_deref() {
                Some("SLOTS") => state.cluster_slots(),
                _ => bulk("cluster_state:ok\r\ncluster_enabled:1\r\ncluster_known_nodes:2\r\n"),
            };
        }
        if name == "READONLY" || name == "READWRITE" {
            return ok();
        }

        let cmd = Cmd::new(&req.args[0]).args(req.args[1..].iter().map(String::as_str));
        if let Some(key) = cmd.keys().first() {
            let slot = key_slot(key);
            if let Some(port) = *state.bounce_to.lock().unwrap() {
                return error(format!("MOVED {slot} 127.0.0.1:{port}"));
            }
            if let Some(transient) = state.transient.lock().unwrap().pop() {
                return error(transient);
            }
            let owner = state.owner(slot).unwrap_or(0);
            let migrating = state.migrating.lock().unwrap().get(&slot).copied();
            if state.is_replica_of(req.port, owner) && cmd.is_read_only() {
                return state.keyspace.execute(req.args, req.port);
            }
            if owner == req.port {
                if let Some(target) = migrating {
                    return error(format!("ASK {slot} 127.0.0.1:{target}"));
                }
            } else if !(req.asking && migrating == Some(req.port)) {
                return error(format!("MOVED {slot} 127.0.0.1:{owner}"));
            }
        }
        state.keyspace.execute(req.args, req.port)
    })
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
