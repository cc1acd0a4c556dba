//! # lowloop HTTP/1.1 Server
//!
//! Single loop thread, callback style. Every connection gets a server-side
//! HTTP framer from the listener; files are read on the worker pool.
//!
//! ## Usage
//!
//!     cargo run -p lowloop-httpd --release -- [--port 8080] [--workers 4] [--dir ./public]
//!
//! Without `--dir` (or a positional directory) every request gets the hello
//! body.
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;

use lowloop::{
    kdebug, kerror, kinfo, kprintln, Connection, Engine, EngineConfig, HttpDirect, HttpMessage, ListenOptions,
    Listener, LoopContext, LoopError, LoopHost, LoopResult, SlotId,
};

// ── Configuration ──

const HELLO_BODY: &[u8] = b"Hello from lowloop!\n";
const STATS_INTERVAL_MS: i64 = 5000;

struct Options {
    port: u16,
    dir: Option<PathBuf>,
    workers: Option<usize>,
    max_heap: Option<usize>,
    version: bool,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        port: 8080,
        dir: None,
        workers: None,
        max_heap: None,
        version: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                opts.port = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .ok_or("--port needs a number")?;
            }
            "--dir" | "-d" => {
                i += 1;
                opts.dir = Some(args.get(i).ok_or("--dir needs a path")?.into());
            }
            "--workers" | "-w" => {
                i += 1;
                opts.workers = Some(
                    args.get(i)
                        .and_then(|s| s.parse().ok())
                        .ok_or("--workers needs a number")?,
                );
            }
            "--max-heap" => {
                i += 1;
                opts.max_heap = Some(
                    args.get(i)
                        .and_then(|s| s.parse().ok())
                        .ok_or("--max-heap needs a size in MB")?,
                );
            }
            "-v" | "--version" => opts.version = true,
            s if s.starts_with('-') => return Err(format!("unknown option {}", s)),
            s => opts.dir = Some(s.into()),
        }
        i += 1;
    }
    Ok(opts)
}

// ── Server state (loop thread only) ──

#[derive(Default)]
struct Stats {
    requests: Cell<u64>,
    connections: Cell<u64>,
    bytes_in: Cell<u64>,
    bytes_out: Cell<u64>,
}

struct Server {
    root: Option<PathBuf>,
    stats: Stats,
    listener: RefCell<Option<Arc<Listener>>>,
    stats_timer: Cell<Option<SlotId>>,
}

impl Server {
    fn account(&self, http: &HttpDirect) {
        let (read, written) = http.take_counters();
        self.stats.bytes_in.set(self.stats.bytes_in.get() + read);
        self.stats.bytes_out.set(self.stats.bytes_out.get() + written);
    }

    fn stop(&self, cx: &mut LoopContext) {
        if let Some(l) = self.listener.borrow_mut().take() {
            kinfo!("closing listener on {}", l.local_addr());
            l.close(cx);
        }
        if let Some(id) = self.stats_timer.take() {
            cx.clear_timer(id);
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Map a request target onto `root`. `None` for targets that climb out.
fn resolve(root: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or("");
    let mut out = root.to_path_buf();
    for part in Path::new(path.trim_start_matches('/')).components() {
        match part {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path.is_empty() || path.ends_with('/') {
        out.push("index.html");
    }
    Some(out)
}

// ── Request handling ──

fn send(
    cx: &mut LoopContext,
    server: &Rc<Server>,
    http: &Arc<HttpDirect>,
    msg: &HttpMessage,
    status: u16,
    ctype: &str,
    body: Vec<u8>,
) -> LoopResult<()> {
    let connection = if msg.keep_alive { "keep-alive" } else { "close" };
    let headers = [
        ("Content-Type", ctype.to_string()),
        ("Connection", connection.to_string()),
        ("Server", "lowloop-httpd".to_string()),
    ];
    let (server, h2) = (server.clone(), http.clone());
    http.respond(cx, status, &headers, body, move |_, res| {
        server.account(&h2);
        if let Err(e) = res {
            kdebug!("response not delivered: {}", e);
        }
        Ok(())
    })
}

fn handle_request(cx: &mut LoopContext, server: &Rc<Server>, http: &Arc<HttpDirect>, msg: HttpMessage) -> LoopResult<()> {
    let stats = &server.stats;
    stats.requests.set(stats.requests.get() + 1);
    if msg.head.method() != "GET" {
        return send(cx, server, http, &msg, 405, "text/plain", b"method not allowed\n".to_vec());
    }
    let Some(root) = &server.root else {
        return send(cx, server, http, &msg, 200, "text/plain", HELLO_BODY.to_vec());
    };
    let Some(path) = resolve(root, msg.head.target()) else {
        return send(cx, server, http, &msg, 400, "text/plain", b"bad path\n".to_vec());
    };
    let ctype = content_type(&path);
    let (server, http) = (server.clone(), http.clone());
    cx.fs_read_file(path, move |cx, res| match res {
        Ok(body) => send(cx, &server, &http, &msg, 200, ctype, body),
        Err(e) if matches!(e.errno(), Some(libc::ENOENT) | Some(libc::EISDIR) | Some(libc::ENOTDIR)) => {
            send(cx, &server, &http, &msg, 404, "text/plain", b"not found\n".to_vec())
        }
        Err(e) => {
            kerror!("read failed: {} [{}]", e, e.code());
            send(cx, &server, &http, &msg, 500, "text/plain", b"internal error\n".to_vec())
        }
    })?;
    Ok(())
}

fn on_connection(cx: &mut LoopContext, server: &Rc<Server>, conn: LoopResult<Connection>) -> LoopResult<()> {
    let conn = match conn {
        Ok(c) => c,
        Err(e) => {
            kerror!("accept failed: {}", e);
            return Ok(());
        }
    };
    let Some(http) = conn.http else {
        return Err(LoopError::Fatal("listener not in http mode".into()));
    };
    let stats = &server.stats;
    stats.connections.set(stats.connections.get() + 1);
    if let Err(e) = conn.socket.set_nodelay(true) {
        kdebug!("nodelay: {}", e);
    }
    let (server, h2) = (server.clone(), http.clone());
    http.on_message(cx, move |cx, msg| match msg {
        Ok(msg) => handle_request(cx, &server, &h2, msg),
        Err(e) => {
            kdebug!("connection dropped: {} [{}]", e, e.code());
            Ok(())
        }
    })
}

// ── Host ──

struct HttpdHost {
    server: Rc<Server>,
}

impl LoopHost for HttpdHost {
    fn signal(&mut self, cx: &mut LoopContext, signum: i32) -> bool {
        if signum == libc::SIGINT || signum == libc::SIGTERM {
            kinfo!("signal {}, shutting down", signum);
            self.server.stop(cx);
            return true;
        }
        signum == libc::SIGPIPE
    }

    fn exit(&mut self, _cx: &mut LoopContext) {
        let s = &self.server.stats;
        kprintln!(
            "lowloop-httpd: shutdown: {} requests, {} connections, {} bytes in, {} bytes out",
            s.requests.get(),
            s.connections.get(),
            s.bytes_in.get(),
            s.bytes_out.get()
        );
    }
}

// ── Main ──

fn run(opts: Options) -> LoopResult<i32> {
    let mut config = EngineConfig::from_env().max_heap(opts.max_heap);
    if let Some(w) = opts.workers {
        config = config.num_workers(w);
    }
    config.validate()?;

    let server = Rc::new(Server {
        root: opts.dir,
        stats: Stats::default(),
        listener: RefCell::new(None),
        stats_timer: Cell::new(None),
    });
    kinfo!(
        "port={} workers={} root={:?}",
        opts.port,
        config.num_workers,
        server.root.as_deref().unwrap_or(Path::new("(hello)"))
    );

    let host = HttpdHost { server: server.clone() };
    let mut engine = Engine::new(config, Box::new(host))?;
    engine.with_context(|cx| -> LoopResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], opts.port));
        let options = ListenOptions {
            http: true,
            ..Default::default()
        };
        let s2 = server.clone();
        let listener = Listener::bind(cx, addr, options, move |cx, conn| on_connection(cx, &s2, conn))?;
        kprintln!("lowloop-httpd: listening on http://{}/", listener.local_addr());
        *server.listener.borrow_mut() = Some(listener);

        let s3 = server.clone();
        let last = Cell::new(0u64);
        let timer = cx.set_interval(STATS_INTERVAL_MS, move |_| {
            let total = s3.stats.requests.get();
            let rps = (total - last.replace(total)) as f64 * 1000.0 / STATS_INTERVAL_MS as f64;
            kinfo!(
                "conns={} reqs={} rps={:.0}",
                s3.stats.connections.get(),
                total,
                rps
            );
            Ok(())
        })?;
        cx.timer_ref(timer, false);
        server.stats_timer.set(Some(timer));
        Ok(())
    })?;
    engine.run()
}

fn main() -> ExitCode {
    lowloop::init_logging();
    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("lowloop-httpd: {}", msg);
            eprintln!("usage: lowloop-httpd [--port N] [--workers N] [--max-heap MB] [--dir PATH | PATH] [-v]");
            return ExitCode::from(1);
        }
    };
    if opts.version {
        println!("lowloop-httpd {}", lowloop::VERSION);
        return ExitCode::SUCCESS;
    }
    match run(opts) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            kerror!("lowloop-httpd: {} [{}]", e, e.code());
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("lowloop-httpd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let o = parse_args(&args(&["--port", "9000", "-w", "2", "--max-heap", "512", "public"])).unwrap();
        assert_eq!(o.port, 9000);
        assert_eq!(o.workers, Some(2));
        assert_eq!(o.max_heap, Some(512));
        assert_eq!(o.dir.as_deref(), Some(Path::new("public")));
        assert!(!o.version);
        assert!(parse_args(&args(&["-v"])).unwrap().version);
        assert!(parse_args(&args(&["--port"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_resolve() {
        let root = Path::new("/srv");
        assert_eq!(resolve(root, "/"), Some(PathBuf::from("/srv/index.html")));
        assert_eq!(resolve(root, "/a/b.css?x=1"), Some(PathBuf::from("/srv/a/b.css")));
        assert_eq!(resolve(root, "/docs/"), Some(PathBuf::from("/srv/docs/index.html")));
        assert_eq!(resolve(root, "/../etc/passwd"), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("x.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("x.bin")), "application/octet-stream");
    }
}
