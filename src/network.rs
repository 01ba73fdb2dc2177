//! Network sinks and sources
//!
//! Raw output, raw input and SBS run as line-oriented TCP servers fed from
//! broadcast channels; HTTP serves the roster snapshot as `data.json` plus
//! static assets from the web root. All of it lives on the tokio runtime,
//! away from the decoder thread.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::aircraft::Roster;
use crate::config::Config;
use crate::message;
use crate::pipeline::unix_now_ms;
use crate::stats::Stats;

const BROADCAST_CAPACITY: usize = 1024;

/// One sender per line-oriented sink. The decoded-message processor feeds
/// these; each connected client holds a receiver.
#[derive(Clone)]
pub struct Broadcasts {
    pub raw: broadcast::Sender<Bytes>,
    pub sbs: broadcast::Sender<Bytes>,
}

impl Broadcasts {
    pub fn new() -> Self {
        let (raw, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (sbs, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { raw, sbs }
    }
}

impl Default for Broadcasts {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_servers(
    config: Config,
    roster: Arc<RwLock<Roster>>,
    stats: Arc<Stats>,
    broadcasts: Broadcasts,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ro_port = config.net_ro_port;
    let sbs_port = config.net_sbs_port;

    let raw_out = {
        let tx = broadcasts.raw.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = run_raw_output_server(ro_port, tx, stats).await {
                error!("raw output server error: {e}");
            }
        })
    };

    let raw_in = {
        let tx = broadcasts.raw.clone();
        let roster = Arc::clone(&roster);
        let stats = Arc::clone(&stats);
        let cfg = config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_raw_input_server(cfg, roster, tx, stats).await {
                error!("raw input server error: {e}");
            }
        })
    };

    let sbs = {
        let tx = broadcasts.sbs.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = run_sbs_server(sbs_port, tx, stats).await {
                error!("SBS server error: {e}");
            }
        })
    };

    let http = {
        let roster = Arc::clone(&roster);
        let stats = Arc::clone(&stats);
        let cfg = config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(cfg, roster, stats).await {
                error!("HTTP server error: {e}");
            }
        })
    };

    tokio::select! {
        _ = raw_out => {}
        _ = raw_in => {}
        _ = sbs => {}
        _ = http => {}
    }
    Ok(())
}

async fn run_raw_output_server(
    port: u16,
    tx: broadcast::Sender<Bytes>,
    stats: Arc<Stats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("raw output server listening on port {port}");

    loop {
        let (mut socket, addr) = listener.accept().await?;
        debug!("raw output client connected: {addr}");
        Stats::bump(&stats.sinks.raw_out_clients_accepted);

        let mut rx = tx.subscribe();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(&line).await.is_err()
                            || socket.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                        Stats::add(&stats.sinks.raw_out_bytes, line.len() as u64 + 1);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            Stats::bump(&stats.sinks.raw_out_clients_removed);
            debug!("raw output client disconnected: {addr}");
        });
    }
}

async fn run_sbs_server(
    port: u16,
    tx: broadcast::Sender<Bytes>,
    stats: Arc<Stats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("SBS server listening on port {port}");

    loop {
        let (mut socket, addr) = listener.accept().await?;
        debug!("SBS client connected: {addr}");
        Stats::bump(&stats.sinks.sbs_clients_accepted);

        let mut rx = tx.subscribe();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(&line).await.is_err()
                            || socket.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                        Stats::add(&stats.sinks.sbs_bytes, line.len() as u64 + 1);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            Stats::bump(&stats.sinks.sbs_clients_removed);
            debug!("SBS client disconnected: {addr}");
        });
    }
}

/// Accept `*hex;` lines from clients and replay them through the decoder as
/// if locally demodulated. Malformed lines are silently dropped.
async fn run_raw_input_server(
    config: Config,
    roster: Arc<RwLock<Roster>>,
    raw_tx: broadcast::Sender<Bytes>,
    stats: Arc<Stats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", config.net_ri_port)).await?;
    info!("raw input server listening on port {}", config.net_ri_port);

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("raw input client connected: {addr}");

        let roster = Arc::clone(&roster);
        let stats = Arc::clone(&stats);
        let raw_tx = raw_tx.clone();
        let config = config.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                Stats::add(&stats.sinks.raw_in_bytes, line.len() as u64 + 1);

                let Some(mm) =
                    message::decode_raw_line(&line, config.fix_errors, config.aggressive)
                else {
                    continue;
                };
                if !mm.crc_ok && config.check_crc {
                    continue;
                }

                Stats::bump(&stats.sinks.raw_in_messages);
                if mm.crc_ok {
                    roster.write().update(&mm, unix_now_ms());
                }
                let _ = raw_tx.send(Bytes::from(mm.to_raw_line()));
            }
            debug!("raw input client disconnected: {addr}");
        });
    }
}

async fn run_http_server(
    config: Config,
    roster: Arc<RwLock<Roster>>,
    stats: Arc<Stats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", config.net_http_port)).await?;
    info!("HTTP server listening on port {}", config.net_http_port);

    let web_root = PathBuf::from(&config.web_root);
    let index_page = config.index_page.clone();

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("HTTP client connected: {addr}");
        Stats::bump(&stats.sinks.http_clients_accepted);

        let roster = Arc::clone(&roster);
        let stats = Arc::clone(&stats);
        let web_root = web_root.clone();
        let index_page = index_page.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_http_request(socket, roster, stats, web_root, index_page).await {
                debug!("HTTP error: {e}");
            }
        });
    }
}

async fn handle_http_request(
    mut socket: TcpStream,
    roster: Arc<RwLock<Roster>>,
    stats: Arc<Stats>,
    web_root: PathBuf,
    index_page: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = vec![0u8; 8192];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (Some(_method), Some(url)) = (parts.next(), parts.next()) else {
        return Ok(());
    };
    let path = url.split('?').next().unwrap_or(url);

    let response = if path == "/" {
        redirect_response(&index_page)
    } else if path == "/data.json" {
        let json = roster.read().to_json();
        content_response("application/json;charset=utf-8", json.into_bytes())
    } else {
        match resolve_static_path(&web_root, path) {
            Some(file) => match tokio::fs::read(&file).await {
                Ok(body) => content_response(content_type_for(&file), body),
                Err(_) => not_found_response(),
            },
            None => not_found_response(),
        }
    };

    Stats::add(&stats.sinks.http_bytes, response.len() as u64);
    socket.write_all(&response).await?;
    Ok(())
}

fn redirect_response(index_page: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 302 Found\r\n\
         Server: squawk1090\r\n\
         Location: /{index_page}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

fn content_response(content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Server: squawk1090\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

fn not_found_response() -> Vec<u8> {
    let body = b"not found";
    let mut response = format!(
        "HTTP/1.1 404 Not Found\r\n\
         Server: squawk1090\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Map a request path onto the web root, refusing anything that would
/// escape it.
fn resolve_static_path(web_root: &Path, url_path: &str) -> Option<PathBuf> {
    let rel = url_path.trim_start_matches('/');
    if rel.is_empty() {
        return None;
    }

    let rel = Path::new(rel);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(web_root.join(rel))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html;charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json;charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_paths_stay_inside_web_root() {
        let root = Path::new("/srv/web");
        assert_eq!(
            resolve_static_path(root, "/gmap.html"),
            Some(PathBuf::from("/srv/web/gmap.html"))
        );
        assert_eq!(
            resolve_static_path(root, "/js/map.js"),
            Some(PathBuf::from("/srv/web/js/map.js"))
        );
        assert_eq!(resolve_static_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_static_path(root, "/js/../../etc/passwd"), None);
        assert_eq!(resolve_static_path(root, "/"), None);
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("a.html")), "text/html;charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.js")), "application/javascript");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }

    #[test]
    fn redirect_points_at_index_page() {
        let response = String::from_utf8(redirect_response("gmap.html")).unwrap();
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains("Location: /gmap.html\r\n"));
    }

    #[test]
    fn content_response_frames_the_body() {
        let response = content_response("text/plain", b"hello".to_vec());
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }
}
