use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tiny_http::{Header, Response, Server, StatusCode};
use tracing::info;

/// Static file server for the browser client.
#[derive(Parser, Debug)]
struct Opts {
    /// Address to serve on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// Directory holding index.html, the wasm bundle and assets
    #[arg(long, default_value = "web")]
    root: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let opts = Opts::parse();
    let root = opts
        .root
        .canonicalize()
        .with_context(|| format!("web root {} not found", opts.root.display()))?;

    let server = Server::http(&opts.listen)
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", opts.listen))?;
    info!("serving {} on http://{}", root.display(), opts.listen);

    for request in server.incoming_requests() {
        let url = request.url().to_string();
        let method = request.method().to_string();
        let path = resolve(&root, url.split('?').next().unwrap_or("/"));
        let mut status = StatusCode(200);
        match &path {
            Some(path) => match fs::File::open(path) {
                Ok(file) => {
                    let mut resp = Response::from_file(file);
                    let mime = content_type_for(path);
                    if let Ok(h) = Header::from_bytes("Content-Type", mime.as_bytes()) {
                        resp.add_header(h);
                    }
                    let _ = request.respond(resp);
                }
                Err(_) => {
                    status = StatusCode(404);
                    let _ = request.respond(not_found());
                }
            },
            None => {
                status = StatusCode(404);
                let _ = request.respond(not_found());
            }
        }
        info!("{method} {url} -> {}", status.0);
    }
    Ok(())
}

/// Map a request path into the web root, refusing anything that escapes it.
fn resolve(root: &Path, url: &str) -> Option<PathBuf> {
    let rel = if url == "/" {
        "index.html"
    } else {
        url.trim_start_matches('/')
    };
    let full = root.join(rel);
    let path = if full.is_dir() {
        full.join("index.html")
    } else {
        full
    };
    if path.exists() && path.starts_with(root) {
        Some(path)
    } else {
        None
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "css" => "text/css",
        "wasm" => "application/wasm",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response<Cursor<Vec<u8>>> {
    Response::from_string("Not Found").with_status_code(StatusCode(404))
}
