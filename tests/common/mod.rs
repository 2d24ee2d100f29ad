//! In-process fake ICAP server for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the fake answers a RESPMOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// 204 No Content.
    Clean,
    /// 200 with an `X-Infection-Found` header.
    Infected,
    /// 200 without any infection header.
    Modified,
    /// Never answer.
    Hang,
}

/// One RESPMOD as the fake saw it.
#[derive(Debug, Clone)]
pub struct SeenRespmod {
    pub preview: Option<usize>,
    pub http_head: String,
    pub body: Vec<u8>,
    pub continued: bool,
}

type Responder = dyn Fn(&[u8]) -> Reply + Send + Sync;

pub struct FakeIcap {
    pub addr: SocketAddr,
    options: Arc<AtomicUsize>,
    respmods: Arc<Mutex<Vec<SeenRespmod>>>,
}

impl FakeIcap {
    /// Start a fake advertising `preview` and answering RESPMOD via `respond`.
    pub async fn start<F>(preview: Option<usize>, options_status: u16, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = Arc::new(AtomicUsize::new(0));
        let respmods = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let (opts, seen) = (options.clone(), respmods.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (opts, seen, respond) = (opts.clone(), seen.clone(), respond.clone());
                tokio::spawn(async move {
                    let mut conn = Conn {
                        stream,
                        buf: Vec::new(),
                    };
                    conn.serve(preview, options_status, &opts, &seen, &*respond)
                        .await;
                });
            }
        });

        Self {
            addr,
            options,
            respmods,
        }
    }

    /// Fake that marks any body containing `EICAR` as infected.
    pub async fn eicar(preview: Option<usize>) -> Self {
        Self::start(preview, 200, |body| {
            if body.windows(5).any(|w| w == b"EICAR") {
                Reply::Infected
            } else {
                Reply::Clean
            }
        })
        .await
    }

    pub fn url(&self) -> String {
        format!("icap://{}/avscan", self.addr)
    }

    pub fn options_count(&self) -> usize {
        self.options.load(Ordering::SeqCst)
    }

    pub fn respmods(&self) -> Vec<SeenRespmod> {
        self.respmods.lock().unwrap().clone()
    }
}

struct Conn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Conn {
    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    async fn read_until(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        loop {
            if let Some(i) = self.buf.windows(pattern.len()).position(|w| w == pattern) {
                return Some(self.buf.drain(..i + pattern.len()).collect());
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    async fn read_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buf.len() < n {
            if !self.fill().await {
                return None;
            }
        }
        Some(self.buf.drain(..n).collect())
    }

    /// Read chunks up to the zero-length one; returns data and whether it was `ieof`.
    async fn read_chunks(&mut self, out: &mut Vec<u8>) -> Option<bool> {
        loop {
            let line = self.read_until(b"\r\n").await?;
            let line = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
            let size = usize::from_str_radix(line.split(';').next()?.trim(), 16).ok()?;
            if size == 0 {
                self.read_until(b"\r\n").await?;
                return Some(line.contains("ieof"));
            }
            let data = self.read_exact(size + 2).await?;
            out.extend_from_slice(&data[..size]);
        }
    }

    async fn serve(
        &mut self,
        preview: Option<usize>,
        options_status: u16,
        options: &AtomicUsize,
        seen: &Mutex<Vec<SeenRespmod>>,
        respond: &Responder,
    ) {
        let Some(head) = self.read_until(b"\r\n\r\n").await else {
            return;
        };
        let head = String::from_utf8_lossy(&head).into_owned();
        let header = |name: &str| {
            head.lines().find_map(|l| {
                let (n, v) = l.split_once(':')?;
                n.eq_ignore_ascii_case(name).then(|| v.trim().to_string())
            })
        };

        if head.starts_with("OPTIONS ") {
            options.fetch_add(1, Ordering::SeqCst);
            let preview_line = preview
                .map(|p| format!("Preview: {p}\r\n"))
                .unwrap_or_default();
            let reply = format!(
                "ICAP/1.0 {options_status} Whatever\r\nMethods: RESPMOD\r\nISTag: \"fake-1\"\r\n{preview_line}Encapsulated: null-body=0\r\n\r\n"
            );
            let _ = self.stream.write_all(reply.as_bytes()).await;
            return;
        }

        let encapsulated = header("encapsulated").unwrap_or_default();
        let request_preview = header("preview").and_then(|p| p.parse().ok());
        let Some(http_head) = self.read_until(b"\r\n\r\n").await else {
            return;
        };

        let mut body = Vec::new();
        let mut continued = false;
        if !encapsulated.contains("null-body") {
            let Some(ieof) = self.read_chunks(&mut body).await else {
                return;
            };
            if request_preview.is_some() && !ieof {
                let _ = self
                    .stream
                    .write_all(b"ICAP/1.0 100 Continue\r\n\r\n")
                    .await;
                if self.read_chunks(&mut body).await.is_none() {
                    return;
                }
                continued = true;
            }
        }

        let reply = respond(&body);
        seen.lock().unwrap().push(SeenRespmod {
            preview: request_preview,
            http_head: String::from_utf8_lossy(&http_head).into_owned(),
            body,
            continued,
        });

        let text: &[u8] = match reply {
            Reply::Clean => {
                b"ICAP/1.0 204 No Content\r\nISTag: \"fake-1\"\r\nEncapsulated: null-body=0\r\n\r\n"
            }
            Reply::Infected => {
                b"ICAP/1.0 200 OK\r\nISTag: \"fake-1\"\r\nX-Infection-Found: Type=0; Resolution=2; Threat=EICAR;\r\nEncapsulated: res-hdr=0, null-body=26\r\n\r\nHTTP/1.1 403 Forbidden\r\n\r\n"
            }
            Reply::Modified => {
                b"ICAP/1.0 200 OK\r\nISTag: \"fake-1\"\r\nEncapsulated: res-hdr=0, null-body=19\r\n\r\nHTTP/1.1 200 OK\r\n\r\n"
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return;
            }
        };
        let _ = self.stream.write_all(text).await;
    }
}
