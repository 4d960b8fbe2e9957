//! Plumbing shared by the proxying daemons.
//!
//! A proxy reads one request packet from its client, decides what to send
//! downstream, then gets out of the way: bytes are forwarded verbatim in
//! both directions, with half-closes propagated so `git` learns when its
//! peer is done. Only the first packet coming back from the backend is
//! examined, so error replies can be rewritten before the stream goes raw.
use std::io;

use bstr::BStr;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use turnip::error;
use turnip::pktline::{self, Packet, Pktlines};
use turnip::request::Request;

/// A decoded client request with the connection it arrived on.
pub struct ClientRequest {
    pub request: Request,
    pub read: OwnedReadHalf,
    pub write: OwnedWriteHalf,
    /// Client bytes that arrived behind the request packet.
    pub leftover: Vec<u8>,
}

/// Send `ERR <message>` and close the write side.
pub async fn die(write: &mut OwnedWriteHalf, message: &[u8]) -> io::Result<()> {
    tracing::info!("dying: {}", BStr::new(message));
    send_packet(write, &error::err_line(message)).await?;
    write.shutdown().await
}

pub async fn send_packet(write: &mut OwnedWriteHalf, payload: &[u8]) -> io::Result<()> {
    let pkt = pktline::encode(Some(payload))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write.write_all(&pkt).await
}

/// Read and decode the request packet opening a proxied connection.
/// Protocol violations are answered with an `ERR` packet; the connection is
/// then spent.
pub async fn read_request(stream: TcpStream) -> io::Result<Option<ClientRequest>> {
    let (mut read, mut write) = stream.into_split();
    let mut pkts = Pktlines::new();
    let mut buf = [0u8; 8192];
    let data = loop {
        match pkts.next_packet() {
            Ok(Some(Packet::Data(data))) => break data,
            Ok(Some(Packet::Flush)) => {
                die(&mut write, b"Bad request: flush-pkt instead").await?;
                return Ok(None);
            }
            Ok(None) => {
                let n = read.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                pkts.input(&buf[..n]);
            }
            Err(_) => {
                die(&mut write, b"Invalid pkt-line").await?;
                return Ok(None);
            }
        }
    };
    match Request::decode(&data) {
        Ok(request) => Ok(Some(ClientRequest {
            request,
            read,
            write,
            leftover: pkts.unparsed(),
        })),
        Err(e) => {
            die(&mut write, e.to_string().as_bytes()).await?;
            Ok(None)
        }
    }
}

/// Forward traffic between client and backend.
///
/// The encoded `requests` are written downstream first, in order, each
/// completing before the next; only then do buffered and fresh client bytes
/// follow. The first backend packet may be replaced via `rewrite_first`;
/// everything after it is forwarded untouched.
pub async fn splice(
    client: (OwnedReadHalf, OwnedWriteHalf),
    client_leftover: Vec<u8>,
    backend: TcpStream,
    requests: Vec<Vec<u8>>,
    rewrite_first: impl FnOnce(&[u8]) -> Option<Vec<u8>>,
) -> io::Result<()> {
    let (mut client_read, mut client_write) = client;
    let (mut backend_read, mut backend_write) = backend.into_split();

    for request in requests {
        send_packet(&mut backend_write, &request).await?;
    }

    // Client to backend, with the half-close forwarded so the child's stdin
    // reaches EOF.
    let up = tokio::spawn(async move {
        if client_leftover.is_empty()
            || backend_write.write_all(&client_leftover).await.is_ok()
        {
            let mut buf = [0u8; 65536];
            loop {
                match client_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if backend_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        backend_write.shutdown().await.ok();
    });

    // Backend to client: inspect the first frame, then go raw.
    let mut pkts = Pktlines::new();
    let mut buf = [0u8; 65536];
    let mut first = None;
    let eof = loop {
        match pkts.next_packet() {
            Ok(Some(packet)) => {
                first = Some(packet);
                break false;
            }
            Ok(None) => {
                let n = backend_read.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break true;
                }
                pkts.input(&buf[..n]);
            }
            Err(_) => {
                die(&mut client_write, b"backend error: Invalid pkt-line").await.ok();
                up.abort();
                return Ok(());
            }
        }
    };

    if let Some(packet) = first {
        let forwarded = match &packet {
            Packet::Data(payload) => match rewrite_first(payload) {
                Some(rewritten) => pktline::encode(Some(&rewritten)),
                None => pktline::encode(Some(payload)),
            },
            Packet::Flush => pktline::encode(None),
        }
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tail = pkts.unparsed();
        let ok = client_write.write_all(&forwarded).await.is_ok()
            && (tail.is_empty() || client_write.write_all(&tail).await.is_ok());
        if ok && !eof {
            loop {
                match backend_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    client_write.shutdown().await.ok();
    // The backend is gone; take the client connection down with it.
    up.abort();
    Ok(())
}
