use std::io::{self, Cursor, Read as _};

use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;

use turnip::error::{ErrorKind, VirtError, ERROR_PREFIX};
use turnip::pktline::{self, Packet, Pktlines};
use turnip::request::{params, Command, Params, Request};
use turnip::virtinfo::{self, Credentials};

use crate::error::Error;
use crate::Context;

const ALLOWED_SERVICES: &[&str] = &["git-upload-pack", "git-receive-pack"];

/// Trivially respond to OPTIONS / for the sake of haproxy.
pub(crate) async fn root_handler(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// Longest-suffix routing: `…/info/refs` is the advertisement stage,
/// `…/<service>` carries a command body.
pub(crate) async fn git_handler(
    State(ctx): State<Context>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let path = uri.path();
    if let Some(repo) = path.strip_suffix("/info/refs") {
        if method != Method::GET {
            return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
        }
        return refs_handler(&ctx, repo, &query.unwrap_or_default(), &headers).await;
    }
    if let Some((repo, service)) = path.rsplit_once('/') {
        if ALLOWED_SERVICES.contains(&service) {
            if method != Method::POST {
                return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
            }
            return command_handler(&ctx, repo, service, &headers, body).await;
        }
    }
    Ok(plain(StatusCode::NOT_FOUND, "No such resource"))
}

async fn refs_handler(
    ctx: &Context,
    repo: &str,
    query: &str,
    headers: &HeaderMap,
) -> Result<Response, Error> {
    let service = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("service="));
    let Some(service) = service else {
        return Ok(plain(
            StatusCode::NOT_FOUND,
            "Only git smart HTTP clients are supported.",
        ));
    };
    if !ALLOWED_SERVICES.contains(&service) {
        return Ok(plain(StatusCode::FORBIDDEN, "Unsupported service."));
    }

    // v2 ref listing happens through ls-refs on the command endpoint, so
    // the advertisement is static.
    if git_protocol_version(headers).as_deref() == Some("2") {
        let mut body = Vec::new();
        for line in [
            "version 2\n".to_owned(),
            format!("agent=git/{}@turnip/{}\n", ctx.git_version, crate::VERSION),
            "ls-refs\n".to_owned(),
            "fetch=shallow\n".to_owned(),
            "server-option\n".to_owned(),
        ] {
            body.extend_from_slice(&packet(line.as_bytes()));
        }
        body.extend_from_slice(pktline::FLUSH);
        return Ok((
            [(CONTENT_TYPE, advertisement_content_type(service))],
            body,
        )
            .into_response());
    }

    let mut request_params = base_params(ctx, headers).await?;
    request_params.insert(params::ADVERTISE_REFS.to_owned(), b"yes".to_vec());

    let request = Request::new(
        Command::from_bytes(service.as_bytes()),
        repo.as_bytes().to_vec(),
        request_params,
    );
    let reply = call_backend(ctx, &request, &[]).await?;
    match reply.first {
        Some(Packet::Data(payload)) if payload.starts_with(ERROR_PREFIX) => {
            // The request line came from the virt proxy, so any
            // unrecognised error is a system failure.
            let (status, www_authenticate, message) = map_error(&payload)
                .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, false, error_message(&payload)));
            Ok(error_response(status, www_authenticate, message))
        }
        Some(first) => {
            let mut prelude = packet(format!("# service={service}\n").as_bytes());
            prelude.extend_from_slice(pktline::FLUSH);
            extend_with_packet(&mut prelude, &first);
            prelude.extend_from_slice(&reply.tail);
            Ok(stream_response(
                advertisement_content_type(service),
                prelude,
                reply.read,
            ))
        }
        None => Err(Error::Backend),
    }
}

async fn command_handler(
    ctx: &Context,
    repo: &str,
    service: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let expected = format!("application/x-{service}-request");
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some(expected.as_str()) {
        return Ok(plain(
            StatusCode::BAD_REQUEST,
            "Invalid Content-Type for service.",
        ));
    }

    // git always uses C-E: gzip without negotiating.
    let gzip = matches!(
        headers.get(CONTENT_ENCODING).map(|v| v.to_str()),
        Some(Ok("gzip"))
    );
    let body = if gzip {
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..]).read_to_end(&mut decoded)?;
        decoded
    } else {
        body.to_vec()
    };

    let request = Request::new(
        Command::from_bytes(service.as_bytes()),
        repo.as_bytes().to_vec(),
        base_params(ctx, headers).await?,
    );
    let reply = call_backend(ctx, &request, &body).await?;
    match reply.first {
        Some(Packet::Data(payload)) if payload.starts_with(ERROR_PREFIX) => {
            match map_error(&payload) {
                Some((status, www_authenticate, message)) => {
                    Ok(error_response(status, www_authenticate, message))
                }
                None => {
                    // Can't tell a backend failure from a rejected request
                    // body; pass it to the client as a remote error.
                    let mut prelude = Vec::new();
                    extend_with_packet(&mut prelude, &Packet::Data(payload));
                    prelude.extend_from_slice(&reply.tail);
                    Ok(stream_response(
                        result_content_type(service),
                        prelude,
                        reply.read,
                    ))
                }
            }
        }
        Some(first) => {
            let mut prelude = Vec::new();
            extend_with_packet(&mut prelude, &first);
            prelude.extend_from_slice(&reply.tail);
            Ok(stream_response(
                result_content_type(service),
                prelude,
                reply.read,
            ))
        }
        None => Err(Error::Backend),
    }
}

/// Parameters every backend request carries; authenticating adds the caller
/// identity.
async fn base_params(ctx: &Context, headers: &HeaderMap) -> Result<Params, Error> {
    let mut request_params = Params::new();
    request_params.insert(params::CAN_AUTHENTICATE.to_owned(), b"yes".to_vec());
    request_params.insert(params::STATELESS_RPC.to_owned(), b"yes".to_vec());
    if let Some(version) = git_protocol_version(headers) {
        request_params.insert(params::VERSION.to_owned(), version.into_bytes());
    }
    if let Some(Credentials { user, uid }) = authenticate(ctx, headers).await? {
        request_params.insert(params::AUTHENTICATED_USER.to_owned(), user.into_bytes());
        request_params.insert(
            params::AUTHENTICATED_UID.to_owned(),
            uid.to_string().into_bytes(),
        );
    }
    Ok(request_params)
}

/// Basic auth against the authorisation service. Faults 3 and 410 mean the
/// caller may proceed anonymously; anything else is a hard failure. (410
/// maps to UNAUTHORIZED everywhere else; that asymmetry is deliberate.)
async fn authenticate(
    ctx: &Context,
    headers: &HeaderMap,
) -> Result<Option<Credentials>, Error> {
    let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return Ok(None);
    };
    let Some((user, password)) = BASE64
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|creds| {
            creds
                .split_once(':')
                .map(|(u, p)| (u.to_owned(), p.to_owned()))
        })
    else {
        return Ok(None);
    };
    if user.is_empty() {
        return Ok(None);
    }

    let virtinfo = ctx.virtinfo.clone();
    let result = tokio::task::spawn_blocking(move || {
        virtinfo.authenticate_with_password(&user, &password)
    })
    .await
    .map_err(|e| Error::Io(io::Error::other(e)))?;
    match result {
        Ok(credentials) => Ok(Some(credentials)),
        Err(virtinfo::Error::Fault { code: 3 | 410, .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct BackendReply {
    /// First frame from the backend, or `None` if it closed silently.
    first: Option<Packet>,
    /// Bytes already read past the first frame.
    tail: Vec<u8>,
    read: OwnedReadHalf,
}

/// Send the request and body to the virt proxy and read the first reply
/// frame, which decides the HTTP status.
async fn call_backend(
    ctx: &Context,
    request: &Request,
    body: &[u8],
) -> Result<BackendReply, Error> {
    let stream = TcpStream::connect(&ctx.backend).await?;
    let (mut read, mut write) = stream.into_split();

    let payload = request
        .encode()
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    write.write_all(&packet(&payload)).await?;
    if !body.is_empty() {
        write.write_all(body).await?;
    }
    // Stateless RPC: the whole request is on the wire.
    write.shutdown().await.ok();

    let mut pkts = Pktlines::new();
    let mut buf = [0u8; 8192];
    loop {
        match pkts.next_packet() {
            Ok(Some(first)) => {
                return Ok(BackendReply {
                    first: Some(first),
                    tail: pkts.unparsed(),
                    read,
                })
            }
            Ok(None) => {
                let n = read.read(&mut buf).await?;
                if n == 0 {
                    return Ok(BackendReply {
                        first: None,
                        tail: vec![],
                        read,
                    });
                }
                pkts.input(&buf[..n]);
            }
            Err(_) => return Err(Error::Backend),
        }
    }
}

/// Map a backend `ERR` payload to `(status, needs WWW-Authenticate, body)`,
/// or `None` when the error is not one of the recognised shapes.
fn map_error(payload: &[u8]) -> Option<(StatusCode, bool, String)> {
    if let Some(virt) = VirtError::parse(payload) {
        let status = match virt.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized => {
                return Some((StatusCode::UNAUTHORIZED, true, virt.message))
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return Some((status, false, virt.message));
    }
    let message = error_message(payload);
    if message.starts_with("Repository is read-only") {
        return Some((StatusCode::FORBIDDEN, false, message));
    }
    None
}

/// The human text of an `ERR` payload.
fn error_message(payload: &[u8]) -> String {
    let message = payload.strip_prefix(ERROR_PREFIX).unwrap_or(payload);
    String::from_utf8_lossy(message).trim_end().to_owned()
}

fn error_response(status: StatusCode, www_authenticate: bool, message: String) -> Response {
    let mut response = plain(status, &message);
    if www_authenticate {
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=turnip"),
        );
    }
    response
}

fn plain(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        message.to_owned(),
    )
        .into_response()
}

fn stream_response(content_type: String, prelude: Vec<u8>, read: OwnedReadHalf) -> Response {
    let reader = tokio::io::AsyncReadExt::chain(Cursor::new(prelude), read);
    (
        [(CONTENT_TYPE, content_type)],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

fn advertisement_content_type(service: &str) -> String {
    format!("application/x-{service}-advertisement")
}

fn result_content_type(service: &str) -> String {
    format!("application/x-{service}-result")
}

/// The `Git-Protocol` header's version, as git sends it.
fn git_protocol_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())?
        .split(':')
        .find_map(|part| part.strip_prefix("version="))
        .map(ToOwned::to_owned)
}

fn packet(payload: &[u8]) -> Vec<u8> {
    pktline::encode(Some(payload)).expect("payload fits a packet")
}

fn extend_with_packet(bytes: &mut Vec<u8>, packet_: &Packet) {
    match packet_ {
        Packet::Data(payload) => bytes.extend_from_slice(&packet(payload)),
        Packet::Flush => bytes.extend_from_slice(pktline::FLUSH),
    }
}

#[cfg(test)]
mod routes {
    use std::io::Write as _;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request as HttpRequest, StatusCode};
    use base64::Engine as _;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use turnip::pktline;
    use turnip::request::Request;
    use turnip::test::{Call, FakeVirtInfo};
    use turnip::virtinfo::{Credentials, Error as VirtInfoError};

    use crate::{router, Context};

    /// Never dialled.
    const NO_BACKEND: &str = "127.0.0.1:1";

    fn ctx(backend: String, virtinfo: Arc<FakeVirtInfo>) -> Context {
        Context {
            backend,
            virtinfo,
            git_version: "2.45.0".to_owned(),
        }
    }

    /// One-connection backend: records everything the frontend sends,
    /// answers with `reply`, closes.
    async fn stub_backend(
        reply: &'static [u8],
    ) -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            stream.write_all(reply).await.unwrap();
            stream.shutdown().await.ok();
            tx.send(received).ok();
        });
        (addr, rx)
    }

    fn data_packet(payload: &[u8]) -> Vec<u8> {
        pktline::encode(Some(payload)).unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_options_root() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("OPTIONS")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.is_empty());

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/bar")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"No such resource");
    }

    #[tokio::test]
    async fn test_refs_requires_service() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_bytes(response).await,
            b"Only git smart HTTP clients are supported."
        );
    }

    #[tokio::test]
    async fn test_refs_unsupported_service() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-annex")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_bytes(response).await, b"Unsupported service.");
    }

    #[tokio::test]
    async fn test_refs_error_mapping() {
        for (payload, status, body) in [
            (
                "ERR turnip virt error: NOT_FOUND repo missing\n",
                StatusCode::NOT_FOUND,
                "repo missing",
            ),
            (
                "ERR turnip virt error: FORBIDDEN not yours\n",
                StatusCode::FORBIDDEN,
                "not yours",
            ),
            (
                "ERR turnip virt error: UNAUTHORIZED who are you\n",
                StatusCode::UNAUTHORIZED,
                "who are you",
            ),
            (
                "ERR turnip virt error: GATEWAY_TIMEOUT Path translation timed out.\n",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Path translation timed out.",
            ),
            (
                "ERR Repository is read-only\n",
                StatusCode::FORBIDDEN,
                "Repository is read-only",
            ),
            // Only the virt proxy writes the refs request line, so any
            // other error is a system failure.
            (
                "ERR backend exited 128\n",
                StatusCode::INTERNAL_SERVER_ERROR,
                "backend exited 128",
            ),
        ] {
            let reply = data_packet(payload.as_bytes()).leak();
            let (backend, _received) = stub_backend(reply).await;
            let app = router(ctx(
                backend.to_string(),
                Arc::new(FakeVirtInfo::translated("x")),
            ));
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/foo/info/refs?service=git-upload-pack")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), status, "for {payload:?}");
            if status == StatusCode::UNAUTHORIZED {
                assert_eq!(
                    response.headers().get("WWW-Authenticate").unwrap(),
                    "Basic realm=turnip"
                );
            }
            assert_eq!(body_bytes(response).await, body.as_bytes(), "for {payload:?}");
        }
    }

    #[tokio::test]
    async fn test_refs_success_prelude_and_params() {
        let reply = data_packet(b"advertised refs").leak();
        let (backend, received) = stub_backend(reply).await;
        let app = router(ctx(
            backend.to_string(),
            Arc::new(FakeVirtInfo::translated("x")),
        ));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/x-git-upload-pack-advertisement"
        );
        let mut expected = data_packet(b"# service=git-upload-pack\n");
        expected.extend_from_slice(b"0000");
        expected.extend_from_slice(&data_packet(b"advertised refs"));
        assert_eq!(body_bytes(response).await, expected);

        let received = received.await.unwrap();
        let (packet, consumed) = pktline::decode(&received).unwrap().unwrap();
        assert_eq!(consumed, received.len());
        let request = Request::decode(packet.payload().unwrap()).unwrap();
        assert_eq!(request.pathname, b"/foo");
        assert_eq!(request.params.get("turnip-advertise-refs"), Some(&b"yes".to_vec()));
        assert_eq!(request.params.get("turnip-stateless-rpc"), Some(&b"yes".to_vec()));
        assert_eq!(
            request.params.get("turnip-can-authenticate"),
            Some(&b"yes".to_vec())
        );
        assert!(!request.params.contains_key("turnip-authenticated-user"));
    }

    #[tokio::test]
    async fn test_refs_v2_capability_advertisement() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-upload-pack")
                    .header("Git-Protocol", "version=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut expected = Vec::new();
        for line in [
            "version 2\n".to_owned(),
            format!("agent=git/2.45.0@turnip/{}\n", crate::VERSION),
            "ls-refs\n".to_owned(),
            "fetch=shallow\n".to_owned(),
            "server-option\n".to_owned(),
        ] {
            expected.extend_from_slice(&data_packet(line.as_bytes()));
        }
        expected.extend_from_slice(b"0000");
        assert_eq!(body_bytes(response).await, expected);
    }

    #[tokio::test]
    async fn test_command_content_type_required() {
        let app = router(ctx(NO_BACKEND.into(), Arc::new(FakeVirtInfo::translated("x"))));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/foo/git-upload-pack")
                    .header("Content-Type", "text/plain")
                    .body(Body::from("0000"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_bytes(response).await, b"Invalid Content-Type for service.");
    }

    #[tokio::test]
    async fn test_command_forwards_body_and_result() {
        let reply = data_packet(b"pack data").leak();
        let (backend, received) = stub_backend(reply).await;
        let app = router(ctx(
            backend.to_string(),
            Arc::new(FakeVirtInfo::translated("x")),
        ));
        let body = data_packet(b"want something\n");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/foo/git-upload-pack")
                    .header("Content-Type", "application/x-git-upload-pack-request")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/x-git-upload-pack-result"
        );
        assert_eq!(body_bytes(response).await, data_packet(b"pack data"));

        let received = received.await.unwrap();
        let (_, consumed) = pktline::decode(&received).unwrap().unwrap();
        assert_eq!(&received[consumed..], &body[..]);
    }

    #[tokio::test]
    async fn test_command_gzip_body() {
        let reply = data_packet(b"pack data").leak();
        let (backend, received) = stub_backend(reply).await;
        let app = router(ctx(
            backend.to_string(),
            Arc::new(FakeVirtInfo::translated("x")),
        ));

        let plain = data_packet(b"want something\n");
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/foo/git-upload-pack")
                    .header("Content-Type", "application/x-git-upload-pack-request")
                    .header("Content-Encoding", "gzip")
                    .body(Body::from(compressed))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The backend saw the decompressed body.
        let received = received.await.unwrap();
        let (_, consumed) = pktline::decode(&received).unwrap().unwrap();
        assert_eq!(&received[consumed..], &plain[..]);
    }

    #[tokio::test]
    async fn test_command_unknown_error_forwarded_as_remote_error() {
        let reply = data_packet(b"ERR you broke it\n").leak();
        let (backend, _received) = stub_backend(reply).await;
        let app = router(ctx(
            backend.to_string(),
            Arc::new(FakeVirtInfo::translated("x")),
        ));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/foo/git-receive-pack")
                    .header("Content-Type", "application/x-git-receive-pack-request")
                    .body(Body::from(data_packet(b"push\n")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/x-git-receive-pack-result"
        );
        assert_eq!(body_bytes(response).await, data_packet(b"ERR you broke it\n"));
    }

    #[tokio::test]
    async fn test_command_read_only_maps_forbidden() {
        let reply = data_packet(b"ERR Repository is read-only\n").leak();
        let (backend, _received) = stub_backend(reply).await;
        let app = router(ctx(
            backend.to_string(),
            Arc::new(FakeVirtInfo::translated("x")),
        ));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/foo/git-receive-pack")
                    .header("Content-Type", "application/x-git-receive-pack-request")
                    .body(Body::from(data_packet(b"push\n")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_bytes(response).await, b"Repository is read-only");
    }

    #[tokio::test]
    async fn test_basic_auth_success_adds_identity() {
        let reply = data_packet(b"refs").leak();
        let (backend, received) = stub_backend(reply).await;
        let virtinfo = Arc::new(FakeVirtInfo::translated("x"));
        *virtinfo.credentials.lock().unwrap() = Ok(Credentials {
            user: "alice".to_owned(),
            uid: 7,
        });
        let app = router(ctx(backend.to_string(), virtinfo.clone()));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-receive-pack")
                    .header(
                        "Authorization",
                        format!(
                            "Basic {}",
                            base64::engine::general_purpose::STANDARD
                                .encode(b"alice:secret")
                        ),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(virtinfo.calls().contains(&Call::AuthenticateWithPassword(
            "alice".to_owned(),
            "secret".to_owned()
        )));
        let received = received.await.unwrap();
        let (packet, _) = pktline::decode(&received).unwrap().unwrap();
        let request = Request::decode(packet.payload().unwrap()).unwrap();
        assert_eq!(
            request.params.get("turnip-authenticated-user"),
            Some(&b"alice".to_vec())
        );
        assert_eq!(
            request.params.get("turnip-authenticated-uid"),
            Some(&b"7".to_vec())
        );
    }

    #[tokio::test]
    async fn test_basic_auth_fault_410_means_anonymous() {
        let reply = data_packet(b"refs").leak();
        let (backend, received) = stub_backend(reply).await;
        let virtinfo = Arc::new(FakeVirtInfo::translated("x"));
        *virtinfo.credentials.lock().unwrap() = Err(VirtInfoError::Fault {
            code: 410,
            message: "suspended".to_owned(),
        });
        let app = router(ctx(backend.to_string(), virtinfo));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-upload-pack")
                    .header(
                        "Authorization",
                        format!(
                            "Basic {}",
                            base64::engine::general_purpose::STANDARD
                                .encode(b"alice:secret")
                        ),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let received = received.await.unwrap();
        let (packet, _) = pktline::decode(&received).unwrap().unwrap();
        let request = Request::decode(packet.payload().unwrap()).unwrap();
        assert!(!request.params.contains_key("turnip-authenticated-user"));
    }

    #[tokio::test]
    async fn test_basic_auth_other_fault_is_server_error() {
        let virtinfo = Arc::new(FakeVirtInfo::translated("x"));
        *virtinfo.credentials.lock().unwrap() = Err(VirtInfoError::Fault {
            code: 99,
            message: "database on fire".to_owned(),
        });
        let app = router(ctx(NO_BACKEND.into(), virtinfo));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/foo/info/refs?service=git-upload-pack")
                    .header(
                        "Authorization",
                        format!(
                            "Basic {}",
                            base64::engine::general_purpose::STANDARD
                                .encode(b"alice:secret")
                        ),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
