//! Backend tests against real repositories and the reference `git`.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

use turnip::pktline::{self, Packet, Pktlines};
use turnip::store;
use turnip::test::{Call, FakeVirtInfo};
use turnip::virtinfo::{Error, VirtInfo};
use turnip_pack::backend::Backend;
use turnip_pack::{hookrpc, metrics};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_backend(root: &Path, virtinfo: Arc<FakeVirtInfo>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let virtinfo: Arc<dyn VirtInfo> = virtinfo;
    let backend = Arc::new(Backend {
        root: root.to_path_buf(),
        virtinfo: virtinfo.clone(),
        virtinfo_timeout: TIMEOUT,
        hookrpc: Arc::new(hookrpc::Handler::new(virtinfo, TIMEOUT)),
        hookrpc_sock: root.join("hookrpc.sock"),
        git_wrapper: PathBuf::from(env!("CARGO_BIN_EXE_turnip-git-wrapper")),
        metrics: Arc::new(metrics::LogSink),
        environment: "test".into(),
    });
    tokio::spawn(backend.serve(listener));
    addr
}

async fn send_request(stream: &mut TcpStream, request: &[u8]) {
    stream
        .write_all(&pktline::encode(Some(request)).unwrap())
        .await
        .unwrap();
}

/// Read frames until EOF.
async fn read_packets(stream: &mut TcpStream) -> Vec<Packet> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    let mut pkts = Pktlines::from(bytes);
    let mut packets = vec![];
    while let Ok(Some(packet)) = pkts.next_packet() {
        packets.push(packet);
    }
    packets
}

async fn next_packet(stream: &mut TcpStream) -> Packet {
    let mut pkts = Pktlines::new();
    let mut buf = [0u8; 8192];
    loop {
        if let Some(packet) = pkts.next_packet().unwrap() {
            return packet;
        }
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before a packet arrived");
        pkts.input(&buf[..n]);
    }
}

fn commit(path: &Path) -> git2::Oid {
    let repo = git2::Repository::open_bare(path).unwrap();
    let tree = repo.treebuilder(None).and_then(|b| b.write()).unwrap();
    let tree = repo.find_tree(tree).unwrap();
    let sig = git2::Signature::now("t", "t@example.com").unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "root", &tree, &[])
        .unwrap()
}

#[tokio::test]
async fn test_create_repo_resets_state_machine() {
    let tmp = tempfile::tempdir().unwrap();
    let virtinfo = Arc::new(FakeVirtInfo::translated("unused"));
    let addr = start_backend(tmp.path(), virtinfo.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"turnip-create-repo /foo\0host=h\0").await;

    // Creation acks nothing; the second identical request on the same
    // connection proves the machine reset and reports the collision.
    send_request(&mut stream, b"turnip-create-repo /foo\0host=h\0").await;
    let reply = next_packet(&mut stream).await;
    assert_eq!(
        reply,
        Packet::Data(
            b"ERR Could not create repository: repository already exists\n".to_vec()
        )
    );

    assert!(tmp.path().join("foo").join("config").exists());
    let confirmations = virtinfo
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::ConfirmRepoCreation(_)))
        .count();
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn test_create_repo_confirm_failure_rolls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let virtinfo = Arc::new(FakeVirtInfo::translated("unused"));
    *virtinfo.confirmation.lock().unwrap() = Err(Error::Fault {
        code: 99,
        message: "database on fire".into(),
    });
    let addr = start_backend(tmp.path(), virtinfo.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"turnip-create-repo /foo\0").await;
    let packets = read_packets(&mut stream).await;
    assert_eq!(
        packets,
        vec![Packet::Data(
            b"ERR Could not create repository: database on fire\n".to_vec()
        )]
    );

    assert!(!tmp.path().join("foo").exists());
    assert!(virtinfo
        .calls()
        .contains(&Call::AbortRepoCreation("/foo".into())));
}

#[tokio::test]
async fn test_create_repo_with_clone_from() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    store::init(&source, None, false).unwrap();
    std::fs::create_dir_all(source.join("objects/pack")).unwrap();
    std::fs::write(source.join("objects/pack/pack-1.pack"), b"pack").unwrap();

    let virtinfo = Arc::new(FakeVirtInfo::translated("unused"));
    let addr = start_backend(tmp.path(), virtinfo).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"turnip-create-repo /clone\0clone_from=source\0").await;
    stream.shutdown().await.unwrap();
    read_packets(&mut stream).await;

    let clone = tmp.path().join("clone");
    assert!(clone
        .join("turnip-subordinate/objects/pack/pack-1.pack")
        .exists());
    assert!(clone.join("objects/info/alternates").exists());
}

#[tokio::test]
async fn test_unsupported_command() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"turnip-frobnicate /x\0").await;
    assert_eq!(
        read_packets(&mut stream).await,
        vec![Packet::Data(b"ERR Unsupported command in request\n".to_vec())]
    );
}

#[tokio::test]
async fn test_flush_instead_of_request() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"0000").await.unwrap();
    assert_eq!(
        read_packets(&mut stream).await,
        vec![Packet::Data(b"ERR Bad request: flush-pkt instead\n".to_vec())]
    );
}

#[tokio::test]
async fn test_symbolic_ref_validation() {
    let tmp = tempfile::tempdir().unwrap();
    store::init(&tmp.path().join("h"), None, false).unwrap();
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    for (arg, expected) in [
        (
            b"HEAD --evil".as_slice(),
            b"ERR Symbolic ref target may not start with \"-\"\n".as_slice(),
        ),
        (b"FOO refs/heads/x", b"ERR Symbolic ref name must be \"HEAD\"\n"),
        (
            b"HEAD refs/heads/a b",
            b"ERR Symbolic ref target may not contain \" \"\n",
        ),
        (b"no-space", b"ERR Invalid set-symbolic-ref-line\n"),
    ] {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_request(&mut stream, b"turnip-set-symbolic-ref /h\0").await;
        send_request(&mut stream, arg).await;
        assert_eq!(
            read_packets(&mut stream).await,
            vec![Packet::Data(expected.to_vec())]
        );
    }
}

#[tokio::test]
async fn test_symbolic_ref_success() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("h");
    store::init(&path, None, false).unwrap();
    let virtinfo = Arc::new(FakeVirtInfo::translated("x"));
    let addr = start_backend(tmp.path(), virtinfo.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"turnip-set-symbolic-ref /h\0").await;
    send_request(&mut stream, b"HEAD refs/heads/trunk").await;
    assert_eq!(
        read_packets(&mut stream).await,
        vec![Packet::Data(b"ACK HEAD\n".to_vec())]
    );

    let repo = git2::Repository::open_bare(&path).unwrap();
    let head = repo.find_reference("HEAD").unwrap();
    assert_eq!(head.symbolic_target(), Some("refs/heads/trunk"));
    assert!(virtinfo.calls().contains(&Call::Notify("/h".into())));
}

#[tokio::test]
async fn test_upload_pack_advertises_and_streams() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("h");
    store::init(&path, None, false).unwrap();
    let oid = commit(&path);
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"git-upload-pack /h\0host=example.com\0").await;

    let advertisement = next_packet(&mut stream).await;
    let Packet::Data(line) = advertisement else {
        panic!("expected a ref advertisement");
    };
    assert!(
        line.starts_with(oid.to_string().as_bytes()),
        "unexpected first line: {:?}",
        String::from_utf8_lossy(&line)
    );

    // No wants; upload-pack exits cleanly and the connection drains.
    stream.write_all(b"0000").await.unwrap();
    stream.shutdown().await.unwrap();
    read_packets(&mut stream).await;
}

#[tokio::test]
async fn test_missing_repository_synthesises_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"git-upload-pack /missing\0").await;
    stream.shutdown().await.unwrap();

    let packets = read_packets(&mut stream).await;
    // git wrote to stderr and died without stdout: its message is forwarded,
    // then the exit is reported.
    assert!(packets.len() >= 2, "got {packets:?}");
    let Packet::Data(first) = &packets[0] else {
        panic!("expected an error packet");
    };
    assert!(first.starts_with(b"ERR "));
    let Packet::Data(last) = &packets[packets.len() - 1] else {
        panic!("expected an error packet");
    };
    assert!(
        last.starts_with(b"ERR backend exited "),
        "unexpected: {:?}",
        String::from_utf8_lossy(last)
    );
}

#[tokio::test]
async fn test_path_escape_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_backend(tmp.path(), Arc::new(FakeVirtInfo::translated("x"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, b"git-upload-pack /../escape\0").await;
    assert_eq!(
        read_packets(&mut stream).await,
        vec![Packet::Data(b"ERR Path not contained within root\n".to_vec())]
    );
}
