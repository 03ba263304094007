use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tempdir::TempDir;
use tftpd::tftp::{Datagram, ErrorCode, FileMode, Packet, MAX_PACKET_SIZE};
use tftpd::{Server, ServerConfig, ServerHandle, TokioFileStore};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    sock: UdpSocket,
    server: SocketAddr,
    buf: [u8; MAX_PACKET_SIZE],
}

impl Client {
    async fn new(server: SocketAddr) -> Client {
        let sock = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
        Client { sock, server, buf: [0; MAX_PACKET_SIZE] }
    }

    async fn send(&self, packet: Packet<'_>) {
        let datagram = assert_ok!(Datagram::encode(&packet));
        assert_ok!(self.sock.send_to(datagram.as_bytes(), self.server).await);
    }

    async fn send_raw(&self, bytes: &[u8]) {
        assert_ok!(self.sock.send_to(bytes, self.server).await);
    }

    async fn recv(&mut self) -> Packet<'_> {
        let (len, from) = assert_ok!(assert_ok!(timeout(WAIT, self.sock.recv_from(&mut self.buf)).await));
        assert_eq!(from, self.server);
        assert_ok!(Packet::decode(&self.buf[..len]))
    }
}

async fn start(root: &TempDir) -> (SocketAddr, ServerHandle) {
    let config = ServerConfig { root: root.path().to_path_buf(), port: 0, ..Default::default() };
    let server = assert_ok!(Server::bind(&config, TokioFileStore::new(root.path())));
    let port = assert_ok!(server.local_addr()).port();
    let handle = server.handle();
    tokio::spawn(server.run());
    (([127, 0, 0, 1], port).into(), handle)
}

fn rrq(path: &str) -> Packet<'static> {
    Packet::ReadReq { path: path.to_string(), mode: FileMode::Octet, options: vec![] }
}

fn wrq(path: &str) -> Packet<'static> {
    Packet::WriteReq { path: path.to_string(), mode: FileMode::Octet, options: vec![] }
}

#[tokio::test]
async fn test_read_over_loopback() {
    let tmpdir = TempDir::new("root").unwrap();
    let mut rng = rand::thread_rng();
    let contents: Vec<u8> = (0..700).map(|_| rng.gen()).collect();
    std::fs::write(tmpdir.path().join("file.bin"), &contents).unwrap();
    let (addr, _handle) = start(&tmpdir).await;

    let mut client = Client::new(addr).await;
    client.send(rrq("file.bin")).await;
    assert_eq!(client.recv().await, Packet::Data { block: 1, data: &contents[..512] });
    client.send(Packet::Ack { block: 1 }).await;
    assert_eq!(client.recv().await, Packet::Data { block: 2, data: &contents[512..] });
    client.send(Packet::Ack { block: 2 }).await;
}

#[tokio::test]
async fn test_write_while_second_client_is_refused() {
    let tmpdir = TempDir::new("root").unwrap();
    let (addr, _handle) = start(&tmpdir).await;

    let mut owner = Client::new(addr).await;
    let mut other = Client::new(addr).await;

    owner.send(wrq("upload.txt")).await;
    assert_eq!(owner.recv().await, Packet::Ack { block: 0 });

    other.send(rrq("upload.txt")).await;
    match other.recv().await {
        Packet::Error { code, message } => {
            assert_eq!(code, ErrorCode::Undefined);
            assert_eq!(message, "server busy");
        }
        p => panic!("expected a busy error, got {:?}", p),
    }

    owner.send(Packet::Data { block: 1, data: b"hello, world" }).await;
    assert_eq!(owner.recv().await, Packet::Ack { block: 1 });
    assert_eq!(std::fs::read(tmpdir.path().join("upload.txt")).unwrap(), b"hello, world");

    // With the transfer over, the second client gets its turn.
    other.send(rrq("upload.txt")).await;
    assert_eq!(other.recv().await, Packet::Data { block: 1, data: b"hello, world" });
}

#[tokio::test]
async fn test_disabled_server_refuses_requests() {
    let tmpdir = TempDir::new("root").unwrap();
    std::fs::write(tmpdir.path().join("file.txt"), b"contents").unwrap();
    let (addr, handle) = start(&tmpdir).await;
    let mut client = Client::new(addr).await;

    handle.disable();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send(rrq("file.txt")).await;
    assert!(matches!(client.recv().await, Packet::Error { code: ErrorCode::Undefined, .. }));

    handle.enable();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send(rrq("file.txt")).await;
    assert_eq!(client.recv().await, Packet::Data { block: 1, data: b"contents" });
}

#[tokio::test]
async fn test_oversized_data_is_rejected_not_clipped() {
    let tmpdir = TempDir::new("root").unwrap();
    let (addr, _handle) = start(&tmpdir).await;
    let mut client = Client::new(addr).await;

    client.send(wrq("big.bin")).await;
    assert_eq!(client.recv().await, Packet::Ack { block: 0 });

    let mut oversized = vec![0x00, 0x03, 0x00, 0x01];
    oversized.extend_from_slice(&[0x5A; 600]);
    client.send_raw(&oversized).await;
    assert!(matches!(client.recv().await, Packet::Error { code: ErrorCode::Illegal, .. }));
    assert_eq!(std::fs::read(tmpdir.path().join("big.bin")).unwrap().len(), 0);

    // The transfer was torn down, so a fresh request starts over.
    client.send(wrq("big.bin")).await;
    assert_eq!(client.recv().await, Packet::Ack { block: 0 });
}
