use splicer_server_echo::{EchoServer, EchoServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = EchoServer::new(EchoServerConfig { bind_addr: addr });
    tokio::spawn(server.serve(listener));
    addr
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_echo_acknowledges_each_message() {
    let addr = spawn_echo().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"PING").await.unwrap();
    assert_eq!(read_exactly(&mut client, 9).await, b"ACK: PING");

    client.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await, b"ACK: hello");
}

#[tokio::test]
async fn test_echo_closes_after_client_half_close() {
    let addr = spawn_echo().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"bye").await.unwrap();
    client.shutdown().await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"ACK: bye");
}

#[tokio::test]
async fn test_echo_serves_concurrent_clients() {
    let addr = spawn_echo().await;

    let mut handles = Vec::new();
    for i in 0..8u8 {
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let message = format!("client-{i}");
            client.write_all(message.as_bytes()).await.unwrap();
            let reply = read_exactly(&mut client, 5 + message.len()).await;
            assert_eq!(reply, format!("ACK: {message}").into_bytes());
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}
