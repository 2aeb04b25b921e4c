//! Integration tests for the master server protocol
//!
//! These tests run a real master server on a loopback socket and exercise
//! the out-of-band UDP protocol end to end.

use master::network::{MasterConfig, MasterServer, ShutdownHandle};
use shared::{frame, unframe, CHALLENGE_MAX_LEN, CHALLENGE_MIN_LEN, OOB_PREFIX};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests that a heartbeat is answered with a well-formed getinfo challenge
    #[tokio::test]
    async fn heartbeat_receives_challenge() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let socket = client_socket().await;

        socket
            .send_to(&frame(b"heartbeat QuakeArena-1\n"), master_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1400];
        let (len, from) = recv_timeout(&socket, &mut buf).await.expect("no challenge");
        assert_eq!(from, master_addr);

        let msg = unframe(&buf[..len]).expect("reply was not out-of-band");
        let challenge = msg.strip_prefix("getinfo ").expect("expected getinfo");

        assert!(challenge.len() >= CHALLENGE_MIN_LEN);
        assert!(challenge.len() <= CHALLENGE_MAX_LEN);
        for c in challenge.chars() {
            assert!((33..=126).contains(&(c as u32)));
            assert!(!matches!(c, '\\' | ';' | '"' | '%' | '/'));
        }
    }

    /// Tests that packets without the out-of-band prefix are silently dropped
    #[tokio::test]
    async fn malformed_packets_get_no_reply() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let socket = client_socket().await;

        socket.send_to(b"heartbeat", master_addr).await.unwrap();
        socket.send_to(&[0xFF, 0xFF], master_addr).await.unwrap();
        socket
            .send_to(&frame(b"rcon status"), master_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1400];
        assert!(recv_short_timeout(&socket, &mut buf).await.is_none());

        // The master must still be serving after the garbage
        socket
            .send_to(&frame(b"heartbeat QuakeArena-1\n"), master_addr)
            .await
            .unwrap();
        assert!(recv_timeout(&socket, &mut buf).await.is_some());
    }

    /// Tests that statusResponse packets are accepted but never answered
    #[tokio::test]
    async fn status_response_gets_no_reply() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let socket = client_socket().await;

        socket
            .send_to(&frame(b"statusResponse\n\\score\\10"), master_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1400];
        assert!(recv_short_timeout(&socket, &mut buf).await.is_none());
    }
}

/// DIRECTORY REGISTRATION TESTS
mod directory_tests {
    use super::*;

    /// Tests the full handshake: heartbeat, challenge, infoResponse, listing
    #[tokio::test]
    async fn info_response_registers_server() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let game_server = client_socket().await;
        let game_port = game_server.local_addr().unwrap().port();

        let mut buf = [0u8; 1400];
        game_server
            .send_to(&frame(b"heartbeat QuakeArena-1\n"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&game_server, &mut buf).await.unwrap();
        let msg = unframe(&buf[..len]).unwrap();
        let challenge = msg.strip_prefix("getinfo ").unwrap().trim();

        let info = format!(
            "infoResponse\n\\hostname\\it\\mapname\\dm17\\challenge\\{}",
            challenge
        );
        game_server
            .send_to(&frame(info.as_bytes()), master_addr)
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let client = client_socket().await;
        client
            .send_to(&frame(b"getservers 68 empty full"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();

        let servers = decode_server_list(&buf[..len]).expect("bad getserversResponse");
        assert_eq!(servers, vec![(Ipv4Addr::new(127, 0, 0, 1), game_port)]);
    }

    /// Tests that a fresh master returns an empty but well-terminated list
    #[tokio::test]
    async fn empty_registry_returns_empty_list() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let client = client_socket().await;

        client
            .send_to(&frame(b"getservers 68"), master_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1400];
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();

        let servers = decode_server_list(&buf[..len]).unwrap();
        assert!(servers.is_empty());

        // Exact framing: prefix, header, EOT terminator, trailing 0x00
        let mut expected = Vec::from(&OOB_PREFIX[..]);
        expected.extend_from_slice(b"getserversResponse\\EOT");
        expected.push(0x00);
        assert_eq!(&buf[..len], &expected[..]);
    }

    /// Tests that heartbeats alone never make a server visible
    #[tokio::test]
    async fn heartbeat_alone_does_not_register() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let game_server = client_socket().await;

        let mut buf = [0u8; 1400];
        game_server
            .send_to(&frame(b"heartbeat QuakeArena-1\n"), master_addr)
            .await
            .unwrap();
        recv_timeout(&game_server, &mut buf).await.unwrap();

        let client = client_socket().await;
        client
            .send_to(&frame(b"getservers 68"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();

        assert!(decode_server_list(&buf[..len]).unwrap().is_empty());
    }

    /// Tests that expired servers disappear while seeds stay listed
    #[tokio::test]
    async fn expiry_sweep_removes_stale_servers_but_not_seeds() {
        let config = MasterConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            prune_interval: Duration::from_millis(100),
            server_expiry: Duration::from_millis(200),
            subscriber_expiry: Duration::from_secs(600),
        };
        let mut server = MasterServer::new(config).await.unwrap();
        server.add_seed("203.0.113.5", 27960).await;
        let master_addr = server.local_addr().unwrap();
        let _shutdown = server.shutdown_handle();
        tokio::spawn(async move { server.run().await });

        let game_server = client_socket().await;
        game_server
            .send_to(&frame(b"infoResponse\n\\hostname\\it"), master_addr)
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let mut buf = [0u8; 1400];
        let client = client_socket().await;
        client
            .send_to(&frame(b"getservers 68"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();
        assert_eq!(decode_server_list(&buf[..len]).unwrap().len(), 2);

        // Outlive the expiry window plus a sweep
        sleep(Duration::from_millis(500)).await;

        let late_client = client_socket().await;
        late_client
            .send_to(&frame(b"getservers 68"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&late_client, &mut buf).await.unwrap();
        let servers = decode_server_list(&buf[..len]).unwrap();
        assert_eq!(servers, vec![(Ipv4Addr::new(203, 0, 113, 5), 27960)]);
    }
}

/// SUBSCRIBER NOTIFICATION TESTS
mod subscriber_tests {
    use super::*;

    /// Tests that a getservers query registers the client for push updates
    #[tokio::test]
    async fn query_registers_subscriber_for_push() {
        let (master_addr, _shutdown) = start_master(test_config()).await;
        let client = client_socket().await;

        let mut buf = [0u8; 1400];
        client
            .send_to(&frame(b"getservers 68"), master_addr)
            .await
            .unwrap();
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();
        assert!(decode_server_list(&buf[..len]).unwrap().is_empty());

        // A server registering afterwards must be pushed to the client
        let game_server = client_socket().await;
        let game_port = game_server.local_addr().unwrap().port();
        game_server
            .send_to(&frame(b"infoResponse\n\\hostname\\it"), master_addr)
            .await
            .unwrap();

        let (len, _) = recv_timeout(&client, &mut buf).await.expect("no push update");
        let servers = decode_server_list(&buf[..len]).unwrap();
        assert_eq!(servers, vec![(Ipv4Addr::new(127, 0, 0, 1), game_port)]);
    }

    /// Tests that an explicit subscribe returns the current snapshot
    #[tokio::test]
    async fn subscribe_returns_snapshot() {
        let (master_addr, _shutdown) = start_master(test_config()).await;

        let game_server = client_socket().await;
        let game_port = game_server.local_addr().unwrap().port();
        game_server
            .send_to(&frame(b"infoResponse\n\\hostname\\it"), master_addr)
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let client = client_socket().await;
        client.send_to(&frame(b"subscribe"), master_addr).await.unwrap();

        let mut buf = [0u8; 1400];
        let (len, _) = recv_timeout(&client, &mut buf).await.unwrap();
        let servers = decode_server_list(&buf[..len]).unwrap();
        assert_eq!(servers, vec![(Ipv4Addr::new(127, 0, 0, 1), game_port)]);
    }

    /// Tests that an info refresh reaches every subscriber
    #[tokio::test]
    async fn refresh_is_pushed_to_all_subscribers() {
        let (master_addr, _shutdown) = start_master(test_config()).await;

        let subscriber1 = client_socket().await;
        let subscriber2 = client_socket().await;
        let mut buf = [0u8; 1400];

        for socket in [&subscriber1, &subscriber2] {
            socket.send_to(&frame(b"subscribe"), master_addr).await.unwrap();
            recv_timeout(socket, &mut buf).await.unwrap();
        }

        let game_server = client_socket().await;
        let game_port = game_server.local_addr().unwrap().port();
        game_server
            .send_to(&frame(b"infoResponse\n\\clients\\4"), master_addr)
            .await
            .unwrap();

        for socket in [&subscriber1, &subscriber2] {
            let (len, _) = recv_timeout(socket, &mut buf).await.expect("no push update");
            let servers = decode_server_list(&buf[..len]).unwrap();
            assert_eq!(servers, vec![(Ipv4Addr::new(127, 0, 0, 1), game_port)]);
        }
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Tests that the shutdown handle terminates the run loop
    #[tokio::test]
    async fn shutdown_completes_run_loop() {
        let mut server = MasterServer::new(test_config()).await.unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move { server.run().await });

        shutdown.signal();

        timeout(Duration::from_secs(2), handle)
            .await
            .expect("run loop did not stop")
            .unwrap();
    }

    /// Tests that a stopped master no longer answers queries
    #[tokio::test]
    async fn shutdown_stops_serving() {
        let (master_addr, shutdown) = start_master(test_config()).await;

        shutdown.signal();
        // Repeated signals must be harmless
        shutdown.signal();
        sleep(Duration::from_millis(100)).await;

        let socket = client_socket().await;
        socket
            .send_to(&frame(b"heartbeat QuakeArena-1\n"), master_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1400];
        assert!(recv_short_timeout(&socket, &mut buf).await.is_none());
    }
}

// HELPER FUNCTIONS

fn test_config() -> MasterConfig {
    MasterConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..MasterConfig::default()
    }
}

/// Binds a master on a loopback port and spawns its run loop
async fn start_master(config: MasterConfig) -> (SocketAddr, ShutdownHandle) {
    let mut server = MasterServer::new(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move { server.run().await });
    (addr, shutdown)
}

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_timeout(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    timeout(Duration::from_secs(2), socket.recv_from(buf))
        .await
        .ok()?
        .ok()
}

/// Short window for asserting that no reply arrives
async fn recv_short_timeout(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    timeout(Duration::from_millis(300), socket.recv_from(buf))
        .await
        .ok()?
        .ok()
}

/// Decodes a raw getserversResponse packet into (ip, port) pairs
fn decode_server_list(packet: &[u8]) -> Option<Vec<(Ipv4Addr, u16)>> {
    let header_len = OOB_PREFIX.len() + b"getserversResponse".len();
    if packet.len() < header_len
        || packet[..4] != OOB_PREFIX
        || &packet[4..header_len] != b"getserversResponse"
    {
        return None;
    }

    let mut servers = Vec::new();
    let mut rest = &packet[header_len..];

    while rest.first() == Some(&b'\\') {
        if rest.len() >= 4 && &rest[1..4] == b"EOT" {
            return Some(servers);
        }
        if rest.len() < 7 {
            return None;
        }
        servers.push((
            Ipv4Addr::new(rest[1], rest[2], rest[3], rest[4]),
            u16::from_be_bytes([rest[5], rest[6]]),
        ));
        rest = &rest[7..];
    }

    None
}
