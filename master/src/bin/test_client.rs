use shared::{frame, unframe, OOB_PREFIX};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

// Decode a raw getserversResponse packet into (ip, port) pairs
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
            break;
        }
        if rest.len() < 7 {
            return None;
        }
        let ip = Ipv4Addr::new(rest[1], rest[2], rest[3], rest[4]);
        let port = u16::from_be_bytes([rest[5], rest[6]]);
        servers.push((ip, port));
        rest = &rest[7..];
    }

    Some(servers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Create local socket
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    // Master address, overridable as the first argument
    let master_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", shared::MASTER_PORT));

    // Buffer for receiving data
    let mut buf = [0u8; shared::MAX_PACKET];

    // Announce ourselves as a game server
    println!("Sending heartbeat to {}", master_addr);
    socket
        .send_to(&frame(b"heartbeat QuakeArena-1\n"), &master_addr)
        .await?;

    // The master should answer with a getinfo challenge
    println!("Waiting for getinfo challenge...");
    let (len, addr) = socket.recv_from(&mut buf).await?;
    println!("Received {} bytes from {}", len, addr);

    let msg = match unframe(&buf[..len]) {
        Some(msg) => msg,
        None => {
            println!("Response was not an out-of-band packet");
            return Ok(());
        }
    };

    let challenge = match msg.strip_prefix("getinfo ") {
        Some(challenge) => challenge.trim().to_string(),
        None => {
            println!("Expected getinfo but got: {:?}", msg);
            return Ok(());
        }
    };
    println!("Challenge received: {}", challenge);

    // Answer the challenge to get listed
    let info = format!(
        "infoResponse\n\\hostname\\Test Server\\mapname\\dm17\\clients\\0\\sv_maxclients\\16\\protocol\\68\\challenge\\{}",
        challenge
    );
    println!("Sending infoResponse");
    socket.send_to(&frame(info.as_bytes()), &master_addr).await?;

    // Give the master a moment to register us, then query the list
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Sending getservers query");
    socket
        .send_to(&frame(b"getservers 68 empty full"), &master_addr)
        .await?;

    let (len, _) = socket.recv_from(&mut buf).await?;
    match decode_server_list(&buf[..len]) {
        Some(servers) => {
            println!("Master lists {} server(s):", servers.len());
            for (ip, port) in servers {
                println!("  {}:{}", ip, port);
            }
        }
        None => println!("Expected getserversResponse but got {} bytes", len),
    }

    // The query registered us as a subscriber; a fresh infoResponse from
    // this socket should now come back as a push update
    let refresh = format!(
        "infoResponse\n\\clients\\4\\challenge\\{}",
        challenge
    );
    println!("Sending refreshed infoResponse");
    socket.send_to(&frame(refresh.as_bytes()), &master_addr).await?;

    println!("Waiting for push update...");
    match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => match decode_server_list(&buf[..len]) {
            Some(servers) => {
                println!("Push update with {} server(s):", servers.len());
                for (ip, port) in servers {
                    println!("  {}:{}", ip, port);
                }
            }
            None => println!("Unexpected push payload of {} bytes", len),
        },
        Ok(Err(e)) => println!("Error receiving push update: {}", e),
        Err(_) => println!("No push update within 2 seconds"),
    }

    println!("Test client finished");
    Ok(())
}
