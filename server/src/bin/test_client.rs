//! Hand-driven client for poking a running world server: performs the
//! auth handshake, exchanges encrypted pings and bounces a game packet
//! off the echo session.
//!
//! Usage: `test_client [address] [account]`

use shared::codec::{
    decode_server_header, encode_client_header, server_header_is_large, CLIENT_HEADER_LEN,
};
use shared::packet::{opcodes, AuthChallenge, AuthSession, Packet, Ping, Pong};
use shared::HeaderCrypt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Reads one server packet, decrypting the header with `crypt`.
async fn read_server_packet(
    stream: &mut TcpStream,
    crypt: &mut HeaderCrypt,
) -> Result<(u16, Vec<u8>), Box<dyn std::error::Error>> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header[..4]).await?;
    crypt.decrypt(&mut header[..4]);

    let used = if server_header_is_large(header[0]) {
        stream.read_exact(&mut header[4..5]).await?;
        crypt.decrypt(&mut header[4..5]);
        5
    } else {
        4
    };

    let (opcode, payload_len) = decode_server_header(&header[..used]);
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    Ok((opcode, payload))
}

/// Frames and sends one client packet, encrypting the header with `crypt`.
async fn send_client_packet(
    stream: &mut TcpStream,
    crypt: &mut HeaderCrypt,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut header = encode_client_header(packet.opcode, packet.payload.len());
    crypt.encrypt(&mut header);

    let mut frame = Vec::with_capacity(CLIENT_HEADER_LEN + packet.payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&packet.payload);
    stream.write_all(&frame).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:8085".to_string());
    let account = args.next().unwrap_or_else(|| "TESTER".to_string());

    let mut stream = TcpStream::connect(&address).await?;
    println!("connected to {}", address);

    let mut send_crypt = HeaderCrypt::new();
    let mut recv_crypt = HeaderCrypt::new();

    // the server speaks first: the auth challenge
    let (opcode, payload) = read_server_packet(&mut stream, &mut recv_crypt).await?;
    assert_eq!(opcode, opcodes::SMSG_AUTH_CHALLENGE, "expected challenge");
    let challenge: AuthChallenge = bincode::deserialize(&payload)?;
    println!("got auth challenge, server seed {:#010x}", challenge.server_seed);

    // the handshake itself still travels in the clear
    let auth = Packet::encode(
        opcodes::CMSG_AUTH_SESSION,
        &AuthSession {
            build: 1,
            account: account.clone(),
            client_seed: rand_seed(),
            digest: [0; 20],
        },
    );
    send_client_packet(&mut stream, &mut send_crypt, &auth).await?;

    // both directions cipher their headers from here on
    send_crypt.init(account.as_bytes());
    recv_crypt.init(account.as_bytes());
    println!("authenticated as {}", account);

    for counter in 1..=3u32 {
        let ping = Packet::encode(
            opcodes::CMSG_PING,
            &Ping {
                counter,
                latency: 42,
            },
        );
        send_client_packet(&mut stream, &mut send_crypt, &ping).await?;

        let (opcode, payload) = read_server_packet(&mut stream, &mut recv_crypt).await?;
        assert_eq!(opcode, opcodes::SMSG_PONG);
        let pong: Pong = bincode::deserialize(&payload)?;
        println!("ping {} -> pong {}", counter, pong.counter);
    }

    // anything else bounces off the echo session
    let hello = Packet::with_payload(0x123, b"hello world".to_vec());
    send_client_packet(&mut stream, &mut send_crypt, &hello).await?;
    let (opcode, payload) = read_server_packet(&mut stream, &mut recv_crypt).await?;
    println!(
        "echo: opcode {:#06x}, payload {:?}",
        opcode,
        String::from_utf8_lossy(&payload)
    );

    println!("done");
    Ok(())
}

/// Low-rent client seed; nothing checks it in the demo handshake.
fn rand_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}
