//! Wire protocol shared between the world server and its clients.
//!
//! This crate holds everything both ends of the connection agree on: the
//! framed-message header formats, the header keystream cipher, the owned
//! I/O buffer, opcode and auth-result constants, and the serde payload
//! structs carried inside frames. The server's connection engine and the
//! bundled test client both build on these types.

pub mod buffer;
pub mod codec;
pub mod crypt;
pub mod packet;

pub use buffer::Buffer;
pub use codec::{
    decode_client_header, decode_server_header, encode_client_header, encode_server_header,
    server_header_is_large, ClientHeader, ProtocolError, CLIENT_HEADER_LEN, MAX_CLIENT_LENGTH,
    MAX_CLIENT_OPCODE,
};
pub use crypt::HeaderCrypt;
pub use packet::{auth_result, opcodes, AuthChallenge, AuthResponse, AuthSession, Packet, Ping, Pong};
