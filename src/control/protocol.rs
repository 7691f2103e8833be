use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;
const LENGTH_PREFIX_SIZE: usize = 4;

/// Commands the supervisor outside the sandbox may send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping {
        data: String,
    },
    RunProgram {
        #[serde(default)]
        path: String,
        #[serde(default)]
        pwd: String,
        #[serde(default)]
        args: Vec<String>,
    },
    RunShell {
        #[serde(default)]
        term: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ping { data: String },
    Ok,
    Error { msg: String },
}

impl Response {
    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { msg: msg.into() }
    }
}

/// Length-prefixes `payload` (4 bytes, big endian).
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(anyhow!(
            "Control message too large: {} bytes (max: {})",
            len,
            MAX_MESSAGE_SIZE
        ));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer
        .write_all(&frame)
        .context("failed to write control message")?;
    writer.flush().context("failed to flush control message")
}

/// Reads one frame. `None` means the peer closed the connection cleanly
/// between frames; EOF in the middle of a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(anyhow!("Connection closed inside message length"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("failed to read message length"),
        }
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Control message too large: {} bytes (max: {})",
            len,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .context("failed to read message payload")?;
    Ok(Some(payload))
}

pub fn decode_request(payload: &[u8]) -> Result<Request> {
    serde_json::from_slice(payload).context("malformed request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::io::Cursor;

    fn parse(value: Value) -> serde_json::Result<Request> {
        serde_json::from_value(value)
    }

    #[test]
    fn test_request_wire_format() {
        let ping = parse(json!({"type": "ping", "data": "abc"})).unwrap();
        assert_eq!(
            ping,
            Request::Ping {
                data: "abc".to_string()
            }
        );

        let run =
            parse(json!({"type": "run_program", "args": ["-v"]})).unwrap();
        assert_eq!(
            run,
            Request::RunProgram {
                path: String::new(),
                pwd: String::new(),
                args: vec!["-v".to_string()],
            }
        );

        let shell =
            parse(json!({"type": "run_shell", "term": "xterm"})).unwrap();
        assert_eq!(
            shell,
            Request::RunShell {
                term: "xterm".to_string()
            }
        );

        assert!(parse(json!({"type": "reboot"})).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        assert_eq!(
            serde_json::to_value(Response::Ok).unwrap(),
            json!({"type": "ok"})
        );
        assert_eq!(
            serde_json::to_value(Response::error("nope")).unwrap(),
            json!({"type": "error", "msg": "nope"})
        );
    }

    #[test]
    fn test_frames_back_to_back() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").unwrap();
        write_frame(&mut wire, b"").unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = Cursor::new(wire);
        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_oversize_frames_rejected() {
        let large = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        assert!(encode_frame(&large).is_err());

        let header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut reader = Cursor::new(header.to_vec());
        assert!(read_frame(&mut reader).is_err());
    }

    #[test]
    fn test_truncated_frames_are_errors() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        assert!(read_frame(&mut reader).is_err());

        let mut reader = Cursor::new(vec![0u8, 0, 0, 10, b'x']);
        assert!(read_frame(&mut reader).is_err());
    }
}
