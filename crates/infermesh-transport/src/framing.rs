//! Framing of the decode-result long-poll stream. Workers append packets
//! separated by a single NUL byte; each packet is `<key>:<payload>`. The
//! scanner keys off the end of the first delimiter run, so a chunk whose tail
//! lacks its closing NUL drops that tail (workers always terminate packets
//! within one chunk).

use tracing::warn;

/// One decoded packet. `key` is the raw keyword text; dispatch on it with
/// [`DResultPacket::kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DResultPacket {
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    ReqId,
    Data,
    LastData,
    Error,
    Retry,
    KeepAlive,
    Close,
    Unknown,
}

impl DResultPacket {
    pub fn kind(&self) -> PacketKind {
        match self.key.as_str() {
            "reqId" => PacketKind::ReqId,
            "data" => PacketKind::Data,
            "lastData" => PacketKind::LastData,
            "error" => PacketKind::Error,
            "retry" => PacketKind::Retry,
            "ka" => PacketKind::KeepAlive,
            "close" => PacketKind::Close,
            _ => PacketKind::Unknown,
        }
    }
}

/// Index of the last byte of the first run of `c`, e.g. `aaaabbbaaa` with
/// `a` yields 3 and `abbbba` yields 0.
fn find_first_run_end(buf: &[u8], c: u8) -> Option<usize> {
    let start = buf.iter().position(|&b| b == c)?;
    let mut end = start;
    while end + 1 < buf.len() && buf[end + 1] == c {
        end += 1;
    }
    Some(end)
}

/// Keyword between the previous NUL (if any) and `colon_pos`.
fn parse_key_word(message: &[u8], colon_pos: usize) -> &[u8] {
    let mut start = colon_pos;
    while start > 0 {
        if message[start - 1] == 0 {
            break;
        }
        start -= 1;
    }
    &message[start..colon_pos]
}

/// Splits one chunk body into packets. Bytes after the final NUL are
/// discarded; packets without a colon or with an empty payload are skipped.
pub fn parse_chunk(body: &[u8]) -> Vec<DResultPacket> {
    let mut packets = Vec::new();
    let mut rest = body;
    loop {
        if rest.is_empty() {
            return packets;
        }
        let Some(pos) = find_first_run_end(rest, 0) else {
            warn!("received a message chunk without the required delimiter");
            return packets;
        };
        let message = &rest[..pos];
        rest = &rest[pos + 1..];

        let Some(colon_pos) = find_first_run_end(message, b':') else {
            continue;
        };
        if colon_pos + 1 == message.len() {
            continue;
        }
        let key = parse_key_word(message, colon_pos);
        packets.push(DResultPacket {
            key: String::from_utf8_lossy(key).into_owned(),
            payload: message[colon_pos + 1..].to_vec(),
        });
    }
}
