//! pkt-line encode/decode for in-band protocol messages.
//!
//! Only the subset needed to speak to a stock git client over the SSH
//! channel: data lines, flush and delim packets, and `ERR` lines that the
//! client's parser surfaces as a fatal remote error.

pub const PKT_FLUSH: &[u8] = b"0000";

pub const PKT_DELIM: &[u8] = b"0001";

/// Largest payload a single pkt-line may carry (65520 minus the header).
pub const PKT_MAX_DATA: usize = 65516;

/// Prefix `data` with its 4-digit lowercase hex length, header included.
pub fn encode(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= PKT_MAX_DATA, "pkt-line payload too large");
    let mut out = Vec::with_capacity(4 + data.len());
    let len = 4 + data.len();
    out.extend_from_slice(format!("{len:04x}").as_bytes());
    out.extend_from_slice(data);
    out
}

/// Frame `message` as a protocol error line: `ERR <message>\n`.
pub fn error_line(message: &str) -> Vec<u8> {
    encode(format!("ERR {message}\n").as_bytes())
}

pub fn decode(mut buf: &[u8]) -> anyhow::Result<Vec<Pkt>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            anyhow::bail!("truncated pkt-line length");
        }
        let len = usize::from_str_radix(std::str::from_utf8(&buf[..4])?, 16)?;
        buf = &buf[4..];
        match len {
            0 => out.push(Pkt::Flush),
            1 => out.push(Pkt::Delim),
            2 | 3 => anyhow::bail!("invalid pkt-line length {len}"),
            _ => {
                let data_len = len - 4;
                if buf.len() < data_len {
                    anyhow::bail!("truncated pkt-line data");
                }
                out.push(Pkt::Data(buf[..data_len].to_vec()));
                buf = &buf[data_len..];
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pkt {
    Data(Vec<u8>),
    Flush,
    Delim,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_counts_header_in_length() {
        assert_eq!(encode(b"hello"), b"0009hello");
        assert_eq!(encode(b""), b"0004");
    }

    #[test]
    fn roundtrip_pkt_line() {
        let msg = b"hello\n";
        let enc = encode(msg);
        assert_eq!(&enc[..4], b"000a");
        let pkts = decode(&enc).unwrap();
        assert_eq!(pkts, vec![Pkt::Data(msg.to_vec())]);
    }

    #[test]
    fn busy_error_line_matches_wire_format() {
        let line = error_line("Another git push is ongoing");
        assert_eq!(line, encode(b"ERR Another git push is ongoing\n"));
        assert_eq!(&line[..4], b"0024");
    }

    #[test]
    fn length_prefix_is_lowercase_hex() {
        let payload = vec![b'x'; 250];
        let enc = encode(&payload);
        assert_eq!(&enc[..4], b"00fe");
    }

    #[test]
    fn decode_flush_and_delim() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PKT_FLUSH);
        buf.extend_from_slice(PKT_DELIM);
        let pkts = decode(&buf).unwrap();
        assert_eq!(pkts, vec![Pkt::Flush, Pkt::Delim]);
    }

    #[test]
    fn decode_rejects_truncated_and_reserved_lengths() {
        assert!(decode(b"00").is_err());
        assert!(decode(b"0009hel").is_err());
        assert!(decode(b"0002").is_err());
        assert!(decode(b"zzzz").is_err());
    }
}
