//! xtunneld/src/compress.rs
//! Optional per-connection gzip compression for the work-connection side of
//! a spliced proxy, applied after encryption per spec's wire note
//! ("compression is applied after encryption on a per-connection
//! wrapper") -- mirrors the original's `tcp.WithCompression` wrapping
//! `tcp.WithEncryption`'s output.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use tokio::io::BufReader;

use crate::crypto::{self, BoxedStream};
use crate::error::Result;

/// Applies the optional encryption and/or compression transforms a proxy's
/// `NewProxy` request asked for to a freshly-fetched work connection,
/// returning a single boxed stream the splice loop treats like any other.
/// Transform order is fixed: encrypt first, then compress, so a peer that
/// only decrypts never sees the still-compressed bytes.
pub async fn wrap_work_conn(
    conn: tokio::net::TcpStream,
    use_encryption: bool,
    token: Option<&[u8]>,
    use_compression: bool,
) -> Result<BoxedStream> {
    let mut stream: BoxedStream = Box::new(conn);

    if use_encryption {
        if let Some(token) = token {
            stream = crypto::negotiate(stream, token).await?;
        }
    }

    if use_compression {
        let (read_half, write_half) = tokio::io::split(stream);
        let decoder = GzipDecoder::new(BufReader::new(read_half));
        let encoder = GzipEncoder::new(write_half);
        stream = Box::new(tokio::io::join(decoder, encoder)) as BoxedStream;
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn wrap_with_neither_transform_passes_bytes_through() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let (server_side, _peer) = accepted.unwrap();
        let mut client_side = connected.unwrap();

        let mut wrapped = wrap_work_conn(server_side, false, None, false).await.unwrap();
        client_side.write_all(b"plain bytes").await.unwrap();
        let mut buf = [0u8; 32];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"plain bytes");
    }
}
