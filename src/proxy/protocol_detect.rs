/// Peeks at the first bytes of a fresh connection and reports whether they
/// look like a TLS handshake record. Nothing is consumed.
pub async fn detect_tls(stream: &tokio::net::TcpStream) -> std::io::Result<bool> {
    let mut buf = [0u8; 3];
    let n = stream.peek(&mut buf).await?;

    if n < 3 {
        return Ok(false);
    }

    Ok(buf[0] == 0x16 && buf[1] == 0x03)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };

    async fn detect(first_bytes: &'static [u8]) -> bool {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(first_bytes).await.unwrap();
            stream
        });
        let (server, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        // Let all of the bytes arrive before peeking.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        detect_tls(&server).await.unwrap()
    }

    #[tokio::test]
    async fn test_tls_client_hello_is_detected() {
        assert!(detect(&[0x16, 0x03, 0x01, 0x02, 0x00]).await);
    }

    #[tokio::test]
    async fn test_plain_http_is_not_tls() {
        assert!(!detect(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await);
        assert!(!detect(b"GET http://example.com/ HTTP/1.1\r\n\r\n").await);
    }
}
