use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
struct Request {
    method: String,
    number: serde_json::Number,
}

#[derive(Debug, Clone, Serialize)]
struct Response {
    method: String,
    prime: bool,
}

struct ResponseLine {
    line: String,
    disconnect: bool,
}

pub async fn serve(address: SocketAddr, shutdown: CancellationToken) -> io::Result<()> {
    info!("starting");
    let listener = TcpListener::bind(address).await?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(client=%addr, "connection received");
                    tokio::spawn(handle(stream, addr));
                }
                Err(e) => {
                    error!(error=?e, "accept failed");
                }
            }
        }
    }
}

fn get_response(request: &Request) -> Option<Response> {
    if request.method != "isPrime" {
        return None
    }

    let prime = if let Some(n) = request.number.as_u64() {
        if n == 0 || n == 1 {
            false
        } else {
            let sqrt = (n as f64).sqrt().floor() as u64;
            !(2..=sqrt).any(|x| n % x == 0)
        }
    } else {
        warn!(request=?request, "non-i64");
        false
    };

    Some(Response {
        method: "isPrime".to_string(),
        prime
    })
}

fn get_response_line(request_line: &str) -> ResponseLine {
    match serde_json::from_str::<Request>(request_line) {
        Ok(r) => {
            debug!(request=?r, "request");
            match get_response(&r) {
                None => {
                    warn!(request=?r, "bad request");
                    ResponseLine {
                        line: ":(".to_string(),
                        disconnect: true,
                    }
                }
                Some(r) => {
                    ResponseLine {
                        line: serde_json::to_string(&r).unwrap(),
                        disconnect: false
                    }
                }
            }
        }
        Err(e) => {
            error!(error=%e, "malformed request");
            ResponseLine {
                line: ":P".to_string(),
                disconnect: true
            }
        }
    }
}

async fn handle(stream: TcpStream, addr: SocketAddr) {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    let mut connected = true;
    let span = info_span!("connection", client=%addr);
    while connected {
        match buf_reader.read_line(&mut line).await {
            Ok(n) => {
                debug!(client=%addr, bytes=n, line=line, "read ok");
                if n == 0 {
                    connected = false;
                } else {
                    let response_line = span.in_scope(|| get_response_line(&line));
                    let mut line = response_line.line;
                    line.push('\n');

                    match writer.write_all(line.as_bytes()).await {
                        Ok(()) => {
                            info!(client=%addr, line=line, "write ok");
                        }
                        Err(e) => {
                            info!(client=%addr, line=line, error=?e, "write failed");
                            connected = false;
                        }
                    }
                    if response_line.disconnect {
                        warn!(client=%addr, "disconnecting");
                        connected = false;
                    }
                }
                line.clear();
            }
            Err(e) => {
                warn!(client=%addr, error=%e, "read failed");
            }
        }
    }
    info!(client=%addr, "disconnect");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, number: serde_json::Value) -> Request {
        serde_json::from_value(serde_json::json!({"method": method, "number": number})).unwrap()
    }

    #[test]
    fn primes_are_recognized() {
        let r = get_response(&req("isPrime", serde_json::json!(7))).unwrap();
        assert!(r.prime);
    }

    #[test]
    fn composites_are_not_prime() {
        let r = get_response(&req("isPrime", serde_json::json!(8))).unwrap();
        assert!(!r.prime);
    }

    #[test]
    fn zero_and_one_are_not_prime() {
        assert!(!get_response(&req("isPrime", serde_json::json!(0))).unwrap().prime);
        assert!(!get_response(&req("isPrime", serde_json::json!(1))).unwrap().prime);
    }

    #[test]
    fn non_integer_number_is_well_formed_but_never_prime() {
        let r = get_response(&req("isPrime", serde_json::json!(7.5))).unwrap();
        assert!(!r.prime);
    }

    #[test]
    fn wrong_method_is_malformed() {
        assert!(get_response(&req("isqrt", serde_json::json!(7))).is_none());
    }

    #[test]
    fn response_line_for_valid_request_keeps_connection_open() {
        let line = get_response_line(r#"{"method":"isPrime","number":7}"#);
        assert!(!line.disconnect);
        assert!(line.line.contains("\"prime\":true"));
    }

    #[test]
    fn response_line_for_malformed_json_disconnects() {
        let line = get_response_line("not json");
        assert!(line.disconnect);
        assert_eq!(line.line, ":P");
    }

    #[test]
    fn response_line_for_bad_method_disconnects() {
        let line = get_response_line(r#"{"method":"nope","number":7}"#);
        assert!(line.disconnect);
        assert_eq!(line.line, ":(");
    }
}
