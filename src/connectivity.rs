//! Internet reachability check over the current connection.

use std::time::Duration;

use tracing::debug;

/// Whether `url` answers with a 2xx status within `timeout`.
///
/// Redirects are not followed, so a captive portal reads as offline.
pub fn is_reachable(url: &str, timeout: Duration) -> bool {
    let agent = ureq::AgentBuilder::new()
        .timeout(timeout)
        .redirects(0)
        .build();

    match agent.get(url).call() {
        Ok(response) => {
            debug!(url, status = response.status(), "connectivity check answered");
            (200..300).contains(&response.status())
        }
        Err(e) => {
            debug!(url, "connectivity check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let reply = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://{}/generate_204", addr)
    }

    #[test]
    fn test_accepts_no_content() {
        let url = serve_once("HTTP/1.1 204 No Content");
        assert!(is_reachable(&url, Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_redirect() {
        let url = serve_once("HTTP/1.1 302 Found\r\nLocation: http://portal.example/");
        assert!(!is_reachable(&url, Duration::from_secs(5)));
    }

    #[test]
    fn test_unreachable_host() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!is_reachable(&format!("http://{}/", addr), Duration::from_secs(2)));
    }
}
